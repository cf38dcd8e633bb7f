//! 注入セッション
//!
//! アタッチからエージェントの常駐化、キャプチャコマンドの実行、
//! そして完全な撤収までの寿命を1つの型で管理します。途中のどの
//! 失敗もセッション致命として扱い、部分的な再試行はしません。
//!
//! 撤収後のターゲットはレジスタ・シグナルマスク・コードバイト・
//! メモリマッピングのすべてが注入前の状態に戻ります。

use std::os::fd::{BorrowedFd, OwnedFd};

use yadorigi_proto::args::{
    self, dump_pages_args_size, mprotect_args_size, CredsArgs, DrainFdsArgs, DumpPagesHdr,
    InitArgs, ItimersArgs, LogArgs, MiscArgs, MprotectHdr, PageVec, SigactsArgs, SockAddrBuf,
    ThreadArgs, TtyArgs, VmaEntry, ARGS_SIZE_MIN, PAGE_SIZE,
};
use yadorigi_proto::{Command, CtlChannel, ProtoError};
use yadorigi_target::process::TargetProcess;
use yadorigi_target::registers::Regs;
use yadorigi_target::thread::{mask_all_but_trap, SigMask};

use crate::blob::AgentBlob;
use crate::channel::DaemonLink;
use crate::loader::AgentImage;
use crate::trampoline::Trampoline;
use crate::Result;

/// 撤収時に復元するスレッドごとの状態
struct SavedThread {
    tid: i32,
    regs: Regs,
    sigmask: SigMask,
}

/// 制御ソケットの抽象名（コントローラ側）
fn ctl_sock_name(pid: i32) -> Vec<u8> {
    format!("yadorigi-ctl-{}", pid).into_bytes()
}

/// 制御ソケットの抽象名（エージェント側）
fn agent_sock_name(pid: i32) -> Vec<u8> {
    format!("yadorigi-agt-{}", pid).into_bytes()
}

/// 既定の引数領域サイズ
///
/// 固定上限いっぱいのディスクリプタ一括転送と、そこそこの件数の
/// 範囲指定コマンドが収まる大きさを取ります。
fn default_args_len() -> usize {
    ARGS_SIZE_MIN
        .max(std::mem::size_of::<DrainFdsArgs>())
        .max(mprotect_args_size(256))
        .max(dump_pages_args_size(256))
}

/// 稼働中の注入セッション
pub struct Session {
    process: TargetProcess,
    trampoline: Trampoline,
    image: AgentImage,
    link: DaemonLink,
    saved: Vec<SavedThread>,
}

impl Session {
    /// ターゲットへアタッチしてエージェントを常駐させる
    ///
    /// 戻ってきた時点で全スレッドが登録済みで、リーダーはコマンド
    /// 待ちのデーモンループにいます。
    pub fn infect(pid: i32, blob: &AgentBlob) -> Result<Self> {
        let process = TargetProcess::attach(pid)?;
        Self::infect_attached(process, blob)
    }

    /// アタッチ済みのプロセスへエージェントを常駐させる
    ///
    /// 途中で失敗した場合は、そこまでに入れたもの（ガジェット、
    /// リモートマッピング、シグナルマスク、走り出したスレッド）を
    /// すべて外してからエラーを返します。
    pub fn infect_attached(process: TargetProcess, blob: &AgentBlob) -> Result<Self> {
        let pid = process.pid();
        let leader_tid = process.leader().tid();

        // 撤収時の復元用に全スレッドの状態を退避する
        let mut saved = Vec::with_capacity(process.nr_threads());
        for thread in process.threads() {
            saved.push(SavedThread {
                tid: thread.tid(),
                regs: thread.getregs()?,
                sigmask: thread.get_sigmask()?,
            });
        }

        // エージェントが走っている間は SIGTRAP 以外のシグナル配送を止める
        for thread in process.threads() {
            if let Err(e) = thread.set_sigmask(mask_all_but_trap()) {
                restore_thread_state(&process, &saved);
                return Err(e);
            }
        }

        let mut trampoline = match Trampoline::install(&process) {
            Ok(t) => t,
            Err(e) => {
                restore_thread_state(&process, &saved);
                return Err(e);
            }
        };

        let mut image_slot: Option<AgentImage> = None;
        let mut link_slot: Option<DaemonLink> = None;
        let mut leader_running = false;
        let mut daemonized_workers: Vec<i32> = Vec::new();

        let outcome = (|| -> Result<()> {
            let image = image_slot.insert(AgentImage::load(
                &process,
                &trampoline,
                blob,
                default_args_len(),
                process.nr_threads(),
            )?);

            let ctl_name = ctl_sock_name(pid);
            let agent_name = agent_sock_name(pid);
            let ctl = CtlChannel::bind_abstract(&ctl_name)?;

            // リーダーを初期化してデーモン化する
            let leader = process.leader();
            let init = InitArgs {
                ctl_addr: SockAddrBuf::abstract_name(&ctl_name)?,
                agent_addr: SockAddrBuf::abstract_name(&agent_name)?,
                nr_threads: process.nr_threads() as i32,
                tid: leader_tid,
            };
            args::put_args(image.args_bytes(), &init)?;

            let ret = trampoline.run_entry(
                leader,
                image.entry(),
                image.thread_stack(0),
                Command::Init as u32,
                image.args_remote(),
            )?;
            if ret < 0 {
                return Err(anyhow::anyhow!("Agent init failed in target: {}", ret));
            }
            ctl.connect_abstract(&agent_name)?;

            // Daemonize は対象スレッドのIDを引数レジスタで直接渡す。
            // 引数領域を経由しないので、走行中のスレッドと競合しない
            trampoline.launch_entry(
                leader,
                image.entry(),
                image.thread_stack(0),
                Command::Daemonize as u32,
                yadorigi_proto::RemoteAddr(leader_tid as u64),
            )?;
            leader_running = true;
            let link = link_slot.insert(DaemonLink::new(ctl));
            link.wait_daemonized(leader_tid as u32)?;

            // 残りのスレッドを登録してワーカーループへ送り込む
            for (idx, thread) in process.threads().iter().enumerate().skip(1) {
                let mut init = init;
                init.tid = thread.tid();
                args::put_args(image.args_bytes(), &init)?;

                let ret = trampoline.run_entry(
                    thread,
                    image.entry(),
                    image.thread_stack(idx),
                    Command::InitThread as u32,
                    image.args_remote(),
                )?;
                if ret < 0 {
                    return Err(anyhow::anyhow!(
                        "Agent thread init failed for {}: {}",
                        thread.tid(),
                        ret
                    ));
                }

                trampoline.launch_entry(
                    thread,
                    image.entry(),
                    image.thread_stack(idx),
                    Command::Daemonize as u32,
                    yadorigi_proto::RemoteAddr(thread.tid() as u64),
                )?;
                daemonized_workers.push(thread.tid());
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                let (Some(image), Some(link)) = (image_slot.take(), link_slot.take()) else {
                    return Err(anyhow::anyhow!("Infection bookkeeping lost its state"));
                };
                tracing::info!(pid, nr_threads = process.nr_threads(), "agent resident");
                Ok(Self {
                    process,
                    trampoline,
                    image,
                    link,
                    saved,
                })
            }
            Err(e) => {
                // 走り出したスレッドを止め、入れたものを外してから
                // 失敗を返す。ここでの後始末の失敗は記録だけして続行
                if let Some(link) = &link_slot {
                    for tid in &daemonized_workers {
                        let _ = link.command(*tid as u32, Command::FiniThread);
                        if let Some(thread) = process.find_thread(*tid) {
                            if let Err(err) = thread.wait_trap() {
                                tracing::warn!(tid, error = %err, "worker did not trap during rollback");
                            }
                        }
                    }
                }
                if leader_running {
                    if let Some(link) = &link_slot {
                        let _ = link.send_cmd(leader_tid as u32, Command::Fini);
                    }
                    if let Err(err) = process.leader().wait_trap() {
                        tracing::warn!(error = %err, "leader did not trap during rollback");
                    }
                }
                if let Some(image) = image_slot.as_mut() {
                    if let Err(err) = image.unload(&process, &trampoline) {
                        tracing::warn!(error = %err, "image unload failed during rollback");
                    }
                }
                if let Err(err) = trampoline.remove() {
                    tracing::warn!(error = %err, "gadget removal failed during rollback");
                }
                restore_thread_state(&process, &saved);
                Err(e)
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    /// 登録済みスレッドのID一覧（先頭がリーダー）
    pub fn thread_ids(&self) -> Vec<i32> {
        self.saved.iter().map(|s| s.tid).collect()
    }

    fn leader_id(&self) -> u32 {
        self.saved[0].tid as u32
    }

    fn put<T: Copy>(&self, value: &T) -> Result<()> {
        args::put_args(self.image.args_bytes(), value)?;
        Ok(())
    }

    fn get<T: Copy + Default>(&self) -> Result<T> {
        Ok(args::get_args(self.image.args_bytes())?)
    }

    /// エージェントのログ出力先とレベルを設定する
    pub fn cfg_log(&self, fd: BorrowedFd<'_>, level: i32) -> Result<()> {
        self.put(&LogArgs { level })?;
        self.link.send_cmd(self.leader_id(), Command::CfgLog)?;
        self.link.channel().send_fd(fd)?;
        self.link.wait_ack(self.leader_id(), Command::CfgLog)?;
        Ok(())
    }

    /// プロセス単位の雑多な値を取得する
    pub fn dump_misc(&self) -> Result<MiscArgs> {
        self.link.command(self.leader_id(), Command::DumpMisc)?;
        self.get()
    }

    /// 資格情報ビットと補助グループを取得する
    pub fn dump_creds(&self) -> Result<CredsArgs> {
        self.link.command(self.leader_id(), Command::DumpCreds)?;
        self.get()
    }

    /// インターバルタイマを取得する
    pub fn dump_itimers(&self) -> Result<ItimersArgs> {
        self.link.command(self.leader_id(), Command::DumpItimers)?;
        self.get()
    }

    /// シグナルハンドラ設定を取得する
    pub fn dump_sigacts(&self) -> Result<SigactsArgs> {
        self.link.command(self.leader_id(), Command::DumpSigacts)?;
        self.get()
    }

    /// 指定スレッドの情報を取得する
    pub fn dump_thread(&self, tid: i32) -> Result<ThreadArgs> {
        let mut io = ThreadArgs::default();
        io.real = tid;
        self.put(&io)?;
        self.link.command(tid as u32, Command::DumpThread)?;
        self.get()
    }

    /// 端末のセッション・フォアグラウンド状態を取得する
    pub fn dump_tty(&self, fd: i32) -> Result<TtyArgs> {
        let mut io = TtyArgs::default();
        io.fd = fd;
        self.put(&io)?;
        self.link.command(self.leader_id(), Command::DumpTty)?;
        self.get()
    }

    /// ターゲット内のメモリ保護属性を一括変更する
    pub fn mprotect_vmas(&self, vmas: &[VmaEntry]) -> Result<()> {
        self.put(&MprotectHdr::new(vmas.len() as u32))?;
        args::put_tail::<MprotectHdr, VmaEntry>(self.image.args_bytes(), vmas)?;
        self.link.command(self.leader_id(), Command::MprotectVmas)?;
        Ok(())
    }

    /// 指定範囲のページをパイプへ一括転送させる
    ///
    /// `pipe` は書き込み側で、読み出しは呼び出し側の責任です。
    /// 範囲はすべてページ境界に揃っていなければなりません。
    pub fn dump_pages(&self, iovs: &[PageVec], pipe: BorrowedFd<'_>) -> Result<()> {
        let mut nr_pages = 0u32;
        for iov in iovs {
            if iov.start % PAGE_SIZE as u64 != 0 || iov.len % PAGE_SIZE as u64 != 0 {
                return Err(anyhow::anyhow!(
                    "Page range {:#x}+{:#x} not page aligned",
                    iov.start,
                    iov.len
                ));
            }
            nr_pages += (iov.len / PAGE_SIZE as u64) as u32;
        }

        self.put(&DumpPagesHdr::new(0, iovs.len() as u32, nr_pages))?;
        args::put_tail::<DumpPagesHdr, PageVec>(self.image.args_bytes(), iovs)?;

        self.link.send_cmd(self.leader_id(), Command::DumpPages)?;
        self.link.channel().send_fd(pipe)?;
        self.link.wait_ack(self.leader_id(), Command::DumpPages)?;
        Ok(())
    }

    /// ターゲットのディスクリプタを一括で取り寄せる
    pub fn drain_fds(&self, fds: &[i32]) -> Result<Vec<OwnedFd>> {
        let mut io = DrainFdsArgs::default();
        if fds.len() > io.fds.len() {
            return Err(anyhow::anyhow!(
                "Descriptor batch of {} exceeds fixed capacity {}",
                fds.len(),
                io.fds.len()
            ));
        }
        io.nr_fds = fds.len() as i32;
        io.fds[..fds.len()].copy_from_slice(fds);
        self.put(&io)?;

        self.link.send_cmd(self.leader_id(), Command::DrainFds)?;
        let (received, _) = self.link.channel().recv_fds(fds.len())?;
        self.link.wait_ack(self.leader_id(), Command::DrainFds)?;
        Ok(received)
    }

    /// 名前空間に依存しない /proc ハンドルを取得する
    pub fn get_proc_fd(&self) -> Result<OwnedFd> {
        self.link.send_cmd(self.leader_id(), Command::GetProcFd)?;
        let fd = self.link.channel().recv_fd()?;
        self.link.wait_ack(self.leader_id(), Command::GetProcFd)?;
        Ok(fd)
    }

    /// エージェントを撤収してターゲットを注入前の状態に戻す
    ///
    /// ワーカー、リーダーの順に終了させ、イメージの両側マッピングを
    /// 畳み、ガジェットとレジスタとシグナルマスクを復元してから
    /// デタッチします。各工程はベストエフォートで、途中の失敗でも
    /// 残りの復元をすべて試み、最初の失敗だけを返します。
    pub fn cure(mut self) -> Result<()> {
        let mut first_err = None;

        // ワーカーから畳む。登録に失敗していたスレッドは ENOENT に
        // なるが、その場合は元のコードから離れていないので先へ進む
        for saved in self.saved.iter().skip(1) {
            let thread = match self.process.find_thread(saved.tid) {
                Some(t) => t,
                None => {
                    note(
                        &mut first_err,
                        "worker lookup",
                        Err(anyhow::anyhow!("Thread {} disappeared", saved.tid)),
                    );
                    continue;
                }
            };

            match self.link.command(saved.tid as u32, Command::FiniThread) {
                Ok(_) => note(&mut first_err, "worker trap", thread.wait_trap()),
                Err(ProtoError::RemoteFailure { code, .. }) if code == -libc::ENOENT => {
                    tracing::warn!(tid = saved.tid, "thread was never registered");
                }
                Err(e) => note(&mut first_err, "worker fini", Err(e.into())),
            }
            note(&mut first_err, "worker registers", thread.setregs(&saved.regs));
        }

        // リーダーの Fini には応答が来ない。自己トラップで戻ってくる
        note(
            &mut first_err,
            "leader fini",
            self.link
                .send_cmd(self.leader_id(), Command::Fini)
                .map_err(Into::into),
        );
        let leader = self.process.leader();
        note(&mut first_err, "leader trap", leader.wait_trap());
        note(
            &mut first_err,
            "leader registers",
            leader.setregs(&self.saved[0].regs),
        );

        note(
            &mut first_err,
            "image unload",
            self.image.unload(&self.process, &self.trampoline),
        );
        note(&mut first_err, "gadget removal", self.trampoline.remove());

        for saved in &self.saved {
            if let Some(thread) = self.process.find_thread(saved.tid) {
                note(
                    &mut first_err,
                    "signal mask",
                    thread.set_sigmask(saved.sigmask),
                );
            }
        }

        note(&mut first_err, "detach", self.process.detach());

        match first_err {
            None => {
                tracing::info!("target cured and detached");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }
}

/// レジスタとシグナルマスクを退避時点の値へ戻す（ベストエフォート）
fn restore_thread_state(process: &TargetProcess, saved: &[SavedThread]) {
    for s in saved {
        if let Some(thread) = process.find_thread(s.tid) {
            if let Err(err) = thread.setregs(&s.regs) {
                tracing::warn!(tid = s.tid, error = %err, "register restore failed");
            }
            if let Err(err) = thread.set_sigmask(s.sigmask) {
                tracing::warn!(tid = s.tid, error = %err, "signal mask restore failed");
            }
        }
    }
}

/// 撤収工程の結果を記録する
///
/// 最初の失敗を保持し、以降の失敗はログにだけ残します。
fn note(first: &mut Option<anyhow::Error>, step: &'static str, result: Result<()>) {
    if let Err(e) = result {
        tracing::error!(step, error = %e, "cleanup step failed");
        if first.is_none() {
            *first = Some(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sock_names_are_per_pid() {
        assert_ne!(ctl_sock_name(1), ctl_sock_name(2));
        assert_ne!(ctl_sock_name(7), agent_sock_name(7));
    }

    #[test]
    fn test_default_args_len_holds_fixed_buffers() {
        let len = default_args_len();
        assert!(len >= std::mem::size_of::<DrainFdsArgs>());
        assert!(len >= std::mem::size_of::<SigactsArgs>());
        assert!(len >= ARGS_SIZE_MIN);
    }

    #[test]
    fn test_first_cleanup_error_is_kept() {
        let mut first = None;
        note(&mut first, "a", Ok(()));
        assert!(first.is_none());

        note(&mut first, "b", Err(anyhow::anyhow!("first failure")));
        note(&mut first, "c", Err(anyhow::anyhow!("second failure")));
        assert_eq!(first.unwrap().to_string(), "first failure");
    }
}
