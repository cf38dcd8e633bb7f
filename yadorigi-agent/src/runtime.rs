//! エージェントのデーモンランタイム
//!
//! トラップ駆動の初期化（Init / InitThread）を終えたスレッドは
//! Daemonize で常駐ループに入ります。リーダーは制御ソケットから
//! コマンドを受けて自分で実行するか、スレッド限定のコマンドなら
//! 対象ワーカーの futex 語に置いて起こし、完了を待って結果を
//! 返送します。ワーカーはソケットに一切触れません。

use std::os::fd::IntoRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use yadorigi_proto::args::{InitArgs, LogArgs};
use yadorigi_proto::{args, Command, CtlChannel, CtlMsg};

use crate::handlers;
use crate::table::ThreadTable;

/// ログ未設定を示すディスクリプタ値
const NO_LOG_FD: i32 = -1;

/// エージェントイメージ内の共有引数領域
///
/// コントローラが同期ビュー越しに書き込み、エージェントが
/// ここから読む1枚のバッファです。アクセスの直列化はコマンド
/// プロトコル自体が保証します。
#[derive(Debug)]
pub struct ArgsArea {
    ptr: *mut u8,
    len: usize,
}

// 直列化はプロトコル側の責務
unsafe impl Send for ArgsArea {}
unsafe impl Sync for ArgsArea {}

impl ArgsArea {
    /// 生ポインタから構築する
    ///
    /// # Safety
    /// `ptr` から `len` バイトがこの領域の生存期間中ずっと有効で、
    /// コマンドプロトコル以外から並行アクセスされないこと。
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

fn gettid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// デーモンフェーズのエージェント本体
#[derive(Debug)]
pub struct AgentRuntime {
    table: ThreadTable,
    /// 制御ソケット。Fini で閉じるため取り外し可能にしてある
    chan: Mutex<Option<CtlChannel>>,
    area: ArgsArea,
    leader_id: i32,
    log_fd: AtomicI32,
    /// 終了時に int3 で自己トラップするか（テストでは無効化）
    trap_on_exit: bool,
}

impl AgentRuntime {
    /// Init コマンドの本体
    ///
    /// 引数領域の InitArgs に従ってスレッド表を確保し、リーダーを
    /// 登録して制御ソケットを開きます。これ以降、動的確保は
    /// 行いません。失敗は -errno で報告します。
    pub fn init(area: ArgsArea, trap_on_exit: bool) -> Result<Self, i32> {
        let init: InitArgs = args::get_args(area.bytes()).map_err(|_| -libc::E2BIG)?;
        if init.nr_threads <= 0 {
            return Err(-libc::EINVAL);
        }

        let table = ThreadTable::with_capacity(init.nr_threads as usize);
        table.insert(init.tid, gettid())?;

        let chan = CtlChannel::bind_abstract(init.agent_addr.name()).map_err(|_| -libc::EIO)?;
        chan.connect_abstract(init.ctl_addr.name())
            .map_err(|_| -libc::EIO)?;

        Ok(Self {
            table,
            chan: Mutex::new(Some(chan)),
            area,
            leader_id: init.tid,
            log_fd: AtomicI32::new(NO_LOG_FD),
            trap_on_exit,
        })
    }

    /// InitThread コマンドの本体
    ///
    /// 登録対象のスレッド自身の文脈で呼ばれます。
    pub fn init_thread(&self) -> i32 {
        let init: InitArgs = match args::get_args(self.area.bytes()) {
            Ok(a) => a,
            Err(_) => return -libc::E2BIG,
        };
        match self.table.insert(init.tid, gettid()) {
            Ok(_) => 0,
            Err(e) => e,
        }
    }

    pub fn nr_threads(&self) -> usize {
        self.table.len()
    }

    /// Daemonize コマンドの本体
    ///
    /// リーダーならコマンド受信ループへ、それ以外なら futex 待ちの
    /// ワーカーループへ移行します。どちらも Fini / FiniThread を
    /// 受けるまで戻りません。
    pub fn daemonize(&self, real: i32) -> i32 {
        if self.table.find(real).is_none() {
            return -libc::ENOENT;
        }
        if real == self.leader_id {
            self.leader_loop(real)
        } else {
            self.worker_loop(real)
        }
    }

    /// ログ出力（CfgLog 前は何もしない）
    fn log(&self, msg: &str) {
        let fd = self.log_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return;
        }
        let line = format!("yadorigi-agent: {}\n", msg);
        unsafe {
            libc::write(fd, line.as_ptr() as *const libc::c_void, line.len());
        }
    }

    /// CfgLog コマンドの本体
    fn cfg_log(&self, chan: &CtlChannel) -> i32 {
        let fd = match chan.recv_fd() {
            Ok(fd) => fd,
            Err(_) => return -libc::EBADF,
        };
        let cfg: LogArgs = match args::get_args(self.area.bytes()) {
            Ok(a) => a,
            Err(_) => return -libc::E2BIG,
        };

        let old = self.log_fd.swap(fd.into_raw_fd(), Ordering::SeqCst);
        if old >= 0 {
            unsafe { libc::close(old) };
        }
        self.log(&format!("log fd configured, level {}", cfg.level));
        0
    }

    /// スレッド限定コマンドを対象ワーカーへ回送する
    ///
    /// ワーカーのコマンド語に値を置いて起こし、応答語がコマンドの
    /// エコーになるまで待ってから結果を回収します。
    fn execute_thread(&self, real: i32, cmd: Command) -> i32 {
        let slot = match self.table.find(real) {
            Some(s) => s,
            None => return -libc::ENOENT,
        };

        slot.ack.set(Command::Idle as u32);
        slot.cmd.set_and_wake(cmd as u32);
        slot.ack.wait_until(cmd as u32);
        slot.ret.load(Ordering::SeqCst)
    }

    /// プロセス単位のコマンドを実行する
    fn execute_local(&self, chan: &CtlChannel, cmd: Command) -> i32 {
        let area = self.area.bytes();
        match cmd {
            Command::CfgLog => self.cfg_log(chan),
            Command::MprotectVmas => handlers::mprotect_vmas(area),
            Command::DumpPages => handlers::dump_pages(chan, area),
            Command::DumpSigacts => handlers::dump_sigacts(area),
            Command::DumpItimers => handlers::dump_itimers(area),
            Command::DumpMisc => handlers::dump_misc(area),
            Command::DumpCreds => handlers::dump_creds(area),
            Command::DrainFds => handlers::drain_fds(chan, area),
            Command::GetProcFd => handlers::get_proc_fd(chan),
            Command::DumpTty => handlers::dump_tty(area),
            // トラップフェーズ専用のコマンドはここへは来ない
            _ => -libc::EINVAL,
        }
    }

    /// リーダーのコマンド受信ループ
    ///
    /// 入ってすぐ Daemonize の応答を自発的に送り、以後は要求駆動で
    /// 動きます。Fini は応答せずにループを抜け、制御ソケットと
    /// ログディスクリプタを閉じてから制御を返します。
    fn leader_loop(&self, real: i32) -> i32 {
        let mut guard = match self.chan.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let chan = match guard.as_ref() {
            Some(c) => c,
            None => return -libc::EBADF,
        };

        let ready = CtlMsg::reply(real as u32, Command::Daemonize as u32, 0);
        if chan.send_msg(&ready).is_err() {
            return -libc::EIO;
        }

        loop {
            let msg = match chan.recv_msg() {
                Ok(m) => m,
                // チャネルが壊れたら黙って退く以外にできることはない
                Err(_) => return -libc::EIO,
            };

            let cmd = Command::from_u32(msg.cmd);
            let ret = match cmd {
                None => -libc::EINVAL,
                Some(Command::Fini) => {
                    self.log("leader finishing");
                    break;
                }
                Some(c) if c.is_thread_scoped() => self.execute_thread(msg.id as i32, c),
                Some(c) => self.execute_local(chan, c),
            };

            if chan
                .send_msg(&CtlMsg::reply(msg.id, msg.cmd, ret))
                .is_err()
            {
                return -libc::EIO;
            }
        }

        // ターゲットにディスクリプタを残さない
        guard.take();
        let fd = self.log_fd.swap(NO_LOG_FD, Ordering::SeqCst);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }

        if self.trap_on_exit {
            self_trap();
        }
        0
    }

    /// ワーカーの futex 待ちループ
    ///
    /// 自分のスロットのコマンド語がデーモンフェーズの値になるのを
    /// 待って実行し、結果を書き戻してエコーで応答します。
    fn worker_loop(&self, real: i32) -> i32 {
        let slot = match self.table.find(real) {
            Some(s) => s,
            None => return -libc::ENOENT,
        };
        // リーダー（およびコントローラの同期ビュー）への到着通知
        slot.ack.set_and_wake(Command::Daemonized as u32);

        loop {
            let raw = slot.cmd.wait_while_lt(Command::Daemonized as u32);
            let cmd = Command::from_u32(raw);

            let (ret, finish) = match cmd {
                Some(Command::DumpThread) => {
                    (handlers::dump_thread(&self.table, self.area.bytes()), false)
                }
                Some(Command::FiniThread) => (0, true),
                // ワーカーが受けてよいのは上の2つだけ
                _ => (-libc::EINVAL, false),
            };

            slot.ret.store(ret, Ordering::SeqCst);
            slot.cmd.set(Command::Idle as u32);
            slot.ack.set_and_wake(raw);

            if finish {
                return 0;
            }
        }
    }
}

/// デバッガ（コントローラ）へ制御を返すための自己トラップ
#[cfg(target_arch = "x86_64")]
fn self_trap() {
    unsafe {
        std::arch::asm!("int3");
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn self_trap() {
    unsafe {
        libc::raise(libc::SIGTRAP);
    }
}
