//! トランポリンと注入失敗時のロールバックの結合テスト
//!
//! 実際に子プロセスへガジェットを設置してリモートシステムコールを
//! 実行し、成功・失敗どちらの経路でもターゲットに痕跡が残らない
//! ことを確かめます。

use yadorigi_core::blob::{AgentBlob, BLOB_MAGIC, BLOB_VERSION};
use yadorigi_core::trampoline::{Trampoline, SYSCALL_GADGET};
use yadorigi_core::Session;
use yadorigi_proto::CtlChannel;
use yadorigi_target::memory::{find_executable_vma, Memory};
use yadorigi_target::TargetProcess;

/// pause で眠り続ける子プロセス
///
/// Drop で SIGKILL して回収します。
struct SleepingChild {
    pid: i32,
}

impl SleepingChild {
    fn spawn() -> Self {
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            loop {
                unsafe { libc::pause() };
            }
        }
        // 子が pause に入るまで少し待つ
        std::thread::sleep(std::time::Duration::from_millis(50));
        Self { pid }
    }
}

impl Drop for SleepingChild {
    fn drop(&mut self) {
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
            libc::waitpid(self.pid, std::ptr::null_mut(), 0);
        }
    }
}

/// ガジェットが入る実行可能領域の先頭アドレス
fn gadget_site(memory: &Memory) -> usize {
    let mappings = memory.get_mappings().expect("read child maps");
    find_executable_vma(&mappings, SYSCALL_GADGET.len())
        .expect("find executable vma")
        .start
}

/// /proc/pid/status からブロック中シグナルの行を読む
fn read_sigblk(pid: i32) -> String {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).expect("read status");
    status
        .lines()
        .find(|l| l.starts_with("SigBlk:"))
        .expect("SigBlk line")
        .to_string()
}

/// パース可能な最小のエージェントイメージ
fn minimal_blob() -> AgentBlob {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&BLOB_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&BLOB_VERSION.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&[0xcc; 64]);
    AgentBlob::from_bytes(&bytes).unwrap()
}

#[test]
fn test_trampoline_roundtrip_restores_code_and_registers() {
    let child = SleepingChild::spawn();
    let process = TargetProcess::attach(child.pid).expect("attach to child");

    let memory = Memory::new(child.pid);
    let site = gadget_site(&memory);
    let mut orig = vec![0u8; SYSCALL_GADGET.len()];
    memory.peek_area(site, &mut orig).unwrap();

    let leader = process.leader();
    let regs_before = leader.getregs().unwrap();

    let mut trampoline = Trampoline::install(&process).expect("install gadget");
    let mut now = vec![0u8; SYSCALL_GADGET.len()];
    memory.peek_area(site, &mut now).unwrap();
    assert_eq!(now, SYSCALL_GADGET);

    // リモート getpid は子自身の pid を返す
    let ret = trampoline
        .syscall(leader, libc::SYS_getpid, &[0; 6])
        .expect("remote getpid");
    assert_eq!(ret, child.pid as i64);

    // レジスタは呼び出しごとに復元される
    let regs_after = leader.getregs().unwrap();
    assert_eq!(regs_after.rip, regs_before.rip);
    assert_eq!(regs_after.rsp, regs_before.rsp);
    assert_eq!(regs_after.rax, regs_before.rax);

    // 撤去すると元のコードがビット単位で戻る
    trampoline.remove().expect("remove gadget");
    memory.peek_area(site, &mut now).unwrap();
    assert_eq!(now, orig);

    // 2回目の撤去は何もしない
    trampoline.remove().expect("idempotent removal");

    drop(process);
}

#[test]
fn test_failed_infection_leaves_no_trace() {
    let child = SleepingChild::spawn();

    let memory = Memory::new(child.pid);
    let site = gadget_site(&memory);
    let orig = memory.read(site, 16).expect("read original code");
    let sigblk_before = read_sigblk(child.pid);

    // コントローラ側の抽象名を先に占有して、ガジェット設置と
    // イメージマップの後に来る bind を失敗させる
    let ctl_name = format!("yadorigi-ctl-{}", child.pid).into_bytes();
    let _occupied = CtlChannel::bind_abstract(&ctl_name).unwrap();

    let blob = minimal_blob();
    assert!(Session::infect(child.pid, &blob).is_err());

    // 失敗してもコードバイトとシグナルマスクは注入前のまま
    assert_eq!(memory.read(site, 16).expect("reread code"), orig);
    assert_eq!(read_sigblk(child.pid), sigblk_before);
}
