//! 停止中の子プロセスに対する書き換えと復元の結合テスト

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

#[test]
fn test_swap_area_roundtrip_leaves_no_trace() {
    let child = SleepingChild::spawn();
    let process = TargetProcess::attach(child.pid).expect("attach to child");

    let memory = Memory::new(child.pid);
    let mappings = memory.get_mappings().expect("read child maps");
    let vma = find_executable_vma(&mappings, 8).expect("find executable vma");

    let mut orig = vec![0u8; 8];
    memory.peek_area(vma.start, &mut orig).expect("peek original bytes");

    // 読み取り専用のコードページでも書き換えられる
    let patch = [0x0f, 0x05, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc];
    let swapped = memory.swap_area(vma.start, &patch).expect("swap in patch");
    assert_eq!(swapped, orig, "swap must return the original bytes");

    let mut now = vec![0u8; 8];
    memory.peek_area(vma.start, &mut now).unwrap();
    assert_eq!(now, patch);

    // 退避したバイト列を書き戻すとビット単位で元に戻る
    memory.poke_area(vma.start, &swapped).expect("restore original bytes");
    memory.peek_area(vma.start, &mut now).unwrap();
    assert_eq!(now, orig);

    drop(process);
}
