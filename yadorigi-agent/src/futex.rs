//! futex ベースのランデブープリミティブ
//!
//! コントローラとターゲットの両方から見える共有メモリ上の1語に対する
//! アトミックな設定・起床と、ブロッキング待機を提供します。
//! これは汎用のミューテックスではありません。各語には常に待機者1人・
//! 通知者1人しかいない前提の、2状態のランデブーです。
//!
//! 待機にタイムアウトはありません。応答しないターゲットは待機側を
//! 無期限に停止させます（既知のリスクとして仕様どおり温存）。

use std::sync::atomic::{AtomicU32, Ordering};

/// 共有メモリに置ける futex 語
#[derive(Debug)]
#[repr(C)]
pub struct Futex {
    word: AtomicU32,
}

impl Default for Futex {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Futex {
    pub const fn new(v: u32) -> Self {
        Self {
            word: AtomicU32::new(v),
        }
    }

    pub fn get(&self) -> u32 {
        self.word.load(Ordering::SeqCst)
    }

    pub fn set(&self, v: u32) {
        self.word.store(v, Ordering::SeqCst);
    }

    /// 値を設定し、待機者を起こす
    pub fn set_and_wake(&self, v: u32) {
        self.set(v);
        self.wake();
    }

    /// 待機者を起こす
    pub fn wake(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.word as *const AtomicU32,
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn futex_wait(&self, expected: u32) -> i32 {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.word as *const AtomicU32,
                libc::FUTEX_WAIT,
                expected,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret == -1 {
            -unsafe { *libc::__errno_location() }
        } else {
            ret as i32
        }
    }

    /// 値が `v` になるまでブロックして待つ
    pub fn wait_until(&self, v: u32) {
        loop {
            let cur = self.get();
            if cur == v {
                break;
            }
            let ret = self.futex_wait(cur);
            if ret < 0 && ret != -libc::EINTR && ret != -libc::EAGAIN {
                // 共有語が無効になった場合は待ちようがない
                panic!("futex wait failed: {}", ret);
            }
        }
    }

    /// 値が `v` 以上になるまでブロックして待つ
    pub fn wait_while_lt(&self, v: u32) -> u32 {
        loop {
            let cur = self.get();
            if cur >= v {
                return cur;
            }
            let ret = self.futex_wait(cur);
            if ret < 0 && ret != -libc::EINTR && ret != -libc::EAGAIN {
                panic!("futex wait failed: {}", ret);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_get() {
        let f = Futex::new(0);
        assert_eq!(f.get(), 0);
        f.set(7);
        assert_eq!(f.get(), 7);
    }

    #[test]
    fn test_wait_until_cross_thread() {
        let f = Arc::new(Futex::new(0));
        let f2 = Arc::clone(&f);

        let waiter = thread::spawn(move || {
            f2.wait_until(3);
            f2.get()
        });

        // 待機者が眠りにつく余地を与えてから起こす
        thread::sleep(std::time::Duration::from_millis(20));
        f.set_and_wake(3);

        assert_eq!(waiter.join().unwrap(), 3);
    }

    #[test]
    fn test_wait_while_lt_returns_value() {
        let f = Arc::new(Futex::new(0));
        let f2 = Arc::clone(&f);

        let waiter = thread::spawn(move || f2.wait_while_lt(5));

        thread::sleep(std::time::Duration::from_millis(20));
        f.set_and_wake(9);

        assert_eq!(waiter.join().unwrap(), 9);
    }
}
