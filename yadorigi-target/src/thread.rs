//! スレッド単位の ptrace 操作

use crate::registers::Regs;
use crate::Result;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// スレッドID
pub type ThreadId = i32;

/// カーネル形式のシグナルマスク（64シグナルぶん）
pub type SigMask = u64;

/// SIGTRAP を除く全シグナルをブロックするマスク
pub fn mask_all_but_trap() -> SigMask {
    !0u64 & !(1u64 << (libc::SIGTRAP - 1))
}

/// ptrace でアタッチ済みのターゲットスレッド
pub struct TargetThread {
    tid: Pid,
}

impl TargetThread {
    /// スレッドを作成する（既にアタッチされていること）
    pub fn new(tid: ThreadId) -> Self {
        Self {
            tid: Pid::from_raw(tid),
        }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.tid.as_raw()
    }

    /// レジスタを読み取る
    pub fn getregs(&self) -> Result<Regs> {
        let regs = nix::sys::ptrace::getregs(self.tid)?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn setregs(&self, regs: &Regs) -> Result<()> {
        nix::sys::ptrace::setregs(self.tid, *regs)?;
        Ok(())
    }

    /// 停止中のスレッドを再開する
    pub fn cont(&self) -> Result<()> {
        nix::sys::ptrace::cont(self.tid, None)?;
        Ok(())
    }

    /// 次の停止を待ち、同期トラップであることを検証する
    ///
    /// 期待するのは int3 由来の SIGTRAP だけです。それ以外の停止理由
    /// （別のシグナル、プロセス消滅、非同期の SIGTRAP）は、注入状態が
    /// もはや信頼できないことを意味するため、エラーとして返します。
    /// 呼び出し側はセッションを中断しなければなりません。
    pub fn wait_trap(&self) -> Result<()> {
        let status = waitpid(self.tid, Some(WaitPidFlag::__WALL))?;

        let signal = match status {
            WaitStatus::Stopped(_, signal) => signal,
            status => {
                return Err(anyhow::anyhow!(
                    "Thread {} did not stop, status: {:?}",
                    self.tid,
                    status
                ))
            }
        };

        if signal != Signal::SIGTRAP {
            return Err(anyhow::anyhow!(
                "Thread {} stopped with unexpected signal {:?}",
                self.tid,
                signal
            ));
        }

        // トラップの出所を siginfo で確かめる
        let siginfo = nix::sys::ptrace::getsiginfo(self.tid)?;
        if siginfo.si_code != libc::SI_KERNEL && siginfo.si_code != libc::TRAP_BRKPT {
            return Err(anyhow::anyhow!(
                "Thread {} trapped with unexpected si_code {}",
                self.tid,
                siginfo.si_code
            ));
        }

        Ok(())
    }

    /// 次の停止を待つ（理由は検証しない）
    pub fn wait_stop(&self) -> Result<()> {
        match waitpid(self.tid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, _) => Ok(()),
            status => Err(anyhow::anyhow!(
                "Thread {} did not stop, status: {:?}",
                self.tid,
                status
            )),
        }
    }

    /// ブロック中シグナルのマスクを取得する
    ///
    /// nix にはラッパがないため PTRACE_GETSIGMASK を直接使います。
    pub fn get_sigmask(&self) -> Result<SigMask> {
        let mut mask: SigMask = 0;
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETSIGMASK,
                self.tid.as_raw(),
                std::mem::size_of::<SigMask>(),
                &mut mask as *mut SigMask,
            )
        };
        if ret != 0 {
            return Err(anyhow::anyhow!(
                "PTRACE_GETSIGMASK failed for {}: {}",
                self.tid,
                std::io::Error::last_os_error()
            ));
        }
        Ok(mask)
    }

    /// ブロック中シグナルのマスクを設定する
    pub fn set_sigmask(&self, mask: SigMask) -> Result<()> {
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETSIGMASK,
                self.tid.as_raw(),
                std::mem::size_of::<SigMask>(),
                &mask as *const SigMask,
            )
        };
        if ret != 0 {
            return Err(anyhow::anyhow!(
                "PTRACE_SETSIGMASK failed for {}: {}",
                self.tid,
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_all_but_trap() {
        let mask = mask_all_but_trap();
        // SIGTRAP (5) のビットだけが落ちている
        assert_eq!(mask & (1u64 << (libc::SIGTRAP - 1)), 0);
        assert_ne!(mask & (1u64 << (libc::SIGINT - 1)), 0);
        assert_ne!(mask & (1u64 << 63), 0);
    }
}
