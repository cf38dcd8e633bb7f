//! リモートシステムコールのトランポリン
//!
//! ターゲットの既存の実行可能領域の先頭に syscall; int3 のガジェットを
//! 一時的に埋め込み、レジスタを組んで再開することで、停止中の
//! ターゲットに任意のシステムコールを1回ずつ実行させます。
//! 退避した元のバイト列とレジスタは毎回復元するので、トランポリンを
//! 外した後のターゲットは注入前と区別がつきません。

use yadorigi_proto::RemoteAddr;
use yadorigi_target::memory::{find_executable_vma, Memory};
use yadorigi_target::registers::{
    instruction_pointer, setup_entry_regs, setup_syscall_regs, syscall_result, SYSCALL_NARGS,
};
use yadorigi_target::thread::TargetThread;
use yadorigi_target::process::TargetProcess;

use crate::error::InfectError;
use crate::Result;

/// syscall; int3 ガジェット（ワード境界までパディング）
pub const SYSCALL_GADGET: [u8; 8] = [0x0f, 0x05, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc];

/// 設置済みのトランポリン
///
/// Drop では何もしません。退避バイトの復元は [`Trampoline::remove`]
/// で明示的に行い、失敗をエラーとして報告します。
pub struct Trampoline {
    memory: Memory,
    gadget_addr: usize,
    saved: Vec<u8>,
}

impl Trampoline {
    /// ガジェットを設置する
    ///
    /// ターゲットのユーザ空間からガジェットが収まる実行可能領域を
    /// 選び、先頭バイトを退避してから書き換えます。
    pub fn install(process: &TargetProcess) -> Result<Self> {
        let memory = Memory::new(process.pid());
        let mappings = memory.get_mappings()?;
        let vma = find_executable_vma(&mappings, SYSCALL_GADGET.len())
            .ok_or(InfectError::NoGadgetVma)?;
        let gadget_addr = vma.start;

        let saved = memory.swap_area(gadget_addr, &SYSCALL_GADGET)?;
        tracing::debug!(
            pid = process.pid(),
            addr = format_args!("{:#x}", gadget_addr),
            "syscall gadget installed"
        );

        Ok(Self {
            memory,
            gadget_addr,
            saved,
        })
    }

    /// 指定スレッドにシステムコールを1回実行させる
    ///
    /// レジスタを退避し、ガジェットに向けて組み直して再開します。
    /// int3 での停止を確認したら戻り値を読み、レジスタを復元します。
    /// 期待外の停止はセッション致命であり、そのまま伝播します。
    pub fn syscall(
        &self,
        thread: &TargetThread,
        nr: i64,
        args: &[u64; SYSCALL_NARGS],
    ) -> Result<i64> {
        let saved_regs = thread.getregs()?;

        let mut regs = saved_regs;
        setup_syscall_regs(&mut regs, self.gadget_addr as u64, nr as u64, args);
        thread.setregs(&regs)?;

        thread.cont()?;
        thread.wait_trap()?;

        let after = thread.getregs()?;
        let ret = syscall_result(&after);
        // int3 の直後で止まっているはず
        let ip = instruction_pointer(&after);
        if ip != self.gadget_addr as u64 + 3 {
            thread.setregs(&saved_regs)?;
            return Err(anyhow::anyhow!(
                "Thread {} trapped at {:#x}, expected gadget exit at {:#x}",
                thread.tid(),
                ip,
                self.gadget_addr as u64 + 3
            ));
        }

        thread.setregs(&saved_regs)?;
        Ok(ret)
    }

    /// 注入済みエージェントのエントリポイントを1回実行させる
    ///
    /// エントリは (cmd, args) を受け取り、処理を終えると結果を
    /// 戻り値レジスタに置いて int3 で停止する契約です。
    /// 停止後にレジスタを復元して結果を返します。
    pub fn run_entry(
        &self,
        thread: &TargetThread,
        entry: RemoteAddr,
        stack: RemoteAddr,
        cmd: u32,
        args: RemoteAddr,
    ) -> Result<i32> {
        let saved_regs = thread.getregs()?;

        let mut regs = saved_regs;
        setup_entry_regs(&mut regs, entry.0, stack.0, cmd, args.0);
        thread.setregs(&regs)?;

        thread.cont()?;
        thread.wait_trap()?;

        let after = thread.getregs()?;
        let ret = syscall_result(&after) as i32;
        thread.setregs(&saved_regs)?;
        Ok(ret)
    }

    /// エントリポイントへ飛ばして戻さない
    ///
    /// デーモン化に使います。スレッドはこの後コマンドループの中で
    /// 走り続けるため、レジスタの復元は終了処理まで持ち越されます。
    pub fn launch_entry(
        &self,
        thread: &TargetThread,
        entry: RemoteAddr,
        stack: RemoteAddr,
        cmd: u32,
        args: RemoteAddr,
    ) -> Result<()> {
        let mut regs = thread.getregs()?;
        setup_entry_regs(&mut regs, entry.0, stack.0, cmd, args.0);
        thread.setregs(&regs)?;
        thread.cont()?;
        Ok(())
    }

    /// ガジェットを撤去して元のコードを復元する
    pub fn remove(&mut self) -> Result<()> {
        if self.saved.is_empty() {
            return Ok(());
        }
        self.memory.poke_area(self.gadget_addr, &self.saved)?;
        self.saved.clear();
        tracing::debug!(
            addr = format_args!("{:#x}", self.gadget_addr),
            "syscall gadget removed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gadget_shape() {
        // syscall(2バイト) + int3 パディング、ワード境界に一致
        assert_eq!(&SYSCALL_GADGET[..2], &[0x0f, 0x05]);
        assert!(SYSCALL_GADGET[2..].iter().all(|b| *b == 0xcc));
        assert_eq!(
            SYSCALL_GADGET.len() % std::mem::size_of::<libc::c_long>(),
            0
        );
    }
}
