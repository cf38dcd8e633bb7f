//! レジスタアクセス機能

/// ターゲットスレッドのレジスタ一式
pub type Regs = nix::libc::user_regs_struct;

/// リモートシステムコールの引数レジスタ数
pub const SYSCALL_NARGS: usize = 6;

/// 1回のシステムコールを実行するようレジスタを組み立てる
///
/// ガジェットの syscall 命令に向けて IP を設定し、x86_64 の
/// システムコール呼び出し規約どおりに引数を並べます。
/// orig_rax を -1 にして、停止中だったシステムコールの再開と
/// 混ざらないようにします。
#[cfg(target_arch = "x86_64")]
pub fn setup_syscall_regs(regs: &mut Regs, gadget_ip: u64, nr: u64, args: &[u64; SYSCALL_NARGS]) {
    regs.rip = gadget_ip;
    regs.rax = nr;
    regs.orig_rax = u64::MAX;
    regs.rdi = args[0];
    regs.rsi = args[1];
    regs.rdx = args[2];
    regs.r10 = args[3];
    regs.r8 = args[4];
    regs.r9 = args[5];
}

/// エージェントのエントリポイントへ飛ぶようレジスタを組み立てる
///
/// スタックには注入したイメージ内のプライベート領域を使います。
/// エントリ側の呼び出し規約は (cmd, args) の2引数です。
#[cfg(target_arch = "x86_64")]
pub fn setup_entry_regs(regs: &mut Regs, entry_ip: u64, stack: u64, cmd: u32, args: u64) {
    regs.rip = entry_ip;
    regs.orig_rax = u64::MAX;
    if stack != 0 {
        // 呼び出し規約上の16バイト境界を守る
        regs.rsp = stack & !0xf;
    }
    regs.rdi = cmd as u64;
    regs.rsi = args;
}

/// システムコールの戻り値レジスタを読む
#[cfg(target_arch = "x86_64")]
pub fn syscall_result(regs: &Regs) -> i64 {
    regs.rax as i64
}

/// 命令ポインタを読む
#[cfg(target_arch = "x86_64")]
pub fn instruction_pointer(regs: &Regs) -> u64 {
    regs.rip
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_regs() -> Regs {
        // user_regs_struct は全フィールド u64 の repr(C)
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn test_setup_syscall_regs() {
        let mut regs = zero_regs();
        let args = [1, 2, 3, 4, 5, 6];
        setup_syscall_regs(&mut regs, 0xdead0000, 9, &args);

        assert_eq!(regs.rip, 0xdead0000);
        assert_eq!(regs.rax, 9);
        assert_eq!(regs.orig_rax, u64::MAX);
        assert_eq!(regs.rdi, 1);
        assert_eq!(regs.rsi, 2);
        assert_eq!(regs.rdx, 3);
        assert_eq!(regs.r10, 4);
        assert_eq!(regs.r8, 5);
        assert_eq!(regs.r9, 6);
    }

    #[test]
    fn test_setup_entry_regs_aligns_stack() {
        let mut regs = zero_regs();
        setup_entry_regs(&mut regs, 0x1000, 0x7fff_dead_beef, 4, 0x2000);
        assert_eq!(regs.rsp & 0xf, 0);
        assert_eq!(regs.rdi, 4);
        assert_eq!(regs.rsi, 0x2000);
    }

    #[test]
    fn test_syscall_result_sign() {
        let mut regs = zero_regs();
        regs.rax = (-38i64) as u64; // -ENOSYS
        assert_eq!(syscall_result(&regs), -38);
    }
}
