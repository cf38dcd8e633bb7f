//! キャプチャコマンドのハンドラ群
//!
//! ここの関数はターゲットプロセスの内部で実行されます。結果は
//! 符号付きコードで返し、負値（-errno）がそのまま応答メッセージの
//! エラーフィールドとしてコントローラへ伝わります。握りつぶしは
//! しません。

use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use yadorigi_proto::args::{
    drain_fds_size, CredsArgs, DrainFdsArgs, DumpPagesHdr, ItimersArgs, MiscArgs, MprotectHdr,
    PageVec, RtSigaction, SigactsArgs, ThreadArgs, TimerValue, TtyArgs, VmaEntry, MAX_FDS,
    MAX_GROUPS, PAGE_SIZE, SIG_MAX,
};
use yadorigi_proto::{args, CtlChannel};

use crate::table::ThreadTable;

/// 直近のシステムコール失敗を -errno に変換する
fn ret_errno() -> i32 {
    -std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// 引数の復号失敗は資源エラーとして報告する
fn ret_args() -> i32 {
    -libc::E2BIG
}

/// メモリ保護属性を一括で変更する
pub fn mprotect_vmas(area: &[u8]) -> i32 {
    let hdr: MprotectHdr = match args::get_args(area) {
        Ok(h) => h,
        Err(_) => return ret_args(),
    };
    let vmas: Vec<VmaEntry> = match args::get_tail::<MprotectHdr, VmaEntry>(area, hdr.nr as usize)
    {
        Ok(v) => v,
        Err(_) => return ret_args(),
    };

    for vma in &vmas {
        let ret = unsafe {
            libc::mprotect(vma.start as *mut libc::c_void, vma.len as usize, vma.prot)
        };
        if ret != 0 {
            return ret_errno();
        }
    }
    0
}

/// ページ一括転送
///
/// 転送先のパイプはチャネル経由で受け取り、vmsplice でゼロコピー転送
/// します。転送量が宣言されたページ数と一致しない場合は失敗です。
pub fn dump_pages(chan: &CtlChannel, area: &[u8]) -> i32 {
    let pipe: OwnedFd = match chan.recv_fd() {
        Ok(fd) => fd,
        Err(_) => return -libc::EBADF,
    };

    let hdr: DumpPagesHdr = match args::get_args(area) {
        Ok(h) => h,
        Err(_) => return ret_args(),
    };
    let all: Vec<PageVec> =
        match args::get_tail::<DumpPagesHdr, PageVec>(area, (hdr.off + hdr.nr_iovs) as usize) {
            Ok(v) => v,
            Err(_) => return ret_args(),
        };

    let iovs: Vec<libc::iovec> = all[hdr.off as usize..]
        .iter()
        .map(|pv| libc::iovec {
            iov_base: pv.start as *mut libc::c_void,
            iov_len: pv.len as usize,
        })
        .collect();

    let ret = unsafe {
        libc::vmsplice(
            pipe.as_raw_fd(),
            iovs.as_ptr(),
            iovs.len(),
            libc::SPLICE_F_GIFT | libc::SPLICE_F_NONBLOCK,
        )
    };
    if ret < 0 {
        return ret_errno();
    }
    if ret as usize != PAGE_SIZE * hdr.nr_pages as usize {
        return -libc::EIO;
    }
    0
}

/// カーネル形式の rt_sigaction
#[repr(C)]
#[derive(Default, Clone, Copy)]
struct KernelSigaction {
    handler: u64,
    flags: u64,
    restorer: u64,
    mask: u64,
}

/// 捕捉可能な全シグナルのハンドラ設定を取得する
///
/// glibc の sigaction は内部予約シグナルの照会を拒否するため、
/// rt_sigaction を直接呼びます。SIGKILL と SIGSTOP は照会できないので
/// 飛ばします（スロットはゼロのまま）。
pub fn dump_sigacts(area: &mut [u8]) -> i32 {
    let mut out = SigactsArgs::default();

    for sig in 1..=SIG_MAX as i32 {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }

        let mut old = KernelSigaction::default();
        let ret = unsafe {
            libc::syscall(
                libc::SYS_rt_sigaction,
                sig,
                std::ptr::null::<KernelSigaction>(),
                &mut old as *mut KernelSigaction,
                8usize,
            )
        };
        if ret < 0 {
            return ret_errno();
        }

        out.sas[(sig - 1) as usize] = RtSigaction {
            handler: old.handler,
            flags: old.flags,
            restorer: old.restorer,
            mask: old.mask,
        };
    }

    match args::put_args(area, &out) {
        Ok(()) => 0,
        Err(_) => ret_args(),
    }
}

fn timer_value(v: &libc::itimerval) -> TimerValue {
    TimerValue {
        interval_sec: v.it_interval.tv_sec,
        interval_usec: v.it_interval.tv_usec,
        value_sec: v.it_value.tv_sec,
        value_usec: v.it_value.tv_usec,
    }
}

/// 3本のインターバルタイマを取得する
pub fn dump_itimers(area: &mut [u8]) -> i32 {
    let mut out = ItimersArgs::default();

    for (which, slot) in [
        (libc::ITIMER_REAL, &mut out.real),
        (libc::ITIMER_VIRTUAL, &mut out.virt),
        (libc::ITIMER_PROF, &mut out.prof),
    ] {
        let mut v: libc::itimerval = unsafe { std::mem::zeroed() };
        if unsafe { libc::getitimer(which, &mut v) } != 0 {
            return ret_errno();
        }
        *slot = timer_value(&v);
    }

    match args::put_args(area, &out) {
        Ok(()) => 0,
        Err(_) => ret_args(),
    }
}

#[cfg(target_arch = "x86_64")]
fn get_tls() -> u64 {
    // arch_prctl のコード。libc クレートに定義がない
    const ARCH_GET_FS: libc::c_int = 0x1003;

    let mut tls: u64 = 0;
    unsafe {
        libc::syscall(libc::SYS_arch_prctl, ARCH_GET_FS, &mut tls as *mut u64);
    }
    tls
}

/// プロセス単位の雑多な値を取得する
///
/// どれも小さすぎて専用コマンドにするほどではないが、外からは
/// 読めない値の寄せ集めです。
pub fn dump_misc(area: &mut [u8]) -> i32 {
    let umask = unsafe { libc::umask(0) };
    unsafe { libc::umask(umask) }; // 失敗しない

    let out = MiscArgs {
        brk: unsafe { libc::sbrk(0) } as u64,
        tls: get_tls(),
        pid: unsafe { libc::getpid() } as u32,
        sid: unsafe { libc::getsid(0) } as u32,
        pgid: unsafe { libc::getpgid(0) } as u32,
        umask: umask as u32,
    };

    match args::put_args(area, &out) {
        Ok(()) => 0,
        Err(_) => ret_args(),
    }
}

/// 資格情報ビットと補助グループリストを取得する
pub fn dump_creds(area: &mut [u8]) -> i32 {
    let mut out = CredsArgs::default();

    let secbits = unsafe { libc::prctl(libc::PR_GET_SECUREBITS, 0, 0, 0, 0) };
    if secbits < 0 {
        return ret_errno();
    }
    out.secbits = secbits as u32;

    let nr = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
    if nr < 0 {
        return ret_errno();
    }
    if nr as usize > MAX_GROUPS {
        // 固定バッファに収まらない。部分コピーせずに資源エラー
        return -libc::E2BIG;
    }
    out.ngroups = nr as u32;

    let got = unsafe { libc::getgroups(nr, out.groups.as_mut_ptr()) };
    if got < 0 {
        return ret_errno();
    }
    if got != nr {
        // 照会の合間にグループが変わった
        return -libc::EAGAIN;
    }

    match args::put_args(area, &out) {
        Ok(()) => 0,
        Err(_) => ret_args(),
    }
}

/// 呼び出しスレッド自身の情報を取得する
///
/// ワーカーループからのみ呼ばれるため、gettid は要求された
/// スレッドのものになります。
pub fn dump_thread(table: &ThreadTable, area: &mut [u8]) -> i32 {
    let mut io: ThreadArgs = match args::get_args(area) {
        Ok(a) => a,
        Err(_) => return ret_args(),
    };

    if table.find(io.real).is_none() {
        return -libc::ENOENT;
    }

    let mut tid_addr: u64 = 0;
    let ret = unsafe { libc::prctl(libc::PR_GET_TID_ADDRESS, &mut tid_addr as *mut u64) };
    if ret != 0 {
        return ret_errno();
    }

    io.tid_addr = tid_addr;
    io.tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
    io.tls = get_tls();

    match args::put_args(area, &io) {
        Ok(()) => 0,
        Err(_) => ret_args(),
    }
}

/// オープン中のディスクリプタを一括でコントローラへ送る
pub fn drain_fds(chan: &CtlChannel, area: &[u8]) -> i32 {
    let head: i32 = match area.get(0..4) {
        Some(b) => i32::from_ne_bytes(b.try_into().unwrap()),
        None => return ret_args(),
    };
    if head < 0 || head as usize > MAX_FDS {
        return -libc::E2BIG;
    }
    if area.len() < drain_fds_size(head as usize) {
        return ret_args();
    }

    let full: DrainFdsArgs = match args::get_args(area) {
        Ok(a) => a,
        Err(_) => return ret_args(),
    };
    let fds = &full.fds[..head as usize];
    let flags = vec![0u8; fds.len()];

    match chan.send_fds(fds, &flags) {
        Ok(()) => 0,
        Err(_) => -libc::EIO,
    }
}

static PROC_MOUNTPOINT: &str = "proc.yadorigi\0";

/// 名前空間に依存しない /proc ハンドルを取得して送る
///
/// 自分の pid 名前空間の /proc がそのまま見えているなら開くだけ。
/// そうでなければ一時ディレクトリに procfs をマウントして開き、
/// すぐに遅延アンマウントして痕跡を消します。
pub fn get_proc_fd(chan: &CtlChannel) -> i32 {
    let mut buf = [0u8; 2];
    let ret = unsafe {
        libc::readlink(
            c"/proc/self".as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if ret < 0 {
        let err = ret_errno();
        if err != -libc::ENOENT {
            return err;
        }
    }

    let dir = PROC_MOUNTPOINT.as_ptr() as *const libc::c_char;
    let fd = if ret == 1 && buf[0] == b'1' {
        // 速い経路: /proc はこの pid 名前空間のもの
        unsafe { libc::open(c"/proc".as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) }
    } else {
        if unsafe { libc::mkdir(dir, 0o700) } != 0 {
            return ret_errno();
        }
        if unsafe {
            libc::mount(
                c"proc".as_ptr(),
                dir,
                c"proc".as_ptr(),
                libc::MS_MGC_VAL,
                std::ptr::null(),
            )
        } != 0
        {
            let err = ret_errno();
            unsafe { libc::rmdir(dir) };
            return err;
        }

        let fd = unsafe { libc::open(dir, libc::O_RDONLY | libc::O_DIRECTORY) };

        if unsafe { libc::umount2(dir, libc::MNT_DETACH) } != 0 {
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
            return ret_errno();
        }
        if unsafe { libc::rmdir(dir) } != 0 {
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
            return ret_errno();
        }
        fd
    };

    if fd < 0 {
        return ret_errno();
    }

    let owned = unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(fd) };
    match chan.send_fd(owned.as_fd()) {
        Ok(()) => 0,
        Err(_) => -libc::EIO,
    }
}

// _IOR('T', ...) 系で libc クレートに無いもの
const TIOCGPKT: libc::c_ulong = 0x8004_5438;
const TIOCGPTLCK: libc::c_ulong = 0x8004_5439;
const TIOCGEXCL: libc::c_ulong = 0x8004_5440;

/// get 系の端末 ioctl を1つ実行する
///
/// ENOTTY は「この fd には該当属性がない」なので 0 を報告します。
fn tty_ioctl(fd: i32, cmd: libc::c_ulong, arg: &mut i32) -> i32 {
    let ret = unsafe { libc::ioctl(fd, cmd, arg as *mut i32) };
    if ret < 0 {
        let err = ret_errno();
        if err != -libc::ENOTTY {
            return err;
        }
        *arg = 0;
    }
    0
}

/// 端末のセッション・フォアグラウンド状態を取得する
///
/// 相手側が閉じられた擬似端末では get 系 ioctl が EIO を返します。
/// これは異常ではないので、全フィールドを空にして hangup を立てます。
pub fn dump_tty(area: &mut [u8]) -> i32 {
    let mut io: TtyArgs = match args::get_args(area) {
        Ok(a) => a,
        Err(_) => return ret_args(),
    };

    let mut failed = 0;
    for (cmd, slot) in [
        (libc::TIOCGSID as libc::c_ulong, &mut io.sid),
        (libc::TIOCGPGRP as libc::c_ulong, &mut io.pgrp),
        (TIOCGPKT, &mut io.st_pckt),
        (TIOCGPTLCK, &mut io.st_lock),
        (TIOCGEXCL, &mut io.st_excl),
    ] {
        let ret = tty_ioctl(io.fd, cmd, slot);
        if ret < 0 {
            failed = ret;
            break;
        }
    }

    if failed < 0 {
        if failed != -libc::EIO {
            return failed;
        }
        // 相手のいない擬似端末
        io.sid = 0;
        io.pgrp = 0;
        io.st_pckt = 0;
        io.st_lock = 0;
        io.st_excl = 0;
        io.hangup = 1;
    } else {
        io.hangup = 0;
    }

    match args::put_args(area, &io) {
        Ok(()) => 0,
        Err(_) => ret_args(),
    }
}
