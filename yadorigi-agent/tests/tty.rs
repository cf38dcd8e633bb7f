//! 擬似端末に対する端末状態ハンドラの結合テスト

use std::os::fd::{FromRawFd, OwnedFd};

use yadorigi_agent::handlers;
use yadorigi_proto::args::{self, TtyArgs, ARGS_SIZE_MIN};

/// マスタとスレーブを開いた pty ペアを用意する
fn open_pty_pair() -> (OwnedFd, OwnedFd) {
    unsafe {
        let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
        assert!(master >= 0, "posix_openpt failed");
        assert_eq!(libc::grantpt(master), 0);
        assert_eq!(libc::unlockpt(master), 0);

        let mut name = [0 as libc::c_char; 64];
        assert_eq!(libc::ptsname_r(master, name.as_mut_ptr(), name.len()), 0);
        let slave = libc::open(name.as_ptr(), libc::O_RDWR | libc::O_NOCTTY);
        assert!(slave >= 0, "slave open failed");

        (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave))
    }
}

fn query(fd: i32) -> TtyArgs {
    let mut area = vec![0u8; ARGS_SIZE_MIN];
    let mut io = TtyArgs::default();
    io.fd = fd;
    args::put_args(&mut area, &io).unwrap();

    assert_eq!(handlers::dump_tty(&mut area), 0);
    args::get_args(&area).unwrap()
}

#[test]
fn test_live_pty_slave() {
    use std::os::fd::AsRawFd;
    let (_master, slave) = open_pty_pair();

    // 制御端末ではないので属性は空だが、切断扱いにはならない
    let out = query(slave.as_raw_fd());
    assert_eq!(out.hangup, 0);
}

#[test]
fn test_pair_less_pty_reports_hangup() {
    use std::os::fd::AsRawFd;
    let (master, slave) = open_pty_pair();

    // マスタを閉じると get 系 ioctl は EIO を返すようになる
    drop(master);
    let out = query(slave.as_raw_fd());
    assert_eq!(out.hangup, 1);
    assert_eq!(out.sid, 0);
    assert_eq!(out.pgrp, 0);
}
