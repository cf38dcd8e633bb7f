//! 制御チャネルの結合テスト
//!
//! 実際のUNIXデータグラムソケットの上で、固定長メッセージの
//! 交換・切り詰めの検出・ディスクリプタ転送を確かめます。

use std::io::{Read as _, Write as _};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;

use yadorigi_proto::{Command, CtlChannel, CtlMsg, ProtoError};

fn pair(tag: &str) -> (CtlChannel, CtlChannel) {
    let pid = std::process::id();
    let a_name = format!("yadorigi-it-{}-a-{}", tag, pid).into_bytes();
    let b_name = format!("yadorigi-it-{}-b-{}", tag, pid).into_bytes();

    let a = CtlChannel::bind_abstract(&a_name).unwrap();
    let b = CtlChannel::bind_abstract(&b_name).unwrap();
    a.connect_abstract(&b_name).unwrap();
    b.connect_abstract(&a_name).unwrap();
    (a, b)
}

#[test]
fn test_msg_exchange() {
    let (a, b) = pair("msg");

    a.send_msg(&CtlMsg::request(7, Command::DumpMisc)).unwrap();
    let req = b.recv_msg().unwrap();
    assert_eq!(req, CtlMsg::request(7, Command::DumpMisc));

    b.send_msg(&CtlMsg::reply(7, req.cmd, -13)).unwrap();
    let reply = a.recv_msg().unwrap();
    assert!(reply.matches(7, Command::DumpMisc));
    assert_eq!(reply.err, -13);
}

#[test]
fn test_truncated_datagram_is_fatal() {
    let (a, b) = pair("trunc");

    // 固定長に満たない生データグラムを直接流し込む
    let short = [0u8; 7];
    let n = unsafe {
        libc::send(
            a.as_raw_fd(),
            short.as_ptr() as *const libc::c_void,
            short.len(),
            0,
        )
    };
    assert_eq!(n, 7);

    match b.recv_msg() {
        Err(ProtoError::Truncated { got: 7, want }) => {
            assert_eq!(want, CtlMsg::SIZE);
        }
        other => panic!("expected truncation error, got {:?}", other),
    }
}

#[test]
fn test_fd_transfer_roundtrip() {
    let (a, b) = pair("fd");

    let (mut left, right) = UnixStream::pair().unwrap();
    a.send_fd(right.as_fd()).unwrap();
    drop(right);

    let received = b.recv_fd().unwrap();
    let mut received: UnixStream = received.into();
    received.write_all(b"through the wall").unwrap();
    drop(received);

    let mut buf = String::new();
    left.read_to_string(&mut buf).unwrap();
    assert_eq!(buf, "through the wall");
}

#[test]
fn test_fd_batch_preserves_order_and_flags() {
    let (a, b) = pair("batch");

    let streams: Vec<UnixStream> = (0..5)
        .map(|_| UnixStream::pair().unwrap())
        .flat_map(|(l, _r)| [l])
        .collect();
    let raw: Vec<i32> = streams.iter().map(|s| s.as_raw_fd()).collect();
    let flags: Vec<u8> = (0..5).collect();

    a.send_fds(&raw, &flags).unwrap();
    let (received, got_flags) = b.recv_fds(5).unwrap();

    assert_eq!(received.len(), 5);
    assert_eq!(got_flags, flags);
    // 転送後の fd は元と同じソケットを指す別番号
    for fd in &received {
        assert!(fd.as_raw_fd() >= 0);
    }
}
