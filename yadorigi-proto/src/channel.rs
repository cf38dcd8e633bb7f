//! 制御チャネルのトランスポート
//!
//! コントローラとエージェントは抽象名のUNIXデータグラムソケットで
//! 結ばれます。メッセージは固定長の [`CtlMsg`] のみで、
//! 切り詰められた送受信は常に致命的（desync）として扱います。
//! ディスクリプタの転送は同じソケット上の SCM_RIGHTS で行います。

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    bind, connect, recv, recvmsg, send, sendmsg, socket, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};

use crate::command::CtlMsg;
use crate::error::ProtoError;
use crate::Result;

/// 1回の SCM_RIGHTS で運ぶディスクリプタ数の上限
pub const SCM_MAX_FDS: usize = 252;

/// 制御チャネルの一端
///
/// セッションが所有し、セッションと共に閉じられます。
/// プロセス間で共有される静的なソケットは持ちません。
#[derive(Debug)]
pub struct CtlChannel {
    sock: OwnedFd,
}

impl CtlChannel {
    /// 抽象名にバインドしたデータグラムソケットを作る
    pub fn bind_abstract(name: &[u8]) -> Result<Self> {
        let sock = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new_abstract(name)?;
        bind(sock.as_raw_fd(), &addr)?;
        Ok(Self { sock })
    }

    /// 既存のソケットから構築する（エージェント側の接続済みソケット用）
    pub fn from_fd(sock: OwnedFd) -> Self {
        Self { sock }
    }

    /// 相手側の抽象名へ接続する
    pub fn connect_abstract(&self, name: &[u8]) -> Result<()> {
        let addr = UnixAddr::new_abstract(name)?;
        connect(self.sock.as_raw_fd(), &addr)?;
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// 制御メッセージを1つ送る（全量送信できなければ致命的）
    pub fn send_msg(&self, msg: &CtlMsg) -> Result<()> {
        let buf = msg.to_bytes();
        let n = send(self.sock.as_raw_fd(), &buf, MsgFlags::empty())?;
        if n != CtlMsg::SIZE {
            return Err(ProtoError::Truncated {
                got: n,
                want: CtlMsg::SIZE,
            });
        }
        Ok(())
    }

    /// 制御メッセージを1つ受け取る（切り詰めは致命的）
    pub fn recv_msg(&self) -> Result<CtlMsg> {
        let mut buf = [0u8; CtlMsg::SIZE];
        let n = recv(self.sock.as_raw_fd(), &mut buf, MsgFlags::empty())?;
        if n != CtlMsg::SIZE {
            return Err(ProtoError::Truncated {
                got: n,
                want: CtlMsg::SIZE,
            });
        }
        Ok(CtlMsg::from_bytes(&buf))
    }

    /// ディスクリプタを1つ転送する
    pub fn send_fd(&self, fd: BorrowedFd<'_>) -> Result<()> {
        self.send_fds(&[fd.as_raw_fd()], &[0])
    }

    /// ディスクリプタを1つ受け取る
    pub fn recv_fd(&self) -> Result<OwnedFd> {
        let (mut fds, _) = self.recv_fds(1)?;
        Ok(fds.remove(0))
    }

    /// ディスクリプタを一括転送する
    ///
    /// `flags` は fd ごとの属性バイトで、データ部として一緒に運びます。
    /// 個数と順序は受信側の宣言と厳密に一致しなければなりません。
    pub fn send_fds(&self, fds: &[RawFd], flags: &[u8]) -> Result<()> {
        assert_eq!(fds.len(), flags.len());
        for (chunk, fl) in fds.chunks(SCM_MAX_FDS).zip(flags.chunks(SCM_MAX_FDS)) {
            let iov = [IoSlice::new(fl)];
            let cmsg = [ControlMessage::ScmRights(chunk)];
            let n = sendmsg::<UnixAddr>(
                self.sock.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::empty(),
                None,
            )?;
            if n != fl.len() {
                return Err(ProtoError::Truncated {
                    got: n,
                    want: fl.len(),
                });
            }
        }
        Ok(())
    }

    /// 宣言された個数のディスクリプタを受け取る
    ///
    /// 受信個数が一致しない場合は致命的なプロトコルエラーです。
    pub fn recv_fds(&self, expected: usize) -> Result<(Vec<OwnedFd>, Vec<u8>)> {
        let mut fds = Vec::with_capacity(expected);
        let mut flags = Vec::with_capacity(expected);

        while fds.len() < expected {
            let want = (expected - fds.len()).min(SCM_MAX_FDS);
            let mut data = vec![0u8; want];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; SCM_MAX_FDS]);
            let mut iov = [IoSliceMut::new(&mut data)];

            let got;
            {
                let msg = recvmsg::<UnixAddr>(
                    self.sock.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::empty(),
                )?;
                got = msg.bytes;
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        for fd in received {
                            // SCM_RIGHTS で受けた fd はこちらが所有する
                            fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
            }
            flags.extend_from_slice(&data[..got]);

            if fds.len() != flags.len() {
                return Err(ProtoError::FdCountMismatch {
                    got: fds.len(),
                    want: flags.len(),
                });
            }
            if got == 0 {
                break;
            }
        }

        if fds.len() != expected {
            return Err(ProtoError::FdCountMismatch {
                got: fds.len(),
                want: expected,
            });
        }
        Ok((fds, flags))
    }
}
