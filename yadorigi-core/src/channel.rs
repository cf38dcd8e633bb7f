//! デーモン化したエージェントとの対話
//!
//! 要求と応答の対応付けはここで一元的に検査します。応答の id・
//! コマンドエコー・ack がそろって一致しない限り受理せず、不一致は
//! 再同期を試みない致命的エラーとして呼び出し側へ返します。

use yadorigi_proto::{Command, CtlChannel, CtlMsg, ProtoError};

/// デーモンフェーズの制御リンク
#[derive(Debug)]
pub struct DaemonLink {
    chan: CtlChannel,
}

impl DaemonLink {
    pub fn new(chan: CtlChannel) -> Self {
        Self { chan }
    }

    /// 生のチャネル（ディスクリプタ転送用）
    pub fn channel(&self) -> &CtlChannel {
        &self.chan
    }

    /// 要求を送る
    pub fn send_cmd(&self, id: u32, cmd: Command) -> Result<(), ProtoError> {
        tracing::trace!(id, ?cmd, "sending command");
        self.chan.send_msg(&CtlMsg::request(id, cmd))
    }

    /// 指定の要求に対する応答を待つ
    ///
    /// 正常なら結果コード（非負）を返します。
    pub fn wait_ack(&self, id: u32, cmd: Command) -> Result<i32, ProtoError> {
        let msg = self.chan.recv_msg()?;
        if !msg.matches(id, cmd) {
            return Err(ProtoError::AckMismatch {
                want_id: id,
                want_cmd: cmd,
                got_id: msg.id,
                got_cmd: msg.cmd,
                got_ack: msg.ack,
            });
        }
        if msg.err < 0 {
            return Err(ProtoError::RemoteFailure {
                id,
                cmd,
                code: msg.err,
            });
        }
        Ok(msg.err)
    }

    /// 要求を送って応答まで待つ
    pub fn command(&self, id: u32, cmd: Command) -> Result<i32, ProtoError> {
        self.send_cmd(id, cmd)?;
        self.wait_ack(id, cmd)
    }

    /// デーモン化直後の自発的な応答を待つ
    pub fn wait_daemonized(&self, id: u32) -> Result<(), ProtoError> {
        self.wait_ack(id, Command::Daemonize)?;
        tracing::debug!(id, "agent daemonized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_pair(tag: &str) -> (DaemonLink, CtlChannel) {
        let pid = std::process::id();
        let ctl_name = format!("yadorigi-core-{}-ctl-{}", tag, pid).into_bytes();
        let agt_name = format!("yadorigi-core-{}-agt-{}", tag, pid).into_bytes();

        let ctl = CtlChannel::bind_abstract(&ctl_name).unwrap();
        let agt = CtlChannel::bind_abstract(&agt_name).unwrap();
        ctl.connect_abstract(&agt_name).unwrap();
        agt.connect_abstract(&ctl_name).unwrap();
        (DaemonLink::new(ctl), agt)
    }

    #[test]
    fn test_command_ack_roundtrip() {
        let (link, agt) = unique_pair("ok");

        link.send_cmd(7, Command::DumpMisc).unwrap();
        let req = agt.recv_msg().unwrap();
        assert_eq!(req.id, 7);
        agt.send_msg(&CtlMsg::reply(req.id, req.cmd, 0)).unwrap();

        assert_eq!(link.wait_ack(7, Command::DumpMisc).unwrap(), 0);
    }

    #[test]
    fn test_remote_failure_is_typed() {
        let (link, agt) = unique_pair("err");

        link.send_cmd(7, Command::DumpThread).unwrap();
        let req = agt.recv_msg().unwrap();
        agt.send_msg(&CtlMsg::reply(req.id, req.cmd, -libc::ENOENT))
            .unwrap();

        match link.wait_ack(7, Command::DumpThread) {
            Err(ProtoError::RemoteFailure { code, .. }) => assert_eq!(code, -libc::ENOENT),
            other => panic!("expected remote failure, got {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_ack_is_fatal() {
        let (link, agt) = unique_pair("desync");

        link.send_cmd(7, Command::DumpMisc).unwrap();
        let req = agt.recv_msg().unwrap();
        // 別コマンドの応答を返す
        agt.send_msg(&CtlMsg::reply(req.id, Command::DumpCreds as u32, 0))
            .unwrap();

        assert!(matches!(
            link.wait_ack(7, Command::DumpMisc),
            Err(ProtoError::AckMismatch { .. })
        ));
    }
}
