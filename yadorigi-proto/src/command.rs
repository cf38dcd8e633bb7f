//! コマンドコードと制御メッセージ

/// エージェントへのコマンドコード
///
/// Idle / Ack はワイヤ上を流れず、スレッドスロットの futex 語の
/// 状態値としてのみ使われます。Daemonize 系より小さい値が
/// トラップ駆動フェーズ、大きい値がデーモンフェーズのコマンドです。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// スロットが空いている（futex 語の休止値）
    Idle = 0,
    /// 応答済みマーカー
    Ack = 1,
    /// エージェント初期化（リーダースレッド登録・ソケット接続）
    Init = 2,
    /// 追加スレッドの登録
    InitThread = 3,
    /// コマンド待ちループへの移行
    Daemonize = 4,
    /// デーモン化完了（futex 語の閾値として使用）
    Daemonized = 5,
    /// ログ用ディスクリプタとログレベルの設定
    CfgLog = 6,
    /// リーダーの終了（エージェント自身のアンマップと自己トラップ）
    Fini = 7,
    /// ワーカースレッド1つの終了
    FiniThread = 8,
    /// メモリ保護属性の一括変更
    MprotectVmas = 9,
    /// メモリページの一括転送（vmsplice 経由）
    DumpPages = 10,
    /// シグナルハンドラ設定の取得
    DumpSigacts = 11,
    /// インターバルタイマの取得
    DumpItimers = 12,
    /// プロセス単位の雑多な値の取得
    DumpMisc = 13,
    /// 資格情報と補助グループの取得
    DumpCreds = 14,
    /// スレッド単位の情報取得
    DumpThread = 15,
    /// オープン中ディスクリプタの一括転送
    DrainFds = 16,
    /// 名前空間に依存しない /proc ハンドルの取得
    GetProcFd = 17,
    /// 端末のセッション・フォアグラウンド状態の取得
    DumpTty = 18,
}

impl Command {
    /// u32 からの変換（未知の値は None）
    pub fn from_u32(v: u32) -> Option<Self> {
        use Command::*;
        Some(match v {
            0 => Idle,
            1 => Ack,
            2 => Init,
            3 => InitThread,
            4 => Daemonize,
            5 => Daemonized,
            6 => CfgLog,
            7 => Fini,
            8 => FiniThread,
            9 => MprotectVmas,
            10 => DumpPages,
            11 => DumpSigacts,
            12 => DumpItimers,
            13 => DumpMisc,
            14 => DumpCreds,
            15 => DumpThread,
            16 => DrainFds,
            17 => GetProcFd,
            18 => DumpTty,
            _ => return None,
        })
    }

    /// ワーカースレッドが受理するコマンドか
    pub fn is_thread_scoped(self) -> bool {
        matches!(self, Command::DumpThread | Command::FiniThread)
    }
}

/// 制御チャネルを流れる固定長メッセージ
///
/// 要求では ack と err は 0。応答では ack に要求コマンドのエコーが、
/// err にハンドラの結果コード（負値がエラー）が入ります。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct CtlMsg {
    /// 宛先（コントローラから見たスレッドID）
    pub id: u32,
    /// コマンドコード
    pub cmd: u32,
    /// 応答時のコマンドエコー
    pub ack: u32,
    /// 応答時の結果コード
    pub err: i32,
}

impl CtlMsg {
    /// ワイヤ上のサイズ（バイト）
    pub const SIZE: usize = 16;

    /// 要求メッセージを作る
    pub fn request(id: u32, cmd: Command) -> Self {
        Self {
            id,
            cmd: cmd as u32,
            ack: 0,
            err: 0,
        }
    }

    /// 応答メッセージを作る
    pub fn reply(id: u32, cmd: u32, err: i32) -> Self {
        Self {
            id,
            cmd,
            ack: cmd,
            err,
        }
    }

    /// この応答が指定の要求に対応するか
    ///
    /// id・コマンドエコー・ack の三つがすべて一致した場合のみ受理します。
    /// それ以外の組み合わせはプロトコル desync であり、致命的です。
    pub fn matches(&self, id: u32, cmd: Command) -> bool {
        self.id == id && self.cmd == cmd as u32 && self.ack == cmd as u32
    }

    /// ワイヤ形式（リトルエンディアン）に変換する
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.cmd.to_le_bytes());
        buf[8..12].copy_from_slice(&self.ack.to_le_bytes());
        buf[12..16].copy_from_slice(&self.err.to_le_bytes());
        buf
    }

    /// ワイヤ形式から復元する
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            cmd: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            ack: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            err: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        for v in 0..=18u32 {
            let cmd = Command::from_u32(v).expect("known command");
            assert_eq!(cmd as u32, v);
        }
        assert_eq!(Command::from_u32(19), None);
        assert_eq!(Command::from_u32(u32::MAX), None);
    }

    #[test]
    fn test_thread_scoped_subset() {
        // ワーカーループが受理するのはこの2つだけ
        assert!(Command::DumpThread.is_thread_scoped());
        assert!(Command::FiniThread.is_thread_scoped());
        assert!(!Command::DumpMisc.is_thread_scoped());
        assert!(!Command::Fini.is_thread_scoped());
    }

    #[test]
    fn test_msg_size() {
        assert_eq!(std::mem::size_of::<CtlMsg>(), CtlMsg::SIZE);
    }

    #[test]
    fn test_msg_matching() {
        let req = CtlMsg::request(1234, Command::DumpMisc);
        assert_eq!(req.ack, 0);
        assert_eq!(req.err, 0);

        let ok = CtlMsg::reply(1234, Command::DumpMisc as u32, 0);
        assert!(ok.matches(1234, Command::DumpMisc));

        // id 不一致
        let bad_id = CtlMsg::reply(1235, Command::DumpMisc as u32, 0);
        assert!(!bad_id.matches(1234, Command::DumpMisc));

        // コマンドエコー不一致
        let bad_cmd = CtlMsg::reply(1234, Command::DumpCreds as u32, 0);
        assert!(!bad_cmd.matches(1234, Command::DumpMisc));

        // ack だけ壊れている
        let mut bad_ack = CtlMsg::reply(1234, Command::DumpMisc as u32, 0);
        bad_ack.ack = Command::Idle as u32;
        assert!(!bad_ack.matches(1234, Command::DumpMisc));
    }

    #[test]
    fn test_msg_bytes_roundtrip() {
        let m = CtlMsg::reply(42, Command::DumpTty as u32, -5);
        let buf = m.to_bytes();
        assert_eq!(CtlMsg::from_bytes(&buf), m);
    }
}
