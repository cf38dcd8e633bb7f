//! プロトコルエラー型

use thiserror::Error;

/// 制御チャネル・プロトコルのエラー
///
/// トランスポートの desync（切り詰め・不一致応答）はすべて致命的であり、
/// 呼び出し側はセッション全体を破棄しなければなりません。
/// 再送・再同期は行いません。
#[derive(Debug, Error)]
pub enum ProtoError {
    /// メッセージの送受信バイト数が固定長に満たなかった
    #[error("control message truncated ({got}/{want} bytes)")]
    Truncated { got: usize, want: usize },

    /// 応答が未解決の要求と一致しなかった（致命的な desync）
    #[error("ack mismatch: expected id={want_id} cmd={want_cmd:?}, got id={got_id} cmd={got_cmd} ack={got_ack}")]
    AckMismatch {
        want_id: u32,
        want_cmd: crate::Command,
        got_id: u32,
        got_cmd: u32,
        got_ack: u32,
    },

    /// エージェント側ハンドラが負の結果コードを返した
    #[error("remote command {cmd:?} for {id} failed with code {code}")]
    RemoteFailure {
        id: u32,
        cmd: crate::Command,
        code: i32,
    },

    /// 補助データ（ファイルディスクリプタ）の個数が要求と一致しなかった
    #[error("descriptor transfer mismatch ({got}/{want} fds)")]
    FdCountMismatch { got: usize, want: usize },

    /// 固定容量バッファの上限超過
    #[error("{what} exceeds fixed capacity ({got}/{cap})")]
    CapacityExceeded {
        what: &'static str,
        got: usize,
        cap: usize,
    },

    /// OSレベルのソケットエラー
    #[error("channel I/O failed: {0}")]
    Io(#[from] nix::errno::Errno),
}
