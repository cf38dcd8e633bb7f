//! 注入処理の定義済みエラー

use thiserror::Error;

/// 注入の各段階で起きる失敗
///
/// 呼び出し側が区別して扱う必要のあるものだけを型にしています。
/// それ以外の失敗は anyhow のコンテキスト付きエラーで流します。
#[derive(Debug, Error)]
pub enum InfectError {
    /// ガジェットを置ける実行可能領域がない
    #[error("no executable mapping large enough for the syscall gadget")]
    NoGadgetVma,

    /// リモートシステムコールがエラーを返した
    #[error("remote {name} failed with {code}")]
    RemoteSyscall { name: &'static str, code: i32 },

    /// エージェントイメージが短すぎる
    #[error("agent image too short: {got} bytes, header needs {want}")]
    BlobTooShort { got: usize, want: usize },

    /// エージェントイメージのマジックが違う
    #[error("bad agent image magic: {got:#010x}")]
    BadMagic { got: u32 },

    /// エージェントイメージのバージョンが未対応
    #[error("unsupported agent image version {got} (supported: {want})")]
    BadVersion { got: u32, want: u32 },

    /// エントリポイントがコード範囲の外を指している
    #[error("agent entry offset {entry:#x} outside code of {len:#x} bytes")]
    EntryOutOfRange { entry: u32, len: usize },
}
