//! Yadorigi コントローラコア
//!
//! 停止中のターゲットプロセスへエージェントを注入し、制御チャネル
//! 越しにキャプチャコマンドを実行して、最後に痕跡を残さず撤収する
//! ための機能一式です。使う側は [`session::Session`] だけを
//! 見れば足ります。

pub mod blob;
pub mod channel;
pub mod error;
pub mod loader;
pub mod session;
pub mod trampoline;

pub use blob::AgentBlob;
pub use channel::DaemonLink;
pub use error::InfectError;
pub use session::Session;

/// コントローラ操作の結果型
pub type Result<T> = anyhow::Result<T>;
