//! Yadorigi 制御プロトコル
//!
//! このクレートは、コントローラと注入先プロセス内のエージェントが共有する
//! プロトコル定義を提供します。コマンドコード、固定長の制御メッセージ、
//! 共有メモリ上の引数構造体、アドレス空間をまたぐポインタ表現、
//! およびUNIXデータグラムソケット上のトランスポートを含みます。

pub mod addr;
pub mod args;
pub mod channel;
pub mod command;
pub mod error;

pub use addr::{AddrMap, LocalAddr, RemoteAddr};
pub use channel::CtlChannel;
pub use command::{Command, CtlMsg};
pub use error::ProtoError;

/// プロトコル操作の結果型
pub type Result<T> = std::result::Result<T, ProtoError>;
