//! Yadorigi ターゲットプロセス制御
//!
//! このクレートは、検査対象プロセスを外側から操作するための低レベル機能を
//! 提供します。ptrace によるアタッチと停止待ち、レジスタの取得・設定、
//! /proc/pid/mem 経由のメモリアクセス、メモリマッピングの列挙などを行います。

pub mod memory;
pub mod process;
pub mod registers;
pub mod thread;

pub use memory::{Memory, MemoryMapping};
pub use process::{list_threads, TargetProcess};
pub use registers::Regs;
pub use thread::{TargetThread, ThreadId};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
