//! Yadorigi エージェントランタイム
//!
//! ターゲットプロセスの内部で、ターゲット自身のネイティブスレッドとして
//! 実行されるコマンドディスパッチャです。注入後は動的なメモリ確保が
//! できないため、スレッド表は初期化時に一括確保した固定容量の領域を使い、
//! スレッド間の受け渡しは共有メモリ上の futex 語だけで行います。
//!
//! このクレートは PIE ブロブとしてビルドされてターゲットに注入されます。
//! エントリポイントとコマンド語・引数領域のオフセットはブロブのビルドと
//! コントローラの間の内部契約であり、公開インターフェースではありません。

pub mod futex;
pub mod handlers;
pub mod runtime;
pub mod table;

pub use futex::Futex;
pub use runtime::{AgentRuntime, ArgsArea};
pub use table::{ThreadSlot, ThreadTable};
