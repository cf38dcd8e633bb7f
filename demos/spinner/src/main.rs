//! 注入のデモ用ターゲット
//!
//! ワーカースレッドを数本立てて回り続けるだけのプロセスです。
//! 表示された pid に対して `yadorigi capture --pid <pid>` を
//! 実行すると、走行中のまま状態を取得できます。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static TICKS: AtomicU64 = AtomicU64::new(0);

fn main() {
    let nr_workers: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);

    println!("spinner pid: {}", std::process::id());
    println!("workers: {}", nr_workers);

    let mut handles = Vec::new();
    for i in 0..nr_workers {
        handles.push(std::thread::spawn(move || loop {
            TICKS.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(50 + 10 * i as u64));
        }));
    }

    loop {
        std::thread::sleep(Duration::from_secs(5));
        println!("ticks: {}", TICKS.load(Ordering::Relaxed));
    }
}
