//! 固定容量のスレッド状態表
//!
//! エージェントは注入後に動的確保ができないため、スレッド表は
//! 初期化時に宣言されたスレッド数ぶんを一括で確保します。
//! 検索はコントローラ側IDの単純な剰余ハッシュで、衝突は
//! スロット添字によるオープンチェーンでつなぎます。

use crate::futex::Futex;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use yadorigi_proto::Command;

/// チェーン終端を示す添字値
const NIL: i32 = -1;

/// スレッド1本ぶんの状態
///
/// `cmd` / `ack` はコントローラの同期ビューからも見える共有語です。
/// リーダーは `cmd` にコマンドを置いて起床させ、ワーカーは実行後に
/// `ret` へ結果を書いて `cmd` を Idle に戻します。
#[derive(Debug)]
pub struct ThreadSlot {
    /// コントローラ側から見たID（実tid）
    real: AtomicI32,
    /// エージェントが観測したネイティブtid
    tid: AtomicI32,
    /// コマンド語（futex）
    pub cmd: Futex,
    /// 応答語（futex）
    pub ack: Futex,
    /// 直近のハンドラ結果
    pub ret: AtomicI32,
    /// 同一バケット内の次スロット添字
    next: AtomicI32,
}

impl ThreadSlot {
    fn empty() -> Self {
        Self {
            real: AtomicI32::new(NIL),
            tid: AtomicI32::new(NIL),
            cmd: Futex::new(Command::Idle as u32),
            ack: Futex::new(Command::Idle as u32),
            ret: AtomicI32::new(0),
            next: AtomicI32::new(NIL),
        }
    }

    pub fn real(&self) -> i32 {
        self.real.load(Ordering::SeqCst)
    }

    pub fn tid(&self) -> i32 {
        self.tid.load(Ordering::SeqCst)
    }
}

/// 固定容量・確保なしのスレッド表
#[derive(Debug)]
pub struct ThreadTable {
    slots: Box<[ThreadSlot]>,
    buckets: Box<[AtomicI32]>,
    next_free: AtomicUsize,
}

impl ThreadTable {
    /// 宣言されたスレッド数ぶんの表を確保する
    ///
    /// これがエージェント側で許される唯一の確保です。
    pub fn with_capacity(capacity: usize) -> Self {
        let slots: Vec<ThreadSlot> = (0..capacity).map(|_| ThreadSlot::empty()).collect();
        let buckets: Vec<AtomicI32> = (0..capacity.max(1)).map(|_| AtomicI32::new(NIL)).collect();
        Self {
            slots: slots.into_boxed_slice(),
            buckets: buckets.into_boxed_slice(),
            next_free: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.next_free.load(Ordering::SeqCst).min(self.slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_of(&self, real: i32) -> usize {
        (real as u32 as usize) % self.buckets.len()
    }

    /// スレッドを登録する
    ///
    /// 表が満杯なら -ENOMEM を返し、領域外への書き込みは行いません。
    pub fn insert(&self, real: i32, tid: i32) -> Result<&ThreadSlot, i32> {
        let idx = self.next_free.fetch_add(1, Ordering::SeqCst);
        if idx >= self.slots.len() {
            // 満杯。予約カウンタを戻して資源エラーを返す
            self.next_free.fetch_sub(1, Ordering::SeqCst);
            return Err(-libc::ENOMEM);
        }

        let slot = &self.slots[idx];
        slot.real.store(real, Ordering::SeqCst);
        slot.tid.store(tid, Ordering::SeqCst);
        slot.cmd.set(Command::Idle as u32);
        slot.ack.set(Command::Idle as u32);

        // バケットの先頭につなぐ
        let bucket = &self.buckets[self.bucket_of(real)];
        let head = bucket.swap(idx as i32, Ordering::SeqCst);
        slot.next.store(head, Ordering::SeqCst);

        Ok(slot)
    }

    /// コントローラ側IDでスレッドを検索する
    pub fn find(&self, real: i32) -> Option<&ThreadSlot> {
        let mut idx = self.buckets[self.bucket_of(real)].load(Ordering::SeqCst);
        while idx != NIL {
            let slot = &self.slots[idx as usize];
            if slot.real() == real {
                return Some(slot);
            }
            idx = slot.next.load(Ordering::SeqCst);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_find() {
        let table = ThreadTable::with_capacity(4);

        table.insert(100, 1).unwrap();
        table.insert(200, 2).unwrap();

        assert_eq!(table.find(100).unwrap().tid(), 1);
        assert_eq!(table.find(200).unwrap().tid(), 2);
        assert!(table.find(300).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_collision_chain() {
        // 容量4なので 100 と 104 は同じバケットに入る
        let table = ThreadTable::with_capacity(4);
        table.insert(100, 1).unwrap();
        table.insert(104, 2).unwrap();

        assert_eq!(table.find(100).unwrap().tid(), 1);
        assert_eq!(table.find(104).unwrap().tid(), 2);
    }

    #[test]
    fn test_capacity_enforced() {
        let table = ThreadTable::with_capacity(2);
        table.insert(1, 1).unwrap();
        table.insert(2, 2).unwrap();

        // 3つ目は資源エラー。表は壊れない
        assert_eq!(table.insert(3, 3).unwrap_err(), -libc::ENOMEM);
        assert_eq!(table.len(), 2);
        assert!(table.find(1).is_some());
        assert!(table.find(2).is_some());
        assert!(table.find(3).is_none());
    }

    #[test]
    fn test_slot_initial_state() {
        let table = ThreadTable::with_capacity(1);
        let slot = table.insert(42, 42).unwrap();

        assert_eq!(slot.cmd.get(), Command::Idle as u32);
        assert_eq!(slot.ack.get(), Command::Idle as u32);
        assert_eq!(slot.ret.load(Ordering::SeqCst), 0);
    }
}
