//! 共有引数構造体
//!
//! コントローラとエージェントはエージェントイメージ内の引数領域を
//! 共有メモリとして読み書きします。ここに置かれる構造体はすべて
//! `#[repr(C)]` の固定レイアウトで、エージェント側では注入後の
//! 動的確保ができないため、可変長データは固定上限の配列か
//! ヘッダ＋後続列の形で表現します。

use crate::error::ProtoError;

/// ページサイズ（引数領域のサイズ計算単位）
pub const PAGE_SIZE: usize = 4096;

/// 引数領域の最小サイズ
pub const ARGS_SIZE_MIN: usize = PAGE_SIZE;

/// エージェントスレッドのプライベートスタックサイズ
pub const AGENT_STACK_SIZE: usize = 16 << 10;

/// スレッドごとのシグナル復元フレームの予約サイズ
pub const SIGFRAME_SIZE: usize = 1024;

/// 扱うシグナル番号の上限
pub const SIG_MAX: usize = 64;

/// 補助グループリストの固定上限
pub const MAX_GROUPS: usize = PAGE_SIZE / 4 - 2;

/// 一括転送できるディスクリプタ数の固定上限
pub const MAX_FDS: usize = PAGE_SIZE / 4;

/// `n` を `unit` の倍数に切り上げる
pub const fn round_up(n: usize, unit: usize) -> usize {
    (n + unit - 1) / unit * unit
}

/// UNIXソケットアドレス（抽象名）を運ぶ固定長バッファ
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SockAddrBuf {
    /// 有効なバイト数
    pub len: u32,
    /// 先頭バイトが 0 の抽象ソケット名
    pub path: [u8; 108],
}

impl Default for SockAddrBuf {
    fn default() -> Self {
        Self {
            len: 0,
            path: [0; 108],
        }
    }
}

impl SockAddrBuf {
    /// 抽象ソケット名（先頭NUL抜き）から構築する
    pub fn abstract_name(name: &[u8]) -> Result<Self, ProtoError> {
        let mut buf = Self::default();
        if name.len() > buf.path.len() - 1 {
            return Err(ProtoError::CapacityExceeded {
                what: "socket name",
                got: name.len(),
                cap: buf.path.len() - 1,
            });
        }
        // path[0] は抽象名を示す NUL のまま
        buf.path[1..1 + name.len()].copy_from_slice(name);
        buf.len = (1 + name.len()) as u32;
        Ok(buf)
    }

    /// 抽象名部分（先頭NULを除く）を取り出す
    pub fn name(&self) -> &[u8] {
        &self.path[1..self.len as usize]
    }
}

/// Init / InitThread / Fini 系で使う引数
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct InitArgs {
    /// コントローラ側エンドポイントのアドレス
    pub ctl_addr: SockAddrBuf,
    /// エージェント側エンドポイントのアドレス
    pub agent_addr: SockAddrBuf,
    /// 登録予定のスレッド総数
    pub nr_threads: i32,
    /// 対象スレッドのコントローラ側ID（実tid）
    pub tid: i32,
}

/// CfgLog の引数
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct LogArgs {
    /// エージェント側に設定するログレベル
    pub level: i32,
}

/// メモリ保護変更の対象1件
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct VmaEntry {
    pub start: u64,
    pub len: u64,
    pub prot: i32,
    _pad: u32,
}

impl VmaEntry {
    pub fn new(start: u64, len: u64, prot: i32) -> Self {
        Self {
            start,
            len,
            prot,
            _pad: 0,
        }
    }
}

/// MprotectVmas のヘッダ（後続に `nr` 個の VmaEntry が並ぶ）
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MprotectHdr {
    pub nr: u32,
    _pad: u32,
}

impl MprotectHdr {
    pub fn new(nr: u32) -> Self {
        Self { nr, _pad: 0 }
    }
}

/// VmaEntry `nr` 件ぶんの引数領域サイズ
pub const fn mprotect_args_size(nr: usize) -> usize {
    std::mem::size_of::<MprotectHdr>() + nr * std::mem::size_of::<VmaEntry>()
}

/// 転送対象のページ範囲1件
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PageVec {
    pub start: u64,
    pub len: u64,
}

/// DumpPages のヘッダ（後続に `nr_iovs` 個の PageVec が並ぶ）
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DumpPagesHdr {
    /// 処理を開始する PageVec のオフセット
    pub off: u32,
    /// 今回処理する PageVec の個数
    pub nr_iovs: u32,
    /// 転送されるページ総数（検証用）
    pub nr_pages: u32,
    _pad: u32,
}

impl DumpPagesHdr {
    pub fn new(off: u32, nr_iovs: u32, nr_pages: u32) -> Self {
        Self {
            off,
            nr_iovs,
            nr_pages,
            _pad: 0,
        }
    }
}

/// PageVec `nr` 件ぶんの引数領域サイズ
pub const fn dump_pages_args_size(nr: usize) -> usize {
    std::mem::size_of::<DumpPagesHdr>() + nr * std::mem::size_of::<PageVec>()
}

/// カーネル形式の rt_sigaction 1件
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RtSigaction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

/// DumpSigacts の引数（全シグナルぶんの領域）
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SigactsArgs {
    pub sas: [RtSigaction; SIG_MAX],
}

impl Default for SigactsArgs {
    fn default() -> Self {
        Self {
            sas: [RtSigaction::default(); SIG_MAX],
        }
    }
}

/// インターバルタイマ1本の値
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TimerValue {
    pub interval_sec: i64,
    pub interval_usec: i64,
    pub value_sec: i64,
    pub value_usec: i64,
}

/// DumpItimers の引数
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ItimersArgs {
    pub real: TimerValue,
    pub virt: TimerValue,
    pub prof: TimerValue,
}

/// DumpMisc の引数（プロセス単位のスカラ値）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MiscArgs {
    pub brk: u64,
    pub tls: u64,
    pub pid: u32,
    pub sid: u32,
    pub pgid: u32,
    pub umask: u32,
}

/// DumpCreds の引数
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CredsArgs {
    pub secbits: u32,
    pub ngroups: u32,
    pub groups: [u32; MAX_GROUPS],
}

impl Default for CredsArgs {
    fn default() -> Self {
        Self {
            secbits: 0,
            ngroups: 0,
            groups: [0; MAX_GROUPS],
        }
    }
}

/// DumpThread の引数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ThreadArgs {
    /// clear_child_tid の位置（ターゲット空間のアドレス）
    pub tid_addr: u64,
    /// スレッドローカル記憶のベース
    pub tls: u64,
    /// コントローラ側から見たID（入力）
    pub real: i32,
    /// エージェントが観測したネイティブtid（出力）
    pub tid: i32,
}

/// DrainFds の引数
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DrainFdsArgs {
    pub nr_fds: i32,
    pub fds: [i32; MAX_FDS],
}

impl Default for DrainFdsArgs {
    fn default() -> Self {
        Self {
            nr_fds: 0,
            fds: [0; MAX_FDS],
        }
    }
}

/// 先頭から実際に使われているぶんのサイズ
pub const fn drain_fds_size(nr_fds: usize) -> usize {
    std::mem::size_of::<i32>() * (1 + nr_fds)
}

/// DumpTty の引数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TtyArgs {
    /// 調査対象のディスクリプタ（ターゲット内の番号、入力）
    pub fd: i32,
    /// セッションID
    pub sid: i32,
    /// フォアグラウンドプロセスグループ
    pub pgrp: i32,
    /// 相手のいない擬似端末だったか
    pub hangup: i32,
    /// パケットモード
    pub st_pckt: i32,
    /// ロック状態
    pub st_lock: i32,
    /// 排他状態
    pub st_excl: i32,
    _pad: i32,
}

/// 構造体を引数領域の先頭に書き込む
pub fn put_args<T: Copy>(area: &mut [u8], value: &T) -> Result<(), ProtoError> {
    let size = std::mem::size_of::<T>();
    if area.len() < size {
        return Err(ProtoError::CapacityExceeded {
            what: "argument area",
            got: size,
            cap: area.len(),
        });
    }
    // 固定レイアウトの Copy 型のみを書き込む
    unsafe {
        std::ptr::copy_nonoverlapping(value as *const T as *const u8, area.as_mut_ptr(), size);
    }
    Ok(())
}

/// 引数領域の先頭から構造体を読み出す
pub fn get_args<T: Copy + Default>(area: &[u8]) -> Result<T, ProtoError> {
    let size = std::mem::size_of::<T>();
    if area.len() < size {
        return Err(ProtoError::CapacityExceeded {
            what: "argument area",
            got: size,
            cap: area.len(),
        });
    }
    let mut value = T::default();
    unsafe {
        std::ptr::copy_nonoverlapping(area.as_ptr(), &mut value as *mut T as *mut u8, size);
    }
    Ok(value)
}

/// ヘッダの直後に並ぶ後続列を書き込む
pub fn put_tail<H: Copy, T: Copy>(area: &mut [u8], entries: &[T]) -> Result<(), ProtoError> {
    let off = std::mem::size_of::<H>();
    let size = entries.len() * std::mem::size_of::<T>();
    if area.len() < off + size {
        return Err(ProtoError::CapacityExceeded {
            what: "argument tail",
            got: off + size,
            cap: area.len(),
        });
    }
    unsafe {
        std::ptr::copy_nonoverlapping(
            entries.as_ptr() as *const u8,
            area.as_mut_ptr().add(off),
            size,
        );
    }
    Ok(())
}

/// ヘッダの直後に並ぶ後続列を読み出す
pub fn get_tail<H: Copy, T: Copy + Default>(
    area: &[u8],
    nr: usize,
) -> Result<Vec<T>, ProtoError> {
    let off = std::mem::size_of::<H>();
    let size = nr * std::mem::size_of::<T>();
    if area.len() < off + size {
        return Err(ProtoError::CapacityExceeded {
            what: "argument tail",
            got: off + size,
            cap: area.len(),
        });
    }
    let mut out = vec![T::default(); nr];
    unsafe {
        std::ptr::copy_nonoverlapping(
            area.as_ptr().add(off),
            out.as_mut_ptr() as *mut u8,
            size,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, PAGE_SIZE), 0);
        assert_eq!(round_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up(PAGE_SIZE + 1, PAGE_SIZE), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_abstract_name() {
        let buf = SockAddrBuf::abstract_name(b"yadorigi-test").unwrap();
        assert_eq!(buf.path[0], 0);
        assert_eq!(buf.name(), b"yadorigi-test");

        // 上限超過は容量エラー
        let long = vec![b'x'; 200];
        assert!(SockAddrBuf::abstract_name(&long).is_err());
    }

    #[test]
    fn test_args_roundtrip() {
        let mut area = vec![0u8; ARGS_SIZE_MIN];
        let mut misc = MiscArgs::default();
        misc.pid = 1234;
        misc.brk = 0xdead_beef;
        misc.umask = 0o022;

        put_args(&mut area, &misc).unwrap();
        let back: MiscArgs = get_args(&area).unwrap();
        assert_eq!(back, misc);
    }

    #[test]
    fn test_args_area_too_small() {
        let mut area = vec![0u8; 8];
        let creds = CredsArgs::default();
        assert!(put_args(&mut area, &creds).is_err());
        assert!(get_args::<CredsArgs>(&area).is_err());
    }

    #[test]
    fn test_tail_roundtrip() {
        let mut area = vec![0u8; ARGS_SIZE_MIN];
        let vmas = vec![
            VmaEntry::new(0x1000, 0x2000, 5),
            VmaEntry::new(0x4000, 0x1000, 3),
        ];
        put_args(&mut area, &MprotectHdr::new(vmas.len() as u32)).unwrap();
        put_tail::<MprotectHdr, VmaEntry>(&mut area, &vmas).unwrap();

        let hdr: MprotectHdr = get_args(&area).unwrap();
        assert_eq!(hdr.nr, 2);
        let back = get_tail::<MprotectHdr, VmaEntry>(&area, hdr.nr as usize).unwrap();
        assert_eq!(back, vmas);
    }

    #[test]
    fn test_size_bounds() {
        // 引数領域の最小サイズに主要な構造体が収まること
        assert!(std::mem::size_of::<InitArgs>() <= ARGS_SIZE_MIN);
        assert!(std::mem::size_of::<SigactsArgs>() <= ARGS_SIZE_MIN);
        assert!(std::mem::size_of::<CredsArgs>() <= ARGS_SIZE_MIN);
        assert!(std::mem::size_of::<DrainFdsArgs>() <= drain_fds_size(MAX_FDS) + 4);
        assert_eq!(drain_fds_size(0), 4);
        assert_eq!(drain_fds_size(3), 16);
    }
}
