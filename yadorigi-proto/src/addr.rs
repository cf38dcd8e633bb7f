//! アドレス空間をまたぐポインタ表現
//!
//! コントローラはターゲット空間のアドレスを頻繁に扱いますが、
//! それを生ポインタとして持つと誤って自分の空間で参照してしまいます。
//! ここではターゲット側・コントローラ側のアドレスを別々のタグ付き
//! 数値型で表し、変換はエイリアスマッピングを知る `AddrMap` だけが
//! 行えるようにします。

use crate::error::ProtoError;

/// ターゲットプロセスのアドレス空間内のアドレス
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemoteAddr(pub u64);

/// コントローラ自身のアドレス空間内のアドレス
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalAddr(pub usize);

impl RemoteAddr {
    pub fn add(self, off: usize) -> Self {
        RemoteAddr(self.0 + off as u64)
    }
}

impl LocalAddr {
    pub fn add(self, off: usize) -> Self {
        LocalAddr(self.0 + off)
    }
}

impl std::fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote:0x{:x}", self.0)
    }
}

impl std::fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local:0x{:x}", self.0)
    }
}

/// 同一物理ページを二重にマップした範囲の対応表
///
/// エージェントイメージはターゲット側アドレスとコントローラ側
/// エイリアスの両方から見えます。変換はこの1組の関数だけで行い、
/// ハンドラごとの場当たり的なアドレス計算を持ち込まないこと。
#[derive(Debug, Clone, Copy)]
pub struct AddrMap {
    remote_base: RemoteAddr,
    local_base: LocalAddr,
    len: usize,
}

impl AddrMap {
    pub fn new(remote_base: RemoteAddr, local_base: LocalAddr, len: usize) -> Self {
        Self {
            remote_base,
            local_base,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remote_base(&self) -> RemoteAddr {
        self.remote_base
    }

    pub fn local_base(&self) -> LocalAddr {
        self.local_base
    }

    /// コントローラ側アドレスに対応するターゲット側アドレスを返す
    pub fn remote_addr_of(&self, local: LocalAddr) -> Result<RemoteAddr, ProtoError> {
        let off = local
            .0
            .checked_sub(self.local_base.0)
            .filter(|off| *off < self.len)
            .ok_or(ProtoError::CapacityExceeded {
                what: "local address outside alias",
                got: local.0,
                cap: self.len,
            })?;
        Ok(self.remote_base.add(off))
    }

    /// ターゲット側アドレスに対応するコントローラ側アドレスを返す
    pub fn local_addr_of(&self, remote: RemoteAddr) -> Result<LocalAddr, ProtoError> {
        let off = remote
            .0
            .checked_sub(self.remote_base.0)
            .filter(|off| (*off as usize) < self.len)
            .ok_or(ProtoError::CapacityExceeded {
                what: "remote address outside alias",
                got: remote.0 as usize,
                cap: self.len,
            })?;
        Ok(self.local_base.add(off as usize))
    }
}
