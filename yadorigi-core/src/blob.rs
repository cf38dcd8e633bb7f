//! エージェントイメージの読み込み
//!
//! イメージは位置独立なコード本体の前に小さな固定ヘッダを持つ
//! 独自形式です。ヘッダはビルド側との内部契約で、マジック・
//! バージョン・エントリポイントのコード先頭からのオフセットを
//! リトルエンディアンで並べます。

use std::path::Path;

use crate::error::InfectError;
use crate::Result;

/// ヘッダ先頭のマジック（"YDRG"）
pub const BLOB_MAGIC: u32 = u32::from_le_bytes(*b"YDRG");

/// 対応するヘッダバージョン
pub const BLOB_VERSION: u32 = 1;

/// ヘッダのサイズ（magic, version, entry, reserved）
pub const BLOB_HEADER_SIZE: usize = 16;

/// パース済みのエージェントイメージ
#[derive(Debug, Clone)]
pub struct AgentBlob {
    entry: u32,
    code: Vec<u8>,
}

impl AgentBlob {
    /// ファイルからイメージを読み込む
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read agent image {}: {}", path.display(), e))?;
        Self::from_bytes(&bytes)
    }

    /// バイト列からイメージをパースする
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOB_HEADER_SIZE {
            return Err(InfectError::BlobTooShort {
                got: bytes.len(),
                want: BLOB_HEADER_SIZE,
            }
            .into());
        }

        let field = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        let magic = field(0);
        if magic != BLOB_MAGIC {
            return Err(InfectError::BadMagic { got: magic }.into());
        }
        let version = field(1);
        if version != BLOB_VERSION {
            return Err(InfectError::BadVersion {
                got: version,
                want: BLOB_VERSION,
            }
            .into());
        }

        let entry = field(2);
        let code = bytes[BLOB_HEADER_SIZE..].to_vec();
        if entry as usize >= code.len() {
            return Err(InfectError::EntryOutOfRange {
                entry,
                len: code.len(),
            }
            .into());
        }

        Ok(Self { entry, code })
    }

    /// エントリポイントのコード先頭からのオフセット
    pub fn entry_offset(&self) -> u32 {
        self.entry
    }

    /// コード本体
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_blob(magic: u32, version: u32, entry: u32, code: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&magic.to_le_bytes());
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&entry.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(code);
        bytes
    }

    #[test]
    fn test_parse_valid_blob() {
        let bytes = make_blob(BLOB_MAGIC, BLOB_VERSION, 4, &[0x90; 64]);
        let blob = AgentBlob::from_bytes(&bytes).unwrap();
        assert_eq!(blob.entry_offset(), 4);
        assert_eq!(blob.len(), 64);
        assert_eq!(blob.code()[0], 0x90);
    }

    #[test]
    fn test_reject_bad_magic() {
        let bytes = make_blob(0xdead_beef, BLOB_VERSION, 0, &[0x90; 8]);
        let err = AgentBlob::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InfectError>(),
            Some(InfectError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_reject_bad_version() {
        let bytes = make_blob(BLOB_MAGIC, 99, 0, &[0x90; 8]);
        let err = AgentBlob::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InfectError>(),
            Some(InfectError::BadVersion { got: 99, .. })
        ));
    }

    #[test]
    fn test_reject_truncated_header() {
        let err = AgentBlob::from_bytes(&[0u8; 8]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InfectError>(),
            Some(InfectError::BlobTooShort { got: 8, .. })
        ));
    }

    #[test]
    fn test_reject_entry_outside_code() {
        let bytes = make_blob(BLOB_MAGIC, BLOB_VERSION, 64, &[0x90; 64]);
        let err = AgentBlob::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InfectError>(),
            Some(InfectError::EntryOutOfRange { entry: 64, len: 64 })
        ));
    }
}
