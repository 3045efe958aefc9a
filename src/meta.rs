//! 断点续传元数据文件的编解码与原子读写。
//!
//! 磁盘布局（全部小端）:
//!
//! ```text
//! magic[4]="AVMT" | version:u16 | url_len:u16 | url[url_len]
//! | total_size:i64 | piece_size:i32 | piece_count:i32
//! | bitmap[⌈piece_count/8⌉] | crc32:u32
//! ```
//!
//! CRC 覆盖其前的全部字节, 校验失败、截断或与探测结果不匹配时整个
//! 文件被丢弃, 下载从空位图重新开始。

use crate::rangefield::RangeField;
use crate::types::Result;
use faststr::FastStr;
use log::{debug, warn};
use std::io;
use std::path::{Path, PathBuf};

/// 文件头魔数。
const MAGIC: &[u8; 4] = b"AVMT";
/// 当前格式版本。
const VERSION: u16 = 1;

/// 一次下载会话的可恢复状态。
#[derive(Debug, Clone, PartialEq)]
pub struct MetaFile {
    /// 跳转后的最终 URL, 恢复时必须与新一次探测一致。
    pub url: FastStr,
    /// 文件总大小。
    pub total_size: i64,
    /// 分片大小。
    pub piece_size: i32,
    /// 分片总数。
    pub piece_count: i32,
    /// 已完成分片位图。
    pub bitmap: RangeField,
}

impl MetaFile {
    /// 校验本记录是否与一次新探测的结果兼容。
    pub fn matches(&self, url: &str, total_size: u64, piece_size: u64, piece_count: u64) -> bool {
        self.url == url
            && self.total_size == total_size as i64
            && self.piece_size == piece_size as i32
            && self.piece_count == piece_count as i32
    }

    /// 序列化为磁盘字节。
    pub fn encode(&self) -> Vec<u8> {
        let url = self.url.as_bytes();
        let bitmap = self.bitmap.as_bytes();
        let mut buf = Vec::with_capacity(4 + 2 + 2 + url.len() + 8 + 4 + 4 + bitmap.len() + 4);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&(url.len() as u16).to_le_bytes());
        buf.extend_from_slice(url);
        buf.extend_from_slice(&self.total_size.to_le_bytes());
        buf.extend_from_slice(&self.piece_size.to_le_bytes());
        buf.extend_from_slice(&self.piece_count.to_le_bytes());
        buf.extend_from_slice(&bitmap);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// 从磁盘字节恢复。任何形式的损坏都返回 `None`。
    pub fn decode(buf: &[u8]) -> Option<Self> {
        // 最短记录: 头部 + 空 url + 三个整数 + crc。
        if buf.len() < 4 + 2 + 2 + 8 + 4 + 4 + 4 {
            return None;
        }
        let (body, crc_bytes) = buf.split_at(buf.len() - 4);
        let crc = u32::from_le_bytes(crc_bytes.try_into().ok()?);
        if crc32fast::hash(body) != crc {
            return None;
        }
        if &body[0..4] != MAGIC {
            return None;
        }
        if u16::from_le_bytes(body[4..6].try_into().ok()?) != VERSION {
            return None;
        }
        let url_len = u16::from_le_bytes(body[6..8].try_into().ok()?) as usize;
        let mut at = 8;
        let url = body.get(at..at + url_len)?;
        let url = FastStr::new(std::str::from_utf8(url).ok()?);
        at += url_len;
        let total_size = i64::from_le_bytes(body.get(at..at + 8)?.try_into().ok()?);
        at += 8;
        let piece_size = i32::from_le_bytes(body.get(at..at + 4)?.try_into().ok()?);
        at += 4;
        let piece_count = i32::from_le_bytes(body.get(at..at + 4)?.try_into().ok()?);
        at += 4;
        if piece_count < 0 || piece_size <= 0 || total_size < 0 {
            return None;
        }
        let bitmap_len = (piece_count as u64).div_ceil(8) as usize;
        if body.len() != at + bitmap_len {
            return None;
        }
        let bitmap = RangeField::from_bytes(&body[at..], piece_count as u64)?;
        Some(Self {
            url,
            total_size,
            piece_size,
            piece_count,
            bitmap,
        })
    }

    /// 从磁盘加载。文件不存在、不可读或损坏时返回 `None`, 交由
    /// 调用方决定是否从头开始。
    pub async fn load(path: &Path) -> Option<Self> {
        let buf = match tokio::fs::read(path).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("[Meta] 读取元数据文件失败: {e}, 将忽略续传状态");
                return None;
            }
        };
        let meta = Self::decode(&buf);
        if meta.is_none() {
            warn!("[Meta] 元数据文件校验失败, 已丢弃: {}", path.display());
        }
        meta
    }

    /// 原子写入: 先写同级临时文件, 再重命名覆盖。
    pub async fn store(&self, path: &Path) -> Result<()> {
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, self.encode()).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(
            "[Meta] 已写入元数据: {} ({}/{} 分片完成)",
            path.display(),
            self.bitmap.popcount(),
            self.piece_count
        );
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetaFile {
        let mut bitmap = RangeField::new(9);
        bitmap.mark(0);
        bitmap.mark(4);
        bitmap.mark(8);
        MetaFile {
            url: FastStr::new("http://example.com/file.bin"),
            total_size: 9 * 32768 - 100,
            piece_size: 32768,
            piece_count: 9,
            bitmap,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let meta = sample();
        let bytes = meta.encode();
        let back = MetaFile::decode(&bytes).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let meta = sample();
        let mut bytes = meta.encode();
        // 翻转 url 中的一个字节, CRC 必须拦下来。
        bytes[10] ^= 0xff;
        assert!(MetaFile::decode(&bytes).is_none());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let bytes = sample().encode();
        assert!(MetaFile::decode(&bytes[..bytes.len() - 1]).is_none());
        assert!(MetaFile::decode(&bytes[..10]).is_none());
        assert!(MetaFile::decode(&[]).is_none());
    }

    #[test]
    fn test_decode_rejects_bad_magic_and_version() {
        let meta = sample();
        let mut bytes = meta.encode();
        bytes[0] = b'X';
        let body_len = bytes.len() - 4;
        let crc = crc32fast::hash(&bytes[..body_len]);
        bytes[body_len..].copy_from_slice(&crc.to_le_bytes());
        assert!(MetaFile::decode(&bytes).is_none());
    }

    #[test]
    fn test_matches() {
        let meta = sample();
        assert!(meta.matches(
            "http://example.com/file.bin",
            9 * 32768 - 100,
            32768,
            9
        ));
        assert!(!meta.matches("http://example.com/other.bin", 9 * 32768 - 100, 32768, 9));
        assert!(!meta.matches("http://example.com/file.bin", 1, 32768, 9));
        assert!(!meta.matches("http://example.com/file.bin", 9 * 32768 - 100, 16384, 9));
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin.meta");
        let meta = sample();
        meta.store(&path).await.unwrap();
        let back = MetaFile::load(&path).await.unwrap();
        assert_eq!(meta, back);
        // 临时文件不应残留。
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MetaFile::load(&dir.path().join("absent.meta")).await.is_none());
    }
}
