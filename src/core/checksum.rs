//! 校验和计算 - 用于差异传输

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const READ_BLOCK: usize = 64 * 1024;

/// 校验和算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    #[serde(rename = "sha2")]
    Sha256,
    Blake3,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
            ChecksumAlgorithm::Sha256 => write!(f, "sha2"),
            ChecksumAlgorithm::Blake3 => write!(f, "blake3"),
        }
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha2" | "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            "blake3" => Ok(ChecksumAlgorithm::Blake3),
            other => Err(SyncError::Config(format!("未知的校验和算法: {}", other))),
        }
    }
}

/// 按 64 KiB 分块读取，把每块交给 `update`
fn read_blocks(reader: &mut impl Read, mut update: impl FnMut(&[u8])) -> io::Result<()> {
    let mut buf = vec![0u8; READ_BLOCK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        update(&buf[..n]);
    }
}

/// 流式计算本地文件的校验和（阻塞调用）
pub fn hash_file_blocking(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;

    match algorithm {
        ChecksumAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            read_blocks(&mut file, |block| hasher.update(block))?;
            Ok(hasher.finalize().to_vec())
        }
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            read_blocks(&mut file, |block| hasher.update(block))?;
            Ok(hasher.finalize().to_vec())
        }
        ChecksumAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            read_blocks(&mut file, |block| {
                hasher.update(block);
            })?;
            Ok(hasher.finalize().as_bytes().to_vec())
        }
    }
}

/// 本地文件哈希接口
#[async_trait]
pub trait LocalHasher: Send + Sync {
    async fn hash_file(&self, path: &Path, algorithm: ChecksumAlgorithm) -> Result<Vec<u8>>;
}

/// 默认实现：在阻塞线程池中读取文件
#[derive(Debug, Default, Clone, Copy)]
pub struct FileHasher;

#[async_trait]
impl LocalHasher for FileHasher {
    async fn hash_file(&self, path: &Path, algorithm: ChecksumAlgorithm) -> Result<Vec<u8>> {
        let owned: PathBuf = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || hash_file_blocking(&owned, algorithm))
            .await
            .map_err(|e| SyncError::Scheduler(format!("哈希任务失败: {}", e)))?;

        result.map_err(|source| SyncError::Checksum {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn known_digests() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").expect("write");

        let md5 = hash_file_blocking(&path, ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(hex::encode(md5), "900150983cd24fb0d6963f7d28e17f72");

        let sha = hash_file_blocking(&path, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(
            hex::encode(sha),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let b3 = hash_file_blocking(&path, ChecksumAlgorithm::Blake3).unwrap();
        assert_eq!(b3, blake3::hash(b"abc").as_bytes().to_vec());
    }

    #[test]
    fn multi_block_files_hash_like_one_shot() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("big.bin");
        let content: Vec<u8> = (0..READ_BLOCK * 3 + 17).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).expect("write");

        let b3 = hash_file_blocking(&path, ChecksumAlgorithm::Blake3).unwrap();
        assert_eq!(b3, blake3::hash(&content).as_bytes().to_vec());

        let sha = hash_file_blocking(&path, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(sha, Sha256::digest(&content).to_vec());

        let md5 = hash_file_blocking(&path, ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(md5, Md5::digest(&content).to_vec());
    }

    #[test]
    fn algorithm_round_trips_through_str() {
        for algo in [
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Blake3,
        ] {
            let parsed: ChecksumAlgorithm = algo.to_string().parse().unwrap();
            assert_eq!(parsed, algo);
        }
        assert!("crc32".parse::<ChecksumAlgorithm>().is_err());
    }

    #[tokio::test]
    async fn missing_file_reports_checksum_error() {
        let dir = TempDir::new().expect("tempdir");
        let err = FileHasher
            .hash_file(&dir.path().join("nope"), ChecksumAlgorithm::Md5)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Checksum { .. }));
    }
}
