pub mod local;

use crate::core::checksum::ChecksumAlgorithm;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use local::LocalRemoteFs;

/// 默认存储资源名
pub const DEFAULT_RESOURCE: &str = "default";

/// 远程条目（集合或数据对象）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
    /// 服务端记录的校验和，可能没有
    pub checksum: Option<Vec<u8>>,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
}

/// 远程层级存储接口
///
/// 路径都是以 `/` 开头的绝对远程路径。每次查询都直接访问后端，不做缓存。
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// 获取条目信息，不存在返回 `None`
    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>>;

    /// 列出集合的直接子条目
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    async fn make_dir(&self, path: &str, recursive: bool) -> Result<()>;

    async fn remove_dir(&self, path: &str, recursive: bool, force: bool) -> Result<()>;

    async fn remove_file(&self, path: &str, force: bool) -> Result<()>;

    /// 上传单个本地文件
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// 服务端解包：把 tar 包 `archive` 展开到集合 `target` 下
    async fn extract_bundle(&self, archive: &str, target: &str, force: bool) -> Result<()>;

    /// 服务该路径的存储资源名
    async fn resource_of(&self, path: &str) -> Result<String>;

    /// 远程路径在本机上的别名（如果有）
    fn physical_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }

    /// 检查条目是否存在
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}
