use super::{RemoteEntry, RemoteFs, DEFAULT_RESOURCE};
use crate::core::checksum::{hash_file_blocking, ChecksumAlgorithm};
use crate::core::target::{base_name, clean_remote_path, is_descendant};
use crate::error::{io_err, remote_err, Result, SyncError};
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// 以本地目录模拟的远程存储：集合对应目录，数据对象对应文件
pub struct LocalRemoteFs {
    base_path: PathBuf,
    name: String,
    checksum_algorithm: Option<ChecksumAlgorithm>,
    /// (远程前缀, 资源名)，按前缀长度降序
    resources: Vec<(String, String)>,
}

impl LocalRemoteFs {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path).map_err(|e| io_err(&base_path, e))?;
        }
        // 与规范化后的本地源路径比较时需要
        let base_path = std::fs::canonicalize(&base_path).map_err(|e| io_err(&base_path, e))?;
        let name = format!("local:{}", base_path.display());
        Ok(Self {
            base_path,
            name,
            checksum_algorithm: None,
            resources: Vec::new(),
        })
    }

    /// stat 时为数据对象计算校验和
    pub fn with_checksum(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.checksum_algorithm = Some(algorithm);
        self
    }

    /// 将远程前缀映射到存储资源
    pub fn with_resource(mut self, prefix: &str, resource: &str) -> Self {
        self.resources
            .push((clean_remote_path("/", prefix), resource.to_string()));
        self.resources.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let cleaned = clean_remote_path("/", path);
        let rel = cleaned.trim_start_matches('/');
        if rel.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(rel)
        }
    }

    async fn entry_from_metadata(
        &self,
        path: &str,
        full_path: &Path,
        metadata: &std::fs::Metadata,
        with_checksum: bool,
    ) -> Result<RemoteEntry> {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let is_dir = metadata.is_dir();
        let (checksum, checksum_algorithm) = match self.checksum_algorithm {
            Some(algo) if with_checksum && !is_dir => {
                let owned = full_path.to_path_buf();
                let digest = tokio::task::spawn_blocking(move || hash_file_blocking(&owned, algo))
                    .await
                    .map_err(|e| SyncError::Scheduler(format!("哈希任务失败: {}", e)))?
                    .map_err(|e| remote_err(path, e))?;
                (Some(digest), Some(algo))
            }
            _ => (None, None),
        };

        Ok(RemoteEntry {
            path: path.to_string(),
            name: base_name(path).to_string(),
            size: if is_dir { 0 } else { metadata.len() },
            modified_time: modified,
            is_dir,
            checksum,
            checksum_algorithm,
        })
    }
}

#[async_trait]
impl RemoteFs for LocalRemoteFs {
    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>> {
        let path = clean_remote_path("/", path);
        let full_path = self.resolve_path(&path);

        match fs::metadata(&full_path).await {
            Ok(metadata) => Ok(Some(
                self.entry_from_metadata(&path, &full_path, &metadata, true)
                    .await?,
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(remote_err(path, e)),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let path = clean_remote_path("/", path);
        let full_path = self.resolve_path(&path);

        let metadata = match fs::metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::NotFound(path));
            }
            Err(e) => return Err(remote_err(path, e)),
        };
        if !metadata.is_dir() {
            return Err(SyncError::NotDir(path));
        }

        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| remote_err(&path, e))?;
        let mut entries = Vec::new();
        while let Some(child) = dir.next_entry().await.map_err(|e| remote_err(&path, e))? {
            let child_name = child.file_name().to_string_lossy().into_owned();
            let child_path = crate::core::target::join_remote(&path, &child_name);
            let child_meta = child
                .metadata()
                .await
                .map_err(|e| remote_err(&child_path, e))?;
            // 列表不计算校验和，需要时由 stat 获取
            entries.push(
                self.entry_from_metadata(&child_path, &child.path(), &child_meta, false)
                    .await?,
            );
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn make_dir(&self, path: &str, recursive: bool) -> Result<()> {
        let full_path = self.resolve_path(path);
        let result = if recursive {
            fs::create_dir_all(&full_path).await
        } else {
            fs::create_dir(&full_path).await
        };
        result.map_err(|e| remote_err(path, e))
    }

    async fn remove_dir(&self, path: &str, recursive: bool, force: bool) -> Result<()> {
        let full_path = self.resolve_path(path);

        match fs::metadata(&full_path).await {
            Ok(m) if !m.is_dir() => return Err(SyncError::NotDir(path.to_string())),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound && force => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::NotFound(path.to_string()))
            }
            Err(e) => return Err(remote_err(path, e)),
        }

        let result = if recursive {
            fs::remove_dir_all(&full_path).await
        } else {
            fs::remove_dir(&full_path).await
        };
        result.map_err(|e| remote_err(path, e))
    }

    async fn remove_file(&self, path: &str, force: bool) -> Result<()> {
        let full_path = self.resolve_path(path);

        match fs::metadata(&full_path).await {
            Ok(m) if m.is_dir() => return Err(SyncError::NotFile(path.to_string())),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound && force => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::NotFound(path.to_string()))
            }
            Err(e) => return Err(remote_err(path, e)),
        }

        fs::remove_file(&full_path)
            .await
            .map_err(|e| remote_err(path, e))
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let full_path = self.resolve_path(remote);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| remote_err(remote, e))?;
        }

        // 先写临时文件，再原子重命名
        let temp_path = full_path.with_file_name(format!(".{}.part", base_name(remote)));
        let result = match fs::copy(local, &temp_path).await {
            Ok(_) => fs::rename(&temp_path, &full_path)
                .await
                .map_err(|e| remote_err(remote, e)),
            Err(e) => Err(io_err(local, e)),
        };

        // 失败时不能把临时文件留在远程命名空间里
        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn extract_bundle(&self, archive: &str, target: &str, force: bool) -> Result<()> {
        let archive_path = self.resolve_path(archive);
        let target_path = self.resolve_path(target);
        let archive_remote = archive.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::open(&archive_path)
                .map_err(|e| remote_err(&archive_remote, e))?;
            let mut tar = tar::Archive::new(file);
            tar.set_overwrite(force);

            let entries = tar.entries().map_err(|e| remote_err(&archive_remote, e))?;
            for entry in entries {
                let mut entry = entry.map_err(|e| remote_err(&archive_remote, e))?;
                let rel = entry
                    .path()
                    .map_err(|e| remote_err(&archive_remote, e))?
                    .into_owned();
                if rel.components().any(|c| matches!(c, Component::ParentDir)) {
                    return Err(remote_err(
                        &archive_remote,
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("包内条目包含上级路径: {}", rel.display()),
                        ),
                    ));
                }
                entry
                    .unpack_in(&target_path)
                    .map_err(|e| remote_err(&archive_remote, e))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| SyncError::Scheduler(format!("解包任务失败: {}", e)))?
    }

    async fn resource_of(&self, path: &str) -> Result<String> {
        let path = clean_remote_path("/", path);
        let resource = self
            .resources
            .iter()
            .find(|(prefix, _)| path == *prefix || is_descendant(&path, prefix))
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| DEFAULT_RESOURCE.to_string());
        Ok(resource)
    }

    fn physical_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.resolve_path(path))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
