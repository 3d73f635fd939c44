//! 暂存集合选择与安全校验

use crate::core::target::{depth, is_descendant, join_remote, parent_remote};
use crate::error::{Result, SyncError};
use crate::storage::RemoteFs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 默认暂存集合名，位于目标的上级集合中
pub const STAGING_DIR_NAME: &str = ".bundlesync_staging";

/// 暂存路径至少的层级，避免落在命名空间顶层
const MIN_STAGING_DEPTH: usize = 2;

/// 解析后的暂存集合，调度开始后不再变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingDirectory {
    pub path: String,
    /// 本次解析时新建
    pub created: bool,
    pub safe: bool,
    /// 与目标由同一存储资源服务
    pub resource_affine: bool,
}

/// 由目标路径确定性地推导默认暂存路径
pub fn default_staging_path(target: &str) -> String {
    let parent = parent_remote(target).unwrap_or("/");
    join_remote(parent, STAGING_DIR_NAME)
}

/// 暂存集合解析器
pub struct StagingResolver {
    fs: Arc<dyn RemoteFs>,
    /// 本地源根目录（已规范化）
    source_roots: Vec<PathBuf>,
}

impl StagingResolver {
    pub fn new(fs: Arc<dyn RemoteFs>, source_roots: Vec<PathBuf>) -> Self {
        Self { fs, source_roots }
    }

    /// 选择暂存集合
    ///
    /// 用户指定的路径不安全或与目标不在同一资源时，回退到默认路径；
    /// 默认路径不安全则直接失败。
    pub async fn resolve(&self, target: &str, user_path: Option<&str>) -> Result<StagingDirectory> {
        if let Some(staging) = user_path {
            let existing = self
                .fs
                .stat(staging)
                .await
                .map_err(|e| e.context(format!("stat 暂存路径 {} 失败", staging)))?;

            if let Some(entry) = &existing {
                if !entry.is_dir {
                    return Err(SyncError::StagingIsFile(staging.to_string()));
                }
            }

            debug!("校验暂存路径: {}", staging);
            if let Err(e) = self.check_safety(staging, target) {
                warn!("{}，改用默认暂存路径", e);
                return self.use_default(target).await;
            }

            let created = existing.is_none();
            if created {
                self.fs
                    .make_dir(staging, true)
                    .await
                    .map_err(|e| e.context(format!("创建暂存集合 {} 失败", staging)))?;
            }

            match self.check_affinity(staging, target).await {
                Ok(()) => {
                    info!("使用暂存路径 {} (目标 {})", staging, target);
                    return Ok(StagingDirectory {
                        path: staging.to_string(),
                        created,
                        safe: true,
                        resource_affine: true,
                    });
                }
                Err(e) => {
                    warn!("{}，改用默认暂存路径", e);
                    if created {
                        self.rollback(staging).await;
                    }
                    return self.use_default(target).await;
                }
            }
        }

        self.use_default(target).await
    }

    async fn use_default(&self, target: &str) -> Result<StagingDirectory> {
        let staging = default_staging_path(target);
        self.check_safety(&staging, target)?;

        let created = !self.fs.exists(&staging).await?;
        self.fs
            .make_dir(&staging, true)
            .await
            .map_err(|e| e.context(format!("创建暂存集合 {} 失败", staging)))?;

        let resource_affine = self.check_affinity(&staging, target).await.is_ok();
        info!("使用默认暂存路径 {} (目标 {})", staging, target);

        Ok(StagingDirectory {
            path: staging,
            created,
            safe: true,
            resource_affine,
        })
    }

    /// 暂存路径不能是目标或其上级，不能在目标之下（对账时会被清理），
    /// 也不能与本地源目录互相包含
    pub fn check_safety(&self, staging: &str, target: &str) -> Result<()> {
        let unsafe_path = |reason: &str| SyncError::UnsafeStagingPath {
            path: staging.to_string(),
            reason: reason.to_string(),
        };

        if depth(staging) < MIN_STAGING_DEPTH {
            return Err(unsafe_path("层级太浅"));
        }
        if staging == target {
            return Err(unsafe_path("与目标相同"));
        }
        if is_descendant(target, staging) {
            return Err(unsafe_path("是目标的上级集合"));
        }
        if is_descendant(staging, target) {
            return Err(unsafe_path("位于目标之下"));
        }

        if let Some(physical) = self.fs.physical_path(staging) {
            for root in &self.source_roots {
                if physical.starts_with(root) || root.starts_with(&physical) {
                    return Err(unsafe_path(&format!("与本地源 {} 重叠", root.display())));
                }
            }
        }

        Ok(())
    }

    async fn check_affinity(&self, staging: &str, target: &str) -> Result<()> {
        let staging_resource = self.fs.resource_of(staging).await?;
        let target_resource = self.fs.resource_of(target).await?;

        if staging_resource != target_resource {
            return Err(SyncError::ResourceMismatch {
                staging: staging.to_string(),
                target: target.to_string(),
                staging_resource,
                target_resource,
            });
        }
        Ok(())
    }

    async fn rollback(&self, staging: &str) {
        if let Err(e) = self.fs.remove_dir(staging, true, true).await {
            warn!("删除新建的暂存集合 {} 失败: {}", staging, e);
        }
    }
}
