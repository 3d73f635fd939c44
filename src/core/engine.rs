//! bput 引擎 - 串起暂存解析、遍历调度、等待和对账

use crate::config::BputConfig;
use crate::core::bundle::{clean_up_old_local_bundles, clean_up_old_remote_bundles};
use crate::core::checksum::{FileHasher, LocalHasher};
use crate::core::comparator::DecisionEngine;
use crate::core::prompt::{NonInteractivePrompter, Prompter};
use crate::core::reconcile::Reconciler;
use crate::core::report::{NullReport, ReportSink};
use crate::core::staging::StagingResolver;
use crate::core::target::{bundle_root, clean_remote_path, TargetMapper};
use crate::core::transfer::BundleTransferManager;
use crate::core::walker::TreeWalker;
use crate::error::{io_err, Result, SyncError};
use crate::storage::RemoteFs;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 一次运行的汇总
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub target: String,
    pub staging: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub files_visited: u64,
    pub files_scheduled: u64,
    pub files_skipped: u64,
    pub files_transferred: u64,
    pub dirs_created: u64,
    pub replaced: u64,
    pub deleted: u64,
    pub bundles: u64,
    pub individual_uploads: u64,
    pub bytes_transferred: u64,
    /// 毫秒
    pub duration: u64,
    /// 第几次尝试成功（从 1 开始）
    pub attempts: u32,
}

/// bput 引擎
pub struct BputEngine {
    config: Arc<BputConfig>,
    fs: Arc<dyn RemoteFs>,
    report: Arc<dyn ReportSink>,
    prompter: Arc<dyn Prompter>,
    hasher: Arc<dyn LocalHasher>,
}

impl BputEngine {
    pub fn new(config: BputConfig, fs: Arc<dyn RemoteFs>) -> Self {
        Self {
            config: Arc::new(config),
            fs,
            report: Arc::new(NullReport),
            prompter: Arc::new(NonInteractivePrompter),
            hasher: Arc::new(FileHasher),
        }
    }

    pub fn with_report(mut self, report: Arc<dyn ReportSink>) -> Self {
        self.report = report;
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn LocalHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn config(&self) -> &BputConfig {
        &self.config
    }

    /// 执行一次
    pub async fn run(&self, sources: &[PathBuf], target: &str) -> Result<SyncReport> {
        self.run_once(sources, target, self.prompter.clone()).await
    }

    /// 失败后整体重试，重试时不再交互
    pub async fn run_with_retry(&self, sources: &[PathBuf], target: &str) -> Result<SyncReport> {
        let max_retries = self.config.retry.count;
        let interval = Duration::from_secs(self.config.retry.interval_secs);
        let mut prompter = self.prompter.clone();
        let mut attempt = 0;

        loop {
            match self.run_once(sources, target, prompter.clone()).await {
                Ok(mut report) => {
                    report.attempts = attempt + 1;
                    return Ok(report);
                }
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        "bput 失败，{} 秒后重试 ({}/{}): {}",
                        interval.as_secs(),
                        attempt,
                        max_retries,
                        e
                    );
                    tokio::time::sleep(interval).await;
                    prompter = Arc::new(NonInteractivePrompter);
                }
                Err(e) => {
                    if max_retries > 0 {
                        error!("bput 最终失败 (已重试{}次): {}", max_retries, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn run_once(
        &self,
        sources: &[PathBuf],
        target: &str,
        prompter: Arc<dyn Prompter>,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        let start_time = Utc::now();
        self.config.validate()?;

        let sources = resolve_sources(sources).await?;
        let root = bundle_root(&sources, self.config.no_root)?;
        let source_roots: Vec<PathBuf> = sources.iter().map(|(p, _)| p.clone()).collect();

        let target = clean_remote_path(&self.config.remote_cwd, target);
        self.ensure_target_is_dir(&target).await?;

        if self.config.bundle.clear_old {
            let dir = self.config.local_temp_dir();
            clean_up_old_local_bundles(&dir)
                .map_err(|e| e.context(format!("清理本地旧包 {} 失败", dir.display())))?;
        }

        let user_staging = self
            .config
            .bundle
            .staging_path
            .as_deref()
            .map(|p| clean_remote_path(&self.config.remote_cwd, p));
        let staging = StagingResolver::new(self.fs.clone(), source_roots.clone())
            .resolve(&target, user_staging.as_deref())
            .await?;

        if self.config.bundle.clear_old {
            clean_up_old_remote_bundles(self.fs.as_ref(), &staging.path)
                .await
                .map_err(|e| e.context(format!("清理暂存旧包 {} 失败", staging.path)))?;
        }

        info!(
            "bput: {} 个源 -> {} (打包根目录 {}, 暂存 {})",
            sources.len(),
            target,
            root.display(),
            staging.path
        );

        let engine = DecisionEngine::new(
            self.config.clone(),
            self.fs.clone(),
            prompter,
            self.hasher.clone(),
            self.report.clone(),
        );
        let mut manager = BundleTransferManager::new(
            self.config.clone(),
            self.fs.clone(),
            self.report.clone(),
            TargetMapper::new(root, target.clone()),
            &staging,
        );
        manager.start();

        let walked = {
            let mut walker = TreeWalker::new(&engine, &manager);
            let mut result = Ok(());
            for (source, _) in &sources {
                if let Err(e) = walker.put(source).await {
                    result = Err(e.context(format!(
                        "上传 {} 到 {} 失败",
                        source.display(),
                        target
                    )));
                    break;
                }
            }
            result.map(|()| walker.into_parts())
        };

        manager.done_scheduling();
        let waited = manager.wait().await;
        let (touched, walk_stats) = match walked {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(wait_err) = waited {
                    warn!("遍历失败后等待传输也失败: {}", wait_err);
                }
                return Err(e);
            }
        };
        waited.map_err(|e| e.context("打包传输失败"))?;

        if self.config.delete_on_success {
            for (source, is_dir) in &sources {
                info!("上传成功，删除源 {}", source.display());
                delete_source(source, *is_dir)
                    .await
                    .map_err(|e| e.context(format!("删除源 {} 失败", source.display())))?;
            }
        }

        let mut deleted = 0;
        if self.config.mirror.delete {
            info!("删除 {} 下的多余条目", target);
            deleted = Reconciler::new(self.fs.clone(), self.report.clone())
                .reconcile(&target, &touched)
                .await
                .map_err(|e| e.context("删除多余条目失败"))?;
        }

        let transfer = manager.stats();
        let report = SyncReport {
            target,
            staging: staging.path,
            start_time: Some(start_time),
            end_time: Some(Utc::now()),
            files_visited: walk_stats.files_visited,
            files_scheduled: transfer.files_scheduled,
            files_skipped: walk_stats.files_skipped,
            files_transferred: transfer.files_transferred,
            dirs_created: walk_stats.dirs_created,
            replaced: walk_stats.replaced,
            deleted,
            bundles: transfer.bundles,
            individual_uploads: transfer.individual_uploads,
            bytes_transferred: transfer.bytes_transferred,
            duration: started.elapsed().as_millis() as u64,
            attempts: 1,
        };

        info!(
            "bput 完成: 调度 {} 个, 跳过 {} 个, 删除 {} 个, {} 个包, 耗时 {}ms",
            report.files_scheduled,
            report.files_skipped,
            report.deleted,
            report.bundles,
            report.duration
        );
        Ok(report)
    }

    async fn ensure_target_is_dir(&self, target: &str) -> Result<()> {
        match self
            .fs
            .stat(target)
            .await
            .map_err(|e| e.context(format!("stat {} 失败", target)))?
        {
            None => Err(SyncError::NotFound(target.to_string())),
            Some(entry) if !entry.is_dir => Err(SyncError::NotDir(target.to_string())),
            Some(_) => Ok(()),
        }
    }
}

/// 规范化本地源路径，同时确认存在
async fn resolve_sources(sources: &[PathBuf]) -> Result<Vec<(PathBuf, bool)>> {
    if sources.is_empty() {
        return Err(SyncError::InvalidArgument("没有源路径".to_string()));
    }

    let mut resolved = Vec::with_capacity(sources.len());
    for source in sources {
        let path = match tokio::fs::canonicalize(source).await {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::NotFound(source.display().to_string()));
            }
            Err(e) => return Err(io_err(source, e)),
        };
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        resolved.push((path, metadata.is_dir()));
    }
    Ok(resolved)
}

async fn delete_source(path: &Path, is_dir: bool) -> Result<()> {
    let result = if is_dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    result.map_err(|e| io_err(path, e))
}
