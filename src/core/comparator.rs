//! 差异决策 - 针对单个源条目决定跳过、上传、替换或冲突

use crate::config::BputConfig;
use crate::core::checksum::LocalHasher;
use crate::core::prompt::Prompter;
use crate::core::report::{ReportSink, TransferMethod, TransferReportRecord};
use crate::core::walker::SourceEntry;
use crate::error::{Result, SyncError};
use crate::storage::{RemoteEntry, RemoteFs};
use std::sync::Arc;
use tracing::debug;

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 差异传输（no_hash）：大小相同
    SameSize,
    /// 差异传输：校验和相同
    SameChecksum,
    /// 用户拒绝覆盖
    Declined,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SameSize => write!(f, "same size"),
            SkipReason::SameChecksum => write!(f, "same checksum"),
            SkipReason::Declined => write!(f, "declined"),
        }
    }
}

/// 文件条目的决策结果
#[derive(Debug)]
pub enum Action {
    Skip(SkipReason),
    Schedule,
    /// 先删除目标处的集合，再调度上传
    ReplaceThenSchedule,
    Conflict(SyncError),
}

/// 目录条目的决策结果
#[derive(Debug)]
pub enum DirAction {
    /// 目标不存在，新建集合
    Create,
    /// 目标已是集合，合并进去
    Merge,
    /// 先删除目标处的数据对象，再新建集合
    ReplaceThenCreate,
    Conflict(SyncError),
}

/// 差异决策引擎
pub struct DecisionEngine {
    config: Arc<BputConfig>,
    fs: Arc<dyn RemoteFs>,
    prompter: Arc<dyn Prompter>,
    hasher: Arc<dyn LocalHasher>,
    report: Arc<dyn ReportSink>,
}

impl DecisionEngine {
    pub fn new(
        config: Arc<BputConfig>,
        fs: Arc<dyn RemoteFs>,
        prompter: Arc<dyn Prompter>,
        hasher: Arc<dyn LocalHasher>,
        report: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            config,
            fs,
            prompter,
            hasher,
            report,
        }
    }

    /// 对文件条目做决策
    pub async fn decide_file(&self, source: &SourceEntry, target_path: &str) -> Result<Action> {
        let target = match self
            .fs
            .stat(target_path)
            .await
            .map_err(|e| e.context(format!("stat {} 失败", target_path)))?
        {
            None => return Ok(Action::Schedule),
            Some(t) => t,
        };

        if target.is_dir {
            let question = format!("要上传文件到 {}，但该位置是集合。是否覆盖？", target_path);
            if self.allow_replace(&question) {
                return Ok(Action::ReplaceThenSchedule);
            }
            let error = self.report_conflict(source, &target, SyncError::NotFile(target_path.to_string()));
            return Ok(Action::Conflict(error));
        }

        if self.config.differential.enabled {
            // 大小不同必然重新上传，不计算哈希
            if target.size != source.size {
                debug!(
                    "文件大小不同: {} (src={}, dst={})",
                    source.path.display(),
                    source.size,
                    target.size
                );
                return Ok(Action::Schedule);
            }

            if self.config.differential.no_hash {
                self.report_skip(
                    source,
                    &target,
                    None,
                    &["differential", "no_hash", "same file size", "skip"],
                );
                debug!("跳过 {}: 目标已存在且大小相同", source.path.display());
                return Ok(Action::Skip(SkipReason::SameSize));
            }

            if let (Some(checksum), Some(algorithm)) = (&target.checksum, target.checksum_algorithm) {
                let local = self
                    .hasher
                    .hash_file(&source.path, algorithm)
                    .await
                    .map_err(|e| e.context(format!("计算 {} 的哈希失败", source.path.display())))?;

                if &local == checksum {
                    self.report_skip(
                        source,
                        &target,
                        Some(&local),
                        &["differential", "same checksum", "skip"],
                    );
                    debug!("跳过 {}: 目标已存在且校验和相同", source.path.display());
                    return Ok(Action::Skip(SkipReason::SameChecksum));
                }
                return Ok(Action::Schedule);
            }
            // 目标没有校验和，按普通覆盖规则处理
        }

        if self.config.force {
            return Ok(Action::Schedule);
        }

        let question = format!("数据对象 {} 已存在。是否覆盖？", target_path);
        if self.prompter.confirm(&question) {
            Ok(Action::Schedule)
        } else {
            self.report_skip(source, &target, None, &["no_overwrite", "skip"]);
            debug!("跳过 {}: 不覆盖已存在的数据对象", source.path.display());
            Ok(Action::Skip(SkipReason::Declined))
        }
    }

    /// 对目录条目做决策
    pub async fn decide_dir(&self, source: &SourceEntry, target_path: &str) -> Result<DirAction> {
        let target = match self
            .fs
            .stat(target_path)
            .await
            .map_err(|e| e.context(format!("stat {} 失败", target_path)))?
        {
            None => return Ok(DirAction::Create),
            Some(t) => t,
        };

        if target.is_dir {
            return Ok(DirAction::Merge);
        }

        let question = format!("要上传目录到 {}，但该位置是数据对象。是否覆盖？", target_path);
        if self.allow_replace(&question) {
            return Ok(DirAction::ReplaceThenCreate);
        }
        let error = self.report_conflict(source, &target, SyncError::NotDir(target_path.to_string()));
        Ok(DirAction::Conflict(error))
    }

    /// 删除与源类型冲突的目标
    pub async fn replace(&self, target_path: &str, target_is_dir: bool) -> Result<()> {
        let result = if target_is_dir {
            self.fs.remove_dir(target_path, true, true).await
        } else {
            self.fs.remove_file(target_path, true).await
        };

        let notes: &[&str] = if target_is_dir {
            &["overwrite", "put", "dir"]
        } else {
            &["overwrite", "put"]
        };
        self.report.append(
            TransferReportRecord::instant(TransferMethod::Delete, target_path)
                .with_notes(notes)
                .with_error(result.as_ref().err().map(|e| e.to_string())),
        );

        result.map_err(|e| e.context(format!("删除 {} 失败", target_path)))
    }

    /// 新建目标集合
    pub async fn create_collection(&self, source: &SourceEntry, target_path: &str) -> Result<()> {
        self.fs
            .make_dir(target_path, true)
            .await
            .map_err(|e| e.context(format!("创建集合 {} 失败", target_path)))?;

        let mut record = TransferReportRecord::instant(
            TransferMethod::Put,
            source.path.to_string_lossy(),
        )
        .with_notes(&["directory"]);
        record.dest_path = Some(target_path.to_string());
        self.report.append(record);
        Ok(())
    }

    /// sync+force 直接替换；sync 时询问；否则不允许
    fn allow_replace(&self, question: &str) -> bool {
        if !self.config.mirror.sync {
            return false;
        }
        self.config.force || self.prompter.confirm(question)
    }

    fn report_conflict(&self, source: &SourceEntry, target: &RemoteEntry, error: SyncError) -> SyncError {
        let mut record =
            TransferReportRecord::instant(TransferMethod::Put, source.path.to_string_lossy())
                .with_notes(&["conflict", "skip"])
                .with_error(Some(error.to_string()));
        record.source_size = Some(source.size);
        record.dest_path = Some(target.path.clone());
        record.dest_size = Some(target.size);
        self.report.append(record);
        error
    }

    fn report_skip(
        &self,
        source: &SourceEntry,
        target: &RemoteEntry,
        source_checksum: Option<&[u8]>,
        notes: &[&str],
    ) {
        let mut record =
            TransferReportRecord::instant(TransferMethod::Put, source.path.to_string_lossy())
                .with_notes(notes);
        record.source_size = Some(source.size);
        record.source_checksum = source_checksum.map(hex::encode);
        record.dest_path = Some(target.path.clone());
        record.dest_size = Some(target.size);
        record.dest_checksum = target.checksum.as_ref().map(hex::encode);
        record.checksum_algorithm = target.checksum_algorithm.map(|a| a.to_string());
        self.report.append(record);
    }
}
