//! 源目录遍历 - 对每个条目做决策并交给调度器

use crate::core::comparator::{Action, DecisionEngine, DirAction};
use crate::core::target::TouchedPaths;
use crate::core::transfer::BundleTransferManager;
use crate::error::{io_err, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 本地源条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub path: PathBuf,
    pub size: u64,
    pub is_dir: bool,
    /// 修改时间（Unix 秒）
    pub modified_time: i64,
}

impl SourceEntry {
    fn from_metadata(path: PathBuf, metadata: &std::fs::Metadata) -> Self {
        let modified_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let is_dir = metadata.is_dir();

        Self {
            path,
            size: if is_dir { 0 } else { metadata.len() },
            is_dir,
            modified_time,
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_err(path, e))?;
        Ok(Self::from_metadata(path.to_path_buf(), &metadata))
    }

    pub fn from_path_blocking(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
        Ok(Self::from_metadata(path.to_path_buf(), &metadata))
    }
}

/// 遍历统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub files_visited: u64,
    pub dirs_visited: u64,
    pub files_skipped: u64,
    pub dirs_created: u64,
    /// 因类型冲突被替换的目标
    pub replaced: u64,
}

/// 源目录遍历器
///
/// 单线程深度优先，遇到第一个错误立即返回。每个访问到的目标路径在任何后续
/// 操作之前写入 touched 集合。
pub struct TreeWalker<'a> {
    engine: &'a DecisionEngine,
    scheduler: &'a BundleTransferManager,
    touched: TouchedPaths,
    stats: WalkStats,
}

impl<'a> TreeWalker<'a> {
    pub fn new(engine: &'a DecisionEngine, scheduler: &'a BundleTransferManager) -> Self {
        let mut touched = TouchedPaths::new();
        // 目标根集合必须保留
        touched.mark(scheduler.mapper().target_root());
        Self {
            engine,
            scheduler,
            touched,
            stats: WalkStats::default(),
        }
    }

    /// 处理一个顶层源参数
    pub async fn put(&mut self, source: &Path) -> Result<()> {
        let entry = SourceEntry::from_path(source).await?;
        info!("处理源: {}", source.display());

        // 显式栈代替递归，子条目逆序入栈以保持按名称的深度优先顺序
        let mut stack = vec![entry];
        while let Some(entry) = stack.pop() {
            if entry.is_dir {
                let mut children = self.put_dir(&entry).await?;
                children.reverse();
                stack.extend(children);
            } else {
                self.put_file(&entry).await?;
            }
        }
        Ok(())
    }

    /// 处理目录本身，返回按名称排序的子条目
    async fn put_dir(&mut self, entry: &SourceEntry) -> Result<Vec<SourceEntry>> {
        self.stats.dirs_visited += 1;
        let target = self.scheduler.target_path_for(&entry.path)?;
        self.touched.mark(&target);

        match self.engine.decide_dir(entry, &target).await? {
            DirAction::Merge => {}
            DirAction::Create => {
                self.engine.create_collection(entry, &target).await?;
                self.stats.dirs_created += 1;
            }
            DirAction::ReplaceThenCreate => {
                self.engine.replace(&target, false).await?;
                self.stats.replaced += 1;
                self.engine.create_collection(entry, &target).await?;
                self.stats.dirs_created += 1;
            }
            DirAction::Conflict(e) => return Err(e),
        }

        list_children(&entry.path).await
    }

    async fn put_file(&mut self, entry: &SourceEntry) -> Result<()> {
        self.stats.files_visited += 1;
        let target = self.scheduler.target_path_for(&entry.path)?;
        self.touched.mark(&target);

        match self.engine.decide_file(entry, &target).await? {
            Action::Skip(reason) => {
                debug!("跳过 {} ({})", entry.path.display(), reason);
                self.stats.files_skipped += 1;
            }
            Action::Schedule => self.scheduler.schedule(entry).await?,
            Action::ReplaceThenSchedule => {
                self.engine.replace(&target, true).await?;
                self.stats.replaced += 1;
                self.scheduler.schedule(entry).await?;
            }
            Action::Conflict(e) => return Err(e),
        }
        Ok(())
    }

    pub fn touched(&self) -> &TouchedPaths {
        &self.touched
    }

    pub fn stats(&self) -> WalkStats {
        self.stats
    }

    pub fn into_parts(self) -> (TouchedPaths, WalkStats) {
        (self.touched, self.stats)
    }
}

/// 列出本地目录的子条目，按名称排序
async fn list_children(dir: &Path) -> Result<Vec<SourceEntry>> {
    let mut read_dir = tokio::fs::read_dir(dir).await.map_err(|e| io_err(dir, e))?;
    let mut children = Vec::new();

    while let Some(child) = read_dir.next_entry().await.map_err(|e| io_err(dir, e))? {
        children.push(SourceEntry::from_path(&child.path()).await?);
    }

    children.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BputConfig;
    use crate::core::checksum::FileHasher;
    use crate::core::prompt::ScriptedPrompter;
    use crate::core::report::MemoryReport;
    use crate::core::staging::StagingDirectory;
    use crate::core::target::TargetMapper;
    use crate::error::SyncError;
    use crate::storage::LocalRemoteFs;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        src: TempDir,
        remote: TempDir,
        temp: TempDir,
        report: Arc<MemoryReport>,
    }

    impl Fixture {
        fn new() -> Self {
            let src = TempDir::new().unwrap();
            std::fs::create_dir_all(src.path().join("data/sub")).unwrap();
            std::fs::write(src.path().join("data/a.txt"), b"a").unwrap();
            std::fs::write(src.path().join("data/sub/b.txt"), b"bb").unwrap();

            let remote = TempDir::new().unwrap();
            std::fs::create_dir_all(remote.path().join("zone/target")).unwrap();
            std::fs::create_dir_all(remote.path().join("zone/stage")).unwrap();

            Self {
                src,
                remote,
                temp: TempDir::new().unwrap(),
                report: Arc::new(MemoryReport::new()),
            }
        }

        fn parts(&self, config: BputConfig) -> (DecisionEngine, BundleTransferManager) {
            let mut config = config;
            config.bundle.local_temp_path = Some(self.temp.path().to_path_buf());
            let config = Arc::new(config);
            let fs = Arc::new(LocalRemoteFs::new(self.remote.path()).unwrap());

            let engine = DecisionEngine::new(
                config.clone(),
                fs.clone(),
                Arc::new(ScriptedPrompter::new(Vec::new())),
                Arc::new(FileHasher),
                self.report.clone(),
            );
            let staging = StagingDirectory {
                path: "/zone/stage".to_string(),
                created: false,
                safe: true,
                resource_affine: true,
            };
            let manager = BundleTransferManager::new(
                config,
                fs,
                self.report.clone(),
                TargetMapper::new(self.src.path(), "/zone/target"),
                &staging,
            );
            (engine, manager)
        }
    }

    #[tokio::test]
    async fn walk_creates_dirs_and_marks_everything() {
        let fx = Fixture::new();
        let (engine, mut manager) = fx.parts(BputConfig::default());
        manager.start();

        let (touched, stats) = {
            let mut walker = TreeWalker::new(&engine, &manager);
            walker.put(&fx.src.path().join("data")).await.unwrap();
            walker.into_parts()
        };
        manager.wait().await.unwrap();

        for p in [
            "/zone/target",
            "/zone/target/data",
            "/zone/target/data/a.txt",
            "/zone/target/data/sub",
            "/zone/target/data/sub/b.txt",
        ] {
            assert!(touched.contains(p), "{p}");
        }
        assert_eq!(stats.files_visited, 2);
        assert_eq!(stats.dirs_created, 2);
        assert_eq!(
            std::fs::read(fx.remote.path().join("zone/target/data/sub/b.txt")).unwrap(),
            b"bb"
        );

        let dir_records = fx
            .report
            .records()
            .into_iter()
            .filter(|r| r.has_note("directory"))
            .count();
        assert_eq!(dir_records, 2);
    }

    #[tokio::test]
    async fn existing_dir_is_merged_without_record() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.remote.path().join("zone/target/data/sub")).unwrap();
        let (engine, mut manager) = fx.parts(BputConfig::default());
        manager.start();

        let stats = {
            let mut walker = TreeWalker::new(&engine, &manager);
            walker.put(&fx.src.path().join("data")).await.unwrap();
            walker.stats()
        };
        manager.wait().await.unwrap();

        assert_eq!(stats.dirs_created, 0);
        assert!(!fx.report.records().iter().any(|r| r.has_note("directory")));
    }

    #[tokio::test]
    async fn conflict_aborts_walk_after_marking() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.remote.path().join("zone/target/data")).unwrap();
        // 远程同名位置是集合，源是文件
        std::fs::create_dir_all(fx.remote.path().join("zone/target/data/a.txt")).unwrap();
        let (engine, mut manager) = fx.parts(BputConfig::default());
        manager.start();

        let mut walker = TreeWalker::new(&engine, &manager);
        let err = walker.put(&fx.src.path().join("data")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFile(_)));
        assert!(walker.touched().contains("/zone/target/data/a.txt"));
        // 失败后不再处理后面的兄弟条目
        assert!(!walker.touched().contains("/zone/target/data/sub"));
        drop(walker);

        manager.wait().await.unwrap();
    }

    #[tokio::test]
    async fn file_replaced_by_directory_under_sync_force() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.remote.path().join("zone/target/data")).unwrap();
        std::fs::write(fx.remote.path().join("zone/target/data/sub"), b"file").unwrap();

        let mut config = BputConfig::default();
        config.mirror.sync = true;
        config.force = true;
        let (engine, mut manager) = fx.parts(config);
        manager.start();

        let stats = {
            let mut walker = TreeWalker::new(&engine, &manager);
            walker.put(&fx.src.path().join("data")).await.unwrap();
            walker.stats()
        };
        manager.wait().await.unwrap();

        assert_eq!(stats.replaced, 1);
        assert!(fx.remote.path().join("zone/target/data/sub/b.txt").is_file());
    }
}
