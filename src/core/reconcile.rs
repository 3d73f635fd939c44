//! 对账 - 删除目标中本次运行没有触及的条目

use crate::core::report::{ReportSink, TransferMethod, TransferReportRecord};
use crate::core::target::{join_remote, TouchedPaths};
use crate::error::Result;
use crate::storage::RemoteFs;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Reconciler {
    fs: Arc<dyn RemoteFs>,
    report: Arc<dyn ReportSink>,
}

impl Reconciler {
    pub fn new(fs: Arc<dyn RemoteFs>, report: Arc<dyn ReportSink>) -> Self {
        Self { fs, report }
    }

    /// 遍历目标子树，删除不在 `touched` 中的条目，返回删除的条目数
    ///
    /// 只能在调度器 `wait()` 成功返回之后调用。删除失败时先写报告再返回错误。
    pub async fn reconcile(&self, target_root: &str, touched: &TouchedPaths) -> Result<u64> {
        info!("开始删除多余条目: {}", target_root);

        let mut deleted = 0;
        let mut pending = vec![target_root.to_string()];

        while let Some(dir) = pending.pop() {
            let children = self
                .fs
                .list(&dir)
                .await
                .map_err(|e| e.context(format!("列出 {} 失败", dir)))?;

            for child in children {
                let path = join_remote(&dir, &child.name);

                if touched.contains(&path) {
                    if child.is_dir {
                        pending.push(path);
                    }
                    continue;
                }

                self.delete_extra(&path, child.is_dir).await?;
                deleted += 1;
            }
        }

        info!("删除多余条目完成: {} 个", deleted);
        Ok(deleted)
    }

    async fn delete_extra(&self, path: &str, is_dir: bool) -> Result<()> {
        debug!("删除多余条目: {}", path);

        let (result, notes): (Result<()>, &[&str]) = if is_dir {
            (
                self.fs.remove_dir(path, true, true).await,
                &["extra", "put", "dir"],
            )
        } else {
            (self.fs.remove_file(path, true).await, &["extra", "put"])
        };

        self.report.append(
            TransferReportRecord::instant(TransferMethod::Delete, path)
                .with_notes(notes)
                .with_error(result.as_ref().err().map(|e| e.to_string())),
        );

        result.map_err(|e| e.context(format!("删除多余条目 {} 失败", path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::MemoryReport;
    use crate::storage::LocalRemoteFs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<LocalRemoteFs>, Arc<MemoryReport>) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("zone/target");
        std::fs::create_dir_all(root.join("keep/old")).unwrap();
        std::fs::create_dir_all(root.join("extra_dir/deep")).unwrap();
        std::fs::write(root.join("keep/a.txt"), b"a").unwrap();
        std::fs::write(root.join("keep/old/stale.txt"), b"s").unwrap();
        std::fs::write(root.join("extra_dir/deep/x.txt"), b"x").unwrap();
        std::fs::write(root.join("b.txt"), b"b").unwrap();

        let fs = Arc::new(LocalRemoteFs::new(dir.path()).unwrap());
        (dir, fs, Arc::new(MemoryReport::new()))
    }

    #[tokio::test]
    async fn removes_exactly_untouched_entries() {
        let (dir, fs, report) = setup();
        let mut touched = TouchedPaths::new();
        touched.mark("/zone/target/keep/a.txt");
        touched.mark("/zone/target/b.txt");

        let deleted = Reconciler::new(fs, report.clone())
            .reconcile("/zone/target", &touched)
            .await
            .unwrap();

        let root = dir.path().join("zone/target");
        assert_eq!(deleted, 2);
        assert!(root.join("keep/a.txt").is_file());
        assert!(root.join("b.txt").is_file());
        // 保留的集合下多余的子条目也会被删除
        assert!(!root.join("keep/old").exists());
        assert!(!root.join("extra_dir").exists());

        let records = report.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.method == TransferMethod::Delete));
        assert!(records.iter().all(|r| r.has_note("extra") && r.has_note("dir")));
    }

    #[tokio::test]
    async fn nothing_to_do_when_all_touched() {
        let (_dir, fs, report) = setup();
        let mut touched = TouchedPaths::new();
        for p in [
            "/zone/target/keep/a.txt",
            "/zone/target/keep/old/stale.txt",
            "/zone/target/extra_dir/deep/x.txt",
            "/zone/target/b.txt",
        ] {
            touched.mark(p);
        }

        let deleted = Reconciler::new(fs, report.clone())
            .reconcile("/zone/target", &touched)
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert!(report.records().is_empty());
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let (_dir, fs, report) = setup();
        let result = Reconciler::new(fs, report)
            .reconcile("/zone/missing", &TouchedPaths::new())
            .await;
        assert!(result.unwrap_err().is_not_found());
    }
}
