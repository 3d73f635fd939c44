//! 打包 - 把一组小文件打成 tar 包，以及残留包的清理

use crate::core::target::join_remote;
use crate::error::{io_err, Result, SyncError};
use crate::storage::RemoteFs;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const BUNDLE_PREFIX: &str = "bundle_";
const BUNDLE_EXT: &str = ".tar";

/// 已调度、等待打包的单个文件
#[derive(Debug, Clone)]
pub struct BundleEntry {
    pub source: PathBuf,
    /// 远程目标路径
    pub target: String,
    /// 包内条目名，相对目标根集合
    pub entry_name: String,
    pub size: u64,
}

/// 一个打包批次
#[derive(Debug, Default)]
pub struct Bundle {
    entries: Vec<BundleEntry>,
    size: u64,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 累计字节数
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn push(&mut self, entry: BundleEntry) {
        self.size += entry.size;
        self.entries.push(entry);
    }

    /// 加入 `size` 字节后是否超过上限（空包总能接收）
    pub fn would_overflow(&self, size: u64, max_size: u64) -> bool {
        !self.is_empty() && self.size.saturating_add(size) > max_size
    }

    pub fn is_full(&self, max_num: usize, max_size: u64) -> bool {
        self.entries.len() >= max_num || self.size >= max_size
    }

    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    /// 取出当前内容，留下空包
    pub fn take(&mut self) -> Bundle {
        std::mem::take(self)
    }
}

/// 新包的文件名
pub fn bundle_file_name() -> String {
    format!("{}{}{}", BUNDLE_PREFIX, uuid::Uuid::new_v4(), BUNDLE_EXT)
}

pub fn is_bundle_file_name(name: &str) -> bool {
    name.starts_with(BUNDLE_PREFIX) && name.ends_with(BUNDLE_EXT)
}

/// 写 tar 包（阻塞）
pub fn pack_bundle_blocking(entries: &[BundleEntry], archive: &Path) -> Result<()> {
    let archive_err = |source| SyncError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let file = File::create(archive).map_err(archive_err)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder.follow_symlinks(true);

    for entry in entries {
        builder
            .append_path_with_name(&entry.source, &entry.entry_name)
            .map_err(|e| io_err(&entry.source, e))?;
    }

    let writer = builder.into_inner().map_err(archive_err)?;
    let file = writer
        .into_inner()
        .map_err(|e| archive_err(e.into_error()))?;
    file.sync_all().map_err(archive_err)?;

    debug!("打包完成: {} ({} 个文件)", archive.display(), entries.len());
    Ok(())
}

/// 在阻塞线程上写 tar 包
pub async fn pack_bundle(entries: Vec<BundleEntry>, archive: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || pack_bundle_blocking(&entries, &archive))
        .await
        .map_err(|e| SyncError::Scheduler(format!("打包任务异常退出: {}", e)))?
}

/// 清理本地临时目录中的旧包
pub fn clean_up_old_local_bundles(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            io_err(path, e.into())
        })?;

        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !is_bundle_file_name(&name) {
            continue;
        }

        std::fs::remove_file(entry.path()).map_err(|e| io_err(entry.path(), e))?;
        debug!("删除本地旧包: {}", entry.path().display());
        removed += 1;
    }

    if removed > 0 {
        info!("已清理 {} 个本地旧包 ({})", removed, dir.display());
    }
    Ok(removed)
}

/// 清理暂存集合中的旧包
pub async fn clean_up_old_remote_bundles(fs: &dyn RemoteFs, staging: &str) -> Result<usize> {
    let entries = match fs.list(staging).await {
        Ok(entries) => entries,
        Err(e) if e.is_not_found() => return Ok(0),
        Err(e) => return Err(e.context(format!("列出暂存集合 {} 失败", staging))),
    };

    let mut removed = 0;
    for entry in entries {
        if entry.is_dir || !is_bundle_file_name(&entry.name) {
            continue;
        }
        let path = join_remote(staging, &entry.name);
        match fs.remove_file(&path, true).await {
            Ok(()) => {
                debug!("删除暂存旧包: {}", path);
                removed += 1;
            }
            Err(e) => warn!("删除暂存旧包 {} 失败: {}", path, e),
        }
    }

    if removed > 0 {
        info!("已清理 {} 个暂存旧包 ({})", removed, staging);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalRemoteFs;
    use tempfile::TempDir;

    fn entry(dir: &Path, rel: &str, content: &[u8]) -> BundleEntry {
        let source = dir.join(rel);
        if let Some(parent) = source.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&source, content).unwrap();
        BundleEntry {
            source,
            target: format!("/t/{}", rel),
            entry_name: rel.to_string(),
            size: content.len() as u64,
        }
    }

    #[test]
    fn bundle_limits() {
        let mut bundle = Bundle::new();
        assert!(!bundle.would_overflow(100, 10));

        bundle.push(BundleEntry {
            source: PathBuf::from("/a"),
            target: "/t/a".into(),
            entry_name: "a".into(),
            size: 6,
        });
        assert!(bundle.would_overflow(5, 10));
        assert!(!bundle.would_overflow(4, 10));
        assert!(bundle.is_full(1, 100));
        assert!(!bundle.is_full(2, 100));
        assert!(bundle.is_full(2, 6));

        let taken = bundle.take();
        assert_eq!(taken.len(), 1);
        assert!(bundle.is_empty());
        assert_eq!(bundle.size(), 0);
    }

    #[test]
    fn packed_archive_holds_relative_names() {
        let src = TempDir::new().unwrap();
        let entries = vec![
            entry(src.path(), "a.txt", b"aaa"),
            entry(src.path(), "sub/b.txt", b"bbbb"),
        ];
        let archive = src.path().join("out").join(bundle_file_name());

        pack_bundle_blocking(&entries, &archive).unwrap();

        let mut names: Vec<String> = tar::Archive::new(File::open(&archive).unwrap())
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "sub/b.txt"]);
    }

    #[test]
    fn local_cleanup_only_removes_bundles() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bundle_1.tar"), b"x").unwrap();
        std::fs::write(dir.path().join("keep.tar"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("bundle_dir.tar")).unwrap();

        assert_eq!(clean_up_old_local_bundles(dir.path()).unwrap(), 1);
        assert!(!dir.path().join("bundle_1.tar").exists());
        assert!(dir.path().join("keep.tar").exists());
        assert!(dir.path().join("bundle_dir.tar").exists());

        assert_eq!(clean_up_old_local_bundles(&dir.path().join("missing")).unwrap(), 0);
    }

    #[tokio::test]
    async fn remote_cleanup_only_removes_bundles() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("zone/stage")).unwrap();
        std::fs::write(dir.path().join("zone/stage/bundle_x.tar"), b"x").unwrap();
        std::fs::write(dir.path().join("zone/stage/other"), b"x").unwrap();
        let fs = LocalRemoteFs::new(dir.path()).unwrap();

        assert_eq!(clean_up_old_remote_bundles(&fs, "/zone/stage").await.unwrap(), 1);
        assert!(dir.path().join("zone/stage/other").exists());
        assert_eq!(clean_up_old_remote_bundles(&fs, "/zone/missing").await.unwrap(), 0);
    }
}
