//! 目标路径映射 - 本地源路径 -> 远程目标路径

use crate::error::{Result, SyncError};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// 规范化远程路径：相对路径基于 cwd 解析，折叠多余的 `/`、`.` 和 `..`
pub fn clean_remote_path(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd, path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }

    format!("/{}", parts.join("/"))
}

pub fn join_remote(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// 父路径，根路径没有父路径
pub fn parent_remote(path: &str) -> Option<&str> {
    if path == "/" || path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `path` 是否严格位于 `ancestor` 之下
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if path == ancestor {
        return false;
    }
    if ancestor == "/" {
        return path.starts_with('/');
    }
    path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/')
}

/// 路径深度（`/` 为 0）
pub fn depth(path: &str) -> usize {
    path.split('/').filter(|p| !p.is_empty()).count()
}

/// 本次运行触及的远程路径集合
///
/// 一个路径属于该集合，当且仅当本次运行希望它在结束后存在：已调度、已确认无需上传，
/// 或是前两者的上级集合。
#[derive(Debug, Default, Clone)]
pub struct TouchedPaths {
    paths: HashSet<String>,
}

impl TouchedPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// 标记路径及其所有上级路径
    pub fn mark(&mut self, path: &str) {
        let mut current = Some(path);
        while let Some(p) = current {
            if !self.paths.insert(p.to_string()) {
                // 上级已经标记过
                break;
            }
            current = parent_remote(p);
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// 计算打包根目录
///
/// `sources` 为 (绝对路径, 是否目录)。默认情况下取各源父目录的最深公共祖先，
/// 这样每个源以自己的名字出现在目标下；`no_root` 且唯一源是目录时，
/// 使用源目录本身，内容直接落在目标下。
pub fn bundle_root(sources: &[(PathBuf, bool)], no_root: bool) -> Result<PathBuf> {
    if sources.is_empty() {
        return Err(SyncError::InvalidArgument("没有源路径".to_string()));
    }

    if no_root {
        if sources.len() > 1 {
            return Err(SyncError::InvalidArgument(
                "不创建根目录时不能上传多个源".to_string(),
            ));
        }
        let (path, is_dir) = &sources[0];
        if *is_dir {
            return Ok(path.clone());
        }
    }

    let mut common: Option<PathBuf> = None;
    for (path, _) in sources {
        if !path.is_absolute() {
            return Err(SyncError::InvalidArgument(format!(
                "源路径必须是绝对路径: {}",
                path.display()
            )));
        }
        let parent = path.parent().unwrap_or(path).to_path_buf();
        common = Some(match common {
            None => parent,
            Some(c) => common_ancestor(&c, &parent),
        });
    }

    common.ok_or_else(|| SyncError::InvalidArgument("没有源路径".to_string()))
}

fn common_ancestor(a: &Path, b: &Path) -> PathBuf {
    a.components()
        .zip(b.components())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect()
}

/// 目标路径映射器
#[derive(Debug, Clone)]
pub struct TargetMapper {
    bundle_root: PathBuf,
    target_root: String,
}

impl TargetMapper {
    pub fn new(bundle_root: impl Into<PathBuf>, target_root: impl Into<String>) -> Self {
        Self {
            bundle_root: bundle_root.into(),
            target_root: target_root.into(),
        }
    }

    pub fn target_root(&self) -> &str {
        &self.target_root
    }

    pub fn bundle_root(&self) -> &Path {
        &self.bundle_root
    }

    /// 源路径对应的远程目标路径
    pub fn target_path_for(&self, source: &Path) -> Result<String> {
        let rel = self.relative_of(source)?;
        if rel.is_empty() {
            Ok(self.target_root.clone())
        } else {
            Ok(join_remote(&self.target_root, &rel))
        }
    }

    /// 源路径相对打包根目录的路径，以 `/` 分隔；同时也是它在 bundle 中的条目名
    pub fn relative_of(&self, source: &Path) -> Result<String> {
        let rel = source.strip_prefix(&self.bundle_root).map_err(|_| {
            SyncError::InvalidArgument(format!(
                "{} 不在打包根目录 {} 之下",
                source.display(),
                self.bundle_root.display()
            ))
        })?;

        let mut parts = Vec::new();
        for comp in rel.components() {
            match comp {
                Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(SyncError::InvalidArgument(format!(
                        "无法映射路径: {}",
                        source.display()
                    )))
                }
            }
        }

        Ok(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_remote_path_resolves_relative_and_dots() {
        assert_eq!(clean_remote_path("/zone/home/u", "data"), "/zone/home/u/data");
        assert_eq!(clean_remote_path("/zone/home/u", "./a//b/../c/"), "/zone/home/u/a/c");
        assert_eq!(clean_remote_path("/zone", "/abs/path"), "/abs/path");
        assert_eq!(clean_remote_path("/", ".."), "/");
    }

    #[test]
    fn parent_and_descendant() {
        assert_eq!(parent_remote("/a/b"), Some("/a"));
        assert_eq!(parent_remote("/a"), Some("/"));
        assert_eq!(parent_remote("/"), None);

        assert!(is_descendant("/a/b/c", "/a/b"));
        assert!(is_descendant("/a", "/"));
        assert!(!is_descendant("/a/bc", "/a/b"));
        assert!(!is_descendant("/a/b", "/a/b"));
    }

    #[test]
    fn mark_includes_all_ancestors() {
        let mut touched = TouchedPaths::new();
        touched.mark("/zone/home/u/target/dir/file.txt");

        for p in [
            "/zone/home/u/target/dir/file.txt",
            "/zone/home/u/target/dir",
            "/zone/home/u/target",
            "/zone",
            "/",
        ] {
            assert!(touched.contains(p), "{p} should be touched");
        }
        assert!(!touched.contains("/zone/home/u/target/other"));
    }

    #[test]
    fn bundle_root_keeps_source_names() {
        let root = bundle_root(&[(PathBuf::from("/data/src"), true)], false).unwrap();
        assert_eq!(root, PathBuf::from("/data"));

        let mapper = TargetMapper::new(root, "/zone/target");
        assert_eq!(
            mapper.target_path_for(Path::new("/data/src/a/b.txt")).unwrap(),
            "/zone/target/src/a/b.txt"
        );
    }

    #[test]
    fn bundle_root_no_root_flattens_directory() {
        let root = bundle_root(&[(PathBuf::from("/data/src"), true)], true).unwrap();
        let mapper = TargetMapper::new(root, "/zone/target");

        assert_eq!(mapper.target_path_for(Path::new("/data/src")).unwrap(), "/zone/target");
        assert_eq!(
            mapper.target_path_for(Path::new("/data/src/x.txt")).unwrap(),
            "/zone/target/x.txt"
        );
    }

    #[test]
    fn bundle_root_of_multiple_sources_is_common_parent() {
        let root = bundle_root(
            &[
                (PathBuf::from("/data/x"), true),
                (PathBuf::from("/data/y/z.txt"), false),
            ],
            false,
        )
        .unwrap();
        assert_eq!(root, PathBuf::from("/data"));
    }

    #[test]
    fn no_root_rejects_multiple_sources() {
        let err = bundle_root(
            &[(PathBuf::from("/a"), true), (PathBuf::from("/b"), true)],
            true,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[test]
    fn path_outside_bundle_root_is_rejected() {
        let mapper = TargetMapper::new("/data", "/zone/target");
        assert!(mapper.target_path_for(Path::new("/other/file")).is_err());
    }
}
