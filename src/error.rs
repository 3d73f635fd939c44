//! 错误类型

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// 同步过程中的全部错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 路径不存在（本地源或远程目标）
    #[error("路径不存在: {0}")]
    NotFound(String),

    /// 期望集合（目录），实际是数据对象
    #[error("不是目录: {0}")]
    NotDir(String),

    /// 期望数据对象（文件），实际是集合
    #[error("不是文件: {0}")]
    NotFile(String),

    #[error("暂存路径 {0} 是文件")]
    StagingIsFile(String),

    #[error("暂存路径 {path} 不安全: {reason}")]
    UnsafeStagingPath { path: String, reason: String },

    #[error("暂存路径 {staging} 与目标 {target} 不在同一存储资源 ({staging_resource} != {target_resource})")]
    ResourceMismatch {
        staging: String,
        target: String,
        staging_resource: String,
        target_resource: String,
    },

    /// 本地 I/O 错误，附带路径
    #[error("本地 I/O 错误 {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 远程存储操作失败，附带远程路径
    #[error("远程操作失败 {path}: {source}")]
    Remote {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("计算校验和失败 {path}: {source}")]
    Checksum {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("打包失败 {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("调度器错误: {0}")]
    Scheduler(String),

    #[error("参数错误: {0}")]
    InvalidArgument(String),

    #[error("配置错误: {0}")]
    Config(String),

    /// 在层边界附加上下文（通常是出错的路径）
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// 包装上下文
    pub fn context(self, context: impl Into<String>) -> Self {
        SyncError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// 剥掉所有 Context 层，返回最内层错误
    pub fn root_cause(&self) -> &SyncError {
        let mut current = self;
        while let SyncError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), SyncError::NotFound(_))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

pub(crate) fn io_err(path: impl Into<PathBuf>, source: io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn remote_err(path: impl Into<String>, source: io::Error) -> SyncError {
    SyncError::Remote {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_nested_context() {
        let err = SyncError::NotFile("/zone/home/a".to_string())
            .context("处理 /tmp/a 失败")
            .context("bput 失败");

        assert!(matches!(err.root_cause(), SyncError::NotFile(p) if p == "/zone/home/a"));
        assert!(err.to_string().starts_with("bput 失败"));
    }

    #[test]
    fn not_found_detected_through_context() {
        let err = SyncError::NotFound("/x".into()).context("ctx");
        assert!(err.is_not_found());
        assert!(!SyncError::NotDir("/x".into()).is_not_found());
    }
}
