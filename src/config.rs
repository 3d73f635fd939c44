//! 应用配置模块

use crate::core::checksum::ChecksumAlgorithm;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// 每个包的文件数上限
pub const MAX_FILE_NUM: usize = 10_000;
/// 并行传输数上限，与 `MAX_FILE_NUM` 的乘积即调度通道容量
pub const MAX_THREAD_NUM: usize = 256;

/// 打包配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleConfig {
    /// 每个包的最少文件数，不足时逐个上传
    #[serde(default = "default_min_file_num")]
    pub min_file_num: usize,
    /// 每个包的最多文件数
    #[serde(default = "default_max_file_num")]
    pub max_file_num: usize,
    /// 每个包的最大字节数
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 本地打包临时目录
    #[serde(default)]
    pub local_temp_path: Option<PathBuf>,
    /// 远程暂存集合
    #[serde(default)]
    pub staging_path: Option<String>,
    /// 运行前清理残留的旧包
    #[serde(default)]
    pub clear_old: bool,
}

fn default_min_file_num() -> usize {
    3
}

fn default_max_file_num() -> usize {
    50
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024 * 1024 // 2GB
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            min_file_num: default_min_file_num(),
            max_file_num: default_max_file_num(),
            max_file_size: default_max_file_size(),
            local_temp_path: None,
            staging_path: None,
            clear_old: false,
        }
    }
}

/// 差异传输
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifferentialConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 只比较大小，不计算哈希（无法发现大小相同的内容变化）
    #[serde(default)]
    pub no_hash: bool,
}

/// 同步（镜像）选项
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    /// 类型冲突时允许替换目标
    #[serde(default)]
    pub sync: bool,
    /// 删除目标中多余的条目
    #[serde(default)]
    pub delete: bool,
}

/// 整体重试
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// 额外重试次数，0 表示不重试
    #[serde(default)]
    pub count: u32,
    #[serde(default = "default_retry_interval")]
    pub interval_secs: u64,
}

fn default_retry_interval() -> u64 {
    60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: 0,
            interval_secs: default_retry_interval(),
        }
    }
}

/// 传输报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub to_stdout: bool,
}

/// 目录型远程存储
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// 远程命名空间在本机上的根目录
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// 服务端记录的校验和算法
    #[serde(default)]
    pub checksum: Option<ChecksumAlgorithm>,
    /// 远程前缀 -> 存储资源名
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

/// bput 运行配置，解析完成后不再修改
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BputConfig {
    #[serde(default)]
    pub bundle: BundleConfig,
    /// 并行传输线程数
    #[serde(default = "default_thread_num")]
    pub thread_num: usize,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub differential: DifferentialConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    /// 不在目标下创建源目录本身
    #[serde(default)]
    pub no_root: bool,
    /// 上传成功后删除本地源
    #[serde(default)]
    pub delete_on_success: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub report: ReportConfig,
    /// 相对远程路径的基准
    #[serde(default = "default_remote_cwd")]
    pub remote_cwd: String,
    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_thread_num() -> usize {
    5
}

fn default_remote_cwd() -> String {
    "/".to_string()
}

impl Default for BputConfig {
    fn default() -> Self {
        Self {
            bundle: BundleConfig::default(),
            thread_num: default_thread_num(),
            force: false,
            differential: DifferentialConfig::default(),
            mirror: MirrorConfig::default(),
            no_root: false,
            delete_on_success: false,
            retry: RetryConfig::default(),
            report: ReportConfig::default(),
            remote_cwd: default_remote_cwd(),
            backend: BackendConfig::default(),
        }
    }
}

impl BputConfig {
    /// 从配置文件加载
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(bput_config) = config.get("bput") {
                        if let Ok(bput) = serde_json::from_value::<BputConfig>(bput_config.clone())
                        {
                            return bput;
                        }
                    }
                }
            }
        }
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.bundle.min_file_num == 0 {
            return Err(SyncError::Config("minFileNum 必须大于 0".to_string()));
        }
        if self.bundle.max_file_num < self.bundle.min_file_num {
            return Err(SyncError::Config(format!(
                "maxFileNum ({}) 小于 minFileNum ({})",
                self.bundle.max_file_num, self.bundle.min_file_num
            )));
        }
        if self.bundle.max_file_size == 0 {
            return Err(SyncError::Config("maxFileSize 必须大于 0".to_string()));
        }
        if self.bundle.max_file_num > MAX_FILE_NUM {
            return Err(SyncError::Config(format!(
                "maxFileNum ({}) 不能超过 {}",
                self.bundle.max_file_num, MAX_FILE_NUM
            )));
        }
        if self.thread_num == 0 {
            return Err(SyncError::Config("threadNum 必须大于 0".to_string()));
        }
        if self.thread_num > MAX_THREAD_NUM {
            return Err(SyncError::Config(format!(
                "threadNum ({}) 不能超过 {}",
                self.thread_num, MAX_THREAD_NUM
            )));
        }
        Ok(())
    }

    /// 本地打包目录
    pub fn local_temp_dir(&self) -> PathBuf {
        self.bundle.local_temp_path.clone().unwrap_or_else(|| {
            crate::dirs::cache_dir()
                .map(|p| p.join("bundlesync").join("bundles"))
                .unwrap_or_else(|| std::env::temp_dir().join("bundlesync"))
        })
    }
}
