use anyhow::{anyhow, Context, Result};
use bundlesync_lib::config::BputConfig;
use bundlesync_lib::core::{
    BputEngine, ChecksumAlgorithm, JsonLinesReport, NullReport, Prompter, ReportSink,
    TerminalPrompter,
};
use bundlesync_lib::logging::{get_config_dir, get_log_dir, LogConfig, SizeRotatingWriter};
use bundlesync_lib::storage::LocalRemoteFs;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

/// 把本地目录树打包上传到远程集合
#[derive(Parser, Debug)]
#[command(name = "bundlesync", version, about, long_about = None)]
struct Cli {
    /// 本地源路径（可多个），最后一个参数是远程目标集合
    #[arg(required = true, num_args = 2..)]
    paths: Vec<String>,

    /// 远程命名空间在本机上的根目录
    #[arg(long)]
    remote_root: Option<PathBuf>,

    /// 相对远程路径的基准集合
    #[arg(long)]
    cwd: Option<String>,

    /// 配置目录（包含 config.json）
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// 每个包的最少文件数
    #[arg(long)]
    min_file_num: Option<usize>,

    /// 每个包的最多文件数
    #[arg(long)]
    max_file_num: Option<usize>,

    /// 每个包的最大字节数
    #[arg(long)]
    max_file_size: Option<u64>,

    /// 本地打包临时目录
    #[arg(long)]
    local_temp: Option<PathBuf>,

    /// 远程暂存集合
    #[arg(long)]
    staging: Option<String>,

    /// 运行前清理残留的旧包
    #[arg(long)]
    clear_old: bool,

    /// 并行传输数
    #[arg(long)]
    thread_num: Option<usize>,

    /// 不询问，直接覆盖
    #[arg(short, long)]
    force: bool,

    /// 差异传输：跳过大小和校验和都相同的文件
    #[arg(long)]
    diff: bool,

    /// 差异传输只比较大小
    #[arg(long, requires = "diff")]
    no_hash: bool,

    /// 类型冲突时允许替换目标
    #[arg(long)]
    sync: bool,

    /// 删除目标中多余的条目
    #[arg(long)]
    delete: bool,

    /// 不在目标下创建源目录本身
    #[arg(long)]
    no_root: bool,

    /// 上传成功后删除本地源
    #[arg(long)]
    delete_on_success: bool,

    /// 失败后整体重试的次数
    #[arg(long)]
    retry: Option<u32>,

    /// 重试间隔（秒）
    #[arg(long)]
    retry_interval: Option<u64>,

    /// 远程校验和算法: md5, sha2, blake3
    #[arg(long)]
    checksum: Option<ChecksumAlgorithm>,

    /// 存储资源映射，格式 `name=/remote/prefix`
    #[arg(long = "resource", value_name = "NAME=PREFIX")]
    resources: Vec<String>,

    /// 写传输报告
    #[arg(long)]
    report: bool,

    /// 报告文件路径，不指定则写到标准输出
    #[arg(long, requires = "report")]
    report_path: Option<PathBuf>,

    /// 输出 debug 日志
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    /// 命令行参数覆盖配置文件
    fn apply(&self, config: &mut BputConfig) -> Result<()> {
        if let Some(v) = self.min_file_num {
            config.bundle.min_file_num = v;
        }
        if let Some(v) = self.max_file_num {
            config.bundle.max_file_num = v;
        }
        if let Some(v) = self.max_file_size {
            config.bundle.max_file_size = v;
        }
        if let Some(v) = &self.local_temp {
            config.bundle.local_temp_path = Some(v.clone());
        }
        if let Some(v) = &self.staging {
            config.bundle.staging_path = Some(v.clone());
        }
        if let Some(v) = self.thread_num {
            config.thread_num = v;
        }
        if let Some(v) = self.retry {
            config.retry.count = v;
        }
        if let Some(v) = self.retry_interval {
            config.retry.interval_secs = v;
        }
        if let Some(v) = &self.cwd {
            config.remote_cwd = v.clone();
        }
        if let Some(v) = &self.remote_root {
            config.backend.root = Some(v.clone());
        }
        if let Some(v) = self.checksum {
            config.backend.checksum = Some(v);
        }
        for mapping in &self.resources {
            let (name, prefix) = mapping
                .split_once('=')
                .ok_or_else(|| anyhow!("资源映射格式错误: {}", mapping))?;
            config
                .backend
                .resources
                .insert(prefix.to_string(), name.to_string());
        }

        config.bundle.clear_old |= self.clear_old;
        config.force |= self.force;
        config.differential.enabled |= self.diff;
        config.differential.no_hash |= self.no_hash;
        config.mirror.sync |= self.sync;
        config.mirror.delete |= self.delete;
        config.no_root |= self.no_root;
        config.delete_on_success |= self.delete_on_success;
        if self.report {
            config.report.enabled = true;
            config.report.path = self.report_path.clone();
            config.report.to_stdout = self.report_path.is_none();
        }
        Ok(())
    }

    /// (源路径, 目标)
    fn split_paths(&self) -> Result<(Vec<PathBuf>, String)> {
        let (target, sources) = self
            .paths
            .split_last()
            .ok_or_else(|| anyhow!("缺少目标路径"))?;
        Ok((sources.iter().map(PathBuf::from).collect(), target.clone()))
    }
}

/// 初始化日志系统，返回的 guard 需要保持到退出
fn init_logging(config_dir: &std::path::Path, debug: bool) -> Option<WorkerGuard> {
    let config = LogConfig::load(config_dir);
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };
    let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    // 文件日志层可选，创建失败时只输出到控制台
    let mut file_error = None;
    let (file_layer, guard) = if config.enabled {
        match SizeRotatingWriter::new(&get_log_dir(config_dir), config.max_size_mb) {
            Ok(file_writer) => {
                let (writer, guard) = tracing_appender::non_blocking(file_writer);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                file_error = Some(e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    if let Some(e) = file_error {
        tracing::warn!("无法创建日志文件: {}", e);
    }
    guard
}

fn build_report(config: &BputConfig) -> Result<Arc<dyn ReportSink>> {
    if !config.report.enabled {
        return Ok(Arc::new(NullReport));
    }
    match &config.report.path {
        Some(path) if !config.report.to_stdout => {
            let report = JsonLinesReport::to_file(path)
                .with_context(|| format!("无法创建报告文件 {}", path.display()))?;
            Ok(Arc::new(report))
        }
        _ => Ok(Arc::new(JsonLinesReport::to_stdout())),
    }
}

fn build_remote(config: &BputConfig) -> Result<LocalRemoteFs> {
    let root = config
        .backend
        .root
        .clone()
        .ok_or_else(|| anyhow!("未指定远程存储根目录 (--remote-root 或 config.json 中的 bput.backend.root)"))?;

    let mut fs = LocalRemoteFs::new(&root)?;
    if let Some(algorithm) = config.backend.checksum {
        fs = fs.with_checksum(algorithm);
    }
    for (prefix, resource) in &config.backend.resources {
        fs = fs.with_resource(prefix, resource);
    }
    Ok(fs)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.clone().unwrap_or_else(get_config_dir);
    let _log_guard = init_logging(&config_dir, cli.debug);

    let mut config = BputConfig::load(&config_dir);
    cli.apply(&mut config)?;
    config.validate()?;

    let (sources, target) = cli.split_paths()?;
    let fs = build_remote(&config)?;
    info!("远程存储: {}", bundlesync_lib::storage::RemoteFs::name(&fs));

    let report = build_report(&config)?;
    let prompter: Arc<dyn Prompter> = Arc::new(TerminalPrompter);

    let engine = BputEngine::new(config, Arc::new(fs))
        .with_report(report)
        .with_prompter(prompter);

    let summary = engine
        .run_with_retry(&sources, &target)
        .await
        .with_context(|| format!("bput 到 {} 失败", target))?;

    info!(
        "完成: 传输 {} 个文件 ({} 字节), 跳过 {} 个, 删除 {} 个, 第 {} 次尝试",
        summary.files_transferred,
        summary.bytes_transferred,
        summary.files_skipped,
        summary.deleted,
        summary.attempts
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn logging_initialises_file_and_console_layers() {
        let dir = TempDir::new().unwrap();
        let guard = init_logging(dir.path(), true);

        assert!(guard.is_some());
        assert!(dir.path().join("logs/bundlesync.log").exists());
    }

    #[test]
    fn flags_override_config_file() {
        let cli = Cli::parse_from([
            "bundlesync",
            "--diff",
            "--no-hash",
            "--thread-num",
            "2",
            "--resource",
            "fast=/zone/fast",
            "a",
            "b",
            "/zone/target",
        ]);
        let mut config = BputConfig::default();
        cli.apply(&mut config).unwrap();

        assert!(config.differential.enabled && config.differential.no_hash);
        assert_eq!(config.thread_num, 2);
        assert_eq!(config.backend.resources["/zone/fast"], "fast");

        let (sources, target) = cli.split_paths().unwrap();
        assert_eq!(sources, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(target, "/zone/target");
    }
}
