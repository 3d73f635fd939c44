//! 日志模块 - 文件日志和大小轮转

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const LOG_FILE_NAME: &str = "bundlesync.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(log_config) = config.get("log") {
                        if let Ok(log) = serde_json::from_value::<LogConfig>(log_config.clone()) {
                            return log;
                        }
                    }
                }
            }
        }
        Self::default()
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 带大小限制的日志写入器，超过上限时把当前文件改名为 `.old`
///
/// 交给 `tracing_appender::non_blocking` 在后台线程写入。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = (max_size_mb as u64) * 1024 * 1024;

        let (writer, written) = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            written,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<(BufWriter<File>, u64)> {
        // 已有文件超过限制则先轮转
        let mut existing = fs::metadata(file_path).map(|m| m.len()).unwrap_or(0);
        if existing > max_size {
            Self::rotate_log(file_path)?;
            existing = 0;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok((BufWriter::new(file), existing))
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");

        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }
        Self::rotate_log(&self.file_path)?;

        let (writer, written) = Self::open_file(&self.file_path, self.max_size)?;
        self.writer = Some(writer);
        self.written = written;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志写入器不可用"))?;

        let n = writer.write(buf)?;
        writer.flush()?;
        self.written += n as u64;

        if self.written > self.max_size {
            self.rotate()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// 配置目录
pub fn get_config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("bundlesync"))
        .unwrap_or_else(|| PathBuf::from(".bundlesync"))
}

/// 日志目录（配置中的 `data_path` 优先）
pub fn get_log_dir(config_dir: &Path) -> PathBuf {
    let config_file = config_dir.join("config.json");
    if config_file.exists() {
        if let Ok(content) = fs::read_to_string(&config_file) {
            if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                if let Some(custom_path) = config.get("data_path").and_then(|v| v.as_str()) {
                    let custom_dir = PathBuf::from(custom_path);
                    if custom_dir.exists() && custom_dir.is_dir() {
                        return custom_dir;
                    }
                }
            }
        }
    }

    config_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn log_config_reads_its_section() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"log": {"level": "debug", "maxSizeMb": 1}, "bput": {}}"#,
        )
        .unwrap();

        let config = LogConfig::load(dir.path());
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        assert_eq!(config.max_size_mb, 1);
        assert!(config.enabled);
    }

    #[test]
    fn writer_rotates_past_limit() {
        let dir = TempDir::new().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();

        let line = vec![b'x'; 64 * 1024];
        for _ in 0..17 {
            writer.write_all(&line).unwrap();
        }
        writer.flush().unwrap();

        let current = std::fs::metadata(writer.path()).unwrap().len();
        let backup = dir.path().join("bundlesync.log.old");
        assert!(backup.exists());
        assert!(current < 1024 * 1024);
    }
}
