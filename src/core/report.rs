//! 传输报告 - 每个产生可见效果的决策追加一条记录

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// 记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    Put,
    Delete,
}

/// 单条传输报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct TransferReportRecord {
    pub method: TransferMethod,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub source_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum_algorithm: Option<String>,
    pub error: Option<String>,
    pub notes: Vec<String>,
}

impl TransferReportRecord {
    /// 起止时间相同的即时记录
    pub fn instant(method: TransferMethod, source_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            method,
            start_at: now,
            end_at: now,
            source_path: source_path.into(),
            source_size: None,
            source_checksum: None,
            dest_path: None,
            dest_size: None,
            dest_checksum: None,
            checksum_algorithm: None,
            error: None,
            notes: Vec::new(),
        }
    }

    pub fn with_notes(mut self, notes: &[&str]) -> Self {
        self.notes = notes.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn has_note(&self, note: &str) -> bool {
        self.notes.iter().any(|n| n == note)
    }
}

/// 报告接收端，写入失败不能阻塞主流程
pub trait ReportSink: Send + Sync {
    fn append(&self, record: TransferReportRecord);
}

/// 丢弃所有记录
#[derive(Debug, Default)]
pub struct NullReport;

impl ReportSink for NullReport {
    fn append(&self, _record: TransferReportRecord) {}
}

/// 以 JSON Lines 写入文件或标准输出
pub struct JsonLinesReport {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesReport {
    pub fn to_file(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(Box::new(io::BufWriter::new(file))),
        })
    }

    pub fn to_stdout() -> Self {
        Self::from_writer(Box::new(io::stdout()))
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl ReportSink for JsonLinesReport {
    fn append(&self, record: TransferReportRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                warn!("序列化传输报告失败: {}", e);
                return;
            }
        };

        let mut guard = match self.writer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(guard, "{}", line).and_then(|_| guard.flush()) {
            warn!("写入传输报告失败: {}", e);
        }
    }
}

/// 内存中的报告，便于汇总和测试
#[derive(Debug, Default)]
pub struct MemoryReport {
    records: Mutex<Vec<TransferReportRecord>>,
}

impl MemoryReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TransferReportRecord> {
        match self.records.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ReportSink for MemoryReport {
    fn append(&self, record: TransferReportRecord) {
        match self.records.lock() {
            Ok(mut g) => g.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
