//! 打包传输调度 - 把调度的文件分批打包、上传到暂存集合并在服务端解包

use crate::config::{BputConfig, MAX_FILE_NUM, MAX_THREAD_NUM};
use crate::core::bundle::{bundle_file_name, pack_bundle, Bundle, BundleEntry};
use crate::core::report::{ReportSink, TransferMethod, TransferReportRecord};
use crate::core::staging::StagingDirectory;
use crate::core::target::{join_remote, TargetMapper};
use crate::core::walker::SourceEntry;
use crate::error::{Result, SyncError};
use crate::storage::RemoteFs;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 传输统计
#[derive(Debug, Default)]
pub struct TransferStats {
    pub files_scheduled: AtomicU64,
    pub files_transferred: AtomicU64,
    pub bundles: AtomicU64,
    pub individual_uploads: AtomicU64,
    pub bytes_transferred: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files_scheduled: u64,
    pub files_transferred: u64,
    pub bundles: u64,
    pub individual_uploads: u64,
    pub bytes_transferred: u64,
}

impl TransferStats {
    fn snapshot(&self) -> TransferSummary {
        TransferSummary {
            files_scheduled: self.files_scheduled.load(Ordering::Relaxed),
            files_transferred: self.files_transferred.load(Ordering::Relaxed),
            bundles: self.bundles.load(Ordering::Relaxed),
            individual_uploads: self.individual_uploads.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
        }
    }
}

/// 工作任务共享的上下文
struct WorkerContext {
    config: Arc<BputConfig>,
    fs: Arc<dyn RemoteFs>,
    report: Arc<dyn ReportSink>,
    target_root: String,
    staging: String,
    local_temp_dir: PathBuf,
    stats: Arc<TransferStats>,
    errors: RwLock<Vec<SyncError>>,
}

/// 打包传输管理器
///
/// 使用顺序：`start` -> 若干次 `schedule` -> `done_scheduling` -> `wait`。
pub struct BundleTransferManager {
    ctx: Arc<WorkerContext>,
    mapper: TargetMapper,
    tx: Option<mpsc::Sender<BundleEntry>>,
    rx: Option<mpsc::Receiver<BundleEntry>>,
    batcher: Option<JoinHandle<()>>,
}

impl BundleTransferManager {
    pub fn new(
        config: Arc<BputConfig>,
        fs: Arc<dyn RemoteFs>,
        report: Arc<dyn ReportSink>,
        mapper: TargetMapper,
        staging: &StagingDirectory,
    ) -> Self {
        let capacity = config
            .bundle
            .max_file_num
            .saturating_mul(config.thread_num)
            .clamp(1, MAX_FILE_NUM * MAX_THREAD_NUM);
        let (tx, rx) = mpsc::channel(capacity);

        let ctx = WorkerContext {
            local_temp_dir: config.local_temp_dir(),
            config,
            fs,
            report,
            target_root: mapper.target_root().to_string(),
            staging: staging.path.clone(),
            stats: Arc::new(TransferStats::default()),
            errors: RwLock::new(Vec::new()),
        };

        Self {
            ctx: Arc::new(ctx),
            mapper,
            tx: Some(tx),
            rx: Some(rx),
            batcher: None,
        }
    }

    /// 源路径对应的远程路径
    pub fn target_path_for(&self, source: &Path) -> Result<String> {
        self.mapper.target_path_for(source)
    }

    pub fn mapper(&self) -> &TargetMapper {
        &self.mapper
    }

    /// 启动后台打包
    pub fn start(&mut self) {
        let Some(rx) = self.rx.take() else {
            warn!("传输管理器已经启动");
            return;
        };
        let ctx = self.ctx.clone();
        self.batcher = Some(tokio::spawn(run_batcher(ctx, rx)));
        info!(
            "开始打包传输: 暂存 {}, 目标 {}",
            self.ctx.staging, self.ctx.target_root
        );
    }

    /// 调度一个文件，队列满时等待
    pub async fn schedule(&self, source: &SourceEntry) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SyncError::Scheduler("已结束调度，不能继续添加".to_string()))?;

        let entry = BundleEntry {
            source: source.path.clone(),
            target: self.mapper.target_path_for(&source.path)?,
            entry_name: self.mapper.relative_of(&source.path)?,
            size: source.size,
        };
        debug!("调度: {} -> {}", entry.source.display(), entry.target);

        tx.send(entry)
            .await
            .map_err(|_| SyncError::Scheduler("打包任务已退出".to_string()))?;
        self.ctx.stats.files_scheduled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 关闭输入
    pub fn done_scheduling(&mut self) {
        self.tx = None;
    }

    /// 等待全部批次完成，返回遇到的第一个错误
    pub async fn wait(&mut self) -> Result<()> {
        self.done_scheduling();

        if let Some(handle) = self.batcher.take() {
            handle
                .await
                .map_err(|e| SyncError::Scheduler(format!("打包任务异常退出: {}", e)))?;
        }

        let mut errors = self.ctx.errors.write().await;
        if errors.is_empty() {
            return Ok(());
        }
        error!("{} 个批次传输失败", errors.len());
        Err(errors.remove(0))
    }

    pub fn stats(&self) -> TransferSummary {
        self.ctx.stats.snapshot()
    }
}

/// 从队列中取文件组包，满了就交给工作任务
async fn run_batcher(ctx: Arc<WorkerContext>, mut rx: mpsc::Receiver<BundleEntry>) {
    let semaphore = Arc::new(Semaphore::new(ctx.config.thread_num.max(1)));
    let max_num = ctx.config.bundle.max_file_num;
    let max_size = ctx.config.bundle.max_file_size;

    let mut handles = Vec::new();
    let mut current = Bundle::new();

    while let Some(entry) = rx.recv().await {
        if current.would_overflow(entry.size, max_size) {
            handles.push(dispatch(&ctx, &semaphore, current.take()).await);
        }
        current.push(entry);
        if current.is_full(max_num, max_size) {
            handles.push(dispatch(&ctx, &semaphore, current.take()).await);
        }
    }

    if !current.is_empty() {
        handles.push(dispatch(&ctx, &semaphore, current.take()).await);
    }

    for joined in futures::future::join_all(handles).await {
        if let Err(e) = joined {
            ctx.errors
                .write()
                .await
                .push(SyncError::Scheduler(format!("传输任务异常退出: {}", e)));
        }
    }
}

async fn dispatch(
    ctx: &Arc<WorkerContext>,
    semaphore: &Arc<Semaphore>,
    bundle: Bundle,
) -> JoinHandle<()> {
    // 信号量不会被关闭
    let permit = semaphore.clone().acquire_owned().await.ok();
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let result = if bundle.len() >= ctx.config.bundle.min_file_num {
            transfer_bundle(&ctx, &bundle).await
        } else {
            transfer_individually(&ctx, &bundle).await
        };

        if let Err(e) = result {
            error!("批次传输失败: {}", e);
            ctx.errors.write().await.push(e);
        }
        drop(permit);
    })
}

/// 打包 -> 上传一次 -> 服务端解包一次
async fn transfer_bundle(ctx: &WorkerContext, bundle: &Bundle) -> Result<()> {
    let start_at = Utc::now();
    let name = bundle_file_name();
    let local_archive = ctx.local_temp_dir.join(&name);
    let staged_archive = join_remote(&ctx.staging, &name);

    let result = async {
        let _cleanup = scopeguard::guard(local_archive.clone(), |path| {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除本地包 {} 失败: {}", path.display(), e);
                }
            }
        });

        pack_bundle(bundle.entries().to_vec(), local_archive.clone()).await?;

        ctx.fs
            .upload_file(&local_archive, &staged_archive)
            .await
            .map_err(|e| e.context(format!("上传包 {} 失败", name)))?;

        let extracted = ctx
            .fs
            .extract_bundle(&staged_archive, &ctx.target_root, true)
            .await
            .map_err(|e| e.context(format!("解包 {} 到 {} 失败", name, ctx.target_root)));

        if let Err(e) = ctx.fs.remove_file(&staged_archive, true).await {
            warn!("删除暂存包 {} 失败: {}", staged_archive, e);
        }
        extracted
    }
    .await;

    let end_at = Utc::now();
    let error = result.as_ref().err().map(|e| e.to_string());
    for entry in bundle.entries() {
        ctx.report.append(put_record(entry, &["bundle"], start_at, end_at, error.clone()));
    }

    result?;
    ctx.stats.bundles.fetch_add(1, Ordering::Relaxed);
    ctx.stats
        .files_transferred
        .fetch_add(bundle.len() as u64, Ordering::Relaxed);
    ctx.stats
        .bytes_transferred
        .fetch_add(bundle.size(), Ordering::Relaxed);
    info!(
        "包 {} 已传输 ({} 个文件, {} 字节)",
        name,
        bundle.len(),
        bundle.size()
    );
    Ok(())
}

/// 文件数不足以打包时逐个上传
async fn transfer_individually(ctx: &WorkerContext, bundle: &Bundle) -> Result<()> {
    for entry in bundle.entries() {
        let start_at = Utc::now();
        let result = ctx
            .fs
            .upload_file(&entry.source, &entry.target)
            .await
            .map_err(|e| e.context(format!("上传 {} 失败", entry.source.display())));

        let error = result.as_ref().err().map(|e| e.to_string());
        ctx.report
            .append(put_record(entry, &["individual"], start_at, Utc::now(), error));
        result?;

        ctx.stats.individual_uploads.fetch_add(1, Ordering::Relaxed);
        ctx.stats.files_transferred.fetch_add(1, Ordering::Relaxed);
        ctx.stats
            .bytes_transferred
            .fetch_add(entry.size, Ordering::Relaxed);
        debug!("已上传: {} -> {}", entry.source.display(), entry.target);
    }
    Ok(())
}

fn put_record(
    entry: &BundleEntry,
    notes: &[&str],
    start_at: chrono::DateTime<Utc>,
    end_at: chrono::DateTime<Utc>,
    error: Option<String>,
) -> TransferReportRecord {
    let mut record =
        TransferReportRecord::instant(TransferMethod::Put, entry.source.to_string_lossy())
            .with_notes(notes)
            .with_error(error);
    record.start_at = start_at;
    record.end_at = end_at;
    record.source_size = Some(entry.size);
    record.dest_path = Some(entry.target.clone());
    record.dest_size = Some(entry.size);
    record
}
