pub mod blocks;
pub mod callsites;
pub mod checkpoint;
mod dispatch;
pub mod model;
pub mod queue;
pub mod reader;
pub mod record;
pub mod session;
pub mod spans;
pub mod trace;
mod watch;

use crate::blocks::{run_block_worker, BlockJoiner, BlockNotifier};
use crate::checkpoint::WatermarkStore;
use crate::dispatch::{run_file_worker, FileWorker};
use crate::model::{BlockLog, LogEntries, Session, Trace, Watermark};
use crate::queue::WorkQueue;
use crate::session::SessionBuilder;
use crate::watch::{enqueue_discovered, spawn_watcher_thread};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use weft_config::AppConfig;
use weft_store::{Page, PageRequest, RecordStore, RetryPolicy, SessionIndex, SessionSummary};

pub use crate::blocks::NoopNotifier;
pub use crate::watch::discover_log_files;

pub(crate) const WATCHER_BACKEND_UNKNOWN: u64 = 0;
pub(crate) const WATCHER_BACKEND_NATIVE: u64 = 1;
pub(crate) const WATCHER_BACKEND_POLL: u64 = 2;
pub(crate) const WATCHER_BACKEND_MIXED: u64 = 3;

/// A log file waiting to be read. Active files may still be growing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileItem {
    pub path: String,
    pub active: bool,
}

#[derive(Default)]
pub(crate) struct Metrics {
    pub(crate) lines_read: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) traces_built: AtomicU64,
    pub(crate) trace_failures: AtomicU64,
    pub(crate) block_updates: AtomicU64,
    pub(crate) watcher_error_count: AtomicU64,
    pub(crate) watcher_reset_count: AtomicU64,
    pub(crate) watcher_last_reset_unix_ms: AtomicU64,
    pub(crate) watcher_backend_state: AtomicU64,
    pub(crate) watcher_registrations: AtomicU64,
    pub(crate) last_error: Mutex<String>,
}

impl Metrics {
    pub(crate) fn record_error(&self, message: impl Display) {
        *self
            .last_error
            .lock()
            .expect("metrics last_error mutex poisoned") = message.to_string();
    }
}

fn watcher_backend_label(state: u64) -> &'static str {
    match state {
        WATCHER_BACKEND_NATIVE => "native",
        WATCHER_BACKEND_POLL => "poll",
        WATCHER_BACKEND_MIXED => "mixed",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerStatus {
    pub watermark: Watermark,
    pub file_queue_depth: usize,
    pub block_queue_depth: usize,
    pub lines_read: u64,
    pub decode_errors: u64,
    pub traces_built: u64,
    pub trace_failures: u64,
    pub block_updates: u64,
    pub watcher_backend: &'static str,
    pub watcher_registrations: u64,
    pub watcher_errors: u64,
    pub watcher_resets: u64,
    pub watcher_last_reset_unix_ms: u64,
    pub last_error: String,
}

/// Tails log files and keeps traces, sessions and block logs current.
pub struct Analyzer {
    config: AppConfig,
    raw_logs: Arc<RecordStore<LogEntries>>,
    traces: Arc<RecordStore<Trace>>,
    blocks: Arc<RecordStore<BlockLog>>,
    sessions: Arc<RecordStore<Session>>,
    session_index: Arc<SessionIndex>,
    watermark: Arc<Mutex<WatermarkStore>>,
    file_queue: WorkQueue<FileItem>,
    joiner: Arc<BlockJoiner>,
    session_builder: Arc<SessionBuilder>,
    metrics: Arc<Metrics>,
    file_signal: Option<mpsc::UnboundedSender<String>>,
    block_signal: Option<mpsc::UnboundedSender<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Analyzer {
    /// Opens the stores under the configured state directory.
    pub fn new(config: AppConfig, notifier: Arc<dyn BlockNotifier>) -> Result<Self> {
        let analyzer_cfg = &config.analyzer;
        let retry = RetryPolicy::from_config(&config.store);
        std::fs::create_dir_all(&analyzer_cfg.state_dir)
            .with_context(|| format!("failed to create state dir {}", analyzer_cfg.state_dir))?;

        let open = |name: &str| analyzer_cfg.state_path(&format!("{name}.db"));
        let raw_logs = Arc::new(
            RecordStore::open("raw_logs", &open("raw_logs"), retry.clone())
                .context("failed to open raw log store")?,
        );
        let traces = Arc::new(
            RecordStore::open("traces", &open("traces"), retry.clone())
                .context("failed to open trace store")?,
        );
        let blocks = Arc::new(
            RecordStore::open("blocks", &open("blocks"), retry.clone())
                .context("failed to open block log store")?,
        );
        let sessions = Arc::new(
            RecordStore::open("sessions", &open("sessions"), retry)
                .context("failed to open session store")?,
        );
        let session_index = Arc::new(
            SessionIndex::open(&open("sessions")).context("failed to open session index")?,
        );

        let watermark = Arc::new(Mutex::new(WatermarkStore::load(
            &analyzer_cfg.watermark_file,
        )));

        let file_queue = WorkQueue::new(
            Duration::from_secs_f64(analyzer_cfg.file_backoff_base_seconds.max(0.0)),
            Duration::from_secs_f64(analyzer_cfg.file_backoff_max_seconds.max(0.0)),
        );
        let block_queue = WorkQueue::new(Duration::from_millis(50), Duration::from_secs(5));
        let joiner = Arc::new(BlockJoiner::new(
            Arc::clone(&blocks),
            Arc::clone(&traces),
            block_queue,
            notifier,
            Duration::from_millis(analyzer_cfg.block_delay_ms),
        ));
        let session_builder = Arc::new(SessionBuilder::new(
            Arc::clone(&sessions),
            Arc::clone(&session_index),
        ));

        Ok(Self {
            config,
            raw_logs,
            traces,
            blocks,
            sessions,
            session_index,
            watermark,
            file_queue,
            joiner,
            session_builder,
            metrics: Arc::new(Metrics::default()),
            file_signal: None,
            block_signal: None,
            workers: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        })
    }

    /// Sends the path of each processed file item on `tx`.
    pub fn with_file_signal(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.file_signal = Some(tx);
        self
    }

    /// Sends the id of each rebuilt block log on `tx`.
    pub fn with_block_signal(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.block_signal = Some(tx);
        self
    }

    /// Queues existing log files, starts the watcher and both workers, and
    /// returns without waiting for them.
    pub fn run(&self) -> Result<()> {
        let log_dirs = self.config.analyzer.log_dirs.clone();
        let files = discover_log_files(&log_dirs)?;
        info!(
            "queueing {} log files from {} directories",
            files.len(),
            log_dirs.len()
        );
        enqueue_discovered(&self.file_queue, files);

        if self.config.analyzer.watch {
            let handle = spawn_watcher_thread(
                log_dirs,
                self.file_queue.clone(),
                Arc::clone(&self.metrics),
            );
            *self.watcher.lock().expect("watcher mutex poisoned") = Some(handle);
        }

        let file_worker = Arc::new(FileWorker {
            queue: self.file_queue.clone(),
            batch_lines: self.config.analyzer.batch_lines.max(1),
            watermark: Arc::clone(&self.watermark),
            raw_logs: Arc::clone(&self.raw_logs),
            traces: Arc::clone(&self.traces),
            sessions: Arc::clone(&self.session_builder),
            joiner: Arc::clone(&self.joiner),
            metrics: Arc::clone(&self.metrics),
            signal: self.file_signal.clone(),
        });

        let mut workers = self.workers.lock().expect("workers mutex poisoned");
        workers.push(tokio::spawn(run_file_worker(file_worker)));
        workers.push(tokio::spawn(run_block_worker(
            Arc::clone(&self.joiner),
            Arc::clone(&self.metrics),
            self.block_signal.clone(),
        )));
        Ok(())
    }

    /// Queues `path` for reading as a growing file.
    pub fn enqueue_file(&self, path: impl Into<String>) {
        self.file_queue.add(FileItem {
            path: path.into(),
            active: true,
        });
    }

    /// Stops accepting work, lets queued items drain and waits for both
    /// workers to finish.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down analyzer");
        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("workers mutex poisoned"));
        let mut workers = workers.into_iter();

        self.file_queue.shutdown();
        if let Some(file_worker) = workers.next() {
            file_worker.await.context("file worker panicked")?;
        }

        self.joiner.queue().shutdown();
        for worker in workers {
            worker.await.context("block worker panicked")?;
        }

        let watcher = self.watcher.lock().expect("watcher mutex poisoned").take();
        if let Some(handle) = watcher {
            let joined = tokio::task::spawn_blocking(move || handle.join())
                .await
                .context("failed to join watcher thread")?;
            if joined.is_err() {
                warn!("watcher thread panicked");
            }
        }

        let watermark = self.watermark.lock().expect("watermark mutex poisoned");
        watermark.save().context("failed to persist watermark")?;
        info!(
            "analyzer stopped at {}:{}",
            watermark.current().file,
            watermark.current().offset
        );
        Ok(())
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
            .lock()
            .expect("watermark mutex poisoned")
            .current()
            .clone()
    }

    pub fn get_block_log(&self, id: &str) -> Result<Option<BlockLog>> {
        self.blocks
            .get(id)
            .with_context(|| format!("failed to read block log {id}"))
    }

    pub fn get_session(&self, context_id: &str) -> Result<Option<Session>> {
        self.sessions
            .get(context_id)
            .with_context(|| format!("failed to read session {context_id}"))
    }

    pub fn get_trace(&self, id: &str) -> Result<Option<Trace>> {
        self.traces
            .get(id)
            .with_context(|| format!("failed to read trace {id}"))
    }

    pub fn get_log_entries(&self, trace_id: &str) -> Result<Option<LogEntries>> {
        self.raw_logs
            .get(trace_id)
            .with_context(|| format!("failed to read log entries for {trace_id}"))
    }

    pub fn list_sessions(&self, page: &PageRequest) -> Result<Page<SessionSummary>> {
        self.session_index
            .list(page)
            .context("failed to list sessions")
    }

    pub fn status(&self) -> AnalyzerStatus {
        let m = &self.metrics;
        AnalyzerStatus {
            watermark: self.watermark(),
            file_queue_depth: self.file_queue.len(),
            block_queue_depth: self.joiner.queue().len(),
            lines_read: m.lines_read.load(Ordering::Relaxed),
            decode_errors: m.decode_errors.load(Ordering::Relaxed),
            traces_built: m.traces_built.load(Ordering::Relaxed),
            trace_failures: m.trace_failures.load(Ordering::Relaxed),
            block_updates: m.block_updates.load(Ordering::Relaxed),
            watcher_backend: watcher_backend_label(m.watcher_backend_state.load(Ordering::Relaxed)),
            watcher_registrations: m.watcher_registrations.load(Ordering::Relaxed),
            watcher_errors: m.watcher_error_count.load(Ordering::Relaxed),
            watcher_resets: m.watcher_reset_count.load(Ordering::Relaxed),
            watcher_last_reset_unix_ms: m.watcher_last_reset_unix_ms.load(Ordering::Relaxed),
            last_error: m
                .last_error
                .lock()
                .expect("metrics last_error mutex poisoned")
                .clone(),
        }
    }
}
