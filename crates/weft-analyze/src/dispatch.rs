use crate::blocks::BlockJoiner;
use crate::checkpoint::WatermarkStore;
use crate::model::{LogEntries, Trace};
use crate::queue::WorkQueue;
use crate::reader::read_lines_from_offset;
use crate::record::LogRecord;
use crate::session::SessionBuilder;
use crate::trace::build_trace;
use crate::{FileItem, Metrics};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use weft_store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchOutcome {
    /// The file sorts before the watermark and is already done.
    Skipped,
    /// Fewer lines than the batch cap were available.
    Partial { lines: usize },
    /// The batch cap was reached; more lines are likely waiting.
    Full,
}

pub(crate) struct FileWorker {
    pub(crate) queue: WorkQueue<FileItem>,
    pub(crate) batch_lines: usize,
    pub(crate) watermark: Arc<Mutex<WatermarkStore>>,
    pub(crate) raw_logs: Arc<RecordStore<LogEntries>>,
    pub(crate) traces: Arc<RecordStore<Trace>>,
    pub(crate) sessions: Arc<SessionBuilder>,
    pub(crate) joiner: Arc<BlockJoiner>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) signal: Option<mpsc::UnboundedSender<String>>,
}

/// Drains the file queue one item at a time until it shuts down. Batches for
/// a file must be applied in order for the watermark to stay meaningful.
pub(crate) async fn run_file_worker(worker: Arc<FileWorker>) {
    while let Some(item) = worker.queue.get().await {
        let outcome = worker.process_file(&item).await;
        worker.settle(&item, outcome);
        worker.queue.done(&item);

        if let Some(tx) = &worker.signal {
            let _ = tx.send(item.path.clone());
        }
    }
    info!("file worker stopped");
}

fn is_missing_file(exc: &anyhow::Error) -> bool {
    exc.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
    })
}

impl FileWorker {
    /// Decides when `item` is read again after a batch.
    fn settle(&self, item: &FileItem, outcome: Result<BatchOutcome>) {
        match outcome {
            Ok(BatchOutcome::Full) => {
                self.queue.forget(item);
                self.queue.add(item.clone());
            }
            Ok(BatchOutcome::Partial { lines }) if item.active => {
                if lines > 0 {
                    self.queue.forget(item);
                }
                self.queue.add_rate_limited(item.clone());
            }
            Ok(_) => self.queue.forget(item),
            Err(exc) if is_missing_file(&exc) => {
                warn!("dropping {}: file no longer exists", item.path);
                self.queue.forget(item);
            }
            Err(exc) => {
                error!("failed processing {}: {exc:#}", item.path);
                self.metrics.record_error(format!("{exc:#}"));
                if item.active {
                    self.queue.add_rate_limited(item.clone());
                } else {
                    self.queue.forget(item);
                }
            }
        }
    }

    pub(crate) async fn process_file(&self, item: &FileItem) -> Result<BatchOutcome> {
        let offset = self
            .watermark
            .lock()
            .expect("watermark mutex poisoned")
            .offset_for(&item.path);
        if offset < 0 {
            debug!("skipping {}: before watermark", item.path);
            return Ok(BatchOutcome::Skipped);
        }

        let batch = read_lines_from_offset(Path::new(&item.path), offset, self.batch_lines)?;
        if batch.lines.is_empty() {
            return Ok(BatchOutcome::Partial { lines: 0 });
        }
        debug!(
            "read {} lines from {} at offset {}",
            batch.lines.len(),
            item.path,
            offset
        );

        let mut touched = BTreeSet::<String>::new();
        for line in &batch.lines {
            let record = match LogRecord::parse(line) {
                Ok(record) => record,
                Err(exc) => {
                    warn!("skipping undecodable line in {}: {exc}", item.path);
                    self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            self.metrics.lines_read.fetch_add(1, Ordering::Relaxed);

            if let Some(event) = self.sessions.process_record(&record).await {
                self.joiner.on_log_event(&event).await;
            }

            let Some(trace_id) = record.trace_id() else {
                continue;
            };
            let appended = self
                .raw_logs
                .read_modify_write(trace_id, |entries| {
                    if !entries.lines.iter().any(|seen| seen == line) {
                        entries.lines.push(line.clone());
                    }
                    Ok(())
                })
                .await;
            match appended {
                Ok(_) => {
                    touched.insert(trace_id.to_string());
                }
                Err(exc) => error!("failed to buffer line for trace {trace_id}: {exc}"),
            }
        }

        for trace_id in &touched {
            if let Err(exc) = self.combine(trace_id).await {
                self.metrics.trace_failures.fetch_add(1, Ordering::Relaxed);
                warn!("failed to build trace {trace_id}: {exc:#}");
            }
        }

        {
            let mut watermark = self.watermark.lock().expect("watermark mutex poisoned");
            if watermark.advance(&item.path, batch.offset) {
                watermark
                    .save()
                    .with_context(|| format!("failed to persist watermark for {}", item.path))?;
            }
        }

        if batch.lines.len() >= self.batch_lines {
            Ok(BatchOutcome::Full)
        } else {
            Ok(BatchOutcome::Partial {
                lines: batch.lines.len(),
            })
        }
    }

    /// Rebuilds the trace for `trace_id` from every buffered line.
    async fn combine(&self, trace_id: &str) -> Result<()> {
        let entries = self
            .raw_logs
            .get(trace_id)
            .with_context(|| format!("failed to read buffered lines for {trace_id}"))?
            .unwrap_or_default();

        let records: Vec<LogRecord> = entries
            .lines
            .iter()
            .filter_map(|line| LogRecord::parse(line).ok())
            .collect();

        let Some(trace) = build_trace(trace_id, records)? else {
            debug!("trace {trace_id} is not reconstructed");
            return Ok(());
        };

        let stored = self
            .traces
            .put(trace_id, trace)
            .with_context(|| format!("failed to store trace {trace_id}"))?;
        self.metrics.traces_built.fetch_add(1, Ordering::Relaxed);
        self.joiner.on_trace(&stored).await;
        Ok(())
    }
}
