use crate::model::{BlockLog, LogEvent, LogEventType, SuggestionStatus, Trace, UNSET_EXIT_CODE};
use crate::queue::WorkQueue;
use crate::Metrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use weft_store::RecordStore;

/// Receives the id of every block log after it changes.
#[async_trait]
pub trait BlockNotifier: Send + Sync {
    async fn block_changed(&self, block_id: &str) -> Result<()>;
}

pub struct NoopNotifier;

#[async_trait]
impl BlockNotifier for NoopNotifier {
    async fn block_changed(&self, _block_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Joins traces and log events into per-block audit records.
pub struct BlockJoiner {
    blocks: Arc<RecordStore<BlockLog>>,
    traces: Arc<RecordStore<Trace>>,
    queue: WorkQueue<String>,
    notifier: Arc<dyn BlockNotifier>,
    delay: Duration,
}

impl BlockJoiner {
    pub fn new(
        blocks: Arc<RecordStore<BlockLog>>,
        traces: Arc<RecordStore<Trace>>,
        queue: WorkQueue<String>,
        notifier: Arc<dyn BlockNotifier>,
        delay: Duration,
    ) -> Self {
        Self {
            blocks,
            traces,
            queue,
            notifier,
            delay,
        }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Links a freshly built trace to the blocks it produced or ran.
    pub async fn on_trace(&self, trace: &Trace) {
        if let Some(generate) = trace.generate() {
            let block_ids = generate
                .response
                .iter()
                .flat_map(|response| response.blocks.iter())
                .map(|block| block.id.as_str())
                .filter(|id| !id.is_empty());
            for block_id in block_ids {
                let result = self
                    .update(block_id, |log| {
                        log.gen_trace_id = trace.id.clone();
                        Ok(())
                    })
                    .await;
                match result {
                    Ok(_) => self.enqueue(block_id),
                    Err(exc) => error!("failed to link generation trace {}: {exc:#}", trace.id),
                }
            }
        }

        if let Some(execute) = trace.execute() {
            let Some(block_id) = execute
                .request
                .as_ref()
                .map(|request| request.block.id.as_str())
                .filter(|id| !id.is_empty())
            else {
                debug!("execution trace {} has no block id", trace.id);
                return;
            };
            let result = self
                .update(block_id, |log| {
                    if !log.exec_trace_ids.contains(&trace.id) {
                        log.exec_trace_ids.push(trace.id.clone());
                    }
                    Ok(())
                })
                .await;
            match result {
                Ok(_) => self.enqueue(block_id),
                Err(exc) => error!("failed to link execution trace {}: {exc:#}", trace.id),
            }
        }
    }

    pub async fn on_log_event(&self, event: &LogEvent) {
        match event.event_type {
            LogEventType::Execute => {
                let Some(cell) = event.selected_cell() else {
                    warn!("execute event {} has no cells", event.event_id);
                    return;
                };
                let block = cell.to_block();
                if block.id.is_empty() {
                    warn!("execute event {} selected a cell without an id", event.event_id);
                    return;
                }
                let block_id = block.id.clone();
                let result = self
                    .update(&block_id, |log| {
                        log.executed_block = Some(block.clone());
                        Ok(())
                    })
                    .await;
                match result {
                    Ok(_) => self.enqueue(&block_id),
                    Err(exc) => error!("failed to record execution of {block_id}: {exc:#}"),
                }
            }
            LogEventType::Accepted | LogEventType::Rejected => {
                if event.selected_id.is_empty() {
                    warn!("{:?} event {} has no selected id", event.event_type, event.event_id);
                    return;
                }
                let status = if event.event_type == LogEventType::Accepted {
                    SuggestionStatus::Accepted
                } else {
                    SuggestionStatus::Rejected
                };
                let result = self
                    .update(&event.selected_id, |log| {
                        log.suggestion_status = status;
                        Ok(())
                    })
                    .await;
                match result {
                    Ok(_) => self.enqueue(&event.selected_id),
                    Err(exc) => error!(
                        "failed to record suggestion status of {}: {exc:#}",
                        event.selected_id
                    ),
                }
            }
            _ => {}
        }
    }

    fn enqueue(&self, block_id: &str) {
        self.queue.add_after(block_id.to_string(), self.delay);
    }

    /// Copies trace-derived fields onto the block log and notifies listeners.
    pub async fn rebuild(&self, block_id: &str) -> Result<BlockLog> {
        let current = self
            .blocks
            .get(block_id)
            .with_context(|| format!("failed to read block log {block_id}"))?
            .unwrap_or_default();

        let generation = if current.gen_trace_id.is_empty() {
            None
        } else {
            self.traces
                .get(&current.gen_trace_id)
                .with_context(|| format!("failed to read trace {}", current.gen_trace_id))?
        };

        let mut latest_execution: Option<Trace> = None;
        for trace_id in &current.exec_trace_ids {
            let Some(trace) = self
                .traces
                .get(trace_id)
                .with_context(|| format!("failed to read trace {trace_id}"))?
            else {
                continue;
            };
            let newer = latest_execution
                .as_ref()
                .map_or(true, |latest| trace.start_time > latest.start_time);
            if newer {
                latest_execution = Some(trace);
            }
        }

        let updated = self
            .update(block_id, |log| {
                if let Some(trace) = &generation {
                    if trace.eval_mode {
                        log.eval_mode = true;
                    }
                    if let Some(generate) = trace.generate() {
                        if let Some(request) = &generate.request {
                            log.doc = Some(request.doc.clone());
                        }
                        if let Some(block) = generate
                            .response
                            .iter()
                            .flat_map(|response| response.blocks.iter())
                            .find(|block| block.id == block_id)
                        {
                            log.generated_block = Some(block.clone());
                        }
                    }
                }

                if let Some(trace) = &latest_execution {
                    if trace.eval_mode {
                        log.eval_mode = true;
                    }
                    if let Some(execute) = trace.execute() {
                        if let Some(request) = &execute.request {
                            log.executed_block = Some(request.block.clone());
                        }
                        log.exit_code = execute
                            .response
                            .iter()
                            .flat_map(|response| response.outputs.iter())
                            .find_map(|output| output.exit_code())
                            .unwrap_or(UNSET_EXIT_CODE);
                    }
                }
                Ok(())
            })
            .await?;

        let notifier = Arc::clone(&self.notifier);
        let id = block_id.to_string();
        tokio::spawn(async move {
            if let Err(exc) = notifier.block_changed(&id).await {
                warn!("block change notification failed for {id}: {exc:#}");
            }
        });

        Ok(updated)
    }

    async fn update<F>(&self, block_id: &str, mut mutate: F) -> Result<BlockLog>
    where
        F: FnMut(&mut BlockLog) -> Result<()>,
    {
        let log = self
            .blocks
            .read_modify_write(block_id, |log| {
                log.id = block_id.to_string();
                mutate(log)
            })
            .await
            .with_context(|| format!("failed to update block log {block_id}"))?;
        Ok(log)
    }
}

/// Drains the per-block queue until it shuts down.
pub(crate) async fn run_block_worker(
    joiner: Arc<BlockJoiner>,
    metrics: Arc<Metrics>,
    signal: Option<mpsc::UnboundedSender<String>>,
) {
    while let Some(block_id) = joiner.queue.get().await {
        match joiner.rebuild(&block_id).await {
            Ok(_) => {
                metrics.block_updates.fetch_add(1, Ordering::Relaxed);
            }
            Err(exc) => {
                error!("failed to rebuild block log {block_id}: {exc:#}");
                metrics.record_error(&exc);
            }
        }
        joiner.queue.done(&block_id);

        if let Some(tx) = &signal {
            let _ = tx.send(block_id);
        }
    }
    debug!("block worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Block, BlockOutput, BlockOutputItem, Cell, Doc, ExecuteRequest, ExecuteResponse,
        ExecuteTrace, GenerateRequest, GenerateResponse, GenerateTrace, TraceData,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;
    use weft_store::RetryPolicy;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BlockNotifier for RecordingNotifier {
        async fn block_changed(&self, block_id: &str) -> Result<()> {
            self.seen
                .lock()
                .expect("notifier mutex poisoned")
                .push(block_id.to_string());
            Ok(())
        }
    }

    struct Fixture {
        joiner: BlockJoiner,
        blocks: Arc<RecordStore<BlockLog>>,
        traces: Arc<RecordStore<Trace>>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let blocks = Arc::new(
            RecordStore::in_memory("blocks", RetryPolicy::default()).expect("open blocks"),
        );
        let traces = Arc::new(
            RecordStore::in_memory("traces", RetryPolicy::default()).expect("open traces"),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let joiner = BlockJoiner::new(
            Arc::clone(&blocks),
            Arc::clone(&traces),
            WorkQueue::new(Duration::from_millis(1), Duration::from_millis(1)),
            notifier.clone(),
            Duration::ZERO,
        );
        Fixture {
            joiner,
            blocks,
            traces,
            notifier,
        }
    }

    fn code_block(id: &str, contents: &str) -> Block {
        Block {
            id: id.to_string(),
            contents: contents.to_string(),
            ..Block::default()
        }
    }

    fn generate_trace() -> Trace {
        Trace {
            id: "gen-1".to_string(),
            eval_mode: true,
            data: Some(TraceData::Generate(GenerateTrace {
                request: Some(GenerateRequest {
                    doc: Doc {
                        blocks: vec![code_block("m1", "# list files")],
                    },
                }),
                response: Some(GenerateResponse {
                    blocks: vec![code_block("b1", "ls"), code_block("b2", "ls -la")],
                    trace_id: "gen-1".to_string(),
                }),
            })),
            ..Trace::default()
        }
    }

    fn execute_trace(id: &str, start: i64, exit_output: &str) -> Trace {
        Trace {
            id: id.to_string(),
            start_time: Utc.timestamp_opt(start, 0).single(),
            data: Some(TraceData::Execute(ExecuteTrace {
                request: Some(ExecuteRequest {
                    block: code_block("b1", &format!("ls {id}")),
                }),
                response: Some(ExecuteResponse {
                    outputs: vec![BlockOutput {
                        items: vec![BlockOutputItem {
                            mime: "text/plain".to_string(),
                            text_data: exit_output.to_string(),
                        }],
                    }],
                }),
            })),
            ..Trace::default()
        }
    }

    #[tokio::test]
    async fn generation_trace_links_every_block_and_rebuild_copies_fields() {
        let f = fixture();
        let trace = f.traces.put("gen-1", generate_trace()).expect("store trace");

        f.joiner.on_trace(&trace).await;
        assert_eq!(f.joiner.queue().len(), 2);

        let log = f.joiner.rebuild("b1").await.expect("rebuild");
        assert_eq!(log.id, "b1");
        assert_eq!(log.gen_trace_id, "gen-1");
        assert!(log.eval_mode);
        assert_eq!(log.generated_block.as_ref().map(|b| b.contents.as_str()), Some("ls"));
        assert_eq!(log.doc.as_ref().map(|d| d.blocks.len()), Some(1));
        assert_eq!(log.exit_code, UNSET_EXIT_CODE);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            f.notifier.seen.lock().expect("notifier mutex poisoned").clone(),
            vec!["b1".to_string()]
        );
    }

    #[tokio::test]
    async fn latest_execution_trace_sets_exit_code() {
        let f = fixture();
        let older = f
            .traces
            .put("exec-old", execute_trace("exec-old", 10, "exitCode: 0"))
            .expect("store old");
        let newer = f
            .traces
            .put("exec-new", execute_trace("exec-new", 20, "exitCode: 2"))
            .expect("store new");

        f.joiner.on_trace(&newer).await;
        f.joiner.on_trace(&older).await;
        f.joiner.on_trace(&older).await;

        let log = f.joiner.rebuild("b1").await.expect("rebuild");
        assert_eq!(log.exec_trace_ids, vec!["exec-new".to_string(), "exec-old".to_string()]);
        assert_eq!(log.exit_code, 2);
        assert_eq!(
            log.executed_block.as_ref().map(|b| b.contents.as_str()),
            Some("ls exec-new")
        );
    }

    #[tokio::test]
    async fn log_events_set_only_their_own_fields() {
        let f = fixture();
        let execute: LogEvent = serde_json::from_value(json!({
            "eventId": "e1",
            "type": "EXECUTE",
            "selectedId": "b1",
            "cells": [
                {"kind": "CELL_KIND_CODE", "value": "pwd", "metadata": {"runme.dev/id": "b1"}}
            ]
        }))
        .expect("decode event");
        let accepted = LogEvent {
            event_id: "e2".to_string(),
            event_type: LogEventType::Accepted,
            selected_id: "b1".to_string(),
            ..LogEvent::default()
        };

        f.joiner.on_log_event(&execute).await;
        f.joiner.on_log_event(&accepted).await;

        let log = f.blocks.get("b1").expect("get").expect("block log exists");
        assert_eq!(log.suggestion_status, SuggestionStatus::Accepted);
        assert_eq!(
            log.executed_block.as_ref().map(|b| b.contents.as_str()),
            Some("pwd")
        );
        assert!(log.gen_trace_id.is_empty());
        assert_eq!(f.joiner.queue().len(), 1);
    }

    #[tokio::test]
    async fn execute_event_without_cell_ids_is_ignored() {
        let f = fixture();
        let event = LogEvent {
            event_type: LogEventType::Execute,
            cells: vec![Cell::default()],
            ..LogEvent::default()
        };
        f.joiner.on_log_event(&event).await;
        assert!(f.blocks.keys().expect("keys").is_empty());
        assert!(f.joiner.queue().is_empty());
    }
}
