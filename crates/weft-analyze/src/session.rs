use crate::callsites::{self, TraceKind};
use crate::model::{LogEvent, LogEventType, Session};
use crate::record::LogRecord;
use std::sync::Arc;
use tracing::{debug, warn};
use weft_store::{RecordStore, SessionIndex, StoreResult};

/// Folds log records into per-context sessions as they are read.
pub struct SessionBuilder {
    sessions: Arc<RecordStore<Session>>,
    index: Arc<SessionIndex>,
}

impl SessionBuilder {
    pub fn new(sessions: Arc<RecordStore<Session>>, index: Arc<SessionIndex>) -> Self {
        Self { sessions, index }
    }

    /// Applies one record. Returns the decoded log event, if the record
    /// carried one, so block logs can react to it.
    pub async fn process_record(&self, record: &LogRecord) -> Option<LogEvent> {
        let function = record.function()?;

        if callsites::is_log_events(function) {
            return self.process_log_event(record).await;
        }
        if callsites::is_llm_usage(function) {
            self.process_usage(record).await;
            return None;
        }
        match callsites::classify(function) {
            Some(TraceKind::Generate) => self.process_generate(record).await,
            Some(TraceKind::StreamGenerate) => self.process_stream_generate(record).await,
            _ => {}
        }
        None
    }

    async fn process_log_event(&self, record: &LogRecord) -> Option<LogEvent> {
        let event = match record.decode::<LogEvent>("event") {
            Some(Ok(event)) => event,
            Some(Err(exc)) => {
                warn!("failed to decode log event: {exc}");
                return None;
            }
            None => {
                warn!("log event record without an event payload");
                return None;
            }
        };

        if event.context_id.is_empty() {
            warn!("log event {} has no context id", event.event_id);
            return Some(event);
        }

        let time = record.time();
        let result = self
            .update(&event.context_id, |session| {
                if session
                    .log_events
                    .iter()
                    .any(|seen| seen.event_id == event.event_id)
                {
                    return Ok(());
                }
                match event.event_type {
                    LogEventType::SessionStart => {
                        session.total_input_tokens = 0;
                        session.total_output_tokens = 0;
                        session.start_time = time;
                    }
                    LogEventType::SessionEnd => session.end_time = time,
                    _ => {}
                }
                session.log_events.push(event.clone());
                Ok(())
            })
            .await;
        if let Err(exc) = result {
            warn!("failed to update session {}: {exc}", event.context_id);
        }

        Some(event)
    }

    /// Usage records carry no event id, so replaying them counts twice.
    async fn process_usage(&self, record: &LogRecord) {
        let Some(context_id) = record.context_id() else {
            debug!("llm usage record without a context id");
            return;
        };
        let Some(usage) = record.get_object("usage") else {
            return;
        };
        let input = usage.get("inputTokens").and_then(|v| v.as_i64()).unwrap_or(0);
        let output = usage.get("outputTokens").and_then(|v| v.as_i64()).unwrap_or(0);

        let result = self
            .update(context_id, |session| {
                session.total_input_tokens += input;
                session.total_output_tokens += output;
                Ok(())
            })
            .await;
        if let Err(exc) = result {
            warn!("failed to record token usage for session {context_id}: {exc}");
        }
    }

    async fn process_generate(&self, record: &LogRecord) {
        let (Some(context_id), Some(trace_id)) = (record.context_id(), record.trace_id()) else {
            return;
        };

        let result = self
            .update(context_id, |session| {
                if !session.gen_trace_ids.iter().any(|id| id == trace_id) {
                    session.gen_trace_ids.push(trace_id.to_string());
                }
                Ok(())
            })
            .await;
        if let Err(exc) = result {
            warn!("failed to link trace {trace_id} to session {context_id}: {exc}");
        }
    }

    async fn process_stream_generate(&self, record: &LogRecord) {
        let Some(context_id) = record.context_id() else {
            return;
        };
        let Some(context) = record.get("context").filter(|v| v.is_object()) else {
            return;
        };

        let result = self
            .update(context_id, |session| {
                session.full_context = Some(context.clone());
                Ok(())
            })
            .await;
        if let Err(exc) = result {
            warn!("failed to store full context for session {context_id}: {exc}");
        }
    }

    async fn update<F>(&self, context_id: &str, mut mutate: F) -> StoreResult<Session>
    where
        F: FnMut(&mut Session) -> anyhow::Result<()>,
    {
        let session = self
            .sessions
            .read_modify_write(context_id, |session| {
                session.context_id = context_id.to_string();
                mutate(session)
            })
            .await?;
        let start_ms = session
            .start_time
            .map(|time| time.timestamp_millis())
            .unwrap_or(0);
        self.index.upsert(context_id, start_ms)?;
        Ok(session)
    }
}
