use crate::callsites::{self, TraceKind};
use crate::model::{
    ExecuteRequest, ExecuteResponse, ExecuteTrace, GenerateRequest, GenerateResponse,
    GenerateTrace, Trace, TraceData,
};
use crate::record::LogRecord;
use crate::spans::{merge_spans, span_from_record};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace {trace_id}: no log record identifies the trace type")]
    Classification { trace_id: String },
    #[error("trace {trace_id}: failed to decode {field}: {message}")]
    Decode {
        trace_id: String,
        field: &'static str,
        message: String,
    },
}

/// Builds the trace for `trace_id` from every record logged under it.
///
/// Returns `Ok(None)` for trace types that are recognized but not
/// reconstructed (streaming generation).
pub fn build_trace(trace_id: &str, mut records: Vec<LogRecord>) -> Result<Option<Trace>, TraceError> {
    records.sort_by_key(LogRecord::time);

    let kind = records
        .iter()
        .find_map(|record| record.function().and_then(callsites::classify))
        .ok_or_else(|| TraceError::Classification {
            trace_id: trace_id.to_string(),
        })?;

    let mut trace = Trace {
        id: trace_id.to_string(),
        ..Trace::default()
    };

    let data = match kind {
        TraceKind::StreamGenerate => return Ok(None),
        TraceKind::Generate => {
            let mut generate = GenerateTrace::default();
            walk_records(&mut trace, &records, kind, |record, trace| {
                if generate.request.is_none() {
                    if let Some(request) = decode_payload::<GenerateRequest>(
                        trace_id,
                        "request",
                        record.request(),
                    )? {
                        generate.request = Some(request);
                        trace.start_time = record.time();
                    }
                }
                if generate.response.is_none() {
                    if let Some(response) = decode_payload::<GenerateResponse>(
                        trace_id,
                        "response",
                        record.response(),
                    )? {
                        generate.response = Some(response);
                        trace.end_time = record.time();
                    }
                }
                Ok(())
            })?;
            TraceData::Generate(generate)
        }
        TraceKind::Execute => {
            let mut execute = ExecuteTrace::default();
            walk_records(&mut trace, &records, kind, |record, trace| {
                if execute.request.is_none() {
                    if let Some(request) =
                        decode_payload::<ExecuteRequest>(trace_id, "request", record.request())?
                    {
                        execute.request = Some(request);
                        trace.start_time = record.time();
                    }
                }
                if execute.response.is_none() {
                    if let Some(response) = decode_payload::<ExecuteResponse>(
                        trace_id,
                        "response",
                        record.response(),
                    )? {
                        execute.response = Some(response);
                        trace.end_time = record.time();
                    }
                }
                Ok(())
            })?;
            TraceData::Execute(execute)
        }
    };

    trace.data = Some(data);
    Ok(Some(trace))
}

/// Applies the fields every trace type shares, handing records logged by the
/// entry point to `on_entry_point` for payload capture.
fn walk_records<F>(
    trace: &mut Trace,
    records: &[LogRecord],
    kind: TraceKind,
    mut on_entry_point: F,
) -> Result<(), TraceError>
where
    F: FnMut(&LogRecord, &mut Trace) -> Result<(), TraceError>,
{
    let mut spans = Vec::new();

    for record in records {
        if record.eval_mode() == Some(true) {
            trace.eval_mode = true;
        }

        match record.get("assertion") {
            Some(Value::Array(items)) => trace.assertions.extend(items.iter().cloned()),
            Some(assertion) => trace.assertions.push(assertion.clone()),
            None => {}
        }

        let function = record.function().unwrap_or_default();
        if callsites::is_site(function, kind.entry_point()) {
            on_entry_point(record, trace)?;
        }

        if let Some(span) = span_from_record(record) {
            spans.push(span);
        }
    }

    trace.spans = merge_spans(spans);
    Ok(())
}

fn decode_payload<T: DeserializeOwned>(
    trace_id: &str,
    field: &'static str,
    payload: Option<&Value>,
) -> Result<Option<T>, TraceError> {
    match payload {
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|err| TraceError::Decode {
                trace_id: trace_id.to_string(),
                field,
                message: err.to_string(),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const GENERATE_FN: &str = "github.com/acme/app/pkg/agent.(*Agent).Generate";
    const EXECUTE_FN: &str = "github.com/acme/app/pkg/executor.(*Executor).Execute";
    const RAG_FN: &str = "github.com/acme/app/pkg/learn.(*InMemoryExampleDB).GetExamples";

    fn record(value: Value) -> LogRecord {
        LogRecord::from_value(value).expect("object")
    }

    fn generate_records() -> Vec<LogRecord> {
        vec![
            record(json!({
                "traceID": "t1",
                "function": GENERATE_FN,
                "time": 20.0,
                "response": {"blocks": [{"id": "b1", "kind": "CODE", "contents": "ls"}]}
            })),
            record(json!({
                "traceID": "t1",
                "function": RAG_FN,
                "time": 15.0,
                "query": "list files",
                "example": {"id": "ex1"},
                "score": 0.5
            })),
            record(json!({
                "traceID": "t1",
                "function": GENERATE_FN,
                "time": 10.0,
                "evalMode": true,
                "request": {"doc": {"blocks": [{"id": "m1", "kind": "MARKUP", "contents": "how?"}]}}
            })),
        ]
    }

    #[test]
    fn generate_trace_spans_request_to_response() {
        let trace = build_trace("t1", generate_records())
            .expect("build")
            .expect("generate traces are built");

        assert_eq!(trace.id, "t1");
        assert_eq!(trace.start_time, Utc.timestamp_opt(10, 0).single());
        assert_eq!(trace.end_time, Utc.timestamp_opt(20, 0).single());
        assert!(trace.eval_mode);

        let generate = trace.generate().expect("generate data");
        let response = generate.response.as_ref().expect("response");
        assert_eq!(response.blocks[0].id, "b1");
        let request = generate.request.as_ref().expect("request");
        assert_eq!(request.doc.blocks[0].contents, "how?");

        assert_eq!(trace.spans.len(), 1);
        assert!(matches!(&trace.spans[0], Span::Rag(rag) if rag.query == "list files"));
    }

    #[test]
    fn rebuilding_from_same_records_is_identical() {
        let first = build_trace("t1", generate_records()).expect("first");
        let second = build_trace("t1", generate_records()).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn execute_trace_captures_outputs_and_assertions() {
        let records = vec![
            record(json!({
                "function": EXECUTE_FN,
                "time": 1.0,
                "request": {"block": {"id": "b1", "contents": "false"}},
                "assertion": {"name": "AssertCodeAfterMarkdown", "result": "PASSED"}
            })),
            record(json!({
                "function": EXECUTE_FN,
                "time": 2.0,
                "response": {"outputs": [{"items": [{"textData": "exitCode: 1"}]}]}
            })),
        ];

        let trace = build_trace("t2", records).expect("build").expect("execute trace");
        let execute = trace.execute().expect("execute data");
        assert_eq!(execute.request.as_ref().expect("request").block.id, "b1");
        let outputs = &execute.response.as_ref().expect("response").outputs;
        assert_eq!(outputs[0].exit_code(), Some(1));
        assert_eq!(trace.assertions.len(), 1);
        assert!(!trace.eval_mode);
    }

    #[test]
    fn streaming_traces_are_skipped() {
        let records = vec![record(json!({
            "function": "github.com/acme/app/pkg/agent.(*Agent).StreamGenerate",
            "time": 1.0
        }))];
        assert!(build_trace("t3", records).expect("not an error").is_none());
    }

    #[test]
    fn unknown_entry_point_is_a_classification_error() {
        let records = vec![record(json!({"function": "main.main", "time": 1.0}))];
        let err = build_trace("t4", records).expect_err("unclassified");
        assert!(matches!(err, TraceError::Classification { .. }));
    }

    #[test]
    fn malformed_payload_fails_the_build() {
        let records = vec![record(json!({
            "function": GENERATE_FN,
            "time": 1.0,
            "request": {"doc": {"blocks": "not-a-list"}}
        }))];
        let err = build_trace("t5", records).expect_err("decode failure");
        assert!(matches!(err, TraceError::Decode { field: "request", .. }));
    }

    #[test]
    fn completion_payloads_do_not_replace_entry_point_payloads() {
        let mut records = generate_records();
        records.push(record(json!({
            "function": "github.com/acme/app/pkg/anthropic.(*Completer).Complete",
            "time": 12.0,
            "request": {"model": "claude", "messages": []}
        })));

        let trace = build_trace("t1", records).expect("build").expect("trace");
        assert_eq!(trace.spans.len(), 2);
        assert!(matches!(&trace.spans[1], Span::Llm(llm) if llm.provider == "anthropic"));
    }
}
