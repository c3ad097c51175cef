use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use weft_analyze::model::{SuggestionStatus, Trace};
use weft_analyze::{Analyzer, NoopNotifier};
use weft_config::AppConfig;
use weft_store::PageRequest;

const GENERATE_FN: &str = "github.com/acme/app/pkg/agent.(*Agent).Generate";
const LOG_EVENTS_FN: &str = "github.com/acme/app/pkg/agent.(*Agent).LogEvents.func1";

fn test_config(root: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.analyzer.log_dirs = vec![root.join("logs").display().to_string()];
    config.analyzer.state_dir = root.join("state").display().to_string();
    config.analyzer.watermark_file = root.join("state/watermark.json").display().to_string();
    config.analyzer.file_backoff_base_seconds = 0.01;
    config.analyzer.file_backoff_max_seconds = 0.05;
    config.analyzer.watch = false;
    config.store.retry_initial_ms = 1;
    config.store.retry_max_interval_ms = 10;
    config.store.retry_max_elapsed_seconds = 1.0;
    config.server.enabled = false;
    config
}

fn log_lines() -> Vec<String> {
    [
        json!({
            "function": LOG_EVENTS_FN,
            "time": 5.0,
            "event": {"eventId": "e0", "contextId": "ctx", "type": "SESSION_START"}
        }),
        json!({
            "function": GENERATE_FN,
            "traceID": "t1",
            "contextId": "ctx",
            "time": 10.0,
            "request": {"doc": {"blocks": [{"id": "m1", "kind": "MARKUP", "contents": "how?"}]}}
        }),
        json!({
            "function": GENERATE_FN,
            "traceID": "t1",
            "contextId": "ctx",
            "time": 20.0,
            "response": {"blocks": [{"id": "b1", "kind": "CODE", "contents": "ls"}]}
        }),
        json!({
            "function": LOG_EVENTS_FN,
            "time": 30.0,
            "event": {"eventId": "e1", "contextId": "ctx", "type": "ACCEPTED", "selectedId": "b1"}
        }),
    ]
    .iter()
    .map(|value| value.to_string())
    .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tails_a_log_file_into_traces_sessions_and_block_logs() {
    let root = tempfile::tempdir().expect("tempdir");
    let log_dir = root.path().join("logs");
    std::fs::create_dir_all(&log_dir).expect("create log dir");
    let log_path = log_dir.join("agent.jsonl");
    {
        let mut file = std::fs::File::create(&log_path).expect("create log");
        for line in log_lines() {
            writeln!(file, "{line}").expect("write line");
        }
    }
    let log_len = std::fs::metadata(&log_path).expect("metadata").len() as i64;

    let (file_tx, mut file_rx) = mpsc::unbounded_channel();
    let (block_tx, mut block_rx) = mpsc::unbounded_channel();
    let analyzer = Analyzer::new(test_config(root.path()), Arc::new(NoopNotifier))
        .expect("open analyzer")
        .with_file_signal(file_tx)
        .with_block_signal(block_tx);
    analyzer.run().expect("run analyzer");

    let processed = tokio::time::timeout(Duration::from_secs(5), file_rx.recv())
        .await
        .expect("file processed in time")
        .expect("file signal");
    assert_eq!(processed, log_path.display().to_string());

    let block = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let id = block_rx.recv().await.expect("block signal");
            assert_eq!(id, "b1");
            let log = analyzer
                .get_block_log("b1")
                .expect("read block log")
                .expect("block log exists");
            if log.generated_block.is_some() {
                return log;
            }
        }
    })
    .await
    .expect("block log rebuilt in time");

    assert_eq!(block.gen_trace_id, "t1");
    assert_eq!(block.suggestion_status, SuggestionStatus::Accepted);
    assert_eq!(
        block.doc.as_ref().map(|doc| doc.blocks[0].contents.as_str()),
        Some("how?")
    );

    let trace = analyzer
        .get_trace("t1")
        .expect("read trace")
        .expect("trace exists");
    assert_eq!(trace.start_time.map(|t| t.timestamp()), Some(10));
    assert_eq!(trace.end_time.map(|t| t.timestamp()), Some(20));

    let session = analyzer
        .get_session("ctx")
        .expect("read session")
        .expect("session exists");
    assert_eq!(session.gen_trace_ids, vec!["t1".to_string()]);
    assert_eq!(session.log_events.len(), 2);

    let page = analyzer
        .list_sessions(&PageRequest::default())
        .expect("list sessions");
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].start_unix_ms, 5_000);

    let watermark = analyzer.watermark();
    assert_eq!(watermark.file, log_path.display().to_string());
    assert_eq!(watermark.offset, log_len);

    analyzer.shutdown().await.expect("shutdown");
    let saved = std::fs::read_to_string(root.path().join("state/watermark.json"))
        .expect("watermark persisted");
    assert!(saved.contains("agent.jsonl"));
}

async fn run_once(root: &std::path::Path) -> (Vec<String>, Trace, usize) {
    let (file_tx, mut file_rx) = mpsc::unbounded_channel();
    let analyzer = Analyzer::new(test_config(root), Arc::new(NoopNotifier))
        .expect("open analyzer")
        .with_file_signal(file_tx);
    analyzer.run().expect("run analyzer");
    tokio::time::timeout(Duration::from_secs(5), file_rx.recv())
        .await
        .expect("file processed in time")
        .expect("file signal");

    let entries = analyzer
        .get_log_entries("t1")
        .expect("read raw lines")
        .expect("raw lines exist");
    let mut trace = analyzer
        .get_trace("t1")
        .expect("read trace")
        .expect("trace exists");
    trace.version.clear();
    let session = analyzer
        .get_session("ctx")
        .expect("read session")
        .expect("session exists");
    analyzer.shutdown().await.expect("shutdown");
    (entries.lines, trace, session.log_events.len())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarting_without_a_watermark_replays_idempotently() {
    let root = tempfile::tempdir().expect("tempdir");
    let log_dir = root.path().join("logs");
    std::fs::create_dir_all(&log_dir).expect("create log dir");
    let log_path = log_dir.join("agent.jsonl");
    {
        let mut file = std::fs::File::create(&log_path).expect("create log");
        for line in log_lines() {
            writeln!(file, "{line}").expect("write line");
        }
    }

    let (lines_before, trace_before, events_before) = run_once(root.path()).await;
    std::fs::remove_file(root.path().join("state/watermark.json")).expect("remove watermark");
    let (lines_after, trace_after, events_after) = run_once(root.path()).await;

    assert_eq!(lines_before.len(), 2);
    assert_eq!(lines_before, lines_after);
    assert_eq!(trace_before, trace_after);
    assert_eq!(events_before, events_after);
}
