use crate::queue::WorkQueue;
use crate::{
    FileItem, Metrics, WATCHER_BACKEND_MIXED, WATCHER_BACKEND_NATIVE, WATCHER_BACKEND_POLL,
    WATCHER_BACKEND_UNKNOWN,
};
use anyhow::{Context, Result};
use glob::glob;
use notify::{
    event::{EventKind, ModifyKind},
    Config as NotifyConfig, Event, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const LOG_EXTENSIONS: [&str; 2] = ["json", "jsonl"];
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

enum ActiveWatcher {
    Recommended(RecommendedWatcher),
    Poll(PollWatcher),
}

impl ActiveWatcher {
    fn watch(&mut self, path: &Path, mode: RecursiveMode) -> notify::Result<()> {
        match self {
            Self::Recommended(watcher) => watcher.watch(path, mode),
            Self::Poll(watcher) => watcher.watch(path, mode),
        }
    }
}

#[derive(Clone, Copy)]
enum WatcherBackend {
    Native,
    Poll,
}

impl WatcherBackend {
    fn state(self) -> u64 {
        match self {
            Self::Native => WATCHER_BACKEND_NATIVE,
            Self::Poll => WATCHER_BACKEND_POLL,
        }
    }
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct WatchRegistration {
    metrics: Arc<Metrics>,
    registered: bool,
}

impl WatchRegistration {
    fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            registered: false,
        }
    }

    fn mark_registered(&mut self) {
        if self.registered {
            return;
        }
        self.metrics
            .watcher_registrations
            .fetch_add(1, Ordering::Relaxed);
        self.registered = true;
    }
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        self.metrics
            .watcher_registrations
            .fetch_sub(1, Ordering::Relaxed);
    }
}

fn record_backend(metrics: &Metrics, backend: WatcherBackend) {
    let next = backend.state();
    let mut current = metrics.watcher_backend_state.load(Ordering::Relaxed);

    loop {
        let merged = match (current, next) {
            (WATCHER_BACKEND_UNKNOWN, value) => value,
            (value, next_value) if value == next_value => value,
            _ => WATCHER_BACKEND_MIXED,
        };

        match metrics.watcher_backend_state.compare_exchange(
            current,
            merged,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

fn record_watcher_error(metrics: &Metrics, message: &str) {
    warn!("{message}");
    metrics.watcher_error_count.fetch_add(1, Ordering::Relaxed);
    metrics.record_error(message);
}

fn record_rescan(metrics: &Metrics) {
    metrics.watcher_reset_count.fetch_add(1, Ordering::Relaxed);
    metrics
        .watcher_last_reset_unix_ms
        .store(unix_ms_now(), Ordering::Relaxed);
}

fn event_requires_rescan(event: &Event) -> bool {
    event.paths.is_empty() || event.need_rescan()
}

fn event_is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Any | EventKind::Create(_) => true,
        EventKind::Modify(modify_kind) => matches!(
            modify_kind,
            ModifyKind::Any | ModifyKind::Data(_) | ModifyKind::Name(_)
        ),
        _ => false,
    }
}

fn is_log_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| LOG_EXTENSIONS.contains(&ext))
}

fn event_log_paths(event: &Event) -> Vec<String> {
    let mut dedup = BTreeSet::<String>::new();
    for path in &event.paths {
        if is_log_file(path) {
            dedup.insert(path.to_string_lossy().to_string());
        }
    }
    dedup.into_iter().collect()
}

/// Lists `.json` and `.jsonl` files under `log_dirs`, sorted.
pub fn discover_log_files(log_dirs: &[String]) -> Result<Vec<String>> {
    let mut files = BTreeSet::<String>::new();
    for dir in log_dirs {
        for ext in LOG_EXTENSIONS {
            let pattern = format!("{}/**/*.{ext}", dir.trim_end_matches('/'));
            for entry in glob(&pattern).with_context(|| format!("invalid glob: {pattern}"))? {
                match entry {
                    Ok(path) if path.is_file() => {
                        files.insert(path.to_string_lossy().to_string());
                    }
                    Ok(_) => {}
                    Err(exc) => warn!("glob iteration error: {exc}"),
                }
            }
        }
    }
    Ok(files.into_iter().collect())
}

/// Queues every discovered file. Only the last one, which sorts after every
/// finished file, is expected to keep growing.
pub(crate) fn enqueue_discovered(queue: &WorkQueue<FileItem>, files: Vec<String>) {
    let last = files.len().saturating_sub(1);
    for (idx, path) in files.into_iter().enumerate() {
        queue.add(FileItem {
            path,
            active: idx == last,
        });
    }
}

fn queue_rescan(log_dirs: &[String], queue: &WorkQueue<FileItem>, metrics: &Metrics) {
    record_rescan(metrics);
    match discover_log_files(log_dirs) {
        Ok(files) => enqueue_discovered(queue, files),
        Err(exc) => record_watcher_error(metrics, &format!("rescan failed: {exc:#}")),
    }
}

fn create_watcher(
    metrics: &Metrics,
    event_tx: std::sync::mpsc::Sender<notify::Result<Event>>,
) -> Option<ActiveWatcher> {
    let native_tx = event_tx.clone();
    match notify::recommended_watcher(move |res| {
        let _ = native_tx.send(res);
    }) {
        Ok(watcher) => {
            record_backend(metrics, WatcherBackend::Native);
            info!("watcher backend native");
            Some(ActiveWatcher::Recommended(watcher))
        }
        Err(exc) => {
            record_watcher_error(
                metrics,
                &format!("native watcher create failed: {exc}; falling back to poll watcher"),
            );
            let poll_config = NotifyConfig::default().with_poll_interval(Duration::from_secs(2));
            match PollWatcher::new(
                move |res| {
                    let _ = event_tx.send(res);
                },
                poll_config,
            ) {
                Ok(watcher) => {
                    record_backend(metrics, WatcherBackend::Poll);
                    info!("watcher backend poll");
                    Some(ActiveWatcher::Poll(watcher))
                }
                Err(poll_exc) => {
                    record_watcher_error(
                        metrics,
                        &format!("poll watcher create failed: {poll_exc}"),
                    );
                    None
                }
            }
        }
    }
}

/// Watches `log_dirs` on a background thread and queues changed log files as
/// active. The thread exits once `queue` shuts down.
pub(crate) fn spawn_watcher_thread(
    log_dirs: Vec<String>,
    queue: WorkQueue<FileItem>,
    metrics: Arc<Metrics>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let (event_tx, event_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let Some(mut watcher) = create_watcher(&metrics, event_tx) else {
            queue_rescan(&log_dirs, &queue, &metrics);
            return;
        };

        let mut registrations = Vec::new();
        for dir in &log_dirs {
            let root = PathBuf::from(dir);
            info!("starting watcher on {}", root.display());
            if let Err(exc) = watcher.watch(root.as_path(), RecursiveMode::Recursive) {
                record_watcher_error(
                    &metrics,
                    &format!("watch root register failed for {}: {exc}", root.display()),
                );
                continue;
            }
            let mut registration = WatchRegistration::new(metrics.clone());
            registration.mark_registered();
            registrations.push(registration);
        }

        loop {
            match event_rx.recv_timeout(SHUTDOWN_POLL) {
                Ok(Ok(event)) => {
                    if event_requires_rescan(&event) {
                        queue_rescan(&log_dirs, &queue, &metrics);
                        continue;
                    }

                    if !event_is_relevant(&event.kind) {
                        continue;
                    }

                    for path in event_log_paths(&event) {
                        queue.add(FileItem { path, active: true });
                    }
                }
                Ok(Err(exc)) => {
                    record_watcher_error(&metrics, &format!("watcher event error: {exc}"));
                    queue_rescan(&log_dirs, &queue, &metrics);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if queue.is_shutting_down() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("watcher thread stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::{
        event::{CreateKind, DataChange, Flag, ModifyKind, RenameMode},
        EventKind,
    };

    #[test]
    fn rescan_events_require_reconcile() {
        let event = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert!(event_requires_rescan(&event));
    }

    #[test]
    fn relevant_event_kinds_include_create_modify_data_and_rename() {
        assert!(event_is_relevant(&EventKind::Create(CreateKind::Any)));
        assert!(event_is_relevant(&EventKind::Modify(ModifyKind::Data(
            DataChange::Any
        ))));
        assert!(event_is_relevant(&EventKind::Modify(ModifyKind::Name(
            RenameMode::Any
        ))));
        assert!(!event_is_relevant(&EventKind::Remove(
            notify::event::RemoveKind::Any
        )));
    }

    #[test]
    fn log_paths_are_deduped_and_filtered() {
        let mut event = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Any)));
        event.paths = vec![
            PathBuf::from("/tmp/a.jsonl"),
            PathBuf::from("/tmp/a.jsonl"),
            PathBuf::from("/tmp/b.json"),
            PathBuf::from("/tmp/c.txt"),
        ];

        let paths = event_log_paths(&event);
        assert_eq!(
            paths,
            vec!["/tmp/a.jsonl".to_string(), "/tmp/b.json".to_string()]
        );
    }

    #[test]
    fn watcher_registration_tracks_active_watches() {
        let metrics = Arc::new(Metrics::default());
        assert_eq!(metrics.watcher_registrations.load(Ordering::Relaxed), 0);

        {
            let mut registration = WatchRegistration::new(metrics.clone());
            registration.mark_registered();
            assert_eq!(metrics.watcher_registrations.load(Ordering::Relaxed), 1);
        }

        assert_eq!(metrics.watcher_registrations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn discovery_finds_nested_logs_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("2024");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(nested.join("b.jsonl"), "").expect("write b");
        std::fs::write(dir.path().join("a.json"), "").expect("write a");
        std::fs::write(dir.path().join("notes.txt"), "").expect("write txt");

        let root = dir.path().to_string_lossy().to_string();
        let files = discover_log_files(&[root.clone()]).expect("discover");
        assert_eq!(
            files,
            vec![format!("{root}/2024/b.jsonl"), format!("{root}/a.json")]
        );
    }

    #[tokio::test]
    async fn only_the_last_discovered_file_is_active() {
        let queue = WorkQueue::new(Duration::from_millis(1), Duration::from_millis(1));
        enqueue_discovered(&queue, vec!["/l/a.jsonl".to_string(), "/l/b.jsonl".to_string()]);

        let first = queue.get().await.expect("first");
        let second = queue.get().await.expect("second");
        assert_eq!((first.path.as_str(), first.active), ("/l/a.jsonl", false));
        assert_eq!((second.path.as_str(), second.active), ("/l/b.jsonl", true));
    }
}
