use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    /// Items waiting out an `add_after` delay, keyed by timer id.
    delayed: HashMap<u64, T>,
    next_timer: u64,
    shutting_down: bool,
}

impl<T: Clone + Eq + Hash> QueueState<T> {
    /// Returns `true` when `item` became ready for a worker.
    fn enqueue(&mut self, item: T) -> bool {
        if self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return false;
        }
        self.queue.push_back(item);
        true
    }
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            delayed: HashMap::new(),
            next_timer: 0,
            shutting_down: false,
        }
    }
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

/// De-duplicating work queue.
///
/// An item already waiting is not queued twice. An item added while a worker
/// holds it is queued again once the worker calls [`WorkQueue::done`], so the
/// same item is never processed concurrently.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    /// `base_delay` and `max_delay` bound the per-item backoff applied by
    /// [`WorkQueue::add_rate_limited`].
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                base_delay,
                max_delay: max_delay.max(base_delay),
            }),
        }
    }

    pub fn add(&self, item: T) {
        let ready = {
            let mut state = self.shared.state.lock().expect("work queue mutex poisoned");
            !state.shutting_down && state.enqueue(item)
        };
        if ready {
            self.shared.notify.notify_one();
        }
    }

    /// Adds `item` once `delay` has passed. Items still waiting when the queue
    /// shuts down are queued immediately instead of being dropped.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let timer = {
            let mut state = self.shared.state.lock().expect("work queue mutex poisoned");
            if state.shutting_down {
                return;
            }
            let timer = state.next_timer;
            state.next_timer = state.next_timer.wrapping_add(1);
            state.delayed.insert(timer, item);
            timer
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.fire_timer(timer);
        });
    }

    fn fire_timer(&self, timer: u64) {
        let item = {
            let mut state = self.shared.state.lock().expect("work queue mutex poisoned");
            state.delayed.remove(&timer)
        };
        if let Some(item) = item {
            self.add(item);
        }
    }

    /// Re-adds `item` after a delay that doubles with each call until
    /// [`WorkQueue::forget`] clears it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.shared.state.lock().expect("work queue mutex poisoned");
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let exponent = (*failures).min(30);
            *failures = failures.saturating_add(1);
            self.backoff_delay(exponent)
        };
        self.add_after(item, delay);
    }

    fn backoff_delay(&self, exponent: u32) -> Duration {
        let factor = 2u32.saturating_pow(exponent);
        self.shared
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.shared.max_delay)
            .min(self.shared.max_delay)
    }

    pub fn forget(&self, item: &T) {
        let mut state = self.shared.state.lock().expect("work queue mutex poisoned");
        state.failures.remove(item);
    }

    #[cfg(test)]
    pub(crate) fn num_requeues(&self, item: &T) -> u32 {
        let state = self.shared.state.lock().expect("work queue mutex poisoned");
        state.failures.get(item).copied().unwrap_or(0)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down and
    /// every queued item has been handed out.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().expect("work queue mutex poisoned");
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks `item` as finished; re-queues it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.shared.state.lock().expect("work queue mutex poisoned");
            state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.shared.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        let state = self.shared.state.lock().expect("work queue mutex poisoned");
        state.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new items. Items already queued, and items still
    /// waiting on an `add_after` delay, are returned by [`WorkQueue::get`].
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("work queue mutex poisoned");
            let mut pending: Vec<(u64, T)> = state.delayed.drain().collect();
            pending.sort_by_key(|(timer, _)| *timer);
            for (_, item) in pending {
                state.enqueue(item);
            }
            state.shutting_down = true;
        }
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        let state = self.shared.state.lock().expect("work queue mutex poisoned");
        state.shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(Duration::from_millis(10), Duration::from_millis(40))
    }

    #[tokio::test]
    async fn duplicate_adds_collapse_until_dequeued() {
        let q = queue();
        q.add("b1".to_string());
        q.add("b1".to_string());
        q.add("b2".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("b1"));
        q.add("b1".to_string());
        // Still in flight: the re-add waits for done.
        assert_eq!(q.len(), 1);
        q.done(&"b1".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("b2"));
        assert_eq!(q.get().await.as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn shutdown_drains_then_returns_none() {
        let q = queue();
        q.add("a".to_string());
        q.shutdown();
        q.add("late".to_string());

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_a_waiting_worker() {
        let q = queue();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shutdown();

        let got = tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker woke up")
            .expect("worker joined");
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn add_after_delivers_later() {
        let q = queue();
        q.add_after("x".to_string(), Duration::from_millis(20));
        assert!(q.is_empty());

        let got = tokio::time::timeout(Duration::from_secs(2), q.get())
            .await
            .expect("item arrives");
        assert_eq!(got.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn shutdown_flushes_delayed_items() {
        let q = queue();
        q.add_after("slow".to_string(), Duration::from_secs(60));
        q.add("now".to_string());
        q.shutdown();

        assert_eq!(q.get().await.as_deref(), Some("now"));
        assert_eq!(q.get().await.as_deref(), Some("slow"));
        assert_eq!(q.get().await, None);

        q.add_after("late".to_string(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(q.is_empty());
    }

    #[test]
    fn rate_limited_delay_doubles_up_to_max() {
        let q = queue();
        assert_eq!(q.backoff_delay(0), Duration::from_millis(10));
        assert_eq!(q.backoff_delay(1), Duration::from_millis(20));
        assert_eq!(q.backoff_delay(2), Duration::from_millis(40));
        assert_eq!(q.backoff_delay(9), Duration::from_millis(40));
        assert_eq!(q.backoff_delay(30), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn forget_resets_requeue_count() {
        let q = queue();
        q.add_rate_limited("f".to_string());
        q.add_rate_limited("f".to_string());
        assert_eq!(q.num_requeues(&"f".to_string()), 2);

        q.forget(&"f".to_string());
        assert_eq!(q.num_requeues(&"f".to_string()), 0);
    }
}
