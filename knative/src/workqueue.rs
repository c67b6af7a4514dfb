//! A keyed work queue: each key is queued at most once and handed to at most one worker at a time.
use futures::future::poll_fn;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::time::{delay_queue, DelayQueue};

/// Exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff { base, max }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(500), Duration::from_secs(300))
    }
}

#[derive(Debug)]
struct State<K> {
    queue: VecDeque<K>,
    /// Keys waiting in `queue`, or re-added while processing
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// One pending delayed add per key
    delayed: HashMap<K, delay_queue::Key>,
    timers: DelayQueue<K>,
    timer_running: bool,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

#[derive(Debug)]
struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    /// Wakes the timer task when it has nothing scheduled
    timer: Notify,
    backoff: Backoff,
}

/// Cloning shares the queue.
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        WorkQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff: Backoff) -> Self {
        WorkQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    delayed: HashMap::new(),
                    timers: DelayQueue::new(),
                    timer_running: false,
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                timer: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        // no code panics while holding the lock, recover the guard regardless
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue `key` unless it is already queued. A key that is being processed is queued again
    /// once [`WorkQueue::done`] is called for it.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Queue `key` after `delay`, replacing any earlier delayed add of the same key.
    ///
    /// All delays are served by a single timer task, started on first use and stopped by
    /// [`WorkQueue::shutdown`].
    pub fn add_after(&self, key: K, delay: Duration) {
        let start_timer = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            let state = &mut *state;
            match state.delayed.get(&key) {
                Some(timer) => state.timers.reset(timer, delay),
                None => {
                    let timer = state.timers.insert(key.clone(), delay);
                    state.delayed.insert(key, timer);
                }
            }
            !std::mem::replace(&mut state.timer_running, true)
        };

        self.inner.timer.notify_one();
        if start_timer {
            tokio::spawn(self.clone().run_timer());
        }
    }

    async fn run_timer(self) {
        while !self.is_shutting_down() {
            tokio::select! {
                Some(expired) = poll_fn(|cx| self.state().timers.poll_expired(cx)) => {
                    let key = expired.into_inner();
                    self.state().delayed.remove(&key);
                    self.add(key);
                }
                // a new delay or shutdown
                _ = self.inner.timer.notified() => {}
            }
        }
    }

    /// Keys with a delayed add pending.
    pub fn delayed_len(&self) -> usize {
        self.state().delayed.len()
    }

    /// Record a failure for `key` and requeue it after its backoff delay.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
        delay
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Clear the failure count and cancel any delayed add of `key`.
    pub fn forget(&self, key: &K) {
        let mut state = self.state();
        state.failures.remove(key);
        if let Some(timer) = state.delayed.remove(key) {
            state.timers.remove(&timer);
        }
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed, queueing it again if it was added in the meantime.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        let mut state = self.state();
        state.shutting_down = true;
        state.delayed.clear();
        state.timers.clear();
        drop(state);
        self.inner.notify.notify_waiters();
        self.inner.timer.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::time::timeout;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Backoff::new(Duration::from_millis(10), Duration::from_millis(40)))
    }

    async fn next(queue: &WorkQueue<&'static str>) -> Option<&'static str> {
        timeout(Duration::from_millis(500), queue.get()).await.ok().flatten()
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(64), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn keys_are_coalesced_in_fifo_order() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(next(&q).await, Some("a"));
        assert_eq!(next(&q).await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let q = queue();
        q.add("a");
        assert_eq!(next(&q).await, Some("a"));

        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 1);
        assert_eq!(next(&q).await, Some("b"));

        q.done(&"a");
        assert_eq!(next(&q).await, Some("a"));
        q.done(&"a");
        q.done(&"b");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn waiting_worker_is_woken() {
        let q = queue();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("a");
        assert_eq!(timeout(Duration::from_millis(500), worker).await.unwrap().unwrap(), Some("a"));
    }

    #[tokio::test]
    async fn shutdown_releases_workers() {
        let q = queue();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(timeout(Duration::from_millis(500), worker).await.unwrap().unwrap(), None);
        q.add("a");
        assert!(q.is_empty());
        assert!(q.is_shutting_down());
    }

    #[tokio::test]
    async fn later_delay_supersedes_earlier() {
        let q = queue();
        q.add_after("a", Duration::from_millis(300));
        q.add_after("a", Duration::from_millis(10));
        assert_eq!(next(&q).await, Some("a"));
        q.done(&"a");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn repeated_delays_keep_one_timer_per_key() {
        let q = queue();
        for _ in 0..100 {
            q.add_after("a", Duration::from_secs(600));
        }
        q.add_after("b", Duration::from_secs(600));
        assert_eq!(q.delayed_len(), 2);

        q.add_after("a", Duration::from_millis(10));
        assert_eq!(next(&q).await, Some("a"));
        assert_eq!(q.delayed_len(), 1);

        q.forget(&"b");
        assert_eq!(q.delayed_len(), 0);
        q.shutdown();
        assert_eq!(q.delayed_len(), 0);
    }

    #[tokio::test]
    async fn forget_cancels_delayed_adds_and_failures() {
        let q = queue();
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(20));
        assert_eq!(q.failures(&"a"), 2);
        q.forget(&"a");
        assert_eq!(q.failures(&"a"), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(q.is_empty());
    }
}
