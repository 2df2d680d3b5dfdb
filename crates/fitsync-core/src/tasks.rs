//! Cancellable scheduled work tied to a component's lifetime.
//!
//! Every delayed re-check, debounced refresh, notification timer and channel
//! pump runs inside a [`TaskScope`]. Shutting the scope down aborts all of it,
//! and nothing spawned afterwards ever runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct ScopeInner {
    closed: bool,
    next_token: u64,
    keyed: HashMap<String, (u64, JoinHandle<()>)>,
    unkeyed: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct TaskScope {
    name: &'static str,
    inner: Arc<Mutex<ScopeInner>>,
}

impl std::fmt::Debug for TaskScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskScope")
            .field("name", &self.name)
            .field("closed", &inner.closed)
            .field("pending", &inner.keyed.len())
            .finish()
    }
}

impl TaskScope {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(ScopeInner::default())),
        }
    }

    /// Spawn a long-running task. Returns false if the scope is closed.
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            tracing::debug!(scope = self.name, "spawn on closed scope ignored");
            return false;
        }
        inner.unkeyed.retain(|h| !h.is_finished());
        inner.unkeyed.push(tokio::spawn(fut));
        true
    }

    /// Run `fut` after `delay`, replacing any pending task with the same key.
    pub fn schedule<F>(&self, key: &str, delay: Duration, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule_inner(key, delay, fut, true)
    }

    /// Run `fut` after `delay` unless a task with the same key is already
    /// pending, in which case the request coalesces into it.
    pub fn schedule_if_idle<F>(&self, key: &str, delay: Duration, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule_inner(key, delay, fut, false)
    }

    fn schedule_inner<F>(&self, key: &str, delay: Duration, fut: F, replace: bool) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }

        if let Some((_, existing)) = inner.keyed.get(key) {
            if !existing.is_finished() {
                if !replace {
                    return false;
                }
                existing.abort();
            }
        }

        inner.next_token += 1;
        let token = inner.next_token;
        let scope = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The slot frees up before the work runs, so the work itself (or
            // an event that arrives meanwhile) can schedule the next round.
            // The handle stays in the scope until shutdown or completion.
            {
                let mut inner = scope.lock();
                if matches!(inner.keyed.get(&owned_key), Some((t, _)) if *t == token) {
                    if let Some((_, handle)) = inner.keyed.remove(&owned_key) {
                        inner.unkeyed.retain(|h| !h.is_finished());
                        inner.unkeyed.push(handle);
                    }
                }
            }
            fut.await;
        });
        inner.keyed.insert(key.to_string(), (token, handle));
        true
    }

    pub fn cancel(&self, key: &str) -> bool {
        match self.inner.lock().keyed.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner
            .lock()
            .keyed
            .get(key)
            .map(|(_, h)| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Abort everything and refuse new work.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let keyed = std::mem::take(&mut inner.keyed);
        let unkeyed = std::mem::take(&mut inner.unkeyed);
        drop(inner);

        let cancelled = keyed.len() + unkeyed.iter().filter(|h| !h.is_finished()).count();
        for (_, handle) in keyed.into_values() {
            handle.abort();
        }
        for handle in unkeyed {
            handle.abort();
        }
        tracing::debug!(scope = self.name, cancelled, "task scope shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_after_delay() {
        let scope = TaskScope::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        scope.schedule("k", Duration::from_millis(100), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(scope.is_pending("k"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!scope.is_pending("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_work_already_running() {
        let scope = TaskScope::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        scope.schedule("slow", Duration::from_millis(10), async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.fetch_add(1, Ordering::SeqCst);
        });

        // Past the delay: the slot is free and the body is mid-flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!scope.is_pending("slow"));

        scope.shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_if_idle_coalesces() {
        let scope = TaskScope::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let h = hits.clone();
            scope.schedule_if_idle("refresh", Duration::from_millis(10), async move {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_and_future_work() {
        let scope = TaskScope::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        scope.schedule("k", Duration::from_millis(10), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        scope.shutdown();

        let h = hits.clone();
        assert!(!scope.spawn(async move {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(scope.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_single_key() {
        let scope = TaskScope::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        scope.schedule("a", Duration::from_millis(10), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = hits.clone();
        scope.schedule("b", Duration::from_millis(10), async move {
            h.fetch_add(10, Ordering::SeqCst);
        });

        assert!(scope.cancel("a"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }
}
