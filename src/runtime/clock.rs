//! Single coordination clock for every timer in the recorder.
//!
//! Segment rotation, recovery retries, barrier timeouts, health checks and
//! file-size diagnostics are all scheduled here. Each timer is a
//! `sleep_until` task on a current-thread tokio runtime driven by the clock's
//! own thread, which doubles as the neutral context that barrier completion
//! is posted to. Tasks should be short; long work is forwarded to the owning
//! worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::{RecorderError, RecorderResult};

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Default)]
struct ClockState {
    pending: HashMap<u64, CancellationToken>,
    next_id: u64,
    shutdown: bool,
}

struct ClockInner {
    handle: Handle,
    stop_token: CancellationToken,
    state: Mutex<ClockState>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

impl ClockInner {
    /// Claim a timer for firing. False if it was cancelled in the meantime.
    fn take(&self, id: u64) -> bool {
        self.state.lock().pending.remove(&id).is_some()
    }
}

/// Cloneable handle to the clock thread.
#[derive(Clone)]
pub struct CoordinationClock {
    inner: Arc<ClockInner>,
}

impl CoordinationClock {
    /// Spawn the clock thread and its runtime.
    pub fn start(name: &str) -> RecorderResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| RecorderError::Other(format!("Failed to build clock runtime: {}", e)))?;

        let inner = Arc::new(ClockInner {
            handle: runtime.handle().clone(),
            stop_token: CancellationToken::new(),
            state: Mutex::new(ClockState::default()),
            thread: Mutex::new(None),
            thread_id: Mutex::new(None),
        });

        let stop = inner.stop_token.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(stop.cancelled());
                log::debug!("[CLOCK] Clock thread exiting");
            })
            .map_err(|e| RecorderError::Other(format!("Failed to spawn clock thread: {}", e)))?;

        *inner.thread_id.lock() = Some(handle.thread().id());
        *inner.thread.lock() = Some(handle);
        Ok(Self { inner })
    }

    /// Run `task` on the clock thread after `delay`.
    pub fn schedule<F>(&self, label: &'static str, delay: Duration, task: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = tokio::time::Instant::now() + delay;
        let token = self.inner.stop_token.child_token();
        let id = {
            let mut state = self.inner.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            if state.shutdown {
                log::debug!("[CLOCK] Dropping timer '{}' after shutdown", label);
                return TimerId(id);
            }
            state.pending.insert(id, token.clone());
            id
        };

        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {},
                _ = tokio::time::sleep_until(deadline) => {
                    if inner.take(id) {
                        log::trace!("[CLOCK] Firing '{}'", label);
                        task();
                    }
                },
            }
        });
        TimerId(id)
    }

    /// Run `task` on the clock thread as soon as possible.
    pub fn post<F>(&self, label: &'static str, task: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(label, Duration::ZERO, task)
    }

    /// Cancel a timer. Returns true if it had not fired yet.
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.inner.state.lock().pending.remove(&id.0) {
            Some(token) => {
                token.cancel();
                true
            },
            None => false,
        }
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.inner.state.lock().pending.contains_key(&id.0)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// True when called from a timer task.
    pub fn is_clock_thread(&self) -> bool {
        *self.inner.thread_id.lock() == Some(std::thread::current().id())
    }

    /// Drop all pending timers and stop the thread. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.pending.clear();
        }
        self.inner.stop_token.cancel();

        if self.is_clock_thread() {
            return;
        }
        if let Some(handle) = self.inner.thread.lock().take() {
            if handle.join().is_err() {
                log::warn!("[CLOCK] Clock thread panicked");
            }
        }
    }
}

/// A single re-armable timer.
///
/// Re-arming always cancels the previous timer first, so a slot never has
/// two live firings.
#[derive(Default)]
pub struct TimerSlot {
    current: Mutex<Option<TimerId>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm<F>(&self, clock: &CoordinationClock, label: &'static str, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut current = self.current.lock();
        if let Some(previous) = current.take() {
            clock.cancel(previous);
        }
        *current = Some(clock.schedule(label, delay, task));
    }

    /// Cancel the armed timer, if any. Returns true if one was pending.
    pub fn cancel(&self, clock: &CoordinationClock) -> bool {
        match self.current.lock().take() {
            Some(id) => clock.cancel(id),
            None => false,
        }
    }

    pub fn is_armed(&self, clock: &CoordinationClock) -> bool {
        self.current
            .lock()
            .map(|id| clock.is_pending(id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let clock = CoordinationClock::start("test-clock").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        for (label, delay) in [("c", 60u64), ("a", 10), ("b", 30)] {
            let tx = tx.clone();
            clock.schedule("order", Duration::from_millis(delay), move || {
                let _ = tx.send(label);
            });
        }

        let fired: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(fired, vec!["a", "b", "c"]);
        clock.shutdown();
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let clock = CoordinationClock::start("test-clock").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = clock.schedule("cancel", Duration::from_millis(30), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(clock.is_pending(id));
        assert!(clock.cancel(id));
        assert!(!clock.cancel(id));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        clock.shutdown();
    }

    #[test]
    fn test_timer_slot_replaces_previous() {
        let clock = CoordinationClock::start("test-clock").unwrap();
        let slot = TimerSlot::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let h = Arc::clone(&hits);
            slot.arm(&clock, "slot", Duration::from_millis(20), move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(slot.is_armed(&clock));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!slot.is_armed(&clock));
        clock.shutdown();
    }

    #[test]
    fn test_post_runs_on_clock_thread() {
        let clock = CoordinationClock::start("test-clock").unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let c = clock.clone();
        clock.post("where", move || {
            let _ = tx.send(c.is_clock_thread());
        });
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        assert!(!clock.is_clock_thread());
        clock.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let clock = CoordinationClock::start("test-clock").unwrap();
        clock.schedule("late", Duration::from_secs(60), || {});
        assert_eq!(clock.pending_count(), 1);
        clock.shutdown();
        clock.shutdown();
        assert_eq!(clock.pending_count(), 0);
    }
}
