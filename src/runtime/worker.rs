//! Named single-thread task queues.
//!
//! Each camera session and each recording pipeline owns one [`Worker`]. Every
//! device callback, frame-available notification and control command for
//! that component is posted here, so its state is only ever touched from one
//! thread. GPU contexts rely on this for thread affinity.

use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{RecorderError, RecorderResult};

type Task = Box<dyn FnOnce() + Send>;

enum WorkerMessage {
    Run(Task),
    Shutdown,
}

/// Cloneable posting handle; does not keep the thread alive on its own.
#[derive(Clone)]
pub struct WorkerHandle {
    name: Arc<str>,
    tx: flume::Sender<WorkerMessage>,
}

impl WorkerHandle {
    /// Queue a task. Returns false if the worker has shut down.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let posted = self.tx.send(WorkerMessage::Run(Box::new(task))).is_ok();
        if !posted {
            log::trace!("[WORKER] '{}' is gone, task dropped", self.name);
        }
        posted
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Owner of one worker thread.
pub struct Worker {
    handle: WorkerHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Worker {
    pub fn spawn(name: impl Into<String>) -> RecorderResult<Self> {
        let name: String = name.into();
        let (tx, rx) = flume::unbounded::<WorkerMessage>();

        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        WorkerMessage::Run(task) => task(),
                        WorkerMessage::Shutdown => break,
                    }
                }
                log::debug!("[WORKER] '{}' exiting", thread_name);
            })
            .map_err(|e| {
                RecorderError::Other(format!("Failed to spawn worker '{}': {}", name, e))
            })?;

        let thread_id = thread.thread().id();
        Ok(Self {
            handle: WorkerHandle {
                name: Arc::from(name.as_str()),
                tx,
            },
            thread: Mutex::new(Some(thread)),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.post(task)
    }

    /// True when called from this worker's thread.
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Run `task` on the worker and wait for its result.
    ///
    /// Runs inline when already on the worker thread.
    pub fn call<R, F>(&self, timeout: Duration, task: F) -> RecorderResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(task());
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if !self.post(move || {
            let _ = reply_tx.send(task());
        }) {
            return Err(RecorderError::Released("worker"));
        }
        reply_rx.recv_timeout(timeout).map_err(|_| {
            RecorderError::Timeout(format!("worker '{}' did not answer", self.name()))
        })
    }

    /// Let queued tasks finish, then stop the thread. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.handle.tx.send(WorkerMessage::Shutdown);
        if self.is_current() {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                log::warn!("[WORKER] '{}' panicked", self.name());
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
