//! Frame hand-off endpoints.
//!
//! A [`Surface`] is a single-slot frame buffer shared between one producer
//! (a camera session or a renderer) and one consumer (a preview, a renderer or
//! an encoder). The producer queues frames; the consumer is woken through a
//! frame-available listener and latches the newest frame. A frame that is
//! replaced before it is latched counts as dropped, so a slow consumer never
//! builds a backlog.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::frame::VideoFrame;

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

type FrameListener = Arc<dyn Fn() + Send + Sync>;

struct SurfaceShared {
    id: u64,
    label: String,
    pending: Mutex<Option<VideoFrame>>,
    listener: Mutex<Option<FrameListener>>,
    released: AtomicBool,
    queued: AtomicU64,
    dropped: AtomicU64,
}

/// Cloneable handle to a frame hand-off endpoint.
#[derive(Clone)]
pub struct Surface {
    inner: Arc<SurfaceShared>,
}

impl Surface {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SurfaceShared {
                id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                pending: Mutex::new(None),
                listener: Mutex::new(None),
                released: AtomicBool::new(false),
                queued: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Queue a frame for the consumer.
    ///
    /// Returns false if the surface was released.
    pub fn queue_frame(&self, frame: VideoFrame) -> bool {
        if self.is_released() {
            return false;
        }

        let replaced = self.inner.pending.lock().replace(frame).is_some();
        self.inner.queued.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }

        let listener = self.inner.listener.lock().clone();
        if let Some(listener) = listener {
            listener();
        }
        true
    }

    /// Take the newest pending frame, if any.
    pub fn acquire_latest(&self) -> Option<VideoFrame> {
        self.inner.pending.lock().take()
    }

    pub fn has_pending(&self) -> bool {
        self.inner.pending.lock().is_some()
    }

    /// Install the frame-available callback. It runs on the producer's thread.
    pub fn set_frame_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.listener.lock() = Some(Arc::new(listener));
    }

    pub fn clear_frame_listener(&self) {
        self.inner.listener.lock().take();
    }

    /// Stop accepting frames and drop any pending one. Idempotent.
    pub fn release(&self) {
        if !self.inner.released.swap(true, Ordering::SeqCst) {
            self.inner.pending.lock().take();
            self.clear_frame_listener();
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn frames_queued(&self) -> u64 {
        self.inner.queued.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn same_as(&self, other: &Surface) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::FrameSize;

    fn frame(ts: i64) -> VideoFrame {
        VideoFrame::solid(FrameSize::new(2, 2), [0, 0, 0, 255], ts)
    }

    #[test]
    fn test_latest_frame_wins() {
        let surface = Surface::new("test");
        assert!(surface.queue_frame(frame(1)));
        assert!(surface.queue_frame(frame(2)));

        let latched = surface.acquire_latest().unwrap();
        assert_eq!(latched.timestamp_ns, 2);
        assert!(surface.acquire_latest().is_none());
        assert_eq!(surface.frames_queued(), 2);
        assert_eq!(surface.frames_dropped(), 1);
    }

    #[test]
    fn test_listener_fires_per_frame() {
        let surface = Surface::new("test");
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        surface.set_frame_listener(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        surface.queue_frame(frame(1));
        surface.queue_frame(frame(2));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_released_surface_rejects_frames() {
        let surface = Surface::new("test");
        surface.queue_frame(frame(1));
        surface.release();
        surface.release();

        assert!(surface.is_released());
        assert!(surface.acquire_latest().is_none());
        assert!(!surface.queue_frame(frame(2)));
    }

    #[test]
    fn test_clones_share_state() {
        let a = Surface::new("shared");
        let b = a.clone();
        a.queue_frame(frame(5));
        assert!(b.same_as(&a));
        assert_eq!(b.acquire_latest().map(|f| f.timestamp_ns), Some(5));
        assert!(!Surface::new("other").same_as(&a));
    }
}
