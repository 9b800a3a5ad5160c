//! Execution contexts: the coordination clock and per-component workers.

pub mod clock;
pub mod worker;

pub use clock::{CoordinationClock, TimerId, TimerSlot};
pub use worker::{Worker, WorkerHandle};
