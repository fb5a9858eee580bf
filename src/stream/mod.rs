//! Stream lifecycle: the slot table, stop signals, and per-slot workers.

mod manager;
mod signal;
mod slot;
mod worker;

pub use manager::{PipelineDeps, StartOutcome, StopOutcome, StreamManager};
pub use signal::StopSignal;
pub use slot::{SlotSnapshot, SlotState, StreamParams};
pub use worker::{WorkerSettings, WorkerState};
