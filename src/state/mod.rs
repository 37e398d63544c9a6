//! Run state and its persistence: the per-run record the coordinator
//! mutates, and the versioned stores it writes through.

pub mod run;
pub mod store;

pub use run::{HistoryEntry, RunEvent, RunId, RunState, RunStatus};
pub use store::{FileStore, MemoryStore, StateStore, StoreError};
