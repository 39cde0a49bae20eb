//! Task module - subtask records and the per-run history.
//!
//! Every planning cycle of an agent produces exactly one [`SubtaskRecord`],
//! whether the chosen action succeeded or not. Records are owned by a single
//! run's [`SubtaskHistory`] and never shared between runs.

mod history;
mod subtask;

pub use history::SubtaskHistory;
pub use subtask::{SubtaskRecord, SubtaskStatus};
