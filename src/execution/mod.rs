//! Execution of detected opportunities through the external broadcaster.

pub mod broadcaster;
pub mod trigger;

pub use broadcaster::{Broadcaster, ExecutionRequest, HttpBroadcaster};
pub use trigger::{ExecutionConfig, ExecutionTrigger, JOURNAL_FILE};
