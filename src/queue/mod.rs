//! Distributed task queue.
//!
//! The [`broker::Broker`] is the only state shared between the driver and
//! the worker processes; [`client::QueueClient`] is the driver's view of it.

pub mod broker;
pub mod client;
pub mod types;

pub use broker::{Broker, ClaimedTask};
pub use client::{QueueClient, WaitOptions, WaitOutcome};
pub use types::{PROGRESS_LOG_WINDOW, Progress, SubmittedTask, TaskHandle, TaskRecord, TaskState, TaskStatus};
