//! Worker side: the pool process and the driver's handle on its lifetime.

pub mod lifecycle;
pub mod pool;

pub use lifecycle::{EnsureOutcome, ProcessSpawner, WorkerLifecycle, WorkerSpawner};
pub use pool::{RunningTasks, SHUTDOWN_ERROR, WorkerPool, run};
