pub mod batch;
pub mod bundle;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod invoker;
pub mod logstream;
pub mod queue;
pub mod store;
pub mod worker;
