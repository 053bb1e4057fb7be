//! External tool execution.

mod tool;

pub use tool::{ExecResult, ToolCommand, run_tool};
