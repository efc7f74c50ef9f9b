//! Tool execution for agentwire.
//!
//! The [`ToolExecutor`] trait is the dispatch seam between the turn loop and
//! registered tools. Two strategies ship:
//!
//! - [`ConcurrentExecutor`] (default): every request at once, optionally
//!   bounded by a semaphore, fanned in with `join_all`.
//! - [`SequentialExecutor`]: one request at a time in model order, for tools
//!   whose side effects depend on each other.
//!
//! [`FnTool`] builds tools from closures.

pub mod executor;
pub mod fn_tool;

pub use executor::{
    ConcurrentExecutor, ExecutionEvent, ExecutionEvents, SequentialExecutor, ToolExecutor,
    executor_from_config, run_one,
};
pub use fn_tool::FnTool;
