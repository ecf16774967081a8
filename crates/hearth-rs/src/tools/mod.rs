//! Tool abstractions for LLM function-calling agents.
//!
//! Every agent capability (CRM lookups, chart rendering, asking the user) is
//! a [`Tool`] implementor. Tools are collected into a [`ToolSet`] which
//! handles dispatch, truncation and timeouts. A running tool receives a
//! [`ToolContext`] carrying the thread id and the turn's event sender, so it
//! can push events (such as a question group) to the client mid-turn.
//!
//! # Submodules
//!
//! - [`core`]: [`Tool`] trait, [`ToolSet`], [`ToolContext`].
//! - [`spec`]: [`ToolSpec`](spec::ToolSpec) builder for structured tool
//!   descriptions with `when_to_use` / `when_not_to_use` guidance.

pub mod core;
pub mod spec;

// Re-export commonly used items at the module level.
pub use core::{
    DEFAULT_MAX_RESULT_BYTES, EventSender, Tool, ToolContext, ToolFuture, ToolSet, parse_tool_args,
    truncate_result,
};
pub use spec::ToolSpec;
