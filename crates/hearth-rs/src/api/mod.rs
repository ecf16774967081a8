//! Everything between a running turn and the outside world.
//!
//! - [`provider`]: the [`LlmProvider`] seam (`generate(messages, config)`)
//!   and the OpenRouter adapter.
//! - [`retry`]: transient error detection with exponential backoff. Never
//!   retries 400/401 errors.
//! - [`streaming`]: [`StreamEvent`], the tagged value written to clients as
//!   newline-delimited JSON.
//! - [`keepalive`]: wraps any event stream and injects keepalive events when
//!   it goes quiet.

pub mod keepalive;
pub mod provider;
pub mod retry;
pub mod streaming;

// Re-export commonly used items at the module level.
pub use keepalive::{Keepalive, KeepaliveConfig, KeepaliveEvent, with_keepalive};
pub use provider::{
    GenerateConfig, Generation, LlmProvider, OpenRouterProvider, ProviderError, ToolInvocation,
    Usage,
};
pub use retry::RetryConfig;
pub use streaming::{StreamEvent, collect_text};
