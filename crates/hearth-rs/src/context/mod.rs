//! Context window management: keep a thread inside a bounded budget across
//! arbitrarily many turns.
//!
//! A thread's stored history is never modified. Each model call gets a
//! bounded *view* built in stages:
//!
//! 0. **[`turns::repair_tool_pairs`]**: every `tool_call` immediately followed
//!    by its `tool_result`; dangling halves dropped.
//! 1. **[`turns::trim_turns`]**: at most `max_turns` user turns.
//! 2. **[`eviction`]**: old, large tool results replaced with
//!    `[Cleared: ...]` placeholders. No LLM call needed.
//! 3. **[`budget`]**: oldest non-pinned units dropped until the estimate fits
//!    `max_tokens - reserved_for_response`.
//! 4. **[`summarizer`]**: optional LLM compaction of turns beyond the
//!    retained window, recorded as append-only [`CompactionRecord`]s. Runs
//!    before stages 0 to 3.
//!
//! Stages 0 to 3 are pure functions composed by [`ContextManager`]. The
//! [`Session`] wrapper adds storage, compaction and an incremental token
//! cache; [`SessionFactory`] picks a policy by tier.

pub mod budget;
pub mod eviction;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod summarizer;
pub mod turns;

// Re-export commonly used items at the module level.
pub use budget::{
    CharEstimator, ContextBudget, ContextUsage, DEFAULT_CHARS_PER_TOKEN, KnownEstimates, TokenEstimator,
};
pub use eviction::EvictionConfig;
pub use pipeline::{BoundedItems, ContextManager, ContextReport};
pub use session::{PolicyTier, Session, SessionConfig, SessionFactory, TierPolicy};
pub use store::{InMemoryItemStore, ItemStore, StoreError};
pub use summarizer::{CompactionRecord, Summarizer, SummarizerConfig};

/// Errors from building a model input.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The pinned items alone do not fit. The caller decides whether to fail
    /// the turn or force-truncate the newest user message.
    #[error("pinned context needs ~{required} tokens but only {available} are available")]
    PolicyViolation { required: usize, available: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}
