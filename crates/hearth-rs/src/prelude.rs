//! Convenience re-exports for common `hearth-rs` types.
//!
//! ```ignore
//! use hearth_rs::prelude::*;
//! ```
//!
//! Covers what a server needs to run turns: items, the provider seam,
//! sessions, tools, suspension and the keepalive wrapper. Pipeline stages
//! and estimator internals stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Content, Item, ItemKind, Role, ToolDef, json_schema_for};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{Toggle, TurnConfig, TurnError, TurnRunner, TurnStream};

// ── Provider and streaming ──────────────────────────────────────────
pub use crate::api::{
    GenerateConfig, Generation, KeepaliveConfig, LlmProvider, OpenRouterProvider, ProviderError,
    RetryConfig, StreamEvent, collect_text, with_keepalive,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    ContextBudget, ContextError, InMemoryItemStore, ItemStore, PolicyTier, Session, SessionConfig,
    SessionFactory, SummarizerConfig,
};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{Tool, ToolContext, ToolFuture, ToolSet, ToolSpec, parse_tool_args};

// ── Suspension ──────────────────────────────────────────────────────
pub use crate::suspension::{
    AskUserTool, QuestionInput, QuestionItem, Responses, SubmitOutcome, SuspensionStore,
};
