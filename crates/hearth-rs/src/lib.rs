//! Runtime substrate for long-running, resource-bounded, interruptible agent
//! conversations.
//!
//! `hearth-rs` does not talk to users and does not decide what an agent says.
//! It provides the machinery underneath a multi-turn agent so that a
//! conversation can run for hundreds of turns, stream for minutes, and pause
//! for hours without falling over:
//!
//! - **Context window management** ([`context`]): turns a thread's full,
//!   append-only item history into a bounded model input: pair repair,
//!   turn-count trimming, stale tool-result clearing, token-budget enforcement
//!   and LLM-based compaction. The [`Session`](context::session::Session)
//!   wrapper intercepts reads and appends and keeps an incremental token cache.
//!
//! - **Streaming keepalive** ([`api::keepalive`]): wraps a turn's event stream
//!   and injects `{"type":"keepalive"}` events whenever the real stream goes
//!   quiet, so proxies and load balancers do not cut idle connections.
//!
//! - **Suspension** ([`suspension`]): lets a tool park the running turn until
//!   a human answers a group of questions, and lets a later, unrelated request
//!   resume it with exactly that answer.
//!
//! The LLM call and the item store are collaborators behind the
//! [`LlmProvider`](api::provider::LlmProvider) and
//! [`ItemStore`](context::store::ItemStore) traits. A reference orchestrator,
//! [`TurnRunner`](agent::turn::TurnRunner), wires everything together.
//!
//! # Getting started
//!
//! ```ignore
//! use hearth_rs::prelude::*;
//! use std::sync::Arc;
//!
//! let provider = Arc::new(OpenRouterProvider::new(api_key)?);
//! let store: Arc<dyn ItemStore> = Arc::new(InMemoryItemStore::default());
//! let suspensions = SuspensionStore::new();
//!
//! let factory = SessionFactory::new(store).with_summarizer_provider(provider.clone());
//! let session = Arc::new(factory.session("thread-1", &PolicyTier::Standard));
//!
//! let tools = ToolSet::new().with(AskUserTool::new(suspensions.clone()));
//! let runner = TurnRunner::new(provider, tools, TurnConfig::default());
//!
//! let events = with_keepalive(runner.run(session, "Book me a room"), KeepaliveConfig::default());
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Budget, trimming, eviction, summarization, sessions, item stores |
//! | [`api`] | Provider seam, retry, stream events, keepalive multiplexer |
//! | [`suspension`] | Question groups, suspension store, `ask_user` tool, question extraction |
//! | [`tools`] | [`Tool`](tools::Tool) trait and [`ToolSet`](tools::ToolSet) dispatch |
//! | [`agent`] | Turn runner and its configuration |

pub mod agent;
pub mod api;
pub mod context;
pub mod prelude;
pub mod suspension;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export schemars for downstream crates that define tools.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` for a tool argument type.
///
/// # Example
///
/// ```
/// use hearth_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct LookupArgs {
///     order_id: String,
/// }
///
/// let schema = json_schema_for::<LookupArgs>();
/// assert_eq!(schema["type"], "object");
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Item types ─────────────────────────────────────────────────────

/// What an [`Item`] is. Determines its [`Role`] and how the context
/// pipeline treats it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    UserMessage,
    AssistantMessage,
    ToolCall,
    ToolResult,
    SystemNote,
}

impl ItemKind {
    pub fn role(self) -> Role {
        match self {
            ItemKind::UserMessage => Role::User,
            ItemKind::AssistantMessage | ItemKind::ToolCall => Role::Assistant,
            ItemKind::ToolResult => Role::Tool,
            ItemKind::SystemNote => Role::System,
        }
    }
}

/// Wire role of an item.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Item payload: plain text or a structured JSON value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Structured(serde_json::Value),
}

impl Content {
    /// The text, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(t) => Some(t),
            Content::Structured(_) => None,
        }
    }

    /// Render as a string. Structured payloads are serialized as compact JSON.
    pub fn to_text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Structured(v) => v.to_string(),
        }
    }

    /// Length in characters of the rendered payload.
    pub fn char_len(&self) -> usize {
        match self {
            Content::Text(t) => t.chars().count(),
            Content::Structured(v) => v.to_string().chars().count(),
        }
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<serde_json::Value> for Content {
    fn from(v: serde_json::Value) -> Self {
        Content::Structured(v)
    }
}

/// One entry in a thread's append-only history.
///
/// `tool_call` and `tool_result` items share a `call_id`. Both carry the
/// tool's name in `tool_name` so a cleared result can still say what it was.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Item {
    pub id: String,
    pub kind: ItemKind,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Item {
    fn new(kind: ItemKind, content: Content) -> Self {
        Self {
            id: new_item_id(),
            kind,
            content,
            call_id: None,
            tool_name: None,
        }
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(ItemKind::UserMessage, content.into())
    }

    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(ItemKind::AssistantMessage, content.into())
    }

    pub fn system_note(content: impl Into<Content>) -> Self {
        Self::new(ItemKind::SystemNote, content.into())
    }

    /// A tool invocation requested by the model. `arguments` is the raw JSON
    /// argument payload.
    pub fn tool_call(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: impl Into<Content>,
    ) -> Self {
        let mut item = Self::new(ItemKind::ToolCall, arguments.into());
        item.call_id = Some(call_id.into());
        item.tool_name = Some(tool_name.into());
        item
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<Content>,
    ) -> Self {
        let mut item = Self::new(ItemKind::ToolResult, output.into());
        item.call_id = Some(call_id.into());
        item.tool_name = Some(tool_name.into());
        item
    }

    /// Replace the generated id with a caller-chosen one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn role(&self) -> Role {
        self.kind.role()
    }

    pub fn is_user_message(&self) -> bool {
        self.kind == ItemKind::UserMessage
    }

    pub fn is_system_note(&self) -> bool {
        self.kind == ItemKind::SystemNote
    }

    /// Whether `other` is the `tool_result` answering this `tool_call`.
    pub fn is_answered_by(&self, other: &Item) -> bool {
        self.kind == ItemKind::ToolCall
            && other.kind == ItemKind::ToolResult
            && self.call_id.is_some()
            && self.call_id == other.call_id
    }
}

fn new_item_id() -> String {
    format!("it-{}", uuid::Uuid::new_v4().simple())
}

// ── Tool definition types ──────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the model (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}
