//! Tool abstraction for LLM function-calling agents.
//!
//! The [`Tool`] trait defines the interface that every tool must implement:
//! a static API definition (name, description, JSON schema) and an async
//! `execute` method. Tools are collected into a [`ToolSet`] which handles
//! dispatch, definition export, timeouts and result truncation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::ToolDef;
use crate::agent::turn::TurnError;
use crate::api::StreamEvent;

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = String> + Send + 'a>>;

/// Sending half of a turn's event stream.
pub type EventSender = mpsc::Sender<Result<StreamEvent, TurnError>>;

// ── ToolContext ────────────────────────────────────────────────────

/// What a running tool knows about the turn that invoked it.
#[derive(Clone)]
pub struct ToolContext {
    thread_id: String,
    call_id: String,
    events: EventSender,
}

impl ToolContext {
    pub fn new(thread_id: impl Into<String>, call_id: impl Into<String>, events: EventSender) -> Self {
        Self {
            thread_id: thread_id.into(),
            call_id: call_id.into(),
            events,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// The `call_id` of the invocation being executed.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Push an event to the client. Returns `false` once nobody is listening.
    pub async fn emit(&self, event: StreamEvent) -> bool {
        self.events.send(Ok(event)).await.is_ok()
    }

    /// Whether the consumer of the turn's stream has gone away.
    pub fn is_detached(&self) -> bool {
        self.events.is_closed()
    }

    /// Resolves once the consumer of the turn's stream has gone away.
    pub async fn detached(&self) {
        self.events.closed().await
    }
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool that an LLM agent can invoke via function-calling.
///
/// # Example
///
/// ```ignore
/// struct Lookup { crm: CrmClient }
///
/// impl Tool for Lookup {
///     fn definition(&self) -> ToolDef { /* ... */ }
///
///     fn execute<'a>(&'a self, arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
///         Box::pin(async move {
///             let args: LookupArgs = match parse_tool_args(arguments) {
///                 Ok(a) => a,
///                 Err(e) => return e,
///             };
///             self.crm.find(&args.name).await
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The tool definition sent to the LLM API.
    fn definition(&self) -> ToolDef;

    /// Execute the tool with the given raw JSON arguments string.
    ///
    /// Errors should be returned as `"Error: ..."` strings rather than
    /// panicking; the string goes back to the model as the tool result.
    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a>;

    /// The tool's name (convenience: delegates to definition).
    fn name(&self) -> String {
        self.definition().function.name
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// A collection of tools that can be dispatched by name.
///
/// ```ignore
/// let tools = ToolSet::new()
///     .with_max_result_bytes(15_000)
///     .with(AskUserTool::new(suspensions.clone()))
///     .with_if(crm_enabled, CrmLookup::new(client));
/// ```
pub struct ToolSet {
    tools: HashMap<String, Box<dyn Tool>>,
    max_result_bytes: usize,
    /// Timeout applied to every tool. `None` disables timeouts.
    default_timeout: Option<Duration>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.names())
            .field("max_result_bytes", &self.max_result_bytes)
            .finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            default_timeout: None,
        }
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Tools that wait on a human (like `ask_user`) enforce their own
    /// deadline; keep this `None` or generous when they are registered.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name(), Box::new(tool));
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Conditionally register a tool without breaking the builder chain.
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// All tool definitions for the LLM API, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool call by name with timing, optional timeout and
    /// truncation. Unknown tools yield an error string.
    pub async fn execute(&self, name: &str, arguments: &str, ctx: &ToolContext) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!("Error: unknown tool '{name}'");
        };

        log_tool_call(name, arguments);
        let start = Instant::now();

        let result = match self.default_timeout {
            Some(limit) => match tokio::time::timeout(limit, tool.execute(arguments, ctx)).await {
                Ok(r) => r,
                Err(_) => {
                    info!("Tool {name} timed out after {:.0}s", limit.as_secs_f64());
                    format!(
                        "Error: tool '{name}' timed out after {:.0} seconds.",
                        limit.as_secs_f64()
                    )
                }
            },
            None => tool.execute(arguments, ctx).await,
        };

        debug!(
            "Tool {name} completed in {:.0}ms ({} bytes)",
            start.elapsed().as_secs_f64() * 1000.0,
            result.len()
        );
        trace!(
            "Tool {name} result preview: {}",
            result.chars().take(300).collect::<String>()
        );

        truncate_result(result, self.max_result_bytes)
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Log a tool call at info (preview) and trace (full arguments).
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate a string to at most `max` bytes (on a char boundary), appending
/// a notice if trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let total = s.len();
    let mut out = s;
    out.truncate(cut);
    format!("{out}...\n[truncated: {total} bytes total]")
}

/// Parse raw JSON arguments into a typed struct.
///
/// Returns a formatted error string suitable for returning directly from
/// [`Tool::execute`]; the model sees the error and can self-correct.
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(arguments: &str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| {
        format!(
            "Error: invalid tool arguments: {e}. \
             Please provide valid JSON matching the tool's parameter schema."
        )
    })
}
