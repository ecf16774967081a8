//! LLM-callable tool for asking the user a group of questions mid-turn.
//!
//! The tool registers a question group in the [`SuspensionStore`], pushes a
//! [`StreamEvent::QuestionGroup`] to the client and suspends until the
//! answers arrive through the respond endpoint. The answers become the tool
//! result, so the model continues the same turn with them.

use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::ToolDef;
use crate::api::StreamEvent;
use crate::tools::core::{Tool, ToolContext, ToolFuture, parse_tool_args};
use crate::tools::spec::ToolSpec;

use super::question::QuestionInput;
use super::store::{SuspensionStore, WaitError};

/// Most questions a single group may carry.
pub const MAX_QUESTIONS: usize = 10;

/// Arguments for the `ask_user` tool.
#[derive(Deserialize, JsonSchema)]
struct AskUserArgs {
    /// Between 1 and 10 questions, asked together.
    questions: Vec<QuestionInput>,
    /// Seconds to wait for answers. Falls back to the tool's default.
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// Tool that suspends the turn until the user answers a question group.
///
/// ```ignore
/// let tools = ToolSet::new().with(AskUserTool::new(suspensions.clone()));
/// ```
pub struct AskUserTool {
    store: SuspensionStore,
    /// `None` waits until the group is answered or cancelled.
    default_timeout: Option<Duration>,
}

impl AskUserTool {
    pub fn new(store: SuspensionStore) -> Self {
        Self {
            store,
            default_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

/// Cancels a group if the waiting future is dropped before it finishes.
struct CancelOnDrop<'a> {
    store: &'a SuspensionStore,
    group_id: &'a str,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.cancel(self.group_id);
        }
    }
}

impl Tool for AskUserTool {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("ask_user")
            .purpose("Ask the user one or more questions and wait for their answers")
            .when_to_use(
                "When the next step depends on a decision or fact only the user has, \
                 such as confirming a booking or choosing between options",
            )
            .when_not_to_use(
                "For facts a tool can look up, or trivial confirmations. \
                 Batch related questions into one call instead of asking one at a time",
            )
            .parameters_for::<AskUserArgs>()
            .example(
                r#"ask_user(questions=[{"prompt": "Book the 9am slot?", "kind": "confirm"}])"#,
                r#"{"status": "answered", "group_id": "...", "responses": {"q1": true}}"#,
            )
            .output_format(
                "JSON object with 'status' (answered|timed_out|cancelled) and, when answered, \
                 'responses' keyed by question id",
            )
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: AskUserArgs = match parse_tool_args(arguments) {
                Ok(a) => a,
                Err(e) => return e,
            };
            if args.questions.is_empty() {
                return "Error: at least 1 question is required".to_string();
            }
            if args.questions.len() > MAX_QUESTIONS {
                return format!("Error: at most {MAX_QUESTIONS} questions are allowed");
            }
            if args.questions.iter().any(|q| q.prompt.trim().is_empty()) {
                return "Error: every question needs a non-empty prompt".to_string();
            }

            let handle = self
                .store
                .create_question_group_for(ctx.thread_id(), args.questions);
            let group_id = handle.group_id;
            let mut guard = CancelOnDrop {
                store: &self.store,
                group_id: &group_id,
                armed: true,
            };

            let delivered = ctx
                .emit(StreamEvent::QuestionGroup {
                    group_id: group_id.clone(),
                    questions: handle.questions,
                })
                .await;
            if !delivered {
                warn!(group_id = %group_id, "Client gone before question group was delivered");
                return cancelled(&group_id);
            }

            let timeout = args
                .timeout_secs
                .map(Duration::from_secs)
                .or(self.default_timeout);
            let outcome = match timeout {
                Some(limit) => handle.waiter.wait_timeout(limit).await,
                None => handle.waiter.wait().await,
            };

            guard.armed = false;
            self.store.cleanup(&group_id);

            match outcome {
                Ok(responses) => json!({
                    "status": "answered",
                    "group_id": &group_id,
                    "responses": responses,
                })
                .to_string(),
                Err(WaitError::TimedOut { after, .. }) => {
                    info!(group_id = %group_id, "Question group timed out after {after:?}");
                    json!({"status": "timed_out", "group_id": &group_id}).to_string()
                }
                Err(WaitError::Cancelled(_)) => cancelled(&group_id),
            }
        })
    }
}

fn cancelled(group_id: &str) -> String {
    json!({"status": "cancelled", "group_id": group_id}).to_string()
}
