//! Reference turn orchestrator.
//!
//! [`TurnRunner::run`] spawns one task per user turn and returns its events
//! as a stream. Each round asks the [`Session`] for bounded model input,
//! calls the provider, records the assistant output and runs any requested
//! tools. The loop ends when the model answers without tool calls or the
//! round limit is reached.
//!
//! A tool may suspend the turn (see
//! [`AskUserTool`](crate::suspension::AskUserTool)). The task simply awaits;
//! wrap the stream in [`with_keepalive`](crate::api::with_keepalive) so the
//! connection survives the wait.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::TurnConfig;
use crate::Item;
use crate::api::{LlmProvider, ProviderError, StreamEvent};
use crate::context::{BoundedItems, ContextError, Session};
use crate::tools::{EventSender, ToolContext, ToolSet};

/// Events buffered between the turn task and the stream consumer.
const EVENT_BUFFER: usize = 32;

/// Errors that end a turn. Delivered as the last item of a [`TurnStream`].
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("turn did not finish within {0} rounds")]
    RoundLimit(u32),
    /// The stream consumer went away. Never delivered; it just stops the task.
    #[error("event consumer went away")]
    Detached,
}

/// Events of one running turn. Dropping it aborts the turn.
pub type TurnStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TurnError>> + Send>>;

/// Runs user turns against a provider and a tool set.
#[derive(Clone)]
pub struct TurnRunner {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolSet>,
    config: TurnConfig,
}

impl TurnRunner {
    pub fn new(provider: Arc<dyn LlmProvider>, tools: ToolSet, config: TurnConfig) -> Self {
        Self {
            provider,
            tools: Arc::new(tools),
            config,
        }
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    /// Append `user_text` to the session's thread and run the turn on a new
    /// task.
    pub fn run(&self, session: Arc<Session>, user_text: impl Into<String>) -> TurnStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let runner = self.clone();
        let user_text = user_text.into();

        let task = tokio::spawn(async move {
            match runner.drive(&session, user_text, &tx).await {
                Ok(()) | Err(TurnError::Detached) => {}
                Err(e) => {
                    warn!(thread = %session.thread_id(), "Turn failed: {e}");
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        let guard = AbortOnDrop(task);
        Box::pin(futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|item| (item, (rx, guard)))
        }))
    }

    async fn drive(&self, session: &Session, user_text: String, events: &EventSender) -> Result<(), TurnError> {
        let thread_id = session.thread_id().to_string();
        emit(
            events,
            StreamEvent::TurnStarted {
                thread_id: thread_id.clone(),
            },
        )
        .await?;
        session.append_item(Item::user(user_text)).await?;

        let mut generate = self.config.generate.clone();
        generate.tools = self.tools.definitions();

        for round in 1..=self.config.max_rounds {
            let bounded = self.bounded_input(session).await?;
            debug!(thread = %thread_id, round, "{}", bounded.report.to_log_string());
            if let Some(replaced_items) = bounded.report.compacted {
                emit(events, StreamEvent::Compacted { replaced_items }).await?;
            }

            let generation = self.provider.generate(&bounded.items, &generate).await?;
            emit(
                events,
                StreamEvent::Usage {
                    prompt_tokens: generation.usage.prompt_tokens,
                    completion_tokens: generation.usage.completion_tokens,
                },
            )
            .await?;

            if !generation.text.is_empty() {
                session.append_item(Item::assistant(generation.text.clone())).await?;
                emit(events, StreamEvent::TextDelta { text: generation.text }).await?;
            }

            if generation.tool_calls.is_empty() {
                info!(thread = %thread_id, rounds = round, "Turn completed");
                emit(events, StreamEvent::TurnCompleted { thread_id, rounds: round }).await?;
                return Ok(());
            }

            for call in generation.tool_calls {
                emit(
                    events,
                    StreamEvent::ToolStarted {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                    },
                )
                .await?;

                let ctx = ToolContext::new(thread_id.as_str(), call.call_id.as_str(), events.clone());
                let output = self.tools.execute(&call.name, &call.arguments, &ctx).await;

                // Stored together so the thread never holds a dangling call.
                session
                    .append_item(Item::tool_call(
                        call.call_id.as_str(),
                        call.name.as_str(),
                        call.arguments,
                    ))
                    .await?;
                session
                    .append_item(Item::tool_result(call.call_id.as_str(), call.name.as_str(), output))
                    .await?;

                emit(
                    events,
                    StreamEvent::ToolCompleted {
                        call_id: call.call_id,
                        name: call.name,
                    },
                )
                .await?;
            }
        }

        Err(TurnError::RoundLimit(self.config.max_rounds))
    }

    async fn bounded_input(&self, session: &Session) -> Result<BoundedItems, TurnError> {
        match session.items_for_model().await {
            Ok(bounded) => Ok(bounded),
            Err(ContextError::PolicyViolation { required, available })
                if self.config.force_truncate_on_overflow =>
            {
                warn!(required, available, "Pinned context over budget, retrying with truncation");
                Ok(session.items_for_model_forced().await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn emit(events: &EventSender, event: StreamEvent) -> Result<(), TurnError> {
    events.send(Ok(event)).await.map_err(|_| TurnError::Detached)
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDef;
    use crate::api::provider::scripted::ScriptedProvider;
    use crate::api::{Generation, ToolInvocation};
    use crate::context::{ContextBudget, InMemoryItemStore, ItemStore, SessionConfig};
    use crate::suspension::{AskUserTool, Responses, SuspensionStore};
    use crate::tools::{Tool, ToolFuture};
    use futures::StreamExt;
    use serde_json::json;

    struct Upper;

    impl Tool for Upper {
        fn definition(&self) -> ToolDef {
            ToolDef::new("upper", "Uppercase the input", json!({"type": "object"}))
        }

        fn execute<'a>(&'a self, arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
            Box::pin(async move { arguments.to_uppercase() })
        }
    }

    fn tool_round(call_id: &str, name: &str, arguments: &str) -> Generation {
        Generation {
            tool_calls: vec![ToolInvocation {
                call_id: call_id.into(),
                name: name.into(),
                arguments: arguments.into(),
            }],
            ..Default::default()
        }
    }

    fn session_with(store: Arc<InMemoryItemStore>, config: SessionConfig) -> Arc<Session> {
        Arc::new(Session::new("thread-1", store, config))
    }

    async fn collect(stream: TurnStream) -> Vec<Result<StreamEvent, TurnError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn text_only_turn_completes_in_one_round() {
        let provider = Arc::new(ScriptedProvider::texts(&["Hello!"]));
        let store = Arc::new(InMemoryItemStore::new());
        let runner = TurnRunner::new(provider, ToolSet::new(), TurnConfig::default());

        let events = collect(runner.run(session_with(store.clone(), SessionConfig::default()), "hi")).await;
        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();

        assert_eq!(
            events.first(),
            Some(&StreamEvent::TurnStarted {
                thread_id: "thread-1".into()
            })
        );
        assert!(events.contains(&StreamEvent::TextDelta { text: "Hello!".into() }));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::TurnCompleted {
                thread_id: "thread-1".into(),
                rounds: 1
            })
        );

        let stored = store.list_items("thread-1").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[0].is_user_message());
    }

    #[tokio::test]
    async fn tool_results_follow_their_calls() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_round("c1", "upper", "abc")),
            Ok(Generation::text("done")),
        ]));
        let store = Arc::new(InMemoryItemStore::new());
        let runner = TurnRunner::new(provider.clone(), ToolSet::new().with(Upper), TurnConfig::default());

        let events = collect(runner.run(session_with(store, SessionConfig::default()), "go")).await;
        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();
        assert!(events.contains(&StreamEvent::ToolStarted {
            call_id: "c1".into(),
            name: "upper".into()
        }));
        assert!(matches!(events.last(), Some(StreamEvent::TurnCompleted { rounds: 2, .. })));

        let second = &provider.requests()[1];
        let call = second.iter().position(|i| i.call_id.as_deref() == Some("c1")).unwrap();
        assert!(second[call].is_answered_by(&second[call + 1]));
        assert_eq!(second[call + 1].content.to_text(), "ABC");
    }

    #[tokio::test]
    async fn provider_error_ends_the_stream() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Api("boom".into()))]));
        let runner = TurnRunner::new(provider, ToolSet::new(), TurnConfig::default());
        let store = Arc::new(InMemoryItemStore::new());

        let events = collect(runner.run(session_with(store, SessionConfig::default()), "hi")).await;
        assert!(matches!(events.last(), Some(Err(TurnError::Provider(_)))));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn round_limit_is_an_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_round("c1", "upper", "a")),
            Ok(tool_round("c2", "upper", "b")),
        ]));
        let runner = TurnRunner::new(
            provider,
            ToolSet::new().with(Upper),
            TurnConfig::new().with_max_rounds(2),
        );
        let store = Arc::new(InMemoryItemStore::new());

        let events = collect(runner.run(session_with(store, SessionConfig::default()), "loop")).await;
        assert!(matches!(events.last(), Some(Err(TurnError::RoundLimit(2)))));
    }

    #[tokio::test]
    async fn oversized_message_fails_unless_forced() {
        let config = SessionConfig {
            budget: ContextBudget::new(12).with_reserved_for_response(0),
            ..Default::default()
        };
        let long = "word ".repeat(200);

        let provider = Arc::new(ScriptedProvider::texts(&["ok"]));
        let runner = TurnRunner::new(provider, ToolSet::new(), TurnConfig::default());
        let store = Arc::new(InMemoryItemStore::new());
        let events = collect(runner.run(session_with(store, config.clone()), long.clone())).await;
        assert!(matches!(
            events.last(),
            Some(Err(TurnError::Context(ContextError::PolicyViolation { .. })))
        ));

        let provider = Arc::new(ScriptedProvider::texts(&["ok"]));
        let runner = TurnRunner::new(provider, ToolSet::new(), TurnConfig::new().with_force_truncate(true));
        let store = Arc::new(InMemoryItemStore::new());
        let events = collect(runner.run(session_with(store, config), long)).await;
        assert!(matches!(events.last(), Some(Ok(StreamEvent::TurnCompleted { .. }))));
    }

    #[tokio::test]
    async fn turn_resumes_after_questions_are_answered() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_round(
                "ask-1",
                "ask_user",
                r#"{"questions": [{"prompt": "Book the 9am slot?", "kind": "confirm"}, {"prompt": "Notes?"}]}"#,
            )),
            Ok(Generation::text("Booked.")),
        ]));
        let suspensions = SuspensionStore::new();
        let tools = ToolSet::new().with(AskUserTool::new(suspensions.clone()));
        let runner = TurnRunner::new(provider.clone(), tools, TurnConfig::default());
        let store = Arc::new(InMemoryItemStore::new());

        let mut stream = runner.run(session_with(store, SessionConfig::default()), "book it");
        let group_id = loop {
            match stream.next().await {
                Some(Ok(StreamEvent::QuestionGroup { group_id, .. })) => break group_id,
                Some(Ok(_)) => continue,
                other => panic!("unexpected stream item: {other:?}"),
            }
        };

        let mut answers = Responses::new();
        answers.insert("q1".into(), json!("yes"));
        assert!(suspensions.submit_responses(&group_id, answers).is_accepted());

        let rest = collect(stream).await;
        assert!(matches!(rest.last(), Some(Ok(StreamEvent::TurnCompleted { rounds: 2, .. }))));

        let second = &provider.requests()[1];
        let result = second
            .iter()
            .find(|i| i.call_id.as_deref() == Some("ask-1") && i.role() == crate::Role::Tool)
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&result.content.to_text()).unwrap();
        assert_eq!(value["status"], "answered");
        assert_eq!(value["responses"], json!({"q1": "yes"}));
        assert!(suspensions.is_empty());
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_a_suspended_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(tool_round(
            "ask-1",
            "ask_user",
            r#"{"questions": [{"prompt": "Proceed?"}]}"#,
        ))]));
        let suspensions = SuspensionStore::new();
        let tools = ToolSet::new().with(AskUserTool::new(suspensions.clone()));
        let runner = TurnRunner::new(provider, tools, TurnConfig::default());
        let store = Arc::new(InMemoryItemStore::new());

        let mut stream = runner.run(session_with(store, SessionConfig::default()), "go");
        while let Some(Ok(event)) = stream.next().await {
            if matches!(event, StreamEvent::QuestionGroup { .. }) {
                break;
            }
        }
        assert_eq!(suspensions.len(), 1);
        drop(stream);

        for _ in 0..10 {
            if suspensions.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(suspensions.is_empty());
    }
}
