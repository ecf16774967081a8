//! Console example: one turn with keepalives and `ask_user` answered on stdin.
//!
//! # Usage
//!
//! ```bash
//! OPENROUTER_KEY=sk-... cargo run --example console_turn -- "Book me a meeting room for Friday"
//! ```

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hearth_rs::prelude::*;

#[tokio::main]
async fn main() -> Result<(), String> {
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "Set OPENROUTER_KEY env var to your OpenRouter API key")?;
    let message = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Ask me which day suits me, then summarize my answer.".to_string());

    let provider: Arc<dyn LlmProvider> =
        Arc::new(OpenRouterProvider::new(api_key).map_err(|e| e.to_string())?);
    let store: Arc<dyn ItemStore> = Arc::new(InMemoryItemStore::new());
    let suspensions = SuspensionStore::new();

    let factory = SessionFactory::new(store).with_summarizer_provider(provider.clone());
    let session = Arc::new(factory.session("console", &PolicyTier::Standard));

    let tools = ToolSet::new().with(AskUserTool::new(suspensions.clone()));
    let runner = TurnRunner::new(
        provider,
        tools,
        TurnConfig::new().with_model("anthropic/claude-sonnet-4"),
    );

    let keepalive = KeepaliveConfig::default().with_interval(Duration::from_secs(5));
    let mut events = with_keepalive(runner.run(session, message), keepalive);
    let mut transcript = Vec::new();

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| e.to_string())?;
        transcript.push(event.clone());
        match event {
            StreamEvent::TextDelta { text } => println!("{text}"),
            StreamEvent::Keepalive { text } => eprintln!("... {text}"),
            StreamEvent::QuestionGroup { group_id, questions } => {
                let mut responses = Responses::new();
                for question in questions {
                    eprint!("{} > ", question.prompt);
                    let answer = read_line().await?;
                    responses.insert(question.id, answer.into());
                }
                suspensions.submit_responses(&group_id, responses);
            }
            StreamEvent::TurnCompleted { rounds, .. } => {
                let reply = collect_text(&transcript);
                eprintln!("--- {rounds} rounds, {} chars of reply ---", reply.chars().count());
            }
            _ => {}
        }
    }
    Ok(())
}

async fn read_line() -> Result<String, String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).map(|_| line.trim().to_string())
    })
    .await
    .map_err(|e| e.to_string())?
    .map_err(|e| e.to_string())
}
