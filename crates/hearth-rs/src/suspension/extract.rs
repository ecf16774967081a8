//! Turn free-form assistant text into a question group.
//!
//! Some flows let the model write its questions as prose and only then
//! decide to suspend. [`LlmQuestionExtractor`] asks the provider to restate
//! that prose as a JSON question list, ready for
//! [`SuspensionStore::create_question_group`](super::SuspensionStore::create_question_group).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::Item;
use crate::api::{GenerateConfig, LlmProvider, ProviderError};

use super::question::QuestionInput;

pub type ExtractFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<QuestionInput>, ExtractError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("could not read a question list from the model output: {0}")]
    Malformed(String),
}

/// Produces a question list from text.
pub trait QuestionExtractor: Send + Sync {
    fn extract_group<'a>(&'a self, text: &'a str) -> ExtractFuture<'a>;
}

const EXTRACTION_PROMPT: &str = "\
Rewrite the questions the assistant asks in the text below as a JSON array. \
Each element is an object with \"prompt\" (string), \"kind\" (\"text\", \"confirm\" or \"choice\") \
and, for choice questions, \"options\" (array of strings). \
Reply with the JSON array only. Reply with [] if the text asks nothing.";

/// [`QuestionExtractor`] backed by an [`LlmProvider`].
pub struct LlmQuestionExtractor {
    provider: Arc<dyn LlmProvider>,
    config: GenerateConfig,
}

impl LlmQuestionExtractor {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            config: GenerateConfig::default().with_temperature(0.0).with_max_tokens(1024),
        }
    }

    pub fn with_config(mut self, config: GenerateConfig) -> Self {
        self.config = config;
        self
    }
}

impl QuestionExtractor for LlmQuestionExtractor {
    fn extract_group<'a>(&'a self, text: &'a str) -> ExtractFuture<'a> {
        Box::pin(async move {
            let messages = vec![
                Item::system_note(EXTRACTION_PROMPT),
                Item::user(text.to_string()),
            ];
            let generation = self.provider.generate(&messages, &self.config).await?;
            let questions = parse_question_list(&generation.text)?;
            debug!("Extracted {} questions", questions.len());
            Ok(questions)
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuestionList {
    Bare(Vec<QuestionInput>),
    Wrapped { questions: Vec<QuestionInput> },
}

/// Parse a JSON question list out of model output. Accepts a bare array or
/// `{"questions": [...]}`, optionally surrounded by prose or code fences.
pub fn parse_question_list(output: &str) -> Result<Vec<QuestionInput>, ExtractError> {
    let trimmed = output.trim();
    let candidate = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end && !trimmed.starts_with('{') => {
            trimmed.get(start..=end).unwrap_or(trimmed)
        }
        _ => match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => trimmed.get(start..=end).unwrap_or(trimmed),
            _ => trimmed,
        },
    };

    let list: QuestionList =
        serde_json::from_str(candidate).map_err(|e| ExtractError::Malformed(e.to_string()))?;
    let questions = match list {
        QuestionList::Bare(q) | QuestionList::Wrapped { questions: q } => q,
    };
    Ok(questions
        .into_iter()
        .filter(|q| !q.prompt.trim().is_empty())
        .collect())
}
