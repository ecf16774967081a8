//! Question data model for suspension groups.

use std::collections::{BTreeMap, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How a question expects to be answered.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    /// Pick one of `options`.
    Choice,
    /// Free-form text.
    #[default]
    Text,
    /// Yes or no.
    Confirm,
}

/// A normalized question inside a registered group. Always has an id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct QuestionItem {
    pub id: String,
    pub prompt: String,
    pub kind: QuestionKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// A question as supplied by a tool or the model. The id may be missing.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
pub struct QuestionInput {
    /// Stable id used as the key in the response mapping. Generated as
    /// `q1`, `q2`, ... when omitted.
    #[serde(default)]
    pub id: Option<String>,
    /// The question shown to the user.
    pub prompt: String,
    #[serde(default)]
    pub kind: QuestionKind,
    /// Options for `choice` questions.
    #[serde(default)]
    pub options: Vec<String>,
}

impl QuestionInput {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn confirm(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            kind: QuestionKind::Confirm,
            ..Default::default()
        }
    }

    pub fn choice<S: Into<String>>(prompt: impl Into<String>, options: impl IntoIterator<Item = S>) -> Self {
        Self {
            prompt: prompt.into(),
            kind: QuestionKind::Choice,
            options: options.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Answers keyed by question id.
pub type Responses = BTreeMap<String, serde_json::Value>;

/// Give every question a unique id.
///
/// Explicit ids are kept (first occurrence wins). Missing, blank or
/// duplicate ids are replaced with the next free `qN`, counting from 1 and
/// skipping ids already taken.
pub fn normalize_questions(inputs: Vec<QuestionInput>) -> Vec<QuestionItem> {
    let mut taken: HashSet<String> = HashSet::new();
    let explicit: Vec<Option<String>> = inputs
        .iter()
        .map(|q| {
            q.id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .filter(|id| taken.insert((*id).to_string()))
                .map(str::to_string)
        })
        .collect();

    let mut next = 1usize;
    inputs
        .into_iter()
        .zip(explicit)
        .map(|(input, id)| {
            let id = id.unwrap_or_else(|| loop {
                let candidate = format!("q{next}");
                next += 1;
                if taken.insert(candidate.clone()) {
                    break candidate;
                }
            });
            QuestionItem {
                id,
                prompt: input.prompt,
                kind: input.kind,
                options: input.options,
            }
        })
        .collect()
}
