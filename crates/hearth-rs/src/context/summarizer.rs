//! Anchored incremental summarization for context compaction.
//!
//! When a thread grows past `compact_after_turns`, the oldest turns outside
//! the retained window are summarized into a [`CompactionRecord`]. A record
//! replaces the contiguous range `first_item_id..=last_item_id` of the raw
//! history with a single system note. Records are append-only: a later
//! record summarizes only what lies after the previous record's
//! `last_item_id`, merges it with the previous summary text, and keeps the
//! previous `first_item_id`, so it supersedes the earlier record when
//! rendering. Nothing is ever summarized twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::turns::segment;
use crate::api::provider::{GenerateConfig, LlmProvider, ProviderError};
use crate::{Item, ItemKind};

/// Header of the system note that stands in for a compacted range.
pub const SUMMARY_HEADER: &str = "[Conversation summary]";

/// The prompt used for summarization. Instructs the model to produce a concise,
/// factual summary suitable for injecting into a conversation as context.
const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation between a user and an assistant concisely. Focus on:
- What the user asked for and what was decided
- Facts returned by tools (names, ids, numbers, dates) that later turns may rely on
- Answers the user gave to questions
- Open items and what remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve identifiers, amounts and dates verbatim.
- Be concise. Every token must earn its place.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary. Do not simply append: integrate, deduplicate, and update. The result \
  must be a standalone summary that replaces the existing one entirely.";

/// Configuration for incremental summarization.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Model to use for summarization (cheaper than the main model).
    pub model: Option<String>,
    /// Maximum tokens for the summarization response.
    pub max_summary_tokens: u32,
    /// Give up on a summarization call after this long.
    pub timeout: Duration,
    /// Compact once the rendered thread has more user turns than this.
    pub compact_after_turns: usize,
    /// Turns kept verbatim when the budget sets no `max_turns`.
    pub keep_recent_turns: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: None, // Use main model if not specified.
            max_summary_tokens: 2048,
            timeout: Duration::from_secs(30),
            compact_after_turns: 20,
            keep_recent_turns: 10,
        }
    }
}

impl SummarizerConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_compact_after_turns(mut self, turns: usize) -> Self {
        self.compact_after_turns = turns;
        self
    }

    pub fn with_keep_recent_turns(mut self, turns: usize) -> Self {
        self.keep_recent_turns = turns;
        self
    }
}

/// One entry in a thread's append-only compaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub id: String,
    /// First raw item covered by this record.
    pub first_item_id: String,
    /// Last raw item covered by this record.
    pub last_item_id: String,
    pub summary: String,
    /// Raw items in `first_item_id..=last_item_id`.
    pub replaced_items: usize,
    pub created_at: DateTime<Utc>,
}

impl CompactionRecord {
    /// The system note rendered in place of the covered range.
    pub fn to_item(&self) -> Item {
        Item::system_note(format!("{SUMMARY_HEADER}\n{}", self.summary))
            .with_id(format!("summary-{}", self.id))
    }
}

/// Render `raw` with the range covered by `record` replaced by its summary
/// note.
///
/// If either boundary id is missing from `raw`, the record cannot be placed
/// and `raw` is returned unchanged.
pub fn apply_compaction(raw: &[Item], record: &CompactionRecord) -> Vec<Item> {
    let first = raw.iter().position(|i| i.id == record.first_item_id);
    let last = raw.iter().position(|i| i.id == record.last_item_id);
    match (first, last) {
        (Some(first), Some(last)) if first <= last => raw
            .iter()
            .take(first)
            .cloned()
            .chain(std::iter::once(record.to_item()))
            .chain(raw.iter().skip(last + 1).cloned())
            .collect(),
        _ => {
            warn!(
                record = %record.id,
                "Compaction boundaries not found in history, rendering raw items"
            );
            raw.to_vec()
        }
    }
}

/// Build the one-shot summarization request for a span of items.
///
/// `existing` is the summary of the previous record, merged into the new one.
pub fn build_summarization_request(span: &[Item], existing: Option<&str>) -> Vec<Item> {
    let mut content = String::new();

    if let Some(existing) = existing {
        content.push_str("=== EXISTING SUMMARY ===\n");
        content.push_str(existing);
        content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
    }

    for item in span {
        let label = match item.kind {
            ItemKind::ToolCall => format!(
                "assistant called {}",
                item.tool_name.as_deref().unwrap_or("a tool")
            ),
            ItemKind::ToolResult => format!("{} result", item.tool_name.as_deref().unwrap_or("tool")),
            _ => item.role().to_string(),
        };
        content.push_str(&format!("[{label}]: {}\n\n", item.content.to_text()));
    }

    vec![Item::system_note(SUMMARIZATION_PROMPT), Item::user(content)]
}

/// Produces [`CompactionRecord`]s with an LLM call.
pub struct Summarizer {
    provider: Arc<dyn LlmProvider>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, config: SummarizerConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    /// Summarize `span`, merging in `existing`. Bounded by `config.timeout`.
    pub async fn summarize(
        &self,
        span: &[Item],
        existing: Option<&str>,
    ) -> Result<String, ProviderError> {
        let messages = build_summarization_request(span, existing);
        let mut gen_config = GenerateConfig::default()
            .with_max_tokens(self.config.max_summary_tokens)
            .with_temperature(0.0);
        if let Some(model) = &self.config.model {
            gen_config = gen_config.with_model(model.clone());
        }

        let generation = tokio::time::timeout(
            self.config.timeout,
            self.provider.generate(&messages, &gen_config),
        )
        .await
        .map_err(|_| ProviderError::Timeout(self.config.timeout))??;

        let summary = generation.text.trim();
        if summary.is_empty() {
            return Err(ProviderError::Malformed("empty summary".into()));
        }
        Ok(summary.to_string())
    }

    /// Compact `raw` if it has grown past `compact_after_turns`.
    ///
    /// `latest` is the newest record in the thread's log. Everything older
    /// than the newest `keep_turns` turns that `latest` does not already
    /// cover is summarized. Returns `Ok(None)` when there is nothing to do.
    pub async fn compact(
        &self,
        raw: &[Item],
        latest: Option<&CompactionRecord>,
        keep_turns: usize,
    ) -> Result<Option<CompactionRecord>, ProviderError> {
        let view = match latest {
            Some(record) => apply_compaction(raw, record),
            None => raw.to_vec(),
        };
        let segments = segment(view);
        let turns = segments.turns.len();
        if turns <= self.config.compact_after_turns {
            return Ok(None);
        }

        let keep = keep_turns.clamp(1, turns);
        let mut span = segments.preamble;
        span.extend(segments.turns.into_iter().take(turns - keep).flatten());
        let (Some(first), Some(last)) = (span.first(), span.last()) else {
            return Ok(None);
        };

        let first_item_id = latest.map_or_else(|| first.id.clone(), |r| r.first_item_id.clone());
        let last_item_id = last.id.clone();
        let first_idx = raw.iter().position(|i| i.id == first_item_id);
        let last_idx = raw.iter().position(|i| i.id == last_item_id);
        let replaced_items = match (first_idx, last_idx) {
            (Some(f), Some(l)) if f <= l => l - f + 1,
            _ => span.len(),
        };

        debug!(
            span_items = span.len(),
            turns_summarized = turns - keep,
            merging = latest.is_some(),
            "Summarizing older history"
        );
        let summary = self
            .summarize(&span, latest.map(|r| r.summary.as_str()))
            .await?;

        Ok(Some(CompactionRecord {
            id: format!("cmp-{}", uuid::Uuid::new_v4().simple()),
            first_item_id,
            last_item_id,
            summary,
            replaced_items,
            created_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Generation;
    use crate::api::provider::scripted::ScriptedProvider;
    use crate::context::turns::count_turns;

    fn thread(turns: usize) -> Vec<Item> {
        let mut items = vec![Item::system_note("sys").with_id("sys")];
        for n in 1..=turns {
            items.push(Item::user(format!("u{n}")).with_id(format!("u{n}")));
            items.push(Item::assistant(format!("a{n}")).with_id(format!("a{n}")));
        }
        items
    }

    fn summarizer(provider: ScriptedProvider, after: usize) -> (Arc<ScriptedProvider>, Summarizer) {
        let provider = Arc::new(provider);
        let s = Summarizer::new(
            provider.clone(),
            SummarizerConfig::default().with_compact_after_turns(after),
        );
        (provider, s)
    }

    #[test]
    fn build_request_without_existing_summary() {
        let span = vec![
            Item::user("Find the Acme account"),
            Item::tool_call("c1", "crm_lookup", r#"{"q":"Acme"}"#),
            Item::tool_result("c1", "crm_lookup", "Acme Corp, id 42"),
        ];
        let request = build_summarization_request(&span, None);
        assert_eq!(request.len(), 2);
        assert!(request[0].content.to_text().contains("Summarize"));
        let body = request[1].content.to_text();
        assert!(body.contains("[user]: Find the Acme account"));
        assert!(body.contains("[assistant called crm_lookup]"));
        assert!(body.contains("[crm_lookup result]: Acme Corp, id 42"));
        assert!(!body.contains("EXISTING SUMMARY"));
    }

    #[test]
    fn build_request_merges_existing_summary() {
        let request = build_summarization_request(&[Item::user("more")], Some("earlier facts"));
        let body = request[1].content.to_text();
        assert!(body.starts_with("=== EXISTING SUMMARY ===\nearlier facts"));
        assert!(body.contains("=== NEW MESSAGES TO SUMMARIZE ==="));
    }

    #[test]
    fn apply_replaces_range_with_summary_note() {
        let raw = thread(3);
        let record = CompactionRecord {
            id: "r1".into(),
            first_item_id: "u1".into(),
            last_item_id: "a2".into(),
            summary: "two turns happened".into(),
            replaced_items: 4,
            created_at: Utc::now(),
        };
        let view = apply_compaction(&raw, &record);
        let ids: Vec<&str> = view.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["sys", "summary-r1", "u3", "a3"]);
        assert!(view[1].is_system_note());
        assert!(view[1].content.to_text().starts_with(SUMMARY_HEADER));
    }

    #[test]
    fn apply_with_unknown_boundary_is_noop() {
        let raw = thread(2);
        let record = CompactionRecord {
            id: "r1".into(),
            first_item_id: "missing".into(),
            last_item_id: "a1".into(),
            summary: String::new(),
            replaced_items: 0,
            created_at: Utc::now(),
        };
        assert_eq!(apply_compaction(&raw, &record), raw);
    }

    #[tokio::test]
    async fn below_threshold_does_nothing() {
        let (provider, s) = summarizer(ScriptedProvider::texts(&["unused"]), 20);
        let record = s.compact(&thread(20), None, 10).await.unwrap();
        assert!(record.is_none());
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn compacts_turns_beyond_keep_window() {
        let (provider, s) = summarizer(ScriptedProvider::texts(&["  early turns  "]), 20);
        let raw = thread(25);
        let record = s.compact(&raw, None, 10).await.unwrap().unwrap();

        assert_eq!(record.first_item_id, "u1");
        assert_eq!(record.last_item_id, "a15");
        assert_eq!(record.replaced_items, 30);
        assert_eq!(record.summary, "early turns");

        let view = apply_compaction(&raw, &record);
        assert_eq!(count_turns(&view), 10);
        assert_eq!(view[2].id, "u16");
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn recompaction_only_summarizes_new_items() {
        let (provider, s) = summarizer(ScriptedProvider::texts(&["first", "merged"]), 20);
        let mut raw = thread(21);
        let first = s.compact(&raw, None, 10).await.unwrap().unwrap();
        assert_eq!(first.last_item_id, "a11");

        for n in 22..=32 {
            raw.push(Item::user(format!("u{n}")).with_id(format!("u{n}")));
            raw.push(Item::assistant(format!("a{n}")).with_id(format!("a{n}")));
        }
        let second = s.compact(&raw, Some(&first), 10).await.unwrap().unwrap();
        assert_eq!(second.first_item_id, "u1");
        assert_eq!(second.last_item_id, "a22");
        assert_eq!(second.summary, "merged");

        let requests = provider.requests();
        let body = requests[1][1].content.to_text();
        assert!(body.contains("EXISTING SUMMARY ===\nfirst"));
        assert!(body.contains("[user]: u12"));
        assert!(!body.contains("[user]: u11\n"));
    }

    #[tokio::test]
    async fn provider_error_is_returned() {
        let (_, s) = summarizer(
            ScriptedProvider::new(vec![Err(ProviderError::Api("overloaded".into()))]),
            2,
        );
        let result = s.compact(&thread(5), None, 1).await;
        assert!(matches!(result, Err(ProviderError::Api(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let provider = Arc::new(
            ScriptedProvider::new(vec![Ok(Generation::text("late"))])
                .with_delay(Duration::from_secs(60)),
        );
        let s = Summarizer::new(
            provider,
            SummarizerConfig::default()
                .with_compact_after_turns(2)
                .with_timeout(Duration::from_secs(5)),
        );
        let result = s.compact(&thread(5), None, 1).await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
    }
}
