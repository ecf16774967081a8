//! Stale tool-result clearing: replace old tool output with one-line
//! placeholders.
//!
//! Tool results are the single largest context consumer in an agent thread.
//! A CRM lookup or a document fetch can inject tens of kilobytes that are
//! irrelevant once the model has read them. Results in turns older than
//! `keep_recent_turns` whose payload exceeds `min_chars` are replaced with
//! `[Cleared: <tool> output, <n> chars]`. The `tool_call`/`tool_result` pair
//! itself is kept, so pairing stays valid. No LLM call is needed.

use std::collections::HashSet;

use tracing::debug;

use crate::{Content, Item, ItemKind};

/// Prefix used for cleared tool result placeholders.
///
/// Both the placeholder writer and the "already cleared?" check reference
/// this constant so they can't drift out of sync.
pub const EVICTED_PREFIX: &str = "[Cleared:";

/// Appended to the id of a cleared item.
pub const CLEARED_ID_SUFFIX: &str = "-cleared";

/// Configuration for stale tool-result clearing.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Tools whose results are never cleared.
    pub protected_tools: HashSet<String>,
    /// Results in this many most recent turns are left alone.
    pub keep_recent_turns: usize,
    /// Payloads at or below this size (in characters) are left alone.
    pub min_chars: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            protected_tools: HashSet::new(),
            keep_recent_turns: 2,
            min_chars: 500,
        }
    }
}

impl EvictionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a protected tool name (its results will never be cleared).
    pub fn protect_tool(mut self, name: impl Into<String>) -> Self {
        self.protected_tools.insert(name.into());
        self
    }

    pub fn with_keep_recent_turns(mut self, turns: usize) -> Self {
        self.keep_recent_turns = turns;
        self
    }

    pub fn with_min_chars(mut self, chars: usize) -> Self {
        self.min_chars = chars;
        self
    }
}

/// What [`clear_stale_tool_results`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearStats {
    /// Number of results replaced with a placeholder.
    pub cleared: usize,
    /// Characters removed (original length minus placeholder length).
    pub freed_chars: usize,
}

/// Placeholder text for a cleared result.
pub fn placeholder(tool_name: &str, chars: usize) -> String {
    format!("{EVICTED_PREFIX} {tool_name} output, {chars} chars]")
}

/// Whether `item` holds a placeholder written by this module.
pub fn is_cleared(item: &Item) -> bool {
    item.content
        .as_text()
        .is_some_and(|t| t.starts_with(EVICTED_PREFIX))
}

/// Clear large tool results in turns older than `config.keep_recent_turns`.
///
/// Items before the first user message count as older than every turn.
/// Already-cleared results are skipped, so running this twice is the same as
/// running it once.
pub fn clear_stale_tool_results(items: &mut [Item], config: &EvictionConfig) -> ClearStats {
    let total_turns = items.iter().filter(|i| i.is_user_message()).count();
    let mut stats = ClearStats::default();
    // An item's age is the number of turns that come after its own.
    let mut seen_turns = 0usize;

    for item in items.iter_mut() {
        if item.is_user_message() {
            seen_turns += 1;
            continue;
        }
        if item.kind != ItemKind::ToolResult {
            continue;
        }

        let age = if seen_turns == 0 {
            total_turns
        } else {
            total_turns - seen_turns
        };
        if age < config.keep_recent_turns || is_cleared(item) {
            continue;
        }

        let tool = item.tool_name.as_deref().unwrap_or("tool");
        if config.protected_tools.contains(tool) {
            continue;
        }

        let chars = item.content.char_len();
        if chars <= config.min_chars {
            continue;
        }

        let text = placeholder(tool, chars);
        stats.freed_chars += chars.saturating_sub(text.chars().count());
        stats.cleared += 1;
        item.content = Content::Text(text);
        // New content, new id: estimates cached by id must not match it.
        item.id.push_str(CLEARED_ID_SUFFIX);
    }

    if stats.cleared > 0 {
        debug!(
            cleared = stats.cleared,
            freed_chars = stats.freed_chars,
            "Cleared stale tool results"
        );
    }
    stats
}
