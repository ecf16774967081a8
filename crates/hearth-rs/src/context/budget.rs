//! Token budgets, token estimation and budget enforcement.
//!
//! Token counts are estimates. The default [`CharEstimator`] divides the
//! character count by a fixed ratio and adds a small per-item overhead for
//! role and framing tokens. Exact tokenizer fidelity is not a goal; the
//! estimator is a trait so a real tokenizer can be plugged in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ContextError;
use super::turns::{segment, tool_units};
use crate::{Content, Item};

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Tokens charged per item for role and message framing.
pub const DEFAULT_ITEM_OVERHEAD: usize = 4;

/// Default context window size in tokens.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// Marker appended to a user message shortened by [`force_truncate`].
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Appended to the id of a user message shortened by [`force_truncate`].
pub const TRUNCATED_ID_SUFFIX: &str = "-truncated";

/// Size limits for one model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    /// Model context window in tokens.
    pub max_tokens: usize,
    /// Keep at most this many user turns. `None` means unlimited.
    #[serde(default)]
    pub max_turns: Option<usize>,
    /// Tokens held back for the model's response.
    #[serde(default)]
    pub reserved_for_response: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_CONTEXT_WINDOW,
            max_turns: None,
            reserved_for_response: 4096,
        }
    }
}

impl ContextBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            max_turns: None,
            reserved_for_response: 0,
        }
    }

    pub fn with_max_turns(mut self, turns: usize) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn with_reserved_for_response(mut self, tokens: usize) -> Self {
        self.reserved_for_response = tokens;
        self
    }

    /// Tokens available for the input: `max_tokens - reserved_for_response`.
    pub fn effective_limit(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserved_for_response)
    }

    /// Usage snapshot for `tokens` against this budget.
    pub fn usage(&self, tokens: usize) -> ContextUsage {
        let limit = self.effective_limit();
        let usage_pct = if limit > 0 {
            tokens as f64 / limit as f64
        } else {
            1.0
        };
        ContextUsage {
            estimated_tokens: tokens,
            max_tokens: limit,
            usage_pct,
        }
    }
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct ContextUsage {
    /// Estimated tokens consumed.
    pub estimated_tokens: usize,
    /// Effective limit.
    pub max_tokens: usize,
    /// Usage as a fraction (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.max_tokens,
        )
    }
}

// ── Estimation ─────────────────────────────────────────────────────

/// Estimates the token cost of items.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, item: &Item) -> usize;

    fn estimate_all(&self, items: &[Item]) -> usize {
        items.iter().map(|i| self.estimate(i)).sum()
    }
}

/// Reuses estimates computed earlier, keyed by [`Item::id`]. Unknown items
/// go to `inner`.
///
/// Stages that rewrite an item's content also change its id, so a known
/// estimate always belongs to the content it was computed for.
pub struct KnownEstimates<'a> {
    inner: &'a dyn TokenEstimator,
    known: &'a HashMap<String, usize>,
}

impl<'a> KnownEstimates<'a> {
    pub fn new(inner: &'a dyn TokenEstimator, known: &'a HashMap<String, usize>) -> Self {
        Self { inner, known }
    }
}

impl TokenEstimator for KnownEstimates<'_> {
    fn estimate(&self, item: &Item) -> usize {
        match self.known.get(&item.id) {
            Some(&tokens) => tokens,
            None => self.inner.estimate(item),
        }
    }
}

/// `ceil(chars / chars_per_token) + per_item_overhead`.
#[derive(Debug, Clone)]
pub struct CharEstimator {
    pub chars_per_token: f64,
    pub per_item_overhead: usize,
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            per_item_overhead: DEFAULT_ITEM_OVERHEAD,
        }
    }
}

impl CharEstimator {
    /// Estimator with a calibrated ratio, e.g. derived from provider usage.
    pub fn with_chars_per_token(chars_per_token: f64) -> Self {
        Self {
            chars_per_token,
            ..Default::default()
        }
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, item: &Item) -> usize {
        let chars = item.content.char_len();
        let cpt = if self.chars_per_token > 0.0 {
            self.chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        (chars as f64 / cpt).ceil() as usize + self.per_item_overhead
    }
}

// ── Enforcement ────────────────────────────────────────────────────

/// Output of [`enforce_token_budget`].
#[derive(Debug, Clone, PartialEq)]
pub struct Fitted {
    pub items: Vec<Item>,
    /// Estimated tokens of `items`.
    pub tokens: usize,
    /// Number of items removed.
    pub dropped: usize,
}

struct Unit {
    items: Vec<Item>,
    tokens: usize,
    droppable: bool,
    kept: bool,
}

/// Drop the oldest non-pinned content until the estimate fits
/// `budget.effective_limit()`.
///
/// Pinned content is the leading run of system notes plus the newest user
/// message. Drop order is oldest first: loose preamble units, then whole
/// older turns, then units of the newest turn that follow its user message
/// (a tool call and its result are dropped together).
///
/// Returns [`ContextError::PolicyViolation`] when the pinned content alone
/// is over the limit.
pub fn enforce_token_budget(
    items: Vec<Item>,
    budget: &ContextBudget,
    estimator: &dyn TokenEstimator,
) -> Result<Fitted, ContextError> {
    let available = budget.effective_limit();
    let segments = segment(items);

    let mut units: Vec<Unit> = Vec::new();
    let mut push = |items: Vec<Item>, droppable: bool| {
        let tokens = estimator.estimate_all(&items);
        units.push(Unit {
            items,
            tokens,
            droppable,
            kept: true,
        });
    };

    push(segments.pinned, false);
    for unit in tool_units(segments.preamble) {
        push(unit, true);
    }
    let mut turns = segments.turns;
    let newest = turns.pop();
    for turn in turns {
        push(turn, true);
    }
    if let Some(mut newest) = newest {
        let tail = newest.split_off(1.min(newest.len()));
        push(newest, false);
        for unit in tool_units(tail) {
            push(unit, true);
        }
    }

    let required: usize = units.iter().filter(|u| !u.droppable).map(|u| u.tokens).sum();
    if required > available {
        warn!(required, available, "Pinned context alone exceeds the token budget");
        return Err(ContextError::PolicyViolation {
            required,
            available,
        });
    }

    let mut total: usize = units.iter().map(|u| u.tokens).sum();
    let mut dropped = 0;
    for unit in units.iter_mut().filter(|u| u.droppable) {
        if total <= available {
            break;
        }
        unit.kept = false;
        total -= unit.tokens;
        dropped += unit.items.len();
    }

    if dropped > 0 {
        debug!(dropped, tokens = total, available, "Dropped items to fit token budget");
    }

    let items = units
        .into_iter()
        .filter(|u| u.kept)
        .flat_map(|u| u.items)
        .collect();
    Ok(Fitted {
        items,
        tokens: total,
        dropped,
    })
}

/// Shorten the newest user message until pinned content fits, then enforce
/// the budget.
///
/// This is the explicit override for a [`ContextError::PolicyViolation`].
/// It still fails if the pinned prefix alone is over the limit.
pub fn force_truncate(
    items: Vec<Item>,
    budget: &ContextBudget,
    estimator: &dyn TokenEstimator,
) -> Result<Fitted, ContextError> {
    let available = budget.effective_limit();
    let mut segments = segment(items);
    let prefix_tokens = estimator.estimate_all(&segments.pinned);

    if let Some(user) = segments.turns.last_mut().and_then(|turn| turn.first_mut()) {
        let fits = |item: &Item| prefix_tokens + estimator.estimate(item) <= available;
        if !fits(user) {
            let text = user.content.to_text();
            let chars: Vec<char> = text.chars().collect();
            let candidate = |n: usize| {
                let mut shortened: String = chars.iter().take(n).collect();
                shortened.push_str(TRUNCATION_MARKER);
                let mut item = user.clone();
                item.content = Content::Text(shortened);
                item.id.push_str(TRUNCATED_ID_SUFFIX);
                item
            };

            // Largest prefix length that still fits.
            let (mut lo, mut hi) = (0usize, chars.len());
            while lo < hi {
                let mid = lo + (hi - lo).div_ceil(2);
                if fits(&candidate(mid)) {
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
            warn!(
                original_chars = chars.len(),
                kept_chars = lo,
                "Force-truncating newest user message to fit the token budget"
            );
            *user = candidate(lo);
        }
    }

    enforce_token_budget(segments.into_items(), budget, estimator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::turns::pairing_violations;

    /// One token per character, no overhead: easy arithmetic in tests.
    struct CharCount;

    impl TokenEstimator for CharCount {
        fn estimate(&self, item: &Item) -> usize {
            item.content.char_len()
        }
    }

    fn texts(items: &[Item]) -> Vec<String> {
        items.iter().map(|i| i.content.to_text()).collect()
    }

    #[test]
    fn effective_limit_saturates() {
        let budget = ContextBudget::new(100).with_reserved_for_response(30);
        assert_eq!(budget.effective_limit(), 70);
        let tiny = ContextBudget::new(10).with_reserved_for_response(30);
        assert_eq!(tiny.effective_limit(), 0);
    }

    #[test]
    fn char_estimator_rounds_up_and_adds_overhead() {
        let est = CharEstimator::default();
        assert_eq!(est.estimate(&Item::user("abcdefg")), 2 + DEFAULT_ITEM_OVERHEAD);
        assert_eq!(est.estimate(&Item::user("")), DEFAULT_ITEM_OVERHEAD);
        let items = vec![Item::user("abc"), Item::assistant("abcd")];
        assert_eq!(est.estimate_all(&items), 1 + 2 + 2 * DEFAULT_ITEM_OVERHEAD);
    }

    #[test]
    fn within_budget_is_untouched() {
        let items = vec![Item::system_note("sys"), Item::user("hi")];
        let fitted = enforce_token_budget(items.clone(), &ContextBudget::new(100), &CharCount).unwrap();
        assert_eq!(fitted.items, items);
        assert_eq!(fitted.tokens, 5);
        assert_eq!(fitted.dropped, 0);
    }

    #[test]
    fn drops_oldest_turns_first() {
        let items = vec![
            Item::system_note("ss"),
            Item::user("u1"),
            Item::assistant("aaaaaaaaaa"),
            Item::user("u2"),
            Item::assistant("bbbb"),
            Item::user("u3"),
        ];
        let fitted = enforce_token_budget(items, &ContextBudget::new(12), &CharCount).unwrap();
        assert_eq!(texts(&fitted.items), vec!["ss", "u2", "bbbb", "u3"]);
        assert!(fitted.tokens <= 12);
        assert_eq!(fitted.dropped, 2);
    }

    #[test]
    fn drops_inside_newest_turn_keeping_pairs() {
        let items = vec![
            Item::system_note("s"),
            Item::user("u"),
            Item::tool_call("c1", "search", "cccc"),
            Item::tool_result("c1", "search", "rrrrrrrr"),
            Item::assistant("fin"),
        ];
        let fitted = enforce_token_budget(items, &ContextBudget::new(6), &CharCount).unwrap();
        assert_eq!(texts(&fitted.items), vec!["s", "u", "fin"]);
        assert!(pairing_violations(&fitted.items).is_empty());
    }

    #[test]
    fn pinned_over_budget_is_policy_violation() {
        let items = vec![Item::system_note("system prompt"), Item::user("a long question")];
        let err = enforce_token_budget(items, &ContextBudget::new(10), &CharCount).unwrap_err();
        match err {
            ContextError::PolicyViolation {
                required,
                available,
            } => {
                assert_eq!(required, 28);
                assert_eq!(available, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn force_truncate_shortens_newest_user_message() {
        let items = vec![
            Item::system_note("sys"),
            Item::user("old"),
            Item::user("x".repeat(100)),
        ];
        let budget = ContextBudget::new(40);
        let fitted = force_truncate(items, &budget, &CharCount).unwrap();
        let last = fitted.items.last().unwrap().content.to_text();
        assert!(last.ends_with(TRUNCATION_MARKER));
        assert!(fitted.tokens <= 40);
        // 3 (sys) + n + 12 (marker) == 40
        assert_eq!(last.chars().count(), 37);
        assert!(fitted.items.last().unwrap().id.ends_with(TRUNCATED_ID_SUFFIX));
    }

    #[test]
    fn known_estimates_are_reused_by_id() {
        let cached = Item::user("abc");
        let fresh = Item::user("abcd");
        let known = HashMap::from([(cached.id.clone(), 100)]);
        let est = KnownEstimates::new(&CharCount, &known);

        assert_eq!(est.estimate(&cached), 100);
        assert_eq!(est.estimate(&fresh), 4);
        assert_eq!(est.estimate_all(&[cached, fresh]), 104);
    }

    #[test]
    fn force_truncate_fails_when_prefix_alone_is_too_big() {
        let items = vec![Item::system_note("s".repeat(50)), Item::user("hi")];
        let result = force_truncate(items, &ContextBudget::new(20), &CharCount);
        assert!(matches!(result, Err(ContextError::PolicyViolation { .. })));
    }

    #[test]
    fn budget_deserializes_with_defaults() {
        let budget: ContextBudget = serde_json::from_str(r#"{"max_tokens": 8000}"#).unwrap();
        assert_eq!(budget.max_turns, None);
        assert_eq!(budget.reserved_for_response, 0);
        assert_eq!(budget.effective_limit(), 8000);
    }

    #[test]
    fn usage_log_string_format() {
        let usage = ContextBudget::new(1000).usage(250);
        assert_eq!(usage.to_log_string(), "context: ~250 tokens (25% of 1000)");
    }
}
