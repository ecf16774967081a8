//! Turn segmentation, turn-count trimming and tool-pair repair.
//!
//! A thread's items are read as three zones:
//!
//! ```text
//! [ pinned prefix ][ preamble ][ turn 1 ][ turn 2 ] ... [ turn N ]
//!   system notes     anything    user msg + everything up to the
//!   before the       else before next user msg
//!   first user msg   turn 1
//! ```
//!
//! The pinned prefix (system instruction plus any compaction summary) is
//! never dropped by trimming.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{Item, ItemKind};

/// A thread split into its pinned prefix, loose preamble and user turns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segments {
    pub pinned: Vec<Item>,
    pub preamble: Vec<Item>,
    /// Each turn starts with its user message.
    pub turns: Vec<Vec<Item>>,
}

impl Segments {
    /// Flatten back into a single ordered sequence.
    pub fn into_items(self) -> Vec<Item> {
        let mut out = self.pinned;
        out.extend(self.preamble);
        for turn in self.turns {
            out.extend(turn);
        }
        out
    }

    pub fn item_count(&self) -> usize {
        self.pinned.len() + self.preamble.len() + self.turns.iter().map(Vec::len).sum::<usize>()
    }
}

/// Split `items` into pinned prefix, preamble and turns.
pub fn segment(items: Vec<Item>) -> Segments {
    let mut segments = Segments::default();
    let mut in_prefix = true;

    for item in items {
        if item.is_user_message() {
            in_prefix = false;
            segments.turns.push(vec![item]);
        } else if let Some(turn) = segments.turns.last_mut() {
            turn.push(item);
        } else if in_prefix && item.is_system_note() {
            segments.pinned.push(item);
        } else {
            in_prefix = false;
            segments.preamble.push(item);
        }
    }

    segments
}

/// Number of user turns in `items`.
pub fn count_turns(items: &[Item]) -> usize {
    items.iter().filter(|i| i.is_user_message()).count()
}

/// Keep only the most recent `max_turns` user turns.
///
/// When trimming happens the loose preamble goes too; the pinned prefix
/// always stays. A `max_turns` of zero is treated as one, since the newest
/// user message is never dropped. Returns the items unchanged when the turn
/// count is already within the limit.
pub fn trim_turns(items: Vec<Item>, max_turns: usize) -> Vec<Item> {
    let max_turns = max_turns.max(1);
    let mut segments = segment(items);
    let total = segments.turns.len();
    if total <= max_turns {
        return segments.into_items();
    }

    let excess = total - max_turns;
    let dropped_items: usize = segments.preamble.len()
        + segments.turns.iter().take(excess).map(Vec::len).sum::<usize>();
    segments.preamble.clear();
    segments.turns.drain(..excess);
    debug!(
        turns_dropped = excess,
        items_dropped = dropped_items,
        "Trimmed history to {max_turns} turns"
    );
    segments.into_items()
}

/// Reorder and prune tool items so every `tool_call` is immediately followed
/// by its `tool_result`.
///
/// Works per segment (pinned prefix, preamble, each turn). A call claims the
/// first result with the same `call_id` in its segment, and that result is
/// moved directly behind it. Calls without a result, results without a call
/// and duplicates are dropped with a warning. Running this on its own output
/// changes nothing.
pub fn repair_tool_pairs(items: Vec<Item>) -> Vec<Item> {
    let segments = segment(items);
    Segments {
        pinned: repair_segment(segments.pinned),
        preamble: repair_segment(segments.preamble),
        turns: segments.turns.into_iter().map(repair_segment).collect(),
    }
    .into_items()
}

fn repair_segment(items: Vec<Item>) -> Vec<Item> {
    let mut results: Vec<Option<Item>> = Vec::new();
    let mut result_slot: HashMap<String, usize> = HashMap::new();
    let mut rest = Vec::with_capacity(items.len());

    for item in items {
        if item.kind != ItemKind::ToolResult {
            rest.push(item);
            continue;
        }
        match item.call_id.clone() {
            Some(call_id) if !result_slot.contains_key(&call_id) => {
                result_slot.insert(call_id, results.len());
                results.push(Some(item));
            }
            call_id => warn!(?call_id, item_id = %item.id, "Dropping duplicate or uncorrelated tool_result"),
        }
    }

    let mut out = Vec::with_capacity(rest.len() + results.len());
    for item in rest {
        if item.kind != ItemKind::ToolCall {
            out.push(item);
            continue;
        }
        let result = item
            .call_id
            .as_ref()
            .and_then(|id| result_slot.get(id).copied())
            .and_then(|slot| results.get_mut(slot))
            .and_then(Option::take);
        match result {
            Some(result) => {
                out.push(item);
                out.push(result);
            }
            None => warn!(
                call_id = ?item.call_id,
                item_id = %item.id,
                "Dropping tool_call without a matching tool_result"
            ),
        }
    }

    for orphan in results.into_iter().flatten() {
        warn!(call_id = ?orphan.call_id, item_id = %orphan.id, "Dropping tool_result without a matching tool_call");
    }

    out
}

/// Describe every place where the pairing invariant is broken. Empty means
/// the sequence is valid model input.
pub fn pairing_violations(items: &[Item]) -> Vec<String> {
    let mut violations = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        match item.kind {
            ItemKind::ToolCall => {
                let answered = items.get(idx + 1).is_some_and(|next| item.is_answered_by(next));
                if !answered {
                    violations.push(format!(
                        "tool_call {} at {idx} is not followed by its tool_result",
                        item.id
                    ));
                }
            }
            ItemKind::ToolResult => {
                let paired = idx
                    .checked_sub(1)
                    .and_then(|prev| items.get(prev))
                    .is_some_and(|prev| prev.is_answered_by(item));
                if !paired {
                    violations.push(format!(
                        "tool_result {} at {idx} does not directly follow its tool_call",
                        item.id
                    ));
                }
            }
            _ => {}
        }
    }
    violations
}

/// Group items into droppable units: a `tool_call` together with the
/// `tool_result` right after it, or any other single item.
pub fn tool_units(items: Vec<Item>) -> Vec<Vec<Item>> {
    let mut units: Vec<Vec<Item>> = Vec::new();
    for item in items {
        let joins_previous = units
            .last()
            .and_then(|unit| unit.last())
            .is_some_and(|prev| prev.is_answered_by(&item));
        match units.last_mut() {
            Some(unit) if joins_previous => unit.push(item),
            _ => units.push(vec![item]),
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[Item]) -> Vec<String> {
        items.iter().map(|i| i.content.to_text()).collect()
    }

    fn history(turns: usize) -> Vec<Item> {
        let mut items = vec![Item::system_note("system")];
        for n in 1..=turns {
            items.push(Item::user(format!("u{n}")));
            items.push(Item::assistant(format!("a{n}")));
        }
        items
    }

    #[test]
    fn segment_splits_zones() {
        let items = vec![
            Item::system_note("sys"),
            Item::system_note("summary"),
            Item::assistant("greeting"),
            Item::system_note("late note"),
            Item::user("u1"),
            Item::assistant("a1"),
            Item::user("u2"),
        ];
        let segments = segment(items.clone());
        assert_eq!(texts(&segments.pinned), vec!["sys", "summary"]);
        assert_eq!(texts(&segments.preamble), vec!["greeting", "late note"]);
        assert_eq!(segments.turns.len(), 2);
        assert_eq!(segments.item_count(), items.len());
        assert_eq!(segments.into_items(), items);
    }

    #[test]
    fn trim_keeps_most_recent_turns_and_pinned() {
        let trimmed = trim_turns(history(25), 10);
        assert_eq!(count_turns(&trimmed), 10);
        assert_eq!(trimmed[0].content.to_text(), "system");
        assert_eq!(trimmed[1].content.to_text(), "u16");
        assert_eq!(trimmed.last().unwrap().content.to_text(), "a25");
    }

    #[test]
    fn trim_is_idempotent() {
        let once = trim_turns(history(25), 10);
        let twice = trim_turns(once.clone(), 10);
        assert_eq!(once, twice);
    }

    #[test]
    fn trim_within_limit_is_noop() {
        let items = history(3);
        assert_eq!(trim_turns(items.clone(), 10), items);
    }

    #[test]
    fn trim_drops_preamble_when_trimming() {
        let mut items = vec![Item::system_note("sys"), Item::assistant("hello there")];
        items.extend(history(3).into_iter().skip(1));
        let trimmed = trim_turns(items, 2);
        assert_eq!(texts(&trimmed), vec!["sys", "u2", "a2", "u3", "a3"]);
    }

    #[test]
    fn trim_zero_keeps_newest_turn() {
        let trimmed = trim_turns(history(4), 0);
        assert_eq!(texts(&trimmed), vec!["system", "u4", "a4"]);
    }

    #[test]
    fn repair_moves_result_behind_call() {
        let items = vec![
            Item::user("u"),
            Item::tool_call("c1", "search", "{}"),
            Item::assistant("thinking"),
            Item::tool_result("c1", "search", "r1"),
        ];
        let repaired = repair_tool_pairs(items);
        assert_eq!(texts(&repaired), vec!["u", "{}", "r1", "thinking"]);
        assert!(pairing_violations(&repaired).is_empty());
    }

    #[test]
    fn repair_drops_orphans_and_duplicates() {
        let items = vec![
            Item::user("u"),
            Item::tool_call("c1", "search", "call-1"),
            Item::tool_result("c1", "search", "r1"),
            Item::tool_result("c1", "search", "r1-dup"),
            Item::tool_call("c2", "search", "call-2"),
            Item::tool_result("c3", "search", "r3"),
        ];
        let repaired = repair_tool_pairs(items);
        assert_eq!(texts(&repaired), vec!["u", "call-1", "r1"]);
        assert!(pairing_violations(&repaired).is_empty());
    }

    #[test]
    fn repair_does_not_pair_across_turns() {
        let items = vec![
            Item::user("u1"),
            Item::tool_call("c1", "search", "call"),
            Item::user("u2"),
            Item::tool_result("c1", "search", "late"),
        ];
        let repaired = repair_tool_pairs(items);
        assert_eq!(texts(&repaired), vec!["u1", "u2"]);
    }

    #[test]
    fn repair_is_idempotent() {
        let items = vec![
            Item::system_note("sys"),
            Item::user("u"),
            Item::tool_result("c2", "b", "r2"),
            Item::tool_call("c1", "a", "x"),
            Item::tool_call("c2", "b", "y"),
            Item::tool_result("c1", "a", "r1"),
        ];
        let once = repair_tool_pairs(items);
        let twice = repair_tool_pairs(once.clone());
        assert_eq!(once, twice);
        assert_eq!(texts(&once), vec!["sys", "u", "x", "r1", "y", "r2"]);
    }

    #[test]
    fn violations_are_reported() {
        let items = vec![
            Item::user("u"),
            Item::tool_call("c1", "a", "x"),
            Item::assistant("in between"),
            Item::tool_result("c1", "a", "r"),
        ];
        assert_eq!(pairing_violations(&items).len(), 2);
    }

    #[test]
    fn units_group_pairs() {
        let items = vec![
            Item::user("u"),
            Item::tool_call("c1", "a", "x"),
            Item::tool_result("c1", "a", "r"),
            Item::assistant("done"),
        ];
        let units = tool_units(items);
        let sizes: Vec<usize> = units.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 2, 1]);
    }
}
