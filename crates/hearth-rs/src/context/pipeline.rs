//! The context reduction pipeline.
//!
//! [`ContextManager::reduce`] runs the deterministic stages in order:
//!
//! 0. [`repair_tool_pairs`]: every `tool_call` directly followed by its result
//! 1. [`trim_turns`]: at most `max_turns` user turns
//! 2. [`clear_stale_tool_results`]: placeholders for old, large tool output
//! 3. [`enforce_token_budget`]: drop oldest units until the estimate fits
//!
//! Each stage is a pure function over an item list and idempotent, so the
//! whole pipeline is too. Summarizing compaction is asynchronous and lives
//! in [`Session`](super::session::Session), which runs it before this.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::ContextError;
use super::budget::{
    CharEstimator, ContextBudget, KnownEstimates, TokenEstimator, enforce_token_budget, force_truncate,
};
use super::eviction::{EvictionConfig, clear_stale_tool_results};
use super::turns::{pairing_violations, repair_tool_pairs, trim_turns};
use crate::Item;

/// Before/after figures for one reduction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextReport {
    pub items_before: usize,
    pub items_after: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// Tool results replaced with placeholders.
    pub cleared: usize,
    /// Items dropped by turn trimming and budget enforcement.
    pub dropped: usize,
    /// Raw items folded into a summary by a compaction created for this
    /// request, if one was.
    pub compacted: Option<usize>,
}

impl ContextReport {
    pub fn to_log_string(&self) -> String {
        format!(
            "items {} -> {}, ~{} -> ~{} tokens, {} cleared, {} dropped",
            self.items_before,
            self.items_after,
            self.tokens_before,
            self.tokens_after,
            self.cleared,
            self.dropped,
        )
    }
}

/// Model input that fits the budget, with a report of how it was produced.
#[derive(Debug, Clone)]
pub struct BoundedItems {
    pub items: Vec<Item>,
    pub report: ContextReport,
}

/// Runs the reduction stages with one budget, eviction policy and estimator.
#[derive(Clone)]
pub struct ContextManager {
    budget: ContextBudget,
    eviction: EvictionConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextManager {
    pub fn new(budget: ContextBudget) -> Self {
        Self {
            budget,
            eviction: EvictionConfig::default(),
            estimator: Arc::new(CharEstimator::default()),
        }
    }

    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Run stages 0 to 3 over `items`.
    pub fn reduce(&self, items: Vec<Item>) -> Result<BoundedItems, ContextError> {
        self.reduce_with(items, self.estimator.as_ref(), false)
    }

    /// Like [`reduce`](Self::reduce), but shortens the newest user message
    /// instead of failing with a policy violation.
    pub fn reduce_forced(&self, items: Vec<Item>) -> Result<BoundedItems, ContextError> {
        self.reduce_with(items, self.estimator.as_ref(), true)
    }

    /// Run the stages, taking estimates for items whose id is in `known`
    /// instead of estimating them again.
    pub fn reduce_with_estimates(
        &self,
        items: Vec<Item>,
        known: &HashMap<String, usize>,
        force: bool,
    ) -> Result<BoundedItems, ContextError> {
        let estimator = KnownEstimates::new(self.estimator.as_ref(), known);
        self.reduce_with(items, &estimator, force)
    }

    fn reduce_with(
        &self,
        items: Vec<Item>,
        estimator: &dyn TokenEstimator,
        force: bool,
    ) -> Result<BoundedItems, ContextError> {
        let items_before = items.len();
        let tokens_before = estimator.estimate_all(&items);

        let items = repair_tool_pairs(items);
        let repaired = items.len();
        let items = match self.budget.max_turns {
            Some(max_turns) => trim_turns(items, max_turns),
            None => items,
        };
        let trimmed = repaired - items.len();

        let mut items = items;
        let cleared = clear_stale_tool_results(&mut items, &self.eviction);

        let fitted = if force {
            force_truncate(items, &self.budget, estimator)?
        } else {
            enforce_token_budget(items, &self.budget, estimator)?
        };
        debug_assert!(
            pairing_violations(&fitted.items).is_empty(),
            "context pipeline produced unpaired tool items"
        );

        let report = ContextReport {
            items_before,
            items_after: fitted.items.len(),
            tokens_before,
            tokens_after: fitted.tokens,
            cleared: cleared.cleared,
            dropped: trimmed + fitted.dropped,
            compacted: None,
        };
        debug!("{}", report.to_log_string());

        Ok(BoundedItems {
            items: fitted.items,
            report,
        })
    }
}
