//! Per-thread session: the single entry point between a running turn and a
//! thread's history.
//!
//! Reads go through [`Session::items_for_model`], which loads the raw items,
//! applies the latest compaction, optionally compacts further, and runs the
//! reduction pipeline. Writes go through [`Session::append_item`], which
//! stores the raw item unmodified.
//!
//! Each stored item is estimated once. The estimates are kept by item id and
//! fed back into the pipeline, so a model call only estimates what is new
//! since the previous one (plus summary notes and items a stage rewrote).

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ContextError;
use super::budget::{CharEstimator, ContextBudget, TokenEstimator};
use super::eviction::EvictionConfig;
use super::pipeline::{BoundedItems, ContextManager};
use super::store::ItemStore;
use super::summarizer::{CompactionRecord, Summarizer, SummarizerConfig, apply_compaction};
use crate::Item;
use crate::agent::config::Toggle;
use crate::api::provider::LlmProvider;

/// Everything that shapes how a thread's history becomes model input.
///
/// When summarization is enabled, [`Session::with_summarizer`] lowers
/// `compact_after_turns` to `budget.max_turns`, so turns are summarized
/// before trimming drops them.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub budget: ContextBudget,
    pub eviction: EvictionConfig,
    pub summarizer: Toggle<SummarizerConfig>,
}

#[derive(Debug, Default)]
struct TokenCache {
    /// Estimate per stored item id.
    estimates: HashMap<String, usize>,
    /// Leading stored items summed into `tokens`.
    item_count: usize,
    /// Id of the last of those items.
    last_id: Option<String>,
    tokens: usize,
}

/// A thread's history plus the policy used to bound it.
pub struct Session {
    thread_id: String,
    store: Arc<dyn ItemStore>,
    manager: ContextManager,
    summarizer_config: Toggle<SummarizerConfig>,
    summarizer: Option<Summarizer>,
    compactions: Mutex<Vec<CompactionRecord>>,
    token_cache: Mutex<TokenCache>,
}

impl Session {
    pub fn new(thread_id: impl Into<String>, store: Arc<dyn ItemStore>, config: SessionConfig) -> Self {
        Self {
            thread_id: thread_id.into(),
            store,
            manager: ContextManager::new(config.budget).with_eviction(config.eviction),
            summarizer_config: config.summarizer,
            summarizer: None,
            compactions: Mutex::new(Vec::new()),
            token_cache: Mutex::new(TokenCache::default()),
        }
    }

    /// Enable compaction through `provider`, if the config has it enabled.
    ///
    /// A `compact_after_turns` above `budget.max_turns` is lowered to it.
    pub fn with_summarizer(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        if self.summarizer_config.enabled {
            let mut config = self.summarizer_config.config.clone();
            if let Some(max_turns) = self.budget().max_turns
                && config.compact_after_turns > max_turns.max(1)
            {
                debug!(
                    compact_after_turns = config.compact_after_turns,
                    max_turns, "Lowering compaction threshold to max_turns"
                );
                config.compact_after_turns = max_turns.max(1);
            }
            self.summarizer = Some(Summarizer::new(provider, config));
        }
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.manager = self.manager.with_estimator(estimator);
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn budget(&self) -> &ContextBudget {
        self.manager.budget()
    }

    pub fn has_summarizer(&self) -> bool {
        self.summarizer.is_some()
    }

    /// The thread's compaction log, oldest first.
    pub fn compactions(&self) -> Vec<CompactionRecord> {
        self.compactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persist `item` unmodified.
    pub async fn append_item(&self, item: Item) -> Result<(), ContextError> {
        let id = item.id.clone();
        let tokens = self.manager.estimator().estimate(&item);
        self.store.append_item(&self.thread_id, item).await?;
        // Only the estimate is recorded. Other writers may have appended
        // before this item, so the running total is left to the next refresh.
        self.cache().estimates.insert(id, tokens);
        Ok(())
    }

    /// Estimated tokens of the raw thread. Only items appended since the
    /// last estimate are counted again.
    pub async fn estimated_tokens(&self) -> Result<usize, ContextError> {
        let raw = self.store.list_items(&self.thread_id).await?;
        Ok(self.refresh_token_cache(&raw))
    }

    fn cache(&self) -> MutexGuard<'_, TokenCache> {
        self.token_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_token_cache(&self, raw: &[Item]) -> usize {
        let mut guard = self.cache();
        let cache = &mut *guard;

        let prefix_intact = match cache.item_count {
            0 => true,
            n => raw.get(n - 1).map(|i| i.id.as_str()) == cache.last_id.as_deref(),
        };
        if !prefix_intact {
            // Store was rewritten underneath us; start over.
            let live: HashSet<&str> = raw.iter().map(|i| i.id.as_str()).collect();
            cache.estimates.retain(|id, _| live.contains(id.as_str()));
            cache.item_count = 0;
            cache.tokens = 0;
        }

        let estimator = self.manager.estimator();
        for item in raw.get(cache.item_count..).unwrap_or_default() {
            cache.tokens += *cache
                .estimates
                .entry(item.id.clone())
                .or_insert_with(|| estimator.estimate(item));
        }
        cache.item_count = raw.len();
        cache.last_id = raw.last().map(|i| i.id.clone());
        cache.tokens
    }

    /// Bounded model input for the next call.
    pub async fn items_for_model(&self) -> Result<BoundedItems, ContextError> {
        self.prepare(false).await
    }

    /// Like [`items_for_model`](Self::items_for_model), but an oversized
    /// newest user message is truncated instead of failing.
    pub async fn items_for_model_forced(&self) -> Result<BoundedItems, ContextError> {
        self.prepare(true).await
    }

    async fn prepare(&self, force: bool) -> Result<BoundedItems, ContextError> {
        let raw = self.store.list_items(&self.thread_id).await?;
        let raw_tokens = self.refresh_token_cache(&raw);
        debug!(
            thread = %self.thread_id,
            "{}",
            self.budget().usage(raw_tokens).to_log_string()
        );

        let mut latest = self
            .compactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned();
        let mut compacted = None;

        if let Some(summarizer) = &self.summarizer {
            let keep_recent = summarizer.config().keep_recent_turns;
            let keep = self.budget().max_turns.map_or(keep_recent, |m| keep_recent.min(m));
            match summarizer.compact(&raw, latest.as_ref(), keep).await {
                Ok(Some(record)) => {
                    info!(
                        thread = %self.thread_id,
                        replaced_items = record.replaced_items,
                        "Compacted older history into a summary"
                    );
                    compacted = Some(record.replaced_items);
                    self.compactions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(record.clone());
                    latest = Some(record);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    thread = %self.thread_id,
                    "Summarization failed, falling back to trimming: {e}"
                ),
            }
        }

        let view = match &latest {
            Some(record) => apply_compaction(&raw, record),
            None => raw,
        };
        let mut bounded = {
            let cache = self.cache();
            self.manager.reduce_with_estimates(view, &cache.estimates, force)?
        };
        bounded.report.compacted = compacted;
        Ok(bounded)
    }
}

// ── Policy tiers ───────────────────────────────────────────────────

/// Named budget policy a thread runs under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyTier {
    Free,
    Standard,
    Pro,
    #[serde(untagged)]
    Custom(String),
}

impl FromStr for PolicyTier {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "free" => PolicyTier::Free,
            "standard" => PolicyTier::Standard,
            "pro" => PolicyTier::Pro,
            _ => PolicyTier::Custom(s.to_string()),
        })
    }
}

/// Deserializable description of a custom tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    pub budget: ContextBudget,
    #[serde(default)]
    pub summarize: bool,
    /// Overrides `SummarizerConfig::compact_after_turns`.
    #[serde(default)]
    pub compact_after_turns: Option<usize>,
}

impl TierPolicy {
    pub fn to_session_config(&self) -> SessionConfig {
        let mut summarizer = SummarizerConfig::default();
        if let Some(turns) = self.compact_after_turns.or(self.budget.max_turns) {
            summarizer.compact_after_turns = turns;
            summarizer.keep_recent_turns = (turns / 2).max(1);
        }
        SessionConfig {
            budget: self.budget.clone(),
            eviction: EvictionConfig::default(),
            summarizer: Toggle {
                enabled: self.summarize,
                config: summarizer,
            },
        }
    }
}

fn builtin_policy(tier: &PolicyTier) -> Option<TierPolicy> {
    let (max_tokens, max_turns, reserved, summarize) = match tier {
        PolicyTier::Free => (32_000, 10, 1_024, false),
        PolicyTier::Standard => (128_000, 30, 4_096, true),
        PolicyTier::Pro => (200_000, 60, 8_192, true),
        PolicyTier::Custom(_) => return None,
    };
    Some(TierPolicy {
        budget: ContextBudget::new(max_tokens)
            .with_max_turns(max_turns)
            .with_reserved_for_response(reserved),
        summarize,
        compact_after_turns: None,
    })
}

/// Builds [`Session`]s for a store, choosing config by policy tier.
pub struct SessionFactory {
    store: Arc<dyn ItemStore>,
    provider: Option<Arc<dyn LlmProvider>>,
    estimator: Arc<dyn TokenEstimator>,
    custom: HashMap<String, TierPolicy>,
}

impl SessionFactory {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self {
            store,
            provider: None,
            estimator: Arc::new(CharEstimator::default()),
            custom: HashMap::new(),
        }
    }

    /// Provider used for compaction in tiers that summarize.
    pub fn with_summarizer_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Register a custom tier.
    pub fn with_policy(mut self, name: impl Into<String>, policy: TierPolicy) -> Self {
        self.custom.insert(name.into(), policy);
        self
    }

    /// Register custom tiers from a JSON object of `name -> TierPolicy`.
    pub fn with_policies_json(mut self, json: &str) -> Result<Self, serde_json::Error> {
        let policies: HashMap<String, TierPolicy> = serde_json::from_str(json)?;
        self.custom.extend(policies);
        Ok(self)
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    /// Config for `tier`. Unknown custom tiers fall back to `standard`.
    pub fn config_for(&self, tier: &PolicyTier) -> SessionConfig {
        let policy = match tier {
            PolicyTier::Custom(name) => self.custom.get(name).cloned(),
            builtin => builtin_policy(builtin),
        };
        match policy {
            Some(policy) => policy.to_session_config(),
            None => {
                warn!(?tier, "Unknown policy tier, using standard");
                builtin_policy(&PolicyTier::Standard)
                    .map(|p| p.to_session_config())
                    .unwrap_or_default()
            }
        }
    }

    pub fn session(&self, thread_id: impl Into<String>, tier: &PolicyTier) -> Session {
        let session = Session::new(thread_id, self.store.clone(), self.config_for(tier))
            .with_estimator(self.estimator.clone());
        match &self.provider {
            Some(provider) => session.with_summarizer(provider.clone()),
            None => session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ProviderError;
    use crate::api::provider::scripted::ScriptedProvider;
    use crate::context::store::InMemoryItemStore;
    use crate::context::turns::count_turns;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_turns: usize) -> SessionConfig {
        SessionConfig {
            budget: ContextBudget::new(100_000).with_max_turns(max_turns),
            eviction: EvictionConfig::default(),
            summarizer: Toggle::disabled(),
        }
    }

    fn summarizing(max_turns: usize, after: usize, keep: usize) -> SessionConfig {
        SessionConfig {
            summarizer: Toggle {
                enabled: true,
                config: SummarizerConfig::default()
                    .with_compact_after_turns(after)
                    .with_keep_recent_turns(keep),
            },
            ..config(max_turns)
        }
    }

    async fn fill(session: &Session, turns: usize) {
        session.append_item(Item::system_note("sys")).await.unwrap();
        for n in 1..=turns {
            session.append_item(Item::user(format!("u{n}"))).await.unwrap();
            session.append_item(Item::assistant(format!("a{n}"))).await.unwrap();
        }
    }

    #[tokio::test]
    async fn trims_to_max_turns() {
        let session = Session::new("t", Arc::new(InMemoryItemStore::new()), config(10));
        fill(&session, 25).await;

        let bounded = session.items_for_model().await.unwrap();
        assert_eq!(count_turns(&bounded.items), 10);
        assert_eq!(bounded.items[1].content.to_text(), "u16");
        assert_eq!(bounded.report.compacted, None);
    }

    #[tokio::test]
    async fn append_keeps_raw_items_and_token_cache() {
        let store = Arc::new(InMemoryItemStore::new());
        let session = Session::new("t", store.clone(), config(10));
        fill(&session, 3).await;

        let raw = store.list_items("t").await.unwrap();
        assert_eq!(raw.len(), 7);
        let expected = CharEstimator::default().estimate_all(&raw);
        assert_eq!(session.estimated_tokens().await.unwrap(), expected);

        // Items written by someone else are picked up incrementally.
        store.append_item("t", Item::user("external")).await.unwrap();
        let raw = store.list_items("t").await.unwrap();
        let expected = CharEstimator::default().estimate_all(&raw);
        assert_eq!(session.estimated_tokens().await.unwrap(), expected);
    }

    async fn exact_tokens(store: &InMemoryItemStore) -> usize {
        let raw = store.list_items("t").await.unwrap();
        CharEstimator::default().estimate_all(&raw)
    }

    #[tokio::test]
    async fn token_cache_survives_interleaved_writers() {
        let store = Arc::new(InMemoryItemStore::new());
        let session = Session::new("t", store.clone(), config(10));

        session.append_item(Item::user("a")).await.unwrap();
        store.append_item("t", Item::assistant("x".repeat(3500))).await.unwrap();
        session.append_item(Item::user("b".repeat(35))).await.unwrap();
        assert_eq!(session.estimated_tokens().await.unwrap(), exact_tokens(&store).await);

        // Same again with the total already cached.
        session.append_item(Item::user("c")).await.unwrap();
        store.append_item("t", Item::assistant("y".repeat(700))).await.unwrap();
        session.append_item(Item::user("d".repeat(70))).await.unwrap();
        assert_eq!(session.estimated_tokens().await.unwrap(), exact_tokens(&store).await);

        let bounded = session.items_for_model().await.unwrap();
        assert_eq!(bounded.report.tokens_before, exact_tokens(&store).await);
    }

    /// Counts calls; one token per character.
    #[derive(Default)]
    struct CountingEstimator {
        calls: AtomicUsize,
    }

    impl CountingEstimator {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenEstimator for CountingEstimator {
        fn estimate(&self, item: &Item) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            item.content.char_len()
        }
    }

    #[tokio::test]
    async fn items_for_model_estimates_only_new_items() {
        let store = Arc::new(InMemoryItemStore::new());
        let counting = Arc::new(CountingEstimator::default());
        let session = Session::new("t", store.clone(), config(10)).with_estimator(counting.clone());

        fill(&session, 3).await;
        assert_eq!(counting.calls(), 7);

        let first = session.items_for_model().await.unwrap();
        assert_eq!(counting.calls(), 7);
        assert_eq!(first.items.len(), 7);

        store.append_item("t", Item::user("external")).await.unwrap();
        let second = session.items_for_model().await.unwrap();
        assert_eq!(counting.calls(), 8);
        assert_eq!(second.report.tokens_before, first.report.tokens_before + 8);
        assert_eq!(second.report.tokens_after, second.report.tokens_before);
    }

    #[tokio::test]
    async fn compaction_threshold_is_lowered_to_max_turns() {
        let provider = Arc::new(ScriptedProvider::texts(&["early turns"]));
        let config = SessionConfig {
            summarizer: Toggle::enabled(SummarizerConfig::default().with_keep_recent_turns(2)),
            ..config(3)
        };
        assert_eq!(config.summarizer.config.compact_after_turns, 20);
        let session = Session::new("t", Arc::new(InMemoryItemStore::new()), config).with_summarizer(provider);
        fill(&session, 6).await;

        let bounded = session.items_for_model().await.unwrap();
        assert_eq!(bounded.report.compacted, Some(8));
        assert!(bounded.items[1].content.to_text().contains("early turns"));
    }

    #[tokio::test]
    async fn compaction_runs_before_trimming() {
        let provider = Arc::new(ScriptedProvider::texts(&["turns one to four"]));
        let session = Session::new("t", Arc::new(InMemoryItemStore::new()), summarizing(10, 5, 2))
            .with_summarizer(provider.clone());
        fill(&session, 6).await;

        let bounded = session.items_for_model().await.unwrap();
        assert_eq!(bounded.report.compacted, Some(8));
        assert_eq!(count_turns(&bounded.items), 2);
        assert!(bounded.items[1].content.to_text().contains("turns one to four"));
        assert_eq!(session.compactions().len(), 1);

        // Nothing new to summarize: no second call, same rendering.
        let again = session.items_for_model().await.unwrap();
        assert_eq!(again.report.compacted, None);
        assert_eq!(again.items, bounded.items);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn summarizer_failure_falls_back_to_trimming() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Api(
            "down".into(),
        ))]));
        let session = Session::new("t", Arc::new(InMemoryItemStore::new()), summarizing(3, 4, 2))
            .with_summarizer(provider);
        fill(&session, 6).await;

        let bounded = session.items_for_model().await.unwrap();
        assert_eq!(count_turns(&bounded.items), 3);
        assert!(session.compactions().is_empty());
    }

    #[tokio::test]
    async fn disabled_summarizer_is_not_installed() {
        let provider = Arc::new(ScriptedProvider::texts(&[]));
        let session =
            Session::new("t", Arc::new(InMemoryItemStore::new()), config(5)).with_summarizer(provider);
        assert!(!session.has_summarizer());
    }

    #[test]
    fn tier_parsing() {
        assert_eq!("free".parse::<PolicyTier>().unwrap(), PolicyTier::Free);
        assert_eq!("PRO".parse::<PolicyTier>().unwrap(), PolicyTier::Pro);
        assert_eq!(
            "enterprise".parse::<PolicyTier>().unwrap(),
            PolicyTier::Custom("enterprise".into())
        );
    }

    #[test]
    fn factory_maps_tiers_to_config() {
        let factory = SessionFactory::new(Arc::new(InMemoryItemStore::new()));
        let free = factory.config_for(&PolicyTier::Free);
        assert_eq!(free.budget.max_turns, Some(10));
        assert!(!free.summarizer.enabled);

        let standard = factory.config_for(&PolicyTier::Standard);
        assert!(standard.summarizer.enabled);
        assert_eq!(standard.summarizer.config.compact_after_turns, 30);

        let unknown = factory.config_for(&PolicyTier::Custom("nope".into()));
        assert_eq!(unknown.budget, standard.budget);
    }

    #[test]
    fn custom_tiers_from_json() {
        let factory = SessionFactory::new(Arc::new(InMemoryItemStore::new()))
            .with_policies_json(
                r#"{"trial": {"budget": {"max_tokens": 8000, "max_turns": 4}, "summarize": true}}"#,
            )
            .unwrap();
        let config = factory.config_for(&PolicyTier::Custom("trial".into()));
        assert_eq!(config.budget.effective_limit(), 8000);
        assert!(config.summarizer.enabled);
        assert_eq!(config.summarizer.config.compact_after_turns, 4);
        assert_eq!(config.summarizer.config.keep_recent_turns, 2);
    }

    #[tokio::test]
    async fn factory_sessions_share_the_store() {
        let store: Arc<dyn ItemStore> = Arc::new(InMemoryItemStore::new());
        let factory = SessionFactory::new(store.clone());
        let a = factory.session("thread-1", &PolicyTier::Free);
        a.append_item(Item::user("hello")).await.unwrap();

        let b = factory.session("thread-1", &PolicyTier::Pro);
        assert_eq!(b.thread_id(), "thread-1");
        assert_eq!(store.list_items("thread-1").await.unwrap().len(), 1);
        assert_eq!(b.items_for_model().await.unwrap().items.len(), 1);
    }
}
