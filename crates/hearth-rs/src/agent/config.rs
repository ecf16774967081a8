//! Configuration types for the [`TurnRunner`](super::turn::TurnRunner).
//!
//! ```ignore
//! let config = TurnConfig::new()
//!     .with_model("anthropic/claude-sonnet-4")
//!     .with_max_rounds(8)
//!     .with_temperature(0.3);
//! ```

use crate::api::GenerateConfig;

// ── Generic toggle ────────────────────────────────────────────────

/// Generic enabled/disabled wrapper for optional module configurations.
///
/// When `enabled` is `false`, the module is skipped regardless of the inner
/// config values.
#[derive(Debug, Clone)]
pub struct Toggle<T: Default> {
    pub enabled: bool,
    pub config: T,
}

impl<T: Default> Toggle<T> {
    pub fn enabled(config: T) -> Self {
        Self {
            enabled: true,
            config,
        }
    }

    /// A disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }

    /// The inner config when enabled.
    pub fn active(&self) -> Option<&T> {
        self.enabled.then_some(&self.config)
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self::enabled(T::default())
    }
}

// ── Turn config ───────────────────────────────────────────────────

/// Default cap on model calls per turn.
pub const DEFAULT_MAX_ROUNDS: u32 = 10;

/// Settings for one user turn.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Model calls allowed before the turn fails with a round-limit error.
    pub max_rounds: u32,
    /// Passed to every `generate` call. Tool definitions are filled in from
    /// the runner's tool set.
    pub generate: GenerateConfig,
    /// Retry once with the newest user message force-truncated when pinned
    /// items alone exceed the budget.
    pub force_truncate_on_overflow: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            generate: GenerateConfig::default(),
            force_truncate_on_overflow: false,
        }
    }
}

impl TurnConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.generate = self.generate.with_model(model);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.generate = self.generate.with_max_tokens(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.generate = self.generate.with_temperature(temperature);
        self
    }

    pub fn with_force_truncate(mut self, enabled: bool) -> Self {
        self.force_truncate_on_overflow = enabled;
        self
    }
}
