//! Engine and per-conversation configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_ai::RetryConfig;

use crate::condenser::CondensationPolicy;
use crate::error::{Error, Result};
use crate::gate::{ConfirmationGate, ConfirmationPolicy};
use crate::notifier::WebhookConfig;

/// Engine-wide configuration, read from `config.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Agent steps allowed in a single run before the conversation errors
    pub max_iterations_per_run: usize,
    /// How long a cancelled tool gets to finish before it is abandoned
    pub cancel_grace_ms: u64,
    /// Identical action/result rounds that count as stuck; `None` disables
    pub stuck_threshold: Option<usize>,
    pub retry: RetrySettings,
    pub condenser: CondensationPolicy,
    pub confirmation: ConfirmationSettings,
    pub notifier: NotifierConfig,
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations_per_run: 500,
            cancel_grace_ms: 5000,
            stuck_threshold: Some(4),
            retry: RetrySettings::default(),
            condenser: CondensationPolicy::default(),
            confirmation: ConfirmationSettings::default(),
            notifier: NotifierConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Model call retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationSettings {
    pub policy: ConfirmationPolicy,
    /// Seconds to wait for a decision before rejecting; `None` waits forever
    pub timeout_secs: Option<u64>,
}

impl ConfirmationSettings {
    pub fn gate(&self) -> ConfirmationGate {
        let gate = ConfirmationGate::new(self.policy.clone());
        match self.timeout_secs {
            Some(secs) => gate.with_timeout(Duration::from_secs(secs)),
            None => gate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Capacity of the in-process broadcast channel
    pub channel_capacity: usize,
    pub webhooks: Vec<WebhookConfig>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            webhooks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for conversation logs
    pub dir: Option<PathBuf>,
}

impl StoreConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(crate::store::JsonlStore::default_dir)
    }
}

impl EngineConfig {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("weft")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("WEFT_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load from the default location. A missing file yields defaults.
    pub fn load_default() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), config_detail(e))))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.condenser.validate()?;
        if self.max_iterations_per_run == 0 {
            return Err(Error::Config(
                "max_iterations_per_run must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.notifier.channel_capacity == 0 {
            return Err(Error::Config(
                "notifier.channel_capacity must be at least 1".into(),
            ));
        }
        for webhook in &self.notifier.webhooks {
            webhook.validate()?;
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from(&self.retry)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Merge a conversation's overrides over the engine defaults
    pub fn resolve(&self, overrides: &ConversationConfig) -> Result<ResolvedConfig> {
        let condenser = overrides
            .condenser
            .clone()
            .unwrap_or_else(|| self.condenser.clone());
        condenser.validate()?;
        let confirmation = overrides
            .confirmation
            .as_ref()
            .unwrap_or(&self.confirmation);
        Ok(ResolvedConfig {
            system_prompt: overrides.system_prompt.clone(),
            gate: confirmation.gate(),
            condenser,
            max_iterations_per_run: overrides
                .max_iterations_per_run
                .unwrap_or(self.max_iterations_per_run)
                .max(1),
        })
    }
}

fn config_detail(error: Error) -> String {
    match error {
        Error::Config(detail) => detail,
        other => other.to_string(),
    }
}

/// Per-conversation overrides, persisted with the conversation's log
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<ConfirmationSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condenser: Option<CondensationPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations_per_run: Option<usize>,
}

impl ConversationConfig {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationSettings) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn with_condenser(mut self, condenser: CondensationPolicy) -> Self {
        self.condenser = Some(condenser);
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations_per_run = Some(max);
        self
    }
}

/// Effective settings for one conversation
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub system_prompt: Option<String>,
    pub gate: ConfirmationGate,
    pub condenser: CondensationPolicy,
    pub max_iterations_per_run: usize,
}

/// Annotated config written by `weft check-config --example`
pub const EXAMPLE_CONFIG: &str = r#"# weft engine configuration
max_iterations_per_run = 500
cancel_grace_ms = 5000
stuck_threshold = 4

[retry]
max_attempts = 3
initial_delay_ms = 1000
max_delay_ms = 60000
backoff_multiplier = 2.0

[condenser]
enabled = true
max_events = 120
keep_first = 4
keep_last = 20

[confirmation]
timeout_secs = 300

[confirmation.policy]
mode = "confirm_risky"
threshold = "high"
confirm_unknown = true

[notifier]
channel_capacity = 1024

# [[notifier.webhooks]]
# url = "https://example.com/hooks/weft"
# event_buffer_size = 10
# flush_delay_ms = 1000
"#;
