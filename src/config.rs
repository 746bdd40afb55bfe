// =============================================================================
// Engine Configuration — account groups, funded rules, paper accounts
// =============================================================================
//
// Central declarative configuration for the routing engine. The account-group
// table is the router's source of truth: each inbound alert names a group key
// and the group names the backend and live account to execute against.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::AssetClass;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_initial_balance() -> f64 {
    100_000.0
}

fn default_set_size() -> usize {
    20
}

fn default_min_win_rate() -> f64 {
    0.55
}

fn default_evaluation_window() -> usize {
    20
}

fn default_consecutive_failures() -> u32 {
    3
}

fn default_consecutive_successes() -> u32 {
    2
}

fn default_rate_limit_per_minute() -> u32 {
    50
}

fn default_rate_limit_burst() -> u32 {
    10
}

fn default_router_queue_capacity() -> usize {
    1024
}

fn default_dispatch_budget_ms() -> u64 {
    5_000
}

fn default_dedupe_window_hours() -> i64 {
    24
}

fn default_stream_rotate_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_stream_retain_files() -> usize {
    8
}

fn default_bus_buffer() -> usize {
    256
}

fn default_paper_accounts() -> Vec<PaperAccountConfig> {
    vec![PaperAccountConfig {
        id: "sim-001".to_string(),
        broker_tag: "simulator".to_string(),
        mode: PaperMode::Simulator,
        initial_balance: default_initial_balance(),
    }]
}

fn default_account_groups() -> Vec<AccountGroupConfig> {
    vec![AccountGroupConfig {
        key: "paper_simulator".to_string(),
        backend: "simulator".to_string(),
        live_account_id: Some("sim-001".to_string()),
        risk_profile: None,
    }]
}

// =============================================================================
// Funded-account rules
// =============================================================================

/// A daily clock window during which trading is allowed, "HH:MM" inclusive
/// start, exclusive end, UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedWindow {
    pub start: String,
    pub end: String,
}

/// A configured news-blackout event window (absolute timestamps). Orders are
/// refused within +/- 2 minutes of the window edges when blackout is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsWindow {
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
}

/// Rule set enforced for funded accounts (and any group that opts in).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FundedRules {
    /// Maximum allowed daily loss in account currency (positive number).
    #[serde(default)]
    pub max_daily_loss: f64,

    /// Maximum distance below peak equity before violation (positive number).
    #[serde(default)]
    pub trailing_drawdown: f64,

    /// Profit target for the evaluation (informational, not enforced).
    #[serde(default)]
    pub profit_target: f64,

    /// Hard cap on contracts per order. 0 = no cap.
    #[serde(default)]
    pub max_contracts: f64,

    /// Cap on simultaneously open positions. 0 = no cap.
    #[serde(default)]
    pub max_concurrent_positions: u32,

    /// Allowed trading windows. Empty = trade any time.
    #[serde(default)]
    pub allowed_hours: Vec<AllowedWindow>,

    /// Symbols this account must not trade.
    #[serde(default)]
    pub restricted_symbols: Vec<String>,

    /// When true, orders are refused near configured news windows.
    #[serde(default)]
    pub news_blackout: bool,

    /// News event windows consulted when `news_blackout` is enabled.
    #[serde(default)]
    pub news_windows: Vec<NewsWindow>,
}

// =============================================================================
// Account groups
// =============================================================================

/// One row of the declarative routing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountGroupConfig {
    /// Routing key named by inbound alerts (e.g. "paper_simulator",
    /// "topstep", "main").
    pub key: String,

    /// Backend feed name: "simulator" or a live/sandbox feed tag
    /// ("tradovate", "tastytrade", "schwab", "topstepx").
    pub backend: String,

    /// Account identifier at the backend.
    #[serde(default)]
    pub live_account_id: Option<String>,

    /// Funded-account rules enforced for this group, if any.
    #[serde(default)]
    pub risk_profile: Option<FundedRules>,
}

impl AccountGroupConfig {
    /// Groups whose key starts with `paper_` always route to paper backends.
    pub fn is_paper_prefix(&self) -> bool {
        self.key.starts_with("paper_")
    }

    /// The account id orders for this group execute against.
    pub fn account_id(&self) -> &str {
        self.live_account_id.as_deref().unwrap_or(&self.key)
    }
}

// =============================================================================
// Paper accounts
// =============================================================================

/// Execution mode of a paper account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperMode {
    Sandbox,
    Simulator,
    Hybrid,
}

impl Default for PaperMode {
    fn default() -> Self {
        Self::Simulator
    }
}

/// Declarative paper-account definition. Accounts are created from this list
/// at startup and destroyed only when removed from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperAccountConfig {
    pub id: String,

    /// Broker whose cost model the simulator mimics ("simulator" for the
    /// generic model).
    #[serde(default)]
    pub broker_tag: String,

    #[serde(default)]
    pub mode: PaperMode,

    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
}

// =============================================================================
// Strategy tracking defaults
// =============================================================================

/// Defaults applied when a strategy is auto-registered from its first alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefaults {
    /// Trades per set.
    #[serde(default = "default_set_size")]
    pub set_size: usize,

    /// Trailing win rate below which a live strategy demotes to paper.
    #[serde(default = "default_min_win_rate")]
    pub min_win_rate: f64,

    /// Trailing trade count examined for the win-rate check.
    #[serde(default = "default_evaluation_window")]
    pub evaluation_window: usize,

    /// Losing sets in a row before a live strategy suspends.
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failure_threshold: u32,

    /// Passing sets in a row before a paper strategy becomes live-eligible.
    #[serde(default = "default_consecutive_successes")]
    pub consecutive_success_threshold: u32,
}

impl Default for StrategyDefaults {
    fn default() -> Self {
        Self {
            set_size: default_set_size(),
            min_win_rate: default_min_win_rate(),
            evaluation_window: default_evaluation_window(),
            consecutive_failure_threshold: default_consecutive_failures(),
            consecutive_success_threshold: default_consecutive_successes(),
        }
    }
}

// =============================================================================
// Ingress / routing / persistence tuning
// =============================================================================

/// Webhook ingress tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Sustained requests per minute per source IP.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Burst allowance above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Capacity of the bounded router inbound channel.
    #[serde(default = "default_router_queue_capacity")]
    pub router_queue_capacity: usize,

    /// Per-alert external-call budget in milliseconds.
    #[serde(default = "default_dispatch_budget_ms")]
    pub dispatch_budget_ms: u64,

    /// Idempotency window for duplicate alert suppression.
    #[serde(default = "default_dedupe_window_hours")]
    pub dedupe_window_hours: i64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_burst: default_rate_limit_burst(),
            router_queue_capacity: default_router_queue_capacity(),
            dispatch_budget_ms: default_dispatch_budget_ms(),
            dedupe_window_hours: default_dedupe_window_hours(),
        }
    }
}

/// Persistence tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Stream file rotation threshold in bytes.
    #[serde(default = "default_stream_rotate_bytes")]
    pub rotate_bytes: u64,

    /// Rotated files retained per stream.
    #[serde(default = "default_stream_retain_files")]
    pub retain_files: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            rotate_bytes: default_stream_rotate_bytes(),
            retain_files: default_stream_retain_files(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Declarative routing table.
    #[serde(default = "default_account_groups")]
    pub account_groups: Vec<AccountGroupConfig>,

    /// Paper accounts created at startup.
    #[serde(default = "default_paper_accounts")]
    pub paper_accounts: Vec<PaperAccountConfig>,

    /// Defaults for auto-registered strategies.
    #[serde(default)]
    pub strategy_defaults: StrategyDefaults,

    /// Webhook ingress tuning.
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Stream persistence tuning.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Per-topic event bus buffer size.
    #[serde(default = "default_bus_buffer")]
    pub bus_buffer: usize,

    /// Asset class assumed for symbols without an explicit override.
    #[serde(default)]
    pub default_asset_class: AssetClass,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_groups: default_account_groups(),
            paper_accounts: default_paper_accounts(),
            strategy_defaults: StrategyDefaults::default(),
            ingress: IngressConfig::default(),
            persistence: PersistenceConfig::default(),
            bus_buffer: default_bus_buffer(),
            default_asset_class: AssetClass::Futures,
        }
    }
}

impl EngineConfig {
    /// Look up an account group by routing key.
    pub fn group(&self, key: &str) -> Option<&AccountGroupConfig> {
        self.account_groups.iter().find(|g| g.key == key)
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            groups = config.account_groups.len(),
            paper_accounts = config.paper_accounts.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
