// =============================================================================
// Runtime configuration -- JSON file + environment overrides, atomic save
// =============================================================================
//
// Every tunable lives here. Fields all carry serde defaults so an older
// config file keeps loading after new fields are added. Environment
// variables override file values, and persistence uses the tmp + rename
// pattern to prevent corruption on crash.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::allocator::{AllocatorConfig, BanditAlgorithm};
use crate::broker::BrokerConfig;
use crate::engine::RunParams;
use crate::guardrails::GuardrailLimits;
use crate::hub::HubConfig;
use crate::learner::{LearnerBackend, LearnerConfig, TaskType};
use crate::quality::QualityConfig;
use crate::snapshot::SnapshotConfig;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "NVDA".to_string(),
        "SPY".to_string(),
        "TSLA".to_string(),
    ]
}

fn default_theories() -> Vec<String> {
    vec![
        "mean_revert".to_string(),
        "breakout".to_string(),
        "news_shock_guard".to_string(),
        "vol_regime".to_string(),
        "intraday_momentum".to_string(),
    ]
}

fn default_max_concurrency() -> usize {
    64
}
fn default_max_trades_per_minute() -> usize {
    600
}
fn default_microtrade_notional() -> f64 {
    25.0
}
fn default_max_exposure_notional() -> f64 {
    10_000.0
}
fn default_max_open_trades() -> usize {
    1_000
}
fn default_max_trades_per_symbol() -> usize {
    50
}
fn default_bandit_algorithm() -> BanditAlgorithm {
    BanditAlgorithm::Thompson
}
fn default_decay_factor() -> f64 {
    0.995
}
fn default_min_allocation() -> f64 {
    0.05
}
fn default_ucb_c() -> f64 {
    1.0
}
fn default_epsilon() -> f64 {
    0.1
}
fn default_ws_queue_maxsize() -> usize {
    100
}
fn default_ws_enqueue_timeout_ms() -> u64 {
    50
}
fn default_ws_send_timeout_s() -> f64 {
    2.5
}
fn default_heartbeat_interval_s() -> u64 {
    25
}
fn default_quality_vwap_window_s() -> i64 {
    300
}
fn default_quality_bucket_min() -> u32 {
    15
}
fn default_quality_retention_days() -> i64 {
    30
}
fn default_learner_backend() -> LearnerBackend {
    LearnerBackend::LinearSgd
}
fn default_learn_report_path() -> PathBuf {
    PathBuf::from("data/learn_report.json")
}
fn default_drift_threshold() -> f64 {
    0.02
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/snapshot.json")
}
fn default_snapshot_interval_min() -> u64 {
    15
}
fn default_guardrails_path() -> PathBuf {
    PathBuf::from("data/guardrails.json")
}
fn default_quality_path() -> PathBuf {
    PathBuf::from("data/quality.json")
}
fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}
fn default_feed_seed() -> u64 {
    42
}
fn default_feed_start_price() -> f64 {
    100.0
}
fn default_feed_step_vol() -> f64 {
    0.0008
}
fn default_cycle_interval_secs() -> u64 {
    5
}

// =============================================================================
// LabConfig
// =============================================================================

/// Top-level configuration for the Meridian lab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    // --- Universe & theories -------------------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_theories")]
    pub theories: Vec<String>,

    // --- Engine limits -------------------------------------------------------
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_trades_per_minute")]
    pub max_trades_per_minute: usize,
    #[serde(default = "default_microtrade_notional")]
    pub microtrade_notional: f64,
    #[serde(default = "default_max_exposure_notional")]
    pub max_exposure_notional: f64,
    #[serde(default = "default_max_open_trades")]
    pub max_open_trades: usize,
    #[serde(default = "default_max_trades_per_symbol")]
    pub max_trades_per_symbol: usize,

    // --- Bandit --------------------------------------------------------------
    #[serde(default = "default_bandit_algorithm")]
    pub bandit_algorithm: BanditAlgorithm,
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    #[serde(default = "default_min_allocation")]
    pub min_allocation: f64,
    #[serde(default = "default_ucb_c")]
    pub ucb_c: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    // --- Guardrails ----------------------------------------------------------
    #[serde(default)]
    pub guardrails: GuardrailSection,

    // --- Broadcast hub -------------------------------------------------------
    #[serde(default = "default_ws_queue_maxsize")]
    pub ws_queue_maxsize: usize,
    #[serde(default = "default_ws_enqueue_timeout_ms")]
    pub ws_enqueue_timeout_ms: u64,
    #[serde(default = "default_ws_send_timeout_s")]
    pub ws_send_timeout_s: f64,
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,

    // --- Execution quality ---------------------------------------------------
    #[serde(default = "default_quality_vwap_window_s")]
    pub quality_vwap_window_s: i64,
    #[serde(default = "default_quality_bucket_min")]
    pub quality_bucket_min: u32,
    #[serde(default = "default_quality_retention_days")]
    pub quality_retention_days: i64,
    #[serde(default = "default_quality_path")]
    pub quality_data_path: PathBuf,

    // --- Learner & nightly job ----------------------------------------------
    #[serde(default = "default_learner_backend")]
    pub learner_backend: LearnerBackend,
    #[serde(default = "default_learn_report_path")]
    pub learn_report_path: PathBuf,
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,

    // --- Durability ----------------------------------------------------------
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_snapshot_interval_min")]
    pub snapshot_interval_min: u64,
    #[serde(default)]
    pub snapshot_ignore_restore_errors: bool,

    // --- Process -------------------------------------------------------------
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_feed_seed")]
    pub feed_seed: u64,
    #[serde(default = "default_feed_start_price")]
    pub feed_start_price: f64,
    #[serde(default = "default_feed_step_vol")]
    pub feed_step_vol: f64,
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
}

/// Guardrail limits subsection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailSection {
    #[serde(default = "GuardrailSection::default_max_dd_day")]
    pub max_dd_day: f64,
    #[serde(default = "GuardrailSection::default_max_dd_week")]
    pub max_dd_week: f64,
    #[serde(default = "GuardrailSection::default_max_exposure")]
    pub max_exposure: f64,
    #[serde(default = "GuardrailSection::default_max_single_trade_risk")]
    pub max_single_trade_risk: f64,
    #[serde(default = "GuardrailSection::default_max_daily_trades")]
    pub max_daily_trades: u64,
    #[serde(default = "GuardrailSection::default_max_concurrent_orders")]
    pub max_concurrent_orders: u64,
    #[serde(default = "GuardrailSection::default_min_cash_reserve")]
    pub min_cash_reserve: f64,
    #[serde(default = "GuardrailSection::default_initial_portfolio_value")]
    pub initial_portfolio_value: f64,
    #[serde(default = "default_guardrails_path")]
    pub data_path: PathBuf,
}

impl GuardrailSection {
    fn default_max_dd_day() -> f64 {
        0.03
    }
    fn default_max_dd_week() -> f64 {
        0.06
    }
    fn default_max_exposure() -> f64 {
        1.50
    }
    fn default_max_single_trade_risk() -> f64 {
        0.01
    }
    fn default_max_daily_trades() -> u64 {
        100
    }
    fn default_max_concurrent_orders() -> u64 {
        50
    }
    fn default_min_cash_reserve() -> f64 {
        0.05
    }
    fn default_initial_portfolio_value() -> f64 {
        1_000_000.0
    }
}

impl Default for GuardrailSection {
    fn default() -> Self {
        Self {
            max_dd_day: Self::default_max_dd_day(),
            max_dd_week: Self::default_max_dd_week(),
            max_exposure: Self::default_max_exposure(),
            max_single_trade_risk: Self::default_max_single_trade_risk(),
            max_daily_trades: Self::default_max_daily_trades(),
            max_concurrent_orders: Self::default_max_concurrent_orders(),
            min_cash_reserve: Self::default_min_cash_reserve(),
            initial_portfolio_value: Self::default_initial_portfolio_value(),
            data_path: default_guardrails_path(),
        }
    }
}

impl Default for LabConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl LabConfig {
    /// Load from a JSON file. The caller falls back to defaults when the
    /// file is absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read lab config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse lab config from {}", path.display()))?;
        info!(path = %path.display(), symbols = ?config.symbols, "lab config loaded");
        Ok(config)
    }

    /// Persist atomically (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise lab config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "lab config saved (atomic)");
        Ok(())
    }

    /// Apply environment-variable overrides on top of the loaded values.
    pub fn apply_env(&mut self) {
        env_csv("MERIDIAN_SYMBOLS", &mut self.symbols);
        env_parse("MAX_CONCURRENCY", &mut self.max_concurrency);
        env_parse("MAX_TRADES_PER_MINUTE", &mut self.max_trades_per_minute);
        env_parse("MICROTRADE_NOTIONAL", &mut self.microtrade_notional);
        env_parse("MAX_EXPOSURE_NOTIONAL", &mut self.max_exposure_notional);
        env_parse("MAX_OPEN_TRADES", &mut self.max_open_trades);
        env_parse("MAX_TRADES_PER_SYMBOL", &mut self.max_trades_per_symbol);

        env_parse("MAX_DD_DAY", &mut self.guardrails.max_dd_day);
        env_parse("MAX_DD_WEEK", &mut self.guardrails.max_dd_week);
        env_parse("MAX_EXPOSURE", &mut self.guardrails.max_exposure);
        env_parse(
            "MAX_SINGLE_TRADE_RISK",
            &mut self.guardrails.max_single_trade_risk,
        );
        env_parse("MIN_CASH_RESERVE", &mut self.guardrails.min_cash_reserve);

        if let Ok(raw) = std::env::var("BANDIT_ALGORITHM") {
            match raw.trim().to_lowercase().as_str() {
                "thompson" => self.bandit_algorithm = BanditAlgorithm::Thompson,
                "ucb1" => self.bandit_algorithm = BanditAlgorithm::Ucb1,
                "epsilon_greedy" => self.bandit_algorithm = BanditAlgorithm::EpsilonGreedy,
                other => warn!(value = other, "unknown BANDIT_ALGORITHM; keeping configured"),
            }
        }
        env_parse("DECAY_FACTOR", &mut self.decay_factor);
        env_parse("MIN_ALLOCATION", &mut self.min_allocation);
        env_parse("UCB_C", &mut self.ucb_c);
        env_parse("EPSILON", &mut self.epsilon);

        env_parse("WS_QUEUE_MAXSIZE", &mut self.ws_queue_maxsize);
        env_parse("WS_ENQUEUE_TIMEOUT_MS", &mut self.ws_enqueue_timeout_ms);
        env_parse("WS_SEND_TIMEOUT_S", &mut self.ws_send_timeout_s);
        env_parse("HEARTBEAT_INTERVAL_S", &mut self.heartbeat_interval_s);

        env_parse("QUALITY_VWAP_WINDOW_S", &mut self.quality_vwap_window_s);
        env_parse("QUALITY_BUCKET_MIN", &mut self.quality_bucket_min);
        env_parse("QUALITY_RETENTION_DAYS", &mut self.quality_retention_days);

        env_path("LEARN_REPORT_PATH", &mut self.learn_report_path);
        env_parse("DRIFT_THRESHOLD", &mut self.drift_threshold);
        env_path("SNAPSHOT_PATH", &mut self.snapshot_path);
        env_parse("SNAPSHOT_INTERVAL_MIN", &mut self.snapshot_interval_min);

        if let Ok(raw) = std::env::var("MERIDIAN_BIND_ADDR") {
            self.bind_addr = raw;
        }
    }

    // -------------------------------------------------------------------------
    // Component config views
    // -------------------------------------------------------------------------

    pub fn run_params(&self) -> RunParams {
        RunParams {
            universe: self.symbols.clone(),
            theories: self.theories.clone(),
            max_concurrency: self.max_concurrency,
            max_trades_per_minute: self.max_trades_per_minute,
            microtrade_notional: self.microtrade_notional,
            max_exposure_notional: self.max_exposure_notional,
            max_open_trades: self.max_open_trades,
            max_trades_per_symbol: self.max_trades_per_symbol,
            ..RunParams::default()
        }
    }

    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            algorithm: self.bandit_algorithm,
            decay_factor: self.decay_factor,
            min_allocation: self.min_allocation,
            ucb_c: self.ucb_c,
            epsilon: self.epsilon,
            rng_seed: self.feed_seed,
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_cap: self.ws_queue_maxsize,
            enqueue_timeout_ms: self.ws_enqueue_timeout_ms,
            send_timeout_ms: (self.ws_send_timeout_s * 1_000.0) as u64,
            heartbeat_interval_secs: self.heartbeat_interval_s,
            ..HubConfig::default()
        }
    }

    pub fn guardrail_limits(&self) -> GuardrailLimits {
        GuardrailLimits {
            max_dd_day: self.guardrails.max_dd_day,
            max_dd_week: self.guardrails.max_dd_week,
            max_exposure: self.guardrails.max_exposure,
            max_single_trade_risk: self.guardrails.max_single_trade_risk,
            max_daily_trades: self.guardrails.max_daily_trades,
            max_concurrent_orders: self.guardrails.max_concurrent_orders,
            min_cash_reserve: self.guardrails.min_cash_reserve,
            initial_portfolio_value: self.guardrails.initial_portfolio_value,
            data_path: Some(self.guardrails.data_path.clone()),
            ..GuardrailLimits::default()
        }
    }

    pub fn quality_config(&self) -> QualityConfig {
        QualityConfig {
            vwap_window_secs: self.quality_vwap_window_s,
            bucket_mins: self.quality_bucket_min,
            retention_days: self.quality_retention_days,
            data_path: Some(self.quality_data_path.clone()),
            ..QualityConfig::default()
        }
    }

    pub fn learner_config(&self) -> LearnerConfig {
        LearnerConfig {
            backend: self.learner_backend,
            task_type: TaskType::Classification,
            ..LearnerConfig::default()
        }
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            path: self.snapshot_path.clone(),
            interval_mins: self.snapshot_interval_min,
            ignore_restore_errors: self.snapshot_ignore_restore_errors,
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            rng_seed: self.feed_seed,
            ..BrokerConfig::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "unparseable env override ignored"),
        }
    }
}

fn env_path(key: &str, target: &mut PathBuf) {
    if let Ok(raw) = std::env::var(key) {
        *target = PathBuf::from(raw);
    }
}

fn env_csv(key: &str, target: &mut Vec<String>) {
    if let Ok(raw) = std::env::var(key) {
        let parsed: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !parsed.is_empty() {
            *target = parsed;
        }
    }
}
