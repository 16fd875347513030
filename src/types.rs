// =============================================================================
// Shared types used across the Meridian paper-trading lab
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::features::FeatureSet;

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// +1.0 for BUY, -1.0 for SELL. Used by exposure and PnL accounting.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Supported order types at the paper broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Lifecycle of a paper-trading run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Initializing,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A trading signal produced by exactly one theory for one symbol.
///
/// The feature snapshot records what the theory saw at decision time, so
/// outcome labels can later be joined back to the inputs that caused them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: Uuid,
    pub theory_id: String,
    pub symbol: String,
    pub side: Side,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub horizon_mins: i64,
    pub features: FeatureSet,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        theory_id: &str,
        symbol: &str,
        side: Side,
        confidence: f64,
        horizon_mins: i64,
        features: FeatureSet,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4(),
            theory_id: theory_id.to_string(),
            symbol: symbol.to_string(),
            side,
            confidence: confidence.clamp(0.0, 1.0),
            horizon_mins,
            features,
            timestamp: Utc::now(),
        }
    }
}

/// A signal enriched with computed notional and integer share quantity,
/// ready for execution.
#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub signal: Signal,
    pub notional: f64,
    pub qty: i64,
    pub order_type: OrderType,
}

/// Generic result envelope for control-plane operations.
///
/// Components never raise across boundaries; callers get `ok` plus a
/// machine-readable status and a human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub ok: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OpResult {
    pub fn ok(status: impl Into<String>) -> Self {
        Self {
            ok: true,
            status: status.into(),
            reason: None,
        }
    }

    pub fn rejected(status: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: status.into(),
            reason: Some(reason.into()),
        }
    }
}
