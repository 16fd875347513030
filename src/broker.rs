// =============================================================================
// Paper broker -- simulated execution, cost model, and position book
// =============================================================================
//
// The broker owns the position book and the order store; everything else
// observes through query operations. Market orders fill immediately at a
// synthetic reference price adjusted by slippage and fees; limit orders are
// accepted or rejected against the reference price with a configured fill
// probability. Any rejection leaves the book untouched.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::market_data::BarWindow;
use crate::types::{OrderType, Side};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// An order submitted to the paper broker. `client_order_id` is the
/// originating signal id; at most one order may carry a given id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub client_order_id: Uuid,
}

/// The result of a successful execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: Uuid,
    pub client_order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub avg_price: f64,
    pub fees: f64,
    pub slippage_bps: f64,
    pub timestamp: DateTime<Utc>,
}

/// A signed position. `qty == 0` is equivalent to no position and is
/// removed from the book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: i64,
    pub avg_price: f64,
}

/// Why the broker refused an order. The book is never mutated on rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerError {
    InvalidSymbol,
    InvalidQty(i64),
    OrderIdCollision(Uuid),
    LimitNotMarketable { reference: f64, limit: f64 },
    LimitUnfilled,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSymbol => write!(f, "invalid symbol"),
            Self::InvalidQty(q) => write!(f, "invalid qty {q} (must be > 0)"),
            Self::OrderIdCollision(id) => write!(f, "order id {id} already used"),
            Self::LimitNotMarketable { reference, limit } => {
                write!(f, "limit {limit} not marketable vs reference {reference}")
            }
            Self::LimitUnfilled => write!(f, "limit order did not fill"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Aggregate PnL view computed from the book and fill history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub net_pnl: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_fees: f64,
    pub num_positions: usize,
    pub total_fills: u64,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Cost-model and simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Commission in basis points of notional.
    pub fee_bps: f64,
    /// Per-fill commission floor.
    pub min_fee: f64,
    /// Probability that a marketable limit order fills.
    pub limit_fill_probability: f64,
    /// Fixed slippage override; set for deterministic tests. When absent,
    /// slippage is drawn from a bounded range scaled by the estimated
    /// bid-ask spread of the last bar.
    pub constant_slippage_bps: Option<f64>,
    /// Reference price when no bar exists, by asset class.
    pub default_index_price: f64,
    pub default_stock_price: f64,
    pub rng_seed: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            fee_bps: 1.0,
            min_fee: 0.01,
            limit_fill_probability: 0.9,
            constant_slippage_bps: None,
            default_index_price: 4_000.0,
            default_stock_price: 100.0,
            rng_seed: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

struct Inner {
    positions: HashMap<String, Position>,
    /// client_order_id -> order_id, for collision detection.
    seen_orders: HashMap<Uuid, Uuid>,
    realized_pnl: f64,
    total_fees: f64,
    total_fills: u64,
    rng: ChaCha8Rng,
}

/// Simulated broker. All state mutations are serialized behind one lock so
/// a fill and its position update are atomic.
pub struct PaperBroker {
    inner: Mutex<Inner>,
    window: Arc<BarWindow>,
    config: BrokerConfig,
}

impl PaperBroker {
    pub fn new(window: Arc<BarWindow>, config: BrokerConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.rng_seed);
        Self {
            inner: Mutex::new(Inner {
                positions: HashMap::new(),
                seen_orders: HashMap::new(),
                realized_pnl: 0.0,
                total_fees: 0.0,
                total_fills: 0,
                rng,
            }),
            window,
            config,
        }
    }

    /// Submit an order for immediate simulated execution.
    pub fn submit(&self, order: &Order) -> Result<Fill, BrokerError> {
        if order.symbol.trim().is_empty() {
            return Err(BrokerError::InvalidSymbol);
        }
        if order.qty <= 0 {
            return Err(BrokerError::InvalidQty(order.qty));
        }

        let reference = self.reference_price(&order.symbol);
        let mut inner = self.inner.lock();

        if inner.seen_orders.contains_key(&order.client_order_id) {
            return Err(BrokerError::OrderIdCollision(order.client_order_id));
        }

        // Limit admission happens before any state change.
        if order.order_type == OrderType::Limit {
            let limit = order.limit_price.unwrap_or(reference);
            let marketable = match order.side {
                Side::Buy => limit >= reference,
                Side::Sell => limit <= reference,
            };
            if !marketable {
                return Err(BrokerError::LimitNotMarketable { reference, limit });
            }
            let roll: f64 = inner.rng.gen();
            if roll > self.config.limit_fill_probability {
                return Err(BrokerError::LimitUnfilled);
            }
        }

        let slippage_bps = match self.config.constant_slippage_bps {
            Some(bps) => bps,
            None => {
                // Scale the draw by the estimated spread of the last bar.
                let spread_bps = self.estimated_spread_bps(&order.symbol);
                inner.rng.gen_range(0.0..=spread_bps.max(0.1))
            }
        };

        // Slippage always moves the fill against the trader.
        let fill_price = reference * (1.0 + order.side.sign() * slippage_bps / 10_000.0);
        let notional = fill_price * order.qty as f64;
        let fees = (notional.abs() * self.config.fee_bps / 10_000.0).max(self.config.min_fee);

        // Atomic with the position update below.
        let order_id = Uuid::new_v4();
        inner.seen_orders.insert(order.client_order_id, order_id);
        let realized = apply_fill(
            &mut inner.positions,
            &order.symbol,
            order.side,
            order.qty,
            fill_price,
        );
        inner.realized_pnl += realized;
        inner.total_fees += fees;
        inner.total_fills += 1;

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            qty = order.qty,
            fill_price,
            slippage_bps,
            fees,
            "order filled"
        );

        Ok(Fill {
            order_id,
            client_order_id: order.client_order_id,
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            avg_price: fill_price,
            fees,
            slippage_bps,
            timestamp: Utc::now(),
        })
    }

    /// Read-only snapshot of the position book (non-zero positions only).
    pub fn positions(&self) -> HashMap<String, Position> {
        self.inner.lock().positions.clone()
    }

    /// Aggregate PnL computed against current reference prices.
    pub fn performance_summary(&self) -> PerformanceSummary {
        let inner = self.inner.lock();
        let mut unrealized = 0.0;
        for pos in inner.positions.values() {
            let reference = self.reference_price(&pos.symbol);
            unrealized += (reference - pos.avg_price) * pos.qty as f64;
        }
        PerformanceSummary {
            net_pnl: inner.realized_pnl + unrealized - inner.total_fees,
            realized_pnl: inner.realized_pnl,
            unrealized_pnl: unrealized,
            total_fees: inner.total_fees,
            num_positions: inner.positions.len(),
            total_fills: inner.total_fills,
        }
    }

    /// Restore positions from a snapshot (boot-time only).
    pub fn restore_positions(&self, positions: Vec<Position>) {
        let mut inner = self.inner.lock();
        inner.positions.clear();
        for pos in positions {
            if pos.qty != 0 {
                inner.positions.insert(pos.symbol.clone(), pos);
            }
        }
    }

    /// Reference price: last close when a bar exists, else a per-asset-class
    /// default (caret-prefixed symbols are treated as indices).
    pub fn reference_price(&self, symbol: &str) -> f64 {
        if let Some(close) = self.window.last_close(symbol) {
            return close;
        }
        if symbol.starts_with('^') {
            self.config.default_index_price
        } else {
            self.config.default_stock_price
        }
    }

    fn estimated_spread_bps(&self, symbol: &str) -> f64 {
        match self.window.latest(symbol) {
            Some(bar) if bar.close > 0.0 => {
                let range_frac = (bar.high - bar.low) / bar.close;
                // Half the bar range in bps is the worst-case slip budget.
                (range_frac * 10_000.0 * 0.5).min(50.0)
            }
            _ => 5.0,
        }
    }
}

/// Apply a fill to the book and return the PnL realized by any closing
/// portion. Crossing through zero re-opens the remainder at the fill price.
fn apply_fill(
    positions: &mut HashMap<String, Position>,
    symbol: &str,
    side: Side,
    qty: i64,
    price: f64,
) -> f64 {
    let signed_qty = match side {
        Side::Buy => qty,
        Side::Sell => -qty,
    };

    let pos = match positions.entry(symbol.to_string()) {
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(Position {
                symbol: symbol.to_string(),
                qty: signed_qty,
                avg_price: price,
            });
            return 0.0;
        }
        std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
    };

    let mut realized = 0.0;
    if pos.qty.signum() == signed_qty.signum() {
        // Same direction: weighted average entry.
        let total = pos.qty + signed_qty;
        pos.avg_price = (pos.avg_price * pos.qty.abs() as f64
            + price * signed_qty.abs() as f64)
            / total.abs() as f64;
        pos.qty = total;
    } else {
        // Opposing direction: close up to the open quantity.
        let closing = pos.qty.abs().min(signed_qty.abs());
        let direction = pos.qty.signum() as f64;
        realized = (price - pos.avg_price) * closing as f64 * direction;

        let remaining = pos.qty + signed_qty;
        if remaining == 0 {
            positions.remove(symbol);
        } else if remaining.signum() == pos.qty.signum() {
            pos.qty = remaining;
        } else {
            // Flipped through zero: the excess opens at the fill price.
            pos.qty = remaining;
            pos.avg_price = price;
        }
    }

    if realized != 0.0 {
        debug!(symbol, realized, "closing fill realized pnl");
    }
    if positions.get(symbol).map_or(false, |p| p.qty == 0) {
        warn!(symbol, "zero-qty position left in book; removing");
        positions.remove(symbol);
    }
    realized
}
