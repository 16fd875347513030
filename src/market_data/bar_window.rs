// =============================================================================
// BarWindow -- thread-safe rolling OHLCV window per symbol
// =============================================================================
//
// Bars arrive in ascending timestamp order per symbol. Each symbol keeps at
// most `max_bars` of history; the oldest bar is trimmed when the ring is
// full. Feature computation and label generation both read from here.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A single OHLCV price bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Thread-safe ring buffer that stores the most recent bars per symbol.
///
/// Out-of-order bars (timestamp not after the last stored bar) are rejected
/// so downstream consumers can rely on ascending order.
pub struct BarWindow {
    bars: RwLock<HashMap<String, VecDeque<PriceBar>>>,
    max_bars: usize,
}

impl BarWindow {
    /// Create a window that retains at most `max_bars` bars per symbol.
    pub fn new(max_bars: usize) -> Self {
        Self {
            bars: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Append a bar for its symbol. Returns `false` (and stores nothing)
    /// when the bar does not advance the symbol's timeline.
    pub fn push(&self, bar: PriceBar) -> bool {
        let mut map = self.bars.write();
        let ring = map
            .entry(bar.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars));

        if let Some(last) = ring.back() {
            if bar.timestamp <= last.timestamp {
                return false;
            }
        }

        ring.push_back(bar);
        while ring.len() > self.max_bars {
            ring.pop_front();
        }
        true
    }

    /// Return the most recent `count` bars for a symbol (oldest-first order).
    pub fn recent(&self, symbol: &str, count: usize) -> Vec<PriceBar> {
        let map = self.bars.read();
        match map.get(symbol) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Return every stored bar for a symbol (oldest-first order).
    pub fn all(&self, symbol: &str) -> Vec<PriceBar> {
        self.recent(symbol, self.max_bars)
    }

    /// Close price of the most recent bar, if any.
    pub fn last_close(&self, symbol: &str) -> Option<f64> {
        let map = self.bars.read();
        map.get(symbol).and_then(|ring| ring.back().map(|b| b.close))
    }

    /// Most recent bar, if any.
    pub fn latest(&self, symbol: &str) -> Option<PriceBar> {
        let map = self.bars.read();
        map.get(symbol).and_then(|ring| ring.back().cloned())
    }

    /// Number of bars stored for a symbol.
    pub fn len(&self, symbol: &str) -> usize {
        let map = self.bars.read();
        map.get(symbol).map_or(0, VecDeque::len)
    }

    /// Symbols with at least one bar.
    pub fn symbols(&self) -> Vec<String> {
        let map = self.bars.read();
        map.keys().cloned().collect()
    }
}
