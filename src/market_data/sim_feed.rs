// =============================================================================
// Simulated market-data feed -- seeded random-walk bar generator
// =============================================================================
//
// The lab has no exchange connection; this feed synthesizes one-minute OHLCV
// bars per symbol from a geometric random walk and pushes them into the
// shared BarWindow, LabelGenerator, and QualityMonitor. A fixed seed makes
// an entire run reproducible.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::market_data::{BarWindow, PriceBar};

/// Per-symbol walk state.
struct WalkState {
    last_close: f64,
    /// Per-bar volatility as a fraction of price.
    step_vol: f64,
}

/// Seeded geometric random-walk generator for a universe of symbols.
pub struct SimFeed {
    rng: Mutex<ChaCha8Rng>,
    walks: Mutex<HashMap<String, WalkState>>,
    bar_interval_secs: i64,
}

impl SimFeed {
    /// Create a feed for `universe` with per-symbol starting prices drawn
    /// from `start_price` and a fixed per-bar volatility.
    pub fn new(universe: &[String], start_price: f64, step_vol: f64, seed: u64) -> Self {
        let mut walks = HashMap::new();
        for symbol in universe {
            walks.insert(
                symbol.clone(),
                WalkState {
                    last_close: start_price,
                    step_vol,
                },
            );
        }
        info!(
            symbols = universe.len(),
            seed, start_price, step_vol, "simulated feed initialised"
        );
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            walks: Mutex::new(walks),
            bar_interval_secs: 60,
        }
    }

    /// Generate the next bar for every symbol and push it into `window`.
    ///
    /// Returns the generated bars so callers can forward them to the label
    /// generator and quality monitor.
    pub fn tick(&self, window: &Arc<BarWindow>) -> Vec<PriceBar> {
        let now = Utc::now();
        let mut rng = self.rng.lock();
        let mut walks = self.walks.lock();
        let mut bars = Vec::with_capacity(walks.len());

        for (symbol, walk) in walks.iter_mut() {
            let open = walk.last_close;
            // Four intra-bar steps give a plausible high/low range.
            let mut price = open;
            let mut high = open;
            let mut low = open;
            for _ in 0..4 {
                let shock: f64 = rng.gen_range(-1.0..1.0) * walk.step_vol;
                price *= 1.0 + shock;
                high = high.max(price);
                low = low.min(price);
            }
            let close = price.max(0.01);
            let volume = rng.gen_range(500.0..50_000.0_f64).floor();
            walk.last_close = close;

            let bar = PriceBar {
                symbol: symbol.clone(),
                timestamp: now,
                open,
                high,
                low: low.max(0.01),
                close,
                volume,
            };
            if window.push(bar.clone()) {
                bars.push(bar);
            } else {
                debug!(symbol = %symbol, "sim bar rejected (non-advancing timestamp)");
            }
        }
        bars
    }

    /// Backfill `count` historical bars per symbol at one-minute spacing so
    /// indicators have enough lookback before the live loop starts.
    pub fn backfill(&self, window: &Arc<BarWindow>, count: usize) {
        let start = Utc::now() - ChronoDuration::seconds(self.bar_interval_secs * count as i64);
        let mut rng = self.rng.lock();
        let mut walks = self.walks.lock();

        for (symbol, walk) in walks.iter_mut() {
            let mut ts = start;
            for _ in 0..count {
                let open = walk.last_close;
                let shock: f64 = rng.gen_range(-1.0..1.0) * walk.step_vol * 2.0;
                let close = (open * (1.0 + shock)).max(0.01);
                let (high, low) = if close >= open {
                    (close * 1.001, open * 0.999)
                } else {
                    (open * 1.001, close * 0.999)
                };
                walk.last_close = close;
                window.push(PriceBar {
                    symbol: symbol.clone(),
                    timestamp: ts,
                    open,
                    high,
                    low: low.max(0.01),
                    close,
                    volume: rng.gen_range(500.0..50_000.0_f64).floor(),
                });
                ts += ChronoDuration::seconds(self.bar_interval_secs);
            }
        }
        info!(bars_per_symbol = count, "sim feed backfill complete");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn universe() -> Vec<String> {
        vec!["AAPL".to_string(), "MSFT".to_string()]
    }

    #[test]
    fn backfill_populates_window() {
        let feed = SimFeed::new(&universe(), 100.0, 0.001, 42);
        let window = Arc::new(BarWindow::new(200));
        feed.backfill(&window, 60);
        assert_eq!(window.len("AAPL"), 60);
        assert_eq!(window.len("MSFT"), 60);
    }

    #[test]
    fn same_seed_same_walk() {
        let w1 = Arc::new(BarWindow::new(200));
        let w2 = Arc::new(BarWindow::new(200));
        SimFeed::new(&universe(), 100.0, 0.002, 7).backfill(&w1, 30);
        SimFeed::new(&universe(), 100.0, 0.002, 7).backfill(&w2, 30);
        let c1: Vec<f64> = w1.all("AAPL").iter().map(|b| b.close).collect();
        let c2: Vec<f64> = w2.all("AAPL").iter().map(|b| b.close).collect();
        assert_eq!(c1, c2);
    }

    #[test]
    fn bars_have_sane_ohlc() {
        let feed = SimFeed::new(&universe(), 250.0, 0.001, 1);
        let window = Arc::new(BarWindow::new(200));
        feed.backfill(&window, 50);
        for bar in window.all("MSFT") {
            assert!(bar.high >= bar.open.max(bar.close) * 0.999);
            assert!(bar.low <= bar.open.min(bar.close) * 1.001);
            assert!(bar.low > 0.0);
            assert!(bar.volume >= 0.0);
        }
    }
}
