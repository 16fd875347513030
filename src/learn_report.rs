// =============================================================================
// Nightly learning job -- calibration report over labeled trade events
// =============================================================================
//
// Aggregates (p_up, label) pairs from the event log into an overall Brier
// score, per-feature-family Brier scores (each event assigned to its
// dominant family), a reliability diagram with empty bins omitted, drift
// flags against the previous report, and suggested feature weights that
// the allocator consumes as soft priors.
//
// The report is one JSON document written atomically; the previous report
// is loaded at the start for the drift comparison.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::guardrails::atomic_write_json;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One labeled prediction outcome, as recorded by the worker when a trade's
/// label matures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledEvent {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub theory_id: String,
    /// Predicted probability of an up outcome.
    pub p_up: Option<f64>,
    /// Realized binary label: 1 = up, 0 = not up.
    pub label: Option<u8>,
    /// (feature name, weight) pairs from the learner's explanation.
    pub explain: Vec<(String, f64)>,
}

/// Bounded in-memory log of labeled events. Survives across runs within
/// the process lifetime.
pub struct EventLog {
    events: Mutex<Vec<LabeledEvent>>,
    cap: usize,
}

impl EventLog {
    pub fn new(cap: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            cap,
        }
    }

    pub fn append(&self, event: LabeledEvent) {
        let mut events = self.events.lock();
        events.push(event);
        if events.len() > self.cap {
            let excess = events.len() - self.cap;
            events.drain(..excess);
        }
    }

    pub fn snapshot(&self) -> Vec<LabeledEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Mean squared error between predicted probabilities and binary labels.
/// Empty input returns the worst possible score.
pub fn brier_score(y_prob: &[f64], y_true: &[u8]) -> f64 {
    if y_prob.is_empty() || y_prob.len() != y_true.len() {
        return 1.0;
    }
    y_prob
        .iter()
        .zip(y_true)
        .map(|(p, y)| {
            let diff = p - *y as f64;
            diff * diff
        })
        .sum::<f64>()
        / y_prob.len() as f64
}

/// Reliability diagram over `n_bins` equal-width probability bins. Empty
/// bins are omitted from every parallel vector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReliabilityDiagram {
    pub bin_centers: Vec<f64>,
    pub mean_predicted: Vec<f64>,
    pub mean_observed: Vec<f64>,
    pub counts: Vec<u64>,
}

pub fn reliability_diagram(y_prob: &[f64], y_true: &[u8], n_bins: usize) -> ReliabilityDiagram {
    let mut diagram = ReliabilityDiagram::default();
    if y_prob.is_empty() || n_bins == 0 || y_prob.len() != y_true.len() {
        return diagram;
    }

    let mut sums = vec![(0.0_f64, 0.0_f64, 0u64); n_bins];
    for (p, y) in y_prob.iter().zip(y_true) {
        let clamped = p.clamp(0.0, 1.0);
        let bin = ((clamped * n_bins as f64) as usize).min(n_bins - 1);
        sums[bin].0 += clamped;
        sums[bin].1 += *y as f64;
        sums[bin].2 += 1;
    }

    let width = 1.0 / n_bins as f64;
    for (i, (p_sum, y_sum, count)) in sums.into_iter().enumerate() {
        if count == 0 {
            continue;
        }
        diagram.bin_centers.push(width * (i as f64 + 0.5));
        diagram.mean_predicted.push(p_sum / count as f64);
        diagram.mean_observed.push(y_sum / count as f64);
        diagram.counts.push(count);
    }
    diagram
}

/// Feature families used for per-family attribution.
const FAMILY_PATTERNS: &[(&str, &[&str])] = &[
    (
        "momentum",
        &["momentum", "rsi", "macd", "sma", "ema", "trend", "breakout", "atr", "roc"],
    ),
    (
        "sentiment",
        &["sentiment", "vix", "put_call", "news", "fear", "urgency"],
    ),
    ("breadth", &["breadth", "advance", "decline", "highs", "lows"]),
    (
        "macro",
        &["macro", "cpi", "gdp", "rates", "yield", "fed", "unemployment"],
    ),
    (
        "microstructure",
        &["spread", "imbalance", "flow", "volume", "bid", "ask", "depth"],
    ),
];

/// Map a feature name to its family; unmatched names land in "other".
pub fn feature_family(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    for (family, patterns) in FAMILY_PATTERNS {
        if patterns.iter().any(|p| lower.contains(p)) {
            return family;
        }
    }
    "other"
}

/// Per-family Brier scores. Each event is assigned to its dominant family
/// (largest summed absolute weight in its explanation); events without an
/// explanation fall into "unknown". Events missing p_up or label are
/// skipped. Ties resolve to the lexicographically first family.
pub fn compute_brier_by_family(events: &[LabeledEvent]) -> HashMap<String, f64> {
    let mut per_family: HashMap<String, (Vec<f64>, Vec<u8>)> = HashMap::new();

    for event in events {
        let (Some(p_up), Some(label)) = (event.p_up, event.label) else {
            continue;
        };
        let family = dominant_family(&event.explain);
        let entry = per_family.entry(family).or_default();
        entry.0.push(p_up);
        entry.1.push(label);
    }

    per_family
        .into_iter()
        .map(|(family, (probs, labels))| (family, brier_score(&probs, &labels)))
        .collect()
}

fn dominant_family(explain: &[(String, f64)]) -> String {
    if explain.is_empty() {
        return "unknown".to_string();
    }
    let mut sums: HashMap<&'static str, f64> = HashMap::new();
    for (name, weight) in explain {
        *sums.entry(feature_family(name)).or_insert(0.0) += weight.abs();
    }
    let mut best: Option<(&str, f64)> = None;
    let mut families: Vec<(&str, f64)> = sums.into_iter().collect();
    families.sort_by(|a, b| a.0.cmp(b.0));
    for (family, sum) in families {
        match best {
            Some((_, best_sum)) if sum <= best_sum => {}
            _ => best = Some((family, sum)),
        }
    }
    best.map(|(f, _)| f.to_string()).unwrap_or_else(|| "unknown".to_string())
}

/// Flag each family in `current` whose Brier rose more than `threshold`
/// over the previous report. Families with no previous score are never
/// flagged.
pub fn compute_drift_flags(
    current: &HashMap<String, f64>,
    previous: &HashMap<String, f64>,
    threshold: f64,
) -> HashMap<String, bool> {
    current
        .iter()
        .map(|(family, score)| {
            let drifted = previous
                .get(family)
                .map(|prev| score - prev > threshold)
                .unwrap_or(false);
            (family.clone(), drifted)
        })
        .collect()
}

/// Suggested weights inversely proportional to per-family Brier,
/// normalized to sum to 1.
pub fn suggest_feature_weights(family_scores: &HashMap<String, f64>) -> HashMap<String, f64> {
    if family_scores.is_empty() {
        return HashMap::new();
    }
    let inverses: HashMap<String, f64> = family_scores
        .iter()
        .map(|(family, score)| (family.clone(), 1.0 / (score + 1e-6)))
        .collect();
    let total: f64 = inverses.values().sum();
    inverses
        .into_iter()
        .map(|(family, inv)| (family, inv / total))
        .collect()
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnReport {
    pub saved_at: String,
    pub version: u32,
    pub event_count: usize,
    pub overall_brier: f64,
    pub family_brier: HashMap<String, f64>,
    pub reliability: ReliabilityDiagram,
    pub drift_flags: HashMap<String, bool>,
    pub suggested_weights: HashMap<String, f64>,
}

/// The nightly job: compare against the previous report, emit a new one.
pub struct NightlyLearnJob {
    pub report_path: PathBuf,
    pub drift_threshold: f64,
    pub n_bins: usize,
}

impl NightlyLearnJob {
    pub fn new(report_path: PathBuf, drift_threshold: f64) -> Self {
        Self {
            report_path,
            drift_threshold,
            n_bins: 10,
        }
    }

    /// Load the most recent report, or `None` when absent or unreadable.
    pub fn load_previous(&self) -> Option<LearnReport> {
        let content = std::fs::read_to_string(&self.report_path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Run the job over `events` and write the report atomically.
    pub fn run(&self, events: &[LabeledEvent]) -> Result<LearnReport> {
        let previous = self.load_previous();
        let previous_family = previous
            .as_ref()
            .map(|r| r.family_brier.clone())
            .unwrap_or_default();

        let labeled: Vec<(f64, u8)> = events
            .iter()
            .filter_map(|e| Some((e.p_up?, e.label?)))
            .collect();
        let probs: Vec<f64> = labeled.iter().map(|(p, _)| *p).collect();
        let labels: Vec<u8> = labeled.iter().map(|(_, y)| *y).collect();

        let family_brier = compute_brier_by_family(events);
        let drift_flags =
            compute_drift_flags(&family_brier, &previous_family, self.drift_threshold);
        let suggested_weights = suggest_feature_weights(&family_brier);

        let report = LearnReport {
            saved_at: Utc::now().to_rfc3339(),
            version: 1,
            event_count: events.len(),
            overall_brier: brier_score(&probs, &labels),
            family_brier,
            reliability: reliability_diagram(&probs, &labels, self.n_bins),
            drift_flags,
            suggested_weights,
        };

        atomic_write_json(&self.report_path, &report)
            .context("writing nightly learn report")?;

        info!(
            events = report.event_count,
            overall_brier = report.overall_brier,
            drifted = report.drift_flags.values().filter(|v| **v).count(),
            "nightly learning report written"
        );
        Ok(report)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn event(p_up: f64, label: u8, explain: &[(&str, f64)]) -> LabeledEvent {
        LabeledEvent {
            ts: Utc::now(),
            symbol: "AAPL".to_string(),
            theory_id: "mean_revert".to_string(),
            p_up: Some(p_up),
            label: Some(label),
            explain: explain
                .iter()
                .map(|(n, w)| (n.to_string(), *w))
                .collect(),
        }
    }

    // ---- brier_score -----------------------------------------------------

    #[test]
    fn brier_perfect_is_zero() {
        assert!(brier_score(&[1.0, 1.0, 0.0, 0.0], &[1, 1, 0, 0]).abs() < 1e-9);
    }

    #[test]
    fn brier_worst_is_one() {
        assert!((brier_score(&[0.0, 0.0, 1.0, 1.0], &[1, 1, 0, 0]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn brier_random_is_quarter() {
        assert!((brier_score(&[0.5; 4], &[1, 0, 1, 0]) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn brier_mixed_quality() {
        let expected = (0.04 + 0.16 + 0.09 + 0.01) / 4.0;
        let score = brier_score(&[0.8, 0.6, 0.3, 0.1], &[1, 1, 0, 0]);
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn brier_empty_is_worst() {
        assert_eq!(brier_score(&[], &[]), 1.0);
    }

    // ---- reliability_diagram ---------------------------------------------

    #[test]
    fn reliability_diagram_omits_empty_bins() {
        let diagram = reliability_diagram(
            &[0.1, 0.3, 0.5, 0.7, 0.9],
            &[0, 0, 1, 1, 1],
            5,
        );
        assert_eq!(diagram.bin_centers.len(), 5);
        assert_eq!(diagram.counts.iter().sum::<u64>(), 5);

        // All mass in one bin => one entry.
        let single = reliability_diagram(
            &[0.48, 0.49, 0.50, 0.51, 0.52],
            &[0, 1, 0, 1, 1],
            10,
        );
        assert_eq!(single.bin_centers.len(), 1);
        assert_eq!(single.counts, vec![5]);
        assert!((single.bin_centers[0] - 0.55).abs() < 1e-9);
    }

    #[test]
    fn reliability_diagram_empty_input() {
        let diagram = reliability_diagram(&[], &[], 10);
        assert!(diagram.bin_centers.is_empty());
        assert!(diagram.counts.is_empty());
    }

    #[test]
    fn reliability_diagram_top_edge_lands_in_last_bin() {
        let diagram = reliability_diagram(&[1.0], &[1], 10);
        assert_eq!(diagram.counts, vec![1]);
        assert!((diagram.bin_centers[0] - 0.95).abs() < 1e-9);
    }

    // ---- feature families --------------------------------------------------

    #[test]
    fn family_mapping() {
        assert_eq!(feature_family("rsi"), "momentum");
        assert_eq!(feature_family("sma_20"), "momentum");
        assert_eq!(feature_family("vix_level"), "sentiment");
        assert_eq!(feature_family("put_call"), "sentiment");
        assert_eq!(feature_family("advance_decline"), "breadth");
        assert_eq!(feature_family("cpi_yoy"), "macro");
        assert_eq!(feature_family("order_flow_imbalance"), "microstructure");
        assert_eq!(feature_family("mystery_feature_xyz"), "other");
    }

    #[test]
    fn brier_by_family_assigns_dominant_family() {
        let events = vec![
            event(0.8, 1, &[("rsi", 0.3), ("momentum", 0.2)]),
            event(0.3, 0, &[("vix", 0.4), ("put_call", 0.2)]),
            event(0.7, 1, &[("breadth", 0.5), ("advance", 0.3)]),
        ];
        let scores = compute_brier_by_family(&events);
        assert!(scores.contains_key("momentum"));
        assert!(scores.contains_key("sentiment"));
        assert!(scores.contains_key("breadth"));
        for score in scores.values() {
            assert!((0.0..=1.0).contains(score));
        }
    }

    #[test]
    fn brier_by_family_missing_explain_is_unknown() {
        let mut no_explain = event(0.6, 1, &[]);
        no_explain.explain.clear();
        let scores = compute_brier_by_family(&[no_explain]);
        assert!(scores.contains_key("unknown"));
    }

    #[test]
    fn brier_by_family_skips_unlabeled_events() {
        let mut missing_label = event(0.6, 1, &[("rsi", 0.3)]);
        missing_label.label = None;
        let mut missing_prob = event(0.6, 1, &[("vix", 0.3)]);
        missing_prob.p_up = None;
        let scores = compute_brier_by_family(&[missing_label, missing_prob]);
        assert!(scores.is_empty());
    }

    // ---- drift flags -------------------------------------------------------

    #[test]
    fn drift_flags_threshold_boundary() {
        let mut previous = HashMap::new();
        previous.insert("momentum".to_string(), 0.22);
        previous.insert("sentiment".to_string(), 0.26);
        let mut current = HashMap::new();
        current.insert("momentum".to_string(), 0.25);
        current.insert("sentiment".to_string(), 0.27);

        let flags = compute_drift_flags(&current, &previous, 0.02);
        assert_eq!(flags["momentum"], true);
        assert_eq!(flags["sentiment"], false);
    }

    #[test]
    fn drift_flags_new_family_not_flagged() {
        let previous = HashMap::new();
        let mut current = HashMap::new();
        current.insert("macro".to_string(), 0.40);
        let flags = compute_drift_flags(&current, &previous, 0.02);
        assert_eq!(flags["macro"], false);
    }

    // ---- suggested weights -------------------------------------------------

    #[test]
    fn suggested_weights_inverse_to_brier() {
        let mut scores = HashMap::new();
        scores.insert("good".to_string(), 0.10);
        scores.insert("bad".to_string(), 0.40);

        let weights = suggest_feature_weights(&scores);
        assert!((weights.values().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(weights["good"] > weights["bad"]);
        // 1/0.1 vs 1/0.4 => ratio ~4.
        assert!((weights["good"] / weights["bad"] - 4.0).abs() < 0.01);
    }

    // ---- full job ----------------------------------------------------------

    #[test]
    fn job_writes_report_and_detects_drift_on_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learn_report.json");
        let job = NightlyLearnJob::new(path.clone(), 0.02);

        // First run: well-calibrated momentum events.
        let good = vec![
            event(0.9, 1, &[("rsi", 0.5)]),
            event(0.1, 0, &[("rsi", 0.5)]),
        ];
        let first = job.run(&good).unwrap();
        assert!(path.exists());
        assert!(first.drift_flags.values().all(|v| !v));
        assert!(first.overall_brier < 0.05);

        // Second run: momentum calibration degrades past the threshold.
        let bad = vec![
            event(0.5, 1, &[("rsi", 0.5)]),
            event(0.5, 0, &[("rsi", 0.5)]),
        ];
        let second = job.run(&bad).unwrap();
        assert_eq!(second.drift_flags["momentum"], true);

        // The report on disk is the second run.
        let loaded = job.load_previous().unwrap();
        assert_eq!(loaded.event_count, 2);
        assert!((loaded.overall_brier - second.overall_brier).abs() < 1e-12);
    }

    #[test]
    fn event_log_is_bounded() {
        let log = EventLog::new(5);
        for i in 0..12 {
            log.append(event(0.5, (i % 2) as u8, &[("rsi", 0.1)]));
        }
        assert_eq!(log.len(), 5);
    }
}
