// =============================================================================
// Bandit allocator -- routes flow across theories by realized performance
// =============================================================================
//
// One arm per theory. Cumulative counters are never decayed so long-run
// diagnostics stay intact; the "recent" counterparts are attenuated by
// decay_factor on every allocation call, which is what adapts the policy to
// concept drift.
//
// Weight law: every returned weight is >= min_allocation and the weights
// sum to 1. The floor is applied by reserving k * min_allocation up front
// and distributing the remainder proportionally to the per-arm scores, so
// renormalization can never push a weight back under the floor.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanditAlgorithm {
    Thompson,
    Ucb1,
    EpsilonGreedy,
}

impl Default for BanditAlgorithm {
    fn default() -> Self {
        Self::Thompson
    }
}

impl std::fmt::Display for BanditAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Thompson => write!(f, "thompson"),
            Self::Ucb1 => write!(f, "ucb1"),
            Self::EpsilonGreedy => write!(f, "epsilon_greedy"),
        }
    }
}

/// Bandit-side state for one theory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TheoryArm {
    pub theory_id: String,

    // Thompson (Beta posterior); cumulative, never decayed.
    pub alpha: f64,
    pub beta: f64,

    // UCB accumulators; cumulative, never decayed.
    pub total_reward: f64,
    pub num_selections: u64,

    // Performance tracking.
    pub total_trades: u64,
    pub winning_trades: u64,
    pub total_pnl_bps: f64,
    pub total_fees_bps: f64,

    // Decayed counterparts used by the policies.
    pub recent_alpha: f64,
    pub recent_beta: f64,
    pub recent_reward: f64,
    pub recent_selections: f64,

    pub last_update: Option<DateTime<Utc>>,
    pub last_allocation: f64,
}

impl TheoryArm {
    fn new(theory_id: &str) -> Self {
        Self {
            theory_id: theory_id.to_string(),
            alpha: 1.0,
            beta: 1.0,
            total_reward: 0.0,
            num_selections: 0,
            total_trades: 0,
            winning_trades: 0,
            total_pnl_bps: 0.0,
            total_fees_bps: 0.0,
            recent_alpha: 1.0,
            recent_beta: 1.0,
            recent_reward: 0.0,
            recent_selections: 0.0,
            last_update: None,
            last_allocation: 0.0,
        }
    }
}

/// Result of one allocation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResult {
    /// theory_id -> weight; each >= min_allocation, sum == 1 (or empty).
    pub allocations: HashMap<String, f64>,
    pub selected_theory: String,
    pub confidence: f64,
    pub algorithm_state: serde_json::Value,
}

/// Per-theory performance view for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmSummary {
    pub total_trades: u64,
    pub win_rate: f64,
    pub avg_pnl_bps: f64,
    pub total_pnl_bps: f64,
    pub total_fees_bps: f64,
    pub last_allocation: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub alpha: f64,
    pub beta: f64,
    pub ucb_reward: f64,
    pub ucb_selections: u64,
}

/// Serializable allocator state for snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorState {
    pub algorithm: BanditAlgorithm,
    pub arms: HashMap<String, TheoryArm>,
    pub total_selections: u64,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    pub algorithm: BanditAlgorithm,
    pub decay_factor: f64,
    pub min_allocation: f64,
    pub ucb_c: f64,
    pub epsilon: f64,
    pub rng_seed: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            algorithm: BanditAlgorithm::Thompson,
            decay_factor: 0.995,
            min_allocation: 0.05,
            ucb_c: 1.0,
            epsilon: 0.1,
            rng_seed: 42,
        }
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Softmax temperature for UCB1 weight conversion.
const UCB_SOFTMAX_TEMPERATURE: f64 = 2.0;
/// Reserved selection name when no theories are available.
const NONE_SELECTED: &str = "none";

struct Inner {
    arms: HashMap<String, TheoryArm>,
    total_selections: u64,
    rng: ChaCha8Rng,
    /// Soft priors from the nightly learning job; multiply Thompson samples.
    feature_weight_bias: HashMap<String, f64>,
}

/// Multi-armed bandit over theory arms. Operations never fail.
pub struct BanditAllocator {
    inner: Mutex<Inner>,
    config: AllocatorConfig,
}

impl BanditAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        info!(
            algorithm = %config.algorithm,
            decay_factor = config.decay_factor,
            min_allocation = config.min_allocation,
            "bandit allocator initialised"
        );
        let rng = ChaCha8Rng::seed_from_u64(config.rng_seed);
        Self {
            inner: Mutex::new(Inner {
                arms: HashMap::new(),
                total_selections: 0,
                rng,
                feature_weight_bias: HashMap::new(),
            }),
            config,
        }
    }

    pub fn algorithm(&self) -> BanditAlgorithm {
        self.config.algorithm
    }

    /// Create an arm for `theory_id`. Idempotent.
    pub fn add_theory(&self, theory_id: &str) {
        let mut inner = self.inner.lock();
        if !inner.arms.contains_key(theory_id) {
            inner
                .arms
                .insert(theory_id.to_string(), TheoryArm::new(theory_id));
            info!(theory_id, "bandit arm created");
        }
    }

    /// Allocate weights across `available_theories` and select one.
    pub fn allocate(&self, available_theories: &[String]) -> AllocationResult {
        let mut inner = self.inner.lock();

        if available_theories.is_empty() {
            return AllocationResult {
                allocations: HashMap::new(),
                selected_theory: NONE_SELECTED.to_string(),
                confidence: 0.0,
                algorithm_state: json!({}),
            };
        }

        for theory_id in available_theories {
            if !inner.arms.contains_key(theory_id) {
                inner
                    .arms
                    .insert(theory_id.clone(), TheoryArm::new(theory_id));
            }
        }

        // Concept drift: attenuate every arm's recent counters.
        let decay = self.config.decay_factor;
        for arm in inner.arms.values_mut() {
            arm.recent_alpha = (arm.recent_alpha * decay).max(1.0);
            arm.recent_beta = (arm.recent_beta * decay).max(1.0);
            arm.recent_reward *= decay;
            arm.recent_selections *= decay;
        }

        let result = match self.config.algorithm {
            BanditAlgorithm::Thompson => self.thompson(&mut inner, available_theories),
            BanditAlgorithm::Ucb1 => self.ucb1(&mut inner, available_theories),
            BanditAlgorithm::EpsilonGreedy => self.epsilon_greedy(&mut inner, available_theories),
        };

        for (theory_id, weight) in &result.allocations {
            if let Some(arm) = inner.arms.get_mut(theory_id) {
                arm.last_allocation = *weight;
            }
        }
        inner.total_selections += 1;

        result
    }

    /// Fold a labeled trade outcome into the theory's arm.
    pub fn update_performance(
        &self,
        theory_id: &str,
        pnl_bps: f64,
        fees_bps: f64,
        was_winner: bool,
        timestamp: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock();
        let arm = inner
            .arms
            .entry(theory_id.to_string())
            .or_insert_with(|| TheoryArm::new(theory_id));

        let net_pnl_bps = pnl_bps - fees_bps;

        arm.total_trades += 1;
        arm.total_pnl_bps += net_pnl_bps;
        arm.total_fees_bps += fees_bps;
        arm.last_update = Some(timestamp);
        if was_winner {
            arm.winning_trades += 1;
        }

        // Thompson posterior counts positive net PnL as a success. The UCB
        // accumulators are maintained regardless of the active policy so a
        // runtime algorithm switch starts from real history.
        if net_pnl_bps > 0.0 {
            arm.alpha += 1.0;
            arm.recent_alpha += 1.0;
        } else {
            arm.beta += 1.0;
            arm.recent_beta += 1.0;
        }

        let reward = ((net_pnl_bps + 100.0) / 200.0).clamp(0.0, 1.0);
        arm.total_reward += reward;
        arm.recent_reward += reward;
        arm.num_selections += 1;
        arm.recent_selections += 1.0;

        debug!(
            theory_id,
            net_pnl_bps,
            was_winner,
            total_trades = arm.total_trades,
            "arm performance updated"
        );
    }

    /// Consume the nightly job's suggested feature-family weights as soft
    /// priors. Unknown theories are ignored; the bias multiplies Thompson
    /// samples on subsequent allocations.
    pub fn apply_weight_suggestions(&self, suggestions: &HashMap<String, f64>) {
        let mut inner = self.inner.lock();
        inner.feature_weight_bias = suggestions.clone();
        info!(families = suggestions.len(), "weight suggestions applied");
    }

    pub fn get_performance_summary(&self) -> HashMap<String, ArmSummary> {
        let inner = self.inner.lock();
        inner
            .arms
            .iter()
            .map(|(id, arm)| {
                let win_rate = if arm.total_trades > 0 {
                    arm.winning_trades as f64 / arm.total_trades as f64
                } else {
                    0.0
                };
                let avg_pnl_bps = if arm.total_trades > 0 {
                    arm.total_pnl_bps / arm.total_trades as f64
                } else {
                    0.0
                };
                (
                    id.clone(),
                    ArmSummary {
                        total_trades: arm.total_trades,
                        win_rate,
                        avg_pnl_bps,
                        total_pnl_bps: arm.total_pnl_bps,
                        total_fees_bps: arm.total_fees_bps,
                        last_allocation: arm.last_allocation,
                        last_update: arm.last_update,
                        alpha: arm.alpha,
                        beta: arm.beta,
                        ucb_reward: arm.total_reward,
                        ucb_selections: arm.num_selections,
                    },
                )
            })
            .collect()
    }

    /// Reset a theory's arm to the uninformed prior. Returns false for
    /// unknown ids.
    pub fn reset_theory(&self, theory_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.arms.get_mut(theory_id) {
            Some(arm) => {
                *arm = TheoryArm::new(theory_id);
                info!(theory_id, "arm reset");
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------

    pub fn get_state(&self) -> AllocatorState {
        let inner = self.inner.lock();
        AllocatorState {
            algorithm: self.config.algorithm,
            arms: inner.arms.clone(),
            total_selections: inner.total_selections,
        }
    }

    pub fn set_state(&self, state: AllocatorState) {
        let mut inner = self.inner.lock();
        inner.arms = state.arms;
        inner.total_selections = state.total_selections;
        info!(arms = inner.arms.len(), "allocator state restored");
    }

    // -------------------------------------------------------------------------
    // Policies
    // -------------------------------------------------------------------------

    fn thompson(&self, inner: &mut Inner, theories: &[String]) -> AllocationResult {
        let mut samples: Vec<(String, f64)> = Vec::with_capacity(theories.len());
        for theory_id in theories {
            let (a, b) = {
                let arm = &inner.arms[theory_id];
                (arm.recent_alpha, arm.recent_beta)
            };
            // Soft priors arrive keyed by feature family; fall back from an
            // exact theory match to the theory's family.
            let bias = inner
                .feature_weight_bias
                .get(theory_id.as_str())
                .or_else(|| {
                    inner
                        .feature_weight_bias
                        .get(crate::learn_report::feature_family(theory_id))
                })
                .copied()
                .map(|w| 0.5 + w)
                .unwrap_or(1.0);
            // Beta(a, b) with a, b >= 1 is always well-formed here.
            let sample = match Beta::new(a, b) {
                Ok(dist) => dist.sample(&mut inner.rng) * bias,
                Err(_) => inner.rng.gen::<f64>(),
            };
            samples.push((theory_id.clone(), sample));
        }

        let (selected, confidence) = argmax(&samples);
        let total: f64 = samples.iter().map(|(_, s)| s).sum();
        let base: Vec<(String, f64)> = samples
            .iter()
            .map(|(id, s)| {
                let b = if total > 0.0 {
                    s / total
                } else {
                    1.0 / theories.len() as f64
                };
                (id.clone(), b)
            })
            .collect();

        AllocationResult {
            allocations: self.floor_and_distribute(&base),
            selected_theory: selected,
            confidence,
            algorithm_state: json!({
                "samples": samples.iter().cloned().collect::<HashMap<String, f64>>(),
                "beta_parameters": theories
                    .iter()
                    .map(|id| {
                        let arm = &inner.arms[id];
                        (id.clone(), json!({ "alpha": arm.recent_alpha, "beta": arm.recent_beta }))
                    })
                    .collect::<HashMap<String, serde_json::Value>>(),
            }),
        }
    }

    fn ucb1(&self, inner: &mut Inner, theories: &[String]) -> AllocationResult {
        let ln_total = (inner.total_selections.max(1) as f64).ln();
        let mut scores: Vec<(String, f64)> = Vec::with_capacity(theories.len());

        for theory_id in theories {
            let arm = &inner.arms[theory_id];
            let score = if arm.recent_selections < 1.0 {
                f64::INFINITY
            } else {
                let avg_reward = arm.recent_reward / arm.recent_selections;
                avg_reward + self.config.ucb_c * (2.0 * ln_total / arm.recent_selections).sqrt()
            };
            scores.push((theory_id.clone(), score));
        }

        let (selected, confidence) = argmax(&scores);

        // A single infinity is clamped to a finite large weight before the
        // softmax: unexplored arms get 1.0, explored arms 0.1.
        let has_inf = scores.iter().any(|(_, s)| s.is_infinite());
        let exp_values: Vec<(String, f64)> = if has_inf {
            scores
                .iter()
                .map(|(id, s)| (id.clone(), if s.is_infinite() { 1.0 } else { 0.1 }))
                .collect()
        } else {
            let max_score = scores
                .iter()
                .map(|(_, s)| *s)
                .fold(f64::NEG_INFINITY, f64::max);
            scores
                .iter()
                .map(|(id, s)| {
                    (id.clone(), ((s - max_score) / UCB_SOFTMAX_TEMPERATURE).exp())
                })
                .collect()
        };

        let total: f64 = exp_values.iter().map(|(_, v)| v).sum();
        let base: Vec<(String, f64)> = exp_values
            .iter()
            .map(|(id, v)| (id.clone(), v / total))
            .collect();

        AllocationResult {
            allocations: self.floor_and_distribute(&base),
            selected_theory: selected,
            confidence,
            algorithm_state: json!({
                "ucb_values": scores
                    .iter()
                    .map(|(id, s)| (id.clone(), if s.is_infinite() { json!("inf") } else { json!(s) }))
                    .collect::<HashMap<String, serde_json::Value>>(),
            }),
        }
    }

    fn epsilon_greedy(&self, inner: &mut Inner, theories: &[String]) -> AllocationResult {
        let avg_rewards: Vec<(String, f64)> = theories
            .iter()
            .map(|id| {
                let arm = &inner.arms[id];
                let avg = if arm.recent_selections >= 1.0 {
                    arm.recent_reward / arm.recent_selections
                } else {
                    0.0
                };
                (id.clone(), avg)
            })
            .collect();

        let explore = inner.rng.gen::<f64>() < self.config.epsilon;
        let selected = if explore {
            let idx = inner.rng.gen_range(0..theories.len());
            theories[idx].clone()
        } else {
            argmax(&avg_rewards).0
        };
        let confidence = avg_rewards
            .iter()
            .find(|(id, _)| *id == selected)
            .map(|(_, r)| *r)
            .unwrap_or(0.0);

        let k = theories.len();
        let floor = self.effective_floor(k);
        let main_allocation = 1.0 - (k as f64 - 1.0) * floor;
        let allocations: HashMap<String, f64> = theories
            .iter()
            .map(|id| {
                let w = if *id == selected { main_allocation } else { floor };
                (id.clone(), w)
            })
            .collect();

        AllocationResult {
            allocations,
            selected_theory: selected,
            confidence,
            algorithm_state: json!({
                "avg_rewards": avg_rewards.iter().cloned().collect::<HashMap<String, f64>>(),
                "epsilon": self.config.epsilon,
                "was_exploration": explore,
            }),
        }
    }

    /// Reserve `k * floor` of the mass, then hand out the remainder in
    /// proportion to the base weights. Keeps every weight >= floor with the
    /// total exactly 1.
    fn floor_and_distribute(&self, base: &[(String, f64)]) -> HashMap<String, f64> {
        let k = base.len();
        let floor = self.effective_floor(k);
        let remainder = 1.0 - floor * k as f64;
        let total: f64 = base.iter().map(|(_, b)| b).sum();

        base.iter()
            .map(|(id, b)| {
                let share = if total > 0.0 { b / total } else { 1.0 / k as f64 };
                (id.clone(), floor + remainder * share)
            })
            .collect()
    }

    /// min_allocation, shrunk to a uniform split when there are too many
    /// theories for the configured floor to be feasible.
    fn effective_floor(&self, k: usize) -> f64 {
        if k == 0 {
            return 0.0;
        }
        self.config.min_allocation.min(1.0 / k as f64)
    }
}

/// First-wins argmax over (id, score) pairs.
fn argmax(scores: &[(String, f64)]) -> (String, f64) {
    let mut best = &scores[0];
    for candidate in &scores[1..] {
        if candidate.1 > best.1 {
            best = candidate;
        }
    }
    best.clone()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(algorithm: BanditAlgorithm) -> BanditAllocator {
        BanditAllocator::new(AllocatorConfig {
            algorithm,
            rng_seed: 42,
            ..AllocatorConfig::default()
        })
    }

    fn theories(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn assert_weight_law(result: &AllocationResult, k: usize, min_allocation: f64) {
        assert_eq!(result.allocations.len(), k);
        let sum: f64 = result.allocations.values().sum();
        assert!((sum - 1.0).abs() < 1e-9, "weights sum to {sum}");
        for (id, w) in &result.allocations {
            assert!(
                *w >= min_allocation - 1e-12,
                "weight for {id} is {w}, below floor {min_allocation}"
            );
        }
    }

    #[test]
    fn empty_theory_list_returns_none_selection() {
        let alloc = allocator(BanditAlgorithm::Thompson);
        let result = alloc.allocate(&[]);
        assert!(result.allocations.is_empty());
        assert_eq!(result.selected_theory, "none");
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn add_theory_is_idempotent() {
        let alloc = allocator(BanditAlgorithm::Thompson);
        alloc.add_theory("a");
        alloc.update_performance("a", 50.0, 1.0, true, Utc::now());
        alloc.add_theory("a");
        let state = alloc.get_state();
        // Re-adding must not reset the arm.
        assert_eq!(state.arms["a"].total_trades, 1);
    }

    #[test]
    fn thompson_weight_law_holds() {
        let alloc = allocator(BanditAlgorithm::Thompson);
        let ids = theories(&["a", "b", "c"]);
        for _ in 0..50 {
            let result = alloc.allocate(&ids);
            assert_weight_law(&result, 3, 0.05);
        }
    }

    #[test]
    fn thompson_prefers_the_winning_arm() {
        // Seed 42, arm A with 10 wins / 0 losses, arm B with 0 / 10. While
        // the decayed posteriors stay informative, A dominates; over a long
        // horizon the decay deliberately re-opens exploration, so the
        // plurality requirement loosens with distance.
        let alloc = allocator(BanditAlgorithm::Thompson);
        let ids = theories(&["a", "b"]);
        for _ in 0..10 {
            alloc.update_performance("a", 50.0, 0.0, true, Utc::now());
            alloc.update_performance("b", -50.0, 0.0, false, Utc::now());
        }

        let mut a_early = 0;
        let mut a_total = 0;
        for i in 0..1000 {
            let result = alloc.allocate(&ids);
            assert_weight_law(&result, 2, 0.05);
            if result.selected_theory == "a" {
                a_total += 1;
                if i < 200 {
                    a_early += 1;
                }
            }
        }
        assert!(a_early >= 185, "arm a selected only {a_early}/200 early");
        assert!(a_total >= 600, "arm a selected only {a_total}/1000 overall");
    }

    #[test]
    fn identity_loss_update_increments_recent_beta_by_one() {
        let alloc = allocator(BanditAlgorithm::Thompson);
        alloc.add_theory("a");
        let before = alloc.get_state().arms["a"].clone();

        alloc.update_performance("a", 0.0, 0.0, false, Utc::now());

        let after = alloc.get_state().arms["a"].clone();
        assert_eq!(after.recent_alpha, before.recent_alpha);
        assert!((after.recent_beta - before.recent_beta - 1.0).abs() < 1e-12);
    }

    #[test]
    fn update_maps_reward_into_unit_interval() {
        let alloc = allocator(BanditAlgorithm::Ucb1);
        alloc.update_performance("a", 500.0, 0.0, true, Utc::now());
        alloc.update_performance("b", -500.0, 0.0, false, Utc::now());
        let state = alloc.get_state();
        // +500 bps clamps to reward 1.0; -500 to 0.0.
        assert!((state.arms["a"].total_reward - 1.0).abs() < 1e-12);
        assert!(state.arms["b"].total_reward.abs() < 1e-12);
    }

    #[test]
    fn ucb1_selects_unexplored_arm_first() {
        let alloc = allocator(BanditAlgorithm::Ucb1);
        let ids = theories(&["explored", "fresh"]);
        alloc.add_theory("explored");
        for _ in 0..5 {
            alloc.update_performance("explored", 80.0, 0.0, true, Utc::now());
        }

        let result = alloc.allocate(&ids);
        assert_eq!(result.selected_theory, "fresh");
        assert_weight_law(&result, 2, 0.05);
        // The unexplored arm's infinite score must dominate the weights.
        assert!(result.allocations["fresh"] > result.allocations["explored"]);
    }

    #[test]
    fn ucb1_converges_to_better_arm() {
        let alloc = allocator(BanditAlgorithm::Ucb1);
        let ids = theories(&["good", "bad"]);
        for _ in 0..20 {
            alloc.update_performance("good", 60.0, 0.0, true, Utc::now());
            alloc.update_performance("bad", -60.0, 0.0, false, Utc::now());
            alloc.allocate(&ids);
        }
        let result = alloc.allocate(&ids);
        assert_eq!(result.selected_theory, "good");
        assert_weight_law(&result, 2, 0.05);
    }

    #[test]
    fn epsilon_greedy_weight_shape() {
        let alloc = allocator(BanditAlgorithm::EpsilonGreedy);
        let ids = theories(&["a", "b", "c"]);
        alloc.update_performance("b", 90.0, 0.0, true, Utc::now());

        let result = alloc.allocate(&ids);
        assert_weight_law(&result, 3, 0.05);
        // Selected theory takes the bulk: 1 - 2 * 0.05.
        let selected_weight = result.allocations[&result.selected_theory];
        assert!((selected_weight - 0.90).abs() < 1e-9);
    }

    #[test]
    fn floor_shrinks_when_theories_exceed_budget() {
        // 30 theories at min_allocation 0.05 would need 1.5 of mass; the
        // floor degrades to a uniform split instead.
        let alloc = allocator(BanditAlgorithm::Thompson);
        let ids: Vec<String> = (0..30).map(|i| format!("t{i}")).collect();
        let result = alloc.allocate(&ids);
        let sum: f64 = result.allocations.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        for w in result.allocations.values() {
            assert!(*w > 0.0);
        }
    }

    #[test]
    fn decay_attenuates_recent_counters_only() {
        let alloc = allocator(BanditAlgorithm::Thompson);
        let ids = theories(&["a"]);
        for _ in 0..5 {
            alloc.update_performance("a", 50.0, 0.0, true, Utc::now());
        }
        let before = alloc.get_state().arms["a"].clone();
        for _ in 0..100 {
            alloc.allocate(&ids);
        }
        let after = alloc.get_state().arms["a"].clone();

        assert!(after.recent_alpha < before.recent_alpha);
        assert!(after.recent_alpha >= 1.0);
        // Cumulative counters are never decayed.
        assert_eq!(after.alpha, before.alpha);
        assert_eq!(after.total_trades, before.total_trades);
    }

    #[test]
    fn reset_theory_restores_prior() {
        let alloc = allocator(BanditAlgorithm::Thompson);
        alloc.update_performance("a", 50.0, 2.0, true, Utc::now());
        assert!(alloc.reset_theory("a"));
        let arm = &alloc.get_state().arms["a"];
        assert_eq!(arm.alpha, 1.0);
        assert_eq!(arm.beta, 1.0);
        assert_eq!(arm.total_trades, 0);
        assert!(!alloc.reset_theory("unknown"));
    }

    #[test]
    fn state_roundtrip_preserves_arms() {
        let alloc = allocator(BanditAlgorithm::Thompson);
        let ids = theories(&["a", "b"]);
        for _ in 0..7 {
            alloc.update_performance("a", 25.0, 1.0, true, Utc::now());
            alloc.allocate(&ids);
        }
        let state = alloc.get_state();
        let json = serde_json::to_string(&state).unwrap();
        let restored: AllocatorState = serde_json::from_str(&json).unwrap();

        let fresh = allocator(BanditAlgorithm::Thompson);
        fresh.set_state(restored);
        let round = fresh.get_state();

        assert_eq!(round.total_selections, state.total_selections);
        assert_eq!(round.arms["a"].total_trades, state.arms["a"].total_trades);
        assert_eq!(round.arms["a"].alpha, state.arms["a"].alpha);
        assert_eq!(
            round.arms["a"].recent_beta,
            state.arms["a"].recent_beta
        );
    }

    #[test]
    fn performance_summary_computes_rates() {
        let alloc = allocator(BanditAlgorithm::Thompson);
        alloc.update_performance("a", 100.0, 10.0, true, Utc::now());
        alloc.update_performance("a", -50.0, 10.0, false, Utc::now());

        let summary = alloc.get_performance_summary();
        let a = &summary["a"];
        assert_eq!(a.total_trades, 2);
        assert!((a.win_rate - 0.5).abs() < 1e-12);
        // Net pnl: (100-10) + (-50-10) = 30 over 2 trades.
        assert!((a.avg_pnl_bps - 15.0).abs() < 1e-12);
    }
}
