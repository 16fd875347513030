// =============================================================================
// Online learner -- incremental models over labeled trade outcomes
// =============================================================================
//
// Backend is an enumerated construction-time choice -- there is no runtime
// probing or silent degradation; the selection is logged once.
//
//   LinearSgd -- logistic / linear SGD with a decaying learning rate.
//   NeuralNet -- one hidden-layer feed-forward net trained by SGD.
//   Fallback  -- logistic / linear SGD with a constant learning rate and
//                no regularization.
//
// All backends share the same running mean/variance scaler (Welford's
// online update); the scaler is part of the durable model state.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Classification,
    Regression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearnerBackend {
    LinearSgd,
    NeuralNet,
    Fallback,
}

impl std::fmt::Display for LearnerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LinearSgd => write!(f, "linear_sgd"),
            Self::NeuralNet => write!(f, "neural_net"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Result of a prediction call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predictions: Vec<f64>,
    /// (p_class0, p_class1) per row; classification only.
    pub probabilities: Option<Vec<(f64, f64)>>,
    pub confidence: Option<Vec<f64>>,
}

/// Coefficient-based explanation for one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub feature_importance: Vec<f64>,
    pub contributions: Vec<f64>,
}

// ---------------------------------------------------------------------------
// Running scaler (Welford)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunningScaler {
    pub n: u64,
    pub mean: Vec<f64>,
    pub m2: Vec<f64>,
}

impl RunningScaler {
    fn ensure_dim(&mut self, dim: usize) {
        if self.mean.len() < dim {
            self.mean.resize(dim, 0.0);
            self.m2.resize(dim, 0.0);
        }
    }

    fn update(&mut self, row: &[f64]) {
        self.ensure_dim(row.len());
        self.n += 1;
        let n = self.n as f64;
        for (i, &x) in row.iter().enumerate() {
            let delta = x - self.mean[i];
            self.mean[i] += delta / n;
            let delta2 = x - self.mean[i];
            self.m2[i] += delta * delta2;
        }
    }

    fn std(&self, i: usize) -> f64 {
        if self.n < 2 {
            return 1.0;
        }
        (self.m2[i] / self.n as f64).sqrt()
    }

    fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(i, &x)| {
                if i < self.mean.len() {
                    (x - self.mean[i]) / (self.std(i) + 1e-8)
                } else {
                    x
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Model parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ModelParams {
    Linear {
        weights: Vec<f64>,
        bias: f64,
    },
    Neural {
        w1: Vec<Vec<f64>>,
        b1: Vec<f64>,
        w2: Vec<f64>,
        b2: f64,
    },
}

/// Durable learner state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerState {
    pub task_type: TaskType,
    pub backend: LearnerBackend,
    pub is_fitted: bool,
    pub samples_seen: u64,
    scaler: RunningScaler,
    params: Option<ModelParams>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    pub task_type: TaskType,
    pub backend: LearnerBackend,
    /// Replay ring capacity, in batches.
    pub buffer_size: usize,
    pub hidden_dim: usize,
    pub rng_seed: u64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            task_type: TaskType::Classification,
            backend: LearnerBackend::LinearSgd,
            buffer_size: 1_000,
            hidden_dim: 32,
            rng_seed: 7,
        }
    }
}

// ---------------------------------------------------------------------------
// Learner
// ---------------------------------------------------------------------------

const FALLBACK_LEARNING_RATE: f64 = 0.01;
const SGD_ETA0: f64 = 0.01;
const NEURAL_LEARNING_RATE: f64 = 0.005;

#[derive(Debug, Clone)]
struct TrainingBatch {
    features: Vec<Vec<f64>>,
    labels: Vec<f64>,
}

/// Incremental learner. Not internally synchronized; wrap in a lock when
/// shared across tasks.
pub struct OnlineLearner {
    config: LearnerConfig,
    scaler: RunningScaler,
    params: Option<ModelParams>,
    is_fitted: bool,
    samples_seen: u64,
    replay: VecDeque<TrainingBatch>,
}

impl OnlineLearner {
    pub fn new(config: LearnerConfig) -> Self {
        info!(
            backend = %config.backend,
            task_type = ?config.task_type,
            "online learner initialised"
        );
        Self {
            scaler: RunningScaler::default(),
            params: None,
            is_fitted: false,
            samples_seen: 0,
            replay: VecDeque::new(),
            config,
        }
    }

    pub fn backend(&self) -> LearnerBackend {
        self.config.backend
    }

    pub fn is_fitted(&self) -> bool {
        self.is_fitted
    }

    // -------------------------------------------------------------------------
    // Training
    // -------------------------------------------------------------------------

    /// Update the model with one batch. Returns batch metrics: accuracy for
    /// classification, mse for regression.
    pub fn partial_fit(
        &mut self,
        features: &[Vec<f64>],
        labels: &[f64],
        sample_weight: Option<&[f64]>,
    ) -> HashMap<String, f64> {
        if features.is_empty() || labels.is_empty() || features.len() != labels.len() {
            return HashMap::new();
        }
        let dim = features[0].len();
        self.ensure_params(dim);

        // Scaler state advances with every sample seen.
        for row in features {
            self.scaler.update(row);
        }

        self.replay.push_back(TrainingBatch {
            features: features.to_vec(),
            labels: labels.to_vec(),
        });
        while self.replay.len() > self.config.buffer_size {
            self.replay.pop_front();
        }

        for (i, row) in features.iter().enumerate() {
            let weight = sample_weight.map_or(1.0, |w| w[i]);
            let scaled = self.scaler.transform(row);
            self.sgd_step(&scaled, labels[i], weight);
            self.samples_seen += 1;
        }
        self.is_fitted = true;

        // Post-update metrics on this batch.
        let result = self.predict(features);
        let mut metrics = HashMap::new();
        match self.config.task_type {
            TaskType::Classification => {
                let correct = result
                    .predictions
                    .iter()
                    .zip(labels)
                    .filter(|(p, y)| (**p - **y).abs() < 0.5)
                    .count();
                metrics.insert(
                    "accuracy".to_string(),
                    correct as f64 / labels.len() as f64,
                );
            }
            TaskType::Regression => {
                let mse = result
                    .predictions
                    .iter()
                    .zip(labels)
                    .map(|(p, y)| (p - y) * (p - y))
                    .sum::<f64>()
                    / labels.len() as f64;
                metrics.insert("mse".to_string(), mse);
            }
        }
        metrics
    }

    // -------------------------------------------------------------------------
    // Prediction
    // -------------------------------------------------------------------------

    pub fn predict(&self, features: &[Vec<f64>]) -> PredictionResult {
        if !self.is_fitted || self.params.is_none() {
            return PredictionResult {
                predictions: vec![0.0; features.len()],
                probabilities: None,
                confidence: None,
            };
        }

        let mut predictions = Vec::with_capacity(features.len());
        let mut probabilities = Vec::with_capacity(features.len());

        for row in features {
            let scaled = self.scaler.transform(row);
            let raw = self.forward(&scaled);
            match self.config.task_type {
                TaskType::Classification => {
                    let p1 = sigmoid(raw);
                    predictions.push(if p1 > 0.5 { 1.0 } else { 0.0 });
                    probabilities.push((1.0 - p1, p1));
                }
                TaskType::Regression => predictions.push(raw),
            }
        }

        match self.config.task_type {
            TaskType::Classification => {
                let confidence = probabilities
                    .iter()
                    .map(|(p0, p1)| p0.max(*p1))
                    .collect();
                PredictionResult {
                    predictions,
                    probabilities: Some(probabilities),
                    confidence: Some(confidence),
                }
            }
            TaskType::Regression => PredictionResult {
                predictions,
                probabilities: None,
                confidence: None,
            },
        }
    }

    /// Probability of the positive class per row (classification only).
    pub fn predict_p_up(&self, features: &[Vec<f64>]) -> Vec<f64> {
        match self.predict(features).probabilities {
            Some(probs) => probs.into_iter().map(|(_, p1)| p1).collect(),
            None => vec![0.5; features.len()],
        }
    }

    /// Coefficient explanation for a single input. `None` for the neural
    /// backend, whose weights are not directly attributable.
    pub fn explain(&self, row: &[f64]) -> Option<Explanation> {
        let Some(ModelParams::Linear { weights, .. }) = &self.params else {
            return None;
        };
        if !self.is_fitted {
            return None;
        }
        let scaled = self.scaler.transform(row);
        let contributions = weights
            .iter()
            .zip(scaled.iter())
            .map(|(w, x)| w * x)
            .collect();
        Some(Explanation {
            feature_importance: weights.clone(),
            contributions,
        })
    }

    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------

    pub fn get_state(&self) -> LearnerState {
        LearnerState {
            task_type: self.config.task_type,
            backend: self.config.backend,
            is_fitted: self.is_fitted,
            samples_seen: self.samples_seen,
            scaler: self.scaler.clone(),
            params: self.params.clone(),
        }
    }

    pub fn set_state(&mut self, state: LearnerState) {
        if state.backend != self.config.backend {
            warn!(
                saved = %state.backend,
                configured = %self.config.backend,
                "learner state backend mismatch; state ignored"
            );
            return;
        }
        self.config.task_type = state.task_type;
        self.is_fitted = state.is_fitted;
        self.samples_seen = state.samples_seen;
        self.scaler = state.scaler;
        self.params = state.params;
        info!(samples_seen = self.samples_seen, "learner state restored");
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn ensure_params(&mut self, dim: usize) {
        if self.params.is_some() {
            return;
        }
        self.params = Some(match self.config.backend {
            LearnerBackend::LinearSgd | LearnerBackend::Fallback => ModelParams::Linear {
                weights: vec![0.0; dim],
                bias: 0.0,
            },
            LearnerBackend::NeuralNet => {
                let hidden = self.config.hidden_dim;
                let mut rng = ChaCha8Rng::seed_from_u64(self.config.rng_seed);
                let scale = (2.0 / dim as f64).sqrt();
                let w1 = (0..hidden)
                    .map(|_| (0..dim).map(|_| rng.gen_range(-scale..scale)).collect())
                    .collect();
                let w2 = (0..hidden)
                    .map(|_| rng.gen_range(-scale..scale))
                    .collect();
                ModelParams::Neural {
                    w1,
                    b1: vec![0.0; hidden],
                    w2,
                    b2: 0.0,
                }
            }
        });
    }

    fn learning_rate(&self) -> f64 {
        match self.config.backend {
            // Constant rate is the defining property of the fallback.
            LearnerBackend::Fallback => FALLBACK_LEARNING_RATE,
            LearnerBackend::LinearSgd => {
                SGD_ETA0 / (1.0 + 1e-4 * self.samples_seen as f64)
            }
            LearnerBackend::NeuralNet => NEURAL_LEARNING_RATE,
        }
    }

    fn forward(&self, scaled: &[f64]) -> f64 {
        match &self.params {
            None => 0.0,
            Some(ModelParams::Linear { weights, bias }) => dot(weights, scaled) + bias,
            Some(ModelParams::Neural { w1, b1, w2, b2 }) => {
                let hidden: Vec<f64> = w1
                    .iter()
                    .zip(b1)
                    .map(|(row, b)| (dot(row, scaled) + b).max(0.0))
                    .collect();
                dot(w2, &hidden) + b2
            }
        }
    }

    fn sgd_step(&mut self, scaled: &[f64], label: f64, sample_weight: f64) {
        let lr = self.learning_rate() * sample_weight;
        let task = self.config.task_type;
        let raw = self.forward(scaled);

        let Some(params) = self.params.as_mut() else {
            return;
        };
        match params {
            ModelParams::Linear { weights, bias } => {
                let error = match task {
                    TaskType::Classification => sigmoid(raw) - label,
                    TaskType::Regression => raw - label,
                };
                for (w, x) in weights.iter_mut().zip(scaled) {
                    *w -= lr * error * x;
                }
                *bias -= lr * error;
            }
            ModelParams::Neural { w1, b1, w2, b2 } => {
                // Forward pass retained for backprop.
                let pre: Vec<f64> = w1
                    .iter()
                    .zip(b1.iter())
                    .map(|(row, b)| dot(row, scaled) + b)
                    .collect();
                let hidden: Vec<f64> = pre.iter().map(|v| v.max(0.0)).collect();
                let out = dot(w2, &hidden) + *b2;

                let d_out = match task {
                    TaskType::Classification => sigmoid(out) - label,
                    TaskType::Regression => out - label,
                };

                // Output layer.
                let d_hidden: Vec<f64> = w2
                    .iter()
                    .zip(pre.iter())
                    .map(|(w, p)| if *p > 0.0 { w * d_out } else { 0.0 })
                    .collect();
                for (w, h) in w2.iter_mut().zip(hidden.iter()) {
                    *w -= lr * d_out * h;
                }
                *b2 -= lr * d_out;

                // Hidden layer.
                for ((row, b), dh) in w1.iter_mut().zip(b1.iter_mut()).zip(d_hidden.iter()) {
                    for (w, x) in row.iter_mut().zip(scaled) {
                        *w -= lr * dh * x;
                    }
                    *b -= lr * dh;
                }
            }
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
