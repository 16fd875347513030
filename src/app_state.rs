// =============================================================================
// AppState -- shared component container for the Meridian lab
// =============================================================================
//
// One instance per process, shared across tasks and the API via Arc. Each
// component keeps exclusive ownership of its own state; AppState only wires
// them together.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::allocator::BanditAllocator;
use crate::broker::PaperBroker;
use crate::config::LabConfig;
use crate::engine::TradeEngine;
use crate::features::labels::LabelGenerator;
use crate::features::FeatureComputer;
use crate::guardrails::GuardrailSystem;
use crate::hub::BroadcastHub;
use crate::learn_report::EventLog;
use crate::learner::OnlineLearner;
use crate::market_data::sim_feed::SimFeed;
use crate::market_data::BarWindow;
use crate::quality::QualityMonitor;
use crate::theories::TheoryRegistry;

const EVENT_LOG_CAP: usize = 50_000;
const DIRECTION_THRESHOLD: f64 = 0.001;

pub struct AppState {
    pub config: RwLock<LabConfig>,

    pub window: Arc<BarWindow>,
    pub feed: Arc<SimFeed>,
    pub features: Arc<FeatureComputer>,
    pub labels: Arc<LabelGenerator>,
    pub registry: Arc<TheoryRegistry>,
    pub broker: Arc<PaperBroker>,
    pub engine: Arc<TradeEngine>,
    pub allocator: Arc<BanditAllocator>,
    pub learner: Arc<Mutex<OnlineLearner>>,
    pub guardrails: Arc<GuardrailSystem>,
    pub quality: Arc<QualityMonitor>,
    pub hub: Arc<BroadcastHub>,
    pub event_log: Arc<EventLog>,

    /// Bumped whenever observable state changes; pushed to subscribers.
    state_version: AtomicU64,
}

impl AppState {
    pub fn new(config: LabConfig) -> Arc<Self> {
        let window = Arc::new(BarWindow::new(200));
        let feed = Arc::new(SimFeed::new(
            &config.symbols,
            config.feed_start_price,
            config.feed_step_vol,
            config.feed_seed,
        ));
        let features = Arc::new(FeatureComputer::new(window.clone()));
        let labels = Arc::new(LabelGenerator::new(vec![5, 15, 60], DIRECTION_THRESHOLD));
        let broker = Arc::new(PaperBroker::new(window.clone(), config.broker_config()));
        let engine = Arc::new(TradeEngine::new(broker.clone()));
        let allocator = Arc::new(BanditAllocator::new(config.allocator_config()));
        let learner = Arc::new(Mutex::new(OnlineLearner::new(config.learner_config())));
        let guardrails = Arc::new(GuardrailSystem::new(config.guardrail_limits()));
        let quality = Arc::new(QualityMonitor::new(config.quality_config()));
        let hub = Arc::new(BroadcastHub::new(config.hub_config()));

        Arc::new(Self {
            window,
            feed,
            features,
            labels,
            registry: Arc::new(TheoryRegistry::with_builtins()),
            broker,
            engine,
            allocator,
            learner,
            guardrails,
            quality,
            hub,
            event_log: Arc::new(EventLog::new(EVENT_LOG_CAP)),
            config: RwLock::new(config),
            state_version: AtomicU64::new(0),
        })
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }
}
