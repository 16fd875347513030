// =============================================================================
// Broadcast hub -- multi-channel fan-out with backpressure and liveness
// =============================================================================
//
// Per channel: a bounded payload queue (drop-newest on full), a subscriber
// set guarded by a per-channel lock, and a dedicated consumer task that
// snapshots the set and dispatches sends concurrently, each with a timeout.
// Subscribers whose sends fail or time out are pruned under the lock.
//
// A single global heartbeat task pings every subscriber on every channel
// and applies the same pruning policy.
//
// Producers must not block: they consult get_queue_utilization and skip
// the tick when the ratio is at or above 0.8.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Per-channel payload queue capacity.
    pub queue_cap: usize,
    /// Producer-side enqueue timeout before drop-newest applies.
    pub enqueue_timeout_ms: u64,
    /// Per-subscriber send timeout.
    pub send_timeout_ms: u64,
    /// Heartbeat period.
    pub heartbeat_interval_secs: u64,
    /// Capacity of each subscriber's outbound transport channel.
    pub transport_cap: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_cap: 100,
            enqueue_timeout_ms: 50,
            send_timeout_ms: 2_500,
            heartbeat_interval_secs: 25,
            transport_cap: 32,
        }
    }
}

/// Producers skip their tick at or above this queue-utilization ratio.
pub const BACKPRESSURE_RATIO: f64 = 0.8;

// ---------------------------------------------------------------------------
// Subscriber handle
// ---------------------------------------------------------------------------

/// Outbound transport handle for one subscriber. The hub owns the sending
/// side; the transport task (e.g. a WebSocket writer) drains the receiver
/// returned by `connect`.
pub struct SubscriberHandle {
    pub id: u64,
    pub channel: String,
    pub connected_at: DateTime<Utc>,
    pub metadata: Value,
    tx: mpsc::Sender<Value>,
    last_seen: RwLock<Instant>,
}

impl SubscriberHandle {
    /// Send one payload with a timeout. An error means the transport is
    /// gone or wedged and the subscriber should be pruned.
    pub async fn send(&self, payload: Value, timeout: Duration) -> Result<(), String> {
        match tokio::time::timeout(timeout, self.tx.send(payload)).await {
            Ok(Ok(())) => {
                *self.last_seen.write() = Instant::now();
                Ok(())
            }
            Ok(Err(_)) => Err("transport closed".to_string()),
            Err(_) => Err("send timed out".to_string()),
        }
    }

    pub fn seconds_since_seen(&self) -> f64 {
        self.last_seen.read().elapsed().as_secs_f64()
    }
}

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelMetrics {
    pub broadcasts_attempted: u64,
    pub broadcasts_failed: u64,
    pub queue_dropped: u64,
    pub pruned: u64,
    pub broadcast_latency_ms: f64,
}

struct ChannelState {
    name: String,
    subscribers: Mutex<Vec<Arc<SubscriberHandle>>>,
    queue_tx: mpsc::Sender<Value>,
    /// Held until the consumer task takes it on first connect.
    queue_rx: Mutex<Option<mpsc::Receiver<Value>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    metrics: Mutex<ChannelMetrics>,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Process-wide broadcast hub. Channels never block each other.
pub struct BroadcastHub {
    config: HubConfig,
    channels: RwLock<HashMap<String, Arc<ChannelState>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Register a subscriber on `channel`. Returns the handle plus the
    /// receiving end of its transport channel; the caller's transport task
    /// drains the receiver. Lazily starts the channel consumer and the
    /// global heartbeat.
    pub fn connect(
        self: &Arc<Self>,
        channel: &str,
        metadata: Value,
    ) -> (Arc<SubscriberHandle>, mpsc::Receiver<Value>) {
        let state = self.ensure_channel_plain(channel);
        let (tx, rx) = mpsc::channel(self.config.transport_cap);

        let handle = Arc::new(SubscriberHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            channel: channel.to_string(),
            connected_at: Utc::now(),
            metadata,
            tx,
            last_seen: RwLock::new(Instant::now()),
        });

        let total = {
            let mut subscribers = state.subscribers.lock();
            subscribers.push(handle.clone());
            subscribers.len()
        };
        info!(channel, subscriber_id = handle.id, total_connections = total, "subscriber connected");

        self.start_consumer_if_needed(&state);
        self.start_heartbeat_if_needed();

        (handle, rx)
    }

    /// Remove a subscriber from its channel. Idempotent.
    pub fn disconnect(&self, subscriber: &SubscriberHandle) {
        let Some(state) = self.channels.read().get(&subscriber.channel).cloned() else {
            return;
        };
        let mut subscribers = state.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscriber.id);
        if subscribers.len() < before {
            info!(
                channel = %subscriber.channel,
                subscriber_id = subscriber.id,
                "subscriber disconnected"
            );
        }
    }

    /// Enqueue a payload for fan-out on `channel`. Never blocks beyond the
    /// short enqueue timeout; on a full queue the incoming payload is
    /// dropped (drop-newest) and `queue_dropped` increments.
    pub async fn broadcast_to_type(&self, payload: Value, channel: &str) {
        let state = self.ensure_channel_plain(channel);
        if state.queue_tx.try_send(payload.clone()).is_ok() {
            return;
        }

        let timeout = Duration::from_millis(self.config.enqueue_timeout_ms);
        match tokio::time::timeout(timeout, state.queue_tx.send(payload)).await {
            Ok(Ok(())) => {}
            _ => {
                let dropped = {
                    let mut metrics = state.metrics.lock();
                    metrics.queue_dropped += 1;
                    metrics.queue_dropped
                };
                if dropped % 100 == 0 {
                    warn!(channel, dropped_total = dropped, "broadcast queue drops");
                }
            }
        }
    }

    /// (size, capacity, ratio) of the channel's queue. Non-blocking; used
    /// by producers for upstream backpressure.
    pub fn get_queue_utilization(&self, channel: &str) -> (usize, usize, f64) {
        match self.channels.read().get(channel) {
            Some(state) => {
                let cap = state.queue_tx.max_capacity();
                let size = cap - state.queue_tx.capacity();
                let ratio = if cap > 0 { size as f64 / cap as f64 } else { 0.0 };
                (size, cap, ratio)
            }
            None => (0, self.config.queue_cap, 0.0),
        }
    }

    /// True when producers should skip this tick for `channel`.
    pub fn should_backpressure(&self, channel: &str) -> bool {
        self.get_queue_utilization(channel).2 >= BACKPRESSURE_RATIO
    }

    /// Direct send to one subscriber; on failure the subscriber is
    /// disconnected.
    pub async fn send_personal(&self, subscriber: &Arc<SubscriberHandle>, payload: Value) {
        let timeout = Duration::from_millis(self.config.send_timeout_ms);
        if let Err(e) = subscriber.send(payload, timeout).await {
            warn!(
                channel = %subscriber.channel,
                subscriber_id = subscriber.id,
                error = %e,
                "personal send failed; disconnecting"
            );
            self.disconnect(subscriber);
        }
    }

    /// Per-channel stats for the control plane.
    pub fn stats(&self) -> Value {
        let channels = self.channels.read();
        let mut per_channel = serde_json::Map::new();
        let mut total = 0usize;
        for (name, state) in channels.iter() {
            let subscribers = state.subscribers.lock().len();
            total += subscribers;
            let cap = state.queue_tx.max_capacity();
            let queue_len = cap - state.queue_tx.capacity();
            let metrics = state.metrics.lock().clone();
            per_channel.insert(
                name.clone(),
                json!({
                    "connections": subscribers,
                    "queue_len": queue_len,
                    "queue_cap": cap,
                    "broadcasts_attempted": metrics.broadcasts_attempted,
                    "broadcasts_failed": metrics.broadcasts_failed,
                    "queue_dropped": metrics.queue_dropped,
                    "pruned": metrics.pruned,
                    "broadcast_latency_ms": metrics.broadcast_latency_ms,
                }),
            );
        }
        json!({ "total_connections": total, "per_channel": per_channel })
    }

    /// Cancel the heartbeat and every channel consumer. Safe to call more
    /// than once.
    pub fn stop(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        for state in self.channels.read().values() {
            if let Some(handle) = state.consumer.lock().take() {
                handle.abort();
            }
        }
        info!("broadcast hub stopped");
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn ensure_channel_plain(&self, channel: &str) -> Arc<ChannelState> {
        if let Some(state) = self.channels.read().get(channel) {
            return state.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_cap);
                debug!(channel, "channel created");
                Arc::new(ChannelState {
                    name: channel.to_string(),
                    subscribers: Mutex::new(Vec::new()),
                    queue_tx,
                    queue_rx: Mutex::new(Some(queue_rx)),
                    consumer: Mutex::new(None),
                    metrics: Mutex::new(ChannelMetrics::default()),
                })
            })
            .clone()
    }

    /// Start the channel's consumer on first demand. Payloads enqueued
    /// before the first subscriber connects are retained in the queue and
    /// delivered once the consumer starts.
    fn start_consumer_if_needed(self: &Arc<Self>, state: &Arc<ChannelState>) {
        let mut consumer = state.consumer.lock();
        if consumer.is_some() {
            return;
        }
        let Some(rx) = state.queue_rx.lock().take() else {
            return;
        };
        let hub = self.clone();
        let channel_state = state.clone();
        *consumer = Some(tokio::spawn(async move {
            hub.consume_channel(channel_state, rx).await;
        }));
    }

    async fn consume_channel(
        self: Arc<Self>,
        state: Arc<ChannelState>,
        mut rx: mpsc::Receiver<Value>,
    ) {
        let send_timeout = Duration::from_millis(self.config.send_timeout_ms);
        info!(channel = %state.name, "channel consumer started");

        while let Some(payload) = rx.recv().await {
            let t0 = Instant::now();
            let snapshot: Vec<Arc<SubscriberHandle>> = state.subscribers.lock().clone();
            {
                let mut metrics = state.metrics.lock();
                metrics.broadcasts_attempted += 1;
            }
            if snapshot.is_empty() {
                continue;
            }

            let sends = snapshot
                .iter()
                .map(|s| s.send(payload.clone(), send_timeout));
            let results = join_all(sends).await;

            let failed: Vec<u64> = snapshot
                .iter()
                .zip(results.iter())
                .filter(|(_, r)| r.is_err())
                .map(|(s, _)| s.id)
                .collect();

            if !failed.is_empty() {
                let before = snapshot.len();
                {
                    let mut subscribers = state.subscribers.lock();
                    subscribers.retain(|s| !failed.contains(&s.id));
                }
                let after = state.subscribers.lock().len();
                let mut metrics = state.metrics.lock();
                metrics.broadcasts_failed += failed.len() as u64;
                metrics.pruned += failed.len() as u64;
                drop(metrics);
                warn!(
                    channel = %state.name,
                    failed = failed.len(),
                    count_before = before,
                    count_after = after,
                    "broadcast send failures; pruned subscribers"
                );
            }

            let latency_ms = t0.elapsed().as_secs_f64() * 1_000.0;
            state.metrics.lock().broadcast_latency_ms = latency_ms;
        }
        info!(channel = %state.name, "channel consumer stopped");
    }

    fn start_heartbeat_if_needed(self: &Arc<Self>) {
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        let hub = self.clone();
        *heartbeat = Some(tokio::spawn(async move {
            hub.heartbeat_loop().await;
        }));
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        let send_timeout = Duration::from_millis(self.config.send_timeout_ms);
        info!(interval_secs = self.config.heartbeat_interval_secs, "heartbeat started");

        loop {
            tokio::time::sleep(interval).await;

            let channels: Vec<Arc<ChannelState>> =
                self.channels.read().values().cloned().collect();
            for state in channels {
                let snapshot: Vec<Arc<SubscriberHandle>> = state.subscribers.lock().clone();
                if snapshot.is_empty() {
                    continue;
                }
                let before = snapshot.len();
                let ping = json!({ "type": "ping", "ts": Utc::now().timestamp_millis() });

                let sends = snapshot.iter().map(|s| s.send(ping.clone(), send_timeout));
                let results = join_all(sends).await;

                let failed: Vec<u64> = snapshot
                    .iter()
                    .zip(results.iter())
                    .filter(|(_, r)| r.is_err())
                    .map(|(s, _)| s.id)
                    .collect();

                if !failed.is_empty() {
                    {
                        let mut subscribers = state.subscribers.lock();
                        subscribers.retain(|s| !failed.contains(&s.id));
                    }
                    let after = state.subscribers.lock().len();
                    state.metrics.lock().pruned += failed.len() as u64;
                    warn!(
                        channel = %state.name,
                        failed = failed.len(),
                        count_before = before,
                        count_after = after,
                        "heartbeat pruned sockets"
                    );
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn hub(config: HubConfig) -> Arc<BroadcastHub> {
        Arc::new(BroadcastHub::new(config))
    }

    fn small_hub(queue_cap: usize) -> Arc<BroadcastHub> {
        hub(HubConfig {
            queue_cap,
            enqueue_timeout_ms: 20,
            send_timeout_ms: 100,
            heartbeat_interval_secs: 3_600,
            transport_cap: 8,
        })
    }

    #[tokio::test]
    async fn drop_newest_on_full_queue() {
        // Capacity 2, no consumer yet: p1 and p2 queue, p3 drops.
        let hub = small_hub(2);
        hub.broadcast_to_type(json!({"n": 1}), "x").await;
        hub.broadcast_to_type(json!({"n": 2}), "x").await;
        hub.broadcast_to_type(json!({"n": 3}), "x").await;

        let (size, cap, ratio) = hub.get_queue_utilization("x");
        assert_eq!(size, 2);
        assert_eq!(cap, 2);
        assert!((ratio - 1.0).abs() < 1e-12);

        let stats = hub.stats();
        assert_eq!(stats["per_channel"]["x"]["queue_dropped"], 1);

        // Once a subscriber connects the consumer starts and the retained
        // payloads arrive oldest-first.
        let (_handle, mut rx) = hub.connect("x", json!({}));
        let p1 = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let p2 = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p1["n"], 1);
        assert_eq!(p2["n"], 2);

        hub.stop();
    }

    #[tokio::test]
    async fn delivery_preserves_per_channel_order() {
        let hub = small_hub(100);
        let (_handle, mut rx) = hub.connect("orders", json!({}));

        for i in 0..10 {
            hub.broadcast_to_type(json!({"seq": i}), "orders").await;
        }
        for i in 0..10 {
            let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(payload["seq"], i);
        }
        hub.stop();
    }

    #[tokio::test]
    async fn dead_subscriber_is_pruned_others_survive() {
        let hub = small_hub(100);
        let (_alive, mut alive_rx) = hub.connect("ch", json!({}));
        let (_dead, dead_rx) = hub.connect("ch", json!({}));
        drop(dead_rx); // transport gone

        hub.broadcast_to_type(json!({"msg": "hello"}), "ch").await;

        let payload = tokio::time::timeout(Duration::from_secs(1), alive_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["msg"], "hello");

        // Give the consumer a beat to finish pruning.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = hub.stats();
        assert_eq!(stats["per_channel"]["ch"]["connections"], 1);
        assert_eq!(stats["per_channel"]["ch"]["pruned"], 1);
        hub.stop();
    }

    #[tokio::test]
    async fn wedged_subscriber_times_out_and_is_pruned() {
        let hub = hub(HubConfig {
            queue_cap: 100,
            enqueue_timeout_ms: 20,
            send_timeout_ms: 50,
            heartbeat_interval_secs: 3_600,
            transport_cap: 1,
        });
        let (_wedged, _rx_kept_but_never_drained) = hub.connect("ch", json!({}));

        // First payload fills the transport; second cannot be delivered
        // within the send timeout.
        hub.broadcast_to_type(json!({"n": 1}), "ch").await;
        hub.broadcast_to_type(json!({"n": 2}), "ch").await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = hub.stats();
        assert_eq!(stats["per_channel"]["ch"]["connections"], 0);
        assert_eq!(stats["per_channel"]["ch"]["pruned"], 1);
        hub.stop();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let hub = small_hub(10);
        let (handle, _rx) = hub.connect("ch", json!({}));
        hub.disconnect(&handle);
        hub.disconnect(&handle);
        let stats = hub.stats();
        assert_eq!(stats["per_channel"]["ch"]["connections"], 0);
        hub.stop();
    }

    #[tokio::test]
    async fn backpressure_flag_trips_at_eighty_percent() {
        let hub = small_hub(10);
        // Unknown channels report empty.
        assert!(!hub.should_backpressure("quiet"));

        for i in 0..8 {
            hub.broadcast_to_type(json!({"n": i}), "busy").await;
        }
        assert!(hub.should_backpressure("busy"));
        hub.stop();
    }

    #[tokio::test]
    async fn send_personal_disconnects_on_failure() {
        let hub = small_hub(10);
        let (handle, rx) = hub.connect("ch", json!({}));
        drop(rx);
        hub.send_personal(&handle, json!({"direct": true})).await;
        let stats = hub.stats();
        assert_eq!(stats["per_channel"]["ch"]["connections"], 0);
        hub.stop();
    }

    #[tokio::test]
    async fn heartbeat_prunes_dead_subscribers() {
        let hub = hub(HubConfig {
            queue_cap: 10,
            enqueue_timeout_ms: 20,
            send_timeout_ms: 50,
            heartbeat_interval_secs: 1,
            transport_cap: 8,
        });
        let (_alive, mut alive_rx) = hub.connect("ch", json!({}));
        let (_dead, dead_rx) = hub.connect("ch", json!({}));
        drop(dead_rx);

        // Wait for at least one heartbeat cycle.
        tokio::time::sleep(Duration::from_millis(1_300)).await;

        let stats = hub.stats();
        assert_eq!(stats["per_channel"]["ch"]["connections"], 1);

        // The live subscriber got the ping.
        let ping = tokio::time::timeout(Duration::from_secs(1), alive_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ping["type"], "ping");
        hub.stop();
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let hub = small_hub(100);
        let (_h1, mut rx1) = hub.connect("a", json!({}));
        let (_h2, mut rx2) = hub.connect("b", json!({}));

        hub.broadcast_to_type(json!({"for": "a"}), "a").await;
        hub.broadcast_to_type(json!({"for": "b"}), "b").await;

        let p1 = tokio::time::timeout(Duration::from_secs(1), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        let p2 = tokio::time::timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p1["for"], "a");
        assert_eq!(p2["for"], "b");
        hub.stop();
    }
}
