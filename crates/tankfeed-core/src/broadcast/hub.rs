//! Subscriber fan-out and liveness management.
//!
//! Every outbound message is serialized once and handed to each open
//! subscriber's sink. Traversal always works on a snapshot of the
//! subscriber set; removals happen afterwards, so a failing subscriber never
//! interrupts delivery to the others.

use super::protocol::{ConnectionStatus, OutboundMessage, StatusPayload, TankDataPayload};
use crate::config::BroadcastConfig;
use crate::mapping::CanonicalRecord;
use crate::metrics::IngestionMetrics;
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unique identifier of a connected subscriber.
pub type SubscriberId = u64;

/// Transport of one subscriber.
///
/// Sends must not block: a sink that cannot accept a frame right away
/// reports an error and is dropped by the hub.
pub trait SubscriberSink: Send + Sync {
    /// Whether the underlying connection still accepts frames.
    fn is_open(&self) -> bool;

    /// Queue a text frame.
    fn send_text(&self, text: Arc<str>) -> Result<()>;

    /// Queue a liveness probe.
    fn send_ping(&self) -> Result<()>;

    /// Close the connection.
    fn close(&self);
}

/// Lifecycle of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Open,
    PingSent,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Liveness {
    state: SubscriberState,
    last_activity: Instant,
    pending_ping: bool,
}

struct Subscriber {
    id: SubscriberId,
    sink: Arc<dyn SubscriberSink>,
    liveness: Mutex<Liveness>,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Subscribers in the snapshot
    pub recipients: usize,
    /// Subscribers that accepted the message
    pub delivered: usize,
    /// Subscribers removed because the send failed or the connection was closing
    pub removed: usize,
}

/// Outcome of one health-check pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessReport {
    pub probed: usize,
    pub removed: usize,
}

/// Fan-out hub owning the subscriber list.
pub struct BroadcastHub {
    config: BroadcastConfig,
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    /// Latest serialized `tankData` message per source, replayed to new subscribers
    snapshots: RwLock<BTreeMap<String, Arc<str>>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    next_id: AtomicU64,
    metrics: Option<Arc<IngestionMetrics>>,
}

impl BroadcastHub {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(BTreeMap::new()),
            last_sync: RwLock::new(None),
            next_id: AtomicU64::new(1),
            metrics: None,
        }
    }

    /// Create a hub that reports fan-out and subscriber counts.
    pub fn with_metrics(config: BroadcastConfig, metrics: Arc<IngestionMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::new(config)
        }
    }

    /// Register a subscriber. It first receives a `status` message and then
    /// the latest `tankData` message of every source.
    pub fn subscribe(&self, sink: Arc<dyn SubscriberSink>) -> Result<SubscriberId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            sink,
            liveness: Mutex::new(Liveness {
                state: SubscriberState::Connecting,
                last_activity: Instant::now(),
                pending_ping: false,
            }),
        });

        let status: Arc<str> = self.status_message()?.into();

        // Holding the snapshot lock until the subscriber is inserted keeps a
        // concurrent broadcast from slipping between replay and insertion.
        let snapshots = self.snapshots.read();
        let replay = std::iter::once(status).chain(snapshots.values().cloned());
        for text in replay {
            if let Err(e) = subscriber.sink.send_text(text) {
                subscriber.sink.close();
                subscriber.liveness.lock().state = SubscriberState::Closed;
                return Err(e);
            }
        }

        subscriber.liveness.lock().state = SubscriberState::Open;
        let count = {
            let mut subscribers = self.subscribers.write();
            subscribers.insert(id, subscriber);
            subscribers.len()
        };
        drop(snapshots);

        if let Some(metrics) = &self.metrics {
            metrics.set_subscribers(count);
        }
        info!(subscriber_id = id, subscribers = count, "Subscriber connected");
        Ok(id)
    }

    /// Remove a subscriber and close its connection. Returns false if it was
    /// not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.remove(&[id], "disconnected");
        removed > 0
    }

    /// Record an acknowledged probe: clears the pending flag and refreshes
    /// activity.
    pub fn acknowledge(&self, id: SubscriberId) {
        if let Some(subscriber) = self.subscribers.read().get(&id) {
            let mut liveness = subscriber.liveness.lock();
            liveness.pending_ping = false;
            liveness.last_activity = Instant::now();
            if liveness.state == SubscriberState::PingSent {
                liveness.state = SubscriberState::Open;
            }
        }
    }

    /// Record inbound traffic from a subscriber.
    pub fn touch(&self, id: SubscriberId) {
        if let Some(subscriber) = self.subscribers.read().get(&id) {
            subscriber.liveness.lock().last_activity = Instant::now();
        }
    }

    /// Broadcast one source's record batch as a `tankData` message.
    ///
    /// Batches above the per-message cap are truncated and logged.
    pub fn broadcast_records(&self, source_id: &str, records: &[CanonicalRecord]) -> Result<DeliveryReport> {
        let cap = self.config.max_records_per_message;
        let records = if records.len() > cap {
            warn!(
                source_id = %source_id,
                total = records.len(),
                sent = cap,
                "Truncating broadcast to the per-message record cap"
            );
            &records[..cap]
        } else {
            records
        };

        let now = Utc::now();
        *self.last_sync.write() = Some(now);

        let text: Arc<str> = OutboundMessage::TankData {
            data: TankDataPayload {
                records,
                last_sync: now,
                connection_status: ConnectionStatus::Connected,
            },
        }
        .to_text()?
        .into();

        self.snapshots
            .write()
            .insert(source_id.to_string(), Arc::clone(&text));

        Ok(self.deliver(text))
    }

    /// Broadcast a source failure.
    pub fn broadcast_error(&self, source_id: &str, error: &str) -> Result<DeliveryReport> {
        let text = OutboundMessage::Error {
            source: source_id.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        }
        .to_text()?;
        Ok(self.deliver(text.into()))
    }

    /// Broadcast the current connection status.
    pub fn broadcast_status(&self) -> Result<DeliveryReport> {
        let text = self.status_message()?;
        Ok(self.deliver(text.into()))
    }

    /// Drop the replay snapshot of a removed source.
    pub fn forget_source(&self, source_id: &str) {
        self.snapshots.write().remove(source_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn subscriber_state(&self, id: SubscriberId) -> Option<SubscriberState> {
        self.subscribers
            .read()
            .get(&id)
            .map(|s| s.liveness.lock().state)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read()
    }

    /// Send `text` to every open subscriber in a snapshot of the set, then
    /// remove the ones that failed or were closing.
    pub fn deliver(&self, text: Arc<str>) -> DeliveryReport {
        let snapshot: Vec<Arc<Subscriber>> = self.subscribers.read().values().cloned().collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for subscriber in &snapshot {
            let closing = matches!(
                subscriber.liveness.lock().state,
                SubscriberState::Closing | SubscriberState::Closed
            );
            if closing || !subscriber.sink.is_open() {
                failed.push(subscriber.id);
                continue;
            }
            match subscriber.sink.send_text(Arc::clone(&text)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(subscriber_id = subscriber.id, error = %e, "Send failed");
                    failed.push(subscriber.id);
                }
            }
        }

        let removed = self.remove(&failed, "send failed");
        if let Some(metrics) = &self.metrics {
            metrics.record_broadcast(delivered, removed);
        }
        DeliveryReport {
            recipients: snapshot.len(),
            delivered,
            removed,
        }
    }

    /// One health-check pass.
    ///
    /// Subscribers still pending from the previous probe, idle longer than
    /// the inactivity timeout, or closed are removed. Every other subscriber
    /// is marked pending and probed.
    pub fn check_liveness(&self) -> LivenessReport {
        let now = Instant::now();
        let timeout = self.config.inactivity_timeout();
        let snapshot: Vec<Arc<Subscriber>> = self.subscribers.read().values().cloned().collect();

        let mut stale = Vec::new();
        let mut probed = 0;
        for subscriber in &snapshot {
            let expired = {
                let mut liveness = subscriber.liveness.lock();
                let expired = liveness.pending_ping
                    || now.duration_since(liveness.last_activity) > timeout
                    || !subscriber.sink.is_open();
                if !expired {
                    liveness.pending_ping = true;
                    liveness.state = SubscriberState::PingSent;
                }
                expired
            };

            if expired || subscriber.sink.send_ping().is_err() {
                stale.push(subscriber.id);
            } else {
                probed += 1;
            }
        }

        let removed = self.remove(&stale, "liveness check failed");
        if let Some(metrics) = &self.metrics {
            metrics.record_subscribers_removed(removed);
        }
        LivenessReport { probed, removed }
    }

    /// Run health checks every probe interval until cancelled.
    pub async fn run_health_checks(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.ping_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.check_liveness();
                    if report.removed > 0 {
                        info!(removed = report.removed, probed = report.probed, "Removed unresponsive subscribers");
                    } else {
                        debug!(probed = report.probed, "Liveness probes sent");
                    }
                }
            }
        }
    }

    /// Close every subscriber.
    pub fn close_all(&self) -> usize {
        let ids: Vec<SubscriberId> = self.subscribers.read().keys().copied().collect();
        self.remove(&ids, "hub shutting down")
    }

    fn status_message(&self) -> Result<String> {
        OutboundMessage::Status {
            data: StatusPayload {
                connection_status: ConnectionStatus::Connected,
                last_sync: self.last_sync(),
            },
        }
        .to_text()
    }

    fn remove(&self, ids: &[SubscriberId], reason: &str) -> usize {
        if ids.is_empty() {
            return 0;
        }

        let (removed, remaining): (Vec<Arc<Subscriber>>, usize) = {
            let mut subscribers = self.subscribers.write();
            let removed = ids.iter().filter_map(|id| subscribers.remove(id)).collect();
            (removed, subscribers.len())
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_subscribers(remaining);
        }

        for subscriber in &removed {
            subscriber.liveness.lock().state = SubscriberState::Closing;
            subscriber.sink.close();
            subscriber.liveness.lock().state = SubscriberState::Closed;
            info!(subscriber_id = subscriber.id, reason = reason, "Subscriber removed");
        }
        removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde_json::Value;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Default)]
    struct MockSink {
        fail: AtomicBool,
        closed: AtomicBool,
        sent: Mutex<Vec<String>>,
        pings: AtomicU64,
    }

    impl MockSink {
        fn failing() -> Arc<Self> {
            let sink = Arc::new(Self::default());
            sink.fail.store(true, Ordering::SeqCst);
            sink
        }

        fn types(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .map(|t| {
                    let v: Value = serde_json::from_str(t).unwrap();
                    v["type"].as_str().unwrap().to_string()
                })
                .collect()
        }
    }

    impl SubscriberSink for MockSink {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn send_text(&self, text: Arc<str>) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Connection("broken pipe".into()));
            }
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        fn send_ping(&self) -> Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn record(id: &str) -> CanonicalRecord {
        CanonicalRecord {
            tank_id: id.into(),
            level: 1.0,
            temperature: None,
            pressure: None,
            volume: None,
            capacity: None,
            status: None,
            location: None,
            alarm: None,
            timestamp: Utc::now(),
            source_id: "s".into(),
            extra: Default::default(),
        }
    }

    fn hub() -> BroadcastHub {
        BroadcastHub::new(BroadcastConfig::default())
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let hub = hub();
        let a = Arc::new(MockSink::default());
        let b = Arc::new(MockSink::default());
        let broken = Arc::new(MockSink::default());
        hub.subscribe(a.clone()).unwrap();
        let broken_id = hub.subscribe(broken.clone()).unwrap();
        hub.subscribe(b.clone()).unwrap();

        broken.fail.store(true, Ordering::SeqCst);
        let report = hub.broadcast_records("s", &[record("T1")]).unwrap();

        assert_eq!(report.recipients, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(hub.subscriber_count(), 2);
        assert!(hub.subscriber_state(broken_id).is_none());
        assert!(broken.closed.load(Ordering::SeqCst));
        assert_eq!(a.types(), vec!["status", "tankData"]);
        assert_eq!(b.types(), vec!["status", "tankData"]);
    }

    #[test]
    fn test_closed_connection_is_skipped_and_removed() {
        let hub = hub();
        let open = Arc::new(MockSink::default());
        let closed = Arc::new(MockSink::default());
        hub.subscribe(open.clone()).unwrap();
        hub.subscribe(closed.clone()).unwrap();
        closed.closed.store(true, Ordering::SeqCst);

        let report = hub.broadcast_error("s", "bad file").unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(closed.types(), vec!["status"]);
    }

    #[test]
    fn test_new_subscriber_gets_status_then_replay() {
        let hub = hub();
        hub.broadcast_records("b", &[record("B1")]).unwrap();
        hub.broadcast_records("a", &[record("A1")]).unwrap();
        hub.broadcast_records("a", &[record("A2")]).unwrap();

        let sink = Arc::new(MockSink::default());
        hub.subscribe(sink.clone()).unwrap();
        assert_eq!(sink.types(), vec!["status", "tankData", "tankData"]);

        let sent = sink.sent.lock();
        let latest_a: Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(latest_a["data"]["records"][0]["tankId"], "A2");
        let status: Value = serde_json::from_str(&sent[0]).unwrap();
        assert!(status["data"]["lastSync"].is_string());
    }

    #[test]
    fn test_forget_source_drops_replay() {
        let hub = hub();
        hub.broadcast_records("a", &[record("A1")]).unwrap();
        hub.forget_source("a");

        let sink = Arc::new(MockSink::default());
        hub.subscribe(sink.clone()).unwrap();
        assert_eq!(sink.types(), vec!["status"]);
    }

    #[test]
    fn test_subscribe_failure_is_reported() {
        let hub = hub();
        assert!(hub.subscribe(MockSink::failing()).is_err());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_truncates_to_cap() {
        let hub = BroadcastHub::new(BroadcastConfig {
            max_records_per_message: 2,
            ..Default::default()
        });
        let sink = Arc::new(MockSink::default());
        hub.subscribe(sink.clone()).unwrap();

        let records: Vec<_> = (0..5).map(|i| record(&format!("T{}", i))).collect();
        let report = hub.broadcast_records("s", &records).unwrap();
        assert_eq!(report.delivered, 1);

        let sent = sink.sent.lock();
        let message: Value = serde_json::from_str(sent.last().unwrap()).unwrap();
        assert_eq!(message["data"]["records"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_reports_to_metrics() {
        let metrics = Arc::new(IngestionMetrics::new());
        let hub = BroadcastHub::with_metrics(BroadcastConfig::default(), Arc::clone(&metrics));
        let good = Arc::new(MockSink::default());
        hub.subscribe(good).unwrap();
        let bad = Arc::new(MockSink::default());
        hub.subscribe(bad.clone()).unwrap();
        assert_eq!(metrics.subscribers(), 2);

        bad.fail.store(true, Ordering::SeqCst);
        hub.broadcast_records("s", &[record("T1")]).unwrap();
        assert_eq!(metrics.broadcasts_total(), 1);
        assert_eq!(metrics.deliveries_total(), 1);
        assert_eq!(metrics.subscribers_removed_total(), 1);
        assert_eq!(metrics.subscribers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_subscriber_removed_after_two_probes() {
        let hub = hub();
        let silent = Arc::new(MockSink::default());
        let responsive = Arc::new(MockSink::default());
        let silent_id = hub.subscribe(silent.clone()).unwrap();
        let responsive_id = hub.subscribe(responsive.clone()).unwrap();

        let first = hub.check_liveness();
        assert_eq!(first, LivenessReport { probed: 2, removed: 0 });
        assert_eq!(hub.subscriber_state(silent_id), Some(SubscriberState::PingSent));

        tokio::time::advance(Duration::from_secs(30)).await;
        hub.acknowledge(responsive_id);
        assert_eq!(hub.subscriber_state(responsive_id), Some(SubscriberState::Open));

        let second = hub.check_liveness();
        assert_eq!(second, LivenessReport { probed: 1, removed: 1 });
        assert!(hub.subscriber_state(silent_id).is_none());
        assert!(silent.closed.load(Ordering::SeqCst));
        assert_eq!(silent.pings.load(Ordering::SeqCst), 1);
        assert_eq!(responsive.pings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_subscriber_removed() {
        let hub = hub();
        let sink = Arc::new(MockSink::default());
        hub.subscribe(sink.clone()).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = hub.check_liveness();
        assert_eq!(report.removed, 1);
        assert_eq!(sink.pings.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_runs_on_interval() {
        let hub = Arc::new(hub());
        let sink = Arc::new(MockSink::default());
        hub.subscribe(sink.clone()).unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&hub).run_health_checks(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(sink.pings.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(hub.subscriber_count(), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
