//! End-to-end scenarios driving a full engine: ingest through routing,
//! grouping, muting, deduplication and delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use klaxon_cluster::{Broadcast, ClusterError, GossipState, Peer};
use klaxon_core::{Alert, LabelSet, MatchOperator, Matcher, Matchers, RouteConfig};
use klaxon_dispatch::DispatcherConfig;
use klaxon_engine::{Engine, EngineBuilder};
use klaxon_inhibit::InhibitRule;
use klaxon_notify::{FlushContext, Integration, IntegrationError, Receiver, SendBackoff};
use klaxon_silence::Silence;

/// Integration that records every delivered batch.
struct RecordingIntegration {
    batches: Mutex<Vec<Vec<Alert>>>,
    count: AtomicUsize,
}

impl RecordingIntegration {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        })
    }

    fn sends(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn batches(&self) -> Vec<Vec<Alert>> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl Integration for RecordingIntegration {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, _ctx: &FlushContext, alerts: &[Alert]) -> Result<(), IntegrationError> {
        self.batches.lock().push(alerts.to_vec());
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A peer with a pinned position, for staggered-send scenarios.
struct PinnedPeer {
    name: String,
    position: usize,
}

#[async_trait]
impl Peer for PinnedPeer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn position(&self) -> usize {
        self.position
    }

    async fn settle(&self, _timeout: Duration) {}

    async fn register(
        &self,
        _channel: &str,
        _state: Arc<dyn GossipState>,
    ) -> Result<Broadcast, ClusterError> {
        Ok(Broadcast::noop())
    }
}

fn matchers(name: &str, value: &str) -> Matchers {
    [Matcher::new(name, MatchOperator::Equal, value).unwrap()]
        .into_iter()
        .collect()
}

fn alert(pairs: &[(&str, &str)]) -> Alert {
    let labels: LabelSet = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    Alert::new(labels)
}

async fn engine_with(
    route: RouteConfig,
    integration: Arc<RecordingIntegration>,
    inhibit_rules: Vec<InhibitRule>,
) -> Engine {
    EngineBuilder::new(route)
        .receiver(Receiver::new("pager").integration(integration))
        .inhibit_rules(inhibit_rules)
        .backoff(SendBackoff::fixed(Duration::from_millis(1)))
        .dispatcher_config(DispatcherConfig {
            maintenance_interval: Duration::from_millis(50),
            ..DispatcherConfig::default()
        })
        .start()
        .await
        .expect("engine must start")
}

fn fast_route() -> RouteConfig {
    RouteConfig::with_receiver("pager")
        .group_by(["service"])
        .group_wait(Duration::from_millis(20))
        .group_interval(Duration::from_millis(150))
}

#[tokio::test]
async fn basic_firing_delivers_once_and_logs() {
    let integration = RecordingIntegration::new();
    let engine = engine_with(fast_route(), integration.clone(), Vec::new()).await;

    engine
        .store()
        .put([alert(&[("alertname", "Up"), ("service", "api")])])
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(integration.sends(), 1, "one send after group_wait");
    let batches = integration.batches();
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].labels.get("service"), Some("api"));
    assert!(
        batches[0][0].ends_at.is_none(),
        "firing alert ships without an end time"
    );

    let entry = engine
        .nflog()
        .query("pager/recording/0", r#"{}/{service="api"}"#)
        .expect("nflog entry after delivery");
    assert!(!entry.resolved);

    engine.shutdown().await;
}

#[tokio::test]
async fn unchanged_group_is_not_renotified_within_repeat_interval() {
    let integration = RecordingIntegration::new();
    let engine = engine_with(fast_route(), integration.clone(), Vec::new()).await;

    engine
        .store()
        .put([alert(&[("alertname", "Up"), ("service", "api")])])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(integration.sends(), 1);

    // Re-put the identical alert; several group intervals elapse, but
    // the repeat interval (default hours) suppresses every re-send.
    engine
        .store()
        .put([alert(&[("alertname", "Up"), ("service", "api")])])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(integration.sends(), 1, "unchanged group must stay quiet");

    engine.shutdown().await;
}

#[tokio::test]
async fn resolved_alert_is_delivered_then_group_collected() {
    let integration = RecordingIntegration::new();
    let engine = engine_with(fast_route(), integration.clone(), Vec::new()).await;

    engine
        .store()
        .put([alert(&[("alertname", "Up"), ("service", "api")])])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(integration.sends(), 1);

    engine
        .store()
        .put([alert(&[("alertname", "Up"), ("service", "api")])
            .with_ends_at(Utc::now() - chrono::Duration::seconds(1))])
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(integration.sends(), 2, "resolution must be notified");
    let last = integration.batches().pop().unwrap();
    assert!(last[0].resolved_at(Utc::now()));

    let entry = engine
        .nflog()
        .query("pager/recording/0", r#"{}/{service="api"}"#)
        .unwrap();
    assert!(entry.resolved);

    // The group empties after the resolved delivery and is swept.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.dispatcher().group_count(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn silence_mutes_until_it_ends() {
    let integration = RecordingIntegration::new();
    let engine = engine_with(fast_route(), integration.clone(), Vec::new()).await;

    let silence_id = engine
        .silences()
        .set(Silence::new(
            matchers("service", "api"),
            Utc::now() - chrono::Duration::seconds(1),
            Utc::now() + chrono::Duration::minutes(5),
        ))
        .unwrap();

    let muted = alert(&[("alertname", "Up"), ("service", "api")]);
    let muted_fp = muted.fingerprint();
    engine.store().put([muted]).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(integration.sends(), 0, "active silence must mute the send");
    assert_eq!(
        engine.marker().status(muted_fp).silenced_by,
        vec![silence_id.clone()]
    );

    // The silence ends; the next flush delivers.
    engine.silences().expire(&silence_id).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(integration.sends(), 1, "delivery resumes after the silence");

    engine.shutdown().await;
}

#[tokio::test]
async fn critical_inhibits_warnings_in_same_cluster() {
    let integration = RecordingIntegration::new();
    let rule = InhibitRule::new(
        matchers("severity", "critical"),
        matchers("severity", "warning"),
        ["cluster"],
    );
    let route = RouteConfig::with_receiver("pager")
        .group_by(["severity", "cluster"])
        .group_wait(Duration::from_millis(20))
        .group_interval(Duration::from_millis(150));
    let engine = engine_with(route, integration.clone(), vec![rule]).await;

    let inhibited = alert(&[
        ("alertname", "Slow"),
        ("severity", "warning"),
        ("cluster", "c1"),
    ]);
    let inhibited_fp = inhibited.fingerprint();

    engine
        .store()
        .put([
            alert(&[("alertname", "Down"), ("severity", "critical"), ("cluster", "c1")]),
            inhibited,
            alert(&[("alertname", "Slow"), ("severity", "warning"), ("cluster", "c2")]),
        ])
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let delivered: Vec<String> = integration
        .batches()
        .iter()
        .flatten()
        .map(|a| {
            format!(
                "{}/{}",
                a.labels.get("severity").unwrap_or(""),
                a.labels.get("cluster").unwrap_or("")
            )
        })
        .collect();
    assert!(delivered.contains(&"critical/c1".to_owned()), "{delivered:?}");
    assert!(delivered.contains(&"warning/c2".to_owned()), "{delivered:?}");
    assert!(
        !delivered.contains(&"warning/c1".to_owned()),
        "inhibited alert must not be delivered: {delivered:?}"
    );
    assert!(!engine.marker().status(inhibited_fp).inhibited_by.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn peer_position_one_dedups_against_gossiped_log() {
    // Two single-node engines standing in for two cluster peers; a pump
    // task carries notification-log state between them the way gossip
    // would.
    let fast = RecordingIntegration::new();
    let slow = RecordingIntegration::new();

    let build = |integration: Arc<RecordingIntegration>, position: usize| {
        EngineBuilder::new(fast_route())
            .receiver(Receiver::new("pager").integration(integration))
            .peer(Arc::new(PinnedPeer {
                name: format!("peer-{position}"),
                position,
            }))
            .peer_timeout(Duration::from_millis(300))
            .backoff(SendBackoff::fixed(Duration::from_millis(1)))
            .start()
    };
    let p0 = build(fast.clone(), 0).await.unwrap();
    let p1 = build(slow.clone(), 1).await.unwrap();

    // Gossip pump: ship p0's log to p1 (and back) every 50ms.
    let p0_log = Arc::clone(p0.nflog());
    let p1_log = Arc::clone(p1.nflog());
    let pump = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            GossipState::merge(&*p1_log, &p0_log.full_state());
            GossipState::merge(&*p0_log, &p1_log.full_state());
        }
    });

    let incoming = alert(&[("alertname", "Up"), ("service", "api")]);
    p0.store().put([incoming.clone()]).unwrap();
    p1.store().put([incoming]).unwrap();

    // p0 sends at ~group_wait; p1 holds for position * peer_timeout and
    // then finds the gossiped entry.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(fast.sends(), 1, "position 0 sends first");
    assert_eq!(slow.sends(), 0, "position 1 deduplicates the send");

    pump.abort();
    p0.shutdown().await;
    p1.shutdown().await;
}

#[tokio::test]
async fn zero_group_wait_delivers_immediately() {
    let integration = RecordingIntegration::new();
    let route = RouteConfig::with_receiver("pager")
        .group_by(["service"])
        .group_wait(Duration::ZERO)
        .group_interval(Duration::from_millis(200));
    let engine = engine_with(route, integration.clone(), Vec::new()).await;

    engine
        .store()
        .put([alert(&[("alertname", "Up"), ("service", "api")])])
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(integration.sends(), 1, "zero group_wait must not stall");

    engine.shutdown().await;
}

#[tokio::test]
async fn groups_snapshot_reports_receiver_and_labels() {
    let integration = RecordingIntegration::new();
    let engine = engine_with(fast_route(), integration.clone(), Vec::new()).await;

    engine
        .store()
        .put([
            alert(&[("alertname", "Up"), ("service", "api")]),
            alert(&[("alertname", "Up"), ("service", "db")]),
        ])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let groups = engine.dispatcher().groups(|_| true, |_| true);
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|g| g.receiver == "pager"));
    assert!(groups.iter().all(|g| g.alerts.len() == 1));
    let labels: Vec<&str> = groups
        .iter()
        .filter_map(|g| g.labels.get("service"))
        .collect();
    assert_eq!(labels, vec!["api", "db"], "stable sort by group key");

    engine.shutdown().await;
}
