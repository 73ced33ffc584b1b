use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::mpsc::Receiver;
use tokio::time::timeout;

use super::codec::{self, CodecError};
use super::hub::validate_channel_name;
use super::*;
use crate::broker::{
    Broker, BrokerResult, Delivery, MemoryBroker, Subscription, SubscriptionOptions,
};
use crate::utils::RelayError;

const WAIT: Duration = Duration::from_secs(2);

fn message_at(author: &str, text: &str, secs: i64) -> Arc<ChatMessage> {
    let ts = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
    Arc::new(ChatMessage::compose(author, text, ts, &HtmlSanitizer).unwrap())
}

fn delivery(value: serde_json::Value) -> Delivery {
    Delivery {
        id: "d1".to_string(),
        data: value.to_string().into_bytes(),
        publish_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }
}

fn config(preload_ms: u64) -> SessionConfig {
    SessionConfig {
        history_capacity: MAX_MESSAGE_CACHE_LENGTH,
        preload: Duration::from_millis(preload_ms),
        subscription: SubscriptionOptions::default(),
    }
}

/// Wraps the memory broker, counting subscription set-ups and publishes.
struct CountingBroker {
    inner: MemoryBroker,
    subscription_calls: AtomicUsize,
    publishes: AtomicUsize,
    open_delay: Duration,
}

impl CountingBroker {
    fn new(open_delay: Duration) -> Self {
        Self {
            inner: MemoryBroker::temporary().unwrap(),
            subscription_calls: AtomicUsize::new(0),
            publishes: AtomicUsize::new(0),
            open_delay,
        }
    }
}

#[async_trait]
impl Broker for CountingBroker {
    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool> {
        self.inner.topic_exists(topic).await
    }

    async fn list_topics(&self) -> BrokerResult<Vec<String>> {
        self.inner.list_topics().await
    }

    async fn create_topic(&self, topic: &str) -> BrokerResult<()> {
        self.inner.create_topic(topic).await
    }

    async fn subscription_exists(&self, name: &str) -> BrokerResult<bool> {
        self.inner.subscription_exists(name).await
    }

    async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        options: SubscriptionOptions,
    ) -> BrokerResult<Subscription> {
        self.subscription_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.open_delay).await;
        self.inner.create_subscription(topic, name, options).await
    }

    async fn open_subscription(&self, name: &str) -> BrokerResult<Subscription> {
        self.subscription_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.open_delay).await;
        self.inner.open_subscription(name).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<String> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        self.inner.publish(topic, payload).await
    }
}

async fn setup(preload_ms: u64, channels: &[&str]) -> (Arc<CountingBroker>, Arc<ChannelHub>) {
    let broker = Arc::new(CountingBroker::new(Duration::from_millis(20)));
    for channel in channels {
        broker.create_topic(channel).await.unwrap();
    }
    let hub = Arc::new(ChannelHub::new(broker.clone(), config(preload_ms)));
    (broker, hub)
}

async fn publish_raw(broker: &CountingBroker, channel: &str, value: serde_json::Value) {
    broker
        .publish(channel, value.to_string().into_bytes())
        .await
        .unwrap();
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_text(rx: &mut Receiver<Arc<ChatMessage>>) -> String {
    timeout(WAIT, rx.recv())
        .await
        .expect("no message in time")
        .expect("sink closed")
        .text()
        .to_string()
}

async fn assert_quiet(rx: &mut Receiver<Arc<ChatMessage>>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "viewer received an unexpected message");
}

// -- codec --

#[test]
fn decode_accepts_plain_and_named_authors() {
    let plain = codec::decode(
        &delivery(json!({"author": "bob", "message": "hi", "timestamp": "2023-06-01T10:00:00.000Z"})),
        &HtmlSanitizer,
    )
    .unwrap();
    assert_eq!(plain.author(), "bob");
    assert_eq!(plain.text(), "hi");
    assert_eq!(
        plain.timestamp(),
        Utc.with_ymd_and_hms(2023, 6, 1, 10, 0, 0).unwrap()
    );

    let named = codec::decode(
        &delivery(json!({"author": {"name": "amy"}, "message": "yo"})),
        &HtmlSanitizer,
    )
    .unwrap();
    assert_eq!(named.author(), "amy");
}

#[test]
fn decode_rejects_incomplete_payloads() {
    let missing_author = codec::decode(&delivery(json!({"message": "hi"})), &HtmlSanitizer);
    assert!(matches!(missing_author, Err(CodecError::MissingAuthor)));

    let missing_message = codec::decode(&delivery(json!({"author": "bob"})), &HtmlSanitizer);
    assert!(matches!(missing_message, Err(CodecError::MissingMessage)));

    let garbage = Delivery {
        data: b"not json".to_vec(),
        ..delivery(json!({}))
    };
    assert!(matches!(
        codec::decode(&garbage, &HtmlSanitizer),
        Err(CodecError::Malformed(_))
    ));
    assert!(codec::validate(&garbage, &HtmlSanitizer).is_none());
}

#[test]
fn decode_sanitizes_text() {
    let msg = codec::decode(
        &delivery(json!({"author": "bob", "message": "<script>alert(1)</script><b>hi</b>"})),
        &HtmlSanitizer,
    )
    .unwrap();
    assert_eq!(msg.text(), "<b>hi</b>");

    let only_script = codec::decode(
        &delivery(json!({"author": "bob", "message": "<script>alert(1)</script>"})),
        &HtmlSanitizer,
    );
    assert!(matches!(only_script, Err(CodecError::Empty)));
}

#[test]
fn decode_falls_back_to_publish_time() {
    let d = delivery(json!({"author": "bob", "message": "hi", "timestamp": "yesterday"}));
    let msg = codec::decode(&d, &HtmlSanitizer).unwrap();
    assert_eq!(msg.timestamp(), d.publish_time);
}

#[test]
fn wire_shape_uses_message_and_iso_timestamp() {
    let msg = message_at("bob", "hi", 0);
    let value: serde_json::Value = serde_json::from_slice(&codec::encode(&msg).unwrap()).unwrap();
    assert_eq!(value["author"], "bob");
    assert_eq!(value["message"], "hi");
    assert_eq!(value["timestamp"], "2023-11-14T22:13:20Z");
}

#[test]
fn wire_messages_need_author_and_text() {
    let ok: ChatMessage = serde_json::from_value(
        json!({"author": " bob ", "message": "hi", "timestamp": "2023-11-14T22:13:20Z"}),
    )
    .unwrap();
    assert_eq!(ok.author(), "bob");

    for bad in [
        json!({"author": "  ", "message": "hi", "timestamp": "2023-11-14T22:13:20Z"}),
        json!({"author": "bob", "message": "", "timestamp": "2023-11-14T22:13:20Z"}),
    ] {
        assert!(serde_json::from_value::<ChatMessage>(bad).is_err());
    }
}

// -- history --

#[test]
fn history_never_exceeds_capacity_and_evicts_oldest() {
    let mut cache = HistoryCache::default();
    for i in 0..120 {
        cache.append(message_at("bob", &format!("m{i}"), i));
        assert!(cache.len() <= MAX_MESSAGE_CACHE_LENGTH);
    }

    let texts: Vec<_> = cache.snapshot().iter().map(|m| m.text().to_string()).collect();
    assert_eq!(texts.len(), 50);
    assert_eq!(texts.first().unwrap(), "m70");
    assert_eq!(texts.last().unwrap(), "m119");
}

#[test]
fn history_snapshot_is_arrival_order_sorted_snapshot_is_timestamp_order() {
    let mut cache = HistoryCache::new(10);
    cache.append(message_at("a", "late", 30));
    cache.append(message_at("b", "early", 10));
    cache.append(message_at("c", "middle", 20));

    let arrival: Vec<_> = cache.snapshot().iter().map(|m| m.text().to_string()).collect();
    assert_eq!(arrival, vec!["late", "early", "middle"]);

    let sorted: Vec<_> = cache
        .sorted_snapshot()
        .iter()
        .map(|m| m.text().to_string())
        .collect();
    assert_eq!(sorted, vec!["early", "middle", "late"]);
}

// -- viewers --

#[test]
fn registry_counts_follow_attach_and_detach() {
    let mut registry = ViewerRegistry::new();
    let (a, _rx_a) = ViewerSink::channel(4);
    let (b, _rx_b) = ViewerSink::channel(4);
    let a_id = a.id().clone();
    let before = registry.last_accessed();

    registry.attach(a);
    registry.attach(b);
    assert_eq!(registry.active_count(), 2);
    assert!(registry.last_accessed() >= before);

    assert!(registry.detach(&a_id));
    assert!(!registry.detach(&a_id));
    assert_eq!(registry.active_count(), 1);
    assert!(!registry.contains(&a_id));
}

#[test]
fn broadcast_isolates_full_and_closed_sinks() {
    let mut registry = ViewerRegistry::new();
    let (slow, _slow_rx) = ViewerSink::channel(1);
    let (gone, gone_rx) = ViewerSink::channel(4);
    let (fast, mut fast_rx) = ViewerSink::channel(4);
    let gone_id = gone.id().clone();
    registry.attach(slow);
    registry.attach(gone);
    registry.attach(fast);
    drop(gone_rx);

    let first = registry.broadcast(&message_at("bob", "one", 0));
    assert_eq!(first.delivered, 2);
    assert_eq!(first.removed, vec![gone_id.clone()]);
    assert_eq!(registry.active_count(), 2);

    let second = registry.broadcast(&message_at("bob", "two", 1));
    assert_eq!(second.delivered, 1);
    assert_eq!(second.lagged, 1);

    assert_eq!(fast_rx.try_recv().unwrap().text(), "one");
    assert_eq!(fast_rx.try_recv().unwrap().text(), "two");
}

// -- hub / session --

#[test]
fn channel_names_are_validated() {
    assert!(validate_channel_name("general").is_ok());
    assert!(validate_channel_name("team.dev-1_x").is_ok());
    assert!(validate_channel_name("").is_err());
    assert!(validate_channel_name("has space").is_err());
    assert!(validate_channel_name(&"x".repeat(65)).is_err());
}

#[tokio::test]
async fn concurrent_first_attaches_open_one_subscription() {
    let (broker, hub) = setup(20, &["general"]).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let hub = hub.clone();
        handles.push(tokio::spawn(async move {
            let (sink, rx) = ViewerSink::channel(8);
            hub.attach("general", sink).await.map(|_| rx)
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(broker.subscription_calls.load(Ordering::SeqCst), 1);
    assert_eq!(hub.stats("general").unwrap().active_viewers, 8);
}

#[tokio::test]
async fn preload_caches_without_fanning_out() {
    let (broker, hub) = setup(300, &["general"]).await;

    let (v1, mut rx1) = ViewerSink::channel(16);
    let creator = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.attach("general", v1).await })
    };
    wait_until(|| hub.session("general").is_some()).await;
    let session = hub.session("general").unwrap();
    assert_eq!(session.phase(), SessionPhase::Preloading);

    // a second viewer finds the session already there and registers at once
    let (v2, mut rx2) = ViewerSink::channel(16);
    hub.attach("general", v2).await.unwrap();

    for i in 0..3 {
        publish_raw(&broker, "general", json!({"author": "bob", "message": format!("old{i}")})).await;
    }
    wait_until(|| session.stats().cached == 3).await;
    assert_quiet(&mut rx2).await;

    let history = creator.await.unwrap().unwrap();
    assert_eq!(history.len(), 3);
    session.wait_live().await;
    assert_eq!(session.phase(), SessionPhase::Live);

    publish_raw(&broker, "general", json!({"author": "amy", "message": "new"})).await;
    assert_eq!(next_text(&mut rx1).await, "new");
    assert_eq!(next_text(&mut rx2).await, "new");
    assert_eq!(session.stats().cached, 4);
}

#[tokio::test]
async fn scenario_history_then_live() {
    let (broker, hub) = setup(300, &["general"]).await;

    let (v1, mut rx1) = ViewerSink::channel(16);
    let attach = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.attach("general", v1).await })
    };
    wait_until(|| hub.session("general").is_some()).await;

    publish_raw(
        &broker,
        "general",
        json!({"author": "bob", "message": "hi", "timestamp": Utc::now().to_rfc3339()}),
    )
    .await;

    let history = attach.await.unwrap().unwrap();
    let texts: Vec<_> = history.iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["hi"]);
    assert_quiet(&mut rx1).await;

    publish_raw(
        &broker,
        "general",
        json!({"author": "amy", "message": "yo", "timestamp": Utc::now().to_rfc3339()}),
    )
    .await;
    assert_eq!(next_text(&mut rx1).await, "yo");
    assert_quiet(&mut rx1).await;
}

#[tokio::test]
async fn attach_replays_history_sorted_by_timestamp() {
    let (broker, hub) = setup(0, &["general"]).await;
    let (v1, _rx1) = ViewerSink::channel(16);
    hub.attach("general", v1).await.unwrap();
    let session = hub.session("general").unwrap();

    for (text, ts) in [
        ("third", "2024-01-01T00:00:03Z"),
        ("first", "2024-01-01T00:00:01Z"),
        ("second", "2024-01-01T00:00:02Z"),
    ] {
        publish_raw(&broker, "general", json!({"author": "bob", "message": text, "timestamp": ts})).await;
    }
    wait_until(|| session.stats().cached == 3).await;

    let (v2, _rx2) = ViewerSink::channel(16);
    let history = hub.attach("general", v2).await.unwrap();
    let texts: Vec<_> = history.iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);

    let arrival: Vec<_> = session.history().iter().map(|m| m.text().to_string()).collect();
    assert_eq!(arrival, vec!["third", "first", "second"]);
}

#[tokio::test]
async fn malformed_delivery_never_reaches_cache_or_viewers() {
    let (broker, hub) = setup(0, &["general"]).await;
    let (v1, mut rx1) = ViewerSink::channel(16);
    hub.attach("general", v1).await.unwrap();
    let session = hub.session("general").unwrap();

    publish_raw(&broker, "general", json!({"message": "who am i"})).await;
    broker.publish("general", b"{{{".to_vec()).await.unwrap();
    publish_raw(&broker, "general", json!({"author": "bob", "message": "valid"})).await;

    assert_eq!(next_text(&mut rx1).await, "valid");
    assert_quiet(&mut rx1).await;
    let cached: Vec<_> = session.history().iter().map(|m| m.text().to_string()).collect();
    assert_eq!(cached, vec!["valid"]);
}

#[tokio::test]
async fn detach_stops_only_that_viewer() {
    let (broker, hub) = setup(0, &["general"]).await;
    let (v1, mut rx1) = ViewerSink::channel(16);
    let (v2, mut rx2) = ViewerSink::channel(16);
    let v1_id = v1.id().clone();
    hub.attach("general", v1).await.unwrap();
    hub.attach("general", v2).await.unwrap();

    publish_raw(&broker, "general", json!({"author": "bob", "message": "both"})).await;
    assert_eq!(next_text(&mut rx1).await, "both");
    assert_eq!(next_text(&mut rx2).await, "both");

    assert!(hub.detach("general", &v1_id));
    assert_eq!(hub.stats("general").unwrap().active_viewers, 1);

    publish_raw(&broker, "general", json!({"author": "bob", "message": "only two"})).await;
    assert_eq!(next_text(&mut rx2).await, "only two");
    assert_quiet(&mut rx1).await;
}

#[tokio::test]
async fn dropped_viewer_is_detached_implicitly() {
    let (broker, hub) = setup(0, &["general"]).await;
    let (v1, rx1) = ViewerSink::channel(16);
    let (v2, mut rx2) = ViewerSink::channel(16);
    hub.attach("general", v1).await.unwrap();
    hub.attach("general", v2).await.unwrap();
    drop(rx1);

    publish_raw(&broker, "general", json!({"author": "bob", "message": "hello"})).await;
    assert_eq!(next_text(&mut rx2).await, "hello");
    wait_until(|| hub.stats("general").unwrap().active_viewers == 1).await;
}

#[tokio::test]
async fn detach_without_session_is_noop() {
    let (_broker, hub) = setup(0, &[]).await;
    assert!(!hub.detach("nowhere", &"viewer".to_string()));
    assert!(hub.stats("nowhere").is_none());
}

#[tokio::test]
async fn unavailable_channel_fails_without_poisoning_hub() {
    let (broker, hub) = setup(0, &["general"]).await;

    let (sink, _rx) = ViewerSink::channel(4);
    let err = hub.attach("missing", sink).await.unwrap_err();
    assert!(matches!(err, RelayError::ChannelUnavailable { ref channel, .. } if channel == "missing"));
    assert!(hub.session("missing").is_none());
    assert!(hub.stats("missing").is_none());

    let (sink, _rx) = ViewerSink::channel(4);
    hub.attach("general", sink).await.unwrap();

    broker.create_topic("missing").await.unwrap();
    let (sink, _rx) = ViewerSink::channel(4);
    hub.attach("missing", sink).await.unwrap();
    assert!(hub.session("missing").is_some());
}

#[tokio::test]
async fn post_to_missing_channel_is_not_found_and_has_no_effect() {
    let (broker, hub) = setup(0, &["general"]).await;

    let err = hub.post("ghost", "guest-1", "boo").await.unwrap_err();
    assert!(matches!(err, RelayError::NotFound(ref c) if c == "ghost"));
    assert_eq!(broker.publishes.load(Ordering::SeqCst), 0);
    assert_eq!(hub.list_channels().await.unwrap(), vec!["general"]);
}

#[tokio::test]
async fn post_reaches_attached_viewers_sanitized() {
    let (broker, hub) = setup(0, &["general"]).await;
    let (v1, mut rx1) = ViewerSink::channel(16);
    hub.attach("general", v1).await.unwrap();

    let posted = hub
        .post("general", "guest-1", "hello <img src=x onerror=alert(1)>")
        .await
        .unwrap();
    assert_eq!(posted.author(), "guest-1");
    assert!(!posted.text().contains("onerror"));
    assert_eq!(broker.publishes.load(Ordering::SeqCst), 1);

    let received = timeout(WAIT, rx1.recv()).await.unwrap().unwrap();
    assert_eq!(*received, posted);
}

#[tokio::test]
async fn post_rejects_empty_text() {
    let (broker, hub) = setup(0, &["general"]).await;
    let err = hub.post("general", "guest-1", "   ").await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidMessage(_)));
    assert_eq!(broker.publishes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn create_channel_twice_is_conflict() {
    let (_broker, hub) = setup(0, &[]).await;
    hub.create_channel("general").await.unwrap();
    let err = hub.create_channel("general").await.unwrap_err();
    assert!(matches!(err, RelayError::AlreadyExists(_)));

    let err = hub.create_channel("bad name").await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidChannelName(_)));
}

#[tokio::test]
async fn shutdown_hands_messages_back_to_broker() {
    let broker = Arc::new(MemoryBroker::temporary().unwrap());
    broker.create_topic("general").await.unwrap();
    let hub = ChannelHub::new(broker.clone(), config(0));

    let (v1, _rx1) = ViewerSink::channel(4);
    hub.attach("general", v1).await.unwrap();
    hub.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;

    broker.publish("general", b"{}".to_vec()).await.unwrap();
    assert_eq!(broker.backlog_len("general-relay").unwrap(), 1);
}

#[tokio::test]
async fn get_or_create_session_reuses_the_warm_session() {
    let (broker, hub) = setup(0, &["general"]).await;

    let first = hub.get_or_create_session("general").await.unwrap();
    let again = hub.get_or_create_session("general").await.unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(first.channel(), "general");
    assert_eq!(first.subscription(), "general-relay");
    assert_eq!(broker.subscription_calls.load(Ordering::SeqCst), 1);
    assert_eq!(HistoryCache::default().capacity(), MAX_MESSAGE_CACHE_LENGTH);
}

#[tokio::test]
async fn failed_opens_leave_no_entries_behind() {
    let (_broker, hub) = setup(0, &[]).await;

    for i in 0..20 {
        let (sink, _rx) = ViewerSink::channel(1);
        assert!(hub.attach(&format!("bogus{i}"), sink).await.is_err());
    }

    assert!(hub.stats("bogus0").is_none());
    assert!(format!("{hub:?}").contains("channels: 0"));
}

#[tokio::test]
async fn stats_report_opening_while_subscription_is_set_up() {
    let broker = Arc::new(CountingBroker::new(Duration::from_millis(300)));
    broker.create_topic("general").await.unwrap();
    let hub = Arc::new(ChannelHub::new(broker.clone(), config(0)));

    let attach = {
        let hub = hub.clone();
        tokio::spawn(async move {
            let (sink, rx) = ViewerSink::channel(4);
            hub.attach("general", sink).await.map(|_| rx)
        })
    };

    wait_until(|| hub.stats("general").is_some()).await;
    assert_eq!(hub.stats("general").unwrap().phase, SessionPhase::Opening);

    let _rx = attach.await.unwrap().unwrap();
    let stats = hub.stats("general").unwrap();
    assert_eq!(stats.phase, SessionPhase::Live);
    assert_eq!(stats.active_viewers, 1);
}

#[tokio::test]
async fn cancelled_creator_attach_does_not_stall_preload() {
    let (_broker, hub) = setup(200, &["general"]).await;

    let attach = {
        let hub = hub.clone();
        tokio::spawn(async move {
            let (sink, _rx) = ViewerSink::channel(4);
            let _ = hub.attach("general", sink).await;
        })
    };

    wait_until(|| hub.session("general").is_some()).await;
    attach.abort();

    let session = hub.session("general").unwrap();
    wait_until(|| session.phase() == SessionPhase::Live).await;
    assert_eq!(hub.stats("general").unwrap().active_viewers, 0);
}
