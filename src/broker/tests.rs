use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use super::message::{Message, MessageId};
use super::subscriber::Subscriber;
use super::tasks::TaskRegistry;
use super::topic::Channel;
use super::{Broker, PublishRequest, now_secs};
use crate::client::recording::RecordingTransport;
use crate::config::{BrokerSettings, DeliveryMode, OverflowPolicy};
use crate::persistence::{Repository, Store};
use crate::utils::error::BrokerError;

fn pull_settings() -> BrokerSettings {
    BrokerSettings::default()
}

fn push_settings() -> BrokerSettings {
    BrokerSettings {
        delivery_mode: DeliveryMode::Push,
        push_delay_ms: 50,
        ..BrokerSettings::default()
    }
}

fn broker_with(settings: BrokerSettings) -> (Arc<Broker>, Arc<RecordingTransport>) {
    let repo = Repository::new(Store::temporary().unwrap(), None);
    let transport = Arc::new(RecordingTransport::new());
    let broker = Broker::open(settings, repo, transport.clone()).unwrap();
    (broker, transport)
}

fn request(topic: &str) -> PublishRequest {
    PublishRequest {
        topic: topic.to_string(),
        data: b"hello".to_vec(),
        ..PublishRequest::default()
    }
}

fn request_at(topic: &str, timestamp: i64) -> PublishRequest {
    PublishRequest {
        timestamp: Some(timestamp),
        ..request(topic)
    }
}

/// Topic `topic` with every endpoint in `endpoints` registered and subscribed.
fn wire(broker: &Broker, topic: &str, endpoints: &[&str]) {
    broker.create_topic(topic).unwrap();
    for endpoint in endpoints {
        if broker.repo().fetch_subscriber(endpoint).unwrap().is_none() {
            broker.add_subscriber(endpoint).unwrap();
        }
        broker.subscribe(endpoint, topic).unwrap();
    }
}

fn queue_of(broker: &Broker, topic: &str) -> Vec<MessageId> {
    broker
        .repo()
        .fetch_channel(topic)
        .unwrap()
        .unwrap()
        .message_queue
}

fn owed_to(broker: &Broker, endpoint: &str) -> Vec<MessageId> {
    broker
        .repo()
        .fetch_subscriber(endpoint)
        .unwrap()
        .unwrap()
        .message_queue
}

// -------------------------------------------------------------------------
// Entities
// -------------------------------------------------------------------------

#[test]
fn test_channel_subscribe_is_deduplicated() {
    let mut channel = Channel::new("news");
    channel.subscribe("http://a".into());
    channel.subscribe("http://a".into());
    assert_eq!(channel.subscribers, vec!["http://a".to_string()]);
    assert!(channel.unsubscribe("http://a"));
    assert!(!channel.unsubscribe("http://a"));
}

#[test]
fn test_subscriber_queue_keeps_order() {
    let mut subscriber = Subscriber::new("http://a");
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
    subscriber.enqueue(first);
    subscriber.enqueue(second);
    assert!(subscriber.dequeue(&first));
    assert!(!subscriber.dequeue(&first));
    assert_eq!(subscriber.message_queue, vec![second]);
}

#[test]
fn test_message_lifetime_and_window() {
    let message = Message {
        id: Uuid::new_v4(),
        topic: "news".into(),
        attributes: Vec::new(),
        data: Vec::new(),
        received_ts: 1_000,
        last_sent_ts: 2_000,
        pending_acks: vec!["http://a".into()],
    };
    assert!(!message.has_expired(None, 1_000_000));
    assert!(!message.has_expired(Some(10), 1_010));
    assert!(message.has_expired(Some(10), 1_011));
    assert!(!message.ack_window_closed(None, 9_999));
    assert!(!message.ack_window_closed(Some(5), 2_005));
    assert!(message.ack_window_closed(Some(5), 2_006));
}

#[test]
fn test_huge_lifetime_and_window_never_close() {
    let message = Message {
        id: Uuid::new_v4(),
        topic: "news".into(),
        attributes: Vec::new(),
        data: Vec::new(),
        received_ts: 1_000,
        last_sent_ts: 2_000,
        pending_acks: vec!["http://a".into()],
    };
    assert!(!message.has_expired(Some(u64::MAX), 1_000_000));
    assert!(!message.has_expired(Some(1 << 63), 1_000_000));
    assert!(!message.ack_window_closed(Some(u64::MAX), 1_000_000));
}

#[test]
fn test_zero_ack_window_closes_after_the_send_second() {
    let message = Message {
        id: Uuid::new_v4(),
        topic: "news".into(),
        attributes: Vec::new(),
        data: Vec::new(),
        received_ts: 1_000,
        last_sent_ts: 2_000,
        pending_acks: vec!["http://a".into()],
    };
    assert!(!message.ack_window_closed(Some(0), 2_000));
    assert!(message.ack_window_closed(Some(0), 2_001));
}

#[test]
fn test_message_serializes_wire_field_names() {
    let message = Message {
        id: Uuid::nil(),
        topic: "news".into(),
        attributes: vec!["a".into()],
        data: vec![1],
        received_ts: 7,
        last_sent_ts: 8,
        pending_acks: vec!["http://a".into()],
    };
    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(json["receivedTS"], 7);
    assert_eq!(json["lastSentTS"], 8);
    assert_eq!(json["pendingAcks"][0], "http://a");
}

// -------------------------------------------------------------------------
// Task registry
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_task_registry_cancel_and_release() {
    let registry = TaskRegistry::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    registry.spawn(a, std::future::pending());
    registry.spawn(b, std::future::pending());
    assert_eq!(registry.len(), 2);

    assert!(registry.cancel(&a));
    assert!(!registry.cancel(&a));
    registry.release(&b);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_task_registry_replaces_existing_task() {
    let registry = TaskRegistry::new();
    let id = Uuid::new_v4();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    registry.spawn(id, async move {
        std::future::pending::<()>().await;
        drop(tx);
    });
    registry.spawn(id, std::future::pending());
    assert_eq!(registry.len(), 1);
    // The replaced task was aborted, which drops its sender.
    assert!(rx.await.is_err());
}

// -------------------------------------------------------------------------
// Topics, subscribers, subscriptions
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_create_topic_rejects_duplicates_and_cap() {
    let (broker, _) = broker_with(BrokerSettings {
        max_topics: Some(1),
        ..pull_settings()
    });
    broker.create_topic("news").unwrap();
    assert!(broker.repo().store().has_topic_bucket("news"));

    let err = broker.create_topic("news").unwrap_err();
    assert!(matches!(err, BrokerError::Capacity(_)));

    let (broker, _) = broker_with(pull_settings());
    broker.create_topic("news").unwrap();
    let err = broker.create_topic("news").unwrap_err();
    assert_eq!(err.to_string(), "Channel already exists");
    assert_eq!(broker.state().unwrap().topic_count, 1);
    assert!(matches!(
        broker.create_topic("").unwrap_err(),
        BrokerError::Validation(_)
    ));
}

#[tokio::test]
async fn test_list_topics_and_topics_for_subscriber() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "sports", &["http://a"]);
    wire(&broker, "news", &[]);
    broker.subscribe("http://a", "news").unwrap();

    assert_eq!(broker.list_topics().unwrap(), vec!["news", "sports"]);
    assert_eq!(broker.topics_for("http://a").unwrap(), vec!["sports", "news"]);
    assert!(matches!(
        broker.topics_for("http://nobody").unwrap_err(),
        BrokerError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_add_subscriber_rejects_duplicates_and_cap() {
    let (broker, _) = broker_with(BrokerSettings {
        max_subscribers: Some(2),
        ..pull_settings()
    });
    broker.add_subscriber("http://a").unwrap();
    assert_eq!(
        broker.add_subscriber("http://a").unwrap_err().to_string(),
        "Subscriber already exists"
    );
    broker.add_subscriber("http://b").unwrap();
    assert!(matches!(
        broker.add_subscriber("http://c").unwrap_err(),
        BrokerError::Capacity(_)
    ));
    assert_eq!(broker.list_subscribers().unwrap(), vec!["http://a", "http://b"]);
    assert_eq!(broker.state().unwrap().subscriber_count, 2);
}

#[tokio::test]
async fn test_subscribe_validates_both_sides() {
    let (broker, _) = broker_with(BrokerSettings {
        max_subscribers_per_topic: Some(1),
        max_topics_per_subscriber: Some(1),
        ..pull_settings()
    });
    broker.create_topic("news").unwrap();
    broker.create_topic("sports").unwrap();
    broker.add_subscriber("http://a").unwrap();
    broker.add_subscriber("http://b").unwrap();

    assert_eq!(
        broker.subscribe("http://x", "news").unwrap_err().to_string(),
        "Subscriber does not exist"
    );
    assert_eq!(
        broker.subscribe("http://a", "weather").unwrap_err().to_string(),
        "Topic channel does not exist"
    );
    assert!(matches!(
        broker.subscribe("", "news").unwrap_err(),
        BrokerError::Validation(_)
    ));

    broker.subscribe("http://a", "news").unwrap();
    assert_eq!(
        broker.subscribe("http://a", "news").unwrap_err().to_string(),
        "Subscriber already subscribed to maximum number of topics"
    );
    assert_eq!(
        broker.subscribe("http://b", "news").unwrap_err().to_string(),
        "Topic already has maximum number of subscribers"
    );
}

#[tokio::test]
async fn test_duplicate_subscription_is_rejected() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "news", &["http://a"]);
    assert_eq!(
        broker.subscribe("http://a", "news").unwrap_err().to_string(),
        "Subscription already exists"
    );
}

#[tokio::test]
async fn test_unsubscribe_keeps_owed_messages() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "news", &["http://a"]);
    let receipt = broker.publish(request("news")).unwrap();

    broker.unsubscribe("http://a", "news").unwrap();
    assert!(broker.topics_for("http://a").unwrap().is_empty());
    assert_eq!(owed_to(&broker, "http://a"), vec![receipt.id]);
    assert_eq!(
        broker.unsubscribe("http://a", "news").unwrap_err().to_string(),
        "Subscription does not exist"
    );
}

// -------------------------------------------------------------------------
// Publish
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_publish_fans_out_to_every_subscriber() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "news", &["http://a", "http://b"]);

    let receipt = broker.publish(request("news")).unwrap();
    assert_eq!(receipt.subscribers, 2);
    assert!(!receipt.id.is_nil());

    let stored = broker.repo().fetch_message(&receipt.id).unwrap().unwrap();
    assert_eq!(stored.pending_acks, vec!["http://a", "http://b"]);
    assert_eq!(stored.received_ts, receipt.timestamp);
    assert_eq!(queue_of(&broker, "news"), vec![receipt.id]);
    assert_eq!(owed_to(&broker, "http://a"), vec![receipt.id]);
    assert_eq!(owed_to(&broker, "http://b"), vec![receipt.id]);
    assert_eq!(broker.state().unwrap().message_count, 1);
}

#[tokio::test]
async fn test_publish_without_subscribers_is_not_stored() {
    let (broker, _) = broker_with(pull_settings());
    broker.create_topic("news").unwrap();

    let receipt = broker.publish(request("news")).unwrap();
    assert_eq!(receipt.subscribers, 0);
    assert!(broker.repo().fetch_message(&receipt.id).unwrap().is_none());
    assert!(queue_of(&broker, "news").is_empty());
    assert_eq!(broker.state().unwrap().message_count, 0);
}

#[tokio::test]
async fn test_publish_without_subscribers_respects_full_global_cap() {
    let (broker, _) = broker_with(BrokerSettings {
        max_messages: Some(1),
        ..pull_settings()
    });
    wire(&broker, "T", &["s1"]);
    broker.create_topic("E").unwrap();
    broker.publish(request("T")).unwrap();

    let err = broker.publish(request("E")).unwrap_err();
    assert_eq!(err.to_string(), "Maximum number of messages in system reached");

    let (broker, _) = broker_with(BrokerSettings {
        max_messages: Some(1),
        overflow_policy: OverflowPolicy::EvictOldest,
        ..pull_settings()
    });
    wire(&broker, "T", &["s1"]);
    broker.create_topic("E").unwrap();
    let kept = broker.publish(request("T")).unwrap();

    assert_eq!(broker.publish(request("E")).unwrap().subscribers, 0);
    assert_eq!(queue_of(&broker, "T"), vec![kept.id]);
}

#[tokio::test]
async fn test_zero_timestamp_means_now() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "T", &["s1"]);
    let before = now_secs();

    let m = broker.publish(request_at("T", 0)).unwrap();
    assert!(m.timestamp >= before);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pulled = broker.pull("s1", &[]).unwrap();
    assert_eq!(pulled.len(), 1);
    assert!(broker.repo().fetch_message(&m.id).unwrap().is_some());
}

#[tokio::test]
async fn test_publish_keeps_supplied_id_and_timestamp() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "news", &["http://a"]);
    let id = Uuid::new_v4();

    let receipt = broker
        .publish(PublishRequest {
            id: Some(id),
            ..request_at("news", 1_234)
        })
        .unwrap();
    assert_eq!(receipt.id, id);
    assert_eq!(receipt.timestamp, 1_234);

    let err = broker
        .publish(PublishRequest {
            id: Some(id),
            ..request("news")
        })
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Duplicate message. UUID already exists in system"
    );
    assert_eq!(broker.state().unwrap().message_count, 1);
}

#[tokio::test]
async fn test_nil_id_is_replaced() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "news", &["http://a"]);
    let receipt = broker
        .publish(PublishRequest {
            id: Some(Uuid::nil()),
            ..request("news")
        })
        .unwrap();
    assert!(!receipt.id.is_nil());
}

#[tokio::test]
async fn test_publish_rejects_invalid_requests_without_side_effects() {
    let (broker, _) = broker_with(BrokerSettings {
        max_attribute_count: Some(2),
        max_message_size: Some(4),
        ..pull_settings()
    });
    wire(&broker, "news", &["http://a"]);

    let too_many = PublishRequest {
        attributes: vec!["a".into(), "b".into(), "c".into()],
        data: Vec::new(),
        ..request("news")
    };
    let err = broker.publish(too_many).unwrap_err();
    assert!(matches!(err, BrokerError::Capacity(_)));
    assert_eq!(err.to_string(), "Message has too many attributes");

    let err = broker.publish(request("news")).unwrap_err();
    assert_eq!(err.to_string(), "Message payload too large");

    let err = broker.publish(request("")).unwrap_err();
    assert_eq!(err.to_string(), "No topic for message");

    let err = broker.publish(PublishRequest {
        data: Vec::new(),
        ..request("weather")
    });
    assert_eq!(err.unwrap_err().to_string(), "Provided topic does not exist");

    assert_eq!(broker.state().unwrap().message_count, 0);
    assert!(queue_of(&broker, "news").is_empty());
    assert!(owed_to(&broker, "http://a").is_empty());
}

#[tokio::test]
async fn test_global_cap_rejects_under_reject_policy() {
    let (broker, _) = broker_with(BrokerSettings {
        max_messages: Some(1),
        ..pull_settings()
    });
    wire(&broker, "news", &["http://a"]);
    broker.publish(request("news")).unwrap();

    let err = broker.publish(request("news")).unwrap_err();
    assert_eq!(err.to_string(), "Maximum number of messages in system reached");
    assert_eq!(queue_of(&broker, "news").len(), 1);
}

#[tokio::test]
async fn test_topic_cap_evicts_oldest() {
    let (broker, _) = broker_with(BrokerSettings {
        max_messages_per_topic: Some(2),
        overflow_policy: OverflowPolicy::EvictOldest,
        ..pull_settings()
    });
    wire(&broker, "T", &["http://s1"]);

    let first = broker.publish(request_at("T", 100)).unwrap();
    let second = broker.publish(request_at("T", 200)).unwrap();
    let third = broker.publish(request_at("T", 300)).unwrap();

    assert_eq!(queue_of(&broker, "T"), vec![second.id, third.id]);
    assert!(broker.repo().fetch_message(&first.id).unwrap().is_none());
    assert_eq!(owed_to(&broker, "http://s1"), vec![second.id, third.id]);
    assert_eq!(broker.state().unwrap().message_count, 2);
}

#[tokio::test]
async fn test_topic_cap_rejects_under_reject_policy() {
    let (broker, _) = broker_with(BrokerSettings {
        max_messages_per_topic: Some(1),
        ..pull_settings()
    });
    wire(&broker, "T", &["http://s1"]);
    broker.publish(request("T")).unwrap();
    assert_eq!(
        broker.publish(request("T")).unwrap_err().to_string(),
        "Topic already has maximum number of messages"
    );
}

#[tokio::test]
async fn test_global_eviction_picks_smallest_timestamp_across_topics() {
    let (broker, _) = broker_with(BrokerSettings {
        max_messages: Some(2),
        overflow_policy: OverflowPolicy::EvictOldest,
        ..pull_settings()
    });
    wire(&broker, "a", &["http://s1"]);
    wire(&broker, "b", &["http://s1"]);

    let newer = broker.publish(request_at("a", 500)).unwrap();
    let oldest = broker.publish(request_at("b", 50)).unwrap();
    let incoming = broker.publish(request_at("a", 900)).unwrap();

    assert!(broker.repo().fetch_message(&oldest.id).unwrap().is_none());
    assert!(queue_of(&broker, "b").is_empty());
    assert_eq!(queue_of(&broker, "a"), vec![newer.id, incoming.id]);
    assert_eq!(broker.state().unwrap().message_count, 2);
}

#[tokio::test]
async fn test_late_subscriber_does_not_receive_earlier_messages() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "news", &["http://a"]);
    let receipt = broker.publish(request("news")).unwrap();

    broker.add_subscriber("http://late").unwrap();
    broker.subscribe("http://late", "news").unwrap();

    assert!(broker.pull("http://late", &[]).unwrap().is_empty());
    let stored = broker.repo().fetch_message(&receipt.id).unwrap().unwrap();
    assert_eq!(stored.pending_acks, vec!["http://a"]);
}

// -------------------------------------------------------------------------
// Pull and acknowledgement
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_pull_then_ack_empties_the_queue() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "T", &["s1"]);
    let m1 = broker.publish(request("T")).unwrap();

    let pulled = broker.pull("s1", &[]).unwrap();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].id, m1.id);
    assert_eq!(pulled[0].data, b"hello".to_vec());
    // Pulling is not destructive.
    assert_eq!(broker.pull("s1", &[]).unwrap().len(), 1);

    let outcome = broker.acknowledge("s1", &m1.id).unwrap();
    assert!(outcome.removed);
    assert_eq!(outcome.remaining, 0);
    assert!(broker.pull("s1", &[]).unwrap().is_empty());
    assert!(broker.repo().fetch_message(&m1.id).unwrap().is_none());
    assert!(queue_of(&broker, "T").is_empty());
    assert_eq!(broker.state().unwrap().message_count, 0);
    assert!(!broker.tasks().contains(&m1.id));
}

#[tokio::test]
async fn test_pull_filters_by_topic() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "news", &["s1"]);
    wire(&broker, "sports", &["s1"]);
    let news = broker.publish(request("news")).unwrap();
    broker.publish(request("sports")).unwrap();

    let pulled = broker.pull("s1", &["news".to_string()]).unwrap();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].id, news.id);
    assert_eq!(broker.pull("s1", &[]).unwrap().len(), 2);
}

#[tokio::test]
async fn test_pull_rejected_in_push_mode() {
    let (broker, _) = broker_with(push_settings());
    broker.add_subscriber("s1").unwrap();
    let err = broker.pull("s1", &[]).unwrap_err();
    assert!(matches!(err, BrokerError::Mode(_)));
    assert_eq!(err.to_string(), "Cannot pull. System is set to push");
}

#[tokio::test]
async fn test_pull_unknown_subscriber() {
    let (broker, _) = broker_with(pull_settings());
    assert_eq!(
        broker.pull("nobody", &[]).unwrap_err().to_string(),
        "Subscriber does not exist"
    );
}

#[tokio::test]
async fn test_pull_stamps_last_sent_only_with_window() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "T", &["s1"]);
    let m = broker.publish(request("T")).unwrap();
    broker.pull("s1", &[]).unwrap();
    let stored = broker.repo().fetch_message(&m.id).unwrap().unwrap();
    assert_eq!(stored.last_sent_ts, 0);

    let (broker, _) = broker_with(BrokerSettings {
        ack_window_secs: Some(60),
        ..pull_settings()
    });
    wire(&broker, "T", &["s1"]);
    let m = broker.publish(request("T")).unwrap();
    let before = now_secs();
    broker.pull("s1", &[]).unwrap();
    let stored = broker.repo().fetch_message(&m.id).unwrap().unwrap();
    assert!(stored.last_sent_ts >= before);
}

#[tokio::test]
async fn test_partial_ack_keeps_message_for_others() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "T", &["s1", "s2"]);
    let m = broker.publish(request("T")).unwrap();

    let outcome = broker.acknowledge("s1", &m.id).unwrap();
    assert!(!outcome.removed);
    assert_eq!(outcome.remaining, 1);
    assert!(owed_to(&broker, "s1").is_empty());
    assert_eq!(owed_to(&broker, "s2"), vec![m.id]);
    assert_eq!(queue_of(&broker, "T"), vec![m.id]);

    assert!(broker.acknowledge("s2", &m.id).unwrap().removed);
    assert!(queue_of(&broker, "T").is_empty());
}

#[tokio::test]
async fn test_second_ack_is_rejected() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "T", &["s1", "s2"]);
    let m = broker.publish(request("T")).unwrap();

    broker.acknowledge("s1", &m.id).unwrap();
    assert_eq!(
        broker.acknowledge("s1", &m.id).unwrap_err().to_string(),
        "Subscriber cannot acknowledge message"
    );

    broker.acknowledge("s2", &m.id).unwrap();
    assert_eq!(
        broker.acknowledge("s2", &m.id).unwrap_err().to_string(),
        "Message does not exist"
    );
}

#[tokio::test]
async fn test_ack_requires_known_subscriber() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "T", &["s1"]);
    let m = broker.publish(request("T")).unwrap();
    assert_eq!(
        broker.acknowledge("ghost", &m.id).unwrap_err().to_string(),
        "Subscriber does not exist"
    );
    broker.add_subscriber("s2").unwrap();
    assert!(matches!(
        broker.acknowledge("s2", &m.id).unwrap_err(),
        BrokerError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_late_ack_is_refused_and_message_stays_owed() {
    let (broker, _) = broker_with(BrokerSettings {
        ack_window_secs: Some(30),
        ..pull_settings()
    });
    wire(&broker, "T", &["s1"]);
    let m = broker.publish(request("T")).unwrap();

    // Never pulled, so the window closed long ago.
    let err = broker.acknowledge("s1", &m.id).unwrap_err();
    assert!(matches!(err, BrokerError::Window(_)));
    assert_eq!(owed_to(&broker, "s1"), vec![m.id]);
    let stored = broker.repo().fetch_message(&m.id).unwrap().unwrap();
    assert_eq!(stored.pending_acks, vec!["s1"]);

    broker.pull("s1", &[]).unwrap();
    assert!(broker.acknowledge("s1", &m.id).unwrap().removed);
}

// -------------------------------------------------------------------------
// Removal paths
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_expire_message_purges_unconditionally() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "T", &["s1", "s2"]);
    let m = broker.publish(request("T")).unwrap();
    assert!(broker.tasks().contains(&m.id));

    assert!(broker.expire_message(&m.id).unwrap());
    assert!(owed_to(&broker, "s1").is_empty());
    assert!(owed_to(&broker, "s2").is_empty());
    assert!(queue_of(&broker, "T").is_empty());
    assert_eq!(broker.state().unwrap().message_count, 0);
    assert!(!broker.tasks().contains(&m.id));

    assert!(!broker.expire_message(&m.id).unwrap());
    assert_eq!(broker.state().unwrap().message_count, 0);
}

#[tokio::test]
async fn test_pull_expiry_timer_removes_message() {
    let (broker, _) = broker_with(BrokerSettings {
        message_lifetime_secs: Some(1),
        ..pull_settings()
    });
    wire(&broker, "T", &["s1"]);
    let m = broker.publish(request_at("T", now_secs() - 10)).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(broker.repo().fetch_message(&m.id).unwrap().is_none());
    assert!(owed_to(&broker, "s1").is_empty());
    assert_eq!(broker.state().unwrap().message_count, 0);
    assert!(!broker.tasks().contains(&m.id));
}

#[tokio::test]
async fn test_no_expiry_when_lifetime_disabled() {
    let (broker, _) = broker_with(BrokerSettings {
        message_lifetime_secs: None,
        ..pull_settings()
    });
    wire(&broker, "T", &["s1"]);
    let m = broker.publish(request_at("T", 0)).unwrap();
    assert!(!broker.tasks().contains(&m.id));
}

#[tokio::test]
async fn test_remove_subscriber_releases_its_messages() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "T", &["s1", "s2"]);
    let shared = broker.publish(request("T")).unwrap();
    broker.unsubscribe("s2", "T").unwrap();
    let solo = broker.publish(request("T")).unwrap();

    broker.remove_subscriber("s1").unwrap();

    let channel = broker.repo().fetch_channel("T").unwrap().unwrap();
    assert_eq!(channel.subscribers, Vec::<String>::new());
    assert_eq!(channel.message_queue, vec![shared.id]);
    let stored = broker.repo().fetch_message(&shared.id).unwrap().unwrap();
    assert_eq!(stored.pending_acks, vec!["s2"]);
    assert!(broker.repo().fetch_message(&solo.id).unwrap().is_none());

    let state = broker.state().unwrap();
    assert_eq!(state.subscriber_count, 1);
    assert_eq!(state.message_count, 1);
    assert_eq!(
        broker.remove_subscriber("s1").unwrap_err().to_string(),
        "Subscriber does not exist"
    );
}

#[tokio::test]
async fn test_delete_topic_purges_messages_and_subscriptions() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "T", &["s1"]);
    wire(&broker, "U", &["s1"]);
    let gone = broker.publish(request("T")).unwrap();
    let kept = broker.publish(request("U")).unwrap();

    broker.delete_topic("T").unwrap();

    assert!(broker.repo().fetch_channel("T").unwrap().is_none());
    assert!(!broker.repo().store().has_topic_bucket("T"));
    assert!(broker.repo().fetch_message(&gone.id).unwrap().is_none());
    assert_eq!(owed_to(&broker, "s1"), vec![kept.id]);
    assert_eq!(broker.topics_for("s1").unwrap(), vec!["U"]);

    let state = broker.state().unwrap();
    assert_eq!(state.topic_count, 1);
    assert_eq!(state.message_count, 1);
    assert_eq!(
        broker.delete_topic("T").unwrap_err().to_string(),
        "Channel does not exist"
    );
}

// -------------------------------------------------------------------------
// Push delivery
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_push_delivers_to_every_pending_endpoint() {
    let (broker, transport) = broker_with(push_settings());
    wire(&broker, "T", &["http://a", "http://b"]);
    transport.refuse("http://a");

    let m = broker.publish(request("T")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(transport.count_for("http://a", &m.id) >= 2);
    assert!(transport.count_for("http://b", &m.id) >= 2);
    let stored = broker.repo().fetch_message(&m.id).unwrap().unwrap();
    assert!(stored.last_sent_ts > 0);
}

#[tokio::test]
async fn test_push_stops_once_acknowledged() {
    let (broker, transport) = broker_with(BrokerSettings {
        ack_window_secs: Some(60),
        ..push_settings()
    });
    wire(&broker, "T", &["http://a"]);
    let m = broker.publish(request("T")).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(broker.acknowledge("http://a", &m.id).unwrap().removed);
    assert!(!broker.tasks().contains(&m.id));

    let delivered = transport.count_for("http://a", &m.id);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.count_for("http://a", &m.id), delivered);
}

#[tokio::test]
async fn test_ack_during_first_slow_push_is_accepted() {
    let repo = Repository::new(Store::temporary().unwrap(), None);
    let transport = Arc::new(RecordingTransport::slow(Duration::from_millis(300)));
    let broker = Broker::open(
        BrokerSettings {
            ack_window_secs: Some(60),
            ..push_settings()
        },
        repo,
        transport,
    )
    .unwrap();
    wire(&broker, "T", &["http://a"]);

    let m = broker.publish(request("T")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = broker.repo().fetch_message(&m.id).unwrap().unwrap();
    assert!(stored.last_sent_ts > 0);
    assert!(broker.acknowledge("http://a", &m.id).unwrap().removed);
}

#[tokio::test]
async fn test_push_stops_after_acknowledged_partially_then_fully() {
    let (broker, transport) = broker_with(push_settings());
    wire(&broker, "T", &["http://a", "http://b"]);
    let m = broker.publish(request("T")).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    broker.acknowledge("http://a", &m.id).unwrap();
    let to_a = transport.count_for("http://a", &m.id);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(transport.count_for("http://a", &m.id), to_a);
    assert!(transport.count_for("http://b", &m.id) >= 2);
}

#[tokio::test]
async fn test_push_expires_message_past_lifetime() {
    let (broker, transport) = broker_with(BrokerSettings {
        message_lifetime_secs: Some(1),
        ..push_settings()
    });
    wire(&broker, "T", &["http://a"]);
    let m = broker.publish(request_at("T", now_secs() - 10)).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(transport.deliveries().is_empty());
    assert!(broker.repo().fetch_message(&m.id).unwrap().is_none());
    assert!(owed_to(&broker, "http://a").is_empty());
    assert_eq!(broker.state().unwrap().message_count, 0);
    assert!(!broker.tasks().contains(&m.id));
}

// -------------------------------------------------------------------------
// Restart
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_state_and_messages_survive_restart() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("db");
    let settings = BrokerSettings {
        message_lifetime_secs: None,
        ..pull_settings()
    };

    let published = {
        let repo = Repository::new(Store::open(&path).unwrap(), None);
        let broker = Broker::open(settings.clone(), repo, Arc::new(RecordingTransport::new())).unwrap();
        wire(&broker, "T", &["s1"]);
        let receipt = broker.publish(request("T")).unwrap();
        broker.shutdown().unwrap();
        receipt
    };

    let repo = Repository::new(Store::open(&path).unwrap(), None);
    let broker = Broker::open(settings, repo, Arc::new(RecordingTransport::new())).unwrap();
    let state = broker.state().unwrap();
    assert_eq!(state.topic_count, 1);
    assert_eq!(state.subscriber_count, 1);
    assert_eq!(state.message_count, 1);

    let pulled = broker.pull("s1", &[]).unwrap();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].id, published.id);
    assert_eq!(broker.resume().unwrap(), 1);
}

#[tokio::test]
async fn test_resume_rearms_delivery_tasks() {
    let (broker, _) = broker_with(pull_settings());
    wire(&broker, "T", &["s1"]);
    let m = broker.publish(request("T")).unwrap();
    broker.tasks().cancel(&m.id);
    assert!(!broker.tasks().contains(&m.id));

    assert_eq!(broker.resume().unwrap(), 1);
    assert!(broker.tasks().contains(&m.id));
}

#[tokio::test]
async fn test_generated_ids_are_unique() {
    let (broker, _) = broker_with(pull_settings());
    let a = broker.generate_id();
    let b = broker.generate_id();
    assert_ne!(a, b);
    assert!(!a.is_nil());
}
