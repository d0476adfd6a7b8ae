use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the HTTP server, the on-disk store, logging and
/// the broker's delivery and capacity policy.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub broker: BrokerSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the HTTP API will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Location of the sled database and the bound on the in-process entity cache.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: String,
    /// Maximum cached entries per entity kind. `None` means unbounded.
    pub cache_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// How outstanding messages reach their subscribers.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// The broker POSTs each message to every pending endpoint on a timer.
    Push,
    /// Subscribers fetch their messages on demand.
    Pull,
}

/// What happens when publishing would exceed a message cap.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    Reject,
    EvictOldest,
}

/// Configuration settings for the broker.
///
/// Every `Option` cap uses `None` for "unlimited".
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub delivery_mode: DeliveryMode,
    pub overflow_policy: OverflowPolicy,
    pub max_messages: Option<usize>,
    pub max_messages_per_topic: Option<usize>,
    pub max_message_size: Option<usize>,
    pub max_attribute_count: Option<usize>,
    pub max_subscribers: Option<usize>,
    pub max_subscribers_per_topic: Option<usize>,
    pub max_topics: Option<usize>,
    pub max_topics_per_subscriber: Option<usize>,
    /// Seconds a message may stay outstanding after it was received.
    pub message_lifetime_secs: Option<u64>,
    /// Seconds after the last delivery attempt during which an ack is accepted.
    pub ack_window_secs: Option<u64>,
    pub push_delay_ms: u64,
    pub push_timeout_ms: u64,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub broker: Option<PartialBrokerSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
    pub cache_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Partial broker settings.
///
/// A cap of `0` read from a file or the environment means "unlimited".
/// `ack_window_secs` is not a cap: `0` is a zero-second window.
#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub delivery_mode: Option<DeliveryMode>,
    pub overflow_policy: Option<OverflowPolicy>,
    pub max_messages: Option<usize>,
    pub max_messages_per_topic: Option<usize>,
    pub max_message_size: Option<usize>,
    pub max_attribute_count: Option<usize>,
    pub max_subscribers: Option<usize>,
    pub max_subscribers_per_topic: Option<usize>,
    pub max_topics: Option<usize>,
    pub max_topics_per_subscriber: Option<usize>,
    pub message_lifetime_secs: Option<u64>,
    pub ack_window_secs: Option<u64>,
    pub push_delay_ms: Option<u64>,
    pub push_timeout_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 3301,
            },
            storage: StorageSettings {
                path: "relaymq_db".to_string(),
                cache_capacity: None,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            broker: BrokerSettings::default(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Pull,
            overflow_policy: OverflowPolicy::Reject,
            max_messages: None,
            max_messages_per_topic: None,
            max_message_size: None,
            max_attribute_count: None,
            max_subscribers: None,
            max_subscribers_per_topic: None,
            max_topics: None,
            max_topics_per_subscriber: None,
            message_lifetime_secs: Some(10_000),
            ack_window_secs: None,
            push_delay_ms: 1000,
            push_timeout_ms: 5000,
        }
    }
}

/// Merge an optional cap over its default; `0` switches the cap off.
fn cap<T: PartialEq + Default + Copy>(partial: Option<T>, default: Option<T>) -> Option<T> {
    match partial {
        Some(v) if v == T::default() => None,
        Some(v) => Some(v),
        None => default,
    }
}

impl PartialSettings {
    /// Fill every missing value from `Settings::default()`.
    pub fn merge(self) -> Settings {
        let default = Settings::default();
        let server = self.server.unwrap_or_default();
        let storage = self.storage.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let d = default.broker;

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            storage: StorageSettings {
                path: storage.path.unwrap_or(default.storage.path),
                cache_capacity: cap(storage.cache_capacity, default.storage.cache_capacity),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
            broker: BrokerSettings {
                delivery_mode: broker.delivery_mode.unwrap_or(d.delivery_mode),
                overflow_policy: broker.overflow_policy.unwrap_or(d.overflow_policy),
                max_messages: cap(broker.max_messages, d.max_messages),
                max_messages_per_topic: cap(broker.max_messages_per_topic, d.max_messages_per_topic),
                max_message_size: cap(broker.max_message_size, d.max_message_size),
                max_attribute_count: cap(broker.max_attribute_count, d.max_attribute_count),
                max_subscribers: cap(broker.max_subscribers, d.max_subscribers),
                max_subscribers_per_topic: cap(
                    broker.max_subscribers_per_topic,
                    d.max_subscribers_per_topic,
                ),
                max_topics: cap(broker.max_topics, d.max_topics),
                max_topics_per_subscriber: cap(
                    broker.max_topics_per_subscriber,
                    d.max_topics_per_subscriber,
                ),
                message_lifetime_secs: cap(broker.message_lifetime_secs, d.message_lifetime_secs),
                ack_window_secs: broker.ack_window_secs.or(d.ack_window_secs),
                push_delay_ms: broker.push_delay_ms.unwrap_or(d.push_delay_ms),
                push_timeout_ms: broker.push_timeout_ms.unwrap_or(d.push_timeout_ms),
            },
        }
    }
}
