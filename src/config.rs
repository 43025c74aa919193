//! Configuration types for the DriftMQ consumer client

use crate::collaborators::ConsumerInterceptors;
use crate::crypto::{CryptoFailureAction, CryptoKeyReader, MessageCrypto};
use crate::error::DriftmqClientError;
use crate::message::MessageId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// How the broker dispatches messages among the subscription's consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionType {
    /// Only one consumer attached to the subscription
    #[default]
    Exclusive,
    /// Messages spread round-robin across consumers
    Shared,
    /// One active consumer, others standing by
    Failover,
    /// Messages partitioned by key across consumers
    KeyShared,
}

/// Where a brand new subscription starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialPosition {
    /// Start from the newest available message
    #[default]
    Latest,
    /// Start from the oldest available message
    Earliest,
}

/// Whether the broker persists the subscription cursor across disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionMode {
    /// Cursor retained and persisted by the broker
    #[default]
    Durable,
    /// Lightweight subscription without a durable cursor
    NonDurable,
}

/// Key-shared dispatch policy
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeySharedPolicy {
    pub mode: KeySharedMode,
    /// Sticky hash ranges; only consulted in [`KeySharedMode::Sticky`]
    pub hash_ranges: Vec<HashRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeySharedMode {
    #[default]
    AutoSplit,
    Sticky,
}

/// Inclusive hash range claimed by a sticky key-shared consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRange {
    pub start: u32,
    pub end: u32,
}

/// Schema description attached to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaInfo {
    pub name: String,
    pub schema_type: i32,
    pub schema: Vec<u8>,
    pub properties: HashMap<String, String>,
}

/// Options controlling a single partition consumer
#[derive(Clone)]
pub struct ConsumerOptions {
    /// Fully qualified topic (single partition)
    pub topic: String,
    /// Client-side consumer name; the broker may assign one if empty
    pub consumer_name: String,
    /// Subscription name
    pub subscription: String,
    pub subscription_type: SubscriptionType,
    pub initial_position: InitialPosition,
    /// Index of this partition within the parent topic
    pub partition_index: i32,
    /// Capacity of the prefetch queue; must be greater than zero
    pub receiver_queue_size: usize,
    /// Delay before negatively acknowledged messages are redelivered
    pub nack_redelivery_delay: Duration,
    /// Subscription properties forwarded to the broker
    pub metadata: HashMap<String, String>,
    pub replicate_subscription_state: bool,
    /// Position to resume from; `None` lets the initial position decide
    pub start_message_id: Option<MessageId>,
    /// Deliver the start message itself rather than the one after it
    pub start_message_id_inclusive: bool,
    pub subscription_mode: SubscriptionMode,
    pub read_compacted: bool,
    /// Suppress automatic topic creation on subscribe
    pub disable_force_topic_creation: bool,
    /// Reconnection attempts after a session loss; `None` is unlimited,
    /// `Some(0)` disables reconnection entirely
    pub max_reconnect_to_broker: Option<u32>,
    pub key_shared_policy: Option<KeySharedPolicy>,
    pub schema: Option<Arc<SchemaInfo>>,
    pub key_reader: Option<Arc<dyn CryptoKeyReader>>,
    pub message_crypto: Option<Arc<dyn MessageCrypto>>,
    pub crypto_failure_action: CryptoFailureAction,
    pub interceptors: ConsumerInterceptors,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            topic: String::new(),
            consumer_name: String::new(),
            subscription: String::new(),
            subscription_type: SubscriptionType::default(),
            initial_position: InitialPosition::default(),
            partition_index: 0,
            receiver_queue_size: 1000,
            nack_redelivery_delay: Duration::from_secs(60),
            metadata: HashMap::new(),
            replicate_subscription_state: false,
            start_message_id: None,
            start_message_id_inclusive: false,
            subscription_mode: SubscriptionMode::default(),
            read_compacted: false,
            disable_force_topic_creation: false,
            max_reconnect_to_broker: None,
            key_shared_policy: None,
            schema: None,
            key_reader: None,
            message_crypto: None,
            crypto_failure_action: CryptoFailureAction::default(),
            interceptors: ConsumerInterceptors::default(),
        }
    }
}

/// Builder for [`ConsumerOptions`]
#[derive(Default)]
pub struct ConsumerOptionsBuilder {
    options: ConsumerOptions,
}

impl ConsumerOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.options.topic = topic.into();
        self
    }

    pub fn consumer_name<S: Into<String>>(mut self, name: S) -> Self {
        self.options.consumer_name = name.into();
        self
    }

    pub fn subscription<S: Into<String>>(mut self, subscription: S) -> Self {
        self.options.subscription = subscription.into();
        self
    }

    pub fn subscription_type(mut self, subscription_type: SubscriptionType) -> Self {
        self.options.subscription_type = subscription_type;
        self
    }

    pub fn initial_position(mut self, position: InitialPosition) -> Self {
        self.options.initial_position = position;
        self
    }

    pub fn partition_index(mut self, index: i32) -> Self {
        self.options.partition_index = index;
        self
    }

    pub fn receiver_queue_size(mut self, size: usize) -> Self {
        self.options.receiver_queue_size = size;
        self
    }

    pub fn nack_redelivery_delay(mut self, delay: Duration) -> Self {
        self.options.nack_redelivery_delay = delay;
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.options.metadata = metadata;
        self
    }

    pub fn replicate_subscription_state(mut self, replicate: bool) -> Self {
        self.options.replicate_subscription_state = replicate;
        self
    }

    pub fn start_message_id(mut self, id: MessageId) -> Self {
        self.options.start_message_id = Some(id);
        self
    }

    pub fn start_message_id_inclusive(mut self, inclusive: bool) -> Self {
        self.options.start_message_id_inclusive = inclusive;
        self
    }

    pub fn subscription_mode(mut self, mode: SubscriptionMode) -> Self {
        self.options.subscription_mode = mode;
        self
    }

    pub fn read_compacted(mut self, read_compacted: bool) -> Self {
        self.options.read_compacted = read_compacted;
        self
    }

    pub fn disable_force_topic_creation(mut self, disable: bool) -> Self {
        self.options.disable_force_topic_creation = disable;
        self
    }

    pub fn max_reconnect_to_broker(mut self, max: Option<u32>) -> Self {
        self.options.max_reconnect_to_broker = max;
        self
    }

    pub fn key_shared_policy(mut self, policy: KeySharedPolicy) -> Self {
        self.options.key_shared_policy = Some(policy);
        self
    }

    pub fn schema(mut self, schema: Arc<SchemaInfo>) -> Self {
        self.options.schema = Some(schema);
        self
    }

    pub fn key_reader(mut self, reader: Arc<dyn CryptoKeyReader>) -> Self {
        self.options.key_reader = Some(reader);
        self
    }

    pub fn message_crypto(mut self, crypto: Arc<dyn MessageCrypto>) -> Self {
        self.options.message_crypto = Some(crypto);
        self
    }

    pub fn crypto_failure_action(mut self, action: CryptoFailureAction) -> Self {
        self.options.crypto_failure_action = action;
        self
    }

    pub fn interceptors(mut self, interceptors: ConsumerInterceptors) -> Self {
        self.options.interceptors = interceptors;
        self
    }

    /// Validate and build the options
    pub fn build(self) -> Result<ConsumerOptions, DriftmqClientError> {
        if self.options.topic.is_empty() {
            return Err(DriftmqClientError::invalid_config("topic must be set"));
        }
        if self.options.subscription.is_empty() {
            return Err(DriftmqClientError::invalid_config(
                "subscription must be set",
            ));
        }
        if self.options.receiver_queue_size == 0 {
            return Err(DriftmqClientError::invalid_config(
                "receiver queue size must be greater than zero",
            ));
        }
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let options = ConsumerOptionsBuilder::new()
            .topic("persistent://public/default/events-partition-0")
            .subscription("events-sub")
            .build()
            .unwrap();

        assert_eq!(options.receiver_queue_size, 1000);
        assert_eq!(options.subscription_type, SubscriptionType::Exclusive);
        assert_eq!(options.subscription_mode, SubscriptionMode::Durable);
        assert!(options.max_reconnect_to_broker.is_none());
    }

    #[test]
    fn test_builder_rejects_missing_topic() {
        let result = ConsumerOptionsBuilder::new().subscription("s").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_zero_queue() {
        let result = ConsumerOptionsBuilder::new()
            .topic("t")
            .subscription("s")
            .receiver_queue_size(0)
            .build();
        assert!(result.is_err());
    }
}
