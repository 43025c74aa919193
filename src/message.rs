//! Message identifiers, batch acknowledgement tracking, and the consumed
//! message record

use crate::consumer::PartitionConsumer;
use crate::error::DriftmqClientError;
use crate::protocol::MessageIdData;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Entry id the broker reports when a topic holds no message at all
pub const NO_MESSAGE_ENTRY: i64 = -1;

/// Identifier of a single message within a partition.
///
/// `entry_id == -1` denotes "no entry" (e.g. the result of a get-last on an
/// empty topic). `batch_index == -1` denotes a non-batched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub ledger_id: i64,
    pub entry_id: i64,
    pub batch_index: i32,
    pub partition_index: i32,
}

impl MessageId {
    pub fn new(ledger_id: i64, entry_id: i64, batch_index: i32, partition_index: i32) -> Self {
        Self {
            ledger_id,
            entry_id,
            batch_index,
            partition_index,
        }
    }

    /// Sentinel pointing past the newest message of a partition
    pub const fn latest() -> Self {
        Self {
            ledger_id: i64::MAX,
            entry_id: i64::MAX,
            batch_index: -1,
            partition_index: -1,
        }
    }

    /// Sentinel pointing before the oldest message of a partition
    pub const fn earliest() -> Self {
        Self {
            ledger_id: -1,
            entry_id: -1,
            batch_index: -1,
            partition_index: -1,
        }
    }

    /// Compare two ids by broker position; the partition index does not
    /// participate in ordering.
    pub fn compare(&self, other: &MessageId) -> Ordering {
        (self.ledger_id, self.entry_id, self.batch_index).cmp(&(
            other.ledger_id,
            other.entry_id,
            other.batch_index,
        ))
    }

    pub fn greater(&self, other: &MessageId) -> bool {
        self.compare(other) == Ordering::Greater
    }

    pub fn greater_equal(&self, other: &MessageId) -> bool {
        !matches!(self.compare(other), Ordering::Less)
    }

    /// The id immediately preceding this one: steps back within the batch
    /// when a batch index is present, otherwise to the previous entry.
    pub fn previous(&self) -> MessageId {
        if self.batch_index >= 0 {
            MessageId {
                batch_index: self.batch_index - 1,
                ..*self
            }
        } else {
            MessageId {
                entry_id: self.entry_id - 1,
                ..*self
            }
        }
    }

    /// Wire representation; the batch index is carried only when present.
    pub fn to_wire(&self) -> MessageIdData {
        MessageIdData {
            ledger_id: self.ledger_id as u64,
            entry_id: self.entry_id as u64,
            batch_index: (self.batch_index >= 0).then_some(self.batch_index),
            partition: (self.partition_index >= 0).then_some(self.partition_index),
        }
    }

    pub fn from_wire(data: &MessageIdData) -> Self {
        Self {
            ledger_id: data.ledger_id as i64,
            entry_id: data.entry_id as i64,
            batch_index: data.batch_index.unwrap_or(-1),
            partition_index: data.partition.unwrap_or(-1),
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.ledger_id, self.entry_id, self.batch_index, self.partition_index
        )
    }
}

/// Coalesces per-entry acknowledgements of a batch into a single broker ack.
///
/// One tracker is created per inbound frame and shared among the tracking ids
/// it yields. `ack(i)` reports true exactly once: on the call that marks the
/// last outstanding index.
#[derive(Debug)]
pub struct BatchAckTracker {
    words: Vec<AtomicU64>,
    remaining: AtomicUsize,
    size: usize,
}

impl BatchAckTracker {
    pub fn new(size: usize) -> Self {
        let word_count = size.div_ceil(64).max(1);
        Self {
            words: (0..word_count).map(|_| AtomicU64::new(0)).collect(),
            remaining: AtomicUsize::new(size),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Mark index `i` acknowledged. Returns true only on the call that
    /// completes the batch; repeated marks of the same index are no-ops.
    pub fn ack(&self, index: i32) -> bool {
        if index < 0 || index as usize >= self.size {
            return false;
        }
        let index = index as usize;
        let bit = 1u64 << (index % 64);
        let prev = self.words[index / 64].fetch_or(bit, AtomicOrdering::AcqRel);
        if prev & bit != 0 {
            // already marked
            return false;
        }
        self.remaining.fetch_sub(1, AtomicOrdering::AcqRel) == 1
    }

    pub fn completed(&self) -> bool {
        self.remaining.load(AtomicOrdering::Acquire) == 0
    }
}

/// A [`MessageId`] enriched with receive-time bookkeeping.
///
/// Carries a weak back reference to the owning partition consumer so an id
/// can be acknowledged after the consumer handle has been dropped; the call
/// then degrades to a no-op.
#[derive(Debug, Clone)]
pub struct TrackingMessageId {
    id: MessageId,
    received_time: Instant,
    tracker: Option<Arc<BatchAckTracker>>,
    consumer: Weak<PartitionConsumer>,
}

impl TrackingMessageId {
    pub(crate) fn new(
        id: MessageId,
        tracker: Option<Arc<BatchAckTracker>>,
        consumer: Weak<PartitionConsumer>,
    ) -> Self {
        Self {
            id,
            received_time: Instant::now(),
            tracker,
            consumer,
        }
    }

    /// Build a detached id, e.g. from a get-last response. Detached ids have
    /// no tracker and no consumer; acknowledging them is a no-op.
    pub fn detached(id: MessageId) -> Self {
        Self {
            id,
            received_time: Instant::now(),
            tracker: None,
            consumer: Weak::new(),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.id
    }

    pub fn received_time(&self) -> Instant {
        self.received_time
    }

    /// True when the id carries no usable position
    pub fn is_undefined(&self) -> bool {
        self.id.entry_id == NO_MESSAGE_ENTRY && self.id.ledger_id <= 0
    }

    pub fn equal(&self, other: &MessageId) -> bool {
        self.id.compare(other) == Ordering::Equal
    }

    pub fn greater(&self, other: &MessageId) -> bool {
        self.id.greater(other)
    }

    pub fn greater_equal(&self, other: &MessageId) -> bool {
        self.id.greater_equal(other)
    }

    /// Consult the batch tracker. True when this id's batch has become fully
    /// acknowledged and the broker-side ack should be emitted now.
    pub(crate) fn mark_acked(&self) -> bool {
        match &self.tracker {
            Some(tracker) => tracker.ack(self.id.batch_index.max(0)),
            None => false,
        }
    }

    /// Acknowledge through the owning consumer. A no-op once the consumer
    /// has closed or been dropped.
    pub async fn ack(&self) -> Result<(), DriftmqClientError> {
        match self.consumer.upgrade() {
            Some(consumer) => consumer.ack_id(self).await,
            None => Ok(()),
        }
    }
}

/// Encryption key material attached to an encrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub key_value: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// Context delivered alongside messages that could not be decrypted, letting
/// the application decrypt out of band.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptionContext {
    pub algorithm: String,
    pub param: Vec<u8>,
    pub uncompressed_size: usize,
    pub batch_size: usize,
    pub keys: HashMap<String, EncryptionKey>,
}

impl EncryptionContext {
    pub(crate) fn from_metadata(meta: &crate::protocol::MessageMetadata) -> Self {
        let keys = meta
            .encryption_keys
            .iter()
            .map(|k| {
                (
                    k.key.clone(),
                    EncryptionKey {
                        key_value: k.value.clone(),
                        metadata: k.metadata.clone(),
                    },
                )
            })
            .collect();
        Self {
            algorithm: meta.encryption_algo.clone().unwrap_or_default(),
            param: meta.encryption_param.clone().unwrap_or_default(),
            uncompressed_size: meta.uncompressed_size as usize,
            batch_size: meta.num_messages_in_batch.unwrap_or(1).max(0) as usize,
            keys,
        }
    }
}

/// A message received from the broker
#[derive(Debug, Clone)]
pub struct Message {
    /// Publish time in unix milliseconds
    pub publish_time: u64,
    /// Event time in unix milliseconds, when the producer set one
    pub event_time: Option<u64>,
    pub key: Option<String>,
    pub producer_name: String,
    pub properties: HashMap<String, String>,
    pub topic: String,
    pub msg_id: TrackingMessageId,
    pub payload: Bytes,
    pub schema: Option<Arc<crate::config::SchemaInfo>>,
    pub replication_clusters: Vec<String>,
    pub replicated_from: Option<String>,
    pub redelivery_count: u32,
    /// Present only for messages delivered undecrypted
    pub encryption_context: Option<EncryptionContext>,
}

impl Message {
    pub fn id(&self) -> MessageId {
        self.msg_id.message_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previous_steps_within_batch() {
        let id = MessageId::new(5, 10, 2, 0);
        assert_eq!(id.previous(), MessageId::new(5, 10, 1, 0));
    }

    #[test]
    fn test_previous_steps_to_prior_entry() {
        let id = MessageId::new(5, 10, -1, 0);
        assert_eq!(id.previous(), MessageId::new(5, 9, -1, 0));
        // batch index 0 still steps within the batch
        let id = MessageId::new(5, 1, 0, 0);
        assert_eq!(id.previous(), MessageId::new(5, 1, -1, 0));
    }

    #[test]
    fn test_ordering_ignores_partition() {
        let a = MessageId::new(5, 10, -1, 0);
        let b = MessageId::new(5, 10, -1, 3);
        assert_eq!(a.compare(&b), Ordering::Equal);
        assert!(MessageId::new(5, 11, -1, 0).greater(&a));
        assert!(MessageId::new(6, 0, -1, 0).greater(&a));
        assert!(MessageId::new(5, 10, 0, 0).greater(&a));
        assert!(a.greater_equal(&b));
    }

    #[test]
    fn test_wire_round_trip() {
        for id in [
            MessageId::new(7, 3, -1, 0),
            MessageId::new(7, 3, 2, 1),
            MessageId::new(0, 0, 0, 0),
        ] {
            assert_eq!(MessageId::from_wire(&id.to_wire()), id);
        }
    }

    #[test]
    fn test_wire_data_survives_conversion() {
        for data in [
            MessageIdData {
                ledger_id: 7,
                entry_id: 3,
                batch_index: None,
                partition: None,
            },
            MessageIdData {
                ledger_id: 7,
                entry_id: 3,
                batch_index: Some(2),
                partition: Some(1),
            },
            MessageIdData {
                ledger_id: 0,
                entry_id: 0,
                batch_index: Some(0),
                partition: Some(0),
            },
        ] {
            assert_eq!(MessageId::from_wire(&data).to_wire(), data);
        }
    }

    #[test]
    fn test_wire_omits_absent_batch_index() {
        let data = MessageId::new(7, 3, -1, 0).to_wire();
        assert!(data.batch_index.is_none());
        assert_eq!(data.partition, Some(0));
    }

    #[test]
    fn test_tracker_completes_once() {
        let tracker = BatchAckTracker::new(3);
        assert!(!tracker.ack(0));
        assert!(!tracker.ack(2));
        assert!(!tracker.ack(2)); // repeated mark
        assert!(!tracker.completed());
        assert!(tracker.ack(1)); // completing mark
        assert!(tracker.completed());
        assert!(!tracker.ack(1)); // already complete, never reports again
    }

    #[test]
    fn test_tracker_single_entry() {
        let tracker = BatchAckTracker::new(1);
        assert!(tracker.ack(0));
        assert!(!tracker.ack(0));
    }

    #[test]
    fn test_tracker_wide_batch() {
        let tracker = BatchAckTracker::new(130);
        for i in 0..129 {
            assert!(!tracker.ack(i));
        }
        assert!(tracker.ack(129));
    }

    #[test]
    fn test_tracker_out_of_range() {
        let tracker = BatchAckTracker::new(2);
        assert!(!tracker.ack(5));
        assert!(!tracker.ack(-1));
        assert!(!tracker.completed());
    }

    #[test]
    fn test_detached_id_ack_is_noop() {
        let id = TrackingMessageId::detached(MessageId::new(1, 2, -1, 0));
        assert!(!id.mark_acked());
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            assert!(id.ack().await.is_ok());
        });
    }
}
