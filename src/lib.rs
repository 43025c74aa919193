//! # DriftMQ Consumer Client Library
//!
//! An async Rust client for consuming one partition of a DriftMQ topic.
//!
//! ## Features
//!
//! - **Permit-based flow control**: credit windows keep the broker from
//!   overrunning a slow consumer
//! - **Prefetch pipeline**: inbound frames are decrypted, decompressed and
//!   deframed off the hot path, then staged in a bounded queue
//! - **Batch-aware acknowledgement**: per-entry acks coalesce into one
//!   broker ack per batch
//! - **Transparent reconnection**: broker-session loss is retried under
//!   exponential back-off and the subscription resumes at the right position
//! - **Zero-copy payloads** with `bytes::Bytes`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use driftmq_client::{ConsumerOptionsBuilder, PartitionConsumer};
//! # use std::sync::Arc;
//! # async fn run(
//! #     rpc: Arc<dyn driftmq_client::RpcClient>,
//! #     lookup: Arc<dyn driftmq_client::LookupService>,
//! #     dlq: Arc<dyn driftmq_client::DlqRouter>,
//! #     nacks: Arc<dyn driftmq_client::NackTracker>,
//! # ) -> driftmq_client::Result<()> {
//! let options = ConsumerOptionsBuilder::new()
//!     .topic("persistent://public/default/events-partition-0")
//!     .subscription("events-sub")
//!     .receiver_queue_size(1000)
//!     .build()?;
//!
//! let consumer = PartitionConsumer::new(options, rpc, lookup, dlq, nacks).await?;
//! while let Some(msg) = consumer.receive().await {
//!     println!("got {} bytes", msg.payload.len());
//!     consumer.ack_id(&msg.msg_id).await?;
//! }
//! consumer.close().await;
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod compression;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod crypto;
mod dispatcher;
pub mod error;
pub mod message;
pub mod metrics;
pub mod protocol;

pub use collaborators::{ConsumerInterceptor, ConsumerInterceptors, DlqRouter, NackTracker};
pub use config::{
    ConsumerOptions, ConsumerOptionsBuilder, InitialPosition, KeySharedMode, KeySharedPolicy,
    SchemaInfo, SubscriptionMode, SubscriptionType,
};
pub use connection::{
    Backoff, Connection, ConsumeHandler, LookupResult, LookupService, RpcClient, RpcResult,
};
pub use consumer::{ConsumerState, PartitionConsumer};
pub use crypto::{CryptoFailureAction, CryptoKeyReader, EncryptionKeyInfo, MessageCrypto};
pub use error::DriftmqClientError;
pub use message::{
    BatchAckTracker, EncryptionContext, EncryptionKey, Message, MessageId, TrackingMessageId,
};
pub use metrics::{ConsumerMetrics, MetricsSnapshot};

/// Client library result type
pub type Result<T> = std::result::Result<T, DriftmqClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
