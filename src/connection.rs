//! Contracts consumed from the connection layer: broker lookup, the RPC
//! client over a framed connection, and per-consumer frame routing. The
//! transport itself (TCP framing, multiplexing, timeouts) lives behind these
//! traits.

use crate::error::DriftmqClientError;
use crate::protocol::{CommandMessage, RequestCommand, ResponseCommand};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Broker addresses for one topic, as resolved by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub logical_addr: String,
    pub physical_addr: String,
}

/// Service-discovery contract
#[async_trait]
pub trait LookupService: Send + Sync {
    async fn lookup(&self, topic: &str) -> Result<LookupResult, DriftmqClientError>;
}

/// Receiver of frames addressed to one consumer id.
///
/// `message_received` runs on the connection's reader task and may block on
/// the prefetch queue when the consumer is slow; that push-back is the
/// intended backpressure point.
#[async_trait]
pub trait ConsumeHandler: Send + Sync {
    async fn message_received(
        &self,
        cmd: CommandMessage,
        headers_and_payload: Bytes,
    ) -> Result<(), DriftmqClientError>;

    fn connection_closed(&self);
}

/// A live broker session able to route inbound frames by consumer id
pub trait Connection: Send + Sync + std::fmt::Debug {
    fn add_consume_handler(&self, consumer_id: u64, handler: Arc<dyn ConsumeHandler>);
    fn delete_consume_handler(&self, consumer_id: u64);
}

/// An RPC response together with the connection it arrived on
pub struct RpcResult {
    pub response: ResponseCommand,
    pub cnx: Arc<dyn Connection>,
}

/// Request/response client over framed broker connections
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Allocate a client-wide unique consumer id
    fn new_consumer_id(&self) -> u64;

    /// Allocate a client-wide unique request id
    fn new_request_id(&self) -> u64;

    /// Send a request to the given broker addresses, establishing a
    /// connection as needed, and wait for the response.
    async fn request(
        &self,
        logical_addr: &str,
        physical_addr: &str,
        request_id: u64,
        cmd: RequestCommand,
    ) -> Result<RpcResult, DriftmqClientError>;

    /// Send a request on an established connection and wait for the response.
    async fn request_on_cnx(
        &self,
        cnx: Arc<dyn Connection>,
        request_id: u64,
        cmd: RequestCommand,
    ) -> Result<RpcResult, DriftmqClientError>;

    /// Fire a command on an established connection without waiting.
    fn request_on_cnx_no_wait(
        &self,
        cnx: Arc<dyn Connection>,
        cmd: RequestCommand,
    ) -> Result<(), DriftmqClientError>;
}

/// Exponential back-off for reconnection attempts: doubles from 100ms up to
/// a 30s ceiling.
#[derive(Debug)]
pub struct Backoff {
    next_delay: Duration,
    max_delay: Duration,
}

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

impl Default for Backoff {
    fn default() -> Self {
        Self {
            next_delay: BACKOFF_INITIAL,
            max_delay: BACKOFF_MAX,
        }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// The delay to sleep before the next attempt
    pub fn next(&mut self) -> Duration {
        let current = self.next_delay;
        self.next_delay = (self.next_delay * 2).min(self.max_delay);
        current
    }

    pub fn reset(&mut self) {
        self.next_delay = BACKOFF_INITIAL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(400));
        for _ in 0..16 {
            backoff.next();
        }
        assert_eq!(backoff.next(), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new();
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }
}
