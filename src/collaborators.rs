//! Contracts for external collaborators of the partition consumer: the
//! dead-letter router, the negative-ack tracker, and consumer interceptors.

use crate::message::{Message, MessageId};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Diverts messages that exceeded their redelivery limit
pub trait DlqRouter: Send + Sync {
    /// True when the message should go to the dead-letter channel instead of
    /// the application channel.
    fn should_send_to_dlq(&self, msg: &Message) -> bool;

    /// The writable end of the dead-letter channel
    fn chan(&self) -> mpsc::Sender<Message>;
}

/// Schedules redelivery of negatively acknowledged messages. An
/// implementation eventually calls the consumer's redeliver operation with
/// the ids that have aged out.
pub trait NackTracker: Send + Sync {
    fn add(&self, id: MessageId);
    fn close(&self);
}

/// Hook points around message consumption
pub trait ConsumerInterceptor: Send + Sync {
    /// Runs before a message is enqueued for the application
    fn before_consume(&self, _msg: &mut Message) {}

    /// Runs after an acknowledgement was handed to the broker path
    fn on_acknowledge(&self, _id: &MessageId) {}

    /// Runs when negatively acknowledged ids are sent for redelivery
    fn on_negative_acks_send(&self, _ids: &[MessageId]) {}
}

/// Fan-out wrapper over the configured interceptor chain
#[derive(Clone, Default)]
pub struct ConsumerInterceptors {
    inner: Vec<Arc<dyn ConsumerInterceptor>>,
}

impl ConsumerInterceptors {
    pub fn new(interceptors: Vec<Arc<dyn ConsumerInterceptor>>) -> Self {
        Self { inner: interceptors }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn before_consume(&self, msg: &mut Message) {
        for interceptor in &self.inner {
            interceptor.before_consume(msg);
        }
    }

    pub fn on_acknowledge(&self, id: &MessageId) {
        for interceptor in &self.inner {
            interceptor.on_acknowledge(id);
        }
    }

    pub fn on_negative_acks_send(&self, ids: &[MessageId]) {
        for interceptor in &self.inner {
            interceptor.on_negative_acks_send(ids);
        }
    }
}
