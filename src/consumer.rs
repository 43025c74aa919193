//! The partition consumer: a long-lived subscription to one partition of a
//! topic.
//!
//! Three actors cooperate per consumer, sharing state only through bounded
//! channels: the events loop serialises all control-plane RPCs, a sibling
//! watcher drives reconnection, and the dispatcher owns delivery and flow
//! control. Inbound frames are decoded on the connection's reader task and
//! land in the bounded prefetch queue, which is the backpressure point.

use crate::collaborators::{DlqRouter, NackTracker};
use crate::config::{ConsumerOptions, SubscriptionMode};
use crate::connection::{Backoff, Connection, ConsumeHandler, LookupService, RpcClient};
use crate::crypto::{CryptoFailureAction, DecryptOutcome};
use crate::dispatcher::Dispatcher;
use crate::error::DriftmqClientError;
use crate::message::{
    BatchAckTracker, EncryptionContext, Message, MessageId, TrackingMessageId, NO_MESSAGE_ENTRY,
};
use crate::metrics::ConsumerMetrics;
use crate::protocol::{
    CommandAck, CommandCloseConsumer, CommandFlow, CommandGetLastMessageId, CommandMessage,
    CommandRedeliverUnacknowledgedMessages, CommandSeek, CommandSubscribe, CommandUnsubscribe,
    MessageIdData, MessageMetadata, PayloadReader, RequestCommand, ResponseCommand,
    SingleMessageMetadata, ValidationError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a partition consumer. Transitions only move forward except
/// for the unsubscribe rollback from `Closing` to `Ready` on RPC failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Initializing = 0,
    Ready = 1,
    Closing = 2,
    Closed = 3,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConsumerState::Initializing => "Initializing",
            ConsumerState::Ready => "Ready",
            ConsumerState::Closing => "Closing",
            ConsumerState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

const EVENT_QUEUE_SIZE: usize = 10;
const SIGNAL_QUEUE_SIZE: usize = 10;

/// Control-plane request carried on the events channel
enum EventRequest {
    Ack {
        id: MessageId,
    },
    Redeliver {
        ids: Vec<MessageId>,
    },
    Unsubscribe {
        done: oneshot::Sender<Result<(), DriftmqClientError>>,
    },
    GetLastMessageId {
        done: oneshot::Sender<Result<MessageId, DriftmqClientError>>,
    },
    Seek {
        id: MessageId,
        done: oneshot::Sender<Result<(), DriftmqClientError>>,
    },
    SeekByTime {
        publish_time_millis: u64,
        done: oneshot::Sender<Result<(), DriftmqClientError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Client-side subscription to a single partition of a topic
pub struct PartitionConsumer {
    options: ConsumerOptions,
    topic: String,
    name: parking_lot::Mutex<String>,
    consumer_id: u64,
    partition_index: i32,
    queue_size: usize,

    state: AtomicU8,

    rpc: Arc<dyn RpcClient>,
    lookup: Arc<dyn LookupService>,
    dlq: Arc<dyn DlqRouter>,
    nack_tracker: Arc<dyn NackTracker>,

    conn: parking_lot::RwLock<Option<Arc<dyn Connection>>>,
    /// Bumped on every successful subscribe; lets callers observe reconnects
    connection_epoch: AtomicU64,

    /// Effective resume position; rewritten on every (re)subscribe
    start_message_id: parking_lot::Mutex<Option<MessageId>>,
    /// Last message handed out of the prefetch queue
    last_dequeued: parking_lot::Mutex<Option<MessageId>>,
    /// Owned by the dispatcher; readable for observation only
    available_permits: AtomicI32,

    queue_tx: mpsc::Sender<Option<Vec<Message>>>,
    message_tx: mpsc::Sender<Message>,
    message_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
    events_tx: mpsc::Sender<EventRequest>,
    connected_tx: mpsc::Sender<()>,
    conn_closed_tx: mpsc::Sender<()>,
    clear_queue_tx: mpsc::Sender<oneshot::Sender<Option<MessageId>>>,
    clear_queues_tx: mpsc::Sender<oneshot::Sender<()>>,
    shutdown: CancellationToken,

    compression: crate::compression::ProviderCache,
    metrics: Arc<ConsumerMetrics>,
    self_ref: Weak<PartitionConsumer>,
}

impl PartitionConsumer {
    /// Subscribe to the partition and start the consumer actors.
    ///
    /// Fails if the initial lookup or subscribe fails; reconnection after a
    /// later session loss is handled transparently. The consumer must be
    /// shut down with [`close`](Self::close) or
    /// [`unsubscribe`](Self::unsubscribe) to stop its background tasks.
    pub async fn new(
        options: ConsumerOptions,
        rpc: Arc<dyn RpcClient>,
        lookup: Arc<dyn LookupService>,
        dlq: Arc<dyn DlqRouter>,
        nack_tracker: Arc<dyn NackTracker>,
    ) -> Result<Arc<Self>, DriftmqClientError> {
        let queue_size = options.receiver_queue_size;
        let (queue_tx, queue_rx) = mpsc::channel(queue_size);
        let (message_tx, message_rx) = mpsc::channel(queue_size);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (connected_tx, connected_rx) = mpsc::channel(SIGNAL_QUEUE_SIZE);
        let (conn_closed_tx, conn_closed_rx) = mpsc::channel(SIGNAL_QUEUE_SIZE);
        let (clear_queue_tx, clear_queue_rx) = mpsc::channel(1);
        let (clear_queues_tx, clear_queues_rx) = mpsc::channel(1);

        let consumer_id = rpc.new_consumer_id();
        let pc = Arc::new_cyclic(|weak| Self {
            topic: options.topic.clone(),
            name: parking_lot::Mutex::new(options.consumer_name.clone()),
            consumer_id,
            partition_index: options.partition_index,
            queue_size,
            state: AtomicU8::new(ConsumerState::Initializing as u8),
            rpc,
            lookup,
            dlq,
            nack_tracker,
            conn: parking_lot::RwLock::new(None),
            connection_epoch: AtomicU64::new(0),
            start_message_id: parking_lot::Mutex::new(options.start_message_id),
            last_dequeued: parking_lot::Mutex::new(None),
            available_permits: AtomicI32::new(0),
            queue_tx: queue_tx.clone(),
            message_tx,
            message_rx: Arc::new(tokio::sync::Mutex::new(message_rx)),
            events_tx,
            connected_tx,
            conn_closed_tx,
            clear_queue_tx,
            clear_queues_tx,
            shutdown: CancellationToken::new(),
            compression: crate::compression::ProviderCache::new(),
            metrics: Arc::new(ConsumerMetrics::new()),
            self_ref: weak.clone(),
            options,
        });

        if let Err(e) = pc.grab_conn().await {
            error!(
                topic = %pc.topic,
                subscription = %pc.options.subscription,
                error = %e,
                "failed to create consumer"
            );
            pc.nack_tracker.close();
            return Err(e);
        }
        info!(
            topic = %pc.topic,
            subscription = %pc.options.subscription,
            consumer_id = pc.consumer_id,
            "created consumer"
        );
        pc.set_state(ConsumerState::Ready);

        // Inclusive start at Latest resolves to the concrete last id up
        // front. The dispatcher is not running yet, so the seek variant that
        // leaves the message channels alone is the right one.
        let start = *pc.start_message_id.lock();
        if pc.options.start_message_id_inclusive && start == Some(MessageId::latest()) {
            let last = match pc.request_get_last_message_id().await {
                Ok(id) => id,
                Err(e) => {
                    pc.nack_tracker.close();
                    return Err(e);
                }
            };
            if last.entry_id != NO_MESSAGE_ENTRY {
                *pc.start_message_id.lock() = Some(last);
                if let Err(e) = pc.request_seek_without_clear(last).await {
                    pc.nack_tracker.close();
                    return Err(e);
                }
            }
        }

        tokio::spawn(
            Dispatcher::new(
                pc.clone(),
                queue_rx,
                queue_tx,
                connected_rx,
                clear_queue_rx,
                clear_queues_rx,
            )
            .run(),
        );
        tokio::spawn(pc.clone().run_events_loop(events_rx));
        tokio::spawn(pc.clone().run_reconnect_watcher(conn_closed_rx));

        Ok(pc)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    pub fn state(&self) -> ConsumerState {
        match self.state.load(Ordering::Acquire) {
            0 => ConsumerState::Initializing,
            1 => ConsumerState::Ready,
            2 => ConsumerState::Closing,
            _ => ConsumerState::Closed,
        }
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Number of successful subscribes since creation
    pub fn connection_epoch(&self) -> u64 {
        self.connection_epoch.load(Ordering::Acquire)
    }

    /// Permits accumulated since the last flow request
    pub fn available_permits(&self) -> i32 {
        self.available_permits.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &ConsumerMetrics {
        &self.metrics
    }

    /// Receive the next message, waiting until one is available. Messages
    /// already buffered keep being returned after [`close`](Self::close).
    pub async fn receive(&self) -> Option<Message> {
        let mut rx = self.message_rx.lock().await;
        rx.recv().await
    }

    /// The messages of this partition as an async stream
    pub fn stream(&self) -> impl futures::Stream<Item = Message> + '_ {
        futures::stream::unfold(self, |pc| async move {
            pc.receive().await.map(|msg| (msg, pc))
        })
    }

    /// Acknowledge a received message.
    ///
    /// For batched messages the broker-side ack is emitted only once every
    /// entry of the batch has been acknowledged; repeated acks of the same id
    /// are no-ops.
    pub async fn ack_id(&self, id: &TrackingMessageId) -> Result<(), DriftmqClientError> {
        if matches!(self.state(), ConsumerState::Closing | ConsumerState::Closed) {
            return Ok(());
        }
        if id.is_undefined() || !id.mark_acked() {
            return Ok(());
        }
        self.metrics.record_ack(id.received_time().elapsed());
        let message_id = id.message_id();
        let _ = self.events_tx.send(EventRequest::Ack { id: message_id }).await;
        self.options.interceptors.on_acknowledge(&message_id);
        Ok(())
    }

    /// Negatively acknowledge a message; the nack tracker schedules its
    /// redelivery after the configured delay.
    pub fn nack_id(&self, id: &TrackingMessageId) {
        self.nack_tracker.add(id.message_id());
        self.metrics.record_nack();
    }

    /// Ask the broker to redeliver the given unacknowledged messages. Called
    /// by the nack tracker once ids age out.
    pub async fn redeliver(&self, ids: Vec<MessageId>) {
        if ids.is_empty() {
            return;
        }
        let _ = self
            .events_tx
            .send(EventRequest::Redeliver { ids: ids.clone() })
            .await;
        self.options.interceptors.on_negative_acks_send(&ids);
    }

    /// Unsubscribe from the topic. On RPC failure the consumer rolls back to
    /// `Ready` and stays usable.
    pub async fn unsubscribe(&self) -> Result<(), DriftmqClientError> {
        let state = self.state();
        if matches!(state, ConsumerState::Closing | ConsumerState::Closed) {
            error!(%state, "cannot unsubscribe a closing or closed consumer");
            return Ok(());
        }
        let (done, rx) = oneshot::channel();
        self.events_tx
            .send(EventRequest::Unsubscribe { done })
            .await
            .map_err(|_| DriftmqClientError::ConsumerClosed)?;
        rx.await.map_err(|_| DriftmqClientError::ConsumerClosed)?
    }

    /// The id of the last message the broker has for this partition.
    /// `entry_id == -1` signals an empty topic.
    pub async fn get_last_message_id(&self) -> Result<MessageId, DriftmqClientError> {
        if matches!(self.state(), ConsumerState::Closing | ConsumerState::Closed) {
            return Err(DriftmqClientError::ConsumerClosed);
        }
        let (done, rx) = oneshot::channel();
        self.events_tx
            .send(EventRequest::GetLastMessageId { done })
            .await
            .map_err(|_| DriftmqClientError::ConsumerClosed)?;
        rx.await.map_err(|_| DriftmqClientError::ConsumerClosed)?
    }

    /// Reset the subscription to the given id and drop everything buffered
    /// client-side.
    pub async fn seek(&self, id: MessageId) -> Result<(), DriftmqClientError> {
        let (done, rx) = oneshot::channel();
        self.events_tx
            .send(EventRequest::Seek { id, done })
            .await
            .map_err(|_| DriftmqClientError::ConsumerClosed)?;
        rx.await.map_err(|_| DriftmqClientError::ConsumerClosed)?
    }

    /// Reset the subscription to the first message published at or after the
    /// given unix-millisecond timestamp.
    pub async fn seek_by_time(&self, publish_time_millis: u64) -> Result<(), DriftmqClientError> {
        let (done, rx) = oneshot::channel();
        self.events_tx
            .send(EventRequest::SeekByTime {
                publish_time_millis,
                done,
            })
            .await
            .map_err(|_| DriftmqClientError::ConsumerClosed)?;
        rx.await.map_err(|_| DriftmqClientError::ConsumerClosed)?
    }

    /// Close the consumer and stop its background tasks. Idempotent.
    pub async fn close(&self) {
        if self.state() != ConsumerState::Ready {
            return;
        }
        let (done, rx) = oneshot::channel();
        if self
            .events_tx
            .send(EventRequest::Close { done })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    // --- events actor ---

    async fn run_events_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<EventRequest>) {
        debug!(consumer_id = self.consumer_id, "events loop started");
        while let Some(event) = events_rx.recv().await {
            match event {
                EventRequest::Ack { id } => self.internal_ack(id),
                EventRequest::Redeliver { ids } => self.internal_redeliver(&ids),
                EventRequest::Unsubscribe { done } => {
                    let _ = done.send(self.internal_unsubscribe().await);
                }
                EventRequest::GetLastMessageId { done } => {
                    let _ = done.send(self.request_get_last_message_id().await);
                }
                EventRequest::Seek { id, done } => {
                    let _ = done.send(self.internal_seek(id).await);
                }
                EventRequest::SeekByTime {
                    publish_time_millis,
                    done,
                } => {
                    let _ = done.send(self.internal_seek_by_time(publish_time_millis).await);
                }
                EventRequest::Close { done } => {
                    self.internal_close().await;
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!(consumer_id = self.consumer_id, "events loop exited");
    }

    fn internal_ack(&self, id: MessageId) {
        let cmd = CommandAck {
            consumer_id: self.consumer_id,
            message_ids: vec![MessageIdData {
                ledger_id: id.ledger_id as u64,
                entry_id: id.entry_id as u64,
                batch_index: None,
                partition: None,
            }],
            ack_type: Default::default(),
            validation_error: None,
        };
        self.send_no_wait(RequestCommand::Ack(cmd));
    }

    fn internal_redeliver(&self, ids: &[MessageId]) {
        debug!(count = ids.len(), "requesting redelivery after negative ack");
        let message_ids = ids
            .iter()
            .map(|id| MessageIdData {
                ledger_id: id.ledger_id as u64,
                entry_id: id.entry_id as u64,
                batch_index: None,
                partition: None,
            })
            .collect();
        self.send_no_wait(RequestCommand::RedeliverUnacknowledgedMessages(
            CommandRedeliverUnacknowledgedMessages {
                consumer_id: self.consumer_id,
                message_ids,
            },
        ));
    }

    async fn internal_unsubscribe(&self) -> Result<(), DriftmqClientError> {
        let state = self.state();
        if matches!(state, ConsumerState::Closing | ConsumerState::Closed) {
            error!(%state, "cannot unsubscribe a closing or closed consumer");
            return Ok(());
        }

        self.set_state(ConsumerState::Closing);
        let request_id = self.rpc.new_request_id();
        let cmd = CommandUnsubscribe {
            request_id,
            consumer_id: self.consumer_id,
        };
        let conn = match self.current_conn() {
            Some(conn) => conn,
            None => {
                self.set_state(ConsumerState::Ready);
                return Err(DriftmqClientError::connection("no active connection"));
            }
        };
        let result = self
            .rpc
            .request_on_cnx(conn.clone(), request_id, RequestCommand::Unsubscribe(cmd))
            .await
            .and_then(|res| match res.response {
                ResponseCommand::Success(_) => Ok(()),
                ResponseCommand::Error(e) => Err(DriftmqClientError::broker(e.error, e.message)),
                other => Err(DriftmqClientError::UnexpectedMessage {
                    expected: "Success",
                    got: other.name(),
                }),
            });
        if let Err(e) = result {
            error!(error = %e, "failed to unsubscribe consumer");
            // handler stays registered so delivery continues
            self.set_state(ConsumerState::Ready);
            return Err(e);
        }

        conn.delete_consume_handler(self.consumer_id);
        self.nack_tracker.close();
        info!(consumer_id = self.consumer_id, "consumer unsubscribed");
        self.set_state(ConsumerState::Closed);
        self.shutdown.cancel();
        Ok(())
    }

    async fn request_get_last_message_id(&self) -> Result<MessageId, DriftmqClientError> {
        let request_id = self.rpc.new_request_id();
        let cmd = CommandGetLastMessageId {
            request_id,
            consumer_id: self.consumer_id,
        };
        let conn = self
            .current_conn()
            .ok_or_else(|| DriftmqClientError::connection("no active connection"))?;
        let res = self
            .rpc
            .request_on_cnx(conn, request_id, RequestCommand::GetLastMessageId(cmd))
            .await
            .map_err(|e| {
                error!(error = %e, "failed to get last message id");
                e
            })?;
        match res.response {
            ResponseCommand::GetLastMessageIdResponse(r) => {
                Ok(MessageId::from_wire(&r.last_message_id))
            }
            ResponseCommand::Error(e) => Err(DriftmqClientError::broker(e.error, e.message)),
            other => Err(DriftmqClientError::UnexpectedMessage {
                expected: "GetLastMessageIdResponse",
                got: other.name(),
            }),
        }
    }

    async fn internal_seek(&self, id: MessageId) -> Result<(), DriftmqClientError> {
        self.request_seek_without_clear(id).await?;
        self.clear_message_channels().await;
        Ok(())
    }

    async fn request_seek_without_clear(&self, id: MessageId) -> Result<(), DriftmqClientError> {
        let state = self.state();
        if matches!(state, ConsumerState::Closing | ConsumerState::Closed) {
            error!(%state, "consumer is closing or has closed");
            return Ok(());
        }

        let request_id = self.rpc.new_request_id();
        let cmd = CommandSeek {
            consumer_id: self.consumer_id,
            request_id,
            message_id: Some(id.to_wire()),
            message_publish_time: None,
        };
        self.request_seek_command(request_id, cmd).await
    }

    async fn internal_seek_by_time(
        &self,
        publish_time_millis: u64,
    ) -> Result<(), DriftmqClientError> {
        let state = self.state();
        if matches!(state, ConsumerState::Closing | ConsumerState::Closed) {
            error!(%state, "consumer is closing or has closed");
            return Ok(());
        }

        let request_id = self.rpc.new_request_id();
        let cmd = CommandSeek {
            consumer_id: self.consumer_id,
            request_id,
            message_id: None,
            message_publish_time: Some(publish_time_millis),
        };
        self.request_seek_command(request_id, cmd).await?;
        self.clear_message_channels().await;
        Ok(())
    }

    async fn request_seek_command(
        &self,
        request_id: u64,
        cmd: CommandSeek,
    ) -> Result<(), DriftmqClientError> {
        let conn = self
            .current_conn()
            .ok_or_else(|| DriftmqClientError::connection("no active connection"))?;
        let res = self
            .rpc
            .request_on_cnx(conn, request_id, RequestCommand::Seek(cmd))
            .await
            .map_err(|e| {
                error!(error = %e, "failed to reset subscription position");
                e
            })?;
        match res.response {
            ResponseCommand::Success(_) => Ok(()),
            ResponseCommand::Error(e) => Err(DriftmqClientError::broker(e.error, e.message)),
            other => Err(DriftmqClientError::UnexpectedMessage {
                expected: "Success",
                got: other.name(),
            }),
        }
    }

    async fn clear_message_channels(&self) {
        let (done, rx) = oneshot::channel();
        if self.clear_queues_tx.send(done).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn internal_close(&self) {
        let state = self.state();
        if state != ConsumerState::Ready {
            self.nack_tracker.close();
            return;
        }

        self.set_state(ConsumerState::Closing);
        info!(consumer_id = self.consumer_id, "closing consumer");

        let request_id = self.rpc.new_request_id();
        if let Some(conn) = self.current_conn() {
            let cmd = CommandCloseConsumer {
                request_id,
                consumer_id: self.consumer_id,
            };
            match self
                .rpc
                .request_on_cnx(conn, request_id, RequestCommand::CloseConsumer(cmd))
                .await
            {
                Ok(_) => info!(consumer_id = self.consumer_id, "closed consumer"),
                Err(e) => warn!(error = %e, "failed to close consumer"),
            }
        }

        self.compression.close_all();
        self.set_state(ConsumerState::Closed);
        if let Some(conn) = self.current_conn() {
            conn.delete_consume_handler(self.consumer_id);
        }
        self.nack_tracker.close();
        self.shutdown.cancel();
    }

    // --- connection management ---

    pub(crate) async fn grab_conn(&self) -> Result<(), DriftmqClientError> {
        let lr = self.lookup.lookup(&self.topic).await?;
        debug!(
            logical_addr = %lr.logical_addr,
            physical_addr = %lr.physical_addr,
            "lookup result"
        );

        let request_id = self.rpc.new_request_id();

        let start = self.clear_receiver_queue().await;
        *self.start_message_id.lock() = start;

        let mut cmd = CommandSubscribe {
            topic: self.topic.clone(),
            subscription: self.options.subscription.clone(),
            sub_type: self.options.subscription_type,
            consumer_id: self.consumer_id,
            request_id,
            consumer_name: self.name.lock().clone(),
            durable: self.options.subscription_mode == SubscriptionMode::Durable,
            start_message_id: None,
            initial_position: self.options.initial_position,
            metadata: self.options.metadata.clone(),
            read_compacted: self.options.read_compacted,
            replicate_subscription_state: self.options.replicate_subscription_state,
            key_shared_policy: self.options.key_shared_policy.clone(),
            schema: self.options.schema.as_deref().cloned(),
            // on by default on the wire; carried only to disable
            force_topic_creation: self.options.disable_force_topic_creation.then_some(false),
        };
        if self.options.subscription_mode != SubscriptionMode::Durable {
            // for durable subscriptions the broker decides the restart point
            cmd.start_message_id = start.map(|id| id.to_wire());
        }

        let res = self
            .rpc
            .request(
                &lr.logical_addr,
                &lr.physical_addr,
                request_id,
                RequestCommand::Subscribe(cmd),
            )
            .await
            .map_err(|e| {
                warn!(error = %e, "subscribe request failed");
                e
            })?;

        match res.response {
            ResponseCommand::Success(success) => {
                if let Some(name) = success.consumer_name {
                    if !name.is_empty() {
                        *self.name.lock() = name;
                    }
                }
            }
            ResponseCommand::Error(e) => {
                return Err(DriftmqClientError::broker(e.error, e.message));
            }
            other => {
                return Err(DriftmqClientError::UnexpectedMessage {
                    expected: "Success",
                    got: other.name(),
                });
            }
        }

        *self.conn.write() = Some(res.cnx.clone());
        let handler: Arc<dyn ConsumeHandler> = self
            .self_ref
            .upgrade()
            .ok_or(DriftmqClientError::ConsumerClosed)?;
        res.cnx.add_consume_handler(self.consumer_id, handler);
        self.connection_epoch.fetch_add(1, Ordering::AcqRel);
        info!(consumer_id = self.consumer_id, "connected consumer");

        let _ = self.connected_tx.try_send(());
        Ok(())
    }

    async fn run_reconnect_watcher(self: Arc<Self>, mut conn_closed_rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                received = conn_closed_rx.recv() => match received {
                    Some(()) => {
                        debug!("connection closed; starting reconnect");
                        self.reconnect_to_broker().await;
                    }
                    None => return,
                },
            }
        }
    }

    async fn reconnect_to_broker(&self) {
        let mut remaining = self.options.max_reconnect_to_broker;
        let mut backoff = Backoff::new();
        loop {
            if remaining == Some(0) {
                warn!("reconnect attempts exhausted");
                return;
            }
            if self.state() != ConsumerState::Ready {
                // consumer is already closing
                return;
            }

            let delay = backoff.next();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting to broker");
            tokio::time::sleep(delay).await;

            match self.grab_conn().await {
                Ok(()) => {
                    info!("reconnected consumer to broker");
                    return;
                }
                Err(e) => warn!(error = %e, "failed to reconnect"),
            }

            if let Some(r) = remaining.as_mut() {
                *r -= 1;
            }
        }
    }

    /// Drain the prefetch queue and compute the position the next subscribe
    /// should resume from: the id just before the first message the
    /// application has not seen.
    async fn clear_receiver_queue(&self) -> Option<MessageId> {
        let next_in_queue = self.clear_queue_and_get_next().await;

        let start = *self.start_message_id.lock();
        start?;

        if let Some(next) = next_in_queue {
            return Some(next.previous());
        }
        let last = *self.last_dequeued.lock();
        if last.is_some() {
            // queue was empty; restart just after the last dequeued message
            return last;
        }
        // nothing received or dequeued yet
        start
    }

    async fn clear_queue_and_get_next(&self) -> Option<MessageId> {
        if self.state() != ConsumerState::Ready {
            return None;
        }
        let (done, rx) = oneshot::channel();
        if self.clear_queue_tx.send(done).await.is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    fn current_conn(&self) -> Option<Arc<dyn Connection>> {
        self.conn.read().clone()
    }

    fn send_no_wait(&self, cmd: RequestCommand) {
        match self.current_conn() {
            Some(conn) => {
                if let Err(e) = self.rpc.request_on_cnx_no_wait(conn, cmd) {
                    warn!(error = %e, "failed to send command");
                }
            }
            None => warn!("no active connection; dropping command"),
        }
    }

    // --- receive pipeline ---

    fn decrypt_if_needed(
        &self,
        wire_id: &MessageIdData,
        metadata: &MessageMetadata,
        payload: Bytes,
    ) -> DecryptOutcome {
        if metadata.encryption_keys.is_empty() {
            return DecryptOutcome::Clear(payload);
        }

        let (crypto, key_reader) = match (
            self.options.message_crypto.as_ref(),
            self.options.key_reader.as_ref(),
        ) {
            (Some(crypto), Some(key_reader)) => (crypto, key_reader),
            _ => {
                return match self.options.crypto_failure_action {
                    CryptoFailureAction::Consume => {
                        warn!(
                            topic = %self.topic,
                            subscription = %self.options.subscription,
                            "no key reader configured; consuming encrypted message"
                        );
                        DecryptOutcome::Undecryptable(payload)
                    }
                    CryptoFailureAction::Discard => {
                        warn!(
                            topic = %self.topic,
                            subscription = %self.options.subscription,
                            "no key reader configured; discarding encrypted message"
                        );
                        self.discard_corrupted(wire_id, ValidationError::DecryptionError);
                        DecryptOutcome::Discarded
                    }
                    CryptoFailureAction::FailConsume => {
                        error!(
                            topic = %self.topic,
                            subscription = %self.options.subscription,
                            "no key reader configured; failing encrypted message"
                        );
                        DecryptOutcome::Discarded
                    }
                };
            }
        };

        match crypto.decrypt(metadata, &payload, key_reader.as_ref()) {
            Ok(plain) => DecryptOutcome::Clear(Bytes::from(plain)),
            Err(e) => match self.options.crypto_failure_action {
                CryptoFailureAction::FailConsume => {
                    warn!(error = %e, "message delivery failed: unable to decrypt");
                    DecryptOutcome::Discarded
                }
                CryptoFailureAction::Discard => {
                    warn!(error = %e, "discarding message that failed decryption");
                    self.discard_corrupted(wire_id, ValidationError::DecryptionError);
                    DecryptOutcome::Discarded
                }
                CryptoFailureAction::Consume => {
                    // batched payloads cannot be deframed without decryption,
                    // so the whole frame is delivered as one message
                    warn!(error = %e, "decryption failed; consuming encrypted message");
                    DecryptOutcome::Undecryptable(payload)
                }
            },
        }
    }

    fn decompress(
        &self,
        metadata: &MessageMetadata,
        payload: &[u8],
    ) -> Result<Bytes, DriftmqClientError> {
        let provider = self.compression.get_or_init(metadata.compression);
        provider.decompress(payload, metadata.uncompressed_size as usize)
    }

    /// Start-position filter. The exclusive branch treats the start id as
    /// the last id already seen, so the start itself is filtered too.
    fn should_discard(&self, id: &MessageId) -> bool {
        let start = match *self.start_message_id.lock() {
            Some(start) => start,
            None => return false,
        };
        // starting at latest never discards
        if start == MessageId::latest() {
            return false;
        }
        if self.options.start_message_id_inclusive {
            start.greater(id)
        } else {
            start.greater_equal(id)
        }
    }

    fn discard_corrupted(&self, wire_id: &MessageIdData, validation_error: ValidationError) {
        error!(
            message_id = ?wire_id,
            validation_error = ?validation_error,
            "discarding corrupted message"
        );
        self.send_no_wait(RequestCommand::Ack(CommandAck {
            consumer_id: self.consumer_id,
            message_ids: vec![wire_id.clone()],
            ack_type: Default::default(),
            validation_error: Some(validation_error),
        }));
    }

    fn build_message(
        &self,
        metadata: &MessageMetadata,
        smm: Option<&SingleMessageMetadata>,
        tracking: TrackingMessageId,
        payload: Bytes,
        redelivery_count: u32,
        encryption_context: Option<EncryptionContext>,
    ) -> Message {
        let (event_time, key, properties) = match smm {
            Some(smm) => (
                smm.event_time,
                smm.partition_key.clone(),
                smm.properties.clone(),
            ),
            None => (
                metadata.event_time,
                metadata.partition_key.clone(),
                metadata.properties.clone(),
            ),
        };
        Message {
            publish_time: metadata.publish_time,
            event_time,
            key,
            producer_name: metadata.producer_name.clone(),
            properties,
            topic: self.topic.clone(),
            msg_id: tracking,
            payload,
            schema: self.options.schema.clone(),
            replication_clusters: metadata.replicate_to.clone(),
            replicated_from: metadata.replicated_from.clone(),
            redelivery_count,
            encryption_context,
        }
    }

    async fn enqueue(&self, batch: Vec<Message>) {
        let count = batch.len() as u64;
        let bytes: u64 = batch.iter().map(|m| m.payload.len() as u64).sum();
        self.metrics.record_prefetched(count, bytes);
        if self.queue_tx.send(Some(batch)).await.is_err() {
            warn!("prefetch queue closed; dropping batch");
        }
    }

    // --- dispatcher access ---

    pub(crate) fn dlq(&self) -> &Arc<dyn DlqRouter> {
        &self.dlq
    }

    pub(crate) fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn message_sender(&self) -> mpsc::Sender<Message> {
        self.message_tx.clone()
    }

    pub(crate) fn note_dequeued(&self, id: MessageId) {
        *self.last_dequeued.lock() = Some(id);
    }

    pub(crate) fn bump_permits(&self) -> i32 {
        self.available_permits.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_permits(&self) {
        self.available_permits.store(0, Ordering::Release);
    }

    pub(crate) fn send_flow(&self, permits: u32) -> Result<(), DriftmqClientError> {
        if permits == 0 {
            return Err(DriftmqClientError::protocol(
                "invalid number of permits requested: 0",
            ));
        }
        self.send_no_wait(RequestCommand::Flow(CommandFlow {
            consumer_id: self.consumer_id,
            message_permits: permits,
        }));
        Ok(())
    }

    /// Non-blockingly drop everything buffered in the application channel.
    /// Skipped when the application is concurrently blocked in `receive`;
    /// the channel is being emptied on that side already.
    pub(crate) fn try_drain_messages(&self) {
        match self.message_rx.try_lock() {
            Ok(mut rx) => while rx.try_recv().is_ok() {},
            Err(_) => debug!("application channel receiver busy; skipping drain"),
        }
    }
}

#[async_trait]
impl ConsumeHandler for PartitionConsumer {
    async fn message_received(
        &self,
        cmd: CommandMessage,
        headers_and_payload: Bytes,
    ) -> Result<(), DriftmqClientError> {
        let wire_id = cmd.message_id.clone();

        let mut reader = PayloadReader::new(headers_and_payload);
        let metadata = match reader.read_metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                self.discard_corrupted(&wire_id, ValidationError::ChecksumMismatch);
                return Err(e);
            }
        };

        let encrypted = reader.take_remaining();
        let payload = match self.decrypt_if_needed(&wire_id, &metadata, encrypted) {
            DecryptOutcome::Clear(payload) => payload,
            DecryptOutcome::Discarded => return Ok(()),
            DecryptOutcome::Undecryptable(ciphertext) => {
                // delivered as a single opaque message, even when batched
                let id = MessageId::new(
                    wire_id.ledger_id as i64,
                    wire_id.entry_id as i64,
                    wire_id.batch_index.unwrap_or(-1),
                    self.partition_index,
                );
                let tracking = TrackingMessageId::new(
                    id,
                    Some(Arc::new(BatchAckTracker::new(1))),
                    self.self_ref.clone(),
                );
                self.metrics.record_received(1, ciphertext.len() as u64);
                let msg = self.build_message(
                    &metadata,
                    None,
                    tracking,
                    ciphertext,
                    cmd.redelivery_count,
                    Some(EncryptionContext::from_metadata(&metadata)),
                );
                self.enqueue(vec![msg]).await;
                return Ok(());
            }
        };

        let uncompressed = match self.decompress(&metadata, &payload) {
            Ok(uncompressed) => uncompressed,
            Err(e) => {
                self.discard_corrupted(&wire_id, ValidationError::DecompressionError);
                return Err(e);
            }
        };
        reader.reset(uncompressed);

        let num_messages = metadata.num_messages_in_batch.unwrap_or(1).max(1) as usize;
        let batch_tracker = (num_messages > 1).then(|| Arc::new(BatchAckTracker::new(num_messages)));

        let mut messages = Vec::with_capacity(num_messages);
        for i in 0..num_messages {
            let (smm, entry_payload) = if batch_tracker.is_some() {
                match reader.read_entry() {
                    Ok((smm, payload)) => (Some(smm), payload),
                    Err(e) => {
                        // the whole batch is unusable once one entry fails
                        self.discard_corrupted(&wire_id, ValidationError::BatchDeSerializeError);
                        return Err(e);
                    }
                }
            } else {
                (None, reader.take_remaining())
            };

            let id = MessageId::new(
                wire_id.ledger_id as i64,
                wire_id.entry_id as i64,
                if batch_tracker.is_some() { i as i32 } else { -1 },
                self.partition_index,
            );
            let tracker = batch_tracker
                .clone()
                .unwrap_or_else(|| Arc::new(BatchAckTracker::new(1)));
            let tracking = TrackingMessageId::new(id, Some(tracker), self.self_ref.clone());
            self.metrics.record_received(1, entry_payload.len() as u64);

            if self.should_discard(&id) {
                let _ = self.ack_id(&tracking).await;
                continue;
            }

            let mut msg = self.build_message(
                &metadata,
                smm.as_ref(),
                tracking,
                entry_payload,
                cmd.redelivery_count,
                None,
            );
            self.options.interceptors.before_consume(&mut msg);
            messages.push(msg);
        }

        if messages.is_empty() {
            return Ok(());
        }
        self.enqueue(messages).await;
        Ok(())
    }

    fn connection_closed(&self) {
        debug!(consumer_id = self.consumer_id, "connection closed notification");
        let _ = self.conn_closed_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConsumerState::Initializing.to_string(), "Initializing");
        assert_eq!(ConsumerState::Ready.to_string(), "Ready");
        assert_eq!(ConsumerState::Closing.to_string(), "Closing");
        assert_eq!(ConsumerState::Closed.to_string(), "Closed");
    }

    #[test]
    fn test_flow_threshold_floor() {
        // queue sizes of 1 and 2 still open a window of at least one permit
        for queue_size in [1usize, 2, 3, 1000] {
            let threshold = (queue_size / 2).max(1);
            assert!(threshold >= 1);
            assert!(threshold <= queue_size);
        }
    }
}
