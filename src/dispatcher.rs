//! Dispatcher actor: moves messages from the prefetch queue to the
//! application (or dead-letter) channel and owns flow-control accounting.
//!
//! Being the sole writer to the application channel and the sole issuer of
//! `Flow` commands keeps permit accounting race-free without locks.

use crate::consumer::PartitionConsumer;
use crate::message::{Message, MessageId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

pub(crate) struct Dispatcher {
    consumer: Arc<PartitionConsumer>,
    queue_rx: mpsc::Receiver<Option<Vec<Message>>>,
    /// Used to inject the drain sentinel into the prefetch queue
    queue_tx: mpsc::Sender<Option<Vec<Message>>>,
    connected_rx: mpsc::Receiver<()>,
    clear_queue_rx: mpsc::Receiver<oneshot::Sender<Option<MessageId>>>,
    clear_queues_rx: mpsc::Receiver<oneshot::Sender<()>>,
    /// Batch currently being handed out, head first
    current: VecDeque<Message>,
}

impl Dispatcher {
    pub(crate) fn new(
        consumer: Arc<PartitionConsumer>,
        queue_rx: mpsc::Receiver<Option<Vec<Message>>>,
        queue_tx: mpsc::Sender<Option<Vec<Message>>>,
        connected_rx: mpsc::Receiver<()>,
        clear_queue_rx: mpsc::Receiver<oneshot::Sender<Option<MessageId>>>,
        clear_queues_rx: mpsc::Receiver<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            consumer,
            queue_rx,
            queue_tx,
            connected_rx,
            clear_queue_rx,
            clear_queues_rx,
            current: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("dispatch loop started");
        loop {
            let deliver = !self.current.is_empty();
            // pick the target for the head message up front; the reserve
            // below is only polled while there is something to deliver
            let (target_tx, to_dlq) = match self.current.front() {
                Some(head) if self.consumer.dlq().should_send_to_dlq(head) => {
                    (self.consumer.dlq().chan(), true)
                }
                _ => (self.consumer.message_sender(), false),
            };

            tokio::select! {
                _ = self.consumer.shutdown_token().cancelled() => {
                    debug!("exiting dispatch loop");
                    return;
                }

                event = self.connected_rx.recv() => {
                    if event.is_none() {
                        return;
                    }
                    self.on_connected();
                }

                batch = self.queue_rx.recv(), if !deliver => {
                    match batch {
                        None => return,
                        Some(Some(messages)) => self.current = messages.into(),
                        // stray drain sentinel from an earlier clear
                        Some(None) => {}
                    }
                }

                permit = target_tx.reserve(), if deliver => {
                    match permit {
                        Ok(permit) => {
                            let Some(msg) = self.current.pop_front() else {
                                continue;
                            };
                            let id = msg.id();
                            self.consumer.metrics().record_dispatched(msg.payload.len() as u64);
                            if to_dlq {
                                self.consumer.metrics().record_dlq();
                            }
                            self.consumer.note_dequeued(id);
                            permit.send(msg);

                            let permits = self.consumer.bump_permits();
                            let threshold = (self.consumer.queue_size() / 2).max(1) as i32;
                            if permits >= threshold {
                                self.consumer.reset_permits();
                                debug!(permits, "requesting more permits");
                                if let Err(e) = self.consumer.send_flow(permits as u32) {
                                    error!(error = %e, "unable to send permits");
                                }
                            }
                        }
                        Err(_) => {
                            warn!("delivery channel closed; dropping message");
                            if let Some(msg) = self.current.pop_front() {
                                self.consumer.metrics().record_dispatched(msg.payload.len() as u64);
                            }
                        }
                    }
                }

                request = self.clear_queue_rx.recv() => {
                    match request {
                        Some(callback) => self.clear_for_reconnect(callback).await,
                        None => return,
                    }
                }

                request = self.clear_queues_rx.recv() => {
                    match request {
                        Some(done) => self.clear_for_seek(done),
                        None => return,
                    }
                }
            }
        }
    }

    /// New broker session: everything buffered belongs to the old session.
    fn on_connected(&mut self) {
        debug!("dispatcher received connection event");
        self.drop_current();
        self.consumer.reset_permits();
        let initial = self.consumer.queue_size() as u32;
        debug!(permits = initial, "requesting initial permits");
        if let Err(e) = self.consumer.send_flow(initial) {
            error!(error = %e, "unable to send initial permits");
        }
    }

    /// Drain the prefetch queue up to a sentinel, remembering the first id
    /// seen so the caller can compute the resume position.
    async fn clear_for_reconnect(&mut self, callback: oneshot::Sender<Option<MessageId>>) {
        let sentinel_tx = self.queue_tx.clone();
        tokio::spawn(async move {
            let _ = sentinel_tx.send(None).await;
        });

        let mut next_in_queue: Option<MessageId> = None;
        while let Some(item) = self.queue_rx.recv().await {
            match item {
                None => break,
                Some(batch) => {
                    if next_in_queue.is_none() {
                        next_in_queue = batch.first().map(|m| m.id());
                    }
                    for msg in &batch {
                        self.consumer
                            .metrics()
                            .record_dispatched(msg.payload.len() as u64);
                    }
                }
            }
        }

        let _ = callback.send(next_in_queue);
    }

    /// Seek support: drop everything buffered client-side and re-open the
    /// flow window.
    fn clear_for_seek(&mut self, done: oneshot::Sender<()>) {
        while let Ok(item) = self.queue_rx.try_recv() {
            if let Some(batch) = item {
                for msg in &batch {
                    self.consumer
                        .metrics()
                        .record_dispatched(msg.payload.len() as u64);
                }
            }
        }
        self.consumer.try_drain_messages();
        self.drop_current();

        self.consumer.reset_permits();
        let initial = self.consumer.queue_size() as u32;
        debug!(permits = initial, "requesting initial permits after seek");
        if let Err(e) = self.consumer.send_flow(initial) {
            error!(error = %e, "unable to send initial permits");
        }

        let _ = done.send(());
    }

    fn drop_current(&mut self) {
        for msg in self.current.drain(..) {
            self.consumer
                .metrics()
                .record_dispatched(msg.payload.len() as u64);
        }
    }
}
