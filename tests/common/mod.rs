//! In-process mock broker for exercising the partition consumer end to end.
//!
//! Records every outbound command, answers RPCs with scripted or default
//! responses, and can inject message frames and connection loss through the
//! registered consume handler.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use driftmq_client::connection::{
    Connection, ConsumeHandler, LookupResult, LookupService, RpcClient, RpcResult,
};
use driftmq_client::protocol::{
    encode_entry, encode_metadata, CommandAck, CommandError, CommandGetLastMessageIdResponse,
    CommandMessage, CommandSeek, CommandSubscribe, CommandSuccess, CommandType, MessageIdData,
    MessageMetadata, RequestCommand, ResponseCommand, SingleMessageMetadata,
};
use driftmq_client::{DlqRouter, DriftmqClientError, Message, MessageId, NackTracker};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;

static TRACING: Once = Once::new();

/// Route consumer logs through the test harness; `RUST_LOG` filters as usual
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Connection stub that only routes consume handlers
#[derive(Default)]
pub struct MockConnection {
    handlers: Mutex<HashMap<u64, Arc<dyn ConsumeHandler>>>,
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("handlers", &self.handlers.lock().unwrap().len())
            .finish()
    }
}

impl Connection for MockConnection {
    fn add_consume_handler(&self, consumer_id: u64, handler: Arc<dyn ConsumeHandler>) {
        self.handlers.lock().unwrap().insert(consumer_id, handler);
    }

    fn delete_consume_handler(&self, consumer_id: u64) {
        self.handlers.lock().unwrap().remove(&consumer_id);
    }
}

impl MockConnection {
    pub fn handler(&self, consumer_id: u64) -> Option<Arc<dyn ConsumeHandler>> {
        self.handlers.lock().unwrap().get(&consumer_id).cloned()
    }

    pub fn has_handler(&self, consumer_id: u64) -> bool {
        self.handlers.lock().unwrap().contains_key(&consumer_id)
    }
}

/// Scripted broker: lookup service and RPC client in one
pub struct MockBroker {
    pub cnx: Arc<MockConnection>,
    commands: Mutex<Vec<RequestCommand>>,
    responses: Mutex<HashMap<CommandType, VecDeque<ResponseCommand>>>,
    consumer_ids: AtomicU64,
    request_ids: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cnx: Arc::new(MockConnection::default()),
            commands: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            consumer_ids: AtomicU64::new(0),
            request_ids: AtomicU64::new(0),
        })
    }

    /// Queue a response for the next command of the given type; falls back
    /// to `Success` (or an empty get-last result) when nothing is scripted.
    pub fn script_response(&self, command_type: CommandType, response: ResponseCommand) {
        self.responses
            .lock()
            .unwrap()
            .entry(command_type)
            .or_default()
            .push_back(response);
    }

    pub fn script_error(&self, command_type: CommandType, error: &str, message: &str) {
        self.script_response(
            command_type,
            ResponseCommand::Error(CommandError {
                request_id: 0,
                error: error.to_string(),
                message: message.to_string(),
            }),
        );
    }

    fn respond(&self, cmd: &RequestCommand) -> ResponseCommand {
        if let Some(scripted) = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&cmd.command_type())
            .and_then(|queue| queue.pop_front())
        {
            return scripted;
        }
        match cmd {
            RequestCommand::GetLastMessageId(_) => {
                ResponseCommand::GetLastMessageIdResponse(CommandGetLastMessageIdResponse {
                    request_id: 0,
                    last_message_id: MessageIdData {
                        ledger_id: 0,
                        entry_id: (-1i64) as u64,
                        batch_index: None,
                        partition: None,
                    },
                })
            }
            _ => ResponseCommand::Success(CommandSuccess::default()),
        }
    }

    pub fn commands(&self) -> Vec<RequestCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count_of(&self, command_type: CommandType) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|cmd| cmd.command_type() == command_type)
            .count()
    }

    /// Permits of every recorded `Flow`, in order
    pub fn flows(&self) -> Vec<u32> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cmd| match cmd {
                RequestCommand::Flow(flow) => Some(flow.message_permits),
                _ => None,
            })
            .collect()
    }

    /// Recorded acks without a validation error (application acks)
    pub fn acks(&self) -> Vec<CommandAck> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cmd| match cmd {
                RequestCommand::Ack(ack) if ack.validation_error.is_none() => Some(ack.clone()),
                _ => None,
            })
            .collect()
    }

    /// Recorded acks carrying a validation error (discards)
    pub fn discard_acks(&self) -> Vec<CommandAck> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cmd| match cmd {
                RequestCommand::Ack(ack) if ack.validation_error.is_some() => Some(ack.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn subscribes(&self) -> Vec<CommandSubscribe> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cmd| match cmd {
                RequestCommand::Subscribe(sub) => Some(sub.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn seeks(&self) -> Vec<CommandSeek> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cmd| match cmd {
                RequestCommand::Seek(seek) => Some(seek.clone()),
                _ => None,
            })
            .collect()
    }

    /// Push one non-batched message frame through the consume handler
    pub async fn deliver_single(&self, consumer_id: u64, ledger: u64, entry: u64, payload: &[u8]) {
        self.deliver_single_redelivered(consumer_id, ledger, entry, payload, 0)
            .await;
    }

    pub async fn deliver_single_redelivered(
        &self,
        consumer_id: u64,
        ledger: u64,
        entry: u64,
        payload: &[u8],
        redelivery_count: u32,
    ) {
        let frame = single_frame(payload);
        let cmd = CommandMessage {
            consumer_id,
            message_id: MessageIdData {
                ledger_id: ledger,
                entry_id: entry,
                batch_index: None,
                partition: Some(0),
            },
            redelivery_count,
        };
        self.deliver_frame(consumer_id, cmd, frame)
            .await
            .expect("frame delivery failed");
    }

    /// Push one batched frame with the given per-entry payloads
    pub async fn deliver_batch(
        &self,
        consumer_id: u64,
        ledger: u64,
        entry: u64,
        payloads: &[&[u8]],
    ) {
        let frame = batch_frame(payloads);
        let cmd = CommandMessage {
            consumer_id,
            message_id: MessageIdData {
                ledger_id: ledger,
                entry_id: entry,
                batch_index: None,
                partition: Some(0),
            },
            redelivery_count: 0,
        };
        self.deliver_frame(consumer_id, cmd, frame)
            .await
            .expect("frame delivery failed");
    }

    pub async fn deliver_frame(
        &self,
        consumer_id: u64,
        cmd: CommandMessage,
        frame: Bytes,
    ) -> Result<(), DriftmqClientError> {
        let handler = self
            .cnx
            .handler(consumer_id)
            .expect("no consume handler registered");
        handler.message_received(cmd, frame).await
    }

    /// Simulate broker-session loss
    pub fn drop_connection(&self, consumer_id: u64) {
        let handler = self
            .cnx
            .handler(consumer_id)
            .expect("no consume handler registered");
        handler.connection_closed();
    }
}

#[async_trait]
impl LookupService for MockBroker {
    async fn lookup(&self, _topic: &str) -> Result<LookupResult, DriftmqClientError> {
        Ok(LookupResult {
            logical_addr: "driftmq://broker-1:6650".to_string(),
            physical_addr: "broker-1:6650".to_string(),
        })
    }
}

#[async_trait]
impl RpcClient for MockBroker {
    fn new_consumer_id(&self) -> u64 {
        self.consumer_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn new_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn request(
        &self,
        _logical_addr: &str,
        _physical_addr: &str,
        _request_id: u64,
        cmd: RequestCommand,
    ) -> Result<RpcResult, DriftmqClientError> {
        let response = self.respond(&cmd);
        self.commands.lock().unwrap().push(cmd);
        Ok(RpcResult {
            response,
            cnx: self.cnx.clone(),
        })
    }

    async fn request_on_cnx(
        &self,
        _cnx: Arc<dyn Connection>,
        _request_id: u64,
        cmd: RequestCommand,
    ) -> Result<RpcResult, DriftmqClientError> {
        let response = self.respond(&cmd);
        self.commands.lock().unwrap().push(cmd);
        Ok(RpcResult {
            response,
            cnx: self.cnx.clone(),
        })
    }

    fn request_on_cnx_no_wait(
        &self,
        _cnx: Arc<dyn Connection>,
        cmd: RequestCommand,
    ) -> Result<(), DriftmqClientError> {
        self.commands.lock().unwrap().push(cmd);
        Ok(())
    }
}

/// DLQ router diverting messages at a redelivery-count threshold
pub struct MockDlq {
    tx: mpsc::Sender<Message>,
    threshold: Option<u32>,
}

impl MockDlq {
    /// Router that never diverts
    pub fn disabled() -> (Arc<Self>, mpsc::Receiver<Message>) {
        Self::with_threshold(None)
    }

    pub fn with_threshold(threshold: Option<u32>) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        (Arc::new(Self { tx, threshold }), rx)
    }
}

impl DlqRouter for MockDlq {
    fn should_send_to_dlq(&self, msg: &Message) -> bool {
        match self.threshold {
            Some(threshold) => msg.redelivery_count >= threshold,
            None => false,
        }
    }

    fn chan(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }
}

/// Recording negative-ack tracker
#[derive(Default)]
pub struct MockNacks {
    pub added: Mutex<Vec<MessageId>>,
    pub closed: AtomicBool,
}

impl NackTracker for MockNacks {
    fn add(&self, id: MessageId) {
        self.added.lock().unwrap().push(id);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Non-batched frame: metadata header followed by the raw payload
pub fn single_frame(payload: &[u8]) -> Bytes {
    let meta = MessageMetadata {
        producer_name: "producer-a".to_string(),
        publish_time: 1_700_000_000_000,
        uncompressed_size: payload.len() as u32,
        ..Default::default()
    };
    let mut buf = BytesMut::new();
    encode_metadata(&mut buf, &meta);
    buf.put_slice(payload);
    buf.freeze()
}

/// Batched frame with one entry per payload
pub fn batch_frame(payloads: &[&[u8]]) -> Bytes {
    let mut body = BytesMut::new();
    for payload in payloads {
        encode_entry(&mut body, &SingleMessageMetadata::default(), payload);
    }
    let meta = MessageMetadata {
        producer_name: "producer-a".to_string(),
        publish_time: 1_700_000_000_000,
        uncompressed_size: body.len() as u32,
        num_messages_in_batch: Some(payloads.len() as i32),
        ..Default::default()
    };
    let mut buf = BytesMut::new();
    encode_metadata(&mut buf, &meta);
    buf.put_slice(&body);
    buf.freeze()
}

/// Frame whose payload is ciphertext: metadata carries encryption keys
pub fn encrypted_frame(ciphertext: &[u8], batch_size: i32) -> Bytes {
    let meta = MessageMetadata {
        producer_name: "producer-a".to_string(),
        publish_time: 1_700_000_000_000,
        uncompressed_size: ciphertext.len() as u32,
        num_messages_in_batch: (batch_size > 1).then_some(batch_size),
        encryption_keys: vec![driftmq_client::protocol::EncryptionKeyData {
            key: "key-a".to_string(),
            value: vec![0xde, 0xad],
            metadata: HashMap::new(),
        }],
        encryption_algo: Some("aes-gcm".to_string()),
        encryption_param: Some(vec![1, 2, 3]),
        ..Default::default()
    };
    let mut buf = BytesMut::new();
    encode_metadata(&mut buf, &meta);
    buf.put_slice(ciphertext);
    buf.freeze()
}

/// Poll `condition` every 10ms for up to two seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
