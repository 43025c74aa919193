//! Wire command types and payload codec for DriftMQ client communication.
//!
//! The framed TCP transport lives in the connection layer; this module only
//! defines the command structures exchanged through it, plus the binary
//! layout of the `Message` frame payload (a metadata header followed by a
//! bare payload, or by N single-message entries when batched).

use crate::error::DriftmqClientError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::config::{InitialPosition, KeySharedPolicy, SchemaInfo, SubscriptionType};

/// Compression codec carried in the message metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CompressionType {
    #[default]
    None = 0,
    Lz4 = 1,
    Zlib = 2,
    Zstd = 3,
}

impl TryFrom<u8> for CompressionType {
    type Error = DriftmqClientError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            2 => Ok(CompressionType::Zlib),
            3 => Ok(CompressionType::Zstd),
            other => Err(DriftmqClientError::protocol(format!(
                "unsupported compression type: {}",
                other
            ))),
        }
    }
}

/// Reason attached to a broker-side discard ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    UncompressedSizeCorruption,
    DecompressionError,
    ChecksumMismatch,
    BatchDeSerializeError,
    DecryptionError,
}

/// Ack granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckType {
    #[default]
    Individual,
    Cumulative,
}

/// Wire form of a message id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdData {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub batch_index: Option<i32>,
    pub partition: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct CommandSubscribe {
    pub topic: String,
    pub subscription: String,
    pub sub_type: SubscriptionType,
    pub consumer_id: u64,
    pub request_id: u64,
    pub consumer_name: String,
    /// Durable cursor retained by the broker
    pub durable: bool,
    /// Resume position; only carried for non-durable subscriptions
    pub start_message_id: Option<MessageIdData>,
    pub initial_position: InitialPosition,
    pub metadata: HashMap<String, String>,
    pub read_compacted: bool,
    pub replicate_subscription_state: bool,
    pub key_shared_policy: Option<KeySharedPolicy>,
    pub schema: Option<SchemaInfo>,
    /// Topic creation is on by default on the wire; carried only to disable
    pub force_topic_creation: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct CommandFlow {
    pub consumer_id: u64,
    pub message_permits: u32,
}

#[derive(Debug, Clone)]
pub struct CommandAck {
    pub consumer_id: u64,
    pub message_ids: Vec<MessageIdData>,
    pub ack_type: AckType,
    pub validation_error: Option<ValidationError>,
}

#[derive(Debug, Clone)]
pub struct CommandRedeliverUnacknowledgedMessages {
    pub consumer_id: u64,
    pub message_ids: Vec<MessageIdData>,
}

#[derive(Debug, Clone)]
pub struct CommandSeek {
    pub consumer_id: u64,
    pub request_id: u64,
    pub message_id: Option<MessageIdData>,
    /// Unix milliseconds; set instead of `message_id` when seeking by time
    pub message_publish_time: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CommandUnsubscribe {
    pub request_id: u64,
    pub consumer_id: u64,
}

#[derive(Debug, Clone)]
pub struct CommandCloseConsumer {
    pub request_id: u64,
    pub consumer_id: u64,
}

#[derive(Debug, Clone)]
pub struct CommandGetLastMessageId {
    pub request_id: u64,
    pub consumer_id: u64,
}

/// Inbound frame header announcing a pushed message
#[derive(Debug, Clone)]
pub struct CommandMessage {
    pub consumer_id: u64,
    pub message_id: MessageIdData,
    pub redelivery_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CommandSuccess {
    pub request_id: u64,
    /// Broker-assigned consumer name on subscribe success
    pub consumer_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandError {
    pub request_id: u64,
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CommandGetLastMessageIdResponse {
    pub request_id: u64,
    pub last_message_id: MessageIdData,
}

/// Client-to-broker command enum
#[derive(Debug, Clone)]
pub enum RequestCommand {
    Subscribe(CommandSubscribe),
    Flow(CommandFlow),
    Ack(CommandAck),
    RedeliverUnacknowledgedMessages(CommandRedeliverUnacknowledgedMessages),
    Seek(CommandSeek),
    Unsubscribe(CommandUnsubscribe),
    CloseConsumer(CommandCloseConsumer),
    GetLastMessageId(CommandGetLastMessageId),
}

impl RequestCommand {
    pub fn command_type(&self) -> CommandType {
        match self {
            RequestCommand::Subscribe(_) => CommandType::Subscribe,
            RequestCommand::Flow(_) => CommandType::Flow,
            RequestCommand::Ack(_) => CommandType::Ack,
            RequestCommand::RedeliverUnacknowledgedMessages(_) => {
                CommandType::RedeliverUnacknowledgedMessages
            }
            RequestCommand::Seek(_) => CommandType::Seek,
            RequestCommand::Unsubscribe(_) => CommandType::Unsubscribe,
            RequestCommand::CloseConsumer(_) => CommandType::CloseConsumer,
            RequestCommand::GetLastMessageId(_) => CommandType::GetLastMessageId,
        }
    }
}

/// Broker-to-client command enum for RPC responses
#[derive(Debug, Clone)]
pub enum ResponseCommand {
    Success(CommandSuccess),
    Error(CommandError),
    GetLastMessageIdResponse(CommandGetLastMessageIdResponse),
}

impl ResponseCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseCommand::Success(_) => "Success",
            ResponseCommand::Error(_) => "Error",
            ResponseCommand::GetLastMessageIdResponse(_) => "GetLastMessageIdResponse",
        }
    }
}

/// Command discriminant, used for request routing and test assertions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Subscribe,
    Flow,
    Ack,
    RedeliverUnacknowledgedMessages,
    Seek,
    Unsubscribe,
    CloseConsumer,
    GetLastMessageId,
}

/// Metadata header prefixed to every `Message` frame payload
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    pub producer_name: String,
    /// Unix milliseconds
    pub publish_time: u64,
    pub event_time: Option<u64>,
    pub partition_key: Option<String>,
    pub properties: HashMap<String, String>,
    pub replicate_to: Vec<String>,
    pub replicated_from: Option<String>,
    pub compression: CompressionType,
    pub uncompressed_size: u32,
    /// Absent or 1 for non-batched frames
    pub num_messages_in_batch: Option<i32>,
    pub encryption_keys: Vec<EncryptionKeyData>,
    pub encryption_algo: Option<String>,
    pub encryption_param: Option<Vec<u8>>,
}

/// Wire form of one encryption key entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKeyData {
    pub key: String,
    pub value: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// Per-entry metadata inside a batched frame
#[derive(Debug, Clone, Default)]
pub struct SingleMessageMetadata {
    pub partition_key: Option<String>,
    pub properties: HashMap<String, String>,
    pub event_time: Option<u64>,
}

// --- binary helpers, length conventions as in the broker codec ---

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => put_string(buf, s),
        None => buf.put_i16(-1),
    }
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

fn put_opt_bytes(buf: &mut BytesMut, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => put_bytes(buf, b),
        None => buf.put_i32(-1),
    }
}

fn put_opt_u64(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64(v);
        }
        None => buf.put_u8(0),
    }
}

fn put_opt_i32(buf: &mut BytesMut, value: Option<i32>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_i32(v);
        }
        None => buf.put_u8(0),
    }
}

fn put_properties(buf: &mut BytesMut, props: &HashMap<String, String>) {
    buf.put_u32(props.len() as u32);
    for (k, v) in props {
        put_string(buf, k);
        put_string(buf, v);
    }
}

fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<(), DriftmqClientError> {
    if buf.remaining() < needed {
        return Err(DriftmqClientError::protocol(format!(
            "truncated frame while reading {}",
            what
        )));
    }
    Ok(())
}

fn get_string(buf: &mut Bytes) -> Result<Option<String>, DriftmqClientError> {
    ensure(buf, 2, "string length")?;
    let len = buf.get_i16();
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(DriftmqClientError::protocol("invalid string length"));
    }
    ensure(buf, len as usize, "string body")?;
    let raw = buf.split_to(len as usize);
    let s = String::from_utf8(raw.to_vec())
        .map_err(|_| DriftmqClientError::protocol("invalid UTF-8 string"))?;
    Ok(Some(s))
}

fn get_required_string(buf: &mut Bytes) -> Result<String, DriftmqClientError> {
    get_string(buf)?.ok_or_else(|| DriftmqClientError::protocol("missing required string"))
}

fn get_bytes(buf: &mut Bytes) -> Result<Option<Bytes>, DriftmqClientError> {
    ensure(buf, 4, "bytes length")?;
    let len = buf.get_i32();
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(DriftmqClientError::protocol("invalid bytes length"));
    }
    ensure(buf, len as usize, "bytes body")?;
    Ok(Some(buf.split_to(len as usize)))
}

fn get_opt_u64(buf: &mut Bytes) -> Result<Option<u64>, DriftmqClientError> {
    ensure(buf, 1, "optional tag")?;
    match buf.get_u8() {
        0 => Ok(None),
        1 => {
            ensure(buf, 8, "u64 value")?;
            Ok(Some(buf.get_u64()))
        }
        _ => Err(DriftmqClientError::protocol("invalid optional tag")),
    }
}

fn get_opt_i32(buf: &mut Bytes) -> Result<Option<i32>, DriftmqClientError> {
    ensure(buf, 1, "optional tag")?;
    match buf.get_u8() {
        0 => Ok(None),
        1 => {
            ensure(buf, 4, "i32 value")?;
            Ok(Some(buf.get_i32()))
        }
        _ => Err(DriftmqClientError::protocol("invalid optional tag")),
    }
}

fn get_properties(buf: &mut Bytes) -> Result<HashMap<String, String>, DriftmqClientError> {
    ensure(buf, 4, "property count")?;
    let count = buf.get_u32() as usize;
    let mut props = HashMap::with_capacity(count.min(1024));
    for _ in 0..count {
        let k = get_required_string(buf)?;
        let v = get_required_string(buf)?;
        props.insert(k, v);
    }
    Ok(props)
}

/// Encode the metadata header, length-prefixed, into `dst`.
pub fn encode_metadata(dst: &mut BytesMut, meta: &MessageMetadata) {
    let mut block = BytesMut::new();
    put_string(&mut block, &meta.producer_name);
    block.put_u64(meta.publish_time);
    put_opt_u64(&mut block, meta.event_time);
    put_opt_string(&mut block, meta.partition_key.as_deref());
    put_properties(&mut block, &meta.properties);
    block.put_u32(meta.replicate_to.len() as u32);
    for cluster in &meta.replicate_to {
        put_string(&mut block, cluster);
    }
    put_opt_string(&mut block, meta.replicated_from.as_deref());
    block.put_u8(meta.compression as u8);
    block.put_u32(meta.uncompressed_size);
    put_opt_i32(&mut block, meta.num_messages_in_batch);
    block.put_u32(meta.encryption_keys.len() as u32);
    for key in &meta.encryption_keys {
        put_string(&mut block, &key.key);
        put_bytes(&mut block, &key.value);
        put_properties(&mut block, &key.metadata);
    }
    put_opt_string(&mut block, meta.encryption_algo.as_deref());
    put_opt_bytes(&mut block, meta.encryption_param.as_deref());

    dst.put_u32(block.len() as u32);
    dst.put_slice(&block);
}

/// Encode one batch entry (single-message metadata plus payload) into `dst`.
pub fn encode_entry(dst: &mut BytesMut, smm: &SingleMessageMetadata, payload: &[u8]) {
    let mut block = BytesMut::new();
    put_opt_string(&mut block, smm.partition_key.as_deref());
    put_properties(&mut block, &smm.properties);
    put_opt_u64(&mut block, smm.event_time);

    dst.put_u32(block.len() as u32);
    dst.put_slice(&block);
    put_bytes(dst, payload);
}

/// Reader over a `Message` frame payload. Consumes the metadata header first;
/// the remainder is either the bare payload or a run of batch entries.
#[derive(Debug)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Replace the underlying buffer, e.g. after decompression.
    pub fn reset(&mut self, buf: Bytes) {
        self.buf = buf;
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Take everything left unread; used for non-batched payloads and for
    /// handing the post-metadata slice to decryption.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }

    pub fn read_metadata(&mut self) -> Result<MessageMetadata, DriftmqClientError> {
        ensure(&self.buf, 4, "metadata length")?;
        let len = self.buf.get_u32() as usize;
        ensure(&self.buf, len, "metadata block")?;
        let mut block = self.buf.split_to(len);

        let producer_name = get_required_string(&mut block)?;
        ensure(&block, 8, "publish time")?;
        let publish_time = block.get_u64();
        let event_time = get_opt_u64(&mut block)?;
        let partition_key = get_string(&mut block)?;
        let properties = get_properties(&mut block)?;
        ensure(&block, 4, "replicate-to count")?;
        let cluster_count = block.get_u32() as usize;
        let mut replicate_to = Vec::with_capacity(cluster_count.min(64));
        for _ in 0..cluster_count {
            replicate_to.push(get_required_string(&mut block)?);
        }
        let replicated_from = get_string(&mut block)?;
        ensure(&block, 5, "compression and uncompressed size")?;
        let compression = CompressionType::try_from(block.get_u8())?;
        let uncompressed_size = block.get_u32();
        let num_messages_in_batch = get_opt_i32(&mut block)?;
        ensure(&block, 4, "encryption key count")?;
        let key_count = block.get_u32() as usize;
        let mut encryption_keys = Vec::with_capacity(key_count.min(64));
        for _ in 0..key_count {
            let key = get_required_string(&mut block)?;
            let value = get_bytes(&mut block)?
                .ok_or_else(|| DriftmqClientError::protocol("missing encryption key value"))?;
            let metadata = get_properties(&mut block)?;
            encryption_keys.push(EncryptionKeyData {
                key,
                value: value.to_vec(),
                metadata,
            });
        }
        let encryption_algo = get_string(&mut block)?;
        let encryption_param = get_bytes(&mut block)?.map(|b| b.to_vec());

        Ok(MessageMetadata {
            producer_name,
            publish_time,
            event_time,
            partition_key,
            properties,
            replicate_to,
            replicated_from,
            compression,
            uncompressed_size,
            num_messages_in_batch,
            encryption_keys,
            encryption_algo,
            encryption_param,
        })
    }

    /// Read one batch entry: its single-message metadata and payload.
    pub fn read_entry(&mut self) -> Result<(SingleMessageMetadata, Bytes), DriftmqClientError> {
        ensure(&self.buf, 4, "entry metadata length")?;
        let len = self.buf.get_u32() as usize;
        ensure(&self.buf, len, "entry metadata block")?;
        let mut block = self.buf.split_to(len);

        let partition_key = get_string(&mut block)?;
        let properties = get_properties(&mut block)?;
        let event_time = get_opt_u64(&mut block)?;

        let payload = get_bytes(&mut self.buf)?
            .ok_or_else(|| DriftmqClientError::protocol("missing entry payload"))?;

        Ok((
            SingleMessageMetadata {
                partition_key,
                properties,
                event_time,
            },
            payload,
        ))
    }
}
