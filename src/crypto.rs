//! Decryption contracts for end-to-end encrypted messages.
//!
//! The cryptographer and key reader are external collaborators; the consumer
//! only drives them and applies the configured failure policy.

use crate::error::DriftmqClientError;
use crate::protocol::MessageMetadata;
use bytes::Bytes;
use std::collections::HashMap;

/// Policy applied when a message cannot be decrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoFailureAction {
    /// Deliver the ciphertext to the application, flagged undecryptable
    Consume,
    /// Ack the message back to the broker with a decryption error and drop it
    Discard,
    /// Drop the message without acking; it stays pending on the broker
    #[default]
    FailConsume,
}

/// Key material returned by a [`CryptoKeyReader`]
#[derive(Debug, Clone)]
pub struct EncryptionKeyInfo {
    pub key: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// Resolves named decryption keys
pub trait CryptoKeyReader: Send + Sync {
    fn private_key(
        &self,
        key_name: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<EncryptionKeyInfo, DriftmqClientError>;
}

/// Decrypts message payloads using keys resolved through a [`CryptoKeyReader`]
pub trait MessageCrypto: Send + Sync {
    fn decrypt(
        &self,
        metadata: &MessageMetadata,
        payload: &[u8],
        key_reader: &dyn CryptoKeyReader,
    ) -> Result<Vec<u8>, DriftmqClientError>;
}

/// Outcome of the decrypt step of the receive pipeline
#[derive(Debug)]
pub(crate) enum DecryptOutcome {
    /// Plaintext, ready for decompression and deframing
    Clear(Bytes),
    /// Ciphertext delivered as-is under [`CryptoFailureAction::Consume`];
    /// never decompressed or deframed
    Undecryptable(Bytes),
    /// Dropped, with or without a broker-side discard ack
    Discarded,
}
