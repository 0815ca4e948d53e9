//! The chat application: a deterministic state machine replicated through
//! Raft (accounts, messages, read-state), and the gateway-side engine that
//! submits commands to it.

mod engine;
mod state;

pub use engine::{Engine, Mutation, Query, Write};
pub use state::{State, StreamEvent, Subscriptions};

use serde_derive::{Deserialize, Serialize};
use sha2::Digest as _;

/// A message ID, unique across the cluster. Assigned by the state machine
/// at apply time, so every replica computes the same ID.
pub type MessageId = u64;

/// A chat message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The message ID.
    pub id: MessageId,
    /// The sending user. Kept as a plain string, so it survives deletion of
    /// the sender's account.
    pub sender: String,
    /// The receiving user.
    pub recipient: String,
    /// The message content.
    pub content: String,
    /// Unix timestamp, assigned by the gateway when the send was submitted.
    pub timestamp: u64,
    /// Whether the recipient has read the message. Only ever transitions
    /// from false to true.
    pub read: bool,
}

/// A user account summary, as returned by account listings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// The username.
    pub username: String,
    /// Unix timestamp of account creation.
    pub created_at: u64,
}

/// Hashes a password for storage and comparison, as a hex-encoded SHA-256
/// digest. Hashing happens at the gateway, so log commands and the state
/// machine only ever see digests.
pub fn hash_password(password: &str) -> String {
    hex::encode(sha2::Sha256::digest(password.as_bytes()))
}

/// Returns the current unix timestamp in seconds. Timestamps are assigned
/// by the gateway when a command is created and carried inside it, so that
/// command application is deterministic across replicas.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|t| t.as_secs())
        .unwrap_or_default()
}
