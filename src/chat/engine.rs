use super::{hash_password, now, Account, Message, MessageId};
use crate::encoding::{bincode, Value as _};
use crate::error::Result;
use crate::raft;

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat state machine write, wrapped with the client's idempotency key.
/// Retried writes reuse the same (client_id, seq) pair, and the state
/// machine returns the cached result instead of re-executing them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Write {
    /// The submitting client.
    pub client_id: Uuid,
    /// The client's request sequence number, strictly increasing.
    pub seq: u64,
    /// The mutation to apply.
    pub mutation: Mutation,
}

/// A chat state machine mutation. Timestamps are assigned by the gateway at
/// submission, so application is deterministic on every replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Creates a user account. Fails if the name is taken; re-registering a
    /// deleted name creates a fresh account.
    Register { username: String, password_hash: String, timestamp: u64 },
    /// Deletes a user account and its inbox. Idempotent.
    DeleteAccount { username: String },
    /// Sends a message, assigning the next message ID at apply time.
    SendMessage { sender: String, recipient: String, content: String, timestamp: u64 },
    /// Deletes messages from the user's inbox, silently skipping messages
    /// they don't own.
    DeleteMessages { username: String, ids: Vec<MessageId> },
    /// Marks messages in the user's inbox as read.
    MarkRead { username: String, ids: Vec<MessageId> },
}

/// A chat state machine read-only query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Query {
    /// Verifies credentials, returning the number of unread messages.
    Login { username: String, password_hash: String },
    /// Lists accounts matching a glob pattern, paginated.
    ListAccounts { pattern: Option<String>, page: u64, per_page: u64 },
    /// Fetches the most recent messages in the user's inbox, in delivery
    /// order. A count of 0 fetches all of them.
    GetMessages { username: String, count: u64 },
    /// Checks whether a user exists.
    UserExists { username: String },
    /// Fetches the unread messages in the user's inbox, in delivery order.
    Unread { username: String },
}

/// A chat engine submitting commands to the local Raft node. Mutations are
/// serialized into the replicated log and block until applied; queries are
/// served from the replica's applied state, labeled with its applied index.
#[derive(Clone)]
pub struct Engine {
    /// The local Raft node client.
    raft: raft::Client,
}

impl Engine {
    /// Creates a new chat engine.
    pub fn new(raft: raft::Client) -> Self {
        Self { raft }
    }

    /// Submits a mutation through the Raft log and decodes its result.
    fn mutate<R: serde::de::DeserializeOwned>(
        &self,
        client_id: Uuid,
        seq: u64,
        mutation: Mutation,
    ) -> Result<R> {
        let write = Write { client_id, seq, mutation };
        bincode::deserialize(&self.raft.write(write.encode()?)?)
    }

    /// Submits a read-only query and decodes its result, returning the
    /// serving replica's applied index as a staleness marker.
    fn query<R: serde::de::DeserializeOwned>(&self, query: Query) -> Result<(R, raft::Index)> {
        let (response, applied_index) = self.raft.read(query.encode()?)?;
        Ok((bincode::deserialize(&response)?, applied_index))
    }

    /// Registers a new user account.
    pub fn register(&self, client_id: Uuid, seq: u64, username: &str, password: &str) -> Result<()> {
        self.mutate(
            client_id,
            seq,
            Mutation::Register {
                username: username.to_string(),
                password_hash: hash_password(password),
                timestamp: now(),
            },
        )
    }

    /// Deletes a user account.
    pub fn delete_account(&self, client_id: Uuid, seq: u64, username: &str) -> Result<()> {
        self.mutate(client_id, seq, Mutation::DeleteAccount { username: username.to_string() })
    }

    /// Sends a message, returning its assigned ID.
    pub fn send_message(
        &self,
        client_id: Uuid,
        seq: u64,
        sender: &str,
        recipient: &str,
        content: &str,
    ) -> Result<MessageId> {
        self.mutate(
            client_id,
            seq,
            Mutation::SendMessage {
                sender: sender.to_string(),
                recipient: recipient.to_string(),
                content: content.to_string(),
                timestamp: now(),
            },
        )
    }

    /// Deletes messages from the user's inbox.
    pub fn delete_messages(
        &self,
        client_id: Uuid,
        seq: u64,
        username: &str,
        ids: Vec<MessageId>,
    ) -> Result<()> {
        self.mutate(client_id, seq, Mutation::DeleteMessages { username: username.to_string(), ids })
    }

    /// Marks messages in the user's inbox as read.
    pub fn mark_read(
        &self,
        client_id: Uuid,
        seq: u64,
        username: &str,
        ids: Vec<MessageId>,
    ) -> Result<()> {
        self.mutate(client_id, seq, Mutation::MarkRead { username: username.to_string(), ids })
    }

    /// Verifies credentials, returning the unread message count.
    pub fn login(&self, username: &str, password: &str) -> Result<(u64, raft::Index)> {
        self.query(Query::Login {
            username: username.to_string(),
            password_hash: hash_password(password),
        })
    }

    /// Lists accounts matching a glob pattern, paginated.
    pub fn list_accounts(
        &self,
        pattern: Option<String>,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<Account>, raft::Index)> {
        self.query(Query::ListAccounts { pattern, page, per_page })
    }

    /// Fetches the most recent messages in the user's inbox.
    pub fn get_messages(&self, username: &str, count: u64) -> Result<(Vec<Message>, raft::Index)> {
        self.query(Query::GetMessages { username: username.to_string(), count })
    }

    /// Checks whether a user exists.
    pub fn user_exists(&self, username: &str) -> Result<bool> {
        Ok(self.query(Query::UserExists { username: username.to_string() })?.0)
    }

    /// Fetches the unread messages in the user's inbox.
    pub fn unread_messages(&self, username: &str) -> Result<Vec<Message>> {
        Ok(self.query::<Vec<Message>>(Query::Unread { username: username.to_string() })?.0)
    }
}
