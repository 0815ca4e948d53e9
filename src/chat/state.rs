use super::{Account, Message, MessageId, Mutation, Query, Write};
use crate::encoding::{bincode, Value as _};
use crate::error::{Error, Result};
use crate::raft;
use crate::raft::{Command, Entry, Index};

use crossbeam::channel::{Receiver, Sender};
use log::debug;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A user account record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct User {
    /// Hex-encoded password digest.
    password_hash: String,
    /// Unix timestamp of account creation.
    created_at: u64,
}

/// The replicated chat state. All collections are ordered, so that
/// snapshots serialize byte-identically on every replica. Everything in
/// here must be mutated deterministically, and only by applied commands.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Data {
    /// The last applied log index.
    applied_index: Index,
    /// User accounts by name.
    users: BTreeMap<String, User>,
    /// All messages by ID.
    messages: BTreeMap<MessageId, Message>,
    /// Per-user inboxes, message IDs in delivery order.
    inboxes: BTreeMap<String, Vec<MessageId>>,
    /// The next message ID to assign. Assigned at apply time, so all
    /// replicas compute the same IDs.
    next_message_id: MessageId,
    /// The last applied write sequence number and its cached result, per
    /// client. Replayed writes at or below the sequence number return the
    /// cached result instead of re-executing, suppressing duplicates from
    /// client retries.
    clients: BTreeMap<Uuid, (u64, Result<Vec<u8>>)>,
}

/// An event delivered to message stream subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// A new message was delivered to the subscribed user.
    Message(Message),
    /// Leadership changed. The subscription is invalidated, and the client
    /// should re-subscribe, possibly at the hinted address.
    LeaderChanged { addr: Option<String> },
}

/// Per-user message subscription queues, fed by the apply loop and drained
/// by server stream sessions. The state machine holds a shared handle and
/// looks subscribers up by username; it never owns the sessions.
#[derive(Clone, Default)]
pub struct Subscriptions(Arc<Mutex<HashMap<String, Vec<Sender<StreamEvent>>>>>);

impl Subscriptions {
    /// Creates an empty subscription table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to messages for the given user, returning the receiving
    /// end of the subscription queue.
    pub fn subscribe(&self, username: &str) -> Receiver<StreamEvent> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut subs = self.0.lock().expect("subscriptions poisoned");
        subs.entry(username.to_string()).or_default().push(tx);
        rx
    }

    /// Drops all subscriptions for the given user on this replica.
    pub fn unsubscribe(&self, username: &str) {
        let mut subs = self.0.lock().expect("subscriptions poisoned");
        subs.remove(username);
    }

    /// Invalidates all subscriptions with a leadership change event. Each
    /// subscriber receives the event and the stream then ends; clients are
    /// expected to re-subscribe.
    pub fn leader_changed(&self, addr: Option<String>) {
        let mut subs = self.0.lock().expect("subscriptions poisoned");
        for (_, senders) in subs.drain() {
            for sender in senders {
                sender.send(StreamEvent::LeaderChanged { addr: addr.clone() }).ok();
            }
        }
    }

    /// Enqueues a message for every active subscription of the recipient,
    /// dropping subscriptions whose receiver has gone away.
    fn notify(&self, username: &str, message: Message) {
        let mut subs = self.0.lock().expect("subscriptions poisoned");
        if let Some(senders) = subs.get_mut(username) {
            senders.retain(|tx| tx.send(StreamEvent::Message(message.clone())).is_ok());
            if senders.is_empty() {
                subs.remove(username);
            }
        }
    }
}

/// The chat state machine. Applies committed commands deterministically,
/// and notifies local message subscribers as sends are applied. Survives
/// restarts via snapshots plus log replay.
pub struct State {
    /// The replicated chat data.
    data: Data,
    /// Local message stream subscriptions. Not replicated.
    subscriptions: Subscriptions,
}

impl State {
    /// Creates an empty chat state machine with the given subscription
    /// table.
    pub fn new(subscriptions: Subscriptions) -> Box<Self> {
        Box::new(Self { data: Data { next_message_id: 1, ..Data::default() }, subscriptions })
    }

    /// Executes a mutation. The Result is part of the deterministic command
    /// outcome: application errors (e.g. a taken username) are returned to
    /// the submitting client and cached for retries.
    fn mutate(&mut self, mutation: Mutation) -> Result<Vec<u8>> {
        match mutation {
            Mutation::Register { username, password_hash, timestamp } => {
                if self.data.users.contains_key(&username) {
                    return Err(Error::AlreadyExists(username));
                }
                debug!("Registering user {username}");
                self.data
                    .users
                    .insert(username.clone(), User { password_hash, created_at: timestamp });
                self.data.inboxes.insert(username, Vec::new());
                bincode::serialize(&())
            }

            Mutation::DeleteAccount { username } => {
                // Idempotent. The user's inbox and its messages go with the
                // account; messages they sent to others remain, with the
                // sender name kept as a plain string.
                debug!("Deleting account {username}");
                self.data.users.remove(&username);
                if let Some(inbox) = self.data.inboxes.remove(&username) {
                    for id in inbox {
                        self.data.messages.remove(&id);
                    }
                }
                bincode::serialize(&())
            }

            Mutation::SendMessage { sender, recipient, content, timestamp } => {
                if !self.data.users.contains_key(&sender) {
                    return Err(Error::UnknownUser(sender));
                }
                if !self.data.users.contains_key(&recipient) {
                    return Err(Error::UnknownRecipient(recipient));
                }
                let id = self.data.next_message_id;
                self.data.next_message_id += 1;
                let message =
                    Message { id, sender, recipient: recipient.clone(), content, timestamp, read: false };
                self.data.messages.insert(id, message.clone());
                self.data.inboxes.entry(recipient.clone()).or_default().push(id);
                self.subscriptions.notify(&recipient, message);
                bincode::serialize(&id)
            }

            Mutation::DeleteMessages { username, ids } => {
                // Only messages in the user's own inbox are deleted; other
                // IDs are silently skipped.
                for id in ids {
                    if self.data.messages.get(&id).is_some_and(|m| m.recipient == username) {
                        self.data.messages.remove(&id);
                        if let Some(inbox) = self.data.inboxes.get_mut(&username) {
                            inbox.retain(|i| *i != id);
                        }
                    }
                }
                bincode::serialize(&())
            }

            Mutation::MarkRead { username, ids } => {
                for id in ids {
                    if let Some(message) = self.data.messages.get_mut(&id) {
                        if message.recipient == username {
                            message.read = true;
                        }
                    }
                }
                bincode::serialize(&())
            }
        }
    }

    /// Executes a read-only query.
    fn query(&self, query: Query) -> Result<Vec<u8>> {
        match query {
            Query::Login { username, password_hash } => {
                // Unknown users and wrong passwords are indistinguishable,
                // to avoid account enumeration.
                let Some(user) = self.data.users.get(&username) else {
                    return Err(Error::BadCredentials);
                };
                if user.password_hash != password_hash {
                    return Err(Error::BadCredentials);
                }
                let unread = self.unread(&username).count() as u64;
                bincode::serialize(&unread)
            }

            Query::ListAccounts { pattern, page, per_page } => {
                let regex = compile_pattern(pattern.as_deref().unwrap_or("*"))?;
                let page = if page > 0 { page } else { 1 };
                let per_page = if per_page > 0 { per_page } else { 10 };
                let accounts: Vec<Account> = self
                    .data
                    .users
                    .iter()
                    .filter(|(username, _)| regex.is_match(username))
                    .skip(((page - 1) * per_page) as usize)
                    .take(per_page as usize)
                    .map(|(username, user)| Account {
                        username: username.clone(),
                        created_at: user.created_at,
                    })
                    .collect();
                bincode::serialize(&accounts)
            }

            Query::GetMessages { username, count } => {
                if !self.data.users.contains_key(&username) {
                    return Err(Error::UnknownUser(username));
                }
                let inbox = self.data.inboxes.get(&username).map(Vec::as_slice).unwrap_or(&[]);
                let skip = match count {
                    0 => 0,
                    c => inbox.len().saturating_sub(c as usize),
                };
                let messages: Vec<&Message> = inbox
                    .iter()
                    .skip(skip)
                    .filter_map(|id| self.data.messages.get(id))
                    .collect();
                bincode::serialize(&messages)
            }

            Query::UserExists { username } => {
                bincode::serialize(&self.data.users.contains_key(&username))
            }

            Query::Unread { username } => {
                let messages: Vec<&Message> = self.unread(&username).collect();
                bincode::serialize(&messages)
            }
        }
    }

    /// Returns the unread messages in a user's inbox, in delivery order.
    fn unread<'a>(&'a self, username: &str) -> impl Iterator<Item = &'a Message> + 'a {
        self.data
            .inboxes
            .get(username)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter_map(|id| self.data.messages.get(id))
            .filter(|m| !m.read)
    }
}

impl raft::State for State {
    fn get_applied_index(&self) -> Index {
        self.data.applied_index
    }

    fn apply(&mut self, entry: Entry) -> Result<Vec<u8>> {
        assert_eq!(entry.index, self.data.applied_index + 1, "entry applied out of order");
        self.data.applied_index = entry.index;

        // Noops and membership changes only advance the applied index; the
        // Raft node applies membership changes itself.
        let Some(command) = entry.command else {
            return Ok(Vec::new());
        };
        let Command::Write(write) = Command::decode(&command)? else {
            return Ok(Vec::new());
        };
        let write = Write::decode(&write)?;

        // Suppress duplicate writes from client retries, returning the
        // cached result.
        if let Some((seq, result)) = self.data.clients.get(&write.client_id) {
            if write.seq <= *seq {
                debug!("Returning cached result for client {} seq {}", write.client_id, write.seq);
                return result.clone();
            }
        }
        let result = self.mutate(write.mutation);
        self.data.clients.insert(write.client_id, (write.seq, result.clone()));
        result
    }

    fn read(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.query(Query::decode(&command)?)
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        self.data.encode()
    }

    fn restore(&mut self, data: Vec<u8>) -> Result<()> {
        self.data = Data::decode(&data)?;
        Ok(())
    }
}

/// Compiles a glob pattern (* wildcards) into an anchored regex.
fn compile_pattern(pattern: &str) -> Result<regex::Regex> {
    let parts: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Ok(regex::Regex::new(&format!("^{}$", parts.join(".*")))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::State as _;
    use pretty_assertions::assert_eq;

    /// Applies a sequence of mutations to a fresh state machine, each from
    /// a distinct client.
    fn setup(mutations: Vec<Mutation>) -> Box<State> {
        let mut state = State::new(Subscriptions::new());
        apply_all(&mut state, mutations);
        state
    }

    /// Applies mutations to an existing state machine.
    fn apply_all(state: &mut State, mutations: Vec<Mutation>) {
        for mutation in mutations {
            let index = state.get_applied_index() + 1;
            apply_at(state, index, mutation).expect("apply failed");
        }
    }

    /// Applies a single mutation at the given index, from a random client.
    fn apply_at(state: &mut State, index: Index, mutation: Mutation) -> Result<Vec<u8>> {
        apply_write(
            state,
            index,
            Write { client_id: Uuid::new_v4(), seq: 1, mutation },
        )
    }

    /// Applies a prepared write at the given index.
    fn apply_write(state: &mut State, index: Index, write: Write) -> Result<Vec<u8>> {
        let command = Command::Write(write.encode().unwrap()).encode().unwrap();
        state.apply(Entry { index, term: 1, command: Some(command) })
    }

    fn register(username: &str) -> Mutation {
        Mutation::Register {
            username: username.to_string(),
            password_hash: super::super::hash_password("password"),
            timestamp: 1700000000,
        }
    }

    fn send(sender: &str, recipient: &str, content: &str) -> Mutation {
        Mutation::SendMessage {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            content: content.to_string(),
            timestamp: 1700000001,
        }
    }

    #[test]
    fn register_and_login() -> Result<()> {
        let state = setup(vec![register("alice")]);
        let unread: u64 = bincode::deserialize(&state.query(Query::Login {
            username: "alice".into(),
            password_hash: super::super::hash_password("password"),
        })?)?;
        assert_eq!(unread, 0);

        // Wrong password and unknown user are indistinguishable.
        assert_eq!(
            state.query(Query::Login {
                username: "alice".into(),
                password_hash: super::super::hash_password("wrong"),
            }),
            Err(Error::BadCredentials)
        );
        assert_eq!(
            state.query(Query::Login {
                username: "bob".into(),
                password_hash: super::super::hash_password("password"),
            }),
            Err(Error::BadCredentials)
        );
        Ok(())
    }

    #[test]
    fn register_taken_name_fails() {
        let mut state = setup(vec![register("alice")]);
        assert_eq!(
            apply_at(&mut state, 2, register("alice")),
            Err(Error::AlreadyExists("alice".into()))
        );
        // The entry still advances the applied index.
        assert_eq!(state.get_applied_index(), 2);
    }

    #[test]
    fn send_assigns_sequential_ids() -> Result<()> {
        let mut state = setup(vec![register("alice"), register("bob")]);
        let id: MessageId =
            bincode::deserialize(&apply_at(&mut state, 3, send("alice", "bob", "hi"))?)?;
        assert_eq!(id, 1);
        let id: MessageId =
            bincode::deserialize(&apply_at(&mut state, 4, send("bob", "alice", "yo"))?)?;
        assert_eq!(id, 2);

        let messages: Vec<Message> = bincode::deserialize(
            &state.query(Query::GetMessages { username: "bob".into(), count: 10 })?,
        )?;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, 1);
        assert_eq!(messages[0].sender, "alice");
        assert_eq!(messages[0].content, "hi");
        assert!(!messages[0].read);
        Ok(())
    }

    #[test]
    fn send_to_unknown_recipient_fails() {
        let mut state = setup(vec![register("alice")]);
        assert_eq!(
            apply_at(&mut state, 2, send("alice", "bob", "hi")),
            Err(Error::UnknownRecipient("bob".into()))
        );
        assert_eq!(
            apply_at(&mut state, 3, send("carol", "alice", "hi")),
            Err(Error::UnknownUser("carol".into()))
        );
    }

    #[test]
    fn mark_read_is_idempotent_and_owned_only() -> Result<()> {
        let mut state = setup(vec![
            register("alice"),
            register("bob"),
            send("alice", "bob", "hi"),
        ]);

        // Marking from the wrong user does nothing.
        apply_at(&mut state, 4, Mutation::MarkRead { username: "alice".into(), ids: vec![1] })?;
        let unread: Vec<&Message> = state.unread("bob").collect();
        assert_eq!(unread.len(), 1);

        // Marking twice leaves the state identical to marking once.
        apply_at(&mut state, 5, Mutation::MarkRead { username: "bob".into(), ids: vec![1] })?;
        let snapshot = state.snapshot()?;
        apply_at(&mut state, 6, Mutation::MarkRead { username: "bob".into(), ids: vec![1] })?;
        let mut after = Data::decode(&state.snapshot()?)?;
        // Only the applied index and dedup cache may differ.
        after.applied_index -= 1;
        let mut before = Data::decode(&snapshot)?;
        before.clients.clear();
        after.clients.clear();
        assert_eq!(before, after);
        assert_eq!(state.unread("bob").count(), 0);
        Ok(())
    }

    #[test]
    fn delete_messages_is_idempotent_and_owned_only() -> Result<()> {
        let mut state = setup(vec![
            register("alice"),
            register("bob"),
            send("alice", "bob", "hi"),
            send("alice", "bob", "hi2"),
        ]);

        // Deleting from the sender's side does nothing (not their inbox).
        apply_at(&mut state, 5, Mutation::DeleteMessages { username: "alice".into(), ids: vec![1] })?;
        assert_eq!(state.data.messages.len(), 2);

        // Deleting twice is the same as deleting once; unknown IDs skipped.
        apply_at(
            &mut state,
            6,
            Mutation::DeleteMessages { username: "bob".into(), ids: vec![1, 99] },
        )?;
        apply_at(&mut state, 7, Mutation::DeleteMessages { username: "bob".into(), ids: vec![1] })?;
        assert_eq!(state.data.messages.len(), 1);
        assert_eq!(state.data.inboxes["bob"], vec![2]);
        Ok(())
    }

    #[test]
    fn delete_account_cascades_inbox_only() -> Result<()> {
        let mut state = setup(vec![
            register("alice"),
            register("bob"),
            send("alice", "bob", "to bob"),
            send("bob", "alice", "to alice"),
        ]);

        apply_at(&mut state, 5, Mutation::DeleteAccount { username: "bob".into() })?;
        // Bob's account and inbox (message 1) are gone; the message bob
        // sent to alice survives with the sender name intact.
        assert!(!state.data.users.contains_key("bob"));
        assert!(!state.data.messages.contains_key(&1));
        assert_eq!(state.data.messages[&2].sender, "bob");

        // Deletion is idempotent, and the name can be re-registered fresh.
        apply_at(&mut state, 6, Mutation::DeleteAccount { username: "bob".into() })?;
        apply_at(&mut state, 7, register("bob"))?;
        assert_eq!(state.unread("bob").count(), 0);
        Ok(())
    }

    #[test]
    fn duplicate_writes_return_cached_result() -> Result<()> {
        let mut state = setup(vec![register("alice"), register("bob")]);
        let client_id = Uuid::new_v4();
        let write = Write { client_id, seq: 7, mutation: send("alice", "bob", "hi") };

        let id: MessageId = bincode::deserialize(&apply_write(&mut state, 3, write.clone())?)?;
        assert_eq!(id, 1);

        // The identical retried write returns the cached ID without
        // creating a new message.
        let id: MessageId = bincode::deserialize(&apply_write(&mut state, 4, write)?)?;
        assert_eq!(id, 1);
        assert_eq!(state.data.messages.len(), 1);

        // A lower sequence number from the same client is also suppressed.
        let stale = Write { client_id, seq: 3, mutation: send("alice", "bob", "stale") };
        apply_write(&mut state, 5, stale)?;
        assert_eq!(state.data.messages.len(), 1);

        // Cached errors replay identically.
        let bad = Write { client_id, seq: 8, mutation: send("alice", "carol", "nope") };
        assert_eq!(
            apply_write(&mut state, 6, bad.clone()),
            Err(Error::UnknownRecipient("carol".into()))
        );
        assert_eq!(
            apply_write(&mut state, 7, bad),
            Err(Error::UnknownRecipient("carol".into()))
        );
        Ok(())
    }

    #[test]
    fn list_accounts_patterns_and_pagination() -> Result<()> {
        let state = setup(vec![
            register("alice"),
            register("bob"),
            register("carol"),
            register("carl"),
        ]);

        let list = |query| -> Vec<String> {
            let accounts: Vec<Account> = bincode::deserialize(&state.query(query).unwrap()).unwrap();
            accounts.into_iter().map(|a| a.username).collect()
        };

        assert_eq!(
            list(Query::ListAccounts { pattern: None, page: 0, per_page: 0 }),
            vec!["alice", "bob", "carl", "carol"]
        );
        assert_eq!(
            list(Query::ListAccounts { pattern: Some("car*".into()), page: 1, per_page: 10 }),
            vec!["carl", "carol"]
        );
        assert_eq!(
            list(Query::ListAccounts { pattern: Some("*o*".into()), page: 1, per_page: 10 }),
            vec!["bob", "carol"]
        );
        // Pagination.
        assert_eq!(
            list(Query::ListAccounts { pattern: None, page: 2, per_page: 2 }),
            vec!["carl", "carol"]
        );
        // Regex metacharacters in the pattern are literal.
        assert_eq!(
            list(Query::ListAccounts { pattern: Some("a.c".into()), page: 1, per_page: 10 }),
            Vec::<String>::new()
        );
        Ok(())
    }

    #[test]
    fn get_messages_returns_most_recent_in_order() -> Result<()> {
        let mut state = setup(vec![register("alice"), register("bob")]);
        for i in 0..5 {
            apply_at(&mut state, 3 + i, send("alice", "bob", &format!("msg{i}")))?;
        }
        let messages: Vec<Message> = bincode::deserialize(
            &state.query(Query::GetMessages { username: "bob".into(), count: 2 })?,
        )?;
        assert_eq!(
            messages.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![4, 5],
            "most recent messages, in delivery order"
        );
        Ok(())
    }

    #[test]
    fn subscriptions_receive_applied_sends() -> Result<()> {
        let subscriptions = Subscriptions::new();
        let mut state = State::new(subscriptions.clone());
        apply_all(&mut state, vec![register("alice"), register("bob")]);

        let rx = subscriptions.subscribe("bob");
        apply_at(&mut state, 3, send("alice", "bob", "hi"))?;
        let StreamEvent::Message(message) = rx.try_recv().expect("no event") else {
            panic!("expected message event");
        };
        assert_eq!((message.id, message.content.as_str()), (1, "hi"));

        // Leadership changes invalidate the subscription.
        subscriptions.leader_changed(Some("localhost:9702".into()));
        assert_eq!(
            rx.try_recv(),
            Ok(StreamEvent::LeaderChanged { addr: Some("localhost:9702".into()) })
        );
        // Subsequent sends no longer reach the dropped subscription.
        apply_at(&mut state, 4, send("alice", "bob", "hi2"))?;
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn snapshot_restore_roundtrip_is_byte_identical() -> Result<()> {
        let mutations = vec![
            register("alice"),
            register("bob"),
            send("alice", "bob", "hi"),
            Mutation::MarkRead { username: "bob".into(), ids: vec![1] },
        ];
        let state = setup(mutations);
        let snapshot = state.snapshot()?;

        let mut restored = State::new(Subscriptions::new());
        restored.restore(snapshot.clone())?;
        assert_eq!(restored.get_applied_index(), 4);
        assert_eq!(restored.snapshot()?, snapshot);
        Ok(())
    }
}
