use crate::chat::{Account, Message, MessageId, StreamEvent};
use crate::encoding::Value as _;
use crate::errdata;
use crate::error::Result;
use crate::raft;
use crate::server::{Call, Request, Response};

use rand::Rng as _;
use std::io::Write as _;
use uuid::Uuid;

/// A replichat client, connected to a single server. Carries a unique
/// client ID and a request sequence number; transient errors are retried
/// with the same sequence number, so the cluster deduplicates re-executed
/// writes.
pub struct Client {
    reader: std::io::BufReader<std::net::TcpStream>,
    writer: std::io::BufWriter<std::net::TcpStream>,
    client_id: Uuid,
    seq: u64,
}

impl Client {
    const MAX_RETRIES: u32 = 10;
    const MIN_WAIT_MS: u64 = 10;
    const MAX_WAIT_MS: u64 = 2_000;

    /// Creates a new client connected to the given server address.
    pub fn new(addr: impl std::net::ToSocketAddrs) -> Result<Self> {
        let socket = std::net::TcpStream::connect(addr)?;
        let reader = std::io::BufReader::new(socket.try_clone()?);
        let writer = std::io::BufWriter::new(socket);
        Ok(Self { reader, writer, client_id: Uuid::new_v4(), seq: 0 })
    }

    /// Calls a server method with an explicit sequence number.
    fn call_with(&mut self, seq: u64, request: Request) -> Result<Response> {
        Call { client_id: self.client_id, seq, request }.encode_into(&mut self.writer)?;
        self.writer.flush()?;
        Result::<Response>::decode_from(&mut self.reader)?
    }

    /// Calls a server method, automatically retrying transient errors (no
    /// leader, lost leadership, timeouts) with randomized exponential
    /// backoff. Retries reuse the sequence number, so a write that already
    /// committed is not re-executed.
    fn call(&mut self, request: Request) -> Result<Response> {
        self.seq += 1;
        let seq = self.seq;
        let mut retries = 0;
        loop {
            match self.call_with(seq, request.clone()) {
                Err(err) if err.is_retryable() && retries < Self::MAX_RETRIES => {
                    let mut wait = std::cmp::min(
                        Self::MIN_WAIT_MS * 2_u64.pow(retries),
                        Self::MAX_WAIT_MS,
                    );
                    wait = rand::thread_rng().gen_range(Self::MIN_WAIT_MS..=wait);
                    std::thread::sleep(std::time::Duration::from_millis(wait));
                    retries += 1;
                }
                result => return result,
            }
        }
    }

    /// Registers a new user account.
    pub fn register(&mut self, username: &str, password: &str) -> Result<()> {
        match self.call(Request::Register {
            username: username.to_string(),
            password: password.to_string(),
        })? {
            Response::Register => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Verifies credentials, returning the number of unread messages.
    pub fn login(&mut self, username: &str, password: &str) -> Result<u64> {
        match self.call(Request::Login {
            username: username.to_string(),
            password: password.to_string(),
        })? {
            Response::Login { unread, .. } => Ok(unread),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Logs out, dropping any message streams for the user on this server.
    pub fn logout(&mut self, username: &str) -> Result<()> {
        match self.call(Request::Logout { username: username.to_string() })? {
            Response::Logout => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Deletes a user account.
    pub fn delete_account(&mut self, username: &str) -> Result<()> {
        match self.call(Request::DeleteAccount { username: username.to_string() })? {
            Response::DeleteAccount => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Lists accounts matching a glob pattern, paginated.
    pub fn list_accounts(
        &mut self,
        pattern: Option<&str>,
        page: u64,
        per_page: u64,
    ) -> Result<Vec<Account>> {
        match self.call(Request::ListAccounts {
            pattern: pattern.map(str::to_string),
            page,
            per_page,
        })? {
            Response::ListAccounts { accounts, .. } => Ok(accounts),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Sends a message, returning its assigned ID.
    pub fn send_message(
        &mut self,
        sender: &str,
        recipient: &str,
        content: &str,
    ) -> Result<MessageId> {
        match self.call(Request::SendMessage {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            content: content.to_string(),
        })? {
            Response::SendMessage { id } => Ok(id),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Fetches the most recent messages in the user's inbox, in delivery
    /// order. A count of 0 fetches all of them.
    pub fn get_messages(&mut self, username: &str, count: u64) -> Result<Vec<Message>> {
        match self.call(Request::GetMessages { username: username.to_string(), count })? {
            Response::GetMessages { messages, .. } => Ok(messages),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Deletes messages from the user's inbox.
    pub fn delete_messages(&mut self, username: &str, ids: Vec<MessageId>) -> Result<()> {
        match self.call(Request::DeleteMessages { username: username.to_string(), ids })? {
            Response::DeleteMessages => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Marks messages in the user's inbox as read.
    pub fn mark_read(&mut self, username: &str, ids: Vec<MessageId>) -> Result<()> {
        match self.call(Request::MarkRead { username: username.to_string(), ids })? {
            Response::MarkRead => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Asks the cluster to add a server as a non-voting learner.
    pub fn join_cluster(&mut self, id: raft::NodeID, addr: &str) -> Result<()> {
        match self.call(Request::JoinCluster { id, addr: addr.to_string() })? {
            Response::JoinCluster => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Fetches node and cluster status.
    pub fn status(&mut self) -> Result<raft::Status> {
        match self.call(Request::Status)? {
            Response::Status(status) => Ok(status),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Subscribes to the user's message stream, consuming the client. The
    /// server first replays the user's unread messages, then pushes new
    /// messages as they commit. Delivery is at-least-once; dedup by message
    /// ID. The stream ends with a LeaderChanged event when leadership
    /// moves, after which the client should re-subscribe.
    pub fn subscribe(mut self, username: &str) -> Result<Subscription> {
        self.seq += 1;
        match self.call_with(self.seq, Request::Subscribe { username: username.to_string() })? {
            Response::Subscribed => Ok(Subscription { reader: self.reader }),
            response => errdata!("unexpected response {response:?}"),
        }
    }
}

/// A live message stream for a single user.
pub struct Subscription {
    reader: std::io::BufReader<std::net::TcpStream>,
}

impl Iterator for Subscription {
    type Item = Result<StreamEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        match Result::<StreamEvent>::maybe_decode_from(&mut self.reader) {
            Ok(Some(Ok(event))) => Some(Ok(event)),
            Ok(Some(Err(err))) => Some(Err(err)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
