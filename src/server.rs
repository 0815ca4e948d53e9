use crate::chat::{self, Account, Engine, Message, MessageId, StreamEvent, Subscriptions};
use crate::encoding::Value as _;
use crate::errinput;
use crate::error::Result;
use crate::raft;
use crate::raft::{Envelope, Membership, Node, NodeID, Options, RequestID};

use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write as _};
use std::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// A client API call. Writes carry the client's idempotency key: retried
/// calls reuse the same sequence number and are deduplicated by the state
/// machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// The calling client's unique ID.
    pub client_id: Uuid,
    /// The client's request sequence number, strictly increasing.
    pub seq: u64,
    /// The request.
    pub request: Request,
}

/// A client API request. Writes are served by the leader (other replicas
/// respond with a redirection error); reads are served by any replica,
/// labeled with its applied index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Register { username: String, password: String },
    Login { username: String, password: String },
    Logout { username: String },
    DeleteAccount { username: String },
    ListAccounts { pattern: Option<String>, page: u64, per_page: u64 },
    SendMessage { sender: String, recipient: String, content: String },
    GetMessages { username: String, count: u64 },
    DeleteMessages { username: String, ids: Vec<MessageId> },
    MarkRead { username: String, ids: Vec<MessageId> },
    /// Switches the connection into a server-push stream of message events
    /// for the given user.
    Subscribe { username: String },
    /// Asks the cluster to add a server as a non-voting learner; it is
    /// promoted once it has caught up.
    JoinCluster { id: NodeID, addr: String },
    Status,
}

/// A client API response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Register,
    Login { unread: u64, applied_index: raft::Index },
    Logout,
    DeleteAccount,
    ListAccounts { accounts: Vec<Account>, applied_index: raft::Index },
    SendMessage { id: MessageId },
    GetMessages { messages: Vec<Message>, applied_index: raft::Index },
    DeleteMessages,
    MarkRead,
    /// The subscription is live; the server now pushes StreamEvents.
    Subscribed,
    JoinCluster,
    Status(raft::Status),
}

/// A replichat server. Listens for Raft peer connections on one address and
/// client API connections on another.
///
/// The Raft node is owned exclusively by the event loop thread, which
/// processes peer messages, timer ticks, and client requests from crossbeam
/// channels; everything else (TCP IO, client sessions, subscription
/// delivery) runs on separate threads and communicates via channels.
pub struct Server {
    node: Node,
    node_rx: Receiver<Envelope>,
    subscriptions: Subscriptions,
}

impl Server {
    /// Creates a new server, restoring the state machine from the latest
    /// snapshot in the log's store, if any.
    pub fn new(id: NodeID, members: Membership, log: raft::Log, opts: Options) -> Result<Self> {
        use crate::raft::State as _;
        let subscriptions = Subscriptions::new();
        let mut state = chat::State::new(subscriptions.clone());
        if let Some((index, _, data)) = log.snapshot()? {
            info!("Restoring state machine snapshot through index {index}");
            state.restore(data)?;
        }
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(id, members, log, state, node_tx, opts)?;
        Ok(Self { node, node_rx, subscriptions })
    }

    /// Serves Raft peers and clients until the process exits.
    pub fn serve(self, peer_addr: &str, client_addr: &str) -> Result<()> {
        let peer_listener = TcpListener::bind(peer_addr)?;
        let client_listener = TcpListener::bind(client_addr)?;
        info!(
            "Server {} listening on {} (peer) and {} (client)",
            self.node.id(),
            peer_listener.local_addr()?,
            client_listener.local_addr()?
        );

        let (peer_in_tx, peer_in_rx) = crossbeam::channel::unbounded::<Envelope>();
        let (request_tx, request_rx) = crossbeam::channel::unbounded();

        std::thread::spawn(move || Self::peer_accept(peer_listener, peer_in_tx));

        let raft_client = raft::Client::new(request_tx);
        let subscriptions = self.subscriptions.clone();
        std::thread::spawn(move || Self::client_accept(client_listener, raft_client, subscriptions));

        Self::eventloop(self.node, self.node_rx, peer_in_rx, request_rx, self.subscriptions)
    }

    /// Runs the event loop, which owns and drives the Raft node.
    fn eventloop(
        mut node: Node,
        node_rx: Receiver<Envelope>,
        peer_rx: Receiver<Envelope>,
        request_rx: Receiver<(raft::Request, Sender<Result<raft::Response>>)>,
        subscriptions: Subscriptions,
    ) -> Result<()> {
        let ticker = crossbeam::channel::tick(raft::TICK_INTERVAL);
        let mut requests = HashMap::<RequestID, Sender<Result<raft::Response>>>::new();
        let mut peer_txs = HashMap::<NodeID, Sender<Envelope>>::new();
        let mut leader = node.leader();

        loop {
            crossbeam::select! {
                recv(ticker) -> _ => node = node.tick()?,

                recv(peer_rx) -> msg => node = node.step(msg?)?,

                recv(request_rx) -> r => {
                    let (request, response_tx) = r?;
                    let id = Uuid::new_v4();
                    requests.insert(id, response_tx);
                    let msg = Envelope {
                        from: node.id(),
                        to: node.id(),
                        term: node.term(),
                        message: raft::Message::ClientRequest { id, request },
                    };
                    node = node.step(msg)?;
                },

                recv(node_rx) -> msg => {
                    let msg = msg?;
                    if msg.to == node.id() {
                        // Responses to local client requests.
                        match msg.message {
                            raft::Message::ClientResponse { id, response } => {
                                // The caller may have timed out and gone away.
                                if let Some(response_tx) = requests.remove(&id) {
                                    response_tx.send(response).ok();
                                }
                            }
                            message => return errinput!("unexpected local message {message:?}"),
                        }
                    } else {
                        Self::peer_route(&mut peer_txs, &node, msg);
                    }
                },
            }

            // Invalidate message subscriptions when leadership is lost, so
            // clients re-subscribe against the new cluster state.
            let new_leader = node.leader();
            if new_leader != leader {
                if leader.is_some() {
                    let addr = new_leader.and_then(|id| node.membership().addr(id).cloned());
                    info!("Leader changed, invalidating subscriptions");
                    subscriptions.leader_changed(addr);
                }
                leader = new_leader;
            }
        }
    }

    /// Routes an outbound message to the given peer's sender thread,
    /// spawning one on first use. Messages to peers with a full send buffer
    /// are discarded; Raft tolerates message loss.
    fn peer_route(peer_txs: &mut HashMap<NodeID, Sender<Envelope>>, node: &Node, msg: Envelope) {
        let to = msg.to;
        if !peer_txs.contains_key(&to) {
            let Some(addr) = node.membership().addr(to).cloned() else {
                error!("No address for peer {to}, dropping message");
                return;
            };
            let (tx, rx) = crossbeam::channel::bounded(1024);
            std::thread::spawn(move || Self::peer_send(addr, rx));
            peer_txs.insert(to, tx);
        }
        match peer_txs[&to].try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Full send buffer for peer {to}, discarding message")
            }
            Err(TrySendError::Disconnected(_)) => {
                peer_txs.remove(&to);
            }
        }
    }

    /// Accepts inbound Raft peer connections.
    fn peer_accept(listener: TcpListener, peer_in_tx: Sender<Envelope>) {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    error!("Peer connection failed: {err}");
                    continue;
                }
            };
            let peer_in_tx = peer_in_tx.clone();
            std::thread::spawn(move || {
                let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                debug!("Raft peer {peer} connected");
                match Self::peer_receive(stream, peer_in_tx) {
                    Ok(()) => debug!("Raft peer {peer} disconnected"),
                    Err(err) => error!("Raft peer {peer} error: {err}"),
                }
            });
        }
    }

    /// Receives inbound messages from a Raft peer connection.
    fn peer_receive(stream: TcpStream, peer_in_tx: Sender<Envelope>) -> Result<()> {
        let mut reader = BufReader::new(stream);
        while let Some(envelope) = Envelope::maybe_decode_from(&mut reader)? {
            peer_in_tx.send(envelope)?;
        }
        Ok(())
    }

    /// Sends outbound messages to a Raft peer, reconnecting on failure.
    /// Exits when the sending channel closes.
    fn peer_send(addr: String, rx: Receiver<Envelope>) {
        loop {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    debug!("Connected to Raft peer {addr}");
                    match Self::peer_send_session(stream, &rx) {
                        Ok(()) => break, // channel closed
                        Err(err) => debug!("Failed sending to Raft peer {addr}: {err}"),
                    }
                }
                Err(err) => debug!("Failed connecting to Raft peer {addr}: {err}"),
            }
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
        debug!("Disconnected from Raft peer {addr}");
    }

    /// Sends outbound messages over a Raft peer connection.
    fn peer_send_session(stream: TcpStream, rx: &Receiver<Envelope>) -> Result<()> {
        let mut writer = BufWriter::new(stream);
        for envelope in rx.iter() {
            envelope.encode_into(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Accepts client API connections.
    fn client_accept(listener: TcpListener, raft: raft::Client, subscriptions: Subscriptions) {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    error!("Client connection failed: {err}");
                    continue;
                }
            };
            let raft = raft.clone();
            let subscriptions = subscriptions.clone();
            std::thread::spawn(move || {
                let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                debug!("Client {peer} connected");
                match Self::session(stream, raft, subscriptions) {
                    Ok(()) => debug!("Client {peer} disconnected"),
                    Err(err) => error!("Client {peer} error: {err}"),
                }
            });
        }
    }

    /// Serves a client API session. Application errors are returned on the
    /// wire; the session ends on disconnect, IO failure, or when the
    /// connection switches into a subscription stream.
    fn session(stream: TcpStream, raft: raft::Client, subscriptions: Subscriptions) -> Result<()> {
        let engine = Engine::new(raft.clone());
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);
        while let Some(call) = Call::maybe_decode_from(&mut reader)? {
            let Call { client_id, seq, request } = call;
            if let Request::Subscribe { username } = request {
                return Self::stream(writer, engine, subscriptions, username);
            }
            let response = Self::request(&engine, &raft, &subscriptions, client_id, seq, request);
            response.encode_into(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Executes a single client API request.
    fn request(
        engine: &Engine,
        raft: &raft::Client,
        subscriptions: &Subscriptions,
        client_id: Uuid,
        seq: u64,
        request: Request,
    ) -> Result<Response> {
        Ok(match request {
            Request::Register { username, password } => {
                engine.register(client_id, seq, &username, &password)?;
                Response::Register
            }
            Request::Login { username, password } => {
                let (unread, applied_index) = engine.login(&username, &password)?;
                Response::Login { unread, applied_index }
            }
            Request::Logout { username } => {
                // Logout only drops this replica's streams for the user; it
                // is not a replicated command.
                subscriptions.unsubscribe(&username);
                Response::Logout
            }
            Request::DeleteAccount { username } => {
                engine.delete_account(client_id, seq, &username)?;
                subscriptions.unsubscribe(&username);
                Response::DeleteAccount
            }
            Request::ListAccounts { pattern, page, per_page } => {
                let (accounts, applied_index) = engine.list_accounts(pattern, page, per_page)?;
                Response::ListAccounts { accounts, applied_index }
            }
            Request::SendMessage { sender, recipient, content } => {
                let id = engine.send_message(client_id, seq, &sender, &recipient, &content)?;
                Response::SendMessage { id }
            }
            Request::GetMessages { username, count } => {
                let (messages, applied_index) = engine.get_messages(&username, count)?;
                Response::GetMessages { messages, applied_index }
            }
            Request::DeleteMessages { username, ids } => {
                engine.delete_messages(client_id, seq, &username, ids)?;
                Response::DeleteMessages
            }
            Request::MarkRead { username, ids } => {
                engine.mark_read(client_id, seq, &username, ids)?;
                Response::MarkRead
            }
            Request::JoinCluster { id, addr } => {
                raft.join(id, addr)?;
                Response::JoinCluster
            }
            Request::Status => Response::Status(raft.status()?),
            Request::Subscribe { .. } => return errinput!("subscribe cannot be nested"),
        })
    }

    /// Serves a message subscription stream. The user's current unread
    /// messages are replayed first, then new messages are pushed in apply
    /// order as they arrive. Delivery is at-least-once across re-subscribes;
    /// clients dedup by message ID. The stream ends with a LeaderChanged
    /// event when leadership moves, and the client is expected to
    /// re-subscribe.
    fn stream(
        mut writer: BufWriter<TcpStream>,
        engine: Engine,
        subscriptions: Subscriptions,
        username: String,
    ) -> Result<()> {
        if !engine.user_exists(&username)? {
            Result::<Response>::Err(crate::error::Error::UnknownUser(username))
                .encode_into(&mut writer)?;
            writer.flush()?;
            return Ok(());
        }

        // Register the subscription before replaying the backlog, so no
        // message applied in between is missed. A message applied during the
        // replay may be delivered twice; the client dedups by ID.
        let rx = subscriptions.subscribe(&username);
        let backlog = engine.unread_messages(&username)?;

        debug!("Streaming messages for {username}");
        Result::<Response>::Ok(Response::Subscribed).encode_into(&mut writer)?;
        for message in backlog {
            Result::<StreamEvent>::Ok(StreamEvent::Message(message)).encode_into(&mut writer)?;
        }
        writer.flush()?;

        for event in rx.iter() {
            let done = matches!(event, StreamEvent::LeaderChanged { .. });
            Result::<StreamEvent>::Ok(event).encode_into(&mut writer)?;
            writer.flush()?;
            if done {
                break;
            }
        }
        Ok(())
    }
}
