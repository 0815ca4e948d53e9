mod candidate;
mod follower;
mod leader;

use super::{
    Command, Entry, Envelope, Index, Log, Message, Request, RequestID, Response, State, Status,
    ELECTION_TIMEOUT_RANGE, HEARTBEAT_INTERVAL, MAX_APPEND_ENTRIES, SNAPSHOT_THRESHOLD,
};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use candidate::Candidate;
use follower::Follower;
use leader::Leader;

use itertools::Itertools as _;
use log::{debug, info};
use rand::Rng as _;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node ID.
pub type NodeID = u8;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// The cluster membership: voting members and non-voting learners, with
/// their network addresses. Learners are replicated to but do not count
/// towards quorum, and are promoted to voters once they have caught up with
/// the leader's log. Mutated only by committed membership commands, and
/// persisted so it survives restarts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    /// Voting members, by ID.
    pub voters: BTreeMap<NodeID, String>,
    /// Non-voting learners, by ID.
    pub learners: BTreeMap<NodeID, String>,
}

impl Membership {
    /// Creates a membership with the given voters and no learners.
    pub fn new(voters: BTreeMap<NodeID, String>) -> Self {
        Self { voters, learners: BTreeMap::new() }
    }

    /// Returns true if the node is a member (voter or learner).
    pub fn contains(&self, id: NodeID) -> bool {
        self.voters.contains_key(&id) || self.learners.contains_key(&id)
    }

    /// Returns true if the node is a voting member.
    pub fn is_voter(&self, id: NodeID) -> bool {
        self.voters.contains_key(&id)
    }

    /// Returns true if the node is a non-voting learner.
    pub fn is_learner(&self, id: NodeID) -> bool {
        self.learners.contains_key(&id)
    }

    /// Returns the address of a member, if known.
    pub fn addr(&self, id: NodeID) -> Option<&String> {
        self.voters.get(&id).or_else(|| self.learners.get(&id))
    }

    /// Returns all member IDs except the given one, in sorted order.
    pub fn peer_ids(&self, except: NodeID) -> Vec<NodeID> {
        self.voters
            .keys()
            .chain(self.learners.keys())
            .copied()
            .filter(|id| *id != except)
            .sorted()
            .collect()
    }

    /// Returns all voter IDs except the given one, in sorted order.
    pub fn voter_ids(&self, except: NodeID) -> Vec<NodeID> {
        self.voters.keys().copied().filter(|id| *id != except).collect()
    }

    /// Adds a learner. Noop if the node is already a member.
    pub fn add_learner(&mut self, id: NodeID, addr: String) {
        if !self.contains(id) {
            self.learners.insert(id, addr);
        }
    }

    /// Promotes a learner to a voting member. Noop if it is already a voter
    /// or not a member at all.
    pub fn promote(&mut self, id: NodeID) {
        if let Some(addr) = self.learners.remove(&id) {
            self.voters.insert(id, addr);
        }
    }

    /// Returns the quorum size (strict majority of voters).
    pub fn quorum_size(&self) -> usize {
        self.voters.len() / 2 + 1
    }
}

/// Raft node options.
#[derive(Clone, Debug)]
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts for followers and
    /// candidates.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// Maximum number of entries to send in a single Append message.
    pub max_append_entries: usize,
    /// Number of applied entries to retain in the log before capturing a
    /// snapshot and compacting the prefix.
    pub snapshot_threshold: Index,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout_range: ELECTION_TIMEOUT_RANGE,
            max_append_entries: MAX_APPEND_ENTRIES,
            snapshot_threshold: SNAPSHOT_THRESHOLD,
        }
    }
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a
/// possibly different role. Outbound messages are sent via the given
/// node_tx channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or as
    /// leader if it is the only voter. A membership stored in the log (from
    /// applied membership commands) takes precedence over the given initial
    /// membership.
    pub fn new(
        id: NodeID,
        peers: Membership,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let peers = match log.get_membership()? {
            Some(stored) => stored,
            None => peers,
        };
        let node = RawNode::new(id, peers, log, state, node_tx, opts)?;
        if node.peers.is_voter(id) && node.peers.voters.len() == 1 {
            // If we're the only voter, become leader immediately.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term(),
            Node::Follower(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Returns the current leader, if known.
    pub fn leader(&self) -> Option<NodeID> {
        match self {
            Node::Candidate(_) => None,
            Node::Follower(n) => n.role.leader,
            Node::Leader(n) => Some(n.id),
        }
    }

    /// Returns the current cluster membership.
    pub fn membership(&self) -> &Membership {
        match self {
            Node::Candidate(n) => &n.peers,
            Node::Follower(n) => &n.peers,
            Node::Leader(n) => &n.peers,
        }
    }

    /// Processes a message from a peer or the local server.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: Membership,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            role,
        }
    }

    /// Returns the node's current term. Convenience wrapper for the log.
    fn term(&self) -> Term {
        self.log.get_term().0
    }

    /// Returns the quorum size (strict majority of voters).
    fn quorum_size(&self) -> usize {
        self.peers.quorum_size()
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The vector must have one value per voter.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.peers.voters.len(), "values must match voter count");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message to the given recipient.
    fn send(&self, to: NodeID, message: Message) -> Result<()> {
        Self::send_with(&self.node_tx, Envelope { from: self.id, to, term: self.term(), message })
    }

    /// Sends a message without borrowing self, to allow partial borrows.
    fn send_with(tx: &crossbeam::channel::Sender<Envelope>, msg: Envelope) -> Result<()> {
        debug!("Sending {msg:?}");
        Ok(tx.send(msg)?)
    }

    /// Broadcasts a message to all peers (voters and learners).
    fn broadcast(&self, message: Message) -> Result<()> {
        for id in self.peers.peer_ids(self.id) {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        assert_eq!(msg.to, self.id, "message to other node");
    }

    /// Applies any pending committed entries, discarding their results. Use
    /// maybe_apply_with() to act on them instead.
    fn maybe_apply(&mut self) -> Result<()> {
        Self::maybe_apply_with(&mut self.log, &mut self.peers, &mut self.state, |_, _| Ok(()))
    }

    /// Applies any pending committed entries, calling the given closure with
    /// the result of each. Membership commands are applied to the node's own
    /// membership and persisted before the state machine sees the entry.
    /// Not a method, so callers can split borrows of the node's fields.
    fn maybe_apply_with<F>(
        log: &mut Log,
        peers: &mut Membership,
        state: &mut Box<dyn State>,
        mut on_apply: F,
    ) -> Result<()>
    where
        F: FnMut(Index, Result<Vec<u8>>) -> Result<()>,
    {
        let applied_index = state.get_applied_index();
        if log.get_commit_index().0 <= applied_index {
            return Ok(());
        }
        let entries: Vec<Entry> = log.scan_apply(applied_index)?.collect::<Result<_>>()?;
        for entry in entries {
            debug!("Applying {entry:?}");
            let index = entry.index;
            if let Some(command) = entry.command.as_deref() {
                match Command::decode(command)? {
                    Command::AddServer { id, addr } => {
                        info!("Adding server {id} at {addr} as learner");
                        peers.add_learner(id, addr);
                        log.set_membership(peers)?;
                    }
                    Command::PromoteServer { id } => {
                        info!("Promoting server {id} to voter");
                        peers.promote(id);
                        log.set_membership(peers)?;
                    }
                    Command::Write(_) => {}
                }
            }
            let result = state.apply(entry);
            on_apply(index, result)?;
        }
        Ok(())
    }

    /// Captures a snapshot and compacts the log prefix if the number of
    /// applied entries above the current snapshot exceeds the threshold.
    fn maybe_compact(&mut self) -> Result<()> {
        let applied_index = self.state.get_applied_index();
        let (snapshot_index, _) = self.log.get_snapshot_index();
        if applied_index > snapshot_index
            && applied_index - snapshot_index >= self.opts.snapshot_threshold
        {
            let data = self.state.snapshot()?;
            info!("Capturing snapshot through {applied_index}");
            self.log.compact(applied_index, data)?;
        }
        Ok(())
    }

    /// Responds to a client read request from the local applied state. On
    /// followers this is a labeled stale read; the leader only calls this
    /// after quorum confirmation.
    fn respond_read(&self, id: RequestID, command: Vec<u8>) -> Result<()> {
        let applied_index = self.state.get_applied_index();
        let response =
            self.state.read(command).map(|response| Response::Read { response, applied_index });
        self.send(self.id, Message::ClientResponse { id, response })
    }

    /// Responds to a client status request.
    fn respond_status(
        &self,
        id: RequestID,
        leader: Option<NodeID>,
        match_index: BTreeMap<NodeID, Index>,
    ) -> Result<()> {
        let status = Status {
            server: self.id,
            leader,
            term: self.term(),
            commit_index: self.log.get_commit_index().0,
            apply_index: self.state.get_applied_index(),
            match_index,
            members: self.peers.clone(),
        };
        self.send(self.id, Message::ClientResponse { id, response: Ok(Response::Status(status)) })
    }

    /// Responds to a client request with an error.
    fn respond_error(&self, id: RequestID, error: Error) -> Result<()> {
        self.send(self.id, Message::ClientResponse { id, response: Err(error) })
    }

    /// Returns the advisory address of the given leader, if known, for
    /// client redirection.
    fn leader_addr(&self, leader: Option<NodeID>) -> Option<String> {
        leader.and_then(|id| self.peers.addr(id).cloned())
    }
}
