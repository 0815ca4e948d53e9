use super::{Envelope, Error, Message, Node, NodeID, RawNode, Request, RequestID, Role, Term};
use crate::encoding::Value as _;
use crate::error::Result;
use crate::raft::{Command, Index, ReadSequence, State as _, PROMOTE_LAG, SNAPSHOT_CHUNK_SIZE};

use log::{debug, info};
use std::collections::{HashMap, VecDeque};

/// Peer replication progress, tracked by the leader.
struct Progress {
    /// The next index to replicate to the peer.
    next_index: Index,
    /// The last index where the peer's log matches the leader's.
    match_index: Index,
    /// The last read sequence number confirmed by the peer.
    read_seq: ReadSequence,
}

impl Progress {
    /// Attempts to advance the peer's match index, returning true if it
    /// did. next_index is advanced past it if necessary, but never
    /// regressed here.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Attempts to advance the peer's read sequence number, returning true
    /// if it did.
    fn advance_read(&mut self, read_seq: ReadSequence) -> bool {
        if read_seq <= self.read_seq {
            return false;
        }
        self.read_seq = read_seq;
        true
    }

    /// Regresses the next index to the given index, if it's currently
    /// greater. Can't regress below match_index + 1. Returns true if
    /// next_index changed.
    fn regress_next(&mut self, next_index: Index) -> bool {
        if next_index >= self.next_index || self.next_index <= self.match_index + 1 {
            return false;
        }
        self.next_index = std::cmp::max(next_index, self.match_index + 1);
        true
    }
}

/// A pending client write, answered when its entry applies.
struct Write {
    /// The write request ID.
    id: RequestID,
    /// True if this is a membership join rather than a state machine write.
    join: bool,
}

/// A pending client read. To guarantee linearizability, reads are assigned
/// a sequence number and executed only once a quorum of voters has
/// confirmed it via heartbeat exchange.
struct Read {
    /// The sequence number of this read.
    seq: ReadSequence,
    /// The read request ID.
    id: RequestID,
    /// The read command.
    command: Vec<u8>,
}

/// A leader serves requests and replicates the log to followers and
/// learners.
pub struct Leader {
    /// Peer replication progress, including learners.
    progress: HashMap<NodeID, Progress>,
    /// Pending write requests, keyed by the log index of their entry. The
    /// result is returned to the client when the entry applies; all pending
    /// writes are aborted if leadership is lost.
    writes: HashMap<Index, Write>,
    /// Pending read requests, executed once their sequence number is
    /// confirmed by a quorum.
    reads: VecDeque<Read>,
    /// The read sequence number of the last read. Only valid for this term.
    read_seq: ReadSequence,
    /// Number of ticks since the last periodic heartbeat.
    since_heartbeat: super::Ticks,
    /// The log index of an in-flight membership change entry, if any. Only
    /// one membership change may be uncommitted at a time.
    pub(super) membership_change: Option<Index>,
}

impl Leader {
    /// Creates a new leader role, with peer progress starting at the given
    /// last index.
    pub(super) fn new(peers: &[NodeID], last_index: Index) -> Self {
        let next_index = last_index + 1;
        let progress = peers
            .iter()
            .map(|id| (*id, Progress { next_index, match_index: 0, read_seq: 0 }))
            .collect();
        Self {
            progress,
            writes: HashMap::new(),
            reads: VecDeque::new(),
            read_seq: 0,
            since_heartbeat: 0,
            membership_change: None,
        }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Transitions the leader into a follower. This can only happen if we
    /// discover a higher term, so we become a leaderless follower. All
    /// in-flight requests are aborted.
    fn into_follower(mut self, term: Term) -> Result<RawNode<super::Follower>> {
        assert!(term > self.term(), "can only become follower in later term");
        info!("Discovered new term {term}, stepping down");

        // Cancel in-flight requests. Sorted for test determinism.
        let mut writes: Vec<_> = std::mem::take(&mut self.role.writes).into_values().collect();
        writes.sort_by_key(|w| w.id);
        for write in writes {
            self.send(self.id, Message::ClientResponse { id: write.id, response: Err(Error::Abort) })?;
        }
        let mut reads: Vec<_> = std::mem::take(&mut self.role.reads).into_iter().collect();
        reads.sort_by_key(|r| r.id);
        for read in reads {
            self.send(self.id, Message::ClientResponse { id: read.id, response: Err(Error::Abort) })?;
        }

        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(super::Follower::new(None, election_timeout)))
    }

    /// Processes a message.
    pub(super) fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message.
        if msg.term > self.term() {
            return self.into_follower(msg.term)?.step(msg);
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::Heartbeat { .. } | Message::Append { .. } | Message::Snapshot { .. } => {
                panic!("saw other leader {} in term {}", msg.from, msg.term);
            }

            // A peer confirmed our leadership. If its read sequence number
            // advances, try to execute pending reads. If its log didn't
            // match our last entry, probe it backwards or send a snapshot;
            // if its match index advances, try to commit.
            Message::HeartbeatResponse { match_index, read_seq } => {
                let (last_index, _) = self.log.get_last_index();
                assert!(match_index <= last_index, "future match index");

                if self.progress(msg.from).advance_read(read_seq) {
                    self.maybe_read()?;
                }

                if match_index == 0 {
                    self.progress(msg.from).regress_next(last_index);
                    self.maybe_send_append(msg.from, true)?;
                } else if self.progress(msg.from).advance(match_index) {
                    self.maybe_commit_and_apply()?;
                }
                self.maybe_promote(msg.from)?;
            }

            // A peer appended our entries. Record its progress, try to
            // commit, and eagerly send any further pending entries.
            Message::AppendResponse { match_index, reject_index: 0, conflict: _ }
                if match_index > 0 =>
            {
                let (last_index, _) = self.log.get_last_index();
                assert!(match_index <= last_index, "follower matched unknown index");

                if self.progress(msg.from).advance(match_index) {
                    self.maybe_commit_and_apply()?;
                }
                self.maybe_send_append(msg.from, false)?;
                self.maybe_promote(msg.from)?;
            }

            // A peer rejected entries because its log diverges at the base
            // index. Use the conflict hint to skip past its entire divergent
            // term, rather than probing back one entry at a time.
            Message::AppendResponse { reject_index, match_index: 0, conflict }
                if reject_index > 0 =>
            {
                let (last_index, _) = self.log.get_last_index();
                assert!(reject_index <= last_index + 1, "follower rejected unknown index");

                // If the rejected base index is at or below the match index,
                // the rejection is stale and can be ignored.
                if reject_index <= self.progress(msg.from).match_index {
                    return Ok(self.into());
                }

                let next = match conflict {
                    Some((_, first_index)) => std::cmp::min(first_index, reject_index),
                    None => reject_index,
                };
                if self.progress(msg.from).regress_next(next) {
                    self.maybe_send_append(msg.from, true)?;
                }
            }

            Message::AppendResponse { .. } => panic!("invalid message {msg:?}"),

            // A peer installed our snapshot. Resume appends from the
            // snapshot boundary.
            Message::SnapshotResponse { last_index } => {
                let (our_last, _) = self.log.get_last_index();
                assert!(last_index <= our_last, "future snapshot index");

                if self.progress(msg.from).advance(last_index) {
                    self.maybe_commit_and_apply()?;
                }
                self.maybe_send_append(msg.from, false)?;
                self.maybe_promote(msg.from)?;
            }

            // A client submitted a read command. To ensure linearizability,
            // confirm our leadership by heartbeating the read's sequence
            // number to a quorum before executing it.
            Message::ClientRequest { id, request: Request::Read(command) } => {
                assert_eq!(msg.from, self.id, "client request from other node");
                self.role.read_seq += 1;
                self.role.reads.push_back(Read { seq: self.role.read_seq, id, command });
                if self.peers.voters.len() == 1 {
                    self.maybe_read()?;
                }
                self.heartbeat()?;
            }

            // A client submitted a write command. Propose it, and track it
            // until it's applied and the result is returned to the client.
            Message::ClientRequest { id, request: Request::Write(command) } => {
                assert_eq!(msg.from, self.id, "client request from other node");
                let index = self.propose(Some(Command::Write(command).encode()?))?;
                self.role.writes.insert(index, Write { id, join: false });
                if self.peers.voters.len() == 1 {
                    self.maybe_commit_and_apply()?;
                }
            }

            // A server asked to join the cluster. Propose it as a learner;
            // it will be promoted automatically once it has caught up. Only
            // one membership change may be in flight at a time.
            Message::ClientRequest { id, request: Request::Join { id: server, addr } } => {
                assert_eq!(msg.from, self.id, "client request from other node");
                if self.peers.contains(server) {
                    // Joining is idempotent.
                    self.send(self.id, Message::ClientResponse { id, response: Ok(super::Response::Join) })?;
                } else if self.role.membership_change.is_some() {
                    self.respond_error(
                        id,
                        Error::InvalidInput("a membership change is already in progress".into()),
                    )?;
                } else {
                    info!("Adding server {server} at {addr} to the cluster");
                    let index =
                        self.propose(Some(Command::AddServer { id: server, addr }.encode()?))?;
                    self.role.membership_change = Some(index);
                    self.role.writes.insert(index, Write { id, join: true });
                    if self.peers.voters.len() == 1 {
                        self.maybe_commit_and_apply()?;
                    }
                }
            }

            Message::ClientRequest { id, request: Request::Status } => {
                let match_index = self
                    .role
                    .progress
                    .iter()
                    .map(|(id, p)| (*id, p.match_index))
                    .chain(std::iter::once((self.id, self.log.get_last_index().0)))
                    .collect();
                self.respond_status(id, Some(self.id), match_index)?;
            }

            // Don't grant other votes in this term.
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { vote: false })?
            }

            // Votes can come in after we won the election. Ignore them.
            Message::CampaignResponse { .. } => {}

            // Leaders never submit client requests elsewhere, so we don't
            // expect responses from other nodes.
            Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }

        Ok(self.into())
    }

    /// Processes a logical clock tick.
    pub(super) fn tick(mut self) -> Result<Node> {
        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        Ok(self.into())
    }

    /// Broadcasts a heartbeat to all peers.
    pub(super) fn heartbeat(&mut self) -> Result<()> {
        let (last_index, last_term) = self.log.get_last_index();
        let (commit_index, _) = self.log.get_commit_index();
        let read_seq = self.role.read_seq;
        assert_eq!(last_term, self.term(), "leader has stale last_term");
        self.broadcast(Message::Heartbeat { last_index, commit_index, read_seq })?;
        Ok(())
    }

    /// Returns a mutable borrow of a peer's progress.
    fn progress(&mut self, id: NodeID) -> &mut Progress {
        self.role.progress.get_mut(&id).expect("unknown node")
    }

    /// Proposes a command for consensus by appending it to our log and
    /// eagerly replicating it to peers that are in steady state. Lagging or
    /// divergent peers are caught up by heartbeat probes.
    pub(super) fn propose(&mut self, command: Option<Vec<u8>>) -> Result<Index> {
        let index = self.log.append(command)?;
        for peer in self.peers.peer_ids(self.id) {
            if index == self.progress(peer).next_index {
                self.maybe_send_append(peer, false)?;
            }
        }
        Ok(index)
    }

    /// Commits any new entries that have been replicated to a quorum of
    /// voters, and applies them to the state machine, responding to the
    /// waiting client writes. Only entries from our own term can be
    /// committed by counting replicas (see section 5.4.2 in the Raft
    /// paper).
    pub(super) fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        let (last_index, _) = self.log.get_last_index();
        let quorum_index = self.quorum_value(
            self.peers
                .voter_ids(self.id)
                .iter()
                .map(|id| self.role.progress.get(id).expect("unknown voter").match_index)
                .chain(std::iter::once(last_index))
                .collect(),
        );

        // The quorum value may regress, e.g. after a restart or membership
        // change, so don't assert against it.
        let (mut commit_index, old_commit_term) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }
        commit_index = match self.log.get(quorum_index)? {
            Some(entry) if entry.term == self.term() => quorum_index,
            Some(_) => return Ok(commit_index),
            None => panic!("missing commit index {quorum_index}"),
        };
        self.log.commit(commit_index)?;

        // Apply the committed entries, responding to any waiting writes.
        let (id, term) = (self.id, self.term());
        let (writes, membership_change, node_tx) =
            (&mut self.role.writes, &mut self.role.membership_change, &self.node_tx);
        Self::maybe_apply_with(&mut self.log, &mut self.peers, &mut self.state, |index, result| {
            if *membership_change == Some(index) {
                *membership_change = None;
            }
            if let Some(write) = writes.remove(&index) {
                let response = match write.join {
                    true => result.map(|_| super::Response::Join),
                    false => result.map(super::Response::Write),
                };
                Self::send_with(
                    node_tx,
                    Envelope {
                        from: id,
                        to: id,
                        term,
                        message: Message::ClientResponse { id: write.id, response },
                    },
                )?;
            }
            Ok(())
        })?;

        self.maybe_compact()?;

        // A membership change may have added new peers; start tracking them.
        self.sync_progress();

        // If the commit term changed, there may be pending reads waiting for
        // us to commit an entry from our own term. Execute them.
        if old_commit_term != self.term() {
            self.maybe_read()?;
        }
        Ok(commit_index)
    }

    /// Executes any pending reads that are ready after quorum confirmation
    /// of their sequence number. It's only safe to read once we've committed
    /// and applied an entry from our own term (the noop appended at
    /// election), otherwise we may serve stale reads and violate
    /// linearizability.
    fn maybe_read(&mut self) -> Result<()> {
        if self.role.reads.is_empty() {
            return Ok(());
        }

        let (commit_index, commit_term) = self.log.get_commit_index();
        let applied_index = self.state.get_applied_index();
        if commit_term < self.term() || applied_index < commit_index {
            return Ok(());
        }

        // Determine the maximum read sequence confirmed by a voter quorum.
        let read_seq = self.quorum_value(
            self.peers
                .voter_ids(self.id)
                .iter()
                .map(|id| self.role.progress.get(id).expect("unknown voter").read_seq)
                .chain(std::iter::once(self.role.read_seq))
                .collect(),
        );

        while let Some(read) = self.role.reads.front() {
            if read.seq > read_seq {
                break;
            }
            let read = self.role.reads.pop_front().expect("no read");
            self.respond_read(read.id, read.command)?;
        }
        Ok(())
    }

    /// Sends pending log entries to a peer according to its next index, or
    /// a snapshot if the entries it needs have been compacted away. Sends an
    /// empty probe append if requested and there is nothing else to send,
    /// to discover the peer's match index.
    fn maybe_send_append(&mut self, peer: NodeID, mut probe: bool) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let (snapshot_index, snapshot_term) = self.log.get_snapshot_index();
        let (commit_index, _) = self.log.get_commit_index();
        let progress = self.role.progress.get_mut(&peer).expect("unknown node");
        assert_ne!(progress.next_index, 0, "invalid next_index");
        assert!(progress.next_index > progress.match_index, "invalid next_index <= match_index");
        assert!(progress.match_index <= last_index, "invalid match_index > last_index");
        assert!(progress.next_index <= last_index + 1, "invalid next_index > last_index + 1");

        // The entries the peer needs have been compacted into a snapshot;
        // stream it the snapshot instead.
        if progress.next_index <= snapshot_index {
            return self.send_snapshot(peer);
        }

        // If the peer is already caught up, there's no point sending more.
        if progress.match_index == last_index {
            return Ok(());
        }

        // If a probe was requested, but next_index is immediately after
        // match_index, the append must be accepted. Send the entries.
        if probe && progress.next_index == progress.match_index + 1 {
            probe = false;
        }

        // If there are no pending entries and this is not a probe, there's
        // nothing more to send.
        if progress.next_index > last_index && !probe {
            return Ok(());
        }

        let (base_index, base_term) = match progress.next_index - 1 {
            0 => (0, 0),
            i if i == snapshot_index => (snapshot_index, snapshot_term),
            i => self.log.get(i)?.map(|e| (e.index, e.term)).expect("missing base entry"),
        };

        let entries = match probe {
            false => self
                .log
                .scan(progress.next_index..)?
                .take(self.opts.max_append_entries)
                .collect::<Result<Vec<_>>>()?,
            true => Vec::new(),
        };

        // Optimistically assume the entries will be accepted, to avoid
        // resending them before the peer responds.
        let progress = self.role.progress.get_mut(&peer).expect("unknown node");
        if let Some(last) = entries.last() {
            progress.next_index = last.index + 1;
        }

        debug!("Replicating {} entries at base {base_index} to {peer}", entries.len());
        self.send(peer, Message::Append { base_index, base_term, commit_index, entries })
    }

    /// Streams the current snapshot to a peer whose next index has been
    /// compacted away.
    fn send_snapshot(&mut self, peer: NodeID) -> Result<()> {
        let Some((last_index, last_term, data)) = self.log.snapshot()? else {
            panic!("no snapshot to send to {peer}");
        };
        info!("Streaming snapshot through {last_index} to {peer}");

        let mut offset = 0;
        loop {
            let end = std::cmp::min(offset + SNAPSHOT_CHUNK_SIZE, data.len());
            let done = end == data.len();
            self.send(
                peer,
                Message::Snapshot {
                    last_index,
                    last_term,
                    offset: offset as u64,
                    data: data[offset..end].to_vec(),
                    done,
                },
            )?;
            if done {
                break;
            }
            offset = end;
        }

        // Optimistically resume appends beyond the snapshot; if the install
        // fails, the next heartbeat probe will restart the stream.
        let progress = self.progress(peer);
        progress.next_index = std::cmp::max(progress.next_index, last_index + 1);
        Ok(())
    }

    /// Promotes a learner to a voting member once it has caught up with our
    /// log, by proposing a promotion through the log. The promoting entry
    /// itself is committed under the pre-promotion quorum; the new voter
    /// counts from the entry's apply.
    fn maybe_promote(&mut self, peer: NodeID) -> Result<()> {
        if !self.peers.is_learner(peer) || self.role.membership_change.is_some() {
            return Ok(());
        }
        let (last_index, _) = self.log.get_last_index();
        if self.progress(peer).match_index + PROMOTE_LAG < last_index {
            return Ok(());
        }
        info!("Learner {peer} has caught up, promoting to voter");
        let index = self.propose(Some(Command::PromoteServer { id: peer }.encode()?))?;
        self.role.membership_change = Some(index);
        Ok(())
    }

    /// Starts tracking progress for peers added by a membership change.
    fn sync_progress(&mut self) {
        let next_index = self.log.get_last_index().0 + 1;
        for peer in self.peers.peer_ids(self.id) {
            self.role
                .progress
                .entry(peer)
                .or_insert(Progress { next_index, match_index: 0, read_seq: 0 });
        }
    }
}
