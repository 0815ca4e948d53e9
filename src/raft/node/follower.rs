use super::{Envelope, Error, Membership, Message, Node, NodeID, Options, RawNode, Request, Role, Term, Ticks};
use crate::error::Result;
use crate::raft::{Index, Log, State};

use log::{debug, info};

/// A follower replicates state from a leader, granting votes to candidates
/// and redirecting client writes.
pub struct Follower {
    /// The leader, or None if just initialized.
    pub(super) leader: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    pub(super) leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election.
    pub(super) election_timeout: Ticks,
    /// A pending snapshot transfer from the leader, accumulated chunk by
    /// chunk. Discarded on leader or term changes.
    pub(super) snapshot: Option<PendingSnapshot>,
}

/// A partially received snapshot stream.
pub(super) struct PendingSnapshot {
    pub(super) last_index: Index,
    pub(super) last_term: Term,
    pub(super) data: Vec<u8>,
}

impl Follower {
    /// Creates a new follower role.
    pub(super) fn new(leader: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { leader, leader_seen: 0, election_timeout, snapshot: None }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower.
    pub(super) fn new(
        id: NodeID,
        peers: Membership,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let role = Follower::new(None, 0);
        let mut node = Self { id, peers, log, state, node_tx, opts, role };
        node.role.election_timeout = node.gen_election_timeout();
        Ok(node)
    }

    /// Transitions the follower into a candidate, campaigning for leadership
    /// in a new term.
    pub(super) fn into_candidate(mut self) -> Result<RawNode<super::Candidate>> {
        // Apply any pending entries, so we're caught up if we win.
        self.maybe_apply()?;
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(super::Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions the follower into a follower, either a leaderless one in
    /// a new term (e.g. if someone holds a new election) or following a
    /// leader in the current term once someone wins the election.
    fn into_follower(mut self, leader: Option<NodeID>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have leader in term");
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), self.role.election_timeout);
        } else {
            // We found a new term, but don't yet know who the leader is.
            assert_ne!(term, self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            self.role = Follower::new(None, self.gen_election_timeout());
        }
        Ok(self)
    }

    /// Checks if an address is the current leader.
    fn is_leader(&self, from: NodeID) -> bool {
        self.role.leader == Some(from)
    }

    /// Follows the given sender as leader, if we don't already have a leader
    /// in this term.
    fn maybe_follow(mut self, from: NodeID) -> Result<Self> {
        match self.role.leader {
            Some(leader) => assert_eq!(leader, from, "multiple leaders in term"),
            None => {
                let term = self.term();
                self = self.into_follower(Some(from), term)?;
            }
        }
        Ok(self)
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
        // follower in it and step the message. If the message is from the
        // leader, stepping it will follow the leader.
        if msg.term > self.term() {
            return self.into_follower(None, msg.term)?.step(msg);
        }

        // Record when we last saw a message from the leader (if any).
        if self.is_leader(msg.from) {
            self.role.leader_seen = 0
        }

        match msg.message {
            // The leader sends periodic heartbeats. Attempt to match its
            // last entry, and advance our commit index if it has.
            Message::Heartbeat { last_index, commit_index, read_seq } => {
                assert!(commit_index <= last_index, "commit index after last index");
                self = self.maybe_follow(msg.from)?;

                let match_index = if self.log.has(last_index, msg.term)? { last_index } else { 0 };
                self.send(msg.from, Message::HeartbeatResponse { match_index, read_seq })?;

                // Advance the commit index and apply entries. The match
                // implies that our log is identical to the leader's up to
                // last_index, so the commit index is present in our log.
                if match_index != 0 && commit_index > self.log.get_commit_index().0 {
                    self.log.commit(commit_index)?;
                    self.maybe_apply()?;
                    self.maybe_compact()?;
                }
            }

            // Append log entries from the leader to the local log.
            Message::Append { base_index, base_term, commit_index, entries } => {
                if let Some(first) = entries.first() {
                    assert_eq!(base_index, first.index - 1, "base index mismatch");
                }
                self = self.maybe_follow(msg.from)?;

                if base_index == 0 || self.log.has(base_index, base_term)? {
                    // The base entry matches, splice the entries.
                    let match_index = entries.last().map(|e| e.index).unwrap_or(base_index);
                    self.log.splice(entries)?;
                    self.send(
                        msg.from,
                        Message::AppendResponse { match_index, reject_index: 0, conflict: None },
                    )?;

                    // Advance the commit index up to the matched entry and
                    // apply the new entries.
                    let commit_to = std::cmp::min(commit_index, match_index);
                    if match_index != 0 && commit_to > self.log.get_commit_index().0 {
                        self.log.commit(commit_to)?;
                        self.maybe_apply()?;
                        self.maybe_compact()?;
                    }
                } else {
                    // The base entry is missing or conflicting. Reject the
                    // append, hinting the term of our conflicting entry and
                    // that term's first index so the leader can skip the
                    // entire divergent term.
                    let (last_index, _) = self.log.get_last_index();
                    let reject_index = std::cmp::min(base_index, last_index + 1);
                    let conflict = self.conflict_hint(reject_index)?;
                    debug!("Rejecting append at base {base_index}, hint {conflict:?}");
                    self.send(
                        msg.from,
                        Message::AppendResponse { match_index: 0, reject_index, conflict },
                    )?;
                }
            }

            // A candidate is requesting our vote in this term. Grant it on a
            // first-come basis if its log is at least as up-to-date as ours,
            // persisting the vote before responding. A repeated request from
            // the node we voted for is granted again.
            Message::Campaign { last_index, last_term } => {
                if let (_, Some(vote)) = self.log.get_term() {
                    if msg.from != vote {
                        self.send(msg.from, Message::CampaignResponse { vote: false })?;
                        return Ok(self.into());
                    }
                }

                let (log_index, log_term) = self.log.get_last_index();
                if log_term > last_term || log_term == last_term && log_index > last_index {
                    self.send(msg.from, Message::CampaignResponse { vote: false })?;
                    return Ok(self.into());
                }

                info!("Voting for {} in term {} election", msg.from, msg.term);
                self.log.set_term(msg.term, Some(msg.from))?;
                self.role.leader_seen = 0;
                self.send(msg.from, Message::CampaignResponse { vote: true })?;
            }

            // We may receive a stray vote after losing an election and
            // following a different leader. Ignore it.
            Message::CampaignResponse { .. } => {}

            // The leader is streaming us a snapshot because the entries we
            // need have been compacted away. Accumulate the chunks and
            // install the snapshot when complete.
            Message::Snapshot { last_index, last_term, offset, data, done } => {
                self = self.maybe_follow(msg.from)?;

                // If we already have this prefix, just confirm it.
                if last_index <= self.log.get_commit_index().0 {
                    self.role.snapshot = None;
                    self.send(msg.from, Message::SnapshotResponse { last_index })?;
                    return Ok(self.into());
                }

                // Start a new stream or continue the current one. Chunks
                // that don't line up are dropped; the leader will restart
                // the stream when the probe fails again.
                let matches = self.role.snapshot.as_ref().is_some_and(|pending| {
                    (pending.last_index, pending.last_term, pending.data.len() as u64)
                        == (last_index, last_term, offset)
                });
                if !matches {
                    if offset != 0 {
                        debug!("Dropping out-of-order snapshot chunk at offset {offset}");
                        return Ok(self.into());
                    }
                    self.role.snapshot =
                        Some(PendingSnapshot { last_index, last_term, data: Vec::new() });
                }
                let pending = self.role.snapshot.as_mut().expect("no pending snapshot");
                pending.data.extend_from_slice(&data);

                if done {
                    let pending = self.role.snapshot.take().expect("no pending snapshot");
                    info!("Installing snapshot through index {last_index}");
                    self.log.install_snapshot(
                        pending.last_index,
                        pending.last_term,
                        pending.data.clone(),
                    )?;
                    self.state.restore(pending.data)?;
                    debug_assert_eq!(
                        self.state.get_applied_index(),
                        last_index,
                        "snapshot applied index mismatch"
                    );
                    self.send(msg.from, Message::SnapshotResponse { last_index })?;
                }
            }

            // Client requests are submitted by the local server. Reads are
            // served from our applied state (stale, labeled with the applied
            // index); writes are redirected to the leader.
            Message::ClientRequest { id, request } => {
                assert_eq!(msg.from, self.id, "client request from other node");
                match request {
                    Request::Read(command) => self.respond_read(id, command)?,
                    Request::Status => self.respond_status(id, self.role.leader, Default::default())?,
                    Request::Write(_) | Request::Join { .. } => {
                        let error = match self.role.leader {
                            Some(leader) => Error::NotLeader(self.leader_addr(Some(leader))),
                            None => Error::NoLeader,
                        };
                        self.respond_error(id, error)?;
                    }
                }
            }

            // We're not a leader or candidate in this term, so we shouldn't
            // see these.
            Message::HeartbeatResponse { .. }
            | Message::AppendResponse { .. }
            | Message::SnapshotResponse { .. }
            | Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    pub(super) fn tick(mut self) -> Result<Node> {
        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            // Learners and non-members never campaign; they wait for the
            // leader to contact them.
            if self.peers.is_voter(self.id) {
                return Ok(self.into_candidate()?.into());
            }
            self.role.leader_seen = 0;
        }
        Ok(self.into())
    }

    /// Returns the term of our entry at the given index and the first index
    /// of that term, as a backfill hint for the leader. None if we have no
    /// entry there.
    fn conflict_hint(&self, index: Index) -> Result<Option<(Term, Index)>> {
        let entry = match self.log.get(index) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(Error::Compacted) => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut first = index;
        while first > 1 {
            match self.log.get(first - 1) {
                Ok(Some(prev)) if prev.term == entry.term => first -= 1,
                Ok(_) => break,
                Err(Error::Compacted) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(Some((entry.term, first)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{assert_messages, assert_node, drain, setup_node, TestState};
    use super::*;
    use crate::encoding::Value as _;
    use crate::raft::{Command, Entry, Envelope, Node, State as _};
    use pretty_assertions::assert_eq;

    /// Encodes a single-byte application write command.
    fn write(command: u8) -> Vec<u8> {
        Command::Write(vec![command]).encode().unwrap()
    }

    /// Sets up a follower with a log, following leader 2 in term 3.
    /// The log is 1@1 [0x01], 2@1 [0x02], 3@2 [0x03], committed and applied
    /// through 2.
    fn setup() -> (RawNode<Follower>, crossbeam::channel::Receiver<Envelope>) {
        let (mut node, rx) = setup_node(1, &[1, 2, 3, 4, 5]);
        node.log.set_term(1, None).unwrap();
        node.log.append(Some(write(0x01))).unwrap();
        node.log.append(Some(write(0x02))).unwrap();
        node.log.set_term(2, None).unwrap();
        node.log.append(Some(write(0x03))).unwrap();
        node.log.commit(2).unwrap();
        node.maybe_apply().unwrap();
        node.log.set_term(3, None).unwrap();
        node.role = Follower::new(Some(2), 3);
        (node, rx)
    }

    fn envelope(from: NodeID, to: NodeID, term: Term, message: Message) -> Envelope {
        Envelope { from, to, term, message }
    }

    fn entry(index: Index, term: Term, command: u8) -> Entry {
        Entry { index, term, command: Some(write(command)) }
    }

    /// Returns a serialized test state snapshot with the given applied
    /// index.
    fn test_snapshot(applied_index: Index) -> Vec<u8> {
        let mut state = TestState::new(0);
        for index in 1..=applied_index {
            state
                .apply(Entry { index, term: 1, command: Some(write(index as u8)) })
                .unwrap();
        }
        state.snapshot().unwrap()
    }

    #[test]
    fn step_heartbeat_unmatched_responds_zero() -> Result<()> {
        let (follower, rx) = setup();
        let node = follower.step(envelope(
            2,
            1,
            3,
            Message::Heartbeat { last_index: 3, commit_index: 3, read_seq: 7 },
        ))?;
        // The heartbeat's last_index carries the leader's term, which our
        // entry 3@2 doesn't match, so we respond with match_index 0.
        assert_node(&node).is_follower().term(3).leader(Some(2)).committed(2);
        assert_messages(
            &rx,
            vec![envelope(
                1,
                2,
                3,
                Message::HeartbeatResponse { match_index: 0, read_seq: 7 },
            )],
        );
        Ok(())
    }

    #[test]
    fn step_heartbeat_from_new_leader_follows() -> Result<()> {
        let (mut follower, rx) = setup();
        follower.role = Follower::new(None, 3);
        let node = follower.step(envelope(
            3,
            1,
            3,
            Message::Heartbeat { last_index: 0, commit_index: 0, read_seq: 0 },
        ))?;
        assert_node(&node).is_follower().term(3).leader(Some(3));
        assert_messages(
            &rx,
            vec![envelope(
                1,
                3,
                3,
                Message::HeartbeatResponse { match_index: 0, read_seq: 0 },
            )],
        );
        Ok(())
    }

    #[test]
    fn step_heartbeat_past_term_dropped() -> Result<()> {
        let (follower, rx) = setup();
        let node = follower.step(envelope(
            2,
            1,
            2,
            Message::Heartbeat { last_index: 3, commit_index: 2, read_seq: 0 },
        ))?;
        assert_node(&node).is_follower().term(3).leader(Some(2));
        assert_messages(&rx, vec![]);
        Ok(())
    }

    #[test]
    fn step_campaign_grants_vote_once() -> Result<()> {
        let (follower, rx) = setup();

        // First vote request is granted, also when repeated.
        let mut node = follower.step(envelope(
            3,
            1,
            3,
            Message::Campaign { last_index: 3, last_term: 2 },
        ))?;
        assert_node(&node).is_follower().term(3).voted_for(Some(3));
        assert_messages(&rx, vec![envelope(1, 3, 3, Message::CampaignResponse { vote: true })]);

        node = node.step(envelope(3, 1, 3, Message::Campaign { last_index: 3, last_term: 2 }))?;
        assert_messages(&rx, vec![envelope(1, 3, 3, Message::CampaignResponse { vote: true })]);

        // A request from a different candidate in the same term is refused.
        node = node.step(envelope(4, 1, 3, Message::Campaign { last_index: 3, last_term: 2 }))?;
        assert_node(&node).is_follower().term(3).voted_for(Some(3));
        assert_messages(&rx, vec![envelope(1, 4, 3, Message::CampaignResponse { vote: false })]);
        Ok(())
    }

    #[test]
    fn step_campaign_refuses_stale_log() -> Result<()> {
        let (follower, rx) = setup();

        // Candidate's last term is older than ours.
        let node = follower.step(envelope(
            3,
            1,
            3,
            Message::Campaign { last_index: 3, last_term: 1 },
        ))?;
        assert_node(&node).voted_for(None);
        assert_messages(&rx, vec![envelope(1, 3, 3, Message::CampaignResponse { vote: false })]);

        // Same last term, but shorter log.
        let node = node.step(envelope(3, 1, 3, Message::Campaign { last_index: 2, last_term: 2 }))?;
        assert_node(&node).voted_for(None);
        assert_messages(&rx, vec![envelope(1, 3, 3, Message::CampaignResponse { vote: false })]);
        Ok(())
    }

    #[test]
    fn step_append_appends_and_commits() -> Result<()> {
        let (follower, rx) = setup();
        let node = follower.step(envelope(
            2,
            1,
            3,
            Message::Append {
                base_index: 3,
                base_term: 2,
                commit_index: 4,
                entries: vec![entry(4, 3, 0x04), entry(5, 3, 0x05)],
            },
        ))?;
        assert_node(&node)
            .is_follower()
            .term(3)
            .last(5)
            .committed(4)
            .applied(4)
            .entry(entry(4, 3, 0x04));
        assert_messages(
            &rx,
            vec![envelope(
                1,
                2,
                3,
                Message::AppendResponse { match_index: 5, reject_index: 0, conflict: None },
            )],
        );
        Ok(())
    }

    #[test]
    fn step_append_empty_advances_commit() -> Result<()> {
        let (follower, rx) = setup();
        let node = follower.step(envelope(
            2,
            1,
            3,
            Message::Append { base_index: 2, base_term: 1, commit_index: 2, entries: vec![] },
        ))?;
        assert_node(&node).is_follower().last(3).committed(2).applied(2);
        assert_messages(
            &rx,
            vec![envelope(
                1,
                2,
                3,
                Message::AppendResponse { match_index: 2, reject_index: 0, conflict: None },
            )],
        );
        Ok(())
    }

    #[test]
    fn step_append_replaces_conflicting_suffix() -> Result<()> {
        let (follower, rx) = setup();
        let node = follower.step(envelope(
            2,
            1,
            3,
            Message::Append {
                base_index: 2,
                base_term: 1,
                commit_index: 2,
                entries: vec![entry(3, 3, 0x04), entry(4, 3, 0x05)],
            },
        ))?;
        assert_node(&node)
            .is_follower()
            .last(4)
            .entry(entry(3, 3, 0x04))
            .entry(entry(4, 3, 0x05));
        assert_messages(
            &rx,
            vec![envelope(
                1,
                2,
                3,
                Message::AppendResponse { match_index: 4, reject_index: 0, conflict: None },
            )],
        );
        Ok(())
    }

    #[test]
    fn step_append_rejects_missing_base() -> Result<()> {
        let (follower, rx) = setup();
        // Base index 5 is beyond our log, so the reject index is lowered to
        // just past our last entry, with no conflict hint.
        let node = follower.step(envelope(
            2,
            1,
            3,
            Message::Append {
                base_index: 5,
                base_term: 3,
                commit_index: 2,
                entries: vec![entry(6, 3, 0x06)],
            },
        ))?;
        assert_node(&node).is_follower().last(3);
        assert_messages(
            &rx,
            vec![envelope(
                1,
                2,
                3,
                Message::AppendResponse { match_index: 0, reject_index: 4, conflict: None },
            )],
        );
        Ok(())
    }

    #[test]
    fn step_append_rejects_with_conflict_hint() -> Result<()> {
        let (follower, rx) = setup();
        // Base 3@3 conflicts with our 3@2. The hint carries our conflicting
        // term 2 and its first index 3, so the leader can skip the term.
        let node = follower.step(envelope(
            2,
            1,
            3,
            Message::Append {
                base_index: 3,
                base_term: 3,
                commit_index: 2,
                entries: vec![entry(4, 3, 0x04)],
            },
        ))?;
        assert_node(&node).is_follower().last(3);
        assert_messages(
            &rx,
            vec![envelope(
                1,
                2,
                3,
                Message::AppendResponse {
                    match_index: 0,
                    reject_index: 3,
                    conflict: Some((2, 3)),
                },
            )],
        );
        Ok(())
    }

    #[test]
    fn step_snapshot_installs() -> Result<()> {
        let (follower, rx) = setup();
        let snapshot = test_snapshot(5);

        // Stream the snapshot in two chunks.
        let mid = snapshot.len() / 2;
        let mut node = follower.step(envelope(
            2,
            1,
            3,
            Message::Snapshot {
                last_index: 5,
                last_term: 3,
                offset: 0,
                data: snapshot[..mid].to_vec(),
                done: false,
            },
        ))?;
        assert_messages(&rx, vec![]);

        node = node.step(envelope(
            2,
            1,
            3,
            Message::Snapshot {
                last_index: 5,
                last_term: 3,
                offset: mid as u64,
                data: snapshot[mid..].to_vec(),
                done: true,
            },
        ))?;
        assert_node(&node).is_follower().last(5).committed(5).applied(5);
        assert_messages(&rx, vec![envelope(1, 2, 3, Message::SnapshotResponse { last_index: 5 })]);
        Ok(())
    }

    #[test]
    fn step_stale_snapshot_confirmed_without_install() -> Result<()> {
        let (follower, rx) = setup();
        let node = follower.step(envelope(
            2,
            1,
            3,
            Message::Snapshot { last_index: 1, last_term: 1, offset: 0, data: vec![], done: true },
        ))?;
        assert_node(&node).is_follower().last(3).committed(2).applied(2);
        assert_messages(&rx, vec![envelope(1, 2, 3, Message::SnapshotResponse { last_index: 1 })]);
        Ok(())
    }

    #[test]
    fn step_client_write_redirects_to_leader() -> Result<()> {
        let (follower, rx) = setup();
        let id = uuid::Uuid::new_v4();
        let node = follower.step(envelope(
            1,
            1,
            3,
            Message::ClientRequest { id, request: Request::Write(vec![0x01]) },
        ))?;
        assert_node(&node).is_follower();
        assert_messages(
            &rx,
            vec![envelope(
                1,
                1,
                3,
                Message::ClientResponse {
                    id,
                    response: Err(Error::NotLeader(Some("localhost:9702".into()))),
                },
            )],
        );
        Ok(())
    }

    #[test]
    fn step_client_write_without_leader_errors() -> Result<()> {
        let (mut follower, rx) = setup();
        follower.role = Follower::new(None, 3);
        let id = uuid::Uuid::new_v4();
        let node = follower.step(envelope(
            1,
            1,
            3,
            Message::ClientRequest { id, request: Request::Write(vec![0x01]) },
        ))?;
        assert_node(&node).is_follower();
        assert_messages(
            &rx,
            vec![envelope(1, 1, 3, Message::ClientResponse { id, response: Err(Error::NoLeader) })],
        );
        Ok(())
    }

    #[test]
    fn step_client_read_serves_stale_locally() -> Result<()> {
        let (follower, rx) = setup();
        let id = uuid::Uuid::new_v4();
        // The test state reads back the command at the given 1-based index.
        let node = follower.step(envelope(
            1,
            1,
            3,
            Message::ClientRequest { id, request: Request::Read(vec![0x01]) },
        ))?;
        assert_node(&node).is_follower();
        assert_messages(
            &rx,
            vec![envelope(
                1,
                1,
                3,
                Message::ClientResponse {
                    id,
                    response: Ok(crate::raft::Response::Read {
                        response: vec![0xbb, 0x01],
                        applied_index: 2,
                    }),
                },
            )],
        );
        Ok(())
    }

    #[test]
    fn tick_becomes_candidate_at_timeout() -> Result<()> {
        let (follower, rx) = setup();
        let timeout = follower.role.election_timeout;
        let mut node = Node::Follower(follower);
        for _ in 0..timeout {
            assert_node(&node).is_follower();
            node = node.tick()?;
        }
        assert_node(&node).is_candidate().term(4).voted_for(Some(1));
        // Votes are solicited from the other voters.
        let msgs = drain(&rx);
        assert_eq!(msgs.len(), 4);
        for msg in msgs {
            assert_eq!(msg.term, 4);
            assert_eq!(msg.message, Message::Campaign { last_index: 3, last_term: 2 });
        }
        Ok(())
    }

    #[test]
    fn tick_heartbeat_resets_timeout() -> Result<()> {
        let (follower, _rx) = setup();
        let timeout = follower.role.election_timeout;
        let mut node = Node::Follower(follower);
        for _ in 0..3 * timeout {
            node = node.tick()?;
            node = node.step(envelope(
                2,
                1,
                3,
                Message::Heartbeat { last_index: 2, commit_index: 2, read_seq: 0 },
            ))?;
        }
        assert_node(&node).is_follower().leader(Some(2));
        Ok(())
    }

    #[test]
    fn tick_learner_never_campaigns() -> Result<()> {
        let (mut follower, rx) = setup_node(1, &[2, 3]);
        follower.peers.add_learner(1, "localhost:9701".into());
        let timeout = follower.role.election_timeout;
        let mut node = Node::Follower(follower);
        for _ in 0..3 * timeout {
            node = node.tick()?;
        }
        assert_node(&node).is_follower();
        assert_messages(&rx, vec![]);
        Ok(())
    }
}
