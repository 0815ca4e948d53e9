use super::{Envelope, Error, Message, Node, NodeID, RawNode, Request, Role, Term, Ticks};
use crate::encoding::Value as _;
use crate::error::Result;
use crate::raft::Command;

use log::{debug, info};
use std::collections::HashSet;

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received (including ourself).
    pub(super) votes: HashSet<NodeID>,
    /// Ticks elapsed since election start.
    pub(super) election_duration: Ticks,
    /// Election timeout, in ticks.
    pub(super) election_timeout: Ticks,
}

impl Candidate {
    /// Creates a new candidate role.
    pub(super) fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Transitions the candidate to a follower. We either lost the election
    /// and follow the winner, or we discovered a new term in which case we
    /// step into it as a leaderless follower.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<super::Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(super::Follower::new(Some(leader), election_timeout)))
        } else {
            // We found a new term, but don't yet know who the leader is.
            assert_ne!(term, self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            Ok(self.into_role(super::Follower::new(None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    pub(super) fn into_leader(self) -> Result<RawNode<super::Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        let (last_index, _) = self.log.get_last_index();
        let peers = self.peers.peer_ids(self.id);
        let mut node = self.into_role(super::Leader::new(&peers, last_index));

        // Check the uncommitted log tail for an in-flight membership change,
        // so we don't propose another one concurrently.
        let commit_index = node.log.get_commit_index().0;
        let mut scan = node.log.scan(commit_index + 1..)?;
        while let Some(entry) = scan.next().transpose()? {
            if let Some(command) = entry.command.as_deref() {
                if !matches!(Command::decode(command)?, Command::Write(_)) {
                    node.role.membership_change = Some(entry.index);
                }
            }
        }
        drop(scan);

        // Propose an empty command when assuming leadership, to commit and
        // disambiguate entries from previous terms (see section 8 in the
        // Raft paper). We do this before the heartbeat, to avoid a wasted
        // replication roundtrip if the heartbeat response indicates the peer
        // is behind.
        node.propose(None)?;
        node.maybe_commit_and_apply()?;
        node.heartbeat()?;

        Ok(node)
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
        // new leader, stepping it will follow it.
        if msg.term > self.term() {
            return self.into_follower(msg.term, None)?.step(msg);
        }

        match msg.message {
            // Don't grant votes to other candidates who also campaign.
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { vote: false })?
            }

            // If a voter granted us their vote, record it. If the votes give
            // us quorum, assume leadership. Learner votes don't count.
            Message::CampaignResponse { vote: true } => {
                if self.peers.is_voter(msg.from) {
                    self.role.votes.insert(msg.from);
                    if self.role.votes.len() >= self.quorum_size() {
                        return Ok(self.into_leader()?.into());
                    }
                }
            }

            // We didn't get a vote. :(
            Message::CampaignResponse { vote: false } => {}

            // If we receive a heartbeat, append, or snapshot chunk in this
            // term, we lost the election and have a new leader. Follow it
            // and step the message.
            Message::Heartbeat { .. } | Message::Append { .. } | Message::Snapshot { .. } => {
                return self.into_follower(msg.term, Some(msg.from))?.step(msg);
            }

            // Client reads and status can be served while campaigning;
            // writes have nowhere to go until an election completes.
            Message::ClientRequest { id, request } => {
                assert_eq!(msg.from, self.id, "client request from other node");
                match request {
                    Request::Read(command) => self.respond_read(id, command)?,
                    Request::Status => self.respond_status(id, None, Default::default())?,
                    Request::Write(_) | Request::Join { .. } => {
                        self.respond_error(id, Error::NoLeader)?
                    }
                }
            }

            // We're not a leader in this term, so we shouldn't see these.
            Message::HeartbeatResponse { .. }
            | Message::AppendResponse { .. }
            | Message::SnapshotResponse { .. }
            | Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. If the election times out without a
    /// winner, start a new campaign in a new term.
    pub(super) fn tick(mut self) -> Result<Node> {
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
        }
        Ok(self.into())
    }

    /// Campaigns for leadership by increasing the term, voting for ourself,
    /// and soliciting votes from all voters.
    pub(super) fn campaign(&mut self) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id); // vote for ourself
        self.log.set_term(term, Some(self.id))?;

        let (last_index, last_term) = self.log.get_last_index();
        for id in self.peers.voter_ids(self.id) {
            self.send(id, Message::Campaign { last_index, last_term })?;
        }
        Ok(())
    }
}
