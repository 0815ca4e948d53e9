use super::{Entry, Index, Membership, NodeID, Term};
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A message envelope passed between Raft nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The recipient.
    pub to: NodeID,
    /// The sender's current term.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

/// A message between Raft nodes, or between a node and its local server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Candidates campaign for leadership by soliciting votes from peers.
    Campaign {
        /// The index of the candidate's last stored log entry.
        last_index: Index,
        /// The term of the candidate's last stored log entry.
        last_term: Term,
    },

    /// Votes may be granted to a campaigning candidate, at most once per
    /// term on a first-come basis.
    CampaignResponse {
        /// Whether the vote was granted.
        vote: bool,
    },

    /// Leaders send periodic heartbeats to all peers, to confirm leadership,
    /// propagate the commit index, and confirm read sequence numbers.
    Heartbeat {
        /// The index of the leader's last log entry. Always has the
        /// leader's current term.
        last_index: Index,
        /// The index of the leader's last committed entry.
        commit_index: Index,
        /// The leader's latest read sequence number.
        read_seq: ReadSequence,
    },

    /// Followers respond to leader heartbeats.
    HeartbeatResponse {
        /// If non-zero, the heartbeat's last_index matched the follower's
        /// log. Otherwise 0, and the leader should probe or send a snapshot.
        match_index: Index,
        /// The heartbeat's read sequence number, confirming it for reads.
        read_seq: ReadSequence,
    },

    /// Leaders replicate log entries to followers and learners. An append
    /// with no entries still propagates the commit index.
    Append {
        /// The index of the entry immediately before the submitted entries.
        base_index: Index,
        /// The term of the base entry.
        base_term: Term,
        /// The index of the leader's last committed entry.
        commit_index: Index,
        /// Log entries to replicate.
        entries: Vec<Entry>,
    },

    /// Followers accept or reject appends. On rejection, the follower
    /// returns a hint about its conflicting entry so the leader can skip an
    /// entire divergent term when backfilling.
    AppendResponse {
        /// The last appended index, if the append succeeded. 0 otherwise.
        match_index: Index,
        /// The base index that was rejected, if the append failed. Lowered
        /// to just past the follower's last index if its log is shorter.
        /// 0 otherwise.
        reject_index: Index,
        /// On rejection, the term of the follower's conflicting entry and
        /// the first index of that term, if the follower has an entry at
        /// the rejected base index.
        conflict: Option<(Term, Index)>,
    },

    /// Leaders stream a snapshot to peers whose next index has been
    /// compacted away. Chunks are ordered by offset; a chunk stream is
    /// identified by (leader term, last_index), and partial streams are
    /// discarded on term changes.
    Snapshot {
        /// The last log index included in the snapshot.
        last_index: Index,
        /// The term of the last included entry.
        last_term: Term,
        /// The byte offset of this chunk.
        offset: u64,
        /// The chunk data.
        data: Vec<u8>,
        /// Whether this is the final chunk.
        done: bool,
    },

    /// Followers confirm snapshot installation, so the leader can resume
    /// appends beyond the snapshot boundary.
    SnapshotResponse {
        /// The last log index of the installed snapshot.
        last_index: Index,
    },

    /// A client request, submitted by the local server to its own node. If
    /// the node is not the leader it responds with a redirection error and
    /// the client must retry against the leader.
    ClientRequest {
        /// The request ID, unique for the duration of the request.
        id: RequestID,
        /// The request.
        request: Request,
    },

    /// A client response, routed back to the local server.
    ClientResponse {
        /// The response ID. This matches the ID of the ClientRequest.
        id: RequestID,
        /// The response, or an error.
        response: Result<Response>,
    },
}

/// A client request ID.
pub type RequestID = uuid::Uuid;

/// A read sequence number, used to confirm leadership for linearizable
/// reads.
pub type ReadSequence = u64;

/// A client request, submitted to the local node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Reads from the state machine. Served by the leader after quorum
    /// confirmation (linearizable), or locally by followers (stale, labeled
    /// with the applied index).
    Read(Vec<u8>),
    /// Mutates the state machine via the replicated log. Leader-only.
    Write(Vec<u8>),
    /// Adds a server to the cluster as a non-voting learner, to be promoted
    /// once it has caught up. Leader-only.
    Join { id: NodeID, addr: String },
    /// Fetches node and cluster status. Served by any node.
    Status,
}

/// A client response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// A state machine read result, labeled with the applied index of the
    /// serving replica as a staleness marker.
    Read { response: Vec<u8>, applied_index: Index },
    /// A state machine write result.
    Write(Vec<u8>),
    /// The server was accepted into the cluster as a learner.
    Join,
    /// Node and cluster status.
    Status(Status),
}

/// Node and cluster status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The node reporting the status.
    pub server: NodeID,
    /// The current leader, if known.
    pub leader: Option<NodeID>,
    /// The current term.
    pub term: Term,
    /// The reporting node's commit index.
    pub commit_index: Index,
    /// The reporting node's applied index.
    pub apply_index: Index,
    /// The match index of every peer. Only known to the leader; empty
    /// otherwise.
    pub match_index: BTreeMap<NodeID, Index>,
    /// The cluster membership.
    pub members: Membership,
}
