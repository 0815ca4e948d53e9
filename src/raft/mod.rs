//! The Raft consensus protocol, with a chat state machine layered on top by
//! the server. Nodes replicate a durable command log, elect leaders with
//! randomized timeouts, advance a commit index on quorum replication, apply
//! committed commands deterministically, catch lagging peers up with
//! snapshots, and support two-phase membership changes (non-voting catch-up,
//! then promotion).

mod client;
mod log;
mod message;
mod node;
mod state;

pub use self::log::{Command, Entry, Index, Log};
pub use client::Client;
pub use message::{Envelope, Message, ReadSequence, Request, RequestID, Response, Status};
pub use node::{Membership, Node, NodeID, Options, Term, Ticks};
pub use state::State;

use std::time::Duration;

/// The duration of a logical clock tick. Used by the server event loop;
/// all node-internal timeouts are measured in ticks.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// The interval between leader heartbeats, in ticks.
pub const HEARTBEAT_INTERVAL: Ticks = 4;

/// The default range of randomized election timeouts, in ticks. This must be
/// significantly larger than the heartbeat interval plus fsync and one-way
/// network latency.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..20;

/// The maximum number of entries to send in a single Append message.
pub const MAX_APPEND_ENTRIES: usize = 128;

/// The default number of applied entries to retain in the log before
/// capturing a snapshot and compacting the prefix.
pub const SNAPSHOT_THRESHOLD: Index = 1024;

/// The maximum size of a single snapshot transfer chunk, in bytes.
pub const SNAPSHOT_CHUNK_SIZE: usize = 512 * 1024;

/// How many entries a learner may trail the leader's last index by and still
/// be considered caught up for promotion to a voting member.
pub const PROMOTE_LAG: Index = 1;

/// How long a client request may wait for a response before timing out.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
