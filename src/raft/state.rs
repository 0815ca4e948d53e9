use super::{Entry, Index};
use crate::error::Result;

/// A Raft-managed state machine. Entries are applied exactly once, in log
/// index order, on every replica.
pub trait State: Send {
    /// Returns the last applied index. Used to determine which committed
    /// entries still need to be applied, and where reads are served from.
    fn get_applied_index(&self) -> Index;

    /// Applies a committed log entry and returns the result, advancing the
    /// applied index. This must be deterministic: any given entry must
    /// produce the same result and state on every replica. Application
    /// errors (e.g. a write to an unknown user) are part of that
    /// deterministic result and are returned to the leader's waiting client;
    /// non-deterministic failures must panic to avoid replica divergence.
    /// Noop and membership entries advance the applied index only.
    fn apply(&mut self, entry: Entry) -> Result<Vec<u8>>;

    /// Reads from the state machine. Never mutates state.
    fn read(&self, command: Vec<u8>) -> Result<Vec<u8>>;

    /// Returns a serialized snapshot of the state machine, reflecting all
    /// entries up to the applied index.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the state machine with a snapshot previously produced by
    /// snapshot(), including its applied index.
    fn restore(&mut self, data: Vec<u8>) -> Result<()>;
}
