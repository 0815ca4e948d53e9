use super::{Membership, NodeID, Term};
use crate::encoding::{bincode, Value as _};
use crate::error::{Error, Result};
use crate::storage;

use log::debug;
use serde_derive::{Deserialize, Serialize};
use std::ops::{Bound, RangeBounds};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// Metadata key storing the current term and vote.
const KEY_TERM_VOTE: &[u8] = b"term_vote";
/// Metadata key storing the membership snapshot.
const KEY_MEMBERSHIP: &[u8] = b"membership";

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The state machine command. None (noop) commands are proposed when a
    /// leader is elected, to commit entries from previous terms (see section
    /// 5.4.2 in the Raft paper).
    pub command: Option<Vec<u8>>,
}

/// A replicated command carried in log entries. Application writes are
/// opaque to the Raft layer; membership changes are applied by the node
/// itself when the entry commits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// An opaque application write command.
    Write(Vec<u8>),
    /// Adds a server to the cluster as a non-voting learner. It is
    /// replicated to but does not count towards quorum, and is promoted once
    /// it has caught up with the leader's log.
    AddServer { id: NodeID, addr: String },
    /// Promotes a learner to a voting member. The promoting entry itself is
    /// committed under the pre-promotion quorum; the new member counts from
    /// the entry's apply.
    PromoteServer { id: NodeID },
}

/// The Raft log stores a sequence of commands replicated across nodes and
/// applied sequentially to the local state machine. Each entry contains an
/// index, command, and the term in which the leader proposed it.
///
/// In the steady state the log is append-only: the leader appends a command
/// (via [`Log::append`]) and replicates it to followers who append it to
/// their logs (via [`Log::splice`]). When an index has been replicated to a
/// quorum of voters it is committed, making the log immutable up to that
/// index. Uncommitted entries may be replaced if a new leader was elected
/// and wrote different commands to the same indexes.
///
/// A prefix of applied entries may be replaced by a snapshot of the state
/// machine (via [`Log::compact`] locally, or [`Log::install_snapshot`] when
/// received from a leader). Reads below the snapshot boundary yield
/// [`Error::Compacted`], and callers fall back to snapshot transfer.
///
/// Invariants:
///
/// * Entry indexes are contiguous above the snapshot boundary.
/// * Entry terms never decrease from the previous entry.
/// * Entry terms are at or below the current term.
/// * Appended entries are durable (flushed to disk).
/// * Committed entries are never changed or removed.
/// * Entries with the same index/term contain the same command, and all
///   previous entries are identical (see section 5.3 in the Raft paper).
///
/// The commit index is volatile: appended entries are fsynced, and the
/// commit index is recovered from a log quorum after a restart. Entries at
/// or below the snapshot boundary are committed by definition.
pub struct Log {
    /// The underlying store. A trait object allows runtime engine selection
    /// without propagating generics throughout Raft.
    store: Box<dyn storage::Store>,
    /// The current term.
    term: Term,
    /// Our leader vote in the current term, if any.
    vote: Option<NodeID>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
    /// The index included in the current snapshot, or 0 if none.
    snapshot_index: Index,
    /// The term of the snapshot's last included entry.
    snapshot_term: Term,
}

impl Log {
    /// Initializes a log using the given store.
    pub fn new(store: Box<dyn storage::Store>) -> Result<Self> {
        let (term, vote) = store
            .get_metadata(KEY_TERM_VOTE)?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        let (snapshot_index, snapshot_term) = store.snapshot_meta().unwrap_or((0, 0));
        let (last_index, last_term) = match store.get(store.last_index())? {
            Some(bytes) => {
                let entry = Entry::decode(&bytes)?;
                (entry.index, entry.term)
            }
            None => (snapshot_index, snapshot_term),
        };
        // Entries at or below the snapshot boundary are committed by
        // definition; anything beyond it is recovered from a log quorum.
        let (commit_index, commit_term) = (snapshot_index, snapshot_term);
        Ok(Self {
            store,
            term,
            vote,
            last_index,
            last_term,
            commit_index,
            commit_term,
            snapshot_index,
            snapshot_term,
        })
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the snapshot boundary index and term (0 if no snapshot).
    pub fn get_snapshot_index(&self) -> (Index, Term) {
        (self.snapshot_index, self.snapshot_term)
    }

    /// Stores the current term and cast vote (if any), durably before
    /// returning, since vote safety depends on it. Enforces that the term
    /// does not regress and that we only vote for one node per term.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.store.set_metadata(KEY_TERM_VOTE, bincode::serialize(&(term, vote))?)?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Stores the cluster membership, durably, so it survives restarts.
    pub fn set_membership(&mut self, membership: &Membership) -> Result<()> {
        self.store.set_metadata(KEY_MEMBERSHIP, membership.encode()?)
    }

    /// Loads the stored cluster membership, if any.
    pub fn get_membership(&self) -> Result<Option<Membership>> {
        self.store.get_metadata(KEY_MEMBERSHIP)?.map(|v| Membership::decode(&v)).transpose()
    }

    /// Appends a command to the log at the current term and flushes it to
    /// disk, returning its index. None implies a noop command, typically
    /// after leader changes.
    pub fn append(&mut self, command: Option<Vec<u8>>) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = Entry { index: self.last_index + 1, term: self.term, command };
        let index = self.store.append(entry.encode()?)?;
        assert_eq!(index, entry.index, "appended entry index mismatch");
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        if index == self.commit_index {
            return Ok(index);
        }
        assert!(index > self.commit_index, "commit regression {} → {index}", self.commit_index);
        let term = match self.get(index)? {
            Some(entry) => entry.term,
            None => panic!("commit index {index} does not exist"),
        };
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist. Errors
    /// with Compacted if the index is at or below the snapshot boundary.
    pub fn get(&self, index: Index) -> Result<Option<Entry>> {
        if index == 0 {
            return Ok(None);
        }
        if index <= self.snapshot_index {
            return Err(Error::Compacted);
        }
        self.store.get(index)?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Checks if the log contains an entry with the given index and term.
    /// Indexes at or below the snapshot boundary are committed and known to
    /// match by the log matching property.
    pub fn has(&self, index: Index, term: Term) -> Result<bool> {
        if index == 0 {
            return Ok(term == 0);
        }
        if index == self.snapshot_index {
            return Ok(term == self.snapshot_term);
        }
        if index < self.snapshot_index {
            return Ok(true);
        }
        // Fast path: check against the last entry. This is the common case
        // when followers process appends or heartbeats.
        if (index, term) == (self.last_index, self.last_term) {
            return Ok(true);
        }
        if index > self.last_index {
            return Ok(false);
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Returns an iterator over log entries in the given index range. Errors
    /// with Compacted if the start of the range is below the snapshot
    /// boundary.
    pub fn scan(&self, range: impl RangeBounds<Index>) -> Result<Iterator<'_>> {
        let start = match range.start_bound() {
            Bound::Included(&index) => index,
            Bound::Excluded(&index) => index + 1,
            Bound::Unbounded => self.snapshot_index + 1,
        };
        if start <= self.snapshot_index {
            return Err(Error::Compacted);
        }
        let bounds = (
            Bound::Included(start),
            match range.end_bound() {
                Bound::Included(&index) => Bound::Included(index),
                Bound::Excluded(&index) => Bound::Excluded(index),
                Bound::Unbounded => Bound::Unbounded,
            },
        );
        Ok(Iterator { inner: self.store.scan(bounds) })
    }

    /// Returns an iterator over entries that are ready to apply, starting
    /// after the given applied index up to the commit index.
    pub fn scan_apply(&self, applied_index: Index) -> Result<Iterator<'_>> {
        // The local commit index is volatile and may trail the applied index
        // after a restart; it is then recovered from a log quorum.
        if applied_index >= self.commit_index {
            return Ok(Iterator { inner: Box::new(std::iter::empty()) });
        }
        self.scan(applied_index + 1..=self.commit_index)
    }

    /// Splices a set of entries into the log and flushes them to disk. The
    /// entries must have contiguous indexes and equal/increasing terms, and
    /// the first entry must connect to the existing log with a term at or
    /// above the base entry's and at or below the current term. Overlapping
    /// entries with the same term are ignored; overlapping entries with
    /// different terms truncate the existing log at the first conflict and
    /// splice the new entries. Returns the new last index.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        // Entries at or below the snapshot boundary are already committed
        // and known to match; skip them.
        let mut entries: &[Entry] = &entries;
        while let Some(first) = entries.first() {
            if first.index > self.snapshot_index {
                break;
            }
            entries = &entries[1..];
        }
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index); // empty input is noop
        };

        // Check that the entries are well-formed.
        if first.index == 0 || first.term == 0 {
            panic!("spliced entry has index or term 0");
        }
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            panic!("spliced entries are not contiguous");
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            panic!("spliced entries have term regression");
        }
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);

        // Check that the entries connect to the existing log (if any), and
        // that the term doesn't regress.
        let base_index = first.index - 1;
        let base_term = match base_index {
            0 => 0,
            i if i == self.snapshot_index => self.snapshot_term,
            i => match self.get(i)? {
                Some(base) => base.term,
                None => panic!("spliced entries at {} don't touch existing log", first.index),
            },
        };
        assert!(first.term >= base_term, "splice term regression {base_term} → {}", first.term);

        // Skip entries that are already in the log.
        let mut scan = self.scan(first.index..=last.index)?;
        while let Some(entry) = scan.next().transpose()? {
            assert_eq!(entry.index, entries[0].index, "index mismatch at {entry:?}");
            if entry.term != entries[0].term {
                break;
            }
            assert_eq!(entry.command, entries[0].command, "command mismatch at {entry:?}");
            entries = &entries[1..];
        }
        drop(scan);

        // If all entries already exist then we're done.
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Write the remaining entries, removing the tail of the old log if
        // necessary. We can never write below the commit index, since those
        // entries are immutable.
        assert!(first.index > self.commit_index, "spliced entries below commit index");
        if first.index <= self.last_index {
            debug!("Truncating log suffix from {}", first.index);
            self.store.truncate_from(first.index)?;
        }
        for entry in entries {
            self.store.append(entry.encode()?)?;
        }
        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }

    /// Captures a local snapshot of the state machine through the given
    /// applied index, and compacts the log prefix up to and including it.
    pub fn compact(&mut self, through: Index, state: Vec<u8>) -> Result<()> {
        assert!(through <= self.commit_index, "can't compact uncommitted entries");
        if through <= self.snapshot_index {
            return Ok(());
        }
        let term = match self.get(through)? {
            Some(entry) => entry.term,
            None => panic!("compaction index {through} does not exist"),
        };
        debug!("Compacting log through {through}");
        self.store.install_snapshot(through, term, state)?;
        self.snapshot_index = through;
        self.snapshot_term = term;
        Ok(())
    }

    /// Installs a snapshot received from a leader, discarding the log prefix
    /// through its last included index. A log suffix beyond the snapshot is
    /// retained; otherwise the log is reset to the snapshot boundary. The
    /// commit index advances to the snapshot boundary, since a snapshot only
    /// reflects committed state.
    pub fn install_snapshot(&mut self, index: Index, term: Term, state: Vec<u8>) -> Result<()> {
        assert!(index > self.snapshot_index, "snapshot regression {} → {index}", self.snapshot_index);
        self.store.install_snapshot(index, term, state)?;
        self.snapshot_index = index;
        self.snapshot_term = term;
        if index >= self.last_index {
            self.last_index = index;
            self.last_term = term;
        }
        if index >= self.commit_index {
            self.commit_index = index;
            self.commit_term = term;
        }
        Ok(())
    }

    /// Returns the current snapshot (index, term, state) for transfer to a
    /// lagging peer, if any.
    pub fn snapshot(&self) -> Result<Option<(Index, Term, Vec<u8>)>> {
        self.store.snapshot()
    }
}

/// A log entry iterator.
pub struct Iterator<'a> {
    inner: storage::Scan<'a>,
}

impl std::iter::Iterator for Iterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|v| Entry::decode(&v)))
    }
}
