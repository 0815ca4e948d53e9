use super::{resolve_bounds, Scan, Store};
use crate::errinput;
use crate::error::Result;

use std::collections::{HashMap, VecDeque};
use std::ops::Bound;

/// An in-memory log store. Does not provide any durability, and is primarily
/// used for testing and ephemeral clusters.
pub struct Memory {
    /// The index of the first retained entry.
    base: u64,
    /// Retained log entries, starting at base.
    entries: VecDeque<Vec<u8>>,
    /// Metadata values.
    metadata: HashMap<Vec<u8>, Vec<u8>>,
    /// The current snapshot, as (last_index, last_term, data).
    snapshot: Option<(u64, u64, Vec<u8>)>,
}

impl Memory {
    /// Creates a new in-memory log store.
    pub fn new() -> Self {
        Self { base: 1, entries: VecDeque::new(), metadata: HashMap::new(), snapshot: None }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for Memory {
    fn append(&mut self, entry: Vec<u8>) -> Result<u64> {
        self.entries.push_back(entry);
        Ok(self.last_index())
    }

    fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
        if index < self.base {
            return Ok(None);
        }
        Ok(self.entries.get((index - self.base) as usize).cloned())
    }

    fn first_index(&self) -> u64 {
        self.base
    }

    fn last_index(&self) -> u64 {
        self.base + self.entries.len() as u64 - 1
    }

    fn scan(&self, range: (Bound<u64>, Bound<u64>)) -> Scan<'_> {
        let (start, end) = resolve_bounds(range, self.first_index(), self.last_index());
        if start > end {
            return Box::new(std::iter::empty());
        }
        let skip = (start - self.base) as usize;
        let take = (end - start + 1) as usize;
        Box::new(self.entries.iter().skip(skip).take(take).cloned().map(Ok))
    }

    fn truncate_from(&mut self, from: u64) -> Result<u64> {
        if from < self.base {
            return errinput!("can't truncate below first index {}", self.base);
        }
        self.entries.truncate((from - self.base) as usize);
        Ok(self.last_index())
    }

    fn get_metadata(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(key).cloned())
    }

    fn set_metadata(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.metadata.insert(key.to_vec(), value);
        Ok(())
    }

    fn install_snapshot(&mut self, last_index: u64, last_term: u64, data: Vec<u8>) -> Result<()> {
        if last_index + 1 < self.base {
            return errinput!("snapshot at {last_index} is below first index {}", self.base);
        }
        let discard = (last_index + 1 - self.base).min(self.entries.len() as u64);
        self.entries.drain(..discard as usize);
        self.base = last_index + 1;
        self.snapshot = Some((last_index, last_term, data));
        Ok(())
    }

    fn snapshot(&self) -> Result<Option<(u64, u64, Vec<u8>)>> {
        Ok(self.snapshot.clone())
    }

    fn snapshot_meta(&self) -> Option<(u64, u64)> {
        self.snapshot.as_ref().map(|(index, term, _)| (*index, *term))
    }
}
