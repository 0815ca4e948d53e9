use super::{resolve_bounds, Scan, Store};
use crate::encoding::bincode;
use crate::errinput;
use crate::error::Result;

use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::{BufReader, Read as _, Seek as _, SeekFrom, Write as _};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A file-backed log store, with files in a given directory:
///
/// * log: an 8-byte big-endian base index header, followed by sequential
///   entries length-prefixed with a big-endian u64. Appends and suffix
///   truncations are fsynced before returning, since Raft requires appended
///   entries to be durable before they are acknowledged.
/// * metadata: a bincode-encoded key/value map, rewritten on every change.
///   Holds the current term/vote and the membership snapshot.
/// * snapshot: a bincode-encoded (last_index, last_term, state) triple,
///   swapped in atomically via a temporary file and rename.
///
/// An in-memory index of entry positions and sizes is rebuilt on startup by
/// scanning the log file. Since datasets are expected to be small, scanning
/// the file on startup is reasonably cheap. Installing a snapshot rewrites
/// the log file with the retained suffix and a new base index; if the
/// process crashes between the snapshot swap and the log rewrite, the stale
/// prefix is dropped on the next open.
pub struct File {
    /// The directory containing the store's files.
    dir: PathBuf,
    /// The log file. Protected by a mutex for interior mutability (read seeks).
    log: Mutex<std::fs::File>,
    /// Index of entry positions and sizes in the log file.
    index: BTreeMap<u64, (u64, u64)>,
    /// The index of the first entry in the log file.
    base: u64,
    /// Metadata cache. Flushed to disk on changes.
    metadata: HashMap<Vec<u8>, Vec<u8>>,
    /// The file used to store metadata.
    metadata_file: std::fs::File,
    /// The (last_index, last_term) of the current snapshot, if any.
    snapshot_meta: Option<(u64, u64)>,
    /// If true, fsync writes.
    sync: bool,
}

impl File {
    /// Creates or opens a file-backed log store in the given directory.
    pub fn new(dir: &Path, sync: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let snapshot_meta = match Self::read_snapshot(dir)? {
            Some((last_index, last_term, _)) => Some((last_index, last_term)),
            None => None,
        };

        let mut log =
            OpenOptions::new().read(true).write(true).create(true).open(dir.join("log"))?;
        if log.metadata()?.len() == 0 {
            let base = snapshot_meta.map(|(i, _)| i + 1).unwrap_or(1);
            log.write_all(&base.to_be_bytes())?;
            log.sync_data()?;
        }
        let (base, index) = Self::build_index(&mut log)?;

        let metadata_file =
            OpenOptions::new().read(true).write(true).create(true).open(dir.join("metadata"))?;
        let metadata = bincode::maybe_deserialize_from(&metadata_file)?.unwrap_or_default();

        let mut store = Self {
            dir: dir.to_path_buf(),
            log: Mutex::new(log),
            index,
            base,
            metadata,
            metadata_file,
            snapshot_meta,
            sync,
        };

        // Drop any log prefix at or below the snapshot boundary, e.g. after
        // a crash between the snapshot swap and the log rewrite.
        if let Some((last_index, _)) = store.snapshot_meta {
            if store.base <= last_index {
                debug!("Dropping stale log prefix through {last_index}");
                let retained = store.entries_from(last_index + 1)?;
                store.rewrite_log(last_index + 1, retained)?;
            }
        }
        Ok(store)
    }

    /// Builds the position index by scanning the log file.
    fn build_index(log: &mut std::fs::File) -> Result<(u64, BTreeMap<u64, (u64, u64)>)> {
        let filesize = log.metadata()?.len();
        log.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(log);
        let mut buf = [0; 8];
        reader.read_exact(&mut buf)?;
        let base = u64::from_be_bytes(buf);
        let mut index = BTreeMap::new();
        let mut pos = 8;
        let mut i = base;
        while pos < filesize {
            reader.read_exact(&mut buf)?;
            pos += 8;
            let size = u64::from_be_bytes(buf);
            index.insert(i, (pos, size));
            reader.seek_relative(size as i64)?;
            pos += size;
            i += 1;
        }
        Ok((base, index))
    }

    /// Reads the snapshot file in the given directory, if it exists.
    fn read_snapshot(dir: &Path) -> Result<Option<(u64, u64, Vec<u8>)>> {
        match std::fs::read(dir.join("snapshot")) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads all entries with index >= from.
    fn entries_from(&self, from: u64) -> Result<Vec<Vec<u8>>> {
        self.scan((Bound::Included(from), Bound::Unbounded)).collect()
    }

    /// Rewrites the log file with the given base index and entries, swapping
    /// it in atomically via a temporary file, then rebuilds the index.
    fn rewrite_log(&mut self, base: u64, entries: Vec<Vec<u8>>) -> Result<()> {
        let tmp_path = self.dir.join("log.tmp");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&base.to_be_bytes())?;
        for entry in &entries {
            tmp.write_all(&(entry.len() as u64).to_be_bytes())?;
            tmp.write_all(entry)?;
        }
        tmp.sync_data()?;
        std::fs::rename(&tmp_path, self.dir.join("log"))?;

        let mut log = tmp;
        let (new_base, index) = Self::build_index(&mut log)?;
        assert_eq!(new_base, base, "log base mismatch after rewrite");
        self.log = Mutex::new(log);
        self.base = base;
        self.index = index;
        Ok(())
    }
}

impl Store for File {
    fn append(&mut self, entry: Vec<u8>) -> Result<u64> {
        let index = self.last_index() + 1;
        let mut log = self.log.lock()?;
        let pos = log.seek(SeekFrom::End(0))?;
        log.write_all(&(entry.len() as u64).to_be_bytes())?;
        log.write_all(&entry)?;
        if self.sync {
            log.sync_data()?;
        }
        drop(log);
        self.index.insert(index, (pos + 8, entry.len() as u64));
        Ok(index)
    }

    fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
        let Some(&(pos, size)) = self.index.get(&index) else {
            return Ok(None);
        };
        let mut entry = vec![0; size as usize];
        let mut log = self.log.lock()?;
        log.seek(SeekFrom::Start(pos))?;
        log.read_exact(&mut entry)?;
        Ok(Some(entry))
    }

    fn first_index(&self) -> u64 {
        self.base
    }

    fn last_index(&self) -> u64 {
        self.index.keys().next_back().copied().unwrap_or(self.base - 1)
    }

    fn scan(&self, range: (Bound<u64>, Bound<u64>)) -> Scan<'_> {
        let (start, end) = resolve_bounds(range, self.first_index(), self.last_index());
        if start > end {
            return Box::new(std::iter::empty());
        }
        Box::new((start..=end).map(move |i| match self.get(i)? {
            Some(entry) => Ok(entry),
            None => errinput!("missing entry at index {i}"),
        }))
    }

    fn truncate_from(&mut self, from: u64) -> Result<u64> {
        if from < self.base {
            return errinput!("can't truncate below first index {}", self.base);
        }
        if from > self.last_index() {
            return Ok(self.last_index());
        }
        let &(pos, _) = self.index.get(&from).expect("missing indexed entry");
        let log = self.log.lock()?;
        log.set_len(pos - 8)?;
        if self.sync {
            log.sync_data()?;
        }
        drop(log);
        self.index.split_off(&from);
        Ok(self.last_index())
    }

    fn get_metadata(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(key).cloned())
    }

    fn set_metadata(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.metadata.insert(key.to_vec(), value);
        self.metadata_file.set_len(0)?;
        self.metadata_file.seek(SeekFrom::Start(0))?;
        bincode::serialize_into(&mut self.metadata_file, &self.metadata)?;
        self.metadata_file.flush()?;
        if self.sync {
            self.metadata_file.sync_data()?;
        }
        Ok(())
    }

    fn install_snapshot(&mut self, last_index: u64, last_term: u64, data: Vec<u8>) -> Result<()> {
        if last_index + 1 < self.base {
            return errinput!("snapshot at {last_index} is below first index {}", self.base);
        }

        let tmp_path = self.dir.join("snapshot.tmp");
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        bincode::serialize_into(&mut tmp, &(last_index, last_term, &data))?;
        tmp.flush()?;
        tmp.sync_data()?;
        std::fs::rename(&tmp_path, self.dir.join("snapshot"))?;
        self.snapshot_meta = Some((last_index, last_term));

        let retained = self.entries_from(last_index + 1)?;
        self.rewrite_log(last_index + 1, retained)
    }

    fn snapshot(&self) -> Result<Option<(u64, u64, Vec<u8>)>> {
        Self::read_snapshot(&self.dir)
    }

    fn snapshot_meta(&self) -> Option<(u64, u64)> {
        self.snapshot_meta
    }
}

impl Drop for File {
    /// Attempt to fsync data on drop, in case we're running without sync.
    fn drop(&mut self) {
        self.metadata_file.sync_all().ok();
        self.log.lock().map(|f| f.sync_all().ok()).ok();
    }
}
