//! Durable member state.
//!
//! Two things must survive a crash: the hard state (current term and vote)
//! and the log entries. Both must be durable before any RPC reply that
//! depends on them is sent. A failure to persist is fatal to the leader
//! role.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_core::{Error, LogIndex, NodeId, Result, StorageErrorKind, TermId};

use crate::log::Entry;

/// The term/vote pair that must never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardState {
    /// Latest term this member has seen.
    pub term: TermId,
    /// The candidate voted for in `term`, if any.
    pub voted_for: Option<NodeId>,
}

impl HardState {
    /// Initial state for a fresh member.
    #[must_use]
    pub const fn initial() -> Self {
        Self {
            term: TermId::new(0),
            voted_for: None,
        }
    }

    /// Encodes to: term(8) + vote_present(1) + vote(8 if present).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u64_le(self.term.get());
        match self.voted_for {
            Some(node) => {
                buf.put_u8(1);
                buf.put_u64_le(node.get());
            }
            None => buf.put_u8(0),
        }
        buf.freeze()
    }

    /// Decodes from the format produced by [`Self::encode`].
    #[must_use]
    pub fn decode(mut data: Bytes) -> Option<Self> {
        if data.len() < 9 {
            return None;
        }
        let term = TermId::new(data.get_u64_le());
        let voted_for = match data.get_u8() {
            0 => None,
            1 if data.remaining() >= 8 => Some(NodeId::new(data.get_u64_le())),
            _ => return None,
        };
        Some(Self { term, voted_for })
    }
}

/// Durable storage for a member's hard state and log entries.
pub trait StableStore: Send + Sync {
    /// Persists the hard state. Must be durable on return.
    fn save_hard_state(&mut self, state: &HardState) -> Result<()>;

    /// Loads the hard state, or `None` on a fresh start.
    fn load_hard_state(&self) -> Result<Option<HardState>>;

    /// Loads the retained log entries, in index order.
    fn load_entries(&self) -> Result<Vec<Entry>>;

    /// Persists one log entry. Must be durable on return.
    fn append_entry(&mut self, entry: &Entry) -> Result<()>;

    /// Discards persisted entries at and after `from` (conflict truncation).
    fn truncate_from(&mut self, from: LogIndex) -> Result<()>;

    /// Discards persisted entries at and below `to` (snapshot compaction).
    fn compact_to(&mut self, to: LogIndex) -> Result<()>;
}

/// In-memory store for tests and volatile deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    hard_state: Option<HardState>,
    entries: Vec<Entry>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of retained entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl StableStore for MemoryStore {
    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.hard_state = Some(*state);
        Ok(())
    }

    fn load_hard_state(&self) -> Result<Option<HardState>> {
        Ok(self.hard_state)
    }

    fn load_entries(&self) -> Result<Vec<Entry>> {
        Ok(self.entries.clone())
    }

    fn append_entry(&mut self, entry: &Entry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn truncate_from(&mut self, from: LogIndex) -> Result<()> {
        self.entries.retain(|e| e.index < from);
        Ok(())
    }

    fn compact_to(&mut self, to: LogIndex) -> Result<()> {
        self.entries.retain(|e| e.index > to);
        Ok(())
    }
}

/// File-backed store: hard state in one small file replaced atomically,
/// entries appended to a frame-per-entry log file.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    entries: Vec<Entry>,
}

impl FileStore {
    const STATE_FILE: &'static str = "hardstate";
    const LOG_FILE: &'static str = "entries";

    /// Opens (or creates) a store under `dir`, reloading what is there.
    ///
    /// # Errors
    /// Returns a storage error if the directory cannot be created or the
    /// existing files cannot be read.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|_| Error::Storage(StorageErrorKind::Io))?;

        let mut store = Self {
            dir,
            entries: Vec::new(),
        };
        store.reload_entries()?;
        Ok(store)
    }

    /// Returns the entries reloaded from disk.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(Self::STATE_FILE)
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(Self::LOG_FILE)
    }

    fn reload_entries(&mut self) -> Result<()> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read(&path).map_err(|_| Error::Storage(StorageErrorKind::Io))?;
        let mut buf = Bytes::from(raw);

        while buf.remaining() >= 4 {
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(Error::Storage(StorageErrorKind::Corruption));
            }
            let frame = buf.split_to(len);
            let entry =
                Entry::decode(frame).ok_or(Error::Storage(StorageErrorKind::Corruption))?;
            self.entries.push(entry);
        }
        Ok(())
    }

    fn rewrite_log(&self) -> Result<()> {
        let mut buf = BytesMut::new();
        for entry in &self.entries {
            let frame = entry.encode();
            buf.put_u32_le(frame.len() as u32);
            buf.extend_from_slice(&frame);
        }

        let tmp = self.dir.join("entries.tmp");
        fs::write(&tmp, &buf).map_err(|_| Error::Storage(StorageErrorKind::Io))?;
        fs::rename(&tmp, self.log_path()).map_err(|_| Error::Storage(StorageErrorKind::Io))
    }
}

impl StableStore for FileStore {
    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        let tmp = self.dir.join("hardstate.tmp");
        let mut file = fs::File::create(&tmp).map_err(|_| Error::Storage(StorageErrorKind::Io))?;
        file.write_all(&state.encode())
            .map_err(|_| Error::Storage(StorageErrorKind::Io))?;
        file.sync_all()
            .map_err(|_| Error::Storage(StorageErrorKind::Io))?;
        fs::rename(&tmp, self.state_path()).map_err(|_| Error::Storage(StorageErrorKind::Io))
    }

    fn load_hard_state(&self) -> Result<Option<HardState>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).map_err(|_| Error::Storage(StorageErrorKind::Io))?;
        HardState::decode(Bytes::from(raw))
            .map(Some)
            .ok_or(Error::Storage(StorageErrorKind::Corruption))
    }

    fn load_entries(&self) -> Result<Vec<Entry>> {
        Ok(self.entries.clone())
    }

    fn append_entry(&mut self, entry: &Entry) -> Result<()> {
        let frame = entry.encode();
        let mut buf = BytesMut::with_capacity(4 + frame.len());
        buf.put_u32_le(frame.len() as u32);
        buf.extend_from_slice(&frame);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .map_err(|_| Error::Storage(StorageErrorKind::Io))?;
        file.write_all(&buf)
            .map_err(|_| Error::Storage(StorageErrorKind::Io))?;
        file.sync_all()
            .map_err(|_| Error::Storage(StorageErrorKind::Io))?;

        self.entries.push(entry.clone());
        Ok(())
    }

    fn truncate_from(&mut self, from: LogIndex) -> Result<()> {
        self.entries.retain(|e| e.index < from);
        self.rewrite_log()
    }

    fn compact_to(&mut self, to: LogIndex) -> Result<()> {
        self.entries.retain(|e| e.index > to);
        self.rewrite_log()
    }
}
