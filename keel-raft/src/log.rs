//! Log entries and the in-memory log.
//!
//! The log owns the commit and applied indexes and the snapshot boundary.
//! Entries before the boundary have been compacted away; their cumulative
//! effect lives in the latest snapshot.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_core::{LogIndex, TermId};

/// Fixed bytes of an encoded entry before the payload:
/// index(8) + term(8) + prev_term(8) + payload_len(4).
pub(crate) const ENTRY_HEADER_BYTES: usize = 28;

/// A single replicated log entry.
///
/// `prev_term` is the term of the preceding entry, captured at append time
/// so a dispatch batch can fill `prev_log_term` without a log lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Position in the log. Dense and strictly increasing.
    pub index: LogIndex,
    /// Term in which the entry was created.
    pub term: TermId,
    /// Term of the entry at `index - 1`.
    pub prev_term: TermId,
    /// Opaque state-machine command.
    pub payload: Bytes,
}

impl Entry {
    /// Creates a new entry.
    #[must_use]
    pub const fn new(index: LogIndex, term: TermId, prev_term: TermId, payload: Bytes) -> Self {
        Self {
            index,
            term,
            prev_term,
            payload,
        }
    }

    /// Returns the wire size of this entry in bytes.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        (ENTRY_HEADER_BYTES + self.payload.len()) as u64
    }

    /// Encodes the entry for the wire.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENTRY_HEADER_BYTES + self.payload.len());
        buf.put_u64_le(self.index.get());
        buf.put_u64_le(self.term.get());
        buf.put_u64_le(self.prev_term.get());
        buf.put_u32_le(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes an entry from the wire.
    ///
    /// Returns `None` if the buffer is truncated or the length field lies.
    #[must_use]
    pub fn decode(mut data: Bytes) -> Option<Self> {
        if data.len() < ENTRY_HEADER_BYTES {
            return None;
        }

        let index = LogIndex::new(data.get_u64_le());
        let term = TermId::new(data.get_u64_le());
        let prev_term = TermId::new(data.get_u64_le());
        let payload_len = data.get_u32_le() as usize;

        if data.remaining() != payload_len {
            return None;
        }

        Some(Self {
            index,
            term,
            prev_term,
            payload: data,
        })
    }
}

/// What a follower-side append actually changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// First index of a truncated conflicting suffix, if any.
    pub truncated_from: Option<LogIndex>,
    /// Entries newly added to the log.
    pub appended: Vec<Entry>,
}

/// In-memory replicated log with a compaction boundary.
#[derive(Debug, Default)]
pub struct RaftLog {
    /// Live entries; `entries[0]` is at `snapshot_index + 1`.
    entries: Vec<Entry>,
    /// Last index compacted into a snapshot (0 when none).
    snapshot_index: LogIndex,
    /// Term at `snapshot_index`.
    snapshot_term: TermId,
    /// Highest index known committed.
    commit_index: LogIndex,
    /// Highest index applied to the state machine.
    applied_index: LogIndex,
}

impl RaftLog {
    /// Creates an empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            snapshot_index: LogIndex::new(0),
            snapshot_term: TermId::new(0),
            commit_index: LogIndex::new(0),
            applied_index: LogIndex::new(0),
        }
    }

    /// Returns the index of the first live entry, or the boundary if none.
    #[must_use]
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index.next()
    }

    /// Returns the last log index, counting the snapshot boundary.
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map_or(self.snapshot_index, |e| e.index)
    }

    /// Returns the term of the last entry, counting the snapshot boundary.
    #[must_use]
    pub fn last_term(&self) -> TermId {
        self.entries.last().map_or(self.snapshot_term, |e| e.term)
    }

    /// Returns the commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Returns the applied index.
    #[must_use]
    pub const fn applied_index(&self) -> LogIndex {
        self.applied_index
    }

    /// Returns the snapshot boundary `(last_included_index, term)`.
    #[must_use]
    pub const fn snapshot_boundary(&self) -> (LogIndex, TermId) {
        (self.snapshot_index, self.snapshot_term)
    }

    /// Returns the entry at `index`, if it is live.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        if index <= self.snapshot_index {
            return None;
        }
        let offset = (index.get() - self.snapshot_index.get() - 1) as usize;
        self.entries.get(offset)
    }

    /// Returns the term at `index`: from a live entry, the snapshot
    /// boundary, or zero for the empty prefix.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> TermId {
        if index.get() == 0 {
            return TermId::new(0);
        }
        if index == self.snapshot_index {
            return self.snapshot_term;
        }
        self.get(index).map_or(TermId::new(0), |e| e.term)
    }

    /// Returns true if the log contains `(index, term)`.
    ///
    /// Index zero and the snapshot boundary both match by construction.
    #[must_use]
    pub fn match_term(&self, index: LogIndex, term: TermId) -> bool {
        if index.get() == 0 {
            return true;
        }
        if index == self.snapshot_index {
            return term == self.snapshot_term;
        }
        self.get(index).is_some_and(|e| e.term == term)
    }

    /// Builds and appends a new leader-side entry, returning it.
    pub fn append_new(&mut self, term: TermId, payload: Bytes) -> Entry {
        let entry = Entry::new(self.last_index().next(), term, self.last_term(), payload);
        self.entries.push(entry.clone());
        entry
    }

    /// Appends follower-side entries, truncating a conflicting suffix.
    ///
    /// Entries at or below the commit index must agree with what is already
    /// stored; re-delivery of present entries is a no-op. The returned
    /// outcome names the truncation point (if any) and the entries actually
    /// added, so the caller can mirror the change into durable storage.
    pub fn append_entries(&mut self, entries: Vec<Entry>) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();

        for entry in entries {
            if let Some(existing) = self.get(entry.index) {
                if existing.term == entry.term {
                    continue;
                }
                debug_assert!(
                    entry.index > self.commit_index,
                    "conflict below the commit index"
                );
                self.truncate_after(entry.index.prev());
                outcome.truncated_from.get_or_insert(entry.index);
            }

            if entry.index == self.last_index().next() {
                self.entries.push(entry.clone());
                outcome.appended.push(entry);
            }
        }

        outcome
    }

    /// Drops all entries after `last_to_keep`.
    pub fn truncate_after(&mut self, last_to_keep: LogIndex) {
        if last_to_keep <= self.snapshot_index {
            self.entries.clear();
            return;
        }
        let keep = (last_to_keep.get() - self.snapshot_index.get()) as usize;
        self.entries.truncate(keep);
    }

    /// Returns clones of the entries in `[start, end]`, clamped to what is
    /// live.
    #[must_use]
    pub fn entries_in(&self, start: LogIndex, end: LogIndex) -> Vec<Entry> {
        let lo = start.max(self.first_index());
        let hi = end.min(self.last_index());
        if lo > hi {
            return Vec::new();
        }
        let from = (lo.get() - self.snapshot_index.get() - 1) as usize;
        let to = (hi.get() - self.snapshot_index.get()) as usize;
        self.entries[from..to].to_vec()
    }

    /// Returns clones of all entries from `start` to the end.
    #[must_use]
    pub fn entries_from(&self, start: LogIndex) -> Vec<Entry> {
        self.entries_in(start, self.last_index())
    }

    /// Advances the commit index to `to` (clamped to the last index) and
    /// returns the entries that became both committed and unapplied.
    ///
    /// The caller applies the returned entries in order and then marks them
    /// with [`Self::set_applied`]. The commit index never moves backwards.
    pub fn commit_to(&mut self, to: LogIndex) -> Vec<Entry> {
        let target = to.min(self.last_index());
        if target <= self.commit_index {
            return Vec::new();
        }
        self.commit_index = target;
        self.entries_in(self.applied_index.next(), target)
    }

    /// Records that everything up to `index` has been applied.
    pub fn set_applied(&mut self, index: LogIndex) {
        debug_assert!(index <= self.commit_index, "applied beyond commit");
        if index > self.applied_index {
            self.applied_index = index;
        }
    }

    /// Discards the prefix up to `last_included` after a snapshot was taken
    /// or installed at `(last_included, term)`.
    ///
    /// Commit and applied indexes are pulled forward to the boundary; any
    /// live suffix beyond it is preserved.
    pub fn compact_to(&mut self, last_included: LogIndex, term: TermId) {
        if last_included <= self.snapshot_index {
            return;
        }

        if self.term_at(last_included) == term && last_included < self.last_index() {
            // Keep the suffix that the snapshot does not cover.
            let drop = (last_included.get() - self.snapshot_index.get()) as usize;
            self.entries.drain(..drop);
        } else {
            self.entries.clear();
        }

        self.snapshot_index = last_included;
        self.snapshot_term = term;
        self.commit_index = self.commit_index.max(last_included);
        self.applied_index = self.applied_index.max(last_included);
    }

    /// Returns true if a candidate log at `(other_term, other_index)` is at
    /// least as up to date as ours.
    #[must_use]
    pub fn candidate_up_to_date(&self, other_term: TermId, other_index: LogIndex) -> bool {
        let my_term = self.last_term();
        other_term > my_term || (other_term == my_term && other_index >= self.last_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        Entry::new(
            LogIndex::new(index),
            TermId::new(term),
            TermId::new(term),
            Bytes::from(format!("e{index}")),
        )
    }

    fn filled_log(last: u64, term: u64) -> RaftLog {
        let mut log = RaftLog::new();
        for i in 1..=last {
            log.append_new(TermId::new(term), Bytes::from(format!("e{i}")));
        }
        log
    }

    #[test]
    fn empty_log() {
        let log = RaftLog::new();
        assert_eq!(log.first_index().get(), 1);
        assert_eq!(log.last_index().get(), 0);
        assert_eq!(log.last_term().get(), 0);
        assert!(log.get(LogIndex::new(1)).is_none());
        assert!(log.match_term(LogIndex::new(0), TermId::new(0)));
    }

    #[test]
    fn append_new_sets_prev_term() {
        let mut log = RaftLog::new();
        let first = log.append_new(TermId::new(2), Bytes::from("a"));
        assert_eq!(first.index.get(), 1);
        assert_eq!(first.prev_term.get(), 0);

        let second = log.append_new(TermId::new(3), Bytes::from("b"));
        assert_eq!(second.index.get(), 2);
        assert_eq!(second.prev_term.get(), 2);
    }

    #[test]
    fn entry_codec_round_trip() {
        let original = entry(42, 7);
        let decoded = Entry::decode(original.encode()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(original.byte_size(), original.encode().len() as u64);
    }

    #[test]
    fn entry_decode_rejects_truncation() {
        let encoded = entry(1, 1).encode();
        assert!(Entry::decode(encoded.slice(..encoded.len() - 1)).is_none());
        assert!(Entry::decode(Bytes::from_static(b"short")).is_none());
    }

    #[test]
    fn conflict_truncates_suffix() {
        let mut log = filled_log(3, 1);

        let outcome = log.append_entries(vec![
            Entry::new(LogIndex::new(2), TermId::new(2), TermId::new(1), Bytes::from("x")),
            Entry::new(LogIndex::new(3), TermId::new(2), TermId::new(2), Bytes::from("y")),
        ]);

        assert_eq!(outcome.truncated_from, Some(LogIndex::new(2)));
        assert_eq!(outcome.appended.len(), 2);
        assert_eq!(log.last_index().get(), 3);
        assert_eq!(log.term_at(LogIndex::new(2)).get(), 2);
        assert_eq!(log.term_at(LogIndex::new(3)).get(), 2);
    }

    #[test]
    fn redelivery_is_noop() {
        let mut log = filled_log(3, 1);
        let before = log.entries_from(LogIndex::new(1));

        let outcome = log.append_entries(before.clone());
        assert_eq!(outcome, AppendOutcome::default());
        assert_eq!(log.entries_from(LogIndex::new(1)), before);
    }

    #[test]
    fn commit_and_apply_flow() {
        let mut log = filled_log(5, 1);

        let newly = log.commit_to(LogIndex::new(3));
        assert_eq!(newly.len(), 3);
        assert_eq!(log.commit_index().get(), 3);

        log.set_applied(LogIndex::new(3));

        // Commit does not move backwards, and clamps to the last index.
        assert!(log.commit_to(LogIndex::new(2)).is_empty());
        let rest = log.commit_to(LogIndex::new(99));
        assert_eq!(rest.len(), 2);
        assert_eq!(log.commit_index().get(), 5);
    }

    #[test]
    fn compact_keeps_live_suffix() {
        let mut log = filled_log(10, 1);
        log.commit_to(LogIndex::new(10));
        log.set_applied(LogIndex::new(10));

        log.compact_to(LogIndex::new(6), TermId::new(1));

        assert_eq!(log.first_index().get(), 7);
        assert_eq!(log.last_index().get(), 10);
        assert_eq!(log.term_at(LogIndex::new(6)).get(), 1);
        assert!(log.get(LogIndex::new(6)).is_none());
        assert!(log.get(LogIndex::new(7)).is_some());
        assert!(log.match_term(LogIndex::new(6), TermId::new(1)));
    }

    #[test]
    fn compact_to_foreign_boundary_clears() {
        // Installing a snapshot ahead of our log drops everything.
        let mut log = filled_log(3, 1);
        log.compact_to(LogIndex::new(20), TermId::new(4));

        assert_eq!(log.last_index().get(), 20);
        assert_eq!(log.last_term().get(), 4);
        assert_eq!(log.commit_index().get(), 20);
        assert_eq!(log.applied_index().get(), 20);
        assert!(log.entries_from(LogIndex::new(1)).is_empty());
    }

    #[test]
    fn entries_in_clamps() {
        let mut log = filled_log(10, 2);
        log.compact_to(LogIndex::new(4), TermId::new(2));

        let slice = log.entries_in(LogIndex::new(1), LogIndex::new(7));
        assert_eq!(slice.first().unwrap().index.get(), 5);
        assert_eq!(slice.last().unwrap().index.get(), 7);

        assert!(log.entries_in(LogIndex::new(11), LogIndex::new(20)).is_empty());
    }

    #[test]
    fn candidate_up_to_date_rules() {
        let mut log = RaftLog::new();
        log.append_new(TermId::new(1), Bytes::from("a"));
        log.append_new(TermId::new(2), Bytes::from("b"));

        // Higher term wins regardless of index.
        assert!(log.candidate_up_to_date(TermId::new(3), LogIndex::new(1)));
        // Same term needs an index at least as large.
        assert!(log.candidate_up_to_date(TermId::new(2), LogIndex::new(2)));
        assert!(!log.candidate_up_to_date(TermId::new(2), LogIndex::new(1)));
        // Lower term always loses.
        assert!(!log.candidate_up_to_date(TermId::new(1), LogIndex::new(9)));
    }
}
