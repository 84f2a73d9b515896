//! State-machine snapshots.
//!
//! A snapshot captures everything up to and including
//! `last_included_index`; once installed, the log prefix at or below that
//! index is discarded. Snapshots travel as one framed buffer inside
//! [`crate::message::SendSnapshotRequest`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_core::{limits, LogIndex, TermId};

/// Header: magic(4) + version(4) + last_index(8) + last_term(8) +
/// data_len(8) + checksum(4).
const SNAPSHOT_HEADER_BYTES: usize = 36;

/// "KSNP" in little-endian.
const SNAPSHOT_MAGIC: u32 = 0x4B53_4E50;

const SNAPSHOT_VERSION: u32 = 1;

/// A point-in-time capture of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Last log index covered by this snapshot.
    pub last_included_index: LogIndex,
    /// Term of the entry at `last_included_index`.
    pub last_included_term: TermId,
    /// Serialized state-machine state.
    pub data: Bytes,
    /// CRC32-C of `data`.
    pub checksum: u32,
}

impl Snapshot {
    /// Creates a snapshot, computing the checksum.
    ///
    /// # Panics
    /// Panics if the data exceeds [`limits::SNAPSHOT_SIZE_MAX`].
    #[must_use]
    pub fn new(last_included_index: LogIndex, last_included_term: TermId, data: Bytes) -> Self {
        assert!(
            data.len() as u64 <= limits::SNAPSHOT_SIZE_MAX,
            "snapshot data exceeds maximum size"
        );
        let checksum = crc32c(&data);
        Self {
            last_included_index,
            last_included_term,
            data,
            checksum,
        }
    }

    /// Returns the data size in bytes.
    #[must_use]
    pub const fn data_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns true if the stored checksum matches the data.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        crc32c(&self.data) == self.checksum
    }

    /// Encodes the snapshot into its wire frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER_BYTES + self.data.len());
        buf.put_u32_le(SNAPSHOT_MAGIC);
        buf.put_u32_le(SNAPSHOT_VERSION);
        buf.put_u64_le(self.last_included_index.get());
        buf.put_u64_le(self.last_included_term.get());
        buf.put_u64_le(self.data.len() as u64);
        buf.put_u32_le(self.checksum);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    /// Decodes a snapshot frame, verifying magic, length and checksum.
    #[must_use]
    pub fn decode(mut data: Bytes) -> Option<Self> {
        if data.len() < SNAPSHOT_HEADER_BYTES {
            return None;
        }

        if data.get_u32_le() != SNAPSHOT_MAGIC {
            return None;
        }
        if data.get_u32_le() != SNAPSHOT_VERSION {
            return None;
        }

        let last_included_index = LogIndex::new(data.get_u64_le());
        let last_included_term = TermId::new(data.get_u64_le());
        let data_len = data.get_u64_le();
        let checksum = data.get_u32_le();

        if data.remaining() as u64 != data_len {
            return None;
        }
        if crc32c(&data) != checksum {
            return None;
        }

        Some(Self {
            last_included_index,
            last_included_term,
            data,
            checksum,
        })
    }
}

/// Snapshot metadata without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Last log index covered.
    pub last_included_index: LogIndex,
    /// Term at `last_included_index`.
    pub last_included_term: TermId,
    /// Payload size in bytes.
    pub size: u64,
}

impl SnapshotMeta {
    /// Extracts metadata from a snapshot.
    #[must_use]
    pub const fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            size: snapshot.data_size(),
        }
    }
}

/// CRC32-C (Castagnoli), bit-reflected.
fn crc32c(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x82F6_3B78
            } else {
                crc >> 1
            };
        }
    }
    !crc
}
