//! Wire framing and message codecs.
//!
//! Every frame is: magic(4) + kind(1) + method(1) + correlation(8) +
//! payload_len(4) + payload. Integers are little-endian. Field order
//! within each payload is definitional for compatibility; do not reorder.
//!
//! A partial frame decodes to [`CodecError::InsufficientData`], which the
//! stream reader treats as "wait for more bytes".

use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_core::{GroupId, LogIndex, NodeId, TermId};
use keel_raft::{
    AppendEntriesRequest, AppendEntryResult, CommitIndexResponse, ElectionRequest,
    ExecuteRequest, ExecuteResponse, HeartbeatRequest, HeartbeatResponse, MatchTermRequest,
    SendSnapshotRequest,
};
use thiserror::Error;

/// "KEEL" in little-endian.
pub const FRAME_MAGIC: u32 = 0x4C45_454B;

/// Fixed bytes before a frame's payload.
pub const FRAME_HEADER_BYTES: usize = 18;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer does not yet hold a complete frame.
    #[error("insufficient data: need {needed} more bytes")]
    InsufficientData {
        /// How many more bytes are needed, at minimum.
        needed: usize,
    },

    /// The frame does not start with the protocol magic.
    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),

    /// The frame kind byte is unknown.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// The method byte is unknown.
    #[error("unknown method {0}")]
    UnknownMethod(u8),

    /// A payload ended before its declared contents.
    #[error("truncated payload")]
    Truncated,
}

/// The RPC methods of the consensus surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Method {
    /// Leader liveness probe.
    Heartbeat = 1,
    /// Vote solicitation.
    Election = 2,
    /// Log replication.
    AppendEntries = 3,
    /// Snapshot transfer.
    SendSnapshot = 4,
    /// Log-matching probe.
    MatchTerm = 5,
    /// Forwarded client request.
    Execute = 6,
    /// Commit-point read.
    CommitIndex = 7,
}

impl Method {
    fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Heartbeat),
            2 => Ok(Self::Election),
            3 => Ok(Self::AppendEntries),
            4 => Ok(Self::SendSnapshot),
            5 => Ok(Self::MatchTerm),
            6 => Ok(Self::Execute),
            7 => Ok(Self::CommitIndex),
            other => Err(CodecError::UnknownMethod(other)),
        }
    }
}

/// Frame direction and outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A request awaiting a response with the same correlation ID.
    Request = 1,
    /// A successful response; the payload is method-specific.
    ResponseOk = 2,
    /// A failed response; the payload is a UTF-8 error message.
    ResponseError = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::ResponseOk),
            3 => Ok(Self::ResponseError),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Direction and outcome.
    pub kind: FrameKind,
    /// The RPC method.
    pub method: Method,
    /// Matches a response to its request.
    pub correlation: u64,
    /// Method-specific payload.
    pub payload: Bytes,
}

/// Encodes a frame for the wire.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_BYTES + frame.payload.len());
    buf.put_u32_le(FRAME_MAGIC);
    buf.put_u8(frame.kind as u8);
    buf.put_u8(frame.method as u8);
    buf.put_u64_le(frame.correlation);
    buf.put_u32_le(frame.payload.len() as u32);
    buf.extend_from_slice(&frame.payload);
    buf.freeze()
}

/// Decodes one frame from the front of `buf`, returning it and the bytes
/// consumed.
///
/// # Errors
/// Returns [`CodecError::InsufficientData`] if the buffer holds only part
/// of a frame, and a terminal error on garbage.
pub fn decode_frame(buf: &[u8]) -> Result<(Frame, usize), CodecError> {
    if buf.len() < FRAME_HEADER_BYTES {
        return Err(CodecError::InsufficientData {
            needed: FRAME_HEADER_BYTES - buf.len(),
        });
    }

    let mut header = &buf[..FRAME_HEADER_BYTES];
    let magic = header.get_u32_le();
    if magic != FRAME_MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let kind = FrameKind::from_u8(header.get_u8())?;
    let method = Method::from_u8(header.get_u8())?;
    let correlation = header.get_u64_le();
    let payload_len = header.get_u32_le() as usize;

    let total = FRAME_HEADER_BYTES + payload_len;
    if buf.len() < total {
        return Err(CodecError::InsufficientData {
            needed: total - buf.len(),
        });
    }

    let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_BYTES..total]);
    Ok((
        Frame {
            kind,
            method,
            correlation,
            payload,
        },
        total,
    ))
}

// ---- payload codecs ----------------------------------------------------
//
// Small helpers keep the field order explicit in one place per message.

fn need(buf: &impl Buf, bytes: usize) -> Result<(), CodecError> {
    if buf.remaining() < bytes {
        return Err(CodecError::Truncated);
    }
    Ok(())
}

fn put_option_u64(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64_le(v);
        }
        None => buf.put_u8(0),
    }
}

fn get_option_u64(buf: &mut Bytes) -> Result<Option<u64>, CodecError> {
    need(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(None),
        _ => {
            need(buf, 8)?;
            Ok(Some(buf.get_u64_le()))
        }
    }
}

/// Encodes a [`HeartbeatRequest`].
#[must_use]
pub fn encode_heartbeat_request(request: &HeartbeatRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(40);
    buf.put_u64_le(request.group_id.get());
    buf.put_u64_le(request.term.get());
    buf.put_u64_le(request.leader.get());
    buf.put_u64_le(request.commit_index.get());
    buf.put_u64_le(request.commit_term.get());
    buf.freeze()
}

/// Decodes a [`HeartbeatRequest`].
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_heartbeat_request(mut payload: Bytes) -> Result<HeartbeatRequest, CodecError> {
    need(&payload, 40)?;
    Ok(HeartbeatRequest {
        group_id: GroupId::new(payload.get_u64_le()),
        term: TermId::new(payload.get_u64_le()),
        leader: NodeId::new(payload.get_u64_le()),
        commit_index: LogIndex::new(payload.get_u64_le()),
        commit_term: TermId::new(payload.get_u64_le()),
    })
}

/// Encodes a [`HeartbeatResponse`].
#[must_use]
pub fn encode_heartbeat_response(response: &HeartbeatResponse) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_i64_le(response.status);
    buf.put_u64_le(response.follower.get());
    buf.put_u64_le(response.last_log_index.get());
    buf.put_u64_le(response.last_log_term.get());
    buf.freeze()
}

/// Decodes a [`HeartbeatResponse`].
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_heartbeat_response(mut payload: Bytes) -> Result<HeartbeatResponse, CodecError> {
    need(&payload, 32)?;
    Ok(HeartbeatResponse {
        status: payload.get_i64_le(),
        follower: NodeId::new(payload.get_u64_le()),
        last_log_index: LogIndex::new(payload.get_u64_le()),
        last_log_term: TermId::new(payload.get_u64_le()),
    })
}

/// Encodes an [`ElectionRequest`].
#[must_use]
pub fn encode_election_request(request: &ElectionRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(40);
    buf.put_u64_le(request.group_id.get());
    buf.put_u64_le(request.term.get());
    buf.put_u64_le(request.elector.get());
    buf.put_u64_le(request.last_log_index.get());
    buf.put_u64_le(request.last_log_term.get());
    buf.freeze()
}

/// Decodes an [`ElectionRequest`].
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_election_request(mut payload: Bytes) -> Result<ElectionRequest, CodecError> {
    need(&payload, 40)?;
    Ok(ElectionRequest {
        group_id: GroupId::new(payload.get_u64_le()),
        term: TermId::new(payload.get_u64_le()),
        elector: NodeId::new(payload.get_u64_le()),
        last_log_index: LogIndex::new(payload.get_u64_le()),
        last_log_term: TermId::new(payload.get_u64_le()),
    })
}

/// Encodes a vote verdict (a sentinel or a term).
#[must_use]
pub fn encode_vote_verdict(verdict: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64_le(verdict);
    buf.freeze()
}

/// Decodes a vote verdict.
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_vote_verdict(mut payload: Bytes) -> Result<i64, CodecError> {
    need(&payload, 8)?;
    Ok(payload.get_i64_le())
}

/// Encodes an [`AppendEntriesRequest`].
#[must_use]
pub fn encode_append_request(request: &AppendEntriesRequest) -> Bytes {
    let entries_len: usize = request.entries.iter().map(|e| 4 + e.len()).sum();
    let mut buf = BytesMut::with_capacity(52 + entries_len);
    buf.put_u64_le(request.group_id.get());
    buf.put_u64_le(request.term.get());
    buf.put_u64_le(request.leader.get());
    buf.put_u64_le(request.leader_commit.get());
    buf.put_u64_le(request.prev_log_index.get());
    buf.put_u64_le(request.prev_log_term.get());
    buf.put_u32_le(request.entries.len() as u32);
    for entry in &request.entries {
        buf.put_u32_le(entry.len() as u32);
        buf.extend_from_slice(entry);
    }
    buf.freeze()
}

/// Decodes an [`AppendEntriesRequest`].
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_append_request(mut payload: Bytes) -> Result<AppendEntriesRequest, CodecError> {
    need(&payload, 52)?;
    let group_id = GroupId::new(payload.get_u64_le());
    let term = TermId::new(payload.get_u64_le());
    let leader = NodeId::new(payload.get_u64_le());
    let leader_commit = LogIndex::new(payload.get_u64_le());
    let prev_log_index = LogIndex::new(payload.get_u64_le());
    let prev_log_term = TermId::new(payload.get_u64_le());
    let count = payload.get_u32_le() as usize;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        need(&payload, 4)?;
        let len = payload.get_u32_le() as usize;
        need(&payload, len)?;
        entries.push(payload.split_to(len));
    }

    Ok(AppendEntriesRequest {
        group_id,
        term,
        leader,
        leader_commit,
        prev_log_index,
        prev_log_term,
        entries,
    })
}

/// Encodes an [`AppendEntryResult`].
#[must_use]
pub fn encode_append_result(result: &AppendEntryResult) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_i64_le(result.status);
    buf.put_u64_le(result.last_log_index.get());
    buf.put_u64_le(result.last_log_term.get());
    buf.put_u64_le(result.receiver.get());
    buf.freeze()
}

/// Decodes an [`AppendEntryResult`].
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_append_result(mut payload: Bytes) -> Result<AppendEntryResult, CodecError> {
    need(&payload, 32)?;
    Ok(AppendEntryResult {
        status: payload.get_i64_le(),
        last_log_index: LogIndex::new(payload.get_u64_le()),
        last_log_term: TermId::new(payload.get_u64_le()),
        receiver: NodeId::new(payload.get_u64_le()),
    })
}

/// Encodes a [`SendSnapshotRequest`].
#[must_use]
pub fn encode_snapshot_request(request: &SendSnapshotRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + request.snapshot.len());
    buf.put_u64_le(request.group_id.get());
    buf.extend_from_slice(&request.snapshot);
    buf.freeze()
}

/// Decodes a [`SendSnapshotRequest`].
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_snapshot_request(mut payload: Bytes) -> Result<SendSnapshotRequest, CodecError> {
    need(&payload, 8)?;
    let group_id = GroupId::new(payload.get_u64_le());
    Ok(SendSnapshotRequest {
        group_id,
        snapshot: payload,
    })
}

/// Encodes a [`MatchTermRequest`].
#[must_use]
pub fn encode_match_term_request(request: &MatchTermRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(24);
    buf.put_u64_le(request.group_id.get());
    buf.put_u64_le(request.index.get());
    buf.put_u64_le(request.term.get());
    buf.freeze()
}

/// Decodes a [`MatchTermRequest`].
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_match_term_request(mut payload: Bytes) -> Result<MatchTermRequest, CodecError> {
    need(&payload, 24)?;
    Ok(MatchTermRequest {
        group_id: GroupId::new(payload.get_u64_le()),
        index: LogIndex::new(payload.get_u64_le()),
        term: TermId::new(payload.get_u64_le()),
    })
}

/// Encodes a match verdict.
#[must_use]
pub fn encode_match_verdict(matched: bool) -> Bytes {
    Bytes::copy_from_slice(&[u8::from(matched)])
}

/// Decodes a match verdict.
///
/// # Errors
/// Returns `Truncated` on an empty payload.
pub fn decode_match_verdict(mut payload: Bytes) -> Result<bool, CodecError> {
    need(&payload, 1)?;
    Ok(payload.get_u8() != 0)
}

/// Encodes an [`ExecuteRequest`].
#[must_use]
pub fn encode_execute_request(request: &ExecuteRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + request.request.len());
    buf.put_u64_le(request.group_id.get());
    buf.extend_from_slice(&request.request);
    buf.freeze()
}

/// Decodes an [`ExecuteRequest`].
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_execute_request(mut payload: Bytes) -> Result<ExecuteRequest, CodecError> {
    need(&payload, 8)?;
    let group_id = GroupId::new(payload.get_u64_le());
    Ok(ExecuteRequest {
        group_id,
        request: payload,
    })
}

/// Encodes an [`ExecuteResponse`].
#[must_use]
pub fn encode_execute_response(response: &ExecuteResponse) -> Bytes {
    let mut buf = BytesMut::with_capacity(17);
    buf.put_i64_le(response.status);
    put_option_u64(&mut buf, response.leader_hint.map(NodeId::get));
    buf.freeze()
}

/// Decodes an [`ExecuteResponse`].
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_execute_response(mut payload: Bytes) -> Result<ExecuteResponse, CodecError> {
    need(&payload, 8)?;
    let status = payload.get_i64_le();
    let leader_hint = get_option_u64(&mut payload)?.map(NodeId::new);
    Ok(ExecuteResponse {
        status,
        leader_hint,
    })
}

/// Encodes a commit-index request (just the group).
#[must_use]
pub fn encode_commit_index_request(group_id: GroupId) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64_le(group_id.get());
    buf.freeze()
}

/// Decodes a commit-index request.
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_commit_index_request(mut payload: Bytes) -> Result<GroupId, CodecError> {
    need(&payload, 8)?;
    Ok(GroupId::new(payload.get_u64_le()))
}

/// Encodes a [`CommitIndexResponse`].
#[must_use]
pub fn encode_commit_index_response(response: &CommitIndexResponse) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_i64_le(response.status);
    buf.put_u64_le(response.term.get());
    buf.put_u64_le(response.commit_index.get());
    buf.put_u64_le(response.commit_term.get());
    buf.freeze()
}

/// Decodes a [`CommitIndexResponse`].
///
/// # Errors
/// Returns `Truncated` on short payloads.
pub fn decode_commit_index_response(
    mut payload: Bytes,
) -> Result<CommitIndexResponse, CodecError> {
    need(&payload, 32)?;
    Ok(CommitIndexResponse {
        status: payload.get_i64_le(),
        term: TermId::new(payload.get_u64_le()),
        commit_index: LogIndex::new(payload.get_u64_le()),
        commit_term: TermId::new(payload.get_u64_le()),
    })
}
