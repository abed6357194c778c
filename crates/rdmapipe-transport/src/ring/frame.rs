//! Record framing inside a ring.
//!
//! ```text
//! [length: u64 LE][payload, zero-padded to 8][sentinel: u64 LE]
//! ```
//!
//! The producer stores the length and payload, then the sentinel with release
//! ordering. The consumer trusts a record only once it sees the sentinel behind the
//! length it read, copies the payload out and zeroes the whole record, so a position
//! the producer has not reached yet always reads as length 0.
//!
//! The sentinel relies on the last word of a record becoming visible after the rest.
//! CPUs give that through the release store; RDMA adapters in practice place writes
//! in address order, which is not guaranteed by the verbs specification. Immediate
//! mode does not depend on it.

use std::sync::atomic::Ordering;

use bytes::Bytes;

use super::wraparound::WraparoundBuffer;
use crate::error::{Result, TransportError};

pub const LENGTH_LEN: usize = 8;
pub const SENTINEL_LEN: usize = 8;
/// Length word plus sentinel.
pub const FRAME_OVERHEAD: usize = LENGTH_LEN + SENTINEL_LEN;
/// Marks a completely written record.
pub const SENTINEL: u64 = 0x4f4b_5f45_5049_5052;

/// Payload length rounded up to the 8-byte record alignment.
pub fn padded_len(payload_len: usize) -> usize {
    (payload_len + 7) & !7
}

/// Bytes a payload of `payload_len` occupies in the ring.
pub fn record_len(payload_len: usize) -> usize {
    FRAME_OVERHEAD + padded_len(payload_len)
}

/// Largest payload a ring of `capacity` bytes carries.
pub fn max_payload(capacity: usize) -> usize {
    capacity.saturating_sub(FRAME_OVERHEAD)
}

/// Validates a payload for a ring and returns its record length.
///
/// An empty payload is rejected: a zero length word means "nothing here yet".
pub fn check_payload(payload_len: usize, capacity: usize) -> Result<usize> {
    if payload_len == 0 {
        return Err(TransportError::InvalidArgument(
            "ring messages must not be empty".to_string(),
        ));
    }
    let record = record_len(payload_len);
    if record > capacity {
        return Err(TransportError::MessageTooLarge {
            size: payload_len,
            capacity: max_payload(capacity),
        });
    }
    Ok(record)
}

/// Encodes a full record into `out`, which must hold [`record_len`] bytes. Used to
/// stage records that are shipped by RDMA write.
pub fn encode_into(out: &mut [u8], payload: &[u8]) -> Result<usize> {
    let record = record_len(payload.len());
    if out.len() < record {
        return Err(TransportError::MessageTooLarge {
            size: payload.len(),
            capacity: max_payload(out.len()),
        });
    }
    let body_end = LENGTH_LEN + payload.len();
    let sentinel_at = record - SENTINEL_LEN;
    out[..LENGTH_LEN].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    out[LENGTH_LEN..body_end].copy_from_slice(payload);
    out[body_end..sentinel_at].fill(0);
    out[sentinel_at..record].copy_from_slice(&SENTINEL.to_le_bytes());
    Ok(record)
}

/// Writes a record at `position` of a local ring. Room must already be reserved.
pub(crate) fn publish(buf: &dyn WraparoundBuffer, position: u64, payload: &[u8]) -> Result<usize> {
    let record = check_payload(payload.len(), buf.capacity())?;
    buf.write(position + LENGTH_LEN as u64, payload)?;
    let padding = padded_len(payload.len()) - payload.len();
    if padding > 0 {
        buf.zero(position + (LENGTH_LEN + payload.len()) as u64, padding)?;
    }
    buf.word(position)?
        .store((payload.len() as u64).to_le(), Ordering::Relaxed);
    buf.word(position + (record - SENTINEL_LEN) as u64)?
        .store(SENTINEL.to_le(), Ordering::Release);
    Ok(record)
}

/// Returns the payload length of the complete record at `position`, if there is one.
pub(crate) fn peek(buf: &dyn WraparoundBuffer, position: u64) -> Result<Option<usize>> {
    let len = u64::from_le(buf.word(position)?.load(Ordering::Acquire)) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > max_payload(buf.capacity()) {
        return Err(TransportError::Codec {
            what: "ring record",
            reason: format!(
                "length {} at position {} exceeds ring capacity {}",
                len,
                position,
                buf.capacity()
            ),
        });
    }
    let sentinel_at = position + (record_len(len) - SENTINEL_LEN) as u64;
    let sentinel = u64::from_le(buf.word(sentinel_at)?.load(Ordering::Acquire));
    Ok((sentinel == SENTINEL).then_some(len))
}

/// Zeroes the record of `len` payload bytes at `position`, returning its length.
pub(crate) fn clear(buf: &dyn WraparoundBuffer, position: u64, len: usize) -> Result<usize> {
    let record = record_len(len);
    buf.zero(position, record)?;
    Ok(record)
}

/// Copies the payload of a complete record out and clears the record.
pub(crate) fn take(buf: &dyn WraparoundBuffer, position: u64, len: usize) -> Result<(Bytes, usize)> {
    let mut payload = vec![0u8; len];
    buf.read(position + LENGTH_LEN as u64, &mut payload)?;
    let record = clear(buf, position, len)?;
    Ok((Bytes::from(payload), record))
}
