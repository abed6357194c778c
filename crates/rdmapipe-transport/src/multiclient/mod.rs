#![allow(missing_docs)]

//! One server, many clients, one queue pair and one slot per client.
//!
//! A client writes a framed request into its slot on the server and tells the server
//! about it, either by ringing its byte in the [`DoorbellArray`] or by a two-sided send
//! that lands in a receive posted for it. The server answers with a pre-built RDMA
//! write into the client's response slot. Each client has at most one request in
//! flight.
//!
//! Accepting a client takes two bootstrap phases: queue pair addresses first, then the
//! slot descriptors ([`ServerSlots`] and [`ClientSlots`]).

pub mod client;
pub mod doorbell;
pub mod server;

use std::sync::atomic::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bootstrap::Wire;
use crate::config::MultiplexMode;
use crate::error::{Result, TransportError};
use crate::memory::{MemoryRegion, RemoteMemoryRegion};
use crate::ring::frame;

pub use client::MulticlientClient;
pub use doorbell::{poll_sse, DoorbellArray};
pub use server::{Connection, MulticlientServer};

pub const SERVER_SLOTS_WIRE_LEN: usize = 36;
pub const CLIENT_SLOTS_WIRE_LEN: usize = 12;

/// What the server tells a newly accepted client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSlots {
    /// Where the client writes its requests. Unused in receive-queue mode.
    pub request_slot: RemoteMemoryRegion,
    /// The client's doorbell cell. Unused in receive-queue mode.
    pub doorbell: RemoteMemoryRegion,
    pub client_index: u32,
    pub slot_size: u32,
    pub mode: MultiplexMode,
}

impl Wire for ServerSlots {
    const WIRE_LEN: usize = SERVER_SLOTS_WIRE_LEN;
    const NAME: &'static str = "server slots";
}

/// What the client tells the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSlots {
    /// Where the server writes its answers.
    pub response_slot: RemoteMemoryRegion,
}

impl Wire for ClientSlots {
    const WIRE_LEN: usize = CLIENT_SLOTS_WIRE_LEN;
    const NAME: &'static str = "client slots";
}

/// Payload length of the complete record at `base`, if there is one.
pub(crate) fn slot_peek(mr: &MemoryRegion<'_>, base: usize, slot_size: usize) -> Result<Option<usize>> {
    let len = u64::from_le(mr.atomic_u64(base)?.load(Ordering::Acquire)) as usize;
    if len == 0 {
        return Ok(None);
    }
    if frame::record_len(len) > slot_size {
        return Err(TransportError::Codec {
            what: "slot record",
            reason: format!("length {} does not fit a {}-byte slot", len, slot_size),
        });
    }
    let sentinel_at = base + frame::record_len(len) - frame::SENTINEL_LEN;
    let sentinel = u64::from_le(mr.atomic_u64(sentinel_at)?.load(Ordering::Acquire));
    Ok((sentinel == frame::SENTINEL).then_some(len))
}

/// Copies the payload of a complete record at `base` out and clears the record.
pub(crate) fn slot_take(mr: &MemoryRegion<'_>, base: usize, len: usize) -> Result<Bytes> {
    let payload = mr.read_vec(base + frame::LENGTH_LEN, len)?;
    mr.zero(base, frame::record_len(len))?;
    Ok(Bytes::from(payload))
}

/// Frames `payload` into `mr` at `base` and returns the record length.
pub(crate) fn slot_stage(
    mr: &MemoryRegion<'_>,
    base: usize,
    slot_size: usize,
    payload: &[u8],
) -> Result<usize> {
    let record = frame::check_payload(payload.len(), slot_size)?;
    mr.slice(base, record)?;
    // SAFETY: the range was bounds-checked against the region just above, and the
    // caller owns this slot while no work request reads it.
    let out = unsafe { std::slice::from_raw_parts_mut(mr.as_ptr().add(base), record) };
    frame::encode_into(out, payload)
}
