//! Uniform send/receive interface over the concrete transports.
//!
//! Callers that only move messages between two endpoints can hold a
//! `Box<dyn Transport>` and switch between RDMA, shared memory and the multiclient
//! client without touching their loop.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Which mechanism carries the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Virtual RDMA ring buffer.
    Rdma,
    /// Wraparound rings in a shared-memory file.
    SharedMemory,
    /// Client side of a multiclient doorbell server.
    Multiclient,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Rdma => "rdma",
            TransportKind::SharedMemory => "shm",
            TransportKind::Multiclient => "multiclient",
        };
        f.write_str(name)
    }
}

/// Message-oriented, in-order, reliable point-to-point transport.
///
/// `send` blocks while the peer has no room; `receive` blocks until a whole message
/// is available. Messages are never truncated or merged.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Sends one message.
    fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Receives the next message, blocking until one arrives.
    fn receive(&mut self) -> Result<Bytes>;

    /// Receives the next message if one is ready.
    fn try_receive(&mut self) -> Result<Option<Bytes>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        (**self).send(payload)
    }

    fn receive(&mut self) -> Result<Bytes> {
        (**self).receive()
    }

    fn try_receive(&mut self) -> Result<Option<Bytes>> {
        (**self).try_receive()
    }
}
