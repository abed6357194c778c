//! Driver boundary between the transport core and an RDMA provider.
//!
//! The [`Fabric`] trait is the complete set of verbs the rest of the crate needs.
//! Two providers implement it:
//!
//! - [`sim::SimDevice`]: an in-process software fabric used by the test suite and by
//!   machines without RDMA hardware.
//! - `verbs::VerbsDevice` (feature `verbs`): libibverbs through `ibverbs-sys`.
//!
//! Handles are opaque 64-bit values; a provider may store a pointer or a table index in
//! them. All methods return [`crate::error::TransportError::Resource`] on driver failure
//! with the name of the equivalent verbs call.

pub mod sim;
#[cfg(feature = "verbs")]
pub mod verbs;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{Address, Gid};
use crate::completion::CompletionOpcode;
use crate::error::Result;
use crate::memory::AccessFlags;

pub use sim::{SimDevice, SimNetwork};

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);
    };
}

handle_type!(
    /// Protection domain handle.
    PdHandle
);
handle_type!(
    /// Completion queue handle.
    CqHandle
);
handle_type!(
    /// Shared receive queue handle.
    SrqHandle
);
handle_type!(
    /// Queue pair handle.
    QpHandle
);
handle_type!(
    /// Memory region handle.
    MrHandle
);

/// Path MTU negotiated during the Init → ReadyToReceive transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mtu {
    /// 256 bytes.
    #[serde(rename = "256")]
    Mtu256,
    /// 512 bytes.
    #[serde(rename = "512")]
    Mtu512,
    /// 1024 bytes.
    #[serde(rename = "1024")]
    Mtu1024,
    /// 2048 bytes.
    #[serde(rename = "2048")]
    Mtu2048,
    /// 4096 bytes.
    #[serde(rename = "4096")]
    Mtu4096,
}

impl Mtu {
    /// MTU in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Mtu::Mtu256 => 256,
            Mtu::Mtu512 => 512,
            Mtu::Mtu1024 => 1024,
            Mtu::Mtu2048 => 2048,
            Mtu::Mtu4096 => 4096,
        }
    }

    /// Encoding used by `ibv_mtu` (1 = 256 … 5 = 4096).
    pub fn as_ibv(self) -> u32 {
        match self {
            Mtu::Mtu256 => 1,
            Mtu::Mtu512 => 2,
            Mtu::Mtu1024 => 3,
            Mtu::Mtu2048 => 4,
            Mtu::Mtu4096 => 5,
        }
    }

    /// Inverse of [`Mtu::as_ibv`]. Unknown values clamp to 1024.
    pub fn from_ibv(value: u32) -> Self {
        match value {
            1 => Mtu::Mtu256,
            2 => Mtu::Mtu512,
            4 => Mtu::Mtu2048,
            5 => Mtu::Mtu4096,
            _ => Mtu::Mtu1024,
        }
    }
}

/// Attributes of the physical port a context is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    /// Port number.
    pub port: u8,
    /// Local identifier assigned by the subnet manager.
    pub lid: u16,
    /// Global identifier, present on routed (RoCE) fabrics.
    pub gid: Option<Gid>,
    /// Active MTU of the port.
    pub active_mtu: Mtu,
}

/// Keys returned by memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrInfo {
    /// Provider handle used for deregistration.
    pub handle: MrHandle,
    /// Local key for scatter/gather entries.
    pub lkey: u32,
    /// Remote key handed to peers.
    pub rkey: u32,
}

/// Queue pair creation attributes.
#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr {
    /// Completion queue for the send side.
    pub send_cq: CqHandle,
    /// Completion queue for the receive side.
    pub recv_cq: CqHandle,
    /// Shared receive queue, if the pair does not own a receive queue.
    pub srq: Option<SrqHandle>,
    /// Send queue depth.
    pub max_send_wr: u32,
    /// Receive queue depth (ignored with an SRQ).
    pub max_recv_wr: u32,
    /// Requested inline threshold in bytes.
    pub max_inline_data: u32,
}

/// Result of queue pair creation.
#[derive(Debug, Clone, Copy)]
pub struct QpCreated {
    /// Provider handle.
    pub handle: QpHandle,
    /// Queue pair number visible to peers.
    pub qp_num: u32,
    /// Inline threshold actually granted by the provider.
    pub max_inline_data: u32,
}

/// One step of the queue pair connection state machine.
#[derive(Debug, Clone, Copy)]
pub enum QpTransition {
    /// Reset → Init.
    Init {
        /// Physical port.
        port: u8,
        /// Remote operations permitted on this side.
        access: AccessFlags,
    },
    /// Init → ReadyToReceive.
    ReadyToReceive {
        /// The remote queue pair.
        remote: Address,
        /// Path MTU.
        mtu: Mtu,
        /// Starting receive packet sequence number.
        rq_psn: u32,
        /// Minimum RNR NAK timer.
        min_rnr_timer: u8,
        /// Outstanding RDMA reads/atomics accepted as responder.
        max_dest_rd_atomic: u8,
        /// Port used for the address vector.
        port: u8,
        /// Source GID index for routed fabrics.
        gid_index: u8,
    },
    /// ReadyToReceive → ReadyToSend.
    ReadyToSend {
        /// Starting send packet sequence number.
        sq_psn: u32,
        /// Local ack timeout exponent, 0 meaning infinite.
        timeout: u8,
        /// Transport retry count.
        retry_count: u8,
        /// Receiver-not-ready retry count, 7 meaning infinite.
        rnr_retry: u8,
        /// Outstanding RDMA reads/atomics as requester.
        max_rd_atomic: u8,
    },
}

/// Scatter/gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    /// Virtual address.
    pub addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// Local key of the covering region.
    pub lkey: u32,
}

/// Send-queue operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpcode {
    /// Two-sided send.
    Send,
    /// One-sided write.
    Write,
    /// One-sided write consuming a receive at the peer.
    WriteWithImmediate,
    /// One-sided read.
    Read,
    /// 64-bit remote fetch-and-add.
    FetchAndAdd,
    /// 64-bit remote compare-and-swap.
    CompareAndSwap,
}

/// Lowered send-queue work request.
#[derive(Debug, Clone, Copy)]
pub struct SendWr {
    /// Opaque identifier echoed in the completion.
    pub wr_id: u64,
    /// Operation.
    pub opcode: SendOpcode,
    /// Local buffer.
    pub sge: Sge,
    /// Remote virtual address for one-sided operations.
    pub remote_addr: u64,
    /// Remote key for one-sided operations.
    pub rkey: u32,
    /// Immediate data for `WriteWithImmediate`.
    pub imm_data: u32,
    /// Compare operand (CAS) or addend (FAA).
    pub compare_add: u64,
    /// Swap operand (CAS).
    pub swap: u64,
    /// Generate a completion.
    pub signaled: bool,
    /// Copy the payload into the descriptor.
    pub inline: bool,
}

/// Lowered receive-queue work request.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    /// Opaque identifier echoed in the completion.
    pub wr_id: u64,
    /// Local buffer.
    pub sge: Sge,
}

/// Status of a work completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    /// The operation succeeded.
    #[default]
    Success,
    /// Receive buffer too small for the incoming message.
    LocalLengthError,
    /// Local key or range invalid.
    LocalProtectionError,
    /// Internal queue pair consistency error.
    LocalQpOperationError,
    /// The queue pair entered the error state before this request ran.
    WorkRequestFlushed,
    /// Remote key, range or permission rejected.
    RemoteAccessError,
    /// The responder could not process the request.
    RemoteInvalidRequest,
    /// The responder failed the operation.
    RemoteOperationError,
    /// Transport retries exhausted (peer unreachable).
    RetryExceeded,
    /// Receiver-not-ready retries exhausted.
    RnrRetryExceeded,
    /// Provider specific status code.
    Other(u32),
}

/// A completion as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Identifier of the finished request.
    pub wr_id: u64,
    /// Completion status.
    pub status: CompletionStatus,
    /// Operation that finished.
    pub opcode: CompletionOpcode,
    /// Bytes transferred (receives) or requested.
    pub byte_len: u32,
    /// Immediate data delivered with a receive.
    pub imm_data: Option<u32>,
    /// Local queue pair number.
    pub qp_num: u32,
}

/// An RDMA provider.
///
/// Every method corresponds to one verbs call. Handles returned by one provider
/// must only be passed back to the same provider.
pub trait Fabric: Send + Sync {
    /// Device name, for logs.
    fn name(&self) -> &str;

    /// Queries port attributes, including the GID at `gid_index` if given.
    fn query_port(&self, port: u8, gid_index: Option<u8>) -> Result<PortInfo>;

    /// Allocates a protection domain.
    fn alloc_pd(&self) -> Result<PdHandle>;

    /// Releases a protection domain. Fails while objects still reference it.
    fn dealloc_pd(&self, pd: PdHandle) -> Result<()>;

    /// Creates a completion queue attached to the device's completion channel.
    fn create_cq(&self, entries: u32) -> Result<CqHandle>;

    /// Destroys a completion queue. Fails while queue pairs still reference it.
    fn destroy_cq(&self, cq: CqHandle) -> Result<()>;

    /// Creates a shared receive queue.
    fn create_srq(&self, pd: PdHandle, max_wr: u32) -> Result<SrqHandle>;

    /// Destroys a shared receive queue.
    fn destroy_srq(&self, srq: SrqHandle) -> Result<()>;

    /// Registers `len` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// The memory must stay valid, and must not be unmapped, until the returned region
    /// has been deregistered.
    unsafe fn register_mr(
        &self,
        pd: PdHandle,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<MrInfo>;

    /// Deregisters a memory region.
    fn deregister_mr(&self, mr: MrHandle) -> Result<()>;

    /// Creates a reliable-connected queue pair in the Reset state.
    fn create_qp(&self, pd: PdHandle, attr: &QpInitAttr) -> Result<QpCreated>;

    /// Applies one state transition.
    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> Result<()>;

    /// Destroys a queue pair.
    fn destroy_qp(&self, qp: QpHandle) -> Result<()>;

    /// Posts a chain of send-queue requests; they execute in order.
    fn post_send(&self, qp: QpHandle, wrs: &[SendWr]) -> Result<()>;

    /// Posts a chain of receive requests to the queue pair's own receive queue.
    fn post_recv(&self, qp: QpHandle, wrs: &[RecvWr]) -> Result<()>;

    /// Posts a chain of receive requests to a shared receive queue.
    fn post_srq_recv(&self, srq: SrqHandle, wrs: &[RecvWr]) -> Result<()>;

    /// Fills the front of `out` with ready completions, returning how many were written.
    fn poll_cq(&self, cq: CqHandle, out: &mut [WorkCompletion]) -> Result<usize>;

    /// Arms the completion queue so the next completion raises a channel event.
    fn req_notify_cq(&self, cq: CqHandle) -> Result<()>;

    /// Blocks on the completion channel. Returns the completion queue that fired, or
    /// `None` if `timeout` elapsed first. The event is acknowledged before returning.
    fn wait_cq_event(&self, timeout: Option<Duration>) -> Result<Option<CqHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtu_ibv_round_trip() {
        for mtu in [
            Mtu::Mtu256,
            Mtu::Mtu512,
            Mtu::Mtu1024,
            Mtu::Mtu2048,
            Mtu::Mtu4096,
        ] {
            assert_eq!(Mtu::from_ibv(mtu.as_ibv()), mtu);
        }
        assert_eq!(Mtu::Mtu4096.bytes(), 4096);
    }

    #[test]
    fn test_mtu_serde_names() {
        let json = serde_json::to_string(&Mtu::Mtu2048).unwrap();
        assert_eq!(json, "\"2048\"");
    }
}
