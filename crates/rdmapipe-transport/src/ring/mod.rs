#![allow(missing_docs)]

//! Ring buffers: the local lock-free ring and its RDMA-backed counterpart.
//!
//! Both share the framing in [`frame`] and the addressing in [`wraparound`].

pub mod frame;
pub mod local;
pub mod rdma;
pub mod wraparound;

pub use local::{Consumer, Producer, WraparoundRingBuffer};
pub use rdma::{RdmaRingReceiver, RdmaRingSender, RdmaTransport, RingDescriptor};
pub use wraparound::{DoubleMappedBuffer, SplitCopyBuffer, WraparoundBuffer};
