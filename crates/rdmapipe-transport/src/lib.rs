#![warn(missing_docs)]

//! rdmapipe transport: zero-copy RDMA messaging over reliable-connected queue pairs
//!
//! This crate wraps an RDMA device (or the in-process simulated fabric) in a
//! [`NetworkContext`] and builds three transports on top of it: a wraparound ring
//! buffer written with one-sided RDMA writes, a multiclient server that multiplexes
//! many clients through per-client slots, and a shared-memory ring for peers on the
//! same host.

pub mod address;
pub mod bootstrap;
pub mod completion;
pub mod config;
pub mod context;
pub mod deadline;
pub mod error;
pub mod fabric;
pub mod memory;
pub mod metrics;
pub mod multiclient;
pub mod queue_pair;
pub mod ring;
pub mod shm;
pub mod transport;
pub mod work_request;

pub use address::{Address, Gid};
pub use bootstrap::{Bootstrap, TcpBootstrap, Wire};
pub use completion::{Completion, CompletionOpcode, CompletionQueuePair, Direction};
pub use config::{
    BackoffConfig, BootstrapConfig, MulticlientConfig, MultiplexMode, NetworkConfig, RingConfig,
    TransportConfig,
};
pub use context::{NetworkContext, QueuePairOptions};
pub use deadline::{Backoff, Deadline};
pub use error::{ErrorClass, Result, TransportError};
pub use fabric::{Fabric, SimDevice, SimNetwork};
pub use memory::{AccessFlags, AlignedBuffer, MemoryRegion, RemoteAddress, RemoteMemoryRegion};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use multiclient::{MulticlientClient, MulticlientServer};
pub use queue_pair::{ConnectOptions, QpState, QueuePair};
pub use ring::{RdmaRingReceiver, RdmaRingSender, RdmaTransport, WraparoundRingBuffer};
pub use shm::ShmTransport;
pub use transport::{Transport, TransportKind};
pub use work_request::{WorkRequest, WorkRequestChain};
