//! Device context: protection domain, shared completion queues and shared receive
//! queue.
//!
//! Everything created through a [`NetworkContext`] borrows it, so the borrow checker
//! guarantees queue pairs and memory regions are gone before the context tears down.
//! Teardown releases resources in reverse acquisition order: shared receive queue,
//! receive CQ, send CQ, protection domain.

use std::sync::Arc;

use tracing::{debug, info};

use crate::address::{Address, Gid};
use crate::completion::CompletionQueuePair;
use crate::config::NetworkConfig;
use crate::error::{teardown_failed, Result, TransportError};
use crate::fabric::{CqHandle, Fabric, Mtu, PdHandle, PortInfo, SrqHandle};
use crate::memory::{AccessFlags, AlignedBuffer, MemoryRegion};
use crate::metrics::TransportMetrics;
use crate::queue_pair::QueuePair;
use crate::work_request::{WorkRequest, WorkRequestChain};

#[derive(Debug, Clone, Copy)]
enum Owned {
    Pd(PdHandle),
    Cq(CqHandle),
    Srq(SrqHandle),
}

/// Releases one context-level resource exactly once.
struct ResourceGuard {
    fabric: Arc<dyn Fabric>,
    owned: Owned,
    live: bool,
}

impl ResourceGuard {
    fn new(fabric: &Arc<dyn Fabric>, owned: Owned) -> Self {
        debug!(device = fabric.name(), resource = ?owned, "acquired");
        Self {
            fabric: fabric.clone(),
            owned,
            live: true,
        }
    }

    fn release(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;
        match self.owned {
            Owned::Pd(pd) => self.fabric.dealloc_pd(pd),
            Owned::Cq(cq) => self.fabric.destroy_cq(cq),
            Owned::Srq(srq) => self.fabric.destroy_srq(srq),
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            teardown_failed(&format!("{:?}", self.owned), &e);
        }
    }
}

/// Per-queue-pair overrides of the context defaults.
#[derive(Debug, Clone)]
pub struct QueuePairOptions {
    /// Take receives from the context's shared receive queue.
    pub use_srq: bool,
    /// Send queue depth; the context default when `None`.
    pub max_send_wr: Option<u32>,
    /// Receive queue depth, ignored with `use_srq`.
    pub max_recv_wr: Option<u32>,
    /// Requested inline threshold in bytes.
    pub max_inline: Option<u32>,
}

impl Default for QueuePairOptions {
    fn default() -> Self {
        Self {
            use_srq: true,
            max_send_wr: None,
            max_recv_wr: None,
            max_inline: None,
        }
    }
}

/// An open RDMA device with its shared resources.
pub struct NetworkContext {
    // Field order is drop order.
    completions: CompletionQueuePair,
    srq: ResourceGuard,
    recv_cq: ResourceGuard,
    send_cq: ResourceGuard,
    pd: ResourceGuard,
    fabric: Arc<dyn Fabric>,
    port: PortInfo,
    config: NetworkConfig,
    metrics: Arc<TransportMetrics>,
}

impl NetworkContext {
    /// Opens `fabric` and allocates the protection domain, both shared completion
    /// queues and the shared receive queue.
    pub fn open(fabric: Arc<dyn Fabric>, config: NetworkConfig) -> Result<Self> {
        config.validate()?;
        let port = fabric.query_port(config.port, config.gid_index)?;

        let pd_handle = fabric.alloc_pd()?;
        let pd = ResourceGuard::new(&fabric, Owned::Pd(pd_handle));
        let send_handle = fabric.create_cq(config.cq_entries)?;
        let send_cq = ResourceGuard::new(&fabric, Owned::Cq(send_handle));
        let recv_handle = fabric.create_cq(config.cq_entries)?;
        let recv_cq = ResourceGuard::new(&fabric, Owned::Cq(recv_handle));
        let srq_handle = fabric.create_srq(pd_handle, config.max_outstanding)?;
        let srq = ResourceGuard::new(&fabric, Owned::Srq(srq_handle));

        let metrics = Arc::new(TransportMetrics::new());
        let completions = CompletionQueuePair::new(
            fabric.clone(),
            send_handle,
            recv_handle,
            config.backoff.clone(),
            metrics.clone(),
        );

        info!(
            device = fabric.name(),
            lid = port.lid,
            gid = ?port.gid,
            mtu = port.active_mtu.bytes(),
            "opened network context"
        );

        Ok(Self {
            completions,
            srq,
            recv_cq,
            send_cq,
            pd,
            fabric,
            port,
            config,
            metrics,
        })
    }

    /// Opens the libibverbs device named in `config`, or the only device present.
    #[cfg(feature = "verbs")]
    pub fn open_device(config: NetworkConfig) -> Result<Self> {
        let device = crate::fabric::verbs::VerbsDevice::open(config.device_name.as_deref())?;
        Self::open(Arc::new(device), config)
    }

    /// The provider behind this context.
    pub fn fabric(&self) -> &dyn Fabric {
        self.fabric.as_ref()
    }

    /// The configuration the context was opened with.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Counters shared by everything created from this context.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Attributes of the bound port, queried at open.
    pub fn port(&self) -> &PortInfo {
        &self.port
    }

    /// Local identifier of the bound port.
    pub fn lid(&self) -> u16 {
        self.port.lid
    }

    /// Port GID, when a GID index was configured.
    pub fn gid(&self) -> Option<Gid> {
        self.port.gid
    }

    /// Path MTU used for new connections.
    pub fn mtu(&self) -> Mtu {
        self.config.mtu.min(self.port.active_mtu)
    }

    /// The local address a queue pair numbered `qp_num` is reachable at.
    pub fn address_of(&self, qp_num: u32) -> Address {
        let addr = Address::new(self.port.lid, qp_num);
        match self.port.gid {
            Some(gid) => addr.with_gid(gid),
            None => addr,
        }
    }

    pub(crate) fn pd(&self) -> PdHandle {
        match self.pd.owned {
            Owned::Pd(pd) => pd,
            _ => unreachable!("pd guard always holds a protection domain"),
        }
    }

    pub(crate) fn srq(&self) -> SrqHandle {
        match self.srq.owned {
            Owned::Srq(srq) => srq,
            _ => unreachable!("srq guard always holds a shared receive queue"),
        }
    }

    /// The shared completion queues.
    pub fn completions(&self) -> &CompletionQueuePair {
        &self.completions
    }

    /// Creates a queue pair on the shared completion queues and shared receive queue.
    pub fn create_queue_pair(&self) -> Result<QueuePair<'_>> {
        self.create_queue_pair_with(&QueuePairOptions::default())
    }

    /// Creates a queue pair with per-pair overrides.
    pub fn create_queue_pair_with(&self, options: &QueuePairOptions) -> Result<QueuePair<'_>> {
        QueuePair::create(self, options)
    }

    /// Registers a caller-owned buffer. The region holds the borrow until dropped.
    pub fn register<'a>(
        &'a self,
        buf: &'a mut [u8],
        access: AccessFlags,
    ) -> Result<MemoryRegion<'a>> {
        MemoryRegion::register_borrowed(self.fabric(), self.pd(), buf, access)
    }

    /// Allocates and registers `len` zeroed, page-aligned bytes.
    pub fn allocate(&self, len: usize, access: AccessFlags) -> Result<MemoryRegion<'_>> {
        let buf = AlignedBuffer::page_aligned(len)?;
        MemoryRegion::register_owned(self.fabric(), self.pd(), buf, access)
    }

    /// Registers memory the caller keeps mapped, such as a double-mapped ring.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay mapped and valid until the region is dropped.
    pub unsafe fn register_raw(
        &self,
        ptr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegion<'_>> {
        if ptr.is_null() {
            return Err(TransportError::InvalidArgument(
                "cannot register a null pointer".to_string(),
            ));
        }
        MemoryRegion::register_external(self.fabric(), self.pd(), ptr, len, access)
    }

    /// Posts one receive to the shared receive queue.
    pub fn post_shared_receive(&self, wr: &WorkRequest<'_>) -> Result<()> {
        let raw = wr.lower_recv()?;
        self.fabric.post_srq_recv(self.srq(), &[raw])
    }

    /// Posts a chain of receives to the shared receive queue.
    pub fn post_shared_receives(&self, chain: &WorkRequestChain<'_>) -> Result<()> {
        let raw = chain
            .requests()
            .iter()
            .map(|wr| wr.lower_recv())
            .collect::<Result<Vec<_>>>()?;
        if raw.is_empty() {
            return Ok(());
        }
        self.fabric.post_srq_recv(self.srq(), &raw)
    }

    /// Tears the context down, returning the first release error instead of panicking.
    pub fn close(mut self) -> Result<()> {
        self.srq.release()?;
        self.recv_cq.release()?;
        self.send_cq.release()?;
        self.pd.release()?;
        info!(device = self.fabric.name(), "closed network context");
        Ok(())
    }
}

impl std::fmt::Debug for NetworkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkContext")
            .field("device", &self.fabric.name())
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{sim::SimDeviceConfig, SimNetwork};

    #[test]
    fn test_open_reports_port() {
        let net = SimNetwork::new();
        let dev = net
            .device_with(SimDeviceConfig {
                lid: Some(7),
                ..Default::default()
            })
            .unwrap();
        let ctx = NetworkContext::open(dev, NetworkConfig::default()).unwrap();
        assert_eq!(ctx.lid(), 7);
        assert_eq!(ctx.gid(), None);
        assert_eq!(ctx.address_of(42), Address::new(7, 42));
        ctx.close().unwrap();
    }

    #[test]
    fn test_gid_index_fills_address() {
        let net = SimNetwork::new();
        let config = NetworkConfig {
            gid_index: Some(0),
            ..NetworkConfig::default()
        };
        let ctx = NetworkContext::open(net.device(), config).unwrap();
        assert!(ctx.address_of(1).gid.is_some());
    }

    #[test]
    fn test_mtu_clamped_to_port() {
        let net = SimNetwork::new();
        let dev = net
            .device_with(SimDeviceConfig {
                active_mtu: Mtu::Mtu1024,
                ..Default::default()
            })
            .unwrap();
        let ctx = NetworkContext::open(dev, NetworkConfig::default()).unwrap();
        assert_eq!(ctx.mtu(), Mtu::Mtu1024);
    }

    #[test]
    fn test_open_failure_releases_acquired_resources() {
        let net = SimNetwork::new();
        let dev = net.device();
        net.inject_failure("ibv_create_srq", libc::ENOMEM);
        let err = NetworkContext::open(dev.clone(), NetworkConfig::default()).unwrap_err();
        assert!(matches!(err, TransportError::Resource { call: "ibv_create_srq", .. }));
        // The partially built context released its PD and CQs, so a fresh one opens.
        let ctx = NetworkContext::open(dev, NetworkConfig::default()).unwrap();
        ctx.close().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let net = SimNetwork::new();
        let config = NetworkConfig {
            rnr_retry: 9,
            ..NetworkConfig::default()
        };
        assert!(matches!(
            NetworkContext::open(net.device(), config),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_shared_receive_rejects_send_request() {
        let ctx = NetworkContext::open(SimNetwork::new().device(), NetworkConfig::default())
            .unwrap();
        let mr = ctx.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        let send = WorkRequest::send(mr.slice(0, 8).unwrap());
        assert!(ctx.post_shared_receive(&send).is_err());
        let recv = WorkRequest::receive(mr.slice(0, 64).unwrap());
        ctx.post_shared_receive(&recv).unwrap();
    }
}
