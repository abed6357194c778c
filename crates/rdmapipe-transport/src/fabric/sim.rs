#![allow(missing_docs)]

//! In-process RDMA fabric for testing without hardware.
//!
//! A [`SimNetwork`] plays the part of the subnet: every [`SimDevice`] created from it
//! gets its own LID, and queue pairs on different devices reach each other by
//! (LID, QPN) as they would on InfiniBand. Data movement is real. One-sided writes
//! and reads copy between the registered addresses of both sides, atomics operate on
//! the remote word, and sends land in the posted receive buffers.
//!
//! Work requests execute synchronously inside `post_send`, so a signaled completion is
//! already queued when the post returns. A send that finds no posted receive is held
//! back when the sender negotiated infinite RNR retries and fails with
//! [`CompletionStatus::RnrRetryExceeded`] otherwise.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{
    CompletionStatus, CqHandle, Fabric, MrHandle, MrInfo, Mtu, PdHandle, PortInfo, QpCreated,
    QpHandle, QpInitAttr, QpTransition, RecvWr, SendOpcode, SendWr, Sge, SrqHandle,
    WorkCompletion,
};
use crate::address::{Address, Gid};
use crate::completion::CompletionOpcode;
use crate::error::{Result, TransportError};
use crate::memory::AccessFlags;
use crate::queue_pair::QpState;

/// The only physical port a simulated device has.
pub const SIM_PORT: u8 = 1;

/// Largest inline threshold a simulated queue pair grants.
pub const SIM_MAX_INLINE: u32 = 1024;

/// RNR retry value meaning "retry forever".
const INFINITE_RNR_RETRY: u8 = 7;

/// Settings for one simulated device.
#[derive(Debug, Clone)]
pub struct SimDeviceConfig {
    /// Device name; defaults to `sim<N>`.
    pub name: Option<String>,
    /// LID; defaults to the next free one.
    pub lid: Option<u16>,
    /// Number given to the first queue pair created on the device.
    pub first_qp_num: u32,
    /// Port GID; defaults to a link-local GID derived from the LID.
    pub gid: Option<Gid>,
    /// Active MTU reported by `query_port`.
    pub active_mtu: Mtu,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            name: None,
            lid: None,
            first_qp_num: 0x100,
            gid: None,
            active_mtu: Mtu::Mtu4096,
        }
    }
}

/// Fabric-wide counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricStats {
    pub operations_completed: u64,
    pub operations_failed: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub bytes_sent: u64,
    pub rnr_deferred: u64,
}

struct DeviceState {
    lid: u16,
    gid: Gid,
    mtu: Mtu,
    next_qp_num: u32,
    events: VecDeque<CqHandle>,
}

struct SimPd {
    device: u32,
}

struct SimCq {
    device: u32,
    capacity: usize,
    entries: VecDeque<WorkCompletion>,
    armed: bool,
    overrun: bool,
    users: usize,
}

struct SimSrq {
    device: u32,
    pd: u64,
    max_wr: usize,
    queue: VecDeque<RecvWr>,
    users: usize,
}

struct SimMr {
    device: u32,
    pd: u64,
    addr: u64,
    len: usize,
    access: AccessFlags,
    lkey: u32,
    rkey: u32,
}

/// A receive-consuming operation waiting for the peer to post a receive.
struct Inbound {
    sender: u64,
    wr: SendWr,
    payload: Option<Vec<u8>>,
    imm: Option<u32>,
}

struct SimQp {
    device: u32,
    pd: u64,
    qp_num: u32,
    state: QpState,
    send_cq: u64,
    recv_cq: u64,
    srq: Option<u64>,
    rq: VecDeque<RecvWr>,
    max_send_wr: usize,
    max_recv_wr: usize,
    max_inline: u32,
    access: AccessFlags,
    remote: Option<Address>,
    rnr_retry: u8,
    inbound: VecDeque<Inbound>,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    next_key: u32,
    next_device: u32,
    devices: HashMap<u32, DeviceState>,
    pds: HashMap<u64, SimPd>,
    cqs: HashMap<u64, SimCq>,
    srqs: HashMap<u64, SimSrq>,
    mrs: HashMap<u64, SimMr>,
    qps: HashMap<u64, SimQp>,
    lkeys: HashMap<u32, u64>,
    rkeys: HashMap<u32, u64>,
    routes: HashMap<(u16, u32), u64>,
    failures: HashMap<&'static str, i32>,
    stats: FabricStats,
}

#[derive(Default)]
struct Shared {
    state: Mutex<SimState>,
    events: Condvar,
}

/// A simulated subnet. Cloning yields another handle to the same subnet.
#[derive(Clone, Default)]
pub struct SimNetwork {
    shared: Arc<Shared>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a device with default settings.
    pub fn device(&self) -> Arc<SimDevice> {
        self.device_with(SimDeviceConfig::default())
            .unwrap_or_else(|_| unreachable!("automatic LIDs never collide"))
    }

    /// Attaches a device. Fails if the requested LID is already taken.
    pub fn device_with(&self, config: SimDeviceConfig) -> Result<Arc<SimDevice>> {
        let mut st = self.shared.state.lock();
        let lid = match config.lid {
            Some(lid) => {
                if lid == 0 || st.devices.values().any(|d| d.lid == lid) {
                    return Err(TransportError::InvalidArgument(format!(
                        "LID {} is not available",
                        lid
                    )));
                }
                lid
            }
            None => (1..=u16::MAX)
                .find(|lid| !st.devices.values().any(|d| d.lid == *lid))
                .ok_or_else(|| TransportError::DeviceUnavailable {
                    reason: "simulated subnet is out of LIDs".to_string(),
                })?,
        };
        st.next_device += 1;
        let id = st.next_device;
        let gid = config.gid.unwrap_or_else(|| Gid::link_local(lid as u64));
        st.devices.insert(
            id,
            DeviceState {
                lid,
                gid,
                mtu: config.active_mtu,
                next_qp_num: config.first_qp_num,
                events: VecDeque::new(),
            },
        );
        let name = config.name.unwrap_or_else(|| format!("sim{}", id));
        debug!(device = %name, lid, "attached simulated device");
        Ok(Arc::new(SimDevice {
            shared: self.shared.clone(),
            id,
            lid,
            name,
        }))
    }

    /// Makes the next call named `call` (for example `"ibv_modify_qp"`) fail with `errno`.
    pub fn inject_failure(&self, call: &'static str, errno: i32) {
        self.shared.state.lock().failures.insert(call, errno);
    }

    pub fn stats(&self) -> FabricStats {
        self.shared.state.lock().stats.clone()
    }
}

/// One simulated HCA attached to a [`SimNetwork`].
pub struct SimDevice {
    shared: Arc<Shared>,
    id: u32,
    lid: u16,
    name: String,
}

impl SimDevice {
    pub fn lid(&self) -> u16 {
        self.lid
    }
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDevice")
            .field("name", &self.name)
            .field("lid", &self.lid)
            .finish()
    }
}

fn einval(call: &'static str) -> TransportError {
    TransportError::from_errno(call, libc::EINVAL)
}

/// Copies like an RDMA write lands: the final word becomes visible after the rest.
///
/// # Safety
///
/// Both ranges must be valid for `len` bytes.
unsafe fn place_in_order(src: *const u8, dst: *mut u8, len: usize) {
    if len <= 8 {
        std::ptr::copy(src, dst, len);
        return;
    }
    let head = len - 8;
    std::ptr::copy(src, dst, head);
    std::sync::atomic::fence(Ordering::Release);
    std::ptr::copy(src.add(head), dst.add(head), 8);
}

fn covers(base: u64, len: usize, addr: u64, n: usize) -> bool {
    match (addr.checked_add(n as u64), base.checked_add(len as u64)) {
        (Some(end), Some(limit)) => addr >= base && end <= limit,
        _ => false,
    }
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_injected(&mut self, call: &'static str) -> Result<()> {
        match self.failures.remove(call) {
            Some(errno) => Err(TransportError::from_errno(call, errno)),
            None => Ok(()),
        }
    }

    fn push_completion(&mut self, cq_h: u64, wc: WorkCompletion) {
        let Some(cq) = self.cqs.get_mut(&cq_h) else {
            return;
        };
        if cq.entries.len() >= cq.capacity {
            cq.overrun = true;
            return;
        }
        cq.entries.push_back(wc);
        if cq.armed {
            cq.armed = false;
            if let Some(dev) = self.devices.get_mut(&cq.device) {
                dev.events.push_back(CqHandle(cq_h));
            }
        }
    }

    /// Reports the outcome of a send-queue request. Failures always complete and move
    /// the queue pair to the error state.
    fn complete_send(&mut self, qp_h: u64, wr: &SendWr, status: CompletionStatus) {
        let Some(qp) = self.qps.get_mut(&qp_h) else {
            return;
        };
        if status == CompletionStatus::Success {
            self.stats.operations_completed += 1;
            if !wr.signaled {
                return;
            }
        } else {
            self.stats.operations_failed += 1;
            if qp.state != QpState::Error {
                debug!(qp_num = qp.qp_num, ?status, "sim queue pair entered error state");
            }
            qp.state = QpState::Error;
        }
        let wc = WorkCompletion {
            wr_id: wr.wr_id,
            status,
            opcode: wr.opcode.into(),
            byte_len: wr.sge.length,
            imm_data: None,
            qp_num: qp.qp_num,
        };
        let cq = qp.send_cq;
        self.push_completion(cq, wc);
    }

    fn local_ok(&self, device: u32, pd: u64, sge: &Sge, need: AccessFlags) -> bool {
        if sge.length == 0 {
            return true;
        }
        let Some(mr) = self.lkeys.get(&sge.lkey).and_then(|h| self.mrs.get(h)) else {
            return false;
        };
        mr.lkey == sge.lkey
            && mr.device == device
            && mr.pd == pd
            && mr.access.contains(need)
            && covers(mr.addr, mr.len, sge.addr, sge.length as usize)
    }

    fn remote_ok(
        &self,
        device: u32,
        pd: u64,
        rkey: u32,
        addr: u64,
        len: usize,
        need: AccessFlags,
    ) -> bool {
        let Some(mr) = self.rkeys.get(&rkey).and_then(|h| self.mrs.get(h)) else {
            return false;
        };
        mr.rkey == rkey
            && mr.device == device
            && mr.pd == pd
            && mr.access.contains(need)
            && covers(mr.addr, mr.len, addr, len)
    }

    fn has_receive(&self, qp_h: u64) -> bool {
        let Some(qp) = self.qps.get(&qp_h) else {
            return false;
        };
        match qp.srq {
            Some(srq) => self.srqs.get(&srq).map_or(false, |s| !s.queue.is_empty()),
            None => !qp.rq.is_empty(),
        }
    }

    fn take_receive(&mut self, qp_h: u64) -> Option<RecvWr> {
        let qp = self.qps.get_mut(&qp_h)?;
        match qp.srq {
            Some(srq) => self.srqs.get_mut(&srq)?.queue.pop_front(),
            None => qp.rq.pop_front(),
        }
    }

    fn execute(&mut self, qp_h: u64, wr: &SendWr) {
        let Some(qp) = self.qps.get(&qp_h) else {
            return;
        };
        let (device, pd, state, remote, rnr_retry) =
            (qp.device, qp.pd, qp.state, qp.remote, qp.rnr_retry);
        if state == QpState::Error {
            self.complete_send(qp_h, wr, CompletionStatus::WorkRequestFlushed);
            return;
        }

        let len = wr.sge.length as usize;
        let local_need = match wr.opcode {
            SendOpcode::Read | SendOpcode::FetchAndAdd | SendOpcode::CompareAndSwap => {
                AccessFlags::LOCAL_WRITE
            }
            _ => AccessFlags::empty(),
        };
        if !wr.inline && !self.local_ok(device, pd, &wr.sge, local_need) {
            self.complete_send(qp_h, wr, CompletionStatus::LocalProtectionError);
            return;
        }

        let peer = remote
            .and_then(|r| self.routes.get(&(r.lid, r.qp_num)).copied())
            .and_then(|h| self.qps.get(&h).map(|p| (h, p)));
        let Some((peer_h, peer)) = peer else {
            self.complete_send(qp_h, wr, CompletionStatus::RetryExceeded);
            return;
        };
        if !matches!(peer.state, QpState::ReadyToReceive | QpState::ReadyToSend) {
            self.complete_send(qp_h, wr, CompletionStatus::RetryExceeded);
            return;
        }
        let (peer_device, peer_pd, peer_access) = (peer.device, peer.pd, peer.access);

        match wr.opcode {
            SendOpcode::Send => {
                let mut payload = vec![0u8; len];
                if len > 0 {
                    // SAFETY: the range was validated against a registered region, or is
                    // an inline payload the caller guarantees readable.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            wr.sge.addr as *const u8,
                            payload.as_mut_ptr(),
                            len,
                        )
                    };
                }
                self.deliver(qp_h, peer_h, wr, Some(payload), None, rnr_retry);
                return;
            }
            SendOpcode::Write | SendOpcode::WriteWithImmediate => {
                if !peer_access.contains(AccessFlags::REMOTE_WRITE)
                    || !self.remote_ok(
                        peer_device,
                        peer_pd,
                        wr.rkey,
                        wr.remote_addr,
                        len,
                        AccessFlags::REMOTE_WRITE,
                    )
                {
                    self.complete_send(qp_h, wr, CompletionStatus::RemoteAccessError);
                    return;
                }
                // SAFETY: both ranges lie inside registered regions.
                unsafe { place_in_order(wr.sge.addr as *const u8, wr.remote_addr as *mut u8, len) };
                self.stats.bytes_written += len as u64;
                if wr.opcode == SendOpcode::WriteWithImmediate {
                    self.deliver(qp_h, peer_h, wr, None, Some(wr.imm_data), rnr_retry);
                    return;
                }
            }
            SendOpcode::Read => {
                if !peer_access.contains(AccessFlags::REMOTE_READ)
                    || !self.remote_ok(
                        peer_device,
                        peer_pd,
                        wr.rkey,
                        wr.remote_addr,
                        len,
                        AccessFlags::REMOTE_READ,
                    )
                {
                    self.complete_send(qp_h, wr, CompletionStatus::RemoteAccessError);
                    return;
                }
                if len > 0 {
                    // SAFETY: both ranges lie inside registered regions.
                    unsafe {
                        std::ptr::copy(wr.remote_addr as *const u8, wr.sge.addr as *mut u8, len)
                    };
                }
                self.stats.bytes_read += len as u64;
            }
            SendOpcode::FetchAndAdd | SendOpcode::CompareAndSwap => {
                if wr.remote_addr % 8 != 0 {
                    self.complete_send(qp_h, wr, CompletionStatus::RemoteInvalidRequest);
                    return;
                }
                if !peer_access.contains(AccessFlags::REMOTE_ATOMIC)
                    || !self.remote_ok(
                        peer_device,
                        peer_pd,
                        wr.rkey,
                        wr.remote_addr,
                        8,
                        AccessFlags::REMOTE_ATOMIC,
                    )
                {
                    self.complete_send(qp_h, wr, CompletionStatus::RemoteAccessError);
                    return;
                }
                // SAFETY: the target is an aligned word inside a registered region.
                let word = unsafe { &*(wr.remote_addr as *const AtomicU64) };
                let old = if wr.opcode == SendOpcode::FetchAndAdd {
                    word.fetch_add(wr.compare_add, Ordering::SeqCst)
                } else {
                    match word.compare_exchange(
                        wr.compare_add,
                        wr.swap,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(v) | Err(v) => v,
                    }
                };
                // SAFETY: the local range is eight bytes of a writable registered region.
                unsafe { std::ptr::write_unaligned(wr.sge.addr as *mut u64, old) };
            }
        }
        self.complete_send(qp_h, wr, CompletionStatus::Success);
    }

    /// Hands a receive-consuming operation to the peer, or holds it back per RNR policy.
    fn deliver(
        &mut self,
        sender: u64,
        peer: u64,
        wr: &SendWr,
        payload: Option<Vec<u8>>,
        imm: Option<u32>,
        rnr_retry: u8,
    ) {
        let inbound = Inbound {
            sender,
            wr: *wr,
            payload,
            imm,
        };
        let queued_behind = self
            .qps
            .get(&peer)
            .map_or(false, |p| !p.inbound.is_empty());
        if !queued_behind && self.has_receive(peer) {
            self.land(peer, inbound);
            return;
        }
        if rnr_retry == INFINITE_RNR_RETRY {
            trace!(wr_id = wr.wr_id, "no receive posted, holding back until one is");
            self.stats.rnr_deferred += 1;
            if let Some(p) = self.qps.get_mut(&peer) {
                p.inbound.push_back(inbound);
            }
            return;
        }
        self.complete_send(sender, wr, CompletionStatus::RnrRetryExceeded);
    }

    fn land(&mut self, peer_h: u64, inbound: Inbound) {
        let Some(recv) = self.take_receive(peer_h) else {
            if let Some(p) = self.qps.get_mut(&peer_h) {
                p.inbound.push_front(inbound);
            }
            return;
        };
        let Some(peer) = self.qps.get(&peer_h) else {
            return;
        };
        let (device, pd, qp_num, recv_cq) = (peer.device, peer.pd, peer.qp_num, peer.recv_cq);
        let mut wc = WorkCompletion {
            wr_id: recv.wr_id,
            status: CompletionStatus::Success,
            opcode: if inbound.imm.is_some() {
                CompletionOpcode::ReceiveWithImmediate
            } else {
                CompletionOpcode::Receive
            },
            byte_len: inbound.wr.sge.length,
            imm_data: inbound.imm,
            qp_num,
        };

        if let Some(payload) = &inbound.payload {
            let sender_status = if payload.len() > recv.sge.length as usize {
                wc.status = CompletionStatus::LocalLengthError;
                Some(CompletionStatus::RemoteInvalidRequest)
            } else if !self.local_ok(device, pd, &recv.sge, AccessFlags::LOCAL_WRITE) {
                wc.status = CompletionStatus::LocalProtectionError;
                Some(CompletionStatus::RemoteOperationError)
            } else {
                None
            };
            if let Some(sender_status) = sender_status {
                if let Some(p) = self.qps.get_mut(&peer_h) {
                    p.state = QpState::Error;
                }
                self.push_completion(recv_cq, wc);
                self.complete_send(inbound.sender, &inbound.wr, sender_status);
                return;
            }
            if !payload.is_empty() {
                // SAFETY: the receive buffer was validated against a writable region.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        payload.as_ptr(),
                        recv.sge.addr as *mut u8,
                        payload.len(),
                    )
                };
            }
            self.stats.bytes_sent += payload.len() as u64;
        }

        self.push_completion(recv_cq, wc);
        self.complete_send(inbound.sender, &inbound.wr, CompletionStatus::Success);
    }

    fn drain_inbound(&mut self, qp_h: u64) {
        loop {
            if !self.has_receive(qp_h) {
                return;
            }
            let Some(next) = self.qps.get_mut(&qp_h).and_then(|q| q.inbound.pop_front()) else {
                return;
            };
            self.land(qp_h, next);
        }
    }

    fn flush_receives(&mut self, qp_h: u64, wrs: &[RecvWr]) {
        let Some(qp) = self.qps.get(&qp_h) else {
            return;
        };
        let (qp_num, cq) = (qp.qp_num, qp.recv_cq);
        for wr in wrs {
            self.push_completion(
                cq,
                WorkCompletion {
                    wr_id: wr.wr_id,
                    status: CompletionStatus::WorkRequestFlushed,
                    opcode: CompletionOpcode::Receive,
                    byte_len: 0,
                    imm_data: None,
                    qp_num,
                },
            );
        }
    }
}

impl SimDevice {
    fn owned_pd(&self, st: &SimState, pd: PdHandle, call: &'static str) -> Result<()> {
        match st.pds.get(&pd.0) {
            Some(p) if p.device == self.id => Ok(()),
            _ => Err(einval(call)),
        }
    }

    fn owned_cq(&self, st: &SimState, cq: CqHandle, call: &'static str) -> Result<()> {
        match st.cqs.get(&cq.0) {
            Some(c) if c.device == self.id => Ok(()),
            _ => Err(einval(call)),
        }
    }
}

impl Fabric for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_port(&self, port: u8, gid_index: Option<u8>) -> Result<PortInfo> {
        let st = self.shared.state.lock();
        if port != SIM_PORT {
            return Err(einval("ibv_query_port"));
        }
        let dev = st
            .devices
            .get(&self.id)
            .ok_or_else(|| einval("ibv_query_port"))?;
        Ok(PortInfo {
            port,
            lid: dev.lid,
            gid: gid_index.map(|_| dev.gid),
            active_mtu: dev.mtu,
        })
    }

    fn alloc_pd(&self) -> Result<PdHandle> {
        let mut st = self.shared.state.lock();
        st.check_injected("ibv_alloc_pd")?;
        let h = st.handle();
        st.pds.insert(h, SimPd { device: self.id });
        Ok(PdHandle(h))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> Result<()> {
        let mut st = self.shared.state.lock();
        self.owned_pd(&st, pd, "ibv_dealloc_pd")?;
        let busy = st.mrs.values().any(|m| m.pd == pd.0)
            || st.qps.values().any(|q| q.pd == pd.0)
            || st.srqs.values().any(|s| s.pd == pd.0);
        if busy {
            return Err(TransportError::from_errno("ibv_dealloc_pd", libc::EBUSY));
        }
        st.pds.remove(&pd.0);
        Ok(())
    }

    fn create_cq(&self, entries: u32) -> Result<CqHandle> {
        let mut st = self.shared.state.lock();
        st.check_injected("ibv_create_cq")?;
        if entries == 0 {
            return Err(einval("ibv_create_cq"));
        }
        let h = st.handle();
        st.cqs.insert(
            h,
            SimCq {
                device: self.id,
                capacity: entries as usize,
                entries: VecDeque::new(),
                armed: false,
                overrun: false,
                users: 0,
            },
        );
        Ok(CqHandle(h))
    }

    fn destroy_cq(&self, cq: CqHandle) -> Result<()> {
        let mut st = self.shared.state.lock();
        self.owned_cq(&st, cq, "ibv_destroy_cq")?;
        if st.cqs.get(&cq.0).map_or(0, |c| c.users) > 0 {
            return Err(TransportError::from_errno("ibv_destroy_cq", libc::EBUSY));
        }
        st.cqs.remove(&cq.0);
        Ok(())
    }

    fn create_srq(&self, pd: PdHandle, max_wr: u32) -> Result<SrqHandle> {
        let mut st = self.shared.state.lock();
        st.check_injected("ibv_create_srq")?;
        self.owned_pd(&st, pd, "ibv_create_srq")?;
        if max_wr == 0 {
            return Err(einval("ibv_create_srq"));
        }
        let h = st.handle();
        st.srqs.insert(
            h,
            SimSrq {
                device: self.id,
                pd: pd.0,
                max_wr: max_wr as usize,
                queue: VecDeque::new(),
                users: 0,
            },
        );
        Ok(SrqHandle(h))
    }

    fn destroy_srq(&self, srq: SrqHandle) -> Result<()> {
        let mut st = self.shared.state.lock();
        match st.srqs.get(&srq.0) {
            Some(s) if s.device == self.id => {
                if s.users > 0 {
                    return Err(TransportError::from_errno("ibv_destroy_srq", libc::EBUSY));
                }
            }
            _ => return Err(einval("ibv_destroy_srq")),
        }
        st.srqs.remove(&srq.0);
        Ok(())
    }

    unsafe fn register_mr(
        &self,
        pd: PdHandle,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<MrInfo> {
        let mut st = self.shared.state.lock();
        st.check_injected("ibv_reg_mr")?;
        self.owned_pd(&st, pd, "ibv_reg_mr")?;
        if addr == 0 || len == 0 {
            return Err(einval("ibv_reg_mr"));
        }
        // Remote write and atomic access imply local write, as with verbs.
        if access.intersects(AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC)
            && !access.contains(AccessFlags::LOCAL_WRITE)
        {
            return Err(einval("ibv_reg_mr"));
        }
        st.next_key += 1;
        let key = st.next_key;
        let (lkey, rkey) = (key, key | 0x8000_0000);
        let h = st.handle();
        st.mrs.insert(
            h,
            SimMr {
                device: self.id,
                pd: pd.0,
                addr,
                len,
                access,
                lkey,
                rkey,
            },
        );
        st.lkeys.insert(lkey, h);
        st.rkeys.insert(rkey, h);
        Ok(MrInfo {
            handle: MrHandle(h),
            lkey,
            rkey,
        })
    }

    fn deregister_mr(&self, mr: MrHandle) -> Result<()> {
        let mut st = self.shared.state.lock();
        st.check_injected("ibv_dereg_mr")?;
        match st.mrs.get(&mr.0) {
            Some(m) if m.device == self.id => {}
            _ => return Err(einval("ibv_dereg_mr")),
        }
        if let Some(m) = st.mrs.remove(&mr.0) {
            st.lkeys.remove(&m.lkey);
            st.rkeys.remove(&m.rkey);
        }
        Ok(())
    }

    fn create_qp(&self, pd: PdHandle, attr: &QpInitAttr) -> Result<QpCreated> {
        let mut st = self.shared.state.lock();
        st.check_injected("ibv_create_qp")?;
        self.owned_pd(&st, pd, "ibv_create_qp")?;
        self.owned_cq(&st, attr.send_cq, "ibv_create_qp")?;
        self.owned_cq(&st, attr.recv_cq, "ibv_create_qp")?;
        if let Some(srq) = attr.srq {
            match st.srqs.get(&srq.0) {
                Some(s) if s.device == self.id && s.pd == pd.0 => {}
                _ => return Err(einval("ibv_create_qp")),
            }
        }
        if attr.max_send_wr == 0 || (attr.srq.is_none() && attr.max_recv_wr == 0) {
            return Err(einval("ibv_create_qp"));
        }

        let dev = st
            .devices
            .get_mut(&self.id)
            .ok_or_else(|| einval("ibv_create_qp"))?;
        let qp_num = dev.next_qp_num;
        dev.next_qp_num = dev.next_qp_num.wrapping_add(1) & 0x00ff_ffff;
        let lid = dev.lid;

        let h = st.handle();
        let max_inline = attr.max_inline_data.min(SIM_MAX_INLINE);
        st.qps.insert(
            h,
            SimQp {
                device: self.id,
                pd: pd.0,
                qp_num,
                state: QpState::Reset,
                send_cq: attr.send_cq.0,
                recv_cq: attr.recv_cq.0,
                srq: attr.srq.map(|s| s.0),
                rq: VecDeque::new(),
                max_send_wr: attr.max_send_wr as usize,
                max_recv_wr: attr.max_recv_wr as usize,
                max_inline,
                access: AccessFlags::empty(),
                remote: None,
                rnr_retry: 0,
                inbound: VecDeque::new(),
            },
        );
        st.routes.insert((lid, qp_num), h);
        for cq in [attr.send_cq.0, attr.recv_cq.0] {
            if let Some(c) = st.cqs.get_mut(&cq) {
                c.users += 1;
            }
        }
        if let Some(s) = attr.srq.and_then(|s| st.srqs.get_mut(&s.0)) {
            s.users += 1;
        }
        Ok(QpCreated {
            handle: QpHandle(h),
            qp_num,
            max_inline_data: max_inline,
        })
    }

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> Result<()> {
        let mut st = self.shared.state.lock();
        st.check_injected("ibv_modify_qp")?;
        let q = match st.qps.get_mut(&qp.0) {
            Some(q) if q.device == self.id => q,
            _ => return Err(einval("ibv_modify_qp")),
        };
        match (q.state, transition) {
            (QpState::Reset, QpTransition::Init { port, access }) => {
                if *port != SIM_PORT {
                    return Err(einval("ibv_modify_qp"));
                }
                q.access = *access;
                q.state = QpState::Init;
            }
            (QpState::Init, QpTransition::ReadyToReceive { remote, .. }) => {
                q.remote = Some(*remote);
                q.state = QpState::ReadyToReceive;
            }
            (QpState::ReadyToReceive, QpTransition::ReadyToSend { rnr_retry, .. }) => {
                q.rnr_retry = *rnr_retry;
                q.state = QpState::ReadyToSend;
            }
            _ => return Err(einval("ibv_modify_qp")),
        }
        trace!(qp_num = q.qp_num, state = ?q.state, "sim queue pair transition");
        Ok(())
    }

    fn destroy_qp(&self, qp: QpHandle) -> Result<()> {
        let mut st = self.shared.state.lock();
        let q = match st.qps.remove(&qp.0) {
            Some(q) if q.device == self.id => q,
            Some(q) => {
                st.qps.insert(qp.0, q);
                return Err(einval("ibv_destroy_qp"));
            }
            None => return Err(einval("ibv_destroy_qp")),
        };
        if let Some(lid) = st.devices.get(&q.device).map(|d| d.lid) {
            st.routes.remove(&(lid, q.qp_num));
        }
        for cq in [q.send_cq, q.recv_cq] {
            if let Some(c) = st.cqs.get_mut(&cq) {
                c.users = c.users.saturating_sub(1);
            }
        }
        if let Some(s) = q.srq.and_then(|s| st.srqs.get_mut(&s)) {
            s.users = s.users.saturating_sub(1);
        }
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wrs: &[SendWr]) -> Result<()> {
        let mut st = self.shared.state.lock();
        st.check_injected("ibv_post_send")?;
        let q = match st.qps.get(&qp.0) {
            Some(q) if q.device == self.id => q,
            _ => return Err(einval("ibv_post_send")),
        };
        if !matches!(q.state, QpState::ReadyToSend | QpState::Error) {
            return Err(einval("ibv_post_send"));
        }
        if wrs.len() > q.max_send_wr {
            return Err(TransportError::from_errno("ibv_post_send", libc::ENOMEM));
        }
        for wr in wrs {
            let atomic = matches!(
                wr.opcode,
                SendOpcode::FetchAndAdd | SendOpcode::CompareAndSwap
            );
            if (wr.inline && wr.sge.length > q.max_inline) || (atomic && wr.sge.length != 8) {
                return Err(einval("ibv_post_send"));
            }
        }
        for wr in wrs {
            st.execute(qp.0, wr);
        }
        drop(st);
        self.shared.events.notify_all();
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, wrs: &[RecvWr]) -> Result<()> {
        let mut st = self.shared.state.lock();
        st.check_injected("ibv_post_recv")?;
        let q = match st.qps.get_mut(&qp.0) {
            Some(q) if q.device == self.id && q.srq.is_none() => q,
            _ => return Err(einval("ibv_post_recv")),
        };
        match q.state {
            QpState::Reset => return Err(einval("ibv_post_recv")),
            QpState::Error => {
                st.flush_receives(qp.0, wrs);
            }
            _ => {
                if q.rq.len() + wrs.len() > q.max_recv_wr {
                    return Err(TransportError::from_errno("ibv_post_recv", libc::ENOMEM));
                }
                q.rq.extend(wrs.iter().copied());
                st.drain_inbound(qp.0);
            }
        }
        drop(st);
        self.shared.events.notify_all();
        Ok(())
    }

    fn post_srq_recv(&self, srq: SrqHandle, wrs: &[RecvWr]) -> Result<()> {
        let mut st = self.shared.state.lock();
        st.check_injected("ibv_post_srq_recv")?;
        let s = match st.srqs.get_mut(&srq.0) {
            Some(s) if s.device == self.id => s,
            _ => return Err(einval("ibv_post_srq_recv")),
        };
        if s.queue.len() + wrs.len() > s.max_wr {
            return Err(TransportError::from_errno("ibv_post_srq_recv", libc::ENOMEM));
        }
        s.queue.extend(wrs.iter().copied());
        let attached: Vec<u64> = st
            .qps
            .iter()
            .filter(|(_, q)| q.srq == Some(srq.0) && !q.inbound.is_empty())
            .map(|(h, _)| *h)
            .collect();
        for h in attached {
            st.drain_inbound(h);
        }
        drop(st);
        self.shared.events.notify_all();
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle, out: &mut [WorkCompletion]) -> Result<usize> {
        let mut st = self.shared.state.lock();
        let c = match st.cqs.get_mut(&cq.0) {
            Some(c) if c.device == self.id => c,
            _ => return Err(einval("ibv_poll_cq")),
        };
        if c.overrun {
            return Err(TransportError::from_errno("ibv_poll_cq", libc::EOVERFLOW));
        }
        let n = out.len().min(c.entries.len());
        for (slot, wc) in out.iter_mut().zip(c.entries.drain(..n)) {
            *slot = wc;
        }
        Ok(n)
    }

    fn req_notify_cq(&self, cq: CqHandle) -> Result<()> {
        let mut st = self.shared.state.lock();
        match st.cqs.get_mut(&cq.0) {
            Some(c) if c.device == self.id => {
                c.armed = true;
                Ok(())
            }
            _ => Err(einval("ibv_req_notify_cq")),
        }
    }

    fn wait_cq_event(&self, timeout: Option<Duration>) -> Result<Option<CqHandle>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.shared.state.lock();
        loop {
            let dev = st
                .devices
                .get_mut(&self.id)
                .ok_or_else(|| einval("ibv_get_cq_event"))?;
            if let Some(cq) = dev.events.pop_front() {
                return Ok(Some(cq));
            }
            match deadline {
                Some(d) => {
                    if Instant::now() >= d {
                        return Ok(None);
                    }
                    self.shared.events.wait_until(&mut st, d);
                }
                None => self.shared.events.wait(&mut st),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Side {
        dev: Arc<SimDevice>,
        pd: PdHandle,
        cq: CqHandle,
        qp: QpCreated,
        buf: Vec<u64>,
        mr: MrInfo,
    }

    impl Side {
        fn new(net: &SimNetwork, access: AccessFlags) -> Self {
            let dev = net.device();
            let pd = dev.alloc_pd().unwrap();
            let cq = dev.create_cq(64).unwrap();
            let qp = dev
                .create_qp(
                    pd,
                    &QpInitAttr {
                        send_cq: cq,
                        recv_cq: cq,
                        srq: None,
                        max_send_wr: 16,
                        max_recv_wr: 16,
                        max_inline_data: 64,
                    },
                )
                .unwrap();
            let mut buf = vec![0u64; 64];
            let mr = unsafe {
                dev.register_mr(pd, buf.as_mut_ptr() as u64, buf.len() * 8, access)
                    .unwrap()
            };
            Self {
                dev,
                pd,
                cq,
                qp,
                buf,
                mr,
            }
        }

        fn address(&self) -> Address {
            Address::new(self.dev.lid(), self.qp.qp_num)
        }

        fn connect(&self, remote: Address, rnr_retry: u8) {
            let h = self.qp.handle;
            self.dev
                .modify_qp(
                    h,
                    &QpTransition::Init {
                        port: SIM_PORT,
                        access: AccessFlags::REMOTE_WRITE
                            | AccessFlags::REMOTE_READ
                            | AccessFlags::REMOTE_ATOMIC,
                    },
                )
                .unwrap();
            self.dev
                .modify_qp(
                    h,
                    &QpTransition::ReadyToReceive {
                        remote,
                        mtu: Mtu::Mtu4096,
                        rq_psn: 0,
                        min_rnr_timer: 12,
                        max_dest_rd_atomic: 1,
                        port: SIM_PORT,
                        gid_index: 0,
                    },
                )
                .unwrap();
            self.dev
                .modify_qp(
                    h,
                    &QpTransition::ReadyToSend {
                        sq_psn: 0,
                        timeout: 0,
                        retry_count: 7,
                        rnr_retry,
                        max_rd_atomic: 1,
                    },
                )
                .unwrap();
        }

        fn sge(&self, offset: usize, len: u32) -> Sge {
            Sge {
                addr: self.buf.as_ptr() as u64 + offset as u64,
                length: len,
                lkey: self.mr.lkey,
            }
        }

        fn poll(&self) -> Vec<WorkCompletion> {
            let mut out = [WorkCompletion::default(); 64];
            let n = self.dev.poll_cq(self.cq, &mut out).unwrap();
            out[..n].to_vec()
        }
    }

    fn rw() -> AccessFlags {
        AccessFlags::LOCAL_WRITE
            | AccessFlags::REMOTE_WRITE
            | AccessFlags::REMOTE_READ
            | AccessFlags::REMOTE_ATOMIC
    }

    fn pair(rnr_retry: u8) -> (SimNetwork, Side, Side) {
        let net = SimNetwork::new();
        let a = Side::new(&net, rw());
        let b = Side::new(&net, rw());
        a.connect(b.address(), rnr_retry);
        b.connect(a.address(), rnr_retry);
        (net, a, b)
    }

    fn send_wr(opcode: SendOpcode, sge: Sge) -> SendWr {
        SendWr {
            wr_id: 1,
            opcode,
            sge,
            remote_addr: 0,
            rkey: 0,
            imm_data: 0,
            compare_add: 0,
            swap: 0,
            signaled: true,
            inline: false,
        }
    }

    #[test]
    fn test_devices_get_distinct_lids() {
        let net = SimNetwork::new();
        let a = net.device();
        let b = net.device();
        assert_ne!(a.lid(), b.lid());
    }

    #[test]
    fn test_duplicate_lid_rejected() {
        let net = SimNetwork::new();
        net.device_with(SimDeviceConfig {
            lid: Some(7),
            ..Default::default()
        })
        .unwrap();
        let err = net
            .device_with(SimDeviceConfig {
                lid: Some(7),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
    }

    #[test]
    fn test_register_remote_write_requires_local_write() {
        let net = SimNetwork::new();
        let dev = net.device();
        let pd = dev.alloc_pd().unwrap();
        let mut buf = [0u8; 64];
        let err = unsafe {
            dev.register_mr(pd, buf.as_mut_ptr() as u64, 64, AccessFlags::REMOTE_WRITE)
        }
        .unwrap_err();
        assert!(matches!(err, TransportError::Resource { call: "ibv_reg_mr", .. }));
    }

    #[test]
    fn test_rdma_write_copies_into_remote_region() {
        let (net, mut a, b) = pair(7);
        a.buf[0] = 0xdead_beef;
        let mut wr = send_wr(SendOpcode::Write, a.sge(0, 8));
        wr.remote_addr = b.buf.as_ptr() as u64 + 16;
        wr.rkey = b.mr.rkey;
        a.dev.post_send(a.qp.handle, &[wr]).unwrap();

        assert_eq!(b.buf[2], 0xdead_beef);
        let wcs = a.poll();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].status, CompletionStatus::Success);
        assert_eq!(wcs[0].opcode, CompletionOpcode::Write);
        assert_eq!(net.stats().bytes_written, 8);
    }

    #[test]
    fn test_rdma_write_bad_rkey_is_remote_access_error() {
        let (_net, a, b) = pair(7);
        let mut wr = send_wr(SendOpcode::Write, a.sge(0, 8));
        wr.remote_addr = b.buf.as_ptr() as u64;
        wr.rkey = b.mr.rkey ^ 0x1;
        wr.signaled = false;
        a.dev.post_send(a.qp.handle, &[wr]).unwrap();

        let wcs = a.poll();
        assert_eq!(wcs.len(), 1, "errors complete even when unsignaled");
        assert_eq!(wcs[0].status, CompletionStatus::RemoteAccessError);

        let wr = send_wr(SendOpcode::Write, a.sge(0, 8));
        a.dev.post_send(a.qp.handle, &[wr]).unwrap();
        assert_eq!(a.poll()[0].status, CompletionStatus::WorkRequestFlushed);
    }

    #[test]
    fn test_rdma_read_and_atomics() {
        let (_net, a, mut b) = pair(7);
        b.buf[4] = 40;
        let mut wr = send_wr(SendOpcode::Read, a.sge(0, 8));
        wr.remote_addr = b.buf.as_ptr() as u64 + 32;
        wr.rkey = b.mr.rkey;
        a.dev.post_send(a.qp.handle, &[wr]).unwrap();
        assert_eq!(a.buf[0], 40);

        let mut faa = send_wr(SendOpcode::FetchAndAdd, a.sge(8, 8));
        faa.remote_addr = b.buf.as_ptr() as u64 + 32;
        faa.rkey = b.mr.rkey;
        faa.compare_add = 2;
        a.dev.post_send(a.qp.handle, &[faa]).unwrap();
        assert_eq!(a.buf[1], 40);
        assert_eq!(b.buf[4], 42);

        let mut cas = send_wr(SendOpcode::CompareAndSwap, a.sge(16, 8));
        cas.remote_addr = b.buf.as_ptr() as u64 + 32;
        cas.rkey = b.mr.rkey;
        cas.compare_add = 42;
        cas.swap = 7;
        a.dev.post_send(a.qp.handle, &[cas]).unwrap();
        assert_eq!(a.buf[2], 42);
        assert_eq!(b.buf[4], 7);
        assert_eq!(a.poll().len(), 3);
    }

    #[test]
    fn test_send_lands_in_posted_receive() {
        let (_net, mut a, b) = pair(0);
        b.dev
            .post_recv(
                b.qp.handle,
                &[RecvWr {
                    wr_id: 9,
                    sge: b.sge(0, 64),
                }],
            )
            .unwrap();
        a.buf[0] = u64::from_le_bytes(*b"pingpong");
        let mut wr = send_wr(SendOpcode::Send, a.sge(0, 4));
        wr.inline = true;
        a.dev.post_send(a.qp.handle, &[wr]).unwrap();

        let wcs = b.poll();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].wr_id, 9);
        assert_eq!(wcs[0].opcode, CompletionOpcode::Receive);
        assert_eq!(wcs[0].byte_len, 4);
        assert_eq!(&b.buf[0].to_le_bytes()[..4], b"ping");
    }

    #[test]
    fn test_send_without_receive_fails_with_finite_rnr_retry() {
        let (_net, a, _b) = pair(0);
        let wr = send_wr(SendOpcode::Send, a.sge(0, 8));
        a.dev.post_send(a.qp.handle, &[wr]).unwrap();
        assert_eq!(a.poll()[0].status, CompletionStatus::RnrRetryExceeded);
    }

    #[test]
    fn test_send_without_receive_deferred_with_infinite_rnr_retry() {
        let (net, a, b) = pair(7);
        let wr = send_wr(SendOpcode::Send, a.sge(0, 8));
        a.dev.post_send(a.qp.handle, &[wr]).unwrap();
        assert!(a.poll().is_empty());
        assert_eq!(net.stats().rnr_deferred, 1);

        b.dev
            .post_recv(
                b.qp.handle,
                &[RecvWr {
                    wr_id: 3,
                    sge: b.sge(0, 64),
                }],
            )
            .unwrap();
        assert_eq!(b.poll()[0].wr_id, 3);
        assert_eq!(a.poll()[0].status, CompletionStatus::Success);
    }

    #[test]
    fn test_write_with_immediate_consumes_receive() {
        let (_net, mut a, b) = pair(7);
        b.dev
            .post_recv(
                b.qp.handle,
                &[RecvWr {
                    wr_id: 5,
                    sge: b.sge(0, 0),
                }],
            )
            .unwrap();
        a.buf[0] = 11;
        let mut wr = send_wr(SendOpcode::WriteWithImmediate, a.sge(0, 8));
        wr.remote_addr = b.buf.as_ptr() as u64 + 8;
        wr.rkey = b.mr.rkey;
        wr.imm_data = 8;
        a.dev.post_send(a.qp.handle, &[wr]).unwrap();

        let wcs = b.poll();
        assert_eq!(wcs[0].opcode, CompletionOpcode::ReceiveWithImmediate);
        assert_eq!(wcs[0].imm_data, Some(8));
        assert_eq!(b.buf[1], 11);
    }

    #[test]
    fn test_post_send_before_rts_rejected() {
        let net = SimNetwork::new();
        let a = Side::new(&net, rw());
        let wr = send_wr(SendOpcode::Send, a.sge(0, 8));
        assert!(a.dev.post_send(a.qp.handle, &[wr]).is_err());
    }

    #[test]
    fn test_unknown_peer_is_retry_exceeded() {
        let net = SimNetwork::new();
        let a = Side::new(&net, rw());
        a.connect(Address::new(999, 12345), 7);
        let wr = send_wr(SendOpcode::Send, a.sge(0, 8));
        a.dev.post_send(a.qp.handle, &[wr]).unwrap();
        assert_eq!(a.poll()[0].status, CompletionStatus::RetryExceeded);
    }

    #[test]
    fn test_out_of_order_transition_rejected() {
        let net = SimNetwork::new();
        let a = Side::new(&net, rw());
        let err = a
            .dev
            .modify_qp(
                a.qp.handle,
                &QpTransition::ReadyToSend {
                    sq_psn: 0,
                    timeout: 0,
                    retry_count: 7,
                    rnr_retry: 7,
                    max_rd_atomic: 1,
                },
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::Resource { call: "ibv_modify_qp", .. }));
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let net = SimNetwork::new();
        let dev = net.device();
        net.inject_failure("ibv_alloc_pd", libc::ENOMEM);
        assert!(dev.alloc_pd().is_err());
        assert!(dev.alloc_pd().is_ok());
    }

    #[test]
    fn test_completion_event_after_arm() {
        let (_net, a, b) = pair(7);
        a.dev.req_notify_cq(a.cq).unwrap();
        let mut wr = send_wr(SendOpcode::Write, a.sge(0, 8));
        wr.remote_addr = b.buf.as_ptr() as u64;
        wr.rkey = b.mr.rkey;
        a.dev.post_send(a.qp.handle, &[wr]).unwrap();
        let ev = a.dev.wait_cq_event(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ev, Some(a.cq));
        let none = a.dev.wait_cq_event(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn test_destroy_busy_cq_rejected() {
        let (_net, a, _b) = pair(7);
        assert!(a.dev.destroy_cq(a.cq).is_err());
        a.dev.destroy_qp(a.qp.handle).unwrap();
        a.dev.deregister_mr(a.mr.handle).unwrap();
        a.dev.destroy_cq(a.cq).unwrap();
        a.dev.dealloc_pd(a.pd).unwrap();
    }
}
