//! libibverbs provider.
//!
//! Thin: every [`Fabric`] method is one verbs call on raw `ibverbs-sys` pointers, with
//! handles holding the pointer values. The data path verbs (`post_send`, `post_recv`,
//! `post_srq_recv`, `poll_cq`, `req_notify_cq`) are inline functions in `verbs.h`, so
//! they are reached through the context's ops table.

use std::ffi::CStr;
use std::ptr;
use std::time::Duration;

use ibverbs_sys as ffi;
use tracing::debug;

use super::{
    CompletionStatus, CqHandle, Fabric, MrHandle, MrInfo, Mtu, PdHandle, PortInfo, QpCreated,
    QpHandle, QpInitAttr, QpTransition, RecvWr, SendOpcode, SendWr, SrqHandle, WorkCompletion,
};
use crate::address::Gid;
use crate::completion::CompletionOpcode;
use crate::error::{teardown_failed, Result, TransportError};
use crate::memory::AccessFlags;

/// Hop limit for routed (RoCE) address vectors.
const HOP_LIMIT: u8 = 0xff;

/// An opened RDMA device with one completion channel.
pub struct VerbsDevice {
    ctx: *mut ffi::ibv_context,
    channel: *mut ffi::ibv_comp_channel,
    name: String,
}

// SAFETY: libibverbs objects may be used from any thread.
unsafe impl Send for VerbsDevice {}
unsafe impl Sync for VerbsDevice {}

fn errno_result(call: &'static str, rc: i32) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else if rc > 0 {
        Err(TransportError::from_errno(call, rc))
    } else {
        Err(TransportError::last_os_error(call))
    }
}

fn non_null<T>(call: &'static str, p: *mut T) -> Result<*mut T> {
    if p.is_null() {
        Err(TransportError::last_os_error(call))
    } else {
        Ok(p)
    }
}

impl VerbsDevice {
    /// Opens the device called `name`, or the first device when `name` is `None`.
    pub fn open(name: Option<&str>) -> Result<Self> {
        let mut n = 0i32;
        // SAFETY: `n` receives the list length; the list is freed below.
        let list = unsafe { ffi::ibv_get_device_list(&mut n as *mut _) };
        if list.is_null() {
            return Err(TransportError::DeviceUnavailable {
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        // SAFETY: libibverbs returned `n` valid device pointers.
        let devices = unsafe { std::slice::from_raw_parts(list, n.max(0) as usize) };
        let mut found = None;
        for &dev in devices {
            // SAFETY: `dev` comes from the list and the name is a NUL-terminated string.
            let dev_name = unsafe { CStr::from_ptr(ffi::ibv_get_device_name(dev)) }
                .to_string_lossy()
                .into_owned();
            if name.map_or(true, |want| want == dev_name) {
                found = Some((dev, dev_name));
                break;
            }
        }
        let opened = found.map(|(dev, dev_name)| {
            // SAFETY: `dev` is still valid; the list is freed after opening.
            (unsafe { ffi::ibv_open_device(dev) }, dev_name)
        });
        // SAFETY: freeing the list does not invalidate opened contexts.
        unsafe { ffi::ibv_free_device_list(list) };

        let (ctx, name) = opened.ok_or_else(|| TransportError::DeviceUnavailable {
            reason: match name {
                Some(want) => format!("no RDMA device named {}", want),
                None => "no RDMA devices found".to_string(),
            },
        })?;
        let ctx = non_null("ibv_open_device", ctx)?;
        // SAFETY: `ctx` is an open context.
        let channel = unsafe { ffi::ibv_create_comp_channel(ctx) };
        if channel.is_null() {
            let err = TransportError::last_os_error("ibv_create_comp_channel");
            // SAFETY: nothing else references the context yet.
            unsafe { ffi::ibv_close_device(ctx) };
            return Err(err);
        }
        debug!(device = %name, "opened RDMA device");
        Ok(Self { ctx, channel, name })
    }

    fn ops(&self) -> &mut ffi::ibv_context_ops {
        // SAFETY: the context stays open for the life of `self`; the ops table is only
        // read through the function pointers.
        unsafe { &mut (*self.ctx).ops }
    }
}

impl Drop for VerbsDevice {
    fn drop(&mut self) {
        // SAFETY: both objects were created in `open` and are released exactly once.
        unsafe {
            let rc = ffi::ibv_destroy_comp_channel(self.channel);
            if rc != 0 {
                let e = TransportError::from_errno("ibv_destroy_comp_channel", rc);
                teardown_failed(&self.name, &e);
            }
            let rc = ffi::ibv_close_device(self.ctx);
            if rc != 0 {
                let e = TransportError::from_errno("ibv_close_device", rc);
                teardown_failed(&self.name, &e);
            }
        }
    }
}

fn access_bits(access: AccessFlags) -> i32 {
    access.bits() as i32
}

fn status_from(status: ffi::ibv_wc_status::Type) -> CompletionStatus {
    use ffi::ibv_wc_status as s;
    match status {
        s::IBV_WC_SUCCESS => CompletionStatus::Success,
        s::IBV_WC_LOC_LEN_ERR => CompletionStatus::LocalLengthError,
        s::IBV_WC_LOC_PROT_ERR => CompletionStatus::LocalProtectionError,
        s::IBV_WC_LOC_QP_OP_ERR => CompletionStatus::LocalQpOperationError,
        s::IBV_WC_WR_FLUSH_ERR => CompletionStatus::WorkRequestFlushed,
        s::IBV_WC_REM_ACCESS_ERR => CompletionStatus::RemoteAccessError,
        s::IBV_WC_REM_INV_REQ_ERR => CompletionStatus::RemoteInvalidRequest,
        s::IBV_WC_REM_OP_ERR => CompletionStatus::RemoteOperationError,
        s::IBV_WC_RETRY_EXC_ERR => CompletionStatus::RetryExceeded,
        s::IBV_WC_RNR_RETRY_EXC_ERR => CompletionStatus::RnrRetryExceeded,
        other => CompletionStatus::Other(other as u32),
    }
}

fn opcode_from(opcode: ffi::ibv_wc_opcode::Type) -> CompletionOpcode {
    use ffi::ibv_wc_opcode as o;
    match opcode {
        o::IBV_WC_RDMA_WRITE => CompletionOpcode::Write,
        o::IBV_WC_RDMA_READ => CompletionOpcode::Read,
        o::IBV_WC_COMP_SWAP => CompletionOpcode::CompareAndSwap,
        o::IBV_WC_FETCH_ADD => CompletionOpcode::FetchAndAdd,
        o::IBV_WC_RECV => CompletionOpcode::Receive,
        o::IBV_WC_RECV_RDMA_WITH_IMM => CompletionOpcode::ReceiveWithImmediate,
        _ => CompletionOpcode::Send,
    }
}

fn wr_opcode(op: SendOpcode) -> ffi::ibv_wr_opcode::Type {
    use ffi::ibv_wr_opcode as o;
    match op {
        SendOpcode::Send => o::IBV_WR_SEND,
        SendOpcode::Write => o::IBV_WR_RDMA_WRITE,
        SendOpcode::WriteWithImmediate => o::IBV_WR_RDMA_WRITE_WITH_IMM,
        SendOpcode::Read => o::IBV_WR_RDMA_READ,
        SendOpcode::FetchAndAdd => o::IBV_WR_ATOMIC_FETCH_AND_ADD,
        SendOpcode::CompareAndSwap => o::IBV_WR_ATOMIC_CMP_AND_SWP,
    }
}

fn sge(s: &super::Sge) -> ffi::ibv_sge {
    ffi::ibv_sge {
        addr: s.addr,
        length: s.length,
        lkey: s.lkey,
    }
}

impl Fabric for VerbsDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_port(&self, port: u8, gid_index: Option<u8>) -> Result<PortInfo> {
        let mut attr = ffi::ibv_port_attr::default();
        // SAFETY: `attr` is a valid out-parameter.
        let rc = unsafe {
            ffi::ibv_query_port(self.ctx, port, &mut attr as *mut ffi::ibv_port_attr as *mut _)
        };
        errno_result("ibv_query_port", rc)?;
        match attr.state {
            ffi::ibv_port_state::IBV_PORT_ACTIVE | ffi::ibv_port_state::IBV_PORT_ARMED => {}
            _ => {
                return Err(TransportError::DeviceUnavailable {
                    reason: format!("port {} of {} is not active", port, self.name),
                })
            }
        }
        let gid = match gid_index {
            Some(index) => {
                // SAFETY: an all-zero union is a valid GID.
                let mut raw: ffi::ibv_gid = unsafe { std::mem::zeroed() };
                // SAFETY: `raw` is a valid out-parameter.
                let rc = unsafe { ffi::ibv_query_gid(self.ctx, port, index as i32, &mut raw) };
                errno_result("ibv_query_gid", rc)?;
                // SAFETY: every bit pattern of the union is a valid byte array.
                Some(Gid(unsafe { raw.raw }))
            }
            None => None,
        };
        Ok(PortInfo {
            port,
            lid: attr.lid,
            gid,
            active_mtu: Mtu::from_ibv(attr.active_mtu as u32),
        })
    }

    fn alloc_pd(&self) -> Result<PdHandle> {
        // SAFETY: `ctx` is open.
        let pd = non_null("ibv_alloc_pd", unsafe { ffi::ibv_alloc_pd(self.ctx) })?;
        Ok(PdHandle(pd as u64))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> Result<()> {
        // SAFETY: the handle was produced by `alloc_pd`.
        errno_result("ibv_dealloc_pd", unsafe {
            ffi::ibv_dealloc_pd(pd.0 as *mut ffi::ibv_pd)
        })
    }

    fn create_cq(&self, entries: u32) -> Result<CqHandle> {
        // SAFETY: `ctx` and `channel` are open.
        let cq = unsafe {
            ffi::ibv_create_cq(self.ctx, entries as i32, ptr::null_mut(), self.channel, 0)
        };
        Ok(CqHandle(non_null("ibv_create_cq", cq)? as u64))
    }

    fn destroy_cq(&self, cq: CqHandle) -> Result<()> {
        // SAFETY: the handle was produced by `create_cq`.
        errno_result("ibv_destroy_cq", unsafe {
            ffi::ibv_destroy_cq(cq.0 as *mut ffi::ibv_cq)
        })
    }

    fn create_srq(&self, pd: PdHandle, max_wr: u32) -> Result<SrqHandle> {
        let mut attr = ffi::ibv_srq_init_attr {
            srq_context: ptr::null_mut(),
            attr: ffi::ibv_srq_attr {
                max_wr,
                max_sge: 1,
                srq_limit: 0,
            },
        };
        // SAFETY: `pd` is a live protection domain and `attr` is initialised.
        let srq = unsafe { ffi::ibv_create_srq(pd.0 as *mut ffi::ibv_pd, &mut attr) };
        Ok(SrqHandle(non_null("ibv_create_srq", srq)? as u64))
    }

    fn destroy_srq(&self, srq: SrqHandle) -> Result<()> {
        // SAFETY: the handle was produced by `create_srq`.
        errno_result("ibv_destroy_srq", unsafe {
            ffi::ibv_destroy_srq(srq.0 as *mut ffi::ibv_srq)
        })
    }

    unsafe fn register_mr(
        &self,
        pd: PdHandle,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<MrInfo> {
        let mr = ffi::ibv_reg_mr(
            pd.0 as *mut ffi::ibv_pd,
            addr as *mut _,
            len,
            access_bits(access),
        );
        let mr = non_null("ibv_reg_mr", mr)?;
        Ok(MrInfo {
            handle: MrHandle(mr as u64),
            lkey: (*mr).lkey,
            rkey: (*mr).rkey,
        })
    }

    fn deregister_mr(&self, mr: MrHandle) -> Result<()> {
        // SAFETY: the handle was produced by `register_mr`.
        errno_result("ibv_dereg_mr", unsafe {
            ffi::ibv_dereg_mr(mr.0 as *mut ffi::ibv_mr)
        })
    }

    fn create_qp(&self, pd: PdHandle, attr: &QpInitAttr) -> Result<QpCreated> {
        // SAFETY: all-zero is a valid initial value for the C struct.
        let mut init: ffi::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        init.qp_type = ffi::ibv_qp_type::IBV_QPT_RC;
        init.send_cq = attr.send_cq.0 as *mut ffi::ibv_cq;
        init.recv_cq = attr.recv_cq.0 as *mut ffi::ibv_cq;
        init.srq = attr
            .srq
            .map_or(ptr::null_mut(), |s| s.0 as *mut ffi::ibv_srq);
        init.cap.max_send_wr = attr.max_send_wr;
        init.cap.max_recv_wr = if attr.srq.is_some() { 0 } else { attr.max_recv_wr };
        init.cap.max_send_sge = 1;
        init.cap.max_recv_sge = 1;
        init.cap.max_inline_data = attr.max_inline_data;
        init.sq_sig_all = 0;
        // SAFETY: `pd` is live and `init` references live completion queues.
        let qp = unsafe { ffi::ibv_create_qp(pd.0 as *mut ffi::ibv_pd, &mut init) };
        let qp = non_null("ibv_create_qp", qp)?;
        Ok(QpCreated {
            handle: QpHandle(qp as u64),
            // SAFETY: `qp` was just created.
            qp_num: unsafe { (*qp).qp_num },
            // The provider writes back the granted capabilities.
            max_inline_data: init.cap.max_inline_data,
        })
    }

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> Result<()> {
        use ffi::ibv_qp_attr_mask as m;
        // SAFETY: all-zero is a valid initial value for the C struct.
        let mut attr: ffi::ibv_qp_attr = unsafe { std::mem::zeroed() };
        let mask = match *transition {
            QpTransition::Init { port, access } => {
                attr.qp_state = ffi::ibv_qp_state::IBV_QPS_INIT;
                attr.qp_access_flags = access.bits();
                attr.pkey_index = 0;
                attr.port_num = port;
                m::IBV_QP_STATE | m::IBV_QP_PKEY_INDEX | m::IBV_QP_PORT | m::IBV_QP_ACCESS_FLAGS
            }
            QpTransition::ReadyToReceive {
                remote,
                mtu,
                rq_psn,
                min_rnr_timer,
                max_dest_rd_atomic,
                port,
                gid_index,
            } => {
                attr.qp_state = ffi::ibv_qp_state::IBV_QPS_RTR;
                attr.path_mtu = mtu.as_ibv();
                attr.dest_qp_num = remote.qp_num;
                attr.rq_psn = rq_psn;
                attr.max_dest_rd_atomic = max_dest_rd_atomic;
                attr.min_rnr_timer = min_rnr_timer;
                attr.ah_attr.dlid = remote.lid;
                attr.ah_attr.sl = 0;
                attr.ah_attr.src_path_bits = 0;
                attr.ah_attr.port_num = port;
                if let Some(gid) = remote.gid {
                    attr.ah_attr.is_global = 1;
                    attr.ah_attr.grh.dgid.raw = gid.0;
                    attr.ah_attr.grh.sgid_index = gid_index;
                    attr.ah_attr.grh.hop_limit = HOP_LIMIT;
                }
                m::IBV_QP_STATE
                    | m::IBV_QP_AV
                    | m::IBV_QP_PATH_MTU
                    | m::IBV_QP_DEST_QPN
                    | m::IBV_QP_RQ_PSN
                    | m::IBV_QP_MAX_DEST_RD_ATOMIC
                    | m::IBV_QP_MIN_RNR_TIMER
            }
            QpTransition::ReadyToSend {
                sq_psn,
                timeout,
                retry_count,
                rnr_retry,
                max_rd_atomic,
            } => {
                attr.qp_state = ffi::ibv_qp_state::IBV_QPS_RTS;
                attr.sq_psn = sq_psn;
                attr.timeout = timeout;
                attr.retry_cnt = retry_count;
                attr.rnr_retry = rnr_retry;
                attr.max_rd_atomic = max_rd_atomic;
                m::IBV_QP_STATE
                    | m::IBV_QP_TIMEOUT
                    | m::IBV_QP_RETRY_CNT
                    | m::IBV_QP_SQ_PSN
                    | m::IBV_QP_RNR_RETRY
                    | m::IBV_QP_MAX_QP_RD_ATOMIC
            }
        };
        // SAFETY: the handle was produced by `create_qp`; `attr` matches `mask`.
        let rc = unsafe { ffi::ibv_modify_qp(qp.0 as *mut ffi::ibv_qp, &mut attr, mask.0 as i32) };
        errno_result("ibv_modify_qp", rc)
    }

    fn destroy_qp(&self, qp: QpHandle) -> Result<()> {
        // SAFETY: the handle was produced by `create_qp`.
        errno_result("ibv_destroy_qp", unsafe {
            ffi::ibv_destroy_qp(qp.0 as *mut ffi::ibv_qp)
        })
    }

    fn post_send(&self, qp: QpHandle, wrs: &[SendWr]) -> Result<()> {
        if wrs.is_empty() {
            return Ok(());
        }
        let mut sges: Vec<ffi::ibv_sge> = wrs.iter().map(|w| sge(&w.sge)).collect();
        // SAFETY: all-zero is a valid initial value for the C struct.
        let mut raw: Vec<ffi::ibv_send_wr> = wrs.iter().map(|_| unsafe { std::mem::zeroed() }).collect();
        for (i, w) in wrs.iter().enumerate() {
            let r = &mut raw[i];
            r.wr_id = w.wr_id;
            r.sg_list = &mut sges[i];
            r.num_sge = if w.sge.length == 0 { 0 } else { 1 };
            r.opcode = wr_opcode(w.opcode);
            let mut flags = 0;
            if w.signaled {
                flags |= ffi::ibv_send_flags::IBV_SEND_SIGNALED.0;
            }
            if w.inline {
                flags |= ffi::ibv_send_flags::IBV_SEND_INLINE.0;
            }
            r.send_flags = flags;
            match w.opcode {
                SendOpcode::Send => {}
                SendOpcode::Write | SendOpcode::Read => {
                    r.wr.rdma.remote_addr = w.remote_addr;
                    r.wr.rdma.rkey = w.rkey;
                }
                SendOpcode::WriteWithImmediate => {
                    r.wr.rdma.remote_addr = w.remote_addr;
                    r.wr.rdma.rkey = w.rkey;
                    r.__bindgen_anon_1.imm_data = w.imm_data.to_be();
                }
                SendOpcode::FetchAndAdd | SendOpcode::CompareAndSwap => {
                    r.wr.atomic.remote_addr = w.remote_addr;
                    r.wr.atomic.rkey = w.rkey;
                    r.wr.atomic.compare_add = w.compare_add;
                    r.wr.atomic.swap = w.swap;
                }
            }
        }
        for i in 1..raw.len() {
            let next: *mut ffi::ibv_send_wr = &mut raw[i];
            raw[i - 1].next = next;
        }
        let mut bad: *mut ffi::ibv_send_wr = ptr::null_mut();
        let post = self
            .ops()
            .post_send
            .ok_or_else(|| TransportError::from_errno("ibv_post_send", libc::ENOSYS))?;
        // SAFETY: the chain and its SGEs live until the call returns; the provider
        // copies descriptors (and inline payloads) before returning.
        let rc = unsafe { post(qp.0 as *mut ffi::ibv_qp, raw.as_mut_ptr(), &mut bad) };
        errno_result("ibv_post_send", rc)
    }

    fn post_recv(&self, qp: QpHandle, wrs: &[RecvWr]) -> Result<()> {
        let post = self
            .ops()
            .post_recv
            .ok_or_else(|| TransportError::from_errno("ibv_post_recv", libc::ENOSYS))?;
        self.post_receive_chain(wrs, "ibv_post_recv", |chain, bad| {
            // SAFETY: see `post_receive_chain`.
            unsafe { post(qp.0 as *mut ffi::ibv_qp, chain, bad) }
        })
    }

    fn post_srq_recv(&self, srq: SrqHandle, wrs: &[RecvWr]) -> Result<()> {
        let post = self
            .ops()
            .post_srq_recv
            .ok_or_else(|| TransportError::from_errno("ibv_post_srq_recv", libc::ENOSYS))?;
        self.post_receive_chain(wrs, "ibv_post_srq_recv", |chain, bad| {
            // SAFETY: see `post_receive_chain`.
            unsafe { post(srq.0 as *mut ffi::ibv_srq, chain, bad) }
        })
    }

    fn poll_cq(&self, cq: CqHandle, out: &mut [WorkCompletion]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let poll = self
            .ops()
            .poll_cq
            .ok_or_else(|| TransportError::from_errno("ibv_poll_cq", libc::ENOSYS))?;
        let mut raw = vec![ffi::ibv_wc::default(); out.len()];
        // SAFETY: `raw` holds `out.len()` entries.
        let n = unsafe { poll(cq.0 as *mut ffi::ibv_cq, raw.len() as i32, raw.as_mut_ptr()) };
        if n < 0 {
            return Err(TransportError::from_errno("ibv_poll_cq", -n));
        }
        let n = n as usize;
        for (slot, wc) in out.iter_mut().zip(&raw[..n]) {
            *slot = WorkCompletion {
                wr_id: wc.wr_id,
                status: status_from(wc.status),
                opcode: opcode_from(wc.opcode),
                byte_len: wc.byte_len,
                imm_data: wc.imm_data(),
                qp_num: wc.qp_num,
            };
        }
        Ok(n)
    }

    fn req_notify_cq(&self, cq: CqHandle) -> Result<()> {
        let notify = self
            .ops()
            .req_notify_cq
            .ok_or_else(|| TransportError::from_errno("ibv_req_notify_cq", libc::ENOSYS))?;
        // SAFETY: the handle was produced by `create_cq`.
        errno_result("ibv_req_notify_cq", unsafe {
            notify(cq.0 as *mut ffi::ibv_cq, 0)
        })
    }

    fn wait_cq_event(&self, timeout: Option<Duration>) -> Result<Option<CqHandle>> {
        // SAFETY: the channel is open.
        let fd = unsafe { (*self.channel).fd };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);
        // SAFETY: one valid pollfd.
        let ready = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ready < 0 {
            return Err(TransportError::last_os_error("poll"));
        }
        if ready == 0 {
            return Ok(None);
        }
        let mut cq: *mut ffi::ibv_cq = ptr::null_mut();
        let mut cq_ctx: *mut libc::c_void = ptr::null_mut();
        // SAFETY: out-parameters are valid; the channel has an event pending.
        let rc = unsafe { ffi::ibv_get_cq_event(self.channel, &mut cq, &mut cq_ctx as *mut _ as *mut _) };
        errno_result("ibv_get_cq_event", rc)?;
        // SAFETY: `cq` is the queue that raised the event.
        unsafe { ffi::ibv_ack_cq_events(cq, 1) };
        Ok(Some(CqHandle(cq as u64)))
    }
}

impl VerbsDevice {
    fn post_receive_chain(
        &self,
        wrs: &[RecvWr],
        call: &'static str,
        post: impl FnOnce(*mut ffi::ibv_recv_wr, *mut *mut ffi::ibv_recv_wr) -> i32,
    ) -> Result<()> {
        if wrs.is_empty() {
            return Ok(());
        }
        let mut sges: Vec<ffi::ibv_sge> = wrs.iter().map(|w| sge(&w.sge)).collect();
        let mut raw: Vec<ffi::ibv_recv_wr> = wrs
            .iter()
            .map(|w| ffi::ibv_recv_wr {
                wr_id: w.wr_id,
                next: ptr::null_mut(),
                sg_list: ptr::null_mut(),
                num_sge: if w.sge.length == 0 { 0 } else { 1 },
            })
            .collect();
        for (r, s) in raw.iter_mut().zip(sges.iter_mut()) {
            r.sg_list = s;
        }
        for i in 1..raw.len() {
            let next: *mut ffi::ibv_recv_wr = &mut raw[i];
            raw[i - 1].next = next;
        }
        let mut bad: *mut ffi::ibv_recv_wr = ptr::null_mut();
        // The chain and its SGEs outlive the call; receives are copied into the queue.
        errno_result(call, post(raw.as_mut_ptr(), &mut bad))
    }
}

impl std::fmt::Debug for VerbsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerbsDevice").field("name", &self.name).finish()
    }
}
