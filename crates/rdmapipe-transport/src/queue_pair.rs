//! Reliable-connected queue pairs and the connection state machine.
//!
//! A queue pair starts in [`QpState::Reset`]. [`QueuePair::connect`] walks it through
//! Init, ReadyToReceive and ReadyToSend. Any failed step leaves the pair in
//! [`QpState::Error`], which is terminal: drop it and create a new one. A completion
//! that comes back with an error status moves the pair to Error as well.
//!
//! Sends, writes, reads and atomics need ReadyToSend. Receives need ReadyToReceive or
//! later.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::config::NetworkConfig;
use crate::context::{NetworkContext, QueuePairOptions};
use crate::error::{teardown_failed, Result, TransportError};
use crate::fabric::{Mtu, QpHandle, QpInitAttr, QpTransition};
use crate::memory::AccessFlags;
use crate::work_request::{WorkRequest, WorkRequestChain};

/// Connection state of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QpState {
    /// Freshly created.
    Reset = 0,
    /// Bound to a port.
    Init = 1,
    /// Knows its peer; receives may be posted.
    ReadyToReceive = 2,
    /// Fully connected.
    ReadyToSend = 3,
    /// Terminal.
    Error = 4,
}

impl QpState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => QpState::Reset,
            1 => QpState::Init,
            2 => QpState::ReadyToReceive,
            3 => QpState::ReadyToSend,
            _ => QpState::Error,
        }
    }
}

impl Default for QpState {
    fn default() -> Self {
        Self::Reset
    }
}

/// Parameters of the three connect transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Remote operations the peer may perform on this side.
    pub access: AccessFlags,
    /// Path MTU; the context MTU when `None`.
    pub mtu: Option<Mtu>,
    /// First expected receive sequence number.
    pub rq_psn: u32,
    /// First send sequence number.
    pub sq_psn: u32,
    /// Transport retries before a send fails, 0-7.
    pub retry_count: u8,
    /// Receiver-not-ready retries, 0-7 where 7 means forever.
    pub rnr_retry: u8,
    /// Receiver-not-ready NACK delay code advertised to the peer.
    pub min_rnr_timer: u8,
    /// Ack timeout exponent, 0 = none.
    pub ack_timeout: u8,
    /// Outstanding reads and atomics in each direction.
    pub max_rd_atomic: u8,
}

impl ConnectOptions {
    /// Options taken from the context configuration.
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            access: AccessFlags::REMOTE_WRITE
                | AccessFlags::REMOTE_READ
                | AccessFlags::REMOTE_ATOMIC,
            mtu: None,
            rq_psn: 0,
            sq_psn: 0,
            retry_count: config.retry_count,
            rnr_retry: config.rnr_retry,
            min_rnr_timer: config.min_rnr_timer,
            ack_timeout: config.ack_timeout,
            max_rd_atomic: config.max_rd_atomic,
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

/// Clears the connect-in-progress flag on every exit path.
struct ConnectingFlag<'a>(&'a AtomicBool);

impl Drop for ConnectingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One reliable-connected queue pair.
pub struct QueuePair<'ctx> {
    ctx: &'ctx NetworkContext,
    handle: QpHandle,
    qp_num: u32,
    max_inline: u32,
    uses_srq: bool,
    state: AtomicU8,
    connecting: AtomicBool,
    established: AtomicBool,
    remote: OnceLock<Address>,
    destroyed: bool,
}

impl<'ctx> QueuePair<'ctx> {
    pub(crate) fn create(ctx: &'ctx NetworkContext, options: &QueuePairOptions) -> Result<Self> {
        let config = ctx.config();
        let attr = QpInitAttr {
            send_cq: ctx.completions().cq(crate::completion::Direction::Send),
            recv_cq: ctx.completions().cq(crate::completion::Direction::Receive),
            srq: options.use_srq.then(|| ctx.srq()),
            max_send_wr: options.max_send_wr.unwrap_or(config.max_send_wr),
            max_recv_wr: options.max_recv_wr.unwrap_or(config.max_recv_wr),
            max_inline_data: options.max_inline.unwrap_or(config.max_inline),
        };
        let created = ctx.fabric().create_qp(ctx.pd(), &attr)?;
        debug!(
            qp_num = created.qp_num,
            max_inline = created.max_inline_data,
            srq = options.use_srq,
            "created queue pair"
        );
        Ok(Self {
            ctx,
            handle: created.handle,
            qp_num: created.qp_num,
            max_inline: created.max_inline_data,
            uses_srq: options.use_srq,
            state: AtomicU8::new(QpState::Reset as u8),
            connecting: AtomicBool::new(false),
            established: AtomicBool::new(false),
            remote: OnceLock::new(),
            destroyed: false,
        })
    }

    /// The context this queue pair was created from.
    pub fn context(&self) -> &'ctx NetworkContext {
        self.ctx
    }

    /// Queue pair number assigned by the device.
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Current state. A failed completion seen by the context's completion queues
    /// shows up here as [`QpState::Error`].
    pub fn state(&self) -> QpState {
        let state = QpState::from_u8(self.state.load(Ordering::Acquire));
        if state != QpState::Error && self.ctx.completions().has_failed(self.qp_num) {
            self.set_state(QpState::Error);
            return QpState::Error;
        }
        state
    }

    fn set_state(&self, state: QpState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The inline threshold granted by the device.
    pub fn max_inline(&self) -> u32 {
        self.max_inline
    }

    /// Whether receives come from the context's shared receive queue.
    pub fn uses_srq(&self) -> bool {
        self.uses_srq
    }

    /// What the peer needs to connect to this queue pair.
    pub fn address(&self) -> Address {
        self.ctx.address_of(self.qp_num)
    }

    /// The peer, once [`connect`](Self::connect) has reached ReadyToReceive.
    pub fn remote(&self) -> Option<Address> {
        self.remote.get().copied()
    }

    /// Connects to `remote` with the context's defaults and the given transport retry
    /// count.
    pub fn connect(&self, remote: Address, retry_count: u8) -> Result<()> {
        let options = ConnectOptions {
            retry_count,
            ..ConnectOptions::from_config(self.ctx.config())
        };
        self.connect_with(remote, &options)
    }

    /// Drives Reset → Init → ReadyToReceive → ReadyToSend.
    pub fn connect_with(&self, remote: Address, options: &ConnectOptions) -> Result<()> {
        if self.connecting.swap(true, Ordering::AcqRel) {
            return Err(TransportError::ConnectInProgress {
                qp_num: self.qp_num,
            });
        }
        let _flag = ConnectingFlag(&self.connecting);

        let state = self.state();
        if state != QpState::Reset {
            return Err(TransportError::InvalidState {
                qp_num: self.qp_num,
                state,
                operation: "connect",
                required: "Reset",
            });
        }
        if options.retry_count > 7 || options.rnr_retry > 7 {
            return Err(TransportError::InvalidArgument(
                "retry counts are 3-bit values (0-7)".to_string(),
            ));
        }

        if let Err(e) = self.drive_transitions(remote, options) {
            self.set_state(QpState::Error);
            warn!(
                qp_num = self.qp_num,
                %remote,
                error = %e,
                "connect failed, queue pair must be discarded"
            );
            return Err(e);
        }

        self.established.store(true, Ordering::Release);
        self.ctx.metrics().connection_established();
        info!(local = %self.address(), %remote, "queue pair connected");
        Ok(())
    }

    fn drive_transitions(&self, remote: Address, options: &ConnectOptions) -> Result<()> {
        let fabric = self.ctx.fabric();
        let port = self.ctx.config().port;

        fabric.modify_qp(
            self.handle,
            &QpTransition::Init {
                port,
                access: options.access,
            },
        )?;
        self.set_state(QpState::Init);
        debug!(qp_num = self.qp_num, "queue pair in Init");

        fabric.modify_qp(
            self.handle,
            &QpTransition::ReadyToReceive {
                remote,
                mtu: options.mtu.unwrap_or_else(|| self.ctx.mtu()),
                rq_psn: options.rq_psn,
                min_rnr_timer: options.min_rnr_timer,
                max_dest_rd_atomic: options.max_rd_atomic,
                port,
                gid_index: self.ctx.config().gid_index.unwrap_or(0),
            },
        )?;
        let _ = self.remote.set(remote);
        self.set_state(QpState::ReadyToReceive);
        debug!(qp_num = self.qp_num, %remote, "queue pair in ReadyToReceive");

        fabric.modify_qp(
            self.handle,
            &QpTransition::ReadyToSend {
                sq_psn: options.sq_psn,
                timeout: options.ack_timeout,
                retry_count: options.retry_count,
                rnr_retry: options.rnr_retry,
                max_rd_atomic: options.max_rd_atomic,
            },
        )?;
        self.set_state(QpState::ReadyToSend);
        Ok(())
    }

    fn require(&self, operation: &'static str, receive: bool) -> Result<()> {
        let state = self.state();
        let ok = match state {
            QpState::ReadyToSend => true,
            QpState::ReadyToReceive => receive,
            _ => false,
        };
        if ok {
            return Ok(());
        }
        Err(TransportError::InvalidState {
            qp_num: self.qp_num,
            state,
            operation,
            required: if receive {
                "ReadyToReceive or ReadyToSend"
            } else {
                "ReadyToSend"
            },
        })
    }

    fn check_inline(&self, wr: &WorkRequest<'_>) -> Result<()> {
        if !wr.is_inline() {
            return Ok(());
        }
        if !wr.supports_inline() {
            return Err(TransportError::InvalidArgument(format!(
                "a {} cannot be inline",
                wr.kind().name()
            )));
        }
        let size = wr.kind().local().len();
        if size > self.max_inline as usize {
            return Err(TransportError::InlineTooLarge {
                size,
                max: self.max_inline,
            });
        }
        Ok(())
    }

    /// Posts one work request. Receives go to this queue pair's own receive queue.
    pub fn post(&self, wr: &WorkRequest<'_>) -> Result<()> {
        if wr.is_receive() {
            return self.post_receive(wr);
        }
        self.require("post_send", false)?;
        self.check_inline(wr)?;
        let raw = wr.lower_send()?;
        self.ctx.fabric().post_send(self.handle, &[raw])?;
        self.ctx.metrics().work_request_posted(wr.is_signaled());
        Ok(())
    }

    /// Posts a chain in one call. The chain is all receives or all send-side requests.
    pub fn post_chain(&self, chain: &WorkRequestChain<'_>) -> Result<()> {
        let requests = chain.requests();
        let Some(first) = requests.first() else {
            return Ok(());
        };
        if requests.iter().any(|w| w.is_receive() != first.is_receive()) {
            return Err(TransportError::InvalidArgument(
                "a chain cannot mix receives with send-side requests".to_string(),
            ));
        }
        if first.is_receive() {
            self.require("post_recv", true)?;
            self.check_own_receive_queue()?;
            let raw = requests
                .iter()
                .map(|w| w.lower_recv())
                .collect::<Result<Vec<_>>>()?;
            return self.ctx.fabric().post_recv(self.handle, &raw);
        }

        self.require("post_send", false)?;
        let mut raw = Vec::with_capacity(requests.len());
        for wr in requests {
            self.check_inline(wr)?;
            raw.push(wr.lower_send()?);
        }
        self.ctx.fabric().post_send(self.handle, &raw)?;
        for wr in requests {
            self.ctx.metrics().work_request_posted(wr.is_signaled());
        }
        Ok(())
    }

    fn check_own_receive_queue(&self) -> Result<()> {
        if self.uses_srq {
            return Err(TransportError::InvalidArgument(format!(
                "queue pair {} takes receives from the shared receive queue",
                self.qp_num
            )));
        }
        Ok(())
    }

    /// Posts a receive to this queue pair's own receive queue.
    pub fn post_receive(&self, wr: &WorkRequest<'_>) -> Result<()> {
        self.require("post_recv", true)?;
        self.check_own_receive_queue()?;
        let raw = wr.lower_recv()?;
        self.ctx.fabric().post_recv(self.handle, &[raw])
    }

    fn release(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        if self.established.load(Ordering::Acquire) {
            self.ctx.metrics().connection_closed();
        }
        self.ctx.completions().forget(self.qp_num);
        self.ctx.fabric().destroy_qp(self.handle)
    }

    /// Destroys the queue pair, returning the driver error instead of panicking.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }
}

impl Drop for QueuePair<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            teardown_failed(&format!("queue pair {}", self.qp_num), &e);
        }
    }
}

impl std::fmt::Debug for QueuePair<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &self.qp_num)
            .field("state", &self.state())
            .field("remote", &self.remote())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionOpcode, Direction};
    use crate::fabric::{CompletionStatus, SimNetwork};
    use crate::memory::RemoteAddress;

    fn contexts() -> (SimNetwork, NetworkContext, NetworkContext) {
        let net = SimNetwork::new();
        let a = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
        let b = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
        (net, a, b)
    }

    #[test]
    fn test_connect_reaches_ready_to_send() {
        let (_net, a, b) = contexts();
        let qa = a.create_queue_pair().unwrap();
        let qb = b.create_queue_pair().unwrap();
        assert_eq!(qa.state(), QpState::Reset);
        qa.connect(qb.address(), 7).unwrap();
        qb.connect(qa.address(), 7).unwrap();
        assert_eq!(qa.state(), QpState::ReadyToSend);
        assert_eq!(qa.remote(), Some(qb.address()));
        assert_eq!(a.metrics().snapshot().active_connections, 1);
    }

    #[test]
    fn test_connect_twice_rejected() {
        let (_net, a, b) = contexts();
        let qa = a.create_queue_pair().unwrap();
        let qb = b.create_queue_pair().unwrap();
        qa.connect(qb.address(), 7).unwrap();
        let err = qa.connect(qb.address(), 7).unwrap_err();
        assert!(matches!(
            err,
            TransportError::InvalidState {
                state: QpState::ReadyToSend,
                operation: "connect",
                ..
            }
        ));
    }

    #[test]
    fn test_failed_transition_moves_to_error() {
        let (net, a, b) = contexts();
        let qa = a.create_queue_pair().unwrap();
        let qb = b.create_queue_pair().unwrap();
        net.inject_failure("ibv_modify_qp", libc::EINVAL);
        let err = qa.connect(qb.address(), 7).unwrap_err();
        assert!(matches!(err, TransportError::Resource { call: "ibv_modify_qp", .. }));
        assert!(err.is_fatal());
        assert_eq!(qa.state(), QpState::Error);
        assert!(qa.connect(qb.address(), 7).is_err());
    }

    #[test]
    fn test_post_before_connect_fails() {
        let (_net, a, b) = contexts();
        let mr = a.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        let qa = a
            .create_queue_pair_with(&QueuePairOptions {
                use_srq: false,
                ..Default::default()
            })
            .unwrap();
        let send = WorkRequest::send(mr.slice(0, 8).unwrap());
        let recv = WorkRequest::receive(mr.slice(0, 64).unwrap());
        assert!(matches!(
            qa.post(&send),
            Err(TransportError::InvalidState { state: QpState::Reset, .. })
        ));
        assert!(matches!(
            qa.post(&recv),
            Err(TransportError::InvalidState { state: QpState::Reset, .. })
        ));
        let qb = b.create_queue_pair().unwrap();
        qa.connect(qb.address(), 7).unwrap();
        qa.post(&recv).unwrap();
    }

    #[test]
    fn test_inline_threshold_enforced() {
        let (_net, a, b) = contexts();
        let mr = a.allocate(4096, AccessFlags::LOCAL_WRITE).unwrap();
        let qa = a.create_queue_pair().unwrap();
        let qb = b.create_queue_pair().unwrap();
        qa.connect(qb.address(), 7).unwrap();
        qb.connect(qa.address(), 7).unwrap();
        let too_big = WorkRequest::send(mr.slice(0, 1024).unwrap()).inline(true);
        assert!(matches!(
            qa.post(&too_big),
            Err(TransportError::InlineTooLarge { size: 1024, max: 512 })
        ));
    }

    #[test]
    fn test_srq_pair_rejects_own_receive() {
        let (_net, a, b) = contexts();
        let mr = a.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        let qa = a.create_queue_pair().unwrap();
        let qb = b.create_queue_pair().unwrap();
        qa.connect(qb.address(), 7).unwrap();
        let recv = WorkRequest::receive(mr.slice(0, 64).unwrap());
        assert!(matches!(
            qa.post(&recv),
            Err(TransportError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_write_completes_on_send_queue() {
        let (_net, a, b) = contexts();
        let src = a.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        let dst = b.allocate(64, AccessFlags::remote_all()).unwrap();
        let qa = a.create_queue_pair().unwrap();
        let qb = b.create_queue_pair().unwrap();
        qa.connect(qb.address(), 7).unwrap();
        qb.connect(qa.address(), 7).unwrap();

        src.write_at(0, b"abcdefgh").unwrap();
        let wr = WorkRequest::write(src.slice(0, 8).unwrap(), dst.remote().at(8)).with_id(5);
        qa.post(&wr).unwrap();
        let c = a
            .completions()
            .poll_blocking(Direction::Send, CompletionOpcode::Write)
            .unwrap();
        assert_eq!(c.wr_id, 5);
        assert_eq!(dst.read_vec(8, 8).unwrap(), b"abcdefgh");
    }

    #[test]
    fn test_failed_completion_moves_to_error() {
        let (_net, a, b) = contexts();
        let src = a.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        let dst = b.allocate(64, AccessFlags::remote_all()).unwrap();
        let qa = a.create_queue_pair().unwrap();
        let qb = b.create_queue_pair().unwrap();
        let other = a.create_queue_pair().unwrap();
        qa.connect(qb.address(), 7).unwrap();
        qb.connect(qa.address(), 7).unwrap();

        let bad_key = RemoteAddress {
            addr: dst.remote().addr,
            rkey: 0xbad,
        };
        qa.post(&WorkRequest::write(src.slice(0, 8).unwrap(), bad_key).with_id(5))
            .unwrap();
        let err = a
            .completions()
            .poll_blocking(Direction::Send, CompletionOpcode::Write)
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::CompletionFailed {
                status: CompletionStatus::RemoteAccessError,
                wr_id: 5,
                ..
            }
        ));
        assert!(err.is_fatal());
        assert_eq!(qa.state(), QpState::Error);

        let retry = WorkRequest::write(src.slice(0, 8).unwrap(), dst.remote().at(0));
        assert!(matches!(
            qa.post(&retry),
            Err(TransportError::InvalidState {
                state: QpState::Error,
                ..
            })
        ));
        assert!(qa.connect(qb.address(), 7).is_err());
        assert_eq!(other.state(), QpState::Reset);

        let failed = qa.qp_num();
        drop(qa);
        assert!(!a.completions().has_failed(failed));
        assert_eq!(a.metrics().snapshot().active_connections, 0);
    }
}
