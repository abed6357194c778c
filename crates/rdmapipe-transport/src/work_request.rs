#![allow(missing_docs)]

//! Typed work requests.
//!
//! A [`WorkRequest`] borrows the [`Slice`] it reads from or writes into, so a request
//! cannot be built from a region that is already gone. The region must still outlive
//! the request's completion; the ring and multiclient layers own their regions for the
//! whole life of the connection.

use crate::error::{Result, TransportError};
use crate::fabric::{RecvWr, SendOpcode, SendWr};
use crate::memory::{RemoteAddress, Slice};

/// Operation and operands of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkRequestKind<'r> {
    Send {
        local: Slice<'r>,
    },
    Receive {
        local: Slice<'r>,
    },
    Write {
        local: Slice<'r>,
        remote: RemoteAddress,
    },
    WriteWithImmediate {
        local: Slice<'r>,
        remote: RemoteAddress,
        imm: u32,
    },
    Read {
        local: Slice<'r>,
        remote: RemoteAddress,
    },
    FetchAndAdd {
        local: Slice<'r>,
        remote: RemoteAddress,
        add: u64,
    },
    CompareAndSwap {
        local: Slice<'r>,
        remote: RemoteAddress,
        compare: u64,
        swap: u64,
    },
}

impl<'r> WorkRequestKind<'r> {
    pub fn local(&self) -> Slice<'r> {
        match *self {
            WorkRequestKind::Send { local }
            | WorkRequestKind::Receive { local }
            | WorkRequestKind::Write { local, .. }
            | WorkRequestKind::WriteWithImmediate { local, .. }
            | WorkRequestKind::Read { local, .. }
            | WorkRequestKind::FetchAndAdd { local, .. }
            | WorkRequestKind::CompareAndSwap { local, .. } => local,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkRequestKind::Send { .. } => "send",
            WorkRequestKind::Receive { .. } => "receive",
            WorkRequestKind::Write { .. } => "write",
            WorkRequestKind::WriteWithImmediate { .. } => "write-with-immediate",
            WorkRequestKind::Read { .. } => "read",
            WorkRequestKind::FetchAndAdd { .. } => "fetch-and-add",
            WorkRequestKind::CompareAndSwap { .. } => "compare-and-swap",
        }
    }
}

/// A work request ready to post.
///
/// Requests are signaled and not inline unless changed with [`WorkRequest::signaled`]
/// and [`WorkRequest::inline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest<'r> {
    kind: WorkRequestKind<'r>,
    wr_id: u64,
    signaled: bool,
    inline: bool,
}

fn check_atomic(local: &Slice<'_>, remote: &RemoteAddress) -> Result<()> {
    if local.len() != 8 {
        return Err(TransportError::InvalidArgument(format!(
            "atomic operations need an 8-byte local slice, got {} bytes",
            local.len()
        )));
    }
    if remote.addr % 8 != 0 {
        return Err(TransportError::InvalidArgument(format!(
            "atomic target {:#x} is not 8-byte aligned",
            remote.addr
        )));
    }
    Ok(())
}

impl<'r> WorkRequest<'r> {
    fn new(kind: WorkRequestKind<'r>) -> Self {
        Self {
            kind,
            wr_id: 0,
            signaled: true,
            inline: false,
        }
    }

    pub fn send(local: Slice<'r>) -> Self {
        Self::new(WorkRequestKind::Send { local })
    }

    pub fn receive(local: Slice<'r>) -> Self {
        Self::new(WorkRequestKind::Receive { local })
    }

    pub fn write(local: Slice<'r>, remote: RemoteAddress) -> Self {
        Self::new(WorkRequestKind::Write { local, remote })
    }

    pub fn write_with_immediate(local: Slice<'r>, remote: RemoteAddress, imm: u32) -> Self {
        Self::new(WorkRequestKind::WriteWithImmediate { local, remote, imm })
    }

    pub fn read(local: Slice<'r>, remote: RemoteAddress) -> Self {
        Self::new(WorkRequestKind::Read { local, remote })
    }

    /// Adds `add` to the remote word; the old value lands in `local` (8 bytes).
    pub fn fetch_and_add(local: Slice<'r>, remote: RemoteAddress, add: u64) -> Result<Self> {
        check_atomic(&local, &remote)?;
        Ok(Self::new(WorkRequestKind::FetchAndAdd { local, remote, add }))
    }

    /// Swaps the remote word to `swap` if it equals `compare`; the old value lands in
    /// `local` (8 bytes).
    pub fn compare_and_swap(
        local: Slice<'r>,
        remote: RemoteAddress,
        compare: u64,
        swap: u64,
    ) -> Result<Self> {
        check_atomic(&local, &remote)?;
        Ok(Self::new(WorkRequestKind::CompareAndSwap {
            local,
            remote,
            compare,
            swap,
        }))
    }

    /// Sets the identifier echoed in the completion.
    pub fn with_id(mut self, wr_id: u64) -> Self {
        self.wr_id = wr_id;
        self
    }

    pub fn signaled(mut self, signaled: bool) -> Self {
        self.signaled = signaled;
        self
    }

    pub fn set_signaled(&mut self, signaled: bool) {
        self.signaled = signaled;
    }

    /// Requests an inline copy of the payload. Only sends and writes can be inline,
    /// and only up to the queue pair's inline threshold; both are checked at post time.
    pub fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }

    pub fn set_inline(&mut self, inline: bool) {
        self.inline = inline;
    }

    pub fn kind(&self) -> &WorkRequestKind<'r> {
        &self.kind
    }

    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled
    }

    pub fn is_inline(&self) -> bool {
        self.inline
    }

    pub fn is_receive(&self) -> bool {
        matches!(self.kind, WorkRequestKind::Receive { .. })
    }

    /// Whether an inline copy is allowed for this operation.
    pub fn supports_inline(&self) -> bool {
        matches!(
            self.kind,
            WorkRequestKind::Send { .. }
                | WorkRequestKind::Write { .. }
                | WorkRequestKind::WriteWithImmediate { .. }
        )
    }

    pub(crate) fn lower_send(&self) -> Result<SendWr> {
        let mut wr = SendWr {
            wr_id: self.wr_id,
            opcode: SendOpcode::Send,
            sge: self.kind.local().sge(),
            remote_addr: 0,
            rkey: 0,
            imm_data: 0,
            compare_add: 0,
            swap: 0,
            signaled: self.signaled,
            inline: self.inline,
        };
        match self.kind {
            WorkRequestKind::Send { .. } => {}
            WorkRequestKind::Receive { .. } => {
                return Err(TransportError::InvalidArgument(
                    "a receive cannot be posted to the send queue".to_string(),
                ))
            }
            WorkRequestKind::Write { remote, .. } => {
                wr.opcode = SendOpcode::Write;
                wr.remote_addr = remote.addr;
                wr.rkey = remote.rkey;
            }
            WorkRequestKind::WriteWithImmediate { remote, imm, .. } => {
                wr.opcode = SendOpcode::WriteWithImmediate;
                wr.remote_addr = remote.addr;
                wr.rkey = remote.rkey;
                wr.imm_data = imm;
            }
            WorkRequestKind::Read { remote, .. } => {
                wr.opcode = SendOpcode::Read;
                wr.remote_addr = remote.addr;
                wr.rkey = remote.rkey;
            }
            WorkRequestKind::FetchAndAdd { remote, add, .. } => {
                wr.opcode = SendOpcode::FetchAndAdd;
                wr.remote_addr = remote.addr;
                wr.rkey = remote.rkey;
                wr.compare_add = add;
            }
            WorkRequestKind::CompareAndSwap {
                remote,
                compare,
                swap,
                ..
            } => {
                wr.opcode = SendOpcode::CompareAndSwap;
                wr.remote_addr = remote.addr;
                wr.rkey = remote.rkey;
                wr.compare_add = compare;
                wr.swap = swap;
            }
        }
        Ok(wr)
    }

    pub(crate) fn lower_recv(&self) -> Result<RecvWr> {
        match self.kind {
            WorkRequestKind::Receive { local } => Ok(RecvWr {
                wr_id: self.wr_id,
                sge: local.sge(),
            }),
            _ => Err(TransportError::InvalidArgument(format!(
                "a {} cannot be posted to the receive queue",
                self.kind.name()
            ))),
        }
    }
}

/// Requests posted together with one call and executed in order.
#[derive(Debug, Clone, Default)]
pub struct WorkRequestChain<'r> {
    requests: Vec<WorkRequest<'r>>,
}

impl<'r> WorkRequestChain<'r> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, wr: WorkRequest<'r>) -> &mut Self {
        self.requests.push(wr);
        self
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[WorkRequest<'r>] {
        &self.requests
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

impl<'r> FromIterator<WorkRequest<'r>> for WorkRequestChain<'r> {
    fn from_iter<I: IntoIterator<Item = WorkRequest<'r>>>(iter: I) -> Self {
        Self {
            requests: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::context::NetworkContext;
    use crate::fabric::SimNetwork;
    use crate::memory::AccessFlags;

    fn context() -> NetworkContext {
        NetworkContext::open(SimNetwork::new().device(), NetworkConfig::default()).unwrap()
    }

    #[test]
    fn test_defaults_are_signaled_not_inline() {
        let ctx = context();
        let mr = ctx.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        let wr = WorkRequest::send(mr.slice(0, 8).unwrap());
        assert!(wr.is_signaled());
        assert!(!wr.is_inline());
        assert_eq!(wr.wr_id(), 0);
        let wr = wr.with_id(9).signaled(false).inline(true);
        assert_eq!(wr.wr_id(), 9);
        assert!(!wr.is_signaled());
        assert!(wr.is_inline());
    }

    #[test]
    fn test_lowering_write_with_immediate() {
        let ctx = context();
        let mr = ctx.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        let remote = RemoteAddress {
            addr: 0x2000,
            rkey: 77,
        };
        let wr = WorkRequest::write_with_immediate(mr.slice(8, 16).unwrap(), remote, 0xabc)
            .with_id(3)
            .lower_send()
            .unwrap();
        assert_eq!(wr.opcode, SendOpcode::WriteWithImmediate);
        assert_eq!(wr.sge.addr, mr.addr() + 8);
        assert_eq!(wr.sge.length, 16);
        assert_eq!(wr.sge.lkey, mr.lkey());
        assert_eq!(wr.remote_addr, 0x2000);
        assert_eq!(wr.rkey, 77);
        assert_eq!(wr.imm_data, 0xabc);
        assert_eq!(wr.wr_id, 3);
    }

    #[test]
    fn test_receive_lowering_is_one_sided() {
        let ctx = context();
        let mr = ctx.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        let recv = WorkRequest::receive(mr.slice(0, 64).unwrap());
        assert!(recv.lower_send().is_err());
        assert!(recv.lower_recv().is_ok());
        let send = WorkRequest::send(mr.slice(0, 8).unwrap());
        assert!(send.lower_recv().is_err());
    }

    #[test]
    fn test_atomic_preconditions() {
        let ctx = context();
        let mr = ctx.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        let remote = RemoteAddress { addr: 0x1000, rkey: 1 };
        assert!(WorkRequest::fetch_and_add(mr.slice(0, 8).unwrap(), remote, 1).is_ok());
        assert!(WorkRequest::fetch_and_add(mr.slice(0, 4).unwrap(), remote, 1).is_err());
        let misaligned = remote.offset(4);
        assert!(WorkRequest::compare_and_swap(mr.slice(0, 8).unwrap(), misaligned, 0, 1).is_err());
    }

    #[test]
    fn test_chain_preserves_order() {
        let ctx = context();
        let mr = ctx.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        let chain: WorkRequestChain = (0..4)
            .map(|i| WorkRequest::send(mr.slice(i * 8, 8).unwrap()).with_id(i as u64))
            .collect();
        let ids: Vec<u64> = chain.requests().iter().map(|w| w.wr_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
