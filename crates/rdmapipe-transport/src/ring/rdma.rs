//! Ring buffer spanning two hosts.
//!
//! The receiver registers its wraparound buffer for remote write and its read position
//! for remote read. The sender stages each record locally and RDMA-writes it to
//! `write & (capacity - 1)` on the receiver. When its cached view of the peer's read
//! position says a record does not fit, the sender refreshes it with an RDMA read.
//! No message costs a round trip while there is credit.
//!
//! Every `signal_interval`-th write is signaled and waited for, which keeps the send
//! queue from filling with unsignaled requests. In immediate mode each record is
//! announced by write-with-immediate carrying its destination offset, and the receiver
//! consumes receive completions instead of relying on the sentinel alone.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::frame;
use super::wraparound::{self, WraparoundBuffer};
use crate::bootstrap::{self, Bootstrap, Wire};
use crate::completion::{CompletionOpcode, Direction};
use crate::config::{BackoffConfig, RingConfig};
use crate::context::{NetworkContext, QueuePairOptions};
use crate::deadline::{wait_until, Backoff, Deadline};
use crate::error::{Result, TransportError};
use crate::memory::{AccessFlags, MemoryRegion, RemoteMemoryRegion};
use crate::queue_pair::QueuePair;
use crate::transport::{Transport, TransportKind};
use crate::work_request::{WorkRequest, WorkRequestChain};

/// Encoded size of a [`RingDescriptor`].
pub const RING_DESCRIPTOR_WIRE_LEN: usize = 32;

/// Receives posted up front in immediate mode.
const IMMEDIATE_RECEIVE_DEPTH: usize = 128;

/// The whole ring is writable as one range, across the physical end.
const FLAG_LINEAR: u32 = 1;
/// Records are announced with immediate data.
const FLAG_IMMEDIATE: u32 = 1 << 1;

/// What a sender needs to write into a remote ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingDescriptor {
    pub ring: RemoteMemoryRegion,
    /// The receiver's 8-byte read position.
    pub read_position: RemoteMemoryRegion,
    pub capacity: u32,
    pub flags: u32,
}

impl RingDescriptor {
    pub fn is_linear(&self) -> bool {
        self.flags & FLAG_LINEAR != 0
    }

    pub fn is_immediate(&self) -> bool {
        self.flags & FLAG_IMMEDIATE != 0
    }
}

impl Wire for RingDescriptor {
    const WIRE_LEN: usize = RING_DESCRIPTOR_WIRE_LEN;
    const NAME: &'static str = "ring descriptor";
}

fn ring_capacity(config: &RingConfig) -> Result<u32> {
    config.validate()?;
    u32::try_from(config.capacity).map_err(|_| {
        TransportError::Config(format!(
            "RDMA ring capacity {} does not fit 32 bits",
            config.capacity
        ))
    })
}

/// Receiving end: owns the ring memory the peer writes into.
pub struct RdmaRingReceiver<'ctx> {
    ctx: &'ctx NetworkContext,
    qp: Arc<QueuePair<'ctx>>,
    // Regions deregister before the buffer below unmaps.
    ring_mr: MemoryRegion<'ctx>,
    position_mr: MemoryRegion<'ctx>,
    buffer: Box<dyn WraparoundBuffer>,
    read: u64,
    immediate: bool,
    announced: VecDeque<u32>,
    backoff: BackoffConfig,
}

impl<'ctx> RdmaRingReceiver<'ctx> {
    /// Allocates and registers the ring. `qp` must be at least ReadyToReceive when
    /// immediate mode is on, since receives are posted here.
    pub fn new(
        ctx: &'ctx NetworkContext,
        qp: Arc<QueuePair<'ctx>>,
        config: &RingConfig,
    ) -> Result<Self> {
        let capacity = ring_capacity(config)? as usize;
        let buffer = wraparound::for_capacity(capacity)?;
        // SAFETY: `buffer` outlives `ring_mr`, see the field order.
        let ring_mr = unsafe {
            ctx.register_raw(
                buffer.as_ptr(),
                buffer.mapped_len(),
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
            )?
        };
        let position_mr = ctx.allocate(8, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ)?;

        let receiver = Self {
            ctx,
            qp,
            ring_mr,
            position_mr,
            buffer,
            read: 0,
            immediate: config.immediate,
            announced: VecDeque::new(),
            backoff: config.backoff.clone(),
        };
        if receiver.immediate {
            for _ in 0..IMMEDIATE_RECEIVE_DEPTH {
                receiver.post_receive()?;
            }
        }
        debug!(
            capacity,
            linear = receiver.buffer.is_linear(),
            immediate = receiver.immediate,
            "RDMA ring receiver ready"
        );
        Ok(receiver)
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn descriptor(&self) -> RingDescriptor {
        let mut flags = 0;
        if self.buffer.is_linear() {
            flags |= FLAG_LINEAR;
        }
        if self.immediate {
            flags |= FLAG_IMMEDIATE;
        }
        RingDescriptor {
            ring: self.ring_mr.remote(),
            read_position: self.position_mr.remote(),
            capacity: self.buffer.capacity() as u32,
            flags,
        }
    }

    /// The receiver's read position.
    pub fn position(&self) -> u64 {
        self.read
    }

    fn post_receive(&self) -> Result<()> {
        let wr = WorkRequest::receive(self.position_mr.slice(0, 0)?);
        if self.qp.uses_srq() {
            self.ctx.post_shared_receive(&wr)
        } else {
            self.qp.post_receive(&wr)
        }
    }

    /// Collects one write-with-immediate announcement and replaces its receive. Only
    /// completions of this ring's queue pair count; others stay cached for their owners.
    fn poll_announcement(&mut self) -> Result<()> {
        let completions = self.ctx.completions();
        let Some(c) = completions.try_poll_for(Direction::Receive, self.qp.qp_num())? else {
            return Ok(());
        };
        let c = c.into_result()?;
        if c.opcode != CompletionOpcode::ReceiveWithImmediate {
            return Err(TransportError::UnexpectedOpcode {
                expected: CompletionOpcode::ReceiveWithImmediate,
                got: c.opcode,
                wr_id: c.wr_id,
            });
        }
        self.post_receive()?;
        self.announced.push_back(c.imm_data.unwrap_or_default());
        Ok(())
    }

    /// Returns the next message if one has fully arrived.
    pub fn try_receive(&mut self) -> Result<Option<Bytes>> {
        if self.immediate && self.announced.is_empty() {
            self.poll_announcement()?;
            if self.announced.is_empty() {
                return Ok(None);
            }
        }
        let buf = self.buffer.as_ref();
        let Some(len) = frame::peek(buf, self.read)? else {
            return Ok(None);
        };
        if self.immediate {
            let offset = buf.offset(self.read) as u32;
            if self.announced.pop_front() != Some(offset) {
                return Err(TransportError::Codec {
                    what: "ring immediate",
                    reason: format!("record at offset {} was announced out of order", offset),
                });
            }
        }
        let (payload, record) = frame::take(buf, self.read, len)?;
        self.read += record as u64;
        self.position_mr
            .atomic_u64(0)?
            .store(self.read.to_le(), std::sync::atomic::Ordering::Release);
        self.ctx.metrics().message_received(len as u64);
        Ok(Some(payload))
    }

    /// Waits for the next message.
    pub fn receive(&mut self) -> Result<Bytes> {
        self.receive_until(None)
    }

    pub fn receive_until(&mut self, deadline: Option<Deadline>) -> Result<Bytes> {
        let mut backoff = Backoff::new(self.backoff.clone());
        wait_until("rdma ring receive", deadline, &mut backoff, || {
            self.try_receive()
        })
    }
}

impl std::fmt::Debug for RdmaRingReceiver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaRingReceiver")
            .field("qp_num", &self.qp.qp_num())
            .field("capacity", &self.capacity())
            .field("read", &self.read)
            .finish()
    }
}

/// Sending end: stages records and writes them into the peer's ring.
pub struct RdmaRingSender<'ctx> {
    ctx: &'ctx NetworkContext,
    qp: Arc<QueuePair<'ctx>>,
    staging: MemoryRegion<'ctx>,
    credit: MemoryRegion<'ctx>,
    remote: RingDescriptor,
    capacity: u64,
    write: u64,
    peer_read: u64,
    writes: u64,
    signal_interval: u64,
    backoff: BackoffConfig,
}

impl<'ctx> RdmaRingSender<'ctx> {
    /// `qp` must be connected to the queue pair the receiver posts on.
    pub fn new(
        ctx: &'ctx NetworkContext,
        qp: Arc<QueuePair<'ctx>>,
        remote: RingDescriptor,
        config: &RingConfig,
    ) -> Result<Self> {
        config.validate()?;
        let capacity = remote.capacity as usize;
        if capacity < wraparound::MIN_CAPACITY || !capacity.is_power_of_two() {
            return Err(TransportError::Codec {
                what: "ring descriptor",
                reason: format!("capacity {} is not a valid ring size", capacity),
            });
        }
        // Twice the capacity, so a record is always staged contiguously.
        let staging = ctx.allocate(2 * capacity, AccessFlags::LOCAL_WRITE)?;
        let credit = ctx.allocate(8, AccessFlags::LOCAL_WRITE)?;
        Ok(Self {
            ctx,
            qp,
            staging,
            credit,
            remote,
            capacity: capacity as u64,
            write: 0,
            peer_read: 0,
            writes: 0,
            signal_interval: config.signal_interval as u64,
            backoff: config.backoff.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// The sender's write position.
    pub fn position(&self) -> u64 {
        self.write
    }

    /// The peer's read position as last seen.
    pub fn peer_position(&self) -> u64 {
        self.peer_read
    }

    fn blocked(&self, record: usize) -> bool {
        self.write - self.peer_read > self.capacity - record as u64
    }

    /// Reads the peer's read position.
    fn refresh_credit(&mut self) -> Result<()> {
        let wr = WorkRequest::read(self.credit.slice(0, 8)?, self.remote.read_position.at(0));
        self.qp.post(&wr)?;
        self.ctx.completions().poll_blocking_for(
            Direction::Send,
            CompletionOpcode::Read,
            self.qp.qp_num(),
        )?;
        let mut word = [0u8; 8];
        self.credit.read_at(0, &mut word)?;
        self.peer_read = u64::from_le_bytes(word);
        Ok(())
    }

    /// Sends one message if the peer has room, otherwise fails with
    /// [`TransportError::Full`].
    pub fn try_send(&mut self, payload: &[u8]) -> Result<()> {
        let record = frame::check_payload(payload.len(), self.capacity())?;
        if self.blocked(record) {
            self.refresh_credit()?;
            if self.blocked(record) {
                return Err(TransportError::Full {
                    used: self.write - self.peer_read,
                    capacity: self.capacity,
                });
            }
        }
        self.ship(payload, record)
    }

    /// Sends one message, waiting for credit as long as it takes.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.send_until(payload, None)
    }

    pub fn send_until(&mut self, payload: &[u8], deadline: Option<Deadline>) -> Result<()> {
        let record = frame::check_payload(payload.len(), self.capacity())?;
        if self.blocked(record) {
            self.ctx.metrics().inc_flow_control_stalls();
            let mut backoff = Backoff::new(self.backoff.clone());
            let mut warned = false;
            loop {
                self.refresh_credit()?;
                if !self.blocked(record) {
                    break;
                }
                if let Some(d) = &deadline {
                    d.check("rdma ring send")?;
                }
                if backoff.is_sleeping() && !warned {
                    warn!(
                        qp_num = self.qp.qp_num(),
                        in_flight = self.write - self.peer_read,
                        capacity = self.capacity,
                        "RDMA ring sender waiting for credit"
                    );
                    warned = true;
                }
                backoff.snooze();
            }
        }
        self.ship(payload, record)
    }

    fn ship(&mut self, payload: &[u8], record: usize) -> Result<()> {
        let offset = (self.write & (self.capacity - 1)) as usize;
        // Bounds-checks the staging range before it is written through the raw pointer.
        self.staging.slice(offset, record)?;
        // SAFETY: the range is inside the staging region, which only this sender uses.
        // The adapter finished reading it a lap ago: credit proves the peer consumed it.
        let staged =
            unsafe { std::slice::from_raw_parts_mut(self.staging.as_ptr().add(offset), record) };
        frame::encode_into(staged, payload)?;

        self.writes += 1;
        let signaled = self.writes % self.signal_interval == 0;
        let inline = record <= self.qp.max_inline() as usize;
        let imm = self.remote.is_immediate().then_some(offset as u32);
        let fits = offset + record <= self.capacity();

        let mut chain = WorkRequestChain::new();
        let tail = if self.remote.is_linear() || fits {
            (self.staging.slice(offset, record)?, offset)
        } else {
            let first = self.capacity() - offset;
            chain.push(
                WorkRequest::write(
                    self.staging.slice(offset, first)?,
                    self.remote.ring.at(offset as u64),
                )
                .signaled(false)
                .inline(first <= self.qp.max_inline() as usize),
            );
            (self.staging.slice(self.capacity(), record - first)?, 0)
        };
        let (local, at) = tail;
        let last = match imm {
            Some(imm) => {
                WorkRequest::write_with_immediate(local, self.remote.ring.at(at as u64), imm)
            }
            None => WorkRequest::write(local, self.remote.ring.at(at as u64)),
        };
        chain.push(
            last.with_id(self.writes)
                .signaled(signaled)
                .inline(inline && local.len() <= self.qp.max_inline() as usize),
        );
        self.qp.post_chain(&chain)?;
        if signaled {
            self.ctx.completions().poll_blocking_for(
                Direction::Send,
                CompletionOpcode::Write,
                self.qp.qp_num(),
            )?;
        }

        self.write += record as u64;
        self.ctx.metrics().message_sent(payload.len() as u64);
        Ok(())
    }
}

impl std::fmt::Debug for RdmaRingSender<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaRingSender")
            .field("qp_num", &self.qp.qp_num())
            .field("capacity", &self.capacity)
            .field("write", &self.write)
            .field("peer_read", &self.peer_read)
            .finish()
    }
}

/// A bidirectional point-to-point transport made of two RDMA rings on one queue pair.
pub struct RdmaTransport<'ctx> {
    sender: RdmaRingSender<'ctx>,
    receiver: RdmaRingReceiver<'ctx>,
}

impl<'ctx> RdmaTransport<'ctx> {
    /// Creates a queue pair, swaps addresses and ring descriptors over `channel`, and
    /// waits until the peer is ready too. Both sides call this.
    pub async fn connect<B>(
        ctx: &'ctx NetworkContext,
        channel: &mut B,
        config: &RingConfig,
    ) -> Result<Self>
    where
        B: Bootstrap + ?Sized,
    {
        config.validate()?;
        let qp = Arc::new(ctx.create_queue_pair_with(&QueuePairOptions {
            use_srq: false,
            ..Default::default()
        })?);
        let remote = bootstrap::exchange(channel, &qp.address()).await?;
        qp.connect(remote, ctx.config().retry_count)?;

        let receiver = RdmaRingReceiver::new(ctx, qp.clone(), config)?;
        let peer_ring = bootstrap::exchange(channel, &receiver.descriptor()).await?;
        let sender = RdmaRingSender::new(ctx, qp, peer_ring, config)?;
        bootstrap::ready_barrier(channel).await?;

        info!(
            %remote,
            capacity = config.capacity,
            immediate = config.immediate,
            "RDMA ring transport established"
        );
        Ok(Self { sender, receiver })
    }

    pub fn from_parts(sender: RdmaRingSender<'ctx>, receiver: RdmaRingReceiver<'ctx>) -> Self {
        Self { sender, receiver }
    }

    pub fn split(self) -> (RdmaRingSender<'ctx>, RdmaRingReceiver<'ctx>) {
        (self.sender, self.receiver)
    }

    pub fn sender(&mut self) -> &mut RdmaRingSender<'ctx> {
        &mut self.sender
    }

    pub fn receiver(&mut self) -> &mut RdmaRingReceiver<'ctx> {
        &mut self.receiver
    }
}

impl Transport for RdmaTransport<'_> {
    fn kind(&self) -> TransportKind {
        TransportKind::Rdma
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.sender.send(payload)
    }

    fn receive(&mut self) -> Result<Bytes> {
        self.receiver.receive()
    }

    fn try_receive(&mut self) -> Result<Option<Bytes>> {
        self.receiver.try_receive()
    }
}

impl std::fmt::Debug for RdmaTransport<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaTransport")
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::fabric::SimNetwork;

    fn contexts() -> (NetworkContext, NetworkContext) {
        let net = SimNetwork::new();
        let a = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
        let b = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
        (a, b)
    }

    fn own_rq() -> QueuePairOptions {
        QueuePairOptions {
            use_srq: false,
            ..Default::default()
        }
    }

    /// A one-way ring from `a` to `b`.
    fn one_way<'a, 'b>(
        a: &'a NetworkContext,
        b: &'b NetworkContext,
        config: &RingConfig,
    ) -> (RdmaRingSender<'a>, RdmaRingReceiver<'b>) {
        let qa = Arc::new(a.create_queue_pair_with(&own_rq()).unwrap());
        let qb = Arc::new(b.create_queue_pair_with(&own_rq()).unwrap());
        qa.connect(qb.address(), 7).unwrap();
        qb.connect(qa.address(), 7).unwrap();
        let receiver = RdmaRingReceiver::new(b, qb, config).unwrap();
        let sender = RdmaRingSender::new(a, qa, receiver.descriptor(), config).unwrap();
        (sender, receiver)
    }

    fn ring(capacity: usize) -> RingConfig {
        RingConfig {
            capacity,
            ..RingConfig::default()
        }
    }

    #[test]
    fn test_descriptor_wire_length() {
        let d = RingDescriptor {
            ring: RemoteMemoryRegion { addr: 1, rkey: 2 },
            read_position: RemoteMemoryRegion { addr: 3, rkey: 4 },
            capacity: 4096,
            flags: FLAG_LINEAR,
        };
        let bytes = d.encode().unwrap();
        assert_eq!(bytes.len(), RING_DESCRIPTOR_WIRE_LEN);
        assert_eq!(RingDescriptor::decode(&bytes).unwrap(), d);
    }

    #[test]
    fn test_messages_arrive_in_order() {
        let (a, b) = contexts();
        let (mut tx, mut rx) = one_way(&a, &b, &ring(4096));
        for i in 0..50u32 {
            tx.send(format!("message {}", i).as_bytes()).unwrap();
            assert_eq!(rx.receive().unwrap(), format!("message {}", i).as_bytes());
        }
        assert_eq!(a.metrics().snapshot().messages_sent, 50);
        assert_eq!(b.metrics().snapshot().messages_received, 50);
    }

    #[test]
    fn test_exactly_full_write_permitted() {
        let (a, b) = contexts();
        let (mut tx, mut rx) = one_way(&a, &b, &ring(1024));
        // 1008 bytes of payload make a 1024-byte record: write - read == capacity.
        tx.try_send(&[3u8; 1008]).unwrap();
        assert!(matches!(tx.try_send(b"x"), Err(TransportError::Full { used: 1024, .. })));
        assert_eq!(rx.receive().unwrap().len(), 1008);
        tx.try_send(b"x").unwrap();
        assert_eq!(&rx.receive().unwrap()[..], b"x");
    }

    #[test]
    fn test_small_ring_stalls_until_reader_consumes() {
        let (a, b) = contexts();
        let (mut tx, mut rx) = one_way(&a, &b, &ring(1024));
        let msg = [0x5au8; 200];
        for _ in 0..4 {
            tx.try_send(&msg).unwrap();
        }
        assert!(matches!(tx.try_send(&msg), Err(TransportError::Full { .. })));
        rx.receive().unwrap();
        tx.try_send(&msg).unwrap();
        // The fifth record crossed the physical end of the split-copy ring.
        for _ in 0..4 {
            assert_eq!(rx.receive().unwrap(), &msg[..]);
        }
        assert_eq!(tx.position(), rx.position());
    }

    #[test]
    fn test_records_wrap_many_times() {
        let (a, b) = contexts();
        let (mut tx, mut rx) = one_way(&a, &b, &ring(4096));
        for i in 0..500usize {
            let msg = vec![(i % 251) as u8; 1 + i % 300];
            tx.send(&msg).unwrap();
            assert_eq!(rx.receive().unwrap(), msg);
        }
        assert!(tx.position() > 10 * 4096);
    }

    #[test]
    fn test_immediate_mode() {
        let (a, b) = contexts();
        let config = RingConfig {
            capacity: 1024,
            immediate: true,
            ..RingConfig::default()
        };
        let (mut tx, mut rx) = one_way(&a, &b, &config);
        assert!(rx.descriptor().is_immediate());
        for i in 0..20u8 {
            tx.send(&[i; 100]).unwrap();
            assert_eq!(rx.receive().unwrap(), &[i; 100][..]);
        }
        assert!(rx.try_receive().unwrap().is_none());
    }

    #[test]
    fn test_rings_sharing_a_context_keep_their_announcements() {
        let (a, b) = contexts();
        let config = RingConfig {
            capacity: 1024,
            immediate: true,
            ..RingConfig::default()
        };
        let (mut tx1, mut rx1) = one_way(&a, &b, &config);
        let (mut tx2, mut rx2) = one_way(&a, &b, &config);

        tx2.send(b"for the second ring").unwrap();
        // The first ring dequeues the second ring's announcement and must leave it.
        assert!(rx1.try_receive().unwrap().is_none());
        assert_eq!(b.completions().cached_len(), 1);
        let deadline = Deadline::after(std::time::Duration::from_secs(5));
        assert_eq!(
            &rx2.receive_until(Some(deadline)).unwrap()[..],
            b"for the second ring"
        );
        assert_eq!(rx1.position(), 0);

        for i in 0..10u8 {
            tx1.send(&[i; 40]).unwrap();
            tx2.send(&[i; 60]).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(rx2.receive().unwrap(), &[i; 60][..]);
        }
        for i in 0..10u8 {
            assert_eq!(rx1.receive().unwrap(), &[i; 40][..]);
        }
        assert!(rx1.try_receive().unwrap().is_none());
        assert!(rx2.try_receive().unwrap().is_none());
    }

    #[test]
    fn test_selective_signaling_keeps_delivery() {
        let (a, b) = contexts();
        let config = RingConfig {
            capacity: 4096,
            signal_interval: 3,
            ..RingConfig::default()
        };
        let (mut tx, mut rx) = one_way(&a, &b, &config);
        for i in 0..10u8 {
            tx.send(&[i; 16]).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(rx.receive().unwrap(), &[i; 16][..]);
        }
        let snap = a.metrics().snapshot();
        // Writes 3, 6 and 9 were signaled; the ring never ran short of credit.
        assert_eq!(snap.signaled_requests, 3);
        assert_eq!(snap.unsignaled_requests, 7);
        assert_eq!(a.completions().cached_len(), 0);
    }

    #[tokio::test]
    async fn test_transport_connect_over_duplex() {
        let net = SimNetwork::new();
        let (mut ca, mut cb) = tokio::io::duplex(256);
        let config = ring(4096);

        let peer = {
            let net = net.clone();
            let config = config.clone();
            std::thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                let ctx = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
                let mut t = rt
                    .block_on(RdmaTransport::connect(&ctx, &mut cb, &config))
                    .unwrap();
                let msg = t.receive().unwrap();
                t.send(&msg).unwrap();
            })
        };

        let ctx = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
        let mut t = RdmaTransport::connect(&ctx, &mut ca, &config).await.unwrap();
        assert_eq!(t.kind(), TransportKind::Rdma);
        t.send(b"echo me").unwrap();
        assert_eq!(&t.receive().unwrap()[..], b"echo me");
        peer.join().unwrap();
    }
}
