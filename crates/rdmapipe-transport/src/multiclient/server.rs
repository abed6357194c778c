//! Server side of the multiclient transport.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, info, trace};

use super::doorbell::DoorbellArray;
use super::{slot_peek, slot_stage, slot_take, ClientSlots, ServerSlots};
use crate::address::Address;
use crate::bootstrap::{self, Bootstrap};
use crate::completion::{CompletionOpcode, Direction};
use crate::config::{BackoffConfig, MulticlientConfig, MultiplexMode};
use crate::context::{NetworkContext, QueuePairOptions};
use crate::deadline::{wait_until, Backoff, Deadline};
use crate::error::{Result, TransportError};
use crate::memory::{AccessFlags, MemoryRegion, RemoteAddress, RemoteMemoryRegion};
use crate::queue_pair::QueuePair;
use crate::work_request::WorkRequest;

/// Request slots per client in receive-queue mode. One stays posted while the other
/// is read.
const RECEIVE_HALVES: usize = 2;

/// One accepted client.
pub struct Connection<'ctx> {
    index: usize,
    qp: QueuePair<'ctx>,
    /// Where answers land on the client.
    answer_to: RemoteAddress,
    sends: u64,
    // Kept open for the life of the connection; the peer sees it close on drop.
    _channel: Box<dyn Bootstrap>,
}

impl<'ctx> Connection<'ctx> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn qp_num(&self) -> u32 {
        self.qp.qp_num()
    }

    pub fn remote(&self) -> Option<Address> {
        self.qp.remote()
    }

    /// Answers sent to this client so far.
    pub fn sends(&self) -> u64 {
        self.sends
    }
}

impl std::fmt::Debug for Connection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("qp_num", &self.qp.qp_num())
            .field("sends", &self.sends)
            .finish()
    }
}

/// Accepts clients and serves one request at a time per client.
pub struct MulticlientServer<'ctx> {
    ctx: &'ctx NetworkContext,
    config: MulticlientConfig,
    // Queue pairs are destroyed before the regions they may still reference.
    connections: Vec<Connection<'ctx>>,
    by_qp: HashMap<u32, usize>,
    doorbells: Option<DoorbellArray<'ctx>>,
    requests: MemoryRegion<'ctx>,
    answers: MemoryRegion<'ctx>,
    hits: Vec<usize>,
    ready: VecDeque<usize>,
    backoff: BackoffConfig,
}

impl<'ctx> MulticlientServer<'ctx> {
    /// Registers request slots for `config.max_clients` clients, the doorbell array in
    /// doorbell mode, and the shared answer buffer.
    pub fn new(ctx: &'ctx NetworkContext, config: &MulticlientConfig) -> Result<Self> {
        config.validate()?;
        let slots_per_client = match config.mode {
            MultiplexMode::Doorbell => 1,
            MultiplexMode::ReceiveQueue => RECEIVE_HALVES,
        };
        let request_len = config.max_clients * config.slot_size * slots_per_client;
        let requests = ctx.allocate(
            request_len,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        )?;
        let answers = ctx.allocate(
            config.max_clients * config.slot_size,
            AccessFlags::LOCAL_WRITE,
        )?;
        let doorbells = match config.mode {
            MultiplexMode::Doorbell => Some(DoorbellArray::new(ctx, config.max_clients)?),
            MultiplexMode::ReceiveQueue => None,
        };
        debug!(
            max_clients = config.max_clients,
            slot_size = config.slot_size,
            mode = ?config.mode,
            "multiclient server ready"
        );
        Ok(Self {
            ctx,
            config: config.clone(),
            connections: Vec::new(),
            by_qp: HashMap::new(),
            doorbells,
            requests,
            answers,
            hits: Vec::with_capacity(config.max_clients),
            ready: VecDeque::new(),
            backoff: ctx.config().backoff.clone(),
        })
    }

    pub fn mode(&self) -> MultiplexMode {
        self.config.mode
    }

    pub fn client_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, client: usize) -> Result<&Connection<'ctx>> {
        self.connections
            .get(client)
            .ok_or(TransportError::UnknownClient(client))
    }

    fn request_base(&self, client: usize, half: usize) -> usize {
        match self.config.mode {
            MultiplexMode::Doorbell => client * self.config.slot_size,
            MultiplexMode::ReceiveQueue => {
                (client * RECEIVE_HALVES + half) * self.config.slot_size
            }
        }
    }

    fn post_request_receive(&self, client: usize, half: usize) -> Result<()> {
        let base = self.request_base(client, half);
        let wr = WorkRequest::receive(self.requests.slice(base, self.config.slot_size)?)
            .with_id(((client as u64) << 1) | half as u64);
        self.connections[client].qp.post_receive(&wr)
    }

    /// Runs the server side of the handshake on `channel` and returns the new client's
    /// index. The channel is kept until the server is dropped.
    pub async fn accept<B>(&mut self, mut channel: B) -> Result<usize>
    where
        B: Bootstrap + 'static,
    {
        let index = self.connections.len();
        if index >= self.config.max_clients {
            return Err(TransportError::from_errno("multiclient accept", libc::EMFILE));
        }

        let qp = self.ctx.create_queue_pair_with(&QueuePairOptions {
            use_srq: false,
            ..Default::default()
        })?;
        let remote = bootstrap::exchange(&mut channel, &qp.address()).await?;
        qp.connect(remote, self.ctx.config().retry_count)?;

        let (request_slot, doorbell) = match &self.doorbells {
            Some(bells) => {
                let region = self.requests.remote();
                let slot = RemoteMemoryRegion {
                    addr: region.addr + self.request_base(index, 0) as u64,
                    rkey: region.rkey,
                };
                (slot, bells.remote_cell(index)?)
            }
            None => {
                let wr = WorkRequest::receive(
                    self.requests
                        .slice(self.request_base(index, 0), self.config.slot_size)?,
                )
                .with_id((index as u64) << 1);
                qp.post_receive(&wr)?;
                (RemoteMemoryRegion::default(), RemoteMemoryRegion::default())
            }
        };

        let ours = ServerSlots {
            request_slot,
            doorbell,
            client_index: index as u32,
            slot_size: self.config.slot_size as u32,
            mode: self.config.mode,
        };
        bootstrap::send(&mut channel, &ours).await?;
        let theirs: ClientSlots = bootstrap::recv(&mut channel).await?;
        bootstrap::ready_barrier(&mut channel).await?;

        self.by_qp.insert(qp.qp_num(), index);
        self.connections.push(Connection {
            index,
            qp,
            answer_to: theirs.response_slot.at(0),
            sends: 0,
            _channel: Box::new(channel),
        });
        info!(client = index, %remote, mode = ?self.config.mode, "multiclient client accepted");
        Ok(index)
    }

    /// Returns the next request if one has arrived, with the index of its client.
    pub fn poll(&mut self) -> Result<Option<(usize, Bytes)>> {
        match self.config.mode {
            MultiplexMode::Doorbell => self.poll_doorbells(),
            MultiplexMode::ReceiveQueue => self.poll_receive_queue(),
        }
    }

    /// Collects every request that has arrived into `out`, returning how many.
    pub fn poll_many(&mut self, out: &mut Vec<(usize, Bytes)>) -> Result<usize> {
        let before = out.len();
        while let Some(request) = self.poll()? {
            out.push(request);
            if self.ready.is_empty() && self.config.mode == MultiplexMode::Doorbell {
                break;
            }
        }
        Ok(out.len() - before)
    }

    /// Waits for the next request.
    pub fn receive(&mut self) -> Result<(usize, Bytes)> {
        self.receive_until(None)
    }

    pub fn receive_until(&mut self, deadline: Option<Deadline>) -> Result<(usize, Bytes)> {
        let mut backoff = Backoff::new(self.backoff.clone());
        wait_until("multiclient receive", deadline, &mut backoff, || self.poll())
    }

    fn poll_doorbells(&mut self) -> Result<Option<(usize, Bytes)>> {
        let Some(bells) = self.doorbells.as_ref() else {
            return Ok(None);
        };
        if self.ready.is_empty() {
            self.hits.clear();
            let n = bells.scan(&mut self.hits);
            let metrics = self.ctx.metrics();
            metrics.inc_doorbell_scans();
            if n == 0 {
                return Ok(None);
            }
            metrics.add_doorbell_hits(n as u64);
            for &client in &self.hits {
                bells.clear(client)?;
                self.ready.push_back(client);
            }
            trace!(hits = n, "doorbell scan");
        }
        let Some(client) = self.ready.pop_front() else {
            return Ok(None);
        };
        let slot = self.config.slot_size;
        let base = client * slot;
        // The doorbell write follows the request write on the same queue pair, so the
        // record is complete or about to be.
        let mut backoff = Backoff::new(self.backoff.clone());
        let requests = &self.requests;
        let len = wait_until("multiclient slot", None, &mut backoff, || {
            slot_peek(requests, base, slot)
        })?;
        let payload = slot_take(&self.requests, base, len)?;
        self.ctx.metrics().message_received(len as u64);
        Ok(Some((client, payload)))
    }

    fn poll_receive_queue(&mut self) -> Result<Option<(usize, Bytes)>> {
        let Some(c) = self.ctx.completions().try_poll(Direction::Receive)? else {
            return Ok(None);
        };
        let c = c.into_result()?;
        if c.opcode != CompletionOpcode::Receive {
            return Err(TransportError::UnexpectedOpcode {
                expected: CompletionOpcode::Receive,
                got: c.opcode,
                wr_id: c.wr_id,
            });
        }
        let client = *self.by_qp.get(&c.qp_num).ok_or_else(|| TransportError::Codec {
            what: "receive completion",
            reason: format!("queue pair {} belongs to no client", c.qp_num),
        })?;
        if (c.wr_id >> 1) as usize != client {
            return Err(TransportError::Codec {
                what: "receive completion",
                reason: format!("wr_id {:#x} on the queue pair of client {}", c.wr_id, client),
            });
        }
        let half = (c.wr_id & 1) as usize;
        // The next request may land while this one is read.
        self.post_request_receive(client, half ^ 1)?;

        let slot = self.config.slot_size;
        let base = self.request_base(client, half);
        let Some(len) = slot_peek(&self.requests, base, slot)? else {
            return Err(TransportError::Codec {
                what: "receive completion",
                reason: format!("{} bytes from client {} hold no complete record", c.byte_len, client),
            });
        };
        let payload = slot_take(&self.requests, base, len)?;
        self.ctx.metrics().message_received(len as u64);
        Ok(Some((client, payload)))
    }

    /// Writes an answer into `client`'s response slot.
    pub fn respond(&mut self, client: usize, payload: &[u8]) -> Result<()> {
        let slot = self.config.slot_size;
        let interval = self.config.signal_interval as u64;
        let conn = self
            .connections
            .get_mut(client)
            .ok_or(TransportError::UnknownClient(client))?;
        let base = client * slot;
        let record = slot_stage(&self.answers, base, slot, payload)?;

        conn.sends += 1;
        let signaled = conn.sends % interval == 0;
        let wr = WorkRequest::write(self.answers.slice(base, record)?, conn.answer_to)
            .with_id(conn.sends)
            .signaled(signaled)
            .inline(record <= conn.qp.max_inline() as usize);
        conn.qp.post(&wr)?;
        if signaled {
            self.ctx
                .completions()
                .poll_blocking(Direction::Send, CompletionOpcode::Write)?;
        }
        self.ctx.metrics().message_sent(payload.len() as u64);
        Ok(())
    }
}

impl std::fmt::Debug for MulticlientServer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticlientServer")
            .field("mode", &self.config.mode)
            .field("clients", &self.connections.len())
            .field("max_clients", &self.config.max_clients)
            .finish()
    }
}
