//! Client side of the multiclient transport.

use bytes::Bytes;
use tracing::info;

use super::doorbell::RUNG;
use super::{slot_peek, slot_stage, slot_take, ClientSlots, ServerSlots};
use crate::bootstrap::{self, Bootstrap};
use crate::completion::{CompletionOpcode, Direction};
use crate::config::{BackoffConfig, MulticlientConfig, MultiplexMode};
use crate::context::{NetworkContext, QueuePairOptions};
use crate::deadline::{wait_until, Backoff, Deadline};
use crate::error::{Result, TransportError};
use crate::memory::{AccessFlags, MemoryRegion};
use crate::queue_pair::QueuePair;
use crate::transport::{Transport, TransportKind};
use crate::work_request::{WorkRequest, WorkRequestChain};

/// One client of a [`MulticlientServer`](super::MulticlientServer).
pub struct MulticlientClient<'ctx> {
    ctx: &'ctx NetworkContext,
    qp: QueuePair<'ctx>,
    /// Request staging; the byte after the slot is the doorbell value.
    staging: MemoryRegion<'ctx>,
    response: MemoryRegion<'ctx>,
    slots: ServerSlots,
    slot_size: usize,
    outstanding: bool,
    sends: u64,
    signal_interval: u64,
    backoff: BackoffConfig,
}

impl<'ctx> MulticlientClient<'ctx> {
    /// Runs the client side of the handshake. The slot size and multiplex mode come
    /// from the server; `config` supplies the signal interval.
    pub async fn connect<B>(
        ctx: &'ctx NetworkContext,
        channel: &mut B,
        config: &MulticlientConfig,
    ) -> Result<Self>
    where
        B: Bootstrap + ?Sized,
    {
        config.validate()?;
        let qp = ctx.create_queue_pair_with(&QueuePairOptions {
            use_srq: false,
            ..Default::default()
        })?;
        let remote = bootstrap::exchange(channel, &qp.address()).await?;
        qp.connect(remote, ctx.config().retry_count)?;

        let slots: ServerSlots = bootstrap::recv(channel).await?;
        let slot_size = slots.slot_size as usize;
        if slot_size < 16 || slot_size % 8 != 0 {
            return Err(TransportError::Codec {
                what: "server slots",
                reason: format!("slot size {} is not usable", slot_size),
            });
        }
        let staging = ctx.allocate(slot_size + 8, AccessFlags::LOCAL_WRITE)?;
        staging.write_at(slot_size, &[RUNG])?;
        let response = ctx.allocate(slot_size, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE)?;
        let ours = ClientSlots {
            response_slot: response.remote(),
        };
        bootstrap::send(channel, &ours).await?;
        bootstrap::ready_barrier(channel).await?;

        info!(
            %remote,
            client = slots.client_index,
            mode = ?slots.mode,
            "multiclient client connected"
        );
        Ok(Self {
            ctx,
            qp,
            staging,
            response,
            slots,
            slot_size,
            outstanding: false,
            sends: 0,
            signal_interval: config.signal_interval as u64,
            backoff: ctx.config().backoff.clone(),
        })
    }

    /// The index the server knows this client by.
    pub fn index(&self) -> usize {
        self.slots.client_index as usize
    }

    pub fn mode(&self) -> MultiplexMode {
        self.slots.mode
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Whether a request is waiting for its answer.
    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    /// Sends one request. Only one request may be outstanding.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.outstanding {
            return Err(TransportError::InvalidArgument(
                "a multiclient request is already outstanding".to_string(),
            ));
        }
        let record = slot_stage(&self.staging, 0, self.slot_size, payload)?;
        self.sends += 1;
        let signaled = self.sends % self.signal_interval == 0;
        let max_inline = self.qp.max_inline() as usize;

        let expected = match self.slots.mode {
            MultiplexMode::Doorbell => {
                let mut chain = WorkRequestChain::new();
                chain
                    .push(
                        WorkRequest::write(
                            self.staging.slice(0, record)?,
                            self.slots.request_slot.at(0),
                        )
                        .signaled(false)
                        .inline(record <= max_inline),
                    )
                    .push(
                        WorkRequest::write(
                            self.staging.slice(self.slot_size, 1)?,
                            self.slots.doorbell.at(0),
                        )
                        .with_id(self.sends)
                        .signaled(signaled)
                        .inline(true),
                    );
                self.qp.post_chain(&chain)?;
                CompletionOpcode::Write
            }
            MultiplexMode::ReceiveQueue => {
                let wr = WorkRequest::send(self.staging.slice(0, record)?)
                    .with_id(self.sends)
                    .signaled(signaled)
                    .inline(record <= max_inline);
                self.qp.post(&wr)?;
                CompletionOpcode::Send
            }
        };
        if signaled {
            self.ctx
                .completions()
                .poll_blocking(Direction::Send, expected)?;
        }
        self.outstanding = true;
        self.ctx.metrics().message_sent(payload.len() as u64);
        Ok(())
    }

    /// Returns the answer if it has arrived.
    pub fn try_receive(&mut self) -> Result<Option<Bytes>> {
        let Some(len) = slot_peek(&self.response, 0, self.slot_size)? else {
            return Ok(None);
        };
        let payload = slot_take(&self.response, 0, len)?;
        self.outstanding = false;
        self.ctx.metrics().message_received(len as u64);
        Ok(Some(payload))
    }

    /// Waits for the answer.
    pub fn receive(&mut self) -> Result<Bytes> {
        self.receive_until(None)
    }

    pub fn receive_until(&mut self, deadline: Option<Deadline>) -> Result<Bytes> {
        let mut backoff = Backoff::new(self.backoff.clone());
        wait_until("multiclient answer", deadline, &mut backoff, || {
            self.try_receive()
        })
    }

    /// Sends a request and waits for its answer.
    pub fn request(&mut self, payload: &[u8]) -> Result<Bytes> {
        self.send(payload)?;
        self.receive()
    }
}

impl Transport for MulticlientClient<'_> {
    fn kind(&self) -> TransportKind {
        TransportKind::Multiclient
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        MulticlientClient::send(self, payload)
    }

    fn receive(&mut self) -> Result<Bytes> {
        MulticlientClient::receive(self)
    }

    fn try_receive(&mut self) -> Result<Option<Bytes>> {
        MulticlientClient::try_receive(self)
    }
}

impl std::fmt::Debug for MulticlientClient<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticlientClient")
            .field("index", &self.slots.client_index)
            .field("mode", &self.slots.mode)
            .field("qp_num", &self.qp.qp_num())
            .field("outstanding", &self.outstanding)
            .finish()
    }
}
