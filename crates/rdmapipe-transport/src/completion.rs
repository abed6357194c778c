//! Completion queue polling and directional waits.
//!
//! A [`CompletionQueuePair`] wraps the context's shared send and receive completion
//! queues. Two ways to wait:
//!
//! - [`CompletionQueuePair::poll_blocking`] busy-polls one queue for one completion of
//!   an expected kind.
//! - [`CompletionQueuePair::wait_for_completion`] parks on the completion channel. Each
//!   wakeup drains both queues, returns the first completion that satisfies the
//!   request and caches the rest by direction.
//!
//! Both check the cache before touching the hardware, so a completion is handed out
//! exactly once whichever path dequeued it. Only one thread at a time should block in
//! `wait_for_completion`.
//!
//! Every completion dequeued with a non-success status marks its queue pair as failed.
//! [`QueuePair::state`](crate::QueuePair::state) reports such a pair as Error.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::config::BackoffConfig;
use crate::deadline::{wait_until, Backoff, Deadline};
use crate::error::{Result, TransportError};
use crate::fabric::{CompletionStatus, CqHandle, Fabric, SendOpcode, WorkCompletion};
use crate::metrics::TransportMetrics;

const DRAIN_BATCH: usize = 32;

/// The kind of work request a completion belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionOpcode {
    /// Two-sided send.
    #[default]
    Send,
    /// One-sided write, with or without immediate data.
    Write,
    /// One-sided read.
    Read,
    /// Remote compare-and-swap.
    CompareAndSwap,
    /// Remote fetch-and-add.
    FetchAndAdd,
    /// A posted receive consumed by a send.
    Receive,
    /// A posted receive consumed by a write-with-immediate.
    ReceiveWithImmediate,
}

impl CompletionOpcode {
    /// The completion queue this kind of completion is reported on.
    pub fn direction(self) -> Direction {
        match self {
            CompletionOpcode::Receive | CompletionOpcode::ReceiveWithImmediate => {
                Direction::Receive
            }
            _ => Direction::Send,
        }
    }
}

impl From<SendOpcode> for CompletionOpcode {
    fn from(op: SendOpcode) -> Self {
        match op {
            SendOpcode::Send => CompletionOpcode::Send,
            SendOpcode::Write | SendOpcode::WriteWithImmediate => CompletionOpcode::Write,
            SendOpcode::Read => CompletionOpcode::Read,
            SendOpcode::FetchAndAdd => CompletionOpcode::FetchAndAdd,
            SendOpcode::CompareAndSwap => CompletionOpcode::CompareAndSwap,
        }
    }
}

/// Which completion queue a completion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// The send completion queue: sends, writes, reads and atomics.
    Send,
    /// The receive completion queue.
    Receive,
}

/// A dequeued completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Queue it was dequeued from.
    pub direction: Direction,
    /// Kind of the completed request.
    pub opcode: CompletionOpcode,
    /// Identifier given to the work request.
    pub wr_id: u64,
    /// Hardware status.
    pub status: CompletionStatus,
    /// Bytes received. Only meaningful for receives.
    pub byte_len: u32,
    /// Immediate data of a write-with-immediate, host order.
    pub imm_data: Option<u32>,
    /// Queue pair the request was posted on or received by.
    pub qp_num: u32,
}

impl Completion {
    fn from_work(direction: Direction, wc: WorkCompletion) -> Self {
        // The opcode of a failed completion is undefined; derive it from the queue.
        let opcode = if wc.status == CompletionStatus::Success {
            wc.opcode
        } else if direction == Direction::Receive {
            CompletionOpcode::Receive
        } else {
            wc.opcode
        };
        Self {
            direction,
            opcode,
            wr_id: wc.wr_id,
            status: wc.status,
            byte_len: wc.byte_len,
            imm_data: wc.imm_data,
            qp_num: wc.qp_num,
        }
    }

    /// Whether the request completed without error.
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }

    /// Converts a non-success status into [`TransportError::CompletionFailed`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::CompletionFailed {
                status: self.status,
                wr_id: self.wr_id,
                qp_num: self.qp_num,
            })
        }
    }
}

#[derive(Default)]
struct CompletionCache {
    send: VecDeque<Completion>,
    receive: VecDeque<Completion>,
}

impl CompletionCache {
    fn queue(&mut self, direction: Direction) -> &mut VecDeque<Completion> {
        match direction {
            Direction::Send => &mut self.send,
            Direction::Receive => &mut self.receive,
        }
    }
}

/// The shared send and receive completion queues of a context.
pub struct CompletionQueuePair {
    fabric: Arc<dyn Fabric>,
    send_cq: CqHandle,
    recv_cq: CqHandle,
    cache: Mutex<CompletionCache>,
    cached: AtomicUsize,
    failed: Mutex<HashSet<u32>>,
    failures: AtomicUsize,
    backoff: BackoffConfig,
    metrics: Arc<TransportMetrics>,
}

impl CompletionQueuePair {
    pub(crate) fn new(
        fabric: Arc<dyn Fabric>,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        backoff: BackoffConfig,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        Self {
            fabric,
            send_cq,
            recv_cq,
            cache: Mutex::new(CompletionCache::default()),
            cached: AtomicUsize::new(0),
            failed: Mutex::new(HashSet::new()),
            failures: AtomicUsize::new(0),
            backoff,
            metrics,
        }
    }

    /// The completion queue for `direction`.
    pub fn cq(&self, direction: Direction) -> CqHandle {
        match direction {
            Direction::Send => self.send_cq,
            Direction::Receive => self.recv_cq,
        }
    }

    /// Number of completions currently parked in the cache.
    pub fn cached_len(&self) -> usize {
        self.cached.load(Ordering::Acquire)
    }

    /// Whether a completion for `qp_num` has come back with an error status.
    pub fn has_failed(&self, qp_num: u32) -> bool {
        self.failures.load(Ordering::Acquire) != 0 && self.failed.lock().contains(&qp_num)
    }

    /// Drops the failure record of a destroyed queue pair, whose number may be reused.
    pub(crate) fn forget(&self, qp_num: u32) {
        if self.failures.load(Ordering::Acquire) == 0 {
            return;
        }
        if self.failed.lock().remove(&qp_num) {
            self.failures.fetch_sub(1, Ordering::Release);
        }
    }

    /// Records the failure of a freshly dequeued completion's queue pair.
    fn observe(&self, c: Completion) -> Completion {
        if !c.is_success() && self.failed.lock().insert(c.qp_num) {
            self.failures.fetch_add(1, Ordering::Release);
            warn!(
                qp_num = c.qp_num,
                wr_id = c.wr_id,
                status = ?c.status,
                "queue pair entered the error state"
            );
        }
        c
    }

    fn take_cached(&self, restrict: Option<Direction>) -> Option<Completion> {
        if self.cached.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut cache = self.cache.lock();
        let c = match restrict {
            Some(d) => cache.queue(d).pop_front(),
            None => cache
                .send
                .pop_front()
                .or_else(|| cache.receive.pop_front()),
        };
        if c.is_some() {
            self.cached.fetch_sub(1, Ordering::Release);
        }
        c
    }

    fn take_cached_for(&self, direction: Direction, qp_num: u32) -> Option<Completion> {
        if self.cached.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut cache = self.cache.lock();
        let queue = cache.queue(direction);
        let index = queue.iter().position(|c| c.qp_num == qp_num)?;
        let c = queue.remove(index);
        if c.is_some() {
            self.cached.fetch_sub(1, Ordering::Release);
        }
        c
    }

    fn stash(&self, completions: Vec<Completion>) {
        if completions.is_empty() {
            return;
        }
        let n = completions.len();
        let mut cache = self.cache.lock();
        for c in completions {
            cache.queue(c.direction).push_back(c);
        }
        self.cached.fetch_add(n, Ordering::Release);
        self.metrics.add_completions_cached(n as u64);
        trace!(n, "cached completions");
    }

    fn checked(&self, c: Completion) -> Result<Completion> {
        if !c.is_success() {
            self.metrics.inc_completion_errors();
        }
        c.into_result()
    }

    /// Returns one completion from `direction` if one is ready. The status is not
    /// checked.
    pub fn try_poll(&self, direction: Direction) -> Result<Option<Completion>> {
        if let Some(c) = self.take_cached(Some(direction)) {
            return Ok(Some(c));
        }
        let mut wc = [WorkCompletion::default(); 1];
        let n = self.fabric.poll_cq(self.cq(direction), &mut wc)?;
        Ok((n == 1).then(|| self.observe(Completion::from_work(direction, wc[0]))))
    }

    /// Returns one completion from `direction` that belongs to `qp_num`, if one is
    /// ready. Completions of other queue pairs dequeued on the way are cached for their
    /// owners. The status is not checked.
    pub fn try_poll_for(&self, direction: Direction, qp_num: u32) -> Result<Option<Completion>> {
        if let Some(c) = self.take_cached_for(direction, qp_num) {
            return Ok(Some(c));
        }
        let mut raw = [WorkCompletion::default(); DRAIN_BATCH];
        let n = self.fabric.poll_cq(self.cq(direction), &mut raw)?;
        let mut picked = None;
        let mut rest = Vec::new();
        for wc in &raw[..n] {
            let c = self.observe(Completion::from_work(direction, *wc));
            if picked.is_none() && c.qp_num == qp_num {
                picked = Some(c);
            } else {
                rest.push(c);
            }
        }
        self.stash(rest);
        Ok(picked)
    }

    /// Moves up to `out.len()` ready completions from `direction` into `out`, returning
    /// how many were written. Statuses are not checked.
    pub fn poll_many(&self, direction: Direction, out: &mut [Completion]) -> Result<usize> {
        let mut n = 0;
        while n < out.len() {
            match self.take_cached(Some(direction)) {
                Some(c) => {
                    out[n] = c;
                    n += 1;
                }
                None => break,
            }
        }
        let mut raw = [WorkCompletion::default(); DRAIN_BATCH];
        while n < out.len() {
            let want = (out.len() - n).min(DRAIN_BATCH);
            let got = self.fabric.poll_cq(self.cq(direction), &mut raw[..want])?;
            for wc in &raw[..got] {
                out[n] = self.observe(Completion::from_work(direction, *wc));
                n += 1;
            }
            if got < want {
                break;
            }
        }
        Ok(n)
    }

    /// Busy-polls `direction` for one completion, which must succeed and carry
    /// `expected`.
    pub fn poll_blocking(
        &self,
        direction: Direction,
        expected: CompletionOpcode,
    ) -> Result<Completion> {
        self.poll_blocking_until(direction, expected, None)
    }

    /// [`poll_blocking`](Self::poll_blocking) with an optional deadline.
    pub fn poll_blocking_until(
        &self,
        direction: Direction,
        expected: CompletionOpcode,
        deadline: Option<Deadline>,
    ) -> Result<Completion> {
        let mut backoff = Backoff::new(self.backoff.clone());
        let c = wait_until("poll_blocking", deadline, &mut backoff, || {
            self.try_poll(direction)
        })?;
        let c = self.checked(c)?;
        if c.opcode != expected {
            return Err(TransportError::UnexpectedOpcode {
                expected,
                got: c.opcode,
                wr_id: c.wr_id,
            });
        }
        Ok(c)
    }

    /// [`poll_blocking`](Self::poll_blocking) restricted to completions of `qp_num`, for
    /// callers that share the context's queues with other queue pairs.
    pub fn poll_blocking_for(
        &self,
        direction: Direction,
        expected: CompletionOpcode,
        qp_num: u32,
    ) -> Result<Completion> {
        let mut backoff = Backoff::new(self.backoff.clone());
        let c = wait_until("poll_blocking", None, &mut backoff, || {
            self.try_poll_for(direction, qp_num)
        })?;
        let c = self.checked(c)?;
        if c.opcode != expected {
            return Err(TransportError::UnexpectedOpcode {
                expected,
                got: c.opcode,
                wr_id: c.wr_id,
            });
        }
        Ok(c)
    }

    /// Blocks on the completion channel until a completion arrives, restricted to one
    /// direction if `restrict` is given.
    pub fn wait_for_completion(&self, restrict: Option<Direction>) -> Result<Completion> {
        self.wait_for_completion_until(restrict, None)
    }

    /// [`wait_for_completion`](Self::wait_for_completion) with an optional deadline.
    pub fn wait_for_completion_until(
        &self,
        restrict: Option<Direction>,
        deadline: Option<Deadline>,
    ) -> Result<Completion> {
        loop {
            if let Some(c) = self.take_cached(restrict) {
                return self.checked(c);
            }
            // Arm before draining so nothing that lands in between is missed.
            self.fabric.req_notify_cq(self.send_cq)?;
            self.fabric.req_notify_cq(self.recv_cq)?;
            if let Some(c) = self.drain(restrict)? {
                return self.checked(c);
            }
            let timeout = match &deadline {
                Some(d) => Some(d.remaining().ok_or_else(|| TransportError::TimedOut {
                    operation: "wait_for_completion",
                    elapsed_ms: d.elapsed().as_millis() as u64,
                })?),
                None => None,
            };
            match self.fabric.wait_cq_event(timeout)? {
                Some(cq) => trace!(cq = cq.0, "completion event"),
                None => {
                    if let Some(d) = &deadline {
                        d.check("wait_for_completion")?;
                    }
                }
            }
        }
    }

    /// Empties both queues. The first completion matching `restrict` is returned, the
    /// rest are cached.
    fn drain(&self, restrict: Option<Direction>) -> Result<Option<Completion>> {
        let mut picked = None;
        let mut rest = Vec::new();
        let mut raw = [WorkCompletion::default(); DRAIN_BATCH];
        for direction in [Direction::Send, Direction::Receive] {
            loop {
                let n = self.fabric.poll_cq(self.cq(direction), &mut raw)?;
                for wc in &raw[..n] {
                    let c = self.observe(Completion::from_work(direction, *wc));
                    if picked.is_none() && restrict.map_or(true, |r| r == direction) {
                        picked = Some(c);
                    } else {
                        rest.push(c);
                    }
                }
                if n < DRAIN_BATCH {
                    break;
                }
            }
        }
        self.stash(rest);
        Ok(picked)
    }
}

impl std::fmt::Debug for CompletionQueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueuePair")
            .field("send_cq", &self.send_cq)
            .field("recv_cq", &self.recv_cq)
            .field("cached", &self.cached_len())
            .finish()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Completion::from_work(Direction::Send, WorkCompletion::default())
    }
}
