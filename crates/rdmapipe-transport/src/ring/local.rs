//! Lock-free single-producer single-consumer ring over a [`WraparoundBuffer`].
//!
//! The producer owns the write position and the consumer the read position. Both are
//! unmasked `u64` counters published with release stores; `write - read` never exceeds
//! the capacity. A producer that runs out of room spins on the consumer's read
//! position with a [`Backoff`]; the consumer spins on the record sentinel.

use std::any::Any;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{trace, warn};

use super::frame;
use super::wraparound::{self, WraparoundBuffer};
use crate::config::BackoffConfig;
use crate::deadline::{wait_until, Backoff, Deadline};
use crate::error::{Result, TransportError};

const WRITE: usize = 0;
const READ: usize = 1;

enum PositionStore {
    Heap(Box<[AtomicU64; 2]>),
    /// Lives in memory kept alive by the handle, such as a shared-memory header.
    Mapped {
        words: NonNull<[AtomicU64; 2]>,
        _keep: Arc<dyn Any + Send + Sync>,
    },
}

struct RingShared {
    positions: PositionStore,
    buffer: Box<dyn WraparoundBuffer>,
}

// SAFETY: `Mapped` points into memory owned by `_keep`; the atomics are Sync.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    fn position(&self, which: usize) -> &AtomicU64 {
        match &self.positions {
            PositionStore::Heap(words) => &words[which],
            // SAFETY: kept alive by `_keep` for as long as `self`.
            PositionStore::Mapped { words, .. } => unsafe { &words.as_ref()[which] },
        }
    }

    fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

/// A local ring, before it is split into its two ends.
pub struct WraparoundRingBuffer {
    shared: Arc<RingShared>,
    backoff: BackoffConfig,
}

impl WraparoundRingBuffer {
    /// Allocates a ring of `capacity` bytes, double-mapped when `capacity` is at least a
    /// page.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_buffer(wraparound::for_capacity(capacity)?, BackoffConfig::default())
    }

    pub fn with_buffer(buffer: Box<dyn WraparoundBuffer>, backoff: BackoffConfig) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(RingShared {
                positions: PositionStore::Heap(Box::new([AtomicU64::new(0), AtomicU64::new(0)])),
                buffer,
            }),
            backoff,
        })
    }

    /// Builds a ring whose positions live in external memory.
    ///
    /// # Safety
    ///
    /// `words` must stay valid while `keep` is alive, and every process sharing the
    /// ring must use the same words.
    pub(crate) unsafe fn with_positions(
        buffer: Box<dyn WraparoundBuffer>,
        words: NonNull<[AtomicU64; 2]>,
        keep: Arc<dyn Any + Send + Sync>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            shared: Arc::new(RingShared {
                positions: PositionStore::Mapped { words, _keep: keep },
                buffer,
            }),
            backoff,
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Bytes currently between read and write position.
    pub fn len(&self) -> u64 {
        used(&self.shared)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn split(self) -> (Producer, Consumer) {
        let consumer = Consumer::new(self.shared.clone(), self.backoff.clone());
        (self.into_producer(), consumer)
    }

    pub fn into_producer(self) -> Producer {
        Producer::new(self.shared, self.backoff)
    }

    pub fn into_consumer(self) -> Consumer {
        Consumer::new(self.shared, self.backoff)
    }
}

impl std::fmt::Debug for WraparoundRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WraparoundRingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

fn used(shared: &RingShared) -> u64 {
    let write = shared.position(WRITE).load(Ordering::Acquire);
    let read = shared.position(READ).load(Ordering::Acquire);
    write.wrapping_sub(read)
}

/// Writing end of a local ring.
pub struct Producer {
    shared: Arc<RingShared>,
    write: u64,
    read_cache: u64,
    backoff: BackoffConfig,
}

impl Producer {
    fn new(shared: Arc<RingShared>, backoff: BackoffConfig) -> Self {
        let write = shared.position(WRITE).load(Ordering::Acquire);
        let read_cache = shared.position(READ).load(Ordering::Acquire);
        Self {
            shared,
            write,
            read_cache,
            backoff,
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// The producer's write position.
    pub fn position(&self) -> u64 {
        self.write
    }

    fn has_room(&mut self, record: usize) -> bool {
        let cap = self.capacity() as u64;
        if self.write - self.read_cache + record as u64 <= cap {
            return true;
        }
        self.read_cache = self.shared.position(READ).load(Ordering::Acquire);
        self.write - self.read_cache + record as u64 <= cap
    }

    fn commit(&mut self, payload: &[u8]) -> Result<()> {
        let record = frame::publish(self.shared.buffer.as_ref(), self.write, payload)?;
        self.write += record as u64;
        self.shared.position(WRITE).store(self.write, Ordering::Release);
        Ok(())
    }

    /// Writes one message without waiting. Fails with [`TransportError::Full`] when the
    /// consumer has not made room.
    pub fn try_send(&mut self, payload: &[u8]) -> Result<()> {
        let record = frame::check_payload(payload.len(), self.capacity())?;
        if !self.has_room(record) {
            return Err(TransportError::Full {
                used: self.write - self.read_cache,
                capacity: self.capacity() as u64,
            });
        }
        self.commit(payload)
    }

    /// Writes one message, waiting as long as it takes for room.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.send_until(payload, None)
    }

    pub fn send_until(&mut self, payload: &[u8], deadline: Option<Deadline>) -> Result<()> {
        let record = frame::check_payload(payload.len(), self.capacity())?;
        let mut backoff = Backoff::new(self.backoff.clone());
        let mut warned = false;
        while !self.has_room(record) {
            if let Some(d) = &deadline {
                d.check("ring send")?;
            }
            if backoff.is_sleeping() && !warned {
                warn!(
                    used = self.write - self.read_cache,
                    capacity = self.capacity(),
                    "ring producer stalled on a slow consumer"
                );
                warned = true;
            }
            backoff.snooze();
        }
        self.commit(payload)
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("write", &self.write)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Reading end of a local ring.
pub struct Consumer {
    shared: Arc<RingShared>,
    read: u64,
    backoff: BackoffConfig,
}

impl Consumer {
    fn new(shared: Arc<RingShared>, backoff: BackoffConfig) -> Self {
        let read = shared.position(READ).load(Ordering::Acquire);
        Self {
            shared,
            read,
            backoff,
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// The consumer's read position.
    pub fn position(&self) -> u64 {
        self.read
    }

    fn advance(&mut self, record: usize) {
        self.read += record as u64;
        self.shared.position(READ).store(self.read, Ordering::Release);
        trace!(read = self.read, "ring consumer advanced");
    }

    /// Returns the next message if a complete one is waiting.
    pub fn try_receive(&mut self) -> Result<Option<Bytes>> {
        let buf = self.shared.buffer.as_ref();
        let Some(len) = frame::peek(buf, self.read)? else {
            return Ok(None);
        };
        let (payload, record) = frame::take(buf, self.read, len)?;
        self.advance(record);
        Ok(Some(payload))
    }

    /// Hands the next message to `f` in place when the buffer is double-mapped, or a
    /// copy otherwise. The record is released after `f` returns.
    pub fn try_receive_with<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Result<Option<R>> {
        let buf = self.shared.buffer.as_ref();
        let Some(len) = frame::peek(buf, self.read)? else {
            return Ok(None);
        };
        let payload_at = self.read + frame::LENGTH_LEN as u64;
        // SAFETY: the producer does not touch this record until the read position moves
        // past it, which happens after `f` returns.
        let out = match unsafe { buf.linear(payload_at, len) } {
            Some(bytes) => f(bytes),
            None => {
                let mut copy = vec![0u8; len];
                buf.read(payload_at, &mut copy)?;
                f(&copy)
            }
        };
        let record = frame::clear(buf, self.read, len)?;
        self.advance(record);
        Ok(Some(out))
    }

    /// Waits for the next message.
    pub fn receive(&mut self) -> Result<Bytes> {
        self.receive_until(None)
    }

    pub fn receive_until(&mut self, deadline: Option<Deadline>) -> Result<Bytes> {
        let mut backoff = Backoff::new(self.backoff.clone());
        wait_until("ring receive", deadline, &mut backoff, || self.try_receive())
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("read", &self.read)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page_size;
    use std::time::Duration;

    #[test]
    fn test_send_receive_in_order() {
        let (mut tx, mut rx) = WraparoundRingBuffer::new(1024).unwrap().split();
        assert_eq!(rx.try_receive().unwrap(), None);
        tx.send(b"one").unwrap();
        tx.send(b"two").unwrap();
        assert_eq!(&rx.receive().unwrap()[..], b"one");
        assert_eq!(&rx.receive().unwrap()[..], b"two");
        assert_eq!(rx.try_receive().unwrap(), None);
        assert_eq!(tx.position(), rx.position());
    }

    #[test]
    fn test_full_ring_rejects_try_send() {
        let (mut tx, mut rx) = WraparoundRingBuffer::new(1024).unwrap().split();
        let msg = [7u8; 200];
        for _ in 0..4 {
            tx.try_send(&msg).unwrap();
        }
        let err = tx.try_send(&msg).unwrap_err();
        assert!(matches!(err, TransportError::Full { used: 864, capacity: 1024 }));
        rx.receive().unwrap();
        tx.try_send(&msg).unwrap();
    }

    #[test]
    fn test_send_until_times_out_when_full() {
        let (mut tx, _rx) = WraparoundRingBuffer::new(64).unwrap().split();
        tx.send(&[1u8; 40]).unwrap();
        let err = tx
            .send_until(&[1u8; 8], Some(Deadline::after(Duration::from_millis(5))))
            .unwrap_err();
        assert!(matches!(err, TransportError::TimedOut { operation: "ring send", .. }));
    }

    #[test]
    fn test_receive_with_borrows_in_place() {
        let cap = page_size();
        let (mut tx, mut rx) = WraparoundRingBuffer::new(cap).unwrap().split();
        // Push the write position close to the physical end so the next record wraps.
        let filler = vec![0u8; cap - 64 - frame::FRAME_OVERHEAD];
        tx.send(&filler).unwrap();
        rx.receive().unwrap();
        tx.send(&[9u8; 100]).unwrap();
        let sum = rx
            .try_receive_with(|bytes| bytes.iter().map(|b| *b as u32).sum::<u32>())
            .unwrap();
        assert_eq!(sum, Some(900));
        assert!(rx.try_receive().unwrap().is_none());
    }

    #[test]
    fn test_empty_message_rejected() {
        let (mut tx, _rx) = WraparoundRingBuffer::new(64).unwrap().split();
        assert!(matches!(tx.send(b""), Err(TransportError::InvalidArgument(_))));
    }

    #[test]
    fn test_threads_keep_order() {
        let (mut tx, mut rx) = WraparoundRingBuffer::new(256).unwrap().split();
        let producer = std::thread::spawn(move || {
            for i in 0u32..2000 {
                tx.send(&i.to_le_bytes()).unwrap();
            }
        });
        for i in 0u32..2000 {
            let msg = rx.receive().unwrap();
            assert_eq!(u32::from_le_bytes([msg[0], msg[1], msg[2], msg[3]]), i);
        }
        producer.join().unwrap();
    }
}
