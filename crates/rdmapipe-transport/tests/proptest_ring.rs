//! Property-based tests for the ring buffers and inline sends using proptest.
//!
//! These check that bytes survive the physical end of the buffer, that the
//! producer and consumer positions never drift further apart than the capacity, and
//! that inline sends up to the threshold land intact.

use proptest::prelude::*;
use rdmapipe_transport::ring::frame;
use rdmapipe_transport::ring::{DoubleMappedBuffer, SplitCopyBuffer, WraparoundBuffer};
use rdmapipe_transport::{NetworkConfig, NetworkContext, RingConfig, SimNetwork};
use rdmapipe_transport::{AccessFlags, CompletionOpcode, Direction, WorkRequest};
use rdmapipe_transport::{RdmaRingReceiver, RdmaRingSender, TransportError, WraparoundRingBuffer};
use std::sync::Arc;

const CAPACITY: usize = 4096;

/// One step against a local ring.
#[derive(Debug, Clone)]
enum Op {
    Send(Vec<u8>),
    Receive,
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => proptest::collection::vec(any::<u8>(), 1..600).prop_map(Op::Send),
        2 => Just(Op::Receive),
    ]
}

proptest! {
    /// A write that straddles the physical end reads back like one that does not.
    #[test]
    fn test_straddling_access_matches_linear(
        offset in 0usize..CAPACITY,
        data in proptest::collection::vec(any::<u8>(), 1..=CAPACITY),
        lap in 0u64..4,
    ) {
        let position = lap * CAPACITY as u64 + offset as u64;
        let buffers: [Box<dyn WraparoundBuffer>; 2] = [
            Box::new(DoubleMappedBuffer::new(CAPACITY).unwrap()),
            Box::new(SplitCopyBuffer::new(CAPACITY).unwrap()),
        ];
        for buffer in &buffers {
            buffer.write(position, &data).unwrap();
            let mut out = vec![0u8; data.len()];
            buffer.read(position, &mut out).unwrap();
            prop_assert_eq!(&out, &data);

            // The same bytes, read back from the start of the next lap.
            let mut again = vec![0u8; data.len()];
            buffer.read(position + CAPACITY as u64, &mut again).unwrap();
            prop_assert_eq!(&again, &data);
        }
    }

    /// Any interleaving of sends and receives keeps 0 <= write - read <= capacity and
    /// delivers messages in order.
    #[test]
    fn test_local_ring_positions_stay_in_bounds(ops in proptest::collection::vec(any_op(), 1..200)) {
        let (mut tx, mut rx) = WraparoundRingBuffer::new(CAPACITY).unwrap().split();
        let mut in_flight = std::collections::VecDeque::new();
        for op in ops {
            match op {
                Op::Send(payload) => match tx.try_send(&payload) {
                    Ok(()) => in_flight.push_back(payload),
                    Err(TransportError::Full { used, capacity }) => {
                        prop_assert_eq!(capacity, CAPACITY as u64);
                        prop_assert!(used as usize + frame::record_len(payload.len()) > CAPACITY);
                    }
                    Err(e) => return Err(TestCaseError::fail(e.to_string())),
                },
                Op::Receive => {
                    let got = rx.try_receive().unwrap();
                    prop_assert_eq!(got.map(|b| b.to_vec()), in_flight.pop_front());
                }
            }
            let gap = tx.position() - rx.position();
            prop_assert!(gap <= CAPACITY as u64);
            prop_assert_eq!(gap % 8, 0);
        }
    }

    /// Payloads of any admissible size arrive intact over the RDMA ring.
    #[test]
    fn test_rdma_ring_round_trip(sizes in proptest::collection::vec(1usize..=1000, 1..40)) {
        let net = SimNetwork::new();
        let a = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
        let b = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
        let config = RingConfig { capacity: 2048, signal_interval: 5, ..RingConfig::default() };
        let options = rdmapipe_transport::QueuePairOptions { use_srq: false, ..Default::default() };
        let qa = Arc::new(a.create_queue_pair_with(&options).unwrap());
        let qb = Arc::new(b.create_queue_pair_with(&options).unwrap());
        qa.connect(qb.address(), 7).unwrap();
        qb.connect(qa.address(), 7).unwrap();
        let mut rx = RdmaRingReceiver::new(&b, qb, &config).unwrap();
        let mut tx = RdmaRingSender::new(&a, qa, rx.descriptor(), &config).unwrap();

        for (i, size) in sizes.into_iter().enumerate() {
            let payload: Vec<u8> = (0..size).map(|j| (i * 31 + j) as u8).collect();
            tx.send(&payload).unwrap();
            prop_assert_eq!(rx.receive().unwrap().to_vec(), payload);
        }
        prop_assert_eq!(tx.position(), rx.position());
    }

    /// Any payload of 1..=512 bytes survives an inline send into a shared receive.
    #[test]
    fn test_inline_send_delivers_payload(
        payload in proptest::collection::vec(any::<u8>(), 1..=512),
    ) {
        let net = SimNetwork::new();
        let a = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
        let b = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
        let qa = a.create_queue_pair().unwrap();
        let qb = b.create_queue_pair().unwrap();
        qa.connect(qb.address(), 7).unwrap();
        qb.connect(qa.address(), 7).unwrap();
        prop_assert!(payload.len() <= qa.max_inline() as usize);

        let outbox = a.allocate(512, AccessFlags::LOCAL_WRITE).unwrap();
        let inbox = b.allocate(512, AccessFlags::LOCAL_WRITE).unwrap();
        outbox.write_at(0, &payload).unwrap();
        b.post_shared_receive(&WorkRequest::receive(inbox.slice(0, 512).unwrap())).unwrap();
        qa.post(&WorkRequest::send(outbox.slice(0, payload.len()).unwrap()).inline(true))
            .unwrap();

        a.completions()
            .poll_blocking(Direction::Send, CompletionOpcode::Send)
            .unwrap();
        let got = b
            .completions()
            .poll_blocking(Direction::Receive, CompletionOpcode::Receive)
            .unwrap();
        prop_assert_eq!(got.byte_len as usize, payload.len());
        prop_assert_eq!(inbox.read_vec(0, payload.len()).unwrap(), payload);
    }
}
