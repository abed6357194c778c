//! Doorbell array: one byte per client, set remotely, scanned locally.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::context::NetworkContext;
use crate::error::{Result, TransportError};
use crate::memory::{AccessFlags, MemoryRegion, RemoteMemoryRegion};

/// Bytes compared per vector step.
pub const LANE_WIDTH: usize = 16;

/// Value a client writes into its cell.
pub const RUNG: u8 = 1;

/// Appends the index of every non-zero cell to `hits` and returns how many were found.
///
/// On x86_64 the cells are compared against zero sixteen at a time with SSE2; a tail
/// shorter than a lane, and other targets, fall back to a byte loop.
pub fn poll_sse(cells: &[AtomicU8], hits: &mut Vec<usize>) -> usize {
    let before = hits.len();
    let lanes = cells.len() / LANE_WIDTH;

    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{
            __m128i, _mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_setzero_si128,
        };
        for lane in 0..lanes {
            let base = lane * LANE_WIDTH;
            // SAFETY: SSE2 is part of the x86_64 baseline; the load reads 16 bytes that
            // lie inside `cells`, and AtomicU8 has the layout of u8.
            let zero_mask = unsafe {
                let v = _mm_loadu_si128(cells.as_ptr().add(base) as *const __m128i);
                _mm_movemask_epi8(_mm_cmpeq_epi8(v, _mm_setzero_si128())) as u32
            };
            let mut set = !zero_mask & 0xffff;
            while set != 0 {
                let bit = set.trailing_zeros() as usize;
                hits.push(base + bit);
                set &= set - 1;
            }
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        scan_bytes(&cells[..lanes * LANE_WIDTH], 0, hits);
    }

    scan_bytes(&cells[lanes * LANE_WIDTH..], lanes * LANE_WIDTH, hits);
    hits.len() - before
}

fn scan_bytes(cells: &[AtomicU8], offset: usize, hits: &mut Vec<usize>) {
    for (i, cell) in cells.iter().enumerate() {
        if cell.load(Ordering::Relaxed) != 0 {
            hits.push(offset + i);
        }
    }
}

/// A registered byte-per-client array that clients ring with a one-byte RDMA write.
pub struct DoorbellArray<'ctx> {
    mr: MemoryRegion<'ctx>,
    clients: usize,
}

impl<'ctx> DoorbellArray<'ctx> {
    /// Registers cells for `clients` clients, padded to whole lanes.
    pub fn new(ctx: &'ctx NetworkContext, clients: usize) -> Result<Self> {
        if clients == 0 {
            return Err(TransportError::InvalidArgument(
                "a doorbell array needs at least one cell".to_string(),
            ));
        }
        let padded = clients.div_ceil(LANE_WIDTH) * LANE_WIDTH;
        let mr = ctx.allocate(padded, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE)?;
        Ok(Self { mr, clients })
    }

    pub fn len(&self) -> usize {
        self.clients
    }

    pub fn is_empty(&self) -> bool {
        self.clients == 0
    }

    fn cells(&self) -> &[AtomicU8] {
        // SAFETY: the region is `mr.len()` bytes, lives as long as `self`, and AtomicU8
        // has the layout of u8.
        unsafe { std::slice::from_raw_parts(self.mr.as_ptr() as *const AtomicU8, self.mr.len()) }
    }

    fn cell(&self, client: usize) -> Result<&AtomicU8> {
        if client >= self.clients {
            return Err(TransportError::UnknownClient(client));
        }
        Ok(&self.cells()[client])
    }

    /// Appends the clients whose doorbell is set to `hits`.
    pub fn scan(&self, hits: &mut Vec<usize>) -> usize {
        let start = hits.len();
        poll_sse(self.cells(), hits);
        // Padding cells are never handed out, but a stray remote write must not turn
        // into a phantom client.
        let clients = self.clients;
        let found: Vec<usize> = hits.drain(start..).filter(|i| *i < clients).collect();
        hits.extend_from_slice(&found);
        found.len()
    }

    pub fn is_set(&self, client: usize) -> Result<bool> {
        Ok(self.cell(client)?.load(Ordering::Acquire) != 0)
    }

    pub fn clear(&self, client: usize) -> Result<()> {
        self.cell(client)?.store(0, Ordering::Release);
        Ok(())
    }

    /// Sets a cell locally, as a client's write would.
    pub fn ring(&self, client: usize) -> Result<()> {
        self.cell(client)?.store(RUNG, Ordering::Release);
        Ok(())
    }

    /// The remote view of one client's cell.
    pub fn remote_cell(&self, client: usize) -> Result<RemoteMemoryRegion> {
        self.cell(client)?;
        let region = self.mr.remote();
        Ok(RemoteMemoryRegion {
            addr: region.addr + client as u64,
            rkey: region.rkey,
        })
    }
}

impl std::fmt::Debug for DoorbellArray<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoorbellArray")
            .field("clients", &self.clients)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::fabric::SimNetwork;
    use proptest::prelude::*;

    fn cells(n: usize) -> Vec<AtomicU8> {
        (0..n).map(|_| AtomicU8::new(0)).collect()
    }

    #[test]
    fn test_poll_sse_finds_set_cells() {
        let c = cells(40);
        for i in [0, 15, 16, 33, 39] {
            c[i].store(1, Ordering::Relaxed);
        }
        let mut hits = Vec::new();
        assert_eq!(poll_sse(&c, &mut hits), 5);
        assert_eq!(hits, vec![0, 15, 16, 33, 39]);
    }

    #[test]
    fn test_poll_sse_empty() {
        let mut hits = Vec::new();
        assert_eq!(poll_sse(&cells(64), &mut hits), 0);
        assert!(hits.is_empty());
    }

    proptest! {
        #[test]
        fn prop_scan_matches_set_cells(set in proptest::collection::btree_set(0usize..100, 0..30)) {
            let c = cells(100);
            for i in &set {
                c[*i].store(0xff, Ordering::Relaxed);
            }
            let mut hits = Vec::new();
            poll_sse(&c, &mut hits);
            prop_assert_eq!(hits, set.into_iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_array_ring_scan_clear() {
        let ctx = NetworkContext::open(SimNetwork::new().device(), NetworkConfig::default())
            .unwrap();
        let bells = DoorbellArray::new(&ctx, 20).unwrap();
        bells.ring(3).unwrap();
        bells.ring(19).unwrap();
        let mut hits = Vec::new();
        assert_eq!(bells.scan(&mut hits), 2);
        assert_eq!(hits, vec![3, 19]);
        bells.clear(3).unwrap();
        assert!(!bells.is_set(3).unwrap());
        assert!(matches!(bells.ring(20), Err(TransportError::UnknownClient(20))));
        assert_eq!(bells.remote_cell(5).unwrap().addr, bells.remote_cell(0).unwrap().addr + 5);
    }
}
