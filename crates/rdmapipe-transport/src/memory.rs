//! Registered memory.
//!
//! A [`MemoryRegion`] pins a byte range and registers it with the device. It borrows
//! the [`NetworkContext`](crate::context::NetworkContext) that created it, so the
//! context cannot be dropped while a region is alive. A [`Slice`] is a bounds-checked
//! view into a region that reuses the region's local key and cannot outlive it.
//!
//! Remote peers see a region only as a [`RemoteMemoryRegion`]: an address and a
//! remote key, with no ownership.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bootstrap::Wire;
use crate::error::{teardown_failed, Result, TransportError};
use crate::fabric::{Fabric, MrInfo, PdHandle, Sge};

/// Encoded size of a [`RemoteMemoryRegion`] or [`RemoteAddress`].
pub const REMOTE_REGION_WIRE_LEN: usize = 12;

bitflags! {
    /// Access permissions of a memory region or queue pair. Bit values match
    /// `ibv_access_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
        const WINDOW_BIND = 1 << 4;
    }
}

impl AccessFlags {
    /// Everything a peer may do to a region: local write plus all remote operations.
    pub fn remote_all() -> Self {
        AccessFlags::LOCAL_WRITE
            | AccessFlags::REMOTE_WRITE
            | AccessFlags::REMOTE_READ
            | AccessFlags::REMOTE_ATOMIC
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        AccessFlags::LOCAL_WRITE
    }
}

/// A zeroed heap allocation with a caller-chosen alignment.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is plain memory owned exclusively by this value.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `len` zeroed bytes aligned to `align` (a power of two).
    pub fn new(len: usize, align: usize) -> Result<Self> {
        if len == 0 {
            return Err(TransportError::InvalidArgument(
                "cannot allocate an empty buffer".to_string(),
            ));
        }
        let layout = Layout::from_size_align(len, align)
            .map_err(|e| TransportError::InvalidArgument(format!("buffer layout: {}", e)))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            TransportError::from_errno("alloc_zeroed", libc::ENOMEM)
        })?;
        Ok(Self { ptr, layout })
    }

    /// Allocates `len` zeroed bytes aligned to the system page size.
    pub fn page_aligned(len: usize) -> Result<Self> {
        Self::new(len, page_size())
    }

    /// Start of the allocation.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Whether the allocation is zero bytes.
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// System page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

enum Backing<'a> {
    Owned(AlignedBuffer),
    Borrowed(PhantomData<&'a mut [u8]>),
    External,
}

/// A registered memory region.
///
/// Dropping the region deregisters it. A failed deregistration is logged and then
/// panics, since the device may still write to memory about to be freed; call
/// [`MemoryRegion::deregister`] to handle the error instead.
pub struct MemoryRegion<'a> {
    fabric: &'a dyn Fabric,
    info: MrInfo,
    addr: u64,
    len: usize,
    access: AccessFlags,
    registered: bool,
    _backing: Backing<'a>,
}

impl<'a> MemoryRegion<'a> {
    /// # Safety
    ///
    /// `addr..addr+len` must stay valid until the region is deregistered. With
    /// `Backing::External` the caller also keeps the memory mapped that long.
    unsafe fn register(
        fabric: &'a dyn Fabric,
        pd: PdHandle,
        addr: u64,
        len: usize,
        access: AccessFlags,
        backing: Backing<'a>,
    ) -> Result<Self> {
        let info = fabric.register_mr(pd, addr, len, access)?;
        debug!(
            device = fabric.name(),
            addr = format_args!("{:#x}", addr),
            len,
            lkey = info.lkey,
            rkey = info.rkey,
            ?access,
            "registered memory region"
        );
        Ok(Self {
            fabric,
            info,
            addr,
            len,
            access,
            registered: true,
            _backing: backing,
        })
    }

    pub(crate) fn register_borrowed(
        fabric: &'a dyn Fabric,
        pd: PdHandle,
        buf: &'a mut [u8],
        access: AccessFlags,
    ) -> Result<Self> {
        // SAFETY: the region holds the mutable borrow of `buf` for its whole life.
        unsafe {
            Self::register(
                fabric,
                pd,
                buf.as_mut_ptr() as u64,
                buf.len(),
                access,
                Backing::Borrowed(PhantomData),
            )
        }
    }

    pub(crate) fn register_owned(
        fabric: &'a dyn Fabric,
        pd: PdHandle,
        buf: AlignedBuffer,
        access: AccessFlags,
    ) -> Result<Self> {
        let (addr, len) = (buf.as_ptr() as u64, buf.len());
        // SAFETY: the buffer moves into the region and is freed after deregistration.
        unsafe { Self::register(fabric, pd, addr, len, access, Backing::Owned(buf)) }
    }

    /// # Safety
    ///
    /// The memory must stay mapped until this region is dropped or deregistered.
    pub(crate) unsafe fn register_external(
        fabric: &'a dyn Fabric,
        pd: PdHandle,
        ptr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<Self> {
        Self::register(fabric, pd, ptr as u64, len, access, Backing::External)
    }

    /// Registered start address.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// The registered memory as a raw pointer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Registered length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Local key for scatter/gather entries.
    pub fn lkey(&self) -> u32 {
        self.info.lkey
    }

    /// Remote key a peer presents to reach this region.
    pub fn rkey(&self) -> u32 {
        self.info.rkey
    }

    /// Permissions the region was registered with.
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(TransportError::OutOfBounds {
                offset,
                len,
                region_len: self.len,
            }),
        }
    }

    /// A view of `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Slice<'_>> {
        self.check_range(offset, len)?;
        if len > u32::MAX as usize {
            return Err(TransportError::InvalidArgument(format!(
                "slice of {} bytes exceeds the 32-bit SGE length",
                len
            )));
        }
        Ok(Slice {
            addr: self.addr + offset as u64,
            offset,
            len: len as u32,
            lkey: self.info.lkey,
            _region: PhantomData,
        })
    }

    /// A view of the whole region.
    pub fn as_slice(&self) -> Result<Slice<'_>> {
        self.slice(0, self.len)
    }

    /// What a peer needs to access this region.
    pub fn remote(&self) -> RemoteMemoryRegion {
        RemoteMemoryRegion {
            addr: self.addr,
            rkey: self.info.rkey,
        }
    }

    /// Copies `data` into the region at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: the range is inside the registered memory.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.as_ptr().add(offset),
                data.len(),
            )
        };
        Ok(())
    }

    /// Copies `out.len()` bytes at `offset` out of the region.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        // SAFETY: the range is inside the registered memory.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len())
        };
        Ok(())
    }

    /// Copies `len` bytes at `offset` into a new vector.
    pub fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_at(offset, &mut out)?;
        Ok(out)
    }

    /// Fills `len` bytes at `offset` with zero.
    pub fn zero(&self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: the range is inside the registered memory.
        unsafe { std::ptr::write_bytes(self.as_ptr().add(offset), 0, len) };
        Ok(())
    }

    /// The 8-byte word at `offset` as an atomic. `offset` must be 8-aligned in memory.
    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64> {
        self.check_range(offset, 8)?;
        let addr = self.addr + offset as u64;
        if addr % 8 != 0 {
            return Err(TransportError::InvalidArgument(format!(
                "atomic word at {:#x} is not 8-byte aligned",
                addr
            )));
        }
        // SAFETY: aligned, in bounds, and valid for the region's lifetime.
        Ok(unsafe { &*(addr as *const AtomicU64) })
    }

    /// The byte at `offset` as an atomic.
    pub fn atomic_u8(&self, offset: usize) -> Result<&AtomicU8> {
        self.check_range(offset, 1)?;
        // SAFETY: in bounds and valid for the region's lifetime.
        Ok(unsafe { &*(self.as_ptr().add(offset) as *const AtomicU8) })
    }

    fn release(&mut self) -> Result<()> {
        if !self.registered {
            return Ok(());
        }
        self.registered = false;
        self.fabric.deregister_mr(self.info.handle)
    }

    /// Deregisters the region, returning the driver error instead of panicking.
    pub fn deregister(mut self) -> Result<()> {
        self.release()
    }
}

impl Drop for MemoryRegion<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            teardown_failed(
                &format!("memory region {:#x}+{}", self.addr, self.len),
                &e,
            );
        }
    }
}

impl std::fmt::Debug for MemoryRegion<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("lkey", &self.info.lkey)
            .field("rkey", &self.info.rkey)
            .field("access", &self.access)
            .finish()
    }
}

/// A bounds-checked view into a [`MemoryRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice<'r> {
    addr: u64,
    offset: usize,
    len: u32,
    lkey: u32,
    _region: PhantomData<&'r ()>,
}

impl<'r> Slice<'r> {
    /// Absolute start address.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Offset from the start of the parent region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the slice is zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Local key inherited from the parent region.
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// A narrower view; offsets are relative to this slice.
    pub fn subslice(&self, offset: usize, len: usize) -> Result<Slice<'r>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len as usize => Ok(Slice {
                addr: self.addr + offset as u64,
                offset: self.offset + offset,
                len: len as u32,
                lkey: self.lkey,
                _region: PhantomData,
            }),
            _ => Err(TransportError::OutOfBounds {
                offset,
                len,
                region_len: self.len as usize,
            }),
        }
    }

    pub(crate) fn sge(&self) -> Sge {
        Sge {
            addr: self.addr,
            length: self.len,
            lkey: self.lkey,
        }
    }
}

/// A peer's memory region: base address and remote key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RemoteMemoryRegion {
    /// Base virtual address on the peer.
    pub addr: u64,
    /// Remote key of the region.
    pub rkey: u32,
}

impl RemoteMemoryRegion {
    /// The remote address `offset` bytes into the region.
    pub fn at(&self, offset: u64) -> RemoteAddress {
        RemoteAddress {
            addr: self.addr.wrapping_add(offset),
            rkey: self.rkey,
        }
    }
}

impl Wire for RemoteMemoryRegion {
    const WIRE_LEN: usize = REMOTE_REGION_WIRE_LEN;
    const NAME: &'static str = "remote memory region";
}

/// Target of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RemoteAddress {
    /// Virtual address on the peer.
    pub addr: u64,
    /// Remote key of the region containing `addr`.
    pub rkey: u32,
}

impl RemoteAddress {
    /// The address `by` bytes further on, same key.
    pub fn offset(&self, by: u64) -> RemoteAddress {
        RemoteAddress {
            addr: self.addr.wrapping_add(by),
            rkey: self.rkey,
        }
    }
}

impl From<RemoteMemoryRegion> for RemoteAddress {
    fn from(r: RemoteMemoryRegion) -> Self {
        r.at(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::context::NetworkContext;
    use crate::fabric::SimNetwork;

    fn context() -> NetworkContext {
        let net = SimNetwork::new();
        NetworkContext::open(net.device(), NetworkConfig::default()).unwrap()
    }

    #[test]
    fn test_access_flags_match_verbs_bits() {
        assert_eq!(AccessFlags::LOCAL_WRITE.bits(), 1);
        assert_eq!(AccessFlags::REMOTE_WRITE.bits(), 2);
        assert_eq!(AccessFlags::REMOTE_READ.bits(), 4);
        assert_eq!(AccessFlags::REMOTE_ATOMIC.bits(), 8);
        assert!(AccessFlags::remote_all().contains(AccessFlags::REMOTE_ATOMIC));
    }

    #[test]
    fn test_aligned_buffer() {
        let buf = AlignedBuffer::new(100, 64).unwrap();
        assert_eq!(buf.as_ptr() as usize % 64, 0);
        assert_eq!(buf.len(), 100);
        assert!(AlignedBuffer::new(0, 64).is_err());
    }

    #[test]
    fn test_slice_bounds() {
        let ctx = context();
        let mr = ctx.allocate(256, AccessFlags::LOCAL_WRITE).unwrap();
        let s = mr.slice(16, 32).unwrap();
        assert_eq!(s.addr(), mr.addr() + 16);
        assert_eq!(s.lkey(), mr.lkey());
        assert_eq!(s.len(), 32);
        assert!(mr.slice(250, 7).is_err());
        assert!(mr.slice(usize::MAX, 2).is_err());

        let inner = s.subslice(8, 8).unwrap();
        assert_eq!(inner.offset(), 24);
        assert!(s.subslice(30, 4).is_err());
    }

    #[test]
    fn test_read_write_zero() {
        let ctx = context();
        let mr = ctx.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        mr.write_at(10, b"hello").unwrap();
        assert_eq!(mr.read_vec(10, 5).unwrap(), b"hello");
        mr.zero(10, 5).unwrap();
        assert_eq!(mr.read_vec(10, 5).unwrap(), vec![0u8; 5]);
        assert!(mr.write_at(62, b"abc").is_err());
    }

    #[test]
    fn test_borrowed_region() {
        let ctx = context();
        let mut buf = vec![0u8; 128];
        {
            let mr = ctx.register(&mut buf, AccessFlags::remote_all()).unwrap();
            mr.write_at(0, &[9, 9]).unwrap();
            assert_eq!(mr.remote().addr, mr.addr());
            mr.deregister().unwrap();
        }
        assert_eq!(&buf[..2], &[9, 9]);
    }

    #[test]
    fn test_atomic_word_alignment() {
        let ctx = context();
        let mr = ctx.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        mr.atomic_u64(8)
            .unwrap()
            .store(5, std::sync::atomic::Ordering::Relaxed);
        assert_eq!(mr.read_vec(8, 8).unwrap(), 5u64.to_ne_bytes());
        assert!(mr.atomic_u64(3).is_err());
    }

    #[test]
    fn test_remote_region_wire() {
        let remote = RemoteMemoryRegion {
            addr: 0x1000,
            rkey: 0x8000_0001,
        };
        let bytes = remote.encode().unwrap();
        assert_eq!(bytes.len(), REMOTE_REGION_WIRE_LEN);
        assert_eq!(RemoteMemoryRegion::decode(&bytes).unwrap(), remote);
        assert_eq!(remote.at(16).addr, 0x1010);
        assert_eq!(RemoteAddress::from(remote).offset(8).addr, 0x1008);
    }

    #[test]
    #[should_panic(expected = "failed to release memory region")]
    fn test_failed_deregistration_in_drop_is_fatal() {
        let net = SimNetwork::new();
        let ctx = NetworkContext::open(net.device(), NetworkConfig::default()).unwrap();
        let mr = ctx.allocate(64, AccessFlags::LOCAL_WRITE).unwrap();
        net.inject_failure("ibv_dereg_mr", libc::EBUSY);
        drop(mr);
    }
}
