//! Circular byte buffers addressable by unmasked position.
//!
//! A position is a monotonically increasing byte counter; the physical offset is
//! `position & (capacity - 1)`. [`DoubleMappedBuffer`] maps the same pages twice back
//! to back, so any access of at most `capacity` bytes is one linear copy, and a remote
//! peer can RDMA-write a record across the physical end in a single operation.
//! [`SplitCopyBuffer`] gives the same interface for capacities below the page size by
//! splitting copies at the end.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

use tracing::debug;

use crate::error::{teardown_failed, Result, TransportError};
use crate::memory::{page_size, AlignedBuffer};

/// Smallest capacity a ring accepts.
pub const MIN_CAPACITY: usize = 64;

/// A power-of-two circular buffer indexed by unmasked position.
///
/// Positions passed to the word accessor must be 8-aligned; capacities are multiples
/// of 8, so an aligned word never straddles the physical end.
pub trait WraparoundBuffer: Send + Sync {
    fn capacity(&self) -> usize;

    /// Start of the physical buffer.
    fn as_ptr(&self) -> *mut u8;

    /// Bytes addressable linearly from [`as_ptr`](Self::as_ptr): twice the capacity
    /// when double-mapped, the capacity otherwise. This is the range to register.
    fn mapped_len(&self) -> usize;

    /// Whether a `capacity`-sized access at any offset is linear.
    fn is_linear(&self) -> bool {
        self.mapped_len() >= 2 * self.capacity()
    }

    fn offset(&self, position: u64) -> usize {
        (position as usize) & (self.capacity() - 1)
    }

    /// Copies `data` in at `position`, wrapping at the physical end.
    fn write(&self, position: u64, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;
        let offset = self.offset(position);
        let base = self.as_ptr();
        // SAFETY: `check_len` bounds the copy by the capacity, and the split keeps both
        // halves inside the mapping.
        unsafe {
            if self.is_linear() || offset + data.len() <= self.capacity() {
                std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), data.len());
            } else {
                let first = self.capacity() - offset;
                std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), first);
                std::ptr::copy_nonoverlapping(data.as_ptr().add(first), base, data.len() - first);
            }
        }
        Ok(())
    }

    /// Copies `out.len()` bytes at `position` out, wrapping at the physical end.
    fn read(&self, position: u64, out: &mut [u8]) -> Result<()> {
        self.check_len(out.len())?;
        let offset = self.offset(position);
        let base = self.as_ptr();
        // SAFETY: as in `write`.
        unsafe {
            if self.is_linear() || offset + out.len() <= self.capacity() {
                std::ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), out.len());
            } else {
                let first = self.capacity() - offset;
                std::ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), first);
                std::ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), out.len() - first);
            }
        }
        Ok(())
    }

    /// Zeroes `len` bytes at `position`.
    fn zero(&self, position: u64, len: usize) -> Result<()> {
        self.check_len(len)?;
        let offset = self.offset(position);
        let base = self.as_ptr();
        // SAFETY: as in `write`.
        unsafe {
            if self.is_linear() || offset + len <= self.capacity() {
                std::ptr::write_bytes(base.add(offset), 0, len);
            } else {
                let first = self.capacity() - offset;
                std::ptr::write_bytes(base.add(offset), 0, first);
                std::ptr::write_bytes(base, 0, len - first);
            }
        }
        Ok(())
    }

    /// The `len` bytes at `position` as one slice, if the buffer is double-mapped.
    ///
    /// # Safety
    ///
    /// Nobody may write the range while the slice is alive.
    unsafe fn linear(&self, position: u64, len: usize) -> Option<&[u8]> {
        if !self.is_linear() || len > self.capacity() {
            return None;
        }
        Some(std::slice::from_raw_parts(
            self.as_ptr().add(self.offset(position)),
            len,
        ))
    }

    /// The aligned 8-byte word at `position`.
    fn word(&self, position: u64) -> Result<&AtomicU64> {
        if position % 8 != 0 {
            return Err(TransportError::InvalidArgument(format!(
                "ring word position {} is not 8-aligned",
                position
            )));
        }
        let offset = self.offset(position);
        // SAFETY: the mapping is page-aligned, the offset is 8-aligned and at most
        // capacity - 8.
        Ok(unsafe { &*(self.as_ptr().add(offset) as *const AtomicU64) })
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(TransportError::MessageTooLarge {
                size: len,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }
}

fn check_capacity(capacity: usize) -> Result<()> {
    if capacity < MIN_CAPACITY || !capacity.is_power_of_two() {
        return Err(TransportError::InvalidArgument(format!(
            "ring capacity {} must be a power of two of at least {}",
            capacity, MIN_CAPACITY
        )));
    }
    Ok(())
}

/// Picks the double mapping when the capacity allows it and split copies otherwise.
pub fn for_capacity(capacity: usize) -> Result<Box<dyn WraparoundBuffer>> {
    check_capacity(capacity)?;
    if capacity >= page_size() {
        Ok(Box::new(DoubleMappedBuffer::new(capacity)?))
    } else {
        Ok(Box::new(SplitCopyBuffer::new(capacity)?))
    }
}

/// The same pages mapped twice, back to back.
pub struct DoubleMappedBuffer {
    base: NonNull<u8>,
    capacity: usize,
}

// SAFETY: the mapping is plain memory; synchronisation is the ring protocol's job.
unsafe impl Send for DoubleMappedBuffer {}
unsafe impl Sync for DoubleMappedBuffer {}

impl DoubleMappedBuffer {
    /// Maps an anonymous memory file of `capacity` bytes twice.
    pub fn new(capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;
        let name = CString::new("rdmapipe-ring")
            .map_err(|e| TransportError::InvalidArgument(e.to_string()))?;
        // SAFETY: `name` is a valid C string.
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(TransportError::last_os_error("memfd_create"));
        }
        // SAFETY: `fd` was just created and is owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(capacity as u64)?;
        // The mappings keep the memory alive after `file` closes.
        Self::map_file(&file, 0, capacity)
    }

    /// Maps `capacity` bytes of `file` starting at `offset` twice. The file may be
    /// closed afterwards.
    pub fn map_file(file: &File, offset: u64, capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;
        let page = page_size();
        if capacity % page != 0 || offset % page as u64 != 0 {
            return Err(TransportError::InvalidArgument(format!(
                "double mapping needs page-aligned offset and capacity, got {} and {}",
                offset, capacity
            )));
        }
        let fd = file.as_raw_fd();
        let total = 2 * capacity;
        // SAFETY: reserving fresh address space, then replacing both halves with
        // MAP_FIXED views of the same file range inside that reservation.
        unsafe {
            let reserved = libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if reserved == libc::MAP_FAILED {
                return Err(TransportError::last_os_error("mmap"));
            }
            for half in 0..2 {
                let want = (reserved as *mut u8).add(half * capacity) as *mut libc::c_void;
                let got = libc::mmap(
                    want,
                    capacity,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    offset as libc::off_t,
                );
                if got == libc::MAP_FAILED || got != want {
                    let err = TransportError::last_os_error("mmap");
                    libc::munmap(reserved, total);
                    return Err(err);
                }
            }
            let base = NonNull::new(reserved as *mut u8)
                .ok_or_else(|| TransportError::last_os_error("mmap"))?;
            debug!(capacity, offset, "double-mapped ring buffer");
            Ok(Self { base, capacity })
        }
    }
}

impl WraparoundBuffer for DoubleMappedBuffer {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn mapped_len(&self) -> usize {
        2 * self.capacity
    }
}

impl Drop for DoubleMappedBuffer {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the range mapped in `map_file`.
        let rc = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, 2 * self.capacity) };
        if rc != 0 {
            teardown_failed("double-mapped ring buffer", &std::io::Error::last_os_error());
        }
    }
}

impl std::fmt::Debug for DoubleMappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleMappedBuffer")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A single mapping; accesses that cross the end are split in two.
pub struct SplitCopyBuffer {
    base: NonNull<u8>,
    capacity: usize,
    _owned: Option<AlignedBuffer>,
}

// SAFETY: as for `DoubleMappedBuffer`.
unsafe impl Send for SplitCopyBuffer {}
unsafe impl Sync for SplitCopyBuffer {}

impl SplitCopyBuffer {
    /// Allocates a zeroed, page-aligned buffer.
    pub fn new(capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;
        let owned = AlignedBuffer::page_aligned(capacity)?;
        let base = NonNull::new(owned.as_ptr())
            .ok_or_else(|| TransportError::InvalidArgument("null ring buffer".to_string()))?;
        Ok(Self {
            base,
            capacity,
            _owned: Some(owned),
        })
    }

    /// Uses memory owned elsewhere, such as part of a shared mapping.
    ///
    /// # Safety
    ///
    /// `ptr` must be 8-aligned and valid for `capacity` bytes for the life of the
    /// buffer.
    pub unsafe fn from_raw(ptr: *mut u8, capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;
        let base = NonNull::new(ptr)
            .ok_or_else(|| TransportError::InvalidArgument("null ring buffer".to_string()))?;
        if ptr as usize % 8 != 0 {
            return Err(TransportError::InvalidArgument(
                "ring buffer must be 8-aligned".to_string(),
            ));
        }
        Ok(Self {
            base,
            capacity,
            _owned: None,
        })
    }
}

impl WraparoundBuffer for SplitCopyBuffer {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn mapped_len(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for SplitCopyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitCopyBuffer")
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn straddle(buf: &dyn WraparoundBuffer) {
        let cap = buf.capacity() as u64;
        let data: Vec<u8> = (0..100u8).collect();
        // Three laps in, 46 bytes before the physical end.
        let position = 3 * cap + cap - 46;
        buf.write(position, &data).unwrap();

        let mut back = vec![0u8; 100];
        buf.read(position, &mut back).unwrap();
        assert_eq!(back, data);

        // The tail landed at the physical start.
        let mut head = vec![0u8; 54];
        buf.read(0, &mut head).unwrap();
        assert_eq!(&head[..], &data[46..]);

        buf.zero(position, 100).unwrap();
        buf.read(position, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_double_mapped_aliases_halves() {
        let cap = page_size();
        let buf = DoubleMappedBuffer::new(cap).unwrap();
        assert!(buf.is_linear());
        assert_eq!(buf.mapped_len(), 2 * cap);
        // SAFETY: both offsets are inside the 2 * cap mapping.
        unsafe {
            *buf.as_ptr().add(cap + 5) = 0xab;
            assert_eq!(*buf.as_ptr().add(5), 0xab);
        }
    }

    #[test]
    fn test_double_mapped_straddle() {
        let buf = DoubleMappedBuffer::new(page_size()).unwrap();
        straddle(&buf);
    }

    #[test]
    fn test_split_copy_straddle() {
        let buf = SplitCopyBuffer::new(256).unwrap();
        assert!(!buf.is_linear());
        straddle(&buf);
    }

    #[test]
    fn test_linear_view_only_when_double_mapped() {
        let cap = page_size();
        let dm = DoubleMappedBuffer::new(cap).unwrap();
        dm.write(cap as u64 - 2, b"wrap").unwrap();
        // SAFETY: no concurrent writer.
        assert_eq!(unsafe { dm.linear(cap as u64 - 2, 4) }, Some(&b"wrap"[..]));

        let sc = SplitCopyBuffer::new(128).unwrap();
        // SAFETY: no concurrent writer.
        assert!(unsafe { sc.linear(0, 4) }.is_none());
    }

    #[test]
    fn test_word_access() {
        let buf = SplitCopyBuffer::new(128).unwrap();
        buf.word(128 + 8).unwrap().store(42, Ordering::Release);
        assert_eq!(buf.word(8).unwrap().load(Ordering::Acquire), 42);
        assert!(buf.word(4).is_err());
    }

    #[test]
    fn test_capacity_validation() {
        assert!(SplitCopyBuffer::new(100).is_err());
        assert!(SplitCopyBuffer::new(32).is_err());
        assert!(DoubleMappedBuffer::new(page_size() / 2).is_err());
        let small = for_capacity(1024).unwrap();
        assert_eq!(small.is_linear(), 1024 >= page_size());
    }

    #[test]
    fn test_oversized_access_rejected() {
        let buf = SplitCopyBuffer::new(64).unwrap();
        let err = buf.write(0, &[0u8; 65]).unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { size: 65, capacity: 64 }));
    }
}
