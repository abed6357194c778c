#![allow(missing_docs)]

//! Shared-memory transport between two processes on one host.
//!
//! Both rings live in a single file, normally under `/dev/shm`:
//!
//! ```text
//! [header page][ring A][ring B]
//! ```
//!
//! The header holds a magic word, the ring capacity and the write/read positions of
//! both rings, each pair on its own cache line. The creator sends on ring A and
//! receives on ring B; the opener does the opposite. Rings of at least a page are
//! double-mapped from the file, smaller ones use split copies inside the shared
//! mapping.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, RingConfig};
use crate::error::{teardown_failed, Result, TransportError};
use crate::memory::page_size;
use crate::ring::local::{Consumer, Producer, WraparoundRingBuffer};
use crate::ring::wraparound::{DoubleMappedBuffer, SplitCopyBuffer, WraparoundBuffer};
use crate::transport::{Transport, TransportKind};

/// "rdmapipe" in ASCII, little-endian.
const MAGIC: u64 = 0x6570_6970_616d_6472;
const MAGIC_AT: usize = 0;
const CAPACITY_AT: usize = 8;
const RING_A_POSITIONS: usize = 64;
const RING_B_POSITIONS: usize = 128;

/// Default location of a named shared-memory transport.
pub fn shm_path(name: &str) -> PathBuf {
    Path::new("/dev/shm").join(format!("rdmapipe-{}", name))
}

/// The whole file mapped once, shared.
struct ShmMapping {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: plain shared memory; access goes through atomics and the ring protocol.
unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}

impl ShmMapping {
    fn map(file: &File, len: usize) -> Result<Self> {
        // SAFETY: mapping `len` bytes of a file that is at least that long.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(TransportError::last_os_error("mmap"));
        }
        let base =
            NonNull::new(ptr as *mut u8).ok_or_else(|| TransportError::last_os_error("mmap"))?;
        Ok(Self { base, len })
    }

    fn word(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset + 8 <= page_size() && offset % 8 == 0);
        // SAFETY: header offsets are 8-aligned constants inside the first page.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn positions(&self, offset: usize) -> NonNull<[AtomicU64; 2]> {
        // SAFETY: inside the header page, which lives as long as the mapping.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset) as *mut [AtomicU64; 2]) }
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what `map` mapped.
        if unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) } != 0 {
            teardown_failed(
                "shared-memory transport mapping",
                &std::io::Error::last_os_error(),
            );
        }
    }
}

fn region_len(capacity: usize) -> usize {
    let page = page_size();
    capacity.div_ceil(page) * page
}

fn file_len(capacity: usize) -> usize {
    page_size() + 2 * region_len(capacity)
}

fn ring(
    file: &File,
    mapping: &Arc<ShmMapping>,
    index: usize,
    positions: usize,
    capacity: usize,
    backoff: &BackoffConfig,
) -> Result<WraparoundRingBuffer> {
    let offset = page_size() + index * region_len(capacity);
    let buffer: Box<dyn WraparoundBuffer> = if capacity >= page_size() {
        Box::new(DoubleMappedBuffer::map_file(file, offset as u64, capacity)?)
    } else {
        // SAFETY: the range lies inside `mapping`, which the ring keeps alive below.
        Box::new(unsafe { SplitCopyBuffer::from_raw(mapping.base.as_ptr().add(offset), capacity)? })
    };
    // SAFETY: the position words live in the header page of `mapping`, and both
    // processes use the same offsets.
    Ok(unsafe {
        WraparoundRingBuffer::with_positions(
            buffer,
            mapping.positions(positions),
            mapping.clone(),
            backoff.clone(),
        )
    })
}

/// A bidirectional transport over two shared-memory rings.
pub struct ShmTransport {
    producer: Producer,
    consumer: Consumer,
    path: PathBuf,
    owner: bool,
}

impl ShmTransport {
    /// Creates the file at `path`, which must not exist yet, and sizes both rings to
    /// `config.capacity`. The file is removed when the creator is dropped.
    pub fn create(path: impl AsRef<Path>, config: &RingConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let capacity = config.capacity;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let built = (|| {
            file.set_len(file_len(capacity) as u64)?;
            let mapping = Arc::new(ShmMapping::map(&file, file_len(capacity))?);
            let outgoing = ring(&file, &mapping, 0, RING_A_POSITIONS, capacity, &config.backoff)?;
            let incoming = ring(&file, &mapping, 1, RING_B_POSITIONS, capacity, &config.backoff)?;
            mapping
                .word(CAPACITY_AT)
                .store(capacity as u64, Ordering::Relaxed);
            mapping.word(MAGIC_AT).store(MAGIC, Ordering::Release);
            Ok::<_, TransportError>((outgoing, incoming))
        })();
        let (outgoing, incoming) = match built {
            Ok(rings) => rings,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };
        info!(path = %path.display(), capacity, "shared-memory transport created");
        Ok(Self {
            producer: outgoing.into_producer(),
            consumer: incoming.into_consumer(),
            path,
            owner: true,
        })
    }

    /// Opens a transport created by [`create`](Self::create). The capacity comes from
    /// the file; `config` supplies the backoff.
    pub fn open(path: impl AsRef<Path>, config: &RingConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len() as usize;
        if len < page_size() {
            return Err(TransportError::Codec {
                what: "shared-memory header",
                reason: format!("{} is only {} bytes", path.display(), len),
            });
        }
        let header = ShmMapping::map(&file, page_size())?;
        if header.word(MAGIC_AT).load(Ordering::Acquire) != MAGIC {
            return Err(TransportError::Codec {
                what: "shared-memory header",
                reason: format!("{} is not an initialised transport", path.display()),
            });
        }
        let capacity = header.word(CAPACITY_AT).load(Ordering::Relaxed) as usize;
        drop(header);
        if !capacity.is_power_of_two() || file_len(capacity) != len {
            return Err(TransportError::Codec {
                what: "shared-memory header",
                reason: format!("capacity {} does not match a {}-byte file", capacity, len),
            });
        }

        let mapping = Arc::new(ShmMapping::map(&file, len)?);
        let incoming = ring(&file, &mapping, 0, RING_A_POSITIONS, capacity, &config.backoff)?;
        let outgoing = ring(&file, &mapping, 1, RING_B_POSITIONS, capacity, &config.backoff)?;
        debug!(path = %path.display(), capacity, "shared-memory transport opened");
        Ok(Self {
            producer: outgoing.into_producer(),
            consumer: incoming.into_consumer(),
            path,
            owner: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.producer.capacity()
    }

    pub fn producer(&mut self) -> &mut Producer {
        &mut self.producer
    }

    pub fn consumer(&mut self) -> &mut Consumer {
        &mut self.consumer
    }
}

impl Transport for ShmTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SharedMemory
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.producer.send(payload)
    }

    fn receive(&mut self) -> Result<Bytes> {
        self.consumer.receive()
    }

    fn try_receive(&mut self) -> Result<Option<Bytes>> {
        self.consumer.try_receive()
    }
}

impl Drop for ShmTransport {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove shared-memory file");
            }
        }
    }
}

impl std::fmt::Debug for ShmTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmTransport")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(capacity: usize) -> RingConfig {
        RingConfig {
            capacity,
            ..RingConfig::default()
        }
    }

    #[test]
    fn test_both_directions_small_ring() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipe");
        let mut a = ShmTransport::create(&path, &config(1024)).unwrap();
        let mut b = ShmTransport::open(&path, &config(64)).unwrap();
        assert_eq!(b.capacity(), 1024);
        assert_eq!(a.kind(), TransportKind::SharedMemory);

        a.send(b"to opener").unwrap();
        b.send(b"to creator").unwrap();
        assert_eq!(&b.receive().unwrap()[..], b"to opener");
        assert_eq!(&a.receive().unwrap()[..], b"to creator");
        assert!(a.try_receive().unwrap().is_none());
    }

    #[test]
    fn test_double_mapped_ring_wraps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipe");
        let capacity = page_size();
        let mut a = ShmTransport::create(&path, &config(capacity)).unwrap();
        let mut b = ShmTransport::open(&path, &config(capacity)).unwrap();
        for i in 0..200usize {
            let msg = vec![(i % 256) as u8; 100 + i];
            a.send(&msg).unwrap();
            assert_eq!(b.receive().unwrap(), msg);
        }
        assert!(a.producer().position() > 4 * capacity as u64);
    }

    #[test]
    fn test_threads_share_one_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipe");
        let mut a = ShmTransport::create(&path, &config(1024)).unwrap();
        let opener = {
            let path = path.clone();
            std::thread::spawn(move || {
                let mut b = ShmTransport::open(&path, &config(1024)).unwrap();
                for _ in 0..1000 {
                    let msg = b.receive().unwrap();
                    b.send(&msg).unwrap();
                }
            })
        };
        for i in 0..1000u32 {
            a.send(&i.to_le_bytes()).unwrap();
            assert_eq!(&a.receive().unwrap()[..], &i.to_le_bytes());
        }
        opener.join().unwrap();
    }

    #[test]
    fn test_creator_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipe");
        let a = ShmTransport::create(&path, &config(256)).unwrap();
        assert!(matches!(
            ShmTransport::create(&path, &config(256)),
            Err(TransportError::Io(_))
        ));
        drop(a);
        assert!(!path.exists());
        assert!(matches!(
            ShmTransport::open(&path, &config(256)),
            Err(TransportError::Io(_))
        ));
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0u8; 3 * page_size()]).unwrap();
        assert!(matches!(
            ShmTransport::open(&path, &config(256)),
            Err(TransportError::Codec { .. })
        ));
    }

    #[test]
    fn test_shm_path() {
        assert_eq!(shm_path("bench"), PathBuf::from("/dev/shm/rdmapipe-bench"));
    }
}
