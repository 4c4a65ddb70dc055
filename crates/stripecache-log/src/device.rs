//! Journal device access
//!
//! The journal lives on a dedicated fast device (or a file standing in for
//! one). All I/O is block-sized and block-aligned so the device can be
//! opened with direct I/O:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use stripecache_common::{BLOCK_SIZE, Error, Result};
use tracing::info;

/// Buffer whose data pointer is aligned to the journal block size, as
/// required for O_DIRECT transfers. Length is always a whole number of
/// blocks.
#[derive(Debug)]
pub struct AlignedBuffer {
    raw: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `len` bytes (must be block-aligned)
    pub fn zeroed(len: usize) -> Self {
        assert_eq!(len % BLOCK_SIZE, 0, "buffer length must be block-aligned");
        let raw = vec![0u8; len + BLOCK_SIZE];
        let addr = raw.as_ptr() as usize;
        let start = (BLOCK_SIZE - addr % BLOCK_SIZE) % BLOCK_SIZE;
        Self { raw, start, len }
    }

    /// Allocate a buffer holding `blocks` journal blocks
    pub fn blocks(blocks: usize) -> Self {
        Self::zeroed(blocks * BLOCK_SIZE)
    }

    /// Buffer contents
    pub fn as_slice(&self) -> &[u8] {
        &self.raw[self.start..self.start + self.len]
    }

    /// Mutable buffer contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.start..self.start + self.len]
    }

    /// Buffer length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the front of the buffer, zero-filling the remainder
    pub fn copy_from(&mut self, src: &[u8]) {
        let dst = self.as_mut_slice();
        assert!(src.len() <= dst.len(), "source larger than buffer");
        dst[..src.len()].copy_from_slice(src);
        dst[src.len()..].fill(0);
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Raw handle to the journal device with optional direct I/O
#[derive(Debug)]
pub struct RawDevice {
    file: File,
    path: String,
    size: u64,
}

impl RawDevice {
    /// Open an existing device or regular file
    pub fn open(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        Self::apply_direct_flags(&mut options, direct);

        let file = options
            .open(&path)
            .map_err(|e| Error::not_ready(format!("failed to open {}: {}", path_str, e)))?;
        Self::post_open(&file, &path_str, direct)?;

        let size = Self::device_size(&file, &path_str)?;
        Ok(Self {
            file,
            path: path_str,
            size,
        })
    }

    /// Create a regular file of the given size for use as a journal device.
    /// Opening an existing block device goes through [`RawDevice::open`];
    /// its size is discovered, not set.
    pub fn create(path: impl AsRef<Path>, size: u64, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        Self::apply_direct_flags(&mut options, direct);

        let file = options
            .open(&path)
            .map_err(|e| Error::not_ready(format!("failed to create {}: {}", path_str, e)))?;
        Self::post_open(&file, &path_str, direct)?;

        file.set_len(size)
            .map_err(|e| Error::not_ready(format!("failed to size {}: {}", path_str, e)))?;

        Ok(Self {
            file,
            path: path_str,
            size,
        })
    }

    #[cfg(target_os = "linux")]
    fn apply_direct_flags(options: &mut OpenOptions, direct: bool) {
        use std::os::unix::fs::OpenOptionsExt;
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_direct_flags(_options: &mut OpenOptions, _direct: bool) {}

    #[cfg(target_os = "macos")]
    fn post_open(file: &File, path: &str, direct: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        if direct {
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
            if rc == -1 {
                return Err(Error::not_ready(format!(
                    "failed to set F_NOCACHE on {}: {}",
                    path,
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn post_open(_file: &File, _path: &str, _direct: bool) -> Result<()> {
        Ok(())
    }

    fn device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::fs::FileTypeExt;
        let meta = file
            .metadata()
            .map_err(|e| Error::not_ready(format!("failed to stat {}: {}", path, e)))?;
        if meta.file_type().is_block_device() {
            Self::block_device_size(file, path)
        } else {
            Ok(meta.len())
        }
    }

    #[cfg(target_os = "linux")]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if rc == -1 {
            return Err(Error::not_ready(format!(
                "failed to get device size for {}: {}",
                path,
                std::io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        let _ = file;
        Err(Error::not_ready(format!(
            "block devices are not supported on this platform: {}",
            path
        )))
    }

    /// Device size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Device path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read at a block-aligned byte offset
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(offset % BLOCK_SIZE as u64, 0);
        debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Write at a block-aligned byte offset
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(offset % BLOCK_SIZE as u64, 0);
        debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Flush device write caches
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// The journal device: block 0 holds the superblock, blocks `1..=ring_blocks`
/// form the record ring. Logical ring positions are monotonically increasing
/// and map onto physical blocks modulo the ring size.
#[derive(Debug)]
pub struct JournalDevice {
    dev: RawDevice,
    ring_blocks: u64,
    write_fault: AtomicBool,
}

/// Smallest usable journal device: superblock + a ring with room for a few
/// full IO units.
pub const MIN_DEVICE_BLOCKS: u64 = 64;

impl JournalDevice {
    /// Open (or, for regular files with `create_size`, create) the journal
    /// device and validate its geometry.
    pub fn open(path: impl AsRef<Path>, create_size: Option<u64>, direct: bool) -> Result<Self> {
        let exists = path.as_ref().exists();
        let dev = match (exists, create_size) {
            (false, Some(size)) => RawDevice::create(&path, size, direct)?,
            _ => RawDevice::open(&path, direct)?,
        };

        let total_blocks = dev.size() / BLOCK_SIZE as u64;
        if total_blocks < MIN_DEVICE_BLOCKS {
            return Err(Error::not_ready(format!(
                "journal device {} too small: {} blocks, need at least {}",
                dev.path(),
                total_blocks,
                MIN_DEVICE_BLOCKS
            )));
        }

        let ring_blocks = total_blocks - 1;
        info!(
            device = dev.path(),
            ring_blocks, direct, "opened journal device"
        );

        Ok(Self {
            dev,
            ring_blocks,
            write_fault: AtomicBool::new(false),
        })
    }

    /// Number of blocks in the record ring
    pub fn ring_blocks(&self) -> u64 {
        self.ring_blocks
    }

    /// Device path
    pub fn path(&self) -> &str {
        self.dev.path()
    }

    /// Map a monotonically increasing logical ring position to its physical
    /// block index on the device.
    pub fn ring_to_phys(&self, logical: u64) -> u64 {
        1 + logical % self.ring_blocks
    }

    /// Read `count` physically contiguous blocks starting at `phys_block`
    pub fn read_blocks(&self, phys_block: u64, count: u64) -> Result<AlignedBuffer> {
        let mut buf = AlignedBuffer::blocks(count as usize);
        self.dev
            .read_at(phys_block * BLOCK_SIZE as u64, buf.as_mut_slice())?;
        Ok(buf)
    }

    /// Write block-aligned data at `phys_block`
    pub fn write_blocks(&self, phys_block: u64, data: &[u8]) -> Result<()> {
        if self.write_fault.load(Ordering::Acquire) {
            return Err(Error::DeviceIo(std::io::Error::other(
                "injected journal write fault",
            )));
        }
        self.dev.write_at(phys_block * BLOCK_SIZE as u64, data)
    }

    /// Write a logically contiguous run of blocks starting at ring position
    /// `logical`, splitting the transfer where the ring wraps.
    pub fn write_ring(&self, logical: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        let total = (data.len() / BLOCK_SIZE) as u64;
        debug_assert!(total <= self.ring_blocks);

        let first_phys = self.ring_to_phys(logical);
        let until_wrap = (self.ring_blocks - (first_phys - 1)).min(total);

        let head = &data[..(until_wrap as usize) * BLOCK_SIZE];
        self.write_blocks(first_phys, head)?;

        if until_wrap < total {
            let tail = &data[(until_wrap as usize) * BLOCK_SIZE..];
            self.write_blocks(1, tail)?;
        }
        Ok(())
    }

    /// Read one block at ring position `logical`
    pub fn read_ring_block(&self, logical: u64) -> Result<AlignedBuffer> {
        self.read_blocks(self.ring_to_phys(logical), 1)
    }

    /// Flush device write caches
    pub fn sync(&self) -> Result<()> {
        if self.write_fault.load(Ordering::Acquire) {
            return Err(Error::DeviceIo(std::io::Error::other(
                "injected journal write fault",
            )));
        }
        self.dev.sync()
    }

    /// Failure-injection hook: while set, every write and sync fails with an
    /// I/O error, as if the device had died mid-operation.
    pub fn set_write_fault(&self, on: bool) {
        self.write_fault.store(on, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_aligned_buffer_alignment() {
        let buf = AlignedBuffer::blocks(3);
        assert_eq!(buf.len(), 3 * BLOCK_SIZE);
        assert_eq!(buf.as_slice().as_ptr() as usize % BLOCK_SIZE, 0);
    }

    #[test]
    fn test_aligned_buffer_copy_from_zero_fills() {
        let mut buf = AlignedBuffer::blocks(1);
        buf.as_mut_slice().fill(0xFF);
        buf.copy_from(b"head");
        assert_eq!(&buf.as_slice()[..4], b"head");
        assert!(buf.as_slice()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_device_too_small_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let err = JournalDevice::open(&path, Some(4 * BLOCK_SIZE as u64), false).unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }

    #[test]
    fn test_ring_addressing_wraps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let dev =
            JournalDevice::open(&path, Some(MIN_DEVICE_BLOCKS * BLOCK_SIZE as u64), false).unwrap();

        let ring = dev.ring_blocks();
        assert_eq!(dev.ring_to_phys(0), 1);
        assert_eq!(dev.ring_to_phys(ring - 1), ring);
        assert_eq!(dev.ring_to_phys(ring), 1);
    }

    #[test]
    fn test_write_ring_split_at_wrap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let dev =
            JournalDevice::open(&path, Some(MIN_DEVICE_BLOCKS * BLOCK_SIZE as u64), false).unwrap();

        let ring = dev.ring_blocks();
        // Three blocks starting one block before the wrap point.
        let mut data = AlignedBuffer::blocks(3);
        for (i, chunk) in data.as_mut_slice().chunks_mut(BLOCK_SIZE).enumerate() {
            chunk.fill(i as u8 + 1);
        }
        let start = ring - 1;
        dev.write_ring(start, data.as_slice()).unwrap();

        for i in 0..3u64 {
            let blk = dev.read_ring_block(start + i).unwrap();
            assert!(blk.as_slice().iter().all(|&b| b == i as u8 + 1));
        }
    }

    #[test]
    fn test_write_fault_injection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let dev =
            JournalDevice::open(&path, Some(MIN_DEVICE_BLOCKS * BLOCK_SIZE as u64), false).unwrap();

        let buf = AlignedBuffer::blocks(1);
        dev.set_write_fault(true);
        assert!(dev.write_ring(0, buf.as_slice()).is_err());
        assert!(dev.sync().is_err());

        dev.set_write_fault(false);
        dev.write_ring(0, buf.as_slice()).unwrap();
        dev.sync().unwrap();
    }
}
