//! Block-device access.
//!
//! Everything the daemon persists lives behind [`BlockDev`]: a
//! byte-addressed read/write/flush surface. Production points the daemon
//! at real block devices; tests use plain files or in-memory buffers.
//! Calls are synchronous memory copies against a mapped region, performed
//! directly from async tasks.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::MmapMut;
use xenvm_proto::{XvError, XvResult};

/// Byte-addressed persistent storage.
pub trait BlockDev: Send + Sync {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> XvResult<()>;
    fn write_at(&self, off: u64, data: &[u8]) -> XvResult<()>;
    /// Force everything written so far to stable storage.
    fn flush(&self) -> XvResult<()>;
    /// Device size in bytes.
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_range(len: u64, off: u64, n: usize) -> XvResult<()> {
    if off + n as u64 > len {
        return Err(XvError::Io(format!(
            "access of {n} bytes at offset {off} beyond device end {len}"
        )));
    }
    Ok(())
}

/// In-memory device for tests.
pub struct MemDev {
    data: Mutex<Vec<u8>>,
}

impl MemDev {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size]),
        }
    }
}

impl BlockDev for MemDev {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> XvResult<()> {
        let data = self.data.lock().unwrap();
        check_range(data.len() as u64, off, buf.len())?;
        let off = off as usize;
        buf.copy_from_slice(&data[off..off + buf.len()]);
        Ok(())
    }

    fn write_at(&self, off: u64, data: &[u8]) -> XvResult<()> {
        let mut inner = self.data.lock().unwrap();
        check_range(inner.len() as u64, off, data.len())?;
        let off = off as usize;
        inner[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> XvResult<()> {
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }
}

/// A memory-mapped file or block device.
pub struct FileDev {
    mmap: Mutex<MmapMut>,
    path: PathBuf,
    size: u64,
}

impl FileDev {
    /// Open `path`, creating and sizing the file when `size > 0`.
    ///
    /// With `size == 0` the existing length is used; an empty file is an
    /// error because there is nothing to map.
    pub fn open(path: &Path, size: u64) -> XvResult<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(size > 0)
            .truncate(false)
            .open(path)
            .map_err(|e| XvError::Io(format!("open {}: {e}", path.display())))?;

        let len = file.metadata()?.len();
        if len < size {
            file.set_len(size)
                .map_err(|e| XvError::Io(format!("resize {}: {e}", path.display())))?;
        }
        let actual = file.metadata()?.len();
        if actual == 0 {
            return Err(XvError::Io(format!("device {} is empty", path.display())));
        }

        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| XvError::Io(format!("mmap {}: {e}", path.display())))?
        };

        Ok(Self {
            mmap: Mutex::new(mmap),
            path: path.to_path_buf(),
            size: actual,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDev for FileDev {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> XvResult<()> {
        let mmap = self.mmap.lock().unwrap();
        check_range(self.size, off, buf.len())?;
        let off = off as usize;
        buf.copy_from_slice(&mmap[off..off + buf.len()]);
        Ok(())
    }

    fn write_at(&self, off: u64, data: &[u8]) -> XvResult<()> {
        let mut mmap = self.mmap.lock().unwrap();
        check_range(self.size, off, data.len())?;
        let off = off as usize;
        mmap[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> XvResult<()> {
        self.mmap
            .lock()
            .unwrap()
            .flush()
            .map_err(|e| XvError::Io(format!("flush {}: {e}", self.path.display())))
    }

    fn len(&self) -> u64 {
        self.size
    }
}
