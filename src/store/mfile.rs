//! Read-only file mappings with a process-wide mapped-size budget.
//!
//! Bulk segment scans at startup and during optimize can map many large
//! files at once; the budget caps the total at [`MAX_MMAP_SIZE_MB`] and makes
//! oversized openers wait their turn. The wait is a coarse polling sleep, not
//! a condvar.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

/// Cap on concurrently mapped megabytes.
pub const MAX_MMAP_SIZE_MB: u64 = 4096;

/// Files at or above this size must wait when the budget is exhausted;
/// smaller ones always map immediately.
const LARGE_FILE_MB: u64 = 100;

const RETRY_SLEEP: Duration = Duration::from_secs(5);

/// Shared accounting for mapped megabytes.
pub struct MmapBudget {
    used_mb: Mutex<u64>,
    cap_mb: u64,
}

impl MmapBudget {
    pub fn new(cap_mb: u64) -> Arc<MmapBudget> {
        Arc::new(MmapBudget {
            used_mb: Mutex::new(0),
            cap_mb,
        })
    }

    pub fn with_default_cap() -> Arc<MmapBudget> {
        Self::new(MAX_MMAP_SIZE_MB)
    }

    pub fn used_mb(&self) -> u64 {
        *self.used_mb.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Charge `mb` against the budget, sleeping while a large mapping would
    /// push it over the cap.
    fn acquire(&self, mb: u64) {
        loop {
            {
                let mut used = self.used_mb.lock().unwrap_or_else(|e| e.into_inner());
                if *used + mb <= self.cap_mb || mb < LARGE_FILE_MB {
                    *used += mb;
                    return;
                }
            }
            warn!(mb, cap_mb = self.cap_mb, "mmap budget exhausted, waiting");
            std::thread::sleep(RETRY_SLEEP);
        }
    }

    fn release(&self, mb: u64) {
        let mut used = self.used_mb.lock().unwrap_or_else(|e| e.into_inner());
        *used = used.saturating_sub(mb);
    }
}

/// A read-only memory mapping of a whole file, charged against a budget for
/// its lifetime.
pub struct MFile {
    addr: *mut libc::c_void,
    size: usize,
    mb: u64,
    budget: Arc<MmapBudget>,
    _file: File,
}

// The mapping is private and read-only.
unsafe impl Send for MFile {}
unsafe impl Sync for MFile {}

impl MFile {
    pub fn open(budget: &Arc<MmapBudget>, path: &Path) -> io::Result<MFile> {
        let file = File::open(path)?;
        let size = file.metadata()?.len() as usize;
        let fd = file.as_raw_fd();

        unsafe {
            libc::posix_fadvise(fd, 0, size as libc::off_t, libc::POSIX_FADV_SEQUENTIAL);
        }

        let mb = (size >> 20) as u64;
        budget.acquire(mb);

        let addr = if size > 0 {
            let addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ,
                    libc::MAP_PRIVATE,
                    fd,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                budget.release(mb);
                return Err(err);
            }
            unsafe {
                libc::madvise(addr, size, libc::MADV_SEQUENTIAL);
            }
            addr
        } else {
            std::ptr::null_mut()
        };

        Ok(MFile {
            addr,
            size,
            mb,
            budget: Arc::clone(budget),
            _file: file,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn data(&self) -> &[u8] {
        if self.addr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.size) }
        }
    }
}

impl Drop for MFile {
    fn drop(&mut self) {
        if !self.addr.is_null() {
            unsafe {
                libc::madvise(self.addr, self.size, libc::MADV_DONTNEED);
                libc::munmap(self.addr, self.size);
            }
        }
        self.budget.release(self.mb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_map_round_trip() {
        let budget = MmapBudget::with_default_cap();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"segment payload").unwrap();
        tmp.flush().unwrap();

        let mfile = MFile::open(&budget, tmp.path()).unwrap();
        assert_eq!(mfile.data(), b"segment payload");
        assert_eq!(mfile.len(), 15);

        drop(mfile);
        assert_eq!(budget.used_mb(), 0);
    }

    #[test]
    fn test_empty_file() {
        let budget = MmapBudget::with_default_cap();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mfile = MFile::open(&budget, tmp.path()).unwrap();
        assert!(mfile.is_empty());
        assert_eq!(mfile.data(), b"");
    }

    #[test]
    fn test_small_mappings_bypass_the_cap() {
        let budget = MmapBudget::new(1);
        // Small files never wait, even when the budget is exhausted.
        budget.acquire(1);
        budget.acquire(50);
        assert_eq!(budget.used_mb(), 51);
        budget.release(50);
        budget.release(1);
        assert_eq!(budget.used_mb(), 0);
    }
}
