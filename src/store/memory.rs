//! In-memory storage engine.
//!
//! Implements the [`Store`](super::Store) contract with a hash map behind a
//! `RwLock`. Deletes leave versioned tombstones so a later `set` with an
//! explicit version can be refused as stale; `optimize` sweeps them out.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::RwLock;

use bytes::Bytes;
use tracing::{debug, info, trace};

use super::{OptimizeOutcome, SetOutcome, Store};
use crate::item::Item;

#[derive(Debug)]
struct Entry {
    value: Bytes,
    flag: u32,
    ver: i32,
    dead: bool,
}

/// Thread-safe in-memory key-value engine.
pub struct MemStore {
    data: RwLock<HashMap<Box<[u8]>, Entry>>,
    /// Total items ever stored, monotonic.
    total_items: AtomicU64,
    read_only: bool,
    homes: Vec<PathBuf>,
    optimizing: AtomicBool,
    last_optimize: AtomicI32,
}

impl MemStore {
    /// Open the engine over the given database homes. A non-zero
    /// `before_time` puts the store into read-only mode, mirroring the
    /// serve-data-written-before switch.
    pub fn open(
        homes: &[PathBuf],
        height: u8,
        before_time: i64,
        nthreads: usize,
    ) -> io::Result<MemStore> {
        for home in homes {
            std::fs::create_dir_all(home)?;
        }
        info!(
            homes = ?homes,
            height,
            nthreads,
            read_only = before_time != 0,
            "store opened"
        );
        Ok(MemStore {
            data: RwLock::new(HashMap::new()),
            total_items: AtomicU64::new(0),
            read_only: before_time != 0,
            homes: homes.to_vec(),
            optimizing: AtomicBool::new(false),
            last_optimize: AtomicI32::new(-1),
        })
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Box<[u8]>, Entry>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Box<[u8]>, Entry>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// A tree argument is `@` followed by hex bucket digits, e.g. `@` or `@2f`.
fn valid_tree(tree: &str) -> bool {
    let mut chars = tree.chars();
    chars.next() == Some('@') && chars.all(|c| c.is_ascii_hexdigit())
}

impl Store for MemStore {
    fn get(&self, key: &[u8]) -> Option<Item> {
        let data = self.lock_read();
        let entry = data.get(key).filter(|e| !e.dead)?;
        Some(Item::from_value(key, entry.flag, entry.ver, &entry.value))
    }

    fn set(&self, key: &[u8], value: &[u8], flag: u32, ver: i32) -> SetOutcome {
        if self.read_only {
            return SetOutcome::NotStored;
        }
        let mut data = self.lock_write();
        let next_ver = match data.get(key) {
            Some(old) if ver != 0 && ver <= old.ver => return SetOutcome::Exists,
            Some(old) if ver == 0 => old.ver.wrapping_add(1),
            _ if ver == 0 => 1,
            _ => ver,
        };
        data.insert(
            key.into(),
            Entry {
                value: Bytes::copy_from_slice(value),
                flag,
                ver: next_ver,
                dead: false,
            },
        );
        self.total_items.fetch_add(1, Ordering::Relaxed);
        SetOutcome::Stored
    }

    fn append(&self, key: &[u8], value: &[u8]) -> SetOutcome {
        if self.read_only {
            return SetOutcome::NotStored;
        }
        let mut data = self.lock_write();
        match data.get_mut(key) {
            Some(entry) if !entry.dead => {
                let mut joined = Vec::with_capacity(entry.value.len() + value.len());
                joined.extend_from_slice(&entry.value);
                joined.extend_from_slice(value);
                entry.value = Bytes::from(joined);
                entry.ver = entry.ver.wrapping_add(1);
            }
            _ => {
                data.insert(
                    key.into(),
                    Entry {
                        value: Bytes::copy_from_slice(value),
                        flag: 0,
                        ver: 1,
                        dead: false,
                    },
                );
            }
        }
        self.total_items.fetch_add(1, Ordering::Relaxed);
        SetOutcome::Stored
    }

    fn incr(&self, key: &[u8], delta: u64) -> u64 {
        if self.read_only {
            return 0;
        }
        let mut data = self.lock_write();
        let (current, flag, ver) = match data.get(key) {
            Some(entry) if !entry.dead => {
                let parsed = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .unwrap_or(0);
                (parsed, entry.flag, entry.ver)
            }
            _ => (0, 0, 0),
        };
        let new_value = current.wrapping_add(delta);
        data.insert(
            key.into(),
            Entry {
                value: Bytes::from(new_value.to_string()),
                flag,
                ver: ver.wrapping_add(1),
                dead: false,
            },
        );
        self.total_items.fetch_add(1, Ordering::Relaxed);
        new_value
    }

    fn delete(&self, key: &[u8]) -> bool {
        if self.read_only {
            return false;
        }
        let mut data = self.lock_write();
        match data.get_mut(key) {
            Some(entry) if !entry.dead => {
                entry.value = Bytes::new();
                entry.ver = entry.ver.wrapping_add(1);
                entry.dead = true;
                true
            }
            _ => false,
        }
    }

    fn count(&self) -> (u64, u64) {
        let data = self.lock_read();
        let curr = data.values().filter(|e| !e.dead).count() as u64;
        (self.total_items.load(Ordering::Relaxed), curr)
    }

    fn stat(&self) -> (u64, u64) {
        let Some(home) = self.homes.first() else {
            return (0, 0);
        };
        statvfs_space(home).unwrap_or((0, 0))
    }

    fn optimize(&self, limit: i64, tree: &str) -> OptimizeOutcome {
        if limit < 0 || !valid_tree(tree) {
            return OptimizeOutcome::BadArg;
        }
        if self.read_only {
            return OptimizeOutcome::ReadOnly;
        }
        if self.optimizing.swap(true, Ordering::AcqRel) {
            return OptimizeOutcome::Running;
        }
        let swept = {
            let mut data = self.lock_write();
            let mut budget = limit as usize;
            let before = data.len();
            data.retain(|_, e| {
                if e.dead && budget > 0 {
                    budget -= 1;
                    false
                } else {
                    true
                }
            });
            before - data.len()
        };
        debug!(swept, tree, "optimize pass");
        self.last_optimize.store(-1, Ordering::Release);
        self.optimizing.store(false, Ordering::Release);
        OptimizeOutcome::Ok
    }

    fn optimize_stat(&self) -> i32 {
        if self.optimizing.load(Ordering::Acquire) {
            0
        } else {
            self.last_optimize.load(Ordering::Acquire)
        }
    }

    fn flush(&self, limit_kb: u32, period_secs: u32) {
        // The memory engine has no dirty pages to write back.
        trace!(limit_kb, period_secs, "flush pass");
    }
}

fn statvfs_space(home: &Path) -> Option<(u64, u64)> {
    let cpath = CString::new(home.as_os_str().as_bytes()).ok()?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut vfs) } != 0 {
        return None;
    }
    let frsize = vfs.f_frsize as u64;
    Some((
        vfs.f_blocks as u64 * frsize,
        vfs.f_bavail as u64 * frsize,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> MemStore {
        let dir = tempfile::tempdir().unwrap();
        MemStore::open(&[dir.path().to_path_buf()], 1, 0, 1).unwrap()
    }

    #[test]
    fn test_set_get_round_trip() {
        let store = open_store();
        assert_eq!(store.set(b"k", b"hello", 7, 0), SetOutcome::Stored);
        let it = store.get(b"k").unwrap();
        assert_eq!(it.value(), b"hello");
        assert_eq!(it.flag(), 7);
        assert_eq!(it.ver(), 1);
        assert!(store.get(b"missing").is_none());
    }

    #[test]
    fn test_stale_version_is_refused() {
        let store = open_store();
        assert_eq!(store.set(b"k", b"a", 0, 5), SetOutcome::Stored);
        assert_eq!(store.set(b"k", b"b", 0, 5), SetOutcome::Exists);
        assert_eq!(store.set(b"k", b"b", 0, 4), SetOutcome::Exists);
        assert_eq!(store.set(b"k", b"c", 0, 6), SetOutcome::Stored);
        assert_eq!(store.get(b"k").unwrap().value(), b"c");
    }

    #[test]
    fn test_append() {
        let store = open_store();
        store.set(b"k", b"hi", 0, 0);
        assert_eq!(store.append(b"k", b"XYZ"), SetOutcome::Stored);
        assert_eq!(store.get(b"k").unwrap().value(), b"hiXYZ");
        // Appending to a missing key stores the fragment.
        assert_eq!(store.append(b"new", b"frag"), SetOutcome::Stored);
        assert_eq!(store.get(b"new").unwrap().value(), b"frag");
    }

    #[test]
    fn test_incr() {
        let store = open_store();
        store.set(b"n", b"10", 0, 0);
        assert_eq!(store.incr(b"n", 3), 13);
        assert_eq!(store.get(b"n").unwrap().value(), b"13");
        // Missing and non-numeric values count as zero.
        assert_eq!(store.incr(b"fresh", 5), 5);
        store.set(b"junk", b"abc", 0, 0);
        assert_eq!(store.incr(b"junk", 2), 2);
    }

    #[test]
    fn test_delete_and_tombstones() {
        let store = open_store();
        store.set(b"k", b"v", 0, 0);
        assert!(store.delete(b"k"));
        assert!(!store.delete(b"k"));
        assert!(store.get(b"k").is_none());

        let (_, curr) = store.count();
        assert_eq!(curr, 0);

        // A stale set against the tombstone version is still refused.
        assert_eq!(store.set(b"k", b"v2", 0, 1), SetOutcome::Exists);
        assert_eq!(store.set(b"k", b"v2", 0, 0), SetOutcome::Stored);
    }

    #[test]
    fn test_optimize_sweeps_tombstones() {
        let store = open_store();
        store.set(b"a", b"1", 0, 0);
        store.set(b"b", b"2", 0, 0);
        store.delete(b"a");

        assert_eq!(store.optimize(10000, "@"), OptimizeOutcome::Ok);
        assert_eq!(store.optimize_stat(), -1);
        let data = store.lock_read();
        assert!(!data.contains_key(b"a".as_slice()));
        assert!(data.contains_key(b"b".as_slice()));
    }

    #[test]
    fn test_optimize_rejects_bad_args() {
        let store = open_store();
        assert_eq!(store.optimize(-1, "@"), OptimizeOutcome::BadArg);
        assert_eq!(store.optimize(10, "nope"), OptimizeOutcome::BadArg);
        assert_eq!(store.optimize(10, "@zz"), OptimizeOutcome::BadArg);
        assert_eq!(store.optimize(10, "@2f"), OptimizeOutcome::Ok);
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemStore::open(&[dir.path().to_path_buf()], 1, 1_600_000_000, 1).unwrap();
        assert_eq!(store.set(b"k", b"v", 0, 0), SetOutcome::NotStored);
        assert_eq!(store.append(b"k", b"v"), SetOutcome::NotStored);
        assert!(!store.delete(b"k"));
        assert_eq!(store.optimize(10, "@"), OptimizeOutcome::ReadOnly);
    }
}
