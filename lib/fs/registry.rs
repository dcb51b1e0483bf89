//! Registry of source-tree inodes the kernel currently knows about.
//!
//! Each record pins an `O_PATH` descriptor to its source entry so the
//! handle stays valid across rename, and carries the kernel's cumulative
//! lookup count. A record exists exactly while `nlookup > 0`; its
//! descriptor is closed exactly once, when the record drops.

use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd as _, OwnedFd, RawFd};
use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{error, trace, warn};

use super::sys;

/// The kernel interface's reserved root inode number.
pub const ROOT_HANDLE: u64 = fuser::FUSE_ROOT_ID;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("entry is on a different device than the source root")]
    CrossesDevice,

    #[error("entry uses the reserved root inode number")]
    ReservedInode,
}

impl LookupError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::CrossesDevice => libc::ENOTSUP,
            Self::ReservedInode => libc::EIO,
        }
    }
}

/// One source-tree inode the kernel holds references to.
#[derive(Debug)]
pub struct InodeRecord {
    src_ino: u64,
    src_dev: u64,
    fd: OwnedFd,
    nlookup: Mutex<u64>,
}

impl InodeRecord {
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn src_ino(&self) -> u64 {
        self.src_ino
    }

    pub fn src_dev(&self) -> u64 {
        self.src_dev
    }
}

/// Maps kernel inode handles to records. The handle a record is keyed by is
/// its source inode number; records themselves are pointer-stable behind
/// `Arc`.
#[derive(Debug)]
pub struct InodeRegistry {
    // The record mutex is acquired before this map lock whenever both are
    // held.
    inodes: Mutex<FxHashMap<u64, Arc<InodeRecord>>>,
    root: Arc<InodeRecord>,
    src_dev: u64,
}

impl InodeRegistry {
    /// Open `source` as the tree root. Fails if it is not a directory.
    pub fn open(source: &Path) -> io::Result<Self> {
        let fd = sys::open_path(source)?;
        let st = sys::stat_fd(fd.as_raw_fd())?;
        if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                "source is not a directory",
            ));
        }

        let root = Arc::new(InodeRecord {
            src_ino: st.st_ino,
            src_dev: st.st_dev,
            fd,
            // The root is referenced for the life of the mount.
            nlookup: Mutex::new(u64::MAX / 2),
        });
        Ok(Self {
            inodes: Mutex::new(FxHashMap::default()),
            src_dev: st.st_dev,
            root,
        })
    }

    pub fn root(&self) -> Arc<InodeRecord> {
        Arc::clone(&self.root)
    }

    pub fn src_dev(&self) -> u64 {
        self.src_dev
    }

    /// Number of live records, excluding the root.
    pub fn record_count(&self) -> usize {
        self.inodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The record behind `handle`. A handle the kernel presents always
    /// refers to a live record; anything else is an invariant violation and
    /// aborts.
    pub fn get(&self, handle: u64) -> Arc<InodeRecord> {
        if handle == ROOT_HANDLE {
            return Arc::clone(&self.root);
        }
        let inodes = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
        match inodes.get(&handle) {
            Some(record) => Arc::clone(record),
            None => {
                error!(handle, "unknown inode handle");
                process::abort();
            }
        }
    }

    /// Open `name` under `parent` and install or reference its record.
    ///
    /// Returns the record and the fresh stat of the entry; the stat's
    /// `st_ino` is the handle the kernel will use from now on.
    pub fn lookup(
        &self,
        parent: u64,
        name: &OsStr,
    ) -> Result<(Arc<InodeRecord>, libc::stat), LookupError> {
        let parent = self.get(parent);
        let scratch = sys::openat(
            parent.fd(),
            name,
            libc::O_PATH | libc::O_NOFOLLOW,
            0,
        )?;
        let st = sys::stat_fd(scratch.as_raw_fd())?;

        if st.st_dev != self.src_dev {
            warn!(name = ?name, "mountpoints in the source directory tree are hidden");
            return Err(LookupError::CrossesDevice);
        }
        if st.st_ino == ROOT_HANDLE {
            error!(
                name = ?name,
                "source directory tree must not include inode {ROOT_HANDLE}"
            );
            return Err(LookupError::ReservedInode);
        }

        use std::collections::hash_map::Entry;
        loop {
            let record = {
                let mut inodes = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
                match inodes.entry(st.st_ino) {
                    Entry::Occupied(existing) => Arc::clone(existing.get()),
                    Entry::Vacant(slot) => {
                        let record = Arc::new(InodeRecord {
                            src_ino: st.st_ino,
                            src_dev: st.st_dev,
                            fd: scratch,
                            nlookup: Mutex::new(1),
                        });
                        slot.insert(Arc::clone(&record));
                        trace!(ino = st.st_ino, "created inode record");
                        return Ok((record, st));
                    }
                }
            };

            let mut nlookup = record
                .nlookup
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *nlookup == 0 {
                // A concurrent forget zeroed the count and is about to
                // remove this record from the map; claiming it now would
                // hand out an orphaned handle. Retry once the removal lands.
                drop(nlookup);
                continue;
            }
            *nlookup += 1;
            drop(nlookup);
            // The scratch descriptor is redundant; the record keeps its own.
            trace!(ino = st.st_ino, "referenced existing inode record");
            return Ok((record, st));
        }
    }

    /// Take one additional lookup reference on an existing handle.
    pub fn retain(&self, handle: u64) {
        let record = self.get(handle);
        *record
            .nlookup
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
    }

    /// Drop `n` lookup references from `handle`; at zero the record is
    /// removed and its descriptor closed. A count that would go negative is
    /// an invariant violation and aborts.
    pub fn forget(&self, handle: u64, n: u64) {
        if handle == ROOT_HANDLE {
            return;
        }
        let record = self.get(handle);
        let mut nlookup = record
            .nlookup
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if n > *nlookup {
            error!(
                ino = record.src_ino,
                nlookup = *nlookup,
                n, "negative lookup count for inode"
            );
            process::abort();
        }
        *nlookup -= n;
        if *nlookup == 0 {
            trace!(ino = record.src_ino, "cleaning up inode");
            let mut inodes = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
            drop(nlookup);
            inodes.remove(&handle);
        } else {
            trace!(ino = record.src_ino, nlookup = *nlookup, "lookup count lowered");
        }
    }

    /// Apply a batch of `(handle, n)` forgets.
    pub fn forget_many(&self, batch: &[(u64, u64)]) {
        for &(handle, n) in batch {
            self.forget(handle, n);
        }
    }
}
