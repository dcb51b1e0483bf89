//! Per-upcall observation frames and access-log emission.

use std::cell::Cell;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rustc_hash::FxHashSet;
use tracing::{error, info, trace};

use crate::index::moniker::MonikerTable;
use crate::io::{try_fsync, try_write};

use super::tablet::TabletStore;

/// Reusable log-write buffer size.
const LOG_BUFFER_SIZE: usize = 4 * 1024 * 1024;
const FSYNC_TRIES: u32 = 5;

/// Operation tags for kernel upcalls, one per handled operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpTag {
    Lookup,
    Mkdir,
    Mknod,
    Symlink,
    Link,
    Unlink,
    Rmdir,
    Rename,
    Forget,
    ForgetOne,
    ForgetMulti,
    Getattr,
    Setattr,
    Readlink,
    Opendir,
    Readdir,
    Readdirplus,
    Releasedir,
    Fsyncdir,
    Create,
    Open,
    Release,
    Flush,
    Fsync,
    Read,
    Write,
    Statfs,
    Fallocate,
    Flock,
    Setxattr,
    Getxattr,
    Listxattr,
    Removexattr,
}

impl OpTag {
    pub const COUNT: usize = 33;

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Mkdir => "mkdir",
            Self::Mknod => "mknod",
            Self::Symlink => "symlink",
            Self::Link => "link",
            Self::Unlink => "unlink",
            Self::Rmdir => "rmdir",
            Self::Rename => "rename",
            Self::Forget => "forget",
            Self::ForgetOne => "forget_one",
            Self::ForgetMulti => "forget_multi",
            Self::Getattr => "getattr",
            Self::Setattr => "setattr",
            Self::Readlink => "readlink",
            Self::Opendir => "opendir",
            Self::Readdir => "readdir",
            Self::Readdirplus => "readdirplus",
            Self::Releasedir => "releasedir",
            Self::Fsyncdir => "fsyncdir",
            Self::Create => "create",
            Self::Open => "open",
            Self::Release => "release",
            Self::Flush => "flush",
            Self::Fsync => "fsync",
            Self::Read => "read",
            Self::Write => "write",
            Self::Statfs => "statfs",
            Self::Fallocate => "fallocate",
            Self::Flock => "flock",
            Self::Setxattr => "setxattr",
            Self::Getxattr => "getxattr",
            Self::Listxattr => "listxattr",
            Self::Removexattr => "removexattr",
        }
    }
}

thread_local! {
    static FRAME_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Records which source inodes are touched by kernel upcalls, and writes
/// the pending observations out on demand.
pub struct Tracer {
    enabled: AtomicBool,
    log_dir: Option<PathBuf>,
    epoch: AtomicU64,
    store: TabletStore,
    monikers: Arc<MonikerTable>,
}

/// Scoped observation of one kernel upcall. Nesting is permitted; the
/// end-of-request hook fires when the outermost frame of a thread drops.
pub struct Frame<'t> {
    tracer: &'t Tracer,
}

impl Tracer {
    /// A tracer writing logs under `log_dir`, enabled iff a directory is
    /// configured.
    pub fn new(log_dir: Option<PathBuf>, monikers: Arc<MonikerTable>) -> Self {
        Self {
            enabled: AtomicBool::new(log_dir.is_some()),
            log_dir,
            epoch: AtomicU64::new(0),
            store: TabletStore::new(),
            monikers,
        }
    }

    /// Open a frame for `op`. The frame pushes a nesting level even when the
    /// tracer is disabled so destruction stays balanced.
    pub fn frame(&self, op: OpTag) -> Frame<'_> {
        trace!(op = op.as_str(), "frame");
        FRAME_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Frame { tracer: self }
    }

    /// Like [`Tracer::frame`], additionally recording `ino` in the calling
    /// thread's tablet.
    pub fn frame_for(&self, op: OpTag, ino: u64) -> Frame<'_> {
        let frame = self.frame(op);
        self.record(ino);
        frame
    }

    /// Record one observed inode in the calling thread's tablet.
    pub fn record(&self, ino: u64) {
        if self.enabled.load(Ordering::Relaxed) {
            self.store.tablet_for_current_thread().insert(ino);
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Sweep all pending observations and write them to a fresh epoch log
    /// named `<dir>/<pid>.<epoch>.log`.
    ///
    /// Returns the log path, or `None` when no log directory is configured
    /// or the tracer is disabled. An unrecoverable write or fsync failure
    /// aborts the process.
    pub fn quiesce(&self) -> Option<PathBuf> {
        let Some(dir) = self.log_dir.as_deref() else {
            info!("access logging not configured; skipping quiesce");
            return None;
        };
        if !self.enabled.load(Ordering::Relaxed) {
            info!("tracer disabled; skipping quiesce");
            return None;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{}.{epoch}.log", process::id()));
        match self.write_log(&path) {
            Ok(entries) => {
                info!(path = %path.display(), entries, "access log written");
                Some(path)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to write access log");
                process::abort();
            }
        }
    }

    fn write_log(&self, path: &Path) -> io::Result<usize> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .mode(0o644)
            .open(path)?;

        info!("aggregating tablets");
        let mut aggregated = FxHashSet::default();
        self.store.sweep(&mut aggregated);
        info!(inodes = aggregated.len(), "finished aggregating tablets");

        let mut buf: Vec<u8> = Vec::with_capacity(LOG_BUFFER_SIZE);
        let mut entries = 0usize;
        let mut missing = 0usize;
        for ino in &aggregated {
            let Some(moniker) = self.monikers.resolve(*ino) else {
                missing += 1;
                trace!(ino, "swept inode has no moniker");
                continue;
            };
            let line = moniker.as_bytes();
            if buf.len() + line.len() + 1 > LOG_BUFFER_SIZE {
                try_write(&file, &buf)?;
                buf.clear();
            }
            buf.extend_from_slice(line);
            buf.push(b'\n');
            entries += 1;
        }
        try_write(&file, &buf)?;
        try_fsync(&file, FSYNC_TRIES)?;

        if missing > 0 {
            trace!(missing, "dropped swept inodes without monikers");
        }
        Ok(entries)
    }

    fn end_of_request(&self) {
        // Reserved for flushing per-request state; nothing pending today.
        let _ = self;
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        let depth = FRAME_DEPTH.with(|depth| {
            depth.set(depth.get() - 1);
            depth.get()
        });
        if depth == 0 {
            self.tracer.end_of_request();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer_with_dir(dir: Option<PathBuf>) -> Tracer {
        Tracer::new(dir, Arc::new(MonikerTable::new(0)))
    }

    #[test]
    fn op_tags_render_their_wire_names() {
        assert_eq!(OpTag::Lookup.as_str(), "lookup");
        assert_eq!(OpTag::ForgetMulti.as_str(), "forget_multi");
        assert_eq!(OpTag::Readdirplus.as_str(), "readdirplus");
        assert_eq!(OpTag::Removexattr.as_str(), "removexattr");
        assert_eq!(OpTag::COUNT, 33);
    }

    #[test]
    fn disabled_tracer_records_nothing_and_skips_quiesce() {
        let tracer = tracer_with_dir(None);
        assert!(!tracer.is_enabled());
        {
            let _frame = tracer.frame_for(OpTag::Getattr, 42);
        }
        assert_eq!(tracer.quiesce(), None);
    }

    #[test]
    fn set_enabled_gates_recording() {
        let dir = tempfile::tempdir().expect("tempdir");
        let monikers = Arc::new(MonikerTable::new(0));
        monikers.insert(7, "seven");
        monikers.insert(9, "nine");
        let tracer = Tracer::new(Some(dir.path().to_path_buf()), monikers);
        assert!(tracer.is_enabled());

        tracer.set_enabled(false);
        tracer.record(7);
        tracer.set_enabled(true);
        tracer.record(9);

        let path = tracer.quiesce().expect("enabled tracer writes a log");
        let contents = std::fs::read_to_string(path).expect("read log");
        assert_eq!(contents, "nine\n", "only the enabled-window insert shows");
    }

    #[test]
    fn nested_frames_stay_balanced() {
        let tracer = tracer_with_dir(None);
        {
            let _outer = tracer.frame(OpTag::Readdir);
            {
                let _inner = tracer.frame_for(OpTag::Lookup, 3);
                FRAME_DEPTH.with(|d| assert_eq!(d.get(), 2));
            }
            FRAME_DEPTH.with(|d| assert_eq!(d.get(), 1));
        }
        FRAME_DEPTH.with(|d| assert_eq!(d.get(), 0));
    }

    #[test]
    fn quiesce_epochs_are_sequential() {
        let dir = tempfile::tempdir().expect("tempdir");
        let monikers = Arc::new(MonikerTable::new(0));
        monikers.insert(1, "a");
        let tracer = Tracer::new(Some(dir.path().to_path_buf()), monikers);

        tracer.record(1);
        let first = tracer.quiesce().expect("first log");
        tracer.record(1);
        let second = tracer.quiesce().expect("second log");

        let pid = process::id();
        assert_eq!(
            first.file_name().and_then(|n| n.to_str()),
            Some(format!("{pid}.0.log").as_str())
        );
        assert_eq!(
            second.file_name().and_then(|n| n.to_str()),
            Some(format!("{pid}.1.log").as_str())
        );
    }

    #[test]
    fn unresolvable_inodes_are_dropped_silently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let monikers = Arc::new(MonikerTable::new(0));
        monikers.insert(10, "known");
        let tracer = Tracer::new(Some(dir.path().to_path_buf()), monikers);

        tracer.record(10);
        tracer.record(999);
        let path = tracer.quiesce().expect("log written");
        let contents = std::fs::read_to_string(path).expect("read log");
        assert_eq!(contents, "known\n");
    }
}
