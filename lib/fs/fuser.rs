//! Kernel translation layer: maps [`fuser::Filesystem`] callbacks onto the
//! inode registry and the fd-relative syscall wrappers.
//!
//! Every handler clones the shared state and spawns its body onto the
//! runtime handle, so upcalls execute concurrently across the worker pool.
//! The tracer frame is constructed at the top of the spawned body, before
//! anything blocks, so the observed inode lands in the executing worker
//! thread's tablet.

use std::ffi::OsStr;
use std::io;
use std::os::fd::{IntoRawFd as _, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyDirectoryPlus,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use rustc_hash::FxHashMap;
use tracing::{Instrument as _, debug, debug_span, warn};

use crate::trace::tracer::{OpTag, Tracer};

use super::registry::InodeRegistry;
use super::sys;

/// Attribute and entry timeout when metadata caching is enabled.
const CACHED_TTL: Duration = Duration::from_secs(86_400);

type Errno = i32;

fn io_errno(e: &io::Error) -> Errno {
    let errno = e.raw_os_error().unwrap_or(libc::EIO);
    if errno == libc::ENFILE || errno == libc::EMFILE {
        warn!("reached maximum number of file descriptors");
    }
    errno
}

fn system_time(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn file_type(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn dirent_type(d_type: u8) -> FileType {
    match d_type {
        libc::DT_DIR => FileType::Directory,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_BLK => FileType::BlockDevice,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_SOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// Convert a fresh stat into kernel file attributes. The kernel-visible
/// inode number is the source inode number.
pub fn stat_to_attr(st: &libc::stat) -> FileAttr {
    FileAttr {
        ino: st.st_ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_type(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn to_timespec(t: Option<TimeOrNow>) -> libc::timespec {
    match t {
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(at)) => {
            let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();
            libc::timespec {
                tv_sec: since_epoch.as_secs() as i64,
                tv_nsec: i64::from(since_epoch.subsec_nanos()),
            }
        }
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

enum MakeNode<'a> {
    Dir { mode: libc::mode_t },
    Symlink { target: &'a OsStr },
    Node { mode: libc::mode_t, rdev: libc::dev_t },
}

enum Xattr {
    Size(u32),
    Data(Vec<u8>),
}

/// Shared state of one mounted passthrough tree.
pub struct FsState {
    registry: InodeRegistry,
    tracer: Arc<Tracer>,
    dir_handles: Mutex<FxHashMap<u64, Arc<Mutex<sys::DirStream>>>>,
    next_dir_fh: AtomicU64,
    ttl: Duration,
    caching: bool,
}

impl FsState {
    pub fn new(registry: InodeRegistry, tracer: Arc<Tracer>, caching: bool) -> Self {
        Self {
            registry,
            tracer,
            dir_handles: Mutex::new(FxHashMap::default()),
            next_dir_fh: AtomicU64::new(1),
            ttl: if caching { CACHED_TTL } else { Duration::ZERO },
            caching,
        }
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    pub fn registry(&self) -> &InodeRegistry {
        &self.registry
    }

    fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr, Errno> {
        let (_record, st) = self.registry.lookup(parent, name).map_err(|e| {
            debug!(parent, ?name, error = %e, "lookup failed");
            match e {
                super::registry::LookupError::Io(ref io_err) => io_errno(io_err),
                ref other => other.errno(),
            }
        })?;
        self.tracer.record(st.st_ino);
        Ok(stat_to_attr(&st))
    }

    fn forget_one(&self, ino: u64, nlookup: u64) {
        let _frame = self.tracer.frame_for(OpTag::ForgetOne, ino);
        self.registry.forget(ino, nlookup);
    }

    fn attr_of(&self, ino: u64) -> Result<FileAttr, Errno> {
        let record = self.registry.get(ino);
        let st = sys::stat_fd(record.fd()).map_err(|e| io_errno(&e))?;
        Ok(stat_to_attr(&st))
    }

    #[allow(clippy::too_many_arguments)]
    fn do_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr, Errno> {
        let record = self.registry.get(ino);
        let path_fd = record.fd();
        let file_fd = fh.map(|fh| fh as RawFd);

        let applied = (|| -> io::Result<()> {
            if let Some(mode) = mode {
                match file_fd {
                    Some(fd) => sys::fchmod(fd, mode as libc::mode_t)?,
                    None => sys::chmod_fd(path_fd, mode as libc::mode_t)?,
                }
            }
            if uid.is_some() || gid.is_some() {
                sys::chown_fd(path_fd, uid, gid)?;
            }
            if let Some(size) = size {
                match file_fd {
                    Some(fd) => sys::ftruncate(fd, size as i64)?,
                    None => sys::truncate_fd(path_fd, size as i64)?,
                }
            }
            if atime.is_some() || mtime.is_some() {
                let times = [to_timespec(atime), to_timespec(mtime)];
                match file_fd {
                    Some(fd) => sys::futimens(fd, &times)?,
                    None => sys::utimens_fd(path_fd, &times)?,
                }
            }
            Ok(())
        })();
        applied.map_err(|e| io_errno(&e))?;

        let st = sys::stat_fd(path_fd).map_err(|e| io_errno(&e))?;
        Ok(stat_to_attr(&st))
    }

    fn make_node(&self, parent: u64, name: &OsStr, kind: MakeNode<'_>) -> Result<FileAttr, Errno> {
        let record = self.registry.get(parent);
        let created = match kind {
            MakeNode::Dir { mode } => sys::mkdirat(record.fd(), name, mode),
            MakeNode::Symlink { target } => sys::symlinkat(target, record.fd(), name),
            MakeNode::Node { mode, rdev } => sys::mknodat(record.fd(), name, mode, rdev),
        };
        created.map_err(|e| io_errno(&e))?;
        self.do_lookup(parent, name)
    }

    fn do_link(&self, ino: u64, newparent: u64, newname: &OsStr) -> Result<FileAttr, Errno> {
        let record = self.registry.get(ino);
        let parent = self.registry.get(newparent);
        sys::link_fd(record.fd(), parent.fd(), newname).map_err(|e| io_errno(&e))?;
        let st = sys::stat_fd(record.fd()).map_err(|e| io_errno(&e))?;
        self.registry.retain(ino);
        Ok(stat_to_attr(&st))
    }

    fn do_open(&self, ino: u64, flags: i32) -> Result<u64, Errno> {
        let record = self.registry.get(ino);
        let mut flags = flags;
        // With writeback caching the kernel may issue reads on files that
        // userspace opened write-only, and handles O_APPEND itself.
        if self.caching && (flags & libc::O_ACCMODE) == libc::O_WRONLY {
            flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
        }
        if self.caching {
            flags &= !libc::O_APPEND;
        }
        let fd = sys::reopen(record.fd(), flags).map_err(|e| io_errno(&e))?;
        Ok(fd.into_raw_fd() as u64)
    }

    fn do_create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> Result<(FileAttr, u64), Errno> {
        let record = self.registry.get(parent);
        let fd = sys::openat(
            record.fd(),
            name,
            (flags | libc::O_CREAT) & !libc::O_NOFOLLOW,
            mode as libc::mode_t,
        )
        .map_err(|e| io_errno(&e))?;
        let attr = self.do_lookup(parent, name)?;
        Ok((attr, fd.into_raw_fd() as u64))
    }

    fn do_opendir(&self, ino: u64) -> Result<u64, Errno> {
        let record = self.registry.get(ino);
        let fd = sys::openat(record.fd(), OsStr::new("."), libc::O_RDONLY, 0)
            .map_err(|e| io_errno(&e))?;
        let stream = sys::DirStream::from_fd(fd).map_err(|e| io_errno(&e))?;

        let fh = self.next_dir_fh.fetch_add(1, Ordering::Relaxed);
        self.dir_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fh, Arc::new(Mutex::new(stream)));
        Ok(fh)
    }

    fn dir_stream(&self, fh: u64) -> Result<Arc<Mutex<sys::DirStream>>, Errno> {
        self.dir_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&fh)
            .cloned()
            .ok_or(libc::EBADF)
    }

    fn do_readdir(&self, fh: u64, offset: i64, reply: &mut ReplyDirectory) -> Result<(), Errno> {
        let stream = self.dir_stream(fh)?;
        let mut stream = stream.lock().unwrap_or_else(PoisonError::into_inner);
        if offset != stream.offset() {
            stream.seek(offset);
        }

        let mut added = false;
        loop {
            let entry = match stream.next_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                // Entries already in the reply carry no lookup count, so a
                // partial reply is safe; only a first-entry failure errors.
                Err(e) if added => {
                    warn!(error = %e, "readdir failed mid-stream");
                    break;
                }
                Err(e) => return Err(io_errno(&e)),
            };
            if entry.is_dot_or_dotdot() {
                continue;
            }
            // Surfacing an entry counts as an access even without a lookup.
            self.tracer.record(entry.ino);
            if reply.add(entry.ino, entry.offset, dirent_type(entry.type_), &entry.name) {
                break;
            }
            added = true;
        }
        Ok(())
    }

    fn do_readdirplus(
        &self,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: &mut ReplyDirectoryPlus,
    ) -> Result<(), Errno> {
        let stream = self.dir_stream(fh)?;
        let mut stream = stream.lock().unwrap_or_else(PoisonError::into_inner);
        if offset != stream.offset() {
            stream.seek(offset);
        }

        let mut added = false;
        loop {
            let entry = match stream.next_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) if added => {
                    warn!(error = %e, "readdirplus failed mid-stream");
                    break;
                }
                Err(e) => return Err(io_errno(&e)),
            };
            if entry.is_dot_or_dotdot() {
                continue;
            }
            let attr = match self.do_lookup(ino, &entry.name) {
                Ok(attr) => attr,
                Err(errno) if added => {
                    warn!(errno, "readdirplus lookup failed mid-stream");
                    break;
                }
                Err(errno) => return Err(errno),
            };
            if reply.add(attr.ino, entry.offset, &entry.name, &self.ttl, &attr, 0) {
                // The reply buffer rejected the entry; undo its lookup count.
                self.forget_one(attr.ino, 1);
                break;
            }
            added = true;
        }
        Ok(())
    }

    fn do_getxattr(&self, ino: u64, name: &OsStr, size: u32) -> Result<Xattr, Errno> {
        let record = self.registry.get(ino);
        if size == 0 {
            let len = sys::getxattr_fd(record.fd(), name, &mut []).map_err(|e| io_errno(&e))?;
            Ok(Xattr::Size(len as u32))
        } else {
            let mut value = vec![0u8; size as usize];
            let len = sys::getxattr_fd(record.fd(), name, &mut value).map_err(|e| io_errno(&e))?;
            value.truncate(len);
            Ok(Xattr::Data(value))
        }
    }

    fn do_listxattr(&self, ino: u64, size: u32) -> Result<Xattr, Errno> {
        let record = self.registry.get(ino);
        if size == 0 {
            let len = sys::listxattr_fd(record.fd(), &mut []).map_err(|e| io_errno(&e))?;
            Ok(Xattr::Size(len as u32))
        } else {
            let mut value = vec![0u8; size as usize];
            let len = sys::listxattr_fd(record.fd(), &mut value).map_err(|e| io_errno(&e))?;
            value.truncate(len);
            Ok(Xattr::Data(value))
        }
    }
}

/// The mounted filesystem. Owns the shared state and the runtime handle
/// upcalls are dispatched onto.
pub struct PeekFs {
    state: Arc<FsState>,
    runtime: tokio::runtime::Handle,
}

impl PeekFs {
    pub fn new(state: Arc<FsState>, runtime: tokio::runtime::Handle) -> Self {
        Self { state, runtime }
    }

    fn spawn(&self, span: tracing::Span, f: impl FnOnce(Arc<FsState>) + Send + 'static) {
        let state = Arc::clone(&self.state);
        self.runtime.spawn(async move { f(state) }.instrument(span));
    }
}

impl fuser::Filesystem for PeekFs {
    fn destroy(&mut self) {
        self.state.tracer.quiesce();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        let span = debug_span!("peekfs::lookup", parent, ?name);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Lookup, parent);
            match fs.do_lookup(parent, &name) {
                Ok(attr) => reply.entry(&fs.ttl, &attr, 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        let span = debug_span!("peekfs::forget", ino, nlookup);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame(OpTag::Forget);
            fs.forget_one(ino, nlookup);
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let span = debug_span!("peekfs::getattr", ino);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Getattr, ino);
            match fs.attr_of(ino) {
                Ok(attr) => reply.attr(&fs.ttl, &attr),
                Err(errno) => reply.error(errno),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let span = debug_span!("peekfs::setattr", ino);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Setattr, ino);
            match fs.do_setattr(ino, mode, uid, gid, size, atime, mtime, fh) {
                Ok(attr) => reply.attr(&fs.ttl, &attr),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let span = debug_span!("peekfs::readlink", ino);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Readlink, ino);
            let record = fs.registry.get(ino);
            match sys::readlink_fd(record.fd()) {
                Ok(target) => {
                    use std::os::unix::ffi::OsStrExt as _;
                    reply.data(target.as_bytes());
                }
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        let span = debug_span!("peekfs::mknod", parent, ?name);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Mknod, parent);
            let kind = MakeNode::Node {
                mode: mode as libc::mode_t,
                rdev: libc::dev_t::from(rdev),
            };
            match fs.make_node(parent, &name, kind) {
                Ok(attr) => reply.entry(&fs.ttl, &attr, 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        let span = debug_span!("peekfs::mkdir", parent, ?name);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Mkdir, parent);
            let kind = MakeNode::Dir {
                mode: mode as libc::mode_t,
            };
            match fs.make_node(parent, &name, kind) {
                Ok(attr) => reply.entry(&fs.ttl, &attr, 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let link_name = link_name.to_owned();
        let target = target.to_path_buf();
        let span = debug_span!("peekfs::symlink", parent, ?link_name);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Symlink, parent);
            let kind = MakeNode::Symlink {
                target: target.as_os_str(),
            };
            match fs.make_node(parent, &link_name, kind) {
                Ok(attr) => reply.entry(&fs.ttl, &attr, 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let newname = newname.to_owned();
        let span = debug_span!("peekfs::link", ino, newparent, ?newname);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Link, newparent);
            match fs.do_link(ino, newparent, &newname) {
                Ok(attr) => reply.entry(&fs.ttl, &attr, 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        let span = debug_span!("peekfs::unlink", parent, ?name);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Unlink, parent);
            let record = fs.registry.get(parent);
            match sys::unlinkat(record.fd(), &name, 0) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        let span = debug_span!("peekfs::rmdir", parent, ?name);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Rmdir, parent);
            let record = fs.registry.get(parent);
            match sys::unlinkat(record.fd(), &name, libc::AT_REMOVEDIR) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_owned();
        let newname = newname.to_owned();
        let span = debug_span!("peekfs::rename", parent, ?name, newparent, ?newname);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Rename, parent);
            if flags != 0 {
                // rename2 exchange/noreplace semantics are not forwarded.
                reply.error(libc::EINVAL);
                return;
            }
            let old_parent = fs.registry.get(parent);
            let new_parent = fs.registry.get(newparent);
            match sys::renameat(old_parent.fd(), &name, new_parent.fd(), &newname) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let span = debug_span!("peekfs::opendir", ino);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Opendir, ino);
            match fs.do_opendir(ino) {
                Ok(fh) => {
                    let open_flags = if fs.caching {
                        fuser::consts::FOPEN_KEEP_CACHE
                    } else {
                        0
                    };
                    reply.opened(fh, open_flags);
                }
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let span = debug_span!("peekfs::readdir", ino, offset);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Readdir, ino);
            match fs.do_readdir(fh, offset, &mut reply) {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let span = debug_span!("peekfs::readdirplus", ino, offset);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Readdirplus, ino);
            match fs.do_readdirplus(ino, fh, offset, &mut reply) {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        let span = debug_span!("peekfs::releasedir", ino, fh);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Releasedir, ino);
            fs.dir_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&fh);
            reply.ok();
        });
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let span = debug_span!("peekfs::fsyncdir", ino, fh);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Fsyncdir, ino);
            let stream = match fs.dir_stream(fh) {
                Ok(stream) => stream,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let fd = stream
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_raw_fd();
            match sys::fsync(fd, datasync) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_owned();
        let span = debug_span!("peekfs::create", parent, ?name);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Create, parent);
            match fs.do_create(parent, &name, mode, flags) {
                Ok((attr, fh)) => reply.created(&fs.ttl, &attr, 0, fh, 0),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let span = debug_span!("peekfs::open", ino);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Open, ino);
            match fs.do_open(ino, flags) {
                Ok(fh) => {
                    let open_flags = if fs.caching {
                        fuser::consts::FOPEN_KEEP_CACHE
                    } else {
                        0
                    };
                    reply.opened(fh, open_flags);
                }
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let span = debug_span!("peekfs::release", ino, fh);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Release, ino);
            sys::close(fh as RawFd);
            reply.ok();
        });
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let span = debug_span!("peekfs::flush", ino, fh);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Flush, ino);
            match sys::flush(fh as RawFd) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let span = debug_span!("peekfs::fsync", ino, fh);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Fsync, ino);
            match sys::fsync(fh as RawFd, datasync) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let span = debug_span!("peekfs::read", ino, fh, offset, size);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Read, ino);
            let mut buf = vec![0u8; size as usize];
            match sys::pread(fh as RawFd, &mut buf, offset) {
                Ok(n) => {
                    buf.truncate(n);
                    reply.data(&buf);
                }
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        let span = debug_span!("peekfs::write", ino, fh, offset, size = data.len());
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Write, ino);
            match sys::pwrite(fh as RawFd, &data, offset) {
                Ok(n) => reply.written(n as u32),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let span = debug_span!("peekfs::statfs", ino);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Statfs, ino);
            let record = fs.registry.get(ino);
            match sys::fstatvfs(record.fd()) {
                Ok(st) => reply.statfs(
                    st.f_blocks,
                    st.f_bfree,
                    st.f_bavail,
                    st.f_files,
                    st.f_ffree,
                    st.f_bsize as u32,
                    st.f_namemax as u32,
                    st.f_frsize as u32,
                ),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let span = debug_span!("peekfs::fallocate", ino, fh);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Fallocate, ino);
            if mode != 0 {
                reply.error(libc::EOPNOTSUPP);
                return;
            }
            match sys::fallocate(fh as RawFd, offset, length) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_owned();
        let value = value.to_vec();
        let span = debug_span!("peekfs::setxattr", ino, ?name);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Setxattr, ino);
            let record = fs.registry.get(ino);
            match sys::setxattr_fd(record.fd(), &name, &value, flags) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = name.to_owned();
        let span = debug_span!("peekfs::getxattr", ino, ?name);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Getxattr, ino);
            match fs.do_getxattr(ino, &name, size) {
                Ok(Xattr::Size(len)) => reply.size(len),
                Ok(Xattr::Data(value)) => reply.data(&value),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let span = debug_span!("peekfs::listxattr", ino);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Listxattr, ino);
            match fs.do_listxattr(ino, size) {
                Ok(Xattr::Size(len)) => reply.size(len),
                Ok(Xattr::Data(value)) => reply.data(&value),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        let span = debug_span!("peekfs::removexattr", ino, ?name);
        self.spawn(span, move |fs| {
            let _frame = fs.tracer.frame_for(OpTag::Removexattr, ino);
            let record = fs.registry.get(ino);
            match sys::removexattr_fd(record.fd(), &name) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(io_errno(&e)),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_to_attr_maps_types_and_permissions() {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        st.st_ino = 42;
        st.st_mode = libc::S_IFDIR | 0o755;
        st.st_nlink = 2;
        st.st_size = 4096;

        let attr = stat_to_attr(&st);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.nlink, 2);

        st.st_mode = libc::S_IFLNK | 0o777;
        assert_eq!(stat_to_attr(&st).kind, FileType::Symlink);
        st.st_mode = libc::S_IFREG | 0o644;
        assert_eq!(stat_to_attr(&st).kind, FileType::RegularFile);
    }

    #[test]
    fn timespec_mapping_honors_now_and_omit() {
        assert_eq!(to_timespec(Some(TimeOrNow::Now)).tv_nsec, libc::UTIME_NOW);
        assert_eq!(to_timespec(None).tv_nsec, libc::UTIME_OMIT);

        let at = UNIX_EPOCH + Duration::new(5, 7);
        let ts = to_timespec(Some(TimeOrNow::SpecificTime(at)));
        assert_eq!((ts.tv_sec, ts.tv_nsec), (5, 7));
    }

    #[test]
    fn dirent_types_cover_the_common_kinds() {
        assert_eq!(dirent_type(libc::DT_DIR), FileType::Directory);
        assert_eq!(dirent_type(libc::DT_LNK), FileType::Symlink);
        assert_eq!(dirent_type(libc::DT_REG), FileType::RegularFile);
        assert_eq!(dirent_type(libc::DT_UNKNOWN), FileType::RegularFile);
    }
}
