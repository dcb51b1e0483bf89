//! Thin wrappers over the fd-relative syscalls the passthrough layer
//! forwards to.
//!
//! Records hold `O_PATH` descriptors, so data and metadata operations that
//! need a real handle reopen through `/proc/self/fd/<fd>`; stats go through
//! `fstatat` with `AT_EMPTY_PATH`.

use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt as _, OsStringExt as _};
use std::path::{Path, PathBuf};

fn cstr(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `/proc/self/fd/<fd>`, the stable alias for an `O_PATH` descriptor.
pub fn proc_self_fd(fd: RawFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{fd}"))
}

/// `open(path, O_PATH | O_CLOEXEC)`.
pub fn open_path(path: &Path) -> io::Result<OwnedFd> {
    let path = cstr(path.as_os_str())?;
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// `openat(dirfd, name, flags)`, optionally creating with `mode`.
pub fn openat(dirfd: RawFd, name: &OsStr, flags: libc::c_int, mode: libc::mode_t) -> io::Result<OwnedFd> {
    let name = cstr(name)?;
    let fd = unsafe { libc::openat(dirfd, name.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Reopen an `O_PATH` descriptor with real access `flags`.
pub fn reopen(fd: RawFd, flags: libc::c_int) -> io::Result<OwnedFd> {
    let path = cstr(proc_self_fd(fd).as_os_str())?;
    let new = unsafe { libc::open(path.as_ptr(), (flags & !libc::O_NOFOLLOW) | libc::O_CLOEXEC) };
    if new == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// `fstatat(fd, "", AT_EMPTY_PATH | AT_SYMLINK_NOFOLLOW)`.
pub fn stat_fd(fd: RawFd) -> io::Result<libc::stat> {
    let empty = cstr(OsStr::new(""))?;
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    check(unsafe {
        libc::fstatat(
            fd,
            empty.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(unsafe { st.assume_init() })
}

/// `readlinkat(fd, "")` on an `O_PATH` descriptor for a symlink.
pub fn readlink_fd(fd: RawFd) -> io::Result<OsString> {
    let empty = cstr(OsStr::new(""))?;
    let mut buf = vec![0u8; libc::PATH_MAX as usize + 1];
    let len = unsafe {
        libc::readlinkat(fd, empty.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
    };
    if len == -1 {
        return Err(io::Error::last_os_error());
    }
    let len = len as usize;
    if len == buf.len() {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }
    buf.truncate(len);
    Ok(OsString::from_vec(buf))
}

pub fn mkdirat(dirfd: RawFd, name: &OsStr, mode: libc::mode_t) -> io::Result<()> {
    let name = cstr(name)?;
    check(unsafe { libc::mkdirat(dirfd, name.as_ptr(), mode) })
}

pub fn mknodat(dirfd: RawFd, name: &OsStr, mode: libc::mode_t, rdev: libc::dev_t) -> io::Result<()> {
    let name = cstr(name)?;
    check(unsafe { libc::mknodat(dirfd, name.as_ptr(), mode, rdev) })
}

pub fn symlinkat(target: &OsStr, dirfd: RawFd, name: &OsStr) -> io::Result<()> {
    let target = cstr(target)?;
    let name = cstr(name)?;
    check(unsafe { libc::symlinkat(target.as_ptr(), dirfd, name.as_ptr()) })
}

/// `linkat` from an `O_PATH` descriptor's proc alias into `newdirfd`.
pub fn link_fd(fd: RawFd, newdirfd: RawFd, newname: &OsStr) -> io::Result<()> {
    let source = cstr(proc_self_fd(fd).as_os_str())?;
    let newname = cstr(newname)?;
    check(unsafe {
        libc::linkat(
            libc::AT_FDCWD,
            source.as_ptr(),
            newdirfd,
            newname.as_ptr(),
            libc::AT_SYMLINK_FOLLOW,
        )
    })
}

pub fn unlinkat(dirfd: RawFd, name: &OsStr, flags: libc::c_int) -> io::Result<()> {
    let name = cstr(name)?;
    check(unsafe { libc::unlinkat(dirfd, name.as_ptr(), flags) })
}

pub fn renameat(olddirfd: RawFd, oldname: &OsStr, newdirfd: RawFd, newname: &OsStr) -> io::Result<()> {
    let oldname = cstr(oldname)?;
    let newname = cstr(newname)?;
    check(unsafe { libc::renameat(olddirfd, oldname.as_ptr(), newdirfd, newname.as_ptr()) })
}

pub fn fchmod(fd: RawFd, mode: libc::mode_t) -> io::Result<()> {
    check(unsafe { libc::fchmod(fd, mode) })
}

/// `chmod` through the proc alias of an `O_PATH` descriptor.
pub fn chmod_fd(fd: RawFd, mode: libc::mode_t) -> io::Result<()> {
    let path = cstr(proc_self_fd(fd).as_os_str())?;
    check(unsafe { libc::chmod(path.as_ptr(), mode) })
}

/// `fchownat(fd, "", …, AT_EMPTY_PATH | AT_SYMLINK_NOFOLLOW)`. A `None`
/// leaves that owner field unchanged.
pub fn chown_fd(fd: RawFd, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    let empty = cstr(OsStr::new(""))?;
    check(unsafe {
        libc::fchownat(
            fd,
            empty.as_ptr(),
            uid.unwrap_or(libc::uid_t::MAX),
            gid.unwrap_or(libc::gid_t::MAX),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

pub fn ftruncate(fd: RawFd, size: i64) -> io::Result<()> {
    check(unsafe { libc::ftruncate(fd, size) })
}

/// `truncate` through the proc alias of an `O_PATH` descriptor.
pub fn truncate_fd(fd: RawFd, size: i64) -> io::Result<()> {
    let path = cstr(proc_self_fd(fd).as_os_str())?;
    check(unsafe { libc::truncate(path.as_ptr(), size) })
}

pub fn futimens(fd: RawFd, times: &[libc::timespec; 2]) -> io::Result<()> {
    check(unsafe { libc::futimens(fd, times.as_ptr()) })
}

/// `utimensat` through the proc alias of an `O_PATH` descriptor.
pub fn utimens_fd(fd: RawFd, times: &[libc::timespec; 2]) -> io::Result<()> {
    let path = cstr(proc_self_fd(fd).as_os_str())?;
    check(unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) })
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> io::Result<usize> {
    let n = unsafe { libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset) };
    if n == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn pwrite(fd: RawFd, buf: &[u8], offset: i64) -> io::Result<usize> {
    let n = unsafe { libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset) };
    if n == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn fsync(fd: RawFd, datasync: bool) -> io::Result<()> {
    check(unsafe {
        if datasync {
            libc::fdatasync(fd)
        } else {
            libc::fsync(fd)
        }
    })
}

/// `close(dup(fd))`, the flush idiom for passthrough file handles.
pub fn flush(fd: RawFd) -> io::Result<()> {
    let dup = unsafe { libc::dup(fd) };
    if dup == -1 {
        return Err(io::Error::last_os_error());
    }
    check(unsafe { libc::close(dup) })
}

/// Close a raw descriptor previously handed out as a kernel file handle.
pub fn close(fd: RawFd) {
    drop(unsafe { OwnedFd::from_raw_fd(fd) });
}

pub fn fallocate(fd: RawFd, offset: i64, length: i64) -> io::Result<()> {
    let err = unsafe { libc::posix_fallocate(fd, offset, length) };
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Raise the open-file soft limit to the hard limit. The mount needs one
/// descriptor for every dentry the kernel knows about.
pub fn maximize_nofile_limit() -> io::Result<u64> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    check(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) })?;
    lim.rlim_cur = lim.rlim_max;
    check(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lim) })?;
    Ok(lim.rlim_cur)
}

pub fn fstatvfs(fd: RawFd) -> io::Result<libc::statvfs> {
    let mut st = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    check(unsafe { libc::fstatvfs(fd, st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

/// `getxattr` through the proc alias. With an empty buffer, returns the
/// value size only.
pub fn getxattr_fd(fd: RawFd, name: &OsStr, buf: &mut [u8]) -> io::Result<usize> {
    let path = cstr(proc_self_fd(fd).as_os_str())?;
    let name = cstr(name)?;
    let n = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if n == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn setxattr_fd(fd: RawFd, name: &OsStr, value: &[u8], flags: libc::c_int) -> io::Result<()> {
    let path = cstr(proc_self_fd(fd).as_os_str())?;
    let name = cstr(name)?;
    check(unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            flags,
        )
    })
}

pub fn listxattr_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let path = cstr(proc_self_fd(fd).as_os_str())?;
    let n = unsafe { libc::listxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
    if n == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn removexattr_fd(fd: RawFd, name: &OsStr) -> io::Result<()> {
    let path = cstr(proc_self_fd(fd).as_os_str())?;
    let name = cstr(name)?;
    check(unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) })
}

/// One entry read from a [`DirStream`].
pub struct DirEntry {
    pub ino: u64,
    pub offset: i64,
    pub type_: u8,
    pub name: OsString,
}

impl DirEntry {
    pub fn is_dot_or_dotdot(&self) -> bool {
        let bytes = self.name.as_bytes();
        bytes == b"." || bytes == b".."
    }
}

/// Seekable directory stream over an open directory descriptor.
pub struct DirStream {
    dirp: *mut libc::DIR,
    offset: i64,
}

// The stream is handed between worker threads behind a mutex; the DIR
// itself is only ever touched by the lock holder.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Take ownership of `fd` (an `O_RDONLY` directory descriptor) as a
    /// directory stream.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let raw = fd.as_raw_fd();
        let dirp = unsafe { libc::fdopendir(raw) };
        if dirp.is_null() {
            return Err(io::Error::last_os_error());
        }
        // The stream owns the descriptor now.
        std::mem::forget(fd);
        Ok(Self { dirp, offset: 0 })
    }

    /// The descriptor underlying the stream.
    pub fn as_raw_fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dirp) }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.dirp, offset) };
        self.offset = offset;
    }

    /// The next entry, `None` at end of stream.
    pub fn next_entry(&mut self) -> io::Result<Option<DirEntry>> {
        // readdir distinguishes end-of-stream from failure via errno.
        unsafe { *libc::__errno_location() = 0 };
        let entry = unsafe { libc::readdir(self.dirp) };
        if entry.is_null() {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(0) => Ok(None),
                _ => Err(err),
            };
        }

        let entry = unsafe { &*entry };
        self.offset = entry.d_off;
        let name_len = unsafe { libc::strlen(entry.d_name.as_ptr()) };
        let name_bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(entry.d_name.as_ptr().cast(), name_len)
        };
        Ok(Some(DirEntry {
            ino: entry.d_ino,
            offset: entry.d_off,
            type_: entry.d_type,
            name: OsStr::from_bytes(name_bytes).to_owned(),
        }))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dirp) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::fd::AsRawFd as _;

    #[test]
    fn open_path_and_stat_fd_agree_with_metadata() {
        use std::os::unix::fs::MetadataExt as _;

        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("f"), b"x").expect("write");

        let fd = open_path(dir.path()).expect("open O_PATH");
        let st = stat_fd(fd.as_raw_fd()).expect("fstatat");
        let meta = fs::metadata(dir.path()).expect("metadata");
        assert_eq!(st.st_ino, meta.ino());
        assert_eq!(st.st_dev, meta.dev());
    }

    #[test]
    fn openat_resolves_relative_to_dirfd() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("child"), b"payload").expect("write");

        let dirfd = open_path(dir.path()).expect("open dir");
        let child = openat(
            dirfd.as_raw_fd(),
            OsStr::new("child"),
            libc::O_PATH | libc::O_NOFOLLOW,
            0,
        )
        .expect("openat child");
        let st = stat_fd(child.as_raw_fd()).expect("stat child");
        assert_eq!(st.st_size, 7);
    }

    #[test]
    fn reopen_grants_real_access() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("data"), b"content").expect("write");

        let dirfd = open_path(dir.path()).expect("open dir");
        let path_fd = openat(
            dirfd.as_raw_fd(),
            OsStr::new("data"),
            libc::O_PATH | libc::O_NOFOLLOW,
            0,
        )
        .expect("openat");
        let rw = reopen(path_fd.as_raw_fd(), libc::O_RDONLY).expect("reopen");

        let mut buf = [0u8; 16];
        let n = pread(rw.as_raw_fd(), &mut buf, 0).expect("pread");
        assert_eq!(&buf[..n], b"content");
    }

    #[test]
    fn dir_stream_lists_children() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a"), b"").expect("write");
        fs::create_dir(dir.path().join("b")).expect("mkdir");

        let dirfd = open_path(dir.path()).expect("open dir");
        let read_fd = openat(dirfd.as_raw_fd(), OsStr::new("."), libc::O_RDONLY, 0)
            .expect("open for reading");
        let mut stream = DirStream::from_fd(read_fd).expect("fdopendir");

        let mut names = Vec::new();
        while let Some(entry) = stream.next_entry().expect("readdir") {
            if !entry.is_dot_or_dotdot() {
                names.push(entry.name.to_string_lossy().into_owned());
            }
        }
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }
}
