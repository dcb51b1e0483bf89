//! Durable write helpers shared by log emission and pid-file writing.

use std::fs::File;
use std::io::{self, Write as _};

/// Write the whole buffer to `file`, retrying interrupted and would-block
/// writes until everything is on its way to the kernel.
pub fn try_write(mut file: &File, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match file.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write made no progress",
                ));
            }
            Ok(n) => buf = &buf[n..],
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fsync `file`, retrying up to `tries` times. Returns the last error if
/// every attempt fails.
pub fn try_fsync(file: &File, tries: u32) -> io::Result<()> {
    let mut last = None;
    for _ in 0..tries {
        match file.sync_all() {
            Ok(()) => return Ok(()),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| io::Error::other("fsync attempted zero times")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_write_writes_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out");
        let file = File::create(&path).expect("create");
        try_write(&file, b"hello\nworld\n").expect("write");
        assert_eq!(
            std::fs::read(&path).expect("read back"),
            b"hello\nworld\n",
            "file should contain exactly the written bytes"
        );
    }

    #[test]
    fn try_fsync_succeeds_on_regular_file() {
        let file = tempfile::tempfile().expect("tempfile");
        try_fsync(&file, 5).expect("fsync should succeed on a regular file");
    }
}
