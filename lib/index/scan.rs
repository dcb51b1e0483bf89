//! One-shot recursive scan that seeds the moniker table.

use std::io;
use std::os::unix::fs::MetadataExt as _;
use std::path::Path;

use tracing::trace;
use walkdir::{DirEntryExt as _, WalkDir};

use super::moniker::MonikerTable;

/// Walk `source` and record every directory (and, when `include_files` is
/// set, every non-directory) in `table`, keyed by source inode number and
/// mapped to its path relative to `source`. Returns the number of entries
/// offered to the table.
///
/// Symlinks are not followed and the walk does not cross device boundaries.
pub fn populate(table: &MonikerTable, source: &Path, include_files: bool) -> io::Result<usize> {
    let src_dev = source.metadata()?.dev();
    let mut additions = 0usize;

    let walk = WalkDir::new(source)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| on_device(entry, src_dev));

    for entry in walk {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_dir() && !include_files {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .unwrap_or_else(|_| unreachable!("walk entries live under the walk root"));
        table.insert(entry.ino(), relative.as_os_str());
        additions += 1;
        trace!(ino = entry.ino(), path = %relative.display(), "indexed");
    }

    Ok(additions)
}

fn on_device(entry: &walkdir::DirEntry, src_dev: u64) -> bool {
    entry.metadata().map(|m| m.dev() == src_dev).unwrap_or(true)
}
