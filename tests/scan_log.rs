#![allow(clippy::unwrap_used, missing_docs)]

//! End-to-end: scan a source tree, record accesses, quiesce, read the log.

use std::fs;
use std::os::unix::fs::MetadataExt as _;
use std::sync::Arc;

use peekfs::index::moniker::MonikerTable;
use peekfs::index::scan;
use peekfs::trace::tracer::{OpTag, Tracer};

struct Fixture {
    source: tempfile::TempDir,
    logs: tempfile::TempDir,
    monikers: Arc<MonikerTable>,
}

fn fixture(include_files: bool) -> Fixture {
    let source = tempfile::tempdir().expect("source tempdir");
    fs::create_dir_all(source.path().join("foo/bar")).expect("mkdirs");
    fs::write(source.path().join("foo/1"), b"one").expect("write foo/1");
    fs::write(source.path().join("foo/bar/2"), b"two").expect("write foo/bar/2");

    let root_ino = fs::metadata(source.path()).expect("stat source").ino();
    let monikers = Arc::new(MonikerTable::new(root_ino));
    scan::populate(&monikers, source.path(), include_files).expect("scan");

    Fixture {
        source,
        logs: tempfile::tempdir().expect("log tempdir"),
        monikers,
    }
}

fn ino_of(fixture: &Fixture, rel: &str) -> u64 {
    fs::metadata(fixture.source.path().join(rel))
        .expect("stat entry")
        .ino()
}

fn log_lines(path: &std::path::Path) -> Vec<String> {
    let contents = fs::read_to_string(path).expect("read log");
    let mut lines: Vec<String> = contents.lines().map(str::to_owned).collect();
    lines.sort();
    lines
}

#[test]
fn accessed_files_end_up_in_the_log() {
    let fixture = fixture(true);
    let tracer = Tracer::new(
        Some(fixture.logs.path().to_path_buf()),
        Arc::clone(&fixture.monikers),
    );

    {
        let _frame = tracer.frame_for(OpTag::Open, ino_of(&fixture, "foo/1"));
    }
    {
        let _frame = tracer.frame_for(OpTag::Getattr, ino_of(&fixture, "foo/bar/2"));
    }

    let path = tracer.quiesce().expect("log written");
    assert_eq!(log_lines(&path), ["foo/1", "foo/bar/2"]);
}

#[test]
fn scan_without_files_drops_file_accesses_from_the_log() {
    let fixture = fixture(false);
    let tracer = Tracer::new(
        Some(fixture.logs.path().to_path_buf()),
        Arc::clone(&fixture.monikers),
    );

    // The file inode was never indexed; the directory was.
    tracer.record(ino_of(&fixture, "foo/1"));
    tracer.record(ino_of(&fixture, "foo/bar"));

    let path = tracer.quiesce().expect("log written");
    assert_eq!(log_lines(&path), ["foo/bar"]);
}

#[test]
fn each_quiesce_starts_a_fresh_epoch_and_set() {
    let fixture = fixture(true);
    let tracer = Tracer::new(
        Some(fixture.logs.path().to_path_buf()),
        Arc::clone(&fixture.monikers),
    );

    tracer.record(ino_of(&fixture, "foo/1"));
    let first = tracer.quiesce().expect("first log");
    assert_eq!(log_lines(&first), ["foo/1"]);

    tracer.record(ino_of(&fixture, "foo/bar/2"));
    let second = tracer.quiesce().expect("second log");
    assert_eq!(
        log_lines(&second),
        ["foo/bar/2"],
        "earlier accesses were drained by the first quiesce"
    );
    assert_ne!(first, second, "epoch counter names distinct files");
}

#[test]
fn duplicate_accesses_log_once() {
    let fixture = fixture(true);
    let tracer = Tracer::new(
        Some(fixture.logs.path().to_path_buf()),
        Arc::clone(&fixture.monikers),
    );

    let ino = ino_of(&fixture, "foo/1");
    for _ in 0..100 {
        tracer.record(ino);
    }
    let path = tracer.quiesce().expect("log written");
    assert_eq!(log_lines(&path), ["foo/1"]);
}

#[test]
fn accesses_from_many_threads_all_land_in_one_log() {
    let fixture = fixture(true);
    let tracer = Arc::new(Tracer::new(
        Some(fixture.logs.path().to_path_buf()),
        Arc::clone(&fixture.monikers),
    ));

    let targets = ["foo", "foo/1", "foo/bar", "foo/bar/2"];
    let mut workers = Vec::new();
    for rel in targets {
        let tracer = Arc::clone(&tracer);
        let ino = ino_of(&fixture, rel);
        workers.push(std::thread::spawn(move || {
            let _frame = tracer.frame_for(OpTag::Lookup, ino);
        }));
    }
    for w in workers {
        w.join().expect("worker panicked");
    }

    let path = tracer.quiesce().expect("log written");
    assert_eq!(log_lines(&path), ["foo", "foo/1", "foo/bar", "foo/bar/2"]);
}
