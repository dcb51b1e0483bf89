//! Mount lifecycle: startup order, signal handling, and teardown.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::select;
use tracing::{debug, error, info, warn};

use peekfs::fs::fuser::{FsState, PeekFs};
use peekfs::fs::registry::InodeRegistry;
use peekfs::fs::sys;
use peekfs::index::moniker::MonikerTable;
use peekfs::index::scan;
use peekfs::trace::tracer::Tracer;

use crate::app_config::Config;

mod managed_fuse {
    //! fuser only performs a regular unmount when its `BackgroundSession`
    //! drops; this guard follows up with a forced detach so a busy mount
    //! point cannot outlive the daemon.

    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use nix::errno::Errno;
    use tracing::{debug, error};

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(mount_point: &Path) -> Self {
            Self {
                mount_point: mount_point.to_path_buf(),
            }
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "confirming unmount of the filesystem");

            for attempt in 1..=UMOUNT_ATTEMPT_COUNT {
                match nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH) {
                    Ok(()) => {
                        debug!(attempt, "unmounted the filesystem");
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(attempt, "filesystem still busy, retrying");
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!(attempt, "filesystem already unmounted");
                        break;
                    }
                    Err(e) => {
                        error!(attempt, error = %e, "failed to unmount the filesystem");
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents).
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &Path) -> io::Result<()> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!(
                        "mount point '{}' already exists and is not empty",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "created mount point directory");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Write the process ID to `path`, durably, once the mount is up.
fn maybe_write_pid_file(path: Option<&Path>) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt as _;

    let Some(path) = path else {
        return Ok(());
    };
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    let content = format!("{}\n", std::process::id());
    peekfs::io::try_write(&file, content.as_bytes())?;
    peekfs::io::try_fsync(&file, 5)?;
    info!(path = %path.display(), "wrote pid file");
    Ok(())
}

async fn wait_for_exit(tracer: &Tracer) -> io::Result<()> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    loop {
        select! {
            _ = signal::ctrl_c() => {
                debug!("received Ctrl+C, shutting down");
                return Ok(());
            },
            _ = sigterm.recv() => {
                debug!("received termination signal, shutting down");
                return Ok(());
            },
            _ = sighup.recv() => {
                info!("received hangup signal, writing access log");
                tracer.quiesce();
            },
        }
    }
}

/// Main entry point for the daemon.
pub async fn run(config: Config, handle: tokio::runtime::Handle) -> io::Result<()> {
    info!(
        "projecting '{}' -> '{}'",
        config.source_directory.display(),
        config.target_directory.display()
    );

    // One descriptor per kernel-known dentry adds up fast.
    match sys::maximize_nofile_limit() {
        Ok(limit) => debug!(limit, "raised open file limit"),
        Err(e) => warn!(error = %e, "could not raise open file limit"),
    }

    prepare_mount_point(&config.target_directory).await?;

    let registry = InodeRegistry::open(&config.source_directory)?;
    let monikers = Arc::new(MonikerTable::new(registry.root().src_ino()));
    let added = scan::populate(
        &monikers,
        &config.source_directory,
        config.record_file_access,
    )?;
    info!(added, "populated moniker table");

    let tracer = Arc::new(Tracer::new(
        config.access_log_directory.clone(),
        Arc::clone(&monikers),
    ));

    // Apply modes exactly as the kernel sends them.
    nix::sys::stat::umask(nix::sys::stat::Mode::empty());

    let state = Arc::new(FsState::new(registry, Arc::clone(&tracer), config.cache));
    let fs = PeekFs::new(state, handle);

    let mount_opts = [
        fuser::MountOption::FSName("peekfs".to_owned()),
        fuser::MountOption::RW,
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::AutoUnmount,
    ];

    info!("mounting filesystem at {}", config.target_directory.display());
    let managed = managed_fuse::ManagedFuse::new(&config.target_directory);
    {
        let _session = fuser::spawn_mount2(fs, &config.target_directory, &mount_opts)?;
        maybe_write_pid_file(config.pid_file.as_deref())?;
        info!("peekfs is running; SIGHUP writes the access log");

        wait_for_exit(&tracer).await?;
    }
    drop(managed);
    Ok(())
}

pub fn spawn(config: Config) -> io::Result<()> {
    let runtime = if config.multithreaded {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(10)
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    };
    let handle = runtime.handle().clone();
    let result = runtime.block_on(run(config, handle));
    if let Err(ref e) = result {
        error!(error = %e, "daemon failed");
    }
    result
}
