//! Mirror a source directory under a mount point and record which files are
//! accessed through it.

use std::path::PathBuf;

use clap::Parser;

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;

#[derive(Parser)]
#[command(version, about = "Passthrough filesystem that records file access.")]
struct Args {
    /// Optional path to a TOML config file; flags override its keys.
    #[arg(short, long, value_parser)]
    config_path: Option<PathBuf>,

    /// Source directory to mirror and index.
    #[arg(long)]
    source_directory: Option<PathBuf>,

    /// Target directory (mount point).
    #[arg(long)]
    target_directory: Option<PathBuf>,

    /// Log accesses to files in the given directory.
    #[arg(long)]
    access_log_directory: Option<PathBuf>,

    /// Record file access, not just directory access.
    #[arg(long)]
    record_file_access: bool,

    /// Disable kernel metadata caching.
    #[arg(long)]
    no_cache: bool,

    /// Serve upcalls from a single thread instead of a pool.
    #[arg(long)]
    single_threaded: bool,

    /// Enable verbose logging.
    #[arg(long)]
    debug: bool,

    /// Write the PID of the process to the given file.
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(source) = self.source_directory {
            config.source_directory = source;
        }
        if let Some(target) = self.target_directory {
            config.target_directory = target;
        }
        if let Some(log_dir) = self.access_log_directory {
            config.access_log_directory = Some(log_dir);
        }
        if self.record_file_access {
            config.record_file_access = true;
        }
        if self.no_cache {
            config.cache = false;
        }
        if self.single_threaded {
            config.multithreaded = false;
        }
        if self.debug {
            config.debug = true;
        }
        if let Some(pid_file) = self.pid_file {
            config.pid_file = Some(pid_file);
        }
    }
}

/// Main entry point for the application.
#[expect(
    clippy::exit,
    reason = "top-level entry point that intentionally terminates the process"
)]
fn main() {
    let args = Args::parse();

    // Config loading happens before tracing exists; report errors directly.
    let mut config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    args.apply(&mut config);

    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    if let Err(e) = trc::Trc::new(config.debug).init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    if daemon::spawn(config).is_err() {
        std::process::exit(1);
    }
}
