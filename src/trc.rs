//! Tracing configuration and initialization.

use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _, util::TryInitError,
};

/// Builder for the tracing subscriber.
pub struct Trc {
    env_filter: EnvFilter,
}

impl Trc {
    /// Filter from `PEEKFS_LOG` when set; otherwise `info`, or `debug` when
    /// verbose output is requested.
    pub fn new(verbose: bool) -> Self {
        let default_level = if verbose { "debug" } else { "info" };
        let env_filter = EnvFilter::try_from_env("PEEKFS_LOG")
            .unwrap_or_else(|_| EnvFilter::new(default_level));
        Self { env_filter }
    }

    /// Initialize the global tracing subscriber.
    pub fn init(self) -> Result<(), TryInitError> {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(self.env_filter)
            .try_init()
    }
}
