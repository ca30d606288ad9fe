//! Logging setup and timing helpers.
//!
//! The library only emits `tracing` events. Applications that want them on
//! stderr call [`init`] once; `RUST_LOG` takes precedence over the level
//! passed in.

use std::time::{Duration, Instant};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a stderr subscriber filtering `simetl` events at `level`.
///
/// Returns false if a global subscriber was already installed, in which case
/// nothing changes.
pub fn init(level: &str) -> bool {
    let default_filter = format!("simetl={level}");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(level, "simetl logging initialized");
    }
    installed
}

/// Measures the time since it was started or last reported.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Starts timing now.
    #[must_use]
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// Time since start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed seconds since the last lap, restarting the clock.
    pub fn lap(&mut self) -> f64 {
        let now = Instant::now();
        let secs = now.duration_since(self.start).as_secs_f64();
        self.start = now;
        secs
    }
}
