//! Group construction options.

use crate::transport::TcpDevice;
use std::time::Duration;

/// Options for [`ProcessGroup::new`](crate::ProcessGroup::new).
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Transport endpoints, one connected context each. Must be non-empty.
    pub devices: Vec<TcpDevice>,

    /// Timeout applied to rendezvous, connects and collective receives.
    pub timeout: Duration,

    /// Number of worker threads executing queued work.
    pub threads: usize,

    /// Reserved for algorithm-cache sizing; currently unused.
    pub cache_num_algorithm_entries: usize,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            timeout: Duration::from_millis(10_000),
            threads: 2,
            cache_num_algorithm_entries: 1,
        }
    }
}

impl GroupOptions {
    /// Defaults with a single loopback device. Suitable for same-host
    /// groups and tests.
    pub fn loopback() -> Self {
        Self {
            devices: vec![TcpDevice::loopback()],
            ..Self::default()
        }
    }

    /// Defaults overridden from the environment.
    ///
    /// Recognized variables:
    /// - `PLEXUS_TIMEOUT_MS`
    /// - `PLEXUS_THREADS`
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(v) = std::env::var("PLEXUS_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                options.timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("PLEXUS_THREADS") {
            if let Ok(n) = v.parse::<usize>() {
                options.threads = n;
            }
        }
        options
    }
}
