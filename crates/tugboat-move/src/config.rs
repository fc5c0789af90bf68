//! Mover timing

use std::time::Duration;

use tracing::debug;

/// Overrides the Machine readiness timeout, in minutes
pub const MACHINE_READY_TIMEOUT_ENV: &str = "CLUSTER_API_MACHINE_READY_TIMEOUT";

/// Default poll interval while waiting for a moved Machine to get a node
pub const DEFAULT_MACHINE_READY_INTERVAL: Duration = Duration::from_secs(10);
/// Default upper bound on waiting for a moved Machine to get a node
pub const DEFAULT_MACHINE_READY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Default poll interval while waiting for the Cluster API to be served
pub const DEFAULT_API_READY_INTERVAL: Duration = Duration::from_secs(10);
/// Default upper bound on waiting for the Cluster API to be served
pub const DEFAULT_API_READY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Poll intervals and bounds used while moving objects
#[derive(Clone, Debug)]
pub struct MoverConfig {
    /// Poll interval while waiting for a moved Machine to get a node
    pub machine_ready_interval: Duration,
    /// Explicit Machine readiness bound; `None` uses the environment or default
    pub machine_ready_timeout: Option<Duration>,
    /// Poll interval while waiting for the Cluster API on either side
    pub api_ready_interval: Duration,
    /// Upper bound on waiting for the Cluster API on either side
    pub api_ready_timeout: Duration,
}

impl Default for MoverConfig {
    fn default() -> Self {
        Self {
            machine_ready_interval: DEFAULT_MACHINE_READY_INTERVAL,
            machine_ready_timeout: None,
            api_ready_interval: DEFAULT_API_READY_INTERVAL,
            api_ready_timeout: DEFAULT_API_READY_TIMEOUT,
        }
    }
}

impl MoverConfig {
    /// Config with default timing
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Machine readiness poll interval
    pub fn with_machine_ready_interval(mut self, interval: Duration) -> Self {
        self.machine_ready_interval = interval;
        self
    }

    /// Set the Machine readiness bound, ignoring the environment
    pub fn with_machine_ready_timeout(mut self, timeout: Duration) -> Self {
        self.machine_ready_timeout = Some(timeout);
        self
    }

    /// Set the Cluster API readiness poll
    pub fn with_api_ready_wait(mut self, interval: Duration, timeout: Duration) -> Self {
        self.api_ready_interval = interval;
        self.api_ready_timeout = timeout;
        self
    }

    /// Machine readiness bound for one batch of Machines
    pub fn machine_ready_timeout(&self) -> Duration {
        match self.machine_ready_timeout {
            Some(timeout) => timeout,
            None => timeout_from_env(std::env::var(MACHINE_READY_TIMEOUT_ENV).ok().as_deref()),
        }
    }
}

/// Parse the override; anything but a whole number of minutes keeps the default
fn timeout_from_env(value: Option<&str>) -> Duration {
    let Some(value) = value else {
        return DEFAULT_MACHINE_READY_TIMEOUT;
    };
    match value.trim().parse::<u64>() {
        Ok(minutes) => Duration::from_secs(minutes * 60),
        Err(e) => {
            debug!(value = %value, error = %e, "Ignoring invalid {}", MACHINE_READY_TIMEOUT_ENV);
            DEFAULT_MACHINE_READY_TIMEOUT
        }
    }
}
