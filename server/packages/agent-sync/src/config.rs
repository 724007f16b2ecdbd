use std::time::Duration;

use crate::accumulator::ThrottleConfig;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(54);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

pub const DEFAULT_RESUME_GUIDANCE: &str = "The sandbox was restarted. Please continue working on your current task.\n\nIf you were in the middle of something, please resume from where you left off.\nIf you need to verify the current state, check the git status and any running processes.";

/// Tunables for the sync engine. Defaults match production settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bound on held (pre-ready) and in-channel outbound commands per host.
    pub queue_capacity: usize,
    pub ready_timeout: Duration,
    pub throttle: ThrottleConfig,
    pub reconcile_interval: Duration,
    /// How long a requested backend start suppresses another request.
    pub restart_grace: Duration,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub subscriber_buffer: usize,
    pub resume_guidance: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            throttle: ThrottleConfig::default(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            restart_grace: DEFAULT_RECONCILE_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            resume_guidance: DEFAULT_RESUME_GUIDANCE.to_string(),
        }
    }
}
