use std::time;

/// Runtime knobs of the balancer, threaded through the constructors instead
/// of living in process-wide flags.
#[derive(Clone, Debug)]
pub struct BalancerConfig {
    /// Upper bound on concurrently executing balance tasks; tasks touching
    /// the same partition are always serialized regardless.
    pub task_concurrency: usize,
    /// Expected interval between host heartbeats. A host is considered
    /// active while its last heartbeat is younger than twice this interval.
    pub heartbeat_interval: time::Duration,
    /// Tolerated relative deviation from the ideal per-host leader count.
    pub leader_balance_deviation: f64,
    /// Timeout applied to every admin RPC.
    pub request_timeout: time::Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            task_concurrency: 10,
            heartbeat_interval: time::Duration::from_secs(10),
            leader_balance_deviation: 0.1,
            request_timeout: time::Duration::from_secs(5),
        }
    }
}
