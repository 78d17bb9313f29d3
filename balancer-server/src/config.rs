use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use meta_balancer::BalancerConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3309")]
    pub port: u16,

    #[envconfig(default = "10")]
    pub task_concurrency: usize,

    #[envconfig(default = "10")]
    pub heartbeat_interval_secs: u64,

    #[envconfig(default = "0.1")]
    pub leader_balance_deviation: f64,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn balancer(&self) -> BalancerConfig {
        BalancerConfig {
            task_concurrency: self.task_concurrency,
            heartbeat_interval: time::Duration::from_secs(self.heartbeat_interval_secs),
            leader_balance_deviation: self.leader_balance_deviation,
            request_timeout: self.request_timeout.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
