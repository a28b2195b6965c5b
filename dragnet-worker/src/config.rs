use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Ambient worker tuning knobs, read from the environment. Operator-facing
/// selections (transport, store, concurrency overrides) arrive through the
/// CLI and are merged over these defaults.
#[derive(Envconfig, Clone)]
pub struct WorkerConfig {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "worker")]
    pub worker_name: String,

    /// The interval for polling the job queue.
    #[envconfig(default = "100")]
    pub poll_interval: EnvMsDuration,

    /// How long a cancelled scan gets to surface its partial result.
    #[envconfig(default = "500")]
    pub partial_result_grace: EnvMsDuration,

    /// Upper bound on unacknowledged deliveries held by this consumer.
    #[envconfig(default = "64")]
    pub prefetch: usize,

    /// Concurrent scans per bulk scan on this worker.
    #[envconfig(default = "32")]
    pub parallel_scan_threads: usize,

    /// Concurrent connections inside one scan.
    #[envconfig(default = "16")]
    pub parallel_connection_threads: usize,

    /// Idle time before a bulk scan worker is torn down.
    #[envconfig(default = "300000")]
    pub bulk_worker_idle_ttl: EnvMsDuration,

    /// How long a dequeued job may sit unacknowledged before the reaper
    /// makes it redeliverable.
    #[envconfig(default = "600000")]
    pub visibility_timeout: EnvMsDuration,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,
}

impl WorkerConfig {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
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
