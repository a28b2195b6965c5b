use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Ambient controller tuning knobs, read from the environment. The
/// operator-facing selections (target source, schedule, store naming)
/// arrive through the CLI.
#[derive(Envconfig, Clone)]
pub struct ControllerConfig {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    /// The interval for draining done notifications.
    #[envconfig(default = "250")]
    pub done_poll_interval: EnvMsDuration,

    /// The interval between progress reports.
    #[envconfig(default = "10000")]
    pub monitor_interval: EnvMsDuration,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,
}

impl ControllerConfig {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Bounded parallelism for target expansion: wide enough to hide DNS
/// latency, narrow enough not to dominate the host.
pub fn default_expansion_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
        .min(64)
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
