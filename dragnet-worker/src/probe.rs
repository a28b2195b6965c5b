//! The built-in TCP connect/banner probe.
//!
//! A deliberately small scan function that still exercises every framework
//! seam: multi-stage sub-probes, partial-result publication between stages,
//! and scan-internal connection parallelism. Protocol-specific scanners
//! implement [`ScanFunction`] the same way and plug in via their own
//! [`ScannerFactory`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dragnet_common::job::{ScanConfig, ScanDetail, ScanTarget};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use crate::scan::{PartialResultSink, ScanError, ScanFunction, ScannerFactory};

const BANNER_READ_LIMIT: usize = 256;
const BANNER_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// How many connect samples each detail level takes.
fn sample_count(detail: ScanDetail) -> usize {
    match detail {
        ScanDetail::Quick => 1,
        ScanDetail::Normal => 3,
        ScanDetail::Detailed => 8,
        ScanDetail::All => 16,
    }
}

pub struct TcpProbe {
    detail: ScanDetail,
    connect_timeout: Duration,
    /// Bounds concurrent connections within one scan.
    connections: Arc<Semaphore>,
}

impl TcpProbe {
    fn address(target: &ScanTarget) -> Result<SocketAddr, ScanError> {
        let ip = target.ip.ok_or_else(|| {
            ScanError::Probe(format!("target {target} has no resolved address"))
        })?;
        Ok(SocketAddr::new(ip, target.port))
    }

    async fn timed_connect(&self, addr: SocketAddr) -> Result<(TcpStream, Duration), ScanError> {
        let _permit = self
            .connections
            .acquire()
            .await
            .expect("connection limiter closed");
        let started = Instant::now();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ScanError::Probe(format!("connect to {addr} timed out")))??;
        Ok((stream, started.elapsed()))
    }

    async fn read_banner(&self, mut stream: TcpStream) -> Option<String> {
        let mut buffer = vec![0u8; BANNER_READ_LIMIT];
        match tokio::time::timeout(BANNER_READ_TIMEOUT, stream.read(&mut buffer)).await {
            Ok(Ok(n)) if n > 0 => Some(String::from_utf8_lossy(&buffer[..n]).into_owned()),
            _ => None,
        }
    }
}

#[async_trait]
impl ScanFunction for TcpProbe {
    async fn scan(
        &self,
        target: &ScanTarget,
        progress: &PartialResultSink,
    ) -> Result<serde_json::Value, ScanError> {
        let addr = Self::address(target)?;

        // Stage 1: one connect, whose stream also feeds the banner read.
        let (stream, first_latency) = self.timed_connect(addr).await?;
        let mut document = json!({
            "probe": "tcp",
            "reachable": true,
            "connect_latency_ms": first_latency.as_millis() as u64,
        });
        progress.publish(document.clone());

        // Stage 2: banner grab.
        if let Some(banner) = self.read_banner(stream).await {
            document["banner"] = json!(banner);
        }
        progress.publish(document.clone());

        // Stage 3: latency samples, fanned out across the connection budget.
        let samples = sample_count(self.detail);
        if samples > 1 {
            let mut tasks = tokio::task::JoinSet::new();
            for _ in 0..samples {
                let connections = self.connections.clone();
                let connect_timeout = self.connect_timeout;
                tasks.spawn(async move {
                    let _permit = connections
                        .acquire_owned()
                        .await
                        .expect("connection limiter closed");
                    let started = Instant::now();
                    match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
                        Ok(Ok(_stream)) => Some(started.elapsed().as_millis() as u64),
                        _ => None,
                    }
                });
            }

            let mut latencies: Vec<u64> = Vec::with_capacity(samples);
            while let Some(joined) = tasks.join_next().await {
                if let Ok(Some(latency)) = joined {
                    latencies.push(latency);
                }
            }
            latencies.sort_unstable();
            document["latency_samples"] = json!(latencies.len());
            if let (Some(min), Some(max)) = (latencies.first(), latencies.last()) {
                document["latency_min_ms"] = json!(min);
                document["latency_max_ms"] = json!(max);
            }
            progress.publish(document.clone());
        }

        Ok(document)
    }
}

/// Factory for the built-in probe. `parallel_connection_threads` comes from
/// worker configuration; detail and timeouts from the bulk scan's config.
pub struct TcpProbeFactory {
    parallel_connection_threads: usize,
}

impl TcpProbeFactory {
    pub fn new(parallel_connection_threads: usize) -> Self {
        Self {
            parallel_connection_threads: parallel_connection_threads.max(1),
        }
    }
}

impl ScannerFactory for TcpProbeFactory {
    fn create(&self, config: &ScanConfig) -> Arc<dyn ScanFunction> {
        // Leave headroom for the job timeout to salvage a partial result.
        let connect_timeout = Duration::from_millis((config.timeout_millis / 4).clamp(250, 5_000));
        Arc::new(TcpProbe {
            detail: config.detail,
            connect_timeout,
            connections: Arc::new(Semaphore::new(self.parallel_connection_threads)),
        })
    }
}
