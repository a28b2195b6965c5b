//! Scan targets, job descriptions and the job status state machine.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while turning a raw target line into a [`ScanTarget`].
#[derive(Error, Debug)]
pub enum TargetParseError {
    #[error("empty target line")]
    Empty,
    #[error("invalid port `{port}` in target `{raw}`")]
    InvalidPort { raw: String, port: String },
    #[error("missing host in target `{raw}`")]
    MissingHost { raw: String },
}

/// Errors raised while resolving a hostname to an address.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("target has neither hostname nor ip")]
    NoHost,
    #[error("failed to resolve `{host}`: {error}")]
    Lookup {
        host: String,
        #[source]
        error: std::io::Error,
    },
    #[error("`{host}` did not resolve to any address")]
    NoAddress { host: String },
}

/// A single host to be scanned, parsed from a `host[:port]` line.
///
/// Parsing is synchronous and infallible with respect to DNS; resolution is a
/// separate step so that callers can decide how resolution failures map onto
/// job statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTarget {
    pub hostname: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tranco_rank: Option<u32>,
}

impl ScanTarget {
    /// Parse a `host[:port]` line. The host may be a hostname, an IPv4
    /// address, a bare IPv6 address or a bracketed `[v6]:port` form.
    pub fn parse(raw: &str, default_port: u16) -> Result<Self, TargetParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TargetParseError::Empty);
        }

        // A bare IPv6 address contains colons but no port.
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(Self::from_ip(ip, default_port));
        }

        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) =
                rest.split_once(']')
                    .ok_or_else(|| TargetParseError::MissingHost {
                        raw: raw.to_owned(),
                    })?;
            let ip = host
                .parse::<IpAddr>()
                .map_err(|_| TargetParseError::MissingHost {
                    raw: raw.to_owned(),
                })?;
            let port = match tail.strip_prefix(':') {
                Some(port) => Self::parse_port(raw, port)?,
                None => default_port,
            };
            return Ok(Self::from_ip(ip, port));
        }

        let (host, port) = match raw.rsplit_once(':') {
            Some((host, port)) => (host, Self::parse_port(raw, port)?),
            None => (raw, default_port),
        };
        if host.is_empty() {
            return Err(TargetParseError::MissingHost {
                raw: raw.to_owned(),
            });
        }

        match host.parse::<IpAddr>() {
            Ok(ip) => Ok(Self::from_ip(ip, port)),
            Err(_) => Ok(Self {
                hostname: Some(host.to_ascii_lowercase()),
                ip: None,
                port,
                tranco_rank: None,
            }),
        }
    }

    fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            hostname: None,
            ip: Some(ip),
            port,
            tranco_rank: None,
        }
    }

    fn parse_port(raw: &str, port: &str) -> Result<u16, TargetParseError> {
        match port.parse::<u16>() {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(TargetParseError::InvalidPort {
                raw: raw.to_owned(),
                port: port.to_owned(),
            }),
        }
    }

    /// Resolve the hostname to an address, if not already resolved.
    pub async fn resolve(&mut self) -> Result<(), ResolveError> {
        if self.ip.is_some() {
            return Ok(());
        }
        let host = self.hostname.clone().ok_or(ResolveError::NoHost)?;
        let mut addrs = tokio::net::lookup_host((host.as_str(), self.port))
            .await
            .map_err(|error| ResolveError::Lookup {
                host: host.clone(),
                error,
            })?;
        let next = addrs.next();
        drop(addrs);
        match next {
            Some(addr) => {
                self.ip = Some(addr.ip());
                Ok(())
            }
            None => Err(ResolveError::NoAddress { host }),
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.hostname, &self.ip) {
            (Some(host), _) => write!(f, "{}:{}", host, self.port),
            (None, Some(IpAddr::V6(ip))) => write!(f, "[{}]:{}", ip, self.port),
            (None, Some(ip)) => write!(f, "{}:{}", ip, self.port),
            (None, None) => write!(f, "<unknown>:{}", self.port),
        }
    }
}

/// The lifecycle status of a scan job. Every status except `ToBeExecuted` is
/// terminal and may be persisted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// A job that has been submitted to the queue but not run yet.
    ToBeExecuted,
    /// The target line could not be parsed into a scannable target.
    ResolutionError,
    /// The target matched a denylist entry and was never submitted.
    Denylisted,
    /// The hostname did not resolve to any address.
    Unresolvable,
    /// The scan ran to completion (possibly with a partial payload).
    Success,
    /// The scan itself failed.
    Error,
    /// The scan exceeded its timeout and yielded no partial result.
    Interrupted,
    /// Something outside the scan failed while handling the job.
    InternalError,
    /// The result document could not be encoded for storage.
    SerializationError,
    /// The job was abandoned before execution.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::ToBeExecuted)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// The transitions out of terminal scan outcomes exist only for the
    /// persistence path: a result that cannot be encoded degrades to
    /// `SerializationError`, and a result that cannot be stored at all
    /// degrades to `InternalError` so the job can still be acknowledged.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            JobStatus::ToBeExecuted => next.is_terminal(),
            JobStatus::Success | JobStatus::Error => {
                matches!(next, JobStatus::SerializationError | JobStatus::InternalError)
            }
            JobStatus::Interrupted | JobStatus::SerializationError => {
                next == JobStatus::InternalError
            }
            _ => false,
        }
    }
}

/// Allow casting `JobStatus` from its wire form.
impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TO_BE_EXECUTED" => Ok(JobStatus::ToBeExecuted),
            "RESOLUTION_ERROR" => Ok(JobStatus::ResolutionError),
            "DENYLISTED" => Ok(JobStatus::Denylisted),
            "UNRESOLVABLE" => Ok(JobStatus::Unresolvable),
            "SUCCESS" => Ok(JobStatus::Success),
            "ERROR" => Ok(JobStatus::Error),
            "INTERRUPTED" => Ok(JobStatus::Interrupted),
            "INTERNAL_ERROR" => Ok(JobStatus::InternalError),
            "SERIALIZATION_ERROR" => Ok(JobStatus::SerializationError),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            invalid => Err(format!("{invalid} is not a valid JobStatus")),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            JobStatus::ToBeExecuted => "TO_BE_EXECUTED",
            JobStatus::ResolutionError => "RESOLUTION_ERROR",
            JobStatus::Denylisted => "DENYLISTED",
            JobStatus::Unresolvable => "UNRESOLVABLE",
            JobStatus::Success => "SUCCESS",
            JobStatus::Error => "ERROR",
            JobStatus::Interrupted => "INTERRUPTED",
            JobStatus::InternalError => "INTERNAL_ERROR",
            JobStatus::SerializationError => "SERIALIZATION_ERROR",
            JobStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// How deep a scan should probe. Opaque to the framework; interpreted by the
/// configured scan function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanDetail {
    Quick,
    #[default]
    Normal,
    Detailed,
    All,
}

/// Per-bulk-scan scan configuration, carried inside every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub detail: ScanDetail,
    pub timeout_millis: u64,
    pub reexecutions: u32,
    /// Which registered scan function executes the jobs of this bulk scan.
    pub probe: String,
    /// Probe-specific settings, opaque to the framework.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl ScanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            detail: ScanDetail::Normal,
            timeout_millis: 10_000,
            reexecutions: 0,
            probe: "tcp".to_owned(),
            options: serde_json::Value::Null,
        }
    }
}

/// Where the results of a bulk scan are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkScanInfo {
    pub bulk_scan_id: String,
    pub db_name: String,
    pub collection_name: String,
    pub scan_config: ScanConfig,
}

/// An opaque per-delivery identifier assigned by the transport, used solely
/// for acknowledgement. Local to one delivery; never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// The work of scanning exactly one target.
///
/// The `id` is assigned once at creation and is the primary key of the
/// persisted result, which is what makes duplicate deliveries harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJobDescription {
    pub id: Uuid,
    pub scan_target: ScanTarget,
    pub bulk_scan_info: BulkScanInfo,
    pub status: JobStatus,
    #[serde(skip)]
    delivery_tag: Option<DeliveryTag>,
}

impl ScanJobDescription {
    pub fn new(scan_target: ScanTarget, bulk_scan_info: BulkScanInfo) -> Self {
        Self {
            id: Uuid::now_v7(),
            scan_target,
            bulk_scan_info,
            status: JobStatus::ToBeExecuted,
            delivery_tag: None,
        }
    }

    /// Move the job along its status chain. Invalid transitions are
    /// programming errors.
    pub fn advance(&mut self, next: JobStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "invalid job status transition {} -> {}",
            self.status,
            next
        );
        self.status = next;
    }

    pub fn delivery_tag(&self) -> Option<DeliveryTag> {
        self.delivery_tag
    }

    /// Record the tag handed out by the transport. Set exactly once per
    /// delivery; a second assignment is ignored.
    pub(crate) fn set_delivery_tag(&mut self, tag: DeliveryTag) {
        debug_assert!(
            self.delivery_tag.is_none(),
            "delivery tag assigned twice for job {}",
            self.id
        );
        self.delivery_tag.get_or_insert(tag);
    }

    /// Drop the tag when a job re-enters a queue, as crossing the wire
    /// would; the next delivery assigns a fresh one.
    pub(crate) fn strip_delivery_tag(&mut self) {
        self.delivery_tag = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hostname_with_default_port() {
        let target = ScanTarget::parse("Example.com", 443).unwrap();
        assert_eq!(target.hostname.as_deref(), Some("example.com"));
        assert_eq!(target.ip, None);
        assert_eq!(target.port, 443);
    }

    #[test]
    fn parses_hostname_with_explicit_port() {
        let target = ScanTarget::parse("example.com:8443", 443).unwrap();
        assert_eq!(target.hostname.as_deref(), Some("example.com"));
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn parses_ipv4_and_bracketed_ipv6() {
        let v4 = ScanTarget::parse("192.0.2.17", 443).unwrap();
        assert_eq!(v4.ip, Some("192.0.2.17".parse().unwrap()));
        assert_eq!(v4.port, 443);

        let v6 = ScanTarget::parse("[2001:db8::1]:8443", 443).unwrap();
        assert_eq!(v6.ip, Some("2001:db8::1".parse().unwrap()));
        assert_eq!(v6.port, 8443);

        let bare_v6 = ScanTarget::parse("2001:db8::2", 443).unwrap();
        assert_eq!(bare_v6.ip, Some("2001:db8::2".parse().unwrap()));
        assert_eq!(bare_v6.port, 443);
    }

    #[test]
    fn rejects_bad_port_with_context() {
        let err = ScanTarget::parse("host:notanumber", 443).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("notanumber"));
        assert!(message.contains("host:notanumber"));

        assert!(ScanTarget::parse("host:0", 443).is_err());
        assert!(ScanTarget::parse("host:70000", 443).is_err());
    }

    #[test]
    fn display_parse_round_trip() {
        for raw in ["example.com:8443", "192.0.2.1:443", "[2001:db8::1]:991"] {
            let target = ScanTarget::parse(raw, 443).unwrap();
            let reparsed = ScanTarget::parse(&target.to_string(), 443).unwrap();
            assert_eq!(target, reparsed);
        }
    }

    #[test]
    fn status_state_machine() {
        assert!(!JobStatus::ToBeExecuted.is_terminal());
        for status in [
            JobStatus::ResolutionError,
            JobStatus::Denylisted,
            JobStatus::Unresolvable,
            JobStatus::Success,
            JobStatus::Error,
            JobStatus::Interrupted,
            JobStatus::InternalError,
            JobStatus::SerializationError,
            JobStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(JobStatus::ToBeExecuted.can_transition_to(status));
        }

        assert!(JobStatus::Success.can_transition_to(JobStatus::SerializationError));
        assert!(JobStatus::Error.can_transition_to(JobStatus::SerializationError));
        assert!(JobStatus::SerializationError.can_transition_to(JobStatus::InternalError));
        assert!(!JobStatus::Success.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Interrupted.can_transition_to(JobStatus::Success));
        assert!(!JobStatus::ToBeExecuted.can_transition_to(JobStatus::ToBeExecuted));
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            JobStatus::ToBeExecuted,
            JobStatus::Success,
            JobStatus::SerializationError,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("definitely-not-a-status".parse::<JobStatus>().is_err());
    }

    #[test]
    fn delivery_tag_survives_one_assignment() {
        let target = ScanTarget::parse("192.0.2.1", 443).unwrap();
        let info = BulkScanInfo {
            bulk_scan_id: "bs".to_owned(),
            db_name: "db".to_owned(),
            collection_name: "results".to_owned(),
            scan_config: ScanConfig::default(),
        };
        let mut job = ScanJobDescription::new(target, info);
        assert!(job.delivery_tag().is_none());
        job.set_delivery_tag(DeliveryTag::new(7));
        assert_eq!(job.delivery_tag().unwrap().value(), 7);
    }

    #[test]
    fn delivery_tag_is_not_serialized() {
        let target = ScanTarget::parse("192.0.2.1", 443).unwrap();
        let info = BulkScanInfo {
            bulk_scan_id: "bs".to_owned(),
            db_name: "db".to_owned(),
            collection_name: "results".to_owned(),
            scan_config: ScanConfig::default(),
        };
        let mut job = ScanJobDescription::new(target, info);
        job.set_delivery_tag(DeliveryTag::new(9));

        let wire = serde_json::to_string(&job).unwrap();
        let decoded: ScanJobDescription = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded.id, job.id);
        assert!(decoded.delivery_tag().is_none());
    }
}
