//! Denylist evaluation for scan targets.
//!
//! A denylist file holds one entry per line: a bare domain, a bare IPv4 or
//! IPv6 address, or a CIDR block. Invalid lines are logged and skipped so a
//! single typo does not take down a bulk scan.

use std::collections::HashSet;
use std::io::{self, BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use tracing::warn;

use crate::job::ScanTarget;

#[derive(Debug, Default)]
pub struct Denylist {
    domains: HashSet<String>,
    ips: HashSet<IpAddr>,
    networks: Vec<IpNet>,
}

impl Denylist {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut lines = Vec::new();
        for line in reader.lines() {
            lines.push(line?);
        }
        Ok(Self::from_lines(lines.iter().map(String::as_str)))
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut denylist = Self::default();
        for line in lines {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            if let Ok(ip) = entry.parse::<IpAddr>() {
                denylist.ips.insert(ip);
            } else if let Ok(net) = entry.parse::<IpNet>() {
                denylist.networks.push(net);
            } else if is_plausible_domain(entry) {
                denylist.domains.insert(entry.to_ascii_lowercase());
            } else {
                warn!("skipping invalid denylist entry `{entry}`");
            }
        }
        denylist
    }

    /// A target is denylisted if its hostname equals a domain entry, its ip
    /// equals an ip entry, or its ip falls inside a CIDR entry. An IPv4 CIDR
    /// never matches an IPv6 address and vice versa.
    pub fn matches(&self, target: &ScanTarget) -> bool {
        if let Some(hostname) = &target.hostname {
            if self.domains.contains(&hostname.to_ascii_lowercase()) {
                return true;
            }
        }
        if let Some(ip) = target.ip {
            if self.ips.contains(&ip) {
                return true;
            }
            if self.networks.iter().any(|net| net.contains(&ip)) {
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.ips.is_empty() && self.networks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.domains.len() + self.ips.len() + self.networks.len()
    }
}

fn is_plausible_domain(entry: &str) -> bool {
    !entry.is_empty()
        && entry.chars().any(|c| c.is_ascii_alphabetic())
        && entry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}
