//! Scan target parsing and validation.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use ipnet::IpNet;

use vigil_core::VigilError;

/// A validated scan target: a CIDR block, a dashed IPv4 range, or a single
/// host address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    Cidr(IpNet),
    Host(IpAddr),
    Range(Ipv4Addr, Ipv4Addr),
}

impl ScanTarget {
    /// Parse a target expression, rejecting anything that is not a valid
    /// CIDR, range, or IP.
    pub fn parse(raw: &str) -> Result<Self, VigilError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(VigilError::Validation("scan target is empty".to_string()));
        }

        if let Ok(net) = raw.parse::<IpNet>() {
            return Ok(ScanTarget::Cidr(net));
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(ScanTarget::Host(ip));
        }
        if let Some((start, end)) = raw.split_once('-') {
            let start: Ipv4Addr = start.trim().parse().map_err(|_| bad_target(raw))?;
            let end: Ipv4Addr = end.trim().parse().map_err(|_| bad_target(raw))?;
            if start > end {
                return Err(VigilError::Validation(format!(
                    "range start {start} is after range end {end}"
                )));
            }
            return Ok(ScanTarget::Range(start, end));
        }

        Err(bad_target(raw))
    }
}

fn bad_target(raw: &str) -> VigilError {
    VigilError::Validation(format!(
        "'{raw}' is not a valid CIDR, IP range, or IP address"
    ))
}

impl FromStr for ScanTarget {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanTarget::Cidr(net) => write!(f, "{net}"),
            ScanTarget::Host(ip) => write!(f, "{ip}"),
            ScanTarget::Range(start, end) => write!(f, "{start}-{end}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cidr() {
        let target = ScanTarget::parse("10.0.1.0/24").unwrap();
        assert!(matches!(target, ScanTarget::Cidr(_)));
        assert_eq!(target.to_string(), "10.0.1.0/24");
    }

    #[test]
    fn parses_single_host() {
        let target = ScanTarget::parse("192.168.1.10").unwrap();
        assert!(matches!(target, ScanTarget::Host(_)));
    }

    #[test]
    fn parses_dashed_range() {
        let target = ScanTarget::parse("10.0.0.5 - 10.0.0.50").unwrap();
        assert_eq!(target.to_string(), "10.0.0.5-10.0.0.50");
    }

    #[test]
    fn rejects_inverted_range() {
        let err = ScanTarget::parse("10.0.0.50-10.0.0.5").unwrap_err();
        assert!(matches!(err, VigilError::Validation(_)));
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["", "not-a-target", "10.0.0.0/99", "10.0.0.1-2-3"] {
            let err = ScanTarget::parse(raw).unwrap_err();
            assert!(matches!(err, VigilError::Validation(_)), "accepted {raw:?}");
        }
    }
}
