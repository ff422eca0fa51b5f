// src/security/netguard.rs
//! Outbound network egress policy (SSRF boundary)
//!
//! Sandboxed code gets exactly one way to the network: the `httpRequest`
//! helper inside the worker shim. The shim resolves the target host and
//! refuses any address inside the ranges listed here, refuses non-HTTP
//! schemes, and enforces the per-execution request caps. This module is
//! the single source of truth for that policy; the shim receives it in
//! the init frame and never hardcodes its own list.

use crate::runtime::protocol::RequestLimitsFrame;
use crate::utils::config::NetworkConfig;
use crate::utils::errors::{Result, SandboxError};
use std::net::IpAddr;

/// Schemes the network helper will dial
pub const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Address ranges sandboxed code must never reach: RFC1918, loopback,
/// link-local (including the 169.254.169.254 cloud metadata endpoint),
/// the zero network, and their IPv6 counterparts.
pub const BLOCKED_CIDRS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "127.0.0.0/8",
    "0.0.0.0/8",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// A parsed CIDR range. v4-mapped IPv6 addresses are unwrapped before
/// matching so `::ffff:10.0.0.1` cannot slip past a v4 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix: u8,
}

impl CidrRange {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| SandboxError::Config(format!("invalid CIDR '{s}': missing prefix")))?;
        let network: IpAddr = addr
            .parse()
            .map_err(|_| SandboxError::Config(format!("invalid CIDR '{s}': bad address")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| SandboxError::Config(format!("invalid CIDR '{s}': bad prefix")))?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(SandboxError::Config(format!(
                "invalid CIDR '{s}': prefix exceeds {max}"
            )));
        }
        Ok(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = unmap(ip);
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                (u32::from(ip) & mask) == (u32::from(net) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                (u128::from(ip) & mask) == (u128::from(net) & mask)
            }
            _ => false,
        }
    }
}

fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

/// The egress policy shipped to workers
#[derive(Debug, Clone)]
pub struct EgressPolicy {
    ranges: Vec<CidrRange>,
    cidrs: Vec<String>,
}

impl EgressPolicy {
    /// The built-in block-list. Infallible: the constant list is
    /// exercised by tests.
    pub fn builtin() -> Self {
        Self::with_extra_ranges(&[]).expect("builtin CIDR list must parse")
    }

    /// Built-in list plus deployment-specific extra ranges (validated)
    pub fn with_extra_ranges(extra: &[String]) -> Result<Self> {
        let cidrs: Vec<String> = BLOCKED_CIDRS
            .iter()
            .map(|c| c.to_string())
            .chain(extra.iter().cloned())
            .collect();
        let ranges = cidrs
            .iter()
            .map(|c| CidrRange::parse(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ranges, cidrs })
    }

    /// True if the resolved address must not be dialed
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|r| r.contains(ip))
    }

    /// CIDR strings for the init frame
    pub fn cidr_strings(&self) -> Vec<String> {
        self.cidrs.clone()
    }
}

/// Build the request-cap frame from deployment configuration
pub fn request_limits(cfg: &NetworkConfig) -> RequestLimitsFrame {
    RequestLimitsFrame {
        max_requests: cfg.max_requests,
        timeout_ms: cfg.request_timeout_ms,
        max_response_size: cfg.max_response_size_mb * 1024 * 1024,
        max_request_body_size: cfg.max_request_body_size_mb * 1024 * 1024,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_private_and_loopback_ranges_blocked() {
        let policy = EgressPolicy::builtin();
        for addr in [
            "10.0.0.1",
            "10.255.255.254",
            "172.16.0.1",
            "172.31.255.1",
            "192.168.1.1",
            "127.0.0.1",
            "0.0.0.0",
            "169.254.169.254", // cloud metadata
            "::1",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
        ] {
            assert!(policy.is_blocked(ip(addr)), "{addr} should be blocked");
        }
    }

    #[test]
    fn test_public_addresses_allowed() {
        let policy = EgressPolicy::builtin();
        for addr in ["1.1.1.1", "8.8.8.8", "93.184.216.34", "2606:4700::1111"] {
            assert!(!policy.is_blocked(ip(addr)), "{addr} should be allowed");
        }
        // 172.32.x is outside the /12
        assert!(!policy.is_blocked(ip("172.32.0.1")));
    }

    #[test]
    fn test_v4_mapped_v6_does_not_bypass() {
        let policy = EgressPolicy::builtin();
        assert!(policy.is_blocked(ip("::ffff:10.0.0.1")));
        assert!(policy.is_blocked(ip("::ffff:127.0.0.1")));
        assert!(!policy.is_blocked(ip("::ffff:8.8.8.8")));
    }

    #[test]
    fn test_extra_ranges_validated() {
        let policy =
            EgressPolicy::with_extra_ranges(&["100.64.0.0/10".to_string()]).unwrap();
        assert!(policy.is_blocked(ip("100.64.0.1")));

        assert!(EgressPolicy::with_extra_ranges(&["not-a-cidr".to_string()]).is_err());
        assert!(EgressPolicy::with_extra_ranges(&["10.0.0.0/33".to_string()]).is_err());
        assert!(EgressPolicy::with_extra_ranges(&["10.0.0.0".to_string()]).is_err());
    }

    #[test]
    fn test_request_limits_converted_to_bytes() {
        let frame = request_limits(&NetworkConfig::default());
        assert_eq!(frame.max_requests, 30);
        assert_eq!(frame.max_response_size, 2 * 1024 * 1024);
        assert_eq!(frame.max_request_body_size, 1024 * 1024);
    }
}
