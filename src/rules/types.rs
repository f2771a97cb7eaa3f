//! Core rule value types
//!
//! [`RuleType`] tags every rule variant for logging and dispatch;
//! [`PortRange`] and [`UidRange`] implement the inclusive range
//! payloads accepted by port and UID rules.

use std::fmt;

use crate::error::RuleError;

/// Rule variant tag
///
/// Spelled the way rule lines spell them (`DOMAIN-SUFFIX`, `DST-PORT`,
/// ...), which is also how matched rules appear in log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    /// Exact domain match
    Domain,
    /// Domain suffix match
    DomainSuffix,
    /// Domain substring match
    DomainKeyword,
    /// Named domain-suffix group
    GeoSite,
    /// Named country CIDR group
    GeoIp,
    /// Destination CIDR match
    IpCidr,
    /// Source CIDR match
    SrcIpCidr,
    /// Destination IP trailing-bits match
    IpSuffix,
    /// Source IP trailing-bits match
    SrcIpSuffix,
    /// Destination port match
    DstPort,
    /// Source port match
    SrcPort,
    /// Process name match
    ProcessName,
    /// Process path match
    ProcessPath,
    /// Transport protocol match
    Network,
    /// Socket owner uid match
    Uid,
    /// Inbound listener tag match
    InType,
    /// Guarded reference to a named rule list
    SubRule,
    /// Conjunction of sub-rules
    And,
    /// Disjunction of sub-rules
    Or,
    /// Negation of one sub-rule
    Not,
    /// Catch-all
    Match,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Domain => "DOMAIN",
            Self::DomainSuffix => "DOMAIN-SUFFIX",
            Self::DomainKeyword => "DOMAIN-KEYWORD",
            Self::GeoSite => "GEOSITE",
            Self::GeoIp => "GEOIP",
            Self::IpCidr => "IP-CIDR",
            Self::SrcIpCidr => "SRC-IP-CIDR",
            Self::IpSuffix => "IP-SUFFIX",
            Self::SrcIpSuffix => "SRC-IP-SUFFIX",
            Self::DstPort => "DST-PORT",
            Self::SrcPort => "SRC-PORT",
            Self::ProcessName => "PROCESS-NAME",
            Self::ProcessPath => "PROCESS-PATH",
            Self::Network => "NETWORK",
            Self::Uid => "UID",
            Self::InType => "IN-TYPE",
            Self::SubRule => "SUB-RULE",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
            Self::Match => "MATCH",
        };
        write!(f, "{s}")
    }
}

/// Inclusive port range
///
/// Accepts a single port (`"80"`) or an inclusive range (`"6000-6500"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    /// Start of the range (inclusive)
    pub start: u16,
    /// End of the range (inclusive)
    pub end: u16,
}

impl PortRange {
    /// Create a range, rejecting `start > end`
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPortRange` when `start > end`.
    pub fn new(start: u16, end: u16) -> Result<Self, RuleError> {
        if start > end {
            return Err(RuleError::InvalidPortRange(format!("{start}-{end}")));
        }
        Ok(Self { start, end })
    }

    /// Range covering one port
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Whether `port` falls inside the range
    #[must_use]
    pub const fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Parse `"80"` or `"6000-6500"`
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPortRange` on malformed input.
    pub fn parse(s: &str) -> Result<Self, RuleError> {
        let s = s.trim();
        if let Some((start, end)) = s.split_once('-') {
            let start = start
                .trim()
                .parse()
                .map_err(|_| RuleError::InvalidPortRange(s.to_string()))?;
            let end = end
                .trim()
                .parse()
                .map_err(|_| RuleError::InvalidPortRange(s.to_string()))?;
            Self::new(start, end)
        } else {
            let port = s
                .parse()
                .map_err(|_| RuleError::InvalidPortRange(s.to_string()))?;
            Ok(Self::single(port))
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Inclusive uid range set
///
/// A UID payload is one or more `/`-separated entries, each a single
/// uid or an inclusive `lo-hi` range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidRange {
    ranges: Vec<(u32, u32)>,
}

impl UidRange {
    /// Parse `"1000"`, `"1000-2000"`, or `"0/1000-2000"`
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPayload` on malformed input.
    pub fn parse(s: &str) -> Result<Self, RuleError> {
        let mut ranges = Vec::new();
        for part in s.split('/') {
            let part = part.trim();
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: u32 = lo
                    .trim()
                    .parse()
                    .map_err(|_| RuleError::InvalidPayload(s.to_string()))?;
                let hi: u32 = hi
                    .trim()
                    .parse()
                    .map_err(|_| RuleError::InvalidPayload(s.to_string()))?;
                if lo > hi {
                    return Err(RuleError::InvalidPayload(s.to_string()));
                }
                ranges.push((lo, hi));
            } else {
                let uid: u32 = part
                    .parse()
                    .map_err(|_| RuleError::InvalidPayload(s.to_string()))?;
                ranges.push((uid, uid));
            }
        }
        if ranges.is_empty() {
            return Err(RuleError::InvalidPayload(s.to_string()));
        }
        Ok(Self { ranges })
    }

    /// Whether `uid` falls inside any range
    #[must_use]
    pub fn contains(&self, uid: u32) -> bool {
        self.ranges.iter().any(|&(lo, hi)| uid >= lo && uid <= hi)
    }
}
