//! Rule variants and matching
//!
//! A [`Rule`] is a predicate over flow [`Metadata`] plus the name of
//! the outbound adapter it routes to. Variants are a flat tagged enum;
//! dispatch never goes through trait objects.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::metadata::{InboundType, Metadata, Network};

use super::types::{PortRange, RuleType, UidRange};

/// Rule payload variants
#[derive(Debug, Clone)]
pub enum RuleKind {
    /// Exact (case-insensitive) domain
    Domain(String),
    /// Domain suffix (`google.com` matches `www.google.com` and itself)
    DomainSuffix(String),
    /// Domain substring
    DomainKeyword(String),
    /// Named domain-suffix group from the geosite table
    GeoSite {
        /// Group name, for display
        group: String,
        /// Suffixes shared with every rule referencing the group
        suffixes: Arc<Vec<String>>,
    },
    /// Named country CIDR group from the geoip table
    GeoIp {
        /// Country code, for display
        country: String,
        /// Networks shared with every rule referencing the country
        networks: Arc<Vec<IpNet>>,
        /// Suppress forced resolution for this rule
        no_resolve: bool,
    },
    /// CIDR membership test
    IpCidr {
        /// The network
        net: IpNet,
        /// Test the source address instead of the destination
        source: bool,
        /// Suppress forced resolution for this rule
        no_resolve: bool,
    },
    /// Trailing-bits address match
    IpSuffix {
        /// Reference address supplying the suffix bits
        addr: IpAddr,
        /// Number of trailing bits compared
        bits: u8,
        /// Test the source address instead of the destination
        source: bool,
        /// Suppress forced resolution for this rule
        no_resolve: bool,
    },
    /// Port range test
    Port {
        /// The range
        range: PortRange,
        /// Test the source port instead of the destination
        source: bool,
    },
    /// Process match by base name or full path
    Process {
        /// Name or path compared against the flow's process metadata
        name: String,
        /// Compare the full executable path
        by_path: bool,
    },
    /// Transport protocol test
    NetworkType(Network),
    /// Socket owner uid test
    Uid(UidRange),
    /// Inbound listener tag test
    InType(InboundType),
    /// Guard condition plus a named auxiliary rule list
    SubRule {
        /// Condition deciding whether the named list is entered
        cond: Box<Rule>,
        /// Name of the auxiliary list
        name: String,
    },
    /// All sub-rules must match (short-circuits on first false)
    And(Vec<Rule>),
    /// Any sub-rule may match (short-circuits on first true)
    Or(Vec<Rule>),
    /// The single sub-rule must not match
    Not(Box<Rule>),
    /// Always matches
    Match,
}

/// A classification rule
#[derive(Debug, Clone)]
pub struct Rule {
    kind: RuleKind,
    payload: String,
    adapter: String,
}

impl Rule {
    /// Assemble a rule from parsed parts
    #[must_use]
    pub fn new(kind: RuleKind, payload: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            adapter: adapter.into(),
        }
    }

    /// The rule's variant
    #[must_use]
    pub const fn kind(&self) -> &RuleKind {
        &self.kind
    }

    /// The original payload text, for log lines
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The outbound adapter this rule routes to
    #[must_use]
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    /// The variant tag
    #[must_use]
    pub const fn rule_type(&self) -> RuleType {
        match &self.kind {
            RuleKind::Domain(_) => RuleType::Domain,
            RuleKind::DomainSuffix(_) => RuleType::DomainSuffix,
            RuleKind::DomainKeyword(_) => RuleType::DomainKeyword,
            RuleKind::GeoSite { .. } => RuleType::GeoSite,
            RuleKind::GeoIp { .. } => RuleType::GeoIp,
            RuleKind::IpCidr { source: false, .. } => RuleType::IpCidr,
            RuleKind::IpCidr { source: true, .. } => RuleType::SrcIpCidr,
            RuleKind::IpSuffix { source: false, .. } => RuleType::IpSuffix,
            RuleKind::IpSuffix { source: true, .. } => RuleType::SrcIpSuffix,
            RuleKind::Port { source: false, .. } => RuleType::DstPort,
            RuleKind::Port { source: true, .. } => RuleType::SrcPort,
            RuleKind::Process { by_path: false, .. } => RuleType::ProcessName,
            RuleKind::Process { by_path: true, .. } => RuleType::ProcessPath,
            RuleKind::NetworkType(_) => RuleType::Network,
            RuleKind::Uid(_) => RuleType::Uid,
            RuleKind::InType(_) => RuleType::InType,
            RuleKind::SubRule { .. } => RuleType::SubRule,
            RuleKind::And(_) => RuleType::And,
            RuleKind::Or(_) => RuleType::Or,
            RuleKind::Not(_) => RuleType::Not,
            RuleKind::Match => RuleType::Match,
        }
    }

    /// Evaluate the rule against flow metadata
    #[must_use]
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match &self.kind {
            RuleKind::Domain(domain) => metadata.host.eq_ignore_ascii_case(domain),
            RuleKind::DomainSuffix(suffix) => domain_has_suffix(&metadata.host, suffix),
            RuleKind::DomainKeyword(keyword) => metadata
                .host
                .to_ascii_lowercase()
                .contains(keyword.as_str()),
            RuleKind::GeoSite { suffixes, .. } => suffixes
                .iter()
                .any(|suffix| domain_has_suffix(&metadata.host, suffix)),
            RuleKind::GeoIp { networks, .. } => metadata
                .dst_ip
                .is_some_and(|ip| networks.iter().any(|net| net.contains(&ip))),
            RuleKind::IpCidr { net, source, .. } => {
                let ip = if *source { metadata.src_ip } else { metadata.dst_ip };
                ip.is_some_and(|ip| net.contains(&ip))
            }
            RuleKind::IpSuffix {
                addr,
                bits,
                source,
                ..
            } => {
                let ip = if *source { metadata.src_ip } else { metadata.dst_ip };
                ip.is_some_and(|ip| suffix_bits_equal(ip, *addr, *bits))
            }
            RuleKind::Port { range, source } => {
                if *source {
                    metadata.src_port_num().is_some_and(|p| range.contains(p))
                } else {
                    range.contains(metadata.dst_port)
                }
            }
            RuleKind::Process { name, by_path } => {
                let field = if *by_path {
                    metadata.process_path.as_deref()
                } else {
                    metadata.process.as_deref()
                };
                field.is_some_and(|p| p.eq_ignore_ascii_case(name))
            }
            RuleKind::NetworkType(network) => metadata.network == *network,
            RuleKind::Uid(ranges) => metadata.uid.is_some_and(|uid| ranges.contains(uid)),
            RuleKind::InType(in_type) => metadata.in_type == *in_type,
            RuleKind::SubRule { cond, .. } => cond.matches(metadata),
            RuleKind::And(children) => children.iter().all(|r| r.matches(metadata)),
            RuleKind::Or(children) => children.iter().any(|r| r.matches(metadata)),
            RuleKind::Not(child) => !child.matches(metadata),
            RuleKind::Match => true,
        }
    }

    /// Whether evaluating this rule needs a resolved destination
    #[must_use]
    pub fn should_resolve_ip(&self) -> bool {
        match &self.kind {
            RuleKind::GeoIp { no_resolve, .. } => !no_resolve,
            RuleKind::IpCidr {
                source, no_resolve, ..
            }
            | RuleKind::IpSuffix {
                source, no_resolve, ..
            } => !source && !no_resolve,
            RuleKind::SubRule { cond, .. } => cond.should_resolve_ip(),
            RuleKind::And(children) | RuleKind::Or(children) => {
                children.iter().any(Rule::should_resolve_ip)
            }
            RuleKind::Not(child) => child.should_resolve_ip(),
            _ => false,
        }
    }

    /// Whether evaluating this rule needs process metadata
    #[must_use]
    pub fn should_find_process(&self) -> bool {
        match &self.kind {
            RuleKind::Process { .. } => true,
            RuleKind::SubRule { cond, .. } => cond.should_find_process(),
            RuleKind::And(children) | RuleKind::Or(children) => {
                children.iter().any(Rule::should_find_process)
            }
            RuleKind::Not(child) => child.should_find_process(),
            _ => false,
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{}", self.rule_type())
        } else {
            write!(f, "{}({})", self.rule_type(), self.payload)
        }
    }
}

/// Suffix-match `host` against `suffix` on label boundaries
fn domain_has_suffix(host: &str, suffix: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    let host = host.to_ascii_lowercase();
    let suffix = suffix.to_ascii_lowercase();
    host == suffix || host.ends_with(&format!(".{suffix}"))
}

/// Compare the trailing `bits` bits of two addresses of the same family
fn suffix_bits_equal(ip: IpAddr, reference: IpAddr, bits: u8) -> bool {
    match (ip, reference) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let bits = u32::from(bits.min(32));
            if bits == 0 {
                return true;
            }
            let mask = if bits == 32 { u32::MAX } else { (1 << bits) - 1 };
            (u32::from(a) & mask) == (u32::from(b) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            let bits = u32::from(bits.min(128));
            if bits == 0 {
                return true;
            }
            let mask = if bits == 128 {
                u128::MAX
            } else {
                (1 << bits) - 1
            };
            (u128::from(a) & mask) == (u128::from(b) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_host(host: &str) -> Metadata {
        Metadata::domain(Network::Tcp, host, 443)
    }

    #[test]
    fn test_domain_rules() {
        let rule = Rule::new(RuleKind::Domain("baidu.com".into()), "baidu.com", "PROXY1");
        assert!(rule.matches(&meta_host("baidu.com")));
        assert!(rule.matches(&meta_host("BAIDU.com")));
        assert!(!rule.matches(&meta_host("www.baidu.com")));
        assert!(!rule.should_resolve_ip());

        let rule = Rule::new(
            RuleKind::DomainSuffix("google.com".into()),
            "google.com",
            "PROXY1",
        );
        assert!(rule.matches(&meta_host("google.com")));
        assert!(rule.matches(&meta_host("www.google.com")));
        assert!(!rule.matches(&meta_host("notgoogle.com")));

        let rule = Rule::new(
            RuleKind::DomainKeyword("youtube".into()),
            "youtube",
            "PROXY1",
        );
        assert!(rule.matches(&meta_host("www.youtube.com")));
        assert!(!rule.matches(&meta_host("example.com")));
    }

    #[test]
    fn test_geosite_rule() {
        let rule = Rule::new(
            RuleKind::GeoSite {
                group: "video".into(),
                suffixes: Arc::new(vec!["youtube.com".into(), "netflix.com".into()]),
            },
            "video",
            "PROXY1",
        );
        assert!(rule.matches(&meta_host("www.youtube.com")));
        assert!(rule.matches(&meta_host("netflix.com")));
        assert!(!rule.matches(&meta_host("example.com")));
    }

    #[test]
    fn test_ip_cidr_rule() {
        let rule = Rule::new(
            RuleKind::IpCidr {
                net: "10.0.0.0/8".parse().unwrap(),
                source: false,
                no_resolve: false,
            },
            "10.0.0.0/8",
            "DIRECT",
        );
        assert!(rule.should_resolve_ip());

        let mut m = meta_host("internal.example.com");
        assert!(!rule.matches(&m));
        m.dst_ip = Some("10.1.2.3".parse().unwrap());
        assert!(rule.matches(&m));
        m.dst_ip = Some("192.168.1.1".parse().unwrap());
        assert!(!rule.matches(&m));
    }

    #[test]
    fn test_src_ip_cidr_rule() {
        let rule = Rule::new(
            RuleKind::IpCidr {
                net: "192.168.0.0/16".parse().unwrap(),
                source: true,
                no_resolve: true,
            },
            "192.168.0.0/16",
            "DIRECT",
        );
        assert!(!rule.should_resolve_ip());
        assert_eq!(rule.rule_type(), RuleType::SrcIpCidr);

        let m = meta_host("example.com").with_source("192.168.1.5:40000".parse().unwrap());
        assert!(rule.matches(&m));
    }

    #[test]
    fn test_ip_suffix_rule() {
        let rule = Rule::new(
            RuleKind::IpSuffix {
                addr: "0.0.0.1".parse().unwrap(),
                bits: 8,
                source: false,
                no_resolve: true,
            },
            "0.0.0.1/8",
            "DIRECT",
        );

        let mut m = meta_host("");
        m.dst_ip = Some("10.20.30.1".parse().unwrap());
        assert!(rule.matches(&m));
        m.dst_ip = Some("10.20.30.2".parse().unwrap());
        assert!(!rule.matches(&m));
    }

    #[test]
    fn test_port_rules() {
        let rule = Rule::new(
            RuleKind::Port {
                range: PortRange::parse("6000-6500").unwrap(),
                source: false,
            },
            "6000-6500",
            "REJECT",
        );

        let mut m = meta_host("x");
        m.dst_port = 6100;
        assert!(rule.matches(&m));
        m.dst_port = 6700;
        assert!(!rule.matches(&m));

        let rule = Rule::new(
            RuleKind::Port {
                range: PortRange::single(80),
                source: false,
            },
            "80",
            "DIRECT",
        );
        m.dst_port = 80;
        assert!(rule.matches(&m));
        m.dst_port = 81;
        assert!(!rule.matches(&m));

        let src_rule = Rule::new(
            RuleKind::Port {
                range: PortRange::single(40000),
                source: true,
            },
            "40000",
            "DIRECT",
        );
        let m = meta_host("x").with_source("10.0.0.1:40000".parse().unwrap());
        assert!(src_rule.matches(&m));
    }

    #[test]
    fn test_process_rules() {
        let rule = Rule::new(
            RuleKind::Process {
                name: "curl".into(),
                by_path: false,
            },
            "curl",
            "DIRECT",
        );
        assert!(rule.should_find_process());

        let mut m = meta_host("example.com");
        assert!(!rule.matches(&m));
        m.process = Some("curl".into());
        assert!(rule.matches(&m));

        let path_rule = Rule::new(
            RuleKind::Process {
                name: "/usr/bin/curl".into(),
                by_path: true,
            },
            "/usr/bin/curl",
            "DIRECT",
        );
        assert!(!path_rule.matches(&m));
        m.process_path = Some("/usr/bin/curl".into());
        assert!(path_rule.matches(&m));
    }

    #[test]
    fn test_network_uid_intype_rules() {
        let rule = Rule::new(RuleKind::NetworkType(Network::Udp), "UDP", "DIRECT");
        assert!(!rule.matches(&meta_host("x")));
        assert!(rule.matches(&Metadata::domain(Network::Udp, "x", 53)));

        let rule = Rule::new(
            RuleKind::Uid(UidRange::parse("1000-2000").unwrap()),
            "1000-2000",
            "DIRECT",
        );
        let mut m = meta_host("x");
        assert!(!rule.matches(&m));
        m.uid = Some(1500);
        assert!(rule.matches(&m));

        let rule = Rule::new(RuleKind::InType(InboundType::Tproxy), "TPROXY", "DIRECT");
        let m = meta_host("x").with_in_type(InboundType::Tproxy);
        assert!(rule.matches(&m));
        assert!(!rule.matches(&meta_host("x")));
    }

    #[test]
    fn test_match_always_matches() {
        let rule = Rule::new(RuleKind::Match, "", "DIRECT");
        assert!(rule.matches(&meta_host("anything")));
        assert!(rule.matches(&Metadata::ip(
            Network::Udp,
            "1.2.3.4".parse().unwrap(),
            0
        )));
    }

    #[test]
    fn test_not_negates() {
        let inner = Rule::new(
            RuleKind::Port {
                range: PortRange::parse("6000-6500").unwrap(),
                source: false,
            },
            "6000-6500",
            "",
        );
        let rule = Rule::new(
            RuleKind::Not(Box::new(inner)),
            "((DST-PORT,6000-6500))",
            "REJECT",
        );

        let mut m = meta_host("x");
        m.dst_port = 6100;
        assert!(!rule.matches(&m));
        m.dst_port = 9999;
        assert!(rule.matches(&m));
    }

    #[test]
    fn test_composite_should_flags_are_any_true() {
        let resolve_child = Rule::new(
            RuleKind::IpCidr {
                net: "10.0.0.0/8".parse().unwrap(),
                source: false,
                no_resolve: false,
            },
            "10.0.0.0/8",
            "",
        );
        let plain_child = Rule::new(RuleKind::NetworkType(Network::Tcp), "TCP", "");
        let process_child = Rule::new(
            RuleKind::Process {
                name: "curl".into(),
                by_path: false,
            },
            "curl",
            "",
        );

        let or = Rule::new(
            RuleKind::Or(vec![plain_child.clone(), resolve_child]),
            "",
            "DIRECT",
        );
        assert!(or.should_resolve_ip());
        assert!(!or.should_find_process());

        let and = Rule::new(RuleKind::And(vec![plain_child, process_child]), "", "DIRECT");
        assert!(!and.should_resolve_ip());
        assert!(and.should_find_process());
    }

    #[test]
    fn test_display_includes_payload() {
        let rule = Rule::new(RuleKind::Domain("baidu.com".into()), "baidu.com", "PROXY1");
        assert_eq!(rule.to_string(), "DOMAIN(baidu.com)");

        let rule = Rule::new(RuleKind::Match, "", "DIRECT");
        assert_eq!(rule.to_string(), "MATCH");
    }
}
