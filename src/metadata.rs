//! Per-flow metadata
//!
//! [`Metadata`] is the flow descriptor carried from the inbound listener
//! through classification to the outbound adapter. Listeners fill in the
//! endpoints they know; the prehandler and rule engine normalize and
//! enrich the remaining fields.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    /// Stream flow
    #[serde(rename = "tcp")]
    Tcp,
    /// Datagram flow
    #[serde(rename = "udp")]
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Address type of the authoritative destination field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrType {
    /// `dst_ip` holds an IPv4 address
    Ipv4,
    /// `dst_ip` holds an IPv6 address
    Ipv6,
    /// `host` holds a domain name
    Domain,
}

/// How the destination was derived from DNS state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsMode {
    /// No DNS involvement beyond ordinary resolution
    #[default]
    Normal,
    /// Destination host recovered via fake-IP reverse mapping (redir-host)
    Mapping,
    /// Destination host recovered via fake-IP reverse mapping and the
    /// virtual address dropped, so routing operates on the hostname
    FakeIp,
}

/// Inbound protocol tag, used by the IN-TYPE rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboundType {
    /// HTTP proxy listener
    Http,
    /// SOCKS4 listener
    Socks4,
    /// SOCKS5 listener
    Socks5,
    /// Auto-detecting mixed listener
    Mixed,
    /// iptables REDIRECT listener
    Redir,
    /// TPROXY listener
    Tproxy,
    /// TUN device
    Tun,
    /// Internal flows (DNS hijack etc.)
    Inner,
}

impl InboundType {
    /// Parse an inbound type from its rule payload spelling
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Some(Self::Http),
            "SOCKS4" => Some(Self::Socks4),
            "SOCKS5" => Some(Self::Socks5),
            "MIXED" => Some(Self::Mixed),
            "REDIR" | "REDIRECT" => Some(Self::Redir),
            "TPROXY" => Some(Self::Tproxy),
            "TUN" => Some(Self::Tun),
            "INNER" => Some(Self::Inner),
            _ => None,
        }
    }
}

impl fmt::Display for InboundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Socks4 => write!(f, "socks4"),
            Self::Socks5 => write!(f, "socks5"),
            Self::Mixed => write!(f, "mixed"),
            Self::Redir => write!(f, "redir"),
            Self::Tproxy => write!(f, "tproxy"),
            Self::Tun => write!(f, "tun"),
            Self::Inner => write!(f, "inner"),
        }
    }
}

/// Per-flow descriptor
///
/// Invariant maintained by the prehandler: after prehandling, at least
/// one of `host` / `dst_ip` is set. Later resolution only ever fills
/// `dst_ip`; it never rewrites `host`.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Transport protocol, immutable after intake
    pub network: Network,
    /// Inbound protocol tag
    pub in_type: InboundType,
    /// Source address of the inbound flow
    pub src_ip: Option<IpAddr>,
    /// Source port, kept textual for process lookup keys
    pub src_port: String,
    /// Destination address; may be unset until resolution
    pub dst_ip: Option<IpAddr>,
    /// Destination port
    pub dst_port: u16,
    /// Destination hostname; empty when the client supplied a literal
    pub host: String,
    /// Which of `host` / `dst_ip` is authoritative
    pub addr_type: AddrType,
    /// DNS derivation of the destination
    pub dns_mode: DnsMode,
    /// Process name, filled on demand by process-aware rules
    pub process: Option<String>,
    /// Full executable path of the owning process
    pub process_path: Option<String>,
    /// Owning uid of the source socket
    pub uid: Option<u32>,
}

impl Metadata {
    /// Create metadata for a flow addressed by hostname
    #[must_use]
    pub fn domain(network: Network, host: impl Into<String>, dst_port: u16) -> Self {
        Self {
            network,
            in_type: InboundType::Socks5,
            src_ip: None,
            src_port: String::new(),
            dst_ip: None,
            dst_port,
            host: host.into(),
            addr_type: AddrType::Domain,
            dns_mode: DnsMode::Normal,
            process: None,
            process_path: None,
            uid: None,
        }
    }

    /// Create metadata for a flow addressed by literal IP
    #[must_use]
    pub fn ip(network: Network, dst_ip: IpAddr, dst_port: u16) -> Self {
        let addr_type = if dst_ip.is_ipv4() {
            AddrType::Ipv4
        } else {
            AddrType::Ipv6
        };
        Self {
            network,
            in_type: InboundType::Socks5,
            src_ip: None,
            src_port: String::new(),
            dst_ip: Some(dst_ip),
            dst_port,
            host: String::new(),
            addr_type,
            dns_mode: DnsMode::Normal,
            process: None,
            process_path: None,
            uid: None,
        }
    }

    /// Set the source endpoint
    #[must_use]
    pub fn with_source(mut self, src: SocketAddr) -> Self {
        self.src_ip = Some(src.ip());
        self.src_port = src.port().to_string();
        self
    }

    /// Set the inbound protocol tag
    #[must_use]
    pub const fn with_in_type(mut self, in_type: InboundType) -> Self {
        self.in_type = in_type;
        self
    }

    /// A flow is valid when it names at least one destination field
    #[must_use]
    pub fn valid(&self) -> bool {
        !self.host.is_empty() || self.dst_ip.is_some()
    }

    /// Whether the destination address has been resolved
    #[must_use]
    pub const fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    /// Numeric source port, if the textual field parses
    #[must_use]
    pub fn src_port_num(&self) -> Option<u16> {
        self.src_port.parse().ok()
    }

    /// Destination in `host:port` (or `ip:port`) display form
    #[must_use]
    pub fn remote_address(&self) -> String {
        if self.host.is_empty() {
            match self.dst_ip {
                Some(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.dst_port),
                Some(IpAddr::V4(ip)) => format!("{ip}:{}", self.dst_port),
                None => format!(":{}", self.dst_port),
            }
        } else {
            format!("{}:{}", self.host, self.dst_port)
        }
    }

    /// Destination socket address, when resolved
    #[must_use]
    pub fn dst_addr(&self) -> Option<SocketAddr> {
        self.dst_ip.map(|ip| SocketAddr::new(ip, self.dst_port))
    }

    /// Source description for log lines, including the process when known
    #[must_use]
    pub fn source_detail(&self) -> String {
        let src = match self.src_ip {
            Some(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.src_port),
            Some(IpAddr::V4(ip)) => format!("{ip}:{}", self.src_port),
            None => format!(":{}", self.src_port),
        };
        match (&self.process, self.uid) {
            (Some(process), _) => format!("{process}({src})"),
            (None, Some(uid)) => format!("uid={uid}({src})"),
            (None, None) => src,
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} --> {}",
            self.network,
            self.source_detail(),
            self.remote_address()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_valid() {
        let m = Metadata::domain(Network::Tcp, "example.com", 443);
        assert!(m.valid());
        assert!(!m.resolved());

        let m = Metadata::ip(Network::Udp, "8.8.8.8".parse().unwrap(), 53);
        assert!(m.valid());
        assert!(m.resolved());
        assert_eq!(m.addr_type, AddrType::Ipv4);

        let mut m = Metadata::domain(Network::Tcp, "", 80);
        assert!(!m.valid());
        m.dst_ip = Some("1.1.1.1".parse().unwrap());
        assert!(m.valid());
    }

    #[test]
    fn test_remote_address_forms() {
        let m = Metadata::domain(Network::Tcp, "example.com", 443);
        assert_eq!(m.remote_address(), "example.com:443");

        let m = Metadata::ip(Network::Tcp, "93.184.216.34".parse().unwrap(), 80);
        assert_eq!(m.remote_address(), "93.184.216.34:80");

        let m = Metadata::ip(Network::Tcp, "2606:2800:220:1::1".parse().unwrap(), 80);
        assert_eq!(m.remote_address(), "[2606:2800:220:1::1]:80");
    }

    #[test]
    fn test_source_detail() {
        let mut m = Metadata::domain(Network::Tcp, "example.com", 443)
            .with_source("10.0.0.2:50123".parse().unwrap());
        assert_eq!(m.source_detail(), "10.0.0.2:50123");

        m.uid = Some(1000);
        assert_eq!(m.source_detail(), "uid=1000(10.0.0.2:50123)");

        m.process = Some("curl".into());
        assert_eq!(m.source_detail(), "curl(10.0.0.2:50123)");
    }

    #[test]
    fn test_inbound_type_parse() {
        assert_eq!(InboundType::parse("HTTP"), Some(InboundType::Http));
        assert_eq!(InboundType::parse("tproxy"), Some(InboundType::Tproxy));
        assert_eq!(InboundType::parse("REDIRECT"), Some(InboundType::Redir));
        assert_eq!(InboundType::parse("bogus"), None);
    }
}
