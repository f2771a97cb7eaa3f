//! Error types for rust-tunnel
//!
//! This module defines the error hierarchy for the tunnel dispatcher.
//! All errors are categorized by subsystem and include recovery hints.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Top-level error type for rust-tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// DNS resolution errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Rule parsing and evaluation errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Outbound dial errors
    #[error("Outbound error: {0}")]
    Outbound(#[from] OutboundError),

    /// Flow dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable (the flow may be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Resolve(e) => e.is_recoverable(),
            Self::Rule(e) => e.is_recoverable(),
            Self::Outbound(e) => e.is_recoverable(),
            Self::Dispatch(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// DNS resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No address of the requested family was found
    #[error("couldn't find ip")]
    IpNotFound,

    /// The host is a literal address of the wrong family
    #[error("ip version error")]
    IpVersion,

    /// IPv6 resolution is globally disabled
    #[error("ipv6 disabled")]
    Ipv6Disabled,

    /// The configured upstream resolver failed
    #[error("upstream resolver error: {0}")]
    Upstream(String),

    /// Lookup exceeded the DNS timeout
    #[error("dns lookup for {host} timed out")]
    Timeout { host: String },

    /// System resolver I/O failure
    #[error("resolver I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ResolveError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::IpNotFound | Self::Upstream(_) | Self::Timeout { .. } => true,
            Self::IpVersion | Self::Ipv6Disabled => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
        }
    }
}

/// Rule parsing and evaluation errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Unknown rule type string
    #[error("unsupported rule type {0}")]
    InvalidRuleType(String),

    /// Invalid rule payload
    #[error("invalid rule payload: {0}")]
    InvalidPayload(String),

    /// Invalid port range (start > end or unparsable)
    #[error("invalid port range: {0}")]
    InvalidPortRange(String),

    /// Composite payload is not of the form `((TYPE,PAYLOAD),...)`
    #[error("payload format error: {0}")]
    PayloadFormat(String),

    /// Sub-rule reference to an undefined named list
    #[error("sub-rule set not found: {0}")]
    SubRuleNotFound(String),

    /// Sub-rule references form a cycle
    #[error("sub-rule cycle detected through {0}")]
    SubRuleCycle(String),

    /// GeoIP country or GeoSite group not present in the tables
    #[error("unknown geo table entry: {0}")]
    UnknownGeoEntry(String),
}

impl RuleError {
    /// Rule errors indicate configuration problems and are not recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Outbound dial errors
#[derive(Debug, Error)]
pub enum OutboundError {
    /// Connection refused by a reject adapter
    #[error("connection rejected by {name}")]
    Rejected { name: String },

    /// Adapter name not present in the proxy table
    #[error("outbound not found: {name}")]
    NotFound { name: String },

    /// Adapter does not support UDP flows
    #[error("outbound '{name}' does not support UDP")]
    UdpNotSupported { name: String },

    /// TCP dial failed
    #[error("failed to connect to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Dial exceeded the per-flow timeout
    #[error("dial to {addr} timed out after {timeout_secs}s")]
    Timeout { addr: String, timeout_secs: u64 },

    /// The destination could not be resolved for the dial
    #[error("resolve for dial failed: {0}")]
    Resolve(#[from] ResolveError),

    /// I/O error during dial or relay setup
    #[error("outbound I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl OutboundError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Rejected { .. } | Self::NotFound { .. } | Self::UdpNotSupported { .. } => false,
            Self::ConnectionFailed { .. } | Self::Timeout { .. } => true,
            Self::Resolve(e) => e.is_recoverable(),
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }
}

/// Flow dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Fake-IP reverse lookup missed for an address inside the fake range
    #[error("fake DNS record {0} missing")]
    FakeIpMissing(IpAddr),

    /// The listener produced metadata failing `valid()`
    #[error("metadata not valid: {0}")]
    MetadataInvalid(String),

    /// The fan-in queue is closed (dispatcher shut down)
    #[error("dispatch queue closed")]
    QueueClosed,

    /// The fan-in queue is full (listener backpressure)
    #[error("dispatch queue full")]
    QueueFull,
}

impl DispatchError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::QueueFull)
    }
}

/// Type alias for Result with `TunnelError`
pub type Result<T> = std::result::Result<T, TunnelError>;
