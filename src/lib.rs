//! rust-tunnel: rule-based tunnel dispatcher
//!
//! Accepts flows from inbound proxy listeners, classifies each one
//! against a configurable rule set, resolves the destination through a
//! policy-controlled DNS layer, selects an outbound adapter, and
//! shuttles bytes (or packets) between the two sides for the flow's
//! lifetime.
//!
//! # Architecture
//!
//! ```text
//! Listener → queue → Dispatcher → prehandle → sniff → rules → Outbound
//!                        │                              │
//!                    UDP NAT table                  Resolver
//!                 (single-flight dial)        (hosts / fake-IP / policy)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_tunnel::config::load_config;
//! use rust_tunnel::outbound::OutboundManagerBuilder;
//! use rust_tunnel::resolver::Resolver;
//! use rust_tunnel::tunnel::{Dispatcher, DispatcherConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/rust-tunnel/config.json")?;
//!
//! let resolver = Arc::new(
//!     Resolver::builder()
//!         .hosts(config.build_hosts())
//!         .disable_ipv6(config.dns.disable_ipv6)
//!         .build(),
//! );
//!
//! let geo = config.build_geo_data()?;
//! let (rules, sub_rules) = config.parse_rules(&geo)?;
//! let outbounds = OutboundManagerBuilder::new(Arc::clone(&resolver)).build();
//!
//! let dispatcher = Dispatcher::new(
//!     DispatcherConfig::default(),
//!     resolver,
//!     outbounds,
//!     rules,
//!     sub_rules,
//! );
//! dispatcher.start();
//! // Listeners push into dispatcher.tcp_sender() / dispatcher.udp_sender()
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`hosts`]: Static hosts table (domain trie)
//! - [`io`]: Peekable stream and bidirectional splice
//! - [`metadata`]: Per-flow descriptor
//! - [`outbound`]: Outbound adapters
//! - [`process`]: Source-socket process lookup
//! - [`resolver`]: Policy DNS resolver and fake-IP pool
//! - [`rules`]: Classification rules
//! - [`sniff`]: Protocol sniffing (TLS SNI, HTTP Host)
//! - [`tunnel`]: The dispatcher: queues, NAT, flow handlers

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod hosts;
pub mod io;
pub mod metadata;
pub mod outbound;
pub mod process;
pub mod resolver;
pub mod rules;
pub mod sniff;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use config::{Config, DnsConfig, EnhancedModeConfig, ProxyGroupConfig};
pub use error::{
    ConfigError, DispatchError, OutboundError, ResolveError, Result, RuleError, TunnelError,
};
pub use hosts::DomainTrie;
pub use metadata::{AddrType, DnsMode, InboundType, Metadata, Network};
pub use outbound::{
    BoxedStream, Direct, Outbound, OutboundDatagram, OutboundKind, OutboundManager,
    OutboundManagerBuilder, Pass, ProxyStream, Reject, Selector,
};
pub use resolver::{DnsClient, EnhancedMode, FakeIpPool, Resolver, ResolverBuilder};
pub use rules::{GeoData, ParseContext, PortRange, Rule, RuleKind, RuleType, UidRange};
pub use sniff::SnifferDispatcher;
pub use tunnel::{
    ConnContext, Dispatcher, DispatcherConfig, NatTable, PacketAdapter, PacketSink,
    TrafficManager, TrafficSnapshot, TunnelMode, TunnelSnapshot,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
