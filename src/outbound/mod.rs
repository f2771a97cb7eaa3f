//! Outbound adapters
//!
//! The outbound side of the tunnel: a [`Outbound`] trait shared by the
//! leaf adapters (direct dial, reject, pass-through marker) and the
//! selector group, plus the [`OutboundManager`] table the rule engine
//! resolves adapter names against.

mod direct;
mod manager;
mod reject;
mod selector;
mod traits;

pub use direct::Direct;
pub use manager::{OutboundManager, OutboundManagerBuilder, GLOBAL};
pub use reject::{Pass, Reject};
pub use selector::Selector;
pub use traits::{BoxedStream, Outbound, OutboundDatagram, OutboundKind, ProxyStream};
