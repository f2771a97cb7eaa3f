//! Classification rules
//!
//! Flows are classified by an ordered list of [`Rule`]s, each a
//! predicate over flow metadata bound to an outbound adapter name.
//! Variants cover domain matching, CIDR and address-suffix tests,
//! ports, process identity, transport, inbound tag, named auxiliary
//! lists, and the `AND`/`OR`/`NOT` composites.
//!
//! Parsing lives in [`logic`]; sub-rule references are resolved and
//! cycle-checked at parse time.

pub mod logic;
mod rule;
mod types;

pub use logic::{parse_rule, parse_rule_line, validate_sub_rules, GeoData, ParseContext};
pub use rule::{Rule, RuleKind};
pub use types::{PortRange, RuleType, UidRange};

/// Match-time recursion bound for `SUB-RULE` chains
///
/// Cycles are rejected at parse time; the bound is a backstop for the
/// engine's recursive descent.
pub const MAX_SUB_RULE_DEPTH: usize = 8;
