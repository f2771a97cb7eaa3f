//! Rule parsing and composite logic
//!
//! Rule lines take the form `TYPE,PAYLOAD,TARGET[,param...]`. The
//! composite types (`AND`, `OR`, `NOT`, and the `SUB-RULE` guard) carry
//! a payload of parenthesized sub-rules: `((TYPE,PAYLOAD),…)` with
//! strictly balanced parentheses. Nested composites are allowed.
//!
//! Sub-rule references are resolved against the named-list table at
//! parse time; reference cycles are rejected there, never on the hot
//! path.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::error::RuleError;
use crate::metadata::{InboundType, Network};

use super::rule::{Rule, RuleKind};
use super::types::{PortRange, UidRange};

/// Shared geo tables consulted while parsing
#[derive(Debug, Default, Clone)]
pub struct GeoData {
    /// Country code → CIDR list
    pub geoip: HashMap<String, Arc<Vec<IpNet>>>,
    /// Group name → domain suffix list
    pub geosite: HashMap<String, Arc<Vec<String>>>,
}

impl GeoData {
    /// Table with the built-in `LAN` country covering private ranges
    #[must_use]
    pub fn with_builtin_lan() -> Self {
        let lan: Vec<IpNet> = [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "127.0.0.0/8",
            "169.254.0.0/16",
            "fc00::/7",
            "fe80::/10",
            "::1/128",
        ]
        .iter()
        .map(|s| s.parse().expect("builtin CIDR parses"))
        .collect();

        let mut geoip = HashMap::new();
        geoip.insert("LAN".to_string(), Arc::new(lan));
        Self {
            geoip,
            geosite: HashMap::new(),
        }
    }
}

/// Context handed to the parser
pub struct ParseContext<'a> {
    /// Geo tables
    pub geo: &'a GeoData,
    /// Names of the defined auxiliary rule lists
    pub sub_rule_names: &'a HashSet<String>,
}

impl ParseContext<'_> {
    fn empty_geo() -> &'static GeoData {
        use std::sync::OnceLock;
        static EMPTY: OnceLock<GeoData> = OnceLock::new();
        EMPTY.get_or_init(GeoData::default)
    }

    /// Context with no geo tables and no sub-rule lists
    #[must_use]
    pub fn bare() -> ParseContext<'static> {
        use std::sync::OnceLock;
        static NAMES: OnceLock<HashSet<String>> = OnceLock::new();
        ParseContext {
            geo: Self::empty_geo(),
            sub_rule_names: NAMES.get_or_init(HashSet::new),
        }
    }
}

/// Parse one rule from its parts
///
/// `target` is the adapter name; composite children are parsed with an
/// empty target.
///
/// # Errors
///
/// Returns `RuleError` for unknown types, malformed payloads, unknown
/// geo entries, or undefined sub-rule references.
pub fn parse_rule(
    tp: &str,
    payload: &str,
    target: &str,
    params: &[&str],
    ctx: &ParseContext<'_>,
) -> Result<Rule, RuleError> {
    let no_resolve = params.iter().any(|p| p.eq_ignore_ascii_case("no-resolve"));

    let kind = match tp.to_ascii_uppercase().as_str() {
        "DOMAIN" => RuleKind::Domain(payload.to_ascii_lowercase()),
        "DOMAIN-SUFFIX" => RuleKind::DomainSuffix(payload.to_ascii_lowercase()),
        "DOMAIN-KEYWORD" => RuleKind::DomainKeyword(payload.to_ascii_lowercase()),
        "GEOSITE" => {
            let suffixes = ctx
                .geo
                .geosite
                .get(&payload.to_ascii_lowercase())
                .ok_or_else(|| RuleError::UnknownGeoEntry(payload.to_string()))?;
            RuleKind::GeoSite {
                group: payload.to_string(),
                suffixes: Arc::clone(suffixes),
            }
        }
        "GEOIP" => {
            let country = payload.to_ascii_uppercase();
            let networks = ctx
                .geo
                .geoip
                .get(&country)
                .ok_or_else(|| RuleError::UnknownGeoEntry(payload.to_string()))?;
            RuleKind::GeoIp {
                country,
                networks: Arc::clone(networks),
                no_resolve,
            }
        }
        "IP-CIDR" | "IP-CIDR6" => RuleKind::IpCidr {
            net: parse_cidr(payload)?,
            source: false,
            no_resolve,
        },
        "SRC-IP-CIDR" => RuleKind::IpCidr {
            net: parse_cidr(payload)?,
            source: true,
            no_resolve: true,
        },
        "IP-SUFFIX" => {
            let (addr, bits) = parse_ip_suffix(payload)?;
            RuleKind::IpSuffix {
                addr,
                bits,
                source: false,
                no_resolve,
            }
        }
        "SRC-IP-SUFFIX" => {
            let (addr, bits) = parse_ip_suffix(payload)?;
            RuleKind::IpSuffix {
                addr,
                bits,
                source: true,
                no_resolve: true,
            }
        }
        "DST-PORT" => RuleKind::Port {
            range: PortRange::parse(payload)?,
            source: false,
        },
        "SRC-PORT" => RuleKind::Port {
            range: PortRange::parse(payload)?,
            source: true,
        },
        "PROCESS-NAME" => RuleKind::Process {
            name: payload.to_string(),
            by_path: false,
        },
        "PROCESS-PATH" => RuleKind::Process {
            name: payload.to_string(),
            by_path: true,
        },
        "NETWORK" => match payload.to_ascii_lowercase().as_str() {
            "tcp" => RuleKind::NetworkType(Network::Tcp),
            "udp" => RuleKind::NetworkType(Network::Udp),
            _ => return Err(RuleError::InvalidPayload(payload.to_string())),
        },
        "UID" => RuleKind::Uid(UidRange::parse(payload)?),
        "IN-TYPE" => RuleKind::InType(
            InboundType::parse(payload)
                .ok_or_else(|| RuleError::InvalidPayload(payload.to_string()))?,
        ),
        "SUB-RULE" => {
            let mut children = parse_composite(payload, ctx)?;
            if children.len() != 1 {
                return Err(RuleError::PayloadFormat(format!(
                    "SUB-RULE takes exactly one condition: {payload}"
                )));
            }
            if !ctx.sub_rule_names.contains(target) {
                return Err(RuleError::SubRuleNotFound(target.to_string()));
            }
            RuleKind::SubRule {
                cond: Box::new(children.remove(0)),
                name: target.to_string(),
            }
        }
        "AND" => RuleKind::And(parse_composite(payload, ctx)?),
        "OR" => RuleKind::Or(parse_composite(payload, ctx)?),
        "NOT" => {
            let mut children = parse_composite(payload, ctx)?;
            if children.len() != 1 {
                return Err(RuleError::PayloadFormat(format!(
                    "NOT takes exactly one sub-rule: {payload}"
                )));
            }
            RuleKind::Not(Box::new(children.remove(0)))
        }
        "MATCH" => RuleKind::Match,
        other => return Err(RuleError::InvalidRuleType(other.to_string())),
    };

    Ok(Rule::new(kind, payload, target))
}

/// Parse a full rule line `TYPE,PAYLOAD,TARGET[,param...]`
///
/// `MATCH,TARGET` carries no payload. Composite payloads contain commas
/// and parentheses, so the target is taken from the final comma.
///
/// # Errors
///
/// Returns `RuleError` as [`parse_rule`] does.
pub fn parse_rule_line(line: &str, ctx: &ParseContext<'_>) -> Result<Rule, RuleError> {
    let line = line.trim();
    let (tp, rest) = line
        .split_once(',')
        .ok_or_else(|| RuleError::InvalidPayload(line.to_string()))?;
    let tp = tp.trim();

    match tp.to_ascii_uppercase().as_str() {
        "MATCH" => parse_rule(tp, "", rest.trim(), &[], ctx),
        "AND" | "OR" | "NOT" | "SUB-RULE" => {
            let (payload, target) = rest
                .rsplit_once(',')
                .ok_or_else(|| RuleError::InvalidPayload(line.to_string()))?;
            parse_rule(tp, payload.trim(), target.trim(), &[], ctx)
        }
        _ => {
            let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
            if parts.len() < 2 {
                return Err(RuleError::InvalidPayload(line.to_string()));
            }
            parse_rule(tp, parts[0], parts[1], &parts[2..], ctx)
        }
    }
}

/// Parse a composite payload `((TYPE,PAYLOAD),…)` into sub-rules
fn parse_composite(payload: &str, ctx: &ParseContext<'_>) -> Result<Vec<Rule>, RuleError> {
    let groups = split_groups(payload)?;
    if groups.is_empty() {
        return Err(RuleError::PayloadFormat(payload.to_string()));
    }
    groups
        .into_iter()
        .map(|group| group_to_rule(group, ctx))
        .collect()
}

/// Split a composite payload into the contents of its sub-rule groups
///
/// A payload of the form `((A),(B),…)` carries one outer wrapper whose
/// parentheses must match exactly; it is stripped before the children
/// are collected. A bare child list `(A),(B)` (as produced for nested
/// composites) is accepted as-is. Anything at the top level other than
/// groups, separating commas, and spaces is a format error, as is any
/// unbalanced parenthesis.
fn split_groups(payload: &str) -> Result<Vec<&str>, RuleError> {
    let payload = payload.trim();
    let groups = scan_groups(payload)?;

    // a single group spanning the whole payload is the outer wrapper
    if let [only] = groups.as_slice() {
        if payload.len() >= 2 && *only == &payload[1..payload.len() - 1] {
            return scan_groups(only);
        }
    }
    Ok(groups)
}

/// Collect the contents of the top-level `(...)` groups in `payload`
fn scan_groups(payload: &str) -> Result<Vec<&str>, RuleError> {
    let bytes = payload.as_bytes();
    let mut groups = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => {
                if depth == 0 {
                    start = i + 1;
                }
                depth += 1;
            }
            b')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| RuleError::PayloadFormat(payload.to_string()))?;
                if depth == 0 {
                    groups.push(&payload[start..i]);
                }
            }
            b',' | b' ' | b'\t' if depth == 0 => {}
            _ if depth == 0 => {
                return Err(RuleError::PayloadFormat(payload.to_string()));
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(RuleError::PayloadFormat(payload.to_string()));
    }
    Ok(groups)
}

/// Turn a single group body `TYPE,PAYLOAD` into a rule
fn group_to_rule(group: &str, ctx: &ParseContext<'_>) -> Result<Rule, RuleError> {
    let (tp, rest) = group
        .split_once(',')
        .ok_or_else(|| RuleError::PayloadFormat(group.to_string()))?;
    let tp = tp.trim();

    match tp.to_ascii_uppercase().as_str() {
        // nested composites keep the whole remainder as their payload
        "AND" | "OR" | "NOT" => parse_rule(tp, rest.trim(), "", &[], ctx),
        _ => {
            let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
            parse_rule(tp, parts[0], "", &parts[1..], ctx)
        }
    }
}

fn parse_cidr(payload: &str) -> Result<IpNet, RuleError> {
    payload
        .trim()
        .parse()
        .map_err(|_| RuleError::InvalidPayload(payload.to_string()))
}

fn parse_ip_suffix(payload: &str) -> Result<(IpAddr, u8), RuleError> {
    let (addr, bits) = payload
        .split_once('/')
        .ok_or_else(|| RuleError::InvalidPayload(payload.to_string()))?;
    let addr: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| RuleError::InvalidPayload(payload.to_string()))?;
    let bits: u8 = bits
        .trim()
        .parse()
        .map_err(|_| RuleError::InvalidPayload(payload.to_string()))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if bits > max {
        return Err(RuleError::InvalidPayload(payload.to_string()));
    }
    Ok((addr, bits))
}

/// Reject cycles among the named auxiliary rule lists
///
/// Walks every `SUB-RULE` reference (including those nested inside
/// composites) with a depth-first search over the name graph.
///
/// # Errors
///
/// Returns `RuleError::SubRuleCycle` naming a list on the cycle.
pub fn validate_sub_rules(sub_rules: &HashMap<String, Vec<Rule>>) -> Result<(), RuleError> {
    fn collect_refs<'a>(rule: &'a Rule, refs: &mut Vec<&'a str>) {
        match rule.kind() {
            RuleKind::SubRule { name, .. } => refs.push(name),
            RuleKind::And(children) | RuleKind::Or(children) => {
                for child in children {
                    collect_refs(child, refs);
                }
            }
            RuleKind::Not(child) => collect_refs(child, refs),
            _ => {}
        }
    }

    fn visit<'a>(
        name: &'a str,
        sub_rules: &'a HashMap<String, Vec<Rule>>,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), RuleError> {
        if done.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name) {
            return Err(RuleError::SubRuleCycle(name.to_string()));
        }
        if let Some(rules) = sub_rules.get(name) {
            let mut refs = Vec::new();
            for rule in rules {
                collect_refs(rule, &mut refs);
            }
            for next in refs {
                visit(next, sub_rules, visiting, done)?;
            }
        }
        visiting.remove(name);
        done.insert(name);
        Ok(())
    }

    let mut done = HashSet::new();
    for name in sub_rules.keys() {
        let mut visiting = HashSet::new();
        visit(name, sub_rules, &mut visiting, &mut done)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::rules::types::RuleType;

    fn parse(tp: &str, payload: &str, target: &str) -> Result<Rule, RuleError> {
        parse_rule(tp, payload, target, &[], &ParseContext::bare())
    }

    #[test]
    fn test_and_composite() {
        let rule = parse(
            "AND",
            "((DOMAIN,baidu.com),(NETWORK,TCP),(DST-PORT,10001-65535))",
            "DIRECT",
        )
        .unwrap();
        assert_eq!(rule.adapter(), "DIRECT");
        assert!(!rule.should_resolve_ip());

        let mut m = Metadata::domain(Network::Tcp, "baidu.com", 20000);
        assert!(rule.matches(&m));
        m.dst_port = 9999;
        assert!(!rule.matches(&m));
        m.dst_port = 20000;
        m.network = Network::Udp;
        assert!(!rule.matches(&m));
    }

    #[test]
    fn test_and_unbalanced_payload_fails() {
        let err = parse(
            "AND",
            "(DOMAIN,baidu.com),(NETWORK,TCP),(DST-PORT,10001-65535))",
            "DIRECT",
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::PayloadFormat(_)));
    }

    #[test]
    fn test_nested_and() {
        let rule = parse(
            "AND",
            "((AND,(DOMAIN,baidu.com),(NETWORK,TCP)),(NETWORK,TCP),(DST-PORT,10001-65535))",
            "DIRECT",
        )
        .unwrap();

        let m = Metadata::domain(Network::Tcp, "baidu.com", 20000);
        assert!(rule.matches(&m));
    }

    #[test]
    fn test_or_composite() {
        let rule = parse(
            "OR",
            "((DOMAIN,baidu.com),(NETWORK,TCP),(DST-PORT,10001-65535))",
            "DIRECT",
        )
        .unwrap();
        assert!(!rule.should_resolve_ip());

        // host and port miss, NETWORK alone carries the match
        let m = Metadata::domain(Network::Tcp, "other.com", 80);
        assert!(rule.matches(&m));

        let m = Metadata::domain(Network::Udp, "other.com", 80);
        assert!(!rule.matches(&m));
    }

    #[test]
    fn test_not_composite() {
        let rule = parse("NOT", "((DST-PORT,6000-6500))", "REJECT").unwrap();

        let mut m = Metadata::domain(Network::Tcp, "x", 6100);
        assert!(!rule.matches(&m));
        m.dst_port = 9999;
        assert!(rule.matches(&m));

        // two children are rejected
        assert!(parse("NOT", "((DST-PORT,5600-6666),(DOMAIN,baidu.com))", "DIRECT").is_err());
        // as is an empty inner group
        assert!(parse("NOT", "(())", "DIRECT").is_err());
    }

    #[test]
    fn test_match_inside_composite_rejected() {
        assert!(parse("AND", "((MATCH))", "DIRECT").is_err());
    }

    #[test]
    fn test_no_resolve_param() {
        let geo = GeoData::with_builtin_lan();
        let names = HashSet::new();
        let ctx = ParseContext {
            geo: &geo,
            sub_rule_names: &names,
        };

        let rule = parse_rule("GEOIP", "LAN", "DIRECT", &[], &ctx).unwrap();
        assert!(rule.should_resolve_ip());

        let rule = parse_rule("GEOIP", "LAN", "DIRECT", &["no-resolve"], &ctx).unwrap();
        assert!(!rule.should_resolve_ip());

        let mut m = Metadata::domain(Network::Tcp, "printer.local", 631);
        m.dst_ip = Some("192.168.1.50".parse().unwrap());
        assert!(rule.matches(&m));
    }

    #[test]
    fn test_unknown_geo_entry() {
        let err = parse("GEOIP", "ZZ", "DIRECT").unwrap_err();
        assert!(matches!(err, RuleError::UnknownGeoEntry(_)));
        let err = parse("GEOSITE", "nonexistent", "DIRECT").unwrap_err();
        assert!(matches!(err, RuleError::UnknownGeoEntry(_)));
    }

    #[test]
    fn test_unknown_rule_type() {
        let err = parse("BOGUS", "x", "DIRECT").unwrap_err();
        assert!(matches!(err, RuleError::InvalidRuleType(_)));
    }

    #[test]
    fn test_rule_line_forms() {
        let ctx = ParseContext::bare();

        let rule = parse_rule_line("DOMAIN-SUFFIX,google.com,PROXY1", &ctx).unwrap();
        assert_eq!(rule.rule_type(), RuleType::DomainSuffix);
        assert_eq!(rule.adapter(), "PROXY1");

        let rule = parse_rule_line("MATCH,DIRECT", &ctx).unwrap();
        assert_eq!(rule.rule_type(), RuleType::Match);
        assert_eq!(rule.adapter(), "DIRECT");

        let rule = parse_rule_line(
            "AND,((DOMAIN,baidu.com),(DST-PORT,10001-65535)),PROXY1",
            &ctx,
        )
        .unwrap();
        assert_eq!(rule.rule_type(), RuleType::And);
        assert_eq!(rule.adapter(), "PROXY1");

        let rule = parse_rule_line("IP-CIDR,10.0.0.0/8,DIRECT,no-resolve", &ctx).unwrap();
        assert!(!rule.should_resolve_ip());
    }

    #[test]
    fn test_sub_rule_parse_and_missing_name() {
        let geo = GeoData::default();
        let mut names = HashSet::new();
        names.insert("aux".to_string());
        let ctx = ParseContext {
            geo: &geo,
            sub_rule_names: &names,
        };

        let rule = parse_rule("SUB-RULE", "((NETWORK,UDP))", "aux", &[], &ctx).unwrap();
        assert_eq!(rule.rule_type(), RuleType::SubRule);
        assert!(rule.matches(&Metadata::domain(Network::Udp, "x", 53)));
        assert!(!rule.matches(&Metadata::domain(Network::Tcp, "x", 53)));

        let err = parse_rule("SUB-RULE", "((NETWORK,UDP))", "missing", &[], &ctx).unwrap_err();
        assert!(matches!(err, RuleError::SubRuleNotFound(_)));
    }

    #[test]
    fn test_sub_rule_cycle_detection() {
        let geo = GeoData::default();
        let mut names = HashSet::new();
        names.insert("a".to_string());
        names.insert("b".to_string());
        let ctx = ParseContext {
            geo: &geo,
            sub_rule_names: &names,
        };

        let a_to_b = parse_rule("SUB-RULE", "((NETWORK,TCP))", "b", &[], &ctx).unwrap();
        let b_to_a = parse_rule("SUB-RULE", "((NETWORK,TCP))", "a", &[], &ctx).unwrap();

        let mut sub_rules = HashMap::new();
        sub_rules.insert("a".to_string(), vec![a_to_b.clone()]);
        sub_rules.insert("b".to_string(), vec![b_to_a]);
        assert!(matches!(
            validate_sub_rules(&sub_rules),
            Err(RuleError::SubRuleCycle(_))
        ));

        // acyclic chain passes
        let mut sub_rules = HashMap::new();
        sub_rules.insert("a".to_string(), vec![a_to_b]);
        sub_rules.insert(
            "b".to_string(),
            vec![parse_rule("MATCH", "", "DIRECT", &[], &ctx).unwrap()],
        );
        assert!(validate_sub_rules(&sub_rules).is_ok());
    }

    #[test]
    fn test_ip_suffix_parse() {
        let rule = parse("IP-SUFFIX", "8.8.8.8/24", "DIRECT").unwrap();
        let mut m = Metadata::domain(Network::Tcp, "", 443);
        m.dst_ip = Some("1.8.8.8".parse().unwrap());
        assert!(rule.matches(&m));
        m.dst_ip = Some("8.8.9.8".parse().unwrap());
        assert!(!rule.matches(&m));

        assert!(parse("IP-SUFFIX", "8.8.8.8/40", "DIRECT").is_err());
        assert!(parse("IP-SUFFIX", "8.8.8.8", "DIRECT").is_err());
    }
}
