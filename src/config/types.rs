//! Configuration types
//!
//! The JSON-facing configuration surface: routing mode, DNS policy,
//! geo tables, proxy groups, and rule lines. `validate()` parses every
//! embedded mini-language (CIDRs, rule lines, the fake-IP range) so a
//! bad file fails at load, not mid-flow.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hosts::DomainTrie;
use crate::resolver::EnhancedMode;
use crate::rules::{parse_rule_line, validate_sub_rules, GeoData, ParseContext, Rule};
use crate::tunnel::TunnelMode;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Routing mode
    #[serde(default)]
    pub mode: TunnelMode,

    /// Run protocol sniffing over TCP flows
    #[serde(default)]
    pub sniffing_enable: bool,

    /// Look up process identity for every flow
    #[serde(default)]
    pub always_find_process: bool,

    /// UDP session idle timeout in seconds
    #[serde(default = "default_udp_timeout_secs")]
    pub udp_timeout_secs: u64,

    /// DNS policy
    #[serde(default)]
    pub dns: DnsConfig,

    /// Country code → CIDR list
    #[serde(default)]
    pub geoip: HashMap<String, Vec<String>>,

    /// Group name → domain suffix list
    #[serde(default)]
    pub geosite: HashMap<String, Vec<String>>,

    /// Selector groups
    #[serde(default)]
    pub proxy_groups: Vec<ProxyGroupConfig>,

    /// Rule lines, `TYPE,PAYLOAD,TARGET[,param...]`
    #[serde(default)]
    pub rules: Vec<String>,

    /// Named auxiliary rule lists for `SUB-RULE`
    #[serde(default)]
    pub sub_rules: HashMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: TunnelMode::Rule,
            sniffing_enable: false,
            always_find_process: false,
            udp_timeout_secs: default_udp_timeout_secs(),
            dns: DnsConfig::default(),
            geoip: HashMap::new(),
            geosite: HashMap::new(),
            proxy_groups: Vec::new(),
            rules: Vec::new(),
            sub_rules: HashMap::new(),
        }
    }
}

/// DNS policy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Refuse IPv6 resolution everywhere
    #[serde(default = "default_true")]
    pub disable_ipv6: bool,

    /// Resolver enhancement
    #[serde(default)]
    pub enhanced_mode: EnhancedModeConfig,

    /// CIDR the fake-IP pool allocates from
    #[serde(default = "default_fake_ip_range")]
    pub fake_ip_range: String,

    /// Bound on live fake-IP mappings
    #[serde(default = "default_fake_ip_pool_size")]
    pub fake_ip_pool_size: usize,

    /// Snapshot file persisting the pool across restarts
    #[serde(default)]
    pub fake_ip_store_path: Option<PathBuf>,

    /// DNS request timeout in seconds
    #[serde(default = "default_dns_timeout_secs")]
    pub dns_timeout_secs: u64,

    /// Static hosts table; keys accept `*` / `+` wildcards
    #[serde(default)]
    pub hosts: HashMap<String, IpAddr>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            disable_ipv6: true,
            enhanced_mode: EnhancedModeConfig::default(),
            fake_ip_range: default_fake_ip_range(),
            fake_ip_pool_size: default_fake_ip_pool_size(),
            fake_ip_store_path: None,
            dns_timeout_secs: default_dns_timeout_secs(),
            hosts: HashMap::new(),
        }
    }
}

/// Serde spelling of the resolver enhancement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum EnhancedModeConfig {
    /// Plain resolution
    #[default]
    #[serde(rename = "normal")]
    Normal,
    /// redir-host reverse mapping
    #[serde(rename = "mapping")]
    Mapping,
    /// Virtual addresses from the fake pool
    #[serde(rename = "fake-ip")]
    FakeIp,
}

impl From<EnhancedModeConfig> for EnhancedMode {
    fn from(mode: EnhancedModeConfig) -> Self {
        match mode {
            EnhancedModeConfig::Normal => Self::Normal,
            EnhancedModeConfig::Mapping => Self::Mapping,
            EnhancedModeConfig::FakeIp => Self::FakeIp,
        }
    }
}

/// Selector group definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyGroupConfig {
    /// Group name, referenced by rules
    pub name: String,
    /// Member adapter names in priority order
    pub members: Vec<String>,
}

impl Config {
    /// Validate every embedded mini-language
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first
    /// offending entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dns.enhanced_mode != EnhancedModeConfig::Normal {
            self.fake_ip_range()?;
        }
        if self.dns.fake_ip_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "fake_ip_pool_size must be positive".into(),
            ));
        }

        let geo = self.build_geo_data()?;
        let (_, sub_rules) = self.parse_rules(&geo)?;
        validate_sub_rules(&sub_rules)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        for group in &self.proxy_groups {
            if group.members.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "proxy group '{}' has no members",
                    group.name
                )));
            }
        }

        Ok(())
    }

    /// The parsed fake-IP range
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on a malformed CIDR.
    pub fn fake_ip_range(&self) -> Result<Ipv4Net, ConfigError> {
        self.dns.fake_ip_range.parse().map_err(|_| {
            ConfigError::ValidationError(format!(
                "invalid fake_ip_range: {}",
                self.dns.fake_ip_range
            ))
        })
    }

    /// Assemble the geo tables, built-in `LAN` included
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on a malformed CIDR.
    pub fn build_geo_data(&self) -> Result<GeoData, ConfigError> {
        let mut geo = GeoData::with_builtin_lan();

        for (country, cidrs) in &self.geoip {
            let networks: Vec<IpNet> = cidrs
                .iter()
                .map(|cidr| {
                    cidr.parse().map_err(|_| {
                        ConfigError::ValidationError(format!(
                            "geoip {country}: invalid CIDR {cidr}"
                        ))
                    })
                })
                .collect::<Result<_, _>>()?;
            geo.geoip
                .insert(country.to_ascii_uppercase(), Arc::new(networks));
        }

        for (group, suffixes) in &self.geosite {
            let suffixes: Vec<String> =
                suffixes.iter().map(|s| s.to_ascii_lowercase()).collect();
            geo.geosite
                .insert(group.to_ascii_lowercase(), Arc::new(suffixes));
        }

        Ok(geo)
    }

    /// Build the static hosts trie
    #[must_use]
    pub fn build_hosts(&self) -> DomainTrie<IpAddr> {
        let mut trie = DomainTrie::new();
        for (pattern, ip) in &self.dns.hosts {
            trie.insert(pattern, *ip);
        }
        trie
    }

    /// Parse the rule lines and sub-rule lists
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the bad line.
    pub fn parse_rules(
        &self,
        geo: &GeoData,
    ) -> Result<(Vec<Rule>, HashMap<String, Vec<Rule>>), ConfigError> {
        let sub_rule_names: HashSet<String> = self.sub_rules.keys().cloned().collect();
        let ctx = ParseContext {
            geo,
            sub_rule_names: &sub_rule_names,
        };

        let parse_line = |line: &String| {
            parse_rule_line(line, &ctx).map_err(|e| {
                ConfigError::ValidationError(format!("rule '{line}': {e}"))
            })
        };

        let rules = self.rules.iter().map(parse_line).collect::<Result<_, _>>()?;

        let mut sub_rules = HashMap::new();
        for (name, lines) in &self.sub_rules {
            let parsed = lines.iter().map(parse_line).collect::<Result<_, _>>()?;
            sub_rules.insert(name.clone(), parsed);
        }

        Ok((rules, sub_rules))
    }
}

const fn default_true() -> bool {
    true
}

const fn default_udp_timeout_secs() -> u64 {
    60
}

const fn default_dns_timeout_secs() -> u64 {
    5
}

fn default_fake_ip_range() -> String {
    "198.18.0.0/16".to_string()
}

const fn default_fake_ip_pool_size() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mode, TunnelMode::Rule);
        assert!(config.dns.disable_ipv6);
        assert_eq!(config.dns.fake_ip_range, "198.18.0.0/16");
        assert_eq!(config.udp_timeout_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_minimal() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.mode, TunnelMode::Rule);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_deserialize_full() {
        let json = r#"{
            "mode": "global",
            "sniffing_enable": true,
            "dns": {
                "disable_ipv6": false,
                "enhanced_mode": "fake-ip",
                "fake_ip_range": "198.18.0.0/16",
                "hosts": { "router.local": "192.168.1.1" }
            },
            "geoip": { "CN": ["36.0.0.0/8"] },
            "geosite": { "video": ["youtube.com"] },
            "proxy_groups": [ { "name": "auto", "members": ["DIRECT"] } ],
            "rules": [
                "GEOSITE,video,auto",
                "GEOIP,CN,DIRECT",
                "MATCH,DIRECT"
            ],
            "sub_rules": { "aux": ["MATCH,DIRECT"] }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.mode, TunnelMode::Global);
        assert!(config.sniffing_enable);
        assert!(!config.dns.disable_ipv6);
        assert_eq!(config.dns.enhanced_mode, EnhancedModeConfig::FakeIp);
        assert!(config.validate().is_ok());

        let geo = config.build_geo_data().unwrap();
        let (rules, sub_rules) = config.parse_rules(&geo).unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(sub_rules["aux"].len(), 1);

        let hosts = config.build_hosts();
        assert_eq!(
            hosts.search("router.local"),
            Some(&"192.168.1.1".parse().unwrap())
        );
    }

    #[test]
    fn test_validate_rejects_bad_rule() {
        let mut config = Config::default();
        config.rules.push("BOGUS,payload,DIRECT".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_fake_range() {
        let mut config = Config::default();
        config.dns.enhanced_mode = EnhancedModeConfig::FakeIp;
        config.dns.fake_ip_range = "not-a-cidr".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_sub_rule_cycle() {
        let mut config = Config::default();
        config
            .sub_rules
            .insert("a".into(), vec!["SUB-RULE,((NETWORK,TCP)),b".into()]);
        config
            .sub_rules
            .insert("b".into(), vec!["SUB-RULE,((NETWORK,TCP)),a".into()]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_validate_rejects_empty_group() {
        let mut config = Config::default();
        config.proxy_groups.push(ProxyGroupConfig {
            name: "empty".into(),
            members: vec![],
        });
        assert!(config.validate().is_err());
    }
}
