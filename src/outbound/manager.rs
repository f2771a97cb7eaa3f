//! Outbound adapter table
//!
//! Owns the name → adapter map consulted by the rule engine. The four
//! standard adapters (`DIRECT`, `REJECT`, `PASS`, `GLOBAL`) are always
//! present; `GLOBAL` is a selector over every other adapter and serves
//! global mode.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::resolver::Resolver;

use super::direct::Direct;
use super::reject::{Pass, Reject};
use super::selector::Selector;
use super::traits::Outbound;

/// Standard global-mode selector name
pub const GLOBAL: &str = "GLOBAL";

/// Name → adapter table
pub struct OutboundManager {
    adapters: HashMap<String, Arc<dyn Outbound>>,
}

impl OutboundManager {
    /// Look up an adapter by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Outbound>> {
        self.adapters.get(name).map(Arc::clone)
    }

    /// The table itself, for snapshot publication
    #[must_use]
    pub fn adapters(&self) -> &HashMap<String, Arc<dyn Outbound>> {
        &self.adapters
    }

    /// Consume into the underlying map
    #[must_use]
    pub fn into_adapters(self) -> HashMap<String, Arc<dyn Outbound>> {
        self.adapters
    }

    /// Number of adapters, standard entries included
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Never true: the standard adapters always exist
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Builder assembling the adapter table
pub struct OutboundManagerBuilder {
    adapters: HashMap<String, Arc<dyn Outbound>>,
}

impl OutboundManagerBuilder {
    /// Start with the standard leaf adapters installed
    #[must_use]
    pub fn new(resolver: Arc<Resolver>) -> Self {
        let mut adapters: HashMap<String, Arc<dyn Outbound>> = HashMap::new();
        adapters.insert(Direct::NAME.to_string(), Arc::new(Direct::new(resolver)));
        adapters.insert(Reject::NAME.to_string(), Arc::new(Reject::new()));
        adapters.insert(Pass::NAME.to_string(), Arc::new(Pass::new()));
        Self { adapters }
    }

    /// Add an adapter
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on a duplicate name.
    pub fn add(&mut self, adapter: Arc<dyn Outbound>) -> Result<&mut Self, ConfigError> {
        let name = adapter.name().to_string();
        if self.adapters.contains_key(&name) {
            return Err(ConfigError::ValidationError(format!(
                "duplicate outbound name: {name}"
            )));
        }
        self.adapters.insert(name, adapter);
        Ok(self)
    }

    /// Add a selector group over named members
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when a member is unknown
    /// or the group is empty.
    pub fn add_selector(
        &mut self,
        name: &str,
        member_names: &[String],
    ) -> Result<&mut Self, ConfigError> {
        if member_names.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "selector '{name}' has no members"
            )));
        }
        let members = member_names
            .iter()
            .map(|member| {
                self.adapters.get(member).map(Arc::clone).ok_or_else(|| {
                    ConfigError::ValidationError(format!(
                        "selector '{name}' references unknown outbound '{member}'"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.add(Arc::new(Selector::new(name, members)))
    }

    /// Finish, installing the `GLOBAL` selector
    #[must_use]
    pub fn build(mut self) -> OutboundManager {
        // GLOBAL selects among everything except PASS, DIRECT first
        let mut names: Vec<&String> = self
            .adapters
            .keys()
            .filter(|n| n.as_str() != Pass::NAME)
            .collect();
        names.sort_by_key(|n| (n.as_str() != Direct::NAME, (*n).clone()));
        let members: Vec<Arc<dyn Outbound>> = names
            .into_iter()
            .map(|n| Arc::clone(&self.adapters[n]))
            .collect();

        self.adapters
            .insert(GLOBAL.to_string(), Arc::new(Selector::new(GLOBAL, members)));
        OutboundManager {
            adapters: self.adapters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> OutboundManagerBuilder {
        OutboundManagerBuilder::new(Arc::new(Resolver::builder().build()))
    }

    #[test]
    fn test_standard_adapters_present() {
        let manager = builder().build();
        assert!(manager.get("DIRECT").is_some());
        assert!(manager.get("REJECT").is_some());
        assert!(manager.get("PASS").is_some());
        assert!(manager.get("GLOBAL").is_some());
        assert!(manager.get("MISSING").is_none());
    }

    #[test]
    fn test_global_prefers_direct() {
        let manager = builder().build();
        let global = manager.get("GLOBAL").unwrap();
        let metadata = crate::metadata::Metadata::domain(crate::metadata::Network::Tcp, "x", 80);
        let inner = global.unwrap_inner(&metadata).unwrap();
        assert_eq!(inner.name(), "DIRECT");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut b = builder();
        match b.add(Arc::new(Reject::new())) {
            Err(err) => assert!(matches!(err, ConfigError::ValidationError(_))),
            Ok(_) => panic!("expected add to fail"),
        }
    }

    #[test]
    fn test_selector_with_unknown_member() {
        let mut b = builder();
        match b.add_selector("group", &["NOPE".to_string()]) {
            Err(err) => assert!(matches!(err, ConfigError::ValidationError(_))),
            Ok(_) => panic!("expected add_selector to fail"),
        }
    }

    #[test]
    fn test_selector_from_members() {
        let mut b = builder();
        b.add_selector("group", &["DIRECT".to_string(), "REJECT".to_string()])
            .unwrap();
        let manager = b.build();
        let group = manager.get("group").unwrap();
        assert_eq!(group.kind(), super::super::traits::OutboundKind::Selector);
    }
}
