//! Policy DNS resolver
//!
//! Host-to-address resolution with a fixed policy order: the static
//! hosts table first, then literal addresses, then the configured
//! upstream, then the system resolver under a timeout. IPv4 is
//! preferred; IPv6 can be globally disabled (the default), in which
//! case every IPv6 path short-circuits before any lookup.
//!
//! Enhanced mode ("fake IP") allocates a virtual IPv4 per queried
//! hostname so hostname-based routing works over protocols that only
//! carry destination IPs. The reverse side is exposed through
//! [`Resolver::find_host_by_ip`] and consumed by the dispatcher's
//! metadata prehandler.

pub mod fakeip;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::time::timeout;
use tracing::trace;

use crate::error::ResolveError;
use crate::hosts::DomainTrie;

pub use fakeip::FakeIpPool;

/// Default DNS request timeout
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// DNS enhancement applied by the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnhancedMode {
    /// Plain resolution
    #[default]
    Normal,
    /// Keep real addresses but maintain the reverse host mapping
    /// (redir-host)
    Mapping,
    /// Hand out virtual addresses from the fake-IP pool
    FakeIp,
}

/// Upstream DNS transport
///
/// Implementations resolve a single family; policy (hosts table,
/// literals, family preference, fake-IP) stays in [`Resolver`].
#[async_trait]
pub trait DnsClient: Send + Sync {
    /// Resolve all IPv4 addresses for `host`
    async fn resolve_v4(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;

    /// Resolve all IPv6 addresses for `host`
    async fn resolve_v6(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Policy resolver
pub struct Resolver {
    hosts: ArcSwap<DomainTrie<IpAddr>>,
    client: Option<Arc<dyn DnsClient>>,
    proxy_client: Option<Arc<dyn DnsClient>>,
    disable_ipv6: bool,
    enhanced: EnhancedMode,
    fake_pool: Option<FakeIpPool>,
    dns_timeout: Duration,
}

/// Builder for [`Resolver`]
pub struct ResolverBuilder {
    hosts: DomainTrie<IpAddr>,
    client: Option<Arc<dyn DnsClient>>,
    proxy_client: Option<Arc<dyn DnsClient>>,
    disable_ipv6: bool,
    enhanced: EnhancedMode,
    fake_pool: Option<FakeIpPool>,
    dns_timeout: Duration,
}

impl ResolverBuilder {
    /// Start from defaults: empty hosts, system resolver, IPv6 disabled
    #[must_use]
    pub fn new() -> Self {
        Self {
            hosts: DomainTrie::new(),
            client: None,
            proxy_client: None,
            disable_ipv6: true,
            enhanced: EnhancedMode::Normal,
            fake_pool: None,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
        }
    }

    /// Install the static hosts table
    #[must_use]
    pub fn hosts(mut self, hosts: DomainTrie<IpAddr>) -> Self {
        self.hosts = hosts;
        self
    }

    /// Install the default upstream client
    #[must_use]
    pub fn client(mut self, client: Arc<dyn DnsClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Install the dedicated proxy-server-host upstream
    #[must_use]
    pub fn proxy_server_client(mut self, client: Arc<dyn DnsClient>) -> Self {
        self.proxy_client = Some(client);
        self
    }

    /// Toggle global IPv6 resolution (disabled by default)
    #[must_use]
    pub const fn disable_ipv6(mut self, disable: bool) -> Self {
        self.disable_ipv6 = disable;
        self
    }

    /// Set the enhancement mode
    #[must_use]
    pub const fn enhanced_mode(mut self, mode: EnhancedMode) -> Self {
        self.enhanced = mode;
        self
    }

    /// Attach the fake-IP pool (required for `EnhancedMode::FakeIp`)
    #[must_use]
    pub fn fake_pool(mut self, pool: FakeIpPool) -> Self {
        self.fake_pool = Some(pool);
        self
    }

    /// Override the DNS timeout
    #[must_use]
    pub const fn dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    /// Build the resolver
    #[must_use]
    pub fn build(self) -> Resolver {
        Resolver {
            hosts: ArcSwap::from_pointee(self.hosts),
            client: self.client,
            proxy_client: self.proxy_client,
            disable_ipv6: self.disable_ipv6,
            enhanced: self.enhanced,
            fake_pool: self.fake_pool,
            dns_timeout: self.dns_timeout,
        }
    }
}

impl Default for ResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    /// Builder entry point
    #[must_use]
    pub fn builder() -> ResolverBuilder {
        ResolverBuilder::new()
    }

    // === hosts table ===

    /// Static hosts lookup
    #[must_use]
    pub fn search_hosts(&self, host: &str) -> Option<IpAddr> {
        self.hosts.load().search(host).copied()
    }

    /// Replace the hosts table (hot reload)
    pub fn update_hosts(&self, hosts: DomainTrie<IpAddr>) {
        self.hosts.store(Arc::new(hosts));
    }

    // === enhancement surface ===

    /// Whether reverse host mapping is maintained
    #[must_use]
    pub fn mapping_enabled(&self) -> bool {
        matches!(self.enhanced, EnhancedMode::Mapping | EnhancedMode::FakeIp)
            && self.fake_pool.is_some()
    }

    /// Whether virtual addresses are handed out
    #[must_use]
    pub fn fake_ip_enabled(&self) -> bool {
        self.enhanced == EnhancedMode::FakeIp && self.fake_pool.is_some()
    }

    /// Whether `ip` lies inside the fake range
    #[must_use]
    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        match (ip, &self.fake_pool) {
            (IpAddr::V4(v4), Some(pool)) => pool.contains(v4),
            _ => false,
        }
    }

    /// Whether `ip` is currently mapped to a host
    #[must_use]
    pub fn is_exist_fake_ip(&self, ip: IpAddr) -> bool {
        match (ip, &self.fake_pool) {
            (IpAddr::V4(v4), Some(pool)) => pool.exist(v4),
            _ => false,
        }
    }

    /// Reverse lookup in the fake-IP pool
    #[must_use]
    pub fn find_host_by_ip(&self, ip: IpAddr) -> Option<String> {
        match (ip, &self.fake_pool) {
            (IpAddr::V4(v4), Some(pool)) => pool.find_by_ip(v4),
            _ => None,
        }
    }

    /// Persist the fake-IP pool snapshot
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the snapshot write.
    pub fn store_fake_pool_state(&self) -> std::io::Result<()> {
        match &self.fake_pool {
            Some(pool) => pool.store(),
            None => Ok(()),
        }
    }

    // === resolution ===

    /// Resolve one address, preferring IPv4 and falling back to IPv6
    /// when it is not disabled. In fake-IP mode, hostnames that miss
    /// the hosts table receive a virtual address from the pool.
    ///
    /// # Errors
    ///
    /// Returns the IPv6 path's error when both families fail.
    pub async fn resolve_ip(&self, host: &str) -> Result<IpAddr, ResolveError> {
        if let Some(pool) = &self.fake_pool {
            if self.enhanced == EnhancedMode::FakeIp
                && !host.is_empty()
                && host.parse::<IpAddr>().is_err()
                && self.search_hosts(host).is_none()
            {
                return Ok(IpAddr::V4(pool.lookup(host)));
            }
        }
        self.resolve_real_ip(host).await
    }

    /// Resolve one real address, never consulting the fake-IP pool
    ///
    /// Used wherever an actual dial target is needed: the rule engine's
    /// forced resolution and outbound hostname dials.
    ///
    /// # Errors
    ///
    /// Returns the IPv6 path's error when both families fail.
    pub async fn resolve_real_ip(&self, host: &str) -> Result<IpAddr, ResolveError> {
        match self.resolve_ipv4(host).await {
            Ok(ip) => Ok(ip),
            Err(_) => self.resolve_ipv6(host).await,
        }
    }

    /// Resolve one IPv4 address, uniformly sampled from the candidates
    ///
    /// # Errors
    ///
    /// See [`resolve_all_ipv4`](Self::resolve_all_ipv4).
    pub async fn resolve_ipv4(&self, host: &str) -> Result<IpAddr, ResolveError> {
        let ips = self.resolve_all_ipv4(host).await?;
        Ok(*ips
            .choose(&mut rand::thread_rng())
            .ok_or(ResolveError::IpNotFound)?)
    }

    /// Resolve one IPv6 address, uniformly sampled from the candidates
    ///
    /// # Errors
    ///
    /// See [`resolve_all_ipv6`](Self::resolve_all_ipv6).
    pub async fn resolve_ipv6(&self, host: &str) -> Result<IpAddr, ResolveError> {
        let ips = self.resolve_all_ipv6(host).await?;
        Ok(*ips
            .choose(&mut rand::thread_rng())
            .ok_or(ResolveError::IpNotFound)?)
    }

    /// Resolve every IPv4 address for `host`
    ///
    /// # Errors
    ///
    /// `IpVersion` when `host` is a literal of the wrong family,
    /// `IpNotFound` when no address exists, or the upstream failure.
    pub async fn resolve_all_ipv4(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Some(ip) = self.search_hosts(host) {
            if ip.is_ipv4() {
                return Ok(vec![ip]);
            }
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return match ip {
                IpAddr::V4(_) => Ok(vec![ip]),
                IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                    Some(v4) => Ok(vec![IpAddr::V4(v4)]),
                    None => Err(ResolveError::IpVersion),
                },
            };
        }

        if let Some(client) = &self.client {
            let mut ips = client.resolve_v4(host).await?;
            ips.retain(IpAddr::is_ipv4);
            return shuffled_non_empty(ips);
        }

        let ips = self.system_lookup(host, |ip| ip.is_ipv4()).await?;
        shuffled_non_empty(ips)
    }

    /// Resolve every IPv6 address for `host`
    ///
    /// # Errors
    ///
    /// `Ipv6Disabled` immediately when IPv6 is globally off, otherwise
    /// as [`resolve_all_ipv4`](Self::resolve_all_ipv4).
    pub async fn resolve_all_ipv6(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if self.disable_ipv6 {
            return Err(ResolveError::Ipv6Disabled);
        }

        if let Some(ip) = self.search_hosts(host) {
            if ip.is_ipv6() {
                return Ok(vec![ip]);
            }
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return if ip.is_ipv6() {
                Ok(vec![ip])
            } else {
                Err(ResolveError::IpVersion)
            };
        }

        if let Some(client) = &self.client {
            let mut ips = client.resolve_v6(host).await?;
            ips.retain(IpAddr::is_ipv6);
            return shuffled_non_empty(ips);
        }

        let ips = self.system_lookup(host, |ip| ip.is_ipv6()).await?;
        shuffled_non_empty(ips)
    }

    /// Resolve every address for `host` under the family policy
    ///
    /// # Errors
    ///
    /// As the family-specific variants.
    pub async fn resolve_all(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Some(ip) = self.search_hosts(host) {
            return Ok(vec![ip]);
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        if self.disable_ipv6 {
            return self.resolve_all_ipv4(host).await;
        }

        if let Some(client) = &self.client {
            let mut ips = client.resolve_v4(host).await.unwrap_or_default();
            if let Ok(v6) = client.resolve_v6(host).await {
                ips.extend(v6);
            }
            return shuffled_non_empty(ips);
        }

        let ips = self.system_lookup(host, |_| true).await?;
        shuffled_non_empty(ips)
    }

    // === proxy-server-host family ===
    //
    // Outbound proxy endpoints resolve through the dedicated upstream
    // when one is configured, falling back to the default path on miss.

    /// Resolve one address for an outbound proxy endpoint
    ///
    /// # Errors
    ///
    /// As [`resolve_real_ip`](Self::resolve_real_ip).
    pub async fn resolve_proxy_server(&self, host: &str) -> Result<IpAddr, ResolveError> {
        if let Some(client) = &self.proxy_client {
            if let Ok(ip) = self.resolve_with_client(client, host).await {
                return Ok(ip);
            }
        }
        self.resolve_real_ip(host).await
    }

    /// Resolve one IPv4 address for an outbound proxy endpoint
    ///
    /// # Errors
    ///
    /// As [`resolve_ipv4`](Self::resolve_ipv4).
    pub async fn resolve_ipv4_proxy_server(&self, host: &str) -> Result<IpAddr, ResolveError> {
        if let Some(client) = &self.proxy_client {
            if host.parse::<IpAddr>().is_err() && self.search_hosts(host).is_none() {
                if let Ok(mut ips) = client.resolve_v4(host).await {
                    ips.retain(IpAddr::is_ipv4);
                    if let Some(ip) = ips.choose(&mut rand::thread_rng()) {
                        return Ok(*ip);
                    }
                }
            }
        }
        self.resolve_ipv4(host).await
    }

    /// Resolve one IPv6 address for an outbound proxy endpoint
    ///
    /// # Errors
    ///
    /// As [`resolve_ipv6`](Self::resolve_ipv6).
    pub async fn resolve_ipv6_proxy_server(&self, host: &str) -> Result<IpAddr, ResolveError> {
        if self.disable_ipv6 {
            return Err(ResolveError::Ipv6Disabled);
        }
        if let Some(client) = &self.proxy_client {
            if host.parse::<IpAddr>().is_err() && self.search_hosts(host).is_none() {
                if let Ok(mut ips) = client.resolve_v6(host).await {
                    ips.retain(IpAddr::is_ipv6);
                    if let Some(ip) = ips.choose(&mut rand::thread_rng()) {
                        return Ok(*ip);
                    }
                }
            }
        }
        self.resolve_ipv6(host).await
    }

    /// Resolve every address for an outbound proxy endpoint
    ///
    /// # Errors
    ///
    /// As [`resolve_all`](Self::resolve_all).
    pub async fn resolve_all_proxy_server(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Some(client) = &self.proxy_client {
            if host.parse::<IpAddr>().is_err() && self.search_hosts(host).is_none() {
                let mut ips = client.resolve_v4(host).await.unwrap_or_default();
                if !self.disable_ipv6 {
                    if let Ok(v6) = client.resolve_v6(host).await {
                        ips.extend(v6);
                    }
                }
                if !ips.is_empty() {
                    return shuffled_non_empty(ips);
                }
            }
        }
        self.resolve_all(host).await
    }

    async fn resolve_with_client(
        &self,
        client: &Arc<dyn DnsClient>,
        host: &str,
    ) -> Result<IpAddr, ResolveError> {
        if host.parse::<IpAddr>().is_ok() || self.search_hosts(host).is_some() {
            return Err(ResolveError::IpNotFound);
        }
        let mut ips = client.resolve_v4(host).await?;
        if !self.disable_ipv6 {
            if let Ok(v6) = client.resolve_v6(host).await {
                ips.extend(v6);
            }
        }
        ips.choose(&mut rand::thread_rng())
            .copied()
            .ok_or(ResolveError::IpNotFound)
    }

    /// System resolver lookup under the DNS timeout
    async fn system_lookup(
        &self,
        host: &str,
        family: impl Fn(&IpAddr) -> bool,
    ) -> Result<Vec<IpAddr>, ResolveError> {
        trace!(host, "system resolver lookup");
        let lookup = tokio::net::lookup_host((host, 0));
        let addrs = timeout(self.dns_timeout, lookup)
            .await
            .map_err(|_| ResolveError::Timeout {
                host: host.to_string(),
            })??;
        Ok(addrs.map(|a| a.ip()).filter(|ip| family(ip)).collect())
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("hosts", &self.hosts.load().len())
            .field("disable_ipv6", &self.disable_ipv6)
            .field("enhanced", &self.enhanced)
            .field("fake_pool", &self.fake_pool)
            .finish_non_exhaustive()
    }
}

fn shuffled_non_empty(mut ips: Vec<IpAddr>) -> Result<Vec<IpAddr>, ResolveError> {
    if ips.is_empty() {
        return Err(ResolveError::IpNotFound);
    }
    ips.shuffle(&mut rand::thread_rng());
    Ok(ips)
}
