//! Tunnel dispatcher
//!
//! The long-lived component tying the crate together. Inbound
//! listeners push accepted TCP connections and UDP packets into two
//! bounded queues; a TCP consumer spawns one task per connection and a
//! small worker pool drains the UDP queue. Every flow runs the same
//! pipeline: metadata prehandling, optional protocol sniffing (TCP),
//! rule matching against the current snapshot, and an outbound dial.
//!
//! The rules / proxies / sub-rules / mode tuple is published as an
//! immutable [`TunnelSnapshot`] behind an atomic swap: flows load it
//! once at rule-match entry, reloads never tear down live flows, and
//! no flow observes a partial update.

mod nat;
mod statistic;
mod tcp;
mod udp;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{DispatchError, OutboundError};
use crate::io::BufferedStream;
use crate::metadata::{AddrType, DnsMode, Metadata, Network};
use crate::outbound::{BoxedStream, Outbound, OutboundKind, OutboundManager};
use crate::process;
use crate::resolver::Resolver;
use crate::rules::{Rule, RuleKind, MAX_SUB_RULE_DEPTH};
use crate::sniff::SnifferDispatcher;

pub use nat::NatTable;
pub use statistic::{TcpTracker, TrafficManager, TrafficSnapshot, UdpTracker};

/// Default per-flow outbound dial timeout
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default UDP session idle timeout
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);
/// Fan-in queue capacity, TCP and UDP alike
pub const QUEUE_CAPACITY: usize = 200;

/// Routing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Classify each flow against the rule list
    #[default]
    Rule,
    /// Route everything through the `GLOBAL` selector
    Global,
    /// Route everything through `DIRECT`
    Direct,
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule => write!(f, "rule"),
            Self::Global => write!(f, "global"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// An accepted TCP connection queued for dispatch
pub struct ConnContext {
    /// The inbound stream, fronted by the sniffer's replay buffer
    pub stream: BufferedStream<BoxedStream>,
    /// Flow metadata filled in by the listener
    pub metadata: Metadata,
}

impl ConnContext {
    /// Wrap a listener-produced stream
    #[must_use]
    pub fn new(stream: BoxedStream, metadata: Metadata) -> Self {
        Self {
            stream: BufferedStream::new(stream),
            metadata,
        }
    }
}

/// Reply path for inbound UDP packets
///
/// Implemented by the listener owning the client-facing socket. `from`
/// is the address the reply must appear to originate from (the flow's
/// original destination, or its fake address).
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Write a reply datagram back to the client
    async fn write_back(&self, data: &[u8], from: SocketAddr) -> io::Result<usize>;
}

/// An inbound UDP packet queued for dispatch
pub struct PacketAdapter {
    /// Datagram payload
    pub payload: Bytes,
    /// Client source address; its string form is the NAT key
    pub src_addr: SocketAddr,
    /// Reply path to the client
    pub sink: Arc<dyn PacketSink>,
    /// Flow metadata filled in by the listener
    pub metadata: Metadata,
}

/// Immutable routing state published atomically
pub struct TunnelSnapshot {
    /// Routing mode
    pub mode: TunnelMode,
    /// Ordered rule list
    pub rules: Arc<Vec<Rule>>,
    /// Named auxiliary rule lists for `SUB-RULE`
    pub sub_rules: Arc<HashMap<String, Vec<Rule>>>,
    /// Adapter name → outbound table
    pub proxies: Arc<HashMap<String, Arc<dyn Outbound>>>,
}

impl TunnelSnapshot {
    /// Adapter lookup
    #[must_use]
    pub fn proxy(&self, name: &str) -> Option<Arc<dyn Outbound>> {
        self.proxies.get(name).map(Arc::clone)
    }
}

/// Dispatcher tuning knobs
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Initial routing mode
    pub mode: TunnelMode,
    /// Whether protocol sniffing runs over TCP flows
    pub sniffing_enable: bool,
    /// Look up process identity for every flow, not just on rule demand
    pub always_find_process: bool,
    /// Outbound dial timeout
    pub dial_timeout: Duration,
    /// UDP session idle timeout
    pub udp_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            mode: TunnelMode::Rule,
            sniffing_enable: false,
            always_find_process: false,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
        }
    }
}

pub(crate) struct DispatcherInner {
    pub(crate) snapshot: ArcSwap<TunnelSnapshot>,
    pub(crate) resolver: Arc<Resolver>,
    pub(crate) nat: NatTable,
    pub(crate) sniffer: SnifferDispatcher,
    pub(crate) sniffing: AtomicBool,
    pub(crate) always_find_process: AtomicBool,
    pub(crate) traffic: Arc<TrafficManager>,
    pub(crate) dial_timeout: Duration,
    pub(crate) udp_timeout: Duration,
}

/// The tunnel dispatcher
///
/// Owns the fan-in queues, the NAT table, and the routing snapshot.
/// Collaborators hold a reference; there is no global state.
pub struct Dispatcher {
    tcp_tx: mpsc::Sender<ConnContext>,
    udp_tx: mpsc::Sender<PacketAdapter>,
    tcp_rx: Mutex<Option<mpsc::Receiver<ConnContext>>>,
    udp_rx: Mutex<Option<mpsc::Receiver<PacketAdapter>>>,
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher over the given tables
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        resolver: Arc<Resolver>,
        outbounds: OutboundManager,
        rules: Vec<Rule>,
        sub_rules: HashMap<String, Vec<Rule>>,
    ) -> Self {
        let (tcp_tx, tcp_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (udp_tx, udp_rx) = mpsc::channel(QUEUE_CAPACITY);

        let snapshot = TunnelSnapshot {
            mode: config.mode,
            rules: Arc::new(rules),
            sub_rules: Arc::new(sub_rules),
            proxies: Arc::new(outbounds.into_adapters()),
        };

        Self {
            tcp_tx,
            udp_tx,
            tcp_rx: Mutex::new(Some(tcp_rx)),
            udp_rx: Mutex::new(Some(udp_rx)),
            inner: Arc::new(DispatcherInner {
                snapshot: ArcSwap::from_pointee(snapshot),
                resolver,
                nat: NatTable::new(),
                sniffer: SnifferDispatcher::new(true),
                sniffing: AtomicBool::new(config.sniffing_enable),
                always_find_process: AtomicBool::new(config.always_find_process),
                traffic: Arc::new(TrafficManager::new()),
                dial_timeout: config.dial_timeout,
                udp_timeout: config.udp_timeout,
            }),
        }
    }

    /// Spawn the consumer tasks
    ///
    /// One TCP consumer dispatching each connection to its own task,
    /// and `max(4, cpu-count)` UDP workers draining the packet queue.
    /// Calling `start` twice is a no-op.
    pub fn start(&self) {
        let Some(mut tcp_rx) = self.tcp_rx.lock().take() else {
            warn!("dispatcher already started");
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(ctx) = tcp_rx.recv().await {
                tokio::spawn(tcp::handle_tcp(Arc::clone(&inner), ctx));
            }
        });

        let udp_rx = self
            .udp_rx
            .lock()
            .take()
            .expect("udp receiver present when tcp receiver was");
        let udp_rx = Arc::new(tokio::sync::Mutex::new(udp_rx));
        let workers = num_cpus::get().max(4);
        for _ in 0..workers {
            let inner = Arc::clone(&self.inner);
            let udp_rx = Arc::clone(&udp_rx);
            tokio::spawn(async move {
                loop {
                    let packet = { udp_rx.lock().await.recv().await };
                    match packet {
                        Some(packet) => udp::handle_udp(&inner, packet).await,
                        None => break,
                    }
                }
            });
        }
    }

    // === fan-in ===

    /// Queue a TCP connection, applying backpressure when full
    ///
    /// # Errors
    ///
    /// `QueueClosed` when the dispatcher has shut down.
    pub async fn push_tcp(&self, ctx: ConnContext) -> Result<(), DispatchError> {
        self.tcp_tx
            .send(ctx)
            .await
            .map_err(|_| DispatchError::QueueClosed)
    }

    /// Queue a UDP packet, dropping when the queue is full
    ///
    /// # Errors
    ///
    /// `QueueFull` on a full queue, `QueueClosed` after shutdown.
    pub fn push_udp(&self, packet: PacketAdapter) -> Result<(), DispatchError> {
        self.udp_tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::QueueClosed,
        })
    }

    /// Sender half of the TCP queue, for listeners
    #[must_use]
    pub fn tcp_sender(&self) -> mpsc::Sender<ConnContext> {
        self.tcp_tx.clone()
    }

    /// Sender half of the UDP queue, for listeners
    #[must_use]
    pub fn udp_sender(&self) -> mpsc::Sender<PacketAdapter> {
        self.udp_tx.clone()
    }

    // === hot reload ===

    /// Publish a new rule list and sub-rule table
    ///
    /// In-flight flows finish against the snapshot they already loaded.
    pub fn update_rules(&self, rules: Vec<Rule>, sub_rules: HashMap<String, Vec<Rule>>) {
        let rules = Arc::new(rules);
        let sub_rules = Arc::new(sub_rules);
        self.inner.snapshot.rcu(|current| TunnelSnapshot {
            mode: current.mode,
            rules: Arc::clone(&rules),
            sub_rules: Arc::clone(&sub_rules),
            proxies: Arc::clone(&current.proxies),
        });
    }

    /// Publish a new proxy table
    pub fn update_proxies(&self, proxies: HashMap<String, Arc<dyn Outbound>>) {
        let proxies = Arc::new(proxies);
        self.inner.snapshot.rcu(|current| TunnelSnapshot {
            mode: current.mode,
            rules: Arc::clone(&current.rules),
            sub_rules: Arc::clone(&current.sub_rules),
            proxies: Arc::clone(&proxies),
        });
    }

    /// Change the routing mode
    pub fn set_mode(&self, mode: TunnelMode) {
        self.inner.snapshot.rcu(|current| TunnelSnapshot {
            mode,
            rules: Arc::clone(&current.rules),
            sub_rules: Arc::clone(&current.sub_rules),
            proxies: Arc::clone(&current.proxies),
        });
    }

    /// Current routing mode
    #[must_use]
    pub fn mode(&self) -> TunnelMode {
        self.inner.snapshot.load().mode
    }

    /// Toggle protocol sniffing
    pub fn set_sniffing(&self, enable: bool) {
        if self.inner.sniffer.enable() {
            self.inner.sniffing.store(enable, Ordering::Relaxed);
        }
    }

    /// Whether sniffing is active
    #[must_use]
    pub fn is_sniffing(&self) -> bool {
        self.inner.sniffing.load(Ordering::Relaxed)
    }

    /// Toggle unconditional process lookup
    pub fn set_always_find_process(&self, enable: bool) {
        self.inner
            .always_find_process
            .store(enable, Ordering::Relaxed);
    }

    // === introspection ===

    /// Shared traffic totals
    #[must_use]
    pub fn traffic(&self) -> Arc<TrafficManager> {
        Arc::clone(&self.inner.traffic)
    }

    /// The resolver serving this dispatcher
    #[must_use]
    pub fn resolver(&self) -> Arc<Resolver> {
        Arc::clone(&self.inner.resolver)
    }

    /// Number of live UDP NAT entries
    #[must_use]
    pub fn nat_len(&self) -> usize {
        self.inner.nat.len()
    }

    /// Classify metadata the way a flow would be classified
    ///
    /// Runs mode selection and rule matching against the current
    /// snapshot without dialing; prehandle separately with
    /// [`prehandle`](Self::prehandle). Intended for diagnostics.
    ///
    /// # Errors
    ///
    /// `OutboundError::NotFound` when the matched adapter name (or the
    /// mode's standard adapter) is absent from the proxy table.
    pub async fn classify(
        &self,
        metadata: &mut Metadata,
    ) -> Result<(Arc<dyn Outbound>, Option<Rule>), OutboundError> {
        let snapshot = self.inner.snapshot.load_full();
        self.inner.resolve_flow(&snapshot, metadata).await
    }

    /// Prehandle metadata in place, as the flow handlers do
    ///
    /// # Errors
    ///
    /// `DispatchError::FakeIpMissing` when the destination lies in the
    /// fake range but has no reverse mapping.
    pub fn prehandle(&self, metadata: &mut Metadata) -> Result<(), DispatchError> {
        self.inner.prehandle(metadata)
    }
}

impl DispatcherInner {
    /// Normalize metadata before classification
    ///
    /// Literal hosts move into `dst_ip`; in mapping mode a bare
    /// destination address is reverse-looked-up in the fake pool, and
    /// in fake-IP mode the virtual address is dropped so the rules and
    /// the dial operate on the hostname.
    pub(crate) fn prehandle(&self, metadata: &mut Metadata) -> Result<(), DispatchError> {
        if let Ok(ip) = metadata.host.parse::<IpAddr>() {
            metadata.dst_ip = Some(ip);
            metadata.host.clear();
            metadata.addr_type = if ip.is_ipv4() {
                AddrType::Ipv4
            } else {
                AddrType::Ipv6
            };
        }

        let lookup_target = if self.resolver.mapping_enabled() && metadata.host.is_empty() {
            metadata.dst_ip
        } else {
            None
        };
        if let Some(dst_ip) = lookup_target {
            if let Some(host) = self.resolver.find_host_by_ip(dst_ip) {
                metadata.host = host;
                metadata.addr_type = AddrType::Domain;
                metadata.dns_mode = DnsMode::Mapping;
                if self.resolver.fake_ip_enabled() {
                    metadata.dst_ip = None;
                    metadata.dns_mode = DnsMode::FakeIp;
                } else if let Some(ip) = self.resolver.search_hosts(&metadata.host) {
                    // redir-host honors the hosts table over the
                    // original destination
                    metadata.dst_ip = Some(ip);
                }
            } else if self.resolver.is_fake_ip(dst_ip) {
                return Err(DispatchError::FakeIpMissing(dst_ip));
            }
        }

        Ok(())
    }

    /// Pick the outbound for a flow according to the snapshot's mode
    pub(crate) async fn resolve_flow(
        &self,
        snapshot: &TunnelSnapshot,
        metadata: &mut Metadata,
    ) -> Result<(Arc<dyn Outbound>, Option<Rule>), OutboundError> {
        match snapshot.mode {
            TunnelMode::Direct => snapshot
                .proxy(crate::outbound::Direct::NAME)
                .map(|p| (p, None))
                .ok_or_else(|| OutboundError::not_found(crate::outbound::Direct::NAME)),
            TunnelMode::Global => snapshot
                .proxy(crate::outbound::GLOBAL)
                .map(|p| (p, None))
                .ok_or_else(|| OutboundError::not_found(crate::outbound::GLOBAL)),
            TunnelMode::Rule => self.match_flow(snapshot, metadata).await,
        }
    }

    /// Iterate the rule list in declaration order
    async fn match_flow(
        &self,
        snapshot: &TunnelSnapshot,
        metadata: &mut Metadata,
    ) -> Result<(Arc<dyn Outbound>, Option<Rule>), OutboundError> {
        let mut resolved = false;
        let mut process_found = false;

        if !metadata.host.is_empty() {
            if let Some(ip) = self.resolver.search_hosts(&metadata.host) {
                metadata.dst_ip = Some(ip);
                resolved = true;
            }
        }

        if let Some(hit) = self
            .match_rule_list(
                snapshot,
                &snapshot.rules,
                metadata,
                &mut resolved,
                &mut process_found,
                0,
            )
            .await
        {
            return Ok((hit.0, Some(hit.1)));
        }

        // implicit catch-all
        snapshot
            .proxy(crate::outbound::Direct::NAME)
            .map(|p| (p, None))
            .ok_or_else(|| OutboundError::not_found(crate::outbound::Direct::NAME))
    }

    /// Walk one rule list; recursion serves `SUB-RULE` lists
    fn match_rule_list<'a>(
        &'a self,
        snapshot: &'a TunnelSnapshot,
        rules: &'a [Rule],
        metadata: &'a mut Metadata,
        resolved: &'a mut bool,
        process_found: &'a mut bool,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Option<(Arc<dyn Outbound>, Rule)>> + Send + 'a>> {
        Box::pin(async move {
            for rule in rules {
                if !*resolved
                    && rule.should_resolve_ip()
                    && !metadata.host.is_empty()
                    && metadata.dst_ip.is_none()
                {
                    match self.resolver.resolve_real_ip(&metadata.host).await {
                        Ok(ip) => {
                            debug!(host = %metadata.host, ip = %ip, "rule-forced resolution");
                            metadata.dst_ip = Some(ip);
                        }
                        // the flow continues host-only; a host-matched
                        // adapter will dial by hostname
                        Err(e) => debug!(host = %metadata.host, "resolve failed: {e}"),
                    }
                    *resolved = true;
                }

                if !*process_found
                    && (self.always_find_process.load(Ordering::Relaxed)
                        || rule.should_find_process())
                {
                    *process_found = true;
                    if let (Some(src_ip), Some(src_port)) =
                        (metadata.src_ip, metadata.src_port_num())
                    {
                        match process::find_process(metadata.network, src_ip, src_port) {
                            Ok(info) => {
                                metadata.uid = Some(info.uid);
                                metadata.process = info.name;
                                metadata.process_path = info.path;
                            }
                            Err(e) => {
                                debug!(flow = %metadata, "process lookup failed: {e}");
                            }
                        }
                    }
                }

                if let RuleKind::SubRule { cond, name } = rule.kind() {
                    if cond.matches(metadata) && depth < MAX_SUB_RULE_DEPTH {
                        if let Some(sub) = snapshot.sub_rules.get(name) {
                            if let Some(hit) = self
                                .match_rule_list(
                                    snapshot,
                                    sub,
                                    metadata,
                                    resolved,
                                    process_found,
                                    depth + 1,
                                )
                                .await
                            {
                                return Some(hit);
                            }
                        }
                    }
                    continue;
                }

                if !rule.matches(metadata) {
                    continue;
                }

                let Some(adapter) = snapshot.proxy(rule.adapter()) else {
                    continue;
                };

                let is_pass = adapter.kind() == OutboundKind::Pass
                    || adapter
                        .unwrap_inner(metadata)
                        .is_some_and(|inner| inner.kind() == OutboundKind::Pass);
                if is_pass {
                    debug!(adapter = adapter.name(), "matched pass adapter, continuing");
                    continue;
                }

                if metadata.network == Network::Udp && !adapter.supports_udp() {
                    debug!(adapter = adapter.name(), "udp not supported, continuing");
                    continue;
                }

                return Some((adapter, rule.clone()));
            }

            None
        })
    }
}
