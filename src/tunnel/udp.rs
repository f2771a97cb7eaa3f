//! UDP flow handler
//!
//! Packets are keyed by their inbound source address. The first packet
//! of a flow wins the NAT table's single-flight lock, performs the
//! outbound dial, installs the packet endpoint, and spawns the reverse
//! relay; packets racing the dial park on the lock and forward once the
//! endpoint appears. A broadcast is issued on every lock release,
//! success or failure, so waiters never deadlock — waiters woken after
//! a failed dial find no NAT entry and drop their payloads.
//!
//! The reverse relay writes remote replies back through the inbound
//! sink, rewriting the source to the flow's fake address when the
//! client originally addressed one, and evicts the NAT entry when the
//! session idles out.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::metadata::Metadata;
use crate::outbound::OutboundDatagram;
use crate::rules::Rule;
use crate::tunnel::PacketSink;

use super::statistic::UdpTracker;
use super::{DispatcherInner, PacketAdapter, TunnelMode};

pub(crate) async fn handle_udp(inner: &Arc<DispatcherInner>, packet: PacketAdapter) {
    let PacketAdapter {
        payload,
        src_addr,
        sink,
        mut metadata,
    } = packet;

    if !metadata.valid() {
        warn!(flow = ?metadata, "metadata not valid");
        return;
    }

    // remember the virtual destination before prehandling clears it
    let f_addr = metadata
        .dst_ip
        .filter(|ip| inner.resolver.is_exist_fake_ip(*ip));

    if let Err(e) = inner.prehandle(&mut metadata) {
        debug!("metadata prehandle error: {e}");
        return;
    }

    if !metadata.resolved() {
        match inner.resolver.resolve_real_ip(&metadata.host).await {
            Ok(ip) => metadata.dst_ip = Some(ip),
            Err(_) => return,
        }
    }

    let key = src_addr.to_string();

    if forward_to_existing(inner, &key, &payload, &metadata).await {
        return;
    }

    let (notify, loaded) = inner.nat.get_or_create_lock(&key);
    let inner = Arc::clone(inner);
    // the dial (or the wait for it) must not stall the worker loop
    tokio::spawn(async move {
        if loaded {
            let notified = notify.notified();
            tokio::pin!(notified);
            // register interest before the re-check so the winner's
            // broadcast cannot slip between them
            notified.as_mut().enable();
            if forward_to_existing(&inner, &key, &payload, &metadata).await {
                return;
            }
            // bounded by the dial timeout: a waiter that wakes late
            // re-reads the table and drops its payload on a miss
            let _ = timeout(inner.dial_timeout, notified).await;
            if !forward_to_existing(&inner, &key, &payload, &metadata).await {
                debug!(key = %key, "udp dial failed while waiting, dropping packet");
            }
            return;
        }

        run_winner(&inner, &key, payload, sink, &mut metadata, f_addr).await;
        inner.nat.release_lock(&key, &notify);
    });
}

/// Forward through an installed endpoint; `false` when none exists
async fn forward_to_existing(
    inner: &Arc<DispatcherInner>,
    key: &str,
    payload: &Bytes,
    metadata: &Metadata,
) -> bool {
    let Some(pc) = inner.nat.get(key) else {
        return false;
    };
    if let Some(addr) = metadata.dst_addr() {
        if let Err(e) = pc.send_to(payload, addr).await {
            debug!(key = %key, "udp forward error: {e}");
        }
    }
    true
}

/// Dial, install, relay: the winner side of the single-flight
async fn run_winner(
    inner: &Arc<DispatcherInner>,
    key: &str,
    payload: Bytes,
    sink: Arc<dyn PacketSink>,
    metadata: &mut Metadata,
    f_addr: Option<IpAddr>,
) {
    let snapshot = inner.snapshot.load_full();
    let (proxy, rule) = match inner.resolve_flow(&snapshot, metadata).await {
        Ok(picked) => picked,
        Err(e) => {
            warn!("[UDP] parse metadata failed: {e}");
            return;
        }
    };

    let raw = match timeout(inner.dial_timeout, proxy.listen_packet(metadata)).await {
        Ok(Ok(pc)) => pc,
        Ok(Err(e)) => {
            log_dial_failure(metadata, proxy.name(), rule.as_ref(), &e.to_string());
            return;
        }
        Err(_) => {
            log_dial_failure(
                metadata,
                proxy.name(),
                rule.as_ref(),
                &format!("dial timed out after {:?}", inner.dial_timeout),
            );
            return;
        }
    };

    let pc: Arc<dyn OutboundDatagram> =
        Arc::new(UdpTracker::new(raw, Arc::clone(&inner.traffic)));

    log_established(metadata, proxy.name(), rule.as_ref(), snapshot.mode);

    let o_addr = metadata.dst_ip;
    tokio::spawn(reverse_relay(
        Arc::clone(inner),
        Arc::clone(&pc),
        sink,
        key.to_string(),
        o_addr,
        f_addr,
    ));

    inner.nat.set(key, Arc::clone(&pc));

    if let Some(addr) = metadata.dst_addr() {
        if let Err(e) = pc.send_to(&payload, addr).await {
            debug!(key = %key, "udp forward error: {e}");
        }
    }
}

/// Pump remote replies back to the client until the session idles out
///
/// Replies from the flow's original destination are rewritten to carry
/// the fake source address the client addressed, so the client observes
/// the virtual address it sent to. Exit evicts the NAT entry and drops
/// the endpoint in one step.
async fn reverse_relay(
    inner: Arc<DispatcherInner>,
    pc: Arc<dyn OutboundDatagram>,
    sink: Arc<dyn PacketSink>,
    key: String,
    o_addr: Option<IpAddr>,
    f_addr: Option<IpAddr>,
) {
    let mut buf = vec![0u8; 65535];
    loop {
        let (n, from) = match timeout(inner.udp_timeout, pc.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                debug!(key = %key, "udp relay closed: {e}");
                break;
            }
            Err(_) => {
                debug!(key = %key, "udp session idle timeout");
                break;
            }
        };

        let mut from_addr = from;
        if let (Some(fake), Some(orig)) = (f_addr, o_addr) {
            if from.ip() == orig {
                from_addr = SocketAddr::new(fake, from.port());
            }
        }

        if let Err(e) = sink.write_back(&buf[..n], from_addr).await {
            debug!(key = %key, "udp write back error: {e}");
            break;
        }
    }

    inner.nat.delete(&key);
}

fn log_dial_failure(metadata: &Metadata, proxy: &str, rule: Option<&Rule>, reason: &str) {
    match rule {
        Some(rule) => warn!(
            "[UDP] dial {} (match {}) to {} error: {}",
            proxy,
            rule,
            metadata.remote_address(),
            reason
        ),
        None => warn!(
            "[UDP] dial {} to {} error: {}",
            proxy,
            metadata.remote_address(),
            reason
        ),
    }
}

fn log_established(metadata: &Metadata, proxy: &str, rule: Option<&Rule>, mode: TunnelMode) {
    match (rule, mode) {
        (Some(rule), _) => info!(
            "[UDP] {} --> {} match {} using {}",
            metadata.source_detail(),
            metadata.remote_address(),
            rule,
            proxy
        ),
        (None, TunnelMode::Global) => info!(
            "[UDP] {} --> {} using GLOBAL",
            metadata.source_detail(),
            metadata.remote_address()
        ),
        (None, TunnelMode::Direct) => info!(
            "[UDP] {} --> {} using DIRECT",
            metadata.source_detail(),
            metadata.remote_address()
        ),
        (None, TunnelMode::Rule) => info!(
            "[UDP] {} --> {} doesn't match any rule using DIRECT",
            metadata.source_detail(),
            metadata.remote_address()
        ),
    }
}
