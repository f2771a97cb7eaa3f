//! TCP flow handler
//!
//! One task per accepted connection: prehandle, sniff (when enabled),
//! rule-match, dial the outbound under the flow timeout, then splice
//! both directions until either side closes. Dial failures drop the
//! flow; retries belong to the outbound layer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::io::relay;
use crate::metadata::Metadata;
use crate::rules::Rule;

use super::statistic::TcpTracker;
use super::{ConnContext, DispatcherInner, TunnelMode};

pub(crate) async fn handle_tcp(inner: Arc<DispatcherInner>, mut ctx: ConnContext) {
    if !ctx.metadata.valid() {
        warn!(flow = ?ctx.metadata, "metadata not valid");
        return;
    }

    if let Err(e) = inner.prehandle(&mut ctx.metadata) {
        debug!("metadata prehandle error: {e}");
        return;
    }

    if inner.sniffer.enable() && inner.sniffing.load(Ordering::Relaxed) {
        inner
            .sniffer
            .tcp_sniff(&mut ctx.stream, &mut ctx.metadata)
            .await;
    }

    let snapshot = inner.snapshot.load_full();
    let (proxy, rule) = match inner.resolve_flow(&snapshot, &mut ctx.metadata).await {
        Ok(picked) => picked,
        Err(e) => {
            warn!(flow = %ctx.metadata, "metadata parse failed: {e}");
            return;
        }
    };

    let remote = match timeout(inner.dial_timeout, proxy.dial_tcp(&ctx.metadata)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            log_dial_failure(&ctx.metadata, proxy.name(), rule.as_ref(), &e.to_string());
            return;
        }
        Err(_) => {
            log_dial_failure(
                &ctx.metadata,
                proxy.name(),
                rule.as_ref(),
                &format!("dial timed out after {:?}", inner.dial_timeout),
            );
            return;
        }
    };

    log_established(&ctx.metadata, proxy.name(), rule.as_ref(), snapshot.mode);

    let mut remote = TcpTracker::new(remote, Arc::clone(&inner.traffic));
    match relay(&mut ctx.stream, &mut remote).await {
        Ok(result) => debug!(
            flow = %ctx.metadata,
            up = result.client_to_remote,
            down = result.remote_to_client,
            "connection closed"
        ),
        Err(e) => debug!(flow = %ctx.metadata, "connection closed: {e}"),
    }
}

fn log_dial_failure(metadata: &Metadata, proxy: &str, rule: Option<&Rule>, reason: &str) {
    match rule {
        Some(rule) => warn!(
            "[TCP] dial {} (match {}) to {} error: {}",
            proxy,
            rule,
            metadata.remote_address(),
            reason
        ),
        None => warn!(
            "[TCP] dial {} to {} error: {}",
            proxy,
            metadata.remote_address(),
            reason
        ),
    }
}

fn log_established(metadata: &Metadata, proxy: &str, rule: Option<&Rule>, mode: TunnelMode) {
    match (rule, mode) {
        (Some(rule), _) => info!(
            "[TCP] {} --> {} match {} using {}",
            metadata.source_detail(),
            metadata.remote_address(),
            rule,
            proxy
        ),
        (None, TunnelMode::Global) => info!(
            "[TCP] {} --> {} using GLOBAL",
            metadata.source_detail(),
            metadata.remote_address()
        ),
        (None, TunnelMode::Direct) => info!(
            "[TCP] {} --> {} using DIRECT",
            metadata.source_detail(),
            metadata.remote_address()
        ),
        (None, TunnelMode::Rule) => info!(
            "[TCP] {} --> {} doesn't match any rule using DIRECT",
            metadata.source_detail(),
            metadata.remote_address()
        ),
    }
}
