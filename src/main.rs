//! rust-tunnel daemon
//!
//! Loads the configuration, assembles the resolver, outbound table and
//! dispatcher, then runs until interrupted. Inbound listeners attach
//! through the dispatcher's queue senders.
//!
//! # Usage
//!
//! ```bash
//! rust-tunnel -c /etc/rust-tunnel/config.json
//!
//! # Environment overrides
//! RUST_TUNNEL_MODE=global rust-tunnel -c config.json
//!
//! # Log filtering
//! RUST_TUNNEL_LOG=rust_tunnel=debug rust-tunnel -c config.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_tunnel::config::{default_config_json, load_config_with_env};
use rust_tunnel::outbound::OutboundManagerBuilder;
use rust_tunnel::resolver::{FakeIpPool, Resolver};
use rust_tunnel::tunnel::{Dispatcher, DispatcherConfig};
use rust_tunnel::EnhancedModeConfig;

struct Args {
    config_path: PathBuf,
    generate_config: bool,
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/rust-tunnel/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => generate_config = true,
                "--check" => check_config = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("rust-tunnel v{}", rust_tunnel::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        "rust-tunnel v{}

USAGE:
    rust-tunnel [OPTIONS]

OPTIONS:
    -c, --config <PATH>      Configuration file [default: /etc/rust-tunnel/config.json]
    -g, --generate-config    Print a default configuration and exit
        --check              Validate the configuration and exit
    -h, --help               Print help
    -v, --version            Print version",
        rust_tunnel::VERSION
    );
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RUST_TUNNEL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("rust_tunnel=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        println!("{}", default_config_json());
        return Ok(());
    }

    init_tracing();

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;

    if args.check_config {
        println!("configuration ok: {}", args.config_path.display());
        return Ok(());
    }

    // resolver: hosts table, IPv6 policy, optional fake-IP pool
    let mut resolver_builder = Resolver::builder()
        .hosts(config.build_hosts())
        .disable_ipv6(config.dns.disable_ipv6)
        .enhanced_mode(config.dns.enhanced_mode.into())
        .dns_timeout(Duration::from_secs(config.dns.dns_timeout_secs));
    if config.dns.enhanced_mode != EnhancedModeConfig::Normal {
        let pool = FakeIpPool::new(
            config.fake_ip_range().context("fake-ip range")?,
            config.dns.fake_ip_pool_size,
            config.dns.fake_ip_store_path.clone(),
        );
        resolver_builder = resolver_builder.fake_pool(pool);
    }
    let resolver = Arc::new(resolver_builder.build());

    // outbound table: standard adapters plus configured selectors
    let mut outbounds = OutboundManagerBuilder::new(Arc::clone(&resolver));
    for group in &config.proxy_groups {
        outbounds
            .add_selector(&group.name, &group.members)
            .with_context(|| format!("proxy group '{}'", group.name))?;
    }
    let outbounds = outbounds.build();

    let geo = config.build_geo_data().context("geo tables")?;
    let (rules, sub_rules) = config.parse_rules(&geo).context("rules")?;
    info!(
        mode = %config.mode,
        rules = rules.len(),
        outbounds = outbounds.len(),
        "starting rust-tunnel v{}",
        rust_tunnel::VERSION
    );

    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            mode: config.mode,
            sniffing_enable: config.sniffing_enable,
            always_find_process: config.always_find_process,
            udp_timeout: Duration::from_secs(config.udp_timeout_secs),
            ..DispatcherConfig::default()
        },
        Arc::clone(&resolver),
        outbounds,
        rules,
        sub_rules,
    );
    dispatcher.start();

    signal::ctrl_c().await.context("waiting for shutdown")?;
    info!("shutting down");

    if let Err(e) = resolver.store_fake_pool_state() {
        warn!("failed to persist fake-ip pool: {e}");
    }

    let traffic = dispatcher.traffic().snapshot();
    info!(
        up = traffic.upload_total,
        down = traffic.download_total,
        "bye"
    );
    Ok(())
}
