//! nlmirrord - follow the rtnetlink state of every network namespace.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nlmirror::namespace::{Namespace, NamespaceRow};
use nlmirror::{
    Dataplane, DataplaneId, Interface, NamespaceWatcher, Registry, RegistryConfig, SocketConfig,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "nlmirrord", version, about = "Mirror netlink state across network namespaces")]
struct Cli {
    /// Directory holding named network namespaces.
    #[arg(long, default_value = "/var/run/netns")]
    netns_dir: PathBuf,

    /// Receive buffer of each events socket, in bytes (0 = kernel default).
    #[arg(long, default_value_t = 0)]
    rcvbuf: usize,

    /// Send buffer of each netlink socket, in bytes (0 = kernel default).
    #[arg(long, default_value_t = 0)]
    sndbuf: usize,

    /// Depth of each socket's message queues (0 = 1024).
    #[arg(long, default_value_t = 0)]
    queue_depth: usize,

    /// Send buffer of each raw packet socket, in bytes.
    #[arg(long, default_value_t = 1 << 20)]
    packet_sndbuf: usize,

    /// How long to retry entering a namespace that is not mounted yet.
    #[arg(long, default_value_t = 10)]
    switch_window_ms: u64,

    /// Claim an interface name for the dataplane (NAME=ID, repeatable).
    #[arg(long = "bind", value_parser = parse_binding)]
    bindings: Vec<(String, u32)>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    json: bool,

    /// Pretty print JSON.
    #[arg(short = 'p', long)]
    pretty: bool,

    /// Exit after printing the initial table.
    #[arg(long)]
    once: bool,
}

fn parse_binding(s: &str) -> Result<(String, u32), String> {
    let (name, id) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=ID, got '{}'", s))?;
    if name.is_empty() {
        return Err("empty interface name".to_string());
    }
    let id = id
        .parse()
        .map_err(|e| format!("invalid dataplane id '{}': {}", id, e))?;
    Ok((name.to_string(), id))
}

impl Cli {
    fn registry_config(&self) -> RegistryConfig {
        let events = SocketConfig::default()
            .with_rx_bytes(self.rcvbuf)
            .with_tx_bytes(self.sndbuf)
            .with_rx_messages(self.queue_depth)
            .with_tx_messages(self.queue_depth);
        let requests = SocketConfig::request()
            .with_tx_bytes(self.sndbuf)
            .with_rx_messages(self.queue_depth)
            .with_tx_messages(self.queue_depth);

        RegistryConfig::default()
            .with_netns_dir(&self.netns_dir)
            .with_events(events)
            .with_requests(requests)
            .with_packet_sndbuf(self.packet_sndbuf)
            .with_switch_window(Duration::from_millis(self.switch_window_ms))
    }
}

/// Logs every change it is told about.
struct LogDataplane;

impl Dataplane for LogDataplane {
    fn namespace_added(&self, ns: &Namespace) {
        info!(namespace = %ns.name(), index = ns.index(), nsid = ?ns.nsid(), "namespace up");
    }

    fn namespace_deleted(&self, ns: &Namespace) {
        info!(namespace = %ns.name(), index = ns.index(), "namespace down");
    }

    fn interface_added(&self, ns: &Namespace, intf: &Interface) {
        info!(namespace = %ns.name(), ifindex = intf.index, name = %intf.name, "interface up");
    }

    fn interface_renamed(&self, ns: &Namespace, intf: &Interface, old: &str) {
        info!(namespace = %ns.name(), ifindex = intf.index, old, name = %intf.name, "interface renamed");
    }

    fn interface_deleted(&self, ns: &Namespace, intf: &Interface) {
        info!(namespace = %ns.name(), ifindex = intf.index, name = %intf.name, "interface down");
    }

    fn interface_moved(&self, intf: &Interface, from: &str, to: &Namespace) {
        info!(name = %intf.name, from, to = %to.name(), "interface moved");
    }

    fn initial_sync_complete(&self) {
        info!("initial sync complete");
    }
}

fn print_table(rows: &[NamespaceRow]) {
    let width_if = rows
        .iter()
        .map(|r| r.interface.len())
        .max()
        .unwrap_or(0)
        .max("Interface".len());
    let width_ns = rows
        .iter()
        .map(|r| r.namespace.len())
        .max()
        .unwrap_or(0)
        .max("Namespace".len());

    println!("{:<width_if$}  {:<width_ns$}  NSID", "Interface", "Namespace");
    for row in rows {
        let nsid = row.nsid.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{:<width_if$}  {:<width_ns$}  {}", row.interface, row.namespace, nsid);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let registry = Registry::new(cli.registry_config(), Arc::new(LogDataplane));
    for (name, id) in &cli.bindings {
        registry.bind_interface(name, DataplaneId(*id));
    }

    registry.start().await?;
    let watcher = NamespaceWatcher::new(registry.clone());
    watcher.scan().await?;
    registry.initial_sync().await?;

    let rows = registry.snapshot();
    if cli.json {
        let out = if cli.pretty {
            serde_json::to_string_pretty(&rows)?
        } else {
            serde_json::to_string(&rows)?
        };
        println!("{}", out);
    } else {
        print_table(&rows);
    }

    if cli.once {
        registry.shutdown();
        return Ok(());
    }

    let result = tokio::select! {
        r = watcher.run() => r.map_err(anyhow::Error::from),
        r = tokio::signal::ctrl_c() => r.map_err(anyhow::Error::from),
    };
    registry.shutdown();
    result
}
