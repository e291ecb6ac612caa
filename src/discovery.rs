//! Network discovery.
//!
//! Reads the routing table and the host's resolver list into a
//! [`NetworkTopology`]. Read-only; nothing here mutates the host.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::runner::CommandRunner;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::path::Path;

/// Snapshot of the host's current network position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTopology {
    /// Default gateway.
    pub router: Ipv4Addr,
    /// Directly connected subnet of the default interface.
    pub subnet: Ipv4Network,
    /// Address currently leased to the host.
    pub original_ip: Ipv4Addr,
    /// First nameserver the host used before reconfiguration.
    pub original_resolver: Ipv4Addr,
    /// Interface carrying the default route.
    pub interface: String,
}

/// Reads routing and resolver state.
///
/// # Errors
///
/// Returns [`EngineError::Discovery`] if `ip route` fails, has no default
/// route, or its output cannot be parsed, or if no nameserver is listed.
pub fn discover<R: CommandRunner>(runner: &R, config: &EngineConfig) -> Result<NetworkTopology> {
    let routes = runner
        .output("ip", &["-4", "route"])
        .map_err(|e| EngineError::Discovery(e.to_string()))?;
    let route = parse_routes(&routes, &config.default_interface)?;
    let original_resolver = read_first_nameserver(&config.resolv_conf)?;

    let topology = NetworkTopology {
        router: route.router,
        subnet: route.subnet,
        original_ip: route.source,
        original_resolver,
        interface: route.interface,
    };
    tracing::info!(
        router = %topology.router,
        subnet = %topology.subnet,
        address = %topology.original_ip,
        resolver = %topology.original_resolver,
        interface = %topology.interface,
        "Discovered network topology"
    );
    Ok(topology)
}

/// Looks up the router's PTR names through the original resolver.
///
/// Best effort: any failure is logged and yields an empty list. Trailing dots
/// are stripped.
pub fn lookup_router_names<R: CommandRunner>(
    runner: &R,
    router: Ipv4Addr,
    resolver: Ipv4Addr,
) -> Vec<String> {
    let server = format!("@{resolver}");
    let router = router.to_string();
    match runner.output("dig", &[server.as_str(), "+short", "-x", router.as_str()]) {
        Ok(out) => out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with(';'))
            .map(|l| l.trim_end_matches('.').to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Err(e) => {
            tracing::warn!(
                router = %router,
                error = %e,
                "Could not resolve router name, router will not be reachable by name"
            );
            Vec::new()
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct DefaultRoute {
    router: Ipv4Addr,
    subnet: Ipv4Network,
    source: Ipv4Addr,
    interface: String,
}

/// Parses `ip -4 route` output.
///
/// ```text
/// default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.23 metric 202
/// 192.168.1.0/24 dev eth0 proto dhcp scope link src 192.168.1.23 metric 202
/// ```
fn parse_routes(output: &str, fallback_interface: &str) -> Result<DefaultRoute> {
    let default = output
        .lines()
        .find(|l| l.split_whitespace().next() == Some("default"))
        .ok_or_else(|| EngineError::Discovery("no default route".to_string()))?;

    let router = field(default, "via")
        .ok_or_else(|| EngineError::Discovery(format!("default route has no gateway: {default}")))?;
    let router: Ipv4Addr = parse_addr(router)?;
    let interface = field(default, "dev").unwrap_or(fallback_interface).to_string();

    let link = output
        .lines()
        .filter(|l| field(l, "dev") == Some(interface.as_str()))
        .filter_map(|l| {
            let net: Ipv4Network = l.split_whitespace().next()?.parse().ok()?;
            net.contains(router).then_some((net, l))
        })
        .next();
    let (subnet, link_line) = link.ok_or_else(|| {
        EngineError::Discovery(format!("no subnet route for {interface} containing {router}"))
    })?;

    let source = field(default, "src")
        .or_else(|| field(link_line, "src"))
        .ok_or_else(|| EngineError::Discovery(format!("no source address on {interface}")))?;

    Ok(DefaultRoute {
        router,
        subnet: Ipv4Network::new(subnet.network(), subnet.prefix())
            .map_err(|e| EngineError::Discovery(e.to_string()))?,
        source: parse_addr(source)?,
        interface,
    })
}

/// Value following `key` in a whitespace separated route line.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut words = line.split_whitespace();
    words.by_ref().find(|w| *w == key)?;
    words.next()
}

fn parse_addr(s: &str) -> Result<Ipv4Addr> {
    s.parse()
        .map_err(|_| EngineError::Discovery(format!("not an IPv4 address: {s}")))
}

fn read_first_nameserver(path: &Path) -> Result<Ipv4Addr> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Discovery(format!("{}: {e}", path.display())))?;
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.strip_prefix("nameserver"))
        .find_map(|rest| rest.trim().parse().ok())
        .ok_or_else(|| {
            EngineError::Discovery(format!("no IPv4 nameserver in {}", path.display()))
        })
}
