//! Active host scan.

use crate::discovery::NetworkTopology;
use crate::error::Result;
use crate::runner::CommandRunner;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Addresses seen answering on the subnet during allocation. Never persisted.
pub type ActiveHostSet = BTreeSet<Ipv4Addr>;

/// Ping-scans the subnet with `nmap`, excluding the host's own address so it
/// stays eligible for reuse as the static address.
///
/// # Errors
///
/// Returns [`EngineError::Command`](crate::EngineError::Command) if `nmap`
/// cannot be run or fails.
pub fn scan_active_hosts<R: CommandRunner>(
    runner: &R,
    topology: &NetworkTopology,
    host_timeout: Duration,
) -> Result<ActiveHostSet> {
    let subnet = topology.subnet.to_string();
    let exclude = topology.original_ip.to_string();
    let timeout = format!("{}ms", host_timeout.as_millis());
    let out = runner.output(
        "nmap",
        &[
            "-sn",
            "-n",
            subnet.as_str(),
            "--exclude",
            exclude.as_str(),
            "--host-timeout",
            timeout.as_str(),
        ],
    )?;
    let hosts = parse_scan_report(&out);
    tracing::info!(subnet = %subnet, active = hosts.len(), "Scanned subnet for active hosts");
    Ok(hosts)
}

/// Extracts addresses from `Nmap scan report for <addr>` lines. A reverse
/// name, if present, puts the address in parentheses.
fn parse_scan_report(output: &str) -> ActiveHostSet {
    output
        .lines()
        .filter_map(|l| l.trim().strip_prefix("Nmap scan report for "))
        .filter_map(|rest| rest.split_whitespace().last())
        .filter_map(|addr| addr.trim_matches(|c| c == '(' || c == ')').parse().ok())
        .collect()
}
