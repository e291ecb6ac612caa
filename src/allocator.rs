//! Static address allocation.

use crate::discovery::NetworkTopology;
use crate::error::{EngineError, Result};
use crate::scan::ActiveHostSet;
use std::net::Ipv4Addr;

/// Picks the lowest host address that is neither the router nor active.
///
/// Network and broadcast addresses are skipped for prefixes up to /30; /31
/// and /32 use every address in the block.
///
/// Pass `None` when the active-host scan failed: allocation then proceeds in
/// best-effort mode with only the router reserved, and a warning is logged.
///
/// # Errors
///
/// Returns [`EngineError::AllocationExhausted`] if every candidate is taken.
pub fn allocate(topology: &NetworkTopology, active: Option<&ActiveHostSet>) -> Result<Ipv4Addr> {
    let subnet = topology.subnet;
    if active.is_none() {
        tracing::warn!(
            subnet = %subnet,
            "Active hosts unknown, only the router is reserved; address conflicts are possible"
        );
    }

    let network = u32::from(subnet.network());
    let broadcast = u32::from(subnet.broadcast());
    let (first, last) = if subnet.prefix() >= 31 {
        (network, broadcast)
    } else {
        (network + 1, broadcast - 1)
    };

    let chosen = (first..=last).map(Ipv4Addr::from).find(|candidate| {
        *candidate != topology.router && active.is_none_or(|hosts| !hosts.contains(candidate))
    });

    match chosen {
        Some(address) => {
            tracing::info!(address = %address, subnet = %subnet, "Selected static address");
            Ok(address)
        }
        None => Err(EngineError::AllocationExhausted { subnet }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(subnet: &str, router: [u8; 4]) -> NetworkTopology {
        NetworkTopology {
            router: router.into(),
            subnet: subnet.parse().unwrap(),
            original_ip: Ipv4Addr::new(192, 0, 2, 5),
            original_resolver: router.into(),
            interface: "eth0".into(),
        }
    }

    fn hosts(list: &[[u8; 4]]) -> ActiveHostSet {
        list.iter().copied().map(Ipv4Addr::from).collect()
    }

    #[test]
    fn first_free_address_in_ascending_order() {
        let t = topology("192.0.2.0/29", [192, 0, 2, 1]);
        let active = hosts(&[[192, 0, 2, 1], [192, 0, 2, 3]]);
        assert_eq!(allocate(&t, Some(&active)).unwrap(), Ipv4Addr::new(192, 0, 2, 2));
    }

    #[test]
    fn router_is_reserved_even_if_scan_missed_it() {
        let t = topology("192.0.2.0/29", [192, 0, 2, 1]);
        let active = hosts(&[[192, 0, 2, 2]]);
        assert_eq!(allocate(&t, Some(&active)).unwrap(), Ipv4Addr::new(192, 0, 2, 3));
    }

    #[test]
    fn exhausted_subnet() {
        let t = topology("192.0.2.0/30", [192, 0, 2, 1]);
        let active = hosts(&[[192, 0, 2, 1], [192, 0, 2, 2]]);
        assert!(matches!(
            allocate(&t, Some(&active)),
            Err(EngineError::AllocationExhausted { .. })
        ));
    }

    #[test]
    fn broadcast_is_never_chosen() {
        let t = topology("192.0.2.0/29", [192, 0, 2, 1]);
        let active = hosts(&[[192, 0, 2, 2], [192, 0, 2, 3], [192, 0, 2, 4], [192, 0, 2, 5]]);
        assert_eq!(allocate(&t, Some(&active)).unwrap(), Ipv4Addr::new(192, 0, 2, 6));

        let active = hosts(&[
            [192, 0, 2, 2],
            [192, 0, 2, 3],
            [192, 0, 2, 4],
            [192, 0, 2, 5],
            [192, 0, 2, 6],
        ]);
        assert!(allocate(&t, Some(&active)).is_err());
    }

    #[test]
    fn best_effort_reserves_only_router() {
        let t = topology("192.0.2.0/29", [192, 0, 2, 1]);
        assert_eq!(allocate(&t, None).unwrap(), Ipv4Addr::new(192, 0, 2, 2));
    }
}
