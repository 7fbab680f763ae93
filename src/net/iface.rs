//! Local network topology: interface enumeration, subnet matching, and
//! the subnet-preference ordering used when picking a broker address.

use crate::errors::{EtError, Result};
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// One usable (UP, non-loopback, IPv4) interface.
#[derive(Debug, Clone)]
pub struct LocalInterface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Option<Ipv4Addr>,
}

/// Enumerate usable interfaces. An empty result just degrades discovery
/// to the default route; it is not an error.
pub fn usable_interfaces() -> Vec<LocalInterface> {
    let Ok(all) = get_if_addrs::get_if_addrs() else {
        return Vec::new();
    };
    all.into_iter()
        .filter(|ifc| !ifc.is_loopback())
        .filter_map(|ifc| match ifc.addr {
            get_if_addrs::IfAddr::V4(v4) => Some(LocalInterface {
                name: ifc.name,
                addr: v4.ip,
                netmask: v4.netmask,
                broadcast: v4.broadcast,
            }),
            get_if_addrs::IfAddr::V6(_) => None,
        })
        .collect()
}

pub fn local_addrs() -> Vec<Ipv4Addr> {
    usable_interfaces().iter().map(|i| i.addr).collect()
}

/// All distinct broadcast addresses of the usable interfaces.
pub fn broadcast_addrs() -> Vec<Ipv4Addr> {
    let mut out: Vec<Ipv4Addr> = Vec::new();
    for ifc in usable_interfaces() {
        if let Some(b) = ifc.broadcast {
            if !out.contains(&b) {
                out.push(b);
            }
        }
    }
    out
}

/// Resolve a regular-or-broadcast address to the owning interface's
/// regular address.
pub fn matching_local_ip(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    usable_interfaces()
        .iter()
        .find(|ifc| ifc.addr == ip || ifc.broadcast == Some(ip))
        .map(|ifc| ifc.addr)
}

/// Resolve a regular-or-broadcast address to the owning interface's
/// broadcast address.
pub fn broadcast_for(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    usable_interfaces()
        .iter()
        .find(|ifc| ifc.addr == ip || ifc.broadcast == Some(ip))
        .and_then(|ifc| ifc.broadcast)
}

pub fn is_local_addr(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || local_addrs().contains(&ip)
}

pub fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let m = u32::from(mask);
    (u32::from(a) & m) == (u32::from(b) & m)
}

/// Host identifier sent in discovery replies; multi-homed replies from
/// one broker collapse on this value.
pub fn uname() -> String {
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    match std::env::var("HOSTNAME") {
        Ok(name) if !name.is_empty() => name,
        // Matches nothing, like the original's placeholder.
        _ => "...".to_string(),
    }
}

/// Resolve a host name (or dotted address) to IPv4 addresses.
pub async fn resolve_host(host: &str) -> Result<Vec<Ipv4Addr>> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(vec![ip]);
    }
    if host == "localhost" {
        return Ok(vec![Ipv4Addr::LOCALHOST]);
    }
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|_| EtError::Network)?
        .filter_map(|sa| match sa.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect::<Vec<_>>();
    if addrs.is_empty() {
        debug!(host, "no IPv4 addresses resolved");
        return Err(EtError::Network);
    }
    Ok(addrs)
}

/// Order a broker's advertised `(address, broadcast)` pairs so the
/// preferred subnet comes first, other locally reachable subnets next,
/// and everything else last. Relative order inside each class is kept,
/// so an already ordered list passes through unchanged. Pairs without a
/// broadcast (older reply form) fall into the last class.
pub fn order_ip_addrs(
    pairs: &[(Ipv4Addr, Option<Ipv4Addr>)],
    local: &[LocalInterface],
    preferred_broadcast: Option<Ipv4Addr>,
) -> Vec<Ipv4Addr> {
    let mut preferred = Vec::new();
    let mut same = Vec::new();
    let mut rest = Vec::new();

    for &(addr, bcast) in pairs {
        match bcast {
            Some(b) if preferred_broadcast == Some(b) => preferred.push(addr),
            Some(b) if local.iter().any(|ifc| ifc.broadcast == Some(b)) => same.push(addr),
            _ => rest.push(addr),
        }
    }

    preferred.extend(same);
    preferred.extend(rest);
    preferred
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ifc(addr: [u8; 4], bcast: [u8; 4]) -> LocalInterface {
        LocalInterface {
            name: "eth0".into(),
            addr: addr.into(),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast: Some(bcast.into()),
        }
    }

    #[test]
    fn subnet_match_uses_mask() {
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        assert!(same_subnet(
            Ipv4Addr::new(10, 0, 1, 5),
            Ipv4Addr::new(10, 0, 1, 200),
            mask
        ));
        assert!(!same_subnet(
            Ipv4Addr::new(10, 0, 1, 5),
            Ipv4Addr::new(10, 0, 2, 5),
            mask
        ));
    }

    #[test]
    fn ordering_prefers_subnets_and_is_stable() {
        let local = vec![ifc([10, 0, 1, 9], [10, 0, 1, 255]), ifc([10, 0, 2, 9], [10, 0, 2, 255])];
        let pairs = vec![
            (Ipv4Addr::new(172, 16, 0, 1), Some(Ipv4Addr::new(172, 16, 255, 255))),
            (Ipv4Addr::new(10, 0, 2, 7), Some(Ipv4Addr::new(10, 0, 2, 255))),
            (Ipv4Addr::new(10, 0, 1, 7), Some(Ipv4Addr::new(10, 0, 1, 255))),
            (Ipv4Addr::new(10, 0, 1, 8), Some(Ipv4Addr::new(10, 0, 1, 255))),
        ];
        let ordered =
            order_ip_addrs(&pairs, &local, Some(Ipv4Addr::new(10, 0, 1, 255)));
        assert_eq!(
            ordered,
            vec![
                Ipv4Addr::new(10, 0, 1, 7),
                Ipv4Addr::new(10, 0, 1, 8),
                Ipv4Addr::new(10, 0, 2, 7),
                Ipv4Addr::new(172, 16, 0, 1),
            ]
        );
    }

    #[test]
    fn ordering_is_idempotent() {
        let local = vec![ifc([10, 0, 1, 9], [10, 0, 1, 255])];
        let pairs = vec![
            (Ipv4Addr::new(10, 0, 1, 7), Some(Ipv4Addr::new(10, 0, 1, 255))),
            (Ipv4Addr::new(10, 0, 1, 8), Some(Ipv4Addr::new(10, 0, 1, 255))),
            (Ipv4Addr::new(192, 168, 3, 2), Some(Ipv4Addr::new(192, 168, 3, 255))),
        ];
        let once = order_ip_addrs(&pairs, &local, None);
        let again: Vec<(Ipv4Addr, Option<Ipv4Addr>)> = once
            .iter()
            .map(|&a| {
                let b = pairs.iter().find(|(p, _)| *p == a).and_then(|(_, b)| *b);
                (a, b)
            })
            .collect();
        assert_eq!(order_ip_addrs(&again, &local, None), once);
    }

    #[test]
    fn old_frames_without_broadcast_sort_last() {
        let local = vec![ifc([10, 0, 1, 9], [10, 0, 1, 255])];
        let pairs = vec![
            (Ipv4Addr::new(10, 0, 9, 1), None),
            (Ipv4Addr::new(10, 0, 1, 7), Some(Ipv4Addr::new(10, 0, 1, 255))),
        ];
        let ordered = order_ip_addrs(&pairs, &local, None);
        assert_eq!(ordered[0], Ipv4Addr::new(10, 0, 1, 7));
    }
}
