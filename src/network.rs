//! Local address discovery
//!
//! Certificate SANs for host-bound identities and the API server's advertise
//! address both come from the IPv4 addresses configured on this host.

use std::net::{IpAddr, Ipv4Addr};

use tracing::warn;

// =============================================================================
// Pure Functions (unit-testable)
// =============================================================================

/// Non-loopback addresses from `addrs`, deduplicated in order, followed by `127.0.0.1`
pub fn local_ips_from(addrs: impl IntoIterator<Item = Ipv4Addr>) -> Vec<IpAddr> {
    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        let ip = IpAddr::V4(addr);
        if !addr.is_loopback() && !addr.is_unspecified() && !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    ips
}

/// First RFC 1918 address in `addrs`
pub fn node_ip_from(addrs: impl IntoIterator<Item = Ipv4Addr>) -> Option<Ipv4Addr> {
    addrs
        .into_iter()
        .find(|addr| !addr.is_loopback() && addr.is_private())
}

// =============================================================================
// Host queries
// =============================================================================

fn interface_ipv4_addrs() -> nix::Result<Vec<Ipv4Addr>> {
    let addrs = nix::ifaddrs::getifaddrs()?
        .filter_map(|ifaddr| {
            ifaddr
                .address
                .as_ref()
                .and_then(|a| a.as_sockaddr_in())
                .map(|sin| sin.ip())
        })
        .collect();
    Ok(addrs)
}

/// All non-loopback IPv4 addresses of this host plus `127.0.0.1`
///
/// Never fails: if the interfaces cannot be enumerated, only `127.0.0.1` is returned.
pub fn local_ips() -> Vec<IpAddr> {
    match interface_ipv4_addrs() {
        Ok(addrs) => local_ips_from(addrs),
        Err(e) => {
            warn!(error = %e, "Failed to enumerate local addresses, using 127.0.0.1 only");
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        }
    }
}

/// First private IPv4 address of this host, or `127.0.0.1` when there is none
pub fn node_ip() -> Ipv4Addr {
    let found = match interface_ipv4_addrs() {
        Ok(addrs) => node_ip_from(addrs),
        Err(e) => {
            warn!(error = %e, "Failed to enumerate local addresses");
            None
        }
    };
    found.unwrap_or_else(|| {
        warn!("No private IPv4 address found, advertising 127.0.0.1");
        Ipv4Addr::LOCALHOST
    })
}
