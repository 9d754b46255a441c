use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Address to publish for a listener bound at `bound`.
///
/// An explicit advertise address wins. Otherwise an unspecified bind host
/// (`0.0.0.0`, `::`) is replaced with a private interface address so other
/// nodes can reach it; loopback is the last resort.
pub fn resolve_advertised_address(explicit: Option<&str>, bound: SocketAddr) -> String {
    if let Some(addr) = explicit.map(str::trim).filter(|a| !a.is_empty()) {
        return addr.to_string();
    }

    if !bound.ip().is_unspecified() {
        return bound.to_string();
    }

    let interfaces: Vec<IpAddr> = match get_if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter(|i| !i.is_loopback())
            .map(|i| i.ip())
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list network interfaces");
            Vec::new()
        }
    };

    SocketAddr::new(pick_host(&interfaces), bound.port()).to_string()
}

fn pick_host(candidates: &[IpAddr]) -> IpAddr {
    let private = candidates.iter().find(|ip| match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    });

    private
        .or_else(|| candidates.iter().find(|ip| ip.is_ipv4()))
        .or_else(|| candidates.first())
        .copied()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
