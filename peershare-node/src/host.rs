//! Local address discovery and target name resolution.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};

use tracing::debug;

/// Public resolver used only to pick the outbound interface; no packet is sent.
const PROBE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 53);

/// Address of the interface that routes to the outside world.
pub fn probe_advertised_ip() -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(PROBE_TARGET)?;
    match socket.local_addr()? {
        SocketAddr::V4(a) if !a.ip().is_unspecified() => Ok(*a.ip()),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable IPv4 interface (got {other})"),
        )),
    }
}

/// Resolve `host` to IPv4 endpoints, paired with the name to display for each.
/// Dotted quads resolve to themselves; names keep the typed name.
pub fn resolve_v4(host: &str, port: u16) -> io::Result<Vec<(SocketAddrV4, String)>> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(vec![(SocketAddrV4::new(ip, port), ip.to_string())]);
    }
    let mut out: Vec<(SocketAddrV4, String)> = Vec::new();
    for addr in (host, port).to_socket_addrs()? {
        if let SocketAddr::V4(a) = addr {
            if !out.iter().any(|(seen, _)| *seen == a) {
                out.push((a, host.to_string()));
            }
        }
    }
    if out.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host} has no IPv4 address"),
        ));
    }
    Ok(out)
}

/// Name for an accepted connection's address. Falls back to the dotted quad
/// when the address has no reverse entry.
pub fn reverse_lookup(ip: Ipv4Addr) -> String {
    match dns_lookup::lookup_addr(&IpAddr::V4(ip)) {
        Ok(name) if !name.is_empty() => name,
        Ok(_) => ip.to_string(),
        Err(e) => {
            debug!(%ip, error = ?e, "reverse lookup failed");
            ip.to_string()
        }
    }
}
