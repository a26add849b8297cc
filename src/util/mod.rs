use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, Ipv4Addr};
use systemstat::{Platform, System};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber, honouring `RUST_LOG` and falling back to `info`.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Interfaces reported by `local-ip-address` are tried first, then the ones
/// reported by `systemstat`. Loopback, link-local and broadcast addresses are
/// skipped. A host with no routable interface gets loopback, which is only
/// good for talking to a negotiation endpoint on the same machine.
pub fn host_address() -> IpAddr {
    if let Some(ip) = interface_address().or_else(system_address) {
        return ip;
    }

    warn!("No routable interface found, falling back to loopback");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn interface_address() -> Option<IpAddr> {
    let network_interfaces = match list_afinet_netifas() {
        Ok(n) => n,
        Err(e) => {
            warn!("Listing network interfaces failed: {}", e);
            return None;
        }
    };

    for (name, ip) in network_interfaces {
        info!("iface: {} / {:?}", name, ip);
        if let IpAddr::V4(ip4) = ip {
            if is_routable(ip4) {
                return Some(ip);
            }
        }
    }

    None
}

fn system_address() -> Option<IpAddr> {
    let system = System::new();
    let networks = system.networks().ok()?;

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if is_routable(v) {
                    return Some(IpAddr::V4(v));
                }
            }
        }
    }

    None
}

fn is_routable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local() && !ip.is_broadcast() && !ip.is_unspecified()
}
