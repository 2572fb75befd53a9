//! VPN presence heuristics over `scutil --dns` and `ifconfig` output.

use crate::platform::TunnelSignalReader;
use std::fmt;

const TUNNEL_PREFIX: &str = "utun";

/// utun0..utun3 belong to the system (iCloud Private Relay, Back to My Mac...).
const FIRST_USER_TUNNEL_INDEX: u32 = 4;

/// What convinced the detector that a VPN is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    /// The resolver configuration routes DNS through this tunnel.
    ResolverRoute(String),
    /// This user tunnel carries an IPv4 address.
    InterfaceAddress(String),
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evidence::ResolverRoute(iface) => write!(f, "DNS routed via {}", iface),
            Evidence::InterfaceAddress(iface) => write!(f, "address on {}", iface),
        }
    }
}

pub struct VpnDetector<R> {
    reader: R,
}

impl<R: TunnelSignalReader> VpnDetector<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn is_vpn_connected(&self) -> bool {
        self.evidence().is_some()
    }

    /// Samples both signals, reading the interface list only when the resolver
    /// configuration shows nothing.
    pub fn evidence(&self) -> Option<Evidence> {
        resolver_route(&self.reader.resolver_config())
            .or_else(|| interface_address(&self.reader.interface_list()))
    }
}

/// Primary check: a resolver entry bound to a tunnel, e.g.
/// `  if_index : 7 (utun5)`.
pub fn resolver_route(scutil_dns: &str) -> Option<Evidence> {
    scutil_dns
        .lines()
        .filter(|line| line.contains("if_index"))
        .find_map(|line| {
            let start = line.find(TUNNEL_PREFIX)?;
            let name: String = line[start..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();
            Some(Evidence::ResolverRoute(name))
        })
}

/// Fallback check: a non-reserved utun block with an IPv4 `inet` line.
pub fn interface_address(ifconfig: &str) -> Option<Evidence> {
    let mut candidate: Option<&str> = None;

    for line in ifconfig.lines() {
        if line.starts_with(TUNNEL_PREFIX) {
            let name = line.split(':').next().unwrap_or_default();
            candidate = tunnel_index(name)
                .filter(|index| *index >= FIRST_USER_TUNNEL_INDEX)
                .map(|_| name);
        } else if let Some(name) = candidate.filter(|_| is_ipv4_line(line)) {
            return Some(Evidence::InterfaceAddress(name.to_string()));
        } else if !line.starts_with('\t') && !line.starts_with(' ') {
            candidate = None;
        }
    }

    None
}

/// Numeric suffix of a tunnel name: `utun10` → 10. Anything else → `None`.
fn tunnel_index(name: &str) -> Option<u32> {
    name.strip_prefix(TUNNEL_PREFIX)?.parse().ok()
}

fn is_ipv4_line(line: &str) -> bool {
    line.contains("inet ") && !line.contains("inet6")
}
