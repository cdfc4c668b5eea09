//! Network detection
//!
//! Works out which interface, address and gateway a node should use. The
//! parsing and selection are pure functions over interface listings and the
//! text of `/proc/net/route` and `/proc/net/arp`; only [`detect`] touches
//! the system.

use crate::packet::MacAddr;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::debug;

const ROUTE_TABLE: &str = "/proc/net/route";
const ARP_TABLE: &str = "/proc/net/arp";

/// `RTF_UP | RTF_GATEWAY`
const RTF_GATEWAY_UP: u32 = 0x0003;

/// ARP entry flag for a completed resolution
const ATF_COM: u32 = 0x02;

/// Network detection errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("No default IPv4 route")]
    NoDefaultRoute,

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Interface {0} has no IPv4 address")]
    NoIpv4(String),

    #[error("Interface {0} has no MAC address")]
    NoMac(String),

    #[error("Gateway {0} is not in the ARP cache (ping it once, then retry)")]
    GatewayUnresolved(Ipv4Addr),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One interface as reported by the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEntry {
    pub name: String,
    pub mac: Option<MacAddr>,
    pub ipv4: Vec<Ipv4Addr>,
    pub is_up: bool,
    pub is_loopback: bool,
}

/// What a node needs to know about its network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub interface: String,
    pub ipv4: Ipv4Addr,
    pub mac: MacAddr,
    pub gateway: Ipv4Addr,
    pub gateway_mac: MacAddr,
}

impl fmt::Display for NetworkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "interface:   {}", self.interface)?;
        writeln!(f, "ipv4:        {}", self.ipv4)?;
        writeln!(f, "mac:         {}", self.mac)?;
        writeln!(f, "gateway:     {}", self.gateway)?;
        write!(f, "gateway_mac: {}", self.gateway_mac)
    }
}

/// A default route from `/proc/net/route`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub interface: String,
    pub gateway: Ipv4Addr,
    pub metric: u32,
}

/// Default routes, lowest metric first
///
/// Addresses in the table are little-endian hex words.
pub fn parse_default_routes(table: &str) -> Vec<DefaultRoute> {
    let mut routes: Vec<DefaultRoute> = table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let destination = u32::from_str_radix(fields[1], 16).ok()?;
            let gateway = u32::from_str_radix(fields[2], 16).ok()?;
            let flags = u32::from_str_radix(fields[3], 16).ok()?;
            let metric = fields[6].parse().ok()?;
            let mask = u32::from_str_radix(fields[7], 16).ok()?;

            if destination != 0 || mask != 0 || flags & RTF_GATEWAY_UP != RTF_GATEWAY_UP {
                return None;
            }
            Some(DefaultRoute {
                interface: fields[0].to_string(),
                gateway: Ipv4Addr::from(gateway.to_le_bytes()),
                metric,
            })
        })
        .collect();
    routes.sort_by_key(|route| route.metric);
    routes
}

/// Resolved neighbours from `/proc/net/arp`: `(ip, mac, device)`
pub fn parse_arp_table(table: &str) -> Vec<(Ipv4Addr, MacAddr, String)> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            let ip: Ipv4Addr = fields[0].parse().ok()?;
            let flags = u32::from_str_radix(fields[2].trim_start_matches("0x"), 16).ok()?;
            let mac: MacAddr = fields[3].parse().ok()?;
            if flags & ATF_COM == 0 || mac.is_zero() {
                return None;
            }
            Some((ip, mac, fields[5].to_string()))
        })
        .collect()
}

/// Pick interface, address and gateway
///
/// With `preferred` set, only that interface is considered; otherwise the
/// interface of the best default route is used.
pub fn select(
    interfaces: &[InterfaceEntry],
    route_table: &str,
    arp_table: &str,
    preferred: Option<&str>,
) -> Result<NetworkInfo, NetworkError> {
    let routes = parse_default_routes(route_table);
    let route = match preferred {
        Some(name) => routes
            .into_iter()
            .find(|route| route.interface == name)
            .ok_or(NetworkError::NoDefaultRoute)?,
        None => routes
            .into_iter()
            .find(|route| {
                interfaces
                    .iter()
                    .any(|iface| iface.name == route.interface && iface.is_up && !iface.is_loopback)
            })
            .ok_or(NetworkError::NoDefaultRoute)?,
    };

    let iface = interfaces
        .iter()
        .find(|iface| iface.name == route.interface)
        .ok_or_else(|| NetworkError::InterfaceNotFound(route.interface.clone()))?;
    let ipv4 = *iface
        .ipv4
        .first()
        .ok_or_else(|| NetworkError::NoIpv4(iface.name.clone()))?;
    let mac = iface
        .mac
        .filter(|mac| !mac.is_zero())
        .ok_or_else(|| NetworkError::NoMac(iface.name.clone()))?;

    let gateway_mac = parse_arp_table(arp_table)
        .into_iter()
        .find(|(ip, _, device)| *ip == route.gateway && *device == iface.name)
        .map(|(_, mac, _)| mac)
        .ok_or(NetworkError::GatewayUnresolved(route.gateway))?;

    Ok(NetworkInfo {
        interface: iface.name.clone(),
        ipv4,
        mac,
        gateway: route.gateway,
        gateway_mac,
    })
}

/// Interfaces as `pnet` sees them
pub fn interfaces() -> Vec<InterfaceEntry> {
    pnet::datalink::interfaces()
        .into_iter()
        .map(|iface| InterfaceEntry {
            mac: iface.mac.map(|mac| MacAddr::new(mac.octets())),
            ipv4: iface
                .ips
                .iter()
                .filter_map(|ip| match ip.ip() {
                    std::net::IpAddr::V4(v4) => Some(v4),
                    std::net::IpAddr::V6(_) => None,
                })
                .collect(),
            is_up: iface.is_up(),
            is_loopback: iface.is_loopback(),
            name: iface.name,
        })
        .collect()
}

/// Detect the network of this host
pub fn detect(preferred: Option<&str>) -> Result<NetworkInfo, NetworkError> {
    let route_table = std::fs::read_to_string(ROUTE_TABLE)?;
    let arp_table = std::fs::read_to_string(ARP_TABLE)?;
    let info = select(&interfaces(), &route_table, &arp_table, preferred)?;
    debug!("Detected {} via {}", info.interface, info.gateway);
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
wlan0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0
eth0\t00000000\t0100000A\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0000000A\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";

    const ARP: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
10.0.0.1         0x1         0x2         52:54:00:12:35:02     *        eth0
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        wlan0
10.0.0.7         0x1         0x0         00:00:00:00:00:00     *        eth0
";

    fn interfaces() -> Vec<InterfaceEntry> {
        vec![
            InterfaceEntry {
                name: "lo".to_string(),
                mac: None,
                ipv4: vec![Ipv4Addr::LOCALHOST],
                is_up: true,
                is_loopback: true,
            },
            InterfaceEntry {
                name: "eth0".to_string(),
                mac: Some("02:00:00:00:00:01".parse().unwrap()),
                ipv4: vec![Ipv4Addr::new(10, 0, 0, 5)],
                is_up: true,
                is_loopback: false,
            },
            InterfaceEntry {
                name: "wlan0".to_string(),
                mac: Some("02:00:00:00:00:02".parse().unwrap()),
                ipv4: vec![Ipv4Addr::new(192, 168, 1, 20)],
                is_up: true,
                is_loopback: false,
            },
        ]
    }

    #[test]
    fn test_parse_default_routes() {
        let routes = parse_default_routes(ROUTES);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].interface, "eth0");
        assert_eq!(routes[0].gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(routes[1].gateway, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_parse_arp_skips_incomplete() {
        let entries = parse_arp_table(ARP);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|(ip, _, _)| *ip != Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[test]
    fn test_select_best_route() {
        let info = select(&interfaces(), ROUTES, ARP, None).unwrap();
        assert_eq!(info.interface, "eth0");
        assert_eq!(info.ipv4, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(info.gateway_mac.to_string(), "52:54:00:12:35:02");
    }

    #[test]
    fn test_select_preferred_interface() {
        let info = select(&interfaces(), ROUTES, ARP, Some("wlan0")).unwrap();
        assert_eq!(info.interface, "wlan0");
        assert_eq!(info.gateway, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_select_failures() {
        assert!(matches!(
            select(&interfaces(), ROUTES, ARP, Some("lo")),
            Err(NetworkError::NoDefaultRoute)
        ));
        assert!(matches!(
            select(&interfaces(), ROUTES, "", None),
            Err(NetworkError::GatewayUnresolved(_))
        ));
        assert!(matches!(
            select(&interfaces(), "Iface\n", ARP, None),
            Err(NetworkError::NoDefaultRoute)
        ));
    }
}
