//! Address Resolution
//!
//! Parses `host:port` and bare-port strings into TCP endpoints.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV6};
use std::str::FromStr;

use anyhow::{anyhow, bail};
use tokio::net::lookup_host;
use tracing::debug;

/// A resolved TCP destination: IP address, port and optional IPv6 zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub zone: Option<String>,
}

impl Endpoint {
    /// Create an endpoint without a zone
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port, zone: None }
    }

    /// Endpoint on the IPv4 wildcard address
    pub fn wildcard(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// Overwrite this endpoint in place from `src`.
    ///
    /// The zone buffer is reused when one is already allocated.
    pub fn assign(&mut self, src: &Endpoint) -> &mut Self {
        self.ip = src.ip;
        self.port = src.port;
        match (&mut self.zone, &src.zone) {
            (Some(dst), Some(zone)) => zone.clone_into(dst),
            (dst, zone) => *dst = zone.clone(),
        }
        self
    }

    /// Socket address suitable for `bind`/`connect`.
    ///
    /// The zone becomes the IPv6 scope id: a number is used as is, an
    /// interface name is looked up. Unknown interfaces map to scope 0.
    pub fn to_socket_addr(&self) -> SocketAddr {
        match self.ip {
            IpAddr::V6(ip) => {
                let scope_id = self.zone.as_deref().map(zone_index).unwrap_or(0);
                SocketAddr::V6(SocketAddrV6::new(ip, self.port, 0, scope_id))
            }
            IpAddr::V4(_) => SocketAddr::new(self.ip, self.port),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        let zone = match addr {
            SocketAddr::V6(v6) if v6.scope_id() != 0 => Some(v6.scope_id().to_string()),
            _ => None,
        };
        Self {
            ip: addr.ip(),
            port: addr.port(),
            zone,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.ip, &self.zone) {
            (IpAddr::V6(ip), Some(zone)) => write!(f, "[{}%{}]:{}", ip, zone, self.port),
            (IpAddr::V6(ip), None) => write!(f, "[{}]:{}", ip, self.port),
            (IpAddr::V4(ip), _) => write!(f, "{}:{}", ip, self.port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    /// Parse a literal endpoint. Hostnames are rejected; use [`resolve`] for those.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(text)?;
        if host.is_empty() {
            return Ok(Endpoint::wildcard(port));
        }
        let (host, zone) = split_zone(host)?;
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| anyhow!("not an IP literal: {}", host))?;
        if zone.is_some() && ip.is_ipv4() {
            bail!("zone is only valid for IPv6 addresses: {}", text);
        }
        Ok(Endpoint {
            ip,
            port,
            zone: zone.map(str::to_string),
        })
    }
}

/// Resolve `text` into an endpoint.
///
/// Text without a `:` is a bare port on the wildcard address. Anything that
/// cannot be parsed or resolved yields `None`.
pub async fn resolve(text: &str) -> Option<Endpoint> {
    if text.is_empty() {
        return None;
    }

    if let Ok(endpoint) = text.parse::<Endpoint>() {
        return Some(endpoint);
    }

    // Not a literal, try the system resolver
    let (host, port) = split_host_port(text).ok()?;
    if host.is_empty() || host.contains('%') {
        return None;
    }
    match lookup_host((host, port)).await {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            let chosen = addrs
                .iter()
                .find(|addr| addr.is_ipv4())
                .or_else(|| addrs.first())
                .copied()?;
            debug!("Resolved {} to {}", text, chosen);
            Some(Endpoint::from(chosen))
        }
        Err(e) => {
            debug!("Failed to resolve {}: {}", text, e);
            None
        }
    }
}

/// Split `host:port`, `[v6]:port` or a bare `port`.
fn split_host_port(text: &str) -> crate::Result<(&str, u16)> {
    let (host, port) = if let Some(rest) = text.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| anyhow!("missing port in address: {}", text))?;
        (host, port)
    } else if let Some((host, port)) = text.rsplit_once(':') {
        if host.contains(':') {
            bail!("too many colons in address: {}", text);
        }
        (host, port)
    } else {
        ("", text)
    };
    Ok((host, parse_port(port)?))
}

fn split_zone(host: &str) -> crate::Result<(&str, Option<&str>)> {
    match host.split_once('%') {
        Some((_, "")) => bail!("empty zone in address: {}", host),
        Some((ip, zone)) => Ok((ip, Some(zone))),
        None => Ok((host, None)),
    }
}

fn zone_index(zone: &str) -> u32 {
    if let Ok(index) = zone.parse::<u32>() {
        return index;
    }
    interface_index(zone).unwrap_or_else(|| {
        debug!("Unknown interface in zone {:?}, using scope 0", zone);
        0
    })
}

#[cfg(unix)]
fn interface_index(name: &str) -> Option<u32> {
    nix::net::if_::if_nametoindex(name).ok()
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> Option<u32> {
    None
}

fn parse_port(port: &str) -> crate::Result<u16> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        bail!("invalid port: {:?}", port);
    }
    port.parse::<u16>()
        .map_err(|_| anyhow!("port out of range: {}", port))
}
