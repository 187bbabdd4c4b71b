//! Protocol-qualified addresses of the form `scheme://host:port`.

use crate::error::NetError;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Transport family selected by the address scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Either IPv4 or IPv6.
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }

    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `scheme://host:port` address.
///
/// The scheme defaults to `tcp` when omitted. An empty host means every
/// local interface when listening.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtoAddr {
    network: Network,
    host: String,
    port: u16,
}

impl ProtoAddr {
    pub fn parse(s: &str) -> Result<Self, NetError> {
        let (scheme, rest) = match s.find("://") {
            Some(idx) => (&s[..idx], &s[idx + 3..]),
            None => ("", s),
        };

        let network = match scheme.to_ascii_lowercase().as_str() {
            "" | "tcp" => Network::Tcp,
            "tcp4" => Network::Tcp4,
            "tcp6" => Network::Tcp6,
            other => {
                return Err(NetError::invalid_address(
                    s,
                    format!("unsupported scheme '{}'", other),
                ))
            }
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let end = bracketed
                .find(']')
                .ok_or_else(|| NetError::invalid_address(s, "missing ']' in host"))?;
            let port = bracketed[end + 1..]
                .strip_prefix(':')
                .ok_or_else(|| NetError::invalid_address(s, "missing port"))?;
            (&bracketed[..end], port)
        } else {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| NetError::invalid_address(s, "missing port"))?;
            if host.contains(':') {
                return Err(NetError::invalid_address(
                    s,
                    "IPv6 hosts must be enclosed in brackets",
                ));
            }
            (host, port)
        };

        if port.is_empty() {
            return Err(NetError::invalid_address(s, "missing port"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| NetError::invalid_address(s, format!("invalid port '{}'", port)))?;

        Ok(Self {
            network,
            host: host.to_string(),
            port,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `host:port`, bracketing IPv6 literals.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolves the address to socket addresses of the selected family.
    ///
    /// An empty host resolves to the unspecified address.
    pub async fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        if self.host.is_empty() {
            let ip = match self.network {
                Network::Tcp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            };
            return Ok(vec![SocketAddr::new(ip, self.port)]);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(self.host_port())
            .await?
            .filter(|a| self.network.accepts(a))
            .collect();

        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} addresses for '{}'", self.network, self.host),
            ));
        }
        Ok(addrs)
    }
}

impl FromStr for ProtoAddr {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ProtoAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.host_port())
    }
}
