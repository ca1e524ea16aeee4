use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use anyhow::{anyhow, bail};

/// The transport a physical link runs over
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub enum LinkKind {
    Tcp,
    Udp,
}
impl Debug for LinkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Tcp => write!(f, "tcp"),
            LinkKind::Udp => write!(f, "udp"),
        }
    }
}
impl Display for LinkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
impl FromStr for LinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(LinkKind::Tcp),
            "udp" => Ok(LinkKind::Udp),
            other => bail!("unsupported protocol {:?} - expected tcp or udp", other),
        }
    }
}

/// A peer or listen address with an inclusive port range, e.g. `udp://10.0.0.1:4000-4003`.
///  One physical link is opened (or one socket bound) per port in the range.
#[derive(Clone, Eq, PartialEq)]
pub struct Endpoint {
    pub kind: LinkKind,
    pub host: String,
    pub port_begin: u16,
    pub port_end: u16,
}

impl Endpoint {
    /// parses a comma separated list of endpoints
    pub fn parse_list(s: &str) -> anyhow::Result<Vec<Endpoint>> {
        let result = s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Endpoint::from_str)
            .collect::<anyhow::Result<Vec<_>>>()?;

        if result.is_empty() {
            bail!("no endpoint in {:?}", s);
        }
        Ok(result)
    }

    pub fn ports(&self) -> impl Iterator<Item=u16> {
        self.port_begin..=self.port_end
    }

    /// `host:port` for every port in the range, suitable for `ToSocketAddrs`
    pub fn addrs(&self) -> Vec<String> {
        self.ports()
            .map(|port| self.addr(port))
            .collect()
    }

    pub fn addr(&self, port: u16) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, port)
        }
        else {
            format!("{}:{}", self.host, port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, rest) = s.split_once("://")
            .ok_or_else(|| anyhow!("endpoint {:?} has no protocol - expected proto://host:port", s))?;
        let kind = LinkKind::from_str(proto)?;

        let (host, ports) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']')
                .ok_or_else(|| anyhow!("unterminated IPv6 host in {:?}", s))?;
            let ports = after.strip_prefix(':')
                .ok_or_else(|| anyhow!("endpoint {:?} has no port", s))?;
            (host, ports)
        }
        else {
            rest.rsplit_once(':')
                .ok_or_else(|| anyhow!("endpoint {:?} has no port", s))?
        };
        if host.is_empty() {
            bail!("endpoint {:?} has no host", s);
        }

        let (port_begin, port_end) = match ports.split_once('-') {
            Some((begin, end)) => (parse_port(begin, s)?, parse_port(end, s)?),
            None => {
                let port = parse_port(ports, s)?;
                (port, port)
            }
        };
        if port_end < port_begin {
            bail!("port range {}-{} in {:?} is empty", port_begin, port_end, s);
        }

        Ok(Endpoint {
            kind,
            host: host.to_string(),
            port_begin,
            port_end,
        })
    }
}

fn parse_port(s: &str, endpoint: &str) -> anyhow::Result<u16> {
    s.parse()
        .map_err(|_| anyhow!("invalid port {:?} in {:?}", s, endpoint))
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let host = if self.host.contains(':') { format!("[{}]", self.host) } else { self.host.clone() };
        if self.port_begin == self.port_end {
            write!(f, "{}://{}:{}", self.kind, host, self.port_begin)
        }
        else {
            write!(f, "{}://{}:{}-{}", self.kind, host, self.port_begin, self.port_end)
        }
    }
}
impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
