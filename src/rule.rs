use anyhow::{Context, Result, anyhow, bail};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleKind {
    Tcp,
    Http,
    WebSocket,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "TCP",
            Self::Http => "HTTP",
            Self::WebSocket => "WebSocket",
        })
    }
}

/// Upstream endpoint of a rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Target {
    type Err = anyhow::Error;

    /// Parses `host:port`, with IPv6 literals written as `[addr]:port`.
    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Missing port in target address: {s}"))?;
        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(v6) if v6.parse::<IpAddr>().is_ok_and(|ip| ip.is_ipv6()) => v6,
            Some(_) => bail!("Invalid IPv6 host in target address: {s}"),
            None if host.contains(':') => {
                bail!("IPv6 hosts must be bracketed in target address: {s}")
            }
            None => host,
        };
        if host.is_empty() {
            bail!("Missing host in target address: {s}");
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("Invalid port in target address: {s}"))?;
        if port == 0 {
            bail!("Target port must not be 0: {s}");
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Local address outbound connections are bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceAddress(SocketAddr);

impl SourceAddress {
    pub const fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub const fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }
}

impl FromStr for SourceAddress {
    type Err = anyhow::Error;

    /// Accepts either a bare IP (ephemeral port) or `ip:port`.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self(addr));
        }
        s.parse::<IpAddr>()
            .map(|ip| Self(SocketAddr::new(ip, 0)))
            .map_err(|_| anyhow!("Invalid source address (expected IP or IP:port): {s}"))
    }
}

impl fmt::Display for SourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.port() == 0 {
            write!(f, "{}", self.0.ip())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A validated forwarding rule. Never mutated once a listener owns it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub kind: RuleKind,
    pub local_port: u16,
    pub target: Target,
    pub source: Option<SourceAddress>,
    /// Upstream uses `wss`/`https` (WebSocket rules only).
    pub secure: bool,
    /// Extra trust roots for a secure upstream.
    pub ca_file: Option<PathBuf>,
}

impl Rule {
    pub fn new(kind: RuleKind, local_port: u16, target: Target) -> Self {
        Self {
            kind,
            local_port,
            target,
            source: None,
            secure: false,
            ca_file: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: SourceAddress) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub const fn http_scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }

    pub const fn websocket_scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }

    /// Origin presented upstream when a source address is configured.
    ///
    /// Without a source address the client's own Origin is forwarded
    /// instead, see [`crate::websocket`].
    pub fn websocket_origin(&self, local_port: u16) -> Option<String> {
        self.source.map(|source| match source.ip() {
            IpAddr::V4(ip) => format!("http://{ip}:{local_port}"),
            IpAddr::V6(ip) => format!("http://[{ip}]:{local_port}"),
        })
    }

    /// Human-readable relay destination used in status lines.
    pub fn route(&self) -> String {
        match self.source {
            Some(source) => format!("{} through {source}", self.target),
            None => self.target.to_string(),
        }
    }
}
