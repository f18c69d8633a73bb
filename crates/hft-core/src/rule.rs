//! The forwarding rule: one listening port mapped to one destination.

use crate::error::{HftError, HftResult};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Immutable description of one port forward.
///
/// Identity is the listening port: the registry never holds two rules with
/// the same `listening_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    /// Local port the proxy accepts clients on.
    pub listening_port: u16,
    /// Where every accepted client is forwarded to.
    pub destination: SocketAddr,
    /// Source address for outbound connections. The unspecified address
    /// (`0.0.0.0` / `::`) lets the OS pick.
    pub via: IpAddr,
    /// Free text, diagnostics only.
    pub comment: String,
}

impl ForwardingRule {
    /// Build a rule, rejecting port 0 (it cannot be a stable identity).
    pub fn new(
        listening_port: u16,
        destination: SocketAddr,
        via: IpAddr,
        comment: impl Into<String>,
    ) -> HftResult<Self> {
        if listening_port == 0 {
            return Err(HftError::InvalidRule("listening port must not be 0".into()));
        }
        if destination.port() == 0 {
            return Err(HftError::InvalidRule("destination port must not be 0".into()));
        }
        Ok(Self {
            listening_port,
            destination,
            via,
            comment: comment.into(),
        })
    }

    /// Whether outbound sockets must be bound to `via` before connecting.
    pub fn binds_source(&self) -> bool {
        !self.via.is_unspecified()
    }

    /// True when both rules forward the same port the same way. The comment
    /// is ignored, so editing it does not restart a rule.
    pub fn same_route(&self, other: &ForwardingRule) -> bool {
        self.listening_port == other.listening_port
            && self.destination == other.destination
            && self.via == other.via
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{} -> {} via {}", self.listening_port, self.destination, self.via)?;
        if !self.comment.is_empty() {
            write!(f, " ({})", self.comment)?;
        }
        Ok(())
    }
}

/// Parse a destination endpoint such as `10.0.0.5:443` or `[::1]:8080`.
pub fn parse_endpoint(s: &str) -> HftResult<SocketAddr> {
    let s = s.trim();
    let addr: SocketAddr = s
        .parse()
        .map_err(|_| HftError::InvalidAddress(format!("'{s}' is not an ip:port endpoint")))?;
    if addr.port() == 0 {
        return Err(HftError::InvalidAddress(format!("'{s}' has port 0")));
    }
    Ok(addr)
}

/// Parse a via-interface address such as `192.168.1.2`.
pub fn parse_via(s: &str) -> HftResult<IpAddr> {
    let s = s.trim();
    s.parse()
        .map_err(|_| HftError::InvalidAddress(format!("'{s}' is not an ip address")))
}
