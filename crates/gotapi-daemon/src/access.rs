//! Client address and `Origin` allow-lists.
//!
//! Loopback clients are always allowed. Other addresses must match an entry
//! of `allowed_address_list`: an exact IPv4 address, an IPv4 CIDR block, or
//! an IPv6 textual prefix such as `fe80:`. IPv4-mapped IPv6 addresses are
//! checked as IPv4.
//!
//! A request without an `Origin` header (not sent by a browser) passes the
//! origin check. A browser origin must be a local origin of this server or
//! appear in `allowed_origin_list`.

use std::net::{IpAddr, Ipv4Addr};

use gotapi_core::config::Config;
use ipnet::Ipv4Net;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AddressRule {
    /// A single address is kept as a `/32` network.
    V4(Ipv4Net),
    V6Prefix(String),
}

impl AddressRule {
    fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if let Ok(net) = entry.parse::<Ipv4Net>() {
            return Some(Self::V4(net.trunc()));
        }
        if let Ok(ip) = entry.parse::<Ipv4Addr>() {
            return Some(Self::V4(Ipv4Net::from(ip)));
        }
        if entry.contains(':') {
            return Some(Self::V6Prefix(entry.to_ascii_lowercase()));
        }
        None
    }

    fn matches(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (Self::V4(net), IpAddr::V4(ip)) => net.contains(&ip),
            (Self::V6Prefix(prefix), IpAddr::V6(ip)) => ip.to_string().starts_with(prefix.as_str()),
            _ => false,
        }
    }
}

/// The access restriction applied to every HTTP request and WebSocket upgrade.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    addresses: Vec<AddressRule>,
    origins: Vec<String>,
    host: String,
    port: u16,
}

impl AccessPolicy {
    /// Build the policy from config. Unparsable address entries are logged
    /// and ignored.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let addresses = config
            .allowed_address_list
            .iter()
            .filter_map(|entry| {
                let rule = AddressRule::parse(entry);
                if rule.is_none() {
                    warn!("Ignoring invalid allowed_address_list entry: {entry}");
                }
                rule
            })
            .collect();

        Self {
            addresses,
            origins: config
                .allowed_origin_list
                .iter()
                .map(|o| o.trim_end_matches('/').to_string())
                .collect(),
            host: config.gotapi_if_host.clone(),
            port: config.gotapi_if_port,
        }
    }

    #[must_use]
    pub fn allows_address(&self, addr: IpAddr) -> bool {
        let addr = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
            v4 @ IpAddr::V4(_) => v4,
        };
        addr.is_loopback() || self.addresses.iter().any(|rule| rule.matches(addr))
    }

    #[must_use]
    pub fn allows_origin(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        let origin = origin.trim_end_matches('/');
        self.origins.iter().any(|o| o == origin) || self.is_local_origin(origin)
    }

    fn is_local_origin(&self, origin: &str) -> bool {
        let Ok(url) = Url::parse(origin) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let host = url.host_str().unwrap_or_default();
        let local = matches!(host, "localhost" | "127.0.0.1" | "[::1]")
            || (!self.host.is_empty() && host == self.host && !is_wildcard(&self.host));
        local && url.port_or_known_default() == Some(self.port)
    }
}

fn is_wildcard(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_unspecified())
}
