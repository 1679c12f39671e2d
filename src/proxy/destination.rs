//! Outbound destination screening
//!
//! Every URL the relay fetches, including each redirect hop, must pass three
//! checks in order: scheme allow-list, host suffix allow-list, then the
//! addresses the host resolves to. The address check is what stops DNS
//! rebinding onto internal networks that the host allow-list cannot see.

use crate::config::DestinationSettings;
use crate::error;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use url::{Host, Url};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestinationRejection {
    #[error("URL could not be parsed")]
    Unparsable,

    #[error("scheme '{0}' is not allowed")]
    Scheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("host '{0}' is not allowed")]
    Host(String),

    #[error("host '{0}' did not resolve to any address")]
    Unresolvable(String),

    #[error("address {0} is not an allowed destination")]
    Address(IpAddr),
}

/// An address range in CIDR notation, e.g. `10.0.0.0/8` or `fd00::/8`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    network: IpAddr,
    prefix_len: u8,
}

impl IpRange {
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
            v4 => v4,
        };
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(candidate)) => {
                prefix_matches(u32::from(network).into(), u32::from(candidate).into(), 32, self.prefix_len)
            }
            (IpAddr::V6(network), IpAddr::V6(candidate)) => {
                prefix_matches(u128::from(network), u128::from(candidate), 128, self.prefix_len)
            }
            _ => false,
        }
    }
}

fn prefix_matches(network: u128, candidate: u128, bits: u8, prefix_len: u8) -> bool {
    if prefix_len == 0 {
        return true;
    }
    let shift = u32::from(bits - prefix_len);
    (network >> shift) == (candidate >> shift)
}

impl FromStr for IpRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = match s.trim().split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (s.trim(), None),
        };
        let network: IpAddr = address
            .parse()
            .map_err(|_| format!("'{address}' is not an IP address"))?;
        let max_len = if network.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix {
            Some(prefix) => prefix
                .parse::<u8>()
                .ok()
                .filter(|len| *len <= max_len)
                .ok_or_else(|| format!("'{prefix}' is not a valid prefix length"))?,
            None => max_len,
        };
        Ok(Self {
            network,
            prefix_len,
        })
    }
}

/// Addresses that must never be fetched unless explicitly allow-listed
pub fn is_internal_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_internal_v4(v4),
            None => is_internal_v6(v6),
        },
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.octets()[0] == 0
        || is_cgnat(ip)
}

/// Shared address space, 100.64.0.0/10
fn is_cgnat(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 100 && (octets[1] & 0xC0) == 64
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xFE00) == 0xFC00 // unique local, fc00::/7
        || (first & 0xFFC0) == 0xFE80 // link local, fe80::/10
}

/// Name resolution used by the validator
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addresses = tokio::net::lookup_host((host, port)).await?;
        Ok(addresses.map(|address| address.ip()).collect())
    }
}

#[derive(Debug, Clone)]
pub struct DestinationPolicy {
    pub allowed_schemes: Vec<String>,
    pub allowed_host_suffixes: Vec<String>,
    pub allowed_ranges: Vec<IpRange>,
}

impl DestinationPolicy {
    pub fn from_settings(settings: &DestinationSettings) -> error::Result<Self> {
        let allowed_ranges = settings
            .allowed_cidrs
            .iter()
            .map(|cidr| {
                cidr.parse::<IpRange>()
                    .map_err(|message| {
                        error::Error::invalid_setting("destination.allowed_cidrs", message)
                    })
            })
            .collect::<error::Result<Vec<_>>>()?;

        Ok(Self {
            allowed_schemes: normalize_all(&settings.allowed_schemes),
            allowed_host_suffixes: settings
                .allowed_host_suffixes
                .iter()
                .map(|suffix| suffix.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|suffix| !suffix.is_empty())
                .collect(),
            allowed_ranges,
        })
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_host_suffixes.iter().any(|suffix| {
            host == suffix
                || host
                    .strip_suffix(suffix.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    fn address_allowed(&self, ip: IpAddr) -> bool {
        if self.allowed_ranges.is_empty() {
            !is_internal_address(ip)
        } else {
            self.allowed_ranges.iter().any(|range| range.contains(ip))
        }
    }
}

fn normalize_all(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .collect()
}

#[derive(Clone)]
pub struct DestinationValidator {
    policy: Arc<DestinationPolicy>,
    resolver: Arc<dyn HostResolver>,
}

impl DestinationValidator {
    pub fn new(policy: DestinationPolicy) -> Self {
        Self::with_resolver(policy, Arc::new(SystemResolver))
    }

    pub fn with_resolver(policy: DestinationPolicy, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            policy: Arc::new(policy),
            resolver,
        }
    }

    /// Whether the relay may fetch `raw`; never errors
    pub async fn is_allowed(&self, raw: &str) -> bool {
        self.check(raw).await.is_ok()
    }

    /// Screen `raw`, returning the parsed URL or the first failed check
    pub async fn check(&self, raw: &str) -> Result<Url, DestinationRejection> {
        let url = Url::parse(raw).map_err(|_| DestinationRejection::Unparsable)?;
        self.check_url(url).await
    }

    pub async fn check_url(&self, url: Url) -> Result<Url, DestinationRejection> {
        let scheme = url.scheme().to_ascii_lowercase();
        if !self.policy.allowed_schemes.contains(&scheme) {
            return Err(DestinationRejection::Scheme(scheme));
        }

        let (host_text, literal) = match url.host() {
            Some(Host::Domain(domain)) => (
                domain.trim_end_matches('.').to_ascii_lowercase(),
                None,
            ),
            Some(Host::Ipv4(ip)) => (ip.to_string(), Some(IpAddr::V4(ip))),
            Some(Host::Ipv6(ip)) => (ip.to_string(), Some(IpAddr::V6(ip))),
            None => return Err(DestinationRejection::MissingHost),
        };

        if !self.policy.host_allowed(&host_text) {
            return Err(DestinationRejection::Host(host_text));
        }

        let addresses = match literal {
            Some(ip) => vec![ip],
            None => {
                let port = url.port_or_known_default().unwrap_or(443);
                match self.resolver.resolve(&host_text, port).await {
                    Ok(addresses) => addresses,
                    Err(e) => {
                        debug!(host = %host_text, error = %e, "Destination lookup failed");
                        Vec::new()
                    }
                }
            }
        };

        if addresses.is_empty() {
            return Err(DestinationRejection::Unresolvable(host_text));
        }

        if let Some(ip) = addresses
            .iter()
            .copied()
            .find(|ip| !self.policy.address_allowed(*ip))
        {
            warn!(host = %host_text, address = %ip, "Destination resolves to a disallowed address");
            return Err(DestinationRejection::Address(ip));
        }

        Ok(url)
    }
}
