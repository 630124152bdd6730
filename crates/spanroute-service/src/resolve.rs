//! Destination resolution.

use hickory_resolver::TokioResolver;
use spanroute_core::TracerouteError;
use std::net::{IpAddr, Ipv4Addr};

/// Resolves a destination to its IPv4 addresses. IP literals short-circuit
/// the resolver; anything that yields no IPv4 address is an error.
pub async fn resolve_destination(hostname: &str) -> Result<Vec<Ipv4Addr>, TracerouteError> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(vec![v4]),
            IpAddr::V6(_) => Err(TracerouteError::NoAddresses(hostname.to_string())),
        };
    }

    let resolver = TokioResolver::builder_tokio()
        .map_err(|err| TracerouteError::DnsResolutionFailed {
            hostname: hostname.to_string(),
            source: Box::new(err),
        })?
        .build();

    let lookup =
        resolver
            .lookup_ip(hostname)
            .await
            .map_err(|err| TracerouteError::DnsResolutionFailed {
                hostname: hostname.to_string(),
                source: Box::new(err),
            })?;

    let addrs: Vec<Ipv4Addr> = lookup
        .iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect();

    if addrs.is_empty() {
        return Err(TracerouteError::NoAddresses(hostname.to_string()));
    }
    Ok(addrs)
}
