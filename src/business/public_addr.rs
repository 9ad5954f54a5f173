//! Public address discovery
//!
//! Addresses given on the command line win. Missing ones are asked of a
//! plain-text "what is my ip" service, once per address family.

use anyhow::{anyhow, Context, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::config::PublicConfig;
use crate::logger::log;
use crate::transport::PublicAddress;

/// Address family to look up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn unspecified(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn matches(self, ip: &IpAddr) -> bool {
        matches!((self, ip), (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_)))
    }
}

/// Ask `url` for our address, connecting from the given family only
async fn lookup_ip(url: &str, family: Family, timeout: Duration) -> Result<IpAddr> {
    let client = reqwest::Client::builder()
        .local_address(family.unspecified())
        .no_proxy()
        .timeout(timeout)
        .build()
        .context("Failed to build lookup client")?;

    let body = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Address lookup via {} failed", url))?
        .error_for_status()?
        .text()
        .await?;

    let ip = body
        .trim()
        .parse::<IpAddr>()
        .with_context(|| format!("Address lookup returned '{}'", body.trim()))?;
    if !family.matches(&ip) {
        return Err(anyhow!("Address lookup returned {} for the wrong family", ip));
    }
    Ok(ip)
}

/// Fill in the public addresses the configuration leaves open.
///
/// A failed lookup is logged and leaves that family unset.
pub async fn resolve_public_address(config: &PublicConfig, timeout: Duration) -> PublicAddress {
    let mut public = PublicAddress {
        ipv4: config.ipv4,
        ipv6: config.ipv6,
    };
    let Some(url) = config.lookup.as_deref() else {
        return public;
    };

    if public.ipv4.is_none() {
        match lookup_ip(url, Family::V4, timeout).await {
            Ok(IpAddr::V4(ip)) => public.ipv4 = Some(ip),
            Ok(_) => {}
            Err(e) => log::warn!(error = %e, "Cannot detect public IPv4 address"),
        }
    }
    if public.ipv6.is_none() {
        match lookup_ip(url, Family::V6, timeout).await {
            Ok(IpAddr::V6(ip)) => public.ipv6 = Some(ip),
            Ok(_) => {}
            Err(e) => log::debug!(error = %e, "Cannot detect public IPv6 address"),
        }
    }
    public
}
