use dns_lookup::lookup_host;
use std::net::{IpAddr, Ipv4Addr};

/// Resolves `hostname` to the IPv4 address to ping.
pub async fn resolve_hostname(hostname: &str) -> anyhow::Result<Ipv4Addr> {
    // First try to parse as IP address
    match hostname.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => return Ok(ip),
        Ok(IpAddr::V6(_)) => {
            return Err(anyhow::anyhow!("IPv6 addresses are not supported"));
        }
        Err(_) => {}
    }

    let addresses = tokio::task::spawn_blocking({
        let hostname = hostname.to_string();
        move || lookup_host(&hostname)
    })
    .await??;

    log::debug!("{} resolved to {:?}", hostname, addresses);

    addresses
        .into_iter()
        .find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow::anyhow!("No IPv4 addresses found for hostname: {}", hostname))
}
