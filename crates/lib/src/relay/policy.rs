//! Gateway address policy and issuer authentication.

use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// True when the URL's host is a public address a remote relay can reach.
pub fn is_public_gateway(url: &Url) -> bool {
    match url.host() {
        None => false,
        Some(Host::Domain(domain)) => public_domain(domain),
        Some(Host::Ipv4(ip)) => public_ipv4(ip),
        Some(Host::Ipv6(ip)) => public_ipv6(ip),
    }
}

fn public_domain(domain: &str) -> bool {
    let host = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    !(host.is_empty()
        || host == "localhost"
        || host == "host.docker.internal"
        || host.ends_with(".local"))
}

fn public_ipv4(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified())
}

fn public_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return public_ipv4(v4);
    }
    let first = ip.segments()[0];
    let link_local = first & 0xffc0 == 0xfe80;
    let unique_local = first & 0xfe00 == 0xfc00;
    !(ip.is_loopback() || ip.is_unspecified() || link_local || unique_local)
}

/// Compare secrets without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
