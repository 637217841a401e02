//! Allowed IP computation
//!
//! Everything is routed through the tunnel except local networks and
//! multicast. The gateway itself lives inside a private block, so its host
//! route is added back explicitly.

use crate::config::IpRange;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IPv4 blocks that stay on the local network
pub const IPV4_EXCLUDED: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
];

/// IPv6 blocks that stay on the local network
pub const IPV6_EXCLUDED: &[&str] = &["fc00::/7", "ff00::/8"];

/// Inclusive interval of addresses in one family
type Span = (u128, u128);

/// Compute the ranges routed through the tunnel.
///
/// IPv6 ranges are only produced when an IPv6 gateway is given. Ranges in
/// `excluded` are carved out in addition to the built-in local blocks.
pub fn compute_allowed_ips(
    gateway_v4: Ipv4Addr,
    gateway_v6: Option<Ipv6Addr>,
    excluded: &[IpRange],
) -> Vec<IpRange> {
    let mut ranges = vec![IpRange::host(IpAddr::V4(gateway_v4))];
    if let Some(gateway) = gateway_v6 {
        ranges.push(IpRange::host(IpAddr::V6(gateway)));
    }

    ranges.extend(family_ranges(false, IPV4_EXCLUDED, excluded));
    if gateway_v6.is_some() {
        ranges.extend(family_ranges(true, IPV6_EXCLUDED, excluded));
    }

    ranges
}

fn family_ranges(ipv6: bool, builtin: &[&str], extra: &[IpRange]) -> Vec<IpRange> {
    let bits = if ipv6 { 128 } else { 32 };
    let mut spans: Vec<Span> = vec![(0, max_address(bits))];

    let holes = builtin
        .iter()
        .filter_map(|cidr| cidr.parse::<IpRange>().ok())
        .chain(extra.iter().copied())
        .filter(|range| range.is_ipv6() == ipv6);

    for hole in holes {
        spans = subtract(spans, range_span(&hole, bits));
    }

    spans
        .into_iter()
        .flat_map(|(start, end)| to_cidrs(start, end, bits))
        .filter_map(|(start, prefix)| IpRange::new(to_addr(start, ipv6), prefix).ok())
        .collect()
}

fn max_address(bits: u32) -> u128 {
    if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 }
}

/// Largest value representable with `k` host bits
fn host_mask(k: u32) -> u128 {
    if k >= 128 { u128::MAX } else { (1u128 << k) - 1 }
}

fn range_span(range: &IpRange, bits: u32) -> Span {
    let start = match range.address() {
        IpAddr::V4(ip) => u32::from(ip) as u128,
        IpAddr::V6(ip) => u128::from(ip),
    };
    let host = host_mask(bits - range.prefix() as u32);
    let start = start & !host;
    (start, start | host)
}

fn subtract(spans: Vec<Span>, (hole_start, hole_end): Span) -> Vec<Span> {
    let mut out = Vec::with_capacity(spans.len() + 1);
    for (start, end) in spans {
        if hole_end < start || hole_start > end {
            out.push((start, end));
            continue;
        }
        if hole_start > start {
            out.push((start, hole_start - 1));
        }
        if hole_end < end {
            out.push((hole_end + 1, end));
        }
    }
    out
}

/// Split an inclusive interval into the minimal list of aligned CIDR blocks
fn to_cidrs(mut start: u128, end: u128, bits: u32) -> Vec<(u128, u8)> {
    let mut blocks = Vec::new();
    loop {
        let mut k = start.trailing_zeros().min(bits);
        while k > 0 && host_mask(k) > end - start {
            k -= 1;
        }
        blocks.push((start, (bits - k) as u8));

        let last = start | host_mask(k);
        if last >= end {
            break;
        }
        start = last + 1;
    }
    blocks
}

fn to_addr(value: u128, ipv6: bool) -> IpAddr {
    if ipv6 {
        IpAddr::V6(Ipv6Addr::from(value))
    } else {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    }
}
