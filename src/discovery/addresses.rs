//! Candidate address generation: priority hosts first, then local subnets

use crate::logging::get_logger;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Subnets wider than this prefix are narrowed to it around the local address
const MIN_SCAN_PREFIX: u32 = 16;

/// One local IPv4 network to sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl Subnet {
    pub fn new(address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self { address, netmask }
    }

    /// Host range `(first, last)` excluding network and broadcast addresses
    fn host_range(&self) -> Option<(u32, u32)> {
        let ip = u32::from(self.address);
        let mut mask = u32::from(self.netmask);
        if mask.count_ones() < MIN_SCAN_PREFIX {
            mask = u32::MAX << (32 - MIN_SCAN_PREFIX);
        }
        let network = ip & mask;
        let broadcast = network | !mask;
        let (first, last) = (network.checked_add(1)?, broadcast.checked_sub(1)?);
        (first <= last).then_some((first, last))
    }
}

/// Subnets of all non-loopback IPv4 interfaces
pub fn local_subnets() -> Vec<Subnet> {
    let logger = get_logger("discovery");
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) if !v4.ip.is_unspecified() => {
                    logger.debug(&format!("Scanning {} ({}/{})", iface.name, v4.ip, v4.netmask));
                    Some(Subnet::new(v4.ip, v4.netmask))
                }
                _ => None,
            })
            .collect(),
        Err(e) => {
            logger.warn(&format!("Failed to list network interfaces: {}", e));
            Vec::new()
        }
    }
}

#[derive(Debug, Clone)]
struct Range {
    next: u32,
    last: u32,
    local: u32,
}

/// Yields every priority host once, then every host of every subnet
#[derive(Debug, Clone)]
pub struct AddressGenerator {
    priority: Vec<String>,
    priority_index: usize,
    ranges: Vec<Range>,
    seen: HashSet<String>,
    consumed: u64,
    total: u64,
}

impl AddressGenerator {
    pub fn new(priority: impl IntoIterator<Item = String>, subnets: &[Subnet]) -> Self {
        let mut seen = HashSet::new();
        let priority: Vec<String> = priority
            .into_iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty() && seen.insert(h.clone()))
            .collect();

        let mut ranges = Vec::new();
        let mut total = priority.len() as u64;
        for subnet in subnets {
            if let Some((first, last)) = subnet.host_range() {
                let local = u32::from(subnet.address);
                total += u64::from(last - first) + 1;
                if (first..=last).contains(&local) {
                    total -= 1;
                }
                ranges.push(Range {
                    next: first,
                    last,
                    local,
                });
            }
        }

        Self {
            priority,
            priority_index: 0,
            ranges,
            seen,
            consumed: 0,
            total,
        }
    }

    /// Priority hosts only
    pub fn priority_only(priority: impl IntoIterator<Item = String>) -> Self {
        Self::new(priority, &[])
    }

    /// Percentage of addresses handed out so far
    pub fn progress(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.consumed.min(self.total) * 100) / self.total) as u8
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn next_subnet_host(&mut self) -> Option<String> {
        while let Some(range) = self.ranges.first_mut() {
            if range.next > range.last {
                self.ranges.remove(0);
                continue;
            }
            let candidate = range.next;
            // `last` is below the broadcast address, so this cannot overflow
            range.next += 1;
            if candidate == range.local {
                continue;
            }
            self.consumed += 1;
            let host = Ipv4Addr::from(candidate).to_string();
            // Priority hosts were already handed out
            if self.seen.contains(&host) {
                continue;
            }
            return Some(host);
        }
        None
    }
}

impl Iterator for AddressGenerator {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if let Some(host) = self.priority.get(self.priority_index) {
            self.priority_index += 1;
            self.consumed += 1;
            return Some(host.clone());
        }
        self.next_subnet_host()
    }
}
