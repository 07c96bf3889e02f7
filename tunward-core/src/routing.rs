use crate::config::RouteRulesConfig;
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Routing verdict for a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Relay through the SOCKS5 proxy
    Proxy,
    /// Connect directly (default when nothing matches)
    Direct,
    /// Refuse the connection
    Block,
}

/// Shared routing-decision table.
///
/// Four rule sets: {proxy, block} x {host patterns, CIDR ranges}.
/// Block always wins over Proxy; no match means Direct. Lookups take
/// read locks only, so rule edits from the management surface never
/// stall the packet path beyond a brief critical section.
pub struct RouteTable {
    proxy_hosts: RwLock<HashSet<String>>,
    block_hosts: RwLock<HashSet<String>>,
    proxy_nets: RwLock<Vec<Ipv4Net>>,
    block_nets: RwLock<Vec<Ipv4Net>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            proxy_hosts: RwLock::new(HashSet::new()),
            block_hosts: RwLock::new(HashSet::new()),
            proxy_nets: RwLock::new(Vec::new()),
            block_nets: RwLock::new(Vec::new()),
        }
    }

    /// Build a table from the configuration snapshot loaded at tunnel
    /// start. Unparseable CIDR entries are logged and skipped.
    pub fn from_config(rules: &RouteRulesConfig) -> Self {
        let table = Self::new();
        table.replace_all(
            rules.proxy_hosts.iter().map(|s| s.as_str()),
            rules.block_hosts.iter().map(|s| s.as_str()),
            rules.proxy_cidrs.iter().map(|s| s.as_str()),
            rules.block_cidrs.iter().map(|s| s.as_str()),
        );
        table
    }

    /// Verdict for a destination IP. Block ranges are consulted before
    /// proxy ranges; first match within a set wins.
    pub fn action_for_ip(&self, addr: Ipv4Addr) -> RouteAction {
        if self.block_nets.read().iter().any(|net| net.contains(&addr)) {
            debug!("BLOCK (IP range): {}", addr);
            return RouteAction::Block;
        }
        if self.proxy_nets.read().iter().any(|net| net.contains(&addr)) {
            debug!("PROXY (IP range): {}", addr);
            return RouteAction::Proxy;
        }
        RouteAction::Direct
    }

    /// Verdict for a hostname. Only used by DNS-aware callers; the
    /// packet path sees bare IPs and calls `action_for_ip`.
    pub fn action_for_host(&self, hostname: &str) -> RouteAction {
        if hostname.is_empty() {
            return RouteAction::Direct;
        }
        let host = hostname.to_lowercase();

        if matches_host(&host, &self.block_hosts.read()) {
            debug!("BLOCK (host): {}", hostname);
            return RouteAction::Block;
        }
        if matches_host(&host, &self.proxy_hosts.read()) {
            debug!("PROXY (host): {}", hostname);
            return RouteAction::Proxy;
        }
        RouteAction::Direct
    }

    // Management surface: get/set/add/remove for all four sets.

    pub fn proxy_hosts(&self) -> Vec<String> {
        self.proxy_hosts.read().iter().cloned().collect()
    }

    pub fn block_hosts(&self) -> Vec<String> {
        self.block_hosts.read().iter().cloned().collect()
    }

    pub fn proxy_cidrs(&self) -> Vec<String> {
        self.proxy_nets.read().iter().map(|n| n.to_string()).collect()
    }

    pub fn block_cidrs(&self) -> Vec<String> {
        self.block_nets.read().iter().map(|n| n.to_string()).collect()
    }

    pub fn set_proxy_hosts<'a, I: IntoIterator<Item = &'a str>>(&self, hosts: I) {
        let mut guard = self.proxy_hosts.write();
        guard.clear();
        guard.extend(hosts.into_iter().map(normalize_host));
    }

    pub fn set_block_hosts<'a, I: IntoIterator<Item = &'a str>>(&self, hosts: I) {
        let mut guard = self.block_hosts.write();
        guard.clear();
        guard.extend(hosts.into_iter().map(normalize_host));
    }

    pub fn set_proxy_cidrs<'a, I: IntoIterator<Item = &'a str>>(&self, cidrs: I) {
        let parsed = parse_cidrs(cidrs);
        *self.proxy_nets.write() = parsed;
    }

    pub fn set_block_cidrs<'a, I: IntoIterator<Item = &'a str>>(&self, cidrs: I) {
        let parsed = parse_cidrs(cidrs);
        *self.block_nets.write() = parsed;
    }

    pub fn add_proxy_host(&self, host: &str) {
        self.proxy_hosts.write().insert(normalize_host(host));
    }

    pub fn add_block_host(&self, host: &str) {
        self.block_hosts.write().insert(normalize_host(host));
    }

    pub fn remove_proxy_host(&self, host: &str) {
        self.proxy_hosts.write().remove(&normalize_host(host));
    }

    pub fn remove_block_host(&self, host: &str) {
        self.block_hosts.write().remove(&normalize_host(host));
    }

    pub fn add_proxy_cidr(&self, cidr: &str) -> bool {
        match parse_cidr(cidr) {
            Some(net) => {
                self.proxy_nets.write().push(net);
                true
            }
            None => false,
        }
    }

    pub fn add_block_cidr(&self, cidr: &str) -> bool {
        match parse_cidr(cidr) {
            Some(net) => {
                self.block_nets.write().push(net);
                true
            }
            None => false,
        }
    }

    /// Replace all four rule sets in one pass
    pub fn replace_all<'a, A, B, C, D>(&self, proxy_hosts: A, block_hosts: B, proxy_cidrs: C, block_cidrs: D)
    where
        A: IntoIterator<Item = &'a str>,
        B: IntoIterator<Item = &'a str>,
        C: IntoIterator<Item = &'a str>,
        D: IntoIterator<Item = &'a str>,
    {
        self.set_proxy_hosts(proxy_hosts);
        self.set_block_hosts(block_hosts);
        self.set_proxy_cidrs(proxy_cidrs);
        self.set_block_cidrs(block_cidrs);
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().to_lowercase()
}

/// Pattern match: exact, dot-suffix membership, or `*.` wildcard.
/// `sub.example.com` matches rule `example.com`; `*.example.com`
/// matches `foo.example.com` but not bare `example.com`.
fn matches_host(hostname: &str, patterns: &HashSet<String>) -> bool {
    patterns.iter().any(|pattern| {
        let pattern = pattern.as_str();
        if hostname == pattern {
            return true;
        }
        if hostname.len() > pattern.len()
            && hostname.ends_with(pattern)
            && hostname.as_bytes()[hostname.len() - pattern.len() - 1] == b'.'
        {
            return true;
        }
        if let Some(suffix) = pattern.strip_prefix("*.") {
            return hostname.len() > suffix.len()
                && hostname.ends_with(suffix)
                && hostname.as_bytes()[hostname.len() - suffix.len() - 1] == b'.';
        }
        false
    })
}

/// Parse `a.b.c.d/len`; a bare address is treated as /32
fn parse_cidr(cidr: &str) -> Option<Ipv4Net> {
    let text = cidr.trim();
    if let Ok(net) = text.parse::<Ipv4Net>() {
        return Some(net);
    }
    if let Ok(addr) = text.parse::<Ipv4Addr>() {
        return Ipv4Net::new(addr, 32).ok();
    }
    warn!("Failed to parse CIDR rule: {}", cidr);
    None
}

fn parse_cidrs<'a, I: IntoIterator<Item = &'a str>>(cidrs: I) -> Vec<Ipv4Net> {
    cidrs.into_iter().filter_map(parse_cidr).collect()
}
