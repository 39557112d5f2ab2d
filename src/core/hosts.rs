//! Static host mapping, consulted before any resolver.
//!
//! The table is held behind an `ArcSwap`, so a reload replaces it wholesale:
//! concurrent lookups see either the old or the new snapshot.
use std::{collections::HashMap, net::IpAddr, sync::Arc};

use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::core::resolver::IpFamily;

/// Name → address overlay.
#[async_trait]
pub trait HostMapper: Send + Sync + 'static {
    /// Candidate addresses for `host`, in preference order. Empty on a miss.
    async fn lookup(&self, network: &str, host: &str) -> Vec<IpAddr>;
}

/// One configured mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub hostname: String,
    pub ip: IpAddr,
}

#[derive(Debug, Default)]
struct HostTable {
    exact: HashMap<String, Vec<IpAddr>>,
    /// `.example.com` entries, stored without the leading dot
    suffix: Vec<(String, Vec<IpAddr>)>,
}

impl HostTable {
    fn build(entries: &[HostEntry]) -> Self {
        let mut table = HostTable::default();
        for entry in entries {
            let name = entry.hostname.trim_end_matches('.').to_ascii_lowercase();
            if let Some(suffix) = name.strip_prefix('.') {
                match table.suffix.iter_mut().find(|(s, _)| s == suffix) {
                    Some((_, ips)) => ips.push(entry.ip),
                    None => table.suffix.push((suffix.to_string(), vec![entry.ip])),
                }
            } else {
                table.exact.entry(name).or_default().push(entry.ip);
            }
        }
        // longest suffix wins
        table.suffix.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        table
    }

    /// Addresses of the first entry with any of `family`: the exact name,
    /// then suffixes from longest to shortest.
    fn lookup(&self, host: &str, family: IpFamily) -> Vec<IpAddr> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let suffixes = self
            .suffix
            .iter()
            .filter(|(suffix, _)| {
                host == *suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            })
            .map(|(_, ips)| ips);

        self.exact
            .get(&host)
            .into_iter()
            .chain(suffixes)
            .map(|ips| ips.iter().copied().filter(|ip| family.accepts(ip)).collect::<Vec<_>>())
            .find(|ips| !ips.is_empty())
            .unwrap_or_default()
    }
}

/// In-memory host table with atomic reload.
#[derive(Debug)]
pub struct StaticHostMapper {
    name: String,
    table: ArcSwap<HostTable>,
}

impl StaticHostMapper {
    pub fn new(name: impl Into<String>, entries: &[HostEntry]) -> Self {
        Self {
            name: name.into(),
            table: ArcSwap::from_pointee(HostTable::build(entries)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the whole table.
    pub fn reload(&self, entries: &[HostEntry]) {
        self.table.store(Arc::new(HostTable::build(entries)));
        tracing::info!(hosts = %self.name, entries = entries.len(), "host table reloaded");
    }

    /// Number of exact plus suffix names currently mapped
    pub fn len(&self) -> usize {
        let table = self.table.load();
        table.exact.len() + table.suffix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HostMapper for StaticHostMapper {
    async fn lookup(&self, network: &str, host: &str) -> Vec<IpAddr> {
        let family = IpFamily::from_network(network).unwrap_or(IpFamily::Any);
        let ips = self.table.load().lookup(host, family);

        if !ips.is_empty() {
            tracing::debug!(hosts = %self.name, host, ?ips, "host mapper hit");
        }
        ips
    }
}
