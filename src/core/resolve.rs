//! Address resolution service: host mapper first, then the resolver.
//!
//! ```text
//! "host:port"
//!     |
//!     +-- empty address / empty host ------------> unchanged
//!     |
//!     +-- HostMapper hit ------------------------> first_ip:port
//!     |
//!     +-- Resolver
//!           +-- Invalid (opt-out) ---------------> unchanged
//!           +-- no addresses --------------------> DomainNotFound
//!           +-- addresses -----------------------> first_ip:port
//! ```
//!
//! The function keeps no state between calls. Caching belongs to resolver
//! implementations and cancellation to the caller.
use crate::core::{
    addr::{join_ip_port, split_host_port},
    error::{ForwardError, ForwardResult, ResolveError},
    hosts::HostMapper,
    resolver::Resolver,
};

/// Resolve `address` to a single `ip:port` when a mapping or resolver applies.
pub async fn resolve(
    network: &str,
    address: &str,
    resolver: Option<&dyn Resolver>,
    hosts: Option<&dyn HostMapper>,
) -> ForwardResult<String> {
    if address.is_empty() {
        return Ok(String::new());
    }

    let (host, port) = split_host_port(address)?;
    if host.is_empty() {
        return Ok(address.to_string());
    }

    if let Some(hosts) = hosts {
        let ips = hosts.lookup(network, host).await;
        if let Some(ip) = ips.first() {
            tracing::debug!("hit host mapper: {} -> {:?}", host, ips);
            return Ok(join_ip_port(*ip, port));
        }
    }

    let Some(resolver) = resolver else {
        return Ok(address.to_string());
    };

    let ips = match resolver.resolve(network, host).await {
        Ok(ips) => ips,
        Err(ResolveError::Invalid) => return Ok(address.to_string()),
        Err(ResolveError::Partial { addrs, reason, .. }) => {
            tracing::warn!(host, %reason, "resolver returned addresses with an error");
            addrs
        }
        Err(err) => {
            tracing::error!(host, error = %err, "resolve");
            Vec::new()
        }
    };

    match ips.first() {
        Some(ip) => Ok(join_ip_port(*ip, port)),
        None => Err(ForwardError::DomainNotFound(host.to_string())),
    }
}
