//! `host:port` splitting and joining.
//!
//! Follows the usual socket address conventions: IPv6 literals are wrapped in
//! brackets, the host part may be empty (`:8080`), and an address without a
//! port separator is malformed.
use std::net::IpAddr;

use crate::core::error::{ForwardError, ForwardResult};

/// Split `addr` into host and port.
///
/// Either part may be empty (`"example.com:"`, `":"`); only a missing colon
/// means there is no port.
pub fn split_host_port(addr: &str) -> ForwardResult<(&str, &str)> {
    let Some(colon) = addr.rfind(':') else {
        return Err(ForwardError::malformed(addr, "missing port in address"));
    };

    let (host, rest) = if let Some(stripped) = addr.strip_prefix('[') {
        let Some(end) = stripped.find(']') else {
            return Err(ForwardError::malformed(addr, "missing ']' in address"));
        };
        // "[host]:port" - the closing bracket must be followed by the last colon
        if end + 2 != colon {
            return Err(ForwardError::malformed(addr, "missing port in address"));
        }
        let host = &stripped[..end];
        (host, &addr[colon + 1..])
    } else {
        let host = &addr[..colon];
        if host.contains(':') {
            return Err(ForwardError::malformed(addr, "too many colons in address"));
        }
        if host.contains('[') || host.contains(']') {
            return Err(ForwardError::malformed(addr, "unexpected bracket in address"));
        }
        (host, &addr[colon + 1..])
    };

    if rest.contains('[') || rest.contains(']') {
        return Err(ForwardError::malformed(addr, "unexpected bracket in address"));
    }

    Ok((host, rest))
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Join an IP address and port.
pub fn join_ip_port(ip: IpAddr, port: &str) -> String {
    join_host_port(&ip.to_string(), port)
}

/// Host part of `addr` if it carries a port, else the whole string.
pub fn host_of(addr: &str) -> &str {
    match split_host_port(addr) {
        Ok((host, _)) => host,
        Err(_) => addr.trim_start_matches('[').trim_end_matches(']'),
    }
}
