use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
};

use crate::{
    config::models::{
        ChainConfig, Config, HopConfig, ListenerKind, NodeConfig, RateLimiterConfig, ServiceConfig,
        TrafficLimiterConfig,
    },
    core::addr::split_host_port,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("{owner} refers to unknown {kind} '{name}'")]
    UnknownReference {
        owner: String,
        kind: &'static str,
        name: String,
    },

    #[error("Chain inclusion cycle: {path}")]
    CyclicChain { path: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Name indexes of every section, used to check references
struct Names<'a> {
    chains: HashMap<&'a str, &'a ChainConfig>,
    hops: HashMap<&'a str, &'a HopConfig>,
    bypasses: HashSet<&'a str>,
    admissions: HashSet<&'a str>,
    resolvers: HashSet<&'a str>,
    hosts: HashSet<&'a str>,
    limiters: HashSet<&'a str>,
    climiters: HashSet<&'a str>,
    rlimiters: HashSet<&'a str>,
}

impl<'a> Names<'a> {
    fn index(config: &'a Config) -> Self {
        Self {
            chains: config.chains.iter().map(|c| (c.name.as_str(), c)).collect(),
            hops: config.hops.iter().map(|h| (h.name.as_str(), h)).collect(),
            bypasses: config.bypasses.iter().map(|b| b.name.as_str()).collect(),
            admissions: config.admissions.iter().map(|a| a.name.as_str()).collect(),
            resolvers: config.resolvers.iter().map(|r| r.name.as_str()).collect(),
            hosts: config.hosts.iter().map(|h| h.name.as_str()).collect(),
            limiters: config.limiters.iter().map(|l| l.name.as_str()).collect(),
            climiters: config.climiters.iter().map(|l| l.name.as_str()).collect(),
            rlimiters: config.rlimiters.iter().map(|l| l.name.as_str()).collect(),
        }
    }
}

/// Expand `chain` into the ordered hop names it stands for.
///
/// A step naming a hop contributes that hop; a step naming another chain is
/// spliced in place. Unknown names and inclusion cycles are errors.
pub fn expand_chain<'a>(config: &'a Config, chain: &str) -> ValidationResult<Vec<&'a str>> {
    let names = Names::index(config);
    let mut hops = Vec::new();
    let mut stack = Vec::new();
    expand(&names, chain, &mut stack, &mut hops)?;
    Ok(hops)
}

fn expand<'a>(
    names: &Names<'a>,
    chain: &str,
    stack: &mut Vec<String>,
    out: &mut Vec<&'a str>,
) -> ValidationResult<()> {
    let Some(config) = names.chains.get(chain) else {
        return Err(ValidationError::UnknownReference {
            owner: "service".to_string(),
            kind: "chain",
            name: chain.to_string(),
        });
    };
    if stack.iter().any(|seen| seen == chain) {
        let mut path = stack.clone();
        path.push(chain.to_string());
        return Err(ValidationError::CyclicChain {
            path: path.join(" -> "),
        });
    }
    stack.push(chain.to_string());

    for step in &config.hops {
        if let Some(hop) = names.hops.get(step.as_str()) {
            out.push(hop.name.as_str());
        } else if names.chains.contains_key(step.as_str()) {
            expand(names, step, stack, out)?;
        } else {
            return Err(ValidationError::UnknownReference {
                owner: format!("chain '{chain}'"),
                kind: "hop or chain",
                name: step.clone(),
            });
        }
    }

    stack.pop();
    Ok(())
}

/// Configuration validator collecting every problem it finds
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire configuration
    pub fn validate(config: &Config) -> ValidationResult<()> {
        let mut errors = Vec::new();
        let names = Names::index(config);

        Self::check_unique(config, &mut errors);

        for service in &config.services {
            Self::validate_service(service, &names, &mut errors);
        }
        for hop in &config.hops {
            Self::validate_hop(hop, &names, &mut errors);
        }
        for chain in &config.chains {
            let mut stack = Vec::new();
            let mut hops = Vec::new();
            if let Err(e) = expand(&names, &chain.name, &mut stack, &mut hops) {
                errors.push(e);
            }
        }
        for limiter in &config.rlimiters {
            Self::validate_rate_limiter(limiter, &mut errors);
        }
        for limiter in &config.climiters {
            if limiter.limit == 0 {
                errors.push(invalid(
                    format!("climiters.{}.limit", limiter.name),
                    "must be greater than 0",
                ));
            }
        }
        for limiter in &config.limiters {
            Self::validate_traffic_limiter(limiter, &mut errors);
        }
        for resolver in &config.resolvers {
            if let Some(ttl) = &resolver.ttl {
                check_duration(&format!("resolvers.{}.ttl", resolver.name), ttl, &mut errors);
            }
        }
        if let Some(runtime) = &config.runtime {
            check_duration("runtime.drain_timeout", &runtime.drain_timeout, &mut errors);
            match humantime::parse_duration(&runtime.limiter_gc_interval) {
                Ok(every) if every.is_zero() => errors.push(invalid(
                    "runtime.limiter_gc_interval".to_string(),
                    "must be greater than 0",
                )),
                Ok(_) => {}
                Err(e) => errors.push(invalid(
                    "runtime.limiter_gc_interval".to_string(),
                    format!("'{}': {e}", runtime.limiter_gc_interval),
                )),
            }
        }
        for hosts in &config.hosts {
            for mapping in &hosts.mappings {
                if mapping.ip.parse::<IpAddr>().is_err() {
                    errors.push(invalid(
                        format!("hosts.{}.mappings", hosts.name),
                        format!("'{}' is not an IP address", mapping.ip),
                    ));
                }
                if mapping.hostname.is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: format!("hosts.{}.mappings.hostname", hosts.name),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn check_unique(config: &Config, errors: &mut Vec<ValidationError>) {
        fn dup<'a>(
            kind: &'static str,
            names: impl Iterator<Item = &'a str>,
            errors: &mut Vec<ValidationError>,
        ) {
            let mut seen = HashSet::new();
            for name in names {
                if name.is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: format!("{kind}.name"),
                    });
                } else if !seen.insert(name) {
                    errors.push(ValidationError::DuplicateName {
                        kind,
                        name: name.to_string(),
                    });
                }
            }
        }

        dup("service", config.services.iter().map(|s| s.name.as_str()), errors);
        // chain steps may name either, so the two share one namespace
        dup(
            "chain/hop",
            config
                .chains
                .iter()
                .map(|c| c.name.as_str())
                .chain(config.hops.iter().map(|h| h.name.as_str())),
            errors,
        );
        dup("bypass", config.bypasses.iter().map(|b| b.name.as_str()), errors);
        dup("admission", config.admissions.iter().map(|a| a.name.as_str()), errors);
        dup("resolver", config.resolvers.iter().map(|r| r.name.as_str()), errors);
        dup("hosts", config.hosts.iter().map(|h| h.name.as_str()), errors);
        dup("limiter", config.limiters.iter().map(|l| l.name.as_str()), errors);
        dup("climiter", config.climiters.iter().map(|l| l.name.as_str()), errors);
        dup("rlimiter", config.rlimiters.iter().map(|l| l.name.as_str()), errors);
    }

    fn validate_service(service: &ServiceConfig, names: &Names<'_>, errors: &mut Vec<ValidationError>) {
        let owner = format!("service '{}'", service.name);

        if split_host_port(&service.addr).is_err() {
            errors.push(invalid(
                format!("services.{}.addr", service.name),
                format!("'{}' is not host:port", service.addr),
            ));
        }
        let udp = service.network.starts_with("udp");
        if !matches!(
            service.network.as_str(),
            "tcp" | "tcp4" | "tcp6" | "udp" | "udp4" | "udp6"
        ) {
            errors.push(invalid(
                format!("services.{}.network", service.name),
                format!("unsupported network '{}'", service.network),
            ));
        }
        if udp && service.listener.kind == ListenerKind::Forward {
            errors.push(invalid(
                format!("services.{}.listener.type", service.name),
                "UDP services intercept with TPROXY and take no forward target".to_string(),
            ));
        }
        if service.listener.kind == ListenerKind::Forward {
            match &service.listener.target {
                Some(target) if split_host_port(target).is_ok() => {}
                Some(target) => errors.push(invalid(
                    format!("services.{}.listener.target", service.name),
                    format!("'{target}' is not host:port"),
                )),
                None => errors.push(ValidationError::MissingField {
                    field: format!("services.{}.listener.target", service.name),
                }),
            }
        }
        check_duration(
            &format!("services.{}.dialer.timeout", service.name),
            &service.dialer.timeout,
            errors,
        );
        check_duration(
            &format!("services.{}.dialer.udp_idle_timeout", service.name),
            &service.dialer.udp_idle_timeout,
            errors,
        );

        if let Some(chain) = &service.chain {
            if !names.chains.contains_key(chain.as_str()) {
                errors.push(unknown(&owner, "chain", chain));
            }
        }
        for bypass in &service.bypasses {
            check_ref(&owner, "bypass", bypass, &names.bypasses, errors);
        }
        check_opt_ref(&owner, "admission", &service.admission, &names.admissions, errors);
        check_opt_ref(&owner, "resolver", &service.resolver, &names.resolvers, errors);
        check_opt_ref(&owner, "hosts", &service.hosts, &names.hosts, errors);
        check_opt_ref(&owner, "limiter", &service.limiter, &names.limiters, errors);
        check_opt_ref(&owner, "climiter", &service.climiter, &names.climiters, errors);
        check_opt_ref(&owner, "rlimiter", &service.rlimiter, &names.rlimiters, errors);
    }

    fn validate_hop(hop: &HopConfig, names: &Names<'_>, errors: &mut Vec<ValidationError>) {
        let owner = format!("hop '{}'", hop.name);

        check_duration(
            &format!("hops.{}.selector.fail_timeout", hop.name),
            &hop.selector.fail_timeout,
            errors,
        );
        for bypass in &hop.bypasses {
            check_ref(&owner, "bypass", bypass, &names.bypasses, errors);
        }
        check_opt_ref(&owner, "resolver", &hop.resolver, &names.resolvers, errors);
        check_opt_ref(&owner, "hosts", &hop.hosts, &names.hosts, errors);

        let mut seen = HashSet::new();
        for node in &hop.nodes {
            if !seen.insert(node.name.as_str()) {
                errors.push(ValidationError::DuplicateName {
                    kind: "node",
                    name: format!("{}/{}", hop.name, node.name),
                });
            }
            Self::validate_node(&hop.name, node, names, errors);
        }
    }

    fn validate_node(hop: &str, node: &NodeConfig, names: &Names<'_>, errors: &mut Vec<ValidationError>) {
        let owner = format!("node '{hop}/{}'", node.name);

        match split_host_port(&node.addr) {
            Ok((host, _)) if !host.is_empty() => {}
            _ => errors.push(invalid(
                format!("hops.{hop}.nodes.{}.addr", node.name),
                format!("'{}' is not host:port", node.addr),
            )),
        }
        for bypass in &node.bypasses {
            check_ref(&owner, "bypass", bypass, &names.bypasses, errors);
        }
        check_opt_ref(&owner, "admission", &node.admission, &names.admissions, errors);
        check_opt_ref(&owner, "resolver", &node.resolver, &names.resolvers, errors);
        check_opt_ref(&owner, "hosts", &node.hosts, &names.hosts, errors);
        check_opt_ref(&owner, "limiter", &node.limiter, &names.limiters, errors);
        check_opt_ref(&owner, "climiter", &node.climiter, &names.climiters, errors);
        check_opt_ref(&owner, "rlimiter", &node.rlimiter, &names.rlimiters, errors);
    }

    fn validate_rate_limiter(limiter: &RateLimiterConfig, errors: &mut Vec<ValidationError>) {
        if limiter.requests == 0 || limiter.requests > u64::from(u32::MAX) {
            errors.push(invalid(
                format!("rlimiters.{}.requests", limiter.name),
                "must be between 1 and 4294967295",
            ));
        }
        match humantime::parse_duration(&limiter.period) {
            Ok(period) if period.is_zero() => errors.push(invalid(
                format!("rlimiters.{}.period", limiter.name),
                "must be greater than 0",
            )),
            Ok(_) => {}
            Err(e) => errors.push(invalid(
                format!("rlimiters.{}.period", limiter.name),
                format!("'{}': {e}", limiter.period),
            )),
        }
    }

    fn validate_traffic_limiter(limiter: &TrafficLimiterConfig, errors: &mut Vec<ValidationError>) {
        if limiter.input.is_none() && limiter.output.is_none() {
            errors.push(ValidationError::MissingField {
                field: format!("limiters.{}.input|output", limiter.name),
            });
        }
        for (field, rate) in [("input", limiter.input), ("output", limiter.output)] {
            if rate.is_some_and(|rate| rate == 0 || rate > u64::from(u32::MAX)) {
                errors.push(invalid(
                    format!("limiters.{}.{field}", limiter.name),
                    "must be between 1 and 4294967295 bytes per second",
                ));
            }
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

fn invalid(field: String, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        field,
        message: message.into(),
    }
}

fn unknown(owner: &str, kind: &'static str, name: &str) -> ValidationError {
    ValidationError::UnknownReference {
        owner: owner.to_string(),
        kind,
        name: name.to_string(),
    }
}

fn check_ref(owner: &str, kind: &'static str, name: &str, known: &HashSet<&str>, errors: &mut Vec<ValidationError>) {
    if !known.contains(name) {
        errors.push(unknown(owner, kind, name));
    }
}

fn check_opt_ref(
    owner: &str,
    kind: &'static str,
    name: &Option<String>,
    known: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(name) = name {
        check_ref(owner, kind, name, known, errors);
    }
}

fn check_duration(field: &str, value: &str, errors: &mut Vec<ValidationError>) {
    if let Err(e) = humantime::parse_duration(value) {
        errors.push(invalid(field.to_string(), format!("'{value}': {e}")));
    }
}
