//! Name-indexed lookup of built components.
//!
//! Registries are filled once by the builder, in dependency order, and then
//! shared read-only behind an `Arc`.
use std::{collections::HashMap, fmt, sync::Arc};

use crate::core::{
    admission::Admission,
    bypass::Bypass,
    chain::Chain,
    hop::Hop,
    hosts::StaticHostMapper,
    limiter::{ConnLimiter, RateLimiter, TrafficLimiter},
    resolver::Resolver,
    service::Service,
};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{kind} '{name}' is already registered")]
    Duplicate { kind: &'static str, name: String },
    #[error("{kind} name must not be empty")]
    EmptyName { kind: &'static str },
}

/// Components of one role, by name, in registration order.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    items: HashMap<String, Arc<T>>,
    order: Vec<String>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, name: &str, item: Arc<T>) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName { kind: self.kind });
        }
        if self.items.contains_key(name) {
            return Err(RegistryError::Duplicate {
                kind: self.kind,
                name: name.to_string(),
            });
        }
        self.items.insert(name.to_string(), item);
        self.order.push(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.items.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    /// Every component, in registration order
    pub fn get_all(&self) -> Vec<(&str, Arc<T>)> {
        self.order
            .iter()
            .filter_map(|name| self.items.get(name).map(|item| (name.as_str(), item.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.order)
            .finish()
    }
}

/// One registry per component role.
#[derive(Debug)]
pub struct Registries {
    pub admissions: Registry<dyn Admission>,
    pub bypasses: Registry<dyn Bypass>,
    pub resolvers: Registry<dyn Resolver>,
    /// Concrete type so the tables can be reloaded in place
    pub hosts: Registry<StaticHostMapper>,
    pub limiters: Registry<TrafficLimiter>,
    pub climiters: Registry<ConnLimiter>,
    pub rlimiters: Registry<RateLimiter>,
    pub hops: Registry<Hop>,
    pub chains: Registry<Chain>,
    pub services: Registry<Service>,
}

impl Registries {
    pub fn new() -> Self {
        Self {
            admissions: Registry::new("admission"),
            bypasses: Registry::new("bypass"),
            resolvers: Registry::new("resolver"),
            hosts: Registry::new("hosts"),
            limiters: Registry::new("limiter"),
            climiters: Registry::new("climiter"),
            rlimiters: Registry::new("rlimiter"),
            hops: Registry::new("hop"),
            chains: Registry::new("chain"),
            services: Registry::new("service"),
        }
    }

    /// Drop idle per-key state from every rate and traffic limiter.
    pub fn retain_recent_limiters(&self) {
        for (_, limiter) in self.rlimiters.get_all() {
            limiter.retain_recent();
        }
        for (_, limiter) in self.limiters.get_all() {
            limiter.retain_recent();
        }
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hosts::HostEntry;

    #[test]
    fn register_rejects_duplicates() {
        let mut registry: Registry<StaticHostMapper> = Registry::new("hosts");
        registry
            .register("a", Arc::new(StaticHostMapper::new("a", &[])))
            .unwrap();
        let err = registry
            .register("a", Arc::new(StaticHostMapper::new("a", &[])))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Duplicate {
                kind: "hosts",
                name: "a".into()
            }
        );
        assert_eq!(err.to_string(), "hosts 'a' is already registered");
        assert!(matches!(
            registry.register("", Arc::new(StaticHostMapper::new("", &[]))),
            Err(RegistryError::EmptyName { .. })
        ));
    }

    #[test]
    fn get_all_keeps_registration_order() {
        let mut registry: Registry<StaticHostMapper> = Registry::new("hosts");
        for name in ["z", "a", "m"] {
            let entries = [HostEntry {
                hostname: format!("{name}.test"),
                ip: "127.0.0.1".parse().unwrap(),
            }];
            registry
                .register(name, Arc::new(StaticHostMapper::new(name, &entries)))
                .unwrap();
        }
        let names: Vec<_> = registry.get_all().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["z", "a", "m"]);
        assert_eq!(registry.get("a").unwrap().len(), 1);
        assert!(registry.get("missing").is_none());
    }
}
