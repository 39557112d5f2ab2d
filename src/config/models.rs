//! Configuration data structures for hopgate.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files.
//! Every top-level section is a list of named objects; objects refer to each
//! other by name and the builder wires them together. Defaults keep minimal
//! configs concise.
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout() -> String {
    "10s".to_string()
}

fn default_dial_timeout() -> String {
    "10s".to_string()
}

fn default_udp_idle_timeout() -> String {
    "60s".to_string()
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_drain_timeout() -> String {
    "30s".to_string()
}

fn default_limiter_gc_interval() -> String {
    "60s".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stderr".to_string()
}

/// Root configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub services: Vec<ServiceConfig>,
    pub chains: Vec<ChainConfig>,
    pub hops: Vec<HopConfig>,
    pub bypasses: Vec<BypassConfig>,
    pub admissions: Vec<AdmissionConfig>,
    pub resolvers: Vec<ResolverConfig>,
    pub hosts: Vec<HostsConfig>,
    /// Traffic limiters
    pub limiters: Vec<TrafficLimiterConfig>,
    /// Connection limiters
    pub climiters: Vec<ConnLimiterConfig>,
    /// Rate limiters
    pub rlimiters: Vec<RateLimiterConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
}

impl Config {
    /// Merge `other` into `self`: lists are concatenated (self first) and
    /// `other`'s scalar sections win when present.
    pub fn merge(mut self, other: Config) -> Config {
        self.services.extend(other.services);
        self.chains.extend(other.chains);
        self.hops.extend(other.hops);
        self.bypasses.extend(other.bypasses);
        self.admissions.extend(other.admissions);
        self.resolvers.extend(other.resolvers);
        self.hosts.extend(other.hosts);
        self.limiters.extend(other.limiters);
        self.climiters.extend(other.climiters);
        self.rlimiters.extend(other.rlimiters);
        if other.log.is_some() {
            self.log = other.log;
        }
        if other.runtime.is_some() {
            self.runtime = other.runtime;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// How an inbound listener learns the destination.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    /// iptables REDIRECT; destination from `SO_ORIGINAL_DST`
    #[default]
    Redirect,
    /// TPROXY; destination is the local address of the accepted socket.
    /// UDP services always intercept this way, whichever of the two is set
    Tproxy,
    /// Fixed destination given by `target`
    Forward,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    #[serde(rename = "type")]
    pub kind: ListenerKind,
    /// Destination for `forward` listeners
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DialerConfig {
    /// `SO_MARK` applied to outgoing sockets (Linux only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark: Option<u32>,
    /// Deadline for each resolve/connect step of a route
    pub timeout: String,
    /// A UDP flow ends after this long without a datagram, on the client
    /// session and on the upstream socket alike
    pub udp_idle_timeout: String,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            mark: None,
            timeout: default_dial_timeout(),
            udp_idle_timeout: default_udp_idle_timeout(),
        }
    }
}

/// One listening service
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    /// Listen address, `host:port`
    pub addr: String,
    /// `tcp` (also `tcp4`, `tcp6`) or `udp` (also `udp4`, `udp6`)
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub dialer: DialerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bypasses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub climiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rlimiter: Option<String>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            network: default_network(),
            listener: ListenerConfig::default(),
            dialer: DialerConfig::default(),
            chain: None,
            bypasses: Vec::new(),
            admission: None,
            resolver: None,
            hosts: None,
            limiter: None,
            climiter: None,
            rlimiter: None,
        }
    }
}

/// Ordered list of steps; each names a hop or another chain
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChainConfig {
    pub name: String,
    #[serde(default)]
    pub hops: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectStrategy {
    /// Declared order (failover)
    Ordered,
    #[default]
    RoundRobin,
    /// Random, weighted by node weight
    Random,
    /// Fewest consecutive failures
    Health,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SelectorConfig {
    pub strategy: SelectStrategy,
    /// Failures in a row before a node is skipped; 0 disables marking
    pub max_fails: u32,
    /// How long a marked node is skipped
    pub fail_timeout: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            strategy: SelectStrategy::default(),
            max_fails: default_max_fails(),
            fail_timeout: default_fail_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HopConfig {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bypasses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<String>,
}

/// Protocol spoken to a node
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    /// HTTP CONNECT proxy
    #[default]
    Http,
    /// Plain TCP relay that forwards to a fixed upstream
    Forward,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ConnectorConfig {
    #[serde(rename = "type")]
    pub kind: ConnectorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NodeConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bypasses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub climiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rlimiter: Option<String>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            connector: ConnectorConfig::default(),
            weight: default_weight(),
            bypasses: Vec::new(),
            admission: None,
            resolver: None,
            hosts: None,
            limiter: None,
            climiter: None,
            rlimiter: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BypassConfig {
    pub name: String,
    #[serde(default)]
    pub matchers: Vec<String>,
    /// Invert: listed destinations are the only ones NOT bypassed
    #[serde(default)]
    pub whitelist: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AdmissionConfig {
    pub name: String,
    #[serde(default)]
    pub matchers: Vec<String>,
    /// Listed clients are the only ones admitted
    #[serde(default)]
    pub whitelist: bool,
    /// When non-empty, only these identities are admitted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    #[default]
    System,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreferFamily {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResolverConfig {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ResolverKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer: Option<PreferFamily>,
    /// Cache positive answers for this long (humantime)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    /// Only answer for these domain suffixes; others pass through
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HostMappingConfig {
    pub ip: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HostsConfig {
    pub name: String,
    #[serde(default)]
    pub mappings: Vec<HostMappingConfig>,
}

/// Scope a limiter keys its state by
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitBy {
    #[default]
    Global,
    Client,
    Identity,
    Node,
}

/// What to do when the scope key cannot be derived
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RateLimiterConfig {
    pub name: String,
    #[serde(default)]
    pub by: LimitBy,
    pub requests: u64,
    pub period: String,
    /// Wait for capacity instead of rejecting
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub on_missing_key: MissingKeyPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConnLimiterConfig {
    pub name: String,
    #[serde(default)]
    pub by: LimitBy,
    pub limit: usize,
    #[serde(default)]
    pub on_missing_key: MissingKeyPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TrafficLimiterConfig {
    pub name: String,
    #[serde(default)]
    pub by: LimitBy,
    /// Client to upstream, bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    /// Upstream to client, bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
    #[serde(default)]
    pub on_missing_key: MissingKeyPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// `stderr`, `stdout`, `none` or a file path
    pub output: String,
    /// Include timestamps
    #[serde(default = "default_true")]
    pub time: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            output: default_log_output(),
            time: true,
        }
    }
}

/// Process-wide timings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How long shutdown waits for open connections before closing them
    pub drain_timeout: String,
    /// How often idle per-key limiter state is swept
    pub limiter_gc_interval: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
            limiter_gc_interval: default_limiter_gc_interval(),
        }
    }
}
