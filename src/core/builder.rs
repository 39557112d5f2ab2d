//! Turns a validated [`Config`] into live components.
//!
//! Components are registered in dependency order (admissions, bypasses,
//! resolvers, hosts, limiters, hops, chains, services) so every reference
//! can be looked up by name once its target is built. Transport concerns
//! (sockets, proxy handshakes, listeners) come from a [`TransportFactory`].
use std::{net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{
        models::{
            Config, DialerConfig, HopConfig, HostsConfig, NodeConfig,
            ServiceConfig,
        },
        validation::{ConfigValidator, expand_chain},
    },
    core::{
        admission::{Admission, MatcherAdmission},
        bypass::{Bypass, BypassGroup, MatcherBypass},
        chain::Chain,
        hop::Hop,
        hosts::{HostEntry, HostMapper, StaticHostMapper},
        limiter::{ConnLimiter, LimiterSet, RateLimiter, TrafficLimiter},
        node::Node,
        registry::{Registries, Registry},
        resolver::{Resolver, ResolverFactory},
        router::Router,
        selector::SelectorFactory,
        service::Service,
    },
    ports::{Connector, Dialer, Listener},
};

/// Creates the transport-facing pieces of services and nodes.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn dialer(&self, config: &DialerConfig) -> Result<Arc<dyn Dialer>>;

    fn connector(&self, node: &NodeConfig) -> Result<Arc<dyn Connector>>;

    /// Bind the listener of `service`.
    async fn listen(&self, service: &ServiceConfig) -> Result<Arc<dyn Listener>>;
}

/// Expand a hosts section into individual entries (hostname plus aliases).
pub fn host_entries(config: &HostsConfig) -> Result<Vec<HostEntry>> {
    let mut entries = Vec::new();
    for mapping in &config.mappings {
        let ip: IpAddr = mapping
            .ip
            .parse()
            .map_err(|e| eyre!("hosts {}: invalid IP '{}': {e}", config.name, mapping.ip))?;
        for hostname in std::iter::once(&mapping.hostname).chain(&mapping.aliases) {
            entries.push(HostEntry {
                hostname: hostname.clone(),
                ip,
            });
        }
    }
    Ok(entries)
}

/// Build every component described by `config`.
///
/// Services are created but not started; their connections are children of
/// `shutdown`.
pub async fn build(
    config: &Config,
    transport: &dyn TransportFactory,
    shutdown: &CancellationToken,
) -> Result<Registries> {
    ConfigValidator::validate(config).wrap_err("Invalid configuration")?;

    let mut registries = Registries::new();

    for cfg in &config.admissions {
        let admission = MatcherAdmission::from_config(cfg).map_err(|e| eyre!(e))?;
        registries
            .admissions
            .register(&cfg.name, Arc::new(admission) as Arc<dyn Admission>)?;
    }
    for cfg in &config.bypasses {
        let bypass = MatcherBypass::from_config(cfg).map_err(|e| eyre!(e))?;
        registries
            .bypasses
            .register(&cfg.name, Arc::new(bypass) as Arc<dyn Bypass>)?;
    }
    for cfg in &config.resolvers {
        let resolver = ResolverFactory::create(cfg).map_err(|e| eyre!(e))?;
        registries.resolvers.register(&cfg.name, resolver)?;
    }
    for cfg in &config.hosts {
        let mapper = StaticHostMapper::new(cfg.name.clone(), &host_entries(cfg)?);
        tracing::info!("Creating hosts: name={}, names={}", cfg.name, mapper.len());
        registries.hosts.register(&cfg.name, Arc::new(mapper))?;
    }
    for cfg in &config.limiters {
        let limiter = TrafficLimiter::new(cfg).map_err(|e| eyre!(e))?;
        registries.limiters.register(&cfg.name, Arc::new(limiter))?;
    }
    for cfg in &config.climiters {
        let limiter = ConnLimiter::new(cfg).map_err(|e| eyre!(e))?;
        registries.climiters.register(&cfg.name, Arc::new(limiter))?;
    }
    for cfg in &config.rlimiters {
        let limiter = RateLimiter::new(cfg).map_err(|e| eyre!(e))?;
        registries.rlimiters.register(&cfg.name, Arc::new(limiter))?;
    }

    for cfg in &config.hops {
        let hop = build_hop(cfg, &registries, transport)
            .wrap_err_with(|| format!("Failed to build hop '{}'", cfg.name))?;
        registries.hops.register(&cfg.name, Arc::new(hop))?;
    }
    for cfg in &config.chains {
        let hops = expand_chain(config, &cfg.name)?
            .into_iter()
            .map(|name| lookup(&registries.hops, name))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!("Creating chain: name={}, hops={}", cfg.name, hops.len());
        registries
            .chains
            .register(&cfg.name, Arc::new(Chain::new(cfg.name.clone(), hops)))?;
    }

    for cfg in &config.services {
        let service = build_service(cfg, &registries, transport, shutdown)
            .await
            .wrap_err_with(|| format!("Failed to build service '{}'", cfg.name))?;
        registries.services.register(&cfg.name, Arc::new(service))?;
    }

    Ok(registries)
}

/// Swap in the host tables of `config` for every hosts section already built.
///
/// Returns how many tables were replaced. Sections added since the build are
/// skipped because nothing refers to them yet.
pub fn reload_hosts(registries: &Registries, config: &Config) -> Result<usize> {
    let mut reloaded = 0;
    for cfg in &config.hosts {
        match registries.hosts.get(&cfg.name) {
            Some(mapper) => {
                mapper.reload(&host_entries(cfg)?);
                reloaded += 1;
            }
            None => tracing::warn!(hosts = %cfg.name, "new hosts section ignored until restart"),
        }
    }
    Ok(reloaded)
}

/// Periodically drop idle per-key state from the rate and traffic limiters
/// until `shutdown` fires.
pub fn spawn_limiter_maintenance(
    registries: Arc<Registries>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    registries.retain_recent_limiters();
                    tracing::trace!("limiter state pruned");
                }
            }
        }
    })
}

fn lookup<T: ?Sized>(registry: &Registry<T>, name: &str) -> Result<Arc<T>> {
    registry
        .get(name)
        .ok_or_else(|| eyre!("unknown {} '{}'", registry.kind(), name))
}

fn lookup_opt<T: ?Sized>(registry: &Registry<T>, name: &Option<String>) -> Result<Option<Arc<T>>> {
    name.as_deref().map(|name| lookup(registry, name)).transpose()
}

fn bypass_group(registries: &Registries, names: &[String]) -> Result<Option<Arc<dyn Bypass>>> {
    let members = names
        .iter()
        .map(|name| lookup(&registries.bypasses, name))
        .collect::<Result<Vec<_>>>()?;
    Ok(BypassGroup::combine(members))
}

fn hosts_ref(registries: &Registries, name: &Option<String>) -> Result<Option<Arc<dyn HostMapper>>> {
    Ok(lookup_opt(&registries.hosts, name)?.map(|hosts| hosts as Arc<dyn HostMapper>))
}

fn resolver_ref(registries: &Registries, name: &Option<String>) -> Result<Option<Arc<dyn Resolver>>> {
    lookup_opt(&registries.resolvers, name)
}

fn limiter_set(
    registries: &Registries,
    rate: &Option<String>,
    conn: &Option<String>,
    traffic: &Option<String>,
) -> Result<LimiterSet> {
    Ok(LimiterSet::new(
        lookup_opt(&registries.rlimiters, rate)?.into_iter().collect(),
        lookup_opt(&registries.climiters, conn)?.into_iter().collect(),
        lookup_opt(&registries.limiters, traffic)?.into_iter().collect(),
    ))
}

fn build_hop(cfg: &HopConfig, registries: &Registries, transport: &dyn TransportFactory) -> Result<Hop> {
    let nodes = cfg
        .nodes
        .iter()
        .map(|node| build_node(node, registries, transport).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;
    let selector = SelectorFactory::create(&cfg.selector).map_err(|e| eyre!(e))?;

    tracing::info!(
        "Creating hop: name={}, nodes={}, strategy={:?}",
        cfg.name,
        nodes.len(),
        cfg.selector.strategy
    );
    Ok(Hop::new(cfg.name.clone(), nodes, selector)
        .with_bypass(bypass_group(registries, &cfg.bypasses)?)
        .with_resolver(resolver_ref(registries, &cfg.resolver)?)
        .with_hosts(hosts_ref(registries, &cfg.hosts)?))
}

fn build_node(cfg: &NodeConfig, registries: &Registries, transport: &dyn TransportFactory) -> Result<Node> {
    let connector = transport
        .connector(cfg)
        .wrap_err_with(|| format!("node '{}'", cfg.name))?;
    Ok(Node::new(cfg.name.clone(), cfg.addr.clone(), connector)
        .with_weight(cfg.weight)
        .with_bypass(bypass_group(registries, &cfg.bypasses)?)
        .with_admission(lookup_opt(&registries.admissions, &cfg.admission)?)
        .with_resolver(resolver_ref(registries, &cfg.resolver)?)
        .with_hosts(hosts_ref(registries, &cfg.hosts)?)
        .with_limiters(limiter_set(registries, &cfg.rlimiter, &cfg.climiter, &cfg.limiter)?))
}

async fn build_service(
    cfg: &ServiceConfig,
    registries: &Registries,
    transport: &dyn TransportFactory,
    shutdown: &CancellationToken,
) -> Result<Service> {
    let dial_timeout = humantime::parse_duration(&cfg.dialer.timeout)
        .wrap_err_with(|| format!("Invalid dialer timeout '{}'", cfg.dialer.timeout))?;

    let router = Router::new(transport.dialer(&cfg.dialer)?)
        .with_chain(lookup_opt(&registries.chains, &cfg.chain)?)
        .with_resolver(resolver_ref(registries, &cfg.resolver)?)
        .with_hosts(hosts_ref(registries, &cfg.hosts)?)
        .with_bypass(bypass_group(registries, &cfg.bypasses)?)
        .with_admission(lookup_opt(&registries.admissions, &cfg.admission)?)
        .with_limiters(limiter_set(registries, &cfg.rlimiter, &cfg.climiter, &cfg.limiter)?)
        .with_dial_timeout((dial_timeout > Duration::ZERO).then_some(dial_timeout));

    let listener = transport.listen(cfg).await?;
    tracing::info!(
        "Creating service: name={}, addr={}, listener={:?}, chain={}",
        cfg.name,
        cfg.addr,
        cfg.listener.kind,
        cfg.chain.as_deref().unwrap_or("-")
    );
    Ok(Service::new(
        &cfg.name,
        &cfg.network,
        listener,
        Arc::new(router),
        shutdown,
    ))
}

#[cfg(test)]
mod tests {
    use std::{io, net::SocketAddr};

    use super::*;
    use crate::{
        config::models::{ChainConfig, HostMappingConfig, SelectorConfig},
        ports::{Accepted, BoxedStream},
    };

    struct StubTransport;

    struct Refuse;

    #[async_trait]
    impl Dialer for Refuse {
        async fn dial(&self, _network: &str, _address: &str) -> io::Result<BoxedStream> {
            Err(io::ErrorKind::ConnectionRefused.into())
        }
    }

    #[async_trait]
    impl Connector for Refuse {
        async fn connect(&self, _s: BoxedStream, _n: &str, _a: &str) -> io::Result<BoxedStream> {
            Err(io::ErrorKind::ConnectionRefused.into())
        }

        fn kind(&self) -> &'static str {
            "refuse"
        }
    }

    struct Idle;

    #[async_trait]
    impl Listener for Idle {
        async fn accept(&self) -> io::Result<Accepted> {
            std::future::pending().await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:1".parse().unwrap())
        }
    }

    #[async_trait]
    impl TransportFactory for StubTransport {
        fn dialer(&self, _config: &DialerConfig) -> Result<Arc<dyn Dialer>> {
            Ok(Arc::new(Refuse))
        }

        fn connector(&self, _node: &NodeConfig) -> Result<Arc<dyn Connector>> {
            Ok(Arc::new(Refuse))
        }

        async fn listen(&self, _service: &ServiceConfig) -> Result<Arc<dyn Listener>> {
            Ok(Arc::new(Idle))
        }
    }

    fn hop(name: &str) -> HopConfig {
        HopConfig {
            name: name.into(),
            nodes: vec![NodeConfig::new(format!("{name}-node"), "10.0.0.1:3128")],
            selector: SelectorConfig::default(),
            bypasses: vec![],
            resolver: None,
            hosts: None,
        }
    }

    fn sample() -> Config {
        let mut service = ServiceConfig::new("svc", "127.0.0.1:0");
        service.chain = Some("outer".into());
        service.hosts = Some("local".into());
        Config {
            services: vec![service],
            chains: vec![
                ChainConfig {
                    name: "inner".into(),
                    hops: vec!["b".into(), "c".into()],
                },
                ChainConfig {
                    name: "outer".into(),
                    hops: vec!["a".into(), "inner".into()],
                },
            ],
            hops: vec![hop("a"), hop("b"), hop("c")],
            hosts: vec![HostsConfig {
                name: "local".into(),
                mappings: vec![HostMappingConfig {
                    ip: "10.9.9.9".into(),
                    hostname: "svc.internal".into(),
                    aliases: vec!["alias.internal".into()],
                }],
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn build_registers_everything_in_order() {
        let registries = build(&sample(), &StubTransport, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(registries.hops.len(), 3);
        let outer = registries.chains.get("outer").unwrap();
        let names: Vec<_> = outer.hops().iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let service = registries.services.get("svc").unwrap();
        assert_eq!(service.router().chain().unwrap().name(), "outer");
        assert_eq!(registries.hosts.get("local").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn build_rejects_invalid_config() {
        let mut config = sample();
        config.services[0].chain = Some("missing".into());
        let err = build(&config, &StubTransport, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("unknown chain 'missing'"), "{err:#}");
    }

    #[tokio::test]
    async fn reload_hosts_replaces_tables() {
        let mut config = sample();
        let registries = build(&config, &StubTransport, &CancellationToken::new())
            .await
            .unwrap();
        let mapper = registries.hosts.get("local").unwrap();
        assert_eq!(
            mapper.lookup("ip", "svc.internal").await,
            vec!["10.9.9.9".parse::<IpAddr>().unwrap()]
        );

        config.hosts[0].mappings[0].ip = "10.8.8.8".into();
        config.hosts.push(HostsConfig {
            name: "added-later".into(),
            mappings: vec![],
        });
        assert_eq!(reload_hosts(&registries, &config).unwrap(), 1);
        assert_eq!(
            mapper.lookup("ip", "alias.internal").await,
            vec!["10.8.8.8".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn limiter_maintenance_prunes_until_shutdown() {
        use crate::{
            config::models::{LimitBy, MissingKeyPolicy, RateLimiterConfig},
            core::limiter::LimitContext,
        };

        let limiter = Arc::new(
            RateLimiter::new(&RateLimiterConfig {
                name: "per-client".into(),
                by: LimitBy::Client,
                requests: 1,
                period: "20ms".into(),
                wait: false,
                on_missing_key: MissingKeyPolicy::Allow,
            })
            .unwrap(),
        );
        let mut registries = Registries::new();
        registries.rlimiters.register("per-client", limiter.clone()).unwrap();
        for i in 1..=10u8 {
            let ctx = LimitContext {
                client: Some(IpAddr::from([10, 0, 0, i])),
                ..Default::default()
            };
            assert!(limiter.allow(&ctx));
        }
        assert_eq!(limiter.tracked_keys(), 10);

        let shutdown = CancellationToken::new();
        let task = spawn_limiter_maintenance(
            Arc::new(registries),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(limiter.tracked_keys(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
