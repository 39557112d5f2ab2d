//! Route building and dialing.
//!
//! The [`Router`] owns the ingress policies of a service (resolver, host
//! mapper, bypass, admission, limiters) plus an optional [`Chain`]. For each
//! inbound connection it walks the chain hop by hop:
//!
//! ```text
//! Init -> ResolvingHop -> GatingNode -> Dialing -> Connected
//!              ^                |           |
//!              +--- next node --+-----------+          (recoverable failure)
//!                                               -> Failed
//! ```
//!
//! The first node is reached through the [`Dialer`]; every later node, and
//! finally the destination, is reached by asking the previous node's
//! connector to open a stream over the one already established. When a node
//! fails after the established prefix was handed to it, the prefix is dialed
//! again through the same nodes before the next candidate is tried.
use std::{
    collections::HashSet,
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        admission::{Admission, AdmissionRequest},
        bypass::{Bypass, BypassQuery},
        cancel::bounded,
        chain::{Chain, Route, RouteNode},
        error::{ForwardError, ForwardResult},
        hop::{Hop, Selection},
        hosts::HostMapper,
        limiter::{Grant, LimitContext, LimiterSet},
        node::Node,
        resolve::resolve,
        resolver::Resolver,
    },
    metrics,
    ports::{BoxedStream, Dialer},
    utils::relay::{RelayStats, relay},
};

/// Network used when resolving node addresses
const NODE_NETWORK: &str = "ip";

/// Where the route builder currently is for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPhase {
    Init,
    ResolvingHop,
    GatingNode,
    Dialing,
    Connected,
    Failed,
}

/// An inbound connection asking to be forwarded.
#[derive(Debug, Clone, Copy)]
pub struct DialRequest<'a> {
    pub network: &'a str,
    pub address: &'a str,
    pub client: Option<SocketAddr>,
    pub identity: Option<&'a str>,
}

impl<'a> DialRequest<'a> {
    pub fn new(network: &'a str, address: &'a str) -> Self {
        Self {
            network,
            address,
            client: None,
            identity: None,
        }
    }

    pub fn with_client(mut self, client: SocketAddr) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_identity(mut self, identity: &'a str) -> Self {
        self.identity = Some(identity);
        self
    }

    fn limit_context(&self) -> LimitContext<'a> {
        LimitContext {
            client: self.client.map(|c| c.ip()),
            identity: self.identity,
            node: None,
        }
    }

    fn admission_request(&self) -> AdmissionRequest<'a> {
        AdmissionRequest {
            client: self.client,
            identity: self.identity,
        }
    }
}

/// An established forward path.
///
/// Holds every limiter grant taken on the way; they are released when the
/// tunnel is dropped.
pub struct Tunnel {
    stream: BoxedStream,
    route: Route,
    destination: String,
    grant: Grant,
}

impl Tunnel {
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Destination address after resolution
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn grant(&self) -> &Grant {
        &self.grant
    }

    pub fn into_parts(self) -> (BoxedStream, Route, Grant) {
        (self.stream, self.route, self.grant)
    }

    /// Copy bytes between `inbound` and the tunnel until either side closes
    /// or `cancel` fires, debiting the tunnel's traffic budgets.
    pub async fn relay(self, inbound: BoxedStream, cancel: &CancellationToken) -> io::Result<RelayStats> {
        let Tunnel {
            stream,
            route,
            grant,
            ..
        } = self;
        let stats = relay(inbound, stream, grant.budgets(), cancel).await;
        tracing::debug!(route = %route.path(), ?stats, "relay finished");
        drop(grant);
        stats
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("route", &self.route.path())
            .field("destination", &self.destination)
            .field("grant", &self.grant)
            .finish()
    }
}

/// Ingress policies and chain of a service, and the logic to dial through them.
pub struct Router {
    chain: Option<Arc<Chain>>,
    resolver: Option<Arc<dyn Resolver>>,
    hosts: Option<Arc<dyn HostMapper>>,
    bypass: Option<Arc<dyn Bypass>>,
    admission: Option<Arc<dyn Admission>>,
    limiters: LimiterSet,
    dialer: Arc<dyn Dialer>,
    dial_timeout: Option<Duration>,
}

impl Router {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            chain: None,
            resolver: None,
            hosts: None,
            bypass: None,
            admission: None,
            limiters: LimiterSet::default(),
            dialer,
            dial_timeout: None,
        }
    }

    pub fn with_chain(mut self, chain: Option<Arc<Chain>>) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_resolver(mut self, resolver: Option<Arc<dyn Resolver>>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_hosts(mut self, hosts: Option<Arc<dyn HostMapper>>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_bypass(mut self, bypass: Option<Arc<dyn Bypass>>) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_admission(mut self, admission: Option<Arc<dyn Admission>>) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_limiters(mut self, limiters: LimiterSet) -> Self {
        self.limiters = limiters;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn chain(&self) -> Option<&Arc<Chain>> {
        self.chain.as_ref()
    }

    /// Build a route for `request` and establish the tunnel through it.
    pub async fn dial(
        &self,
        request: &DialRequest<'_>,
        cancel: &CancellationToken,
    ) -> ForwardResult<Tunnel> {
        let started = Instant::now();
        let chain_name = self.chain.as_ref().map(|c| c.name()).unwrap_or("direct");

        let result = self.dial_route(request, cancel).await;
        match &result {
            Ok(tunnel) => {
                metrics::record_route_established(chain_name, tunnel.route().len(), started.elapsed());
                tracing::debug!(
                    chain = chain_name,
                    route = %tunnel.route().path(),
                    dst = %tunnel.destination(),
                    "route established"
                );
            }
            Err(err) => {
                metrics::record_route_failure(chain_name, err.kind());
                if err.is_policy() {
                    tracing::info!(chain = chain_name, dst = request.address, "{err}");
                } else {
                    tracing::warn!(chain = chain_name, dst = request.address, "{err}");
                }
            }
        }
        result
    }

    async fn dial_route(
        &self,
        request: &DialRequest<'_>,
        cancel: &CancellationToken,
    ) -> ForwardResult<Tunnel> {
        let mut phase = DialPhase::Init;

        let admitted = self
            .admission
            .as_ref()
            .is_none_or(|a| a.admit(&request.admission_request()));
        if !admitted {
            return Err(ForwardError::AdmissionDenied("ingress".to_string()));
        }

        let destination = bounded(
            cancel,
            self.dial_timeout,
            resolve(
                request.network,
                request.address,
                self.resolver.as_deref(),
                self.hosts.as_deref(),
            ),
        )
        .await?;

        let query = BypassQuery::new(request.network, &destination).with_host(request.address);
        if self.bypass.as_ref().is_some_and(|b| b.contains(&query)) {
            return Err(ForwardError::Bypassed(request.address.to_string()));
        }

        let ctx = request.limit_context();
        let mut grant = self.limiters.acquire(&ctx, cancel).await?;

        let mut route = Route::new(self.chain.as_ref().map(|c| c.name()));
        let mut stream: Option<BoxedStream> = None;

        if let Some(chain) = &self.chain {
            for hop in chain.hops() {
                let mut tried: HashSet<String> = HashSet::new();
                let mut attempts = 0usize;

                let truncated = loop {
                    enter(&mut phase, DialPhase::GatingNode);
                    let node = match hop.select_node(&query, &ctx, &tried).await? {
                        Selection::Node(node) => node,
                        Selection::Bypassed => break true,
                        Selection::Exhausted => {
                            enter(&mut phase, DialPhase::Failed);
                            return Err(ForwardError::HopExhausted {
                                hop: hop.name().to_string(),
                                attempts,
                            });
                        }
                    };
                    tried.insert(node.name().to_string());
                    attempts += 1;

                    // A failed attempt may have consumed the prefix stream
                    if stream.is_none() && !route.is_empty() {
                        stream = Some(self.redial_prefix(&route, request.network, cancel).await?);
                    }

                    match self
                        .attempt_node(hop, &node, &route, &mut stream, request, &ctx, &mut phase, cancel)
                        .await
                    {
                        Ok((established, addr, node_grant)) => {
                            node.mark_ok();
                            grant.merge(node_grant);
                            route.push(RouteNode {
                                hop: hop.name().to_string(),
                                node,
                                addr,
                            });
                            stream = Some(established);
                            break false;
                        }
                        Err(err) if err.is_node_recoverable() => {
                            if err.is_transport_failure() {
                                node.mark_failed();
                                metrics::record_node_failure(node.name(), err.kind());
                            }
                            tracing::debug!(hop = %hop.name(), node = %node.name(), attempts, "node failed: {err}");
                        }
                        Err(err) => {
                            enter(&mut phase, DialPhase::Failed);
                            return Err(err);
                        }
                    }
                };

                if truncated {
                    tracing::debug!(hop = %hop.name(), dst = %destination, "route truncated by bypass");
                    route.truncate_here();
                    break;
                }
            }
        }

        enter(&mut phase, DialPhase::Dialing);
        let established = match route.last() {
            None => self.dial_first(request.network, &destination, cancel).await,
            Some(last) => {
                let prefix = match stream.take() {
                    Some(prefix) => prefix,
                    None => self.redial_prefix(&route, request.network, cancel).await?,
                };
                self.connect_via(&last.node, prefix, request.network, &destination, cancel)
                    .await
            }
        };
        let stream = match established {
            Ok(stream) => stream,
            Err(err) => {
                enter(&mut phase, DialPhase::Failed);
                return Err(err);
            }
        };

        enter(&mut phase, DialPhase::Connected);
        Ok(Tunnel {
            stream,
            route,
            destination,
            grant,
        })
    }

    /// Resolve, gate and connect one candidate node.
    ///
    /// On failure the node's grant is dropped before returning.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_node(
        &self,
        hop: &Hop,
        node: &Arc<Node>,
        route: &Route,
        stream: &mut Option<BoxedStream>,
        request: &DialRequest<'_>,
        ctx: &LimitContext<'_>,
        phase: &mut DialPhase,
        cancel: &CancellationToken,
    ) -> ForwardResult<(BoxedStream, String, Grant)> {
        if !node.connector().supports(request.network) {
            return Err(ForwardError::UnsupportedNetwork {
                node: node.name().to_string(),
                network: request.network.to_string(),
            });
        }

        enter(phase, DialPhase::ResolvingHop);
        let addr = bounded(
            cancel,
            self.dial_timeout,
            resolve(NODE_NETWORK, node.addr(), hop.resolver_for(node), hop.hosts_for(node)),
        )
        .await?;

        enter(phase, DialPhase::GatingNode);
        if !node.admits(&request.admission_request()) {
            return Err(ForwardError::AdmissionDenied(node.name().to_string()));
        }
        let node_grant = node
            .limiters()
            .acquire(&ctx.for_node(node.name()), cancel)
            .await?;

        enter(phase, DialPhase::Dialing);
        let established = match route.last() {
            None => self.dial_first(request.network, &addr, cancel).await?,
            Some(previous) => {
                let prefix = stream.take().ok_or_else(|| {
                    ForwardError::dial(&previous.addr, io::Error::other("route prefix not established"))
                })?;
                self.connect_via(&previous.node, prefix, request.network, &addr, cancel)
                    .await?
            }
        };

        Ok((established, addr, node_grant))
    }

    async fn dial_first(
        &self,
        network: &str,
        addr: &str,
        cancel: &CancellationToken,
    ) -> ForwardResult<BoxedStream> {
        bounded(cancel, self.dial_timeout, async {
            self.dialer
                .dial(network, addr)
                .await
                .map_err(|e| ForwardError::dial(addr, e))
        })
        .await
    }

    async fn connect_via(
        &self,
        via: &Node,
        stream: BoxedStream,
        network: &str,
        addr: &str,
        cancel: &CancellationToken,
    ) -> ForwardResult<BoxedStream> {
        bounded(cancel, self.dial_timeout, async {
            via.connector()
                .connect(stream, network, addr)
                .await
                .map_err(|e| ForwardError::dial(addr, e))
        })
        .await
    }

    /// Dial the already established nodes of `route` again, in order.
    async fn redial_prefix(
        &self,
        route: &Route,
        network: &str,
        cancel: &CancellationToken,
    ) -> ForwardResult<BoxedStream> {
        let nodes = route.nodes();
        let Some(first) = nodes.first() else {
            return Err(ForwardError::dial("", io::Error::other("empty route prefix")));
        };
        tracing::trace!(route = %route.path(), "re-dialing route prefix");

        let mut stream = self.dial_first(network, &first.addr, cancel).await?;
        for pair in nodes.windows(2) {
            stream = self
                .connect_via(&pair[0].node, stream, network, &pair[1].addr, cancel)
                .await?;
        }
        Ok(stream)
    }
}

fn enter(phase: &mut DialPhase, next: DialPhase) {
    if *phase != next {
        tracing::trace!(from = ?*phase, to = ?next, "dial phase");
        *phase = next;
    }
}
