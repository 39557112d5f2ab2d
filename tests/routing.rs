// Route building through chains of hops with in-memory transports
mod common;

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, time::Duration};

    use hopgate::{
        config::models::{ConnLimiterConfig, LimitBy, RateLimiterConfig},
        core::{
            Chain, DialRequest, ForwardError, Hop, Node, Router,
            admission::{Admission, MatcherAdmission},
            bypass::{Bypass, MatcherBypass},
            hosts::{HostEntry, HostMapper, StaticHostMapper},
            limiter::{ConnLimiter, LimitContext, LimiterSet, RateLimiter},
            matcher::AddrMatcher,
            resolve,
            selector::{OrderedStrategy, SelectionStrategy, Selector},
        },
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        sync::Notify,
    };
    use tokio_util::sync::CancellationToken;

    use crate::common::{Journal, StallingConnector, StubConnector, StubDialer};

    const DST: &str = "203.0.113.10:80";

    fn node(name: &str, addr: &str, journal: &Journal, refuse: &[&str]) -> Node {
        Node::new(name, addr, Arc::new(StubConnector::new(name, journal, refuse)))
    }

    fn ordered_hop(name: &str, nodes: Vec<Node>) -> Hop {
        let selector = Selector::new(OrderedStrategy.boxed(), 1, Duration::from_secs(10));
        Hop::new(name, nodes.into_iter().map(Arc::new).collect(), selector)
    }

    fn chain(hops: Vec<Hop>) -> Option<Arc<Chain>> {
        Some(Arc::new(Chain::new(
            "chain-0",
            hops.into_iter().map(Arc::new).collect(),
        )))
    }

    fn conn_limiter(name: &str, limit: usize) -> Arc<ConnLimiter> {
        Arc::new(
            ConnLimiter::new(&ConnLimiterConfig {
                name: name.to_string(),
                by: Default::default(),
                limit,
                on_missing_key: Default::default(),
            })
            .unwrap(),
        )
    }

    /// One request per hour, already spent.
    fn spent_rate_limiter(name: &str) -> Arc<RateLimiter> {
        let limiter = RateLimiter::new(&RateLimiterConfig {
            name: name.to_string(),
            by: LimitBy::Global,
            requests: 1,
            period: "1h".to_string(),
            wait: false,
            on_missing_key: Default::default(),
        })
        .unwrap();
        assert!(limiter.allow(&LimitContext::default()));
        Arc::new(limiter)
    }

    fn admit_only(patterns: &[&str]) -> Option<Arc<dyn Admission>> {
        let matcher = AddrMatcher::new(patterns).unwrap();
        Some(Arc::new(MatcherAdmission::new("admission-0", matcher, true, HashSet::new())))
    }

    fn bypass(patterns: &[&str]) -> Option<Arc<dyn Bypass>> {
        let matcher = AddrMatcher::new(patterns).unwrap();
        Some(Arc::new(MatcherBypass::new("bypass-0", matcher, false)))
    }

    fn example_hosts() -> Arc<StaticHostMapper> {
        Arc::new(StaticHostMapper::new(
            "hosts-0",
            &[HostEntry {
                hostname: "example.com".to_string(),
                ip: "93.184.216.34".parse().unwrap(),
            }],
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_direct_dial_relays_to_destination() {
        let journal = Journal::default();
        let router = Router::new(Arc::new(StubDialer::new(&journal, &[])));
        let cancel = CancellationToken::new();

        let tunnel = router
            .dial(&DialRequest::new("tcp", DST), &cancel)
            .await
            .unwrap();
        assert!(tunnel.route().is_empty());
        assert_eq!(tunnel.destination(), DST);
        assert_eq!(journal.entries(), vec![format!("dial {DST}")]);

        let (mut client, inbound) = duplex(1024);
        let relaying = tokio::spawn(async move { tunnel.relay(Box::new(inbound), &cancel).await });

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping");

        let stats = relaying.await.unwrap().unwrap();
        assert_eq!(stats.input, 4);
        assert_eq!(stats.output, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_chain_dials_hops_in_order() {
        let journal = Journal::default();
        let hops = vec![
            ordered_hop("hop-1", vec![node("n1", "10.0.0.1:8080", &journal, &[])]),
            ordered_hop("hop-2", vec![node("n2", "10.0.0.2:8080", &journal, &[])]),
            ordered_hop("hop-3", vec![node("n3", "10.0.0.3:8080", &journal, &[])]),
        ];
        let router = Router::new(Arc::new(StubDialer::new(&journal, &[]))).with_chain(chain(hops));

        let tunnel = router
            .dial(&DialRequest::new("tcp", DST), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tunnel.route().len(), 3);
        assert_eq!(tunnel.route().path(), "n1 -> n2 -> n3");
        assert_eq!(tunnel.route().chain(), Some("chain-0"));
        assert!(!tunnel.route().is_truncated());
        assert_eq!(
            journal.entries(),
            vec![
                "dial 10.0.0.1:8080".to_string(),
                "n1 -> 10.0.0.2:8080".to_string(),
                "n2 -> 10.0.0.3:8080".to_string(),
                format!("n3 -> {DST}"),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_node_fails_over_and_releases_its_grant() {
        let journal = Journal::default();
        let limiter = conn_limiter("climiter-a", 1);
        let a = node("a", "10.0.0.1:8080", &journal, &[])
            .with_limiters(LimiterSet::new(vec![], vec![limiter.clone()], vec![]));
        let b = node("b", "10.0.0.2:8080", &journal, &[]);
        let hop = ordered_hop("hop-0", vec![a, b]);
        let nodes: Vec<Arc<Node>> = hop.nodes().to_vec();

        let dialer = StubDialer::new(&journal, &["10.0.0.1:8080"]);
        let router = Router::new(Arc::new(dialer)).with_chain(chain(vec![hop]));

        let tunnel = router
            .dial(&DialRequest::new("tcp", DST), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tunnel.route().path(), "b");
        assert_eq!(
            journal.entries(),
            vec![
                "dial 10.0.0.1:8080".to_string(),
                "dial 10.0.0.2:8080".to_string(),
                format!("b -> {DST}"),
            ]
        );
        assert_eq!(limiter.in_use(&LimitContext::default()).await, 0);
        assert_eq!(nodes[0].health().failures(), 1);
        assert_eq!(nodes[1].health().failures(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failover_in_later_hop_redials_prefix() {
        let journal = Journal::default();
        let first = ordered_hop(
            "hop-1",
            vec![node("n1", "10.0.0.1:8080", &journal, &["10.0.1.1:8080"])],
        );
        let second = ordered_hop(
            "hop-2",
            vec![
                node("a", "10.0.1.1:8080", &journal, &[]),
                node("b", "10.0.1.2:8080", &journal, &[]),
            ],
        );
        let router =
            Router::new(Arc::new(StubDialer::new(&journal, &[]))).with_chain(chain(vec![first, second]));

        let tunnel = router
            .dial(&DialRequest::new("tcp", DST), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tunnel.route().path(), "n1 -> b");
        assert_eq!(
            journal.entries(),
            vec![
                "dial 10.0.0.1:8080".to_string(),
                "n1 -> 10.0.1.1:8080".to_string(),
                "dial 10.0.0.1:8080".to_string(),
                "n1 -> 10.0.1.2:8080".to_string(),
                format!("b -> {DST}"),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_every_node_at_capacity_exhausts_hop() {
        let journal = Journal::default();
        let limiter_a = conn_limiter("climiter-a", 1);
        let limiter_b = conn_limiter("climiter-b", 1);
        let ctx = LimitContext::default();
        let held_a = limiter_a.acquire(&ctx).await.unwrap();
        let held_b = limiter_b.acquire(&ctx).await.unwrap();

        let hop = ordered_hop(
            "hop-0",
            vec![
                node("a", "10.0.0.1:8080", &journal, &[])
                    .with_limiters(LimiterSet::new(vec![], vec![limiter_a.clone()], vec![])),
                node("b", "10.0.0.2:8080", &journal, &[])
                    .with_limiters(LimiterSet::new(vec![], vec![limiter_b.clone()], vec![])),
            ],
        );
        let router = Router::new(Arc::new(StubDialer::new(&journal, &[]))).with_chain(chain(vec![hop]));

        let err = router
            .dial(&DialRequest::new("tcp", DST), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::HopExhausted { ref hop, .. } if hop == "hop-0"));
        assert!(journal.entries().is_empty());

        assert_eq!(limiter_a.in_use(&ctx).await, 1);
        assert_eq!(limiter_b.in_use(&ctx).await, 1);
        drop(held_a);
        drop(held_b);
        assert_eq!(limiter_a.in_use(&ctx).await, 0);
        assert_eq!(limiter_b.in_use(&ctx).await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_every_node_failing_exhausts_hop() {
        let journal = Journal::default();
        let hop = ordered_hop(
            "hop-0",
            vec![
                node("a", "10.0.0.1:8080", &journal, &[]),
                node("b", "10.0.0.2:8080", &journal, &[]),
            ],
        );
        let dialer = StubDialer::new(&journal, &["10.0.0.1:8080", "10.0.0.2:8080"]);
        let router = Router::new(Arc::new(dialer)).with_chain(chain(vec![hop]));

        let err = router
            .dial(&DialRequest::new("tcp", DST), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::HopExhausted { attempts: 2, .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hop_bypass_truncates_route() {
        let journal = Journal::default();
        let first = ordered_hop("hop-1", vec![node("n1", "10.0.0.1:8080", &journal, &[])]);
        let second = ordered_hop("hop-2", vec![node("n2", "10.0.0.2:8080", &journal, &[])])
            .with_bypass(bypass(&["203.0.113.0/24"]));
        let router =
            Router::new(Arc::new(StubDialer::new(&journal, &[]))).with_chain(chain(vec![first, second]));

        let tunnel = router
            .dial(&DialRequest::new("tcp", DST), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tunnel.route().path(), "n1");
        assert!(tunnel.route().is_truncated());
        assert_eq!(
            journal.entries(),
            vec!["dial 10.0.0.1:8080".to_string(), format!("n1 -> {DST}")]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ingress_bypass_refuses_destination() {
        let journal = Journal::default();
        let router = Router::new(Arc::new(StubDialer::new(&journal, &[])))
            .with_bypass(bypass(&["203.0.113.0/24"]));

        let err = router
            .dial(&DialRequest::new("tcp", DST), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Bypassed(ref addr) if addr == DST));
        assert!(journal.entries().is_empty());

        // other destinations still pass
        router
            .dial(&DialRequest::new("tcp", "198.51.100.1:80"), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ingress_admission_denies_client() {
        let journal = Journal::default();
        let matcher = AddrMatcher::new(&["192.168.0.0/16"]).unwrap();
        let admission: Arc<dyn Admission> =
            Arc::new(MatcherAdmission::new("admission-0", matcher, true, HashSet::new()));
        let router = Router::new(Arc::new(StubDialer::new(&journal, &[])))
            .with_admission(Some(admission));

        let denied = DialRequest::new("tcp", DST).with_client("10.1.1.1:5000".parse().unwrap());
        let err = router.dial(&denied, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ForwardError::AdmissionDenied(_)));
        assert!(journal.entries().is_empty());

        let allowed = DialRequest::new("tcp", DST).with_client("192.168.1.2:5000".parse().unwrap());
        assert!(router.dial(&allowed, &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_router_dials_mapped_destination() {
        let journal = Journal::default();
        let hosts: Arc<dyn HostMapper> = example_hosts();
        let router = Router::new(Arc::new(StubDialer::new(&journal, &[]))).with_hosts(Some(hosts));

        let tunnel = router
            .dial(&DialRequest::new("tcp", "example.com:443"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tunnel.destination(), "93.184.216.34:443");
        assert_eq!(journal.entries(), vec!["dial 93.184.216.34:443".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_edge_cases() {
        let hosts: Arc<dyn HostMapper> = example_hosts();

        assert_eq!(
            resolve("tcp", "example.com:443", None, Some(hosts.as_ref()))
                .await
                .unwrap(),
            "93.184.216.34:443"
        );
        assert_eq!(resolve("tcp", "", None, Some(hosts.as_ref())).await.unwrap(), "");
        assert_eq!(
            resolve("tcp", ":8080", None, Some(hosts.as_ref())).await.unwrap(),
            ":8080"
        );
        // no mapping and no resolver: unchanged
        assert_eq!(
            resolve("tcp", "other.test:80", None, Some(hosts.as_ref()))
                .await
                .unwrap(),
            "other.test:80"
        );
    }

    #[tokio::test]
    async fn test_cancelled_dial_is_reported() {
        let journal = Journal::default();
        let hop = ordered_hop("hop-0", vec![node("a", "10.0.0.1:8080", &journal, &[])]);
        let router = Router::new(Arc::new(StubDialer::new(&journal, &[]))).with_chain(chain(vec![hop]));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = router
            .dial(&DialRequest::new("tcp", DST), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_node_refusal_leaves_health_untouched() {
        let journal = Journal::default();
        let a = node("a", "10.0.0.1:8080", &journal, &[]).with_admission(admit_only(&["10.0.0.0/8"]));
        let b = node("b", "10.0.0.2:8080", &journal, &[]);
        let hop = ordered_hop("hop-0", vec![a, b]);
        let nodes: Vec<Arc<Node>> = hop.nodes().to_vec();
        let router = Router::new(Arc::new(StubDialer::new(&journal, &[]))).with_chain(chain(vec![hop]));

        let outsider = DialRequest::new("tcp", DST).with_client("192.168.1.1:5000".parse().unwrap());
        let tunnel = router.dial(&outsider, &CancellationToken::new()).await.unwrap();
        assert_eq!(tunnel.route().path(), "b");
        assert_eq!(nodes[0].health().failures(), 0);

        // with max_fails 1 a health mark would have taken `a` out of rotation
        let insider = DialRequest::new("tcp", DST).with_client("10.1.1.1:5000".parse().unwrap());
        let tunnel = router.dial(&insider, &CancellationToken::new()).await.unwrap();
        assert_eq!(tunnel.route().path(), "a");
        assert_eq!(nodes[0].health().failures(), 0);
        assert_eq!(nodes[1].health().failures(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_udp_cannot_cross_a_tcp_chain() {
        let journal = Journal::default();
        let a = node("a", "10.0.0.1:8080", &journal, &[]);
        let b = node("b", "10.0.0.2:8080", &journal, &[]);
        let hop = ordered_hop("hop-0", vec![a, b]);
        let nodes: Vec<Arc<Node>> = hop.nodes().to_vec();
        let router = Router::new(Arc::new(StubDialer::new(&journal, &[]))).with_chain(chain(vec![hop]));

        let err = router
            .dial(&DialRequest::new("udp", DST), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::HopExhausted { attempts: 2, .. }));
        assert!(journal.entries().is_empty());
        assert!(nodes.iter().all(|n| n.health().failures() == 0));

        let direct = Router::new(Arc::new(StubDialer::new(&journal, &[])));
        let tunnel = direct
            .dial(&DialRequest::new("udp", DST), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tunnel.route().path(), "");
        assert_eq!(journal.entries(), [format!("dial {DST}")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_every_node_rate_limited_exhausts_hop() {
        let journal = Journal::default();
        let ingress = conn_limiter("climiter-in", 4);
        let conn_a = conn_limiter("climiter-a", 4);
        let a = node("a", "10.0.0.1:8080", &journal, &[]).with_limiters(LimiterSet::new(
            vec![spent_rate_limiter("rlimiter-a")],
            vec![conn_a.clone()],
            vec![],
        ));
        let b = node("b", "10.0.0.2:8080", &journal, &[]).with_limiters(LimiterSet::new(
            vec![spent_rate_limiter("rlimiter-b")],
            vec![],
            vec![],
        ));
        let hop = ordered_hop("hop-0", vec![a, b]);
        let nodes: Vec<Arc<Node>> = hop.nodes().to_vec();
        let router = Router::new(Arc::new(StubDialer::new(&journal, &[])))
            .with_chain(chain(vec![hop]))
            .with_limiters(LimiterSet::new(vec![], vec![ingress.clone()], vec![]));

        let err = router
            .dial(&DialRequest::new("tcp", DST), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::HopExhausted { attempts: 2, .. }));
        assert!(journal.entries().is_empty());

        let ctx = LimitContext::default();
        assert_eq!(ingress.in_use(&ctx).await, 0);
        assert_eq!(conn_a.in_use(&ctx.for_node("a")).await, 0);
        assert!(nodes.iter().all(|n| n.health().failures() == 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_during_handshake_releases_every_grant() {
        let journal = Journal::default();
        let started = Arc::new(Notify::new());
        let ingress = conn_limiter("climiter-in", 1);
        let node_limiter = conn_limiter("climiter-a", 1);
        let connector = StallingConnector {
            journal: journal.clone(),
            started: started.clone(),
        };
        let a = Node::new("a", "10.0.0.1:8080", Arc::new(connector))
            .with_limiters(LimiterSet::new(vec![], vec![node_limiter.clone()], vec![]));
        let router = Arc::new(
            Router::new(Arc::new(StubDialer::new(&journal, &[])))
                .with_chain(chain(vec![ordered_hop("hop-0", vec![a])]))
                .with_limiters(LimiterSet::new(vec![], vec![ingress.clone()], vec![])),
        );

        let cancel = CancellationToken::new();
        let dialing = tokio::spawn({
            let router = router.clone();
            let cancel = cancel.clone();
            async move { router.dial(&DialRequest::new("tcp", DST), &cancel).await }
        });

        started.notified().await;
        let ctx = LimitContext::default();
        assert_eq!(ingress.in_use(&ctx).await, 1);
        assert_eq!(node_limiter.in_use(&ctx.for_node("a")).await, 1);

        cancel.cancel();
        let err = dialing.await.unwrap().unwrap_err();
        assert!(matches!(err, ForwardError::Cancelled));
        assert_eq!(ingress.in_use(&ctx).await, 0);
        assert_eq!(node_limiter.in_use(&ctx.for_node("a")).await, 0);
        assert_eq!(
            journal.entries(),
            vec!["dial 10.0.0.1:8080".to_string(), format!("stall -> {DST}")]
        );
    }
}
