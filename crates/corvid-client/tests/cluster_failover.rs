//! End-to-end executor behavior against scripted transports: leader
//! redirects, retries, failover walks, read striping, and cache bootstrap.

use async_trait::async_trait;
use corvid_client::{
    server_hash, CachedNode, ClientConfiguration, ClientError, ClusterMemberInfo, Conventions,
    ConventionsBuilder, DispatchContext, FailoverBehavior, HttpMethod, MemoryTopologyStore,
    NoopTopologyStore, ReplicationDestination, RequestExecutor, Result, ServerNode, Topology,
    TopologyFetcher, TopologyStore, READ_BEHAVIOR_HEADER,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const A: &str = "http://a:8080";
const B: &str = "http://b:8080";
const C: &str = "http://c:8080";

type CallLog = Arc<Mutex<Vec<(String, DispatchContext)>>>;
type BoxedOp = std::pin::Pin<Box<dyn std::future::Future<Output = Result<&'static str>> + Send>>;

fn node(url: &str) -> ServerNode {
    ServerNode::new(url)
}

fn nodes(urls: &[&str]) -> Vec<Arc<ServerNode>> {
    urls.iter().map(|u| Arc::new(node(u))).collect()
}

fn down(url: &str) -> ClientError {
    ClientError::ServerDown {
        url: url.to_string(),
        reason: "connection refused".into(),
    }
}

fn response(url: &str, status: u16, leader_redirect: bool, location: Option<&str>) -> ClientError {
    ClientError::Response {
        url: url.to_string(),
        status,
        leader_redirect,
        location: location.map(String::from),
    }
}

fn dest(url: &str) -> ReplicationDestination {
    ReplicationDestination {
        url: url.into(),
        can_be_failover: true,
        cluster_information: Some(ClusterMemberInfo::follower()),
        ..Default::default()
    }
}

fn doc(term: u64, index: u64, is_leader: bool, destinations: Vec<ReplicationDestination>) -> Topology {
    Topology {
        term,
        cluster_commit_index: index,
        cluster_information: ClusterMemberInfo { is_leader },
        destinations,
        client_configuration: None,
    }
}

/// Fetcher answering topology probes from a closure
struct FnFetcher<F>(F);

#[async_trait]
impl<F> TopologyFetcher for FnFetcher<F>
where
    F: Fn(&ServerNode) -> Result<Topology> + Send + Sync,
{
    async fn topology(&self, node: &ServerNode) -> Result<Topology> {
        (self.0)(node)
    }
}

/// Fetcher whose probes never complete
struct PendingFetcher;

#[async_trait]
impl TopologyFetcher for PendingFetcher {
    async fn topology(&self, _node: &ServerNode) -> Result<Topology> {
        futures::future::pending().await
    }
}

fn unreachable_cluster() -> Arc<dyn TopologyFetcher> {
    Arc::new(FnFetcher(|node: &ServerNode| -> Result<Topology> {
        Err(down(&node.url))
    }))
}

fn fast_conventions() -> ConventionsBuilder {
    Conventions::builder()
        .wait_for_leader_timeout(Duration::from_millis(100))
        .topology_fetch_timeout(Duration::from_millis(50))
}

fn executor(fetcher: Arc<dyn TopologyFetcher>, conventions: Conventions) -> RequestExecutor {
    RequestExecutor::new(node(A), fetcher, Arc::new(NoopTopologyStore), conventions)
}

fn logging_op(
    log: &CallLog,
    behavior: impl Fn(&str) -> Result<&'static str> + Clone + Send + 'static,
) -> impl Fn(Arc<ServerNode>, DispatchContext) -> BoxedOp {
    let log = log.clone();
    move |node, ctx| {
        let log = log.clone();
        let behavior = behavior.clone();
        Box::pin(async move {
            log.lock().unwrap().push((node.url.clone(), ctx));
            behavior(&node.url)
        }) as BoxedOp
    }
}

#[tokio::test]
async fn redirect_installs_leader() {
    let exec = executor(Arc::new(PendingFetcher), fast_conventions().build());
    exec.state().replace_nodes(nodes(&[A, B, C]));
    exec.state().leader.set_known_leader(Arc::new(node(A)));

    let log: CallLog = Default::default();
    let op = logging_op(&log, |url| match url {
        A => Err(response(A, 302, true, Some(B))),
        B => Ok("from-b"),
        other => Err(ClientError::Operation(format!("unexpected node {other}"))),
    });

    let token = CancellationToken::new();
    let result = exec.execute(HttpMethod::Get, op, &token).await.unwrap();

    assert_eq!(result, "from-b");
    assert_eq!(exec.leader().unwrap().url, B);
    // A redirect is a hint, not a failure
    assert_eq!(exec.state().failures.get(A), 0);
    assert_eq!(exec.state().failures.get(B), 0);

    let calls: Vec<String> = log.lock().unwrap().iter().map(|(u, _)| u.clone()).collect();
    assert_eq!(calls, vec![A.to_string(), B.to_string()]);
}

#[tokio::test]
async fn redirect_without_hint_fails() {
    let exec = executor(Arc::new(PendingFetcher), fast_conventions().build());
    exec.state().replace_nodes(nodes(&[A, B]));
    exec.state().leader.set_known_leader(Arc::new(node(A)));

    let log: CallLog = Default::default();
    let op = logging_op(&log, |url| match url {
        A => Err(response(A, 302, false, Some(B))),
        _ => Ok("unreachable"),
    });

    let token = CancellationToken::new();
    let result = exec.execute(HttpMethod::Get, op, &token).await;

    assert!(matches!(result, Err(ClientError::BadRedirect { .. })));
    // Leader unchanged, and a bad redirect is not a down server
    assert_eq!(exec.leader().unwrap().url, A);
    assert_eq!(exec.state().failures.get(A), 0);
}

#[tokio::test]
async fn leader_churn_retry_is_free() {
    // With a zero retry budget, only the churn path can produce a second
    // attempt.
    let exec = executor(
        Arc::new(PendingFetcher),
        fast_conventions().max_retries(0).build(),
    );
    exec.state().replace_nodes(nodes(&[A, B]));
    exec.state().leader.set_known_leader(Arc::new(node(A)));

    let state = exec.state().clone();
    let log: CallLog = Default::default();
    let log2 = log.clone();
    let op = move |node: Arc<ServerNode>, ctx: DispatchContext| {
        let state = state.clone();
        let log = log2.clone();
        Box::pin(async move {
            log.lock().unwrap().push((node.url.clone(), ctx));
            match node.url.as_str() {
                A => {
                    // Another caller observes the new leader before our
                    // failure handling runs compare-and-clear.
                    state.leader.set_known_leader(Arc::new(ServerNode::new(B)));
                    Err(down(A))
                }
                B => Ok("from-b"),
                other => Err(ClientError::Operation(format!("unexpected node {other}"))),
            }
        }) as BoxedOp
    };

    let token = CancellationToken::new();
    let result = exec.execute(HttpMethod::Get, op, &token).await.unwrap();

    assert_eq!(result, "from-b");
    assert_eq!(exec.leader().unwrap().url, B);
    // The losing compare-and-clear left A's counter alone
    assert_eq!(exec.state().failures.get(A), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_reports_cluster_unreachable() {
    // The cluster never answers a topology probe, so every refresh promotes
    // the primary, and every attempt against it fails.
    let exec = executor(unreachable_cluster(), fast_conventions().build());

    let log: CallLog = Default::default();
    let op = logging_op(&log, |url| Err(down(url)));

    let token = CancellationToken::new();
    let result = exec.execute(HttpMethod::Get, op, &token).await;

    match result {
        Err(ClientError::ClusterUnreachable { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected ClusterUnreachable, got {other:?}"),
    }
    assert_eq!(exec.state().failures.get(A), 3);
    assert!(exec.stats().topology_refreshes >= 1);
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn failover_walk_tries_surviving_nodes() {
    let exec = executor(
        unreachable_cluster(),
        fast_conventions()
            .failover_behavior(FailoverBehavior::ReadFromLeaderWriteToLeaderWithFailovers)
            .promote_primary_when_no_topology(false)
            .build(),
    );
    exec.state().replace_nodes(nodes(&[A, B, C]));

    let log: CallLog = Default::default();
    let op = logging_op(&log, |url| match url {
        A => Err(down(A)),
        B => Ok("from-b"),
        other => Err(ClientError::Operation(format!("unexpected node {other}"))),
    });

    let token = CancellationToken::new();
    let result = exec.execute(HttpMethod::Get, op, &token).await.unwrap();

    assert_eq!(result, "from-b");
    assert_eq!(exec.state().failures.get(A), 1);
    assert_eq!(exec.state().failures.get(B), 0);

    let calls = log.lock().unwrap();
    let urls: Vec<&str> = calls.iter().map(|(u, _)| u.as_str()).collect();
    assert_eq!(urls, vec![A, B]);
    // Every failover try announces itself to the server
    assert!(calls.iter().all(|(_, ctx)| ctx.cluster_failover_header));
}

#[tokio::test]
async fn striped_reads_round_robin() {
    let exec = executor(
        Arc::new(PendingFetcher),
        fast_conventions()
            .failover_behavior(FailoverBehavior::ReadFromAllWriteToLeader)
            .build(),
    );
    exec.state().replace_nodes(nodes(&[A, B, C]));
    exec.state().leader.set_known_leader(Arc::new(node(A)));

    // Two sessions have already taken a striping slot
    assert_eq!(exec.read_striping_base(true), 0);
    assert_eq!(exec.read_striping_base(true), 1);

    let log: CallLog = Default::default();
    let op = logging_op(&log, |url| match url {
        C => Ok("from-c"),
        other => Err(ClientError::Operation(format!("unexpected node {other}"))),
    });

    let token = CancellationToken::new();
    let result = exec.execute(HttpMethod::Get, op, &token).await.unwrap();

    assert_eq!(result, "from-c");
    let calls = log.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, C);
    // Striped reads announce the read behavior on the wire
    assert!(calls[0]
        .1
        .header_pairs()
        .contains(&(READ_BEHAVIOR_HEADER, "All")));
}

#[tokio::test]
async fn force_read_from_master_pins_and_restores() {
    let exec = executor(
        Arc::new(PendingFetcher),
        fast_conventions()
            .failover_behavior(FailoverBehavior::ReadFromAllWriteToLeader)
            .build(),
    );
    exec.state().replace_nodes(nodes(&[A, B, C]));
    exec.state().leader.set_known_leader(Arc::new(node(A)));

    exec.read_striping_base(true);
    exec.read_striping_base(true); // base = 2, striping would pick C

    let log: CallLog = Default::default();
    let op = logging_op(&log, |url| match url {
        A => Ok("from-a"),
        C => Ok("from-c"),
        other => Err(ClientError::Operation(format!("unexpected node {other}"))),
    });

    let token = CancellationToken::new();
    {
        let _guard = exec.force_read_from_master();
        let result = exec
            .execute(HttpMethod::Get, &op, &token)
            .await
            .unwrap();
        assert_eq!(result, "from-a");
    }

    // Guard dropped: the previous striping base is back in effect
    let result = exec.execute(HttpMethod::Get, &op, &token).await.unwrap();
    assert_eq!(result, "from-c");
}

#[tokio::test(start_paused = true)]
async fn cache_bootstrap_restores_leader_before_network() {
    let store = MemoryTopologyStore::shared();
    let hash = server_hash(A);
    store
        .save(
            &hash,
            &[
                CachedNode {
                    url: A.into(),
                    database: None,
                    is_leader: true,
                },
                CachedNode {
                    url: B.into(),
                    database: None,
                    is_leader: false,
                },
            ],
        )
        .await;

    let exec = RequestExecutor::new(
        node(A),
        unreachable_cluster(),
        store.clone(),
        fast_conventions().build(),
    );

    let handle = exec.request_topology_refresh();
    assert!(
        exec.state()
            .leader
            .await_leader(Duration::from_secs(1))
            .await,
        "cached leader should be installed without any node answering"
    );
    assert_eq!(exec.leader().unwrap().url, A);

    // The cache hit does not short-circuit the network refresh
    handle.await_done().await;
    assert_eq!(exec.stats().topology_refreshes, 1);
    assert_eq!(exec.node_list().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn freshest_topology_wins_and_is_persisted() {
    // X answers with an old view of itself; a later round reaches the whole
    // membership and the higher-term leader wins.
    let store = MemoryTopologyStore::shared();
    let all = vec![dest(A), dest(B), dest(C)];
    let fetcher = {
        let all = all.clone();
        Arc::new(FnFetcher(move |node: &ServerNode| {
            match node.url.as_str() {
                A => Ok(doc(3, 10, false, all.clone())),
                B => Ok(doc(3, 10, false, all.clone())),
                C => Ok(doc(4, 1, true, all.clone())),
                other => Err(down(other)),
            }
        }))
    };

    let exec = RequestExecutor::new(node(A), fetcher, store.clone(), fast_conventions().build());

    exec.request_topology_refresh().await_done().await;

    let leader = exec.leader().unwrap();
    assert_eq!(leader.url, C);
    assert!(leader.is_leader());

    let membership: Vec<String> = exec.node_list().iter().map(|n| n.url.clone()).collect();
    assert_eq!(membership, vec![A.to_string(), B.to_string(), C.to_string()]);

    // The winning view was persisted with its leader bit intact
    let cached = store.load(&server_hash(A)).await.unwrap();
    let leaders: Vec<bool> = cached.iter().map(|c| c.is_leader).collect();
    assert_eq!(leaders, vec![false, false, true]);
}

#[tokio::test(start_paused = true)]
async fn transient_417_retries_after_reelection() {
    // First attempt hits A during an election round and gets a 417; the
    // follow-up refresh re-elects A and the retry succeeds.
    let all = vec![dest(A), dest(B)];
    let fetcher = {
        let all = all.clone();
        Arc::new(FnFetcher(move |node: &ServerNode| match node.url.as_str() {
            A => Ok(doc(2, 5, true, all.clone())),
            other => Err(down(other)),
        }))
    };
    let exec = RequestExecutor::new(
        node(A),
        fetcher,
        Arc::new(NoopTopologyStore),
        fast_conventions().build(),
    );
    exec.state().replace_nodes(nodes(&[A, B]));
    exec.state().leader.set_known_leader(Arc::new(node(A)));

    let calls = Arc::new(Mutex::new(0u32));
    let calls2 = calls.clone();
    let op = move |node: Arc<ServerNode>, _ctx: DispatchContext| {
        let calls = calls2.clone();
        Box::pin(async move {
            let mut calls = calls.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Err(response(&node.url, 417, false, None))
            } else {
                Ok("accepted")
            }
        }) as BoxedOp
    };

    let token = CancellationToken::new();
    let result = exec.execute(HttpMethod::Put, op, &token).await.unwrap();

    assert_eq!(result, "accepted");
    assert_eq!(*calls.lock().unwrap(), 2);
    assert_eq!(exec.leader().unwrap().url, A);
    // The successful retry reset the counter bumped by the 417
    assert_eq!(exec.state().failures.get(A), 0);
}

#[tokio::test(start_paused = true)]
async fn strict_policy_without_leader_is_an_error() {
    let exec = executor(
        unreachable_cluster(),
        fast_conventions()
            .promote_primary_when_no_topology(false)
            .build(),
    );

    let token = CancellationToken::new();
    let result: Result<()> = exec
        .execute(HttpMethod::Get, |_, _| async { Ok(()) }, &token)
        .await;

    assert!(matches!(result, Err(ClientError::NoStableLeader { .. })));
}

#[tokio::test(start_paused = true)]
async fn cancellation_unblocks_leader_wait() {
    let exec = executor(
        Arc::new(PendingFetcher),
        Conventions::builder()
            .wait_for_leader_timeout(Duration::from_secs(5))
            .topology_fetch_timeout(Duration::from_secs(10))
            .build(),
    );

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result: Result<()> = exec
        .execute(HttpMethod::Get, |_, _| async { Ok(()) }, &token)
        .await;

    assert!(matches!(result, Err(ClientError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn server_pushed_configuration_overrides_policy() {
    let all = vec![dest(A), dest(B)];
    let fetcher = Arc::new(FnFetcher(move |node: &ServerNode| {
        if node.url == A {
            let mut document = doc(1, 1, true, all.clone());
            document.client_configuration = Some(ClientConfiguration {
                failover_behavior: Some(FailoverBehavior::ReadFromAllWriteToLeaderWithFailovers),
            });
            Ok(document)
        } else {
            Err(down(&node.url))
        }
    }));

    let exec = RequestExecutor::new(
        node(A),
        fetcher,
        Arc::new(NoopTopologyStore),
        fast_conventions().build(),
    );
    assert_eq!(
        exec.conventions().failover_behavior(),
        FailoverBehavior::ReadFromLeaderWriteToLeader
    );

    exec.request_topology_refresh().await_done().await;

    assert_eq!(
        exec.conventions().failover_behavior(),
        FailoverBehavior::ReadFromAllWriteToLeaderWithFailovers
    );
}
