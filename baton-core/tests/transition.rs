use async_trait::async_trait;
use baton_core::{
    BatonError, Cluster, ClusterConfig, ClusterDelegate, DatumError, DistDatum, LocalCluster,
    LocalNetwork,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq)]
enum OnRelinquish {
    Succeed,
    Slow(Duration),
    Fail,
    Panic,
}

struct Shard {
    id: i64,
    on_relinquish: OnRelinquish,
    relinquished: AtomicUsize,
    acquired: AtomicUsize,
    acquired_at: Mutex<Option<Instant>>,
}

impl Shard {
    fn new(id: i64) -> Arc<Self> {
        Self::with_behavior(id, OnRelinquish::Succeed)
    }

    fn with_behavior(id: i64, on_relinquish: OnRelinquish) -> Arc<Self> {
        Arc::new(Self {
            id,
            on_relinquish,
            relinquished: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            acquired_at: Mutex::new(None),
        })
    }

    fn relinquished(&self) -> usize {
        self.relinquished.load(Ordering::SeqCst)
    }

    fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    fn acquired_at(&self) -> Option<Instant> {
        *self.acquired_at.lock().unwrap()
    }
}

#[async_trait]
impl DistDatum for Shard {
    fn id(&self) -> i64 {
        self.id
    }

    fn datum_type(&self) -> &str {
        "shard"
    }

    async fn relinquish(&self) -> Result<(), DatumError> {
        self.relinquished.fetch_add(1, Ordering::SeqCst);
        match self.on_relinquish {
            OnRelinquish::Succeed => Ok(()),
            OnRelinquish::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            OnRelinquish::Fail => Err("flush failed".into()),
            OnRelinquish::Panic => panic!("flush panicked"),
        }
    }

    async fn acquire(&self) -> Result<(), DatumError> {
        *self.acquired_at.lock().unwrap() = Some(Instant::now());
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> String {
        format!("shard-{}", self.id)
    }
}

struct Member {
    cluster: Arc<Cluster>,
    shard: Arc<Shard>,
}

fn addr(ip: u8) -> SocketAddr {
    format!("10.0.0.{}:7946", ip).parse().unwrap()
}

async fn start_member(
    substrate: &Arc<LocalCluster>,
    network: &LocalNetwork,
    name: &str,
    ip: u8,
    sort_by: i64,
) -> Arc<Cluster> {
    let delegate = Arc::new(ClusterDelegate::new(sort_by));
    let membership = substrate.member(name, addr(ip), delegate.clone()).unwrap();
    let cluster = Cluster::with_parts(
        ClusterConfig::default(),
        membership,
        delegate,
        Arc::new(network.clone()),
    )
    .unwrap();
    network.attach(addr(ip), &cluster.messenger());
    cluster.join(&[]).await.unwrap();
    cluster
}

async fn load(cluster: &Cluster, shard: &Arc<Shard>) {
    let datum: Arc<dyn DistDatum> = shard.clone();
    cluster
        .load_dist_data(|| async move { Ok(vec![datum]) })
        .await
        .unwrap();
}

async fn load_many(cluster: &Cluster, shards: &[Arc<Shard>]) {
    let data: Vec<Arc<dyn DistDatum>> = shards
        .iter()
        .map(|shard| Arc::clone(shard) as Arc<dyn DistDatum>)
        .collect();
    cluster
        .load_dist_data(|| async move { Ok(data) })
        .await
        .unwrap();
}

/// Members a, b and c, all ready, each holding the same shard 0 whose
/// primary is a. `a_behavior` controls a's relinquish.
async fn three_members(a_behavior: OnRelinquish) -> (LocalNetwork, Vec<Member>) {
    let substrate = LocalCluster::new();
    let network = LocalNetwork::new();

    let mut members = Vec::new();
    for (name, ip, behavior) in [
        ("a", 1, a_behavior),
        ("b", 2, OnRelinquish::Succeed),
        ("c", 3, OnRelinquish::Succeed),
    ] {
        let cluster = start_member(&substrate, &network, name, ip, i64::from(ip)).await;
        cluster.set_ready(true).await.unwrap();
        members.push(Member {
            cluster,
            shard: Shard::with_behavior(0, behavior),
        });
    }

    for member in &members {
        load(&member.cluster, &member.shard).await;
        let nodes = member.cluster.nodes_for_dist_datum(member.shard.as_ref()).await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name(), "a");
    }
    (network, members)
}

async fn primary_of(member: &Member) -> String {
    member
        .cluster
        .nodes_for_dist_datum(member.shard.as_ref())
        .await
        .first()
        .map(|node| node.name().to_string())
        .unwrap_or_default()
}

#[tokio::test]
async fn new_primary_acquires_after_confirmation() {
    let (_network, members) = three_members(OnRelinquish::Succeed).await;
    let (a, b, c) = (&members[0], &members[1], &members[2]);

    a.cluster.set_ready(false).await.unwrap();

    let b_cluster = Arc::clone(&b.cluster);
    let waiting = tokio::spawn(async move {
        let started = Instant::now();
        b_cluster.transition(Duration::from_secs(10)).await;
        started.elapsed()
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiting.is_finished(), "b waits for the relinquish");
    assert_eq!(b.shard.acquired(), 0);

    a.cluster.transition(Duration::from_secs(10)).await;
    assert_eq!(a.shard.relinquished(), 1);
    assert_eq!(a.shard.acquired(), 0);

    let elapsed = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(elapsed < Duration::from_secs(10));
    assert_eq!(b.shard.acquired(), 1);
    assert_eq!(b.shard.relinquished(), 0);

    c.cluster.transition(Duration::from_millis(100)).await;
    assert_eq!(c.shard.acquired(), 0);
    assert_eq!(c.shard.relinquished(), 0);

    for member in &members {
        assert_eq!(primary_of(member).await, "b");
    }
}

#[tokio::test]
async fn new_primary_acquires_once_after_timeout() {
    let (network, members) = three_members(OnRelinquish::Succeed).await;
    let (a, b) = (&members[0], &members[1]);

    a.cluster.set_ready(false).await.unwrap();

    let started = Instant::now();
    b.cluster.transition(Duration::from_millis(300)).await;
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(b.shard.acquired(), 1);

    // The late confirmation must not trigger a second acquire.
    a.cluster.transition(Duration::from_millis(100)).await;
    for _ in 0..100 {
        if network.delivered_count() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(network.delivered_count(), 1);

    b.cluster.transition(Duration::from_millis(100)).await;
    assert_eq!(b.shard.acquired(), 1);
    assert_eq!(primary_of(b).await, "b");
}

#[tokio::test]
async fn slow_relinquish_does_not_shorten_the_confirmation_wait() {
    let substrate = LocalCluster::new();
    let network = LocalNetwork::new();

    // Shard 0 starts on a, shard 1 on b. Once a steps down, b takes shard 0
    // and gives shard 1 to c, flushing it slowly.
    let mut members = Vec::new();
    for (name, ip) in [("a", 1u8), ("b", 2), ("c", 3)] {
        let cluster = start_member(&substrate, &network, name, ip, i64::from(ip)).await;
        cluster.set_ready(true).await.unwrap();
        let second = if name == "b" {
            Shard::with_behavior(1, OnRelinquish::Slow(Duration::from_millis(500)))
        } else {
            Shard::new(1)
        };
        members.push((cluster, [Shard::new(0), second]));
    }
    for (cluster, shards) in &members {
        load_many(cluster, shards).await;
    }

    let (a, a_shards) = &members[0];
    let (b, b_shards) = &members[1];
    a.set_ready(false).await.unwrap();

    let b_cluster = Arc::clone(b);
    let waiting = tokio::spawn(async move {
        let started = Instant::now();
        b_cluster.transition(Duration::from_millis(400)).await;
        started.elapsed()
    });

    // Past b's slow flush and past the timeout measured from b's start.
    tokio::time::sleep(Duration::from_millis(650)).await;
    assert_eq!(b_shards[1].relinquished(), 1);
    assert_eq!(b_shards[0].acquired(), 0, "b still waits for a's confirmation");

    let confirming = Instant::now();
    a.transition(Duration::from_millis(100)).await;
    assert_eq!(a_shards[0].relinquished(), 1);

    let elapsed = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(elapsed < Duration::from_millis(900));
    assert_eq!(b_shards[0].acquired(), 1);
    assert!(b_shards[0].acquired_at().unwrap() >= confirming);
}

#[tokio::test]
async fn failed_relinquish_still_moves_ownership() {
    let (_network, members) = three_members(OnRelinquish::Fail).await;
    let (a, b) = (&members[0], &members[1]);

    a.cluster.set_ready(false).await.unwrap();
    a.cluster.transition(Duration::from_millis(100)).await;
    assert_eq!(a.shard.relinquished(), 1);
    assert_eq!(primary_of(a).await, "b");

    let started = Instant::now();
    b.cluster.transition(Duration::from_millis(200)).await;
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(b.shard.acquired(), 1);
}

#[tokio::test]
async fn panicking_relinquish_keeps_previous_assignment() {
    let (_network, members) = three_members(OnRelinquish::Panic).await;
    let a = &members[0];

    a.cluster.set_ready(false).await.unwrap();
    a.cluster.transition(Duration::from_millis(100)).await;
    assert_eq!(a.shard.relinquished(), 1);
    assert_eq!(primary_of(a).await, "a");

    // The coordinator stays usable.
    assert_eq!(a.cluster.assignments().await.len(), 1);
}

#[tokio::test]
async fn unchanged_primary_runs_no_callbacks() {
    let (network, members) = three_members(OnRelinquish::Succeed).await;

    for member in &members {
        member.cluster.transition(Duration::from_millis(50)).await;
    }

    for member in &members {
        assert_eq!(member.shard.relinquished(), 0);
        assert_eq!(member.shard.acquired(), 0);
        assert_eq!(primary_of(member).await, "a");
    }
    assert_eq!(network.delivered_count(), 0);
}

#[tokio::test]
async fn later_joiner_does_not_take_over() {
    let substrate = LocalCluster::new();
    let network = LocalNetwork::new();

    let mut members = Vec::new();
    for (name, ip) in [("a", 1u8), ("b", 2), ("c", 3), ("d", 4)] {
        let cluster = start_member(&substrate, &network, name, ip, i64::from(ip)).await;
        let shard = Shard::new(0);
        if name != "d" {
            cluster.set_ready(true).await.unwrap();
        }
        members.push(Member { cluster, shard });
    }
    for member in &members {
        load(&member.cluster, &member.shard).await;
    }

    let d = &members[3];
    d.cluster.set_ready(true).await.unwrap();
    assert_eq!(d.cluster.ready_nodes().await.len(), 4);

    for member in &members {
        member.cluster.transition(Duration::from_millis(50)).await;
    }
    for member in &members {
        assert_eq!(member.shard.relinquished(), 0);
        assert_eq!(member.shard.acquired(), 0);
        assert_eq!(primary_of(member).await, "a");
    }
    assert_eq!(network.delivered_count(), 0);
}

#[tokio::test]
async fn replicas_follow_the_primary() {
    let substrate = LocalCluster::new();
    let network = LocalNetwork::new();
    let cluster = start_member(&substrate, &network, "a", 1, 1).await;
    let peer = start_member(&substrate, &network, "b", 2, 2).await;
    cluster.set_ready(true).await.unwrap();
    peer.set_ready(true).await.unwrap();

    cluster.set_copies(2).await.unwrap();
    assert_eq!(cluster.copies().await, 2);

    let shard = Shard::new(1);
    load(&cluster, &shard).await;
    let names: Vec<String> = cluster
        .nodes_for_dist_datum(shard.as_ref())
        .await
        .iter()
        .map(|node| node.name().to_string())
        .collect();
    assert_eq!(names, vec!["b", "a"]);

    assert!(matches!(
        cluster.set_copies(3).await,
        Err(BatonError::Config(_))
    ));

    let listed = cluster.assignments().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, "shard:1");
    assert_eq!(listed[0].name, "shard-1");
    assert_eq!(listed[0].primary().unwrap().name(), "b");
}

#[tokio::test]
async fn unregistered_datum_has_no_nodes() {
    let substrate = LocalCluster::new();
    let network = LocalNetwork::new();
    let cluster = start_member(&substrate, &network, "a", 1, 1).await;
    cluster.set_ready(true).await.unwrap();

    assert!(cluster.nodes_for_dist_datum(Shard::new(7).as_ref()).await.is_empty());
}

#[tokio::test]
async fn loading_before_join_fails() {
    let substrate = LocalCluster::new();
    let network = LocalNetwork::new();
    let delegate = Arc::new(ClusterDelegate::new(1));
    let membership = substrate.member("a", addr(1), delegate.clone()).unwrap();
    let cluster = Cluster::with_parts(
        ClusterConfig::default(),
        membership,
        delegate,
        Arc::new(network),
    )
    .unwrap();

    let result = cluster
        .load_dist_data(|| async { Ok(Vec::<Arc<dyn DistDatum>>::new()) })
        .await;
    assert!(matches!(result, Err(BatonError::NotJoined)));
}

#[tokio::test]
async fn loader_errors_are_returned() {
    let substrate = LocalCluster::new();
    let network = LocalNetwork::new();
    let cluster = start_member(&substrate, &network, "a", 1, 1).await;

    let result = cluster
        .load_dist_data(|| async { Err::<Vec<Arc<dyn DistDatum>>, DatumError>("db down".into()) })
        .await;
    assert!(matches!(result, Err(BatonError::Loader(message)) if message == "db down"));
}

#[tokio::test]
async fn membership_changes_are_signalled() {
    let substrate = LocalCluster::new();
    let network = LocalNetwork::new();
    let a = start_member(&substrate, &network, "a", 1, 1).await;
    let mut changes = a.subscribe_to_changes();

    let b = start_member(&substrate, &network, "b", 2, 2).await;
    tokio::time::timeout(Duration::from_secs(1), changes.recv())
        .await
        .unwrap()
        .unwrap();

    b.set_user_meta(bytes::Bytes::from_static(b"rack-2")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), changes.recv())
        .await
        .unwrap()
        .unwrap();

    let members = a.members().await;
    assert_eq!(members.len(), 2);
    let seen_b = members.iter().find(|node| node.name() == "b").unwrap();
    assert_eq!(seen_b.user_meta().unwrap(), bytes::Bytes::from_static(b"rack-2"));
    assert!(!seen_b.is_ready());
    assert_eq!(a.sorted_nodes().await.len(), 2);
    assert!(a.ready_nodes().await.is_empty());
    assert_eq!(a.local_node().await.name(), "a");
}
