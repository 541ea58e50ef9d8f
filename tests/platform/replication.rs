//! Three platforms replicating over real TCP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use loamdb::{
    EngineStateMachine, ExecuteOp, ExecuteRequest, IsolationLevel, NodeId, Platform,
    PlatformConfig, ProjectId, RaftConfig, RaftNode, StateMachine, TcpRaftTransport,
};
use serde_json::json;
use tempfile::TempDir;

struct TestNode {
    platform: Platform,
    raft: Arc<RaftNode>,
    addr: String,
}

fn build_cluster(dir: &TempDir) -> Vec<TestNode> {
    let ids: Vec<NodeId> = vec![1, 2, 3];
    let project = ProjectId::new("app").unwrap();

    // Start every platform and remember its address
    let mut partial: Vec<(NodeId, Platform, String)> = Vec::new();
    for &id in &ids {
        let mut config = PlatformConfig::default();
        config.data_root = dir.path().join(format!("node-{}", id)).join("data");
        config.engine.wal.group_batch_interval_ms = 1;
        let platform = Platform::new(config).unwrap();

        // The replicated project must exist on every node
        let lease = platform.manager().acquire(&project).unwrap();
        lease.engine().create_collection("users", None).unwrap();
        drop(lease);

        let addr = platform.serve("127.0.0.1:0").unwrap().to_string();
        partial.push((id, platform, addr));
    }

    let addrs: HashMap<NodeId, String> = partial
        .iter()
        .map(|(id, _, addr)| (*id, addr.clone()))
        .collect();

    // Now wire the raft nodes over TCP
    let mut nodes = Vec::new();
    for (id, platform, addr) in partial {
        let peers: Vec<NodeId> = ids.iter().copied().filter(|p| *p != id).collect();
        let lease = platform.manager().acquire(&project).unwrap();
        let machine = Arc::new(EngineStateMachine::new(lease)) as Arc<dyn StateMachine>;
        let raft = RaftNode::new(
            RaftConfig {
                id,
                peers,
                election_min: Duration::from_millis(150),
                election_max: Duration::from_millis(300),
                heartbeat: Duration::from_millis(50),
                storage_dir: dir.path().join(format!("node-{}", id)).join("raft"),
            },
            machine,
        )
        .unwrap();
        platform.enable_replication(Arc::clone(&raft));
        raft.start(Arc::new(TcpRaftTransport::new(addrs.clone())));
        nodes.push(TestNode {
            platform,
            raft,
            addr,
        });
    }
    nodes
}

fn wait_for_leader(nodes: &[TestNode], timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    loop {
        let leaders: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.raft.is_leader())
            .map(|(i, _)| i)
            .collect();
        if leaders.len() == 1 {
            return leaders[0];
        }
        assert!(Instant::now() < deadline, "no single leader over TCP");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn shutdown(nodes: Vec<TestNode>) {
    for node in &nodes {
        node.raft.shutdown();
    }
    for node in nodes {
        node.platform.shutdown();
    }
}

#[test]
fn replicated_write_lands_on_every_node() {
    let dir = TempDir::new().unwrap();
    let nodes = build_cluster(&dir);
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(5));

    // Write through the leader's wire front end
    let mut client = loamdb::Client::connect(&nodes[leader_idx].addr).unwrap();
    client.set_timeout(Duration::from_secs(10)).unwrap();
    let create = ExecuteRequest {
        project: "app".to_string(),
        collection: "users".to_string(),
        op: ExecuteOp::Create,
        doc_id: None,
        payload: Some(json!({"_id": "r1", "replicated": true})),
        patch: None,
        options: None,
        isolation: None,
    };
    let body = client.execute(&create).unwrap();
    assert_eq!(body["_id"], json!("r1"));

    // Every node's engine converges on the document
    let project = ProjectId::new("app").unwrap();
    for node in &nodes {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let lease = node.platform.manager().acquire(&project).unwrap();
            let engine = lease.engine();
            let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
            let found = engine
                .collection("users")
                .unwrap()
                .find_by_id(txn, "r1")
                .unwrap()
                .is_some();
            engine.rollback(txn).unwrap();
            if found {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "node {} never applied the replicated write",
                node.raft.id()
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
    shutdown(nodes);
}

#[test]
fn followers_redirect_writes() {
    let dir = TempDir::new().unwrap();
    let nodes = build_cluster(&dir);
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(5));

    let follower = nodes
        .iter()
        .enumerate()
        .find(|(i, _)| *i != leader_idx)
        .map(|(_, n)| n)
        .unwrap();
    let mut client = loamdb::Client::connect(&follower.addr).unwrap();
    client.set_timeout(Duration::from_secs(5)).unwrap();

    let create = ExecuteRequest {
        project: "app".to_string(),
        collection: "users".to_string(),
        op: ExecuteOp::Create,
        doc_id: None,
        payload: Some(json!({"_id": "nope"})),
        patch: None,
        options: None,
        isolation: None,
    };
    let err = client.execute(&create).unwrap_err();
    assert!(
        err.to_string().contains("replication/not_leader"),
        "unexpected error: {}",
        err
    );

    // Reads stay local and keep working on followers
    let list = ExecuteRequest {
        op: ExecuteOp::List,
        payload: None,
        ..create
    };
    client.execute(&list).unwrap();
    shutdown(nodes);
}
