//! Cluster-level tests: elections, replication, passive members, routing
//! and crash recovery, all over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use keel_raft::{
    ConsistencyLevel, ErrorKind, InMemoryTransport, LogIndex, MemoryStateMachine, NodeId,
    QueryRequest, RaftClient, RaftConfig, RaftServer, RaftServerHandle, ResponseStatus, Role,
    Term, UnreachableTransport,
};

fn fast_config() -> RaftConfig {
    RaftConfig {
        heartbeat_interval: Duration::from_millis(40),
        election_timeout_min: Duration::from_millis(100),
        election_timeout_max: Duration::from_millis(200),
        forward_timeout: Duration::from_millis(1000),
        ..Default::default()
    }
}

struct TestNode {
    id: NodeId,
    handle: RaftServerHandle,
    _dir: TempDir,
    _task: JoinHandle<()>,
}

struct TestCluster {
    nodes: Vec<TestNode>,
    transport: Arc<InMemoryTransport>,
}

impl TestCluster {
    /// Starts `voting` follower nodes plus `passive` passive nodes, all in
    /// one membership, wired through a shared in-memory transport.
    async fn start(voting: usize, passive: usize) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let transport = Arc::new(InMemoryTransport::new());
        let members: Vec<NodeId> = (0..voting + passive)
            .map(|i| NodeId::new(format!("n{i}")))
            .collect();

        let mut nodes = Vec::new();
        for (i, id) in members.iter().enumerate() {
            let role = if i < voting {
                Role::Follower
            } else {
                Role::Passive
            };
            let dir = TempDir::new().unwrap();
            let (server, handle) = RaftServer::new(
                id.clone(),
                members.clone(),
                dir.path(),
                Box::new(MemoryStateMachine::new()),
                transport.clone(),
                role,
                fast_config(),
            )
            .unwrap();

            transport.add_peer(id.clone(), handle.clone());
            let task = tokio::spawn(async move {
                let _ = server.run().await;
            });
            nodes.push(TestNode {
                id: id.clone(),
                handle,
                _dir: dir,
                _task: task,
            });
        }

        TestCluster { nodes, transport }
    }

    fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    async fn wait_for_leader(&self) -> NodeId {
        for _ in 0..100 {
            for node in &self.nodes {
                if let Ok(status) = node.handle.status().await {
                    if status.role == Role::Leader {
                        return node.id.clone();
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no leader elected within the deadline");
    }

    async fn wait_for_applied(&self, node: usize, index: LogIndex) {
        for _ in 0..100 {
            if let Ok(status) = self.nodes[node].handle.status().await {
                if status.last_applied >= index {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "node {} did not apply up to {index} within the deadline",
            self.nodes[node].id
        );
    }

    fn node(&self, id: &NodeId) -> &TestNode {
        self.nodes.iter().find(|n| &n.id == id).unwrap()
    }

    /// Cuts a node off from everyone, including inbound traffic.
    fn partition(&self, id: &NodeId) {
        self.transport.remove_peer(id);
    }
}

#[tokio::test]
async fn test_three_nodes_elect_exactly_one_leader() {
    let cluster = TestCluster::start(3, 0).await;
    let leader = cluster.wait_for_leader().await;

    // Settle, then count leaders and compare terms.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut leaders = Vec::new();
    let mut terms = Vec::new();
    for node in &cluster.nodes {
        let status = node.handle.status().await.unwrap();
        if status.role == Role::Leader {
            leaders.push(node.id.clone());
        }
        terms.push(status.term);
    }

    assert_eq!(leaders, vec![leader.clone()]);
    // Everyone ends up in the leader's term.
    assert!(terms.iter().all(|t| *t == terms[0]));

    // Followers learned who leads.
    for node in &cluster.nodes {
        let status = node.handle.status().await.unwrap();
        assert_eq!(status.leader.as_ref(), Some(&leader));
    }
}

#[tokio::test]
async fn test_commands_replicate_to_every_node() {
    let cluster = TestCluster::start(3, 0).await;
    cluster.wait_for_leader().await;

    let client = RaftClient::new(cluster.transport.clone(), cluster.ids());
    let response = client.command(Bytes::from("set city lisbon")).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    let committed = response.index;

    for i in 0..cluster.nodes.len() {
        cluster.wait_for_applied(i, committed).await;
    }

    // Every node answers the sequential read from its own state machine.
    for node in &cluster.nodes {
        let response = node
            .handle
            .query(QueryRequest {
                session: 0,
                sequence: 1,
                index: LogIndex::ZERO,
                consistency: ConsistencyLevel::Sequential,
                bytes: Bytes::from("get city"),
            })
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.result, Some(Bytes::from("lisbon")));
    }
}

#[tokio::test]
async fn test_leader_loss_triggers_reelection() {
    let cluster = TestCluster::start(3, 0).await;
    let first = cluster.wait_for_leader().await;

    cluster.partition(&first);
    cluster.node(&first).handle.shutdown().await;

    // The survivors elect a replacement and keep accepting commands.
    let second = loop {
        let candidate = cluster.wait_for_leader().await;
        if candidate != first {
            break candidate;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_ne!(first, second);

    let survivors: Vec<NodeId> = cluster.ids().into_iter().filter(|n| n != &first).collect();
    let client = RaftClient::new(cluster.transport.clone(), survivors);
    let response = client.command(Bytes::from("set after failover")).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
}

#[tokio::test]
async fn test_passive_member_materializes_committed_entries() {
    let cluster = TestCluster::start(3, 1).await;
    cluster.wait_for_leader().await;

    let client = RaftClient::new(cluster.transport.clone(), cluster.ids());
    let response = client.command(Bytes::from("set kind passive")).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);

    // The passive node is index 3; it only ever sees committed entries.
    cluster.wait_for_applied(3, response.index).await;

    let status = cluster.nodes[3].handle.status().await.unwrap();
    assert_eq!(status.role, Role::Passive);
    // A passive log never runs ahead of its commit pointer.
    assert!(status.last_index <= status.commit_index);
    assert!(status.last_applied <= status.commit_index);

    let response = cluster.nodes[3]
        .handle
        .query(QueryRequest {
            session: 0,
            sequence: 1,
            index: LogIndex::ZERO,
            consistency: ConsistencyLevel::Sequential,
            bytes: Bytes::from("get kind"),
        })
        .await
        .unwrap();
    assert_eq!(response.result, Some(Bytes::from("passive")));
}

#[tokio::test]
async fn test_linearizable_query_forwards_to_leader() {
    let cluster = TestCluster::start(3, 0).await;
    let leader = cluster.wait_for_leader().await;

    let client = RaftClient::new(cluster.transport.clone(), cluster.ids());
    client.command(Bytes::from("set mode strict")).await.unwrap();

    // Ask a follower directly; the answer must come from the leader's state.
    let follower = cluster.nodes.iter().find(|n| n.id != leader).unwrap();
    let response = follower
        .handle
        .query(QueryRequest {
            session: 0,
            sequence: 1,
            index: LogIndex::ZERO,
            consistency: ConsistencyLevel::Linearizable,
            bytes: Bytes::from("get mode"),
        })
        .await
        .unwrap();

    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.result, Some(Bytes::from("strict")));
}

#[tokio::test]
async fn test_query_without_leader_reports_no_leader() {
    // A lone follower in a three-member cluster can never win an election.
    let transport = Arc::new(UnreachableTransport);
    let members = vec![NodeId::new("n0"), NodeId::new("n1"), NodeId::new("n2")];
    let dir = TempDir::new().unwrap();

    let (server, handle) = RaftServer::new(
        NodeId::new("n0"),
        members,
        dir.path(),
        Box::new(MemoryStateMachine::new()),
        transport,
        Role::Follower,
        fast_config(),
    )
    .unwrap();
    let _task = tokio::spawn(async move {
        let _ = server.run().await;
    });

    let response = handle
        .query(QueryRequest {
            session: 0,
            sequence: 1,
            index: LogIndex::ZERO,
            consistency: ConsistencyLevel::Linearizable,
            bytes: Bytes::from("get anything"),
        })
        .await
        .unwrap();

    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error, Some(ErrorKind::NoLeader));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_restart_recovers_term_and_log() {
    let transport = Arc::new(InMemoryTransport::new());
    let members = vec![NodeId::new("solo")];
    let dir = TempDir::new().unwrap();

    let first_term: Term;
    let committed: LogIndex;
    {
        let (server, handle) = RaftServer::new(
            NodeId::new("solo"),
            members.clone(),
            dir.path(),
            Box::new(MemoryStateMachine::new()),
            transport.clone(),
            Role::Follower,
            fast_config(),
        )
        .unwrap();
        transport.add_peer(NodeId::new("solo"), handle.clone());
        let task = tokio::spawn(async move {
            let _ = server.run().await;
        });

        // A single node elects itself and commits immediately.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = handle.status().await.unwrap();
            if status.role == Role::Leader {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no self-election");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let client = RaftClient::new(transport.clone(), members.clone());
        client.command(Bytes::from("set durable yes")).await.unwrap();
        let response = client.command(Bytes::from("set extra 1")).await.unwrap();
        committed = response.index;

        let status = handle.status().await.unwrap();
        first_term = status.term;

        handle.shutdown().await;
        let _ = task.await;
        transport.remove_peer(&NodeId::new("solo"));
    }

    // Reopen on the same directory: term and log must have survived.
    let (server, handle) = RaftServer::new(
        NodeId::new("solo"),
        members.clone(),
        dir.path(),
        Box::new(MemoryStateMachine::new()),
        transport.clone(),
        Role::Follower,
        fast_config(),
    )
    .unwrap();
    transport.add_peer(NodeId::new("solo"), handle.clone());
    let _task = tokio::spawn(async move {
        let _ = server.run().await;
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let status = loop {
        let status = handle.status().await.unwrap();
        if status.role == Role::Leader && status.last_applied >= committed {
            break status;
        }
        assert!(tokio::time::Instant::now() < deadline, "no recovery");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    // The new term strictly advances past the persisted one.
    assert!(status.term > first_term);
    assert!(status.last_index >= committed);

    let response = handle
        .query(QueryRequest {
            session: 0,
            sequence: 1,
            index: LogIndex::ZERO,
            consistency: ConsistencyLevel::Sequential,
            bytes: Bytes::from("get durable"),
        })
        .await
        .unwrap();
    assert_eq!(response.result, Some(Bytes::from("yes")));
}
