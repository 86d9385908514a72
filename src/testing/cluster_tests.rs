//! End-to-end tests against an in-process cluster.
//!
//! Every test runs a real coordinator and real storage nodes talking over
//! TCP on localhost; only the coordination service is in memory.

#[cfg(test)]
mod tests {
    use crate::client::KvClient;
    use crate::cluster::coordinator::NodeState;
    use crate::cluster::{MemberEvent, MemberEventListener};
    use crate::network::client::Connection;
    use crate::network::rpc::{
        DataTransfer, KvMessage, Message, ReplicationEnvelope, StatusType, TransferKind,
    };
    use crate::security::MessageSigner;
    use crate::testing::{wait_for_result, TestCluster};
    use crate::types::Partition;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(15);

    async fn running_cluster(nodes: usize) -> (TempDir, TestCluster) {
        let dir = TempDir::new().unwrap();
        let cluster = TestCluster::start(dir.path(), nodes, TestCluster::fast_config())
            .await
            .unwrap();
        cluster.coordinator.add_nodes(nodes).await.unwrap();
        cluster.coordinator.start().await.unwrap();
        (dir, cluster)
    }

    /// GET through a fresh routed client until it returns `expected`.
    async fn eventually_reads(cluster: &TestCluster, key: &str, expected: Option<&str>) -> bool {
        wait_for_result(
            || async {
                let mut client = cluster.client("reader").await.ok()?;
                client.get(key).await.ok()
            },
            |reply: &Option<KvMessage>| match (reply, expected) {
                (Some(msg), Some(value)) => {
                    msg.status == StatusType::GetSuccess && msg.value.as_deref() == Some(value)
                }
                (Some(msg), None) => msg.status == StatusType::GetError,
                (None, _) => false,
            },
            WAIT,
        )
        .await
        .is_some()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_put_get_update_delete() {
        let (_dir, cluster) = running_cluster(3).await;
        let mut client = cluster.client("alice").await.unwrap();

        assert_eq!(client.put("color", "red").await.unwrap().status, StatusType::PutSuccess);
        assert_eq!(client.put("color", "blue").await.unwrap().status, StatusType::PutUpdate);

        let reply = client.get("color").await.unwrap();
        assert_eq!(reply.status, StatusType::GetSuccess);
        assert_eq!(reply.value.as_deref(), Some("blue"));

        assert_eq!(client.delete("color").await.unwrap().status, StatusType::DeleteSuccess);
        assert_eq!(client.get("color").await.unwrap().status, StatusType::GetError);
        assert_eq!(client.delete("color").await.unwrap().status, StatusType::DeleteError);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writes_reach_both_replicas() {
        let (_dir, cluster) = running_cluster(3).await;
        let mut client = cluster.client("alice").await.unwrap();
        assert!(client.put("replicated", "v1").await.unwrap().status.is_write_success());

        let replicas = cluster.replica_addrs("replicated");
        assert_eq!(replicas.len(), 2);
        for addr in replicas {
            let found = wait_for_result(
                || async {
                    let mut reader = KvClient::connect(&addr, "reader").await.ok()?;
                    let msg = reader.signed_request(StatusType::Get, "replicated", None);
                    reader.send_request(msg).await.ok()
                },
                |reply| {
                    matches!(reply, Some(msg) if msg.status == StatusType::GetSuccess
                        && msg.value.as_deref() == Some("v1"))
                },
                WAIT,
            )
            .await;
            assert!(found.is_some(), "replica at {} never saw the write", addr);
        }

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wrong_node_answers_not_responsible_with_ring() {
        let (_dir, cluster) = running_cluster(3).await;
        let ring = cluster.coordinator.metadata();
        let owner = ring.owner_of("routed").unwrap().clone();
        let other = ring.nodes().iter().find(|n| n.name != owner.name).unwrap();

        let mut client = KvClient::connect(&other.addr(), "alice").await.unwrap();
        let msg = client.signed_request(StatusType::Put, "routed", Some("x".into()));
        let reply = client.send_request(msg).await.unwrap();
        assert_eq!(reply.status, StatusType::NotResponsible);
        assert_eq!(reply.metadata.as_ref(), Some(&ring));

        // The routing path follows the attached ring to the owner.
        assert_eq!(client.put("routed", "x").await.unwrap().status, StatusType::PutSuccess);
        assert_eq!(client.addr(), owner.addr());

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_invalid_requests() {
        let (_dir, cluster) = running_cluster(1).await;
        let mut client = cluster.client("alice").await.unwrap();

        let long_key = "k".repeat(21);
        assert_eq!(client.put(&long_key, "v").await.unwrap().status, StatusType::Failed);
        assert_eq!(client.put(&"k".repeat(20), "v").await.unwrap().status, StatusType::PutSuccess);

        let huge = "v".repeat(120 * 1024 + 1);
        assert_eq!(client.put("big", &huge).await.unwrap().status, StatusType::Failed);

        let msg = client.signed_request(StatusType::Put, "once", Some("v".into()));
        let first = client.send_request(msg.clone()).await.unwrap();
        assert_eq!(first.status, StatusType::PutSuccess);
        let replayed = client.send_request(msg).await.unwrap();
        assert_eq!(replayed.status, StatusType::AuthFailed);

        let mut forged = client.signed_request(StatusType::Put, "forged", Some("v".into()));
        forged.value = Some("tampered".into());
        let reply = client.send_request(forged).await.unwrap();
        assert_eq!(reply.status, StatusType::AuthFailed);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_server_stopped_until_started() {
        let dir = TempDir::new().unwrap();
        let cluster = TestCluster::start(dir.path(), 1, TestCluster::fast_config())
            .await
            .unwrap();
        cluster.coordinator.add_node().await.unwrap();

        let mut client = cluster.client("alice").await.unwrap();
        assert_eq!(client.put("k", "v").await.unwrap().status, StatusType::ServerStopped);

        cluster.coordinator.start().await.unwrap();
        assert_eq!(client.put("k", "v").await.unwrap().status, StatusType::PutSuccess);

        cluster.coordinator.stop().await.unwrap();
        assert_eq!(client.get("k").await.unwrap().status, StatusType::ServerStopped);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscriber_notified_of_update_and_delete() {
        let (_dir, cluster) = running_cluster(2).await;
        let mut writer = cluster.client_for("watched", "writer").await.unwrap();
        assert_eq!(writer.put("watched", "v1").await.unwrap().status, StatusType::PutSuccess);

        let mut watcher = cluster.client_for("watched", "watcher").await.unwrap();
        assert_eq!(
            watcher.subscribe("watched").await.unwrap().status,
            StatusType::SubscribeSuccess
        );

        assert_eq!(writer.put("watched", "v2").await.unwrap().status, StatusType::PutUpdate);
        let notice = watcher.next_notification(WAIT).await.unwrap();
        assert_eq!(notice.status, StatusType::Notify);
        assert_eq!(notice.key, "watched");
        assert_eq!(notice.value.as_deref(), Some("v2"));

        assert_eq!(writer.delete("watched").await.unwrap().status, StatusType::DeleteSuccess);
        let notice = watcher.next_notification(WAIT).await.unwrap();
        assert_eq!(notice.value, None);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_added_node_receives_its_range() {
        let dir = TempDir::new().unwrap();
        let cluster = TestCluster::start(dir.path(), 3, TestCluster::fast_config())
            .await
            .unwrap();
        cluster.coordinator.add_node().await.unwrap();
        cluster.coordinator.start().await.unwrap();

        let keys: Vec<String> = (0..20).map(|i| format!("key-{}", i)).collect();
        let mut client = cluster.client("alice").await.unwrap();
        for key in &keys {
            assert!(client.put(key, key).await.unwrap().status.is_write_success());
        }

        cluster.coordinator.add_nodes(2).await.unwrap();
        assert_eq!(cluster.coordinator.metadata().len(), 3);
        for key in &keys {
            assert!(eventually_reads(&cluster, key, Some(key)).await, "lost {}", key);
        }

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_removed_node_hands_off_data() {
        let (_dir, cluster) = running_cluster(3).await;
        let mut client = cluster.client("alice").await.unwrap();
        let keys: Vec<String> = (0..20).map(|i| format!("key-{}", i)).collect();
        for key in &keys {
            assert!(client.put(key, key).await.unwrap().status.is_write_success());
        }

        let ring = cluster.coordinator.metadata();
        let victim = ring.owner_of("key-0").unwrap().name.clone();
        cluster.coordinator.remove_node(&victim).await.unwrap();

        assert_eq!(cluster.coordinator.metadata().len(), 2);
        assert_eq!(
            cluster.coordinator.node_states().get(&victim),
            Some(&NodeState::Available)
        );
        assert!(!cluster.launcher.running().contains(&victim));
        for key in &keys {
            assert!(eventually_reads(&cluster, key, Some(key)).await, "lost {}", key);
        }

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crashed_node_is_recovered() {
        let (_dir, cluster) = running_cluster(3).await;
        let mut client = cluster.client("alice").await.unwrap();
        let keys: Vec<String> = (0..20).map(|i| format!("key-{}", i)).collect();
        for key in &keys {
            assert!(client.put(key, key).await.unwrap().status.is_write_success());
        }
        // Let replication settle before pulling a node.
        for key in &keys {
            let replicas = cluster.replica_addrs(key);
            for addr in replicas {
                let seen = wait_for_result(
                    || async {
                        let mut reader = KvClient::connect(&addr, "reader").await.ok()?;
                        let msg = reader.signed_request(StatusType::Get, key, None);
                        reader.send_request(msg).await.ok()
                    },
                    |reply| matches!(reply, Some(msg) if msg.status == StatusType::GetSuccess),
                    WAIT,
                )
                .await;
                assert!(seen.is_some());
            }
        }

        let victim = cluster.coordinator.metadata().owner_of("key-0").unwrap().name.clone();
        assert!(cluster.launcher.crash(&victim).await);

        let recovered = wait_for_result(
            || async { cluster.coordinator.node_states().get(&victim).copied() },
            |state| *state == Some(NodeState::Active),
            Duration::from_secs(30),
        )
        .await;
        assert!(recovered.is_some(), "{} was not revived", victim);
        assert!(cluster.coordinator.metadata().contains(&victim));

        for key in &keys {
            assert!(eventually_reads(&cluster, key, Some(key)).await, "lost {}", key);
        }

        cluster.stop().await;
    }

    async fn connect_as(addr: &str, identity: &str) -> Connection {
        let mut conn = Connection::connect(addr, Duration::from_secs(2), Duration::from_secs(5))
            .await
            .unwrap();
        conn.identify(identity).await.unwrap();
        conn
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_published_ring_update_cannot_delete_primary_data() {
        let (_dir, cluster) = running_cluster(3).await;
        let mut client = cluster.client("alice").await.unwrap();
        assert!(client.put("guarded", "v").await.unwrap().status.is_write_success());

        let ring = cluster.coordinator.metadata();
        let owner = ring.owner_of("guarded").unwrap().clone();
        let peer = ring.predecessor_of(&owner.name).unwrap().name.clone();
        let published = cluster
            .launcher
            .services(&owner.name)
            .unwrap()
            .ctx
            .authorization()
            .unwrap();
        let wipe = DataTransfer::new(TransferKind::DeleteData, Partition::Primary)
            .with_range(owner.range())
            .with_authorization(Some(published));

        for identity in [peer.as_str(), "mallory"] {
            let mut conn = connect_as(&owner.addr(), identity).await;
            match conn.request(Message::DataTransfer(wipe.clone())).await.unwrap() {
                Message::DataTransfer(reply) => {
                    assert_eq!(reply.kind, TransferKind::Failure);
                    assert!(reply.message.unwrap_or_default().starts_with("AUTH_FAILED"));
                }
                other => panic!("unexpected reply {:?}", other),
            }
        }

        let reply = client.get("guarded").await.unwrap();
        assert_eq!(reply.status, StatusType::GetSuccess);
        assert_eq!(reply.value.as_deref(), Some("v"));

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_client_cannot_write_replica_directly() {
        let (_dir, cluster) = running_cluster(3).await;
        let replica = cluster.replica_addrs("sideways").remove(0);

        let mut msg = KvMessage::request(StatusType::Put, "sideways", Some("v".into()), "alice");
        MessageSigner::development_client().sign(&mut msg);
        let mut conn = connect_as(&replica, "alice").await;
        let envelope = Message::Replication(ReplicationEnvelope { message: msg });
        match conn.request(envelope).await.unwrap() {
            Message::Kv(reply) => assert_eq!(reply.status, StatusType::AuthFailed),
            other => panic!("unexpected reply {:?}", other),
        }

        let mut reader = KvClient::connect(&replica, "reader").await.unwrap();
        let get = reader.signed_request(StatusType::Get, "sideways", None);
        assert_eq!(reader.send_request(get).await.unwrap().status, StatusType::GetError);

        cluster.stop().await;
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<MemberEvent>>,
    }

    impl MemberEventListener for RecordingListener {
        fn on_event(&self, event: &MemberEvent) {
            self.events.lock().push(event.clone());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_node_leaving_during_removal_is_not_a_crash() {
        let (_dir, cluster) = running_cluster(3).await;
        let listener = Arc::new(RecordingListener::default());
        cluster.coordinator.add_listener(listener.clone());
        let victim = cluster.coordinator.metadata().names()[0].clone();

        // Drop the node's registration as soon as it is off the ring, before
        // STOP and the hand-off have run.
        let dropper = {
            let coordinator = cluster.coordinator.clone();
            let launcher = cluster.launcher.clone();
            let victim = victim.clone();
            tokio::spawn(async move {
                wait_for_result(
                    || async { Some(coordinator.metadata().contains(&victim)) },
                    |on_ring| *on_ring == Some(false),
                    WAIT,
                )
                .await;
                launcher.crash(&victim).await
            })
        };
        cluster.coordinator.remove_node(&victim).await.unwrap();
        assert!(dropper.await.unwrap());

        let events = listener.events.lock().clone();
        assert!(events.contains(&MemberEvent::PlannedLeave { node: victim.clone() }));
        assert!(!events.contains(&MemberEvent::Crash { node: victim.clone() }));

        // Recovery would put the node back; it must stay off the ring.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!cluster.coordinator.metadata().contains(&victim));
        assert_eq!(
            cluster.coordinator.node_states().get(&victim),
            Some(&NodeState::Available)
        );

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_empties_ring() {
        let (_dir, cluster) = running_cluster(2).await;
        cluster.coordinator.shutdown().await.unwrap();
        assert!(cluster.coordinator.metadata().is_empty());
        assert!(cluster.launcher.running().is_empty());
        assert!(cluster
            .coordinator
            .node_states()
            .values()
            .all(|s| *s == NodeState::Available));
        cluster.stop().await;
    }
}
