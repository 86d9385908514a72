//! The external configuration service (ECS): owns the ring and drives every
//! membership change.
//!
//! # Node lifecycle
//!
//! ```text
//!   AVAILABLE ──add──► STARTING ──joined──► ACTIVE ──remove──► STOPPING ──left──► AVAILABLE
//!       ▲                 │                   │
//!       └──join timeout───┘                 crash
//!                                             ▼
//!                            ACTIVE ◄── RECOVERING ◄── CRASHED
//! ```
//!
//! # Concurrency
//!
//! Ring, node states and the expected-event gates live behind one lock that
//! the event loop and the API calls share; it is never held across an await.
//! API operations are additionally serialized by an async lock that *is* held
//! while they wait for joins and leaves, which the event loop never takes.

use crate::cluster::coordination::{
    ensure_path, put_data, CoordinationClient, WatchEvent, METADATA_PATH, NODES_PATH,
};
use crate::cluster::events::{
    classify_membership, LoggingEventListener, MemberEvent, MemberEventListener,
};
use crate::cluster::launcher::{NodeDefinition, NodeLauncher};
use crate::config::CoordinatorConfig;
use crate::error::{MembershipError, Result};
use crate::network::client::Connection;
use crate::network::rpc::{ActionStatus, ClusterControl, ControlAction, Message};
use crate::partitioning::{Removal, Ring, RingNode};
use crate::security::MessageSigner;
use crate::types::{NodeName, ECS_SENDER_ID};
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a pool node is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Available,
    Starting,
    Active,
    Stopping,
    Crashed,
    Recovering,
}

#[derive(Debug, Default)]
struct ClusterState {
    ring: Ring,
    pool: BTreeMap<NodeName, NodeDefinition>,
    states: BTreeMap<NodeName, NodeState>,
    /// Last seen children of `/nodes`.
    registered: BTreeSet<NodeName>,
    expected_joins: HashMap<NodeName, oneshot::Sender<()>>,
    expected_leaves: HashMap<NodeName, oneshot::Sender<()>>,
    started: bool,
}

/// The coordinator.
pub struct Coordinator {
    config: CoordinatorConfig,
    signer: MessageSigner,
    coordination: Arc<dyn CoordinationClient>,
    launcher: Arc<dyn NodeLauncher>,
    state: Mutex<ClusterState>,
    operations: tokio::sync::Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn MemberEventListener>>>,
    recovery: mpsc::UnboundedSender<NodeName>,
    shutdown: CancellationToken,
}

impl Coordinator {
    /// Reset the coordination tree, publish an empty ring and start the
    /// membership event loop and the crash recovery task.
    pub async fn new(
        config: CoordinatorConfig,
        signer: MessageSigner,
        coordination: Arc<dyn CoordinationClient>,
        launcher: Arc<dyn NodeLauncher>,
        pool: Vec<NodeDefinition>,
    ) -> Result<Arc<Self>> {
        ensure_path(coordination.as_ref(), NODES_PATH).await?;
        for stale in coordination.children(NODES_PATH).await? {
            let path = format!("{}/{}", NODES_PATH, stale);
            if let Err(e) = coordination.delete(&path).await {
                debug!(%path, error = %e, "Could not remove stale registration");
            }
        }

        let mut state = ClusterState::default();
        for def in pool {
            state.states.insert(def.name.clone(), NodeState::Available);
            state.pool.insert(def.name.clone(), def);
        }

        let (recovery, recovery_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            config,
            signer,
            coordination,
            launcher,
            state: Mutex::new(state),
            operations: tokio::sync::Mutex::new(()),
            listeners: RwLock::new(vec![Arc::new(LoggingEventListener)]),
            recovery,
            shutdown: CancellationToken::new(),
        });

        coordinator.publish(&Ring::new()).await?;
        let events = coordinator.coordination.watch_children(NODES_PATH).await?;
        tokio::spawn(coordinator.clone().run_events(events));
        tokio::spawn(coordinator.clone().run_recovery(recovery_rx));
        info!(pool = coordinator.state.lock().pool.len(), "Coordinator started");
        Ok(coordinator)
    }

    /// Register an additional membership listener.
    pub fn add_listener(&self, listener: Arc<dyn MemberEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Current ring.
    pub fn metadata(&self) -> Ring {
        self.state.lock().ring.clone()
    }

    /// Lifecycle state of every pool node.
    pub fn node_states(&self) -> BTreeMap<NodeName, NodeState> {
        self.state.lock().states.clone()
    }

    /// Check whether the cluster was started.
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Add a random available node.
    pub async fn add_node(&self) -> Result<RingNode> {
        let name = {
            let state = self.state.lock();
            let picked = state
                .states
                .iter()
                .filter(|(_, s)| **s == NodeState::Available)
                .map(|(name, _)| name.clone())
                .choose(&mut rand::thread_rng());
            picked
        };
        match name {
            Some(name) => self.add_specific_node(&name).await,
            None => Err(MembershipError::NoAvailableNode.into()),
        }
    }

    /// Add `count` random nodes, stopping at the first failure.
    pub async fn add_nodes(&self, count: usize) -> Result<Vec<RingNode>> {
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            added.push(self.add_node().await?);
        }
        Ok(added)
    }

    /// Place a pool node on the ring, launch it and hand it its data.
    pub async fn add_specific_node(&self, name: &str) -> Result<RingNode> {
        let _op = self.operations.lock().await;

        let (def, placement, ring, joined) = {
            let mut state = self.state.lock();
            let def = state
                .pool
                .get(name)
                .cloned()
                .ok_or_else(|| MembershipError::NodeNotFound(name.to_string()))?;
            let eligible = matches!(
                state.states.get(name),
                Some(NodeState::Available | NodeState::Crashed | NodeState::Recovering)
            );
            if !eligible || state.ring.contains(name) {
                return Err(MembershipError::NodeAlreadyExists(name.to_string()).into());
            }
            let placement = state
                .ring
                .place(def.ring_node())
                .ok_or_else(|| MembershipError::NodeAlreadyExists(name.to_string()))?;
            let (tx, rx) = oneshot::channel();
            state.expected_joins.insert(name.to_string(), tx);
            state.states.insert(name.to_string(), NodeState::Starting);
            (def, placement, state.ring.clone(), rx)
        };
        info!(node = %name, successor = ?placement.successor.as_ref().map(|n| &n.name), "Adding node");

        let outcome: Result<()> = match self.publish(&ring).await {
            Ok(()) => match self.launcher.launch(&def, &self.config).await {
                Ok(()) => match tokio::time::timeout(self.config.join_timeout, joined).await {
                    Ok(Ok(())) => Ok(()),
                    _ => Err(MembershipError::JoinTimeout(name.to_string()).into()),
                },
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            error!(node = %name, error = %e, "Node did not join, reverting placement");
            let ring = {
                let mut state = self.state.lock();
                state.ring.remove(name);
                state.expected_joins.remove(name);
                state.states.insert(name.to_string(), NodeState::Available);
                state.ring.clone()
            };
            if let Err(e) = self.publish(&ring).await {
                warn!(error = %e, "Failed to publish reverted ring");
            }
            return Err(e);
        }

        let (ring, started) = {
            let state = self.state.lock();
            (state.ring.clone(), state.started)
        };
        let node = ring
            .node(name)
            .cloned()
            .ok_or_else(|| MembershipError::NodeNotFound(name.to_string()))?;
        self.send_control(&node, ClusterControl::new(ControlAction::Init, ECS_SENDER_ID).with_metadata(ring.clone()))
            .await?;

        if let Some(successor) = placement.successor.and_then(|s| ring.node(&s.name).cloned()) {
            self.send_control(&successor, ClusterControl::new(ControlAction::LockWrite, ECS_SENDER_ID))
                .await?;
            let moved = self
                .send_control(
                    &successor,
                    ClusterControl::new(ControlAction::MoveData, ECS_SENDER_ID)
                        .with_move(node.clone(), node.range()),
                )
                .await;
            self.send_control(&successor, ClusterControl::new(ControlAction::UnlockWrite, ECS_SENDER_ID))
                .await?;
            moved?;
        }

        if started {
            self.send_control(&node, ClusterControl::new(ControlAction::Start, ECS_SENDER_ID))
                .await?;
        }
        info!(node = %name, range = %node.range(), "Node added");
        Ok(node)
    }

    /// Take a node off the ring, hand its data to the absorbing node and shut
    /// it down.
    ///
    /// If the node does not leave in time the failure is reported but the
    /// ring is not reverted.
    pub async fn remove_node(&self, name: &str) -> Result<()> {
        let _op = self.operations.lock().await;

        // The leave gate goes in with the ring removal, so the node dropping
        // its registration at any later point reads as a planned leave.
        let (removal, ring, left) = {
            let mut state = self.state.lock();
            let removal = state
                .ring
                .remove(name)
                .ok_or_else(|| MembershipError::NodeNotFound(name.to_string()))?;
            state.states.insert(name.to_string(), NodeState::Stopping);
            let (tx, rx) = oneshot::channel();
            state.expected_leaves.insert(name.to_string(), tx);
            (removal, state.ring.clone(), rx)
        };
        info!(node = %name, absorber = ?removal.absorber.as_ref().map(|n| &n.name), "Removing node");
        if let Err(e) = self.hand_off(&ring, &removal).await {
            self.state.lock().expected_leaves.remove(name);
            return Err(e);
        }

        if let Err(e) = self
            .send_control(&removal.removed, ClusterControl::new(ControlAction::Shutdown, ECS_SENDER_ID))
            .await
        {
            warn!(node = %name, error = %e, "SHUTDOWN not acknowledged");
        }

        match tokio::time::timeout(self.config.leave_timeout, left).await {
            Ok(Ok(())) => {
                info!(node = %name, "Node removed");
                Ok(())
            }
            _ => {
                self.state.lock().expected_leaves.remove(name);
                error!(node = %name, "Node did not leave in time");
                Err(MembershipError::LeaveTimeout(name.to_string()).into())
            }
        }
    }

    /// Publish the ring without the removed node and move its data to the
    /// absorber under a write lock.
    async fn hand_off(&self, ring: &Ring, removal: &Removal) -> Result<()> {
        self.publish(ring).await?;

        let removed = &removal.removed;
        if let Err(e) = self
            .send_control(removed, ClusterControl::new(ControlAction::Stop, ECS_SENDER_ID))
            .await
        {
            warn!(node = %removed.name, error = %e, "STOP not acknowledged");
        }

        if let Some(absorber) = &removal.absorber {
            self.send_control(absorber, ClusterControl::new(ControlAction::LockWrite, ECS_SENDER_ID))
                .await?;
            let moved = self
                .send_control(
                    removed,
                    ClusterControl::new(ControlAction::MoveData, ECS_SENDER_ID)
                        .with_move(absorber.clone(), removed.range()),
                )
                .await;
            self.send_control(absorber, ClusterControl::new(ControlAction::UnlockWrite, ECS_SENDER_ID))
                .await?;
            if let Err(e) = moved {
                warn!(node = %removed.name, error = %e, "Data hand-off failed");
            }
        }
        Ok(())
    }

    /// Let every node on the ring serve clients.
    pub async fn start(&self) -> Result<()> {
        self.state.lock().started = true;
        self.broadcast(ControlAction::Start).await
    }

    /// Stop every node from serving clients.
    pub async fn stop(&self) -> Result<()> {
        self.state.lock().started = false;
        self.broadcast(ControlAction::Stop).await
    }

    /// Remove every node from the ring.
    pub async fn shutdown(&self) -> Result<()> {
        let names = self.state.lock().ring.names();
        let mut first_error = None;
        for name in names {
            if let Err(e) = self.remove_node(&name).await {
                error!(node = %name, error = %e, "Failed to remove node during shutdown");
                first_error.get_or_insert(e);
            }
        }
        self.state.lock().started = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Stop the coordinator's own tasks and end its coordination session.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.coordination.close().await
    }

    async fn broadcast(&self, action: ControlAction) -> Result<()> {
        let nodes = self.state.lock().ring.nodes().to_vec();
        let mut first_error = None;
        for node in nodes {
            if let Err(e) = self
                .send_control(&node, ClusterControl::new(action, ECS_SENDER_ID))
                .await
            {
                warn!(node = %node.name, %action, error = %e, "Control failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Sign and send a command, waiting for a successful acknowledgement.
    async fn send_control(&self, node: &RingNode, mut ctrl: ClusterControl) -> Result<()> {
        let action = ctrl.action;
        self.signer.sign(&mut ctrl);
        let mut conn = Connection::connect(
            &node.addr(),
            self.config.connect_timeout,
            self.config.request_timeout,
        )
        .await?;
        conn.identify(ECS_SENDER_ID).await?;
        match conn.request(Message::Control(ctrl)).await? {
            Message::Control(ack) if ack.status == Some(ActionStatus::Success) => {
                debug!(node = %node.name, %action, "Control acknowledged");
                Ok(())
            }
            other => {
                debug!(node = %node.name, %action, reply = ?other, "Control rejected");
                Err(MembershipError::ControlRejected {
                    node: node.name.clone(),
                    action: action.to_string(),
                }
                .into())
            }
        }
    }

    /// Publish a signed UPDATE_METADATA carrying `ring` at `/metadata`.
    async fn publish(&self, ring: &Ring) -> Result<()> {
        let mut ctrl =
            ClusterControl::new(ControlAction::UpdateMetadata, ECS_SENDER_ID).with_metadata(ring.clone());
        self.signer.sign(&mut ctrl);
        let data = serde_json::to_vec(&ctrl)?;
        put_data(self.coordination.as_ref(), METADATA_PATH, data).await?;
        debug!(nodes = ring.len(), "Published metadata");
        Ok(())
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<WatchEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let WatchEvent::ChildrenChanged { children, .. } = event {
                self.on_membership(children.into_iter().collect()).await;
            }
        }
        debug!("Coordinator event loop stopped");
    }

    async fn on_membership(&self, current: BTreeSet<NodeName>) {
        let (events, ring) = {
            let mut state = self.state.lock();
            let events = classify_membership(
                &state.registered,
                &current,
                |n| state.expected_joins.contains_key(n),
                |n| state.expected_leaves.contains_key(n),
            );
            for event in &events {
                match event {
                    MemberEvent::PlannedJoin { node } => {
                        if let Some(gate) = state.expected_joins.remove(node) {
                            let _ = gate.send(());
                        }
                        state.states.insert(node.clone(), NodeState::Active);
                    }
                    MemberEvent::UnexpectedJoin { .. } => {}
                    MemberEvent::PlannedLeave { node } => {
                        if let Some(gate) = state.expected_leaves.remove(node) {
                            let _ = gate.send(());
                        }
                        state.states.insert(node.clone(), NodeState::Available);
                    }
                    MemberEvent::Crash { node } => {
                        state.ring.remove(node);
                        state.states.insert(node.clone(), NodeState::Crashed);
                    }
                }
            }
            state.registered = current;
            (events, state.ring.clone())
        };

        for event in &events {
            for listener in self.listeners.read().iter() {
                listener.on_event(event);
            }
        }
        if let Err(e) = self.publish(&ring).await {
            error!(error = %e, "Failed to publish metadata");
        }
        for event in events {
            if let MemberEvent::Crash { node } = event {
                let _ = self.recovery.send(node);
            }
        }
    }

    async fn run_recovery(self: Arc<Self>, mut crashed: mpsc::UnboundedReceiver<NodeName>) {
        loop {
            let node = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                node = crashed.recv() => match node {
                    Some(node) => node,
                    None => break,
                },
            };
            // Let the survivors reconcile before the node comes back.
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.recovery_grace) => {}
            }

            self.state
                .lock()
                .states
                .insert(node.clone(), NodeState::Recovering);
            info!(node = %node, "Reviving crashed node");
            match self.add_specific_node(&node).await {
                Ok(_) => {
                    if let Err(e) = self.start().await {
                        warn!(error = %e, "START after recovery failed on some nodes");
                    }
                    info!(node = %node, "Crashed node revived");
                }
                Err(e) => {
                    error!(node = %node, error = %e, "Failed to revive crashed node");
                    self.state
                        .lock()
                        .states
                        .insert(node.clone(), NodeState::Crashed);
                }
            }
        }
        debug!("Coordinator recovery task stopped");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Coordinator")
            .field("ring", &state.ring.names())
            .field("states", &state.states)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::coordination::{CreateMode, InMemoryCoordination};
    use crate::error::Error;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Accepts every launch but never starts anything.
    struct IdleLauncher;

    #[async_trait]
    impl NodeLauncher for IdleLauncher {
        async fn launch(&self, _node: &NodeDefinition, _config: &CoordinatorConfig) -> Result<()> {
            Ok(())
        }
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_membership_timeouts(Duration::from_millis(100), Duration::from_millis(100))
    }

    async fn published_ring(session: &dyn CoordinationClient) -> Ring {
        let data = session.get_data(METADATA_PATH).await.unwrap();
        let ctrl: ClusterControl = serde_json::from_slice(&data).unwrap();
        MessageSigner::development_ecs().verifier().verify(&ctrl).unwrap();
        assert_eq!(ctrl.action, ControlAction::UpdateMetadata);
        ctrl.metadata.unwrap()
    }

    #[tokio::test]
    async fn test_setup_resets_tree() {
        let tree = InMemoryCoordination::new();
        let stale = tree.connect();
        ensure_path(stale.as_ref(), NODES_PATH).await.unwrap();
        stale
            .create("/nodes/old", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();

        let session = tree.connect();
        let coordinator = Coordinator::new(
            config(),
            MessageSigner::development_ecs(),
            session.clone(),
            Arc::new(IdleLauncher),
            vec![NodeDefinition::new("node-1", "127.0.0.1", 1)],
        )
        .await
        .unwrap();

        assert!(session.children(NODES_PATH).await.unwrap().is_empty());
        assert!(published_ring(session.as_ref()).await.is_empty());
        assert_eq!(
            coordinator.node_states().get("node-1"),
            Some(&NodeState::Available)
        );
        coordinator.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_timeout_reverts_placement() {
        let tree = InMemoryCoordination::new();
        let session = tree.connect();
        let coordinator = Coordinator::new(
            config(),
            MessageSigner::development_ecs(),
            session.clone(),
            Arc::new(IdleLauncher),
            vec![NodeDefinition::new("node-1", "127.0.0.1", 1)],
        )
        .await
        .unwrap();

        let err = coordinator.add_specific_node("node-1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Membership(MembershipError::JoinTimeout(_))
        ));
        assert!(coordinator.metadata().is_empty());
        assert!(published_ring(session.as_ref()).await.is_empty());
        assert_eq!(
            coordinator.node_states().get("node-1"),
            Some(&NodeState::Available)
        );
    }

    #[tokio::test]
    async fn test_unknown_and_exhausted_pool() {
        let tree = InMemoryCoordination::new();
        let coordinator = Coordinator::new(
            config(),
            MessageSigner::development_ecs(),
            tree.connect(),
            Arc::new(IdleLauncher),
            Vec::new(),
        )
        .await
        .unwrap();

        let err = coordinator.add_specific_node("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Membership(MembershipError::NodeNotFound(_))
        ));
        let err = coordinator.add_node().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Membership(MembershipError::NoAvailableNode)
        ));
        let err = coordinator.remove_node("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Membership(MembershipError::NodeNotFound(_))
        ));
        assert!(coordinator.shutdown().await.is_ok());
    }
}
