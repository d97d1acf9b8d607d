//! Per-flow state machine and graph walker
//!
//! A [`Flow`] owns the node instances materialized from one
//! [`FlowDefinition`] and drives them through the lifecycle
//! `load -> configure -> start -> run -> stop`. Each matching trigger event
//! spawns one independent execution ("subflow") that walks the graph
//! node-by-node until it reaches a node with no successor. Many subflows of
//! the same flow run concurrently; `stop` drains all of them before node
//! cleanup runs.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::connector::ConnectorRegistry;
use crate::error::{EngineError, Result};
use crate::model::{
    ControlSignal, FlowDefinition, FlowOperationalContext, FlowRunner, FlowState, FlowStats,
    NodeId, ReactorEvent,
};
use crate::node::{FlowNode, NodeRegistry};
use crate::variables::VariableStore;

/// How often `stop` re-checks reactors and the subflow counter
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Buffer of the per-walk reactor event channel
const REACTOR_EVENT_BUFFER: usize = 1;

/// Handle to one running instance of a node graph
///
/// Cheap to clone; all clones drive the same underlying machine.
#[derive(Clone)]
pub struct Flow {
    machine: Arc<FlowMachine>,
}

impl Flow {
    /// Build a flow from its definition and register its variable scope
    pub fn new(
        definition: FlowDefinition,
        variables: Arc<VariableStore>,
        node_registry: Arc<NodeRegistry>,
    ) -> Self {
        variables.register_flow(&definition.id);
        let op_ctx = Arc::new(FlowOperationalContext::new(
            definition.id.clone(),
            Arc::new(definition),
        ));
        Self {
            machine: Arc::new(FlowMachine {
                op_ctx,
                nodes: RwLock::new(Vec::new()),
                variables,
                node_registry,
                connectors: RwLock::new(None),
                current_node: RwLock::new(NodeId::new()),
                trigger_counter: AtomicU64::new(0),
                error_counter: AtomicU64::new(0),
                subflow_counter: AtomicUsize::new(0),
                started_at: RwLock::new(None),
                last_execution_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> String {
        self.machine.op_ctx.flow_id.clone()
    }

    pub fn name(&self) -> String {
        self.machine.op_ctx.definition().name.clone()
    }

    pub fn state(&self) -> FlowState {
        self.machine.op_ctx.state()
    }

    /// The definition this flow was materialized from
    pub fn definition(&self) -> Arc<FlowDefinition> {
        self.machine.op_ctx.definition()
    }

    /// Shared operational context (exposed for node implementations)
    pub fn operational_context(&self) -> Arc<FlowOperationalContext> {
        self.machine.op_ctx.clone()
    }

    pub fn set_connector_registry(&self, connectors: Arc<ConnectorRegistry>) {
        *self.machine.connectors.write() = Some(connectors);
    }

    pub fn set_storage_path(&self, path: impl Into<String>) {
        self.machine.op_ctx.set_storage_path(path);
    }

    pub fn set_external_libs_dir(&self, path: impl Into<String>) {
        self.machine.op_ctx.set_ext_libs_dir(path);
    }

    /// Bring the flow to `Running`: configure all nodes and launch the
    /// wait-loop of every start node. No-op when already running.
    pub fn start(&self) -> Result<()> {
        FlowMachine::start(&self.machine)
    }

    /// Stop the flow: signal all reactors, drain in-flight subflows, then
    /// run per-node cleanup. No-op when already stopping.
    pub async fn stop(&self) -> Result<()> {
        self.machine.stop().await
    }

    /// Entry point for one flow execution; normally invoked through the
    /// runner callback handed to start nodes
    pub async fn run(&self, event: ReactorEvent) {
        self.machine.clone().run(event).await;
    }

    pub fn stats(&self) -> FlowStats {
        self.machine.stats()
    }

    pub fn trigger_count(&self) -> u64 {
        self.machine.trigger_counter.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.machine.error_counter.load(Ordering::Relaxed)
    }

    /// Number of currently active executions of this flow
    pub fn active_subflows(&self) -> usize {
        self.machine.subflow_counter.load(Ordering::Acquire)
    }

    /// Replace the definition; takes effect on the next configure pass
    pub fn set_definition(&self, definition: FlowDefinition) {
        self.machine.op_ctx.set_definition(Arc::new(definition));
    }

    /// Unregister the flow's variable scope before the flow is deleted
    pub fn cleanup_before_delete(&self) {
        if self.state() == FlowState::Loaded {
            log::info!("[{}] nothing to clean up", self.id());
        }
        self.machine.variables.unregister_flow(&self.id());
    }
}

/// Shared core of a flow, owned behind an `Arc` so reactor tasks and
/// subflow executions can outlive the public handle's borrows
struct FlowMachine {
    op_ctx: Arc<FlowOperationalContext>,
    nodes: RwLock<Vec<Arc<dyn FlowNode>>>,
    variables: Arc<VariableStore>,
    node_registry: Arc<NodeRegistry>,
    connectors: RwLock<Option<Arc<ConnectorRegistry>>>,
    /// Last node a walker visited, for stats and crash reports
    current_node: RwLock<NodeId>,
    trigger_counter: AtomicU64,
    error_counter: AtomicU64,
    subflow_counter: AtomicUsize,
    started_at: RwLock<Option<DateTime<Utc>>>,
    last_execution_ms: AtomicU64,
}

impl FlowMachine {
    fn node_by_id(&self, id: &str) -> Option<Arc<dyn FlowNode>> {
        self.nodes.read().iter().find(|n| n.meta().id == id).cloned()
    }

    /// A transition id is valid when it is empty (execution ends), or names
    /// an existing node other than the current one
    fn is_transition_valid(&self, current_node_id: &str, transition_node_id: &str) -> bool {
        if transition_node_id.is_empty() {
            return true;
        }
        if current_node_id == transition_node_id {
            log::error!(
                "[{}] transition node can't be the same as the current node '{}'",
                self.op_ctx.flow_id,
                current_node_id
            );
            return false;
        }
        if self.node_by_id(transition_node_id).is_none() {
            log::error!(
                "[{}] transition node '{}' doesn't exist",
                self.op_ctx.flow_id,
                transition_node_id
            );
            return false;
        }
        true
    }

    /// Materialize node instances from the definition and configure them.
    ///
    /// Idempotent: nodes that already exist are reused, which is what makes
    /// live reconfiguration and restart work.
    fn load_and_configure_nodes(&self) -> Result<()> {
        let definition = self.op_ctx.definition();
        log::info!(
            "[{}] initializing flow '{}'",
            self.op_ctx.flow_id,
            definition.name
        );
        for meta in &definition.nodes {
            let node = match self.node_by_id(&meta.id) {
                Some(existing) => {
                    log::debug!("[{}] reusing existing node '{}'", self.op_ctx.flow_id, meta.id);
                    existing
                }
                None => {
                    log::info!(
                        "[{}] loading new node: type = {}, label = {}",
                        self.op_ctx.flow_id,
                        meta.node_type,
                        meta.label
                    );
                    let Some(mut built) = self.node_registry.construct(
                        &meta.node_type,
                        self.op_ctx.clone(),
                        meta.clone(),
                        self.variables.clone(),
                    ) else {
                        log::error!(
                            "[{}] node type '{}' isn't supported, node is skipped",
                            self.op_ctx.flow_id,
                            meta.node_type
                        );
                        continue;
                    };
                    let connectors = self.connectors.read().clone();
                    if let Err(err) = built.load_node_config(connectors.as_deref()) {
                        log::error!(
                            "[{}] node type '{}' can't be loaded: {}",
                            self.op_ctx.flow_id,
                            meta.node_type,
                            err
                        );
                        self.op_ctx.set_state(FlowState::ConfigError);
                        return Err(err);
                    }
                    let node: Arc<dyn FlowNode> = Arc::from(built);
                    self.nodes.write().push(node.clone());
                    node
                }
            };
            if let Err(err) = node.init() {
                log::error!(
                    "[{}] node '{}' failed to initialize: {}",
                    self.op_ctx.flow_id,
                    meta.id,
                    err
                );
                self.op_ctx.set_state(FlowState::ConfigError);
                return Err(EngineError::config(format!(
                    "node '{}' failed to initialize: {err}",
                    meta.id
                )));
            }
        }
        self.op_ctx.set_state(FlowState::Configured);
        Ok(())
    }

    /// The runner callback handed to start-node reactors. Holds a weak
    /// reference so reactor tasks don't keep a deleted flow alive.
    fn make_runner(this: &Arc<Self>) -> FlowRunner {
        let machine = Arc::downgrade(this);
        Arc::new(move |event| {
            if let Some(machine) = machine.upgrade() {
                tokio::spawn(async move {
                    machine.run(event).await;
                });
            }
        })
    }

    fn start(this: &Arc<Self>) -> Result<()> {
        if this.op_ctx.state() == FlowState::Running {
            log::info!("[{}] flow is already running", this.op_ctx.flow_id);
            return Ok(());
        }
        let name = this.op_ctx.definition().name.clone();
        log::info!("[{}] starting flow '{}'", this.op_ctx.flow_id, name);
        this.op_ctx.set_state(FlowState::Starting);
        this.op_ctx.set_running(true);

        if let Err(err) = this.load_and_configure_nodes() {
            this.op_ctx.set_state(FlowState::NotConfigured);
            this.op_ctx.set_running(false);
            log::error!(
                "[{}] flow '{}' is not valid and will not be started: {}",
                this.op_ctx.flow_id,
                name,
                err
            );
            return Err(err);
        }

        let start_nodes: Vec<Arc<dyn FlowNode>> = this
            .nodes
            .read()
            .iter()
            .filter(|n| n.is_start_node())
            .cloned()
            .collect();
        if start_nodes.is_empty() {
            this.op_ctx.set_state(FlowState::NotConfigured);
            this.op_ctx.set_running(false);
            log::error!(
                "[{}] flow '{}' has no trigger or wait node and will not be started",
                this.op_ctx.flow_id,
                name
            );
            return Err(EngineError::NoStartNode);
        }

        let runner = Self::make_runner(this);
        for node in start_nodes {
            node.set_flow_runner(runner.clone());
            if !node.is_reactor_running() {
                let reactor = node.clone();
                tokio::spawn(async move {
                    reactor.wait_for_event(None).await;
                });
            }
        }
        *this.started_at.write() = Some(Utc::now());
        this.op_ctx.set_state(FlowState::Running);
        log::info!("[{}] flow '{}' is running", this.op_ctx.flow_id, name);
        Ok(())
    }

    /// One concurrent flow execution. Crashes are contained here: a panic
    /// in a node aborts this execution only and is logged with the node
    /// that was current at the time.
    async fn run(self: Arc<Self>, event: ReactorEvent) {
        let _guard = SubflowGuard::enter(&self.subflow_counter);
        let name = self.op_ctx.definition().name.clone();
        log::info!("[{}] flow '{}' execution started", self.op_ctx.flow_id, name);
        let started = Instant::now();

        match AssertUnwindSafe(self.walk(event)).catch_unwind().await {
            Ok(()) => {
                log::info!("[{}] flow '{}' execution completed", self.op_ctx.flow_id, name);
            }
            Err(panic) => {
                self.error_counter.fetch_add(1, Ordering::Relaxed);
                let crashed_at = self.current_node.read().clone();
                log::error!(
                    "[{}] flow execution crashed while processing node '{}': {}",
                    self.op_ctx.flow_id,
                    crashed_at,
                    panic_message(&panic)
                );
            }
        }
        self.last_execution_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Walk the graph from the event's transition target until there is no
    /// next node or the flow is told to stop
    async fn walk(&self, event: ReactorEvent) {
        if let Some(err) = &event.error {
            self.error_counter.fetch_add(1, Ordering::Relaxed);
            log::error!("[{}] trigger node failed: {}", self.op_ctx.flow_id, err);
        }
        self.trigger_counter.fetch_add(1, Ordering::Relaxed);
        let mut msg = event.msg;
        let mut transition = event.transition_node_id;
        let mut current: NodeId = NodeId::new();
        log::debug!("[{}] next node id = '{}'", self.op_ctx.flow_id, transition);

        if !self.is_transition_valid(&current, &transition) {
            log::error!(
                "[{}] unknown transition node '{}' from trigger, execution ends",
                self.op_ctx.flow_id,
                transition
            );
            return;
        }

        loop {
            if !self.op_ctx.is_running() || transition.is_empty() {
                return;
            }
            let Some(node) = self.node_by_id(&transition) else {
                log::error!(
                    "[{}] transition node '{}' is gone, execution ends",
                    self.op_ctx.flow_id,
                    transition
                );
                return;
            };
            current = node.meta().id.clone();
            *self.current_node.write() = current.clone();

            if node.is_msg_reactor_node() {
                // Lazily start the reactor the first time a walk reaches it,
                // then block on its event channel or a control signal.
                let (events_tx, mut events_rx) = mpsc::channel(REACTOR_EVENT_BUFFER);
                if !node.is_reactor_running() {
                    let reactor = node.clone();
                    tokio::spawn(async move {
                        reactor.wait_for_event(Some(events_tx)).await;
                    });
                }
                let mut signals = self.op_ctx.subscribe_signals();
                tokio::select! {
                    reactor_event = events_rx.recv() => match reactor_event {
                        Some(reactor_event) => {
                            log::debug!("[{}] new event from reactor node", self.op_ctx.flow_id);
                            msg = reactor_event.msg;
                            transition = reactor_event.transition_node_id;
                            if let Some(err) = reactor_event.error {
                                self.error_counter.fetch_add(1, Ordering::Relaxed);
                                log::error!(
                                    "[{}] reactor node '{}' reported an error: {}",
                                    self.op_ctx.flow_id,
                                    current,
                                    err
                                );
                            }
                        }
                        None => {
                            log::debug!(
                                "[{}] reactor node '{}' closed its channel",
                                self.op_ctx.flow_id,
                                current
                            );
                            transition = NodeId::new();
                        }
                    },
                    signal = signals.recv() => {
                        log::debug!(
                            "[{}] control signal while waiting on node '{}': {:?}",
                            self.op_ctx.flow_id,
                            current,
                            signal
                        );
                        match signal {
                            Ok(ControlSignal::Stop) | Ok(ControlSignal::TerminateWaiting) | Err(_) => {
                                return;
                            }
                        }
                    }
                }
            } else {
                match node.on_input(&mut msg).await {
                    Ok(next_nodes) => {
                        transition = next_nodes.into_iter().next().unwrap_or_default();
                    }
                    Err(err) => {
                        self.error_counter.fetch_add(1, Ordering::Relaxed);
                        transition = node.meta().error_transition.clone();
                        log::error!(
                            "[{}] node '{}' executed with error, doing error transition to '{}': {}",
                            self.op_ctx.flow_id,
                            current,
                            transition,
                            err
                        );
                    }
                }
            }

            if !self.is_transition_valid(&current, &transition) {
                log::error!(
                    "[{}] unknown transition node '{}', execution ends",
                    self.op_ctx.flow_id,
                    transition
                );
                transition = NodeId::new();
            }
            log::debug!("[{}] next node id = '{}'", self.op_ctx.flow_id, transition);
        }
    }

    async fn stop(&self) -> Result<()> {
        if !self.op_ctx.begin_stopping() {
            log::info!("[{}] flow is already stopping", self.op_ctx.flow_id);
            return Ok(());
        }
        let name = self.op_ctx.definition().name.clone();
        log::info!("[{}] stopping flow '{}'", self.op_ctx.flow_id, name);
        self.op_ctx.set_running(false);
        self.op_ctx.send_signal(ControlSignal::Stop);

        // Reactors either observe the signal and exit, or were not yet
        // waiting on it; re-send on every poll tick until all report stopped.
        loop {
            let some_reactor_running = {
                self.nodes
                    .read()
                    .iter()
                    .any(|n| n.is_msg_reactor_node() && n.is_reactor_running())
            };
            if !some_reactor_running {
                break;
            }
            log::debug!("[{}] some reactors are still running, waiting", self.op_ctx.flow_id);
            self.op_ctx.send_signal(ControlSignal::Stop);
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        // Wait until all in-flight executions have drained.
        loop {
            if self.subflow_counter.load(Ordering::Acquire) == 0 {
                break;
            }
            log::debug!("[{}] some subflows are still running, waiting", self.op_ctx.flow_id);
            self.op_ctx.send_signal(ControlSignal::Stop);
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        log::debug!("[{}] starting node cleanup", self.op_ctx.flow_id);
        {
            let nodes = self.nodes.read();
            for node in nodes.iter() {
                if let Err(err) = node.cleanup() {
                    log::error!(
                        "[{}] node '{}' cleanup failed: {}",
                        self.op_ctx.flow_id,
                        node.meta().id,
                        err
                    );
                }
            }
        }
        self.op_ctx.set_state(FlowState::Stopped);
        log::info!("[{}] flow '{}' stopped", self.op_ctx.flow_id, name);
        Ok(())
    }

    fn stats(&self) -> FlowStats {
        let nodes = self.nodes.read();
        let current_node_id = self.current_node.read().clone();
        let current_node_label = nodes
            .iter()
            .find(|n| n.meta().id == current_node_id)
            .map(|n| n.meta().label.clone())
            .unwrap_or_default();
        let number_of_triggers = nodes.iter().filter(|n| n.is_start_node()).count();
        let number_of_active_triggers = nodes
            .iter()
            .filter(|n| n.is_start_node() && n.is_reactor_running())
            .count();
        FlowStats {
            current_node_id,
            current_node_label,
            number_of_nodes: nodes.len(),
            number_of_triggers,
            number_of_active_triggers,
            number_of_active_subflows: self.subflow_counter.load(Ordering::Acquire),
            started_at: *self.started_at.read(),
            last_execution_time_ms: self.last_execution_ms.load(Ordering::Relaxed),
        }
    }
}

/// Keeps the active-subflow counter balanced for shutdown accounting.
/// Decrements on drop, which also covers a panicking execution.
struct SubflowGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> SubflowGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for SubflowGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
