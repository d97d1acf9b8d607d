//! Node contract and constructor registry
//!
//! Every node type, synchronous or reactor, implements [`FlowNode`]. The
//! engine drives nodes exclusively through this contract and resolves type
//! tags through [`NodeRegistry`]; it never special-cases a type name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::connector::ConnectorRegistry;
use crate::error::Result;
use crate::model::{FlowOperationalContext, FlowRunner, Message, MetaNode, NodeId, ReactorEvent};
use crate::variables::VariableStore;

/// Common state embedded by every concrete node type
///
/// Holds the meta description, the shared operational context, the
/// reactor classification flags and the flow-runner slot for start nodes.
pub struct BaseNode {
    meta: MetaNode,
    flow_ctx: Arc<FlowOperationalContext>,
    is_start: bool,
    is_reactor: bool,
    reactor_running: AtomicBool,
    runner: RwLock<Option<FlowRunner>>,
}

impl BaseNode {
    /// Base state for a synchronous node
    pub fn new(meta: MetaNode, flow_ctx: Arc<FlowOperationalContext>) -> Self {
        Self {
            meta,
            flow_ctx,
            is_start: false,
            is_reactor: false,
            reactor_running: AtomicBool::new(false),
            runner: RwLock::new(None),
        }
    }

    /// Base state for a reactor node; start reactors spawn new executions
    pub fn reactor(meta: MetaNode, flow_ctx: Arc<FlowOperationalContext>, is_start: bool) -> Self {
        Self {
            is_start,
            is_reactor: true,
            ..Self::new(meta, flow_ctx)
        }
    }

    pub fn meta(&self) -> &MetaNode {
        &self.meta
    }

    pub fn flow_ctx(&self) -> &Arc<FlowOperationalContext> {
        &self.flow_ctx
    }

    pub fn is_start(&self) -> bool {
        self.is_start
    }

    pub fn is_reactor(&self) -> bool {
        self.is_reactor
    }

    pub fn is_reactor_running(&self) -> bool {
        self.reactor_running.load(Ordering::Acquire)
    }

    /// Atomically claim the reactor wait-loop
    ///
    /// Only one claim can be held at a time; dropping it marks the reactor
    /// stopped again. Wait loops take the claim at entry, which makes a
    /// second concurrently spawned loop exit immediately instead of
    /// double-consuming the node's inbox.
    pub fn claim_reactor(&self) -> Option<ReactorClaim<'_>> {
        self.reactor_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReactorClaim { base: self })
    }

    pub fn set_runner(&self, runner: FlowRunner) {
        *self.runner.write() = Some(runner);
    }

    pub fn runner(&self) -> Option<FlowRunner> {
        self.runner.read().clone()
    }
}

/// Exclusive claim on a reactor's wait-loop; cleared on drop
pub struct ReactorClaim<'a> {
    base: &'a BaseNode,
}

impl Drop for ReactorClaim<'_> {
    fn drop(&mut self) {
        self.base.reactor_running.store(false, Ordering::Release);
    }
}

/// The contract every node type implements
///
/// Synchronous nodes override [`FlowNode::on_input`]; reactor nodes
/// override [`FlowNode::wait_for_event`] and run it as a long-lived task.
#[async_trait]
pub trait FlowNode: Send + Sync {
    /// The embedded base state
    fn base(&self) -> &BaseNode;

    /// Decode the opaque configuration payload and resolve shared
    /// connections. A missing or wrong-typed connection must fail loudly:
    /// the error aborts flow configuration.
    fn load_node_config(&mut self, connectors: Option<&ConnectorRegistry>) -> Result<()>;

    /// One-time setup when the flow starts (subscribe, schedule timers).
    /// Called exactly once per start cycle.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Release everything acquired in [`FlowNode::init`]
    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Process a message and return the ids of the node(s) to transition
    /// to. An empty result ends the execution.
    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        let _ = msg;
        Ok(Vec::new())
    }

    /// Reactor wait-loop. Start nodes ignore `events` and invoke the flow
    /// runner directly; mid-graph reactors deliver one event on `events`.
    /// No-op for synchronous nodes.
    async fn wait_for_event(&self, events: Option<mpsc::Sender<ReactorEvent>>) {
        let _ = events;
    }

    fn meta(&self) -> &MetaNode {
        self.base().meta()
    }

    /// True when this node may spawn brand-new flow executions
    fn is_start_node(&self) -> bool {
        self.base().is_start()
    }

    /// True when this node runs its own wait-loop
    fn is_msg_reactor_node(&self) -> bool {
        self.base().is_reactor()
    }

    /// True while the node's wait-loop is active
    fn is_reactor_running(&self) -> bool {
        self.base().is_reactor_running()
    }

    /// Hand the node the callback it uses to spawn executions
    fn set_flow_runner(&self, runner: FlowRunner) {
        self.base().set_runner(runner);
    }
}

/// Factory producing one node instance from its meta description
pub type NodeConstructor = Box<
    dyn Fn(Arc<FlowOperationalContext>, MetaNode, Arc<VariableStore>) -> Box<dyn FlowNode>
        + Send
        + Sync,
>;

/// Registry mapping node type tags to constructors
///
/// Adding a new node type means registering a new factory; the engine
/// resolves every node through this table.
#[derive(Default)]
pub struct NodeRegistry {
    constructors: HashMap<String, NodeConstructor>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a type tag
    pub fn register(&mut self, node_type: impl Into<String>, constructor: NodeConstructor) {
        self.constructors.insert(node_type.into(), constructor);
    }

    /// Register a plain function or closure as a constructor
    pub fn register_fn<F>(&mut self, node_type: impl Into<String>, constructor: F)
    where
        F: Fn(Arc<FlowOperationalContext>, MetaNode, Arc<VariableStore>) -> Box<dyn FlowNode>
            + Send
            + Sync
            + 'static,
    {
        self.register(node_type, Box::new(constructor));
    }

    /// Construct a node instance, or `None` for an unknown type tag
    pub fn construct(
        &self,
        node_type: &str,
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        variables: Arc<VariableStore>,
    ) -> Option<Box<dyn FlowNode>> {
        self.constructors
            .get(node_type)
            .map(|constructor| constructor(flow_ctx, meta, variables))
    }

    pub fn has_node_type(&self, node_type: &str) -> bool {
        self.constructors.contains_key(node_type)
    }

    /// All registered type tags
    pub fn node_types(&self) -> Vec<&str> {
        self.constructors.keys().map(|k| k.as_str()).collect()
    }

    /// Merge another registry into this one; `other` wins on shared tags
    pub fn merge(&mut self, other: NodeRegistry) {
        self.constructors.extend(other.constructors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FlowDefinition;

    struct EchoNode {
        base: BaseNode,
    }

    #[async_trait]
    impl FlowNode for EchoNode {
        fn base(&self) -> &BaseNode {
            &self.base
        }

        fn load_node_config(&mut self, _connectors: Option<&ConnectorRegistry>) -> Result<()> {
            Ok(())
        }

        async fn on_input(&self, _msg: &mut Message) -> Result<Vec<NodeId>> {
            Ok(vec![self.meta().success_transition.clone()])
        }
    }

    fn echo_constructor(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        _variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(EchoNode {
            base: BaseNode::new(meta, flow_ctx),
        })
    }

    fn test_ctx() -> Arc<FlowOperationalContext> {
        Arc::new(FlowOperationalContext::new(
            "flow-1",
            Arc::new(FlowDefinition::default()),
        ))
    }

    #[tokio::test]
    async fn test_register_and_construct() {
        let mut registry = NodeRegistry::new();
        registry.register_fn("echo", echo_constructor);
        assert!(registry.has_node_type("echo"));
        assert!(!registry.has_node_type("unknown"));

        let meta = MetaNode {
            id: "1".to_string(),
            node_type: "echo".to_string(),
            success_transition: "2".to_string(),
            ..Default::default()
        };
        let node = registry
            .construct("echo", test_ctx(), meta, Arc::new(VariableStore::new()))
            .unwrap();

        let mut msg = Message::default();
        let next = node.on_input(&mut msg).await.unwrap();
        assert_eq!(next, vec!["2".to_string()]);
        assert!(!node.is_start_node());
        assert!(!node.is_msg_reactor_node());
    }

    #[test]
    fn test_unknown_type_yields_none() {
        let registry = NodeRegistry::new();
        assert!(registry
            .construct(
                "nope",
                test_ctx(),
                MetaNode::default(),
                Arc::new(VariableStore::new())
            )
            .is_none());
    }

    #[test]
    fn test_merge() {
        let mut a = NodeRegistry::new();
        a.register_fn("echo", echo_constructor);
        let mut b = NodeRegistry::new();
        b.register_fn("relay", echo_constructor);
        a.merge(b);
        assert!(a.has_node_type("echo"));
        assert!(a.has_node_type("relay"));
    }

    #[test]
    fn test_reactor_claim_is_exclusive() {
        let base = BaseNode::reactor(MetaNode::default(), test_ctx(), true);
        assert!(!base.is_reactor_running());

        let claim = base.claim_reactor().unwrap();
        assert!(base.is_reactor_running());
        assert!(base.claim_reactor().is_none());

        drop(claim);
        assert!(!base.is_reactor_running());
        assert!(base.claim_reactor().is_some());
    }
}
