//! Flow engine: reactive node-graph execution
//!
//! This crate interprets directed graphs of typed nodes that react to
//! messages on a pub/sub bus. One flow definition can have many
//! simultaneous executions: every start-node reactor spawns a new
//! "subflow" per matching event, and `stop` synchronizes with all of them
//! before tearing the flow down.
//!
//! # Architecture
//!
//! - [`model`]: definitions, messages, events and the shared per-flow
//!   operational context
//! - [`node`]: the `FlowNode` contract and the constructor registry that
//!   resolves node type tags
//! - [`flow`]: the per-flow state machine and the graph walker
//! - [`bus`]: in-process pub/sub with non-blocking delivery
//! - [`variables`] / [`connector`]: the variable context and the shared
//!   connector registry nodes bind to during configuration
//! - [`manager`]: the in-memory registry of loaded flows
//!
//! # Example
//!
//! ```ignore
//! use flow_engine::{Flow, NodeRegistry, VariableStore};
//!
//! let flow = Flow::new(definition, variables, registry);
//! flow.set_connector_registry(connectors);
//! flow.start()?;
//! // ... trigger events spawn subflows ...
//! flow.stop().await?;
//! ```

pub mod bus;
pub mod connector;
pub mod error;
pub mod flow;
pub mod manager;
pub mod model;
pub mod node;
pub mod variables;

// Re-export key types
pub use bus::{MessageBus, MessageBusConnector, SubscriptionId, BUS_CONNECTOR};
pub use connector::{Connector, ConnectorInstance, ConnectorRegistry};
pub use error::{EngineError, Result};
pub use flow::Flow;
pub use manager::{FlowListItem, FlowManager};
pub use model::{
    ControlSignal, FlowDefinition, FlowOperationalContext, FlowRunner, FlowState, FlowStats,
    Message, MetaNode, NodeId, ReactorEvent, Variable, GLOBAL_SCOPE,
};
pub use node::{BaseNode, FlowNode, NodeConstructor, NodeRegistry, ReactorClaim};
pub use variables::VariableStore;
