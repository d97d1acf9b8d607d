//! Core data model for flow definitions and runtime messages
//!
//! These types describe a flow graph as it is persisted (`FlowDefinition`,
//! `MetaNode`) and the runtime values that move through it (`Message`,
//! `ReactorEvent`). The shared mutable state of one running flow lives in
//! `FlowOperationalContext`, which every node holds a reference to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Unique identifier for a node inside a flow.
///
/// An empty id means "no next node": an execution reaching it ends.
pub type NodeId = String;

/// Scope name for variables shared across all flows
pub const GLOBAL_SCOPE: &str = "global";

/// Callback handed to start-node reactors so they can spawn new flow
/// executions without depending on the flow type directly
pub type FlowRunner = Arc<dyn Fn(ReactorEvent) + Send + Sync>;

/// Capacity of the control-signal broadcast channel
const SIGNAL_CHANNEL_CAPACITY: usize = 16;

/// A typed value as stored in the variable context and carried in messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Variable {
    /// Declared type tag ("int", "float", "bool", "string", ...)
    pub value_type: String,
    /// The value itself
    pub value: serde_json::Value,
}

impl Variable {
    /// Create a variable from a type tag and a value
    pub fn new(value_type: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            value_type: value_type.into(),
            value,
        }
    }

    /// True when both the type tag and the value are unset
    pub fn is_empty(&self) -> bool {
        self.value_type.is_empty() && self.value.is_null()
    }

    /// True when the value is numeric
    pub fn is_number(&self) -> bool {
        self.value.is_number()
    }

    /// Numeric view of the value, if it is a number
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Integer view of the value, if it is an integer
    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_i64()
    }

    /// Boolean view of the value, if it is a bool
    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }
}

/// A message as delivered by the bus and consumed (or mutated) by nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    /// Topic the message was published on
    pub topic: String,
    /// Service that produced the message
    pub service: String,
    /// Service interface (message type) of the payload
    pub interface: String,
    /// The payload value
    pub payload: Variable,
    /// Free-form headers
    pub header: HashMap<String, String>,
}

/// The unit of work passed from a reactor node to the flow runner
#[derive(Debug, Clone, Default)]
pub struct ReactorEvent {
    /// The message that produced the event (empty for timeouts)
    pub msg: Message,
    /// Error reported by the reactor, if any
    pub error: Option<String>,
    /// Node the runner should transition to
    pub transition_node_id: NodeId,
}

impl ReactorEvent {
    /// Event carrying a message toward a transition target
    pub fn with_message(msg: Message, transition_node_id: NodeId) -> Self {
        Self {
            msg,
            error: None,
            transition_node_id,
        }
    }

    /// Event carrying only a transition target (timeouts)
    pub fn transition(transition_node_id: NodeId) -> Self {
        Self {
            msg: Message::default(),
            error: None,
            transition_node_id,
        }
    }
}

/// Control signals broadcast to all reactors of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Halt all reactors and abort in-flight waits
    Stop,
    /// Stop waiting nodes without touching triggers
    TerminateWaiting,
}

/// Immutable (post-load) description of one graph node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetaNode {
    pub id: NodeId,
    /// Type tag resolved through the node constructor registry
    pub node_type: String,
    pub label: String,
    /// Bus address for message-bound nodes
    pub address: String,
    /// Service filter ("*" matches any)
    pub service: String,
    /// Service interface filter ("*" matches any)
    pub service_interface: String,
    pub success_transition: NodeId,
    pub error_transition: NodeId,
    pub timeout_transition: NodeId,
    /// Opaque type-specific configuration payload, decoded by the node itself
    pub config: serde_json::Value,
}

/// Persisted description of a node graph plus flow-level metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowDefinition {
    /// Instance id, different for every instance
    pub id: String,
    /// Class id, shared by all instances cloned from a template
    pub class_id: String,
    pub author: String,
    pub version: i64,
    pub name: String,
    pub group: String,
    pub description: String,
    /// User-defined settings map
    pub settings: HashMap<String, serde_json::Value>,
    pub is_disabled: bool,
    pub is_default: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub nodes: Vec<MetaNode>,
}

impl FlowDefinition {
    /// Find a node description by id
    pub fn find_node(&self, id: &str) -> Option<&MetaNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Lifecycle state of a flow
///
/// Only ever moves forward through
/// `Loaded -> Configured/ConfigError -> Starting -> Running -> Stopping -> Stopped`,
/// with `NotConfigured` as an error-terminal reachable from `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Loaded,
    Configured,
    ConfigError,
    Starting,
    Running,
    Stopping,
    Stopped,
    NotConfigured,
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlowState::Loaded => "LOADED",
            FlowState::Configured => "CONFIGURED",
            FlowState::ConfigError => "CONFIG_ERROR",
            FlowState::Starting => "STARTING",
            FlowState::Running => "RUNNING",
            FlowState::Stopping => "STOPPING",
            FlowState::Stopped => "STOPPED",
            FlowState::NotConfigured => "NOT_CONFIGURED",
        };
        f.write_str(name)
    }
}

/// The single mutable record shared by every node of a flow
///
/// Nodes only read fields or use the signal channel; they never replace the
/// context. State transitions and the running flag are driven by the flow.
pub struct FlowOperationalContext {
    pub flow_id: String,
    is_flow_running: AtomicBool,
    state: RwLock<FlowState>,
    signals: broadcast::Sender<ControlSignal>,
    storage_path: RwLock<String>,
    ext_libs_dir: RwLock<String>,
    definition: RwLock<Arc<FlowDefinition>>,
}

impl FlowOperationalContext {
    pub fn new(flow_id: impl Into<String>, definition: Arc<FlowDefinition>) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            flow_id: flow_id.into(),
            is_flow_running: AtomicBool::new(false),
            state: RwLock::new(FlowState::Loaded),
            signals,
            storage_path: RwLock::new(String::new()),
            ext_libs_dir: RwLock::new(String::new()),
            definition: RwLock::new(definition),
        }
    }

    /// The flow's "should keep running" flag
    pub fn is_running(&self) -> bool {
        self.is_flow_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.is_flow_running.store(running, Ordering::Release);
    }

    /// Current lifecycle state
    pub fn state(&self) -> FlowState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: FlowState) {
        *self.state.write() = state;
    }

    /// Atomically enter `Stopping`; returns false when already stopping
    pub(crate) fn begin_stopping(&self) -> bool {
        let mut state = self.state.write();
        if *state == FlowState::Stopping {
            return false;
        }
        *state = FlowState::Stopping;
        true
    }

    /// Subscribe to the control-signal channel
    ///
    /// Receivers only observe signals sent after subscription, which is why
    /// the flow re-sends the stop signal while draining.
    pub fn subscribe_signals(&self) -> broadcast::Receiver<ControlSignal> {
        self.signals.subscribe()
    }

    pub(crate) fn send_signal(&self, signal: ControlSignal) {
        // No receivers is fine: nothing is waiting on the channel.
        let _ = self.signals.send(signal);
    }

    pub fn storage_path(&self) -> String {
        self.storage_path.read().clone()
    }

    pub(crate) fn set_storage_path(&self, path: impl Into<String>) {
        *self.storage_path.write() = path.into();
    }

    pub fn ext_libs_dir(&self) -> String {
        self.ext_libs_dir.read().clone()
    }

    pub(crate) fn set_ext_libs_dir(&self, path: impl Into<String>) {
        *self.ext_libs_dir.write() = path.into();
    }

    /// The definition this context was materialized from
    pub fn definition(&self) -> Arc<FlowDefinition> {
        self.definition.read().clone()
    }

    pub(crate) fn set_definition(&self, definition: Arc<FlowDefinition>) {
        *self.definition.write() = definition;
    }
}

/// Point-in-time report of a flow's runtime counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    pub current_node_id: NodeId,
    pub current_node_label: String,
    pub number_of_nodes: usize,
    pub number_of_triggers: usize,
    pub number_of_active_triggers: usize,
    pub number_of_active_subflows: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_execution_time_ms: u64,
}
