//! In-memory flow registry
//!
//! Owns the set of loaded flows and the shared collaborators (variable
//! store, connector registry, node registry) they are wired to. Definition
//! persistence lives outside the engine; the manager only takes
//! already-serialized JSON in and hands `FlowDefinition`s back.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::connector::ConnectorRegistry;
use crate::error::{EngineError, Result};
use crate::flow::Flow;
use crate::model::{FlowDefinition, FlowState, FlowStats, MetaNode, GLOBAL_SCOPE};
use crate::node::NodeRegistry;
use crate::variables::VariableStore;

/// Summary row for one managed flow
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowListItem {
    pub id: String,
    pub name: String,
    pub group: String,
    pub description: String,
    pub state: FlowState,
    pub trigger_counter: u64,
    pub error_counter: u64,
    pub is_disabled: bool,
    pub stats: FlowStats,
}

/// Registry of loaded flows sharing one set of collaborators
pub struct FlowManager {
    flows: RwLock<Vec<Flow>>,
    variables: Arc<VariableStore>,
    connectors: Arc<ConnectorRegistry>,
    node_registry: Arc<NodeRegistry>,
}

impl FlowManager {
    pub fn new(
        variables: Arc<VariableStore>,
        connectors: Arc<ConnectorRegistry>,
        node_registry: Arc<NodeRegistry>,
    ) -> Self {
        variables.register_flow(GLOBAL_SCOPE);
        Self {
            flows: RwLock::new(Vec::new()),
            variables,
            connectors,
            node_registry,
        }
    }

    pub fn variables(&self) -> Arc<VariableStore> {
        self.variables.clone()
    }

    pub fn connectors(&self) -> Arc<ConnectorRegistry> {
        self.connectors.clone()
    }

    /// A fresh single-trigger definition with a generated id
    pub fn generate_new_flow(&self) -> FlowDefinition {
        let id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        FlowDefinition {
            class_id: id.clone(),
            id,
            created_at: Some(now),
            updated_at: Some(now),
            nodes: vec![MetaNode {
                id: "1".to_string(),
                node_type: "trigger".to_string(),
                label: "no label".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Register a definition as a new managed flow (not started)
    pub fn add_flow(&self, definition: FlowDefinition) -> Flow {
        let flow = Flow::new(
            definition,
            self.variables.clone(),
            self.node_registry.clone(),
        );
        flow.set_connector_registry(self.connectors.clone());
        self.flows.write().push(flow.clone());
        flow
    }

    /// Deserialize a definition from JSON and register it
    pub fn add_flow_from_json(&self, definition_json: &str) -> Result<Flow> {
        let definition: FlowDefinition = serde_json::from_str(definition_json)?;
        Ok(self.add_flow(definition))
    }

    pub fn get_flow(&self, id: &str) -> Option<Flow> {
        self.flows.read().iter().find(|f| f.id() == id).cloned()
    }

    pub fn flow_list(&self) -> Vec<FlowListItem> {
        self.flows
            .read()
            .iter()
            .map(|flow| {
                let definition = flow.definition();
                FlowListItem {
                    id: flow.id(),
                    name: definition.name.clone(),
                    group: definition.group.clone(),
                    description: definition.description.clone(),
                    state: flow.state(),
                    trigger_counter: flow.trigger_count(),
                    error_counter: flow.error_count(),
                    is_disabled: definition.is_disabled,
                    stats: flow.stats(),
                }
            })
            .collect()
    }

    pub fn start_flow(&self, id: &str) -> Result<()> {
        let flow = self
            .get_flow(id)
            .ok_or_else(|| EngineError::UnknownFlow(id.to_string()))?;
        if flow.state() == FlowState::Running {
            return Ok(());
        }
        flow.start()
    }

    pub async fn stop_flow(&self, id: &str) -> Result<()> {
        let flow = self
            .get_flow(id)
            .ok_or_else(|| EngineError::UnknownFlow(id.to_string()))?;
        if flow.state() != FlowState::Running {
            log::info!("flow '{}' is not running, nothing to stop", id);
            return Ok(());
        }
        flow.stop().await
    }

    /// Dispatch a textual control command ("START"/"STOP") to a flow
    pub async fn control_flow(&self, cmd: &str, id: &str) -> Result<()> {
        match cmd {
            "START" => self.start_flow(id),
            "STOP" => self.stop_flow(id).await,
            other => Err(EngineError::execution(format!(
                "unknown flow control command '{other}'"
            ))),
        }
    }

    /// Start every flow whose definition is not disabled
    pub fn start_all_enabled(&self) {
        let flows: Vec<Flow> = self.flows.read().clone();
        for flow in flows {
            if flow.definition().is_disabled {
                continue;
            }
            if let Err(err) = flow.start() {
                log::error!("flow '{}' failed to start: {}", flow.id(), err);
            }
        }
    }

    /// Replace a flow's definition: stop it, swap the flow instance, and
    /// start the replacement unless it is disabled
    pub async fn update_flow(&self, id: &str, mut definition: FlowDefinition) -> Result<Flow> {
        let existing = self
            .get_flow(id)
            .ok_or_else(|| EngineError::UnknownFlow(id.to_string()))?;
        if existing.definition().is_default {
            return Err(EngineError::config("default flows are constant"));
        }
        if existing.state() == FlowState::Running {
            existing.stop().await?;
        }
        self.remove_flow(id);
        definition.updated_at = Some(Utc::now());
        let is_disabled = definition.is_disabled;
        let flow = self.add_flow(definition);
        if !is_disabled {
            flow.start()?;
        }
        Ok(flow)
    }

    /// Stop and remove a flow, dropping its variable scope
    pub async fn delete_flow(&self, id: &str) -> Result<()> {
        let flow = self
            .get_flow(id)
            .ok_or_else(|| EngineError::UnknownFlow(id.to_string()))?;
        if flow.state() == FlowState::Running {
            flow.stop().await?;
        }
        self.remove_flow(id);
        flow.cleanup_before_delete();
        Ok(())
    }

    fn remove_flow(&self, id: &str) {
        let mut flows = self.flows.write();
        if let Some(pos) = flows.iter().position(|f| f.id() == id) {
            flows.remove(pos);
        }
    }
}
