//! Action node: publishes a message on the bus
//!
//! The outgoing value comes from a context variable, the configured
//! default, or the input message, in that order of preference.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flow_engine::{
    BaseNode, ConnectorRegistry, EngineError, FlowNode, FlowOperationalContext, Message,
    MessageBus, MessageBusConnector, MetaNode, NodeId, Result, Variable, VariableStore,
    BUS_CONNECTOR, GLOBAL_SCOPE,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionConfig {
    /// Value published when no variable is configured
    pub default_value: Variable,
    /// Context variable supplying the value
    pub variable_name: String,
    pub is_variable_global: bool,
}

pub struct ActionNode {
    base: BaseNode,
    variables: Arc<VariableStore>,
    config: ActionConfig,
    bus: Option<Arc<MessageBus>>,
}

impl ActionNode {
    pub fn create(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(Self {
            base: BaseNode::new(meta, flow_ctx),
            variables,
            config: ActionConfig::default(),
            bus: None,
        })
    }

    fn output_value(&self, msg: &Message) -> Result<Variable> {
        if !self.config.variable_name.is_empty() {
            let scope = if self.config.is_variable_global {
                GLOBAL_SCOPE
            } else {
                &self.base.flow_ctx().flow_id
            };
            return self.variables.get_variable(&self.config.variable_name, scope);
        }
        if self.config.default_value.is_empty() {
            Ok(msg.payload.clone())
        } else {
            Ok(self.config.default_value.clone())
        }
    }
}

#[async_trait]
impl FlowNode for ActionNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn load_node_config(&mut self, connectors: Option<&ConnectorRegistry>) -> Result<()> {
        let meta = self.base.meta();
        if meta.address.is_empty() || meta.service.is_empty() || meta.service_interface.is_empty()
        {
            return Err(EngineError::config(format!(
                "action node '{}' needs address, service and interface",
                meta.label
            )));
        }
        if !meta.config.is_null() {
            self.config = serde_json::from_value(meta.config.clone())
                .map_err(|err| EngineError::config(format!("action node config: {err}")))?;
        }
        let connectors =
            connectors.ok_or_else(|| EngineError::Connector(BUS_CONNECTOR.to_string()))?;
        let bus = connectors.typed::<MessageBusConnector>(BUS_CONNECTOR)?;
        self.bus = Some(bus.bus());
        Ok(())
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        log::info!("action '{}' executing", self.base.meta().label);
        let bus = self
            .bus
            .as_ref()
            .ok_or_else(|| EngineError::Connector(BUS_CONNECTOR.to_string()))?;
        let meta = self.base.meta();
        let out = Message {
            topic: meta.address.clone(),
            service: meta.service.clone(),
            interface: meta.service_interface.clone(),
            payload: self.output_value(msg)?,
            ..Default::default()
        };
        log::debug!("action '{}' publishing to {}", meta.label, out.topic);
        bus.publish(out);
        Ok(vec![meta.success_transition.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::FlowDefinition;
    use serde_json::json;

    fn action_setup(
        config: serde_json::Value,
    ) -> (Box<dyn FlowNode>, Arc<MessageBus>, Arc<VariableStore>) {
        let ctx = Arc::new(FlowOperationalContext::new(
            "f1",
            Arc::new(FlowDefinition::default()),
        ));
        let variables = Arc::new(VariableStore::new());
        variables.register_flow("f1");
        let meta = MetaNode {
            id: "2".to_string(),
            node_type: "action".to_string(),
            label: "Bulb".to_string(),
            address: "cmd/dev/1/switch".to_string(),
            service: "out_bin_switch".to_string(),
            service_interface: "cmd.binary.set".to_string(),
            success_transition: "3".to_string(),
            config,
            ..Default::default()
        };
        let bus_connector = Arc::new(MessageBusConnector::new());
        let bus = bus_connector.bus();
        let mut connectors = ConnectorRegistry::new();
        connectors.add_instance(BUS_CONNECTOR, bus_connector);

        let mut node = ActionNode::create(ctx, meta, variables.clone());
        node.load_node_config(Some(&connectors)).unwrap();
        (node, bus, variables)
    }

    #[tokio::test]
    async fn test_publishes_default_value() {
        let (node, bus, _vars) = action_setup(json!({
            "defaultValue": {"valueType": "bool", "value": true}
        }));
        let (_id, mut rx) = bus.subscribe("cmd/dev/1/switch");

        let next = node.on_input(&mut Message::default()).await.unwrap();
        assert_eq!(next, vec!["3".to_string()]);

        let published = rx.recv().await.unwrap();
        assert_eq!(published.service, "out_bin_switch");
        assert_eq!(published.payload.value, json!(true));
    }

    #[tokio::test]
    async fn test_publishes_variable_value() {
        let (node, bus, variables) = action_setup(json!({"variableName": "level"}));
        variables
            .set_variable("level", "int", json!(80), "", "f1", true)
            .unwrap();
        let (_id, mut rx) = bus.subscribe("cmd/dev/1/switch");

        node.on_input(&mut Message::default()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload.value, json!(80));
    }

    #[tokio::test]
    async fn test_missing_variable_is_an_error() {
        let (node, _bus, _vars) = action_setup(json!({"variableName": "ghost"}));
        assert!(node.on_input(&mut Message::default()).await.is_err());
    }

    #[test]
    fn test_missing_bus_connector_fails_config() {
        let ctx = Arc::new(FlowOperationalContext::new(
            "f1",
            Arc::new(FlowDefinition::default()),
        ));
        let meta = MetaNode {
            node_type: "action".to_string(),
            address: "cmd/dev/1/switch".to_string(),
            service: "out_bin_switch".to_string(),
            service_interface: "cmd.binary.set".to_string(),
            ..Default::default()
        };
        let mut node = ActionNode::create(ctx, meta, Arc::new(VariableStore::new()));
        assert!(node.load_node_config(None).is_err());
        assert!(node
            .load_node_config(Some(&ConnectorRegistry::new()))
            .is_err());
    }
}
