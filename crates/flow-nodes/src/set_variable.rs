//! Set-variable node: writes a value into the flow or global scope

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flow_engine::{
    BaseNode, ConnectorRegistry, EngineError, FlowNode, FlowOperationalContext, Message, MetaNode,
    NodeId, Result, Variable, VariableStore, GLOBAL_SCOPE,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetVariableConfig {
    pub name: String,
    pub description: String,
    /// true - write to the global scope; false - to the flow scope
    pub update_global: bool,
    /// true - overwrite the input message payload instead of a variable
    pub update_input_msg: bool,
    pub is_variable_in_memory: bool,
    /// Value to write; when empty the input payload is stored instead
    pub default_value: Variable,
}

pub struct SetVariableNode {
    base: BaseNode,
    variables: Arc<VariableStore>,
    config: SetVariableConfig,
}

impl SetVariableNode {
    pub fn create(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(Self {
            base: BaseNode::new(meta, flow_ctx),
            variables,
            config: SetVariableConfig::default(),
        })
    }
}

#[async_trait]
impl FlowNode for SetVariableNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn load_node_config(&mut self, _connectors: Option<&ConnectorRegistry>) -> Result<()> {
        self.config = serde_json::from_value(self.base.meta().config.clone())
            .map_err(|err| EngineError::config(format!("set_variable node config: {err}")))?;
        if !self.config.update_input_msg && self.config.name.is_empty() {
            return Err(EngineError::config(format!(
                "set_variable node '{}' needs a variable name",
                self.base.meta().label
            )));
        }
        Ok(())
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        log::debug!("set_variable '{}' executing", self.base.meta().label);
        if self.config.update_input_msg {
            msg.payload = self.config.default_value.clone();
        } else {
            let scope = if self.config.update_global {
                GLOBAL_SCOPE
            } else {
                &self.base.flow_ctx().flow_id
            };
            let source = if self.config.default_value.value_type.is_empty() {
                &msg.payload
            } else {
                &self.config.default_value
            };
            self.variables.set_variable(
                &self.config.name,
                &source.value_type,
                source.value.clone(),
                &self.config.description,
                scope,
                self.config.is_variable_in_memory,
            )?;
        }
        Ok(vec![self.base.meta().success_transition.clone()])
    }
}
