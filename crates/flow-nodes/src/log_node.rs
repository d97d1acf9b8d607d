//! Log node: writes the payload, a variable, or a fixed text to the log

use std::sync::Arc;

use async_trait::async_trait;
use log::Level;
use serde::{Deserialize, Serialize};

use flow_engine::{
    BaseNode, ConnectorRegistry, EngineError, FlowNode, FlowOperationalContext, Message, MetaNode,
    NodeId, Result, VariableStore, GLOBAL_SCOPE,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// trace, debug, info, warn, error; defaults to info
    pub log_level: String,
    /// Fixed text to log instead of the payload
    pub text: String,
    /// Context variable to log instead of the payload
    pub variable_name: String,
    pub is_variable_global: bool,
}

pub struct LogNode {
    base: BaseNode,
    variables: Arc<VariableStore>,
    config: LogConfig,
    level: Level,
}

impl LogNode {
    pub fn create(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(Self {
            base: BaseNode::new(meta, flow_ctx),
            variables,
            config: LogConfig::default(),
            level: Level::Info,
        })
    }
}

#[async_trait]
impl FlowNode for LogNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn load_node_config(&mut self, _connectors: Option<&ConnectorRegistry>) -> Result<()> {
        if !self.base.meta().config.is_null() {
            self.config = serde_json::from_value(self.base.meta().config.clone())
                .map_err(|err| EngineError::config(format!("log node config: {err}")))?;
        }
        self.level = self
            .config
            .log_level
            .parse::<Level>()
            .unwrap_or(Level::Info);
        Ok(())
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        let label = &self.base.meta().label;
        if !self.config.text.is_empty() {
            log::log!(self.level, "log '{}': {}", label, self.config.text);
        } else if !self.config.variable_name.is_empty() {
            let scope = if self.config.is_variable_global {
                GLOBAL_SCOPE
            } else {
                &self.base.flow_ctx().flow_id
            };
            let variable = self
                .variables
                .get_variable(&self.config.variable_name, scope)?;
            log::log!(
                self.level,
                "log '{}': {} = {:?}",
                label,
                self.config.variable_name,
                variable.value
            );
        } else {
            log::log!(self.level, "log '{}': payload = {:?}", label, msg.payload.value);
        }
        Ok(vec![self.base.meta().success_transition.clone()])
    }
}
