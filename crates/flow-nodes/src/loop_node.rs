//! Loop node: counts executions up to a limit
//!
//! Takes its success transition while the counter is below the end value;
//! at the limit it resets the counter and takes the error transition,
//! which graphs use as the "loop finished" branch.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use flow_engine::{
    BaseNode, ConnectorRegistry, EngineError, FlowNode, FlowOperationalContext, Message, MetaNode,
    NodeId, Result, VariableStore,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoopConfig {
    pub start_value: i64,
    pub end_value: i64,
}

pub struct LoopNode {
    base: BaseNode,
    config: LoopConfig,
    counter: Mutex<i64>,
}

impl LoopNode {
    pub fn create(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        _variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(Self {
            base: BaseNode::new(meta, flow_ctx),
            config: LoopConfig::default(),
            counter: Mutex::new(0),
        })
    }
}

#[async_trait]
impl FlowNode for LoopNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn load_node_config(&mut self, _connectors: Option<&ConnectorRegistry>) -> Result<()> {
        self.config = serde_json::from_value(self.base.meta().config.clone())
            .map_err(|err| EngineError::config(format!("loop node config: {err}")))?;
        if self.config.end_value <= self.config.start_value {
            return Err(EngineError::config(format!(
                "loop node '{}' end value must be greater than start value",
                self.base.meta().label
            )));
        }
        *self.counter.lock() = self.config.start_value;
        Ok(())
    }

    async fn on_input(&self, _msg: &mut Message) -> Result<Vec<NodeId>> {
        let mut counter = self.counter.lock();
        *counter += 1;
        if *counter >= self.config.end_value {
            log::debug!(
                "loop '{}' reached {} iterations, resetting",
                self.base.meta().label,
                *counter - self.config.start_value
            );
            *counter = self.config.start_value;
            return Ok(vec![self.base.meta().error_transition.clone()]);
        }
        log::debug!("loop '{}' iteration {}", self.base.meta().label, *counter);
        Ok(vec![self.base.meta().success_transition.clone()])
    }
}
