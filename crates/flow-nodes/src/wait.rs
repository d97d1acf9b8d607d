//! Wait node: delays one execution for a configured number of milliseconds

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use flow_engine::{
    BaseNode, ConnectorRegistry, EngineError, FlowNode, FlowOperationalContext, Message, MetaNode,
    NodeId, Result, VariableStore,
};

pub struct WaitNode {
    base: BaseNode,
    delay_ms: u64,
}

impl WaitNode {
    pub fn create(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        _variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(Self {
            base: BaseNode::new(meta, flow_ctx),
            delay_ms: 0,
        })
    }
}

#[async_trait]
impl FlowNode for WaitNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn load_node_config(&mut self, _connectors: Option<&ConnectorRegistry>) -> Result<()> {
        // The config payload is a bare number of milliseconds.
        let delay = self
            .base
            .meta()
            .config
            .as_u64()
            .or_else(|| self.base.meta().config.as_f64().map(|v| v as u64));
        match delay {
            Some(delay) => {
                self.delay_ms = delay;
                Ok(())
            }
            None => Err(EngineError::config(format!(
                "wait node '{}' delay must be a number of milliseconds",
                self.base.meta().label
            ))),
        }
    }

    async fn on_input(&self, _msg: &mut Message) -> Result<Vec<NodeId>> {
        log::info!("wait '{}': waiting for {} ms", self.base.meta().label, self.delay_ms);
        // Suspends only this subflow; sibling executions keep running.
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(vec![self.base.meta().success_transition.clone()])
    }
}
