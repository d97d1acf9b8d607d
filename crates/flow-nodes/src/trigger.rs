//! Trigger node: a start reactor bound to the message bus
//!
//! Listens on its configured address and spawns a brand-new flow execution
//! for every message that passes the service/interface/value filter. Many
//! executions can be in flight at once; the trigger never waits for a
//! spawned subflow to finish.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use flow_engine::{
    BaseNode, ConnectorRegistry, ControlSignal, EngineError, FlowNode, FlowOperationalContext,
    Message, MessageBus, MessageBusConnector, MetaNode, ReactorEvent, Result, SubscriptionId,
    Variable, VariableStore, BUS_CONNECTOR,
};

use crate::filter::{effective_timeout, message_matches};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerConfig {
    /// Wait timeout in seconds; 0 means effectively infinite
    pub timeout: u64,
    pub value_filter: Variable,
    pub is_value_filter_enabled: bool,
}

pub struct TriggerNode {
    base: BaseNode,
    config: TriggerConfig,
    bus: Option<Arc<MessageBus>>,
    subscription: Mutex<Option<SubscriptionId>>,
    inbox: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl TriggerNode {
    pub fn create(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        _variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(Self {
            base: BaseNode::reactor(meta, flow_ctx, true),
            config: TriggerConfig::default(),
            bus: None,
            subscription: Mutex::new(None),
            inbox: Mutex::new(None),
        })
    }
}

#[async_trait]
impl FlowNode for TriggerNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn load_node_config(&mut self, connectors: Option<&ConnectorRegistry>) -> Result<()> {
        let meta = self.base.meta();
        if meta.address.is_empty() || meta.service.is_empty() || meta.service_interface.is_empty()
        {
            return Err(EngineError::config(format!(
                "trigger node '{}' needs address, service and interface",
                meta.label
            )));
        }
        if !meta.config.is_null() {
            self.config = serde_json::from_value(meta.config.clone())
                .map_err(|err| EngineError::config(format!("trigger node config: {err}")))?;
        }
        let connectors =
            connectors.ok_or_else(|| EngineError::Connector(BUS_CONNECTOR.to_string()))?;
        let bus = connectors.typed::<MessageBusConnector>(BUS_CONNECTOR)?;
        self.bus = Some(bus.bus());
        Ok(())
    }

    fn init(&self) -> Result<()> {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return Ok(());
        }
        let bus = self
            .bus
            .as_ref()
            .ok_or_else(|| EngineError::Connector(BUS_CONNECTOR.to_string()))?;
        log::info!(
            "trigger '{}' subscribing for service by address: {}",
            self.base.meta().label,
            self.base.meta().address
        );
        let (id, rx) = bus.subscribe(&self.base.meta().address);
        *subscription = Some(id);
        *self.inbox.lock() = Some(rx);
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if let (Some(id), Some(bus)) = (self.subscription.lock().take(), self.bus.as_ref()) {
            bus.unsubscribe(id);
        }
        self.inbox.lock().take();
        Ok(())
    }

    async fn wait_for_event(&self, _events: Option<mpsc::Sender<ReactorEvent>>) {
        let Some(_claim) = self.base.claim_reactor() else {
            log::debug!("trigger '{}' reactor already running", self.base.meta().label);
            return;
        };
        let Some(runner) = self.base.runner() else {
            log::error!("trigger '{}' has no flow runner", self.base.meta().label);
            return;
        };
        let Some(mut inbox) = self.inbox.lock().take() else {
            log::error!("trigger '{}' has no inbox; was init skipped?", self.base.meta().label);
            return;
        };
        let mut signals = self.base.flow_ctx().subscribe_signals();
        let timeout = effective_timeout(self.config.timeout);
        log::debug!("trigger '{}' is listening for events", self.base.meta().label);

        'armed: loop {
            // Fixed deadline per wait: non-matching traffic does not extend
            // it; a delivered event or a fired timeout re-arms it.
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                tokio::select! {
                    msg = inbox.recv() => match msg {
                        Some(msg) => {
                            if message_matches(
                                self.base.meta(),
                                self.config.is_value_filter_enabled,
                                &self.config.value_filter,
                                &msg,
                            ) {
                                let event = ReactorEvent::with_message(
                                    msg,
                                    self.base.meta().success_transition.clone(),
                                );
                                (*runner)(event);
                                continue 'armed;
                            }
                            log::debug!("trigger '{}': not interested", self.base.meta().label);
                        }
                        None => break 'armed,
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        log::debug!("trigger '{}' timeout", self.base.meta().label);
                        (*runner)(ReactorEvent::transition(
                            self.base.meta().timeout_transition.clone(),
                        ));
                        continue 'armed;
                    }
                    signal = signals.recv() => match signal {
                        Ok(ControlSignal::Stop) | Err(RecvError::Closed) => break 'armed,
                        // Triggers keep running when only waits are terminated
                        Ok(ControlSignal::TerminateWaiting) | Err(RecvError::Lagged(_)) => {}
                    }
                }
            }
        }
        self.inbox.lock().replace(inbox);
        log::debug!("trigger '{}' reactor stopped", self.base.meta().label);
    }
}
