//! Receive node: the mid-graph reactor ("receive with timeout")
//!
//! The graph walker starts this node's wait-loop lazily when an execution
//! reaches it, then blocks on the event channel. The loop delivers exactly
//! one event, success or timeout flavored, with a non-blocking send and
//! returns; an unconsumed event is dropped and logged.

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
pub struct ReceiveConfig {
    /// Wait timeout in seconds; 0 means effectively infinite
    pub timeout: u64,
    pub value_filter: Variable,
    pub is_value_filter_enabled: bool,
}

pub struct ReceiveNode {
    base: BaseNode,
    config: ReceiveConfig,
    bus: Option<Arc<MessageBus>>,
    subscription: Mutex<Option<SubscriptionId>>,
    inbox: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl ReceiveNode {
    pub fn create(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        _variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(Self {
            base: BaseNode::reactor(meta, flow_ctx, false),
            config: ReceiveConfig::default(),
            bus: None,
            subscription: Mutex::new(None),
            inbox: Mutex::new(None),
        })
    }

    /// Hand one event to the walker without blocking the reactor
    fn deliver(&self, events: &mpsc::Sender<ReactorEvent>, event: ReactorEvent) {
        if events.try_send(event).is_err() {
            log::debug!(
                "receive '{}': event dropped, no listener ready",
                self.base.meta().label
            );
        }
    }
}

#[async_trait]
impl FlowNode for ReceiveNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn load_node_config(&mut self, connectors: Option<&ConnectorRegistry>) -> Result<()> {
        let meta = self.base.meta();
        if meta.address.is_empty() || meta.service.is_empty() || meta.service_interface.is_empty()
        {
            return Err(EngineError::config(format!(
                "receive node '{}' needs address, service and interface",
                meta.label
            )));
        }
        if !meta.config.is_null() {
            self.config = serde_json::from_value(meta.config.clone())
                .map_err(|err| EngineError::config(format!("receive node config: {err}")))?;
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

    async fn wait_for_event(&self, events: Option<mpsc::Sender<ReactorEvent>>) {
        let Some(_claim) = self.base.claim_reactor() else {
            log::debug!("receive '{}' reactor already running", self.base.meta().label);
            return;
        };
        let Some(events) = events else {
            log::error!(
                "receive '{}' needs an event channel to report into",
                self.base.meta().label
            );
            return;
        };
        let Some(mut inbox) = self.inbox.lock().take() else {
            log::error!("receive '{}' has no inbox; was init skipped?", self.base.meta().label);
            return;
        };
        let mut signals = self.base.flow_ctx().subscribe_signals();
        let deadline = tokio::time::Instant::now() + effective_timeout(self.config.timeout);
        log::debug!("receive '{}' is waiting for an event", self.base.meta().label);

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
                            self.deliver(&events, event);
                            break;
                        }
                        log::debug!("receive '{}': not interested", self.base.meta().label);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    log::debug!("receive '{}' timed out", self.base.meta().label);
                    self.deliver(
                        &events,
                        ReactorEvent::transition(self.base.meta().timeout_transition.clone()),
                    );
                    break;
                }
                signal = signals.recv() => match signal {
                    Ok(ControlSignal::Stop)
                    | Ok(ControlSignal::TerminateWaiting)
                    | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => {}
                }
            }
        }
        self.inbox.lock().replace(inbox);
        log::debug!("receive '{}' reactor stopped", self.base.meta().label);
    }
}
