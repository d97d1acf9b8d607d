//! Interval trigger node: a start reactor driven by timers
//!
//! Each configured interval gets its own ticker task feeding the node's
//! internal channel; the wait-loop turns ticks into new flow executions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use flow_engine::{
    BaseNode, ConnectorRegistry, ControlSignal, EngineError, FlowNode, FlowOperationalContext,
    Message, MetaNode, ReactorEvent, Result, Variable, VariableStore,
};

/// Ticks buffered while the wait-loop is busy spawning executions
const TICK_BUFFER: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntervalTriggerConfig {
    pub intervals: Vec<IntervalSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntervalSpec {
    pub name: String,
    pub seconds: u64,
}

pub struct IntervalTriggerNode {
    base: BaseNode,
    config: IntervalTriggerConfig,
    tickers: Mutex<Vec<JoinHandle<()>>>,
    inbox: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl IntervalTriggerNode {
    pub fn create(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        _variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(Self {
            base: BaseNode::reactor(meta, flow_ctx, true),
            config: IntervalTriggerConfig::default(),
            tickers: Mutex::new(Vec::new()),
            inbox: Mutex::new(None),
        })
    }
}

#[async_trait]
impl FlowNode for IntervalTriggerNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn load_node_config(&mut self, _connectors: Option<&ConnectorRegistry>) -> Result<()> {
        self.config = serde_json::from_value(self.base.meta().config.clone())
            .map_err(|err| EngineError::config(format!("interval trigger config: {err}")))?;
        if self.config.intervals.is_empty() {
            return Err(EngineError::config(format!(
                "interval trigger '{}' needs at least one interval",
                self.base.meta().label
            )));
        }
        Ok(())
    }

    fn init(&self) -> Result<()> {
        let mut inbox = self.inbox.lock();
        if inbox.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(TICK_BUFFER);
        *inbox = Some(rx);

        let mut tickers = self.tickers.lock();
        for spec in &self.config.intervals {
            let tx = tx.clone();
            let spec = spec.clone();
            tickers.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(spec.seconds.max(1)));
                // The first tick of a tokio interval completes immediately.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let msg = Message {
                        payload: Variable::new("string", json!(spec.name)),
                        header: [("name".to_string(), spec.name.clone())].into(),
                        ..Default::default()
                    };
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
            }));
        }
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        for ticker in self.tickers.lock().drain(..) {
            ticker.abort();
        }
        self.inbox.lock().take();
        Ok(())
    }

    async fn wait_for_event(&self, _events: Option<mpsc::Sender<ReactorEvent>>) {
        let Some(_claim) = self.base.claim_reactor() else {
            log::debug!(
                "interval trigger '{}' reactor already running",
                self.base.meta().label
            );
            return;
        };
        let Some(runner) = self.base.runner() else {
            log::error!(
                "interval trigger '{}' has no flow runner",
                self.base.meta().label
            );
            return;
        };
        let Some(mut inbox) = self.inbox.lock().take() else {
            log::error!(
                "interval trigger '{}' has no inbox; was init skipped?",
                self.base.meta().label
            );
            return;
        };
        let mut signals = self.base.flow_ctx().subscribe_signals();

        loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(msg) => {
                        log::debug!("interval trigger '{}': new time event", self.base.meta().label);
                        (*runner)(ReactorEvent::with_message(
                            msg,
                            self.base.meta().success_transition.clone(),
                        ));
                    }
                    None => break,
                },
                signal = signals.recv() => match signal {
                    Ok(ControlSignal::Stop) | Err(RecvError::Closed) => break,
                    Ok(ControlSignal::TerminateWaiting) | Err(RecvError::Lagged(_)) => {}
                }
            }
        }
        self.inbox.lock().replace(inbox);
        log::debug!("interval trigger '{}' reactor stopped", self.base.meta().label);
    }
}
