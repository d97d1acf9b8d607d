//! If node: routes an execution down its true or false branch
//!
//! Evaluates a chain of comparison expressions against the input payload
//! (or a context variable) and transitions to the configured true/false
//! target. Expressions are folded left to right with each expression's
//! `and`/`or` operator joining it to the next one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flow_engine::{
    BaseNode, ConnectorRegistry, EngineError, FlowNode, FlowOperationalContext, Message, MetaNode,
    NodeId, Result, Variable, VariableStore, GLOBAL_SCOPE,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IfConfig {
    pub true_transition: NodeId,
    pub false_transition: NodeId,
    pub expression: Vec<IfExpression>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IfExpression {
    /// Comparison operand: eq, neq, gt, lt, gte, lte
    pub operand: String,
    /// Constant right-hand side, used when no variable name is given
    pub right_variable: Variable,
    /// Context variable supplying the right-hand side
    pub right_variable_name: String,
    pub is_right_variable_global: bool,
    /// Context variable supplying the left-hand side; input payload if empty
    pub left_variable_name: String,
    pub is_left_variable_global: bool,
    /// Joins this expression with the next one: "and" (default) or "or"
    pub boolean_operator: String,
}

pub struct IfNode {
    base: BaseNode,
    variables: Arc<VariableStore>,
    config: IfConfig,
}

impl IfNode {
    pub fn create(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(Self {
            base: BaseNode::new(meta, flow_ctx),
            variables,
            config: IfConfig::default(),
        })
    }

    fn scope(&self, is_global: bool) -> &str {
        if is_global {
            GLOBAL_SCOPE
        } else {
            &self.base.flow_ctx().flow_id
        }
    }

    fn operand_value(&self, name: &str, is_global: bool, fallback: &Variable) -> Result<Variable> {
        if name.is_empty() {
            Ok(fallback.clone())
        } else {
            self.variables.get_variable(name, self.scope(is_global))
        }
    }

    fn compare(left: &Variable, operand: &str, right: &Variable) -> Result<bool> {
        match operand {
            "eq" => Ok(left.value == right.value),
            "neq" => Ok(left.value != right.value),
            "gt" | "lt" | "gte" | "lte" => {
                let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                    return Err(EngineError::execution(format!(
                        "'{operand}' comparison needs numeric operands"
                    )));
                };
                Ok(match operand {
                    "gt" => l > r,
                    "lt" => l < r,
                    "gte" => l >= r,
                    _ => l <= r,
                })
            }
            other => Err(EngineError::execution(format!(
                "unknown comparison operand '{other}'"
            ))),
        }
    }

    fn evaluate(&self, msg: &Message) -> Result<bool> {
        let mut result: Option<bool> = None;
        let mut join = "and";
        for expr in &self.config.expression {
            let left =
                self.operand_value(&expr.left_variable_name, expr.is_left_variable_global, &msg.payload)?;
            let right = self.operand_value(
                &expr.right_variable_name,
                expr.is_right_variable_global,
                &expr.right_variable,
            )?;
            let outcome = Self::compare(&left, &expr.operand, &right)?;
            result = Some(match result {
                None => outcome,
                Some(acc) if join == "or" => acc || outcome,
                Some(acc) => acc && outcome,
            });
            join = if expr.boolean_operator == "or" { "or" } else { "and" };
        }
        Ok(result.unwrap_or(false))
    }
}

#[async_trait]
impl FlowNode for IfNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn load_node_config(&mut self, _connectors: Option<&ConnectorRegistry>) -> Result<()> {
        self.config = serde_json::from_value(self.base.meta().config.clone())
            .map_err(|err| EngineError::config(format!("if node config: {err}")))?;
        if self.config.expression.is_empty() {
            return Err(EngineError::config(format!(
                "if node '{}' has no expressions",
                self.base.meta().label
            )));
        }
        Ok(())
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        let matched = self.evaluate(msg)?;
        log::debug!("if '{}': condition is {}", self.base.meta().label, matched);
        let transition = if matched {
            self.config.true_transition.clone()
        } else {
            self.config.false_transition.clone()
        };
        Ok(vec![transition])
    }
}
