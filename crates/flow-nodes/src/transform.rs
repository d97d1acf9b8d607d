//! Transform node: arithmetic and boolean calc operations
//!
//! Left operand comes from the input payload or a context variable, the
//! right operand from a constant or another variable. The result replaces
//! the input payload or lands in a target variable.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use flow_engine::{
    BaseNode, ConnectorRegistry, EngineError, FlowNode, FlowOperationalContext, Message, MetaNode,
    NodeId, Result, Variable, VariableStore, GLOBAL_SCOPE,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformConfig {
    /// flip, add, subtract, multiply, divide
    pub operation: String,
    /// Constant right operand, used when no variable name is given
    pub r_value: Variable,
    pub r_variable_name: String,
    pub is_r_variable_global: bool,
    /// Left operand variable; input payload if empty
    pub l_variable_name: String,
    pub is_l_variable_global: bool,
    /// Result variable; result replaces the input payload if empty
    pub target_variable_name: String,
    pub target_variable_type: String,
    pub is_target_variable_global: bool,
}

pub struct TransformNode {
    base: BaseNode,
    variables: Arc<VariableStore>,
    config: TransformConfig,
}

impl TransformNode {
    pub fn create(
        flow_ctx: Arc<FlowOperationalContext>,
        meta: MetaNode,
        variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        Box::new(Self {
            base: BaseNode::new(meta, flow_ctx),
            variables,
            config: TransformConfig::default(),
        })
    }

    fn scope(&self, is_global: bool) -> &str {
        if is_global {
            GLOBAL_SCOPE
        } else {
            &self.base.flow_ctx().flow_id
        }
    }

    fn calc(&self, left: &Variable, right: &Variable) -> Result<Variable> {
        match self.config.operation.as_str() {
            "flip" => {
                let value = left.as_bool().ok_or_else(|| {
                    EngineError::execution("flip needs a boolean left operand")
                })?;
                Ok(Variable::new("bool", json!(!value)))
            }
            op @ ("add" | "subtract" | "multiply" | "divide") => {
                // Integer operands stay integers except for division.
                if op != "divide" {
                    if let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) {
                        let value = match op {
                            "add" => l + r,
                            "subtract" => l - r,
                            _ => l * r,
                        };
                        return Ok(Variable::new("int", json!(value)));
                    }
                }
                let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                    return Err(EngineError::execution(format!(
                        "'{op}' needs numeric operands"
                    )));
                };
                if op == "divide" && r == 0.0 {
                    return Err(EngineError::execution("division by zero"));
                }
                let value = match op {
                    "add" => l + r,
                    "subtract" => l - r,
                    "multiply" => l * r,
                    _ => l / r,
                };
                Ok(Variable::new("float", json!(value)))
            }
            other => Err(EngineError::execution(format!(
                "unknown transform operation '{other}'"
            ))),
        }
    }
}

#[async_trait]
impl FlowNode for TransformNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    fn load_node_config(&mut self, _connectors: Option<&ConnectorRegistry>) -> Result<()> {
        self.config = serde_json::from_value(self.base.meta().config.clone())
            .map_err(|err| EngineError::config(format!("transform node config: {err}")))?;
        if self.config.operation.is_empty() {
            return Err(EngineError::config(format!(
                "transform node '{}' needs an operation",
                self.base.meta().label
            )));
        }
        Ok(())
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        log::debug!(
            "transform '{}' executing operation {}",
            self.base.meta().label,
            self.config.operation
        );
        let left = if self.config.l_variable_name.is_empty() {
            msg.payload.clone()
        } else {
            self.variables.get_variable(
                &self.config.l_variable_name,
                self.scope(self.config.is_l_variable_global),
            )?
        };
        let right = if self.config.r_variable_name.is_empty() {
            self.config.r_value.clone()
        } else {
            self.variables.get_variable(
                &self.config.r_variable_name,
                self.scope(self.config.is_r_variable_global),
            )?
        };

        let result = self.calc(&left, &right)?;
        if self.config.target_variable_name.is_empty() {
            msg.payload = result;
        } else {
            let value_type = if self.config.target_variable_type.is_empty() {
                result.value_type.as_str()
            } else {
                self.config.target_variable_type.as_str()
            };
            self.variables.set_variable(
                &self.config.target_variable_name,
                value_type,
                result.value,
                "",
                self.scope(self.config.is_target_variable_global),
                true,
            )?;
        }
        Ok(vec![self.base.meta().success_transition.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::FlowDefinition;

    fn transform_node(
        config: serde_json::Value,
        variables: Arc<VariableStore>,
    ) -> Box<dyn FlowNode> {
        let ctx = Arc::new(FlowOperationalContext::new(
            "f1",
            Arc::new(FlowDefinition::default()),
        ));
        let meta = MetaNode {
            id: "2".to_string(),
            node_type: "transform".to_string(),
            success_transition: "".to_string(),
            config,
            ..Default::default()
        };
        let mut node = TransformNode::create(ctx, meta, variables);
        node.load_node_config(None).unwrap();
        node
    }

    #[tokio::test]
    async fn test_flip_bool_payload() {
        let node = transform_node(json!({"operation": "flip"}), Arc::new(VariableStore::new()));
        let mut msg = Message {
            payload: Variable::new("bool", json!(false)),
            ..Default::default()
        };
        node.on_input(&mut msg).await.unwrap();
        assert_eq!(msg.payload.value, json!(true));
    }

    #[tokio::test]
    async fn test_add_keeps_float() {
        let node = transform_node(
            json!({"operation": "add", "rValue": {"valueType": "int", "value": 2}}),
            Arc::new(VariableStore::new()),
        );
        let mut msg = Message {
            payload: Variable::new("float", json!(12.5)),
            ..Default::default()
        };
        node.on_input(&mut msg).await.unwrap();
        assert_eq!(msg.payload.value, json!(14.5));
    }

    #[tokio::test]
    async fn test_add_integers_to_target_variable() {
        let variables = Arc::new(VariableStore::new());
        variables.register_flow("f1");
        let node = transform_node(
            json!({
                "operation": "add",
                "rValue": {"valueType": "int", "value": 3},
                "targetVariableName": "sum"
            }),
            variables.clone(),
        );
        let mut msg = Message {
            payload: Variable::new("int", json!(4)),
            ..Default::default()
        };
        node.on_input(&mut msg).await.unwrap();
        let sum = variables.get_variable("sum", "f1").unwrap();
        assert_eq!(sum.value, json!(7));
        assert_eq!(sum.value_type, "int");
    }

    #[tokio::test]
    async fn test_division_by_zero_errors() {
        let node = transform_node(
            json!({"operation": "divide", "rValue": {"valueType": "int", "value": 0}}),
            Arc::new(VariableStore::new()),
        );
        let mut msg = Message {
            payload: Variable::new("int", json!(8)),
            ..Default::default()
        };
        assert!(node.on_input(&mut msg).await.is_err());
    }
}
