//! Built-in node implementations for the flow engine
//!
//! Every node decodes its own opaque configuration payload and talks to the
//! engine exclusively through the `FlowNode` contract. [`default_registry`]
//! wires all built-in type tags to their constructors; applications can
//! merge their own registries on top.

pub mod action;
pub mod condition;
mod filter;
pub mod interval_trigger;
pub mod log_node;
pub mod loop_node;
pub mod receive;
pub mod set_variable;
pub mod transform;
pub mod trigger;
pub mod wait;

use flow_engine::NodeRegistry;

pub use action::ActionNode;
pub use condition::IfNode;
pub use interval_trigger::IntervalTriggerNode;
pub use log_node::LogNode;
pub use loop_node::LoopNode;
pub use receive::ReceiveNode;
pub use set_variable::SetVariableNode;
pub use transform::TransformNode;
pub use trigger::TriggerNode;
pub use wait::WaitNode;

/// Registry with all built-in node types
pub fn default_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.register_fn("trigger", TriggerNode::create);
    registry.register_fn("receive", ReceiveNode::create);
    registry.register_fn("if", IfNode::create);
    registry.register_fn("action", ActionNode::create);
    registry.register_fn("wait", WaitNode::create);
    registry.register_fn("set_variable", SetVariableNode::create);
    registry.register_fn("loop", LoopNode::create);
    registry.register_fn("interval_trigger", IntervalTriggerNode::create);
    registry.register_fn("transform", TransformNode::create);
    registry.register_fn("log", LogNode::create);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_all_builtin_types() {
        let registry = default_registry();
        for node_type in [
            "trigger",
            "receive",
            "if",
            "action",
            "wait",
            "set_variable",
            "loop",
            "interval_trigger",
            "transform",
            "log",
        ] {
            assert!(registry.has_node_type(node_type), "missing {node_type}");
        }
    }
}
