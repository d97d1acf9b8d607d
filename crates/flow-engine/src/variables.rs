//! In-memory variable context
//!
//! Variables are scoped either to one flow (the flow id is the scope) or to
//! the shared `"global"` scope. The engine registers/unregisters flow scopes
//! at flow creation and deletion; nodes read and write variables. Storage
//! backends are out of scope; this store is memory only.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{EngineError, Result};
use crate::model::{Variable, GLOBAL_SCOPE};

/// One stored variable with its metadata
#[derive(Debug, Clone)]
struct VariableRecord {
    variable: Variable,
    description: String,
    /// Retained for API compatibility with persisted stores; memory-only here
    in_memory: bool,
}

/// Scoped key/value variable storage shared by all flows
#[derive(Default)]
pub struct VariableStore {
    scopes: RwLock<HashMap<String, HashMap<String, VariableRecord>>>,
}

impl VariableStore {
    pub fn new() -> Self {
        let store = Self::default();
        store.register_flow(GLOBAL_SCOPE);
        store
    }

    /// Create the scope for a flow id if it does not exist yet
    pub fn register_flow(&self, flow_id: &str) {
        self.scopes
            .write()
            .entry(flow_id.to_string())
            .or_default();
    }

    /// Drop a flow's scope and all its variables
    pub fn unregister_flow(&self, flow_id: &str) {
        self.scopes.write().remove(flow_id);
    }

    /// Write a variable into a scope, creating the scope on demand
    pub fn set_variable(
        &self,
        name: &str,
        value_type: &str,
        value: serde_json::Value,
        description: &str,
        scope: &str,
        in_memory: bool,
    ) -> Result<()> {
        let mut scopes = self.scopes.write();
        let entries = scopes.entry(scope.to_string()).or_default();
        entries.insert(
            name.to_string(),
            VariableRecord {
                variable: Variable::new(value_type, value),
                description: description.to_string(),
                in_memory,
            },
        );
        Ok(())
    }

    /// Read a variable from a scope
    pub fn get_variable(&self, name: &str, scope: &str) -> Result<Variable> {
        self.scopes
            .read()
            .get(scope)
            .and_then(|entries| entries.get(name))
            .map(|record| record.variable.clone())
            .ok_or_else(|| EngineError::VariableNotFound {
                name: name.to_string(),
                scope: scope.to_string(),
            })
    }

    /// Description attached to a variable, if any
    pub fn variable_description(&self, name: &str, scope: &str) -> Option<String> {
        self.scopes
            .read()
            .get(scope)
            .and_then(|entries| entries.get(name))
            .map(|record| record.description.clone())
    }

    /// Whether a variable was stored as memory-only (true) or marked for
    /// persistence by its writer (false)
    pub fn is_variable_in_memory(&self, name: &str, scope: &str) -> Option<bool> {
        self.scopes
            .read()
            .get(scope)
            .and_then(|entries| entries.get(name))
            .map(|record| record.in_memory)
    }

    /// Names of all variables in a scope
    pub fn variable_names(&self, scope: &str) -> Vec<String> {
        self.scopes
            .read()
            .get(scope)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get_scoped() {
        let store = VariableStore::new();
        store.register_flow("flow-1");
        store
            .set_variable("mode", "string", json!("correct"), "", "flow-1", true)
            .unwrap();

        let var = store.get_variable("mode", "flow-1").unwrap();
        assert_eq!(var.value, json!("correct"));
        assert_eq!(var.value_type, "string");

        // Same name in another scope is a different variable
        assert!(store.get_variable("mode", GLOBAL_SCOPE).is_err());
    }

    #[test]
    fn test_global_scope() {
        let store = VariableStore::new();
        store
            .set_variable("volume", "int", json!(65), "amp volume", GLOBAL_SCOPE, false)
            .unwrap();
        let var = store.get_variable("volume", GLOBAL_SCOPE).unwrap();
        assert_eq!(var.as_i64(), Some(65));
        assert_eq!(
            store.variable_description("volume", GLOBAL_SCOPE).as_deref(),
            Some("amp volume")
        );
        assert_eq!(store.is_variable_in_memory("volume", GLOBAL_SCOPE), Some(false));
    }

    #[test]
    fn test_unregister_drops_scope() {
        let store = VariableStore::new();
        store.register_flow("flow-1");
        store
            .set_variable("status", "string", json!("ok"), "", "flow-1", true)
            .unwrap();
        store.unregister_flow("flow-1");
        assert!(store.get_variable("status", "flow-1").is_err());
        assert!(store.variable_names("flow-1").is_empty());
    }
}
