//! Registry of named, shared external connections
//!
//! Connectors (message bus client, HTTP server, database client, ...) are
//! created once, registered under a name, and looked up by nodes during
//! configuration. Instances are shared read-mostly: nodes grab a handle at
//! `load_node_config` time and afterwards call the connection's own
//! thread-safe methods.

use std::any::Any;
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Contract every pluggable connector implements
pub trait Connector: Send + Sync {
    /// Type tag of this connector ("message_bus", "http_server", ...)
    fn connector_type(&self) -> &str;

    /// One-time setup when the connector is brought up
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources held by the connector
    fn stop(&self) {}

    /// Upcast used for typed lookups; implementations return `self`
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A registered connector with its instance name
pub struct ConnectorInstance {
    pub name: String,
    pub connector_type: String,
    pub connection: Arc<dyn Connector>,
}

/// Lookup of shared connector instances by name
#[derive(Default)]
pub struct ConnectorRegistry {
    instances: Vec<ConnectorInstance>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector under an instance name
    pub fn add_instance(&mut self, name: impl Into<String>, connection: Arc<dyn Connector>) {
        self.instances.push(ConnectorInstance {
            name: name.into(),
            connector_type: connection.connector_type().to_string(),
            connection,
        });
    }

    /// Look up an instance by name
    pub fn get_instance(&self, name: &str) -> Option<&ConnectorInstance> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Look up an instance and downcast its connection to a concrete type
    ///
    /// A missing instance or a wrong-typed connection is a configuration
    /// failure and aborts flow configuration.
    pub fn typed<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let instance = self
            .get_instance(name)
            .ok_or_else(|| EngineError::Connector(name.to_string()))?;
        instance
            .connection
            .clone()
            .as_any_arc()
            .downcast::<T>()
            .map_err(|_| EngineError::Connector(name.to_string()))
    }

    /// All registered instance names
    pub fn instance_names(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.name.as_str()).collect()
    }
}
