//! Mock provider for testing deployment flows without a cloud.

use async_trait::async_trait;
use cirrus::{Error, NodeSnapshot, OutputMap, Provider, ProviderError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Handler function computing apply outputs from a node snapshot.
pub type ApplyHandler =
    Arc<dyn Fn(&NodeSnapshot) -> std::result::Result<OutputMap, ProviderError> + Send + Sync>;

/// A configurable in-memory provider.
///
/// Outputs come from, in order of precedence: a per-construct handler, a
/// per-construct fixed output map, or the default `{"id": "<node id>"}`.
/// Failure injection targets either a specific node id or the k-th apply
/// call overall.
///
/// # Example
///
/// ```rust
/// use cirrus_testing::MockProvider;
/// use serde_json::json;
///
/// let provider = MockProvider::new()
///     .with_outputs("rds/Instance", json!({"endpoint": "db.internal:5432"}))
///     .with_immutable("rds/Instance", ["zone"]);
/// ```
#[derive(Clone)]
pub struct MockProvider {
    handlers: Arc<Mutex<HashMap<String, ApplyHandler>>>,
    fixed_outputs: Arc<Mutex<HashMap<String, OutputMap>>>,
    immutable: Arc<Mutex<HashMap<String, Vec<String>>>>,
    /// Fail the apply whose overall call index (0-based) equals this.
    fail_apply_at: Arc<Mutex<Option<usize>>>,
    /// Fail every apply of this node id.
    fail_node: Arc<Mutex<Option<String>>>,
    error_message: String,
    apply_delay: Arc<Mutex<Option<std::time::Duration>>>,
    applied: Arc<Mutex<Vec<String>>>,
    destroyed: Arc<Mutex<Vec<String>>>,
    /// Combined log of `apply:<id>` / `destroy:<id>` in completion order.
    operations: Arc<Mutex<Vec<String>>>,
    apply_count: Arc<Mutex<usize>>,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("apply_count", &self.apply_count())
            .finish()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Create a provider that answers every apply with `{"id": <node id>}`.
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            fixed_outputs: Arc::new(Mutex::new(HashMap::new())),
            immutable: Arc::new(Mutex::new(HashMap::new())),
            fail_apply_at: Arc::new(Mutex::new(None)),
            fail_node: Arc::new(Mutex::new(None)),
            error_message: "injected provider failure".to_string(),
            apply_delay: Arc::new(Mutex::new(None)),
            applied: Arc::new(Mutex::new(Vec::new())),
            destroyed: Arc::new(Mutex::new(Vec::new())),
            operations: Arc::new(Mutex::new(Vec::new())),
            apply_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Sleep this long inside every apply, for timeout tests.
    pub fn with_apply_delay(self, delay: std::time::Duration) -> Self {
        *self.apply_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Fixed outputs for every node of `construct_type`.
    pub fn with_outputs(self, construct_type: impl Into<String>, outputs: Value) -> Self {
        self.set_outputs(construct_type, outputs);
        self
    }

    /// Replace the fixed outputs for `construct_type` at runtime. Useful
    /// for scenarios where a later run returns different values.
    pub fn set_outputs(&self, construct_type: impl Into<String>, outputs: Value) {
        let map = match outputs {
            Value::Object(map) => map,
            other => {
                let mut map = OutputMap::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.fixed_outputs
            .lock()
            .unwrap()
            .insert(construct_type.into(), map);
    }

    /// Compute outputs for `construct_type` from the node snapshot.
    pub fn with_handler<F>(self, construct_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&NodeSnapshot) -> std::result::Result<OutputMap, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(construct_type.into(), Arc::new(handler));
        self
    }

    /// Declare immutable prop keys for `construct_type`.
    pub fn with_immutable<I, S>(self, construct_type: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immutable.lock().unwrap().insert(
            construct_type.into(),
            keys.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Fail the apply whose overall 0-based call index is `index`.
    pub fn fail_apply_at(self, index: usize) -> Self {
        *self.fail_apply_at.lock().unwrap() = Some(index);
        self
    }

    /// Fail every apply of the node with this id.
    pub fn fail_node(self, node_id: impl Into<String>) -> Self {
        *self.fail_node.lock().unwrap() = Some(node_id.into());
        self
    }

    /// Stop failing a previously configured node.
    pub fn clear_failures(&self) {
        *self.fail_apply_at.lock().unwrap() = None;
        *self.fail_node.lock().unwrap() = None;
    }

    /// Set the injected failure message.
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Node ids applied so far, in completion order.
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    /// Node ids destroyed so far, in completion order.
    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    /// Combined `apply:<id>` / `destroy:<id>` log in completion order.
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    /// Total apply calls made.
    pub fn apply_count(&self) -> usize {
        *self.apply_count.lock().unwrap()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn apply(&self, node: &NodeSnapshot) -> std::result::Result<OutputMap, ProviderError> {
        let index = {
            let mut count = self.apply_count.lock().unwrap();
            let index = *count;
            *count += 1;
            index
        };
        let delay = *self.apply_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_apply_at.lock().unwrap() == Some(index) {
            return Err(self.error_message.clone().into());
        }
        if self
            .fail_node
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|id| id == node.id.as_str())
        {
            return Err(self.error_message.clone().into());
        }

        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(&node.construct_type)
            .cloned();
        let outputs = if let Some(handler) = handler {
            handler(node)?
        } else if let Some(fixed) = self
            .fixed_outputs
            .lock()
            .unwrap()
            .get(&node.construct_type)
            .cloned()
        {
            fixed
        } else {
            let mut map = OutputMap::new();
            map.insert("id".to_string(), Value::String(node.id.to_string()));
            map
        };
        self.applied.lock().unwrap().push(node.id.to_string());
        self.operations
            .lock()
            .unwrap()
            .push(format!("apply:{}", node.id));
        Ok(outputs)
    }

    async fn destroy(&self, node: &NodeSnapshot) -> std::result::Result<(), ProviderError> {
        self.destroyed.lock().unwrap().push(node.id.to_string());
        self.operations
            .lock()
            .unwrap()
            .push(format!("destroy:{}", node.id));
        Ok(())
    }

    async fn on_error(&self, _error: &Error, _nodes: &[NodeSnapshot]) {}

    fn immutable_props(&self, construct_type: &str) -> Vec<String> {
        self.immutable
            .lock()
            .unwrap()
            .get(construct_type)
            .cloned()
            .unwrap_or_default()
    }
}
