// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Declared resource nodes, the node registry and output accessors.
//!
//! The registry is the stable identity map from node id to declared
//! resource. Nodes own their output signals exclusively: the only writer is
//! the deployment driver's output-fill step, and signals are disposed only
//! when the node is deleted. Components observe outputs through
//! [`OutputAccessors`], whose reads subscribe the reading fiber.

use crate::error::{Error, Result};
use crate::path::{NodeId, Path};
use crate::shared::EngineShared;
use crate::signal::Signal;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Point-in-time view of one declared resource: what is diffed by the
/// reconciler and persisted by the state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Deterministic id derived from `path`.
    pub id: NodeId,
    /// The node's declaration path.
    pub path: Path,
    /// Resource class name, e.g. `"aws:s3/Bucket"`.
    pub construct_type: String,
    /// Defined props at declaration time.
    #[serde(default)]
    pub props: serde_json::Map<String, Value>,
    /// Provider-reported outputs known so far.
    #[serde(default)]
    pub outputs: serde_json::Map<String, Value>,
    /// Provider-owned auxiliary state.
    #[serde(default)]
    pub state: serde_json::Map<String, Value>,
    /// Ids of nodes nested under this one, derived from path prefixes.
    #[serde(default)]
    pub children: Vec<NodeId>,
    /// Ids of nodes whose outputs were read while declaring this node.
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
}

pub(crate) struct NodeRecord {
    pub id: NodeId,
    pub path: Path,
    pub construct_type: String,
    pub props: serde_json::Map<String, Value>,
    pub outputs: IndexMap<String, Signal>,
    pub state: serde_json::Map<String, Value>,
    pub dependencies: IndexSet<NodeId>,
    /// Path of the fiber that declared this node; used to reject the same
    /// id arriving from an incompatible fiber.
    pub declared_by: Path,
}

#[derive(Default)]
struct RegistryInner {
    nodes: FxHashMap<NodeId, NodeRecord>,
    /// Outputs loaded from the previous run, applied to signals when the
    /// owning node is (re-)declared or first read.
    seeded_outputs: FxHashMap<NodeId, serde_json::Map<String, Value>>,
    seeded_state: FxHashMap<NodeId, serde_json::Map<String, Value>>,
    /// When set, output reads record the read node id here. The renderer
    /// activates this around each component execution.
    read_capture: Option<IndexSet<NodeId>>,
}

/// Identity map from node id to declared resource node.
pub(crate) struct NodeRegistry {
    inner: Mutex<RegistryInner>,
}

impl NodeRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Load outputs and provider state from a previous run so the first
    /// render already sees known values.
    pub(crate) fn seed(&self, previous: &[NodeSnapshot]) {
        let mut inner = self.inner.lock();
        for node in previous {
            inner
                .seeded_outputs
                .insert(node.id.clone(), node.outputs.clone());
            inner
                .seeded_state
                .insert(node.id.clone(), node.state.clone());
        }
    }

    /// Register a node declaration, or stage a prop update when the node
    /// already exists with different props.
    pub(crate) fn register(
        &self,
        shared: &EngineShared,
        id: NodeId,
        path: Path,
        construct_type: &str,
        props: serde_json::Map<String, Value>,
        declared_by: &Path,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.nodes.get_mut(&id) {
            if existing.declared_by != *declared_by {
                return Err(Error::DuplicateNodeId {
                    id: id.to_string(),
                    first_path: existing.declared_by.to_string(),
                    second_path: declared_by.to_string(),
                });
            }
            existing.construct_type = construct_type.to_string();
            existing.props = props;
            return Ok(());
        }

        let seeded = inner.seeded_outputs.remove(&id).unwrap_or_default();
        let state = inner.seeded_state.remove(&id).unwrap_or_default();
        let mut outputs = IndexMap::new();
        for (key, value) in seeded {
            outputs.insert(key, shared.reactive.create_signal(value));
        }
        inner.nodes.insert(
            id.clone(),
            NodeRecord {
                id,
                path,
                construct_type: construct_type.to_string(),
                props,
                outputs,
                state,
                dependencies: IndexSet::new(),
                declared_by: declared_by.clone(),
            },
        );
        Ok(())
    }

    /// Tracked read of one output. Creates the signal lazily (undefined)
    /// so the subscription exists before the output is ever filled.
    /// Returns `None` while the output is unavailable.
    pub(crate) fn read_output(
        &self,
        shared: &EngineShared,
        id: &NodeId,
        key: &str,
    ) -> Option<Value> {
        let signal = {
            let mut inner = self.inner.lock();
            if let Some(capture) = inner.read_capture.as_mut() {
                capture.insert(id.clone());
            }
            let seeded = inner
                .seeded_outputs
                .get(id)
                .and_then(|m| m.get(key))
                .cloned();
            let record = inner.nodes.get_mut(id)?;
            match record.outputs.get(key) {
                Some(signal) => *signal,
                None => {
                    let signal = shared
                        .reactive
                        .create_signal(seeded.unwrap_or(Value::Null));
                    record.outputs.insert(key.to_string(), signal);
                    signal
                }
            }
        };
        match shared.reactive.get(signal) {
            Value::Null => None,
            value => Some(value),
        }
    }

    /// Write a provider-returned output map into the node's signals. The
    /// caller wraps this in a reactive batch.
    pub(crate) fn fill_outputs(
        &self,
        shared: &EngineShared,
        id: &NodeId,
        outputs: &serde_json::Map<String, Value>,
    ) -> Result<()> {
        let signals: Vec<(Signal, Value)> = {
            let mut inner = self.inner.lock();
            let Some(record) = inner.nodes.get_mut(id) else {
                return Ok(());
            };
            outputs
                .iter()
                .map(|(key, value)| {
                    let signal = match record.outputs.get(key) {
                        Some(signal) => *signal,
                        None => {
                            let signal = shared.reactive.create_signal(Value::Null);
                            record.outputs.insert(key.clone(), signal);
                            signal
                        }
                    };
                    (signal, value.clone())
                })
                .collect()
        };
        for (signal, value) in signals {
            shared.reactive.set(signal, value)?;
        }
        Ok(())
    }

    /// Record which other nodes' outputs were read before declaring `id`.
    /// Dependencies are the *prefix* of the fiber's reads at declaration
    /// time: reads that happened after the call cannot have fed its props.
    pub(crate) fn set_dependencies(&self, id: &NodeId, reads: &IndexSet<NodeId>) {
        let mut inner = self.inner.lock();
        let Some(record) = inner.nodes.get(id) else {
            return;
        };
        let own = record.id.clone();
        let deps: IndexSet<NodeId> = reads.iter().filter(|r| **r != own).cloned().collect();
        if let Some(record) = inner.nodes.get_mut(id) {
            record.dependencies = deps;
        }
    }

    /// Activate read capture for a component execution.
    pub(crate) fn begin_read_capture(&self) {
        self.inner.lock().read_capture = Some(IndexSet::new());
    }

    /// The reads captured so far, without deactivating capture.
    pub(crate) fn peek_read_capture(&self) -> IndexSet<NodeId> {
        self.inner
            .lock()
            .read_capture
            .as_ref()
            .cloned()
            .unwrap_or_default()
    }

    /// Deactivate read capture and return what was read.
    pub(crate) fn take_read_capture(&self) -> IndexSet<NodeId> {
        self.inner.lock().read_capture.take().unwrap_or_default()
    }

    /// Remove a node and dispose its output signals. Used when the
    /// declaring fiber unmounts or a delete is applied.
    pub(crate) fn remove(&self, shared: &EngineShared, id: &NodeId) {
        let record = self.inner.lock().nodes.remove(id);
        if let Some(record) = record {
            for (_, signal) in record.outputs {
                shared.reactive.dispose_signal(signal);
            }
        }
    }

    /// Drop records (and their signals) for nodes in neither the current
    /// tree nor the applied baseline, e.g. nodes declared and unmounted
    /// within one run before ever deploying.
    pub(crate) fn prune(&self, shared: &EngineShared, keep: &IndexSet<NodeId>) {
        let stale: Vec<NodeId> = {
            let inner = self.inner.lock();
            inner
                .nodes
                .keys()
                .filter(|id| !keep.contains(*id))
                .cloned()
                .collect()
        };
        for id in stale {
            self.remove(shared, &id);
        }
    }

    /// Build snapshots for `ids` in the given order, deriving parent-child
    /// nesting from path prefixes within the set.
    pub(crate) fn snapshot(&self, shared: &EngineShared, ids: &[NodeId]) -> Vec<NodeSnapshot> {
        let inner = self.inner.lock();
        let mut snapshots: Vec<NodeSnapshot> = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(record) = inner.nodes.get(id) else {
                continue;
            };
            let mut outputs = serde_json::Map::new();
            for (key, signal) in &record.outputs {
                let value = shared.reactive.get_untracked(*signal);
                if !value.is_null() {
                    outputs.insert(key.clone(), value);
                }
            }
            snapshots.push(NodeSnapshot {
                id: record.id.clone(),
                path: record.path.clone(),
                construct_type: record.construct_type.clone(),
                props: record.props.clone(),
                outputs,
                state: record.state.clone(),
                children: Vec::new(),
                dependencies: record.dependencies.iter().cloned().collect(),
            });
        }
        drop(inner);
        link_children(&mut snapshots);
        snapshots
    }
}

/// Fill each snapshot's `children` with the ids whose nearest node ancestor
/// (by path prefix) it is.
pub(crate) fn link_children(snapshots: &mut [NodeSnapshot]) {
    let paths: Vec<(NodeId, Path)> = snapshots
        .iter()
        .map(|s| (s.id.clone(), s.path.clone()))
        .collect();
    for snapshot in snapshots.iter_mut() {
        snapshot.children.clear();
    }
    for (child_id, child_path) in &paths {
        let parent = paths
            .iter()
            .filter(|(id, path)| id != child_id && path.is_prefix_of(child_path))
            .max_by_key(|(_, path)| path.depth());
        if let Some((parent_id, _)) = parent {
            if let Some(parent_snapshot) = snapshots.iter_mut().find(|s| s.id == *parent_id) {
                parent_snapshot.children.push(child_id.clone());
            }
        }
    }
}

/// Readers for one node's outputs, or a placeholder when the declaring call
/// had undefined props.
///
/// `get` performs a subscribing read during render; outside render (in
/// effects) reads are untracked. Unknown output keys read as `None`.
#[derive(Clone)]
pub struct OutputAccessors {
    target: Option<(NodeId, Arc<EngineShared>)>,
}

impl OutputAccessors {
    /// The placeholder bundle: every read returns `None`, no node exists.
    pub(crate) fn placeholder() -> Self {
        Self { target: None }
    }

    pub(crate) fn live(id: NodeId, shared: Arc<EngineShared>) -> Self {
        Self {
            target: Some((id, shared)),
        }
    }

    /// Read output `key`. `None` while the output is not yet available, for
    /// unknown keys, and always on placeholders.
    pub fn get(&self, key: &str) -> Option<Value> {
        let (id, shared) = self.target.as_ref()?;
        shared.registry.read_output(shared, id, key)
    }

    /// Read output `key` as a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The declared node's id, or `None` for placeholders.
    pub fn node_id(&self) -> Option<&NodeId> {
        self.target.as_ref().map(|(id, _)| id)
    }

    /// Whether this bundle is the placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.target.is_none()
    }
}

impl std::fmt::Debug for OutputAccessors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            None => f.write_str("OutputAccessors(placeholder)"),
            Some((id, _)) => write!(f, "OutputAccessors({id})"),
        }
    }
}
