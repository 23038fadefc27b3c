// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The reconciler: previous graph vs. current graph -> ordered change-set.
//!
//! Diffing is by node id (a pure function of path). Updates compare props
//! structurally, ignoring outputs and provider state. The deployment order
//! is a topological order over two dependency sources: path-prefix
//! parenthood and the output reads observed during render. Batches are
//! layered so every node's dependencies sit in strictly earlier batches,
//! with lexicographic id ordering inside a batch for determinism.

use crate::error::{Error, Result};
use crate::node::NodeSnapshot;
use crate::path::NodeId;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One entry of a change-set: the node id plus its before/after snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// The affected node.
    pub id: NodeId,
    /// Snapshot from the previous graph; `None` for creates.
    pub before: Option<NodeSnapshot>,
    /// Snapshot from the current graph; `None` for deletes.
    pub after: Option<NodeSnapshot>,
}

/// The planned difference between two graphs, with deployment ordering.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Nodes present only in the current graph.
    pub creates: Vec<ChangeEntry>,
    /// Nodes present in both graphs whose props differ. Includes the
    /// entries also listed in `replacements`.
    pub updates: Vec<ChangeEntry>,
    /// Nodes present only in the previous graph.
    pub deletes: Vec<ChangeEntry>,
    /// Ids of updates that must be applied as destroy-then-create: the
    /// construct type changed, or a provider-declared immutable prop did.
    pub replacements: Vec<NodeId>,
    /// Topological order over creates + updates.
    pub deployment_order: Vec<NodeId>,
    /// `deployment_order` partitioned so each batch only depends on
    /// strictly earlier batches.
    pub parallel_batches: Vec<Vec<NodeId>>,
    /// Deletes in reverse topological order of the previous graph
    /// (children before parents). Scheduled after all applies by default.
    pub delete_order: Vec<NodeId>,
}

impl ChangeSet {
    /// True when there is nothing to deploy or destroy.
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Entry for `id` among creates and updates.
    pub fn entry(&self, id: &NodeId) -> Option<&ChangeEntry> {
        self.creates
            .iter()
            .chain(self.updates.iter())
            .find(|e| e.id == *id)
    }

    /// Whether `id` is scheduled as a replacement.
    pub fn is_replacement(&self, id: &NodeId) -> bool {
        self.replacements.contains(id)
    }
}

/// Compute the change-set between `previous` and `current`.
///
/// `immutable_props` is the provider's per-construct declaration: an update
/// touching one of these prop keys becomes a replacement.
pub(crate) fn reconcile(
    previous: &[NodeSnapshot],
    current: &[NodeSnapshot],
    immutable_props: impl Fn(&str) -> Vec<String>,
) -> Result<ChangeSet> {
    let prev_by_id: BTreeMap<&NodeId, &NodeSnapshot> =
        previous.iter().map(|n| (&n.id, n)).collect();
    let curr_by_id: BTreeMap<&NodeId, &NodeSnapshot> =
        current.iter().map(|n| (&n.id, n)).collect();

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    let mut replacements = Vec::new();
    for node in current {
        match prev_by_id.get(&node.id) {
            None => creates.push(ChangeEntry {
                id: node.id.clone(),
                before: None,
                after: Some(node.clone()),
            }),
            Some(before) => {
                let construct_changed = before.construct_type != node.construct_type;
                if construct_changed || before.props != node.props {
                    if construct_changed
                        || immutable_changed(before, node, &immutable_props)
                    {
                        replacements.push(node.id.clone());
                    }
                    updates.push(ChangeEntry {
                        id: node.id.clone(),
                        before: Some((*before).clone()),
                        after: Some(node.clone()),
                    });
                }
            }
        }
    }

    let mut deletes = Vec::new();
    for node in previous {
        if !curr_by_id.contains_key(&node.id) {
            deletes.push(ChangeEntry {
                id: node.id.clone(),
                before: Some(node.clone()),
                after: None,
            });
        }
    }

    // Dependency edges among the nodes being deployed.
    let changed: BTreeSet<NodeId> = creates
        .iter()
        .chain(updates.iter())
        .map(|e| e.id.clone())
        .collect();
    let deps_of = dependency_map(current, &changed);
    let parallel_batches = layer_batches(&changed, &deps_of, current)?;
    let deployment_order: Vec<NodeId> = parallel_batches.iter().flatten().cloned().collect();

    // Deletes go children-first: topological order of the previous graph,
    // reversed.
    let delete_ids: BTreeSet<NodeId> = deletes.iter().map(|e| e.id.clone()).collect();
    let delete_deps = dependency_map(previous, &delete_ids);
    let mut delete_order: Vec<NodeId> = layer_batches(&delete_ids, &delete_deps, previous)?
        .into_iter()
        .flatten()
        .collect();
    delete_order.reverse();

    Ok(ChangeSet {
        creates,
        updates,
        deletes,
        replacements,
        deployment_order,
        parallel_batches,
        delete_order,
    })
}

fn immutable_changed(
    before: &NodeSnapshot,
    after: &NodeSnapshot,
    immutable_props: &impl Fn(&str) -> Vec<String>,
) -> bool {
    immutable_props(&after.construct_type)
        .iter()
        .any(|key| before.props.get(key) != after.props.get(key))
}

/// For each node in `scope`, its dependencies restricted to `scope`:
/// observed output reads plus the nearest path-prefix parent.
fn dependency_map(
    nodes: &[NodeSnapshot],
    scope: &BTreeSet<NodeId>,
) -> BTreeMap<NodeId, BTreeSet<NodeId>> {
    let by_id: BTreeMap<&NodeId, &NodeSnapshot> = nodes.iter().map(|n| (&n.id, n)).collect();
    let mut deps: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
    for id in scope {
        let mut set = BTreeSet::new();
        if let Some(node) = by_id.get(id) {
            for dep in &node.dependencies {
                if *dep != *id && scope.contains(dep) {
                    set.insert(dep.clone());
                }
            }
            // Nearest ancestor node by path prefix.
            let parent = nodes
                .iter()
                .filter(|candidate| {
                    candidate.id != *id && candidate.path.is_prefix_of(&node.path)
                })
                .max_by_key(|candidate| candidate.path.depth());
            if let Some(parent) = parent {
                if scope.contains(&parent.id) {
                    set.insert(parent.id.clone());
                }
            }
        }
        deps.insert(id.clone(), set);
    }
    deps
}

/// Partition `scope` into dependency layers. Fails with
/// `CycleInDependencies` naming the offending paths when no progress can
/// be made.
fn layer_batches(
    scope: &BTreeSet<NodeId>,
    deps_of: &BTreeMap<NodeId, BTreeSet<NodeId>>,
    nodes: &[NodeSnapshot],
) -> Result<Vec<Vec<NodeId>>> {
    let mut remaining: BTreeSet<NodeId> = scope.clone();
    let mut batches: Vec<Vec<NodeId>> = Vec::new();
    while !remaining.is_empty() {
        // BTreeSet iteration keeps batches lexicographic by id.
        let batch: Vec<NodeId> = remaining
            .iter()
            .filter(|id| {
                deps_of
                    .get(*id)
                    .map(|deps| deps.iter().all(|d| !remaining.contains(d)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if batch.is_empty() {
            return Err(cycle_error(&remaining, deps_of, nodes));
        }
        for id in &batch {
            remaining.remove(id);
        }
        batches.push(batch);
    }
    Ok(batches)
}

/// Extract a concrete cycle from the stuck subgraph for the error payload.
fn cycle_error(
    remaining: &BTreeSet<NodeId>,
    deps_of: &BTreeMap<NodeId, BTreeSet<NodeId>>,
    nodes: &[NodeSnapshot],
) -> Error {
    let ids: Vec<&NodeId> = remaining.iter().collect();
    let index_of: BTreeMap<&NodeId, usize> =
        ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut graph: DiGraph<&NodeId, ()> = DiGraph::new();
    let indices: Vec<_> = ids.iter().map(|id| graph.add_node(*id)).collect();
    for id in &ids {
        if let Some(deps) = deps_of.get(*id) {
            for dep in deps {
                if let (Some(&from), Some(&to)) = (index_of.get(dep), index_of.get(id)) {
                    graph.add_edge(indices[from], indices[to], ());
                }
            }
        }
    }
    let cycle_ids: Vec<NodeId> = tarjan_scc(&graph)
        .into_iter()
        .find(|scc| scc.len() > 1)
        .map(|scc| scc.into_iter().map(|ix| (*graph[ix]).clone()).collect())
        .unwrap_or_else(|| remaining.iter().cloned().collect());
    let paths = cycle_ids
        .iter()
        .map(|id| {
            nodes
                .iter()
                .find(|n| n.id == *id)
                .map(|n| n.path.to_string())
                .unwrap_or_else(|| id.to_string())
        })
        .collect();
    Error::CycleInDependencies { paths }
}

/// Rewrite previous-state node ids through a migration map (old -> new),
/// so renamed resources diff as updates instead of delete + create.
pub(crate) fn apply_migrations(
    previous: &mut [NodeSnapshot],
    migrations: &BTreeMap<String, String>,
) {
    if migrations.is_empty() {
        return;
    }
    let remap = |id: &NodeId| -> NodeId {
        migrations
            .get(id.as_str())
            .map(NodeId::from_raw)
            .unwrap_or_else(|| id.clone())
    };
    for node in previous.iter_mut() {
        node.id = remap(&node.id);
        node.children = node.children.iter().map(&remap).collect();
        node.dependencies = node.dependencies.iter().map(&remap).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{Path, Segment};
    use serde_json::json;

    fn snapshot(path: &[&str], construct: &str, props: serde_json::Value) -> NodeSnapshot {
        let mut p = Path::root();
        for seg in path {
            p = p.child(Segment::named(*seg));
        }
        let props = match props {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        NodeSnapshot {
            id: NodeId::from_path(&p),
            path: p,
            construct_type: construct.to_string(),
            props,
            outputs: serde_json::Map::new(),
            state: serde_json::Map::new(),
            children: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    fn no_immutables(_: &str) -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn drift_produces_creates_updates_deletes() {
        let previous = vec![
            snapshot(&["A"], "t", json!({"v": 1})),
            snapshot(&["B"], "t", json!({"v": 1})),
        ];
        let current = vec![
            snapshot(&["B"], "t", json!({"v": 2})),
            snapshot(&["C"], "t", json!({"v": 1})),
        ];
        let cs = reconcile(&previous, &current, no_immutables).unwrap();
        assert_eq!(cs.creates.len(), 1);
        assert_eq!(cs.creates[0].id.as_str(), "C");
        assert_eq!(cs.updates.len(), 1);
        assert_eq!(cs.updates[0].id.as_str(), "B");
        assert_eq!(cs.deletes.len(), 1);
        assert_eq!(cs.deletes[0].id.as_str(), "A");
        assert!(cs.replacements.is_empty());
    }

    #[test]
    fn node_never_in_both_creates_and_updates() {
        let previous = vec![snapshot(&["A"], "t", json!({"v": 1}))];
        let current = vec![
            snapshot(&["A"], "t", json!({"v": 2})),
            snapshot(&["B"], "t", json!({})),
        ];
        let cs = reconcile(&previous, &current, no_immutables).unwrap();
        let create_ids: Vec<&str> = cs.creates.iter().map(|e| e.id.as_str()).collect();
        let update_ids: Vec<&str> = cs.updates.iter().map(|e| e.id.as_str()).collect();
        for id in &create_ids {
            assert!(!update_ids.contains(id));
        }
    }

    #[test]
    fn unchanged_props_produce_empty_change_set() {
        let previous = vec![snapshot(&["A"], "t", json!({"v": 1}))];
        let current = vec![snapshot(&["A"], "t", json!({"v": 1}))];
        let cs = reconcile(&previous, &current, no_immutables).unwrap();
        assert!(cs.is_empty());
    }

    #[test]
    fn chain_orders_by_output_dependencies() {
        let a = snapshot(&["A"], "t", json!({}));
        let mut b = snapshot(&["B"], "t", json!({}));
        let mut c = snapshot(&["C"], "t", json!({}));
        let mut d = snapshot(&["D"], "t", json!({}));
        // D read C's output, C read B's, B read A's.
        b.dependencies = vec![a.id.clone()];
        c.dependencies = vec![b.id.clone()];
        d.dependencies = vec![c.id.clone()];
        let current = vec![d.clone(), c.clone(), b.clone(), a.clone()];
        let cs = reconcile(&[], &current, no_immutables).unwrap();
        let order: Vec<&str> = cs.deployment_order.iter().map(NodeId::as_str).collect();
        assert_eq!(order, vec!["A", "B", "C", "D"]);
        assert_eq!(cs.parallel_batches.len(), 4);
    }

    #[test]
    fn diamond_layers_into_parallel_batches() {
        let root = snapshot(&["Root"], "t", json!({}));
        let mut left = snapshot(&["Left"], "t", json!({}));
        let mut right = snapshot(&["Right"], "t", json!({}));
        let mut sink = snapshot(&["Sink"], "t", json!({}));
        left.dependencies = vec![root.id.clone()];
        right.dependencies = vec![root.id.clone()];
        sink.dependencies = vec![left.id.clone(), right.id.clone()];
        let current = vec![sink.clone(), right.clone(), left.clone(), root.clone()];
        let cs = reconcile(&[], &current, no_immutables).unwrap();
        assert_eq!(cs.parallel_batches.len(), 3);
        assert_eq!(cs.parallel_batches[0], vec![root.id.clone()]);
        // Lexicographic tie-break inside the middle batch.
        assert_eq!(
            cs.parallel_batches[1],
            vec![left.id.clone(), right.id.clone()]
        );
        assert_eq!(cs.parallel_batches[2], vec![sink.id.clone()]);
    }

    #[test]
    fn path_parenthood_is_a_dependency() {
        let vpc = snapshot(&["Vpc"], "ec2/Vpc", json!({}));
        let subnet = snapshot(&["Vpc", "Subnet"], "ec2/Subnet", json!({}));
        let current = vec![subnet.clone(), vpc.clone()];
        let cs = reconcile(&[], &current, no_immutables).unwrap();
        let order: Vec<&str> = cs.deployment_order.iter().map(NodeId::as_str).collect();
        assert_eq!(order, vec!["Vpc", "Vpc.Subnet"]);
    }

    #[test]
    fn deletes_are_ordered_children_first() {
        let vpc = snapshot(&["Vpc"], "ec2/Vpc", json!({}));
        let subnet = snapshot(&["Vpc", "Subnet"], "ec2/Subnet", json!({}));
        let previous = vec![vpc.clone(), subnet.clone()];
        let cs = reconcile(&previous, &[], no_immutables).unwrap();
        let order: Vec<&str> = cs.delete_order.iter().map(NodeId::as_str).collect();
        assert_eq!(order, vec!["Vpc.Subnet", "Vpc"]);
    }

    #[test]
    fn dependency_cycle_is_reported_with_paths() {
        let mut a = snapshot(&["A"], "t", json!({}));
        let mut b = snapshot(&["B"], "t", json!({}));
        a.dependencies = vec![b.id.clone()];
        b.dependencies = vec![a.id.clone()];
        let err = reconcile(&[], &[a, b], no_immutables).unwrap_err();
        assert_eq!(err.code(), "CYCLE_IN_DEPENDENCIES");
        let message = err.to_string();
        assert!(message.contains('A') && message.contains('B'));
    }

    #[test]
    fn immutable_prop_change_is_a_replacement() {
        let previous = vec![snapshot(&["Db"], "rds/Instance", json!({"zone": "a"}))];
        let current = vec![snapshot(&["Db"], "rds/Instance", json!({"zone": "b"}))];
        let immutables = |construct: &str| -> Vec<String> {
            if construct == "rds/Instance" {
                vec!["zone".to_string()]
            } else {
                Vec::new()
            }
        };
        let cs = reconcile(&previous, &current, immutables).unwrap();
        assert_eq!(cs.updates.len(), 1);
        assert!(cs.is_replacement(&cs.updates[0].id));
    }

    #[test]
    fn construct_change_is_a_replacement() {
        let previous = vec![snapshot(&["Store"], "s3/Bucket", json!({}))];
        let current = vec![snapshot(&["Store"], "efs/FileSystem", json!({}))];
        let cs = reconcile(&previous, &current, no_immutables).unwrap();
        assert_eq!(cs.updates.len(), 1);
        assert!(cs.is_replacement(&cs.updates[0].id));
    }

    #[test]
    fn migrations_remap_previous_ids() {
        let mut previous = vec![snapshot(&["Old"], "t", json!({"v": 1}))];
        let current = vec![snapshot(&["New"], "t", json!({"v": 1}))];
        let mut map = BTreeMap::new();
        map.insert("Old".to_string(), "New".to_string());
        apply_migrations(&mut previous, &map);
        let cs = reconcile(&previous, &current, no_immutables).unwrap();
        assert!(cs.is_empty(), "renamed node should not be recreated");
    }
}
