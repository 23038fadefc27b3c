// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Fibers: the runtime record behind each element occurrence.
//!
//! A fiber owns positional hook slots, the nodes declared during its last
//! render, its context subscriptions and its render computation. Fibers are
//! matched across renders by [`Path`]; a fiber at the same path keeps its
//! hook state, which is what makes node identity stable across renders.

use crate::context::ContextId;
use crate::element::Element;
use crate::error::Result;
use crate::path::{NodeId, Path};
use crate::signal::{ComputationId, Signal};
use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Arena key for a fiber.
    pub struct FiberId;
}

/// Effect callback: runs after convergence, may fail without failing the
/// deployment.
pub type EffectFn = Box<dyn FnMut() -> Result<()> + Send>;

pub(crate) struct InstanceSlot {
    /// Node declared at this slot, or `None` while the call returns
    /// placeholder accessors.
    pub node: Option<NodeId>,
}

pub(crate) struct StateSlot {
    pub signal: Signal,
    /// Persistence key: `"<fiber path>#<slot index>"`.
    pub slot_key: String,
}

pub(crate) struct EffectSlot {
    /// Deps declared on the latest render; `None` means "always run".
    pub deps: Option<Vec<Value>>,
    /// Deps at the time the effect last ran; `None` until the first run.
    pub last_run_deps: Option<Vec<Value>>,
    pub ran_before: bool,
    pub callback: Option<EffectFn>,
}

pub(crate) enum HookSlot {
    Instance(InstanceSlot),
    State(StateSlot),
    Effect(EffectSlot),
    Context(ContextId),
}

impl HookSlot {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Instance(_) => "use_instance",
            Self::State(_) => "use_state",
            Self::Effect(_) => "use_effect",
            Self::Context(_) => "use_context",
        }
    }
}

pub(crate) struct Fiber {
    pub path: Path,
    pub parent: Option<FiberId>,
    pub children: Vec<FiberId>,
    /// The element this fiber rendered last, for memoization comparisons.
    pub element: Element,
    pub hooks: Vec<HookSlot>,
    /// Render computation registered in the reactive runtime; signal reads
    /// during this fiber's render subscribe it.
    pub computation: ComputationId,
    /// Nodes declared by the latest render of this fiber, in call order.
    pub declared_nodes: Vec<NodeId>,
    /// Nodes whose outputs this fiber read during its latest render.
    pub outputs_read: IndexSet<NodeId>,
    /// Outputs read by ancestor fibers before this fiber rendered. Those
    /// reads fed the props this fiber received, so nodes declared here
    /// depend on them.
    pub read_context: IndexSet<NodeId>,
    pub context_deps: FxHashSet<ContextId>,
    /// Last value pushed by this fiber, when it is a provider element.
    pub provider_last: Option<Value>,
    pub render_count: u64,
    pub first_render_done: bool,
    // Per-render scratch, reset at the start of each render.
    pub hook_cursor: usize,
    pub instance_counts: FxHashMap<String, u32>,
}

impl Fiber {
    pub(crate) fn new(path: Path, parent: Option<FiberId>, element: Element) -> Self {
        Self {
            path,
            parent,
            children: Vec::new(),
            element,
            hooks: Vec::new(),
            computation: ComputationId::default(),
            declared_nodes: Vec::new(),
            outputs_read: IndexSet::new(),
            read_context: IndexSet::new(),
            context_deps: FxHashSet::default(),
            provider_last: None,
            render_count: 0,
            first_render_done: false,
            hook_cursor: 0,
            instance_counts: FxHashMap::default(),
        }
    }

    /// Reset per-render scratch.
    pub(crate) fn begin_render(&mut self) {
        self.hook_cursor = 0;
        self.instance_counts.clear();
        self.declared_nodes.clear();
    }

    /// State slots in order, for store persistence.
    pub(crate) fn state_slots(&self) -> impl Iterator<Item = &StateSlot> {
        self.hooks.iter().filter_map(|h| match h {
            HookSlot::State(slot) => Some(slot),
            _ => None,
        })
    }
}

/// The fiber tree of one engine instance.
#[derive(Default)]
pub(crate) struct TreeState {
    pub fibers: SlotMap<FiberId, Fiber>,
    pub root: Option<FiberId>,
    pub by_path: FxHashMap<Path, FiberId>,
}

impl TreeState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, fiber: Fiber) -> FiberId {
        let path = fiber.path.clone();
        let id = self.fibers.insert(fiber);
        self.by_path.insert(path, id);
        id
    }

    /// All live fibers sorted by path: parents before children.
    pub(crate) fn fibers_in_path_order(&self) -> Vec<FiberId> {
        let mut ids: Vec<FiberId> = self.fibers.keys().collect();
        ids.sort_by(|a, b| self.fibers[*a].path.cmp(&self.fibers[*b].path));
        ids
    }

    /// The fiber and every descendant, depth-first.
    pub(crate) fn collect_subtree(&self, fiber: FiberId) -> Vec<FiberId> {
        let mut out = Vec::new();
        let mut stack = vec![fiber];
        while let Some(id) = stack.pop() {
            if let Some(f) = self.fibers.get(id) {
                out.push(id);
                stack.extend(f.children.iter().copied());
            }
        }
        out
    }

    /// Node ids declared by live fibers, in fiber path order then call
    /// order, deduplicated.
    pub(crate) fn current_node_ids(&self) -> Vec<NodeId> {
        let mut seen: IndexSet<NodeId> = IndexSet::new();
        for id in self.fibers_in_path_order() {
            for node in &self.fibers[id].declared_nodes {
                seen.insert(node.clone());
            }
        }
        seen.into_iter().collect()
    }

    /// Provider values in scope at `fiber`, from the root down, excluding
    /// the fiber itself. Used to rebuild context stacks for a re-render.
    pub(crate) fn ancestor_chain(&self, fiber: FiberId) -> Vec<FiberId> {
        let mut chain = Vec::new();
        let mut current = self.fibers.get(fiber).and_then(|f| f.parent);
        while let Some(id) = current {
            chain.push(id);
            current = self.fibers.get(id).and_then(|f| f.parent);
        }
        chain.reverse();
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Segment;

    fn fiber_at(tree: &mut TreeState, path: Path, parent: Option<FiberId>) -> FiberId {
        let id = tree.insert(Fiber::new(path, parent, Element::fragment(Vec::new())));
        if let Some(p) = parent {
            tree.fibers[p].children.push(id);
        }
        id
    }

    #[test]
    fn path_order_puts_parents_first() {
        let mut tree = TreeState::new();
        let root_path = Path::root().child(Segment::named("App"));
        let child_path = root_path.child(Segment::named("Db"));
        let child = fiber_at(&mut tree, child_path, None);
        let root = fiber_at(&mut tree, root_path, None);
        let order = tree.fibers_in_path_order();
        assert_eq!(order, vec![root, child]);
    }

    #[test]
    fn subtree_collection_includes_descendants() {
        let mut tree = TreeState::new();
        let a = fiber_at(&mut tree, Path::root().child(Segment::named("A")), None);
        let b = fiber_at(
            &mut tree,
            Path::root()
                .child(Segment::named("A"))
                .child(Segment::named("B")),
            Some(a),
        );
        let c = fiber_at(
            &mut tree,
            Path::root()
                .child(Segment::named("A"))
                .child(Segment::named("B"))
                .child(Segment::named("C")),
            Some(b),
        );
        let subtree = tree.collect_subtree(a);
        assert_eq!(subtree.len(), 3);
        assert!(subtree.contains(&c));
    }

    #[test]
    fn ancestor_chain_runs_root_first() {
        let mut tree = TreeState::new();
        let a = fiber_at(&mut tree, Path::root().child(Segment::named("A")), None);
        let b = fiber_at(
            &mut tree,
            Path::root()
                .child(Segment::named("A"))
                .child(Segment::named("B")),
            Some(a),
        );
        let c = fiber_at(
            &mut tree,
            Path::root()
                .child(Segment::named("A"))
                .child(Segment::named("B"))
                .child(Segment::named("C")),
            Some(b),
        );
        assert_eq!(tree.ancestor_chain(c), vec![a, b]);
        assert!(tree.ancestor_chain(a).is_empty());
    }
}
