// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The renderer: element trees in, fiber trees out.
//!
//! Rendering walks depth-first. Each component runs with its fiber's render
//! computation installed as the reactive observer and with output-read
//! capture active, so both signal subscriptions and node dependencies fall
//! out of ordinary prop construction. Fibers are matched across renders by
//! path; children no longer produced are unmounted together with their
//! subtrees.
//!
//! Re-renders of a single dirty fiber rebuild the context stacks from the
//! fiber's ancestor chain, so a deep consumer sees the same provided values
//! it would during a full render.
//!
//! Memoization: a clean child whose element compares equal to its previous
//! render may be skipped. This is an optimization only; anything that can
//! change a fiber's output (outputs, stores, context) marks it dirty, which
//! defeats the skip.

use crate::context::ContextStacks;
use crate::element::{Element, ElementKind};
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberId, HookSlot, TreeState};
use crate::hooks::Scope;
use crate::path::{Discriminator, NodeId, Path, Segment};
use crate::shared::EngineShared;
use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

pub(crate) struct Renderer<'a> {
    shared: &'a Arc<EngineShared>,
    tree: &'a mut TreeState,
    stacks: ContextStacks,
}

impl<'a> Renderer<'a> {
    pub(crate) fn new(shared: &'a Arc<EngineShared>, tree: &'a mut TreeState) -> Self {
        Self {
            shared,
            tree,
            stacks: ContextStacks::default(),
        }
    }

    /// Render the root element, creating or reusing the root fiber.
    pub(crate) fn render_root(&mut self, element: &Element) -> Result<()> {
        let path = Path::root().child(match &element.key {
            Some(key) => Segment::keyed(element.type_name(), key.clone()),
            None => Segment::named(element.type_name()),
        });
        let root_id = match self.tree.root {
            Some(id) if self.tree.fibers.contains_key(id) && self.tree.fibers[id].path == path => {
                id
            }
            Some(id) => {
                self.unmount(id);
                self.create_fiber(path, None, element)
            }
            None => self.create_fiber(path, None, element),
        };
        self.tree.root = Some(root_id);
        self.stacks = ContextStacks::default();
        self.render_pass(root_id, element)
    }

    /// Re-render one dirty fiber's subtree in its ancestor context.
    pub(crate) fn rerender(&mut self, fiber: FiberId) -> Result<()> {
        if !self.tree.fibers.contains_key(fiber) {
            // Unmounted since it was marked dirty.
            return Ok(());
        }
        self.stacks = ContextStacks::default();
        for ancestor in self.tree.ancestor_chain(fiber) {
            let f = &self.tree.fibers[ancestor];
            if let ElementKind::Provider { context, .. } = &f.element.kind {
                if let Some(value) = &f.provider_last {
                    self.stacks.push(*context, value.clone());
                }
            }
        }
        let element = self.tree.fibers[fiber].element.clone();
        self.render_pass(fiber, &element)
    }

    /// One render pass: run the tree walk with the render phase flag set,
    /// then apply staged store writes under a batch. On failure the staged
    /// writes are discarded; the render never partially applies state.
    fn render_pass(&mut self, fiber: FiberId, element: &Element) -> Result<()> {
        self.shared.set_render_phase(true);
        let result = self.render_fiber(fiber, element);
        self.shared.set_render_phase(false);
        let staged: Vec<_> = std::mem::take(&mut *self.shared.staged_store_writes.lock());
        result?;
        self.shared.reactive.batch(|| -> Result<()> {
            for (signal, value) in staged {
                self.shared.reactive.set(signal, value)?;
            }
            Ok(())
        })?
    }

    fn create_fiber(&mut self, path: Path, parent: Option<FiberId>, element: &Element) -> FiberId {
        let id = self.tree.insert(Fiber::new(path, parent, element.clone()));
        let computation = self.shared.reactive.create_render_computation(id);
        self.tree.fibers[id].computation = computation;
        id
    }

    fn render_fiber(&mut self, id: FiberId, element: &Element) -> Result<()> {
        self.shared.reactive.clear_dirty_fiber(id);

        let (child_elements, provider_context) = match &element.kind {
            ElementKind::Component(def) => {
                let render = def.render;
                let props = element.props.clone();
                let Some(fiber) = self.tree.fibers.get_mut(id) else {
                    return Ok(());
                };
                fiber.begin_render();
                let computation = fiber.computation;
                self.shared.registry.begin_read_capture();
                let shared = self.shared;
                let stacks = &self.stacks;
                let result = shared.reactive.with_observer(computation, move |_| {
                    let mut scope = Scope {
                        shared,
                        fiber,
                        stacks,
                    };
                    (render)(&mut scope, &props)
                });
                let reads = self.shared.registry.take_read_capture();
                let children = result?;

                let Some(fiber) = self.tree.fibers.get_mut(id) else {
                    return Ok(());
                };
                if fiber.first_render_done && fiber.hook_cursor < fiber.hooks.len() {
                    return Err(Error::HookOrderViolated {
                        path: fiber.path.to_string(),
                        slot: fiber.hook_cursor,
                        previous: fiber.hooks[fiber.hook_cursor].kind(),
                        current: "<none>",
                    });
                }
                fiber.first_render_done = true;
                // Node dependencies were recorded per use_instance call
                // (prefix of reads); the full set is kept for diagnostics.
                fiber.outputs_read = reads;
                (children, None)
            }
            ElementKind::Fragment | ElementKind::Intrinsic(_) => {
                let Some(fiber) = self.tree.fibers.get_mut(id) else {
                    return Ok(());
                };
                fiber.begin_render();
                fiber.first_render_done = true;
                (element.children.clone(), None)
            }
            ElementKind::Provider { context, value, .. } => {
                let Some(fiber) = self.tree.fibers.get_mut(id) else {
                    return Ok(());
                };
                fiber.begin_render();
                let changed =
                    fiber.first_render_done && fiber.provider_last.as_ref() != Some(value);
                fiber.provider_last = Some(value.clone());
                fiber.first_render_done = true;
                if changed {
                    let consumers: Vec<FiberId> = self
                        .tree
                        .fibers
                        .iter()
                        .filter(|(fid, f)| *fid != id && f.context_deps.contains(context))
                        .map(|(fid, _)| fid)
                        .collect();
                    tracing::debug!(
                        context = element.type_name(),
                        consumers = consumers.len(),
                        "context value changed, marking consumers dirty"
                    );
                    for consumer in consumers {
                        self.shared.reactive.mark_fiber_dirty(consumer);
                    }
                }
                self.stacks.push(*context, value.clone());
                (element.children.clone(), Some(*context))
            }
        };

        // Pop the provider stack even when a child render fails.
        let children_result = self.render_children(id, &child_elements);
        if let Some(context) = provider_context {
            self.stacks.pop(context);
        }
        children_result?;

        if let Some(fiber) = self.tree.fibers.get_mut(id) {
            fiber.render_count += 1;
            fiber.element = element.clone();
        }
        Ok(())
    }

    fn render_children(&mut self, parent: FiberId, elements: &[Element]) -> Result<()> {
        let parent_path = self.tree.fibers[parent].path.clone();
        // Children inherit every output read up to this point: those reads
        // are what fed the child elements' props.
        let inherited: IndexSet<NodeId> = {
            let parent_fiber = &self.tree.fibers[parent];
            parent_fiber
                .read_context
                .iter()
                .chain(parent_fiber.outputs_read.iter())
                .cloned()
                .collect()
        };

        // Derive each child's path segment: explicit key, else the sibling
        // index among unkeyed children of the same type name.
        let mut type_counts: FxHashMap<String, u32> = FxHashMap::default();
        let mut planned: Vec<(Path, Element)> = Vec::with_capacity(elements.len());
        let mut planned_paths: FxHashSet<Path> = FxHashSet::default();
        for element in elements {
            let name = element.type_name().to_string();
            let discriminator = match &element.key {
                Some(key) => Discriminator::Key(key.clone()),
                None => {
                    let count = type_counts.entry(name.clone()).or_insert(0);
                    let index = *count;
                    *count += 1;
                    Discriminator::Index(index)
                }
            };
            let path = parent_path.child(Segment {
                name,
                discriminator,
            });
            if !planned_paths.insert(path.clone()) {
                return Err(Error::ValidationFailed {
                    reason: format!(
                        "duplicate child identity '{path}' under '{parent_path}'; \
                         give same-type siblings distinct keys"
                    ),
                });
            }
            planned.push((path, element.clone()));
        }

        let old_children: Vec<FiberId> = self.tree.fibers[parent].children.clone();
        let mut kept: FxHashSet<FiberId> = FxHashSet::default();
        let mut new_children: Vec<(FiberId, Element)> = Vec::with_capacity(planned.len());
        for (path, element) in planned {
            let existing = self
                .tree
                .by_path
                .get(&path)
                .copied()
                .filter(|fid| old_children.contains(fid));
            let child = match existing {
                Some(fid) => fid,
                None => self.create_fiber(path, Some(parent), &element),
            };
            self.tree.fibers[child].read_context = inherited.clone();
            kept.insert(child);
            new_children.push((child, element));
        }

        for old in old_children {
            if !kept.contains(&old) {
                self.unmount(old);
            }
        }
        self.tree.fibers[parent].children = new_children.iter().map(|(id, _)| *id).collect();

        for (child, element) in new_children {
            if self.can_skip(child, &element) {
                continue;
            }
            self.render_fiber(child, &element)?;
        }
        Ok(())
    }

    /// Memoization check: skip a child whose element is unchanged and which
    /// has no pending dirty mark. Dirty descendants are unaffected: they
    /// stay in the dirty set and the driver re-renders them directly.
    fn can_skip(&self, fiber: FiberId, element: &Element) -> bool {
        let Some(f) = self.tree.fibers.get(fiber) else {
            return false;
        };
        f.first_render_done
            && f.element == *element
            && !self.shared.reactive.is_fiber_dirty(fiber)
    }

    /// Remove a fiber subtree: dispose render computations and store
    /// signals, clear dirty marks. Declared node records stay in the
    /// registry so the reconciler can issue deletes for them.
    fn unmount(&mut self, fiber: FiberId) {
        for id in self.tree.collect_subtree(fiber) {
            if let Some(f) = self.tree.fibers.remove(id) {
                self.tree.by_path.remove(&f.path);
                self.shared.reactive.dispose_computation(f.computation);
                self.shared.reactive.clear_dirty_fiber(id);
                for slot in f.hooks {
                    if let HookSlot::State(state) = slot {
                        self.shared.reactive.dispose_signal(state.signal);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::element::Props;
    use serde_json::{json, Value};
    use std::sync::OnceLock;

    fn shared() -> Arc<EngineShared> {
        Arc::new(EngineShared::new())
    }

    fn render_once(shared: &Arc<EngineShared>, tree: &mut TreeState, el: &Element) -> Result<()> {
        Renderer::new(shared, tree).render_root(el)
    }

    fn leaf(_cx: &mut Scope<'_>, _props: &Props) -> Result<Vec<Element>> {
        Ok(Vec::new())
    }

    fn two_leaves(_cx: &mut Scope<'_>, _props: &Props) -> Result<Vec<Element>> {
        Ok(vec![
            Element::component("Leaf", leaf, Props::new()),
            Element::component("Leaf", leaf, Props::new()).with_key("second"),
        ])
    }

    fn bucket(cx: &mut Scope<'_>, props: &Props) -> Result<Vec<Element>> {
        let name = props.get_str("name").unwrap_or("bucket").to_string();
        cx.use_instance("s3/Bucket", Props::new().with("name", name))?;
        Ok(Vec::new())
    }

    fn pair_of_buckets(cx: &mut Scope<'_>, _props: &Props) -> Result<Vec<Element>> {
        cx.use_instance("s3/Bucket", Props::new())?;
        cx.use_instance("s3/Bucket", Props::new())?;
        Ok(Vec::new())
    }

    fn one_bucket_child(_cx: &mut Scope<'_>, _props: &Props) -> Result<Vec<Element>> {
        Ok(vec![Element::component(
            "Bucket",
            bucket,
            Props::new().with("name", "assets"),
        )])
    }

    fn maybe_bucket_child(_cx: &mut Scope<'_>, props: &Props) -> Result<Vec<Element>> {
        if props.get("with_child").is_some() {
            Ok(vec![Element::component("Bucket", bucket, Props::new())])
        } else {
            Ok(Vec::new())
        }
    }

    #[test]
    fn fiber_paths_are_stable_across_renders() {
        let shared = shared();
        let mut tree = TreeState::new();
        let el = Element::component("App", two_leaves, Props::new());
        render_once(&shared, &mut tree, &el).unwrap();
        let first: Vec<String> = tree
            .fibers_in_path_order()
            .iter()
            .map(|id| tree.fibers[*id].path.to_string())
            .collect();
        render_once(&shared, &mut tree, &el).unwrap();
        let second: Vec<String> = tree
            .fibers_in_path_order()
            .iter()
            .map(|id| tree.fibers[*id].path.to_string())
            .collect();
        assert_eq!(first, second);
        assert!(first.contains(&"App/Leaf".to_string()));
        assert!(first.contains(&"App/Leaf[second]".to_string()));
    }

    #[test]
    fn same_construct_twice_gets_distinct_nodes() {
        let shared = shared();
        let mut tree = TreeState::new();
        let el = Element::component("App", pair_of_buckets, Props::new());
        render_once(&shared, &mut tree, &el).unwrap();
        let nodes = tree.current_node_ids();
        assert_eq!(nodes.len(), 2);
        assert_ne!(nodes[0], nodes[1]);
    }

    #[test]
    fn declared_nodes_survive_memoized_skip() {
        let shared = shared();
        let mut tree = TreeState::new();
        let el = Element::component("App", one_bucket_child, Props::new());
        render_once(&shared, &mut tree, &el).unwrap();
        let before = tree.current_node_ids();
        // Second render: child element unchanged, child fiber clean -> skipped.
        render_once(&shared, &mut tree, &el).unwrap();
        let after = tree.current_node_ids();
        assert_eq!(before, after);
        assert_eq!(before.len(), 1);
    }

    #[test]
    fn removing_a_child_unmounts_its_subtree() {
        let shared = shared();
        let mut tree = TreeState::new();
        let with_child =
            Element::component("App", maybe_bucket_child, Props::new().with("with_child", true));
        let without_child = Element::component("App", maybe_bucket_child, Props::new());
        render_once(&shared, &mut tree, &with_child).unwrap();
        assert_eq!(tree.current_node_ids().len(), 1);
        render_once(&shared, &mut tree, &without_child).unwrap();
        assert!(tree.current_node_ids().is_empty());
        assert_eq!(tree.fibers.len(), 1);
    }

    #[test]
    fn hook_order_change_is_rejected() {
        let shared = shared();
        let mut tree = TreeState::new();

        fn flexible(cx: &mut Scope<'_>, props: &Props) -> Result<Vec<Element>> {
            if props.get("flip").is_some() {
                cx.use_state(Value::Null)?;
                cx.use_instance("s3/Bucket", Props::new())?;
            } else {
                cx.use_instance("s3/Bucket", Props::new())?;
                cx.use_state(Value::Null)?;
            }
            Ok(Vec::new())
        }

        let first = Element::component("App", flexible, Props::new());
        render_once(&shared, &mut tree, &first).unwrap();
        let flipped = Element::component("App", flexible, Props::new().with("flip", true));
        let err = render_once(&shared, &mut tree, &flipped).unwrap_err();
        assert_eq!(err.code(), "HOOK_ORDER_VIOLATED");
    }

    fn env_context() -> &'static Context {
        static ENV: OnceLock<Context> = OnceLock::new();
        ENV.get_or_init(|| Context::new("env", json!({"env": "dev"})))
    }

    fn env_consumer(cx: &mut Scope<'_>, _props: &Props) -> Result<Vec<Element>> {
        let _ = cx.use_context(env_context())?;
        Ok(Vec::new())
    }

    fn bystander(_cx: &mut Scope<'_>, _props: &Props) -> Result<Vec<Element>> {
        Ok(Vec::new())
    }

    fn env_tree(value: Value) -> Element {
        env_context().provide(
            value,
            vec![
                Element::component("Consumer", env_consumer, Props::new()),
                Element::component("Bystander", bystander, Props::new()),
            ],
        )
    }

    #[test]
    fn context_consumers_rerender_once_on_value_change() {
        let shared = shared();
        let mut tree = TreeState::new();

        render_once(&shared, &mut tree, &env_tree(json!({"env": "dev"}))).unwrap();
        let consumer_id = *tree
            .by_path
            .iter()
            .find(|(p, _)| p.to_string().contains("Consumer"))
            .map(|(_, id)| id)
            .unwrap();
        let bystander_id = *tree
            .by_path
            .iter()
            .find(|(p, _)| p.to_string().contains("Bystander"))
            .map(|(_, id)| id)
            .unwrap();
        let consumer_renders = tree.fibers[consumer_id].render_count;
        let bystander_renders = tree.fibers[bystander_id].render_count;

        render_once(&shared, &mut tree, &env_tree(json!({"env": "prod"}))).unwrap();
        assert_eq!(
            tree.fibers[consumer_id].render_count,
            consumer_renders + 1,
            "consumer re-renders exactly once"
        );
        assert!(!shared.reactive.is_fiber_dirty(consumer_id));
        assert_eq!(
            tree.fibers[bystander_id].render_count,
            bystander_renders,
            "non-consumer skipped via memoization"
        );
    }

    fn keyed_pair(_cx: &mut Scope<'_>, props: &Props) -> Result<Vec<Element>> {
        let mut children = vec![
            Element::component("Leaf", leaf, Props::new()).with_key("alpha"),
            Element::component("Leaf", leaf, Props::new()).with_key("beta"),
        ];
        if props.get("swapped").is_some() {
            children.reverse();
        }
        Ok(children)
    }

    #[test]
    fn keyed_children_keep_identity_across_reorder() {
        let shared = shared();
        let mut tree = TreeState::new();
        let el = Element::component("App", keyed_pair, Props::new());
        render_once(&shared, &mut tree, &el).unwrap();
        let alpha_before = *tree
            .by_path
            .iter()
            .find(|(p, _)| p.to_string().contains("alpha"))
            .map(|(_, id)| id)
            .unwrap();

        let swapped = Element::component("App", keyed_pair, Props::new().with("swapped", true));
        render_once(&shared, &mut tree, &swapped).unwrap();
        let alpha_after = *tree
            .by_path
            .iter()
            .find(|(p, _)| p.to_string().contains("alpha"))
            .map(|(_, id)| id)
            .unwrap();
        assert_eq!(alpha_before, alpha_after, "keyed fiber survives reorder");
        assert_eq!(tree.fibers.len(), 3, "no fiber was recreated");
    }

    #[test]
    fn intrinsic_groupings_contribute_path_segments() {
        let shared = shared();
        let mut tree = TreeState::new();
        let el = Element::intrinsic(
            "network",
            vec![Element::component("Bucket", bucket, Props::new())],
        );
        render_once(&shared, &mut tree, &el).unwrap();
        let nodes = tree.current_node_ids();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].as_str().starts_with("network.Bucket."));
    }

    fn with_hole(cx: &mut Scope<'_>, _props: &Props) -> Result<Vec<Element>> {
        let acc = cx.use_instance(
            "rds/Instance",
            Props::new().with("parent", Option::<Value>::None),
        )?;
        assert!(acc.is_placeholder());
        Ok(Vec::new())
    }

    #[test]
    fn placeholder_props_register_no_node() {
        let shared = shared();
        let mut tree = TreeState::new();
        let el = Element::component("App", with_hole, Props::new());
        render_once(&shared, &mut tree, &el).unwrap();
        assert!(tree.current_node_ids().is_empty());
    }
}
