// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Context: provider/consumer value propagation down the tree.
//!
//! A [`Context`] is created once, outside any render, and carries a default.
//! Its [`Context::provide`] element pushes a value for the duration of its
//! children's render; [`Scope::use_context`](crate::hooks::Scope::use_context)
//! reads the nearest provided value or the default and subscribes the
//! reading fiber. When a provider re-renders with a different value, exactly
//! its consumers are marked dirty.

use crate::element::{Element, ElementKind, Props};
use serde_json::Value;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a context, unique per [`Context::new`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

/// A typed channel of values flowing from provider elements to consumers.
///
/// Values are `serde_json::Value`, like everything else that crosses the
/// tree (props, outputs, store state).
#[derive(Clone, Debug)]
pub struct Context {
    id: ContextId,
    name: &'static str,
    default: Option<Value>,
}

impl Context {
    /// Create a context with a default value, returned to consumers when no
    /// provider is in scope.
    pub fn new(name: &'static str, default: Value) -> Self {
        Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            default: Some(default),
        }
    }

    /// Create a context with no default. Reading it without a provider in
    /// scope fails validation.
    pub fn required(name: &'static str) -> Self {
        Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            default: None,
        }
    }

    /// This context's identity.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The context's display name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Build a provider element pushing `value` while `children` render.
    pub fn provide(&self, value: Value, children: Vec<Element>) -> Element {
        Element {
            kind: ElementKind::Provider {
                context: self.id,
                name: self.name,
                value,
            },
            key: None,
            props: Props::new(),
            children,
        }
    }
}

/// Per-render-pass stacks of provided values, keyed by context identity.
/// Strictly push-on-enter / pop-on-exit; the renderer pops via a guard even
/// when a child render fails.
#[derive(Default)]
pub(crate) struct ContextStacks {
    stacks: FxHashMap<ContextId, Vec<Value>>,
}

impl ContextStacks {
    pub(crate) fn push(&mut self, context: ContextId, value: Value) {
        self.stacks.entry(context).or_default().push(value);
    }

    pub(crate) fn pop(&mut self, context: ContextId) {
        if let Some(stack) = self.stacks.get_mut(&context) {
            stack.pop();
        }
    }

    /// The innermost provided value for `context`, if any.
    pub(crate) fn current(&self, context: ContextId) -> Option<&Value> {
        self.stacks.get(&context).and_then(|s| s.last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contexts_have_distinct_identities() {
        let a = Context::new("env", json!("dev"));
        let b = Context::new("env", json!("dev"));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn provide_builds_a_provider_element() {
        let ctx = Context::new("env", json!("dev"));
        let el = ctx.provide(json!("prod"), Vec::new());
        match el.kind {
            ElementKind::Provider { context, value, .. } => {
                assert_eq!(context, ctx.id());
                assert_eq!(value, json!("prod"));
            }
            other => panic!("expected provider element, got {other:?}"),
        }
    }

    #[test]
    fn stacks_nest_and_pop() {
        let ctx = Context::new("region", json!("us-east-1"));
        let mut stacks = ContextStacks::default();
        assert_eq!(stacks.current(ctx.id()), None);

        stacks.push(ctx.id(), json!("us-east-1"));
        stacks.push(ctx.id(), json!("eu-west-1"));
        assert_eq!(stacks.current(ctx.id()), Some(&json!("eu-west-1")));

        stacks.pop(ctx.id());
        assert_eq!(stacks.current(ctx.id()), Some(&json!("us-east-1")));
        stacks.pop(ctx.id());
        assert_eq!(stacks.current(ctx.id()), None);
    }
}
