// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The hook surface components see during render.
//!
//! A [`Scope`] is handed to each component function and is only valid for
//! that one render. Hooks are positional: the k-th hook call on a component
//! maps to slot k of its fiber, and calling hooks in a different order on a
//! re-render fails with `HookOrderViolated`.
//!
//! [`Scope::use_instance`] is the declarative resource primitive. When any
//! prop is undefined (typically because it came from a not-yet-available
//! output), the call returns placeholder accessors and registers nothing;
//! the component re-renders with real values once the upstream output
//! fills, because reading that output subscribed the fiber.

use crate::context::{Context, ContextStacks};
use crate::element::Props;
use crate::error::{Error, Result};
use crate::fiber::{EffectSlot, Fiber, HookSlot, InstanceSlot, StateSlot};
use crate::node::OutputAccessors;
use crate::path::{Discriminator, NodeId, Segment};
use crate::shared::EngineShared;
use crate::signal::Signal;
use serde_json::Value;
use std::sync::Arc;

/// Hook surface for one component render.
pub struct Scope<'a> {
    pub(crate) shared: &'a Arc<EngineShared>,
    pub(crate) fiber: &'a mut Fiber,
    pub(crate) stacks: &'a ContextStacks,
}

impl<'a> Scope<'a> {
    /// The rendering fiber's path, e.g. for diagnostics.
    pub fn path_display(&self) -> String {
        self.fiber.path.to_string()
    }

    fn claim_slot(&mut self, kind: &'static str) -> Result<usize> {
        let cursor = self.fiber.hook_cursor;
        if cursor < self.fiber.hooks.len() {
            let existing = self.fiber.hooks[cursor].kind();
            if existing != kind {
                return Err(Error::HookOrderViolated {
                    path: self.fiber.path.to_string(),
                    slot: cursor,
                    previous: existing,
                    current: kind,
                });
            }
        } else if self.fiber.first_render_done {
            return Err(Error::HookOrderViolated {
                path: self.fiber.path.to_string(),
                slot: cursor,
                previous: "<none>",
                current: kind,
            });
        }
        self.fiber.hook_cursor = cursor + 1;
        Ok(cursor)
    }

    /// Declare a resource node of `construct_type` with `props`.
    ///
    /// Returns output accessors for the node, or placeholder accessors when
    /// any prop is undefined after the cleaning pass (null entries inside
    /// object-valued props are dropped first). Placeholder calls register
    /// no node; the provider will never see it.
    ///
    /// Two calls with the same construct type from one component get
    /// distinct paths via a per-render call index, unless a `key` or `name`
    /// prop pins the identity explicitly.
    pub fn use_instance(
        &mut self,
        construct_type: &str,
        props: Props,
    ) -> Result<OutputAccessors> {
        let slot = self.claim_slot("use_instance")?;
        let cleaned = props.cleaned();

        // The call index advances for every call, placeholder or not, so
        // later siblings keep stable identities.
        let index = {
            let count = self
                .fiber
                .instance_counts
                .entry(construct_type.to_string())
                .or_insert(0);
            let index = *count;
            *count += 1;
            index
        };
        let discriminator = cleaned
            .get_str("key")
            .or_else(|| cleaned.get_str("name"))
            .map(|k| Discriminator::Key(k.to_string()))
            .unwrap_or(Discriminator::Index(index));
        let path = self.fiber.path.child(Segment {
            name: construct_type.to_string(),
            discriminator,
        });

        if !cleaned.undefined_keys().is_empty() {
            if slot == self.fiber.hooks.len() {
                self.fiber
                    .hooks
                    .push(HookSlot::Instance(InstanceSlot { node: None }));
            } else if let HookSlot::Instance(s) = &mut self.fiber.hooks[slot] {
                s.node = None;
            }
            return Ok(OutputAccessors::placeholder());
        }

        let id = NodeId::from_path(&path);
        self.shared.registry.register(
            self.shared,
            id.clone(),
            path,
            construct_type,
            cleaned.defined_map(),
            &self.fiber.path,
        )?;
        // Dependencies are the outputs read before this call could build
        // its props: ancestor reads (which fed this fiber's own props)
        // plus this fiber's reads so far.
        let mut reads_so_far = self.shared.registry.peek_read_capture();
        for dep in &self.fiber.read_context {
            reads_so_far.insert(dep.clone());
        }
        self.shared.registry.set_dependencies(&id, &reads_so_far);
        self.fiber.declared_nodes.push(id.clone());
        if slot == self.fiber.hooks.len() {
            self.fiber.hooks.push(HookSlot::Instance(InstanceSlot {
                node: Some(id.clone()),
            }));
        } else if let HookSlot::Instance(s) = &mut self.fiber.hooks[slot] {
            s.node = Some(id.clone());
        }
        Ok(OutputAccessors::live(id, Arc::clone(self.shared)))
    }

    /// Persistent per-fiber state. The value survives re-renders and runs;
    /// it is persisted in the state document's store namespace keyed by
    /// fiber path and slot.
    ///
    /// Reads subscribe the fiber. Writes during a render are staged until
    /// the render pass completes; writes from effects apply immediately.
    pub fn use_state(&mut self, initial: Value) -> Result<StateHandle> {
        let slot = self.claim_slot("use_state")?;
        if slot == self.fiber.hooks.len() {
            let slot_key = format!("{}#{}", self.fiber.path, slot);
            let seeded = self
                .shared
                .store_seed
                .lock()
                .get(&slot_key)
                .cloned()
                .unwrap_or(initial);
            let signal = self.shared.reactive.create_signal(seeded);
            self.fiber
                .hooks
                .push(HookSlot::State(StateSlot { signal, slot_key }));
        }
        let HookSlot::State(state) = &self.fiber.hooks[slot] else {
            // claim_slot verified the kind.
            return Err(Error::ValidationFailed {
                reason: "state slot mismatch".into(),
            });
        };
        Ok(StateHandle {
            shared: Arc::clone(self.shared),
            signal: state.signal,
        })
    }

    /// Read a context value, subscribing this fiber to provider changes.
    ///
    /// Returns the innermost provided value, falling back to the context's
    /// default. A context created with [`Context::required`] fails with
    /// `ValidationFailed` when no provider is in scope.
    pub fn use_context(&mut self, context: &Context) -> Result<Value> {
        let slot = self.claim_slot("use_context")?;
        if slot == self.fiber.hooks.len() {
            self.fiber.hooks.push(HookSlot::Context(context.id()));
        }
        self.fiber.context_deps.insert(context.id());
        if let Some(value) = self.stacks.current(context.id()) {
            return Ok(value.clone());
        }
        match context.default_value() {
            Some(value) => Ok(value.clone()),
            None => Err(Error::ValidationFailed {
                reason: format!(
                    "context '{}' was read at '{}' without a provider in scope",
                    context.name(),
                    self.fiber.path
                ),
            }),
        }
    }

    /// Register a post-deploy effect.
    ///
    /// Effects run after the convergence loop reaches its fixed point,
    /// in fiber path order, when `deps` changed since the last run
    /// (element-wise equality) or when `deps` is `None`. Effect errors are
    /// logged and never fail the deployment. Effects cannot declare
    /// instances: the callback has no scope access by construction.
    pub fn use_effect(
        &mut self,
        deps: Option<Vec<Value>>,
        callback: impl FnMut() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let slot = self.claim_slot("use_effect")?;
        if slot == self.fiber.hooks.len() {
            self.fiber.hooks.push(HookSlot::Effect(EffectSlot {
                deps: deps.clone(),
                last_run_deps: None,
                ran_before: false,
                callback: Some(Box::new(callback)),
            }));
            return Ok(());
        }
        if let HookSlot::Effect(slot) = &mut self.fiber.hooks[slot] {
            slot.deps = deps;
            slot.callback = Some(Box::new(callback));
        }
        Ok(())
    }
}

/// Handle to one `use_state` slot. Clonable into effects.
#[derive(Clone)]
pub struct StateHandle {
    shared: Arc<EngineShared>,
    signal: Signal,
}

impl StateHandle {
    /// Current value. Subscribes the rendering fiber when called during a
    /// render.
    pub fn get(&self) -> Value {
        self.shared.reactive.get(self.signal)
    }

    /// Write a new value. During a render the write is staged and applied
    /// after the pass; elsewhere it applies immediately under a batch.
    pub fn set(&self, value: Value) -> Result<()> {
        if self.shared.in_render_phase() {
            self.shared
                .staged_store_writes
                .lock()
                .push((self.signal, value));
            return Ok(());
        }
        self.shared
            .reactive
            .batch(|| self.shared.reactive.set(self.signal, value))?
    }

    /// Read-modify-write without subscribing.
    pub fn update(&self, f: impl FnOnce(Value) -> Value) -> Result<()> {
        let current = self.shared.reactive.get_untracked(self.signal);
        self.set(f(current))
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateHandle")
    }
}
