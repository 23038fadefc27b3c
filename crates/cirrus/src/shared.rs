// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Engine-internal shared core handed to hooks, accessors and the driver.

use crate::node::NodeRegistry;
use crate::signal::{Reactive, Signal};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// State shared between the renderer, the hook surface, output accessors
/// and the convergence driver of one engine instance. Everything here is
/// interior-mutable; the renderer and driver never run concurrently with
/// each other.
pub(crate) struct EngineShared {
    /// The reactive runtime owning every signal and computation.
    pub reactive: Reactive,
    /// Declared resource nodes and their output signals.
    pub registry: NodeRegistry,
    /// True while a render pass is executing. Store writes issued during a
    /// render are staged instead of applied.
    render_phase: AtomicBool,
    /// Store writes staged during the current render pass; applied under a
    /// batch when the pass completes.
    pub staged_store_writes: Mutex<Vec<(Signal, Value)>>,
    /// Persisted store values keyed by `"<fiber path>#<slot>"`, seeded from
    /// the previous run's state document.
    pub store_seed: Mutex<BTreeMap<String, Value>>,
}

impl EngineShared {
    pub(crate) fn new() -> Self {
        Self {
            reactive: Reactive::new(),
            registry: NodeRegistry::new(),
            render_phase: AtomicBool::new(false),
            staged_store_writes: Mutex::new(Vec::new()),
            store_seed: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn set_render_phase(&self, active: bool) {
        self.render_phase.store(active, Ordering::SeqCst);
    }

    pub(crate) fn in_render_phase(&self) -> bool {
        self.render_phase.load(Ordering::SeqCst)
    }
}
