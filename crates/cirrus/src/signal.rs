// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Fine-grained reactive value cells with batched update propagation.
//!
//! The [`Reactive`] runtime owns every signal and computation created by one
//! engine instance; separate engines are fully independent. Scheduling is
//! single-threaded cooperative: writes outside a batch flush immediately,
//! writes inside a [`Reactive::batch`] flush exactly once when the outermost
//! batch exits, and cascading writes raised during a flush join the same
//! drain. The deployment driver relies on this contract when it fills
//! resource outputs: every affected component is marked dirty before the
//! driver inspects the dirty set.
//!
//! Computations come in two kinds: *render* computations, whose "run" is
//! recording the owning fiber in the dirty set (the driver performs the
//! actual re-render), and *derived* computations, which re-run a closure
//! with dependency tracking.

use crate::error::{Error, Result};
use crate::fiber::FiberId;
use indexmap::IndexSet;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use serde_json::Value;
use slotmap::{new_key_type, SecondaryMap, SlotMap};
use std::hash::BuildHasherDefault;
use std::sync::Arc;

type FxIndexSet<T> = IndexSet<T, BuildHasherDefault<FxHasher>>;

new_key_type! {
    /// Arena key for a signal cell.
    pub struct SignalId;
    /// Arena key for a tracked computation.
    pub struct ComputationId;
}

/// Default cap on how many times a single computation may re-run within one
/// flush before the flush is declared cyclic.
pub const DEFAULT_FLUSH_CYCLE_CAP: usize = 100;

/// Copyable handle to a signal cell owned by a [`Reactive`] runtime.
///
/// A signal holds a `serde_json::Value`; `Value::Null` doubles as the
/// "not yet available" state for resource outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Signal(pub(crate) SignalId);

struct SignalState {
    value: Value,
    version: u64,
}

pub(crate) enum ComputationKind {
    /// Flushing this computation marks the fiber dirty for the driver.
    RenderFiber(FiberId),
    /// Flushing this computation re-runs the closure with tracking.
    Derived(Arc<Mutex<Box<dyn FnMut(&Reactive) + Send>>>),
}

enum FlushStep {
    Done,
    Skip,
    MarkFiber(FiberId),
    RunDerived(ComputationId, Arc<Mutex<Box<dyn FnMut(&Reactive) + Send>>>),
    Cycle,
}

#[derive(Default)]
struct ReactiveInner {
    signals: SlotMap<SignalId, SignalState>,
    subscribers: SecondaryMap<SignalId, FxIndexSet<ComputationId>>,
    computations: SlotMap<ComputationId, ComputationKind>,
    sources: SecondaryMap<ComputationId, FxIndexSet<SignalId>>,
    /// The computation currently collecting dependencies, if any.
    observer: Option<ComputationId>,
    batch_depth: usize,
    /// Scheduled computations, insertion-ordered and coalesced.
    queue: FxIndexSet<ComputationId>,
    /// Fibers whose render computations flushed; drained by the driver.
    dirty_fibers: FxIndexSet<FiberId>,
    flushing: bool,
    flush_runs: FxHashMap<ComputationId, usize>,
}

/// The reactive runtime: an arena of signals and computations plus the
/// scheduling queue that connects them.
pub struct Reactive {
    inner: Mutex<ReactiveInner>,
    cycle_cap: usize,
}

impl Default for Reactive {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactive {
    /// Create an empty runtime with the default flush cycle cap.
    pub fn new() -> Self {
        Self::with_cycle_cap(DEFAULT_FLUSH_CYCLE_CAP)
    }

    /// Create an empty runtime with a custom flush cycle cap.
    pub fn with_cycle_cap(cycle_cap: usize) -> Self {
        Self {
            inner: Mutex::new(ReactiveInner::default()),
            cycle_cap,
        }
    }

    /// Allocate a signal holding `initial`.
    pub fn create_signal(&self, initial: Value) -> Signal {
        let mut inner = self.inner.lock();
        let id = inner.signals.insert(SignalState {
            value: initial,
            version: 0,
        });
        Signal(id)
    }

    /// Read a signal, subscribing the current observer if one is installed.
    ///
    /// Disposed signals read as `Value::Null`.
    pub fn get(&self, signal: Signal) -> Value {
        let mut inner = self.inner.lock();
        if let Some(observer) = inner.observer {
            if inner.signals.contains_key(signal.0) {
                if let Some(entry) = inner.subscribers.entry(signal.0) {
                    entry.or_default().insert(observer);
                }
                if let Some(entry) = inner.sources.entry(observer) {
                    entry.or_default().insert(signal.0);
                }
            }
        }
        inner
            .signals
            .get(signal.0)
            .map(|s| s.value.clone())
            .unwrap_or(Value::Null)
    }

    /// Read a signal without subscribing anything.
    pub fn get_untracked(&self, signal: Signal) -> Value {
        self.inner
            .lock()
            .signals
            .get(signal.0)
            .map(|s| s.value.clone())
            .unwrap_or(Value::Null)
    }

    /// Current version counter of a signal (bumped on every effective write).
    pub fn version(&self, signal: Signal) -> u64 {
        self.inner
            .lock()
            .signals
            .get(signal.0)
            .map(|s| s.version)
            .unwrap_or(0)
    }

    /// Write a signal. A write carrying a value equal to the current one is
    /// a no-op; otherwise the version is bumped and subscribers are
    /// scheduled. Outside a batch the schedule flushes before returning.
    pub fn set(&self, signal: Signal, value: Value) -> Result<()> {
        let flush_now = {
            let mut inner = self.inner.lock();
            let Some(state) = inner.signals.get_mut(signal.0) else {
                return Ok(());
            };
            if state.value == value {
                return Ok(());
            }
            state.value = value;
            state.version += 1;
            let subs: Vec<ComputationId> = inner
                .subscribers
                .get(signal.0)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for sub in subs {
                inner.queue.insert(sub);
            }
            inner.batch_depth == 0 && !inner.flushing && !inner.queue.is_empty()
        };
        if flush_now {
            self.flush()?;
        }
        Ok(())
    }

    /// Drop a signal and all of its subscriptions.
    pub fn dispose_signal(&self, signal: Signal) {
        let mut inner = self.inner.lock();
        inner.signals.remove(signal.0);
        if let Some(subs) = inner.subscribers.remove(signal.0) {
            for sub in subs {
                if let Some(sources) = inner.sources.get_mut(sub) {
                    sources.shift_remove(&signal.0);
                }
            }
        }
    }

    /// Register a render computation for `fiber`. Flushing it marks the
    /// fiber dirty rather than executing anything.
    pub(crate) fn create_render_computation(&self, fiber: FiberId) -> ComputationId {
        self.inner
            .lock()
            .computations
            .insert(ComputationKind::RenderFiber(fiber))
    }

    /// Register and immediately run a derived computation with tracking.
    /// It re-runs whenever any signal it read changes.
    ///
    /// The initial run executes under a batch, so a computation that writes
    /// a signal it also reads schedules itself instead of re-entering; the
    /// deferred flush then re-runs it, subject to the cycle cap.
    pub fn create_derived(
        &self,
        f: impl FnMut(&Reactive) + Send + 'static,
    ) -> Result<ComputationId> {
        let f: Arc<Mutex<Box<dyn FnMut(&Reactive) + Send>>> =
            Arc::new(Mutex::new(Box::new(f)));
        let id = self
            .inner
            .lock()
            .computations
            .insert(ComputationKind::Derived(Arc::clone(&f)));
        self.batch(|| {
            self.with_observer(id, |rt| (*f.lock())(rt));
        })?;
        Ok(id)
    }

    /// Remove a computation and detach it from every signal it observed.
    pub(crate) fn dispose_computation(&self, computation: ComputationId) {
        let mut inner = self.inner.lock();
        inner.computations.remove(computation);
        if let Some(sources) = inner.sources.remove(computation) {
            for source in sources {
                if let Some(subs) = inner.subscribers.get_mut(source) {
                    subs.shift_remove(&computation);
                }
            }
        }
        inner.queue.shift_remove(&computation);
    }

    /// Run `f` with `computation` installed as the dependency tracker,
    /// clearing its previous subscriptions first.
    pub(crate) fn with_observer<T>(
        &self,
        computation: ComputationId,
        f: impl FnOnce(&Reactive) -> T,
    ) -> T {
        let previous = {
            let mut inner = self.inner.lock();
            if let Some(sources) = inner.sources.remove(computation) {
                for source in sources {
                    if let Some(subs) = inner.subscribers.get_mut(source) {
                        subs.shift_remove(&computation);
                    }
                }
            }
            inner.observer.replace(computation)
        };
        let out = f(self);
        self.inner.lock().observer = previous;
        out
    }

    /// Run `f` with dependency tracking suppressed.
    pub fn untracked<T>(&self, f: impl FnOnce(&Reactive) -> T) -> T {
        let previous = self.inner.lock().observer.take();
        let out = f(self);
        self.inner.lock().observer = previous;
        out
    }

    /// Suspend subscriber notification until `f` returns, then flush once.
    /// Nested batches defer to the outermost one.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        self.inner.lock().batch_depth += 1;
        let out = f();
        let flush_now = {
            let mut inner = self.inner.lock();
            inner.batch_depth -= 1;
            inner.batch_depth == 0 && !inner.flushing && !inner.queue.is_empty()
        };
        if flush_now {
            self.flush()?;
        }
        Ok(out)
    }

    /// Directly mark a fiber dirty, outside of signal propagation. Used by
    /// the context system when a provider value changes.
    pub(crate) fn mark_fiber_dirty(&self, fiber: FiberId) {
        self.inner.lock().dirty_fibers.insert(fiber);
    }

    /// Whether any fiber is waiting for a re-render.
    pub(crate) fn has_dirty_fibers(&self) -> bool {
        !self.inner.lock().dirty_fibers.is_empty()
    }

    /// Take the current dirty fiber set, in marking order.
    pub(crate) fn drain_dirty_fibers(&self) -> Vec<FiberId> {
        self.inner.lock().dirty_fibers.drain(..).collect()
    }

    /// Discard a pending dirty mark, e.g. because the fiber was unmounted.
    pub(crate) fn clear_dirty_fiber(&self, fiber: FiberId) {
        self.inner.lock().dirty_fibers.shift_remove(&fiber);
    }

    /// Whether a specific fiber is marked dirty.
    pub(crate) fn is_fiber_dirty(&self, fiber: FiberId) -> bool {
        self.inner.lock().dirty_fibers.contains(&fiber)
    }

    fn next_flush_step(&self) -> FlushStep {
        let mut inner = self.inner.lock();
        let Some(computation) = inner.queue.shift_remove_index(0) else {
            return FlushStep::Done;
        };
        let runs = inner.flush_runs.entry(computation).or_insert(0);
        *runs += 1;
        if *runs > self.cycle_cap {
            return FlushStep::Cycle;
        }
        match inner.computations.get(computation) {
            None => FlushStep::Skip,
            Some(ComputationKind::RenderFiber(fiber)) => FlushStep::MarkFiber(*fiber),
            Some(ComputationKind::Derived(f)) => {
                FlushStep::RunDerived(computation, Arc::clone(f))
            }
        }
    }

    fn flush(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.flushing {
                return Ok(());
            }
            inner.flushing = true;
            inner.flush_runs.clear();
        }
        let result = loop {
            match self.next_flush_step() {
                FlushStep::Done => break Ok(()),
                FlushStep::Skip => {}
                FlushStep::Cycle => {
                    break Err(Error::CycleDetected {
                        limit: self.cycle_cap,
                    })
                }
                FlushStep::MarkFiber(fiber) => {
                    self.inner.lock().dirty_fibers.insert(fiber);
                }
                FlushStep::RunDerived(computation, f) => {
                    // Cascading writes inside the closure land back on the
                    // queue (flushing is set) and join this drain.
                    self.with_observer(computation, |rt| (*f.lock())(rt));
                }
            }
        };
        let mut inner = self.inner.lock();
        inner.flushing = false;
        if result.is_err() {
            inner.queue.clear();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fiber_key() -> FiberId {
        let mut arena: SlotMap<FiberId, ()> = SlotMap::with_key();
        arena.insert(())
    }

    #[test]
    fn write_equal_value_is_noop() {
        let rt = Reactive::new();
        let sig = rt.create_signal(json!("a"));
        rt.set(sig, json!("a")).unwrap();
        assert_eq!(rt.version(sig), 0);
        rt.set(sig, json!("b")).unwrap();
        assert_eq!(rt.version(sig), 1);
        assert_eq!(rt.get_untracked(sig), json!("b"));
    }

    #[test]
    fn derived_recomputes_on_source_change() {
        let rt = Reactive::new();
        let source = rt.create_signal(json!(1));
        let doubled = rt.create_signal(Value::Null);
        rt.create_derived(move |rt| {
            let n = rt.get(source).as_i64().unwrap_or(0);
            rt.set(doubled, json!(n * 2)).unwrap();
        })
        .unwrap();
        assert_eq!(rt.get_untracked(doubled), json!(2));
        rt.set(source, json!(5)).unwrap();
        assert_eq!(rt.get_untracked(doubled), json!(10));
    }

    #[test]
    fn batch_flushes_once_for_many_writes() {
        let rt = Reactive::new();
        let a = rt.create_signal(json!(0));
        let b = rt.create_signal(json!(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = Arc::clone(&runs);
        rt.create_derived(move |rt| {
            let _ = rt.get(a);
            let _ = rt.get(b);
            runs_in.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        rt.batch(|| {
            rt.set(a, json!(1)).unwrap();
            rt.set(b, json!(2)).unwrap();
        })
        .unwrap();
        // Coalesced: one extra run, not two.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nested_batches_defer_to_outermost() {
        let rt = Reactive::new();
        let a = rt.create_signal(json!(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = Arc::clone(&runs);
        rt.create_derived(move |rt| {
            let _ = rt.get(a);
            runs_in.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        rt.batch(|| {
            rt.batch(|| {
                rt.set(a, json!(1)).unwrap();
            })
            .unwrap();
            // Inner batch exit must not have flushed yet.
            assert_eq!(runs.load(Ordering::SeqCst), 1);
            rt.set(a, json!(2)).unwrap();
        })
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cascading_writes_join_the_same_drain() {
        let rt = Reactive::new();
        let first = rt.create_signal(json!(0));
        let second = rt.create_signal(json!(0));
        let seen = Arc::new(AtomicUsize::new(0));

        rt.create_derived(move |rt| {
            let v = rt.get(first).as_i64().unwrap_or(0);
            rt.set(second, json!(v + 1)).unwrap();
        })
        .unwrap();
        let seen_in = Arc::clone(&seen);
        rt.create_derived(move |rt| {
            let v = rt.get(second).as_i64().unwrap_or(0);
            seen_in.store(v as usize, Ordering::SeqCst);
        })
        .unwrap();

        rt.batch(|| {
            rt.set(first, json!(41)).unwrap();
        })
        .unwrap();
        // The cascade through `second` completed inside the batch flush.
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn self_feeding_computation_hits_cycle_cap() {
        let rt = Reactive::with_cycle_cap(8);
        let sig = rt.create_signal(json!(0));
        rt.create_derived(move |rt| {
            let n = rt.get(sig).as_i64().unwrap_or(0);
            if n > 0 {
                // Grows without bound once triggered: never converges.
                rt.set(sig, json!(n + 1)).unwrap();
            }
        })
        .unwrap();
        let err = rt.set(sig, json!(100)).unwrap_err();
        assert_eq!(err.code(), "CYCLE_DETECTED");
    }

    #[test]
    fn render_computation_marks_fiber_dirty() {
        let rt = Reactive::new();
        let fiber = fiber_key();
        let comp = rt.create_render_computation(fiber);
        let sig = rt.create_signal(Value::Null);
        rt.with_observer(comp, |rt| {
            let _ = rt.get(sig);
        });
        assert!(!rt.has_dirty_fibers());

        rt.batch(|| {
            rt.set(sig, json!("ready")).unwrap();
        })
        .unwrap();
        assert_eq!(rt.drain_dirty_fibers(), vec![fiber]);
        assert!(!rt.has_dirty_fibers());
    }

    #[test]
    fn disposed_computation_is_not_scheduled() {
        let rt = Reactive::new();
        let fiber = fiber_key();
        let comp = rt.create_render_computation(fiber);
        let sig = rt.create_signal(Value::Null);
        rt.with_observer(comp, |rt| {
            let _ = rt.get(sig);
        });
        rt.dispose_computation(comp);
        rt.set(sig, json!(1)).unwrap();
        assert!(!rt.has_dirty_fibers());
    }

    #[test]
    fn untracked_reads_do_not_subscribe() {
        let rt = Reactive::new();
        let sig = rt.create_signal(json!(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = Arc::clone(&runs);
        rt.create_derived(move |rt| {
            rt.untracked(|rt| {
                let _ = rt.get(sig);
            });
            runs_in.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        rt.set(sig, json!(1)).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
