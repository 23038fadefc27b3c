// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The convergence driver: render -> diff -> deploy -> fill outputs ->
//! re-render, until a fixed point or the iteration cap.
//!
//! One iteration renders (or re-renders dirty fibers), reconciles the
//! current node set against the applied baseline, deploys the resulting
//! change-set batch by batch, writes provider outputs into the owning
//! nodes' signals under a reactive batch (which marks dependent fibers
//! dirty), advances the checkpoint, and drains the dirty set. Convergence
//! is an empty change-set with no dirty fibers. Effects run once after
//! convergence; then the state machine completes.
//!
//! Failure discipline: a provider failure fails the deployment with the
//! checkpoint at the last contiguous success; already-applied nodes in the
//! failing batch keep their outputs. Render errors abort before any
//! provider call. The iteration cap is non-fatal: the run completes with
//! whatever converged and a diagnostic lands in the audit log.

use crate::backend::StateBackend;
use crate::element::Element;
use crate::error::{Error, ProviderError, Result};
use crate::fiber::{HookSlot, TreeState};
use crate::machine::{DeploymentState, DeploymentStatus, StateMachine};
use crate::node::NodeSnapshot;
use crate::path::NodeId;
use crate::provider::{OutputMap, Provider};
use crate::reconcile::{apply_migrations, reconcile, ChangeEntry, ChangeSet};
use crate::render::Renderer;
use crate::runtime::{DeployOptions, DeployReport};
use crate::shared::EngineShared;
use indexmap::IndexSet;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct Deadline {
    started: Instant,
    budget: Option<Duration>,
    stack: String,
}

impl Deadline {
    fn new(stack: &str, budget: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            budget,
            stack: stack.to_string(),
        }
    }

    fn check(&self) -> Result<()> {
        if let Some(budget) = self.budget {
            if self.started.elapsed() >= budget {
                return Err(Error::DeploymentTimeout {
                    stack: self.stack.clone(),
                    elapsed_ms: self.started.elapsed().as_millis() as u64,
                });
            }
        }
        Ok(())
    }
}

/// Entry point for [`Runtime::deploy`](crate::runtime::Runtime::deploy).
pub(crate) async fn run_deploy(
    shared: &Arc<EngineShared>,
    tree: &mut TreeState,
    provider: &Arc<dyn Provider>,
    backend: &Arc<dyn StateBackend>,
    element: &Element,
    stack: &str,
    options: &DeployOptions,
) -> Result<DeployReport> {
    let machine = StateMachine::new(
        Arc::clone(backend),
        stack,
        options.user.clone(),
        options.lock_ttl,
        options.retry.clone(),
    );
    let previous = machine.load().await?;
    if let Some(previous) = &previous {
        if previous.status == DeploymentStatus::Applying {
            // An in-flight deployment must be resumed or rolled back first.
            return Err(Error::InvalidStateTransition {
                from: DeploymentStatus::Applying,
                to: DeploymentStatus::Applying,
            });
        }
    }

    let mut previous_nodes = previous
        .as_ref()
        .map(|p| p.nodes.clone())
        .unwrap_or_default();
    apply_migrations(&mut previous_nodes, &options.migrations);
    shared.registry.seed(&previous_nodes);
    if let Some(previous) = &previous {
        *shared.store_seed.lock() = previous.stores.clone();
    }

    let deadline = Deadline::new(stack, options.async_timeout);
    tracing::info!(stack, user = %options.user, "starting deployment run");

    // Initial full render. Failures here mark the deployment FAILED without
    // any provider call.
    if let Err(err) = Renderer::new(shared, tree).render_root(element) {
        record_render_failure(backend, stack, previous.as_ref(), &options.user, &err).await;
        return Err(err);
    }

    let mut baseline = previous_nodes;
    let mut started = false;
    let mut converged = false;
    let mut iterations = 0;

    for iteration in 0..options.max_iterations {
        iterations = iteration + 1;
        if let Err(err) = deadline.check() {
            if started {
                machine.fail(&err).await;
            }
            return Err(err);
        }

        let current_ids = tree.current_node_ids();
        let keep: IndexSet<NodeId> = current_ids
            .iter()
            .cloned()
            .chain(baseline.iter().map(|n| n.id.clone()))
            .collect();
        shared.registry.prune(shared, &keep);
        let current = shared.registry.snapshot(shared, &current_ids);

        let change_set = match reconcile(&baseline, &current, |ct| provider.immutable_props(ct))
        {
            Ok(change_set) => change_set,
            Err(err) => {
                if started {
                    machine.fail(&err).await;
                }
                return Err(err);
            }
        };
        let dirty = shared.reactive.has_dirty_fibers();
        tracing::debug!(
            iteration,
            creates = change_set.creates.len(),
            updates = change_set.updates.len(),
            deletes = change_set.deletes.len(),
            dirty,
            "convergence iteration"
        );
        if change_set.is_empty() && !dirty {
            converged = true;
            break;
        }

        if !change_set.is_empty() {
            let stores = collect_stores(shared, tree);
            if !started {
                machine
                    .begin(
                        previous.as_ref(),
                        current.clone(),
                        change_set.clone(),
                        stores,
                    )
                    .await?;
                started = true;
                let affected: Vec<NodeSnapshot> = change_set
                    .creates
                    .iter()
                    .chain(change_set.updates.iter())
                    .filter_map(|e| e.after.clone())
                    .collect();
                if let Err(source) = provider.pre_deploy(&affected).await {
                    let err = Error::ProviderApplyFailed {
                        node_id: "<pre-deploy>".to_string(),
                        source,
                    };
                    machine.fail(&err).await;
                    provider.on_error(&err, &affected).await;
                    return Err(err);
                }
            } else if let Err(err) =
                machine.update_plan(current.clone(), change_set.clone()).await
            {
                machine.fail(&err).await;
                return Err(err);
            }

            if options.deletes_first {
                run_deletes(shared, &machine, provider, &change_set, options).await?;
            }
            apply_change_set(shared, &machine, provider, &change_set, options, &deadline)
                .await?;
            if !options.deletes_first {
                run_deletes(shared, &machine, provider, &change_set, options).await?;
            }

            baseline = shared.registry.snapshot(shared, &tree.current_node_ids());
            machine.set_nodes(baseline.clone());
        }

        if let Err(err) = drain_dirty(shared, tree) {
            if started {
                machine.fail(&err).await;
            }
            return Err(err);
        }
    }

    if !converged {
        tracing::warn!(
            stack,
            max_iterations = options.max_iterations,
            "convergence loop hit its iteration cap; completing with current graph"
        );
        if started {
            machine
                .audit_best_effort(
                    "max_iterations_exceeded",
                    &format!("cap {} reached before fixed point", options.max_iterations),
                )
                .await;
        }
    }

    run_effects(tree);

    let final_ids = tree.current_node_ids();
    let final_nodes = shared.registry.snapshot(shared, &final_ids);
    let stores = collect_stores(shared, tree);

    if started {
        let outputs: BTreeMap<String, OutputMap> = final_nodes
            .iter()
            .map(|n| (n.id.to_string(), n.outputs.clone()))
            .collect();
        if let Err(e) = provider.post_deploy(&final_nodes, &outputs).await {
            tracing::warn!(stack, error = %e, "post_deploy hook failed");
        }
        machine.complete(final_nodes.clone(), stores).await?;
    } else if stores_changed(previous.as_ref(), &stores)
        || nodes_differ(previous.as_ref(), &final_nodes)
    {
        // Nothing deployed, but the document itself moved: store writes
        // from effects, or a migration that renamed node ids.
        persist_stores_only(backend, stack, previous.as_ref(), &final_nodes, stores).await;
    }

    Ok(DeployReport {
        nodes: final_nodes,
        iterations,
        converged,
        status: DeploymentStatus::Deployed,
    })
}

/// Apply creates/updates batch by batch, filling outputs and advancing the
/// checkpoint through the contiguous successful prefix.
async fn apply_change_set(
    shared: &Arc<EngineShared>,
    machine: &StateMachine,
    provider: &Arc<dyn Provider>,
    change_set: &ChangeSet,
    options: &DeployOptions,
    deadline: &Deadline,
) -> Result<()> {
    let mut batch_start = 0usize;
    for batch in &change_set.parallel_batches {
        if let Some(reason) = machine.lock_lost() {
            let err = Error::LockLost {
                stack: machine.document().stack,
                reason,
            };
            machine.fail(&err).await;
            return Err(err);
        }
        if let Err(err) = deadline.check() {
            machine.fail(&err).await;
            return Err(err);
        }

        let results = apply_batch(provider, change_set, batch, options.operation_timeout).await;

        // All outputs from this batch land in one reactive batch, so every
        // affected fiber is dirty before the driver looks at the dirty set.
        let fill = shared.reactive.batch(|| -> Result<()> {
            for (id, result) in &results {
                if let Ok(outputs) = result {
                    shared.registry.fill_outputs(shared, id, outputs)?;
                }
            }
            Ok(())
        });
        fill??;

        let mut failure: Option<Error> = None;
        for (offset, (id, result)) in results.into_iter().enumerate() {
            match result {
                Ok(outputs) => {
                    machine.record_applied(&id, &outputs);
                    if failure.is_none() {
                        if let Err(err) = machine.checkpoint(batch_start + offset).await {
                            machine.fail(&err).await;
                            return Err(err);
                        }
                    }
                }
                Err(err) => {
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }
        if let Some(err) = failure {
            let nodes: Vec<NodeSnapshot> = batch
                .iter()
                .filter_map(|id| change_set.entry(id).and_then(|e| e.after.clone()))
                .collect();
            machine.fail(&err).await;
            provider.on_error(&err, &nodes).await;
            return Err(err);
        }
        batch_start += batch.len();
    }
    Ok(())
}

/// Apply one batch. Applies run concurrently; results come back in batch
/// order regardless of completion order.
async fn apply_batch(
    provider: &Arc<dyn Provider>,
    change_set: &ChangeSet,
    batch: &[NodeId],
    operation_timeout: Option<Duration>,
) -> Vec<(NodeId, Result<OutputMap>)> {
    futures::future::join_all(batch.iter().map(|id| {
        let entry = change_set.entry(id).cloned();
        async move {
            let result = match entry {
                None => Err(Error::ValidationFailed {
                    reason: format!("node '{id}' is in a batch but not in the change-set"),
                }),
                Some(entry) => {
                    apply_one(
                        provider,
                        &entry,
                        change_set.is_replacement(id),
                        operation_timeout,
                    )
                    .await
                }
            };
            (id.clone(), result)
        }
    }))
    .await
}

async fn apply_one(
    provider: &Arc<dyn Provider>,
    entry: &ChangeEntry,
    is_replacement: bool,
    operation_timeout: Option<Duration>,
) -> Result<OutputMap> {
    let Some(after) = entry.after.as_ref() else {
        return Err(Error::ValidationFailed {
            reason: format!("change entry for '{}' has no target snapshot", entry.id),
        });
    };
    if is_replacement {
        if let Some(before) = entry.before.as_ref() {
            with_op_timeout(operation_timeout, provider.destroy(before))
                .await
                .map_err(|source| Error::ProviderDestroyFailed {
                    node_id: entry.id.to_string(),
                    source,
                })?;
        }
    }
    with_op_timeout(operation_timeout, provider.apply(after))
        .await
        .map_err(|source| Error::ProviderApplyFailed {
            node_id: entry.id.to_string(),
            source,
        })
}

async fn with_op_timeout<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = std::result::Result<T, ProviderError>>,
) -> std::result::Result<T, ProviderError> {
    match timeout {
        None => fut.await,
        Some(duration) => match tokio::time::timeout(duration, fut).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "provider operation timed out after {}ms",
                duration.as_millis()
            )
            .into()),
        },
    }
}

/// Destroy deleted nodes in the change-set's delete order.
async fn run_deletes(
    shared: &Arc<EngineShared>,
    machine: &StateMachine,
    provider: &Arc<dyn Provider>,
    change_set: &ChangeSet,
    options: &DeployOptions,
) -> Result<()> {
    for id in &change_set.delete_order {
        let Some(entry) = change_set.deletes.iter().find(|e| e.id == *id) else {
            continue;
        };
        let Some(before) = entry.before.as_ref() else {
            continue;
        };
        match with_op_timeout(options.operation_timeout, provider.destroy(before)).await {
            Ok(()) => {
                if let Err(err) = machine.remove_node(id).await {
                    machine.fail(&err).await;
                    return Err(err);
                }
                shared.registry.remove(shared, id);
            }
            Err(source) => {
                let err = Error::ProviderDestroyFailed {
                    node_id: id.to_string(),
                    source,
                };
                machine.fail(&err).await;
                provider.on_error(&err, std::slice::from_ref(before)).await;
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Re-render every dirty fiber, parents first.
pub(crate) fn drain_dirty(shared: &Arc<EngineShared>, tree: &mut TreeState) -> Result<bool> {
    let mut dirty = shared.reactive.drain_dirty_fibers();
    if dirty.is_empty() {
        return Ok(false);
    }
    dirty.retain(|id| tree.fibers.contains_key(*id));
    dirty.sort_by(|a, b| tree.fibers[*a].path.cmp(&tree.fibers[*b].path));
    for fiber in dirty {
        Renderer::new(shared, tree).rerender(fiber)?;
    }
    Ok(true)
}

/// Run effects in fiber path order. Errors are logged and swallowed.
pub(crate) fn run_effects(tree: &mut TreeState) {
    for fiber_id in tree.fibers_in_path_order() {
        let path = tree.fibers[fiber_id].path.clone();
        let slots = tree.fibers[fiber_id].hooks.len();
        for slot in 0..slots {
            let callback = {
                let fiber = &mut tree.fibers[fiber_id];
                let HookSlot::Effect(effect) = &mut fiber.hooks[slot] else {
                    continue;
                };
                let should_run = match (&effect.deps, effect.ran_before) {
                    (None, _) => true,
                    (_, false) => true,
                    (Some(deps), true) => effect.last_run_deps.as_ref() != Some(deps),
                };
                if !should_run {
                    continue;
                }
                effect.callback.take()
            };
            let Some(mut callback) = callback else {
                continue;
            };
            if let Err(e) = callback() {
                tracing::warn!(fiber = %path, error = %e, "effect failed");
            }
            let fiber = &mut tree.fibers[fiber_id];
            if let HookSlot::Effect(effect) = &mut fiber.hooks[slot] {
                effect.ran_before = true;
                effect.last_run_deps = effect.deps.clone();
                if effect.callback.is_none() {
                    effect.callback = Some(callback);
                }
            }
        }
    }
}

/// Current `use_state` values keyed by fiber path and slot.
pub(crate) fn collect_stores(
    shared: &Arc<EngineShared>,
    tree: &TreeState,
) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for id in tree.fibers_in_path_order() {
        for slot in tree.fibers[id].state_slots() {
            out.insert(
                slot.slot_key.clone(),
                shared.reactive.get_untracked(slot.signal),
            );
        }
    }
    out
}

fn stores_changed(previous: Option<&DeploymentState>, stores: &BTreeMap<String, Value>) -> bool {
    match previous {
        Some(previous) => previous.stores != *stores,
        None => !stores.is_empty(),
    }
}

fn nodes_differ(previous: Option<&DeploymentState>, nodes: &[NodeSnapshot]) -> bool {
    match previous {
        Some(previous) => previous.nodes != nodes,
        None => !nodes.is_empty(),
    }
}

/// Best-effort FAILED mark for render-phase errors: no transaction was
/// started, so take the lock briefly and write the document directly.
async fn record_render_failure(
    backend: &Arc<dyn StateBackend>,
    stack: &str,
    previous: Option<&DeploymentState>,
    user: &str,
    err: &Error,
) {
    let holder = format!("{user}-render-failure-{}", uuid::Uuid::new_v4());
    match backend
        .acquire_lock(stack, &holder, Duration::from_secs(10))
        .await
    {
        Ok(true) => {}
        _ => {
            tracing::warn!(stack, "could not take lock to record render failure");
            return;
        }
    }
    let mut doc = previous
        .cloned()
        .unwrap_or_else(|| DeploymentState::new(stack, user));
    doc.status = DeploymentStatus::Failed;
    doc.error = Some(format!("{err} ({})", err.code()));
    doc.timestamp = chrono::Utc::now();
    if let Err(e) = backend.save_state(stack, &doc).await {
        tracing::warn!(stack, error = %e, "failed to persist render failure");
    }
    if let Err(e) = backend.release_lock(stack).await {
        tracing::warn!(stack, error = %e, "failed to release render-failure lock");
    }
}

/// Persist store changes from a run that deployed nothing.
async fn persist_stores_only(
    backend: &Arc<dyn StateBackend>,
    stack: &str,
    previous: Option<&DeploymentState>,
    nodes: &[NodeSnapshot],
    stores: BTreeMap<String, Value>,
) {
    let holder = format!("store-sync-{}", uuid::Uuid::new_v4());
    match backend
        .acquire_lock(stack, &holder, Duration::from_secs(10))
        .await
    {
        Ok(true) => {}
        _ => {
            tracing::warn!(stack, "could not take lock to persist stores");
            return;
        }
    }
    let mut doc = previous
        .cloned()
        .unwrap_or_else(|| DeploymentState::new(stack, "cirrus"));
    doc.status = DeploymentStatus::Deployed;
    doc.nodes = nodes.to_vec();
    doc.stores = stores;
    doc.timestamp = chrono::Utc::now();
    if let Err(e) = backend.save_state(stack, &doc).await {
        tracing::warn!(stack, error = %e, "failed to persist stores");
    }
    if let Err(e) = backend.release_lock(stack).await {
        tracing::warn!(stack, error = %e, "failed to release store-sync lock");
    }
}

/// Entry point for [`Runtime::preview`](crate::runtime::Runtime::preview):
/// render once against seeded outputs and report the change-set without
/// touching the provider or taking the lock.
///
/// Because nothing deploys, outputs that were never produced stay
/// undefined: nodes gated on them keep their placeholders and do not show
/// up in the preview. The preview is exact for prop-only drift and a lower
/// bound when new output-driven structure would unfold during a real run.
pub(crate) async fn run_preview(
    shared: &Arc<EngineShared>,
    tree: &mut TreeState,
    provider: &Arc<dyn Provider>,
    backend: &Arc<dyn StateBackend>,
    element: &Element,
    stack: &str,
    options: &DeployOptions,
) -> Result<ChangeSet> {
    let machine = StateMachine::new(
        Arc::clone(backend),
        stack,
        options.user.clone(),
        options.lock_ttl,
        options.retry.clone(),
    );
    let previous = machine.load().await?;
    let mut previous_nodes = previous
        .as_ref()
        .map(|p| p.nodes.clone())
        .unwrap_or_default();
    apply_migrations(&mut previous_nodes, &options.migrations);
    shared.registry.seed(&previous_nodes);
    if let Some(previous) = &previous {
        *shared.store_seed.lock() = previous.stores.clone();
    }

    Renderer::new(shared, tree).render_root(element)?;
    let current_ids = tree.current_node_ids();
    let current = shared.registry.snapshot(shared, &current_ids);
    reconcile(&previous_nodes, &current, |ct| provider.immutable_props(ct))
}

/// Entry point for [`Runtime::resume`](crate::runtime::Runtime::resume):
/// continue a crashed APPLYING deployment from its checkpoint.
pub(crate) async fn run_resume(
    shared: &Arc<EngineShared>,
    provider: &Arc<dyn Provider>,
    backend: &Arc<dyn StateBackend>,
    stack: &str,
    options: &DeployOptions,
) -> Result<DeployReport> {
    let machine = StateMachine::new(
        Arc::clone(backend),
        stack,
        options.user.clone(),
        options.lock_ttl,
        options.retry.clone(),
    );
    let Some(state) = machine.load().await? else {
        return Err(Error::ValidationFailed {
            reason: format!("no persisted state for stack '{stack}'"),
        });
    };
    if state.status != DeploymentStatus::Applying {
        return Err(Error::ValidationFailed {
            reason: format!(
                "stack '{stack}' is not mid-deployment (status {:?})",
                state.status
            ),
        });
    }
    let Some(change_set) = state.change_set.clone() else {
        return Err(Error::ValidationFailed {
            reason: format!("stack '{stack}' has no change-set to resume"),
        });
    };

    let start = state.checkpoint.map(|k| k + 1).unwrap_or(0);
    tracing::info!(
        stack,
        checkpoint = ?state.checkpoint,
        remaining = change_set.deployment_order.len().saturating_sub(start),
        "resuming deployment"
    );
    let stores = state.stores.clone();
    machine.adopt(state).await?;

    for (position, id) in change_set.deployment_order.iter().enumerate().skip(start) {
        if let Some(reason) = machine.lock_lost() {
            let err = Error::LockLost {
                stack: stack.to_string(),
                reason,
            };
            machine.fail(&err).await;
            return Err(err);
        }
        let Some(entry) = change_set.entry(id) else {
            continue;
        };
        match apply_one(
            provider,
            entry,
            change_set.is_replacement(id),
            options.operation_timeout,
        )
        .await
        {
            Ok(outputs) => {
                machine.record_applied(id, &outputs);
                if let Err(err) = machine.checkpoint(position).await {
                    machine.fail(&err).await;
                    return Err(err);
                }
            }
            Err(err) => {
                machine.fail(&err).await;
                let nodes: Vec<NodeSnapshot> = entry.after.clone().into_iter().collect();
                provider.on_error(&err, &nodes).await;
                return Err(err);
            }
        }
    }
    run_deletes(shared, &machine, provider, &change_set, options).await?;

    let nodes = machine.document().nodes;
    machine.complete(nodes.clone(), stores).await?;
    Ok(DeployReport {
        nodes,
        iterations: 0,
        converged: true,
        status: DeploymentStatus::Deployed,
    })
}

/// Entry point for [`Runtime::rollback`](crate::runtime::Runtime::rollback):
/// undo the applied prefix of an APPLYING or FAILED deployment.
pub(crate) async fn run_rollback(
    provider: &Arc<dyn Provider>,
    backend: &Arc<dyn StateBackend>,
    stack: &str,
    options: &DeployOptions,
) -> Result<()> {
    let machine = StateMachine::new(
        Arc::clone(backend),
        stack,
        options.user.clone(),
        options.lock_ttl,
        options.retry.clone(),
    );
    let Some(state) = machine.load().await? else {
        return Err(Error::ValidationFailed {
            reason: format!("no persisted state for stack '{stack}'"),
        });
    };
    if !matches!(
        state.status,
        DeploymentStatus::Applying | DeploymentStatus::Failed
    ) {
        return Err(Error::InvalidStateTransition {
            from: state.status,
            to: DeploymentStatus::RolledBack,
        });
    }
    let Some(change_set) = state.change_set.clone() else {
        return Err(Error::ValidationFailed {
            reason: format!("stack '{stack}' has no change-set to roll back"),
        });
    };
    let checkpoint = state.checkpoint;
    machine.adopt(state.clone()).await?;

    if let Some(applied_through) = checkpoint {
        for position in (0..=applied_through).rev() {
            let Some(id) = change_set.deployment_order.get(position) else {
                continue;
            };
            let Some(entry) = change_set.entry(id) else {
                continue;
            };
            let undo = match (&entry.before, &entry.after) {
                // A created node is destroyed.
                (None, Some(after)) => provider.destroy(after).await,
                // An updated or replaced node is restored to its previous
                // shape.
                (Some(before), _) => provider.apply(before).await.map(|_| ()),
                (None, None) => Ok(()),
            };
            if let Err(source) = undo {
                let err = Error::ProviderApplyFailed {
                    node_id: id.to_string(),
                    source,
                };
                machine.fail(&err).await;
                return Err(err);
            }
        }
    }

    // Restore the document's node list to the pre-deployment graph.
    let mut nodes = state.nodes.clone();
    nodes.retain(|n| change_set.creates.iter().all(|e| e.id != n.id));
    for entry in &change_set.updates {
        if let (Some(before), Some(node)) = (
            entry.before.as_ref(),
            nodes.iter_mut().find(|n| n.id == entry.id),
        ) {
            *node = before.clone();
        }
    }
    for entry in &change_set.deletes {
        if let Some(before) = entry.before.as_ref() {
            if nodes.iter().all(|n| n.id != entry.id) {
                nodes.push(before.clone());
            }
        }
    }
    machine.set_nodes(nodes);
    machine.rolled_back().await
}

/// Entry point for [`Runtime::destroy`](crate::runtime::Runtime::destroy):
/// tear down every node of a stack, children first.
pub(crate) async fn run_destroy(
    shared: &Arc<EngineShared>,
    provider: &Arc<dyn Provider>,
    backend: &Arc<dyn StateBackend>,
    stack: &str,
    options: &DeployOptions,
) -> Result<()> {
    let machine = StateMachine::new(
        Arc::clone(backend),
        stack,
        options.user.clone(),
        options.lock_ttl,
        options.retry.clone(),
    );
    let Some(state) = machine.load().await? else {
        return Ok(());
    };
    if state.status == DeploymentStatus::Applying {
        return Err(Error::InvalidStateTransition {
            from: DeploymentStatus::Applying,
            to: DeploymentStatus::Applying,
        });
    }
    let change_set = reconcile(&state.nodes, &[], |_| Vec::new())?;
    if change_set.is_empty() {
        return Ok(());
    }
    machine
        .begin(Some(&state), Vec::new(), change_set.clone(), BTreeMap::new())
        .await?;
    run_deletes(shared, &machine, provider, &change_set, options).await?;
    machine.complete(Vec::new(), BTreeMap::new()).await
}
