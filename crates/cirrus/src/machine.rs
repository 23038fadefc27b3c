// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The per-stack deployment state machine.
//!
//! Owns the persisted deployment document and the stack lock for the
//! duration of a run. Transitions are guarded; anything outside the table
//! fails with `InvalidStateTransition`:
//!
//! ```text
//! PENDING  -> APPLYING     start_deployment
//! APPLYING -> DEPLOYED     complete_deployment
//! APPLYING -> FAILED       fail_deployment
//! APPLYING -> ROLLED_BACK  rollback
//! FAILED   -> ROLLED_BACK  rollback
//! ```
//!
//! The lock is renewed at half its TTL by a background task; when renewal
//! fails the deployment aborts with `LockLost`. Checkpoints advance after
//! each applied node and persist atomically through the backend. Audit
//! entries and pre-transition snapshots are best-effort: failures are
//! logged and the deployment continues.

use crate::backend::{AuditEntry, StateBackend};
use crate::error::{Error, Result};
use crate::node::NodeSnapshot;
use crate::path::NodeId;
use crate::provider::OutputMap;
use crate::reconcile::ChangeSet;
use crate::retry::{with_retry, RetryPolicy};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Deployment lifecycle states, persisted with the state document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// No deployment in flight.
    Pending,
    /// A deployment is applying changes.
    Applying,
    /// The last deployment completed.
    Deployed,
    /// The last deployment failed partway.
    Failed,
    /// The last deployment was rolled back.
    RolledBack,
}

/// The persisted state document for one stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    /// Stack name.
    pub stack: String,
    /// Lifecycle status.
    pub status: DeploymentStatus,
    /// The known resource graph.
    #[serde(default)]
    pub nodes: Vec<NodeSnapshot>,
    /// In-flight change-set, present while applying (and after a failure,
    /// for recovery). Cleared on completion.
    #[serde(default)]
    pub change_set: Option<ChangeSet>,
    /// Index into `change_set.deployment_order` of the last node applied
    /// successfully. Cleared on completion.
    #[serde(default)]
    pub checkpoint: Option<usize>,
    /// When this document was written.
    pub timestamp: DateTime<Utc>,
    /// Who ran the deployment.
    pub user: String,
    /// Failure description, when `status` is `Failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Persisted `use_state` store values, keyed by fiber path and slot.
    #[serde(default)]
    pub stores: BTreeMap<String, Value>,
}

impl DeploymentState {
    /// Fresh document for a stack that has never deployed.
    pub fn new(stack: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            status: DeploymentStatus::Pending,
            nodes: Vec::new(),
            change_set: None,
            checkpoint: None,
            timestamp: Utc::now(),
            user: user.into(),
            error: None,
            stores: BTreeMap::new(),
        }
    }
}

/// Validate a status transition.
pub(crate) fn check_transition(from: DeploymentStatus, to: DeploymentStatus) -> Result<()> {
    use DeploymentStatus::{Applying, Deployed, Failed, Pending, RolledBack};
    let allowed = matches!(
        (from, to),
        (Pending, Applying)
            | (Applying, Deployed)
            | (Applying, Failed)
            | (Applying, RolledBack)
            | (Failed, RolledBack)
    );
    if allowed {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition { from, to })
    }
}

struct Renewal {
    handle: tokio::task::JoinHandle<()>,
    lost: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

/// Drives the lifecycle of one deployment run.
pub(crate) struct StateMachine {
    backend: Arc<dyn StateBackend>,
    stack: String,
    holder: String,
    user: String,
    lock_ttl: Duration,
    retry: RetryPolicy,
    current: Mutex<DeploymentState>,
    renewal: Mutex<Option<Renewal>>,
}

impl StateMachine {
    pub(crate) fn new(
        backend: Arc<dyn StateBackend>,
        stack: impl Into<String>,
        user: impl Into<String>,
        lock_ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let stack = stack.into();
        let user = user.into();
        Self {
            backend,
            holder: format!("{user}-{}", uuid::Uuid::new_v4()),
            current: Mutex::new(DeploymentState::new(stack.clone(), user.clone())),
            stack,
            user,
            lock_ttl,
            retry,
            renewal: Mutex::new(None),
        }
    }

    /// Load the persisted document, with retries.
    pub(crate) async fn load(&self) -> Result<Option<DeploymentState>> {
        let backend = Arc::clone(&self.backend);
        let stack = self.stack.clone();
        with_retry(&self.retry, "get_state", move || {
            let backend = Arc::clone(&backend);
            let stack = stack.clone();
            async move { backend.get_state(&stack).await }
        })
        .await
    }

    /// Start a deployment: validate the transition, take the lock, persist
    /// the APPLYING document and start lock renewal.
    pub(crate) async fn begin(
        &self,
        previous: Option<&DeploymentState>,
        nodes: Vec<NodeSnapshot>,
        change_set: ChangeSet,
        stores: BTreeMap<String, Value>,
    ) -> Result<()> {
        // A terminal status from an earlier run starts a fresh record.
        let from = match previous.map(|p| p.status) {
            None | Some(DeploymentStatus::Deployed) | Some(DeploymentStatus::RolledBack)
            | Some(DeploymentStatus::Failed) => DeploymentStatus::Pending,
            Some(status) => status,
        };
        check_transition(from, DeploymentStatus::Applying)?;

        if let Some(previous) = previous {
            self.snapshot_best_effort(previous).await;
        }
        self.acquire_lock().await?;

        {
            let mut doc = self.current.lock();
            doc.status = DeploymentStatus::Applying;
            doc.nodes = nodes;
            doc.change_set = Some(change_set);
            doc.checkpoint = None;
            doc.error = None;
            doc.stores = stores;
            doc.timestamp = Utc::now();
        }
        if let Err(err) = self.persist().await {
            // Don't leave the lock behind when the APPLYING document never
            // made it to storage.
            self.release_lock_best_effort().await;
            return Err(err);
        }
        self.start_renewal();
        self.audit_best_effort("deployment_started", "change-set accepted")
            .await;
        Ok(())
    }

    /// Adopt an existing APPLYING document for resume or rollback.
    pub(crate) async fn adopt(&self, state: DeploymentState) -> Result<()> {
        self.acquire_lock().await?;
        *self.current.lock() = state;
        self.start_renewal();
        self.audit_best_effort("deployment_adopted", "resuming in-flight deployment")
            .await;
        Ok(())
    }

    /// Replace the planned change-set mid-run (a later convergence
    /// iteration produced more work). Resets the checkpoint.
    pub(crate) async fn update_plan(
        &self,
        nodes: Vec<NodeSnapshot>,
        change_set: ChangeSet,
    ) -> Result<()> {
        {
            let mut doc = self.current.lock();
            doc.nodes = nodes;
            doc.change_set = Some(change_set);
            doc.checkpoint = None;
            doc.timestamp = Utc::now();
        }
        self.persist().await
    }

    /// Record one applied node's outputs in the document (not yet
    /// persisted; `checkpoint` persists both together).
    pub(crate) fn record_applied(&self, id: &NodeId, outputs: &OutputMap) {
        let mut doc = self.current.lock();
        if let Some(node) = doc.nodes.iter_mut().find(|n| n.id == *id) {
            node.outputs = outputs.clone();
        }
    }

    /// Advance the checkpoint: nodes `deployment_order[0..=index]` have
    /// been applied. Persists atomically.
    pub(crate) async fn checkpoint(&self, index: usize) -> Result<()> {
        self.current.lock().checkpoint = Some(index);
        self.persist().await
    }

    /// Remove a destroyed node from the document and persist.
    pub(crate) async fn remove_node(&self, id: &NodeId) -> Result<()> {
        self.current.lock().nodes.retain(|n| n.id != *id);
        self.persist().await
    }

    /// Finish successfully: DEPLOYED, change-set and checkpoint cleared.
    pub(crate) async fn complete(
        &self,
        nodes: Vec<NodeSnapshot>,
        stores: BTreeMap<String, Value>,
    ) -> Result<()> {
        let from = self.current.lock().status;
        check_transition(from, DeploymentStatus::Deployed)?;
        self.snapshot_best_effort(&self.document()).await;
        tracing::info!(stack = %self.stack, nodes = nodes.len(), "deployment completed");
        {
            let mut doc = self.current.lock();
            doc.status = DeploymentStatus::Deployed;
            doc.nodes = nodes;
            doc.change_set = None;
            doc.checkpoint = None;
            doc.error = None;
            doc.stores = stores;
            doc.timestamp = Utc::now();
        }
        let persisted = self.persist().await;
        if persisted.is_ok() {
            self.audit_best_effort("deployment_completed", "converged").await;
        }
        self.stop_renewal();
        self.release_lock_best_effort().await;
        persisted
    }

    /// Mark the deployment FAILED. The change-set and checkpoint stay in
    /// place for recovery.
    pub(crate) async fn fail(&self, error: &Error) {
        let from = self.current.lock().status;
        if check_transition(from, DeploymentStatus::Failed).is_err() {
            tracing::warn!(stack = %self.stack, ?from, "cannot mark FAILED from this status");
        } else {
            self.snapshot_best_effort(&self.document()).await;
            tracing::warn!(stack = %self.stack, error = %error, "deployment failed");
            {
                let mut doc = self.current.lock();
                doc.status = DeploymentStatus::Failed;
                doc.error = Some(format!("{} ({})", error, error.code()));
                doc.timestamp = Utc::now();
            }
            if let Err(persist_err) = self.persist().await {
                tracing::warn!(
                    stack = %self.stack,
                    error = %persist_err,
                    "failed to persist FAILED status"
                );
            }
            self.audit_best_effort("deployment_failed", &error.to_string())
                .await;
        }
        self.stop_renewal();
        self.release_lock_best_effort().await;
    }

    /// Mark the deployment ROLLED_BACK and clear the plan.
    pub(crate) async fn rolled_back(&self) -> Result<()> {
        let from = self.current.lock().status;
        check_transition(from, DeploymentStatus::RolledBack)?;
        self.snapshot_best_effort(&self.document()).await;
        {
            let mut doc = self.current.lock();
            doc.status = DeploymentStatus::RolledBack;
            doc.change_set = None;
            doc.checkpoint = None;
            doc.timestamp = Utc::now();
        }
        let persisted = self.persist().await;
        if persisted.is_ok() {
            self.audit_best_effort("deployment_rolled_back", "reverse change-set applied")
                .await;
        }
        self.stop_renewal();
        self.release_lock_best_effort().await;
        persisted
    }

    /// Current in-memory document (clone).
    pub(crate) fn document(&self) -> DeploymentState {
        self.current.lock().clone()
    }

    /// Replace the document's node list without persisting; the next
    /// persisting call writes it out.
    pub(crate) fn set_nodes(&self, nodes: Vec<NodeSnapshot>) {
        self.current.lock().nodes = nodes;
    }

    /// Why the lock was lost, if renewal failed.
    pub(crate) fn lock_lost(&self) -> Option<String> {
        let renewal = self.renewal.lock();
        let renewal = renewal.as_ref()?;
        if renewal.lost.load(Ordering::SeqCst) {
            Some(
                renewal
                    .reason
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "lock renewal failed".to_string()),
            )
        } else {
            None
        }
    }

    /// Append an audit entry; log and continue on failure.
    pub(crate) async fn audit_best_effort(&self, action: &str, detail: &str) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            user: self.user.clone(),
            action: action.to_string(),
            detail: detail.to_string(),
        };
        if let Err(e) = self.backend.append_audit(&self.stack, &entry).await {
            tracing::warn!(stack = %self.stack, action, error = %e, "audit append failed");
        }
    }

    /// Snapshot a document before a transition; log and continue on
    /// failure.
    async fn snapshot_best_effort(&self, state: &DeploymentState) {
        if let Err(e) = self.backend.save_snapshot(&self.stack, state).await {
            tracing::warn!(stack = %self.stack, error = %e, "state snapshot failed");
        }
    }

    async fn acquire_lock(&self) -> Result<()> {
        // Never retried: a holder collision must fail fast.
        let acquired = self
            .backend
            .acquire_lock(&self.stack, &self.holder, self.lock_ttl)
            .await
            .map_err(|source| Error::BackendOperationFailed {
                operation: "acquire_lock",
                attempts: 1,
                source,
            })?;
        if acquired {
            return Ok(());
        }
        let holder = match self.backend.check_lock(&self.stack).await {
            Ok(Some(info)) => info.holder,
            _ => "unknown".to_string(),
        };
        Err(Error::LockAcquisitionFailed {
            stack: self.stack.clone(),
            holder,
        })
    }

    fn start_renewal(&self) {
        let lost = Arc::new(AtomicBool::new(false));
        let reason = Arc::new(Mutex::new(None));
        let backend = Arc::clone(&self.backend);
        let stack = self.stack.clone();
        let holder = self.holder.clone();
        let ttl = self.lock_ttl;
        let lost_in = Arc::clone(&lost);
        let reason_in = Arc::clone(&reason);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl / 2).await;
                match backend.acquire_lock(&stack, &holder, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        *reason_in.lock() = Some("lock taken by another holder".to_string());
                        lost_in.store(true, Ordering::SeqCst);
                        tracing::warn!(stack = %stack, "deployment lock lost to another holder");
                        break;
                    }
                    Err(e) => {
                        *reason_in.lock() = Some(format!("renewal error: {e}"));
                        lost_in.store(true, Ordering::SeqCst);
                        tracing::warn!(stack = %stack, error = %e, "deployment lock renewal failed");
                        break;
                    }
                }
            }
        });
        *self.renewal.lock() = Some(Renewal {
            handle,
            lost,
            reason,
        });
    }

    fn stop_renewal(&self) {
        if let Some(renewal) = self.renewal.lock().take() {
            renewal.handle.abort();
        }
    }

    async fn release_lock_best_effort(&self) {
        if let Err(e) = self.backend.release_lock(&self.stack).await {
            tracing::warn!(stack = %self.stack, error = %e, "lock release failed");
        }
    }

    async fn persist(&self) -> Result<()> {
        let doc = self.current.lock().clone();
        let backend = Arc::clone(&self.backend);
        let stack = self.stack.clone();
        with_retry(&self.retry, "save_state", move || {
            let backend = Arc::clone(&backend);
            let stack = stack.clone();
            let doc = doc.clone();
            async move { backend.save_state(&stack, &doc).await }
        })
        .await
    }
}

impl Drop for StateMachine {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.lock().take() {
            renewal.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_is_enforced() {
        use DeploymentStatus::{Applying, Deployed, Failed, Pending, RolledBack};
        assert!(check_transition(Pending, Applying).is_ok());
        assert!(check_transition(Applying, Deployed).is_ok());
        assert!(check_transition(Applying, Failed).is_ok());
        assert!(check_transition(Applying, RolledBack).is_ok());
        assert!(check_transition(Failed, RolledBack).is_ok());

        for (from, to) in [
            (Pending, Deployed),
            (Pending, Failed),
            (Deployed, Failed),
            (Deployed, RolledBack),
            (Failed, Applying),
            (RolledBack, Deployed),
            (Applying, Applying),
            (Applying, Pending),
        ] {
            let err = check_transition(from, to).unwrap_err();
            assert_eq!(err.code(), "INVALID_STATE_TRANSITION");
        }
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::RolledBack).unwrap(),
            "\"ROLLED_BACK\""
        );
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::Applying).unwrap(),
            "\"APPLYING\""
        );
    }

    #[test]
    fn fresh_document_is_pending() {
        let doc = DeploymentState::new("prod", "ci");
        assert_eq!(doc.status, DeploymentStatus::Pending);
        assert!(doc.nodes.is_empty());
        assert!(doc.change_set.is_none());
        assert!(doc.checkpoint.is_none());
    }
}
