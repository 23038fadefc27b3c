// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The top-level runtime API.
//!
//! A [`Runtime`] pairs a [`Provider`] with a [`StateBackend`] and drives
//! deployments of element trees into stacks. Runtimes are independent of
//! each other: each owns its own reactive graph, fiber tree and node
//! registry.
//!
//! # Example
//!
//! ```rust,ignore
//! use cirrus::{Element, Props, Runtime, DeployOptions, MemoryBackend};
//! use std::sync::Arc;
//!
//! async fn example(provider: Arc<dyn cirrus::Provider>) -> cirrus::Result<()> {
//!     let runtime = Runtime::new(provider, Arc::new(MemoryBackend::new()));
//!     let report = runtime
//!         .deploy(
//!             Element::component("App", app, Props::new()),
//!             "prod",
//!             DeployOptions::default(),
//!         )
//!         .await?;
//!     println!("deployed {} nodes", report.nodes.len());
//!     Ok(())
//! }
//! # fn app(_cx: &mut cirrus::Scope<'_>, _props: &cirrus::Props) -> cirrus::Result<Vec<cirrus::Element>> { Ok(Vec::new()) }
//! ```

use crate::backend::StateBackend;
use crate::driver;
use crate::element::Element;
use crate::error::{Error, Result};
use crate::fiber::TreeState;
use crate::machine::DeploymentStatus;
use crate::node::NodeSnapshot;
use crate::provider::Provider;
use crate::reconcile::ChangeSet;
use crate::retry::RetryPolicy;
use crate::shared::EngineShared;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Options for one deployment run.
#[derive(Clone, Debug)]
pub struct DeployOptions {
    /// Cap on convergence iterations. Hitting it is non-fatal: the run
    /// completes with whatever converged and logs a diagnostic.
    pub max_iterations: usize,
    /// Whole-run budget. Exhaustion fails the deployment.
    pub async_timeout: Option<Duration>,
    /// Per provider-operation timeout.
    pub operation_timeout: Option<Duration>,
    /// Backoff for state backend operations.
    pub retry: RetryPolicy,
    /// Deployment lock TTL; renewed at half this interval.
    pub lock_ttl: Duration,
    /// Id remapping applied to previous state before diffing
    /// (old id -> new id), so renamed resources update instead of
    /// recreating.
    pub migrations: BTreeMap<String, String>,
    /// Destroy deleted nodes before applying creates/updates instead of
    /// after.
    pub deletes_first: bool,
    /// User label recorded in state documents and audit entries.
    pub user: String,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            async_timeout: None,
            operation_timeout: None,
            retry: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(30),
            migrations: BTreeMap::new(),
            deletes_first: false,
            user: "cirrus".to_string(),
        }
    }
}

impl DeployOptions {
    /// Override the convergence iteration cap.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the whole-run timeout budget.
    #[must_use]
    pub fn with_async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = Some(timeout);
        self
    }

    /// Set the per provider-operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Override the backend retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the lock TTL.
    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Remap one node id from a previous run.
    #[must_use]
    pub fn with_migration(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.migrations.insert(from.into(), to.into());
        self
    }

    /// Destroy deletes before applying creates/updates.
    #[must_use]
    pub fn with_deletes_first(mut self) -> Self {
        self.deletes_first = true;
        self
    }

    /// Set the user label.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }
}

/// What a deployment run produced.
#[derive(Clone, Debug)]
pub struct DeployReport {
    /// Final node snapshots, outputs included.
    pub nodes: Vec<NodeSnapshot>,
    /// Convergence iterations executed.
    pub iterations: usize,
    /// Whether a fixed point was reached before the iteration cap.
    pub converged: bool,
    /// Final stack status.
    pub status: DeploymentStatus,
}

/// Recovery information for a stack whose last run crashed mid-apply.
#[derive(Clone, Debug)]
pub struct RecoveryPlan {
    /// The stack in question.
    pub stack: String,
    /// The change-set that was being applied.
    pub change_set: ChangeSet,
    /// Last successfully applied index in `change_set.deployment_order`.
    pub checkpoint: Option<usize>,
    /// The node graph as of the crash.
    pub nodes: Vec<NodeSnapshot>,
    /// Persisted store values.
    pub stores: BTreeMap<String, Value>,
}

/// The cirrus engine: renders element trees and reconciles them against
/// cloud state through a provider and a backend.
pub struct Runtime {
    shared: Arc<EngineShared>,
    provider: Arc<dyn Provider>,
    backend: Arc<dyn StateBackend>,
    engine: tokio::sync::Mutex<TreeState>,
}

impl Runtime {
    /// Create a runtime over a provider and a state backend.
    pub fn new(provider: Arc<dyn Provider>, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            shared: Arc::new(EngineShared::new()),
            provider,
            backend,
            engine: tokio::sync::Mutex::new(TreeState::new()),
        }
    }

    /// Render `element` into `stack` and converge: deploy declared nodes,
    /// feed outputs back, re-render, repeat until fixed point.
    ///
    /// One render/deploy at a time per runtime; concurrent calls fail with
    /// `ValidationFailed`.
    pub async fn deploy(
        &self,
        element: Element,
        stack: &str,
        options: DeployOptions,
    ) -> Result<DeployReport> {
        let mut tree = self.engine.try_lock().map_err(|_| Error::ValidationFailed {
            reason: "a deployment is already running on this runtime".to_string(),
        })?;
        driver::run_deploy(
            &self.shared,
            &mut tree,
            &self.provider,
            &self.backend,
            &element,
            stack,
            &options,
        )
        .await
    }

    /// Render `element` against `stack`'s persisted state and report the
    /// change-set that a deploy would start with, without touching the
    /// provider or taking the lock.
    ///
    /// Outputs never produced stay undefined during a preview, so structure
    /// that only unfolds from fresh outputs is not included; the preview is
    /// exact for prop-only drift.
    pub async fn preview(
        &self,
        element: Element,
        stack: &str,
        options: DeployOptions,
    ) -> Result<ChangeSet> {
        let mut tree = self.engine.try_lock().map_err(|_| Error::ValidationFailed {
            reason: "a deployment is already running on this runtime".to_string(),
        })?;
        driver::run_preview(
            &self.shared,
            &mut tree,
            &self.provider,
            &self.backend,
            &element,
            stack,
            &options,
        )
        .await
    }

    /// Recovery information for `stack`, when its persisted status is
    /// APPLYING (a previous run crashed mid-deployment). The caller picks
    /// [`Runtime::resume`] or [`Runtime::rollback`].
    pub async fn recovery_plan(&self, stack: &str) -> Result<Option<RecoveryPlan>> {
        let state = self
            .backend
            .get_state(stack)
            .await
            .map_err(|source| Error::BackendOperationFailed {
                operation: "get_state",
                attempts: 1,
                source,
            })?;
        Ok(state.and_then(|state| {
            if state.status != DeploymentStatus::Applying {
                return None;
            }
            let change_set = state.change_set.clone()?;
            Some(RecoveryPlan {
                stack: stack.to_string(),
                change_set,
                checkpoint: state.checkpoint,
                nodes: state.nodes,
                stores: state.stores,
            })
        }))
    }

    /// Continue a crashed deployment from its checkpoint: applies
    /// `deployment_order[checkpoint + 1 ..]`, then the pending deletes, and
    /// completes.
    pub async fn resume(&self, stack: &str, options: DeployOptions) -> Result<DeployReport> {
        driver::run_resume(&self.shared, &self.provider, &self.backend, stack, &options).await
    }

    /// Undo the applied prefix of an APPLYING or FAILED deployment and mark
    /// the stack ROLLED_BACK.
    pub async fn rollback(&self, stack: &str, options: DeployOptions) -> Result<()> {
        driver::run_rollback(&self.provider, &self.backend, stack, &options).await
    }

    /// Destroy every node of a stack, children before parents.
    pub async fn destroy(&self, stack: &str, options: DeployOptions) -> Result<()> {
        driver::run_destroy(&self.shared, &self.provider, &self.backend, stack, &options).await
    }

    /// Drop all in-memory engine state (fibers, signals, registry) while
    /// keeping the provider and backend. For tests.
    pub async fn reset(&mut self) {
        self.shared = Arc::new(EngineShared::new());
        *self.engine.lock().await = TreeState::new();
    }
}
