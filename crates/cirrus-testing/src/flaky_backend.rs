//! A backend wrapper that injects transient failures, for retry tests.

use async_trait::async_trait;
use cirrus::{AuditEntry, BackendError, DeploymentState, LockInfo, StateBackend};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wraps another backend and fails the first N calls of selected
/// operations with `BackendError::Other`, then delegates.
///
/// # Example
///
/// ```rust,ignore
/// use cirrus::MemoryBackend;
/// use cirrus_testing::FlakyBackend;
/// use std::sync::Arc;
///
/// // get_state fails twice, then succeeds.
/// let backend = FlakyBackend::new(Arc::new(MemoryBackend::new())).fail("get_state", 2);
/// ```
pub struct FlakyBackend {
    inner: Arc<dyn StateBackend>,
    failures: Mutex<HashMap<String, usize>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FlakyBackend {
    /// Wrap `inner` with no failures configured.
    pub fn new(inner: Arc<dyn StateBackend>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `count` calls of `operation` (e.g. `"get_state"`,
    /// `"save_state"`, `"acquire_lock"`).
    pub fn fail(self, operation: impl Into<String>, count: usize) -> Self {
        self.failures.lock().unwrap().insert(operation.into(), count);
        self
    }

    /// How many times `operation` was called, failures included.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }

    fn trip(&self, operation: &str) -> std::result::Result<(), BackendError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_insert(0) += 1;
        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Other(format!(
                    "injected {operation} failure"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateBackend for FlakyBackend {
    async fn get_state(
        &self,
        stack: &str,
    ) -> std::result::Result<Option<DeploymentState>, BackendError> {
        self.trip("get_state")?;
        self.inner.get_state(stack).await
    }

    async fn save_state(
        &self,
        stack: &str,
        state: &DeploymentState,
    ) -> std::result::Result<(), BackendError> {
        self.trip("save_state")?;
        self.inner.save_state(stack, state).await
    }

    async fn acquire_lock(
        &self,
        stack: &str,
        holder: &str,
        ttl: Duration,
    ) -> std::result::Result<bool, BackendError> {
        self.trip("acquire_lock")?;
        self.inner.acquire_lock(stack, holder, ttl).await
    }

    async fn release_lock(&self, stack: &str) -> std::result::Result<(), BackendError> {
        self.trip("release_lock")?;
        self.inner.release_lock(stack).await
    }

    async fn check_lock(
        &self,
        stack: &str,
    ) -> std::result::Result<Option<LockInfo>, BackendError> {
        self.trip("check_lock")?;
        self.inner.check_lock(stack).await
    }

    async fn append_audit(
        &self,
        stack: &str,
        entry: &AuditEntry,
    ) -> std::result::Result<(), BackendError> {
        self.trip("append_audit")?;
        self.inner.append_audit(stack, entry).await
    }

    async fn save_snapshot(
        &self,
        stack: &str,
        state: &DeploymentState,
    ) -> std::result::Result<(), BackendError> {
        self.trip("save_snapshot")?;
        self.inner.save_snapshot(stack, state).await
    }
}
