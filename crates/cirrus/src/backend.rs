// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! State backends: persisted deployment documents, locks, audit, snapshots.
//!
//! [`MemoryBackend`] serves tests and short-lived runs. [`FileBackend`]
//! persists documents under a directory with an integrity envelope
//! (magic, format version, CRC32, length) so corruption from bit flips or
//! partial writes is detected, writes files atomically (temp file, fsync,
//! rename), and coordinates the lock table across processes with an
//! `fs2` file lock.

use crate::error::BackendError;
use crate::machine::DeploymentState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Information about a held deployment lock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Holder id.
    pub holder: String,
    /// When the lock was (last) acquired.
    pub acquired_at: DateTime<Utc>,
    /// Time-to-live granted at acquisition.
    pub ttl: Duration,
}

/// One audit log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Acting user.
    pub user: String,
    /// Machine-readable action, e.g. `deployment_started`.
    pub action: String,
    /// Free-form detail.
    pub detail: String,
}

/// Storage contract for persisted deployment state.
///
/// `save_state` must be atomic: a crashed writer never leaves a reader a
/// half-written document. `acquire_lock` grants the lock when it is free,
/// expired, or already held by the same holder (renewal); it is never
/// retried by the engine. `append_audit` and `save_snapshot` are optional;
/// the defaults do nothing.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// The persisted document for `stack`, or `None` for a fresh stack.
    async fn get_state(
        &self,
        stack: &str,
    ) -> std::result::Result<Option<DeploymentState>, BackendError>;

    /// Atomically persist the document for `stack`.
    async fn save_state(
        &self,
        stack: &str,
        state: &DeploymentState,
    ) -> std::result::Result<(), BackendError>;

    /// Try to take (or renew) the deployment lock. `false` means held by
    /// someone else.
    async fn acquire_lock(
        &self,
        stack: &str,
        holder: &str,
        ttl: Duration,
    ) -> std::result::Result<bool, BackendError>;

    /// Release the deployment lock.
    async fn release_lock(&self, stack: &str) -> std::result::Result<(), BackendError>;

    /// Who currently holds the lock, if anyone.
    async fn check_lock(
        &self,
        stack: &str,
    ) -> std::result::Result<Option<LockInfo>, BackendError>;

    /// Append an audit entry. Optional; default is a no-op.
    async fn append_audit(
        &self,
        _stack: &str,
        _entry: &AuditEntry,
    ) -> std::result::Result<(), BackendError> {
        Ok(())
    }

    /// Save a point-in-time snapshot of a document. Optional; default is a
    /// no-op.
    async fn save_snapshot(
        &self,
        _stack: &str,
        _state: &DeploymentState,
    ) -> std::result::Result<(), BackendError> {
        Ok(())
    }
}

// ============================================================================
// State file integrity envelope
// ============================================================================
// Detects corruption from bit flips, partial writes, and format changes.

/// Magic bytes identifying a cirrus state file: "CSTK"
const STATE_MAGIC: &[u8; 4] = b"CSTK";

/// Current format version for state files.
const STATE_FORMAT_VERSION: u32 = 1;

/// Header size: magic(4) + version(4) + crc32(4) + length(8) = 20 bytes
const STATE_HEADER_SIZE: usize = 20;

/// Wraps a serialized document with an integrity header.
///
/// File format (20-byte header + payload):
/// - Bytes 0-3:   Magic "CSTK"
/// - Bytes 4-7:   Format version (u32 little-endian)
/// - Bytes 8-11:  CRC32 checksum of payload (u32 little-endian)
/// - Bytes 12-19: Payload length (u64 little-endian)
/// - Bytes 20+:   Payload (JSON-serialized document)
pub(crate) struct StateEnvelope;

impl StateEnvelope {
    pub(crate) fn wrap(payload: &[u8]) -> Vec<u8> {
        let checksum = crc32fast::hash(payload);
        let length = payload.len() as u64;
        let mut out = Vec::with_capacity(STATE_HEADER_SIZE + payload.len());
        out.extend_from_slice(STATE_MAGIC);
        out.extend_from_slice(&STATE_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn unwrap(data: &[u8]) -> std::result::Result<&[u8], String> {
        if data.len() < STATE_HEADER_SIZE {
            return Err(format!(
                "file too small: {} bytes (minimum {STATE_HEADER_SIZE})",
                data.len()
            ));
        }
        if &data[0..4] != STATE_MAGIC {
            return Err(format!(
                "invalid magic bytes: expected {STATE_MAGIC:?}, found {:?}",
                &data[0..4]
            ));
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version > STATE_FORMAT_VERSION {
            return Err(format!(
                "unsupported format version {version} (supported up to {STATE_FORMAT_VERSION})"
            ));
        }
        let stored_checksum = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let declared_length = u64::from_le_bytes([
            data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
        ]);
        let payload = &data[STATE_HEADER_SIZE..];
        if declared_length != payload.len() as u64 {
            return Err(format!(
                "length mismatch: declared {declared_length}, actual {}",
                payload.len()
            ));
        }
        let computed = crc32fast::hash(payload);
        if computed != stored_checksum {
            return Err(format!(
                "checksum mismatch: stored 0x{stored_checksum:08X}, computed 0x{computed:08X}"
            ));
        }
        Ok(payload)
    }
}

// ============================================================================
// MemoryBackend
// ============================================================================

#[derive(Clone, Debug)]
struct MemoryLock {
    holder: String,
    acquired_at: DateTime<Utc>,
    ttl: Duration,
}

impl MemoryLock {
    fn expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }
}

/// In-memory state backend.
///
/// Useful for testing and short-lived runs. Does not persist across process
/// restarts.
#[derive(Default)]
pub struct MemoryBackend {
    states: Mutex<HashMap<String, DeploymentState>>,
    locks: Mutex<HashMap<String, MemoryLock>>,
    audit: Mutex<HashMap<String, Vec<AuditEntry>>>,
    snapshots: Mutex<HashMap<String, Vec<DeploymentState>>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit entries recorded for a stack, oldest first.
    pub fn audit_entries(&self, stack: &str) -> Vec<AuditEntry> {
        self.audit.lock().get(stack).cloned().unwrap_or_default()
    }

    /// Number of snapshots taken for a stack.
    pub fn snapshot_count(&self, stack: &str) -> usize {
        self.snapshots
            .lock()
            .get(stack)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn get_state(
        &self,
        stack: &str,
    ) -> std::result::Result<Option<DeploymentState>, BackendError> {
        Ok(self.states.lock().get(stack).cloned())
    }

    async fn save_state(
        &self,
        stack: &str,
        state: &DeploymentState,
    ) -> std::result::Result<(), BackendError> {
        self.states.lock().insert(stack.to_string(), state.clone());
        Ok(())
    }

    async fn acquire_lock(
        &self,
        stack: &str,
        holder: &str,
        ttl: Duration,
    ) -> std::result::Result<bool, BackendError> {
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(stack) {
            if existing.holder != holder && !existing.expired() {
                return Ok(false);
            }
        }
        locks.insert(
            stack.to_string(),
            MemoryLock {
                holder: holder.to_string(),
                acquired_at: Utc::now(),
                ttl,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, stack: &str) -> std::result::Result<(), BackendError> {
        self.locks.lock().remove(stack);
        Ok(())
    }

    async fn check_lock(
        &self,
        stack: &str,
    ) -> std::result::Result<Option<LockInfo>, BackendError> {
        Ok(self.locks.lock().get(stack).map(|l| LockInfo {
            holder: l.holder.clone(),
            acquired_at: l.acquired_at,
            ttl: l.ttl,
        }))
    }

    async fn append_audit(
        &self,
        stack: &str,
        entry: &AuditEntry,
    ) -> std::result::Result<(), BackendError> {
        self.audit
            .lock()
            .entry(stack.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn save_snapshot(
        &self,
        stack: &str,
        state: &DeploymentState,
    ) -> std::result::Result<(), BackendError> {
        self.snapshots
            .lock()
            .entry(stack.to_string())
            .or_default()
            .push(state.clone());
        Ok(())
    }
}

// ============================================================================
// FileBackend
// ============================================================================

/// Lock table entry as stored in `locks.bin`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LockRecord {
    holder: String,
    acquired_at_ms: i64,
    ttl_ms: u64,
}

impl LockRecord {
    fn expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.acquired_at_ms) > self.ttl_ms as i64
    }
}

/// File-based state backend.
///
/// One directory holds every stack's state document, a shared lock table,
/// per-stack audit logs and snapshots. Thread-safe, and safe across
/// processes sharing the directory: lock-table mutations run under an
/// exclusive `fs2` file lock, and every write is atomic.
pub struct FileBackend {
    directory: PathBuf,
}

impl FileBackend {
    /// Create a backend rooted at `directory`, creating it if needed.
    pub fn new(directory: impl Into<PathBuf>) -> std::result::Result<Self, BackendError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    fn state_path(&self, stack: &str) -> PathBuf {
        self.directory
            .join(format!("{}.state.bin", sanitize_file_stem(stack)))
    }

    fn locks_path(&self) -> PathBuf {
        self.directory.join("locks.bin")
    }

    fn guard_path(&self) -> PathBuf {
        self.directory.join(".cirrus.lock")
    }

    fn audit_path(&self, stack: &str) -> PathBuf {
        self.directory
            .join(format!("{}.audit.jsonl", sanitize_file_stem(stack)))
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.directory.join("snapshots")
    }
}

/// Restrict stack-derived file stems to `[A-Za-z0-9_-]`.
fn sanitize_file_stem(stack: &str) -> String {
    stack
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Atomic file write: temp file, fsync, rename. Prevents corruption on
/// crash or power loss.
fn atomic_write_file_sync(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(&temp_name);

    let mut file = std::fs::File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(&temp_path, path)?;

    // Rename durability requires fsyncing the parent directory on some
    // filesystems; best effort.
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    Ok(())
}

/// Take the cross-process guard lock for lock-table mutations. The lock is
/// released when the returned file is dropped.
fn acquire_guard(path: &Path) -> std::io::Result<std::fs::File> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    fs2::FileExt::lock_exclusive(&file)?;
    Ok(file)
}

/// Load the lock table, recovering to empty on corruption (with a warning;
/// an unreadable lock table must not brick the backend).
fn load_lock_table(path: &Path) -> HashMap<String, LockRecord> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read(path) {
        Ok(data) => match bincode::deserialize(&data) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "lock table is corrupted; starting with an empty table"
                );
                HashMap::new()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read lock table; starting with an empty table"
            );
            HashMap::new()
        }
    }
}

fn save_lock_table(
    path: &Path,
    table: &HashMap<String, LockRecord>,
) -> std::result::Result<(), BackendError> {
    let data = bincode::serialize(table).map_err(|e| BackendError::SerializationFailed {
        reason: format!("lock table: {e}"),
    })?;
    atomic_write_file_sync(path, &data)?;
    Ok(())
}

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> std::result::Result<T, BackendError> + Send + 'static,
) -> std::result::Result<T, BackendError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Other(format!("task join error: {e}")))?
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn get_state(
        &self,
        stack: &str,
    ) -> std::result::Result<Option<DeploymentState>, BackendError> {
        let path = self.state_path(stack);
        let stack = stack.to_string();
        run_blocking(move || {
            if !path.exists() {
                return Ok(None);
            }
            let data = std::fs::read(&path)?;
            let payload =
                StateEnvelope::unwrap(&data).map_err(|reason| {
                    BackendError::IntegrityCheckFailed {
                        stack: stack.clone(),
                        reason,
                    }
                })?;
            let state = serde_json::from_slice(payload).map_err(|e| {
                BackendError::DeserializationFailed {
                    reason: format!("state document for '{stack}': {e}"),
                }
            })?;
            Ok(Some(state))
        })
        .await
    }

    async fn save_state(
        &self,
        stack: &str,
        state: &DeploymentState,
    ) -> std::result::Result<(), BackendError> {
        let path = self.state_path(stack);
        let stack = stack.to_string();
        let state = state.clone();
        run_blocking(move || {
            let payload =
                serde_json::to_vec(&state).map_err(|e| BackendError::SerializationFailed {
                    reason: format!("state document for '{stack}': {e}"),
                })?;
            let data = StateEnvelope::wrap(&payload);
            atomic_write_file_sync(&path, &data)?;
            Ok(())
        })
        .await
    }

    async fn acquire_lock(
        &self,
        stack: &str,
        holder: &str,
        ttl: Duration,
    ) -> std::result::Result<bool, BackendError> {
        let locks_path = self.locks_path();
        let guard_path = self.guard_path();
        let stack = stack.to_string();
        let holder = holder.to_string();
        run_blocking(move || {
            let _guard = acquire_guard(&guard_path).map_err(|e| BackendError::LockFailed {
                reason: format!("guard lock: {e}"),
            })?;
            let mut table = load_lock_table(&locks_path);
            let now_ms = Utc::now().timestamp_millis();
            if let Some(existing) = table.get(&stack) {
                if existing.holder != holder && !existing.expired(now_ms) {
                    return Ok(false);
                }
            }
            table.insert(
                stack,
                LockRecord {
                    holder,
                    acquired_at_ms: now_ms,
                    ttl_ms: ttl.as_millis() as u64,
                },
            );
            save_lock_table(&locks_path, &table)?;
            Ok(true)
        })
        .await
    }

    async fn release_lock(&self, stack: &str) -> std::result::Result<(), BackendError> {
        let locks_path = self.locks_path();
        let guard_path = self.guard_path();
        let stack = stack.to_string();
        run_blocking(move || {
            let _guard = acquire_guard(&guard_path).map_err(|e| BackendError::LockFailed {
                reason: format!("guard lock: {e}"),
            })?;
            let mut table = load_lock_table(&locks_path);
            table.remove(&stack);
            save_lock_table(&locks_path, &table)?;
            Ok(())
        })
        .await
    }

    async fn check_lock(
        &self,
        stack: &str,
    ) -> std::result::Result<Option<LockInfo>, BackendError> {
        let locks_path = self.locks_path();
        let stack = stack.to_string();
        run_blocking(move || {
            let table = load_lock_table(&locks_path);
            let now_ms = Utc::now().timestamp_millis();
            Ok(table.get(&stack).filter(|l| !l.expired(now_ms)).map(|l| {
                LockInfo {
                    holder: l.holder.clone(),
                    acquired_at: DateTime::<Utc>::from_timestamp_millis(l.acquired_at_ms)
                        .unwrap_or_else(Utc::now),
                    ttl: Duration::from_millis(l.ttl_ms),
                }
            }))
        })
        .await
    }

    async fn append_audit(
        &self,
        stack: &str,
        entry: &AuditEntry,
    ) -> std::result::Result<(), BackendError> {
        let path = self.audit_path(stack);
        let line = serde_json::to_string(entry).map_err(|e| BackendError::SerializationFailed {
            reason: format!("audit entry: {e}"),
        })?;
        run_blocking(move || {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{line}")?;
            Ok(())
        })
        .await
    }

    async fn save_snapshot(
        &self,
        stack: &str,
        state: &DeploymentState,
    ) -> std::result::Result<(), BackendError> {
        let dir = self.snapshot_dir();
        let stem = sanitize_file_stem(stack);
        let state = state.clone();
        run_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            let payload =
                serde_json::to_vec(&state).map_err(|e| BackendError::SerializationFailed {
                    reason: format!("snapshot: {e}"),
                })?;
            let name = format!(
                "{stem}-{}-{}.bin",
                Utc::now().timestamp_millis(),
                uuid::Uuid::new_v4()
            );
            atomic_write_file_sync(&dir.join(name), &StateEnvelope::wrap(&payload))?;
            Ok(())
        })
        .await
    }
}
