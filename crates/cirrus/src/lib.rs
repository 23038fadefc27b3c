// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cirrus: a convergent reactive infrastructure engine.
//!
//! Cloud resource graphs are expressed as component trees. A component
//! declares resources with [`Scope::use_instance`] and consumes their
//! outputs (ARNs, URLs, endpoints) through accessor reads; the engine
//! renders the tree, deploys declared nodes through a [`Provider`], feeds
//! real outputs back into the tree, and re-renders affected subtrees until
//! the graph converges. Across runs it diffs against state persisted in a
//! [`StateBackend`], producing creates, updates and deletes driven by a
//! transactional state machine with checkpoints, locking and crash
//! recovery.
//!
//! The moving parts:
//!
//! - **Signals** ([`signal`]): fine-grained reactive cells with batched
//!   propagation. Output writes during deployment are batched so every
//!   affected component is dirty before the driver looks.
//! - **Renderer** ([`render`], [`fiber`]): element trees become fiber
//!   trees; hooks are positional; fibers are identified by path, stable
//!   across renders and runs.
//! - **Hooks** ([`hooks`]): `use_instance`, `use_state`, `use_context`,
//!   `use_effect`. Undefined props yield placeholder accessors instead of
//!   half-defined nodes.
//! - **Reconciler** ([`reconcile`]): change-sets with a topological
//!   deployment order and parallel batches.
//! - **State machine** ([`machine`]): PENDING -> APPLYING -> DEPLOYED /
//!   FAILED / ROLLED_BACK, with per-node checkpoints and a TTL lock.
//! - **Driver** ([`driver`]): the convergence loop.
//!
//! # Example
//!
//! ```rust,ignore
//! use cirrus::{DeployOptions, Element, MemoryBackend, Props, Runtime, Scope};
//! use std::sync::Arc;
//!
//! fn database(cx: &mut Scope<'_>, _props: &Props) -> cirrus::Result<Vec<Element>> {
//!     let db = cx.use_instance("rds/Instance", Props::new().with("name", "main"))?;
//!     // Not available until the first deploy batch returns; the component
//!     // re-renders automatically once it is.
//!     let endpoint = db.get("endpoint");
//!     let _api = cx.use_instance(
//!         "lambda/Function",
//!         Props::new().with("name", "api").with("db_endpoint", endpoint),
//!     )?;
//!     Ok(Vec::new())
//! }
//!
//! async fn deploy(provider: Arc<dyn cirrus::Provider>) -> cirrus::Result<()> {
//!     let runtime = Runtime::new(provider, Arc::new(MemoryBackend::new()));
//!     runtime
//!         .deploy(
//!             Element::component("Database", database, Props::new()),
//!             "prod",
//!             DeployOptions::default(),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod context;
pub mod driver;
pub mod element;
pub mod error;
pub mod fiber;
pub mod hooks;
pub mod machine;
pub mod node;
pub mod path;
pub mod provider;
pub mod reconcile;
pub mod render;
pub mod retry;
pub mod runtime;
pub mod signal;

mod shared;

pub use backend::{AuditEntry, FileBackend, LockInfo, MemoryBackend, StateBackend};
pub use context::{Context, ContextId};
pub use element::{ComponentFn, Element, ElementKind, PropValue, Props};
pub use error::{BackendError, Error, ProviderError, Result};
pub use hooks::{Scope, StateHandle};
pub use machine::{DeploymentState, DeploymentStatus};
pub use node::{NodeSnapshot, OutputAccessors};
pub use path::{Discriminator, NodeId, Path, Segment};
pub use provider::{OutputMap, Provider};
pub use reconcile::{ChangeEntry, ChangeSet};
pub use retry::RetryPolicy;
pub use runtime::{DeployOptions, DeployReport, RecoveryPlan, Runtime};
pub use signal::Signal;

/// Convenient imports for applications.
pub mod prelude {
    pub use crate::{
        Context, DeployOptions, DeployReport, Element, MemoryBackend, Props, Provider, Result,
        Runtime, Scope, StateBackend,
    };
}
