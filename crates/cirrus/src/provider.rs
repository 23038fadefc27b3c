// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The cloud provider contract.
//!
//! The engine drives a provider one node at a time: `apply` provisions or
//! updates a resource and reports its outputs, `destroy` removes it. The
//! engine may call `apply` for the nodes of one batch concurrently; a
//! provider that needs serial behavior must serialize internally. Ordering
//! across batches is always respected.

use crate::error::{Error, ProviderError};
use crate::node::NodeSnapshot;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// Output map returned by a successful apply.
pub type OutputMap = serde_json::Map<String, Value>;

/// A cloud provider: the only party that touches real infrastructure.
///
/// Implementations must be idempotent: applying the same `(id, props)` pair
/// twice yields the same resource and outputs.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provision or update one resource; return its outputs.
    async fn apply(&self, node: &NodeSnapshot) -> std::result::Result<OutputMap, ProviderError>;

    /// Remove one resource.
    async fn destroy(&self, node: &NodeSnapshot) -> std::result::Result<(), ProviderError>;

    /// Called once before the first batch of a run, with every node
    /// scheduled for apply.
    async fn pre_deploy(
        &self,
        _nodes: &[NodeSnapshot],
    ) -> std::result::Result<(), ProviderError> {
        Ok(())
    }

    /// Called once after convergence with the final nodes and their
    /// outputs. Failures are logged and do not fail the deployment.
    async fn post_deploy(
        &self,
        _nodes: &[NodeSnapshot],
        _outputs: &BTreeMap<String, OutputMap>,
    ) -> std::result::Result<(), ProviderError> {
        Ok(())
    }

    /// Called when a deployment fails, with the error and the nodes that
    /// were in flight.
    async fn on_error(&self, _error: &Error, _nodes: &[NodeSnapshot]) {}

    /// Prop keys of `construct_type` that cannot change in place. An update
    /// touching one becomes a replacement (destroy then create).
    fn immutable_props(&self, _construct_type: &str) -> Vec<String> {
        Vec::new()
    }
}
