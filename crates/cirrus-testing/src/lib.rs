// Allow unwrap in testing utilities - test code should panic on errors
#![allow(clippy::unwrap_used)]

//! # Cirrus Testing Utilities
//!
//! This crate provides testing utilities for cirrus applications,
//! including:
//!
//! - **MockProvider**: a configurable in-memory provider with scripted
//!   outputs, failure injection and call recording
//! - **FlakyBackend**: a backend wrapper injecting transient failures for
//!   retry tests
//!
//! ## Quick Start
//!
//! ```rust
//! use cirrus_testing::MockProvider;
//! use serde_json::json;
//!
//! let provider = MockProvider::new()
//!     .with_outputs("s3/Bucket", json!({"arn": "arn:aws:s3:::assets"}))
//!     .fail_apply_at(3);
//! ```

mod flaky_backend;
mod mock_provider;

pub use flaky_backend::FlakyBackend;
pub use mock_provider::{ApplyHandler, MockProvider};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{FlakyBackend, MockProvider};
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus::{MemoryBackend, NodeSnapshot, Path, Provider, Segment, StateBackend};
    use serde_json::json;
    use std::sync::Arc;

    fn node(name: &str, construct: &str) -> NodeSnapshot {
        let path = Path::root().child(Segment::named(name));
        NodeSnapshot {
            id: cirrus::NodeId::from_path(&path),
            path,
            construct_type: construct.to_string(),
            props: serde_json::Map::new(),
            outputs: serde_json::Map::new(),
            state: serde_json::Map::new(),
            children: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    #[tokio::test]
    async fn mock_provider_returns_fixed_outputs() {
        let provider =
            MockProvider::new().with_outputs("s3/Bucket", json!({"arn": "arn:aws:s3:::x"}));
        let outputs = provider.apply(&node("Store", "s3/Bucket")).await.unwrap();
        assert_eq!(outputs.get("arn"), Some(&json!("arn:aws:s3:::x")));
        assert_eq!(provider.applied(), vec!["Store"]);
    }

    #[tokio::test]
    async fn mock_provider_default_output_is_the_node_id() {
        let provider = MockProvider::new();
        let outputs = provider.apply(&node("Store", "s3/Bucket")).await.unwrap();
        assert_eq!(outputs.get("id"), Some(&json!("Store")));
    }

    #[tokio::test]
    async fn mock_provider_fails_at_index() {
        let provider = MockProvider::new().fail_apply_at(1);
        provider.apply(&node("A", "t")).await.unwrap();
        assert!(provider.apply(&node("B", "t")).await.is_err());
        provider.apply(&node("C", "t")).await.unwrap();
        assert_eq!(provider.applied(), vec!["A", "C"]);
        assert_eq!(provider.apply_count(), 3);
    }

    #[tokio::test]
    async fn mock_provider_handler_sees_props() {
        let provider = MockProvider::new().with_handler("t", |node| {
            let mut out = cirrus::OutputMap::new();
            let input = node
                .props
                .get("input")
                .and_then(|v| v.as_str())
                .unwrap_or("none");
            out.insert("echo".to_string(), json!(format!("got:{input}")));
            Ok(out)
        });
        let mut n = node("A", "t");
        n.props.insert("input".to_string(), json!("hello"));
        let outputs = provider.apply(&n).await.unwrap();
        assert_eq!(outputs.get("echo"), Some(&json!("got:hello")));
    }

    #[tokio::test]
    async fn flaky_backend_fails_then_delegates() {
        let backend =
            FlakyBackend::new(Arc::new(MemoryBackend::new())).fail("get_state", 2);
        assert!(backend.get_state("prod").await.is_err());
        assert!(backend.get_state("prod").await.is_err());
        assert!(backend.get_state("prod").await.unwrap().is_none());
        assert_eq!(backend.calls("get_state"), 3);
    }
}
