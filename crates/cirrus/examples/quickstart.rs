//! Quickstart: a three-node stack deployed against a mock provider.
//!
//! Pattern: Database -> Api (reads the database endpoint) -> Cdn (reads
//! the api url). Each dependency resolves through the convergence loop:
//! nodes whose inputs are not yet available wait as placeholders and
//! deploy in a later batch.

use cirrus::{DeployOptions, Element, MemoryBackend, Props, Result, Runtime, Scope};
use cirrus_testing::MockProvider;
use serde_json::json;
use std::sync::Arc;

fn app(cx: &mut Scope<'_>, _props: &Props) -> Result<Vec<Element>> {
    let db = cx.use_instance("rds/Instance", Props::new().with("name", "main"))?;
    Ok(vec![Element::component(
        "Api",
        api,
        Props::new().with("db_endpoint", db.get("endpoint")),
    )])
}

fn api(cx: &mut Scope<'_>, props: &Props) -> Result<Vec<Element>> {
    let api = cx.use_instance(
        "lambda/Function",
        Props::new()
            .with("name", "api")
            .with("db_endpoint", props.get("db_endpoint").cloned()),
    )?;
    Ok(vec![Element::component(
        "Cdn",
        cdn,
        Props::new().with("origin", api.get("url")),
    )])
}

fn cdn(cx: &mut Scope<'_>, props: &Props) -> Result<Vec<Element>> {
    cx.use_instance(
        "cloudfront/Distribution",
        Props::new()
            .with("name", "edge")
            .with("origin", props.get("origin").cloned()),
    )?;
    Ok(Vec::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    let provider = MockProvider::new()
        .with_outputs("rds/Instance", json!({"endpoint": "db.internal:5432"}))
        .with_outputs("lambda/Function", json!({"url": "https://api.internal"}))
        .with_outputs("cloudfront/Distribution", json!({"domain": "dxxxx.cloudfront.net"}));
    let runtime = Runtime::new(Arc::new(provider.clone()), Arc::new(MemoryBackend::new()));

    let report = runtime
        .deploy(
            Element::component("App", app, Props::new()),
            "quickstart",
            DeployOptions::default(),
        )
        .await?;

    println!(
        "converged after {} iteration(s); {} node(s) deployed",
        report.iterations,
        report.nodes.len()
    );
    for id in provider.applied() {
        println!("  applied {id}");
    }
    for node in &report.nodes {
        println!("  {} -> {}", node.id, serde_json::to_string(&node.outputs).unwrap_or_default());
    }
    Ok(())
}
