// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Convergence throughput: full deploy runs and render-only previews over
//! trees of increasing width.

use cirrus::{DeployOptions, Element, MemoryBackend, Props, Result, Runtime, Scope};
use cirrus_testing::MockProvider;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn many_things(cx: &mut Scope<'_>, props: &Props) -> Result<Vec<Element>> {
    let n = props.get("n").and_then(serde_json::Value::as_i64).unwrap_or(0);
    for i in 0..n {
        cx.use_instance("svc/Thing", Props::new().with("name", format!("t{i}")))?;
    }
    Ok(Vec::new())
}

fn wide_tree(n: i64) -> Element {
    Element::component("App", many_things, Props::new().with("n", n))
}

fn bench_deploy(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("deploy");
    for n in [10i64, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.to_async(&rt).iter(|| async move {
                let provider = MockProvider::new();
                let backend = Arc::new(MemoryBackend::new());
                let runtime = Runtime::new(Arc::new(provider), backend);
                runtime
                    .deploy(wide_tree(n), "bench", DeployOptions::default())
                    .await
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_preview(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("preview");
    for n in [10i64, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.to_async(&rt).iter(|| async move {
                let provider = MockProvider::new();
                let backend = Arc::new(MemoryBackend::new());
                let runtime = Runtime::new(Arc::new(provider), backend);
                runtime
                    .preview(wide_tree(n), "bench", DeployOptions::default())
                    .await
                    .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_deploy, bench_preview);
criterion_main!(benches);
