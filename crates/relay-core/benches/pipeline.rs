//! Benchmarks for the Relay staged pipeline.
//!
//! Run with: cargo bench -p relay-core

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::DynamicImage;
use relay_core::dedup::{DedupStore, MemoryDedupStore};
use relay_core::filters::{FlipHorizontal, Resize};
use relay_core::pipeline::backoff_duration;
use relay_core::{Envelope, EnvelopeId, IterSource, Payload, Pipeline, StageSpec, Transform};

fn envelopes(n: usize) -> Vec<Envelope> {
    (0..n)
        .map(|i| Envelope::new(EnvelopeId::new(format!("bench-{i}")), Payload::Bytes(vec![0; 64])))
        .collect()
}

fn passthrough() -> impl Transform {
    relay_core::from_fn(|_: &mut Envelope| Ok(()))
}

fn benchmark_passthrough_pipeline(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("passthrough_1000_items");

    for workers in [1usize, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter(|| {
                rt.block_on(async {
                    let mut pipeline = Pipeline::builder()
                        .source(IterSource::new(envelopes(1000)))
                        .stage(StageSpec::new("a", passthrough()).workers(workers))
                        .stage(StageSpec::new("b", passthrough()).workers(workers))
                        .stage(StageSpec::new("c", passthrough()).workers(workers))
                        .build()
                        .unwrap();
                    pipeline.start().unwrap();
                    pipeline
                        .wait_for_completion(Duration::from_secs(60))
                        .await
                        .unwrap();
                    black_box(pipeline.metrics().snapshot().completed)
                })
            })
        });
    }
    group.finish();
}

fn benchmark_dedup_skip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(MemoryDedupStore::new());
    for env in envelopes(1000) {
        store.mark_completed(env.id(), "a").unwrap();
    }

    c.bench_function("dedup_skip_1000_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut pipeline = Pipeline::builder()
                    .source(IterSource::new(envelopes(1000)))
                    .stage(StageSpec::new("a", passthrough()).workers(4))
                    .dedup(store.clone())
                    .build()
                    .unwrap();
                pipeline.start().unwrap();
                pipeline
                    .wait_for_completion(Duration::from_secs(60))
                    .await
                    .unwrap();
            })
        })
    });
}

fn benchmark_image_stages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("resize_flip_32_images", |b| {
        b.iter(|| {
            rt.block_on(async {
                let items = (0..32).map(|i| {
                    Envelope::new(
                        EnvelopeId::new(format!("img-{i}")),
                        Payload::Image(DynamicImage::new_rgb8(1024, 768)),
                    )
                });
                let mut pipeline = Pipeline::builder()
                    .source(IterSource::new(items))
                    .stage(
                        StageSpec::new(
                            "resize",
                            Resize {
                                width: Some(256),
                                height: Some(256),
                                keep_aspect_ratio: true,
                            },
                        )
                        .workers(4),
                    )
                    .stage(StageSpec::new("flip", FlipHorizontal).workers(2))
                    .build()
                    .unwrap();
                pipeline.start().unwrap();
                pipeline
                    .wait_for_completion(Duration::from_secs(60))
                    .await
                    .unwrap();
            })
        })
    });
}

fn benchmark_backoff(c: &mut Criterion) {
    let base = Duration::from_millis(200);
    let cap = Duration::from_secs(30);

    c.bench_function("backoff_duration", |b| {
        b.iter(|| {
            for attempt in 0..40 {
                black_box(backoff_duration(black_box(attempt), base, cap));
            }
        })
    });
}

criterion_group!(
    benches,
    benchmark_passthrough_pipeline,
    benchmark_dedup_skip,
    benchmark_image_stages,
    benchmark_backoff,
);
criterion_main!(benches);
