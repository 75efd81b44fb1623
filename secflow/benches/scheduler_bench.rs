//! Benchmarks for the stage scheduler loop.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use secflow::cleanup::CleanupCoordinator;
use secflow::core::FailurePolicy;
use secflow::pipeline::{Pipeline, PipelineBuilder, StageScheduler, StageSpec};
use secflow::testing::{MockStage, ScriptedToolRunner, TestRun};
use std::sync::Arc;

fn pipeline_of(stages: usize) -> Pipeline {
    let mut builder = PipelineBuilder::new("bench");
    for i in 0..stages {
        let name = format!("stage-{i}");
        let policy = if i % 2 == 0 {
            FailurePolicy::AbortOnFailure
        } else {
            FailurePolicy::BestEffort
        };
        builder
            .add_stage_spec(
                StageSpec::new(name.clone(), Arc::new(MockStage::new(name))).with_policy(policy),
            )
            .unwrap();
    }
    builder.build().unwrap()
}

fn scheduler_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let scheduler = StageScheduler::new(Arc::new(CleanupCoordinator::new(Arc::new(
        ScriptedToolRunner::new(),
    ))));

    let mut group = c.benchmark_group("sequential_run");
    for stages in [1, 8, 32] {
        let pipeline = pipeline_of(stages);
        group.bench_with_input(BenchmarkId::from_parameter(stages), &pipeline, |b, p| {
            b.iter(|| {
                let ctx = TestRun::new().run_context();
                black_box(rt.block_on(scheduler.run(p, ctx)))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, scheduler_benchmark);
criterion_main!(benches);
