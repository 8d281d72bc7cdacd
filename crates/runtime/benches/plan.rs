//! Plan computation and incremental flushes on a wide graph.
//!
//! Each lane `i` is a short chain `in.i -> a.i -> b.i`; a final step sums
//! every `b.i`. A write to one input should cost a handful of steps no
//! matter how wide the graph is.

use std::hint::black_box;

use converge_foundation::FieldPath;
use converge_runtime::ir::{IrCache, Scope};
use converge_runtime::{DeclarationGroup, FieldEntry, ModuleDeclaration, Runtime, RuntimeConfig};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::{Map, Value, json};

fn wide(width: usize) -> ModuleDeclaration {
    let mut group = DeclarationGroup::new("wide");
    for i in 0..width {
        let input = format!("in.v{i}");
        let a = format!("a.v{i}");
        group = group
            .field(
                a.clone(),
                FieldEntry::computed([input.clone()], move |s| {
                    Ok(json!(s.get(&input).as_i64().unwrap_or(0) + 1))
                }),
            )
            .field(
                format!("b.v{i}"),
                FieldEntry::computed([a.clone()], move |s| {
                    Ok(json!(s.get(&a).as_i64().unwrap_or(0) * 2))
                }),
            );
    }
    let deps: Vec<String> = (0..width).map(|i| format!("b.v{i}")).collect();
    let sum_deps = deps.clone();
    group = group.field(
        "total",
        FieldEntry::computed(deps, move |s| {
            Ok(json!(sum_deps.iter().map(|d| s.get(d).as_i64().unwrap_or(0)).sum::<i64>()))
        }),
    );
    ModuleDeclaration::new("wide").group(group)
}

fn initial(width: usize) -> Value {
    let inputs: Map<String, Value> = (0..width).map(|i| (format!("v{i}"), json!(0))).collect();
    json!({ "in": inputs })
}

fn bench_compute_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_plan");
    for width in [16, 128, 1024] {
        let compiled = IrCache::new()
            .get_or_compile(&wide(width))
            .expect("wide graph compiles");
        let root = compiled
            .ir
            .registry()
            .id(&FieldPath::parse("in.v0").expect("valid path"))
            .expect("registered input");
        let mut scratch = compiled.exec.scratch();

        group.throughput(Throughput::Elements(compiled.ir.steps().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                compiled.exec.compute_plan(
                    black_box(&mut scratch),
                    Scope::All,
                    black_box(&[root]),
                    &[],
                    None,
                )
            });
        });
    }
    group.finish();
}

fn bench_incremental_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_flush");
    for width in [16, 128, 1024] {
        let runtime = Runtime::new(RuntimeConfig::default());
        let key = runtime
            .register_module(&wide(width), "bench", initial(width))
            .expect("instance registers");
        // Cold start runs a full pass; measure the incremental ones.
        runtime.set(&key, "in.v0", json!(1)).expect("write queues");
        runtime.flush_now();

        let mut n = 1i64;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                n += 1;
                runtime.set(&key, "in.v0", json!(n)).expect("write queues");
                black_box(runtime.flush_now())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compute_plan, bench_incremental_flush);
criterion_main!(benches);
