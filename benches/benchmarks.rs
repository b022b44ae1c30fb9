use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use jaxpr_rs::trace::{
    dce_jaxpr, eval_jaxpr, make_jaxpr, partial_eval_jaxpr_custom, trace_to_jaxpr_nounits, AbstractValue, Graph,
    PartialVal, Registry, SavePolicy,
};
use jaxpr_rs::{Array, Config, DType, Value};
use std::sync::Arc;

fn registry() -> Arc<Registry> {
    Arc::new(Registry::new(Config { enable_checks: false, ..Config::default() }))
}

fn vec_aval() -> AbstractValue {
    AbstractValue::array(vec![16], DType::Float32)
}

/// `x, y -> sin(... sin(x) * y ...)` with `n` alternating steps.
fn chain(reg: &Arc<Registry>, n: usize) -> Graph {
    make_jaxpr(
        reg,
        "chain",
        &|t, xs| {
            let mut acc = xs[0].clone();
            for i in 0..n {
                acc = if i % 2 == 0 { t.sin(&acc)? } else { t.mul(&acc, &xs[1])? };
            }
            Ok(vec![acc, t.cos(&xs[0])?])
        },
        &[vec_aval(), vec_aval()],
    )
    .unwrap()
    .jaxpr
}

fn bench_trace(c: &mut Criterion) {
    let reg = registry();
    let x = Array::from_vec((0..16).map(|i| i as f32 * 0.1).collect(), vec![16]);
    let mut group = c.benchmark_group("trace");
    for n in [16, 128, 1024] {
        group.bench_with_input(BenchmarkId::new("make_jaxpr", n), &n, |b, &n| b.iter(|| chain(&reg, black_box(n))));
        group.bench_with_input(BenchmarkId::new("half_known", n), &n, |b, &n| {
            b.iter(|| {
                trace_to_jaxpr_nounits(
                    &reg,
                    "chain",
                    &|t, xs| {
                        let mut acc = xs[0].clone();
                        for _ in 0..n {
                            acc = t.mul(&t.sin(&acc)?, &xs[1])?;
                        }
                        Ok(vec![acc])
                    },
                    &[PartialVal::known(x.clone()), PartialVal::unknown(vec_aval())],
                    &[false],
                )
            })
        });
    }
    group.finish();
}

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("partial_eval");
    for n in [16, 128, 1024] {
        let reg = registry();
        let graph = chain(&reg, n);
        for (name, policy) in [("save", SavePolicy::EverythingSaveable), ("recompute", SavePolicy::NothingSaveable)] {
            group.bench_with_input(BenchmarkId::new(name, n), &graph, |b, graph| {
                b.iter(|| {
                    // Measure the split itself, not the memo table.
                    reg.cache().clear();
                    partial_eval_jaxpr_custom(
                        &reg,
                        black_box(graph),
                        &[true, false],
                        &[true, false],
                        &[false; 2],
                        &[false; 2],
                        &policy,
                    )
                })
            });
        }
        group.bench_with_input(BenchmarkId::new("cached", n), &graph, |b, graph| {
            b.iter(|| {
                partial_eval_jaxpr_custom(
                    &reg,
                    black_box(graph),
                    &[true, false],
                    &[true, false],
                    &[false; 2],
                    &[false; 2],
                    &SavePolicy::default(),
                )
            })
        });
    }
    group.finish();
}

fn bench_dce(c: &mut Criterion) {
    let mut group = c.benchmark_group("dce");
    for n in [16, 128, 1024] {
        let reg = registry();
        let graph = chain(&reg, n);
        group.bench_with_input(BenchmarkId::new("drop_chain", n), &graph, |b, graph| {
            b.iter(|| {
                reg.cache().clear();
                dce_jaxpr(&reg, black_box(graph), &[false, true], &[false, false])
            })
        });
    }
    group.finish();
}

fn bench_eval(c: &mut Criterion) {
    let reg = registry();
    let graph = chain(&reg, 256);
    let args: [Value; 2] = [
        Array::from_vec((0..16).map(|i| i as f32 * 0.1).collect(), vec![16]).into(),
        Array::from_vec(vec![0.9; 16], vec![16]).into(),
    ];
    c.bench_function("eval chain 256", |b| b.iter(|| eval_jaxpr(&reg, black_box(&graph), &[], &args)));
}

criterion_group!(benches, bench_trace, bench_split, bench_dce, bench_eval);
criterion_main!(benches);
