//! Propagation throughput: one write fanning out to many effects, and the
//! shared-registry transaction path.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use ripple_core::{Runtime, SharedRegistry};

fn cell_write_fanout(c: &mut Criterion) {
    let runtime = Runtime::new();
    let cell = runtime.cell(0_i64);

    let mut effects = Vec::new();
    for _ in 0..64 {
        let cell_clone = cell.clone();
        effects.push(runtime.effect(move || {
            black_box(cell_clone.get());
        }));
    }

    let mut next = 0_i64;
    c.bench_function("cell_write_64_effects", |b| {
        b.iter(|| {
            next += 1;
            cell.set(next);
        })
    });

    drop(effects);
}

fn registry_transaction_increment(c: &mut Criterion) {
    let runtime = Runtime::new();
    let registry: SharedRegistry<i64> = runtime.registry();
    registry.put("count", 0);

    c.bench_function("registry_transaction_increment", |b| {
        b.iter(|| {
            registry.transaction(|txn| {
                let current = *txn.get("count").unwrap();
                txn.put("count", current + 1);
            });
        })
    });
}

criterion_group!(benches, cell_write_fanout, registry_transaction_increment);
criterion_main!(benches);
