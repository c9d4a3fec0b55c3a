//! Emission throughput benchmarks.
//!
//! Compares the serialized emission workflow (full precondition checks,
//! staged commit, audit) against a naive unserialized counter bump, to keep an
//! eye on what the correctness machinery costs per emission.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use numera_core::{CustomerId, SaleId};
use numera_infra::audit::InMemoryAuditSink;
use numera_infra::emission::{InMemoryEmission, InvoiceEmission, NewSeries, SeriesAdmin};
use numera_infra::sale_store::InMemorySaleStore;
use numera_invoicing::DocumentType;
use numera_sales::Sale;

/// Naive baseline: a bare atomic counter with none of the workflow's checks.
struct NaiveCounter {
    next_number: AtomicI64,
}

impl NaiveCounter {
    fn new(start: i64) -> Self {
        Self {
            next_number: AtomicI64::new(start),
        }
    }

    fn allocate(&self) -> i64 {
        self.next_number.fetch_add(1, Ordering::SeqCst)
    }
}

fn bench_emission(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("tokio runtime");

    let mut group = c.benchmark_group("emission");
    for batch in [10u64, 100, 1000] {
        group.throughput(Throughput::Elements(batch));

        group.bench_with_input(BenchmarkId::new("workflow", batch), &batch, |b, &batch| {
            b.iter(|| {
                rt.block_on(async {
                    let sales = Arc::new(InMemorySaleStore::new());
                    let audit = Arc::new(InMemoryAuditSink::new());
                    let emission = InMemoryEmission::new(sales.clone(), audit);
                    emission
                        .create_series(
                            NewSeries::new(1, DocumentType::new("FA").unwrap(), true, 1).unwrap(),
                        )
                        .await
                        .unwrap();

                    for sale_id in 1..=batch as i64 {
                        sales.insert(Sale::new(SaleId::new(sale_id), 1_000).unwrap());
                        emission
                            .emit(SaleId::new(sale_id), CustomerId::new(1))
                            .await
                            .unwrap();
                    }
                })
            })
        });

        group.bench_with_input(
            BenchmarkId::new("naive_counter", batch),
            &batch,
            |b, &batch| {
                b.iter(|| {
                    let counter = NaiveCounter::new(1);
                    let mut last = 0;
                    for _ in 0..batch {
                        last = counter.allocate();
                    }
                    last
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_emission);
criterion_main!(benches);
