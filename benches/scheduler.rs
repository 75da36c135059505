//! Task graph analyzer benchmarks.
//!
//! Measures `graph::analyze` and `graph::worker_batches` over backlogs of
//! varying size and dependency shape.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench scheduler
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use ralph_core::graph;
use ralph_core::model::types::{Task, TaskId, TaskStatus};

fn task(id: &str, deps: &[&str]) -> Task {
    Task {
        id: TaskId::new(id).unwrap(),
        title: format!("Task {id}"),
        description: String::new(),
        status: TaskStatus::Open,
        priority: 0,
        depends_on: deps.iter().map(|d| TaskId::new(*d).unwrap()).collect(),
        labels: Vec::new(),
        task_type: None,
        epic: None,
    }
}

/// A chain of `n` tasks, each depending on the previous one — the worst
/// case for grouping, since every task lands in its own group.
fn chain(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| {
            let id = i.to_string();
            let deps: Vec<String> = if i == 0 { Vec::new() } else { vec![(i - 1).to_string()] };
            task(&id, &deps.iter().map(String::as_str).collect::<Vec<_>>())
        })
        .collect()
}

/// `n` independent tasks — the best case, everything lands in one group.
fn fan_out(n: usize) -> Vec<Task> {
    (0..n).map(|i| task(&i.to_string(), &[])).collect()
}

fn bench_analyze(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_analyze");
    for size in [10, 100, 1_000] {
        let chained = chain(size);
        let fanned = fan_out(size);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("chain", size), &chained, |b, tasks| {
            b.iter(|| graph::analyze(tasks));
        });
        group.bench_with_input(BenchmarkId::new("fan_out", size), &fanned, |b, tasks| {
            b.iter(|| graph::analyze(tasks));
        });
    }
    group.finish();
}

fn bench_worker_batches(c: &mut Criterion) {
    let tasks = fan_out(1_000);
    let graph = graph::analyze(&tasks);
    let group_zero = &graph.groups[0];

    c.bench_function("worker_batches_1000_tasks_8_workers", |b| {
        b.iter(|| graph::worker_batches(group_zero, &graph.nodes, 8));
    });
}

criterion_group!(benches, bench_analyze, bench_worker_batches);
criterion_main!(benches);
