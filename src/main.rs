use parallel_toolbox::{Action, StressTester, Task, TaskGroup, WorkerPool};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pool = WorkerPool::global();
    let counter = Arc::new(AtomicUsize::new(0));

    let now = Instant::now();
    let mut root = TaskGroup::new("root");
    for g in 0..8 {
        let mut group = TaskGroup::new(format!("group-{g}"));
        for t in 0..16 {
            let counter = counter.clone();
            group.push(Task::from_fn(format!("group-{g}/task-{t}"), move || {
                std::thread::sleep(Duration::from_millis(2));
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }
        root.push(group);
    }
    match root.run_on(pool) {
        Ok(()) => tracing::info!(
            tasks = counter.load(Ordering::Relaxed),
            elapsed = ?now.elapsed(),
            parallelism = pool.parallelism(),
            "task groups finished"
        ),
        Err(failure) => tracing::error!(%failure, "task groups failed"),
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let action_hits = hits.clone();
    let now = Instant::now();
    let result = StressTester::new()
        .threads(16)
        .rounds_per_thread(10_000)
        .add(Action::from_fn("increment", move || {
            action_hits.fetch_add(1, Ordering::Relaxed);
        }))
        .run();
    match result {
        Ok(()) => tracing::info!(
            invocations = hits.load(Ordering::Relaxed),
            elapsed = ?now.elapsed(),
            "stress run finished"
        ),
        Err(failure) => tracing::error!(%failure, "stress run failed"),
    }
}
