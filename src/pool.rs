use super::{
    errors::ConfigError,
    handle::{JoinHandle, ScheduledItem},
    model::{PoolMetrics, Task},
};
use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Переменная окружения с желаемым параллелизмом пула.
pub const PARALLELISM_ENV: &str = "MAX_PARALLEL_TASK_THREADS";

const MIN_PARALLELISM: usize = 2;

/// Конфигурация пула потоков
#[derive(Debug, Clone)]
pub struct Config {
    pub parallelism: usize,
    pub thread_name_prefix: String,
    /// Сколько спящий воркер ждёт уведомления, прежде чем перепроверить очереди.
    pub idle_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallelism: MIN_PARALLELISM.max(num_cpus::get()),
            thread_name_prefix: "parallel-worker".to_string(),
            idle_wait: Duration::from_millis(50),
        }
    }
}

impl Config {
    pub fn with_parallelism(parallelism: usize) -> Self {
        Self {
            parallelism: MIN_PARALLELISM.max(parallelism),
            ..Default::default()
        }
    }

    /// `max(2, $MAX_PARALLEL_TASK_THREADS)`, либо `max(2, число ядер)`,
    /// если переменная не задана или не парсится.
    pub fn from_env() -> Self {
        let configured = std::env::var(PARALLELISM_ENV).ok();
        Self {
            parallelism: parallelism_from(configured.as_deref()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism < MIN_PARALLELISM {
            return Err(ConfigError::InvalidParallelism(self.parallelism));
        }
        if self.idle_wait.is_zero() {
            return Err(ConfigError::InvalidInterval);
        }
        Ok(())
    }
}

pub(crate) fn parallelism_from(configured: Option<&str>) -> usize {
    configured
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get)
        .max(MIN_PARALLELISM)
}

#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    stolen: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StatsSnapshot {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub stolen: usize,
}

impl PoolStats {
    #[inline]
    pub(crate) fn record(&self, ok: bool) {
        if ok {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_steal(&self) {
        self.stolen.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
        }
    }
}

/// Фабрика потоков, которая отказывается расти выше `parallelism`.
/// Очередь при этом не ограничена: лишние задачи ждут, а не плодят потоки.
struct ThreadFactory {
    parallelism: usize,
    live: AtomicUsize,
    spawned: AtomicUsize,
}

impl ThreadFactory {
    fn new(parallelism: usize) -> Self {
        Self {
            parallelism,
            live: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Резервирует слот под новый поток; `None`, если предел достигнут.
    fn try_reserve(&self) -> Option<usize> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.parallelism).then_some(live + 1)
            })
            .ok()
            .map(|_| self.spawned.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

type Job = Arc<ScheduledItem>;

struct WorkerContext {
    pool_id: usize,
    local: Worker<Job>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);
static GLOBAL_POOL: OnceCell<WorkerPool> = OnceCell::new();

struct PoolInner {
    id: usize,
    config: Config,
    inject: Injector<Job>,
    stealers: RwLock<Vec<Stealer<Job>>>,
    factory: ThreadFactory,
    idle_workers: AtomicUsize,
    queued_tasks: AtomicUsize,
    sleep_lock: Mutex<()>,
    wake: Condvar,
    cancellation_token: CancellationToken,
    stats: Arc<PoolStats>,
}

/// Последний клон [`WorkerPool`] останавливает воркеры: сами они держат
/// только `PoolInner` и иначе жили бы до конца процесса.
struct PoolOwner {
    inner: Arc<PoolInner>,
}

impl Drop for PoolOwner {
    fn drop(&mut self) {
        if !self.inner.cancellation_token.is_cancelled() {
            tracing::debug!(pool = self.inner.id, "last pool handle dropped");
            self.inner.stop();
        }
    }
}

/// Пул с ограниченным параллелизмом. Потоки создаются лениво, по мере
/// появления работы, и не больше `parallelism` одновременно.
///
/// Когда отбрасывается последний клон, пул останавливается так же, как
/// после [`WorkerPool::shutdown`].
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    _owner: Arc<PoolOwner>,
}

impl WorkerPool {
    pub fn new(parallelism: usize) -> Self {
        Self::with_config(Config::with_parallelism(parallelism))
    }

    pub fn with_config(mut config: Config) -> Self {
        config.parallelism = config.parallelism.max(MIN_PARALLELISM);
        if config.idle_wait.is_zero() {
            config.idle_wait = Config::default().idle_wait;
        }
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pool = id, parallelism = config.parallelism, "creating worker pool");
        let inner = Arc::new(PoolInner {
            id,
            factory: ThreadFactory::new(config.parallelism),
            config,
            inject: Injector::new(),
            stealers: RwLock::new(Vec::new()),
            idle_workers: AtomicUsize::new(0),
            queued_tasks: AtomicUsize::new(0),
            sleep_lock: Mutex::new(()),
            wake: Condvar::new(),
            cancellation_token: CancellationToken::new(),
            stats: Arc::new(PoolStats::default()),
        });
        Self {
            _owner: Arc::new(PoolOwner { inner: inner.clone() }),
            inner,
        }
    }

    /// Общий пул процесса. Создаётся один раз при первом обращении.
    pub fn global() -> &'static WorkerPool {
        GLOBAL_POOL.get_or_init(|| WorkerPool::with_config(Config::from_env()))
    }

    /// Устанавливает общий пул до первого обращения к [`WorkerPool::global`].
    pub fn init_global(config: Config) -> Result<&'static WorkerPool, ConfigError> {
        config.validate()?;
        let mut created = false;
        let pool = GLOBAL_POOL.get_or_init(|| {
            created = true;
            WorkerPool::with_config(config)
        });
        if created {
            Ok(pool)
        } else {
            Err(ConfigError::GlobalPoolInitialized)
        }
    }

    #[inline]
    pub fn parallelism(&self) -> usize {
        self.inner.config.parallelism
    }

    /// Текущий поток является воркером именно этого пула.
    pub fn currently_in_pool(&self) -> bool {
        CURRENT_WORKER.with(|c| {
            c.borrow()
                .as_ref()
                .is_some_and(|ctx| ctx.pool_id == self.inner.id)
        })
    }

    /// Ставит задачу в общую очередь пула.
    pub fn submit(&self, task: Task) -> JoinHandle {
        let item = self.prepare(task);
        self.push_global(item.clone());
        JoinHandle::new(item)
    }

    /// Ставит задачу в локальную очередь текущего воркера. Вызов вне
    /// воркера этого пула равносилен [`WorkerPool::submit`].
    pub fn fork(&self, task: Task) -> JoinHandle {
        let item = self.prepare(task);
        let pushed = CURRENT_WORKER.with(|c| match c.borrow().as_ref() {
            Some(ctx) if ctx.pool_id == self.inner.id => {
                ctx.local.push(item.clone());
                true
            }
            _ => false,
        });
        if pushed {
            self.inner.queued_tasks.fetch_add(1, Ordering::Relaxed);
            self.wake_or_grow();
        } else {
            tracing::debug!(pool = self.inner.id, "fork outside of pool, submitting instead");
            self.push_global(item.clone());
        }
        JoinHandle::new(item)
    }

    fn prepare(&self, task: Task) -> Job {
        tracing::trace!(pool = self.inner.id, task = task.description(), "scheduling");
        let item = ScheduledItem::new(task, self.inner.stats.clone());
        item.mark_submitted();
        self.inner.stats.record_submit();
        item
    }

    #[inline]
    fn push_global(&self, item: Job) {
        if self.inner.cancellation_token.is_cancelled() {
            item.abort();
            return;
        }
        self.inner.queued_tasks.fetch_add(1, Ordering::Relaxed);
        self.inner.inject.push(item);
        if self.inner.cancellation_token.is_cancelled() {
            // shutdown мог вычистить очередь между проверкой и push
            self.inner.abort_queued();
            return;
        }
        self.wake_or_grow();
    }

    fn wake_or_grow(&self) {
        if self.inner.idle_workers.load(Ordering::SeqCst) > 0 {
            let _guard = self.inner.sleep_lock.lock();
            self.inner.wake.notify_one();
        } else {
            self.try_spawn_worker();
        }
    }

    fn try_spawn_worker(&self) {
        let Some(index) = self.inner.factory.try_reserve() else {
            return;
        };
        let inner = self.inner.clone();
        let name = format!("{}-{}", inner.config.thread_name_prefix, index);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || inner.worker_loop(index));
        match spawned {
            Ok(_) => tracing::debug!(pool = self.inner.id, worker = %name, "worker started"),
            Err(err) => {
                self.inner.factory.release();
                tracing::warn!(pool = self.inner.id, error = %err, "failed to start worker");
            }
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        let stats = self.inner.stats.snapshot();
        PoolMetrics {
            parallelism: self.inner.config.parallelism,
            live_workers: self.inner.factory.live(),
            idle_workers: self.inner.idle_workers.load(Ordering::Relaxed),
            queued_tasks: self.inner.queued_tasks.load(Ordering::Relaxed),
            total_submitted: stats.submitted,
            completed_tasks: stats.completed,
            failed_tasks: stats.failed,
            stolen_tasks: stats.stolen,
        }
    }

    /// Останавливает воркеры; задачи, которые так и не стартовали,
    /// завершаются как `Failure::Cancelled`. Общий пул не останавливается.
    pub fn shutdown(&self) {
        if GLOBAL_POOL
            .get()
            .is_some_and(|g| Arc::ptr_eq(&g.inner, &self.inner))
        {
            tracing::warn!("refusing to shut down the global worker pool");
            return;
        }
        self.inner.stop();
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.inner.cancellation_token.is_cancelled()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.inner.id)
            .field("parallelism", &self.inner.config.parallelism)
            .field("live_workers", &self.inner.factory.live())
            .finish()
    }
}

impl PoolInner {
    fn stop(&self) {
        self.cancellation_token.cancel();
        {
            let _guard = self.sleep_lock.lock();
            self.wake.notify_all();
        }
        self.abort_queued();
        tracing::debug!(pool = self.id, "worker pool shut down");
    }

    fn abort_queued(&self) {
        while let Some(job) = self.steal_global() {
            self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
            job.abort();
        }
    }

    fn worker_loop(self: Arc<Self>, index: usize) {
        let local = Worker::new_lifo();
        self.stealers.write().push(local.stealer());
        CURRENT_WORKER.with(|c| {
            *c.borrow_mut() = Some(WorkerContext {
                pool_id: self.id,
                local,
            })
        });

        let mut fast_random_state = (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;

        while !self.cancellation_token.is_cancelled() {
            match self.find_job(&mut fast_random_state) {
                Some(job) => {
                    self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
                    // false: задачу уже украл тот, кто её join-ит
                    job.try_execute();
                }
                None => self.park(),
            }
        }

        if let Some(ctx) = CURRENT_WORKER.with(|c| c.borrow_mut().take()) {
            while let Some(job) = ctx.local.pop() {
                self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
                job.abort();
            }
        }
        self.factory.release();
        tracing::debug!(pool = self.id, worker = index, "worker stopped");
    }

    fn find_job(&self, fast_random_state: &mut u64) -> Option<Job> {
        CURRENT_WORKER
            .with(|c| c.borrow().as_ref().and_then(|ctx| ctx.local.pop()))
            .or_else(|| self.steal_global())
            .or_else(|| {
                let stealers = self.stealers.read();
                let n = stealers.len();
                if n == 0 {
                    return None;
                }
                *fast_random_state ^= *fast_random_state << 13;
                *fast_random_state ^= *fast_random_state >> 7;
                *fast_random_state ^= *fast_random_state << 17;
                let start = (*fast_random_state as usize) % n;
                let stolen = (0..n).find_map(|i| steal_retrying(|| stealers[(start + i) % n].steal()));
                stolen
            })
    }

    fn steal_global(&self) -> Option<Job> {
        steal_retrying(|| self.inject.steal())
    }

    fn has_work(&self) -> bool {
        !self.inject.is_empty() || self.stealers.read().iter().any(|s| !s.is_empty())
    }

    fn park(&self) {
        let mut guard = self.sleep_lock.lock();
        self.idle_workers.fetch_add(1, Ordering::SeqCst);
        if !self.has_work() && !self.cancellation_token.is_cancelled() {
            let _ = self.wake.wait_for(&mut guard, self.config.idle_wait);
        }
        self.idle_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

fn steal_retrying(mut steal: impl FnMut() -> Steal<Job>) -> Option<Job> {
    std::iter::repeat_with(&mut steal)
        .find(|s| !s.is_retry())
        .and_then(Steal::success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn parallelism_is_at_least_two() {
        assert_eq!(parallelism_from(Some("1")), 2);
        assert_eq!(parallelism_from(Some("0")), 2);
        assert_eq!(parallelism_from(Some(" 7 ")), 7);
        assert_eq!(parallelism_from(Some("lots")), num_cpus::get().max(2));
        assert_eq!(parallelism_from(None), num_cpus::get().max(2));
        assert_eq!(Config::with_parallelism(1).parallelism, 2);
    }

    #[test]
    fn factory_never_exceeds_parallelism() {
        let factory = ThreadFactory::new(3);
        let reserved: Vec<_> = (0..10).filter_map(|_| factory.try_reserve()).collect();
        assert_eq!(reserved, vec![1, 2, 3]);
        assert_eq!(factory.live(), 3);
        factory.release();
        assert!(factory.try_reserve().is_some());
        assert!(factory.try_reserve().is_none());
    }

    #[test]
    fn submit_runs_on_worker_thread() {
        let pool = WorkerPool::new(2);
        assert!(!pool.currently_in_pool());
        let probe = pool.clone();
        let inside = Arc::new(AtomicBool::new(false));
        let flag = inside.clone();
        let handle = pool.submit(Task::from_fn("probe", move || {
            flag.store(probe.currently_in_pool(), Ordering::SeqCst);
        }));
        assert!(handle.wait().is_ok());
        assert!(inside.load(Ordering::SeqCst));
        pool.shutdown();
    }

    #[test]
    fn shutdown_cancels_queued_items() {
        let pool = WorkerPool::new(2);
        pool.shutdown();
        let handle = pool.submit(Task::from_fn("late", || {}));
        assert!(matches!(handle.wait(), Err(crate::errors::Failure::Cancelled)));
    }

    #[test]
    fn push_after_concurrent_shutdown_never_strands_item() {
        for _ in 0..200 {
            let pool = WorkerPool::new(2);
            let stopper = pool.clone();
            let shutdown = thread::spawn(move || stopper.shutdown());
            let handles: Vec<_> = (0..20).map(|_| pool.submit(Task::from_fn("racing", || {}))).collect();
            shutdown.join().unwrap();
            for handle in handles {
                assert!(handle.wait_timeout(Duration::from_secs(5)), "item left in a stopped queue");
            }
            assert_eq!(pool.metrics().queued_tasks, 0);
        }
    }

    #[test]
    fn dropping_last_handle_stops_workers() {
        let pool = WorkerPool::new(2);
        let handle = pool.submit(Task::from_fn("warm up", || {}));
        assert!(handle.wait().is_ok());
        let inner = pool.inner.clone();
        let clone = pool.clone();
        drop(pool);
        assert!(!inner.cancellation_token.is_cancelled(), "клон ещё жив");
        drop(clone);
        assert!(inner.cancellation_token.is_cancelled());

        let started = std::time::Instant::now();
        while inner.factory.live() > 0 {
            assert!(started.elapsed() < Duration::from_secs(5), "workers still alive");
            thread::sleep(Duration::from_millis(10));
        }
    }
}
