use super::{
    deadlock::DeadlockMonitor,
    errors::{ConfigError, Failure, TaskResult},
    model::Action,
    multi::MultiError,
};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    thread,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_THREAD_COUNT: usize = 100;
pub const DEFAULT_ROUNDS_PER_THREAD: usize = 1000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_JOIN_SLICE: Duration = Duration::from_millis(100);

/// Параметры стресс-прогона
#[derive(Debug, Clone)]
pub struct StressConfig {
    pub thread_count: usize,
    pub rounds_per_thread: usize,
    pub actions: Vec<Action>,
    /// Период опроса монитора взаимных блокировок.
    pub poll_interval: Duration,
    /// Квант ожидания воркеров вызывающим потоком.
    pub join_slice: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            rounds_per_thread: DEFAULT_ROUNDS_PER_THREAD,
            actions: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            join_slice: DEFAULT_JOIN_SLICE,
        }
    }
}

impl StressConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count <= 1 {
            return Err(ConfigError::InvalidThreadCount(self.thread_count));
        }
        if self.rounds_per_thread == 0 {
            return Err(ConfigError::InvalidRounds(self.rounds_per_thread));
        }
        if self.actions.len() > self.thread_count {
            return Err(ConfigError::TooManyActions {
                actions: self.actions.len(),
                threads: self.thread_count,
            });
        }
        if self.actions.is_empty() {
            return Err(ConfigError::NoActions);
        }
        if self.poll_interval.is_zero() || self.join_slice.is_zero() {
            return Err(ConfigError::InvalidInterval);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum GateState {
    Closed,
    Open,
    Aborted,
}

/// Стартовый барьер: воркеры ждут, пока не будут запущены все.
struct StartGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl StartGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Closed),
            cond: Condvar::new(),
        }
    }

    fn release(&self, to: GateState) {
        *self.state.lock() = to;
        self.cond.notify_all();
    }

    /// `false`, если прогон отменён до старта.
    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while *state == GateState::Closed {
            self.cond.wait(&mut state);
        }
        *state == GateState::Open
    }
}

struct DoneSignal {
    tx: Sender<usize>,
    index: usize,
}

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.tx.send(self.index);
    }
}

/// Гоняет одно или несколько действий во множестве выделенных потоков.
///
/// ```ignore
/// StressTester::new()
///     .threads(8)
///     .rounds_per_thread(500)
///     .add(Action::from_fn("increment", move || { counter.fetch_add(1, Ordering::Relaxed); }))
///     .run()?;
/// ```
///
/// Все ошибки потоков собираются в [`MultiError`]. Если во время прогона
/// появляется взаимная блокировка, `run` возвращает `Failure::Deadlock`
/// вместо того, чтобы зависнуть.
///
/// Обнаруживаются только циклы на примитивах `parking_lot`. Цикл на
/// `std::sync::Mutex` монитор не видит, и `run` будет ждать такие потоки
/// бесконечно: таймаута на раунд нет.
#[derive(Debug, Default)]
pub struct StressTester {
    config: StressConfig,
    interrupt: CancellationToken,
}

impl StressTester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: StressConfig) -> Self {
        Self {
            config,
            interrupt: CancellationToken::new(),
        }
    }

    pub fn threads(mut self, thread_count: usize) -> Self {
        self.config.thread_count = thread_count;
        self
    }

    pub fn rounds_per_thread(mut self, rounds: usize) -> Self {
        self.config.rounds_per_thread = rounds;
        self
    }

    pub fn add(mut self, action: Action) -> Self {
        self.config.actions.push(action);
        self
    }

    pub fn add_all(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.config.actions.extend(actions);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    #[inline]
    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    /// Токен прерывания. После отмены тестер остаётся прерванным.
    pub fn interrupter(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Блокирует до завершения всех воркеров или обнаружения взаимной блокировки.
    pub fn run(&self) -> TaskResult {
        self.config.validate()?;
        let config = &self.config;
        tracing::debug!(
            threads = config.thread_count,
            rounds = config.rounds_per_thread,
            actions = config.actions.len(),
            "starting stress run"
        );

        let errors = Arc::new(MultiError::new());
        let mut monitor = DeadlockMonitor::start(config.poll_interval, errors.clone())
            .map_err(|e| Failure::action("start deadlock monitor", e))?;

        let gate = Arc::new(StartGate::new());
        let (done_tx, done_rx) = channel::unbounded::<usize>();
        let mut workers = Vec::with_capacity(config.thread_count);
        let mut aborted = false;

        for index in 0..config.thread_count {
            let action = config.actions[index % config.actions.len()].clone();
            let rounds = config.rounds_per_thread;
            let worker_errors = errors.clone();
            let worker_gate = gate.clone();
            let interrupt = self.interrupt.clone();
            let signal = DoneSignal {
                tx: done_tx.clone(),
                index,
            };
            let spawned = thread::Builder::new()
                .name(format!("stress-worker-{}", index + 1))
                .spawn(move || {
                    let _signal = signal;
                    if !worker_gate.wait() {
                        return;
                    }
                    for _ in 0..rounds {
                        if interrupt.is_cancelled() {
                            return;
                        }
                        if let Err(failure) = action.run() {
                            worker_errors.add(failure);
                            return;
                        }
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    errors.add(Failure::action("spawn stress worker", err));
                    gate.release(GateState::Aborted);
                    aborted = true;
                    break;
                }
            }
        }
        drop(done_tx);
        if !aborted {
            gate.release(GateState::Open);
        }

        let spawned = workers.len();
        let mut signalled = vec![false; spawned];
        let mut remaining = spawned;
        let mut interrupted = false;
        while remaining > 0 {
            if !interrupted && self.interrupt.is_cancelled() {
                // воркеры проверяют токен между раундами, ждать не дольше раунда
                tracing::warn!(remaining, "stress run interrupted, waiting for workers to stop");
                interrupted = true;
            }
            if monitor.has_detected() {
                // заблокированные воркеры больше не ждём
                tracing::warn!(remaining, "abandoning deadlocked workers");
                break;
            }
            match done_rx.recv_timeout(config.join_slice) {
                Ok(index) if index < spawned => {
                    signalled[index] = true;
                    remaining -= 1;
                }
                // сигнал от потока, который так и не запустился
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let deadlocked = monitor.has_detected();
        monitor.stop();

        for (index, worker) in workers.into_iter().enumerate() {
            if !deadlocked || signalled[index] || worker.is_finished() {
                let _ = worker.join();
            }
        }
        if interrupted {
            return Err(Failure::Interrupted("stress workers"));
        }
        tracing::debug!(failures = errors.len(), "stress run finished");
        errors.throw_if_not_empty()
    }
}
