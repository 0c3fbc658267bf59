//! Обнаружение взаимных блокировок через `parking_lot::deadlock`.
//!
//! Видны только ожидания на примитивах `parking_lot`. Каждый цикл
//! `check_deadlock` сообщает один раз, поэтому найденные циклы копятся
//! в общем журнале процесса: любой монитор видит их независимо от того,
//! кто именно опросил `parking_lot` первым.

use super::{errors::Failure, multi::MultiError};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    fmt::Write as _,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct DeadlockRecord {
    pub thread_ids: Vec<ThreadId>,
    pub dump: String,
}

impl DeadlockRecord {
    /// Тот же набор потоков, порядок не важен.
    fn same_cycle(&self, thread_ids: &[ThreadId]) -> bool {
        self.thread_ids.len() == thread_ids.len()
            && thread_ids.iter().all(|id| self.thread_ids.contains(id))
    }
}

static DEADLOCK_LOG: Lazy<Mutex<Vec<DeadlockRecord>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Опрашивает `parking_lot` и возвращает число известных циклов.
fn poll_cycles() -> usize {
    let mut log = DEADLOCK_LOG.lock();
    for cycle in parking_lot::deadlock::check_deadlock() {
        let thread_ids: Vec<ThreadId> = cycle.iter().map(|t| t.thread_id()).collect();
        if log.iter().any(|r| r.same_cycle(&thread_ids)) {
            continue;
        }
        let mut dump = String::new();
        for t in &cycle {
            let _ = write!(dump, "thread {:?}\n{:?}\n", t.thread_id(), t.backtrace());
        }
        log.push(DeadlockRecord { thread_ids, dump });
    }
    log.len()
}

/// Циклы, обнаруженные в процессе к текущему моменту.
pub fn known_deadlocks() -> Vec<DeadlockRecord> {
    poll_cycles();
    DEADLOCK_LOG.lock().clone()
}

/// Фоновый поток, который раз в `interval` ищет новые циклы. При первом
/// новом цикле добавляет `Failure::Deadlock` в `errors` и завершается.
pub struct DeadlockMonitor {
    stop_tx: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
    detected: Arc<AtomicBool>,
}

impl DeadlockMonitor {
    pub fn start(interval: Duration, errors: Arc<MultiError>) -> io::Result<Self> {
        // базовая линия: циклы, существовавшие до старта, не наши
        let baseline = poll_cycles();
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let detected = Arc::new(AtomicBool::new(false));
        let flag = detected.clone();

        let thread = thread::Builder::new()
            .name("stress-monitor".to_string())
            .spawn(move || loop {
                if poll_cycles() > baseline {
                    let fresh: Vec<DeadlockRecord> = DEADLOCK_LOG.lock()[baseline..].to_vec();
                    let threads: Vec<ThreadId> =
                        fresh.iter().flat_map(|r| r.thread_ids.iter().copied()).collect();
                    let dump = fresh.iter().map(|r| r.dump.as_str()).collect::<Vec<_>>().join("\n");
                    tracing::warn!(threads = threads.len(), "deadlock detected");
                    flag.store(true, Ordering::Release);
                    errors.add(Failure::Deadlock { threads, dump });
                    return;
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => return,
                }
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            detected,
        })
    }

    #[inline]
    pub fn has_detected(&self) -> bool {
        self.detected.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Сигнал остановки и join монитора.
    pub fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeadlockMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
