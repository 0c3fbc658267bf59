use super::{
    errors::{Failure, TaskResult},
    model::Task,
    pool::PoolStats,
};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

const PENDING: u8 = 0;
const SUBMITTED: u8 = 1;
const RUNNING: u8 = 2;
const DONE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Submitted,
    Running,
    Done,
}

/// Обёртка над выполнением задачи.
///
/// Переход в `Running` делается одним CAS, поэтому задачу исполняет ровно
/// один поток: либо воркер пула, либо тот, кто её join-ит ("кража").
pub(crate) struct ScheduledItem {
    state: AtomicU8,
    task: Mutex<Option<Task>>,
    result: Mutex<Option<TaskResult>>,
    done: Condvar,
    cancel_token: CancellationToken,
    stats: Arc<PoolStats>,
}

impl ScheduledItem {
    pub(crate) fn new(task: Task, stats: Arc<PoolStats>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            task: Mutex::new(Some(task)),
            result: Mutex::new(None),
            done: Condvar::new(),
            cancel_token: CancellationToken::new(),
            stats,
        })
    }

    pub(crate) fn mark_submitted(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, SUBMITTED, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn state(&self) -> ItemState {
        match self.state.load(Ordering::Acquire) {
            PENDING => ItemState::Pending,
            SUBMITTED => ItemState::Submitted,
            RUNNING => ItemState::Running,
            _ => ItemState::Done,
        }
    }

    #[inline]
    fn claim(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < RUNNING).then_some(RUNNING)
            })
            .is_ok()
    }

    /// Выполнить задачу, если её ещё никто не начал. Возвращает `true`,
    /// если выполнение произошло в текущем потоке.
    pub(crate) fn try_execute(&self) -> bool {
        if !self.claim() {
            return false;
        }
        let task = self.task.lock().take();
        let result = match task {
            Some(_) if self.cancel_token.is_cancelled() => Err(Failure::Cancelled),
            Some(task) => {
                tracing::trace!(task = task.description(), "running scheduled item");
                task.run()
            }
            None => Err(Failure::Cancelled),
        };
        self.stats.record(result.is_ok());
        self.complete(result);
        true
    }

    /// Отменяет и сразу завершает задачу, если она ещё не стартовала.
    pub(crate) fn abort(&self) {
        self.cancel_token.cancel();
        self.try_execute();
    }

    fn complete(&self, result: TaskResult) {
        let mut slot = self.result.lock();
        *slot = Some(result);
        self.state.store(DONE, Ordering::Release);
        self.done.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.state.load(Ordering::Acquire) == DONE {
            return true;
        }
        let mut slot = self.result.lock();
        if slot.is_none() {
            let _ = self.done.wait_for(&mut slot, timeout);
        }
        slot.is_some()
    }

    fn wait(&self) {
        let mut slot = self.result.lock();
        while slot.is_none() {
            self.done.wait(&mut slot);
        }
    }

    fn take_result(&self) -> TaskResult {
        self.result.lock().take().unwrap_or(Err(Failure::Cancelled))
    }
}

/// Handle на запланированную задачу с поддержкой отмены, кражи и ожидания.
pub struct JoinHandle {
    item: Arc<ScheduledItem>,
}

impl JoinHandle {
    pub(crate) fn new(item: Arc<ScheduledItem>) -> Self {
        Self { item }
    }

    #[inline]
    pub fn cancel(&self) {
        self.item.cancel_token.cancel();
    }

    /// Отмена с немедленным завершением, если задача ещё в очереди.
    pub(crate) fn abort(&self) {
        self.item.abort();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.item.cancel_token.is_cancelled()
    }

    #[inline]
    pub fn state(&self) -> ItemState {
        self.item.state()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.item.state() == ItemState::Done
    }

    /// Выполнить задачу в текущем потоке, если она ещё не стартовала.
    pub fn try_run_inline(&self) -> bool {
        let ran = self.item.try_execute();
        if ran {
            self.item.stats.record_steal();
        }
        ran
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.item.wait_timeout(timeout)
    }

    /// Блокирующее ожидание без кражи работы.
    pub fn wait(self) -> TaskResult {
        self.item.wait();
        self.item.take_result()
    }

    /// Если задача ещё ждёт в очереди, она выполняется здесь же;
    /// иначе ждём воркер, который её уже взял.
    pub fn join(self) -> TaskResult {
        self.try_run_inline();
        self.wait()
    }
}

impl std::fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn item(task: Task) -> Arc<ScheduledItem> {
        ScheduledItem::new(task, Arc::new(PoolStats::default()))
    }

    #[test]
    fn join_runs_pending_item_inline() {
        let it = item(Task::from_fn("inline", || {}));
        it.mark_submitted();
        let handle = JoinHandle::new(it.clone());
        assert_eq!(handle.state(), ItemState::Submitted);
        assert!(handle.join().is_ok());
        assert_eq!(it.state(), ItemState::Done);
        assert!(!it.try_execute(), "item must run only once");
        assert_eq!(it.stats.snapshot().stolen, 1);
    }

    #[test]
    fn cancelled_item_never_runs() {
        let it = item(Task::from_fn("never", || panic!("must not run")));
        let handle = JoinHandle::new(it);
        handle.cancel();
        assert!(matches!(handle.join(), Err(Failure::Cancelled)));
    }

    #[test]
    fn waiter_observes_result_from_other_thread() {
        let it = item(Task::new("fails", || Err::<(), _>("nope")));
        it.mark_submitted();
        let handle = JoinHandle::new(it.clone());
        assert!(!handle.wait_timeout(Duration::from_millis(10)));

        let worker = thread::spawn(move || it.try_execute());
        assert!(worker.join().unwrap());
        let err = handle.wait().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn panic_is_captured_as_failure() {
        let it = item(Task::from_fn("explodes", || panic!("kaboom")));
        let err = JoinHandle::new(it).join().unwrap_err();
        match err {
            Failure::Panic { description, message } => {
                assert_eq!(description, "explodes");
                assert_eq!(message, "kaboom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
