use super::{
    errors::{Failure, TaskResult},
    handle::JoinHandle,
    model::{Task, TaskGroup, TaskNode},
    multi::MultiError,
    pool::WorkerPool,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const JOIN_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Collecting,
    Draining,
    Done,
}

/// Планировщик одной группы: дочерние задачи идут параллельно через пул,
/// а вызывающий поток синхронно ждёт их всех в [`Scheduler::finished`].
///
/// Последняя запланированная задача не отправляется сразу. Внутри пула
/// `finished` выполняет её сам, а остальные handle join-ит в обратном
/// порядке, забирая себе ещё не начатые. Так насыщенный пул, где каждый
/// воркер ждёт вложенную группу, всё равно продвигается вперёд.
pub struct Scheduler {
    pool: WorkerPool,
    pending: Vec<JoinHandle>,
    last: Option<Task>,
    state: SchedulerState,
    interrupt: Option<CancellationToken>,
}

impl Scheduler {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            pending: Vec::new(),
            last: None,
            state: SchedulerState::Collecting,
            interrupt: None,
        }
    }

    /// Планировщик поверх общего пула процесса.
    pub fn global() -> Self {
        Self::new(WorkerPool::global().clone())
    }

    /// Отмена токена во время `finished` прерывает ожидание.
    pub fn with_interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = Some(token);
        self
    }

    #[inline]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    #[inline]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// После `finished` задачи больше не принимаются и отбрасываются.
    pub fn schedule(&mut self, task: Task) {
        if self.state != SchedulerState::Collecting {
            tracing::warn!(task = task.description(), state = ?self.state, "schedule() after finished(), task dropped");
            return;
        }
        if let Some(previous) = self.last.replace(task) {
            let handle = if self.pool.currently_in_pool() {
                self.pool.fork(previous)
            } else {
                self.pool.submit(previous)
            };
            self.pending.push(handle);
        }
    }

    /// Ждёт завершения всех задач и возвращает агрегированную ошибку.
    pub fn finished(&mut self) -> TaskResult {
        self.state = SchedulerState::Draining;
        let errors = MultiError::new();
        let in_pool = self.pool.currently_in_pool();
        tracing::debug!(pending = self.pending.len() + self.last.is_some() as usize, in_pool, "draining");

        if let Some(last) = self.last.take() {
            if in_pool {
                errors.add_result(last.run());
            } else {
                // вне пула всё выполняется только воркерами
                self.pending.push(self.pool.submit(last));
            }
        }

        let drained = self.drain(&errors, in_pool);
        self.state = SchedulerState::Done;
        drained?;
        errors.throw_if_not_empty()
    }

    fn drain(&mut self, errors: &MultiError, in_pool: bool) -> TaskResult {
        while let Some(handle) = self.pending.pop() {
            if in_pool {
                handle.try_run_inline();
            }
            while !handle.wait_timeout(JOIN_SLICE) {
                if self.is_interrupted() {
                    self.pending.push(handle);
                    self.cancel_outstanding();
                    return Err(Failure::Interrupted("scheduled tasks"));
                }
            }
            errors.add_result(handle.wait());
        }
        Ok(())
    }

    #[inline]
    fn is_interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Не начатые задачи отменяются, уже работающие дожидаемся,
    /// чтобы они не протекли в следующие операции.
    fn cancel_outstanding(&mut self) {
        tracing::warn!(outstanding = self.pending.len(), "interrupted, cancelling scheduled tasks");
        for handle in &self.pending {
            handle.abort();
        }
        for handle in self.pending.drain(..) {
            if let Err(failure) = handle.wait() {
                if !matches!(failure, Failure::Cancelled) {
                    tracing::debug!(%failure, "task failed after interruption");
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(outstanding = self.pending.len(), "scheduler dropped before finished()");
            for handle in &self.pending {
                handle.abort();
            }
        }
    }
}

impl TaskGroup {
    /// Выполняет группу на общем пуле процесса.
    pub fn run(self) -> TaskResult {
        self.run_on(WorkerPool::global())
    }

    pub fn run_on(self, pool: &WorkerPool) -> TaskResult {
        run_group(self, pool, None)
    }

    pub fn run_with_interrupt(self, pool: &WorkerPool, token: CancellationToken) -> TaskResult {
        run_group(self, pool, Some(token))
    }
}

fn run_group(group: TaskGroup, pool: &WorkerPool, interrupt: Option<CancellationToken>) -> TaskResult {
    let (description, children) = group.into_parts();
    let span = tracing::debug_span!("group", name = %description);
    let _enter = span.enter();

    let mut scheduler = Scheduler::new(pool.clone());
    if let Some(token) = interrupt.clone() {
        scheduler = scheduler.with_interrupt(token);
    }
    for child in children {
        let task = match child {
            TaskNode::Task(task) => task,
            TaskNode::Group(nested) => {
                let pool = pool.clone();
                let interrupt = interrupt.clone();
                Task::from_failable(nested.description().to_string(), move || {
                    run_group(nested, &pool, interrupt)
                })
            }
        };
        scheduler.schedule(task);
    }
    scheduler.finished()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn empty_group_finishes_immediately() {
        let pool = WorkerPool::new(2);
        let mut scheduler = Scheduler::new(pool.clone());
        assert!(scheduler.finished().is_ok());
        assert_eq!(scheduler.state(), SchedulerState::Done);
        assert_eq!(pool.metrics().total_submitted, 0);
        pool.shutdown();
    }

    #[test]
    fn last_task_is_deferred_until_finished() {
        let pool = WorkerPool::new(2);
        let mut scheduler = Scheduler::new(pool.clone());
        scheduler.schedule(Task::from_fn("a", || {}));
        assert_eq!(pool.metrics().total_submitted, 0);
        scheduler.schedule(Task::from_fn("b", || {}));
        assert_eq!(pool.metrics().total_submitted, 1);
        assert!(scheduler.finished().is_ok());
        assert_eq!(pool.metrics().total_submitted, 2);
        pool.shutdown();
    }

    #[test]
    fn schedule_after_finished_is_ignored() {
        let pool = WorkerPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(pool.clone());
        assert!(scheduler.finished().is_ok());

        for i in 0..3 {
            let ran = ran.clone();
            scheduler.schedule(Task::from_fn(format!("late-{i}"), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(scheduler.state(), SchedulerState::Done);
        assert!(scheduler.finished().is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(pool.metrics().total_submitted, 0);
        pool.shutdown();
    }

    #[test]
    fn siblings_keep_running_after_a_failure() {
        let pool = WorkerPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(pool.clone());
        for i in 0..6 {
            let ran = ran.clone();
            scheduler.schedule(Task::new(format!("task-{i}"), move || {
                ran.fetch_add(1, Ordering::SeqCst);
                if i == 2 {
                    Err("task two broke")
                } else {
                    Ok(())
                }
            }));
        }
        let err = scheduler.finished().unwrap_err();
        assert_eq!(ran.load(Ordering::SeqCst), 6);
        assert!(matches!(&err, Failure::Action { description, .. } if description == "task-2"));
        pool.shutdown();
    }
}
