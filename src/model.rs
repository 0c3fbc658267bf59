use super::errors::{BoxError, Failure, TaskResult};
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

type TaskBody = Box<dyn FnOnce() -> TaskResult + Send + 'static>;
type ActionBody = Arc<dyn Fn() -> Result<(), BoxError> + Send + Sync + 'static>;

/// Одноразовая единица работы с описанием для диагностики.
pub struct Task {
    description: String,
    body: TaskBody,
}

impl Task {
    pub fn new<F, E>(description: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let description = description.into();
        let desc = description.clone();
        Self {
            description,
            body: Box::new(move || f().map_err(|e| Failure::action(desc, e))),
        }
    }

    pub fn from_fn<F>(description: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            description: description.into(),
            body: Box::new(move || {
                f();
                Ok::<(), Failure>(())
            }),
        }
    }

    /// Тело уже возвращает `Failure` (вложенные группы), без переупаковки.
    pub(crate) fn from_failable<F>(description: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        Self {
            description: description.into(),
            body: Box::new(f),
        }
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Выполняет задачу в текущем потоке; паника превращается в `Failure::Panic`.
    pub fn run(self) -> TaskResult {
        let Task { description, body } = self;
        catch_unwind(AssertUnwindSafe(body))
            .unwrap_or_else(|payload| Err(Failure::from_panic(description, payload)))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl From<Action> for Task {
    fn from(action: Action) -> Self {
        let description = action.to_string();
        Task::from_failable(description, move || action.run())
    }
}

/// Элемент группы: задача или вложенная группа.
#[derive(Debug)]
pub enum TaskNode {
    Task(Task),
    Group(TaskGroup),
}

impl From<Task> for TaskNode {
    fn from(task: Task) -> Self {
        TaskNode::Task(task)
    }
}

impl From<TaskGroup> for TaskNode {
    fn from(group: TaskGroup) -> Self {
        TaskNode::Group(group)
    }
}

/// Упорядоченная группа задач и подгрупп.
#[derive(Debug, Default)]
pub struct TaskGroup {
    description: String,
    children: Vec<TaskNode>,
}

impl TaskGroup {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            children: Vec::new(),
        }
    }

    pub fn with(mut self, child: impl Into<TaskNode>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn push(&mut self, child: impl Into<TaskNode>) {
        self.children.push(child.into());
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Общее число задач во всём дереве.
    pub fn task_count(&self) -> usize {
        self.children
            .iter()
            .map(|c| match c {
                TaskNode::Task(_) => 1,
                TaskNode::Group(g) => g.task_count(),
            })
            .sum()
    }

    pub(crate) fn into_parts(self) -> (String, Vec<TaskNode>) {
        (self.description, self.children)
    }
}

/// Повторяемое действие, общее для стресс-теста и других помощников.
#[derive(Clone)]
pub struct Action {
    description: String,
    body: ActionBody,
}

impl Action {
    pub fn new<F, E>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let body: ActionBody = Arc::new(move || f().map_err(Into::<BoxError>::into));
        Self {
            description: description.into(),
            body,
        }
    }

    pub fn from_fn<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new(description, move || {
            f();
            Ok::<(), BoxError>(())
        })
    }

    /// Результат вызова отбрасывается, учитывается только ошибка.
    pub fn returning<F, T, E>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::new(description, move || f().map(drop))
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn run(&self) -> TaskResult {
        match catch_unwind(AssertUnwindSafe(|| (self.body)())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Failure::action(self.to_string(), e)),
            Err(payload) => Err(Failure::from_panic(self.to_string(), payload)),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action({})", self.description)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub parallelism: usize,
    pub live_workers: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
    pub total_submitted: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub stolen_tasks: usize,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.live_workers == 0 {
            return 0.0;
        }
        (self.live_workers - self.idle_workers.min(self.live_workers)) as f64
            / self.live_workers as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed_tasks + self.failed_tasks;
        if total == 0 {
            return 1.0;
        }
        self.completed_tasks as f64 / total as f64
    }
}
