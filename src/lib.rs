//! Параллельное выполнение групп задач и стресс-тестирование потокобезопасного кода
//!
//! # Features
//! - Общий пул процесса с ограниченным параллелизмом (`MAX_PARALLEL_TASK_THREADS`)
//! - Work-stealing join: ожидающий поток сам выполняет ещё не начатые задачи
//! - Вложенные группы задач без взаимных блокировок при насыщенном пуле
//! - Стресс-тест действий во множестве потоков с синхронным стартом
//! - Обнаружение взаимных блокировок на примитивах `parking_lot`
//! - Агрегация ошибок: одна пробрасывается как есть, несколько объединяются

pub mod deadlock;
pub mod errors;
pub mod handle;
pub mod model;
pub mod multi;
pub mod pool;
pub mod scheduler;
pub mod stress;

pub use errors::{BoxError, ConfigError, Failure, TaskResult};
pub use handle::{ItemState, JoinHandle};
pub use model::{Action, Task, TaskGroup, TaskNode};
pub use multi::MultiError;
pub use pool::{Config, WorkerPool};
pub use scheduler::Scheduler;
pub use stress::{StressConfig, StressTester};
