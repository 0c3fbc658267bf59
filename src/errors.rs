use super::multi::MultiError;
use std::{any::Any, thread::ThreadId};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type TaskResult = Result<(), Failure>;

/// Ошибки конфигурации. Возникают до старта любых потоков и не повторяются.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("invalid thread count {0} -- must be greater than 1")]
    InvalidThreadCount(usize),
    #[error("invalid rounds per thread {0} -- must be greater than 0")]
    InvalidRounds(usize),
    #[error("added more actions ({actions}) than the number of threads ({threads})")]
    TooManyActions { actions: usize, threads: usize },
    #[error("at least 1 action must be added before run()")]
    NoActions,
    #[error("invalid parallelism {0} -- must be at least 2")]
    InvalidParallelism(usize),
    #[error("poll interval must be non-zero")]
    InvalidInterval,
    #[error("the global worker pool is already initialized")]
    GlobalPoolInitialized,
}

/// Единая ошибка выполнения задачи, действия или целого прогона.
///
/// Исходная ошибка хранится как есть (`source`), поэтому одиночный сбой
/// пробрасывается без обёртки и доступен через [`Failure::downcast_ref`].
#[derive(Debug, Error)]
pub enum Failure {
    #[error("{description} failed: {source}")]
    Action {
        description: String,
        source: BoxError,
    },
    #[error("{description} panicked: {message}")]
    Panic {
        description: String,
        message: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("detected {} deadlocked threads:\n{dump}", .threads.len())]
    Deadlock { threads: Vec<ThreadId>, dump: String },
    #[error("got interrupted while waiting for {0}")]
    Interrupted(&'static str),
    #[error("task cancelled before it started")]
    Cancelled,
    #[error(transparent)]
    Multiple(MultiError),
}

impl Failure {
    pub fn action<E>(description: impl Into<String>, err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Failure::Action {
            description: description.into(),
            source: err.into(),
        }
    }

    pub(crate) fn from_panic(description: impl Into<String>, payload: Box<dyn Any + Send>) -> Self {
        Failure::Panic {
            description: description.into(),
            message: panic_message(payload.as_ref()),
        }
    }

    /// Доступ к исходной ошибке действия с сохранением её типа.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Failure::Action { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    #[inline]
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Failure::Deadlock { .. })
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Failure::Interrupted(_))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
