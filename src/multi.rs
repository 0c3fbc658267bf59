use super::errors::Failure;
use parking_lot::Mutex;
use std::{error::Error, fmt};

const FAILURE_SEPARATOR: &str =
    "\n\t______________________________________________________________________\n";

/// Потокобезопасный сборщик ошибок.
///
/// Вложенный `MultiError` всегда разворачивается в плоский список,
/// поэтому агрегаты никогда не вкладываются друг в друга.
#[derive(Default)]
pub struct MultiError {
    nested: Mutex<Vec<Failure>>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` игнорируется; `Failure::Multiple` разворачивается.
    pub fn add(&self, failure: impl Into<Option<Failure>>) {
        let Some(failure) = failure.into() else {
            return;
        };
        match failure {
            Failure::Multiple(other) => self.nested.lock().extend(other.into_vec()),
            failure => self.nested.lock().push(failure),
        }
    }

    pub fn add_result(&self, result: Result<(), Failure>) {
        self.add(result.err());
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nested.lock().is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nested.lock().len()
    }

    /// Пусто -> `Ok(())`; одна ошибка -> она сама, без обёртки;
    /// иначе весь накопленный список как `Failure::Multiple`.
    ///
    /// Содержимое забирается под одной блокировкой, так что параллельный
    /// `add` либо попадает в результат целиком, либо остаётся в агрегаторе.
    pub fn throw_if_not_empty(&self) -> Result<(), Failure> {
        let mut nested = std::mem::take(&mut *self.nested.lock());
        match nested.len() {
            0 => Ok(()),
            1 => Err(nested.remove(0)),
            _ => Err(Failure::Multiple(MultiError {
                nested: Mutex::new(nested),
            })),
        }
    }

    /// Описания вложенных ошибок в порядке добавления.
    pub fn descriptions(&self) -> Vec<String> {
        self.nested.lock().iter().map(render).collect()
    }

    pub fn into_vec(self) -> Vec<Failure> {
        self.nested.into_inner()
    }
}

fn render(failure: &Failure) -> String {
    let mut out = failure.to_string();
    // Display уже содержит непосредственную причину
    let mut source = failure.source().and_then(|s| s.source());
    while let Some(cause) = source {
        out.push_str("\nCaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nested = self.nested.lock();
        if nested.is_empty() {
            return f.write_str("<no nested failures>");
        }
        let n = nested.len();
        write!(f, "{} nested {}:", n, if n == 1 { "failure" } else { "failures" })?;
        for failure in nested.iter() {
            f.write_str(FAILURE_SEPARATOR)?;
            f.write_str("\n\t")?;
            f.write_str(render(failure).replace('\n', "\n\t").trim())?;
        }
        f.write_str(FAILURE_SEPARATOR)
    }
}

impl fmt::Debug for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiError")
            .field("nested", &*self.nested.lock())
            .finish()
    }
}

impl Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConfigError;
    use std::{io, sync::Arc, thread};

    #[test]
    fn empty_does_not_throw() {
        let me = MultiError::new();
        me.add(None);
        assert!(me.is_empty());
        assert!(me.throw_if_not_empty().is_ok());
    }

    #[test]
    fn single_failure_is_rethrown_unwrapped() {
        let me = MultiError::new();
        me.add(Failure::action("read config", io::Error::new(io::ErrorKind::NotFound, "missing")));
        let err = me.throw_if_not_empty().unwrap_err();
        let io_err = err.downcast_ref::<io::Error>().expect("original io::Error");
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn nested_aggregators_are_flattened() {
        let inner = MultiError::new();
        inner.add(Failure::from(ConfigError::NoActions));
        inner.add(Failure::Cancelled);
        let inner = inner.throw_if_not_empty().unwrap_err();

        let outer = MultiError::new();
        outer.add(Failure::Interrupted("workers"));
        outer.add(inner);
        assert_eq!(outer.len(), 3);

        match outer.throw_if_not_empty().unwrap_err() {
            Failure::Multiple(me) => {
                let nested = me.into_vec();
                assert_eq!(nested.len(), 3);
                assert!(nested.iter().all(|f| !matches!(f, Failure::Multiple(_))));
            }
            other => panic!("expected composite, got {other:?}"),
        }
    }

    #[test]
    fn composite_message_contains_every_failure() {
        let me = MultiError::new();
        me.add(Failure::action("first", "boom one"));
        me.add(Failure::action("second", "boom two"));
        let message = me.throw_if_not_empty().unwrap_err().to_string();
        assert!(message.starts_with("2 nested failures:"));
        assert!(message.contains("boom one"));
        assert!(message.contains("boom two"));
        assert!(message.find("first").unwrap() < message.find("second").unwrap());
        assert_eq!(message.matches(FAILURE_SEPARATOR).count(), 3);
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let me = Arc::new(MultiError::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let me = me.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        me.add(Failure::action(format!("t{t}-{i}"), "x"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(me.len(), 2000);
        match me.throw_if_not_empty().unwrap_err() {
            Failure::Multiple(inner) => assert_eq!(inner.len(), 2000),
            other => panic!("expected composite, got {other:?}"),
        }
        assert!(me.is_empty());
    }
}
