use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{Map, Number, Value};

use crate::error::{CableError, Result};
use crate::message::Message;

pub type PredicateFn = Arc<dyn Fn(&Message) -> anyhow::Result<bool> + Send + Sync>;

#[derive(Clone, Default)]
pub enum Filter {
    #[default]
    None,
    Exact(Map<String, Value>),
    Predicate(PredicateFn),
}

impl Filter {
    pub fn exact(reference: Map<String, Value>) -> Self {
        Self::Exact(reference)
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(move |message| Ok(predicate(message))))
    }

    pub fn try_predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    /// Errors and panics raised by a predicate surface as `CableError::Filter`.
    pub fn matches(&self, message: &Message) -> Result<bool> {
        match self {
            Self::None => Ok(true),
            Self::Exact(reference) => Ok(match message.body() {
                Value::Object(body) => object_contains(reference, body),
                _ => false,
            }),
            Self::Predicate(predicate) => {
                match catch_unwind(AssertUnwindSafe(|| predicate(message))) {
                    Ok(Ok(matched)) => Ok(matched),
                    Ok(Err(err)) => Err(CableError::Filter(format!("{err:#}"))),
                    Err(panic) => Err(CableError::Filter(panic_message(
                        panic.as_ref(),
                        "predicate",
                    ))),
                }
            }
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Exact(reference) => f.debug_tuple("Exact").field(reference).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<Map<String, Value>> for Filter {
    fn from(reference: Map<String, Value>) -> Self {
        Self::Exact(reference)
    }
}

// Objects become subset filters; other non-null values require the whole
// message body to be equal (string broadcasts such as turbo-stream HTML).
impl From<Value> for Filter {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::None,
            Value::Object(reference) => Self::Exact(reference),
            expected => Self::predicate(move |message| values_equal(&expected, message.body())),
        }
    }
}

impl<T: Into<Filter>> From<Option<T>> for Filter {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

fn object_contains(reference: &Map<String, Value>, actual: &Map<String, Value>) -> bool {
    reference.iter().all(|(key, expected)| {
        actual
            .get(key)
            .is_some_and(|value| value_contains(expected, value))
    })
}

fn value_contains(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(reference), Value::Object(body)) => object_contains(reference, body),
        (Value::Object(_), _) => false,
        _ => values_equal(expected, actual),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => left == right,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send), what: &str) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        return format!("{what} panicked: {text}");
    }
    if let Some(text) = panic.downcast_ref::<String>() {
        return format!("{what} panicked: {text}");
    }
    format!("{what} panicked")
}
