use std::fmt;
use std::sync::Arc;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    identifier: Arc<str>,
    body: Arc<Value>,
}

impl Message {
    pub fn new(identifier: impl Into<Arc<str>>, body: Value) -> Self {
        Self {
            identifier: identifier.into(),
            body: Arc::new(body),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn into_body(self) -> Value {
        Arc::try_unwrap(self.body).unwrap_or_else(|shared| (*shared).clone())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.body)
    }
}
