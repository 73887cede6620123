//! Per-job scratchpad: a shared key→JSON map forked per child by prefix.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;

/// A hierarchical key/value scratchpad rooted per job.
///
/// Forking concatenates a dot-separated prefix rather than nesting maps, so
/// the RPC shape stays flat: `w.fork("a").set("k", v)` is observable as
/// `w.get("a.k") == v`. Clones share the underlying map.
#[derive(Clone, Debug, Default)]
pub struct Whiteboard {
    data: Arc<RwLock<HashMap<String, Value>>>,
    prefix: String,
}

impl Whiteboard {
    pub fn new() -> Whiteboard {
        Whiteboard::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data
            .read()
            .unwrap()
            .get(&format!("{}{}", self.prefix, key))
            .cloned()
    }

    pub fn set(&self, key: &str, value: impl Serialize) {
        if let Ok(value) = serde_json::to_value(value) {
            self.set_value(key, value);
        }
    }

    pub fn set_value(&self, key: &str, value: Value) {
        self.data
            .write()
            .unwrap()
            .insert(format!("{}{}", self.prefix, key), value);
    }

    /// Remove every key under this board's prefix.
    pub fn clear(&self) {
        self.data
            .write()
            .unwrap()
            .retain(|k, _| !k.starts_with(&self.prefix));
    }

    /// A view over the same map scoped one level deeper.
    pub fn fork(&self, key: &str) -> Whiteboard {
        if key.is_empty() {
            return self.clone();
        }
        Whiteboard {
            data: self.data.clone(),
            prefix: format!("{}{}.", self.prefix, key),
        }
    }
}
