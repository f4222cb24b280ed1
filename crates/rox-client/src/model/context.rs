use std::collections::HashMap;
use std::sync::Arc;

use crate::model::dynamic_value::DynamicValue;

/// Immutable keyed map handed to evaluations and custom-property generators.
///
/// A merged context layers a local map over a global one; lookups fall
/// through key by key. Cloning is cheap (shared storage).
#[derive(Debug, Clone, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug, Default)]
struct ContextInner {
    values: HashMap<String, DynamicValue>,
    parent: Option<Context>,
}

impl Context {
    pub fn empty() -> Context {
        Context::default()
    }

    pub fn from_map(values: HashMap<String, DynamicValue>) -> Context {
        Context {
            inner: Arc::new(ContextInner { values, parent: None }),
        }
    }

    /// Builds a view where `local` overrides `global` key by key.
    pub fn merged(global: Option<&Context>, local: Option<&Context>) -> Context {
        match (global, local) {
            (Some(global), Some(local)) => Context {
                inner: Arc::new(ContextInner {
                    values: local.inner.values.clone(),
                    parent: Some(global.clone()),
                }),
            },
            (Some(single), None) | (None, Some(single)) => single.clone(),
            (None, None) => Context::empty(),
        }
    }

    pub fn get(&self, key: &str) -> Option<DynamicValue> {
        match self.inner.values.get(key) {
            Some(value) => Some(value.clone()),
            None => self.inner.parent.as_ref().and_then(|parent| parent.get(key)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.values.is_empty()
            && self
                .inner
                .parent
                .as_ref()
                .map(|parent| parent.is_empty())
                .unwrap_or(true)
    }
}

/// Shorthand for building a context from string keys and dynamic values.
#[macro_export]
macro_rules! rox_context {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = ::std::collections::HashMap::new();
        $(map.insert($key.to_string(), $value);)*
        $crate::model::context::Context::from_map(map)
    }};
}
