use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::model::{Object, ObjectKind, Policy};

/// Per-scope store of named objects, value-indexed leaf objects and rules.
///
/// A name is unique only inside one index. Groups are registered by name
/// only; leaf objects are also registered under their value so candidate
/// resolution can find "the object that already means 10.0.0.0/24".
#[derive(Debug, Clone, Default)]
pub struct ObjectIndex {
    by_name: HashMap<ObjectKind, HashMap<String, Object>>,
    by_value: HashMap<ObjectKind, HashMap<String, Vec<Object>>>,
    rules: Vec<Arc<Policy>>,
}

impl ObjectIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object. Fails if an object of the same kind and name is
    /// already present in this index.
    pub fn insert(&mut self, object: Object) -> Result<()> {
        if self.contains(object.kind(), object.name()) {
            return Err(EngineError::invalid("duplicate object name", object.name()));
        }
        self.register(object);
        Ok(())
    }

    /// Register an object without the duplicate-name check. The caller
    /// guarantees the name is free.
    pub(crate) fn register(&mut self, object: Object) {
        let kind = object.kind();
        if !kind.is_group() {
            if let Some(key) = object.value_key() {
                self.by_value
                    .entry(kind)
                    .or_default()
                    .entry(key)
                    .or_default()
                    .push(object.clone());
            }
        }
        self.by_name
            .entry(kind)
            .or_default()
            .insert(object.name().to_string(), object);
    }

    pub fn get(&self, kind: ObjectKind, name: &str) -> Option<&Object> {
        self.by_name.get(&kind).and_then(|names| names.get(name))
    }

    pub fn contains(&self, kind: ObjectKind, name: &str) -> bool {
        self.get(kind, name).is_some()
    }

    /// Leaf objects registered under `value`, in insertion order.
    pub fn by_value(&self, kind: ObjectKind, value: &str) -> &[Object] {
        self.by_value
            .get(&kind)
            .and_then(|values| values.get(value))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn objects(&self, kind: ObjectKind) -> impl Iterator<Item = &Object> {
        self.by_name.get(&kind).into_iter().flat_map(|names| names.values())
    }

    /// Append a rule. Rule names are unique within one index.
    pub fn push_rule(&mut self, policy: Policy) -> Result<Arc<Policy>> {
        if self.rule(&policy.name).is_some() {
            return Err(EngineError::invalid("duplicate rule name", policy.name));
        }
        let policy = Arc::new(policy);
        self.rules.push(Arc::clone(&policy));
        Ok(policy)
    }

    pub fn rules(&self) -> &[Arc<Policy>] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&Arc<Policy>> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.by_name.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
