//! Tree of configuration scopes, each owning an [`ObjectIndex`].
//!
//! Nodes live in an arena and refer to their parent by [`ScopeId`], so the
//! back-reference never owns anything. Lookups start at an explicit scope and
//! walk upward; a name defined in a scope hides the same name in every
//! ancestor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::index::ObjectIndex;
use crate::matcher;
use crate::model::{Address, Application, Object, ObjectKind, Policy, Port, Service};

/// Name of the root scope every hierarchy starts with.
pub const ROOT_SCOPE: &str = "shared";

/// Name of the built-in service that defers to an application's ports.
pub const APPLICATION_DEFAULT: &str = "application-default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

/// One scope-relationship entry: `name` nested under `parent` (the root
/// when absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSpec {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScopeNode {
    name: String,
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    index: ObjectIndex,
}

impl ScopeNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    pub fn children(&self) -> &[ScopeId] {
        &self.children
    }

    pub fn index(&self) -> &ObjectIndex {
        &self.index
    }
}

/// The scope tree for one configuration snapshot.
///
/// Built mutably during a refresh, then published behind an `Arc` and only
/// read from that point on.
#[derive(Debug, Clone)]
pub struct ScopeHierarchy {
    nodes: Vec<ScopeNode>,
    by_name: HashMap<String, ScopeId>,
}

impl Default for ScopeHierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeHierarchy {
    /// A hierarchy holding only the root scope and its built-in objects
    /// (`any` address, `any` and `application-default` services, `any`
    /// application).
    pub fn new() -> Self {
        let mut index = ObjectIndex::new();
        let builtins = [
            Object::Address(Arc::new(Address::any())),
            Object::Service(Arc::new(Service::new(
                matcher::ANY,
                matcher::ANY,
                Port::Named(matcher::ANY.to_string()),
            ))),
            Object::Service(Arc::new(Service::new(
                APPLICATION_DEFAULT,
                APPLICATION_DEFAULT,
                Port::Named(APPLICATION_DEFAULT.to_string()),
            ))),
            Object::Application(Arc::new(Application {
                name: matcher::ANY.to_string(),
                identification: None,
                implicit_services: Vec::new(),
            })),
        ];
        for object in builtins {
            index.register(object);
        }

        let root = ScopeNode {
            name: ROOT_SCOPE.to_string(),
            parent: None,
            children: Vec::new(),
            index,
        };
        Self {
            nodes: vec![root],
            by_name: HashMap::from([(ROOT_SCOPE.to_string(), ScopeId(0))]),
        }
    }

    /// Build the scope tree from relationship entries given in any order.
    ///
    /// An entry naming the root is accepted and ignored. A parent that never
    /// appears (or a cycle) fails with [`EngineError::ScopeNotFound`].
    pub fn from_specs(specs: &[ScopeSpec]) -> Result<Self> {
        let mut hierarchy = Self::new();
        let mut pending: Vec<&ScopeSpec> = specs.iter().filter(|s| s.name != ROOT_SCOPE).collect();

        let mut seen = HashSet::new();
        for spec in &pending {
            if !seen.insert(spec.name.as_str()) {
                return Err(EngineError::invalid("duplicate scope name", spec.name.clone()));
            }
        }

        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for spec in pending {
                let parent = spec.parent.as_deref().unwrap_or(ROOT_SCOPE);
                if hierarchy.by_name.contains_key(parent) {
                    hierarchy.add_scope(&spec.name, parent)?;
                } else {
                    deferred.push(spec);
                }
            }
            if deferred.len() == before {
                let missing = deferred[0].parent.clone().unwrap_or_default();
                return Err(EngineError::ScopeNotFound(missing));
            }
            pending = deferred;
        }

        Ok(hierarchy)
    }

    /// Add a scope nested under an existing `parent`.
    pub fn add_scope(&mut self, name: &str, parent: &str) -> Result<ScopeId> {
        if self.by_name.contains_key(name) {
            return Err(EngineError::invalid("duplicate scope name", name));
        }
        let parent_id = self.scope(parent)?;
        let id = ScopeId(self.nodes.len());
        self.nodes.push(ScopeNode {
            name: name.to_string(),
            parent: Some(parent_id),
            children: Vec::new(),
            index: ObjectIndex::new(),
        });
        self.nodes[parent_id.0].children.push(id);
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn scope(&self, name: &str) -> Result<ScopeId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::ScopeNotFound(name.to_string()))
    }

    pub fn node(&self, id: ScopeId) -> &ScopeNode {
        &self.nodes[id.0]
    }

    pub fn scopes(&self) -> impl Iterator<Item = &ScopeNode> {
        self.nodes.iter()
    }

    /// Every scope id, each parent before its children.
    pub fn scope_ids(&self) -> impl Iterator<Item = ScopeId> {
        (0..self.nodes.len()).map(ScopeId)
    }

    /// `scope` followed by each of its ancestors up to the root.
    pub fn ancestry(&self, scope: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(scope), move |id| self.nodes[id.0].parent)
    }

    pub fn insert(&mut self, scope: ScopeId, object: Object) -> Result<()> {
        self.nodes[scope.0].index.insert(object)
    }

    pub fn insert_rule(&mut self, scope: ScopeId, policy: Policy) -> Result<Arc<Policy>> {
        self.nodes[scope.0].index.push_rule(policy)
    }

    /// Resolve `name` starting at `scope`.
    ///
    /// Each scope is tried for `kind`, then for its sister kind, before
    /// moving to the parent with the original kind.
    pub fn find(&self, scope: ScopeId, name: &str, kind: ObjectKind) -> Option<&Object> {
        self.ancestry(scope).find_map(|id| {
            let index = &self.nodes[id.0].index;
            index
                .get(kind, name)
                .or_else(|| index.get(kind.sister(), name))
        })
    }

    /// Leaf objects whose value is `value`, from the closest scope that has
    /// any. Address values are normalized first (bare hosts become /32).
    pub fn find_by_value(&self, scope: ScopeId, value: &str, kind: ObjectKind) -> &[Object] {
        let key = match kind {
            ObjectKind::Address => matcher::normalize_address(value),
            _ => value.to_string(),
        };
        self.ancestry(scope)
            .map(|id| self.nodes[id.0].index.by_value(kind, &key))
            .find(|hits| !hits.is_empty())
            .unwrap_or(&[])
    }

    /// Every object of `kind` visible from `scope`: local objects plus
    /// inherited ones whose name is not redefined closer to `scope`.
    pub fn visible_objects(&self, scope: ScopeId, kind: ObjectKind) -> Vec<&Object> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in self.ancestry(scope) {
            for object in self.nodes[id.0].index.objects(kind) {
                if seen.insert(object.name()) {
                    out.push(object);
                }
            }
        }
        out
    }

    /// Rules that apply in `scope`: its own, then those inherited from each
    /// ancestor.
    pub fn visible_rules(&self, scope: ScopeId) -> Vec<Arc<Policy>> {
        self.ancestry(scope)
            .flat_map(|id| self.nodes[id.0].index.rules().iter().cloned())
            .collect()
    }

    /// Find a rule by name, searching `scope` then its ancestors.
    pub fn find_rule(&self, scope: ScopeId, name: &str) -> Option<(ScopeId, &Arc<Policy>)> {
        self.ancestry(scope)
            .find_map(|id| self.nodes[id.0].index.rule(name).map(|rule| (id, rule)))
    }
}
