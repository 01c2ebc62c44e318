use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::candidate;
use crate::config::EngineConfig;
use crate::criteria::{Attribute, Criteria};
use crate::decision::{CandidatePolicy, EffectivePolicy};
use crate::error::Result;
use crate::hierarchy::{ScopeHierarchy, ScopeId};
use crate::matcher;
use crate::model::{AddressRef, ApplicationRef, GroupMembership, Object, ObjectKind, Policy};

// ---------------------------------------------------------------------------
// Normalized rule values
// ---------------------------------------------------------------------------

/// The flattened values a rule holds for one attribute, as seen from
/// `scope`. Groups are expanded; dynamic groups contain every address
/// visible from `scope` whose tags satisfy the group's expression.
pub fn policy_values(
    hierarchy: &ScopeHierarchy,
    scope: ScopeId,
    policy: &Policy,
    attr: Attribute,
) -> BTreeSet<String> {
    match attr {
        Attribute::SourceZones => policy.source_zones.iter().cloned().collect(),
        Attribute::DestinationZones => policy.destination_zones.iter().cloned().collect(),
        Attribute::SourceAddresses => address_values(hierarchy, scope, &policy.source_addresses),
        Attribute::DestinationAddresses => {
            address_values(hierarchy, scope, &policy.destination_addresses)
        }
        Attribute::Services => policy
            .services
            .iter()
            .flat_map(|s| s.values())
            .map(|v| v.key())
            .collect(),
        Attribute::Applications => policy
            .applications
            .iter()
            .flat_map(ApplicationRef::values)
            .collect(),
        Attribute::Action => BTreeSet::from([policy.action.to_string()]),
        Attribute::Logging => policy
            .logging
            .iter()
            .map(|f| f.as_str().to_string())
            .collect(),
    }
}

pub fn address_values(
    hierarchy: &ScopeHierarchy,
    scope: ScopeId,
    refs: &[AddressRef],
) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for r in refs {
        collect_addresses(hierarchy, scope, r, &mut out);
    }
    out
}

fn collect_addresses(
    hierarchy: &ScopeHierarchy,
    scope: ScopeId,
    address: &AddressRef,
    out: &mut BTreeSet<String>,
) {
    match address {
        AddressRef::Address(a) => {
            out.insert(a.value.clone());
        }
        AddressRef::Group(group) => match &group.membership {
            GroupMembership::Static(members) => {
                for member in members {
                    collect_addresses(hierarchy, scope, member, out);
                }
            }
            GroupMembership::Dynamic(expr) => {
                for object in hierarchy.visible_objects(scope, ObjectKind::Address) {
                    if let Object::Address(a) = object {
                        if expr.evaluate(&a.tags) {
                            out.insert(a.value.clone());
                        }
                    }
                }
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Rule matching
// ---------------------------------------------------------------------------

/// Whether `policy` satisfies every supplied attribute of `criteria`.
///
/// Network-aware comparison only changes address attributes; the action is
/// always compared by equality.
pub fn policy_matches(
    hierarchy: &ScopeHierarchy,
    scope: ScopeId,
    policy: &Policy,
    criteria: &Criteria,
    exact: bool,
    network_aware: bool,
) -> bool {
    criteria.attributes().into_iter().all(|attr| {
        if attr == Attribute::Action {
            return criteria.action == Some(policy.action);
        }
        let Some(requested) = criteria.values(attr) else {
            return true;
        };
        let actual = policy_values(hierarchy, scope, policy, attr);
        matcher::matches(&requested, &actual, exact, network_aware && attr.is_address())
    })
}

/// Every rule visible from `scope` that matches `criteria`, in lookup order.
pub fn matching_policies(
    hierarchy: &ScopeHierarchy,
    scope: ScopeId,
    criteria: &Criteria,
    exact: bool,
    network_aware: bool,
) -> Vec<Arc<Policy>> {
    hierarchy
        .visible_rules(scope)
        .into_iter()
        .filter(|rule| {
            let hit = policy_matches(hierarchy, scope, rule, criteria, exact, network_aware);
            if hit {
                trace!(rule = %rule.name, "rule matched criteria");
            }
            hit
        })
        .collect()
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Decision entry point shared by drivers.
///
/// Holds the current configuration snapshot behind a lock that is only taken
/// to clone or replace the `Arc`; each call works against the snapshot it
/// started with, so a concurrent [`PolicyEngine::publish`] never shows a
/// half-built hierarchy.
pub struct PolicyEngine {
    config: EngineConfig,
    snapshot: RwLock<Arc<ScopeHierarchy>>,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("default_scope", &self.config.default_scope)
            .field("num_scopes", &self.snapshot.read().scopes().count())
            .finish()
    }
}

impl PolicyEngine {
    /// An engine over an empty hierarchy (root scope and built-ins only).
    pub fn new(config: EngineConfig) -> Self {
        Self::with_hierarchy(config, ScopeHierarchy::new())
    }

    pub fn with_hierarchy(config: EngineConfig, hierarchy: ScopeHierarchy) -> Self {
        Self {
            config,
            snapshot: RwLock::new(Arc::new(hierarchy)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replace the current snapshot.
    pub fn publish(&self, hierarchy: ScopeHierarchy) {
        let scopes = hierarchy.scopes().count();
        *self.snapshot.write() = Arc::new(hierarchy);
        info!(scopes, "published configuration snapshot");
    }

    /// The snapshot new calls will run against.
    pub fn snapshot(&self) -> Arc<ScopeHierarchy> {
        Arc::clone(&self.snapshot.read())
    }

    fn scope_name<'a>(&'a self, scope: Option<&'a str>) -> &'a str {
        scope.unwrap_or(&self.config.default_scope)
    }

    // -- Entry points ---------------------------------------------------------

    /// Rules visible from `scope` that match `criteria`.
    pub fn policy_match(
        &self,
        criteria: &Criteria,
        exact: bool,
        network_aware: bool,
        scope: Option<&str>,
    ) -> Result<Vec<Arc<Policy>>> {
        let snapshot = self.snapshot();
        let scope = snapshot.scope(self.scope_name(scope))?;
        Ok(matching_policies(
            &snapshot,
            scope,
            criteria,
            exact,
            network_aware,
        ))
    }

    /// Classify a request as shadowed, append, tag or new policy.
    pub fn candidate_resolve(
        &self,
        criteria: &Criteria,
        scope: Option<&str>,
    ) -> Result<CandidatePolicy> {
        let snapshot = self.snapshot();
        let scope = snapshot.scope(self.scope_name(scope))?;
        candidate::resolve(&snapshot, scope, criteria, &self.config)
    }

    /// Same as [`PolicyEngine::candidate_resolve`] for a loosely typed
    /// criteria map; unknown keys fail before any matching.
    pub fn candidate_resolve_map(
        &self,
        criteria: serde_json::Map<String, serde_json::Value>,
        scope: Option<&str>,
    ) -> Result<CandidatePolicy> {
        let criteria = Criteria::from_map(criteria)?;
        self.candidate_resolve(&criteria, scope)
    }

    /// Every rule visible from `scope` in which `address` appears as source
    /// or destination.
    pub fn effective_policy(
        &self,
        address: &str,
        network_aware: bool,
        scope: Option<&str>,
    ) -> Result<EffectivePolicy> {
        let snapshot = self.snapshot();
        let scope = snapshot.scope(self.scope_name(scope))?;
        let target = matcher::normalize_address(address);
        debug!(target = %target, network_aware, "computing effective policy");

        let mut effective = EffectivePolicy::new(target.clone());
        let as_source = Criteria::new().source_addresses([target.clone()]);
        let as_destination = Criteria::new().destination_addresses([target]);
        for rule in snapshot.visible_rules(scope) {
            if policy_matches(&snapshot, scope, &rule, &as_source, false, network_aware) {
                effective.add_source(Arc::clone(&rule));
            }
            if policy_matches(&snapshot, scope, &rule, &as_destination, false, network_aware) {
                effective.add_destination(rule);
            }
        }
        Ok(effective)
    }
}
