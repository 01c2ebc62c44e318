//! Candidate resolution: decide how a requested piece of traffic should be
//! added to an existing rule base.
//!
//! The passes run in a fixed order against one snapshot:
//!
//! 1. shadow check: some visible rule already covers the request;
//! 2. hold-out scan: for each supplied attribute, which rules match once
//!    that attribute is ignored;
//! 3. classification into Append (exactly one appendable attribute differs),
//!    Tag (the attribute is an address list backed by a dynamic group) or
//!    NewPolicy;
//! 4. linkage of every requested value to an existing object, or to an
//!    object the apply step has to create.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::criteria::{Attribute, Criteria};
use crate::decision::{CandidateMethod, CandidatePolicy, NewObject, TagOption};
use crate::error::{EngineError, Result};
use crate::evaluator::{policy_matches, policy_values};
use crate::hierarchy::{ScopeHierarchy, ScopeId};
use crate::matcher;
use crate::model::{
    Action, Address, AddressGroup, AddressRef, ApplicationRef, Object, ObjectKind, Policy,
    Service, ServiceRef, ServiceValue,
};

/// Resolve `criteria` against the rules visible from `scope`.
///
/// Fails with [`EngineError::ShadowedPolicy`] when the traffic is already
/// covered, and with [`EngineError::ObjectResolutionFailure`] when a value
/// has no object and creating one is disabled.
pub fn resolve(
    hierarchy: &ScopeHierarchy,
    scope: ScopeId,
    criteria: &Criteria,
    config: &EngineConfig,
) -> Result<CandidatePolicy> {
    let scope_name = hierarchy.node(scope).name().to_string();
    let rules = hierarchy.visible_rules(scope);
    let matching = |criteria: &Criteria| -> Vec<Arc<Policy>> {
        rules
            .iter()
            .filter(|rule| policy_matches(hierarchy, scope, rule, criteria, false, true))
            .cloned()
            .collect()
    };

    if let Some(rule) = rules
        .iter()
        .find(|rule| policy_matches(hierarchy, scope, rule, criteria, false, true))
    {
        info!(rule = %rule.name, scope = %scope_name, "requested traffic is shadowed");
        return Err(EngineError::ShadowedPolicy {
            rule: rule.name.clone(),
        });
    }

    let mut targets: Vec<(Attribute, Vec<Arc<Policy>>)> = Vec::new();
    for attr in criteria.non_empty_attributes() {
        let matched = matching(&criteria.without(attr));
        if !matched.is_empty() {
            debug!(attribute = %attr, matches = matched.len(), "attribute isolates rules");
            targets.push((attr, matched));
        }
    }

    let mut linker = Linker::new(hierarchy, scope, config);
    linker.link_all(criteria)?;

    let (method, rulebase_placement) = match targets.as_slice() {
        [(target, matched)] if target.is_appendable() => {
            let rulebase = matched.first().and_then(|rule| rule.rulebase);
            let method =
                append_or_tag(hierarchy, scope, criteria, config, *target, matched, &linker);
            (method, rulebase)
        }
        _ => {
            let policy = linker.new_policy(criteria)?;
            (CandidateMethod::NewPolicy { policy }, config.default_rulebase)
        }
    };

    let Linker {
        linked, new_objects, ..
    } = linker;
    let candidate = CandidatePolicy {
        criteria: criteria.clone(),
        scope: scope_name,
        rulebase_placement,
        linked_objects: linked,
        new_objects: new_objects.into_iter().collect(),
        method,
    };
    debug!(
        scope = %candidate.scope,
        method = ?candidate.method_kind(),
        new_objects = candidate.new_objects.len(),
        "resolved candidate policy"
    );
    Ok(candidate)
}

/// Build the Append decision for `target`, or a Tag decision when the first
/// matched rule reaches the target addresses through a dynamic group.
fn append_or_tag(
    hierarchy: &ScopeHierarchy,
    scope: ScopeId,
    criteria: &Criteria,
    config: &EngineConfig,
    target: Attribute,
    matched: &[Arc<Policy>],
    linker: &Linker<'_>,
) -> CandidateMethod {
    let requested = criteria.values(target).unwrap_or_default();
    let delta: BTreeSet<String> = match matched.first() {
        Some(first) => {
            let present = policy_values(hierarchy, scope, first, target);
            requested
                .into_iter()
                .filter(|value| {
                    let single = BTreeSet::from([value.clone()]);
                    !matcher::matches(&single, &present, false, target.is_address())
                })
                .collect()
        }
        None => requested,
    };

    let groups: Vec<&Arc<AddressGroup>> = match (target, matched.first()) {
        (Attribute::SourceAddresses, Some(rule)) => dynamic_groups(&rule.source_addresses),
        (Attribute::DestinationAddresses, Some(rule)) => {
            dynamic_groups(&rule.destination_addresses)
        }
        _ => Vec::new(),
    };

    if !config.dynamic_groups || groups.is_empty() {
        return CandidateMethod::Append {
            target,
            delta,
            matched_policies: matched.to_vec(),
        };
    }

    let mut options = BTreeMap::new();
    for value in &delta {
        let objects: Vec<(String, bool, BTreeSet<String>)> =
            match hierarchy.find_by_value(scope, value, ObjectKind::Address) {
                [] => vec![(linker.address_name(value), false, BTreeSet::new())],
                found => found
                    .iter()
                    .filter_map(|object| match object {
                        Object::Address(a) => Some((a.name.clone(), true, a.tags.clone())),
                        _ => None,
                    })
                    .collect(),
            };

        let mut value_options = Vec::new();
        for (object, existing, tags) in &objects {
            for group in &groups {
                let Some(expr) = group.expression() else {
                    continue;
                };
                value_options.push(TagOption {
                    object: object.clone(),
                    existing: *existing,
                    group: group.name.clone(),
                    current_tags: tags.clone(),
                    delta: expr.delta(tags),
                });
            }
        }
        options.insert(value.clone(), value_options);
    }

    CandidateMethod::Tag {
        target,
        matched_policies: matched.to_vec(),
        options,
        choices: BTreeMap::new(),
    }
}

fn dynamic_groups(refs: &[AddressRef]) -> Vec<&Arc<AddressGroup>> {
    refs.iter()
        .filter_map(|r| match r {
            AddressRef::Group(g) if g.expression().is_some() => Some(g),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Object linkage
// ---------------------------------------------------------------------------

/// Maps requested values to the objects that carry them, recording the
/// objects that would have to be created.
struct Linker<'a> {
    hierarchy: &'a ScopeHierarchy,
    scope: ScopeId,
    config: &'a EngineConfig,
    linked: BTreeMap<ObjectKind, BTreeMap<String, String>>,
    new_objects: BTreeSet<NewObject>,
}

impl<'a> Linker<'a> {
    fn new(hierarchy: &'a ScopeHierarchy, scope: ScopeId, config: &'a EngineConfig) -> Self {
        Self {
            hierarchy,
            scope,
            config,
            linked: BTreeMap::new(),
            new_objects: BTreeSet::new(),
        }
    }

    fn address_name(&self, value: &str) -> String {
        self.config.naming.address_name(value)
    }

    fn link_all(&mut self, criteria: &Criteria) -> Result<()> {
        for attr in [Attribute::SourceAddresses, Attribute::DestinationAddresses] {
            for value in criteria.values(attr).unwrap_or_default() {
                self.address(&value)?;
            }
        }
        for value in criteria.services.iter().flatten() {
            self.service(value)?;
        }
        for name in criteria.applications.iter().flatten() {
            self.application(name)?;
        }
        Ok(())
    }

    fn link(&mut self, kind: ObjectKind, value: &str, name: &str) {
        self.linked
            .entry(kind)
            .or_default()
            .insert(value.to_string(), name.to_string());
    }

    fn create(&mut self, kind: ObjectKind, value: &str, name: String) -> Result<()> {
        if !self.config.allow_object_creation {
            return Err(EngineError::ObjectResolutionFailure {
                kind,
                value: value.to_string(),
            });
        }
        self.new_objects.insert(NewObject {
            kind,
            name,
            value: value.to_string(),
        });
        Ok(())
    }

    fn address(&mut self, value: &str) -> Result<AddressRef> {
        let value = matcher::normalize_address(value);
        let found = self
            .hierarchy
            .find_by_value(self.scope, &value, ObjectKind::Address)
            .first()
            .and_then(Object::as_address_ref);
        match found {
            Some(existing) => {
                self.link(ObjectKind::Address, &value, existing.name());
                Ok(existing)
            }
            None => {
                let name = self.address_name(&value);
                self.create(ObjectKind::Address, &value, name.clone())?;
                Ok(AddressRef::Address(Arc::new(Address::new(name, &value))))
            }
        }
    }

    fn service(&mut self, value: &ServiceValue) -> Result<ServiceRef> {
        let key = value.key();
        let found = self
            .hierarchy
            .find_by_value(self.scope, &key, ObjectKind::Service)
            .first()
            .and_then(Object::as_service_ref);
        match found {
            Some(existing) => {
                self.link(ObjectKind::Service, &key, existing.name());
                Ok(existing)
            }
            None => {
                let name = self
                    .config
                    .naming
                    .service_name(&value.protocol, &value.port.to_string());
                self.create(ObjectKind::Service, &key, name.clone())?;
                Ok(ServiceRef::Service(Arc::new(Service::from_value(name, value))))
            }
        }
    }

    /// Applications are looked up by name and never created.
    fn application(&mut self, name: &str) -> Result<ApplicationRef> {
        let found = self
            .hierarchy
            .find(self.scope, name, ObjectKind::Application)
            .and_then(Object::as_application_ref)
            .ok_or_else(|| EngineError::ObjectResolutionFailure {
                kind: ObjectKind::Application,
                value: name.to_string(),
            })?;
        self.link(ObjectKind::Application, name, found.name());
        Ok(found)
    }

    /// A fresh, unnamed rule built from the full criteria.
    fn new_policy(&mut self, criteria: &Criteria) -> Result<Policy> {
        let mut policy = Policy::new(String::new(), criteria.action.unwrap_or(Action::Allow));
        policy.source_zones = criteria.source_zones.iter().flatten().cloned().collect();
        policy.destination_zones = criteria
            .destination_zones
            .iter()
            .flatten()
            .cloned()
            .collect();
        for value in criteria.values(Attribute::SourceAddresses).unwrap_or_default() {
            policy.source_addresses.push(self.address(&value)?);
        }
        for value in criteria
            .values(Attribute::DestinationAddresses)
            .unwrap_or_default()
        {
            policy.destination_addresses.push(self.address(&value)?);
        }
        for value in criteria.services.iter().flatten() {
            policy.services.push(self.service(value)?);
        }
        for name in criteria.applications.iter().flatten() {
            policy.applications.push(self.application(name)?);
        }
        policy.logging = criteria.logging.clone().unwrap_or_default();
        policy.rulebase = self.config.default_rulebase;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::MethodKind;
    use crate::loader::hierarchy_from_yaml;
    use crate::model::Rulebase;

    const FIXTURE: &str = r#"
version: "1.0"
scopes:
  - name: branch
objects:
  shared:
    addresses:
      - {name: A, value: 10.0.0.1}
      - {name: B, value: 10.0.0.2}
      - {name: C, value: 192.168.1.10}
      - {name: lan, value: 10.0.0.0/24}
      - {name: web-1, value: 10.1.0.1, tags: [web]}
      - {name: web-2, value: 10.1.0.2, tags: [web, prod]}
    address_groups:
      - {name: prod-web, dynamic: "'web' and 'prod'"}
    services:
      - {name: S, protocol: tcp, port: 443}
      - {name: S2, protocol: tcp, port: 8443}
      - {name: ssh, protocol: tcp, port: 22}
    rules:
      - name: R
        source_zones: [trust]
        destination_zones: [untrust]
        source_addresses: [A, B]
        destination_addresses: [C]
        services: [S]
        action: allow
        rulebase: pre
      - name: lan-any
        source_zones: [trust]
        destination_zones: [untrust]
        source_addresses: [lan]
        destination_addresses: [any]
        services: [ssh]
        action: allow
      - name: to-prod
        source_zones: [untrust]
        destination_zones: [dmz]
        source_addresses: [any]
        destination_addresses: [prod-web]
        services: [S]
        action: allow
  branch:
    rules: []
"#;

    fn hierarchy() -> ScopeHierarchy {
        hierarchy_from_yaml(FIXTURE)
    }

    fn resolve_in(
        h: &ScopeHierarchy,
        criteria: &Criteria,
        config: &EngineConfig,
    ) -> Result<CandidatePolicy> {
        resolve(h, h.root(), criteria, config)
    }

    fn svc(s: &str) -> ServiceValue {
        s.parse().unwrap()
    }

    #[test]
    fn shadowed_request_names_covering_rule() {
        let h = hierarchy();
        let criteria = Criteria::new()
            .source_addresses(["10.0.0.5/32"])
            .destination_addresses(["any"])
            .services([svc("tcp/22")])
            .action(Action::Allow);
        let err = resolve_in(&h, &criteria, &EngineConfig::default()).unwrap_err();
        assert_eq!(
            err,
            EngineError::ShadowedPolicy {
                rule: "lan-any".into()
            }
        );
    }

    #[test]
    fn exact_duplicate_is_shadowed() {
        let h = hierarchy();
        let criteria = Criteria::new()
            .source_zones(["trust"])
            .destination_zones(["untrust"])
            .source_addresses(["10.0.0.1", "10.0.0.2"])
            .destination_addresses(["192.168.1.10"])
            .services([svc("tcp/443")])
            .action(Action::Allow);
        let err = resolve_in(&h, &criteria, &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::ShadowedPolicy { rule } if rule == "R"));
    }

    #[test]
    fn unique_append_adds_only_missing_service() {
        let h = hierarchy();
        let criteria = Criteria::new()
            .source_addresses(["10.0.0.1", "10.0.0.2"])
            .destination_addresses(["192.168.1.10"])
            .services([svc("tcp/443"), svc("tcp/8443")]);
        let candidate = resolve_in(&h, &criteria, &EngineConfig::default()).unwrap();

        let CandidateMethod::Append {
            target,
            delta,
            matched_policies,
        } = &candidate.method
        else {
            panic!("expected append, got {:?}", candidate.method);
        };
        assert_eq!(*target, Attribute::Services);
        assert_eq!(delta, &BTreeSet::from(["tcp/8443".to_string()]));
        assert_eq!(matched_policies[0].name, "R");
        assert_eq!(candidate.rulebase_placement, Some(Rulebase::Pre));

        // every value already has an object
        assert!(candidate.new_objects.is_empty());
        assert_eq!(candidate.linked_object(ObjectKind::Service, "tcp/8443"), Some("S2"));
        assert_eq!(candidate.linked_object(ObjectKind::Address, "10.0.0.1/32"), Some("A"));
    }

    #[test]
    fn two_differing_attributes_make_new_policy() {
        let h = hierarchy();
        let criteria = Criteria::new()
            .source_zones(["trust"])
            .destination_zones(["untrust"])
            .source_addresses(["10.0.0.1", "172.20.0.1"])
            .destination_addresses(["192.168.1.99"])
            .services([svc("tcp/9000")])
            .action(Action::Allow);
        let candidate = resolve_in(&h, &criteria, &EngineConfig::default()).unwrap();

        assert_eq!(candidate.method_kind(), MethodKind::NewPolicy);
        assert!(candidate.matched_policies().is_empty());
        let names: BTreeSet<&str> = candidate.new_objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(
            names,
            BTreeSet::from(["addr-172.20.0.1_32", "addr-192.168.1.99_32", "svc-tcp-9000"])
        );
        assert_eq!(candidate.linked_object(ObjectKind::Address, "10.0.0.1/32"), Some("A"));
        let policy = candidate.policy().unwrap();
        assert!(policy.name.is_empty());
        assert_eq!(policy.source_addresses.len(), 2);
        assert_eq!(policy.destination_addresses[0].name(), "addr-192.168.1.99_32");
    }

    #[test]
    fn action_difference_is_never_appended() {
        let h = hierarchy();
        let criteria = Criteria::new()
            .source_addresses(["10.0.0.1", "10.0.0.2"])
            .destination_addresses(["192.168.1.10"])
            .services([svc("tcp/443")])
            .action(Action::Deny);
        let config = EngineConfig {
            default_rulebase: Some(Rulebase::Post),
            ..EngineConfig::default()
        };
        let candidate = resolve_in(&h, &criteria, &config).unwrap();
        assert_eq!(candidate.method_kind(), MethodKind::NewPolicy);
        assert_eq!(candidate.rulebase_placement, Some(Rulebase::Post));
        assert_eq!(candidate.policy().unwrap().action, Action::Deny);
    }

    #[test]
    fn creation_disabled_fails_resolution() {
        let h = hierarchy();
        let criteria = Criteria::new()
            .source_addresses(["10.0.0.1", "10.0.0.2"])
            .destination_addresses(["192.168.1.10"])
            .services([svc("tcp/443"), svc("tcp/9443")]);
        let config = EngineConfig {
            allow_object_creation: false,
            ..EngineConfig::default()
        };
        let err = resolve_in(&h, &criteria, &config).unwrap_err();
        assert_eq!(
            err,
            EngineError::ObjectResolutionFailure {
                kind: ObjectKind::Service,
                value: "tcp/9443".into()
            }
        );
    }

    #[test]
    fn unknown_application_is_resolution_failure() {
        let h = hierarchy();
        let criteria = Criteria::new()
            .source_addresses(["10.9.9.9"])
            .applications(["no-such-app"]);
        let err = resolve_in(&h, &criteria, &EngineConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ObjectResolutionFailure {
                kind: ObjectKind::Application,
                ..
            }
        ));
    }

    #[test]
    fn dynamic_group_target_becomes_tag_decision() {
        let h = hierarchy();
        let criteria = Criteria::new()
            .source_zones(["untrust"])
            .destination_zones(["dmz"])
            .destination_addresses(["10.1.0.1", "10.1.0.50"])
            .services([svc("tcp/443")])
            .action(Action::Allow);
        let mut candidate = resolve_in(&h, &criteria, &EngineConfig::default()).unwrap();

        let CandidateMethod::Tag {
            target, options, ..
        } = &candidate.method
        else {
            panic!("expected tag, got {:?}", candidate.method);
        };
        assert_eq!(*target, Attribute::DestinationAddresses);

        let existing = &options["10.1.0.1/32"];
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].object, "web-1");
        assert!(existing[0].existing);
        assert_eq!(existing[0].delta.required, BTreeSet::from(["prod".to_string()]));

        let fresh = &options["10.1.0.50/32"];
        assert_eq!(fresh[0].object, "addr-10.1.0.50_32");
        assert!(!fresh[0].existing);
        assert_eq!(
            fresh[0].delta.required,
            BTreeSet::from(["prod".to_string(), "web".to_string()])
        );

        assert!(candidate.finalize().is_err());
        candidate
            .choose_tags("10.1.0.1", "web-1", BTreeSet::from(["prod".to_string()]))
            .unwrap();
        candidate
            .choose_tags(
                "10.1.0.50",
                "addr-10.1.0.50_32",
                BTreeSet::from(["web".to_string(), "prod".to_string()]),
            )
            .unwrap();
        candidate.finalize().unwrap();
    }

    #[test]
    fn dynamic_groups_disabled_falls_back_to_append() {
        let h = hierarchy();
        let criteria = Criteria::new()
            .source_zones(["untrust"])
            .destination_zones(["dmz"])
            .destination_addresses(["10.1.0.1"])
            .services([svc("tcp/443")]);
        let config = EngineConfig {
            dynamic_groups: false,
            ..EngineConfig::default()
        };
        let candidate = resolve_in(&h, &criteria, &config).unwrap();
        assert_eq!(candidate.method_kind(), MethodKind::Append);
    }

    #[test]
    fn resolve_serialize_round_trip() {
        let h = hierarchy();
        let criteria = Criteria::new()
            .source_addresses(["10.0.0.1", "10.0.0.2"])
            .destination_addresses(["192.168.1.10"])
            .services([svc("tcp/443"), svc("tcp/8443")]);
        let candidate = resolve_in(&h, &criteria, &EngineConfig::default()).unwrap();

        let json = serde_json::to_string(&candidate).unwrap();
        let back: CandidatePolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(back.method_kind(), candidate.method_kind());
        let names = |c: &CandidatePolicy| -> Vec<String> {
            c.matched_policies().iter().map(|p| p.name.clone()).collect()
        };
        assert_eq!(names(&back), names(&candidate));
        assert_eq!(back.linked_objects, candidate.linked_objects);
        assert_eq!(back.new_objects, candidate.new_objects);
    }

    #[test]
    fn child_scope_resolves_against_inherited_rules() {
        let h = hierarchy();
        let branch = h.scope("branch").unwrap();
        let criteria = Criteria::new()
            .source_addresses(["10.0.0.7"])
            .destination_addresses(["any"])
            .services([svc("tcp/22")]);
        let err = resolve(&h, branch, &criteria, &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::ShadowedPolicy { .. }));
    }
}
