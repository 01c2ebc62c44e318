//! Applying a finalized decision to a [`DeviceConfig`] document.

use std::collections::BTreeSet;

use anyhow::{anyhow, bail, ensure, Context, Result};
use policy_engine::loader;
use policy_engine::schema::{
    AddressSpec, DeviceConfig, PortSpec, RuleSpec, ScopeObjects, ServiceSpec,
};
use policy_engine::{
    policy_values, Attribute, CandidateMethod, CandidatePolicy, NamingConfig, NewObject, Object,
    ObjectKind, Policy, ScopeHierarchy, ScopeId, ServiceValue,
};

/// What an apply step changed, for the decision log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedChange {
    pub created: Vec<String>,
    /// Rule that was added or extended.
    pub rule: Option<String>,
    /// Address objects whose tags changed.
    pub tagged: Vec<String>,
}

/// Apply `candidate` to `config` in place.
///
/// The candidate must be finalized. A new rule and its new objects land in
/// the candidate's scope. An extended rule stays in the scope that defines
/// it, and the objects it gains are resolved (or created) there, since
/// that is where the device resolves the rule's names. The edited document
/// is rebuilt and checked before returning, so a change that is unloadable
/// or does not carry the requested values is rejected.
pub fn apply_candidate(
    config: &mut DeviceConfig,
    candidate: &CandidatePolicy,
    naming: &NamingConfig,
) -> Result<AppliedChange> {
    candidate.finalize()?;
    let before = loader::build_hierarchy(config).context("device configuration is invalid")?;
    let start = before
        .scope(&candidate.scope)
        .with_context(|| format!("unknown scope '{}'", candidate.scope))?;

    let mut change = AppliedChange::default();
    match &candidate.method {
        CandidateMethod::NewPolicy { policy } => {
            for new in &candidate.new_objects {
                if before.find(start, &new.name, new.kind).is_some() {
                    bail!(
                        "cannot create {} '{}': the name is already used from scope '{}'",
                        new.kind,
                        new.name,
                        candidate.scope
                    );
                }
                create_object(config, &candidate.scope, new, BTreeSet::new())?;
                change.created.push(new.name.clone());
            }
            let rule = rule_spec(policy, candidate);
            change.rule = Some(rule.name.clone());
            scope_objects(config, &candidate.scope).rules.push(rule);

            let after = rebuild(config)?;
            let (_, added) = after
                .find_rule(start, &policy.name)
                .ok_or_else(|| anyhow!("rule '{}' missing after apply", policy.name))?;
            for attr in [
                Attribute::SourceAddresses,
                Attribute::DestinationAddresses,
                Attribute::Services,
            ] {
                let wanted = policy_values(&before, start, policy, attr);
                let actual = policy_values(&after, start, added, attr);
                ensure!(
                    actual == wanted,
                    "rule '{}' resolves {attr} to {actual:?} instead of {wanted:?}",
                    policy.name
                );
            }
        }
        CandidateMethod::Append { target, delta, .. } => {
            let rule_name = target_rule(candidate)?;
            let (owner, rule) = before.find_rule(start, &rule_name).ok_or_else(|| {
                anyhow!(
                    "rule '{rule_name}' is not visible from scope '{}'",
                    candidate.scope
                )
            })?;
            let owner_name = before.node(owner).name().to_string();

            let mut expected = policy_values(&before, owner, rule, *target);
            let mut names = Vec::new();
            for value in delta {
                let member = Member {
                    hierarchy: &before,
                    scope: owner,
                    scope_name: &owner_name,
                    candidate,
                    naming,
                };
                let (name, values) = member.resolve(config, *target, value, &mut change)?;
                expected.extend(values);
                names.push(name);
            }

            let list = rule_list(rule_in(config, &owner_name, &rule_name)?, *target)?;
            for name in names {
                if !list.contains(&name) {
                    list.push(name);
                }
            }
            change.rule = Some(rule_name.clone());

            let after = rebuild(config)?;
            let (_, extended) = after
                .find_rule(owner, &rule_name)
                .ok_or_else(|| anyhow!("rule '{rule_name}' missing after apply"))?;
            let actual = policy_values(&after, owner, extended, *target);
            ensure!(
                actual == expected,
                "extending rule '{rule_name}' in scope '{owner_name}' resolves {target} to \
                 {actual:?} instead of {expected:?}"
            );
        }
        CandidateMethod::Tag {
            target, choices, ..
        } => {
            let rule_name = target_rule(candidate)?;
            for (value, choice) in choices {
                match tagged_scope(&before, start, &choice.object, value) {
                    Some(scope) => {
                        let scope_name = before.node(scope).name().to_string();
                        let address = scope_objects(config, &scope_name)
                            .addresses
                            .iter_mut()
                            .find(|a| a.name == choice.object)
                            .ok_or_else(|| anyhow!("address '{}' not found", choice.object))?;
                        address.tags.extend(choice.tags.iter().cloned());
                    }
                    None => {
                        let new = candidate
                            .new_objects
                            .iter()
                            .find(|o| {
                                o.kind == ObjectKind::Address
                                    && o.name == choice.object
                                    && o.value == *value
                            })
                            .ok_or_else(|| {
                                anyhow!(
                                    "no address '{}' carries '{value}' in scope '{}'",
                                    choice.object,
                                    candidate.scope
                                )
                            })?;
                        create_object(config, &candidate.scope, new, choice.tags.clone())?;
                        change.created.push(new.name.clone());
                    }
                }
                change.tagged.push(choice.object.clone());
            }
            change.rule = Some(rule_name.clone());

            let after = rebuild(config)?;
            let (_, rule) = after
                .find_rule(start, &rule_name)
                .ok_or_else(|| anyhow!("rule '{rule_name}' missing after apply"))?;
            let actual = policy_values(&after, start, rule, *target);
            if let Some(missing) = choices.keys().find(|value| !actual.contains(*value)) {
                bail!("tagging leaves '{missing}' outside rule '{rule_name}'");
            }
        }
    }
    Ok(change)
}

fn rebuild(config: &DeviceConfig) -> Result<ScopeHierarchy> {
    loader::build_hierarchy(config).context("applied change leaves the configuration invalid")
}

fn target_rule(candidate: &CandidatePolicy) -> Result<String> {
    candidate
        .matched_policies()
        .first()
        .map(|p| p.name.clone())
        .ok_or_else(|| anyhow!("{} decision has no matched rule", candidate.method_kind().as_str()))
}

fn scope_objects<'a>(config: &'a mut DeviceConfig, scope: &str) -> &'a mut ScopeObjects {
    config.objects.entry(scope.to_string()).or_default()
}

fn create_object(
    config: &mut DeviceConfig,
    scope: &str,
    new: &NewObject,
    tags: BTreeSet<String>,
) -> Result<()> {
    let objects = scope_objects(config, scope);
    match new.kind {
        ObjectKind::Address => objects.addresses.push(AddressSpec {
            name: new.name.clone(),
            value: new.value.clone(),
            kind: None,
            tags,
        }),
        ObjectKind::Service => {
            let value: ServiceValue = new.value.parse()?;
            objects.services.push(ServiceSpec {
                name: new.name.clone(),
                protocol: Some(value.protocol),
                port: Some(PortSpec::Text(value.port.to_string())),
                terms: Vec::new(),
            });
        }
        kind => bail!("cannot create {kind} '{}'", new.name),
    }
    Ok(())
}

/// Resolves appended values the way the extended rule will see them.
struct Member<'a> {
    hierarchy: &'a ScopeHierarchy,
    /// Scope that defines the rule.
    scope: ScopeId,
    scope_name: &'a str,
    candidate: &'a CandidatePolicy,
    naming: &'a NamingConfig,
}

impl Member<'_> {
    /// The name the rule must reference for `value`, with the values that
    /// name contributes. Missing address and service objects are created
    /// in the rule's scope.
    fn resolve(
        &self,
        config: &mut DeviceConfig,
        target: Attribute,
        value: &str,
        change: &mut AppliedChange,
    ) -> Result<(String, Vec<String>)> {
        let kind = match target {
            Attribute::SourceAddresses | Attribute::DestinationAddresses => ObjectKind::Address,
            Attribute::Services => ObjectKind::Service,
            Attribute::Applications => {
                let app = self
                    .hierarchy
                    .find(self.scope, value, ObjectKind::Application)
                    .and_then(Object::as_application_ref)
                    .ok_or_else(|| {
                        anyhow!(
                            "application '{value}' is not visible from scope '{}'",
                            self.scope_name
                        )
                    })?;
                return Ok((value.to_string(), app.values()));
            }
            _ => return Ok((value.to_string(), vec![value.to_string()])),
        };

        // A hit only counts if its name resolves back to it from the rule's
        // scope; a closer object with the same name would shadow it.
        let visible = self
            .hierarchy
            .find_by_value(self.scope, value, kind)
            .iter()
            .find(|hit| {
                self.hierarchy
                    .find(self.scope, hit.name(), kind)
                    .is_some_and(|found| found.value_key() == hit.value_key())
            });
        if let Some(hit) = visible {
            return Ok((hit.name().to_string(), vec![value.to_string()]));
        }

        let name = match self
            .candidate
            .new_objects
            .iter()
            .find(|o| o.kind == kind && o.value == value)
        {
            Some(new) => new.name.clone(),
            None if kind == ObjectKind::Service => {
                let service: ServiceValue = value.parse()?;
                self.naming
                    .service_name(&service.protocol, &service.port.to_string())
            }
            None => self.naming.address_name(value),
        };
        if self.hierarchy.find(self.scope, &name, kind).is_some() {
            bail!(
                "cannot create {kind} '{name}' for '{value}': the name is already used from \
                 scope '{}'",
                self.scope_name
            );
        }
        let new = NewObject {
            kind,
            name: name.clone(),
            value: value.to_string(),
        };
        create_object(config, self.scope_name, &new, BTreeSet::new())?;
        change.created.push(name.clone());
        Ok((name, vec![value.to_string()]))
    }
}

/// The scope holding the address `name` that `value` refers to, when that
/// address is the one visible from `scope` under its name.
fn tagged_scope(
    hierarchy: &ScopeHierarchy,
    scope: ScopeId,
    name: &str,
    value: &str,
) -> Option<ScopeId> {
    let owner = hierarchy.ancestry(scope).find(|id| {
        let index = hierarchy.node(*id).index();
        index.contains(ObjectKind::Address, name) || index.contains(ObjectKind::AddressGroup, name)
    })?;
    match hierarchy.node(owner).index().get(ObjectKind::Address, name) {
        Some(Object::Address(address)) if address.value == value => Some(owner),
        _ => None,
    }
}

fn rule_spec(policy: &Policy, candidate: &CandidatePolicy) -> RuleSpec {
    RuleSpec {
        name: policy.name.clone(),
        source_zones: policy.source_zones.clone(),
        destination_zones: policy.destination_zones.clone(),
        source_addresses: policy
            .source_addresses
            .iter()
            .map(|r| r.name().to_string())
            .collect(),
        destination_addresses: policy
            .destination_addresses
            .iter()
            .map(|r| r.name().to_string())
            .collect(),
        services: policy.services.iter().map(|r| r.name().to_string()).collect(),
        applications: policy
            .applications
            .iter()
            .map(|r| r.name().to_string())
            .collect(),
        action: policy.action,
        description: policy.description.clone(),
        logging: policy.logging.clone(),
        rulebase: candidate.rulebase_placement,
    }
}

fn rule_in<'a>(config: &'a mut DeviceConfig, scope: &str, name: &str) -> Result<&'a mut RuleSpec> {
    config
        .objects
        .get_mut(scope)
        .and_then(|objects| objects.rules.iter_mut().find(|r| r.name == name))
        .ok_or_else(|| anyhow!("rule '{name}' not found in scope '{scope}'"))
}

fn rule_list(rule: &mut RuleSpec, target: Attribute) -> Result<&mut Vec<String>> {
    Ok(match target {
        Attribute::SourceZones => &mut rule.source_zones,
        Attribute::DestinationZones => &mut rule.destination_zones,
        Attribute::SourceAddresses => &mut rule.source_addresses,
        Attribute::DestinationAddresses => &mut rule.destination_addresses,
        Attribute::Services => &mut rule.services,
        Attribute::Applications => &mut rule.applications,
        Attribute::Action | Attribute::Logging => bail!("cannot append to {target}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_engine::{Action, Criteria, EngineConfig, MethodKind, PolicyEngine};

    const DEVICE: &str = r#"
scopes:
  - name: branch
    parent: shared
objects:
  shared:
    addresses:
      - {name: web-1, value: 10.1.1.10, tags: [web]}
      - {name: web-2, value: 10.1.1.11}
    address_groups:
      - {name: prod-web, dynamic: "'web' and 'prod'"}
    services:
      - {name: https, protocol: tcp, port: 443}
    rules:
      - name: to-web
        source_zones: [trust]
        destination_zones: [dmz]
        source_addresses: [any]
        destination_addresses: [web-1]
        services: [https]
        action: allow
  branch:
    rules:
      - name: to-prod
        source_zones: [branch]
        destination_zones: [dmz]
        source_addresses: [any]
        destination_addresses: [prod-web]
        services: [https]
        action: allow
"#;

    fn setup() -> (DeviceConfig, PolicyEngine) {
        let config = loader::load_from_str(DEVICE).unwrap();
        let hierarchy = loader::build_hierarchy(&config).unwrap();
        (config, PolicyEngine::with_hierarchy(EngineConfig::default(), hierarchy))
    }

    fn apply(config: &mut DeviceConfig, candidate: &CandidatePolicy) -> Result<AppliedChange> {
        apply_candidate(config, candidate, &NamingConfig::default())
    }

    fn rule<'a>(config: &'a DeviceConfig, scope: &str, name: &str) -> &'a RuleSpec {
        config.objects[scope]
            .rules
            .iter()
            .find(|r| r.name == name)
            .unwrap()
    }

    #[test]
    fn append_creates_service_and_extends_rule() {
        let (mut config, engine) = setup();
        let criteria = Criteria::new()
            .source_zones(["trust"])
            .destination_zones(["dmz"])
            .source_addresses(["any"])
            .destination_addresses(["10.1.1.10"])
            .services(["tcp/8443".parse().unwrap()])
            .action(Action::Allow);
        let candidate = engine.candidate_resolve(&criteria, None).unwrap();
        assert_eq!(candidate.method_kind(), MethodKind::Append);

        let change = apply(&mut config, &candidate).unwrap();
        assert_eq!(change.created, vec!["svc-tcp-8443".to_string()]);
        assert_eq!(change.rule.as_deref(), Some("to-web"));
        assert_eq!(
            rule(&config, "shared", "to-web").services,
            vec!["https".to_string(), "svc-tcp-8443".to_string()]
        );

        // The request is now covered.
        let hierarchy = loader::build_hierarchy(&config).unwrap();
        let engine = PolicyEngine::with_hierarchy(EngineConfig::default(), hierarchy);
        assert!(engine.candidate_resolve(&criteria, None).is_err());
    }

    #[test]
    fn append_reuses_existing_address() {
        let (mut config, engine) = setup();
        let criteria = Criteria::new()
            .source_zones(["trust"])
            .destination_zones(["dmz"])
            .source_addresses(["any"])
            .destination_addresses(["10.1.1.11"])
            .services(["tcp/443".parse().unwrap()])
            .action(Action::Allow);
        let candidate = engine.candidate_resolve(&criteria, None).unwrap();

        let change = apply(&mut config, &candidate).unwrap();
        assert!(change.created.is_empty());
        assert_eq!(
            rule(&config, "shared", "to-web").destination_addresses,
            vec!["web-1".to_string(), "web-2".to_string()]
        );
    }

    #[test]
    fn new_policy_lands_in_candidate_scope() {
        let (mut config, engine) = setup();
        let criteria = Criteria::new()
            .source_zones(["guest"])
            .destination_zones(["dmz"])
            .source_addresses(["192.168.50.0/24"])
            .destination_addresses(["10.1.1.10"])
            .services(["tcp/22".parse().unwrap()])
            .action(Action::Deny);
        let mut candidate = engine.candidate_resolve(&criteria, Some("branch")).unwrap();
        assert_eq!(candidate.method_kind(), MethodKind::NewPolicy);
        assert!(apply(&mut config.clone(), &candidate).is_err());

        candidate.set_name("guest-ssh").unwrap();
        let change = apply(&mut config, &candidate).unwrap();
        assert_eq!(change.created.len(), 2);

        let added = rule(&config, "branch", "guest-ssh");
        assert_eq!(added.action, Action::Deny);
        assert_eq!(added.source_addresses, vec!["addr-192.168.50.0_24".to_string()]);
        assert_eq!(added.destination_addresses, vec!["web-1".to_string()]);
        assert_eq!(added.services, vec!["svc-tcp-22".to_string()]);
        assert!(config.objects["branch"]
            .addresses
            .iter()
            .any(|a| a.value == "192.168.50.0/24"));
    }

    #[test]
    fn tag_choice_updates_shared_address() {
        let (mut config, engine) = setup();
        let criteria = Criteria::new()
            .source_zones(["branch"])
            .destination_zones(["dmz"])
            .source_addresses(["any"])
            .destination_addresses(["10.1.1.11"])
            .services(["tcp/443".parse().unwrap()])
            .action(Action::Allow);
        let mut candidate = engine.candidate_resolve(&criteria, Some("branch")).unwrap();
        assert_eq!(candidate.method_kind(), MethodKind::Tag);
        assert!(apply(&mut config.clone(), &candidate).is_err());

        candidate
            .choose_tags(
                "10.1.1.11",
                "web-2",
                BTreeSet::from(["web".to_string(), "prod".to_string()]),
            )
            .unwrap();
        let change = apply(&mut config, &candidate).unwrap();
        assert_eq!(change.tagged, vec!["web-2".to_string()]);

        let web2 = config.objects["shared"]
            .addresses
            .iter()
            .find(|a| a.name == "web-2")
            .unwrap();
        assert!(web2.tags.contains("prod"));
        assert!(config.objects["branch"].addresses.is_empty());
    }

    /// `branch` defines its own `web`, shadowing the shared one that the
    /// shared rules would resolve.
    const SHADOWED: &str = r#"
scopes:
  - name: branch
    parent: shared
objects:
  shared:
    addresses:
      - {name: web, value: 10.9.9.9}
      - {name: db, value: 10.1.1.10}
      - {name: app-1, value: 10.2.2.10, tags: [app, prod]}
    address_groups:
      - {name: prod-apps, dynamic: "'app' and 'prod'"}
    services:
      - {name: https, protocol: tcp, port: 443}
    rules:
      - name: to-db
        source_zones: [trust]
        destination_zones: [dmz]
        source_addresses: [any]
        destination_addresses: [db]
        services: [https]
        action: allow
      - name: to-apps
        source_zones: [branch]
        destination_zones: [dmz]
        source_addresses: [any]
        destination_addresses: [prod-apps]
        services: [https]
        action: allow
  branch:
    addresses:
      - {name: web, value: 10.1.1.11}
"#;

    fn shadowed() -> (DeviceConfig, PolicyEngine) {
        let config = loader::load_from_str(SHADOWED).unwrap();
        let hierarchy = loader::build_hierarchy(&config).unwrap();
        (config, PolicyEngine::with_hierarchy(EngineConfig::default(), hierarchy))
    }

    fn to_db(destination: &str, service: &str) -> Criteria {
        Criteria::new()
            .source_zones(["trust"])
            .destination_zones(["dmz"])
            .source_addresses(["any"])
            .destination_addresses([destination])
            .services([service.parse().unwrap()])
            .action(Action::Allow)
    }

    #[test]
    fn inherited_rule_gains_object_visible_from_its_scope() {
        let (mut config, engine) = shadowed();
        let criteria = to_db("10.1.1.11", "tcp/443");
        let candidate = engine.candidate_resolve(&criteria, Some("branch")).unwrap();
        assert_eq!(candidate.method_kind(), MethodKind::Append);
        assert_eq!(candidate.linked_object(ObjectKind::Address, "10.1.1.11/32"), Some("web"));

        let change = apply(&mut config, &candidate).unwrap();
        assert_eq!(change.rule.as_deref(), Some("to-db"));
        assert_eq!(change.created, vec!["addr-10.1.1.11_32".to_string()]);
        assert_eq!(
            rule(&config, "shared", "to-db").destination_addresses,
            vec!["db".to_string(), "addr-10.1.1.11_32".to_string()]
        );
        assert!(config.objects["shared"]
            .addresses
            .iter()
            .any(|a| a.name == "addr-10.1.1.11_32" && a.value == "10.1.1.11/32"));

        // The shared `web` host must not have been let in.
        let hierarchy = loader::build_hierarchy(&config).unwrap();
        let shared = hierarchy.scope("shared").unwrap();
        let (_, to_db) = hierarchy.find_rule(shared, "to-db").unwrap();
        let values = policy_values(&hierarchy, shared, to_db, Attribute::DestinationAddresses);
        assert_eq!(
            values,
            BTreeSet::from(["10.1.1.10/32".to_string(), "10.1.1.11/32".to_string()])
        );
    }

    #[test]
    fn inherited_rule_gains_service_in_its_scope() {
        let (mut config, engine) = shadowed();
        let criteria = to_db("10.1.1.10", "tcp/8443");
        let candidate = engine.candidate_resolve(&criteria, Some("branch")).unwrap();
        assert_eq!(candidate.method_kind(), MethodKind::Append);

        let change = apply(&mut config, &candidate).unwrap();
        assert_eq!(change.created, vec!["svc-tcp-8443".to_string()]);
        assert_eq!(
            rule(&config, "shared", "to-db").services,
            vec!["https".to_string(), "svc-tcp-8443".to_string()]
        );
        assert!(config.objects["shared"]
            .services
            .iter()
            .any(|s| s.name == "svc-tcp-8443"));
        assert!(config.objects["branch"].services.is_empty());

        let hierarchy = loader::build_hierarchy(&config).unwrap();
        let engine = PolicyEngine::with_hierarchy(EngineConfig::default(), hierarchy);
        assert!(engine.candidate_resolve(&criteria, Some("branch")).is_err());
    }

    #[test]
    fn inherited_rule_uses_configured_names() {
        let (mut config, engine) = shadowed();
        let candidate = engine
            .candidate_resolve(&to_db("10.1.1.11", "tcp/443"), Some("branch"))
            .unwrap();
        let naming = NamingConfig {
            address_prefix: "host".into(),
            service_prefix: "svc".into(),
        };
        let change = apply_candidate(&mut config, &candidate, &naming).unwrap();
        assert_eq!(change.created, vec!["host-10.1.1.11_32".to_string()]);
    }

    #[test]
    fn taken_name_in_rule_scope_is_rejected() {
        let (mut config, engine) = shadowed();
        let candidate = engine
            .candidate_resolve(&to_db("10.1.1.11", "tcp/443"), Some("branch"))
            .unwrap();
        config.objects.get_mut("shared").unwrap().addresses.push(AddressSpec {
            name: "addr-10.1.1.11_32".into(),
            value: "10.7.7.7".into(),
            kind: None,
            tags: BTreeSet::new(),
        });
        let before = config.clone();

        let err = apply(&mut config, &candidate).unwrap_err();
        assert!(err.to_string().contains("already used"));
        assert_eq!(rule(&config, "shared", "to-db"), rule(&before, "shared", "to-db"));
    }

    #[test]
    fn tag_on_inherited_rule_tags_the_visible_object() {
        let (mut config, engine) = shadowed();
        let criteria = Criteria::new()
            .source_zones(["branch"])
            .destination_zones(["dmz"])
            .source_addresses(["any"])
            .destination_addresses(["10.1.1.11"])
            .services(["tcp/443".parse().unwrap()])
            .action(Action::Allow);
        let mut candidate = engine.candidate_resolve(&criteria, Some("branch")).unwrap();
        assert_eq!(candidate.method_kind(), MethodKind::Tag);
        candidate
            .choose_tags(
                "10.1.1.11",
                "web",
                BTreeSet::from(["app".to_string(), "prod".to_string()]),
            )
            .unwrap();

        let change = apply(&mut config, &candidate).unwrap();
        assert_eq!(change.tagged, vec!["web".to_string()]);
        assert_eq!(change.rule.as_deref(), Some("to-apps"));

        let tags_of = |scope: &str| {
            config.objects[scope]
                .addresses
                .iter()
                .find(|a| a.name == "web")
                .map(|a| a.tags.clone())
                .unwrap()
        };
        assert!(tags_of("branch").contains("prod"));
        assert!(tags_of("shared").is_empty());

        let hierarchy = loader::build_hierarchy(&config).unwrap();
        let engine = PolicyEngine::with_hierarchy(EngineConfig::default(), hierarchy);
        assert!(engine.candidate_resolve(&criteria, Some("branch")).is_err());
    }
}
