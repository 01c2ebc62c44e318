use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};

use crate::hierarchy::{ScopeHierarchy, ScopeId};
use crate::model::{
    Address, AddressGroup, AddressRef, Application, ApplicationGroup, ApplicationRef, Object,
    ObjectKind, Policy, Port, Service, ServiceGroup, ServiceRef, ServiceTerm,
};
use crate::schema::{
    AddressGroupSpec, AddressSpec, ApplicationSpec, DeviceConfig, GroupSpec, PortSpec, RuleSpec,
    ScopeObjects, ServiceSpec,
};
use crate::tags::TagExpr;

/// Load a [`DeviceConfig`] from a YAML file on disk.
pub fn load_device_config(path: impl AsRef<Path>) -> Result<DeviceConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read device config: {}", path.display()))?;
    load_from_str(&contents)
        .with_context(|| format!("failed to parse device config: {}", path.display()))
}

/// Parse a [`DeviceConfig`] from a YAML string and check its version.
pub fn load_from_str(yaml: &str) -> Result<DeviceConfig> {
    let config: DeviceConfig = serde_yml::from_str(yaml).context("YAML deserialization failed")?;
    if config.version != "1.0" {
        bail!(
            "unsupported device config version '{}'; only '1.0' is supported",
            config.version
        );
    }
    Ok(config)
}

/// Load a device config file and build its scope hierarchy in one step.
pub fn load_hierarchy(path: impl AsRef<Path>) -> Result<ScopeHierarchy> {
    let path = path.as_ref();
    let config = load_device_config(path)?;
    build_hierarchy(&config)
        .with_context(|| format!("invalid device config: {}", path.display()))
}

/// Turn a canonical device config into a [`ScopeHierarchy`].
pub fn build_hierarchy(config: &DeviceConfig) -> Result<ScopeHierarchy> {
    let mut hierarchy = build_scopes(config)?;
    populate_addresses(&mut hierarchy, config)?;
    populate_services(&mut hierarchy, config)?;
    populate_applications(&mut hierarchy, config)?;
    populate_rules(&mut hierarchy, config)?;
    info!(
        scopes = hierarchy.scopes().count(),
        "built scope hierarchy from device config"
    );
    Ok(hierarchy)
}

/// The empty scope tree of `config`. Every scope that carries objects must
/// be declared.
pub fn build_scopes(config: &DeviceConfig) -> Result<ScopeHierarchy> {
    let hierarchy =
        ScopeHierarchy::from_specs(&config.scopes).context("invalid scope relationships")?;
    for name in config.objects.keys() {
        hierarchy
            .scope(name)
            .with_context(|| format!("objects defined for undeclared scope '{name}'"))?;
    }
    Ok(hierarchy)
}

/// Addresses and address groups of every scope.
pub fn populate_addresses(hierarchy: &mut ScopeHierarchy, config: &DeviceConfig) -> Result<()> {
    for_each_scope(hierarchy, config, |builder, objects| {
        builder.addresses(&objects.addresses)?;
        builder.address_groups(&objects.address_groups)
    })
}

/// Services and service groups of every scope.
pub fn populate_services(hierarchy: &mut ScopeHierarchy, config: &DeviceConfig) -> Result<()> {
    for_each_scope(hierarchy, config, |builder, objects| {
        builder.services(&objects.services)?;
        builder.service_groups(&objects.service_groups)
    })
}

/// Applications and application groups of every scope.
pub fn populate_applications(
    hierarchy: &mut ScopeHierarchy,
    config: &DeviceConfig,
) -> Result<()> {
    for_each_scope(hierarchy, config, |builder, objects| {
        builder.applications(&objects.applications)?;
        builder.application_groups(&objects.application_groups)
    })
}

/// Rules of every scope. Objects must be populated first.
pub fn populate_rules(hierarchy: &mut ScopeHierarchy, config: &DeviceConfig) -> Result<()> {
    for_each_scope(hierarchy, config, |builder, objects| {
        builder.rules(&objects.rules)?;
        debug!(scope = %builder.scope_name, rules = objects.rules.len(), "loaded rules");
        Ok(())
    })
}

/// Run `populate` for every scope with objects, parents before children so
/// references resolve through the regular upward lookup.
fn for_each_scope(
    hierarchy: &mut ScopeHierarchy,
    config: &DeviceConfig,
    mut populate: impl FnMut(&mut ScopeBuilder<'_>, &ScopeObjects) -> Result<()>,
) -> Result<()> {
    let order: Vec<(ScopeId, String)> = hierarchy
        .scope_ids()
        .map(|id| (id, hierarchy.node(id).name().to_string()))
        .collect();

    for (scope, name) in order {
        let Some(objects) = config.objects.get(&name) else {
            continue;
        };
        let mut builder = ScopeBuilder {
            hierarchy: &mut *hierarchy,
            scope,
            scope_name: &name,
        };
        populate(&mut builder, objects)?;
    }
    Ok(())
}

/// Parse a port written in the file.
pub fn parse_port(port: &PortSpec) -> Result<Port> {
    match port {
        PortSpec::Number(n) => Ok(Port::Single(*n)),
        PortSpec::Text(text) => Ok(text.parse()?),
    }
}

// ---------------------------------------------------------------------------
// Per-scope population
// ---------------------------------------------------------------------------

struct ScopeBuilder<'a> {
    hierarchy: &'a mut ScopeHierarchy,
    scope: ScopeId,
    scope_name: &'a str,
}

impl ScopeBuilder<'_> {
    fn insert(&mut self, object: Object) -> Result<()> {
        let (kind, name) = (object.kind(), object.name().to_string());
        if self.scope == self.hierarchy.root()
            && self.hierarchy.node(self.scope).index().contains(kind, &name)
            && is_builtin(kind, &name)
        {
            debug!(object = %name, %kind, "skipping redefinition of built-in object");
            return Ok(());
        }
        self.hierarchy
            .insert(self.scope, object)
            .with_context(|| format!("{kind} '{name}' in scope '{}'", self.scope_name))
    }

    fn resolve(&self, name: &str, kind: ObjectKind, owner: &str) -> Result<Object> {
        self.hierarchy
            .find(self.scope, name, kind)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "{owner} in scope '{}' references unknown {kind} '{name}'",
                    self.scope_name
                )
            })
    }

    fn addresses(&mut self, specs: &[AddressSpec]) -> Result<()> {
        for spec in specs {
            let address = match spec.kind {
                Some(kind) => Address::with_kind(spec.name.clone(), &spec.value, kind)
                    .with_context(|| format!("address '{}'", spec.name))?,
                None => Address::new(spec.name.clone(), &spec.value),
            }
            .with_tags(spec.tags.iter().cloned());
            self.insert(Object::Address(Arc::new(address)))?;
        }
        Ok(())
    }

    fn address_groups(&mut self, specs: &[AddressGroupSpec]) -> Result<()> {
        self.groups(
            specs,
            ObjectKind::AddressGroup,
            |s| (&s.name, &s.members),
            |spec, members| {
                let group = match &spec.dynamic {
                    Some(expr) => {
                        if !spec.members.is_empty() {
                            bail!(
                                "address group '{}' cannot have both members and a dynamic expression",
                                spec.name
                            );
                        }
                        let expr: TagExpr = expr
                            .parse()
                            .with_context(|| format!("address group '{}'", spec.name))?;
                        AddressGroup::new_dynamic(spec.name.clone(), expr)
                    }
                    None => AddressGroup::new_static(
                        spec.name.clone(),
                        members.iter().filter_map(Object::as_address_ref).collect(),
                    ),
                };
                Ok(Object::AddressGroup(Arc::new(group)))
            },
        )
    }

    fn services(&mut self, specs: &[ServiceSpec]) -> Result<()> {
        for spec in specs {
            let service = match (&spec.protocol, &spec.port, spec.terms.is_empty()) {
                (Some(protocol), Some(port), true) => {
                    Service::new(spec.name.clone(), protocol.clone(), parse_port(port)?)
                }
                (None, None, false) => {
                    let terms = spec
                        .terms
                        .iter()
                        .map(|t| {
                            Ok(ServiceTerm {
                                name: t.name.clone(),
                                protocol: t.protocol.to_ascii_lowercase(),
                                port: parse_port(&t.port)?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()
                        .with_context(|| format!("service '{}'", spec.name))?;
                    Service::termed(spec.name.clone(), terms)
                }
                _ => bail!(
                    "service '{}' in scope '{}' needs either protocol and port or terms",
                    spec.name,
                    self.scope_name
                ),
            };
            self.insert(Object::Service(Arc::new(service)))?;
        }
        Ok(())
    }

    fn service_groups(&mut self, specs: &[GroupSpec]) -> Result<()> {
        self.groups(
            specs,
            ObjectKind::ServiceGroup,
            |s| (&s.name, &s.members),
            |spec, members| {
                Ok(Object::ServiceGroup(Arc::new(ServiceGroup {
                    name: spec.name.clone(),
                    members: members.iter().filter_map(Object::as_service_ref).collect(),
                })))
            },
        )
    }

    fn applications(&mut self, specs: &[ApplicationSpec]) -> Result<()> {
        for spec in specs {
            let application =
                Application::new(spec.name.clone(), spec.identification, &spec.default_ports)
                    .with_context(|| format!("application '{}'", spec.name))?;
            self.insert(Object::Application(Arc::new(application)))?;
        }
        Ok(())
    }

    fn application_groups(&mut self, specs: &[GroupSpec]) -> Result<()> {
        self.groups(
            specs,
            ObjectKind::ApplicationGroup,
            |s| (&s.name, &s.members),
            |spec, members| {
                Ok(Object::ApplicationGroup(Arc::new(ApplicationGroup {
                    name: spec.name.clone(),
                    members: members
                        .iter()
                        .filter_map(Object::as_application_ref)
                        .collect(),
                })))
            },
        )
    }

    /// Insert groups whose members may be other groups of the same scope,
    /// listed in any order. A member naming a local group that is not built
    /// yet waits for it rather than resolving to an inherited object.
    fn groups<S>(
        &mut self,
        specs: &[S],
        kind: ObjectKind,
        parts: impl Fn(&S) -> (&String, &Vec<String>),
        build: impl Fn(&S, Vec<Object>) -> Result<Object>,
    ) -> Result<()> {
        let member_kind = kind.sister();
        let mut pending: Vec<&S> = specs.iter().collect();
        let mut waiting: HashSet<&str> = specs.iter().map(|s| parts(s).0.as_str()).collect();

        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for spec in pending {
                let (name, members) = parts(spec);
                if members.iter().any(|m| m != name && waiting.contains(m.as_str())) {
                    deferred.push(spec);
                    continue;
                }
                let owner = format!("{kind} '{name}'");
                let resolved = members
                    .iter()
                    .map(|m| self.resolve(m, member_kind, &owner))
                    .collect::<Result<Vec<_>>>()?;
                self.insert(build(spec, resolved)?)?;
                waiting.remove(name.as_str());
            }
            if deferred.len() == before {
                let (name, _) = parts(deferred[0]);
                bail!(
                    "{kind} '{name}' in scope '{}' has circular membership",
                    self.scope_name
                );
            }
            pending = deferred;
        }
        Ok(())
    }

    fn rules(&mut self, specs: &[RuleSpec]) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in specs {
            if spec.name.is_empty() {
                bail!("rule name must not be empty (scope '{}')", self.scope_name);
            }
            if !seen.insert(spec.name.as_str()) {
                bail!(
                    "duplicate rule name: '{}' in scope '{}'",
                    spec.name,
                    self.scope_name
                );
            }
            let policy = self.rule(spec)?;
            self.hierarchy.insert_rule(self.scope, policy)?;
        }
        Ok(())
    }

    fn rule(&self, spec: &RuleSpec) -> Result<Policy> {
        let owner = format!("rule '{}'", spec.name);
        let addresses = |names: &[String]| -> Result<Vec<AddressRef>> {
            names
                .iter()
                .map(|n| {
                    self.resolve(n, ObjectKind::Address, &owner)
                        .map(|o| o.as_address_ref())
                })
                .filter_map(Result::transpose)
                .collect()
        };

        let mut policy = Policy::new(spec.name.clone(), spec.action);
        policy.source_zones = spec.source_zones.clone();
        policy.destination_zones = spec.destination_zones.clone();
        policy.source_addresses = addresses(&spec.source_addresses)?;
        policy.destination_addresses = addresses(&spec.destination_addresses)?;
        policy.services = spec
            .services
            .iter()
            .map(|n| {
                self.resolve(n, ObjectKind::Service, &owner)
                    .map(|o| o.as_service_ref())
            })
            .filter_map(Result::transpose)
            .collect::<Result<Vec<ServiceRef>>>()?;
        policy.applications = spec
            .applications
            .iter()
            .map(|n| {
                self.resolve(n, ObjectKind::Application, &owner)
                    .map(|o| o.as_application_ref())
            })
            .filter_map(Result::transpose)
            .collect::<Result<Vec<ApplicationRef>>>()?;
        policy.description = spec.description.clone();
        policy.logging = spec.logging.clone();
        policy.rulebase = spec.rulebase;
        Ok(policy)
    }
}

fn is_builtin(kind: ObjectKind, name: &str) -> bool {
    use crate::hierarchy::APPLICATION_DEFAULT;
    use crate::matcher::ANY;
    match kind {
        ObjectKind::Address | ObjectKind::Application => name == ANY,
        ObjectKind::Service => name == ANY || name == APPLICATION_DEFAULT,
        _ => false,
    }
}

/// Build a hierarchy straight from YAML, panicking on any error.
#[cfg(test)]
pub(crate) fn hierarchy_from_yaml(yaml: &str) -> ScopeHierarchy {
    let config = load_from_str(yaml).expect("fixture parses");
    build_hierarchy(&config).expect("fixture builds")
}
