use async_trait::async_trait;
use tracing::info;

use crate::decision::CandidatePolicy;
use crate::evaluator::PolicyEngine;
use crate::hierarchy::{ScopeHierarchy, ScopeSpec};

/// A backend that can supply a device's configuration and push decisions
/// back to it.
///
/// Implementors fetch the raw configuration in whatever form the device
/// speaks and parse it into canonical objects. The provided
/// [`refresh`](DeviceDriver::refresh) runs the phases in dependency order:
/// scopes, then addresses, services and applications, and rules last, so a
/// rule can reference any object from its own scope or an ancestor.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// The unparsed configuration as fetched from the device.
    type Raw: Send + Sync;

    async fn fetch(&self) -> anyhow::Result<Self::Raw>;

    /// Scope relationships. The root scope exists implicitly.
    fn parse_scopes(&self, raw: &Self::Raw) -> anyhow::Result<Vec<ScopeSpec>>;

    /// Addresses and address groups.
    fn parse_addresses(
        &self,
        raw: &Self::Raw,
        hierarchy: &mut ScopeHierarchy,
    ) -> anyhow::Result<()>;

    /// Services and service groups.
    fn parse_services(
        &self,
        raw: &Self::Raw,
        hierarchy: &mut ScopeHierarchy,
    ) -> anyhow::Result<()>;

    /// Devices without application awareness keep the default.
    fn parse_applications(
        &self,
        _raw: &Self::Raw,
        _hierarchy: &mut ScopeHierarchy,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn parse_policies(
        &self,
        raw: &Self::Raw,
        hierarchy: &mut ScopeHierarchy,
    ) -> anyhow::Result<()>;

    /// Run every parse phase over `raw`.
    fn parse(&self, raw: &Self::Raw) -> anyhow::Result<ScopeHierarchy> {
        let mut hierarchy = ScopeHierarchy::from_specs(&self.parse_scopes(raw)?)?;
        self.parse_addresses(raw, &mut hierarchy)?;
        self.parse_services(raw, &mut hierarchy)?;
        self.parse_applications(raw, &mut hierarchy)?;
        self.parse_policies(raw, &mut hierarchy)?;
        Ok(hierarchy)
    }

    /// Fetch and parse a fresh hierarchy.
    async fn refresh(&self) -> anyhow::Result<ScopeHierarchy> {
        let raw = self.fetch().await?;
        let hierarchy = self.parse(&raw)?;
        info!(scopes = hierarchy.scopes().count(), "refreshed device configuration");
        Ok(hierarchy)
    }

    /// Refresh and publish the result as `engine`'s new snapshot.
    async fn refresh_into(&self, engine: &PolicyEngine) -> anyhow::Result<()> {
        let hierarchy = self.refresh().await?;
        engine.publish(hierarchy);
        Ok(())
    }

    /// Push a finalized decision to the device.
    async fn apply_candidate(&self, candidate: &CandidatePolicy) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::criteria::Criteria;
    use crate::loader;
    use crate::model::{Action, ObjectKind};
    use crate::schema::DeviceConfig;
    use parking_lot::Mutex;

    /// Serves a fixed document and remembers what it was asked to apply.
    struct StaticDriver {
        yaml: &'static str,
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceDriver for StaticDriver {
        type Raw = DeviceConfig;

        async fn fetch(&self) -> anyhow::Result<DeviceConfig> {
            loader::load_from_str(self.yaml)
        }

        fn parse_scopes(&self, raw: &DeviceConfig) -> anyhow::Result<Vec<ScopeSpec>> {
            Ok(raw.scopes.clone())
        }

        fn parse_addresses(
            &self,
            raw: &DeviceConfig,
            h: &mut ScopeHierarchy,
        ) -> anyhow::Result<()> {
            loader::populate_addresses(h, raw)
        }

        fn parse_services(
            &self,
            raw: &DeviceConfig,
            h: &mut ScopeHierarchy,
        ) -> anyhow::Result<()> {
            loader::populate_services(h, raw)
        }

        fn parse_policies(
            &self,
            raw: &DeviceConfig,
            h: &mut ScopeHierarchy,
        ) -> anyhow::Result<()> {
            loader::populate_rules(h, raw)
        }

        async fn apply_candidate(&self, candidate: &CandidatePolicy) -> anyhow::Result<()> {
            candidate.finalize()?;
            self.applied.lock().push(candidate.method_kind().as_str().to_string());
            Ok(())
        }
    }

    const FIXTURE: &str = r#"
scopes:
  - name: branch
    parent: shared
objects:
  shared:
    addresses:
      - {name: web, value: 10.1.1.10/32}
    services:
      - {name: https, protocol: tcp, port: 443}
  branch:
    rules:
      - name: to-web
        source_zones: [trust]
        destination_zones: [dmz]
        source_addresses: [any]
        destination_addresses: [web]
        services: [https]
        action: allow
"#;

    fn driver() -> StaticDriver {
        StaticDriver {
            yaml: FIXTURE,
            applied: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn refresh_builds_every_phase() {
        let hierarchy = driver().refresh().await.unwrap();
        let branch = hierarchy.scope("branch").unwrap();
        assert!(hierarchy.find(branch, "web", ObjectKind::Address).is_some());
        assert!(hierarchy.find(branch, "https", ObjectKind::Service).is_some());
        assert_eq!(hierarchy.visible_rules(branch).len(), 1);
    }

    #[tokio::test]
    async fn refresh_into_publishes_snapshot() {
        let engine = PolicyEngine::new(EngineConfig::default());
        driver().refresh_into(&engine).await.unwrap();

        let criteria = Criteria::new().destination_addresses(["10.1.1.10"]);
        let matched = engine
            .policy_match(&criteria, false, true, Some("branch"))
            .unwrap();
        assert_eq!(matched[0].name, "to-web");
    }

    #[tokio::test]
    async fn apply_rejects_unfinished_new_policy() {
        let driver = driver();
        let engine = PolicyEngine::new(EngineConfig::default());
        driver.refresh_into(&engine).await.unwrap();

        let criteria = Criteria::new()
            .source_zones(["guest"])
            .destination_zones(["dmz"])
            .source_addresses(["192.168.50.0/24"])
            .destination_addresses(["10.1.1.10"])
            .services(["tcp/22".parse().unwrap()])
            .action(Action::Allow);
        let mut candidate = engine.candidate_resolve(&criteria, Some("branch")).unwrap();
        assert!(driver.apply_candidate(&candidate).await.is_err());

        candidate.set_name("guest-ssh").unwrap();
        driver.apply_candidate(&candidate).await.unwrap();
        assert_eq!(*driver.applied.lock(), vec!["new_policy".to_string()]);
    }
}
