use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use decision_log::{DecisionEntry, DecisionEventType, DecisionSink};
use policy_engine::schema::DeviceConfig;
use policy_engine::{
    loader, CandidatePolicy, DeviceDriver, NamingConfig, ScopeHierarchy, ScopeSpec,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::apply;
use crate::settings::DriverSettings;

/// A device whose configuration is a canonical YAML document on disk.
///
/// Applying a decision rewrites the document. Applies are serialized and
/// each one re-reads the file first, so concurrent callers never lose each
/// other's changes.
pub struct FileDriver {
    path: PathBuf,
    sink: Option<DecisionSink>,
    /// Names for objects created in a scope other than the candidate's.
    naming: NamingConfig,
    apply_lock: Mutex<()>,
}

impl FileDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sink: None,
            naming: NamingConfig::default(),
            apply_lock: Mutex::new(()),
        }
    }

    /// A driver for the settings' device config that records applied
    /// changes in the settings' decision log.
    pub async fn from_settings(settings: &DriverSettings) -> anyhow::Result<Self> {
        let (sink, _handle) = DecisionSink::start(&settings.decision_log)
            .await
            .with_context(|| {
                format!(
                    "failed to open decision log {}",
                    settings.decision_log.display()
                )
            })?;
        Ok(Self::new(&settings.device_config)
            .with_sink(sink)
            .with_naming(settings.engine.naming.clone()))
    }

    pub fn with_naming(mut self, naming: NamingConfig) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_sink(mut self, sink: DecisionSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `config` next to the target and rename it into place.
    async fn store(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let text = serde_yml::to_string(config).context("failed to serialize device config")?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        tokio::fs::write(&staging, text)
            .await
            .with_context(|| format!("failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for FileDriver {
    type Raw = DeviceConfig;

    async fn fetch(&self) -> anyhow::Result<DeviceConfig> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read device config {}", self.path.display()))?;
        loader::load_from_str(&text)
            .with_context(|| format!("invalid device config {}", self.path.display()))
    }

    fn parse_scopes(&self, raw: &DeviceConfig) -> anyhow::Result<Vec<ScopeSpec>> {
        for name in raw.objects.keys() {
            let declared = name == policy_engine::ROOT_SCOPE
                || raw.scopes.iter().any(|scope| &scope.name == name);
            anyhow::ensure!(declared, "objects defined for undeclared scope '{name}'");
        }
        Ok(raw.scopes.clone())
    }

    fn parse_addresses(
        &self,
        raw: &DeviceConfig,
        hierarchy: &mut ScopeHierarchy,
    ) -> anyhow::Result<()> {
        loader::populate_addresses(hierarchy, raw)
    }

    fn parse_services(
        &self,
        raw: &DeviceConfig,
        hierarchy: &mut ScopeHierarchy,
    ) -> anyhow::Result<()> {
        loader::populate_services(hierarchy, raw)
    }

    fn parse_applications(
        &self,
        raw: &DeviceConfig,
        hierarchy: &mut ScopeHierarchy,
    ) -> anyhow::Result<()> {
        loader::populate_applications(hierarchy, raw)
    }

    fn parse_policies(
        &self,
        raw: &DeviceConfig,
        hierarchy: &mut ScopeHierarchy,
    ) -> anyhow::Result<()> {
        loader::populate_rules(hierarchy, raw)
    }

    async fn refresh(&self) -> anyhow::Result<ScopeHierarchy> {
        let raw = self.fetch().await?;
        let hierarchy = self.parse(&raw)?;
        info!(
            path = %self.path.display(),
            scopes = hierarchy.scopes().count(),
            "refreshed device configuration"
        );
        if let Some(sink) = &self.sink {
            sink.log(DecisionEntry::new(
                DecisionEventType::ConfigRefreshed,
                policy_engine::ROOT_SCOPE,
                serde_json::json!({
                    "path": self.path.display().to_string(),
                    "scopes": hierarchy.scopes().count(),
                }),
            ))
            .await;
        }
        Ok(hierarchy)
    }

    async fn apply_candidate(&self, candidate: &CandidatePolicy) -> anyhow::Result<()> {
        let _guard = self.apply_lock.lock().await;
        let mut config = self.fetch().await?;
        let change = apply::apply_candidate(&mut config, candidate, &self.naming)?;
        self.store(&config).await?;
        debug!(
            scope = %candidate.scope,
            method = candidate.method_kind().as_str(),
            rule = ?change.rule,
            created = change.created.len(),
            "applied candidate policy"
        );

        if let Some(sink) = &self.sink {
            let details = serde_json::json!({
                "method": candidate.method_kind().as_str(),
                "rule": change.rule,
                "created": change.created,
                "tagged": change.tagged,
            });
            sink.log(
                DecisionEntry::new(DecisionEventType::CandidateApplied, &candidate.scope, details)
                    .with_candidate(candidate.clone()),
            )
            .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_engine::{Action, Criteria, EngineConfig, MethodKind, PolicyEngine};

    const DEVICE: &str = r#"
version: "1.0"
scopes:
  - name: branch
    parent: shared
objects:
  shared:
    addresses:
      - {name: web-1, value: 10.1.1.10}
    services:
      - {name: https, protocol: tcp, port: 443}
    applications:
      - {name: web-browsing, identification: port, default_ports: ["tcp/80,443"]}
  branch:
    rules:
      - name: to-web
        source_zones: [trust]
        destination_zones: [dmz]
        source_addresses: [any]
        destination_addresses: [web-1]
        services: [https]
        action: allow
"#;

    struct Workspace {
        dir: PathBuf,
    }

    impl Workspace {
        async fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("file-driver-{}", uuid::Uuid::new_v4()));
            tokio::fs::create_dir_all(&dir).await.unwrap();
            tokio::fs::write(dir.join("device.yaml"), DEVICE).await.unwrap();
            Self { dir }
        }

        fn settings(&self) -> DriverSettings {
            DriverSettings {
                device_config: self.dir.join("device.yaml"),
                decision_log: self.dir.join("decisions.jsonl"),
                engine: EngineConfig::default(),
            }
        }
    }

    impl Drop for Workspace {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn append_request() -> Criteria {
        Criteria::new()
            .source_zones(["trust"])
            .destination_zones(["dmz"])
            .source_addresses(["any"])
            .destination_addresses(["10.1.1.10"])
            .services(["tcp/8443".parse().unwrap()])
            .action(Action::Allow)
    }

    #[tokio::test]
    async fn refresh_loads_applications() {
        let ws = Workspace::new().await;
        let driver = FileDriver::new(ws.settings().device_config);
        let hierarchy = driver.refresh().await.unwrap();
        let branch = hierarchy.scope("branch").unwrap();
        assert!(hierarchy
            .find(branch, "web-browsing", policy_engine::ObjectKind::Application)
            .is_some());
    }

    #[tokio::test]
    async fn missing_device_config_names_the_file() {
        let driver = FileDriver::new("/nonexistent/rulewright/device.yaml");
        let err = driver.refresh().await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to read device config"));
    }

    #[tokio::test]
    async fn from_settings_opens_decision_log() {
        let ws = Workspace::new().await;
        let mut settings = ws.settings();
        settings.decision_log = ws.dir.join("logs").join("decisions.jsonl");
        let driver = FileDriver::from_settings(&settings).await.unwrap();
        assert_eq!(driver.path(), settings.device_config.as_path());
        assert!(settings.decision_log.exists());
    }

    #[test]
    fn parse_scopes_rejects_undeclared_scope() {
        let driver = FileDriver::new("unused.yaml");
        let raw = loader::load_from_str("objects:\n  nowhere: {}\n").unwrap();
        assert!(driver.parse_scopes(&raw).is_err());
    }

    #[tokio::test]
    async fn apply_rewrites_file_and_logs() {
        let ws = Workspace::new().await;
        let settings = ws.settings();
        let (sink, handle) = DecisionSink::start(&settings.decision_log).await.unwrap();
        let driver = FileDriver::new(&settings.device_config).with_sink(sink);
        let engine = PolicyEngine::new(settings.engine.clone());
        driver.refresh_into(&engine).await.unwrap();

        let candidate = engine
            .candidate_resolve(&append_request(), Some("branch"))
            .unwrap();
        assert_eq!(candidate.method_kind(), MethodKind::Append);
        driver.apply_candidate(&candidate).await.unwrap();

        // The change is visible after the next refresh.
        driver.refresh_into(&engine).await.unwrap();
        assert!(engine
            .candidate_resolve(&append_request(), Some("branch"))
            .is_err());

        // Dropping the driver closes the sink and lets the writer finish.
        drop(driver);
        handle.await.unwrap();
        let entries = decision_log::read_entries(&settings.decision_log)
            .await
            .unwrap();
        let applied: Vec<_> = entries
            .iter()
            .filter(|e| e.event_type == DecisionEventType::CandidateApplied)
            .collect();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].scope, "branch");
        assert_eq!(applied[0].details["rule"], "to-web");
        assert_eq!(applied[0].details["created"][0], "svc-tcp-8443");
        assert!(entries
            .iter()
            .any(|e| e.event_type == DecisionEventType::ConfigRefreshed));
    }

    #[tokio::test]
    async fn failed_apply_leaves_file_untouched() {
        let ws = Workspace::new().await;
        let driver = FileDriver::new(ws.settings().device_config);
        let engine = PolicyEngine::new(EngineConfig::default());
        driver.refresh_into(&engine).await.unwrap();

        let criteria = Criteria::new()
            .source_zones(["guest"])
            .destination_zones(["dmz"])
            .source_addresses(["any"])
            .destination_addresses(["10.1.1.10"])
            .services(["tcp/22".parse().unwrap()])
            .action(Action::Allow);
        let candidate = engine.candidate_resolve(&criteria, Some("branch")).unwrap();
        assert_eq!(candidate.method_kind(), MethodKind::NewPolicy);

        let before = tokio::fs::read_to_string(driver.path()).await.unwrap();
        assert!(driver.apply_candidate(&candidate).await.is_err());
        let after = tokio::fs::read_to_string(driver.path()).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn inherited_rule_is_extended_with_configured_names() {
        let ws = Workspace::new().await;
        tokio::fs::write(
            ws.dir.join("device.yaml"),
            r#"
scopes:
  - name: branch
    parent: shared
objects:
  shared:
    addresses:
      - {name: web, value: 10.9.9.9}
      - {name: db, value: 10.1.1.10}
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
  branch:
    addresses:
      - {name: web, value: 10.1.1.11}
"#,
        )
        .await
        .unwrap();
        let mut settings = ws.settings();
        settings.engine.naming.address_prefix = "host".into();
        let driver = FileDriver::from_settings(&settings).await.unwrap();
        let engine = PolicyEngine::new(settings.engine.clone());
        driver.refresh_into(&engine).await.unwrap();

        let criteria = Criteria::new()
            .source_zones(["trust"])
            .destination_zones(["dmz"])
            .source_addresses(["any"])
            .destination_addresses(["10.1.1.11"])
            .services(["tcp/443".parse().unwrap()])
            .action(Action::Allow);
        let candidate = engine.candidate_resolve(&criteria, Some("branch")).unwrap();
        driver.apply_candidate(&candidate).await.unwrap();

        let config = driver.fetch().await.unwrap();
        let shared = &config.objects["shared"];
        let to_db = shared.rules.iter().find(|r| r.name == "to-db").unwrap();
        assert_eq!(
            to_db.destination_addresses,
            vec!["db".to_string(), "host-10.1.1.11_32".to_string()]
        );
        assert!(shared.addresses.iter().any(|a| a.name == "host-10.1.1.11_32"));
        assert_eq!(config.objects["branch"].addresses.len(), 1);
    }
}
