use std::path::{Path, PathBuf};

use policy_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Canonical YAML device configuration.
    #[serde(default = "default_device_config")]
    pub device_config: PathBuf,
    /// JSON-lines decision log. Applied changes are recorded here.
    #[serde(default = "default_decision_log")]
    pub decision_log: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            device_config: default_device_config(),
            decision_log: default_decision_log(),
            engine: EngineConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_device_config() -> PathBuf {
    PathBuf::from("device.yaml")
}

fn default_decision_log() -> PathBuf {
    PathBuf::from("decisions.jsonl")
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load driver settings from a YAML file.
///
/// A missing file yields the defaults with a warning.
pub fn load(path: &Path) -> anyhow::Result<DriverSettings> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "driver settings not found; using defaults"
        );
        return Ok(DriverSettings::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read settings file {}: {e}", path.display()))?;

    let settings: DriverSettings = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse settings file {}: {e}", path.display()))?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_engine::Rulebase;

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!("settings-{}.yaml", uuid::Uuid::new_v4()));
        let settings = load(&path).unwrap();
        assert_eq!(settings, DriverSettings::default());
        assert_eq!(settings.engine.default_scope, "shared");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let path = std::env::temp_dir().join(format!("settings-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "device_config: /etc/rulewright/fw1.yaml\nengine:\n  default_rulebase: post\n",
        )
        .unwrap();

        let settings = load(&path).unwrap();
        assert_eq!(settings.device_config, PathBuf::from("/etc/rulewright/fw1.yaml"));
        assert_eq!(settings.decision_log, PathBuf::from("decisions.jsonl"));
        assert_eq!(settings.engine.default_rulebase, Some(Rulebase::Post));
        assert!(settings.engine.allow_object_creation);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_file_names_the_path() {
        let path = std::env::temp_dir().join(format!("settings-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "engine: [not, a, map]\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse settings file"));
        let _ = std::fs::remove_file(&path);
    }
}
