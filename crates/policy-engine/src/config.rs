use serde::{Deserialize, Serialize};

use crate::hierarchy::ROOT_SCOPE;
use crate::model::Rulebase;

/// Knobs that shape candidate resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scope used when a request names none.
    #[serde(default = "default_scope")]
    pub default_scope: String,
    /// When false, a value with no backing object is an error instead of an
    /// object to create.
    #[serde(default = "default_true")]
    pub allow_object_creation: bool,
    /// Produce Tag decisions for rules that reference dynamic groups.
    #[serde(default = "default_true")]
    pub dynamic_groups: bool,
    #[serde(default)]
    pub default_rulebase: Option<Rulebase>,
    #[serde(default)]
    pub naming: NamingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_scope: default_scope(),
            allow_object_creation: default_true(),
            dynamic_groups: default_true(),
            default_rulebase: None,
            naming: NamingConfig::default(),
        }
    }
}

/// Prefixes for the names of objects the engine proposes to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingConfig {
    #[serde(default = "default_address_prefix")]
    pub address_prefix: String,
    #[serde(default = "default_service_prefix")]
    pub service_prefix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            address_prefix: default_address_prefix(),
            service_prefix: default_service_prefix(),
        }
    }
}

impl NamingConfig {
    /// `addr-10.0.0.0_24` for `10.0.0.0/24`.
    pub fn address_name(&self, value: &str) -> String {
        format!("{}-{}", self.address_prefix, value.replace('/', "_"))
    }

    /// `svc-tcp-8443` for `tcp/8443`.
    pub fn service_name(&self, protocol: &str, port: &str) -> String {
        format!("{}-{}-{}", self.service_prefix, protocol, port)
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_scope() -> String {
    ROOT_SCOPE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_address_prefix() -> String {
    "addr".to_string()
}

fn default_service_prefix() -> String {
    "svc".to_string()
}
