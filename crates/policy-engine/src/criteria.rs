use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::matcher;
use crate::model::{Action, LogFlag, ServiceValue};

/// The rule attributes a request may constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    SourceZones,
    DestinationZones,
    SourceAddresses,
    DestinationAddresses,
    Services,
    Applications,
    Action,
    Logging,
}

impl Attribute {
    pub const ALL: [Attribute; 8] = [
        Attribute::SourceZones,
        Attribute::DestinationZones,
        Attribute::SourceAddresses,
        Attribute::DestinationAddresses,
        Attribute::Services,
        Attribute::Applications,
        Attribute::Action,
        Attribute::Logging,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Attribute::SourceZones => "source_zones",
            Attribute::DestinationZones => "destination_zones",
            Attribute::SourceAddresses => "source_addresses",
            Attribute::DestinationAddresses => "destination_addresses",
            Attribute::Services => "services",
            Attribute::Applications => "applications",
            Attribute::Action => "action",
            Attribute::Logging => "logging",
        }
    }

    /// Address lists are the only attributes with network semantics.
    pub fn is_address(self) -> bool {
        matches!(self, Attribute::SourceAddresses | Attribute::DestinationAddresses)
    }

    /// Whether missing values of this attribute can be added to an existing
    /// rule. A rule has exactly one action, and logging changes are not
    /// traffic changes.
    pub fn is_appendable(self) -> bool {
        !matches!(self, Attribute::Action | Attribute::Logging)
    }
}

impl FromStr for Attribute {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Attribute::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| EngineError::InvalidCriteriaKey(s.to_string()))
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested traffic. An absent attribute places no constraint on a match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Criteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_zones: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_zones: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_addresses: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_addresses: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<BTreeSet<ServiceValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applications: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<BTreeSet<LogFlag>>,
}

fn strings<I, S>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(Into::into).collect()
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and convert a loosely typed criteria map.
    ///
    /// Keys are checked against the attribute allow-list before any value is
    /// looked at, so an unknown key is always reported as
    /// [`EngineError::InvalidCriteriaKey`].
    pub fn from_map(map: serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        for key in map.keys() {
            key.parse::<Attribute>()?;
        }
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| EngineError::invalid("criteria", e.to_string()))
    }

    pub fn source_zones<I: IntoIterator<Item = S>, S: Into<String>>(mut self, v: I) -> Self {
        self.source_zones = Some(strings(v));
        self
    }

    pub fn destination_zones<I: IntoIterator<Item = S>, S: Into<String>>(mut self, v: I) -> Self {
        self.destination_zones = Some(strings(v));
        self
    }

    pub fn source_addresses<I: IntoIterator<Item = S>, S: Into<String>>(mut self, v: I) -> Self {
        self.source_addresses = Some(strings(v));
        self
    }

    pub fn destination_addresses<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        v: I,
    ) -> Self {
        self.destination_addresses = Some(strings(v));
        self
    }

    pub fn services<I: IntoIterator<Item = ServiceValue>>(mut self, v: I) -> Self {
        self.services = Some(v.into_iter().collect());
        self
    }

    pub fn applications<I: IntoIterator<Item = S>, S: Into<String>>(mut self, v: I) -> Self {
        self.applications = Some(strings(v));
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn logging<I: IntoIterator<Item = LogFlag>>(mut self, v: I) -> Self {
        self.logging = Some(v.into_iter().collect());
        self
    }

    /// True when the attribute was supplied, even as an empty list.
    pub fn is_set(&self, attr: Attribute) -> bool {
        match attr {
            Attribute::SourceZones => self.source_zones.is_some(),
            Attribute::DestinationZones => self.destination_zones.is_some(),
            Attribute::SourceAddresses => self.source_addresses.is_some(),
            Attribute::DestinationAddresses => self.destination_addresses.is_some(),
            Attribute::Services => self.services.is_some(),
            Attribute::Applications => self.applications.is_some(),
            Attribute::Action => self.action.is_some(),
            Attribute::Logging => self.logging.is_some(),
        }
    }

    /// Supplied attributes, in canonical order.
    pub fn attributes(&self) -> Vec<Attribute> {
        Attribute::ALL
            .into_iter()
            .filter(|a| self.is_set(*a))
            .collect()
    }

    /// Supplied attributes that carry at least one value.
    pub fn non_empty_attributes(&self) -> Vec<Attribute> {
        Attribute::ALL
            .into_iter()
            .filter(|a| self.values(*a).is_some_and(|v| !v.is_empty()))
            .collect()
    }

    /// The comparable string values of one attribute, or `None` when it was
    /// not supplied. Addresses are normalized, services rendered as
    /// `protocol/port` keys, the action as its canonical name.
    pub fn values(&self, attr: Attribute) -> Option<BTreeSet<String>> {
        match attr {
            Attribute::SourceZones => self.source_zones.clone(),
            Attribute::DestinationZones => self.destination_zones.clone(),
            Attribute::SourceAddresses => self
                .source_addresses
                .as_ref()
                .map(|v| v.iter().map(|a| matcher::normalize_address(a)).collect()),
            Attribute::DestinationAddresses => self
                .destination_addresses
                .as_ref()
                .map(|v| v.iter().map(|a| matcher::normalize_address(a)).collect()),
            Attribute::Services => self
                .services
                .as_ref()
                .map(|v| v.iter().map(ServiceValue::key).collect()),
            Attribute::Applications => self.applications.clone(),
            Attribute::Action => self.action.map(|a| BTreeSet::from([a.to_string()])),
            Attribute::Logging => self
                .logging
                .as_ref()
                .map(|v| v.iter().map(|f| f.as_str().to_string()).collect()),
        }
    }

    /// A copy with `attr` removed.
    pub fn without(&self, attr: Attribute) -> Self {
        let mut out = self.clone();
        match attr {
            Attribute::SourceZones => out.source_zones = None,
            Attribute::DestinationZones => out.destination_zones = None,
            Attribute::SourceAddresses => out.source_addresses = None,
            Attribute::DestinationAddresses => out.destination_addresses = None,
            Attribute::Services => out.services = None,
            Attribute::Applications => out.applications = None,
            Attribute::Action => out.action = None,
            Attribute::Logging => out.logging = None,
        }
        out
    }
}
