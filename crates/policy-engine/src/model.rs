//! Canonical firewall object model.
//!
//! Device drivers translate vendor configuration into these types. Objects
//! are immutable once indexed and shared through `Arc`, so rules and groups
//! hold cheap references to the objects they name.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::matcher::{self, Ipv4Span, ANY};
use crate::tags::TagExpr;

// ---------------------------------------------------------------------------
// Object kinds
// ---------------------------------------------------------------------------

/// The object types an index stores, paired singular/group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Address,
    AddressGroup,
    Service,
    ServiceGroup,
    Application,
    ApplicationGroup,
}

impl ObjectKind {
    /// The type sharing this kind's name space (address <-> address group...).
    pub fn sister(self) -> Self {
        match self {
            ObjectKind::Address => ObjectKind::AddressGroup,
            ObjectKind::AddressGroup => ObjectKind::Address,
            ObjectKind::Service => ObjectKind::ServiceGroup,
            ObjectKind::ServiceGroup => ObjectKind::Service,
            ObjectKind::Application => ObjectKind::ApplicationGroup,
            ObjectKind::ApplicationGroup => ObjectKind::Application,
        }
    }

    pub fn is_group(self) -> bool {
        matches!(
            self,
            ObjectKind::AddressGroup | ObjectKind::ServiceGroup | ObjectKind::ApplicationGroup
        )
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::Address => "address",
            ObjectKind::AddressGroup => "address-group",
            ObjectKind::Service => "service",
            ObjectKind::ServiceGroup => "service-group",
            ObjectKind::Application => "application",
            ObjectKind::ApplicationGroup => "application-group",
        })
    }
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Ipv4,
    Dns,
    Range,
    Any,
}

impl AddressKind {
    /// Classify an address literal.
    pub fn infer(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case(ANY) {
            AddressKind::Any
        } else if matcher::is_ipv4(value) {
            if value.contains('-') {
                AddressKind::Range
            } else {
                AddressKind::Ipv4
            }
        } else {
            AddressKind::Dns
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub value: String,
    pub kind: AddressKind,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl Address {
    /// Build an address from a literal, inferring its kind. Bare IPv4 hosts
    /// are stored with an explicit `/32`.
    pub fn new(name: impl Into<String>, value: &str) -> Self {
        let kind = AddressKind::infer(value);
        let value = match kind {
            AddressKind::Any => ANY.to_string(),
            _ => matcher::normalize_address(value),
        };
        Self {
            name: name.into(),
            value,
            kind,
            tags: BTreeSet::new(),
        }
    }

    /// Build an address with an explicit kind, rejecting values that do not
    /// fit it.
    pub fn with_kind(name: impl Into<String>, value: &str, kind: AddressKind) -> Result<Self> {
        let valid = match kind {
            AddressKind::Any => value.trim().eq_ignore_ascii_case(ANY),
            AddressKind::Ipv4 => !value.contains('-') && Ipv4Span::parse(value).is_some(),
            AddressKind::Range => value.contains('-') && Ipv4Span::parse(value).is_some(),
            AddressKind::Dns => !value.trim().is_empty() && !matcher::is_ipv4(value),
        };
        if !valid {
            return Err(EngineError::invalid("address value", value));
        }
        let mut address = Self::new(name, value);
        address.kind = kind;
        Ok(address)
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// The built-in wildcard address every hierarchy root carries.
    pub fn any() -> Self {
        Self::new(ANY, ANY)
    }
}

/// A group is either an explicit member list or a tag expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMembership {
    Static(Vec<AddressRef>),
    Dynamic(TagExpr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressGroup {
    pub name: String,
    pub membership: GroupMembership,
}

impl AddressGroup {
    pub fn new_static(name: impl Into<String>, members: Vec<AddressRef>) -> Self {
        Self {
            name: name.into(),
            membership: GroupMembership::Static(members),
        }
    }

    pub fn new_dynamic(name: impl Into<String>, expression: TagExpr) -> Self {
        Self {
            name: name.into(),
            membership: GroupMembership::Dynamic(expression),
        }
    }

    pub fn expression(&self) -> Option<&TagExpr> {
        match &self.membership {
            GroupMembership::Dynamic(expr) => Some(expr),
            GroupMembership::Static(_) => None,
        }
    }
}

/// A reference to an address-like object held by a rule or a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AddressRef {
    Address(Arc<Address>),
    Group(Arc<AddressGroup>),
}

impl AddressRef {
    pub fn name(&self) -> &str {
        match self {
            AddressRef::Address(a) => &a.name,
            AddressRef::Group(g) => &g.name,
        }
    }

    pub fn is_dynamic_group(&self) -> bool {
        matches!(self, AddressRef::Group(g) if g.expression().is_some())
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// A destination port: single, inclusive range, or a keyword such as `any`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Port {
    Single(u16),
    Range { start: u16, stop: u16 },
    Named(String),
}

impl FromStr for Port {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EngineError::invalid("port", s));
        }
        if let Some((start, stop)) = s.split_once('-') {
            if let (Ok(start), Ok(stop)) = (start.trim().parse::<u16>(), stop.trim().parse::<u16>())
            {
                return match start.cmp(&stop) {
                    std::cmp::Ordering::Equal => Ok(Port::Single(start)),
                    std::cmp::Ordering::Less => Ok(Port::Range { start, stop }),
                    std::cmp::Ordering::Greater => Err(EngineError::invalid("port range", s)),
                };
            }
        }
        match s.parse::<u16>() {
            Ok(port) => Ok(Port::Single(port)),
            Err(_) => Ok(Port::Named(s.to_ascii_lowercase())),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Single(p) => write!(f, "{p}"),
            Port::Range { start, stop } => write!(f, "{start}-{stop}"),
            Port::Named(name) => f.write_str(name),
        }
    }
}

impl TryFrom<String> for Port {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Port> for String {
    fn from(port: Port) -> Self {
        port.to_string()
    }
}

/// The `(protocol, port)` tuple services are compared by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ServiceValueRepr", into = "(String, String)")]
pub struct ServiceValue {
    pub protocol: String,
    pub port: Port,
}

/// Accepted input forms for a service value: `["tcp", "80"]` or `"tcp/80"`.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum ServiceValueRepr {
    Tuple(String, String),
    Text(String),
}

impl ServiceValue {
    pub fn new(protocol: impl Into<String>, port: Port) -> Self {
        Self {
            protocol: protocol.into().to_ascii_lowercase(),
            port,
        }
    }

    pub fn any() -> Self {
        Self::new(ANY, Port::Named(ANY.to_string()))
    }

    /// The string form used for set comparisons. Keyword services whose
    /// protocol and port are the same word (`any`, `application-default`)
    /// collapse to that word.
    pub fn key(&self) -> String {
        match &self.port {
            Port::Named(name) if *name == self.protocol => name.clone(),
            port => format!("{}/{}", self.protocol, port),
        }
    }
}

impl FromStr for ServiceValue {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('/') {
            Some((protocol, port)) if !protocol.trim().is_empty() => {
                Ok(Self::new(protocol.trim(), port.parse()?))
            }
            Some(_) => Err(EngineError::invalid("service", s)),
            None if s.is_empty() => Err(EngineError::invalid("service", s)),
            None => Ok(Self::new(s, Port::Named(s.to_ascii_lowercase()))),
        }
    }
}

impl TryFrom<ServiceValueRepr> for ServiceValue {
    type Error = EngineError;

    fn try_from(repr: ServiceValueRepr) -> Result<Self> {
        match repr {
            ServiceValueRepr::Tuple(protocol, port) => Ok(Self::new(protocol, port.parse()?)),
            ServiceValueRepr::Text(text) => text.parse(),
        }
    }
}

impl From<ServiceValue> for (String, String) {
    fn from(value: ServiceValue) -> Self {
        (value.protocol, value.port.to_string())
    }
}

impl fmt::Display for ServiceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTerm {
    pub name: String,
    pub protocol: String,
    pub port: Port,
}

impl ServiceTerm {
    pub fn value(&self) -> ServiceValue {
        ServiceValue::new(self.protocol.clone(), self.port.clone())
    }
}

/// A service is a single `(protocol, port)` or an ordered list of terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceDefinition {
    Termed { terms: Vec<ServiceTerm> },
    Single { protocol: String, port: Port },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(flatten)]
    pub definition: ServiceDefinition,
}

impl Service {
    pub fn new(name: impl Into<String>, protocol: impl Into<String>, port: Port) -> Self {
        Self {
            name: name.into(),
            definition: ServiceDefinition::Single {
                protocol: protocol.into().to_ascii_lowercase(),
                port,
            },
        }
    }

    pub fn termed(name: impl Into<String>, terms: Vec<ServiceTerm>) -> Self {
        Self {
            name: name.into(),
            definition: ServiceDefinition::Termed { terms },
        }
    }

    pub fn from_value(name: impl Into<String>, value: &ServiceValue) -> Self {
        Self::new(name, value.protocol.clone(), value.port.clone())
    }

    /// The service's value set: one tuple, or one per term.
    pub fn values(&self) -> Vec<ServiceValue> {
        match &self.definition {
            ServiceDefinition::Single { protocol, port } => {
                vec![ServiceValue::new(protocol.clone(), port.clone())]
            }
            ServiceDefinition::Termed { terms } => terms.iter().map(ServiceTerm::value).collect(),
        }
    }

    /// Value-index key; only single-tuple services are indexed by value.
    pub fn value_key(&self) -> Option<String> {
        match &self.definition {
            ServiceDefinition::Single { .. } => self.values().first().map(ServiceValue::key),
            ServiceDefinition::Termed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub name: String,
    pub members: Vec<ServiceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceRef {
    Service(Arc<Service>),
    Group(Arc<ServiceGroup>),
}

impl ServiceRef {
    pub fn name(&self) -> &str {
        match self {
            ServiceRef::Service(s) => &s.name,
            ServiceRef::Group(g) => &g.name,
        }
    }

    /// Flattened values of the service or of every nested group member.
    pub fn values(&self) -> Vec<ServiceValue> {
        match self {
            ServiceRef::Service(s) => s.values(),
            ServiceRef::Group(g) => g.members.iter().flat_map(ServiceRef::values).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Applications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentificationMode {
    Port,
    #[serde(alias = "ident-by-ip-protocol")]
    Protocol,
    #[serde(alias = "ident-by-icmp-type")]
    Icmp,
    #[serde(alias = "ident-by-icmp6-type")]
    Icmp6,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    #[serde(default)]
    pub identification: Option<IdentificationMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implicit_services: Vec<ServiceValue>,
}

impl Application {
    /// Build an application, expanding `default_ports` entries such as
    /// `tcp/80,443` into implicit services when it is port-identified.
    pub fn new(
        name: impl Into<String>,
        identification: Option<IdentificationMode>,
        default_ports: &[String],
    ) -> Result<Self> {
        let mut implicit_services = Vec::new();
        if identification == Some(IdentificationMode::Port) {
            for entry in default_ports {
                let (protocol, ports) = entry
                    .split_once('/')
                    .ok_or_else(|| EngineError::invalid("application default port", entry))?;
                for port in ports.split(',') {
                    implicit_services.push(ServiceValue::new(protocol.trim(), port.parse()?));
                }
            }
        }
        Ok(Self {
            name: name.into(),
            identification,
            implicit_services,
        })
    }

    pub fn matches_service(&self, value: &ServiceValue) -> bool {
        self.implicit_services.iter().any(|s| s == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationGroup {
    pub name: String,
    pub members: Vec<ApplicationRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplicationRef {
    Application(Arc<Application>),
    Group(Arc<ApplicationGroup>),
}

impl ApplicationRef {
    pub fn name(&self) -> &str {
        match self {
            ApplicationRef::Application(a) => &a.name,
            ApplicationRef::Group(g) => &g.name,
        }
    }

    /// Application names reachable from this reference; an application's
    /// value is its name.
    pub fn values(&self) -> Vec<String> {
        match self {
            ApplicationRef::Application(a) => vec![a.name.clone()],
            ApplicationRef::Group(g) => g.members.iter().flat_map(ApplicationRef::values).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Action {
    Allow,
    Deny,
    Reject,
    Drop,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
            Action::Reject => "reject",
            Action::Drop => "drop",
        }
    }
}

impl FromStr for Action {
    type Err = EngineError;

    /// Accepts vendor spellings case-insensitively (`permit` is `allow`).
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" | "permit" | "accept" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            "reject" => Ok(Action::Reject),
            "drop" | "discard" => Ok(Action::Drop),
            _ => Err(EngineError::invalid("action", s)),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Action {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFlag {
    #[serde(alias = "start", alias = "session-init")]
    LogAtStart,
    #[serde(alias = "end", alias = "session-close")]
    LogAtEnd,
}

impl LogFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            LogFlag::LogAtStart => "log_at_start",
            LogFlag::LogAtEnd => "log_at_end",
        }
    }
}

/// Where a rule sits relative to locally defined rules (Panorama pre/post).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rulebase {
    Pre,
    Post,
}

/// A security rule. Matching always works on the flattened values of the
/// referenced objects, never on their names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub source_zones: Vec<String>,
    #[serde(default)]
    pub destination_zones: Vec<String>,
    #[serde(default)]
    pub source_addresses: Vec<AddressRef>,
    #[serde(default)]
    pub destination_addresses: Vec<AddressRef>,
    #[serde(default)]
    pub services: Vec<ServiceRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<ApplicationRef>,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub logging: BTreeSet<LogFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rulebase: Option<Rulebase>,
}

impl Policy {
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            source_zones: Vec::new(),
            destination_zones: Vec::new(),
            source_addresses: Vec::new(),
            destination_addresses: Vec::new(),
            services: Vec::new(),
            applications: Vec::new(),
            action,
            description: None,
            logging: BTreeSet::new(),
            rulebase: None,
        }
    }

    /// Source and destination address references in one pass.
    pub fn address_refs(&self) -> impl Iterator<Item = &AddressRef> {
        self.source_addresses
            .iter()
            .chain(self.destination_addresses.iter())
    }
}

// ---------------------------------------------------------------------------
// Indexed objects
// ---------------------------------------------------------------------------

/// Any object an index can hold, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Address(Arc<Address>),
    AddressGroup(Arc<AddressGroup>),
    Service(Arc<Service>),
    ServiceGroup(Arc<ServiceGroup>),
    Application(Arc<Application>),
    ApplicationGroup(Arc<ApplicationGroup>),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Address(_) => ObjectKind::Address,
            Object::AddressGroup(_) => ObjectKind::AddressGroup,
            Object::Service(_) => ObjectKind::Service,
            Object::ServiceGroup(_) => ObjectKind::ServiceGroup,
            Object::Application(_) => ObjectKind::Application,
            Object::ApplicationGroup(_) => ObjectKind::ApplicationGroup,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Object::Address(o) => &o.name,
            Object::AddressGroup(o) => &o.name,
            Object::Service(o) => &o.name,
            Object::ServiceGroup(o) => &o.name,
            Object::Application(o) => &o.name,
            Object::ApplicationGroup(o) => &o.name,
        }
    }

    /// The value-index key of a leaf object. Groups have none: their value
    /// is derived from members on demand.
    pub fn value_key(&self) -> Option<String> {
        match self {
            Object::Address(a) => Some(a.value.clone()),
            Object::Service(s) => s.value_key(),
            Object::Application(a) => Some(a.name.clone()),
            _ => None,
        }
    }

    pub fn as_address_ref(&self) -> Option<AddressRef> {
        match self {
            Object::Address(a) => Some(AddressRef::Address(Arc::clone(a))),
            Object::AddressGroup(g) => Some(AddressRef::Group(Arc::clone(g))),
            _ => None,
        }
    }

    pub fn as_service_ref(&self) -> Option<ServiceRef> {
        match self {
            Object::Service(s) => Some(ServiceRef::Service(Arc::clone(s))),
            Object::ServiceGroup(g) => Some(ServiceRef::Group(Arc::clone(g))),
            _ => None,
        }
    }

    pub fn as_application_ref(&self) -> Option<ApplicationRef> {
        match self {
            Object::Application(a) => Some(ApplicationRef::Application(Arc::clone(a))),
            Object::ApplicationGroup(g) => Some(ApplicationRef::Group(Arc::clone(g))),
            _ => None,
        }
    }
}
