//! # policy-engine
//!
//! Decision core for firewall rule requests.  Given the traffic a caller
//! wants to allow, the engine checks whether an existing rule already
//! covers it and otherwise decides how the rulebase should change: append
//! to an existing rule, tag addresses into a dynamic group, or add a new
//! rule.  Objects are looked up through a scope hierarchy in which child
//! scopes see everything their ancestors define.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use policy_engine::{loader, Criteria, EngineConfig, PolicyEngine};
//!
//! let hierarchy = loader::load_hierarchy("device.yaml").unwrap();
//! let engine = PolicyEngine::with_hierarchy(EngineConfig::default(), hierarchy);
//!
//! let criteria = Criteria::new()
//!     .source_zones(["trust"])
//!     .destination_zones(["untrust"])
//!     .source_addresses(["10.0.0.0/24"])
//!     .destination_addresses(["203.0.113.10"])
//!     .services(["tcp/443".parse().unwrap()]);
//! let candidate = engine.candidate_resolve(&criteria, None).unwrap();
//! println!("{:?}", candidate.method_kind());
//! ```

mod candidate;
mod config;
mod criteria;
mod decision;
mod driver;
mod error;
mod evaluator;
mod hierarchy;
mod index;
pub mod loader;
pub mod matcher;
mod model;
pub mod schema;
pub mod tags;

// Re-export primary public API at crate root.
pub use config::{EngineConfig, NamingConfig};
pub use criteria::{Attribute, Criteria};
pub use decision::{
    CandidateMethod, CandidatePolicy, EffectivePolicy, MethodKind, NewObject, TagChoice,
    TagOption,
};
pub use driver::DeviceDriver;
pub use error::{EngineError, Result};
pub use evaluator::{address_values, matching_policies, policy_matches, policy_values, PolicyEngine};
pub use hierarchy::{
    ScopeHierarchy, ScopeId, ScopeNode, ScopeSpec, APPLICATION_DEFAULT, ROOT_SCOPE,
};
pub use index::ObjectIndex;
pub use model::{
    Action, Address, AddressGroup, AddressKind, AddressRef, Application, ApplicationGroup,
    ApplicationRef, GroupMembership, IdentificationMode, LogFlag, Object, ObjectKind, Policy,
    Port, Rulebase, Service, ServiceDefinition, ServiceGroup, ServiceRef, ServiceTerm,
    ServiceValue, ServiceValueRepr,
};
pub use tags::{TagDelta, TagExpr};
