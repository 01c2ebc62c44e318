use thiserror::Error;

use crate::model::ObjectKind;

/// Decision errors raised by the engine.
///
/// All of these are local and synchronous; none of them is worth retrying
/// against the same snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The criteria map carried a key outside the supported attribute set.
    #[error("invalid criteria key '{0}'")]
    InvalidCriteriaKey(String),

    /// The requested traffic is already permitted by an existing rule.
    #[error("requested traffic is already covered by rule '{rule}'")]
    ShadowedPolicy { rule: String },

    /// A decision record is missing what the attempted action needs.
    #[error("bad candidate policy: {0}")]
    BadCandidatePolicy(String),

    /// A value has no backing object and creating one is not allowed.
    #[error("no {kind} object found for value '{value}' and object creation is disabled")]
    ObjectResolutionFailure { kind: ObjectKind, value: String },

    /// The named configuration scope does not exist in the hierarchy.
    #[error("scope '{0}' not found")]
    ScopeNotFound(String),

    /// A literal (address, service tuple, tag expression) could not be parsed.
    #[error("invalid {what} '{value}'")]
    InvalidValue { what: &'static str, value: String },
}

impl EngineError {
    pub(crate) fn invalid(what: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            what,
            value: value.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
