use policy_engine::CandidatePolicy;
use serde::{Deserialize, Serialize};

/// A single decision log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: DecisionEventType,
    /// Configuration scope the decision was made in.
    pub scope: String,
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidatePolicy>,
}

impl DecisionEntry {
    /// Create a new `DecisionEntry` with an auto-generated UUID v4 and the
    /// current UTC timestamp. `candidate` defaults to `None`.
    pub fn new(
        event_type: DecisionEventType,
        scope: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event_type,
            scope: scope.into(),
            details,
            candidate: None,
        }
    }

    /// Attach the decision record, consuming and returning `self` for
    /// builder-style usage.
    pub fn with_candidate(mut self, candidate: CandidatePolicy) -> Self {
        self.candidate = Some(candidate);
        self
    }

    /// A resolved request, recorded together with its decision.
    pub fn resolved(candidate: &CandidatePolicy) -> Self {
        let details = serde_json::json!({
            "method": candidate.method_kind().as_str(),
            "matched_policies": candidate
                .matched_policies()
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>(),
        });
        Self::new(
            DecisionEventType::CandidateResolved,
            candidate.scope.clone(),
            details,
        )
        .with_candidate(candidate.clone())
    }

    /// A request already covered by `rule`.
    pub fn shadowed(scope: impl Into<String>, rule: &str) -> Self {
        Self::new(
            DecisionEventType::ShadowDetected,
            scope,
            serde_json::json!({ "rule": rule }),
        )
    }
}

/// The category of decision event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionEventType {
    CandidateResolved,
    ShadowDetected,
    CandidateApplied,
    ConfigRefreshed,
}
