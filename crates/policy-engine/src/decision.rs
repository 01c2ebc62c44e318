//! Decision records produced by candidate resolution and effective-policy
//! lookups.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::criteria::{Attribute, Criteria};
use crate::error::{EngineError, Result};
use crate::matcher;
use crate::model::{Action, ObjectKind, Policy, Rulebase};
use crate::tags::TagDelta;

/// An object the apply step must create before the change can land.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NewObject {
    pub kind: ObjectKind,
    pub name: String,
    /// Address value, or a `protocol/port` service key.
    pub value: String,
}

/// One way to bring an address into a dynamic group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagOption {
    /// Address object to tag. Either an existing object or one listed in
    /// `new_objects`.
    pub object: String,
    /// Whether `object` already exists on the device.
    pub existing: bool,
    /// The dynamic group the tags would place the object in.
    pub group: String,
    pub current_tags: BTreeSet<String>,
    pub delta: TagDelta,
}

/// The tagging action picked for one requested address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagChoice {
    pub object: String,
    pub group: String,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    NewPolicy,
    Append,
    Tag,
}

impl MethodKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MethodKind::NewPolicy => "new_policy",
            MethodKind::Append => "append",
            MethodKind::Tag => "tag",
        }
    }
}

/// How a request will be satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateMethod {
    /// No existing rule can absorb the request; `policy` is built from the
    /// full criteria and still needs a name.
    NewPolicy { policy: Policy },
    /// Add `delta` to the `target` attribute of the first matched rule.
    Append {
        target: Attribute,
        delta: BTreeSet<String>,
        matched_policies: Vec<Arc<Policy>>,
    },
    /// The target attribute of the matched rule references a dynamic group;
    /// the requested addresses join it through tags instead.
    Tag {
        target: Attribute,
        matched_policies: Vec<Arc<Policy>>,
        options: BTreeMap<String, Vec<TagOption>>,
        choices: BTreeMap<String, TagChoice>,
    },
}

impl CandidateMethod {
    pub fn kind(&self) -> MethodKind {
        match self {
            CandidateMethod::NewPolicy { .. } => MethodKind::NewPolicy,
            CandidateMethod::Append { .. } => MethodKind::Append,
            CandidateMethod::Tag { .. } => MethodKind::Tag,
        }
    }
}

/// The outcome of [`crate::PolicyEngine::candidate_resolve`].
///
/// Only two mutations are allowed after resolution: naming a new policy and
/// choosing tags for a Tag decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "CandidateRecord", try_from = "CandidateRecord")]
pub struct CandidatePolicy {
    pub criteria: Criteria,
    pub scope: String,
    pub rulebase_placement: Option<Rulebase>,
    /// Requested values that already have an object, per kind: value -> name.
    pub linked_objects: BTreeMap<ObjectKind, BTreeMap<String, String>>,
    pub new_objects: Vec<NewObject>,
    pub method: CandidateMethod,
}

const POLICY_NAME_PATTERN: &str = "^[A-Za-z0-9_-]+$";

fn policy_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(POLICY_NAME_PATTERN)
            .unwrap_or_else(|e| panic!("policy name pattern failed to compile: {e}"))
    })
}

impl CandidatePolicy {
    pub fn method_kind(&self) -> MethodKind {
        self.method.kind()
    }

    /// Rules an Append or Tag decision applies to, first one being the
    /// target. Empty for a new policy.
    pub fn matched_policies(&self) -> &[Arc<Policy>] {
        match &self.method {
            CandidateMethod::NewPolicy { .. } => &[],
            CandidateMethod::Append {
                matched_policies, ..
            }
            | CandidateMethod::Tag {
                matched_policies, ..
            } => matched_policies,
        }
    }

    /// The rule being created or changed.
    pub fn policy(&self) -> Option<&Policy> {
        match &self.method {
            CandidateMethod::NewPolicy { policy } => Some(policy),
            _ => self.matched_policies().first().map(Arc::as_ref),
        }
    }

    /// Object name linked to `value`, if one exists.
    pub fn linked_object(&self, kind: ObjectKind, value: &str) -> Option<&str> {
        self.linked_objects
            .get(&kind)
            .and_then(|values| values.get(value))
            .map(String::as_str)
    }

    /// Name the rule a NewPolicy decision will create.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let CandidateMethod::NewPolicy { policy } = &mut self.method else {
            return Err(EngineError::BadCandidatePolicy(
                "only a new policy can be named".into(),
            ));
        };
        if !policy_name_pattern().is_match(name) {
            return Err(EngineError::BadCandidatePolicy(format!(
                "policy name '{name}' contains invalid characters"
            )));
        }
        policy.name = name.to_string();
        Ok(())
    }

    /// Record the tags to add to `object` so that `address` joins a dynamic
    /// group. The tags must complete at least one membership alternative
    /// offered for that object.
    pub fn choose_tags(
        &mut self,
        address: &str,
        object: &str,
        tags: BTreeSet<String>,
    ) -> Result<()> {
        let CandidateMethod::Tag {
            options, choices, ..
        } = &mut self.method
        else {
            return Err(EngineError::BadCandidatePolicy(
                "tags can only be chosen for a tag decision".into(),
            ));
        };

        let address = matcher::normalize_address(address);
        let offered = options.get(&address).ok_or_else(|| {
            EngineError::BadCandidatePolicy(format!("no tag options for address '{address}'"))
        })?;
        let option = offered
            .iter()
            .filter(|o| o.object == object)
            .find(|o| o.delta.completed_by(&tags))
            .ok_or_else(|| {
                EngineError::BadCandidatePolicy(format!(
                    "tags {tags:?} do not place '{object}' in any dynamic group"
                ))
            })?;

        let choice = TagChoice {
            object: object.to_string(),
            group: option.group.clone(),
            tags,
        };
        choices.insert(address, choice);
        Ok(())
    }

    /// Check the record carries everything the apply step needs.
    pub fn finalize(&self) -> Result<()> {
        match &self.method {
            CandidateMethod::NewPolicy { policy } => {
                let missing = |what: &str| -> Result<()> {
                    Err(EngineError::BadCandidatePolicy(format!(
                        "new policy is missing {what}"
                    )))
                };
                if policy.name.is_empty() {
                    return missing("a name");
                }
                if self.criteria.action.is_none() {
                    return missing("an action");
                }
                if policy.source_zones.is_empty() || policy.destination_zones.is_empty() {
                    return missing("source or destination zones");
                }
                if self.criteria.source_addresses.is_none()
                    || self.criteria.destination_addresses.is_none()
                {
                    return missing("source or destination addresses");
                }
                if self.criteria.services.is_none() && self.criteria.applications.is_none() {
                    return missing("services or applications");
                }
                Ok(())
            }
            CandidateMethod::Append { delta, .. } => {
                if delta.is_empty() {
                    return Err(EngineError::BadCandidatePolicy(
                        "append decision has nothing to add".into(),
                    ));
                }
                Ok(())
            }
            CandidateMethod::Tag {
                options, choices, ..
            } => {
                if let Some(address) = options.keys().find(|a| !choices.contains_key(*a)) {
                    return Err(EngineError::BadCandidatePolicy(format!(
                        "no tags chosen for address '{address}'"
                    )));
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Flat wire form
// ---------------------------------------------------------------------------

/// JSON shape of a [`CandidatePolicy`]; every variant's fields sit side by
/// side and `method` says which ones apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CandidateRecord {
    policy_criteria: Criteria,
    #[serde(default)]
    matched_policies: Vec<Arc<Policy>>,
    #[serde(default)]
    policy: Option<Policy>,
    method: MethodKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_element: Option<Attribute>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    delta: BTreeSet<String>,
    #[serde(default)]
    linked_objects: BTreeMap<ObjectKind, BTreeMap<String, String>>,
    #[serde(default)]
    new_objects: Vec<NewObject>,
    #[serde(default)]
    tag_options: BTreeMap<String, Vec<TagOption>>,
    #[serde(default)]
    tag_choices: BTreeMap<String, TagChoice>,
    scope: String,
    #[serde(default)]
    rulebase_placement: Option<Rulebase>,
}

impl From<CandidatePolicy> for CandidateRecord {
    fn from(candidate: CandidatePolicy) -> Self {
        let policy = candidate.policy().cloned();
        let mut record = CandidateRecord {
            policy_criteria: candidate.criteria,
            matched_policies: Vec::new(),
            policy,
            method: candidate.method.kind(),
            target_element: None,
            delta: BTreeSet::new(),
            linked_objects: candidate.linked_objects,
            new_objects: candidate.new_objects,
            tag_options: BTreeMap::new(),
            tag_choices: BTreeMap::new(),
            scope: candidate.scope,
            rulebase_placement: candidate.rulebase_placement,
        };
        match candidate.method {
            CandidateMethod::NewPolicy { .. } => {}
            CandidateMethod::Append {
                target,
                delta,
                matched_policies,
            } => {
                record.target_element = Some(target);
                record.delta = delta;
                record.matched_policies = matched_policies;
            }
            CandidateMethod::Tag {
                target,
                matched_policies,
                options,
                choices,
            } => {
                record.target_element = Some(target);
                record.matched_policies = matched_policies;
                record.tag_options = options;
                record.tag_choices = choices;
            }
        }
        record
    }
}

impl TryFrom<CandidateRecord> for CandidatePolicy {
    type Error = EngineError;

    fn try_from(record: CandidateRecord) -> Result<Self> {
        let target = || {
            record.target_element.ok_or_else(|| {
                EngineError::BadCandidatePolicy("record has no target element".into())
            })
        };
        let method = match record.method {
            MethodKind::NewPolicy => CandidateMethod::NewPolicy {
                policy: record.policy.ok_or_else(|| {
                    EngineError::BadCandidatePolicy("new policy record has no policy".into())
                })?,
            },
            MethodKind::Append => CandidateMethod::Append {
                target: target()?,
                delta: record.delta,
                matched_policies: record.matched_policies,
            },
            MethodKind::Tag => CandidateMethod::Tag {
                target: target()?,
                matched_policies: record.matched_policies,
                options: record.tag_options,
                choices: record.tag_choices,
            },
        };
        Ok(CandidatePolicy {
            criteria: record.policy_criteria,
            scope: record.scope,
            rulebase_placement: record.rulebase_placement,
            linked_objects: record.linked_objects,
            new_objects: record.new_objects,
            method,
        })
    }
}

// ---------------------------------------------------------------------------
// Effective policy
// ---------------------------------------------------------------------------

/// Every rule an address appears in, split by direction and grouped by
/// action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectivePolicy {
    pub target: String,
    pub as_source: BTreeMap<Action, Vec<Arc<Policy>>>,
    pub as_destination: BTreeMap<Action, Vec<Arc<Policy>>>,
}

impl EffectivePolicy {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            as_source: BTreeMap::new(),
            as_destination: BTreeMap::new(),
        }
    }

    pub fn add_source(&mut self, policy: Arc<Policy>) {
        self.as_source.entry(policy.action).or_default().push(policy);
    }

    pub fn add_destination(&mut self, policy: Arc<Policy>) {
        self.as_destination
            .entry(policy.action)
            .or_default()
            .push(policy);
    }

    /// Every rule on either side; a rule naming the target on both sides
    /// appears twice.
    pub fn rules(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.as_source
            .values()
            .chain(self.as_destination.values())
            .flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.as_source.is_empty() && self.as_destination.is_empty()
    }

    /// Service keys reachable from the target as source, per action.
    pub fn source_services(&self) -> BTreeMap<Action, BTreeSet<String>> {
        services_by_action(&self.as_source)
    }

    /// Service keys the target is reachable on as destination, per action.
    pub fn destination_services(&self) -> BTreeMap<Action, BTreeSet<String>> {
        services_by_action(&self.as_destination)
    }
}

fn services_by_action(
    side: &BTreeMap<Action, Vec<Arc<Policy>>>,
) -> BTreeMap<Action, BTreeSet<String>> {
    side.iter()
        .map(|(action, policies)| {
            let keys = policies
                .iter()
                .flat_map(|p| p.services.iter())
                .flat_map(|s| s.values())
                .map(|v| v.key())
                .collect();
            (*action, keys)
        })
        .collect()
}
