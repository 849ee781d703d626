//! Label selectors and taints/tolerations.
//!
//! Selectors gate which namespaces may submit to a ClusterQueue; taints and
//! tolerations decide whether a pod-set is compatible with a quota flavor's
//! node class.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label selector with equality requirements and set-based expressions.
///
/// An empty selector matches everything. Callers model "match nothing" as the
/// absence of a selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl LabelSelector {
    /// Check whether the given label set satisfies this selector.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }

        for requirement in &self.match_expressions {
            if !requirement.matches(labels) {
                return false;
            }
        }

        true
    }
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let value = labels.get(&self.key);

        match self.operator {
            LabelSelectorOperator::In => match value {
                Some(v) => self.values.contains(v),
                None => false,
            },
            LabelSelectorOperator::NotIn => match value {
                Some(v) => !self.values.contains(v),
                // Key absent means the value is not in the set
                None => true,
            },
            LabelSelectorOperator::Exists => value.is_some(),
            LabelSelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Taint applied to a class of nodes represented by a flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// Toleration carried by a pod-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    /// Empty key with operator Exists tolerates every taint.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    /// None tolerates all effects for the matched key.
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

impl Toleration {
    /// Check if this toleration covers the given taint.
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }

        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => self.key == taint.key && self.value == taint.value,
        }
    }
}

/// Check that every admission-blocking taint is covered by a toleration.
///
/// Only NoSchedule and NoExecute block admission; PreferNoSchedule is a soft
/// signal left to the node scheduler.
pub fn tolerates_taints(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    taints
        .iter()
        .filter(|t| matches!(t.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute))
        .all(|taint| tolerations.iter().any(|tol| tol.tolerates(taint)))
}

/// Check that a pod-set's node selector does not contradict a flavor's node
/// labels. Keys the flavor does not define are left for the node scheduler.
pub fn selector_compatible(
    node_selector: &HashMap<String, String>,
    flavor_labels: &HashMap<String, String>,
) -> bool {
    node_selector.iter().all(|(key, value)| {
        flavor_labels
            .get(key)
            .map(|flavor_value| flavor_value == value)
            .unwrap_or(true)
    })
}
