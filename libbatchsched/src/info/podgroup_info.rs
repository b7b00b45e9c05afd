use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use common::annotations;
use common::podgroup::PodGroup;

use crate::fit_error::FitErrorHistogram;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGroupInfo {
    pub name: String,
    pub min_available: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConstraint {
    pub topology: String,
    pub required_level: Option<String>,
    pub preferred_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodGroupInfo {
    pub name: String,
    pub queue: String,
    pub priority: i32,
    pub priority_class: Option<String>,
    pub preemptible: bool,
    pub min_available: u32,
    pub sub_groups: BTreeMap<String, SubGroupInfo>,
    pub pod_names: BTreeSet<String>,
    /// Most recent transition to fully-allocated.
    pub last_start_timestamp: Option<DateTime<Utc>>,
    /// Since when the group has held a partial allocation; cleared when the
    /// group is either empty or fully allocated.
    pub partial_since: Option<DateTime<Utc>>,
    pub creation_timestamp: DateTime<Utc>,
    pub topology: Option<TopologyConstraint>,
    pub annotations: BTreeMap<String, String>,
    /// Aggregated scheduling outcome of the current cycle.
    pub fit_errors: FitErrorHistogram,
}

impl PodGroupInfo {
    pub fn new(name: &str, queue: &str, min_available: u32) -> Self {
        Self {
            name: name.to_string(),
            queue: queue.to_string(),
            priority: 0,
            priority_class: None,
            preemptible: false,
            min_available,
            sub_groups: BTreeMap::new(),
            pod_names: BTreeSet::new(),
            last_start_timestamp: None,
            partial_since: None,
            creation_timestamp: Utc::now(),
            topology: None,
            annotations: BTreeMap::new(),
            fit_errors: FitErrorHistogram::default(),
        }
    }

    pub fn from_resource(group: &PodGroup) -> Self {
        let spec = &group.spec;
        let sub_groups = spec
            .sub_groups
            .iter()
            .map(|sg| {
                (
                    sg.name.clone(),
                    SubGroupInfo {
                        name: sg.name.clone(),
                        min_available: sg.min_member,
                    },
                )
            })
            .collect();
        Self {
            priority: spec.priority.unwrap_or(0),
            priority_class: spec.priority_class_name.clone(),
            preemptible: spec.preemptible.unwrap_or(false),
            sub_groups,
            last_start_timestamp: group.status.last_start_timestamp,
            creation_timestamp: group.metadata.creation_timestamp.unwrap_or_else(Utc::now),
            topology: spec.topology_constraint.as_ref().map(|t| TopologyConstraint {
                topology: t.topology.clone(),
                required_level: t.required_level.clone(),
                preferred_level: t.preferred_level.clone(),
            }),
            annotations: group.metadata.annotations.clone(),
            ..Self::new(&group.metadata.name, &spec.queue, spec.min_member)
        }
    }

    /// Expected runtime from the group's annotation. Missing or malformed
    /// values yield None so requeue skips the group conservatively.
    pub fn expected_runtime(&self) -> Option<Duration> {
        parse_duration(self.annotations.get(annotations::EXPECTED_RUNTIME)?)
    }

    pub fn requeue_not_before(&self) -> Option<DateTime<Utc>> {
        self.annotations
            .get(annotations::REQUEUE_NOT_BEFORE)?
            .parse::<DateTime<Utc>>()
            .ok()
    }
}

/// Parses "2h", "90m", "45s" or a bare second count.
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (number, unit) = match s.char_indices().rfind(|(_, c)| c.is_ascii_digit()) {
        Some((i, _)) => s.split_at(i + 1),
        None => return None,
    };
    let value: i64 = number.parse().ok()?;
    match unit {
        "h" => Some(Duration::hours(value)),
        "m" => Some(Duration::minutes(value)),
        "s" | "" => Some(Duration::seconds(value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_runtime_parsing() {
        let mut group = PodGroupInfo::new("g", "q", 1);
        group
            .annotations
            .insert(annotations::EXPECTED_RUNTIME.to_string(), "1h".to_string());
        assert_eq!(group.expected_runtime(), Some(Duration::hours(1)));

        group
            .annotations
            .insert(annotations::EXPECTED_RUNTIME.to_string(), "90m".to_string());
        assert_eq!(group.expected_runtime(), Some(Duration::minutes(90)));

        group
            .annotations
            .insert(annotations::EXPECTED_RUNTIME.to_string(), "300".to_string());
        assert_eq!(group.expected_runtime(), Some(Duration::seconds(300)));

        group
            .annotations
            .insert(annotations::EXPECTED_RUNTIME.to_string(), "soon".to_string());
        assert_eq!(group.expected_runtime(), None);
    }

    #[test]
    fn test_missing_annotations_are_none() {
        let group = PodGroupInfo::new("g", "q", 1);
        assert!(group.expected_runtime().is_none());
        assert!(group.requeue_not_before().is_none());
    }
}
