use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// A node in the hierarchical resource-sharing tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: QueueSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    #[serde(default)]
    pub parent_queue: Option<String>,
    /// Per-resource entitlements keyed by resource name ("cpu", "memory",
    /// "gpu", MIG profile names). Quantities use the platform encoding.
    #[serde(default)]
    pub resources: BTreeMap<String, QueueResourceSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResourceSpec {
    /// Hard entitlement.
    #[serde(default)]
    pub quota: Option<String>,
    /// Share of the residual beyond quota.
    #[serde(default)]
    pub over_quota_weight: Option<f64>,
    /// Hard ceiling; absent means unlimited.
    #[serde(default)]
    pub limit: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_yaml_round() {
        let yaml = r#"
metadata:
  name: team-a
spec:
  parentQueue: root
  resources:
    gpu:
      quota: "4"
      overQuotaWeight: 2.0
    cpu:
      quota: "8"
      limit: "16"
"#;
        let q: Queue = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(q.metadata.name, "team-a");
        assert_eq!(q.spec.parent_queue.as_deref(), Some("root"));
        let gpu = &q.spec.resources["gpu"];
        assert_eq!(gpu.quota.as_deref(), Some("4"));
        assert_eq!(gpu.over_quota_weight, Some(2.0));
        assert!(gpu.limit.is_none());
    }
}
