//! Topology-constrained placement. For a group requiring a level, the
//! candidate node set is restricted to a single domain at that level; the
//! scoring half pulls pods of one group toward the preferred level.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::fit_error::{SchedulerError, TopologyError};
use crate::info::{PodGroupInfo, PodStatus, TopologyInfo};
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;
use crate::snapshot::ClusterSnapshot;

pub struct TopologyPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(TopologyPlugin))
}

impl Plugin for TopologyPlugin {
    fn name(&self) -> &str {
        "topology"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session
            .ext
            .subset_nodes_fns
            .push(Arc::new(|snapshot, group, all_nodes| {
                candidate_sets(snapshot, group, all_nodes)
            }));

        // Soft proximity to the preferred level: nodes sharing a preferred
        // domain with the group's placed pods score higher. Placements are
        // captured per call from the live snapshot via the candidate sets,
        // so the score works off the group's tentative state at set-build
        // time.
        let placements: Arc<BTreeMap<String, BTreeMap<String, String>>> = Arc::new(
            session
                .snapshot
                .topologies
                .values()
                .map(|topology| {
                    let by_node = session
                        .snapshot
                        .nodes
                        .values()
                        .filter_map(|node| {
                            preferred_domain(topology, &node.labels)
                                .map(|domain| (node.name.clone(), domain))
                        })
                        .collect::<BTreeMap<_, _>>();
                    (topology.name.clone(), by_node)
                })
                .collect(),
        );
        let group_domains: Arc<BTreeMap<String, (String, Vec<String>)>> = Arc::new(
            session
                .snapshot
                .pod_groups
                .values()
                .filter_map(|group| {
                    let constraint = group.topology.as_ref()?;
                    constraint.preferred_level.as_ref()?;
                    let nodes: Vec<String> = session
                        .snapshot
                        .group_pods(&group.name)
                        .iter()
                        .filter(|pod| pod.occupies_node())
                        .filter_map(|pod| pod.node_name.clone())
                        .collect();
                    Some((group.name.clone(), (constraint.topology.clone(), nodes)))
                })
                .collect(),
        );
        session.ext.node_order_fns.push(Arc::new(move |_state, pod, node| {
            let Some((topology, placed_nodes)) = group_domains.get(&pod.pod_group) else {
                return 0.0;
            };
            let Some(by_node) = placements.get(topology) else {
                return 0.0;
            };
            let Some(candidate_domain) = by_node.get(&node.name) else {
                return 0.0;
            };
            placed_nodes
                .iter()
                .filter(|placed| by_node.get(*placed) == Some(candidate_domain))
                .count() as f64
        }));
    }
}

fn preferred_domain(
    topology: &TopologyInfo,
    labels: &BTreeMap<String, String>,
) -> Option<String> {
    // Preferred levels vary per group; index the deepest level and let the
    // comparison run on full-depth ids, which refine every shallower one.
    let depth = topology.levels.len().checked_sub(1)?;
    topology.domain_id(labels, depth)
}

/// Builds one candidate node set per domain at the required level, largest
/// allocatable capacity first. Groups without a topology constraint or a
/// required level take no stance.
fn candidate_sets(
    snapshot: &ClusterSnapshot,
    group: &PodGroupInfo,
    all_nodes: &[String],
) -> Result<Option<Vec<Vec<String>>>, TopologyError> {
    let Some(constraint) = &group.topology else {
        return Ok(None);
    };
    let Some(topology) = snapshot.topologies.get(&constraint.topology) else {
        return Err(TopologyError::UnknownTopology {
            topology: constraint.topology.clone(),
        });
    };
    let Some(level) = &constraint.required_level else {
        return Ok(None);
    };
    let Some(depth) = topology.level_index(level) else {
        return Err(TopologyError::RequiredLevelMissing {
            topology: topology.name.clone(),
            level: level.clone(),
        });
    };

    let mut domains: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node_name in all_nodes {
        let Some(node) = snapshot.nodes.get(node_name) else {
            continue;
        };
        if let Some(domain) = topology.domain_id(&node.labels, depth) {
            domains.entry(domain).or_default().push(node_name.clone());
        }
    }

    // The domain must fit the pods the group still needs.
    let pending: Vec<_> = snapshot
        .group_pods(&group.name)
        .into_iter()
        .filter(|pod| pod.status == PodStatus::Pending)
        .collect();
    let members = snapshot.group_member_count(&group.name);
    let needed = (group.min_available.saturating_sub(members) as usize).min(pending.len());
    let Some(sample) = pending.first() else {
        return Ok(Some(domains.into_values().collect()));
    };
    let quota = sample.requirements.required_init_quota();

    let mut sized: Vec<(usize, String, Vec<String>)> = domains
        .into_iter()
        .map(|(domain, nodes)| {
            let capacity: usize = nodes
                .iter()
                .filter_map(|name| snapshot.nodes.get(name))
                .map(|node| node.allocatable_count(&quota))
                .sum();
            (capacity, domain, nodes)
        })
        .collect();
    sized.retain(|(capacity, _, _)| *capacity >= needed.max(1));
    if sized.is_empty() {
        return Err(TopologyError::NoDomainFits {
            topology: topology.name.clone(),
            level: level.clone(),
            pods: needed,
        });
    }
    sized.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(Some(sized.into_iter().map(|(_, _, nodes)| nodes).collect()))
}
