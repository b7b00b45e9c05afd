//! The damped weighted max-min division. Iterative with an explicit round
//! limit and epsilon, never recursive.

use std::collections::{HashMap, VecDeque};

use super::QueueAttributes;
use crate::resources::ResourceVector;

const EPSILON: f64 = 1e-6;
const ROUND_LIMIT: usize = 100;

/// Damping is a pure function of the windowed absolute usage, the share
/// under division and `k`: a queue that has been consuming heavily gets
/// its over-quota weight discounted, `k` controls how sharply.
pub fn damped_weight(weight: f64, k: f64, usage_ratio: f64) -> f64 {
    weight / (1.0 + k * usage_ratio.max(0.0))
}

/// Divides `available` among sibling queues. Every queue first receives
/// its quota (capped by its limit); the residual is split in proportion to
/// damped over-quota weights, capped per queue by min(request, limit).
pub fn divide_round_based(
    queues: &[&QueueAttributes],
    available: &ResourceVector,
    usage: &HashMap<String, VecDeque<ResourceVector>>,
    k: f64,
) -> Vec<ResourceVector> {
    let mut len = available.len();
    for q in queues {
        len = len.max(q.quota.len()).max(q.request.len());
        if let Some(max_index) = q.limit.keys().max() {
            len = len.max(max_index + 1);
        }
    }

    let mut shares: Vec<ResourceVector> = queues.iter().map(|_| ResourceVector::new()).collect();

    for i in 0..len {
        let total = available.get(i);

        let mut base = vec![0.0; queues.len()];
        let mut cap = vec![0.0; queues.len()];
        let mut weights = vec![0.0; queues.len()];
        let mut distributed = 0.0;
        for (c, q) in queues.iter().enumerate() {
            let quota = q.quota.get(i);
            base[c] = match q.limit_of(i) {
                Some(limit) => quota.min(limit),
                None => quota,
            };
            distributed += base[c];

            let entitled_cap = match q.limit_of(i) {
                Some(limit) => q.request.get(i).min(limit),
                None => q.request.get(i),
            };
            cap[c] = (entitled_cap - base[c]).max(0.0);

            let usage_ratio = if total > 0.0 {
                windowed_usage(usage, &q.name, i) / total
            } else {
                0.0
            };
            weights[c] = damped_weight(q.weight_of(i), k, usage_ratio);
        }

        let mut granted = vec![0.0; queues.len()];
        let mut residual = (total - distributed).max(0.0);
        let mut round = 0;
        while residual > EPSILON && round < ROUND_LIMIT {
            round += 1;
            let active: Vec<usize> = (0..queues.len())
                .filter(|&c| weights[c] > 0.0 && granted[c] + EPSILON < cap[c])
                .collect();
            if active.is_empty() {
                break;
            }
            let weight_sum: f64 = active.iter().map(|&c| weights[c]).sum();
            if weight_sum <= 0.0 {
                break;
            }
            let pool = residual;
            for &c in &active {
                let offer = pool * weights[c] / weight_sum;
                let take = offer.min(cap[c] - granted[c]);
                granted[c] += take;
                residual -= take;
            }
        }

        for c in 0..queues.len() {
            let share = base[c] + granted[c];
            if share != 0.0 {
                shares[c].set(i, share);
            }
        }
    }
    shares
}

fn windowed_usage(
    usage: &HashMap<String, VecDeque<ResourceVector>>,
    queue: &str,
    index: usize,
) -> f64 {
    match usage.get(queue) {
        Some(window) if !window.is_empty() => {
            window.iter().map(|v| v.get(index)).sum::<f64>() / window.len() as f64
        }
        _ => 0.0,
    }
}
