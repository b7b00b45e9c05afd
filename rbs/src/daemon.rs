//! The cycle loop: sleep the schedule period, take a snapshot, run the
//! pipeline, flush commits to the status-recording workers. Cancellation
//! is honored at cycle boundaries only.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::time::interval;

use libbatchsched::commit::{CommitWorkerPool, LoggingSink};
use libbatchsched::config::SchedulerConfig;
use libbatchsched::scheduler::Scheduler;

use crate::cli::StartArgs;
use crate::state::{feed_cache, load_cluster_state};

fn build_config(args: &StartArgs) -> Result<SchedulerConfig> {
    let mut config = match &args.scheduler_conf {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            SchedulerConfig::from_yaml(&content)?
        }
        None => SchedulerConfig::default(),
    };
    config.options.max_consolidation_preemptees = args.max_consolidation_preemptees;
    config.options.default_staleness_grace_period = args.default_staleness_grace_period;
    config.options.detailed_fit_errors = args.detailed_fit_errors;
    config.options.allow_consolidating_reclaim = args.allow_consolidating_reclaim;
    config.options.full_hierarchy_fairness = args.full_hierarchy_fairness;
    config.options.inference_preemptible = args.inference_preemptible;
    Ok(config)
}

pub async fn run(args: StartArgs) -> Result<()> {
    let config = build_config(&args)?;
    info!(
        "{} starting: actions [{}], period {}s, qps {}, burst {}, listening on {}",
        args.scheduler_name,
        config.actions,
        args.schedule_period,
        args.qps,
        args.burst,
        args.listen_address
    );
    if args.leader_elect {
        // Shard leadership is handled by the operator deployment; a single
        // self-hosted daemon always leads.
        info!("leader election requested; assuming leadership");
    }
    log::debug!(
        "csi storage scheduling {}, scheduling signatures {}, node-level scheduler {}",
        args.schedule_csi_storage,
        args.use_scheduling_signatures,
        args.node_level_scheduler
    );
    log::debug!(
        "worker label keys: nodepool {}, cpu {}, gpu {}, mig {}",
        args.nodepool_label_key,
        args.cpu_worker_node_label_key,
        args.gpu_worker_node_label_key,
        args.mig_worker_node_label_key
    );

    let mut scheduler = Scheduler::new(config);
    if let Some(path) = &args.cluster_state {
        let state = load_cluster_state(path)?;
        info!(
            "loaded cluster state: {} node(s), {} pod(s), {} group(s), {} queue(s)",
            state.nodes.len(),
            state.pods.len(),
            state.pod_groups.len(),
            state.queues.len()
        );
        feed_cache(scheduler.cache_mut(), state);
    }

    let pool = CommitWorkerPool::start(
        Arc::new(LoggingSink),
        args.num_of_status_recording_workers.max(1),
    );
    let mut ticker = interval(Duration::from_secs_f64(args.schedule_period.max(0.01)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down at cycle boundary");
                break;
            }
            _ = ticker.tick() => {
                match scheduler.run_cycle() {
                    Ok((requests, events)) => {
                        for event in &events {
                            info!(
                                "{} on {:?}: {}",
                                event.reason.as_str(),
                                event.object,
                                event.message
                            );
                        }
                        for request in &requests {
                            if !pool.enqueue(request.clone()) {
                                warn!("commit workers gone; dropping {}", request.kind());
                            }
                        }
                        scheduler.reconcile(&requests);
                    }
                    Err(e) => error!("cycle aborted: {e}"),
                }
            }
        }
    }

    pool.shutdown().await;
    Ok(())
}
