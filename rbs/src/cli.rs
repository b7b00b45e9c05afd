use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rbs", version, about = "rbatch scheduler daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the scheduler daemon
    Start(StartArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Scheduler name pods select via schedulerName
    #[arg(long, default_value = "rbatch")]
    pub scheduler_name: String,

    /// Seconds between scheduling cycles
    #[arg(long, default_value_t = 1.0)]
    pub schedule_period: f64,

    /// Scheduler config YAML (actions, tiers, queueDepthPerAction)
    #[arg(long)]
    pub scheduler_conf: Option<PathBuf>,

    /// Cluster objects YAML for self-contained operation
    #[arg(long)]
    pub cluster_state: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub leader_elect: bool,

    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen_address: String,

    /// Client-side API rate limit
    #[arg(long, default_value_t = 50.0)]
    pub qps: f64,

    #[arg(long, default_value_t = 100)]
    pub burst: u32,

    #[arg(long, default_value_t = 16)]
    pub max_consolidation_preemptees: usize,

    /// Emit every fit reason per node instead of the first
    #[arg(long, default_value_t = false)]
    pub detailed_fit_errors: bool,

    #[arg(long, default_value_t = false)]
    pub schedule_csi_storage: bool,

    #[arg(long, default_value_t = false)]
    pub use_scheduling_signatures: bool,

    #[arg(long, default_value_t = true)]
    pub full_hierarchy_fairness: bool,

    #[arg(long, default_value_t = false)]
    pub node_level_scheduler: bool,

    #[arg(long, default_value_t = false)]
    pub allow_consolidating_reclaim: bool,

    #[arg(long, default_value_t = 5)]
    pub num_of_status_recording_workers: usize,

    /// Seconds a gang may hold a partial allocation; -1 means forever
    #[arg(long, default_value_t = 60, allow_hyphen_values = true)]
    pub default_staleness_grace_period: i64,

    /// Groups without an explicit preemptibility spec default preemptible
    #[arg(long, default_value_t = false)]
    pub inference_preemptible: bool,

    #[arg(long, default_value = "rbatch.io/nodepool")]
    pub nodepool_label_key: String,

    #[arg(long, default_value = "rbatch.io/cpu-worker")]
    pub cpu_worker_node_label_key: String,

    #[arg(long, default_value = "rbatch.io/gpu-worker")]
    pub gpu_worker_node_label_key: String,

    #[arg(long, default_value = "rbatch.io/mig-worker")]
    pub mig_worker_node_label_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_defaults() {
        let cli = Cli::parse_from(["rbs", "start"]);
        let Commands::Start(args) = cli.command;
        assert_eq!(args.scheduler_name, "rbatch");
        assert_eq!(args.schedule_period, 1.0);
        assert_eq!(args.num_of_status_recording_workers, 5);
        assert_eq!(args.default_staleness_grace_period, 60);
        assert!(args.full_hierarchy_fairness);
    }

    #[test]
    fn test_flag_overrides() {
        let cli = Cli::parse_from([
            "rbs",
            "start",
            "--schedule-period",
            "0.5",
            "--max-consolidation-preemptees",
            "4",
            "--default-staleness-grace-period",
            "-1",
            "--detailed-fit-errors",
        ]);
        let Commands::Start(args) = cli.command;
        assert_eq!(args.schedule_period, 0.5);
        assert_eq!(args.max_consolidation_preemptees, 4);
        assert_eq!(args.default_staleness_grace_period, -1);
        assert!(args.detailed_fit_errors);
    }
}
