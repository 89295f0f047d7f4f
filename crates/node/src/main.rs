mod node;
mod notifier;
mod scenario;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use factline_infra::{EngineConfig, PartitionAssignment};

use crate::node::Node;
use crate::notifier::LogNotifier;

fn env_index(key: &str, default: usize) -> anyhow::Result<usize> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("{key} must be a non-negative integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn main() -> anyhow::Result<()> {
    factline_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let instances = env_index("FACTLINE_INSTANCES", 1)?.max(1);
    let instance = env_index("FACTLINE_INSTANCE", 0)?;
    anyhow::ensure!(instance < instances, "FACTLINE_INSTANCE {instance} out of range for {instances} instances");

    let node = Node::open(config)?;
    let assignment = PartitionAssignment::for_instance(node.config().partitions, instances, instance);
    tracing::info!(instance, instances, partitions = ?assignment.partitions, "starting factline node");

    let projectors = node
        .start_projectors(&assignment, Arc::new(LogNotifier))
        .context("failed to start projector workers")?;
    tracing::info!(workers = projectors.len(), "projectors running");

    let report = scenario::run(&node)?;
    tracing::info!(
        accepted = report.accepted,
        replayed = report.replayed,
        rejected = report.rejected.len(),
        "demo commands processed"
    );

    if !node.wait_caught_up(&assignment, Duration::from_secs(10))? {
        tracing::warn!("projectors did not reach the log head in time");
    }
    scenario::log_read_models(&node)?;
    node.housekeeping()?;

    let abnormal = projectors.shutdown();
    anyhow::ensure!(abnormal == 0, "{abnormal} projector worker(s) ended abnormally");
    tracing::info!("factline node stopped");
    Ok(())
}
