use crate::output::{print_json, print_table};
use anyhow::Context;
use std::collections::BTreeSet;
use std::path::Path;
use ward_core::collaborators::ShardReplicas;
use ward_core::scheduler::{AdmissionPlan, DependencyGraph};

pub fn run(
    config: Option<&Path>,
    topology: &Path,
    nodes: Vec<String>,
    max_concurrency: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let data = std::fs::read_to_string(topology)
        .with_context(|| format!("failed to read {}", topology.display()))?;
    let shards: Vec<ShardReplicas> =
        serde_yaml::from_str(&data).context("topology must be a list of shards")?;

    let nodes: Vec<String> = if nodes.is_empty() {
        shards
            .iter()
            .flat_map(|s| s.replicas.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        nodes
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    };
    if nodes.is_empty() {
        anyhow::bail!("no nodes to plan: the topology has no replicas and --nodes was empty");
    }

    let concurrency = max_concurrency.unwrap_or(config.scheduler.max_concurrency);
    let graph = DependencyGraph::from_shards(&nodes, &shards);
    let plan = AdmissionPlan::new(graph, concurrency);
    let effective = plan.max_concurrency();
    let waves = plan.simulate_waves();
    tracing::debug!(nodes = nodes.len(), shards = shards.len(), waves = waves.len(), "simulated admission");

    if json {
        let value = serde_json::json!({
            "max_concurrency": effective,
            "nodes": nodes.len(),
            "waves": waves,
        });
        return print_json(&value);
    }

    println!(
        "{} nodes, max concurrency {effective}, {} waves",
        nodes.len(),
        waves.len()
    );
    let rows = waves
        .iter()
        .enumerate()
        .map(|(i, wave)| vec![(i + 1).to_string(), wave.join(", ")])
        .collect();
    print_table(&["WAVE", "NODES"], rows);
    Ok(())
}
