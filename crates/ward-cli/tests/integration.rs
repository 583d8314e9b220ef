#![allow(deprecated)]
use assert_cmd::Command;
use chrono::{Duration, Utc};
use predicates::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;
use uuid::Uuid;
use ward_core::action::{ActionResult, ActionStatus, AuditRecord};
use ward_core::cluster::Cluster;
use ward_core::collaborators::ActionAuditor;
use ward_core::node::Node;
use ward_core::store::RedbStore;

fn ward(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ward").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("WARD_CONFIG")
        .env_remove("WARD_DB");
    cmd
}

const SIX_NODES: &str = r#"
- shard: p0
  replicas: ["0", "1", "3"]
- shard: p1
  replicas: ["1", "2", "4"]
- shard: p2
  replicas: ["3", "4", "5"]
"#;

fn write_topology(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("topology.yaml");
    std::fs::write(&path, SIX_NODES).unwrap();
    path
}

fn audit(cluster: &str, name: &str, completed_ago: Duration) -> AuditRecord {
    let completed = Utc::now() - completed_ago;
    AuditRecord {
        id: Uuid::new_v4(),
        cluster: cluster.to_string(),
        kind: "concurrent".to_string(),
        name: name.to_string(),
        owner: Some("oncall".to_string()),
        status: ActionStatus::Succeeded,
        created_at: completed - Duration::minutes(1),
        completed_at: Some(completed),
        result: ActionResult::default(),
        children: Vec::new(),
        attributes: BTreeMap::new(),
    }
}

// ---------------------------------------------------------------------------
// ward plan
// ---------------------------------------------------------------------------

#[test]
fn plan_groups_unlinked_nodes_into_waves() {
    let dir = TempDir::new().unwrap();
    let topology = write_topology(&dir);

    let out = ward(&dir)
        .args(["plan", "--json", "--max-concurrency", "3", "--topology"])
        .arg(&topology)
        .output()
        .unwrap();
    assert!(out.status.success());

    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(value["max_concurrency"], 3);
    assert_eq!(value["nodes"], 6);
    assert_eq!(
        value["waves"],
        serde_json::json!([["0", "2", "5"], ["1"], ["3"], ["4"]])
    );
}

#[test]
fn plan_respects_the_concurrency_cap() {
    let dir = TempDir::new().unwrap();
    let topology = write_topology(&dir);

    let out = ward(&dir)
        .args(["plan", "-j", "--max-concurrency", "1", "--topology"])
        .arg(&topology)
        .output()
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(value["waves"].as_array().unwrap().len(), 6);
}

#[test]
fn plan_limits_to_requested_nodes() {
    let dir = TempDir::new().unwrap();
    let topology = write_topology(&dir);

    ward(&dir)
        .args(["plan", "--nodes", "0,1", "--topology"])
        .arg(&topology)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 nodes, max concurrency 3, 2 waves"));
}

#[test]
fn plan_reads_concurrency_from_config() {
    let dir = TempDir::new().unwrap();
    let topology = write_topology(&dir);
    let config = dir.path().join("ward.yaml");
    std::fs::write(&config, "scheduler:\n  max_concurrency: 2\n").unwrap();

    ward(&dir)
        .arg("--config")
        .arg(&config)
        .args(["plan", "--topology"])
        .arg(&topology)
        .assert()
        .success()
        .stdout(predicate::str::contains("max concurrency 2"));
}

#[test]
fn plan_fails_on_missing_topology() {
    let dir = TempDir::new().unwrap();
    ward(&dir)
        .args(["plan", "--topology", "nope.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

// ---------------------------------------------------------------------------
// ward config
// ---------------------------------------------------------------------------

#[test]
fn config_validate_accepts_defaults() {
    let dir = TempDir::new().unwrap();
    ward(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_rejects_bad_ratio() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("ward.yaml");
    std::fs::write(
        &config,
        "automation:\n  healing:\n    under_replicated_ratio_threshold: 2.0\n",
    )
    .unwrap();

    ward(&dir)
        .arg("--config")
        .arg(&config)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error]"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_show_prints_effective_values() {
    let dir = TempDir::new().unwrap();
    let out = ward(&dir).args(["config", "show", "-j"]).output().unwrap();
    assert!(out.status.success());
    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(value["scheduler"]["max_concurrency"], 3);
    assert_eq!(value["engine"]["child_workers"], 16);
}

// ---------------------------------------------------------------------------
// ward snapshot / audit
// ---------------------------------------------------------------------------

#[test]
fn snapshot_show_lists_nodes() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("ward.db");
    {
        let store = RedbStore::open(&db).unwrap();
        let cluster = Cluster::new("c1", "logs-prod");
        cluster.upsert_node(Node::new("n1"));
        cluster.upsert_node(Node::new("n2"));
        cluster.checkpoint(&store).unwrap();
    }

    ward(&dir)
        .args(["snapshot", "list", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("c1"));

    ward(&dir)
        .args(["snapshot", "show", "--cluster", "c1", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("logs-prod"))
        .stdout(predicate::str::contains("n2"));
}

#[test]
fn snapshot_show_unknown_cluster_fails() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("ward.db");
    ward(&dir)
        .args(["snapshot", "show", "--cluster", "ghost", "--db"])
        .arg(&db)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no snapshot for cluster 'ghost'"));
}

#[test]
fn audit_list_filters_and_prune_removes_old_records() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("ward.db");
    {
        let store = RedbStore::open(&db).unwrap();
        store.record(&audit("c1", "old-rollout", Duration::days(45))).unwrap();
        store.record(&audit("c1", "recent-rollout", Duration::hours(2))).unwrap();
        store.record(&audit("c2", "other-cluster", Duration::hours(1))).unwrap();
    }

    let out = ward(&dir)
        .args(["audit", "list", "-j", "--cluster", "c1", "--db"])
        .arg(&db)
        .output()
        .unwrap();
    let records: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let names: Vec<&str> = records
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["old-rollout", "recent-rollout"]);

    ward(&dir)
        .args(["audit", "list", "--since-hours", "24", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("recent-rollout"))
        .stdout(predicate::str::contains("old-rollout").not());

    ward(&dir)
        .args(["audit", "prune", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 audit records"));
}
