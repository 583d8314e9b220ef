use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use ward_core::store::RedbStore;

#[derive(Subcommand)]
pub enum SnapshotSubcommand {
    /// List clusters with a stored snapshot
    List {
        /// State database file
        #[arg(long, env = "WARD_DB")]
        db: PathBuf,
    },

    /// Show the latest snapshot of one cluster
    Show {
        #[arg(long, env = "WARD_DB")]
        db: PathBuf,

        /// Cluster id
        #[arg(long)]
        cluster: String,
    },
}

pub fn run(subcmd: SnapshotSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        SnapshotSubcommand::List { db } => list(db, json),
        SnapshotSubcommand::Show { db, cluster } => show(db, &cluster, json),
    }
}

fn open(db: &Path) -> anyhow::Result<RedbStore> {
    RedbStore::open(db).with_context(|| format!("failed to open {}", db.display()))
}

fn list(db: PathBuf, json: bool) -> anyhow::Result<()> {
    let ids = open(&db)?.cluster_ids()?;
    if json {
        return print_json(&ids);
    }
    if ids.is_empty() {
        println!("No snapshots.");
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

fn show(db: PathBuf, cluster: &str, json: bool) -> anyhow::Result<()> {
    let Some(snapshot) = open(&db)?.load_snapshot(cluster)? else {
        anyhow::bail!("no snapshot for cluster '{cluster}'");
    };
    if json {
        return print_json(&snapshot);
    }

    println!("Cluster:     {} ({})", snapshot.name, snapshot.id);
    println!("Taken at:    {}", snapshot.taken_at.to_rfc3339());
    println!("Maintenance: {}", if snapshot.maintenance { "yes" } else { "no" });
    println!();

    let health = |signal: &Option<ward_core::collaborators::HealthSignal>| match signal {
        Some(s) if s.healthy => "healthy".to_string(),
        Some(_) => "unhealthy".to_string(),
        None => "-".to_string(),
    };
    let rows = snapshot
        .nodes
        .values()
        .map(|n| {
            vec![
                n.id.clone(),
                n.info.hostname.clone().unwrap_or_else(|| "-".to_string()),
                health(&n.agent),
                health(&n.service),
                if n.maintenance { "yes" } else { "" }.to_string(),
            ]
        })
        .collect();
    print_table(&["NODE", "HOST", "AGENT", "SERVICE", "MAINT"], rows);

    if !snapshot.attributes.is_empty() {
        println!();
        let names: Vec<&str> = snapshot.attributes.keys().map(String::as_str).collect();
        println!("Attributes: {}", names.join(", "));
    }
    Ok(())
}
