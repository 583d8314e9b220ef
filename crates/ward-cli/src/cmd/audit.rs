use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::{Duration, Utc};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use ward_core::store::RedbStore;

#[derive(Subcommand)]
pub enum AuditSubcommand {
    /// List finished actions, oldest first
    List {
        /// State database file
        #[arg(long, env = "WARD_DB")]
        db: PathBuf,

        /// Only actions completed within the last N hours
        #[arg(long)]
        since_hours: Option<i64>,

        /// Only actions on this cluster
        #[arg(long)]
        cluster: Option<String>,
    },

    /// Delete records older than the retention window
    Prune {
        #[arg(long, env = "WARD_DB")]
        db: PathBuf,

        #[arg(long, default_value = "30")]
        older_than_days: i64,
    },
}

pub fn run(subcmd: AuditSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        AuditSubcommand::List {
            db,
            since_hours,
            cluster,
        } => list(&db, since_hours, cluster.as_deref(), json),
        AuditSubcommand::Prune {
            db,
            older_than_days,
        } => prune(&db, older_than_days, json),
    }
}

fn open(db: &Path) -> anyhow::Result<RedbStore> {
    RedbStore::open(db).with_context(|| format!("failed to open {}", db.display()))
}

fn list(db: &Path, since_hours: Option<i64>, cluster: Option<&str>, json: bool) -> anyhow::Result<()> {
    let since = since_hours.map(|h| Utc::now() - Duration::hours(h));
    let records: Vec<_> = open(db)?
        .list_audit(since)?
        .into_iter()
        .filter(|r| cluster.map_or(true, |c| r.cluster == c))
        .collect();

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No audit records.");
        return Ok(());
    }

    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.completed_at
                    .unwrap_or(r.created_at)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
                r.cluster.clone(),
                r.kind.clone(),
                r.status.to_string(),
                r.owner.clone().unwrap_or_else(|| "-".to_string()),
                r.name.clone(),
            ]
        })
        .collect();
    print_table(&["COMPLETED", "CLUSTER", "KIND", "STATUS", "OWNER", "NAME"], rows);
    Ok(())
}

fn prune(db: &Path, older_than_days: i64, json: bool) -> anyhow::Result<()> {
    if older_than_days < 0 {
        anyhow::bail!("--older-than-days must not be negative");
    }
    let cutoff = Utc::now() - Duration::days(older_than_days);
    let removed = open(db)?.prune_audit(cutoff)?;
    if json {
        print_json(&serde_json::json!({ "removed": removed, "cutoff": cutoff }))
    } else {
        println!("Removed {removed} audit records older than {older_than_days} days.");
        Ok(())
    }
}
