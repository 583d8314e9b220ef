//! Durable cluster snapshots and action audit records in a redb file.
//!
//! # Table design
//!
//! `snapshots` maps a cluster id to its latest JSON-encoded
//! [`ClusterSnapshot`]; each checkpoint overwrites the previous one.
//!
//! `audit` uses a 24-byte composite key:
//! ```text
//! [ completed_ms: u64 big-endian (8 bytes) | action uuid: 16 bytes ]
//! ```
//! Big-endian timestamps make byte order equal time order, so range scans
//! return records oldest first and retention is a single prefix delete.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;
use uuid::Uuid;

use crate::action::AuditRecord;
use crate::cluster::ClusterSnapshot;
use crate::collaborators::{ActionAuditor, StateSink};
use crate::error::{Result, WardError};

const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
const AUDIT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("audit");

fn store_err(e: impl std::fmt::Display) -> WardError {
    WardError::Store(e.to_string())
}

fn audit_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Smallest key at `ts`: every record at or after `ts` sorts at or above it.
fn lower_bound(ts: DateTime<Utc>) -> [u8; 24] {
    audit_key(ts, Uuid::nil())
}

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating both tables.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(SNAPSHOTS).map_err(store_err)?;
        wt.open_table(AUDIT).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        debug!(path = %path.display(), "store opened");
        Ok(Self { db })
    }

    pub fn save_snapshot(&self, snapshot: &ClusterSnapshot) -> Result<()> {
        let value = serde_json::to_vec(snapshot)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(SNAPSHOTS).map_err(store_err)?;
            table
                .insert(snapshot.id.as_str(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn load_snapshot(&self, cluster_id: &str) -> Result<Option<ClusterSnapshot>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(SNAPSHOTS).map_err(store_err)?;
        match table.get(cluster_id).map_err(store_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Ids of every cluster with a stored snapshot, sorted.
    pub fn cluster_ids(&self) -> Result<Vec<String>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(SNAPSHOTS).map_err(store_err)?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (k, _) = entry.map_err(store_err)?;
            ids.push(k.value().to_string());
        }
        Ok(ids)
    }

    pub fn insert_audit(&self, record: &AuditRecord) -> Result<()> {
        let ts = record.completed_at.unwrap_or(record.created_at);
        let key = audit_key(ts, record.id);
        let value = serde_json::to_vec(record)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(AUDIT).map_err(store_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    /// Audit records completed at or after `since` (all when `None`),
    /// oldest first.
    pub fn list_audit(&self, since: Option<DateTime<Utc>>) -> Result<Vec<AuditRecord>> {
        let lower = since.map(lower_bound).unwrap_or([0u8; 24]);
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(AUDIT).map_err(store_err)?;

        let mut records = Vec::new();
        for entry in table.range(lower.as_slice()..).map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            records.push(serde_json::from_slice(v.value())?);
        }
        Ok(records)
    }

    /// Delete audit records completed before `cutoff`. Returns how many
    /// were removed.
    pub fn prune_audit(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let upper = lower_bound(cutoff);
        let wt = self.db.begin_write().map_err(store_err)?;
        let removed = {
            let mut table = wt.open_table(AUDIT).map_err(store_err)?;
            let mut expired: Vec<Vec<u8>> = Vec::new();
            for entry in table.range(..upper.as_slice()).map_err(store_err)? {
                let (k, _) = entry.map_err(store_err)?;
                expired.push(k.value().to_vec());
            }
            for key in &expired {
                table.remove(key.as_slice()).map_err(store_err)?;
            }
            expired.len()
        };
        wt.commit().map_err(store_err)?;
        Ok(removed)
    }
}

impl StateSink for RedbStore {
    fn serialize(&self, snapshot: &ClusterSnapshot) -> Result<()> {
        self.save_snapshot(snapshot)
    }

    fn deserialize(&self, cluster_id: &str) -> Result<Option<ClusterSnapshot>> {
        self.load_snapshot(cluster_id)
    }
}

impl ActionAuditor for RedbStore {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        self.insert_audit(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionResult, ActionStatus};
    use crate::cluster::Cluster;
    use crate::node::Node;
    use chrono::Duration as CDur;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("ward.db")).unwrap();
        (dir, store)
    }

    fn record(name: &str, completed_at: DateTime<Utc>) -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            cluster: "c1".to_string(),
            kind: "rolling".to_string(),
            name: name.to_string(),
            owner: Some("oncall".to_string()),
            status: ActionStatus::Succeeded,
            created_at: completed_at - CDur::seconds(5),
            completed_at: Some(completed_at),
            result: ActionResult::default(),
            children: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn missing_snapshot_is_a_cold_start() {
        let (_dir, store) = open_tmp();
        assert!(store.load_snapshot("c1").unwrap().is_none());
        let cluster = Cluster::new("c1", "c1");
        assert!(!cluster.initialize(&store).unwrap());
    }

    #[test]
    fn checkpoint_then_initialize_restores_the_cluster() {
        let (_dir, store) = open_tmp();
        let cluster = Cluster::new("c1", "primary");
        cluster.upsert_node(Node::new("n1"));
        cluster.set_maintenance(true);
        cluster.checkpoint(&store).unwrap();

        let restored = Cluster::new("c1", "primary");
        assert!(restored.initialize(&store).unwrap());
        assert!(restored.contains_node("n1"));
        assert!(restored.is_under_maintenance());
        assert_eq!(store.cluster_ids().unwrap(), vec!["c1"]);
    }

    #[test]
    fn later_checkpoints_overwrite_earlier_ones() {
        let (_dir, store) = open_tmp();
        let cluster = Cluster::new("c1", "c1");
        cluster.upsert_node(Node::new("n1"));
        cluster.checkpoint(&store).unwrap();
        cluster.remove_node("n1");
        cluster.upsert_node(Node::new("n2"));
        cluster.checkpoint(&store).unwrap();

        let snapshot = store.load_snapshot("c1").unwrap().unwrap();
        assert_eq!(snapshot.nodes.keys().collect::<Vec<_>>(), vec!["n2"]);
    }

    #[test]
    fn audit_records_come_back_oldest_first() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        store.record(&record("second", now - CDur::seconds(10))).unwrap();
        store.record(&record("first", now - CDur::minutes(5))).unwrap();
        store.record(&record("third", now)).unwrap();

        let names: Vec<String> = store
            .list_audit(None)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);

        let recent = store.list_audit(Some(now - CDur::minutes(1))).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].name, "second");
    }

    #[test]
    fn prune_removes_only_older_records() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        store.record(&record("old", now - CDur::days(40))).unwrap();
        store.record(&record("new", now - CDur::days(1))).unwrap();

        assert_eq!(store.prune_audit(now - CDur::days(30)).unwrap(), 1);
        let remaining = store.list_audit(None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "new");
        assert_eq!(store.prune_audit(now - CDur::days(30)).unwrap(), 0);
    }

    #[test]
    fn empty_store_lists_nothing() {
        let (_dir, store) = open_tmp();
        assert!(store.list_audit(None).unwrap().is_empty());
        assert!(store.cluster_ids().unwrap().is_empty());
    }
}
