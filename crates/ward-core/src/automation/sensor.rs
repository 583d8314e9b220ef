use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::attribute::keys;
use crate::cluster::Cluster;
use crate::collaborators::{CollaboratorError, NodeHealthSource, TopologySource};

/// Polls one source and publishes what it sees into the cluster.
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Also the publisher name recorded on attributes this sensor writes.
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn observe(&self, cluster: &Cluster) -> Result<(), CollaboratorError>;
}

/// Publishes shard placement as the cluster's `topology` attribute.
pub struct TopologySensor {
    source: Arc<dyn TopologySource>,
    interval: Duration,
}

impl TopologySensor {
    pub const NAME: &'static str = "topology-sensor";

    pub fn new(source: Arc<dyn TopologySource>, interval: Duration) -> Self {
        Self { source, interval }
    }
}

#[async_trait]
impl Sensor for TopologySensor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn observe(&self, cluster: &Cluster) -> Result<(), CollaboratorError> {
        let shards = self.source.shards(cluster.id()).await?;
        debug!(cluster = %cluster.name(), shards = shards.len(), "topology observed");
        cluster
            .attributes()
            .set_with_publishers(keys::TOPOLOGY, &shards, [Self::NAME])
            .map_err(|e| CollaboratorError::Terminal(e.to_string()))
    }
}

/// Folds agent and service health reports into the cluster's nodes.
pub struct NodeHealthSensor {
    source: Arc<dyn NodeHealthSource>,
    interval: Duration,
}

impl NodeHealthSensor {
    pub const NAME: &'static str = "node-health-sensor";

    pub fn new(source: Arc<dyn NodeHealthSource>, interval: Duration) -> Self {
        Self { source, interval }
    }
}

#[async_trait]
impl Sensor for NodeHealthSensor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn observe(&self, cluster: &Cluster) -> Result<(), CollaboratorError> {
        let reports = self.source.node_health(cluster.id()).await?;
        debug!(cluster = %cluster.name(), reports = reports.len(), "node health observed");
        for report in &reports {
            cluster.apply_health(report);
        }
        Ok(())
    }
}

/// Polling interval of each registered sensor, by name.
#[derive(Debug, Clone, Default)]
pub struct SensorIntervals {
    intervals: HashMap<String, Duration>,
}

impl SensorIntervals {
    pub fn register(&mut self, name: impl Into<String>, interval: Duration) {
        self.intervals.insert(name.into(), interval);
    }

    pub fn get(&self, name: &str) -> Option<Duration> {
        self.intervals.get(name).copied()
    }

    /// Longest interval among `publishers`, ignoring unknown names.
    pub fn max_for<'a, I>(&self, publishers: I) -> Option<Duration>
    where
        I: IntoIterator<Item = &'a String>,
    {
        publishers.into_iter().filter_map(|p| self.get(p)).max()
    }
}

impl FromIterator<(String, Duration)> for SensorIntervals {
    fn from_iter<T: IntoIterator<Item = (String, Duration)>>(iter: T) -> Self {
        Self {
            intervals: iter.into_iter().collect(),
        }
    }
}
