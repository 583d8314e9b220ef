use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::{HealthSignal, NodeHealthReport};

// ---------------------------------------------------------------------------
// NodeInfo
// ---------------------------------------------------------------------------

/// Last-known identity of a node as reported by its agent or discovered
/// from the service's own metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub rack: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub info: NodeInfo,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub agent: Option<HealthSignal>,
    #[serde(default)]
    pub service: Option<HealthSignal>,
    pub first_seen: DateTime<Utc>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            info: NodeInfo::default(),
            maintenance: false,
            agent: None,
            service: None,
            first_seen: Utc::now(),
        }
    }

    /// Merge a health report. Older signals never overwrite newer ones.
    pub fn apply(&mut self, report: &NodeHealthReport) {
        if let Some(info) = &report.info {
            self.info = info.clone();
        }
        self.agent = newer(self.agent, report.agent);
        self.service = newer(self.service, report.service);
    }

    /// The agent has reported within `heartbeat` of `now`.
    pub fn is_agent_present(&self, now: DateTime<Utc>, heartbeat: Duration) -> bool {
        match self.agent {
            Some(signal) => within(signal.timestamp, now, heartbeat),
            None => false,
        }
    }

    /// Present and reporting healthy. Absent or stale agents are unknown,
    /// which never counts as healthy.
    pub fn is_agent_healthy(&self, now: DateTime<Utc>, heartbeat: Duration) -> bool {
        self.is_agent_present(now, heartbeat) && self.agent.is_some_and(|s| s.healthy)
    }

    /// The service reported healthy at or after `since`.
    pub fn is_service_healthy_since(&self, since: DateTime<Utc>) -> bool {
        self.service
            .is_some_and(|s| s.healthy && s.timestamp >= since)
    }
}

fn newer(current: Option<HealthSignal>, incoming: Option<HealthSignal>) -> Option<HealthSignal> {
    match (current, incoming) {
        (Some(c), Some(i)) if i.timestamp < c.timestamp => Some(c),
        (c, None) => c,
        (_, i) => i,
    }
}

fn within(ts: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match chrono::Duration::from_std(window) {
        Ok(window) => now - ts <= window,
        Err(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn report(agent: Option<HealthSignal>, service: Option<HealthSignal>) -> NodeHealthReport {
        NodeHealthReport {
            node_id: "1".to_string(),
            info: None,
            agent,
            service,
        }
    }

    #[test]
    fn agent_presence_uses_heartbeat_window() {
        let now = Utc::now();
        let mut node = Node::new("1");
        assert!(!node.is_agent_present(now, Duration::from_secs(30)));

        node.apply(&report(
            Some(HealthSignal::new(true, now - chrono::Duration::seconds(10))),
            None,
        ));
        assert!(node.is_agent_present(now, Duration::from_secs(30)));
        assert!(node.is_agent_healthy(now, Duration::from_secs(30)));

        let later = now + chrono::Duration::seconds(60);
        assert!(!node.is_agent_present(later, Duration::from_secs(30)));
        assert!(!node.is_agent_healthy(later, Duration::from_secs(30)));
    }

    #[test]
    fn unhealthy_agent_is_present_but_not_healthy() {
        let now = Utc::now();
        let mut node = Node::new("1");
        node.apply(&report(Some(HealthSignal::new(false, now)), None));
        assert!(node.is_agent_present(now, Duration::from_secs(30)));
        assert!(!node.is_agent_healthy(now, Duration::from_secs(30)));
    }

    #[test]
    fn service_health_requires_recent_ok() {
        let now = Utc::now();
        let mut node = Node::new("1");
        assert!(!node.is_service_healthy_since(now - chrono::Duration::seconds(300)));

        node.apply(&report(None, Some(HealthSignal::new(true, now))));
        assert!(node.is_service_healthy_since(now - chrono::Duration::seconds(300)));
        assert!(!node.is_service_healthy_since(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn stale_reports_do_not_overwrite_newer_signals() {
        let now = Utc::now();
        let mut node = Node::new("1");
        node.apply(&report(None, Some(HealthSignal::new(true, now))));
        node.apply(&report(
            None,
            Some(HealthSignal::new(false, now - chrono::Duration::seconds(5))),
        ));
        assert_eq!(node.service, Some(HealthSignal::new(true, now)));

        // A report without a service signal keeps the previous one.
        node.apply(&report(Some(HealthSignal::new(true, now)), None));
        assert!(node.service.is_some());
    }
}
