use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::attribute::{keys, Attribute, AttributeStore};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownDecision {
    /// Nothing is unhealthy.
    Idle,
    /// Every candidate is already being recovered.
    AllRecovering(BTreeSet<String>),
    /// More than one node needs recovery; a human should look.
    TooMany(BTreeSet<String>),
    Recover(String),
}

/// Suppresses repeated recovery of the same node.
///
/// The set of recovering nodes lives in the `recoveringNodes` attribute;
/// its write time opens the window. Inside the window new nodes join the
/// set and the window restarts. Once it has elapsed the set is replaced.
#[derive(Debug, Clone, Copy)]
pub struct Cooldown {
    window: chrono::Duration,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Recovering nodes whose window is still open at `now`.
    pub fn recovering(
        &self,
        attributes: &AttributeStore,
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<String>> {
        let Some(attr) = attributes.get_raw(keys::RECOVERING_NODES.name()) else {
            return Ok(BTreeSet::new());
        };
        if attr.age(now) >= self.window {
            return Ok(BTreeSet::new());
        }
        Ok(attributes.get(keys::RECOVERING_NODES)?.unwrap_or_default())
    }

    pub fn evaluate(
        &self,
        attributes: &AttributeStore,
        candidates: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<CooldownDecision> {
        if candidates.is_empty() {
            return Ok(CooldownDecision::Idle);
        }
        let recovering = self.recovering(attributes, now)?;
        let mut fresh: BTreeSet<String> = candidates.difference(&recovering).cloned().collect();
        if fresh.len() > 1 {
            return Ok(CooldownDecision::TooMany(fresh));
        }
        Ok(match fresh.pop_first() {
            Some(node) => CooldownDecision::Recover(node),
            None => CooldownDecision::AllRecovering(candidates.clone()),
        })
    }

    /// Mark `node` as recovering from `now`.
    pub fn record(&self, attributes: &AttributeStore, node: &str, now: DateTime<Utc>) -> Result<()> {
        let mut recovering = self.recovering(attributes, now)?;
        recovering.insert(node.to_string());
        let attr = Attribute {
            value: serde_json::to_value(&recovering)?,
            publishers: BTreeSet::new(),
            updated_at: now,
            // Exposed so snapshots carry the window across restarts.
            hidden: false,
        };
        attributes.insert(keys::RECOVERING_NODES.name(), attr);
        Ok(())
    }
}
