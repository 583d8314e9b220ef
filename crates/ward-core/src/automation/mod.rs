//! Periodic sensing and decision loops that keep a cluster healthy
//! without a human in the loop.
//!
//! Sensors publish observations into the cluster (node health, shard
//! topology). Operators read them on their own cadence and decide whether
//! to dispatch actions. The [`AutomationRunner`] drives both.

pub mod cooldown;
pub mod healing;
pub mod runner;
pub mod sensor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::ActionEngine;

pub use cooldown::{Cooldown, CooldownDecision};
pub use healing::{HealthAssessment, NodeHealingOperator};
pub use runner::{AutomationHandle, AutomationRunner};
pub use sensor::{NodeHealthSensor, Sensor, SensorIntervals, TopologySensor};

/// A decision loop over one cluster.
///
/// A tick must be idempotent for unchanged input, and missing or stale
/// inputs make it a no-op rather than an error.
#[async_trait]
pub trait Operator: Send + Sync {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn tick(&self, engine: &Arc<ActionEngine>) -> crate::Result<()>;
}
