use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sensor::{Sensor, SensorIntervals};
use super::Operator;
use crate::collaborators::StateSink;
use crate::engine::ActionEngine;

const MIN_TICK: Duration = Duration::from_millis(1);

/// Drives every sensor and operator of one cluster on its own cadence.
pub struct AutomationRunner {
    engine: Arc<ActionEngine>,
    sensors: Vec<Arc<dyn Sensor>>,
    operators: Vec<Arc<dyn Operator>>,
    state: Option<Arc<dyn StateSink>>,
}

impl AutomationRunner {
    pub fn new(engine: Arc<ActionEngine>) -> Self {
        Self {
            engine,
            sensors: Vec::new(),
            operators: Vec::new(),
            state: None,
        }
    }

    pub fn with_sensor(mut self, sensor: Arc<dyn Sensor>) -> Self {
        self.sensors.push(sensor);
        self
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operators.push(operator);
        self
    }

    /// Checkpoint the cluster after every successful sensor pass.
    pub fn with_state_sink(mut self, sink: Arc<dyn StateSink>) -> Self {
        self.state = Some(sink);
        self
    }

    /// Intervals of the sensors registered so far, for operators that judge
    /// staleness.
    pub fn sensor_intervals(&self) -> SensorIntervals {
        self.sensors
            .iter()
            .map(|s| (s.name().to_string(), s.interval()))
            .collect()
    }

    pub fn start(self) -> AutomationHandle {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        for sensor in self.sensors {
            tasks.push(spawn_sensor(
                sensor,
                self.engine.clone(),
                self.state.clone(),
                shutdown.clone(),
            ));
        }
        for operator in self.operators {
            tasks.push(spawn_operator(operator, self.engine.clone(), shutdown.clone()));
        }
        info!(cluster = %self.engine.cluster().name(), loops = tasks.len(), "automation started");
        AutomationHandle { shutdown, tasks }
    }
}

/// Stops the loops started by [`AutomationRunner::start`].
pub struct AutomationHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AutomationHandle {
    /// Signal every loop and wait for the in-progress ticks to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "automation loop ended abnormally");
            }
        }
    }
}

/// Ticks every `every`, never faster than once a millisecond.
fn ticker(every: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(every.max(MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn spawn_sensor(
    sensor: Arc<dyn Sensor>,
    engine: Arc<ActionEngine>,
    state: Option<Arc<dyn StateSink>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(sensor.interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            let cluster = engine.cluster();
            if let Err(e) = sensor.observe(cluster).await {
                warn!(sensor = sensor.name(), cluster = %cluster.name(), error = %e, "sensor pass failed");
                continue;
            }
            if let Some(sink) = state.clone() {
                let snapshot_of = cluster.clone();
                let written =
                    tokio::task::spawn_blocking(move || snapshot_of.checkpoint(sink.as_ref())).await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(cluster = %cluster.name(), error = %e, "checkpoint failed"),
                    Err(e) => warn!(cluster = %cluster.name(), error = %e, "checkpoint task join error"),
                }
            }
        }
        debug!(sensor = sensor.name(), "sensor loop stopped");
    })
}

fn spawn_operator(
    operator: Arc<dyn Operator>,
    engine: Arc<ActionEngine>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(operator.interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            if engine.cluster().is_under_maintenance() {
                debug!(operator = operator.name(), "cluster under maintenance, skipping tick");
                continue;
            }
            if let Err(e) = operator.tick(&engine).await {
                warn!(operator = operator.name(), error = %e, "operator tick failed");
            }
        }
        debug!(operator = operator.name(), "operator loop stopped");
    })
}
