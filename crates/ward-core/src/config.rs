use crate::error::{Result, WardError};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ClusterConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_cluster_id() -> String {
    "default".to_string()
}

impl ClusterConfig {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: default_cluster_id(),
            name: None,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_parent_workers")]
    pub parent_workers: usize,
    #[serde(default = "default_parent_queue")]
    pub parent_queue: usize,
    #[serde(default = "default_child_workers")]
    pub child_workers: usize,
    #[serde(default = "default_child_queue")]
    pub child_queue: usize,
    /// Completed actions older than this are dropped from the tracked index.
    #[serde(default = "default_tracked_ttl")]
    pub tracked_action_ttl_secs: u64,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
    /// Action kind names refused at dispatch.
    #[serde(default)]
    pub blocked_actions: Vec<String>,
}

fn default_parent_workers() -> usize {
    1
}

fn default_parent_queue() -> usize {
    64
}

fn default_child_workers() -> usize {
    16
}

fn default_child_queue() -> usize {
    256
}

fn default_tracked_ttl() -> u64 {
    86_400
}

fn default_prune_interval() -> u64 {
    60
}

impl EngineConfig {
    pub fn tracked_action_ttl(&self) -> Duration {
        Duration::from_secs(self.tracked_action_ttl_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parent_workers: default_parent_workers(),
            parent_queue: default_parent_queue(),
            child_workers: default_child_workers(),
            child_queue: default_child_queue(),
            tracked_action_ttl_secs: default_tracked_ttl(),
            prune_interval_secs: default_prune_interval(),
            blocked_actions: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_checking_interval")]
    pub checking_interval_ms: u64,
    #[serde(default = "default_true")]
    pub fail_if_no_node_ids: bool,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_checking_interval() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl SchedulerConfig {
    pub fn checking_interval(&self) -> Duration {
        Duration::from_millis(self.checking_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            checking_interval_ms: default_checking_interval(),
            fail_if_no_node_ids: true,
        }
    }
}

// ---------------------------------------------------------------------------
// StrategyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Fail fast: abort rolling sequences and cancel parallel siblings on
    /// the first child failure.
    #[serde(default = "default_true")]
    pub cancel_all_if_failed: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            cancel_all_if_failed: true,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeTaskConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTaskConfig {
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_true")]
    pub wait_for_recovery: bool,
}

fn default_action_timeout() -> u64 {
    300
}

fn default_recovery_timeout() -> u64 {
    600
}

fn default_health_check_interval() -> u64 {
    10_000
}

impl NodeTaskConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }
}

impl Default for NodeTaskConfig {
    fn default() -> Self {
        Self {
            action_timeout_secs: default_action_timeout(),
            recovery_timeout_secs: default_recovery_timeout(),
            health_check_interval_ms: default_health_check_interval(),
            wait_for_recovery: true,
        }
    }
}

// ---------------------------------------------------------------------------
// RecoveryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_collaborator_retries")]
    pub collaborator_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Record replacements without calling the compute collaborator.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_launch_timeout() -> u64 {
    900
}

fn default_collaborator_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    1_000
}

impl RecoveryConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            launch_timeout_secs: default_launch_timeout(),
            collaborator_retries: default_collaborator_retries(),
            retry_backoff_ms: default_retry_backoff(),
            dry_run: false,
        }
    }
}

// ---------------------------------------------------------------------------
// AutomationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    #[serde(default = "default_dead_service_threshold")]
    pub dead_service_threshold_secs: u64,
    #[serde(default = "default_max_stale_intervals")]
    pub max_stale_intervals: u32,
    /// Fraction of a shard's replicas that must be out of sync before its
    /// replica nodes count as unhealthy. Must lie in `[0, 1]`.
    #[serde(default)]
    pub under_replicated_ratio_threshold: f64,
    #[serde(default = "default_unhealthy_alert_threshold")]
    pub unhealthy_alert_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_dead_service_threshold() -> u64 {
    300
}

fn default_max_stale_intervals() -> u32 {
    2
}

fn default_unhealthy_alert_threshold() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    3_600
}

impl HealingConfig {
    pub fn dead_service_threshold(&self) -> Duration {
        Duration::from_secs(self.dead_service_threshold_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            dead_service_threshold_secs: default_dead_service_threshold(),
            max_stale_intervals: default_max_stale_intervals(),
            under_replicated_ratio_threshold: 0.0,
            unhealthy_alert_threshold: default_unhealthy_alert_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_operator_interval")]
    pub operator_interval_secs: u64,
    #[serde(default = "default_topology_interval")]
    pub topology_interval_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    /// Owner recorded on actions dispatched by automation.
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_agent_heartbeat")]
    pub agent_heartbeat_secs: u64,
    #[serde(default)]
    pub healing: HealingConfig,
}

fn default_operator_interval() -> u64 {
    30
}

fn default_topology_interval() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    30
}

fn default_owner() -> String {
    "ward-automation".to_string()
}

fn default_agent_heartbeat() -> u64 {
    30
}

impl AutomationConfig {
    pub fn operator_interval(&self) -> Duration {
        Duration::from_secs(self.operator_interval_secs.max(1))
    }

    pub fn topology_interval(&self) -> Duration {
        Duration::from_secs(self.topology_interval_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn agent_heartbeat(&self) -> Duration {
        Duration::from_secs(self.agent_heartbeat_secs)
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            operator_interval_secs: default_operator_interval(),
            topology_interval_secs: default_topology_interval(),
            health_interval_secs: default_health_interval(),
            owner: default_owner(),
            agent_heartbeat_secs: default_agent_heartbeat(),
            healing: HealingConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// WardConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub node_task: NodeTaskConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
}

impl WardConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let cfg: WardConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Atomically write the config as YAML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data.as_bytes())?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.engine.parent_workers == 0 {
            error("engine.parent_workers must be at least 1".to_string());
        }
        if self.engine.child_workers == 0 {
            error("engine.child_workers must be at least 1".to_string());
        }
        if self.engine.parent_queue == 0 || self.engine.child_queue == 0 {
            error("engine queue capacities must be at least 1".to_string());
        }
        if self.scheduler.max_concurrency == 0 {
            error("scheduler.max_concurrency must be at least 1".to_string());
        }
        let ratio = self.automation.healing.under_replicated_ratio_threshold;
        if !(0.0..=1.0).contains(&ratio) {
            error(format!(
                "automation.healing.under_replicated_ratio_threshold must be within [0, 1], got {ratio}"
            ));
        }
        if self.cluster.id.trim().is_empty() {
            error("cluster.id must not be empty".to_string());
        }

        if self.scheduler.checking_interval_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "scheduler.checking_interval_ms is 0; the scheduler will poll continuously"
                    .to_string(),
            });
        }
        if self.automation.healing.max_stale_intervals == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "automation.healing.max_stale_intervals is 0; every published attribute counts as stale"
                    .to_string(),
            });
        }
        if self.engine.child_workers < self.scheduler.max_concurrency {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "engine.child_workers ({}) is below scheduler.max_concurrency ({}); admitted children will queue",
                    self.engine.child_workers, self.scheduler.max_concurrency
                ),
            });
        }

        warnings
    }

    /// Fail on any error-level validation finding.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(WardError::Config(errors.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
