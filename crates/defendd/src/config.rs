//! Configuration management for defendd.
//!
//! Loads settings from /etc/plan2defend/config.toml or uses defaults.
//! Every field has a default, so a partial file only overrides what it names.
//! The loaded value is immutable and handed to each component at construction.

use defend_common::pddl::ProblemTemplate;
use defend_common::{EncoderSettings, Thresholds, TimeoutPolicyValues};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/plan2defend/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where and how to observe the managed server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Base URL; `/server-status?auto` is appended
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Status request timeout in seconds
    #[serde(default = "default_status_timeout")]
    pub status_timeout_secs: u64,

    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// Maximum number of access-log lines inspected per cycle
    #[serde(default = "default_log_tail_limit")]
    pub log_tail_limit: usize,

    /// mod_reqtimeout policy file
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,

    /// Name of the server object in the planning instance
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_server_url() -> String {
    "http://localhost".to_string()
}

fn default_status_timeout() -> u64 {
    15
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/apache2/access.log")
}

fn default_log_tail_limit() -> usize {
    500
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("/etc/apache2/mods-enabled/reqtimeout.conf")
}

fn default_server_name() -> String {
    "apache2".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            status_timeout_secs: default_status_timeout(),
            log_path: default_log_path(),
            log_tail_limit: default_log_tail_limit(),
            policy_path: default_policy_path(),
            server_name: default_server_name(),
        }
    }
}

/// Incident thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(flatten)]
    pub limits: Thresholds,

    /// Response time substituted when the status page is unreachable
    #[serde(default = "default_unreachable_response")]
    pub unreachable_response_secs: f64,

    /// Header first-byte timeout below which the policy counts as shortened
    #[serde(default = "default_shortened_below")]
    pub shortened_below: u32,

    /// Addresses never reported as high-rate
    #[serde(default = "default_exempt_addresses")]
    pub exempt_addresses: Vec<String>,
}

fn default_unreachable_response() -> f64 {
    100.0
}

fn default_shortened_below() -> u32 {
    10
}

fn default_exempt_addresses() -> Vec<String> {
    // Historical exemption carried over from the first deployment
    vec!["192.168.23.140".to_string()]
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            limits: Thresholds::default(),
            unreachable_response_secs: default_unreachable_response(),
            shortened_below: default_shortened_below(),
            exempt_addresses: default_exempt_addresses(),
        }
    }
}

/// Loop pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Wait after a mitigation before polling again
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Wait after a quiet cycle
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
}

fn default_cooldown() -> u64 {
    15
}

fn default_idle_interval() -> u64 {
    4
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            idle_interval_secs: default_idle_interval(),
        }
    }
}

/// External solver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_domain_name")]
    pub domain_name: String,

    #[serde(default = "default_problem_name")]
    pub problem_name: String,

    #[serde(default = "default_solver_command")]
    pub solver_command: String,

    /// `{domain}` and `{problem}` are replaced with the file paths
    #[serde(default = "default_solver_args")]
    pub solver_args: Vec<String>,

    #[serde(default = "default_domain_file")]
    pub domain_file: PathBuf,

    /// Rendered problem is written here before each solver run
    #[serde(default = "default_problem_file")]
    pub problem_file: PathBuf,

    #[serde(default = "default_solver_timeout")]
    pub solver_timeout_secs: u64,

    #[serde(default = "default_goal")]
    pub goal: String,

    #[serde(default = "default_metric")]
    pub metric: Option<String>,

    /// Debug artifacts (instance, trace, plan); unset disables them
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: Option<PathBuf>,
}

fn default_domain_name() -> String {
    "website".to_string()
}

fn default_problem_name() -> String {
    "p0".to_string()
}

fn default_solver_command() -> String {
    "pddl/ff".to_string()
}

fn default_solver_args() -> Vec<String> {
    ["-o", "{domain}", "-f", "{problem}", "-O"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_domain_file() -> PathBuf {
    PathBuf::from("pddl/d-basic.pddl")
}

fn default_problem_file() -> PathBuf {
    PathBuf::from("pddl/p-basic.pddl")
}

fn default_solver_timeout() -> u64 {
    120
}

fn default_goal() -> String {
    ProblemTemplate::default().goal
}

fn default_metric() -> Option<String> {
    ProblemTemplate::default().metric
}

fn default_artifacts_dir() -> Option<PathBuf> {
    Some(PathBuf::from("pddl"))
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            domain_name: default_domain_name(),
            problem_name: default_problem_name(),
            solver_command: default_solver_command(),
            solver_args: default_solver_args(),
            domain_file: default_domain_file(),
            problem_file: default_problem_file(),
            solver_timeout_secs: default_solver_timeout(),
            goal: default_goal(),
            metric: default_metric(),
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

/// Mitigation commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Prefix privileged commands with sudo
    #[serde(default = "default_use_sudo")]
    pub use_sudo: bool,

    #[serde(default = "default_firewall_command")]
    pub firewall_command: String,

    #[serde(default = "default_service_manager")]
    pub service_manager: String,

    #[serde(default = "default_service_unit")]
    pub service_unit: String,

    /// Log mitigations instead of applying them
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
}

fn default_use_sudo() -> bool {
    true
}

fn default_firewall_command() -> String {
    "ufw".to_string()
}

fn default_service_manager() -> String {
    "systemctl".to_string()
}

fn default_service_unit() -> String {
    "apache2".to_string()
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("/var/log/plan2defend/audit.jsonl")
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            use_sudo: default_use_sudo(),
            firewall_command: default_firewall_command(),
            service_manager: default_service_manager(),
            service_unit: default_service_unit(),
            dry_run: false,
            audit_log: default_audit_log(),
        }
    }
}

/// The two timeout presets the executor switches between
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutPresetsConfig {
    #[serde(default = "TimeoutPolicyValues::baseline")]
    pub baseline: TimeoutPolicyValues,

    #[serde(default = "TimeoutPolicyValues::shortened")]
    pub shortened: TimeoutPolicyValues,
}

impl Default for TimeoutPresetsConfig {
    fn default() -> Self {
        Self {
            baseline: TimeoutPolicyValues::baseline(),
            shortened: TimeoutPolicyValues::shortened(),
        }
    }
}

fn default_business_costs() -> BTreeMap<String, f64> {
    [
        ("expected_revenue", 500.0),
        ("revenue_impact", 100.0),
        ("slow_connection_users", 50.0),
        ("total-cost", 0.0),
        ("restart_cost", 50.0),
        ("sysadmin_cost", 1000.0),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect()
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefendConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub thresholds: ThresholdConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub actions: ActionsConfig,

    #[serde(default)]
    pub timeout_presets: TimeoutPresetsConfig,

    /// Static business-cost table, exported as solver utility values
    #[serde(default = "default_business_costs")]
    pub business: BTreeMap<String, f64>,
}

impl Default for DefendConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            thresholds: ThresholdConfig::default(),
            schedule: ScheduleConfig::default(),
            planner: PlannerConfig::default(),
            actions: ActionsConfig::default(),
            timeout_presets: TimeoutPresetsConfig::default(),
            business: default_business_costs(),
        }
    }
}

impl DefendConfig {
    /// Load and validate config from `path`.
    ///
    /// A missing file gives the defaults; an unreadable or malformed one is
    /// an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            info!("Loaded config from {}", path.display());
            config
        } else {
            warn!("Config {} not found, using defaults", path.display());
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.status_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor.status_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.monitor.log_tail_limit == 0 {
            return Err(ConfigError::Invalid(
                "monitor.log_tail_limit must be > 0".to_string(),
            ));
        }
        if self.planner.solver_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "planner.solver_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.planner.solver_command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "planner.solver_command must not be empty".to_string(),
            ));
        }
        let idle = self.thresholds.limits.idle_ratio;
        if !(0.0..=1.0).contains(&idle) {
            return Err(ConfigError::Invalid(format!(
                "thresholds.idle_ratio must be within [0, 1], got {}",
                idle
            )));
        }
        Ok(())
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.status_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.schedule.cooldown_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.idle_interval_secs)
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            domain_name: self.planner.domain_name.clone(),
            problem_name: self.planner.problem_name.clone(),
            thresholds: self.thresholds.limits.clone(),
            exempt_addresses: self.thresholds.exempt_addresses.iter().cloned().collect(),
        }
    }

    pub fn problem_template(&self) -> ProblemTemplate {
        ProblemTemplate {
            goal: self.planner.goal.clone(),
            metric: self.planner.metric.clone(),
        }
    }
}
