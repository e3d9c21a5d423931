//! Control Loop - Monitor, Analyze, Plan, Act
//!
//! Polling → (Incident | Idle) → Polling, one cycle at a time. Every wait
//! between cycles watches the shutdown channel so the loop stops promptly.

use crate::audit::AuditLogger;
use crate::collector::{CollectError, StateCollector};
use crate::command::CommandRunner;
use crate::config::DefendConfig;
use crate::executor::{ActionExecutor, ExecutionReport};
use crate::gateway::{GatewayError, PlannerGateway};
use crate::status::StatusSource;
use anyhow::Context;
use defend_common::{encode, EncoderSettings, Plan, Snapshot, Thresholds};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Why a snapshot counts as an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentCause {
    Slow,
    Unreachable,
    WorkerStarved,
}

impl fmt::Display for IncidentCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Slow => "slow response",
            Self::Unreachable => "service unreachable",
            Self::WorkerStarved => "worker pool starved",
        };
        f.write_str(name)
    }
}

/// Checked in this order: slow, unreachable, starved
pub fn assess_incident(snapshot: &Snapshot, thresholds: &Thresholds) -> Option<IncidentCause> {
    if thresholds.is_slow(snapshot.response_time()) {
        return Some(IncidentCause::Slow);
    }
    if snapshot.service_unreachable() {
        return Some(IncidentCause::Unreachable);
    }
    match snapshot.idle_ratio() {
        Some(ratio) if thresholds.is_starved(ratio) => Some(IncidentCause::WorkerStarved),
        _ => None,
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    Idle,
    Mitigated {
        cause: IncidentCause,
        plan: Plan,
        report: ExecutionReport,
    },
}

/// Errors that end the loop
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("collect: {0}")]
    Collect(#[from] CollectError),

    #[error("plan: {0}")]
    Gateway(#[from] GatewayError),
}

pub struct ControlLoop {
    collector: StateCollector,
    gateway: PlannerGateway,
    executor: ActionExecutor,
    settings: EncoderSettings,
    cooldown: Duration,
    idle_interval: Duration,
}

impl ControlLoop {
    pub fn new(
        collector: StateCollector,
        gateway: PlannerGateway,
        executor: ActionExecutor,
        settings: EncoderSettings,
        cooldown: Duration,
        idle_interval: Duration,
    ) -> Self {
        Self {
            collector,
            gateway,
            executor,
            settings,
            cooldown,
            idle_interval,
        }
    }

    /// Wire every component from config. The audit log is skipped in dry
    /// run, since nothing is applied.
    pub async fn from_config(
        config: &DefendConfig,
        status: Arc<dyn StatusSource>,
        runner: Arc<dyn CommandRunner>,
    ) -> anyhow::Result<Self> {
        let collector = StateCollector::new(config, status, runner.clone());
        let gateway = PlannerGateway::new(
            runner.clone(),
            config.planner.clone(),
            config.problem_template(),
        );
        let mut executor = ActionExecutor::new(
            runner,
            config.actions.clone(),
            config.timeout_presets.clone(),
            config.monitor.policy_path.clone(),
        );
        if !config.actions.dry_run {
            let audit = AuditLogger::new(&config.actions.audit_log)
                .await
                .context("Failed to open audit log")?;
            executor = executor.with_audit(audit);
        }

        Ok(Self::new(
            collector,
            gateway,
            executor,
            config.encoder_settings(),
            config.cooldown(),
            config.idle_interval(),
        ))
    }

    /// Snapshot source, for one-shot inspection
    pub fn collector(&self) -> &StateCollector {
        &self.collector
    }

    pub fn gateway(&self) -> &PlannerGateway {
        &self.gateway
    }

    pub fn encoder_settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// One full Monitor → Analyze → Plan → Act pass
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let snapshot = self.collector.collect().await?;

        let cause = match assess_incident(&snapshot, &self.settings.thresholds) {
            Some(cause) => cause,
            None => return Ok(CycleOutcome::Idle),
        };
        info!("Incident detected: {}", cause);

        let instance = encode(&snapshot, &self.settings);
        let plan = self.gateway.plan(&instance).await?;
        let report = self.executor.execute_plan(&plan, &snapshot, &instance).await;

        info!(
            "Cycle {}: {} applied, {} failed, {} steps",
            report.cycle_id,
            report.applied_count(),
            report.failed_count(),
            report.steps.len()
        );

        Ok(CycleOutcome::Mitigated {
            cause,
            plan,
            report,
        })
    }

    /// Run cycles until `shutdown` turns true or its sender goes away.
    /// Returns the number of completed cycles.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64, CycleError> {
        let mut cycles = 0u64;
        info!("Control loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = match self.run_cycle().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Cycle failed, stopping: {}", e);
                    return Err(e);
                }
            };
            cycles += 1;

            let wait = match outcome {
                CycleOutcome::Idle => self.idle_interval,
                CycleOutcome::Mitigated { .. } => self.cooldown,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Control loop stopped after {} cycles", cycles);
        Ok(cycles)
    }
}
