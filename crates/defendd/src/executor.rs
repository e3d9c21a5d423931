//! Action Executor - applies a plan to the host
//!
//! Steps run strictly in order and a failed step never stops the rest.
//! Blocks and unblocks are checked against the set of addresses known to be
//! blocked: the snapshot's firewall state plus what this plan has done so
//! far. Timeout changes rewrite only the header clause of the policy file and
//! replace the file atomically. With `use_sudo` the replacement goes through
//! the command runner like every other mitigation.

use crate::audit::{AuditLogger, MitigationRecord};
use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::config::{ActionsConfig, TimeoutPresetsConfig};
use chrono::Utc;
use defend_common::timeout_policy::{rewrite_header, Rewrite};
use defend_common::{
    Action, ActionKind, HeaderTimeout, Plan, PlanningInstance, PolicyError, ResolveError, Snapshot,
};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    UnresolvedObject(#[from] ResolveError),

    #[error("{0} needs an argument")]
    MissingArgument(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("failed to read timeout policy {path}: {source}")]
    PolicyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("failed to write timeout policy {path}: {source}")]
    PolicyWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub enum StepOutcome {
    Applied,
    Skipped(String),
    Failed(ExecError),
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => f.write_str("applied"),
            Self::Skipped(reason) => write!(f, "skipped ({})", reason),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

#[derive(Debug)]
pub struct StepReport {
    pub action: Action,
    /// What was (or, in dry run, would have been) issued
    pub command: Option<String>,
    pub outcome: StepOutcome,
}

#[derive(Debug)]
pub struct ExecutionReport {
    pub cycle_id: Uuid,
    pub steps: Vec<StepReport>,
}

impl ExecutionReport {
    pub fn applied_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Applied))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed(_)))
            .count()
    }
}

/// Per-plan mutable state
struct PlanState {
    blocked: BTreeSet<String>,
}

pub struct ActionExecutor {
    runner: Arc<dyn CommandRunner>,
    actions: ActionsConfig,
    presets: TimeoutPresetsConfig,
    policy_path: PathBuf,
    audit: Option<AuditLogger>,
}

impl ActionExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        actions: ActionsConfig,
        presets: TimeoutPresetsConfig,
        policy_path: PathBuf,
    ) -> Self {
        Self {
            runner,
            actions,
            presets,
            policy_path,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run every step of `plan`. Symbolic ids resolve against `instance`,
    /// the same instance the plan was produced for.
    pub async fn execute_plan(
        &self,
        plan: &Plan,
        snapshot: &Snapshot,
        instance: &PlanningInstance,
    ) -> ExecutionReport {
        let cycle_id = Uuid::new_v4();
        let mut state = PlanState {
            blocked: snapshot.blocked_addresses.clone(),
        };
        let mut steps = Vec::with_capacity(plan.len());

        info!("Executing {}-step plan (cycle {})", plan.len(), cycle_id);

        for action in plan {
            let (command, outcome) = match self.execute_step(action, instance, &mut state).await {
                Ok((command, outcome)) => (command, outcome),
                Err(e) => (None, StepOutcome::Failed(e)),
            };

            match &outcome {
                StepOutcome::Applied => info!("{}: applied", action),
                StepOutcome::Skipped(reason) => info!("{}: skipped ({})", action, reason),
                StepOutcome::Failed(e) => error!("{}: failed: {}", action, e),
            }
            self.record(cycle_id, action, command.as_deref(), &outcome)
                .await;

            steps.push(StepReport {
                action: action.clone(),
                command,
                outcome,
            });
        }

        ExecutionReport { cycle_id, steps }
    }

    async fn execute_step(
        &self,
        action: &Action,
        instance: &PlanningInstance,
        state: &mut PlanState,
    ) -> Result<(Option<String>, StepOutcome), ExecError> {
        match &action.kind {
            ActionKind::ReachGoal => Ok((None, StepOutcome::Skipped("goal marker".to_string()))),
            ActionKind::RestartService => {
                let spec = CommandSpec::privileged(
                    self.actions.use_sudo,
                    &self.actions.service_manager,
                    &["restart", self.actions.service_unit.as_str()],
                );
                self.run_command(spec).await
            }
            ActionKind::BlockIp => {
                let address = resolve_argument(action, instance)?;
                if state.blocked.contains(&address) {
                    return Ok((None, StepOutcome::Skipped(format!("{} already blocked", address))));
                }
                let spec = CommandSpec::privileged(
                    self.actions.use_sudo,
                    &self.actions.firewall_command,
                    &["insert", "1", "deny", "from", address.as_str(), "to", "any"],
                );
                let result = self.run_command(spec).await?;
                if matches!(result.1, StepOutcome::Applied) {
                    state.blocked.insert(address);
                }
                Ok(result)
            }
            ActionKind::UnblockIp => {
                let address = resolve_argument(action, instance)?;
                if !state.blocked.contains(&address) {
                    return Ok((None, StepOutcome::Skipped(format!("{} not blocked", address))));
                }
                let spec = CommandSpec::privileged(
                    self.actions.use_sudo,
                    &self.actions.firewall_command,
                    &["delete", "deny", "from", address.as_str(), "to", "any"],
                );
                let result = self.run_command(spec).await?;
                if matches!(result.1, StepOutcome::Applied) {
                    state.blocked.remove(&address);
                }
                Ok(result)
            }
            ActionKind::TightenTimeout => {
                let target = self.presets.shortened.header;
                self.set_header_timeout(&target).await
            }
            ActionKind::ReloosenTimeout => {
                let target = self.presets.baseline.header;
                self.set_header_timeout(&target).await
            }
            ActionKind::Unknown(name) => Err(ExecError::UnknownAction(name.clone())),
        }
    }

    async fn run_command(
        &self,
        spec: CommandSpec,
    ) -> Result<(Option<String>, StepOutcome), ExecError> {
        let line = spec.to_string();
        if self.actions.dry_run {
            info!("[DRY RUN] Would execute: {}", line);
            return Ok((Some(line), StepOutcome::Skipped("dry run".to_string())));
        }

        info!("Executing: {}", line);
        self.runner.run(&spec, None).await?.check(&spec)?;
        Ok((Some(line), StepOutcome::Applied))
    }

    async fn set_header_timeout(
        &self,
        target: &HeaderTimeout,
    ) -> Result<(Option<String>, StepOutcome), ExecError> {
        // Follow symlinks so the real file is replaced, not the link
        let path = tokio::fs::canonicalize(&self.policy_path)
            .await
            .map_err(|source| ExecError::PolicyRead {
                path: self.policy_path.clone(),
                source,
            })?;
        let description = format!("rewrite {} to {}", path.display(), target);

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ExecError::PolicyRead {
                path: path.clone(),
                source,
            })?;

        let rewritten = match rewrite_header(&text, target)? {
            Rewrite::Unchanged => {
                return Ok((None, StepOutcome::Skipped(format!("already {}", target))))
            }
            Rewrite::Changed { text, .. } => text,
        };

        if self.actions.dry_run {
            info!("[DRY RUN] Would {}", description);
            return Ok((Some(description), StepOutcome::Skipped("dry run".to_string())));
        }

        if self.actions.use_sudo {
            self.install_privileged(&path, &rewritten).await?;
        } else {
            write_atomically(&path, &rewritten)
                .await
                .map_err(|source| ExecError::PolicyWrite {
                    path: path.clone(),
                    source,
                })?;
        }
        Ok((Some(description), StepOutcome::Applied))
    }

    /// Stage `content` in the temp dir, then copy it next to `path` and
    /// rename it into place through the privileged runner.
    async fn install_privileged(&self, path: &Path, content: &str) -> Result<(), ExecError> {
        let staging = std::env::temp_dir().join(format!("plan2defend-{}.conf", Uuid::new_v4()));
        tokio::fs::write(&staging, content)
            .await
            .map_err(|source| ExecError::PolicyWrite {
                path: staging.clone(),
                source,
            })?;

        let staging_arg = staging.display().to_string();
        let sibling_arg = sibling_temp_path(path).display().to_string();
        let target_arg = path.display().to_string();
        let copy = CommandSpec::privileged(
            true,
            "cp",
            &[staging_arg.as_str(), sibling_arg.as_str()],
        );
        let rename = CommandSpec::privileged(
            true,
            "mv",
            &["-f", sibling_arg.as_str(), target_arg.as_str()],
        );

        let mut result = Ok(());
        for spec in [&copy, &rename] {
            info!("Executing: {}", spec);
            result = match self.runner.run(spec, None).await {
                Ok(output) => output.check(spec).map(|_| ()),
                Err(e) => Err(e),
            };
            if result.is_err() {
                break;
            }
        }

        if let Err(e) = tokio::fs::remove_file(&staging).await {
            warn!("Failed to remove {}: {}", staging.display(), e);
        }
        result.map_err(ExecError::from)
    }

    async fn record(
        &self,
        cycle_id: Uuid,
        action: &Action,
        command: Option<&str>,
        outcome: &StepOutcome,
    ) {
        let (success, detail) = match outcome {
            StepOutcome::Applied => (true, String::new()),
            StepOutcome::Failed(e) => (false, e.to_string()),
            StepOutcome::Skipped(_) => return,
        };
        let Some(audit) = &self.audit else {
            return;
        };

        let record = MitigationRecord {
            timestamp: Utc::now(),
            cycle_id,
            action: action.to_string(),
            command: command.map(str::to_string),
            success,
            detail,
        };
        if let Err(e) = audit.log(&record).await {
            warn!("Failed to write audit record: {:#}", e);
        }
    }
}

fn resolve_argument(action: &Action, instance: &PlanningInstance) -> Result<String, ExecError> {
    let id = action
        .first_arg()
        .ok_or_else(|| ExecError::MissingArgument(action.kind.to_string()))?;
    Ok(instance.resolve_ip(id)?.to_string())
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".plan2defend.tmp");
    path.with_file_name(tmp_name)
}

/// Write to a sibling temp file, then rename over the target
async fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = sibling_temp_path(path);

    tokio::fs::write(&tmp_path, content).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}
