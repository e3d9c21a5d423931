//! Planner Gateway - hands the planning instance to the external solver
//!
//! Render the problem, write it where the solver expects it, run the solver
//! under a timeout, and extract the plan from its trace. Debug artifacts are
//! optional and write-only.

use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::config::PlannerConfig;
use defend_common::pddl::{render_problem, ProblemTemplate};
use defend_common::{parse_trace, Plan, PlanningInstance, TraceError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const INSTANCE_ARTIFACT: &str = "problem_info.json";
const TRACE_ARTIFACT: &str = "out.txt";
const PLAN_ARTIFACT: &str = "plan.txt";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to write problem file {path}: {source}")]
    WriteProblem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("solver did not finish within {0:?}")]
    SolverTimeout(Duration),

    #[error("failed to run solver: {0}")]
    Solver(#[source] CommandError),

    #[error("unreadable solver trace: {0}")]
    Trace(#[from] TraceError),
}

pub struct PlannerGateway {
    runner: Arc<dyn CommandRunner>,
    planner: PlannerConfig,
    template: ProblemTemplate,
    timeout: Duration,
}

impl PlannerGateway {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        planner: PlannerConfig,
        template: ProblemTemplate,
    ) -> Self {
        let timeout = Duration::from_secs(planner.solver_timeout_secs);
        Self {
            runner,
            planner,
            template,
            timeout,
        }
    }

    /// Problem text for an instance, exactly as the solver will see it
    pub fn render(&self, instance: &PlanningInstance) -> String {
        render_problem(instance, &self.template)
    }

    fn solver_command(&self) -> CommandSpec {
        let domain = self.planner.domain_file.display().to_string();
        let problem = self.planner.problem_file.display().to_string();
        let args = self
            .planner
            .solver_args
            .iter()
            .map(|arg| arg.replace("{domain}", &domain).replace("{problem}", &problem))
            .collect();
        CommandSpec::new(self.planner.solver_command.clone(), args)
    }

    /// Obtain a plan for `instance`. An empty plan means no solution.
    pub async fn plan(&self, instance: &PlanningInstance) -> Result<Plan, GatewayError> {
        let problem = self.render(instance);
        debug!("Rendered problem:\n{}", problem);
        write_file(&self.planner.problem_file, &problem)
            .await
            .map_err(|source| GatewayError::WriteProblem {
                path: self.planner.problem_file.clone(),
                source,
            })?;

        let command = self.solver_command();
        info!("Invoking solver: {}", command);
        let output = match self.runner.run(&command, Some(self.timeout)).await {
            Ok(output) => output,
            Err(CommandError::Timeout { timeout, .. }) => {
                return Err(GatewayError::SolverTimeout(timeout))
            }
            Err(e) => return Err(GatewayError::Solver(e)),
        };
        if !output.success() {
            warn!(
                "Solver exited with status {:?}, parsing its output anyway: {}",
                output.status,
                output.stderr.trim()
            );
        }
        debug!("Solver trace:\n{}", output.stdout);

        let plan = parse_trace(&output.stdout)?;
        if plan.is_empty() {
            info!("Solver found no plan");
        } else {
            info!("Solver returned a {}-step plan", plan.len());
        }

        if let Some(dir) = &self.planner.artifacts_dir {
            self.write_artifacts(dir, instance, &problem, &output.stdout, &plan)
                .await;
        }

        Ok(plan)
    }

    async fn write_artifacts(
        &self,
        dir: &Path,
        instance: &PlanningInstance,
        problem: &str,
        trace: &str,
        plan: &Plan,
    ) {
        let instance_json = match serde_json::to_string_pretty(instance) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize planning instance: {}", e);
                String::new()
            }
        };
        let problem_name = self
            .planner
            .problem_file
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("problem.pddl"));
        let plan_text: String = plan.iter().map(|step| format!("{}\n", step)).collect();

        let artifacts = [
            (dir.join(INSTANCE_ARTIFACT), instance_json),
            (dir.join(problem_name), problem.to_string()),
            (dir.join(TRACE_ARTIFACT), trace.to_string()),
            (dir.join(PLAN_ARTIFACT), plan_text),
        ];

        for (path, content) in artifacts {
            if path == self.planner.problem_file {
                continue;
            }
            if let Err(e) = write_file(&path, &content).await {
                warn!("Failed to write debug artifact {}: {}", path.display(), e);
            }
        }
    }
}

async fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir).await?;
        }
    }
    tokio::fs::write(path, content).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{FakeCommandRunner, FakeReply};
    use defend_common::{ActionKind, ProblemObjects, ServerObject};
    use tempfile::TempDir;

    fn instance() -> PlanningInstance {
        PlanningInstance {
            domain_name: "website".to_string(),
            problem_name: "p0".to_string(),
            objects: ProblemObjects {
                servers: vec![ServerObject {
                    name: "apache2".to_string(),
                }],
                ips: vec![],
            },
            predicates: vec![],
            utility_values: vec![],
        }
    }

    fn planner(dir: &Path) -> PlannerConfig {
        PlannerConfig {
            domain_file: dir.join("d-basic.pddl"),
            problem_file: dir.join("p-basic.pddl"),
            artifacts_dir: Some(dir.join("debug")),
            ..PlannerConfig::default()
        }
    }

    #[test]
    fn test_solver_args_substituted() {
        let runner = Arc::new(FakeCommandRunner::new());
        let gateway = PlannerGateway::new(runner, planner(Path::new("/srv")), ProblemTemplate::default());
        assert_eq!(
            gateway.solver_command().to_string(),
            "pddl/ff -o /srv/d-basic.pddl -f /srv/p-basic.pddl -O"
        );
    }

    #[tokio::test]
    async fn test_plan_writes_problem_and_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(
            FakeCommandRunner::new().with_reply("pddl/ff", FakeReply::ok("step 0: RESTART_SERVER\n\n")),
        );
        let gateway = PlannerGateway::new(runner.clone(), planner(temp_dir.path()), ProblemTemplate::default());

        let plan = gateway.plan(&instance()).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind, ActionKind::RestartService);

        let problem = std::fs::read_to_string(temp_dir.path().join("p-basic.pddl")).unwrap();
        assert!(problem.starts_with("(define (problem p0)"));

        let debug_dir = temp_dir.path().join("debug");
        assert_eq!(
            std::fs::read_to_string(debug_dir.join("plan.txt")).unwrap(),
            "RESTART_SERVICE\n"
        );
        assert!(debug_dir.join("problem_info.json").exists());
        assert!(debug_dir.join("out.txt").exists());
        assert!(debug_dir.join("p-basic.pddl").exists());
        assert_eq!(runner.call_count("pddl/ff"), 1);
    }

    #[tokio::test]
    async fn test_no_solution_is_empty_plan() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeCommandRunner::new().with_reply(
            "pddl/ff",
            FakeReply::exit(1, "ff: goal can be simplified to FALSE.\n", ""),
        ));
        let gateway = PlannerGateway::new(runner, planner(temp_dir.path()), ProblemTemplate::default());
        assert!(gateway.plan(&instance()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_solver_timeout_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeCommandRunner::new().with_reply("pddl/ff", FakeReply::Timeout));
        let gateway = PlannerGateway::new(runner, planner(temp_dir.path()), ProblemTemplate::default());
        assert!(matches!(
            gateway.plan(&instance()).await,
            Err(GatewayError::SolverTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_trace_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(
            FakeCommandRunner::new().with_reply("pddl/ff", FakeReply::ok("step 0: BLOCK_IP IP0\nbroken\n\n")),
        );
        let gateway = PlannerGateway::new(runner, planner(temp_dir.path()), ProblemTemplate::default());
        assert!(matches!(
            gateway.plan(&instance()).await,
            Err(GatewayError::Trace(TraceError::MalformedStep { line_number: 2, .. }))
        ));
    }
}
