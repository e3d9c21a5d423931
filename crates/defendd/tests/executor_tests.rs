//! Executor behaviour against real files and a fake command runner:
//! block idempotence, resolution misses, and timeout policy rewrites.

use chrono::Utc;
use defend_common::timeout_policy::parse_policy;
use defend_common::{
    Action, ActionKind, IpObject, PlanningInstance, ProblemObjects, ServerObject,
    ServiceObservation, Snapshot, TimeoutPolicy, TimeoutPolicyValues, TrafficTable,
};
use defendd::command::{FakeCommandRunner, FakeReply};
use defendd::config::{ActionsConfig, TimeoutPresetsConfig};
use defendd::executor::{ActionExecutor, ExecError, StepOutcome};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const POLICY: &str = "<IfModule reqtimeout_module>\n\
\t# RequestReadTimeout header=10-20,MinRate=500 body=20,MinRate=500\n\
\tRequestReadTimeout header=20-40,minrate=500\n\
\tRequestReadTimeout body=10,minrate=500\n\
</IfModule>\n";

fn snapshot(blocked: &[&str]) -> Snapshot {
    let baseline = TimeoutPolicyValues::baseline();
    Snapshot {
        server_name: "apache2".to_string(),
        captured_at: Utc::now(),
        traffic: TrafficTable::new(),
        service: ServiceObservation::Reachable {
            idle_workers: 0,
            busy_workers: 150,
            cpu_system: 0.9,
            response_time: 9.0,
        },
        blocked_addresses: blocked.iter().map(|a| a.to_string()).collect::<BTreeSet<_>>(),
        timeout_policy: TimeoutPolicy {
            header: baseline.header,
            body: baseline.body,
            shortened: false,
        },
        business_costs: BTreeMap::new(),
    }
}

fn instance() -> PlanningInstance {
    PlanningInstance {
        domain_name: "website".to_string(),
        problem_name: "p0".to_string(),
        objects: ProblemObjects {
            servers: vec![ServerObject {
                name: "apache2".to_string(),
            }],
            ips: vec![
                IpObject {
                    symbolic_id: "ip0".to_string(),
                    address: "203.0.113.9".to_string(),
                    peak_rate: 130,
                },
                IpObject {
                    symbolic_id: "ip1".to_string(),
                    address: "198.51.100.4".to_string(),
                    peak_rate: 3,
                },
            ],
        },
        predicates: vec![],
        utility_values: vec![],
    }
}

fn executor(runner: Arc<FakeCommandRunner>, policy_path: &Path) -> ActionExecutor {
    ActionExecutor::new(
        runner,
        ActionsConfig::default(),
        TimeoutPresetsConfig::default(),
        policy_path.to_path_buf(),
    )
}

/// Writes the policy file in-process, as a daemon running as root would
fn unprivileged_executor(runner: Arc<FakeCommandRunner>, policy_path: &Path) -> ActionExecutor {
    let actions = ActionsConfig {
        use_sudo: false,
        ..ActionsConfig::default()
    };
    ActionExecutor::new(
        runner,
        actions,
        TimeoutPresetsConfig::default(),
        policy_path.to_path_buf(),
    )
}

fn step(kind: ActionKind, arg: Option<&str>) -> Action {
    Action::new(kind, arg.map(|a| vec![a.to_string()]).unwrap_or_default())
}

#[tokio::test]
async fn test_block_twice_in_one_plan_issues_one_command() {
    let runner = Arc::new(FakeCommandRunner::new());
    let exec = executor(runner.clone(), Path::new("/nonexistent"));
    let plan = vec![
        step(ActionKind::BlockIp, Some("IP0")),
        step(ActionKind::BlockIp, Some("ip0")),
    ];

    let report = exec.execute_plan(&plan, &snapshot(&[]), &instance()).await;

    assert!(matches!(report.steps[0].outcome, StepOutcome::Applied));
    assert!(matches!(report.steps[1].outcome, StepOutcome::Skipped(_)));
    assert_eq!(runner.call_count("insert 1 deny from 203.0.113.9"), 1);
}

#[tokio::test]
async fn test_block_of_already_blocked_address_is_skipped() {
    let runner = Arc::new(FakeCommandRunner::new());
    let exec = executor(runner.clone(), Path::new("/nonexistent"));
    let plan = vec![step(ActionKind::BlockIp, Some("IP0"))];

    let report = exec
        .execute_plan(&plan, &snapshot(&["203.0.113.9"]), &instance())
        .await;

    assert!(matches!(report.steps[0].outcome, StepOutcome::Skipped(_)));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_unblock_of_blocked_address() {
    let runner = Arc::new(FakeCommandRunner::new());
    let exec = executor(runner.clone(), Path::new("/nonexistent"));
    let plan = vec![step(ActionKind::UnblockIp, Some("IP1"))];

    let report = exec
        .execute_plan(&plan, &snapshot(&["198.51.100.4"]), &instance())
        .await;

    assert_eq!(report.applied_count(), 1);
    assert_eq!(
        runner.calls(),
        vec!["sudo ufw delete deny from 198.51.100.4 to any"]
    );
}

#[tokio::test]
async fn test_unknown_symbolic_id_issues_no_command() {
    let runner = Arc::new(FakeCommandRunner::new());
    let exec = executor(runner.clone(), Path::new("/nonexistent"));
    let plan = vec![
        step(ActionKind::BlockIp, Some("IP7")),
        step(ActionKind::RestartService, None),
    ];

    let report = exec.execute_plan(&plan, &snapshot(&[]), &instance()).await;

    assert!(matches!(
        report.steps[0].outcome,
        StepOutcome::Failed(ExecError::UnresolvedObject(_))
    ));
    assert!(matches!(report.steps[1].outcome, StepOutcome::Applied));
    assert_eq!(runner.calls(), vec!["sudo systemctl restart apache2"]);
}

#[tokio::test]
async fn test_tighten_then_reloosen_restores_policy_file() {
    let temp_dir = TempDir::new().unwrap();
    let policy_path = temp_dir.path().join("reqtimeout.conf");
    std::fs::write(&policy_path, POLICY).unwrap();

    let runner = Arc::new(FakeCommandRunner::new());
    let exec = unprivileged_executor(runner.clone(), &policy_path);

    let tighten = vec![step(ActionKind::TightenTimeout, Some("APACHE2"))];
    let report = exec.execute_plan(&tighten, &snapshot(&[]), &instance()).await;
    assert!(matches!(report.steps[0].outcome, StepOutcome::Applied));

    let tightened = std::fs::read_to_string(&policy_path).unwrap();
    let policy = parse_policy(&tightened, 10).unwrap();
    assert!(policy.shortened);
    assert_eq!(policy.header, TimeoutPolicyValues::shortened().header);
    assert_eq!(policy.body, TimeoutPolicyValues::baseline().body);

    // Already at the shortened preset
    let report = exec.execute_plan(&tighten, &snapshot(&[]), &instance()).await;
    assert!(matches!(report.steps[0].outcome, StepOutcome::Skipped(_)));

    let reloosen = vec![step(ActionKind::ReloosenTimeout, Some("APACHE2"))];
    let report = exec.execute_plan(&reloosen, &snapshot(&[]), &instance()).await;
    assert!(matches!(report.steps[0].outcome, StepOutcome::Applied));

    assert_eq!(std::fs::read_to_string(&policy_path).unwrap(), POLICY);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_unparseable_policy_fails_step() {
    let temp_dir = TempDir::new().unwrap();
    let policy_path = temp_dir.path().join("reqtimeout.conf");
    std::fs::write(&policy_path, "RequestReadTimeout body=10,minrate=500\n").unwrap();

    let exec = unprivileged_executor(Arc::new(FakeCommandRunner::new()), &policy_path);
    let plan = vec![step(ActionKind::TightenTimeout, None)];
    let report = exec.execute_plan(&plan, &snapshot(&[]), &instance()).await;

    assert!(matches!(
        report.steps[0].outcome,
        StepOutcome::Failed(ExecError::Policy(_))
    ));
    assert_eq!(
        std::fs::read_to_string(&policy_path).unwrap(),
        "RequestReadTimeout body=10,minrate=500\n"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_tighten_through_symlink_keeps_link() {
    let temp_dir = TempDir::new().unwrap();
    let available = temp_dir.path().join("mods-available");
    let enabled = temp_dir.path().join("mods-enabled");
    std::fs::create_dir(&available).unwrap();
    std::fs::create_dir(&enabled).unwrap();
    std::fs::write(available.join("reqtimeout.conf"), POLICY).unwrap();
    let link = enabled.join("reqtimeout.conf");
    std::os::unix::fs::symlink("../mods-available/reqtimeout.conf", &link).unwrap();

    let exec = unprivileged_executor(Arc::new(FakeCommandRunner::new()), &link);
    let tighten = vec![step(ActionKind::TightenTimeout, Some("APACHE2"))];
    let report = exec.execute_plan(&tighten, &snapshot(&[]), &instance()).await;
    assert!(matches!(report.steps[0].outcome, StepOutcome::Applied));

    assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    let target = std::fs::read_to_string(available.join("reqtimeout.conf")).unwrap();
    assert!(parse_policy(&target, 10).unwrap().shortened);
    assert_eq!(std::fs::read_dir(&available).unwrap().count(), 1);
}

#[tokio::test]
async fn test_privileged_tighten_goes_through_runner() {
    let temp_dir = TempDir::new().unwrap();
    let policy_path = temp_dir.path().join("reqtimeout.conf");
    std::fs::write(&policy_path, POLICY).unwrap();
    let real_path = std::fs::canonicalize(&policy_path).unwrap();

    let runner = Arc::new(FakeCommandRunner::new());
    let exec = executor(runner.clone(), &policy_path);
    let tighten = vec![step(ActionKind::TightenTimeout, Some("APACHE2"))];
    let report = exec.execute_plan(&tighten, &snapshot(&[]), &instance()).await;
    assert!(matches!(report.steps[0].outcome, StepOutcome::Applied));

    let sibling = format!("{}.plan2defend.tmp", real_path.display());
    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("sudo cp "));
    assert!(calls[0].ends_with(&sibling));
    assert_eq!(calls[1], format!("sudo mv -f {} {}", sibling, real_path.display()));

    // The staged copy is cleaned up and the file itself is left to root
    let staging = calls[0].split(' ').nth(2).unwrap();
    assert!(!Path::new(staging).exists());
    assert_eq!(std::fs::read_to_string(&policy_path).unwrap(), POLICY);
}

#[tokio::test]
async fn test_privileged_rename_failure_fails_step() {
    let temp_dir = TempDir::new().unwrap();
    let policy_path = temp_dir.path().join("reqtimeout.conf");
    std::fs::write(&policy_path, POLICY).unwrap();

    let runner = Arc::new(
        FakeCommandRunner::new().with_reply("sudo mv", FakeReply::exit(1, "", "permission denied")),
    );
    let exec = executor(runner.clone(), &policy_path);
    let tighten = vec![step(ActionKind::TightenTimeout, None)];
    let report = exec.execute_plan(&tighten, &snapshot(&[]), &instance()).await;

    assert!(matches!(
        report.steps[0].outcome,
        StepOutcome::Failed(ExecError::Command(_))
    ));
    assert_eq!(runner.calls().len(), 2);
}
