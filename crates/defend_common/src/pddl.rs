//! Problem description rendering

use crate::instance::PlanningInstance;
use serde::{Deserialize, Serialize};

/// Parts of the problem file that do not come from the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemTemplate {
    /// Goal formula, e.g. `(GOAL-REACHED)`
    pub goal: String,
    /// Optional metric, e.g. `minimize (TOTAL-COST)`
    pub metric: Option<String>,
}

impl Default for ProblemTemplate {
    fn default() -> Self {
        Self {
            goal: "(GOAL-REACHED)".to_string(),
            metric: Some("minimize (TOTAL-COST)".to_string()),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Render the instance as a problem description
pub fn render_problem(instance: &PlanningInstance, template: &ProblemTemplate) -> String {
    let mut out = String::new();

    out.push_str(&format!("(define (problem {})\n", instance.problem_name));
    out.push_str(&format!("  (:domain {})\n", instance.domain_name));

    out.push_str("  (:objects\n");
    for server in &instance.objects.servers {
        out.push_str(&format!("    {} - server\n", server.name));
    }
    for ip in &instance.objects.ips {
        out.push_str(&format!("    {} - ip\n", ip.symbolic_id));
    }
    out.push_str("  )\n");

    out.push_str("  (:init\n");
    for predicate in &instance.predicates {
        out.push_str(&format!("    {}\n", predicate));
    }
    for utility in &instance.utility_values {
        out.push_str(&format!(
            "    (= ({}) {})\n",
            utility.name,
            format_number(utility.value)
        ));
    }
    out.push_str("  )\n");

    out.push_str(&format!("  (:goal {})\n", template.goal));
    if let Some(metric) = &template.metric {
        out.push_str(&format!("  (:metric {})\n", metric));
    }
    out.push_str(")\n");

    out
}
