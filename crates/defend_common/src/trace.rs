//! Solver trace parsing
//!
//! The solver prints a free-form log with the solution embedded as:
//!
//! ```text
//! ff: found legal plan as follows
//!
//! step    0: BLOCK_IP IP0
//!         1: REACH-GOAL
//!
//! time spent: ...
//! ```
//!
//! Everything before the first `step` line is ignored and the block ends at
//! the first blank line. No `step` line means no solution, which is an empty
//! plan rather than an error.

use crate::action::{Action, ActionKind, Plan};

/// Prefix of the line that opens the solution block
pub const STEP_MARKER: &str = "step";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("malformed plan step on line {line_number}: '{line}'")]
    MalformedStep { line_number: usize, line: String },
}

fn parse_step(step: &str, line_number: usize, raw: &str) -> Result<Action, TraceError> {
    let malformed = || TraceError::MalformedStep {
        line_number,
        line: raw.to_string(),
    };

    let (_, body) = step.split_once(':').ok_or_else(malformed)?;
    let mut tokens = body.split_whitespace();
    let name = tokens.next().ok_or_else(malformed)?;

    Ok(Action::new(
        ActionKind::from_solver_name(name),
        tokens.map(str::to_string).collect(),
    ))
}

/// Extract the plan from a solver trace
pub fn parse_trace(trace: &str) -> Result<Plan, TraceError> {
    let mut plan = Vec::new();
    let mut in_block = false;

    for (index, raw) in trace.lines().enumerate() {
        let line = raw.trim();

        if !in_block {
            if let Some(rest) = line.strip_prefix(STEP_MARKER) {
                in_block = true;
                plan.push(parse_step(rest, index + 1, raw)?);
            }
            continue;
        }

        if line.is_empty() {
            break;
        }
        plan.push(parse_step(line, index + 1, raw)?);
    }

    Ok(plan)
}
