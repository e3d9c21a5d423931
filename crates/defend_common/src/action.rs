//! Plan actions returned by the solver

use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed action vocabulary of the solver domain.
///
/// Solver output is matched case-insensitively, and the older domain names
/// (`RESTART_SERVER`, `DECREASE_REQUEST_HEADER_TIMEOUT`,
/// `INCREASE_REQUEST_TIMEOUT`) are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ReachGoal,
    RestartService,
    BlockIp,
    UnblockIp,
    TightenTimeout,
    ReloosenTimeout,
    /// Anything outside the vocabulary, kept verbatim for reporting
    Unknown(String),
}

impl ActionKind {
    pub fn from_solver_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "REACH-GOAL" | "REACH_GOAL" => Self::ReachGoal,
            "RESTART_SERVICE" | "RESTART_SERVER" => Self::RestartService,
            "BLOCK_IP" => Self::BlockIp,
            "UNBLOCK_IP" => Self::UnblockIp,
            "TIGHTEN_TIMEOUT" | "DECREASE_REQUEST_HEADER_TIMEOUT" => Self::TightenTimeout,
            "RELOOSEN_TIMEOUT" | "INCREASE_REQUEST_TIMEOUT" => Self::ReloosenTimeout,
            _ => Self::Unknown(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ReachGoal => "REACH-GOAL",
            Self::RestartService => "RESTART_SERVICE",
            Self::BlockIp => "BLOCK_IP",
            Self::UnblockIp => "UNBLOCK_IP",
            Self::TightenTimeout => "TIGHTEN_TIMEOUT",
            Self::ReloosenTimeout => "RELOOSEN_TIMEOUT",
            Self::Unknown(name) => name,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub args: Vec<String>,
}

impl Action {
    pub fn new(kind: ActionKind, args: Vec<String>) -> Self {
        Self { kind, args }
    }

    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Ordered action sequence; empty when the solver found nothing to do
pub type Plan = Vec<Action>;
