//! Planning instance - the symbolic encoding handed to the solver

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("object '{0}' is not part of the planning instance")]
    UnknownObject(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerObject {
    pub name: String,
}

/// A traffic source, named `ip<N>` by first-seen position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpObject {
    pub symbolic_id: String,
    pub address: String,
    pub peak_rate: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemObjects {
    pub servers: Vec<ServerObject>,
    pub ips: Vec<IpObject>,
}

/// Facts true in the initial state.
///
/// `ServiceUnreachable` covers two observations: the status page timed out,
/// or the worker pool is nearly exhausted. The solver's domain only knows the
/// one predicate, so both map onto it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "predicate", content = "object", rename_all = "snake_case")]
pub enum Predicate {
    HighRate(String),
    Blocked(String),
    ServiceUnreachable(String),
    ServiceSlow(String),
    TimeoutShortened(String),
}

impl Predicate {
    /// Name used in the solver's domain description
    pub fn solver_name(&self) -> &'static str {
        match self {
            Self::HighRate(_) => "REQUEST_RATE_HIGH_FROM_IP",
            Self::Blocked(_) => "BLOCKED",
            Self::ServiceUnreachable(_) => "SERVICE_UNREACHABLE",
            Self::ServiceSlow(_) => "SERVICE_SLOW",
            Self::TimeoutShortened(_) => "REQUEST_HEADER_TIMEOUT_FAST",
        }
    }

    pub fn object(&self) -> &str {
        match self {
            Self::HighRate(o)
            | Self::Blocked(o)
            | Self::ServiceUnreachable(o)
            | Self::ServiceSlow(o)
            | Self::TimeoutShortened(o) => o,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {})", self.solver_name(), self.object())
    }
}

/// Numeric fluent, e.g. `(= (RESTART_COST) 50)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilityValue {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningInstance {
    pub domain_name: String,
    pub problem_name: String,
    pub objects: ProblemObjects,
    pub predicates: Vec<Predicate>,
    pub utility_values: Vec<UtilityValue>,
}

impl PlanningInstance {
    /// Map a symbolic ip id from a plan back to its address.
    ///
    /// Solvers upper-case object names, so the match ignores case.
    pub fn resolve_ip(&self, symbolic_id: &str) -> Result<&str, ResolveError> {
        self.objects
            .ips
            .iter()
            .find(|ip| ip.symbolic_id.eq_ignore_ascii_case(symbolic_id))
            .map(|ip| ip.address.as_str())
            .ok_or_else(|| ResolveError::UnknownObject(symbolic_id.to_string()))
    }

    pub fn has_predicate(&self, predicate: &Predicate) -> bool {
        self.predicates.contains(predicate)
    }
}
