//! Plan2Defend Common - Shared model and pure codecs
//!
//! Everything in this crate is free of I/O: snapshot and planning types,
//! the snapshot → planning-instance encoder, and the text grammars the
//! daemon reads (status page, access log, firewall table, timeout policy,
//! solver trace) and writes (problem description).

pub mod action;
pub mod encoder;
pub mod instance;
pub mod parsers;
pub mod pddl;
pub mod timeout_policy;
pub mod trace;
pub mod traffic;
pub mod types;

pub use action::{Action, ActionKind, Plan};
pub use encoder::{encode, EncoderSettings, Thresholds};
pub use instance::{IpObject, PlanningInstance, Predicate, ProblemObjects, ResolveError, ServerObject, UtilityValue};
pub use timeout_policy::{BodyTimeout, HeaderTimeout, PolicyError, TimeoutPolicy, TimeoutPolicyValues};
pub use trace::{parse_trace, TraceError};
pub use types::{AddressTraffic, MinuteBucket, ServiceObservation, Snapshot, TrafficTable};
