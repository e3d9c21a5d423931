//! defendd library - exposes the controller components for the binary and
//! for integration tests.

pub mod audit;
pub mod collector;
pub mod command;
pub mod config;
pub mod control;
pub mod executor;
pub mod gateway;
pub mod status;

pub use collector::{CollectError, StateCollector};
pub use command::{CommandRunner, FakeCommandRunner, SystemCommandRunner};
pub use config::DefendConfig;
pub use control::{assess_incident, ControlLoop, CycleError, CycleOutcome, IncidentCause};
pub use executor::{ActionExecutor, ExecError, ExecutionReport, StepOutcome};
pub use gateway::{GatewayError, PlannerGateway};
pub use status::{FakeStatusSource, HttpStatusSource, StatusSource};
