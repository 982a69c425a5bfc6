/// Simulation orchestration over the consensus core
///
/// Turns a configuration into a running set of replicas and learners on
/// one simulated network, drains their event stream to the host, and
/// tears everything down on a timer or an explicit stop.

pub mod config;
pub mod orchestrator;

pub use config::{ConfigError, LearnerSpec, SimulationConfig};
pub use orchestrator::{Simulation, StartError};
