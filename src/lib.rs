pub mod associations;
pub mod builder;
pub mod capacity;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod forecast;
pub mod jobs;
pub mod nodes;
pub mod planner;
pub mod simulator;
pub mod traceroute;
pub mod zones;

pub use associations::{AssociationRow, AssociationTable};
pub use builder::{AssociationBuilder, SimulationResults};
pub use capacity::{CapacityModel, SLOT_SECONDS};
pub use config::{Config, Validate};
pub use error::PlanError;
pub use evaluator::ScheduleEvaluator;
pub use forecast::ForecastStore;
pub use jobs::Job;
pub use nodes::{Node, NodeMap, NodeType};
pub use planner::{planner_for, Planner, PlannerKind, Schedule, ScheduleEntry};
pub use simulator::{ExternalSimulator, SimOutput, SimulatorBackend, StubSimulator};
pub use traceroute::{Hop, Route};
pub use zones::ZoneResolver;

/// Version number
pub static VERSION: &str = env!("CARGO_PKG_VERSION");
