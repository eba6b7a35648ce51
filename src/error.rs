use thiserror::Error;

/// Failures of the planning core.
///
/// Per-job and per-route failures are recoverable: the builder skips the
/// affected rows and planners report unscheduled jobs instead of aborting.
/// Only `InputMalformed` is fatal at load time.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("no forecast for zone {zone} at hour {hour}")]
    ForecastMissing { zone: String, hour: u32 },

    #[error("simulator produced no output for route {route_key}, job {job_id}: {reason}")]
    SimulatorUnavailable {
        route_key: String,
        job_id: u64,
        reason: String,
    },

    #[error(
        "cannot reserve {requested}s on route {route_key} slot {forecast_id}: {available}s available"
    )]
    InsufficientCapacity {
        route_key: String,
        forecast_id: u32,
        requested: f64,
        available: f64,
    },

    #[error("job {job_id} cannot finish before its deadline (hour {deadline_hour})")]
    DeadlineUnreachable { job_id: u64, deadline_hour: u32 },

    #[error("solver returned no usable solution: {0}")]
    SolverInfeasible(String),

    #[error("malformed input: {0}")]
    InputMalformed(String),
}
