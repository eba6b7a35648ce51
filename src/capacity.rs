use std::collections::HashMap;

use crate::associations::AssociationTable;
use crate::error::PlanError;

/// Seconds of transfer one slot can hold.
pub const SLOT_SECONDS: f64 = 3600.0;

/// Slack for floating-point reservation arithmetic.
const EPSILON: f64 = 1e-6;

/// Remaining seconds per (route, slot). Instantiated fresh at the start of
/// every plan and discarded when it returns; a failed multi-slot attempt is
/// rolled back with `release`, so remaining capacity only decreases across
/// committed allocations.
#[derive(Clone, Debug)]
pub struct CapacityModel {
    remaining: HashMap<(String, u32), f64>,
}

impl CapacityModel {
    /// Fresh model with `SLOT_SECONDS` for every (route, slot) pair present
    /// in the associations table.
    pub fn for_table(table: &AssociationTable) -> Self {
        let mut remaining = HashMap::new();
        for idx in 0..table.len() {
            remaining.insert(
                (table.route_key(idx).to_string(), table.forecast_id(idx)),
                SLOT_SECONDS,
            );
        }
        CapacityModel { remaining }
    }

    pub fn available(&self, route_key: &str, forecast_id: u32) -> f64 {
        self.remaining
            .get(&(route_key.to_string(), forecast_id))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn reserve(
        &mut self,
        route_key: &str,
        forecast_id: u32,
        seconds: f64,
    ) -> Result<(), PlanError> {
        let slot = self
            .remaining
            .get_mut(&(route_key.to_string(), forecast_id));
        match slot {
            Some(remaining) if seconds <= *remaining + EPSILON => {
                *remaining = (*remaining - seconds).max(0.0);
                Ok(())
            }
            Some(remaining) => Err(PlanError::InsufficientCapacity {
                route_key: route_key.to_string(),
                forecast_id,
                requested: seconds,
                available: *remaining,
            }),
            None => Err(PlanError::InsufficientCapacity {
                route_key: route_key.to_string(),
                forecast_id,
                requested: seconds,
                available: 0.0,
            }),
        }
    }

    /// Restores capacity released by a rolled-back attempt, clamped to the
    /// slot length.
    pub fn release(&mut self, route_key: &str, forecast_id: u32, seconds: f64) {
        if let Some(remaining) = self
            .remaining
            .get_mut(&(route_key.to_string(), forecast_id))
        {
            *remaining = (*remaining + seconds).min(SLOT_SECONDS);
        }
    }
}
