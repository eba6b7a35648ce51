use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Error};
use serde::{Deserialize, Serialize};

use crate::associations::AssociationTable;
use crate::capacity::{CapacityModel, SLOT_SECONDS};
use crate::config::Milp;
use crate::jobs::Job;

mod edf;
mod greedy;
mod milp;
mod round_robin;
mod sjf;

pub use edf::EarliestDeadlineFirst;
pub use greedy::CarbonAwarePlanner;
pub use milp::MilpGreenPlanner;
pub use round_robin::RoundRobin;
pub use sjf::ShortestJobFirst;

/// Tolerance when checking that accumulated seconds cover a transfer.
pub(crate) const PLACEMENT_EPSILON: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizeMode {
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlannerKind {
    GreedyCarbonMin,
    GreedyCarbonMax,
    RoundRobin,
    ShortestJobFirst,
    EarliestDeadlineFirst,
    MilpNormalized,
    MilpBinary,
}

impl PlannerKind {
    pub const ALL: [PlannerKind; 7] = [
        PlannerKind::GreedyCarbonMin,
        PlannerKind::GreedyCarbonMax,
        PlannerKind::RoundRobin,
        PlannerKind::ShortestJobFirst,
        PlannerKind::EarliestDeadlineFirst,
        PlannerKind::MilpNormalized,
        PlannerKind::MilpBinary,
    ];

    /// Selector string, also the stem of the planner's output CSV.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannerKind::GreedyCarbonMin => "green",
            PlannerKind::GreedyCarbonMax => "worst",
            PlannerKind::RoundRobin => "rr",
            PlannerKind::ShortestJobFirst => "sjf",
            PlannerKind::EarliestDeadlineFirst => "edf",
            PlannerKind::MilpNormalized => "milp_norm",
            PlannerKind::MilpBinary => "milp_binary",
        }
    }
}

impl fmt::Display for PlannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlannerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "green" => Ok(PlannerKind::GreedyCarbonMin),
            "worst" => Ok(PlannerKind::GreedyCarbonMax),
            "rr" => Ok(PlannerKind::RoundRobin),
            "sjf" => Ok(PlannerKind::ShortestJobFirst),
            "edf" => Ok(PlannerKind::EarliestDeadlineFirst),
            "milp_norm" => Ok(PlannerKind::MilpNormalized),
            "milp_binary" => Ok(PlannerKind::MilpBinary),
            other => Err(anyhow!("unknown planner {:?}", other)),
        }
    }
}

/// One (job, route, slot) allocation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ScheduleEntry {
    pub job_id: u64,
    pub route_key: String,
    pub source_node: String,
    pub destination_node: String,
    pub forecast_id: u32,
    pub allocated_seconds: f64,
    pub allocated_fraction: f64,
    pub carbon_emissions_g: f64,
    pub throughput_bps: f64,
    pub transfer_time_s: f64,
    pub deadline_hour: u32,
}

/// The uniform schedule artifact every planner produces. Entries follow
/// commit order; failures land in `unscheduled_job_ids` instead of aborting
/// the plan.
#[derive(Clone, Debug)]
pub struct Schedule {
    pub planner: PlannerKind,
    pub entries: Vec<ScheduleEntry>,
    pub unscheduled_job_ids: Vec<u64>,
}

impl Schedule {
    pub fn empty(planner: PlannerKind, jobs: &[Job]) -> Self {
        let mut unscheduled: Vec<u64> = jobs.iter().map(|j| j.id).collect();
        unscheduled.sort_unstable();
        Schedule {
            planner,
            entries: Vec::new(),
            unscheduled_job_ids: unscheduled,
        }
    }

    pub fn allocated_seconds_for(&self, job_id: u64) -> f64 {
        self.entries
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.allocated_seconds)
            .sum()
    }

    pub fn total_emissions_g(&self) -> f64 {
        self.entries.iter().map(|e| e.carbon_emissions_g).sum()
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), Error> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for entry in &self.entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub trait Planner {
    fn kind(&self) -> PlannerKind;

    /// Produces a schedule from the associations table under a fresh
    /// capacity model. Deterministic for identical inputs.
    fn plan(&mut self) -> Schedule;
}

/// Factory keyed by the planner selector.
pub fn planner_for<'a>(
    kind: PlannerKind,
    table: &'a AssociationTable,
    jobs: &'a [Job],
    milp: &Milp,
) -> Box<dyn Planner + 'a> {
    match kind {
        PlannerKind::GreedyCarbonMin => {
            Box::new(CarbonAwarePlanner::new(table, jobs, OptimizeMode::Min))
        }
        PlannerKind::GreedyCarbonMax => {
            Box::new(CarbonAwarePlanner::new(table, jobs, OptimizeMode::Max))
        }
        PlannerKind::RoundRobin => Box::new(RoundRobin::new(table, jobs)),
        PlannerKind::ShortestJobFirst => Box::new(ShortestJobFirst::new(table, jobs)),
        PlannerKind::EarliestDeadlineFirst => Box::new(EarliestDeadlineFirst::new(table, jobs)),
        PlannerKind::MilpNormalized => Box::new(MilpGreenPlanner::new(
            table,
            jobs,
            milp::Formulation::Normalized,
            milp.clone(),
        )),
        PlannerKind::MilpBinary => Box::new(MilpGreenPlanner::new(
            table,
            jobs,
            milp::Formulation::Binary,
            milp.clone(),
        )),
    }
}

/// Builds the entry for `seconds` of a job on the slot behind `row_idx`.
/// The row's emissions describe the whole transfer starting in that slot, so
/// the entry carries the share proportional to the seconds it hosts.
pub(crate) fn entry_for(table: &AssociationTable, row_idx: usize, seconds: f64, deadline_hour: u32) -> ScheduleEntry {
    let transfer_time = table.transfer_time_s(row_idx);
    let carbon_share = if transfer_time > 0.0 {
        table.carbon_emissions_g(row_idx) * seconds / transfer_time
    } else {
        0.0
    };
    ScheduleEntry {
        job_id: table.job_id(row_idx),
        route_key: table.route_key(row_idx).to_string(),
        source_node: table.source_node(row_idx).to_string(),
        destination_node: table.destination_node(row_idx).to_string(),
        forecast_id: table.forecast_id(row_idx),
        allocated_seconds: seconds,
        allocated_fraction: seconds / SLOT_SECONDS,
        carbon_emissions_g: carbon_share,
        throughput_bps: table.throughput_bps(row_idx),
        transfer_time_s: transfer_time,
        deadline_hour,
    }
}

/// Row indexes of a (job, route) whose slot does not overrun the deadline,
/// in forecast order.
pub(crate) fn eligible_rows(
    table: &AssociationTable,
    job_id: u64,
    route_key: &str,
    deadline_hour: u32,
) -> Vec<usize> {
    table
        .rows_for_job_route(job_id, route_key)
        .iter()
        .copied()
        .filter(|&idx| table.forecast_id(idx) <= deadline_hour)
        .collect()
}

/// Walks candidate rows in the given order, reserving up to `required`
/// seconds in total. Commits only a complete placement: on a shortfall every
/// reservation is released and the capacity model reads as before the call.
pub(crate) fn try_place_on_route(
    capacity: &mut CapacityModel,
    table: &AssociationTable,
    walk_order: &[usize],
    required: f64,
) -> Option<Vec<(usize, f64)>> {
    let mut taken: Vec<(usize, f64)> = Vec::new();
    let mut remaining = required;

    for &row_idx in walk_order {
        if remaining <= PLACEMENT_EPSILON {
            break;
        }
        let route_key = table.route_key(row_idx);
        let forecast_id = table.forecast_id(row_idx);
        let available = capacity.available(route_key, forecast_id);
        if available <= 0.0 {
            continue;
        }
        let take = available.min(remaining);
        if capacity.reserve(route_key, forecast_id, take).is_err() {
            continue;
        }
        taken.push((row_idx, take));
        remaining -= take;
    }

    if remaining <= PLACEMENT_EPSILON {
        Some(taken)
    } else {
        for &(row_idx, seconds) in &taken {
            capacity.release(table.route_key(row_idx), table.forecast_id(row_idx), seconds);
        }
        None
    }
}

/// First-fit search for `slots_needed` rows with numerically consecutive
/// forecast ids, a last slot within the deadline, and room for an even
/// `share` in each. Returns the chosen row indexes without reserving.
pub(crate) fn find_consecutive_slots(
    capacity: &CapacityModel,
    table: &AssociationTable,
    rows_in_forecast_order: &[usize],
    slots_needed: usize,
    deadline_hour: u32,
    share: f64,
) -> Option<Vec<usize>> {
    if slots_needed == 0 || rows_in_forecast_order.len() < slots_needed {
        return None;
    }
    'windows: for window in rows_in_forecast_order.windows(slots_needed) {
        let last_id = table.forecast_id(window[slots_needed - 1]);
        if last_id > deadline_hour {
            continue;
        }
        for pair in window.windows(2) {
            if table.forecast_id(pair[1]) != table.forecast_id(pair[0]) + 1 {
                continue 'windows;
            }
        }
        for &row_idx in window {
            let available =
                capacity.available(table.route_key(row_idx), table.forecast_id(row_idx));
            if available + PLACEMENT_EPSILON < share {
                continue 'windows;
            }
        }
        return Some(window.to_vec());
    }
    None
}

/// Records a job the current plan could not place: logged with the typed
/// error and appended to the unscheduled set, never an abort.
pub(crate) fn mark_unscheduled(job: &Job, unscheduled: &mut Vec<u64>) {
    let error = crate::error::PlanError::DeadlineUnreachable {
        job_id: job.id,
        deadline_hour: job.deadline_hour,
    };
    tracing::warn!(%error, "failed to schedule job");
    unscheduled.push(job.id);
}

/// Jobs sorted by deadline with a caller-chosen tie-break; job id is the
/// final tie so float keys never decide an ordering.
pub(crate) fn jobs_by_deadline<'a, K, F>(jobs: &'a [Job], tie: F) -> Vec<&'a Job>
where
    K: PartialOrd,
    F: Fn(&Job) -> K,
{
    let mut sorted: Vec<&Job> = jobs.iter().collect();
    sorted.sort_by(|a, b| {
        a.deadline_hour
            .cmp(&b.deadline_hour)
            .then_with(|| {
                tie(a)
                    .partial_cmp(&tie(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::associations::tests::row;

    #[test]
    fn kind_round_trip() {
        for kind in PlannerKind::ALL.iter() {
            assert_eq!(kind.as_str().parse::<PlannerKind>().unwrap(), *kind);
        }
        assert!("gnn".parse::<PlannerKind>().is_err());
        assert!("all".parse::<PlannerKind>().is_err());
    }

    #[test]
    fn placement_rolls_back_on_shortfall() {
        let table = AssociationTable::from_rows(vec![
            row("a_z", 1, 0, 5000.0, 1.0),
            row("a_z", 1, 1, 5000.0, 1.0),
        ]);
        let mut cap = CapacityModel::for_table(&table);
        let walk: Vec<usize> = table.rows_for_job_route(1, "a_z").to_vec();

        // 2 slots x 3600s cannot hold 8000s
        assert!(try_place_on_route(&mut cap, &table, &walk, 8000.0).is_none());
        assert_eq!(cap.available("a_z", 0), SLOT_SECONDS);
        assert_eq!(cap.available("a_z", 1), SLOT_SECONDS);

        let placed = try_place_on_route(&mut cap, &table, &walk, 5000.0).unwrap();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].1, 3600.0);
        assert_eq!(placed[1].1, 1400.0);
        assert_eq!(cap.available("a_z", 1), 2200.0);
    }

    #[test]
    fn consecutive_window_skips_gaps() {
        let table = AssociationTable::from_rows(vec![
            row("a_z", 1, 0, 7000.0, 1.0),
            row("a_z", 1, 2, 7000.0, 1.0),
            row("a_z", 1, 3, 7000.0, 1.0),
        ]);
        let cap = CapacityModel::for_table(&table);
        let rows: Vec<usize> = table.rows_for_job_route(1, "a_z").to_vec();

        // hours 0 and 2 are not consecutive; the first valid window is 2..=3
        let window = find_consecutive_slots(&cap, &table, &rows, 2, 3, 3500.0).unwrap();
        assert_eq!(table.forecast_id(window[0]), 2);
        assert_eq!(table.forecast_id(window[1]), 3);

        assert!(find_consecutive_slots(&cap, &table, &rows, 2, 2, 3500.0).is_none());
    }

    #[test]
    fn entry_prorates_carbon() {
        let table = AssociationTable::from_rows(vec![row("a_z", 1, 0, 2000.0, 10.0)]);
        let entry = entry_for(&table, 0, 500.0, 4);
        assert!((entry.carbon_emissions_g - 2.5).abs() < 1e-12);
        assert!((entry.allocated_fraction - 500.0 / 3600.0).abs() < 1e-12);
        assert_eq!(entry.deadline_hour, 4);
    }
}
