use crate::associations::AssociationTable;
use crate::capacity::CapacityModel;
use crate::jobs::Job;
use crate::planner::{
    eligible_rows, entry_for, jobs_by_deadline, mark_unscheduled, try_place_on_route, OptimizeMode,
    Planner, PlannerKind, Schedule,
};

/// Greedy planner chasing the cleanest (min mode) or dirtiest (max mode)
/// eligible slots. Max mode exists as the worst-case baseline for
/// comparisons.
pub struct CarbonAwarePlanner<'a> {
    table: &'a AssociationTable,
    jobs: &'a [Job],
    mode: OptimizeMode,
}

impl<'a> CarbonAwarePlanner<'a> {
    pub fn new(table: &'a AssociationTable, jobs: &'a [Job], mode: OptimizeMode) -> Self {
        CarbonAwarePlanner { table, jobs, mode }
    }

    /// The job's extreme emissions across every available row; the
    /// deadline tie-break key.
    fn extreme_emissions(&self, job_id: u64) -> f64 {
        let carbons = self
            .table
            .rows_for_job(job_id)
            .iter()
            .map(|&idx| self.table.carbon_emissions_g(idx));
        match self.mode {
            OptimizeMode::Min => carbons.fold(f64::INFINITY, f64::min),
            OptimizeMode::Max => carbons.fold(f64::NEG_INFINITY, f64::max),
        }
    }

    fn extreme_over(&self, rows: &[usize]) -> f64 {
        let carbons = rows.iter().map(|&idx| self.table.carbon_emissions_g(idx));
        match self.mode {
            OptimizeMode::Min => carbons.fold(f64::INFINITY, f64::min),
            OptimizeMode::Max => carbons.fold(f64::NEG_INFINITY, f64::max),
        }
    }

    /// Candidate routes ordered by their extreme eligible emissions,
    /// cleanest first in min mode, dirtiest first in max mode. Each comes
    /// with its slot walk, sorted by emissions with the lower forecast id
    /// winning ties.
    fn route_walks(&self, job: &Job) -> Vec<(String, f64, Vec<usize>)> {
        let mut walks = Vec::new();
        for route_key in self.table.routes_for_job(job.id) {
            let mut rows = eligible_rows(self.table, job.id, route_key, job.deadline_hour);
            if rows.is_empty() {
                continue;
            }
            rows.sort_by(|&a, &b| {
                let (ca, cb) = (
                    self.table.carbon_emissions_g(a),
                    self.table.carbon_emissions_g(b),
                );
                let by_carbon = match self.mode {
                    OptimizeMode::Min => ca.partial_cmp(&cb),
                    OptimizeMode::Max => cb.partial_cmp(&ca),
                };
                by_carbon
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| self.table.forecast_id(a).cmp(&self.table.forecast_id(b)))
            });
            walks.push((route_key.to_string(), self.extreme_over(&rows), rows));
        }
        walks.sort_by(|a, b| {
            let by_extreme = match self.mode {
                OptimizeMode::Min => a.1.partial_cmp(&b.1),
                OptimizeMode::Max => b.1.partial_cmp(&a.1),
            };
            by_extreme
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        walks
    }
}

impl Planner for CarbonAwarePlanner<'_> {
    fn kind(&self) -> PlannerKind {
        match self.mode {
            OptimizeMode::Min => PlannerKind::GreedyCarbonMin,
            OptimizeMode::Max => PlannerKind::GreedyCarbonMax,
        }
    }

    fn plan(&mut self) -> Schedule {
        let mut capacity = CapacityModel::for_table(self.table);
        let mut entries = Vec::new();
        let mut unscheduled = Vec::new();

        let order = match self.mode {
            OptimizeMode::Min => jobs_by_deadline(self.jobs, |job| self.extreme_emissions(job.id)),
            // larger extremes first in max mode
            OptimizeMode::Max => jobs_by_deadline(self.jobs, |job| -self.extreme_emissions(job.id)),
        };

        for job in order {
            let mut placed = false;
            for (route_key, _, walk) in self.route_walks(job) {
                let required = match self.table.transfer_time_for(job.id, &route_key) {
                    Some(t) => t,
                    None => continue,
                };
                if let Some(taken) = try_place_on_route(&mut capacity, self.table, &walk, required)
                {
                    for (row_idx, seconds) in taken {
                        entries.push(entry_for(self.table, row_idx, seconds, job.deadline_hour));
                    }
                    placed = true;
                    break;
                }
            }
            if !placed {
                mark_unscheduled(job, &mut unscheduled);
            }
        }

        unscheduled.sort_unstable();
        Schedule {
            planner: self.kind(),
            entries,
            unscheduled_job_ids: unscheduled,
        }
    }
}
