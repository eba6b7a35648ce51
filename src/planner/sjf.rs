use crate::associations::AssociationTable;
use crate::capacity::{CapacityModel, SLOT_SECONDS};
use crate::jobs::Job;
use crate::planner::{
    entry_for, find_consecutive_slots, mark_unscheduled, Planner, PlannerKind, Schedule,
};

/// Shortest-job-first: quickest transfers go first, each into the earliest
/// run of consecutive slots that can hold an even share of the transfer.
pub struct ShortestJobFirst<'a> {
    table: &'a AssociationTable,
    jobs: &'a [Job],
}

impl<'a> ShortestJobFirst<'a> {
    pub fn new(table: &'a AssociationTable, jobs: &'a [Job]) -> Self {
        ShortestJobFirst { table, jobs }
    }

    fn ordered_jobs(&self) -> Vec<&'a Job> {
        let mut sorted: Vec<&Job> = self.jobs.iter().collect();
        sorted.sort_by(|a, b| {
            let ta = self
                .table
                .min_transfer_time_for(a.id)
                .unwrap_or(f64::INFINITY);
            let tb = self
                .table
                .min_transfer_time_for(b.id)
                .unwrap_or(f64::INFINITY);
            ta.partial_cmp(&tb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.deadline_hour.cmp(&b.deadline_hour))
                .then_with(|| a.id.cmp(&b.id))
        });
        sorted
    }

    /// Routes ranked fastest-first for this job.
    fn ordered_routes(&self, job_id: u64) -> Vec<(String, f64)> {
        let mut routes: Vec<(String, f64)> = self
            .table
            .routes_for_job(job_id)
            .into_iter()
            .filter_map(|route_key| {
                self.table
                    .transfer_time_for(job_id, route_key)
                    .map(|t| (route_key.to_string(), t))
            })
            .collect();
        routes.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        routes
    }
}

/// First-fit placement into consecutive slots with equal per-slot shares;
/// shared by SJF and EDF, which differ only in iteration order.
pub(super) fn place_in_consecutive_slots(
    capacity: &mut CapacityModel,
    table: &AssociationTable,
    job: &Job,
    route_key: &str,
    transfer_time: f64,
) -> Option<Vec<(usize, f64)>> {
    if transfer_time <= 0.0 {
        return None;
    }
    let slots_needed = ((transfer_time / SLOT_SECONDS).ceil() as usize).max(1);
    let share = transfer_time / slots_needed as f64;
    let rows = table.rows_for_job_route(job.id, route_key);

    let window = find_consecutive_slots(
        capacity,
        table,
        rows,
        slots_needed,
        job.deadline_hour,
        share,
    )?;

    let mut taken = Vec::with_capacity(window.len());
    for &row_idx in &window {
        if capacity
            .reserve(table.route_key(row_idx), table.forecast_id(row_idx), share)
            .is_err()
        {
            for &(reserved, seconds) in &taken {
                capacity.release(
                    table.route_key(reserved),
                    table.forecast_id(reserved),
                    seconds,
                );
            }
            return None;
        }
        taken.push((row_idx, share));
    }
    Some(taken)
}

impl Planner for ShortestJobFirst<'_> {
    fn kind(&self) -> PlannerKind {
        PlannerKind::ShortestJobFirst
    }

    fn plan(&mut self) -> Schedule {
        let mut capacity = CapacityModel::for_table(self.table);
        let mut entries = Vec::new();
        let mut unscheduled = Vec::new();

        for job in self.ordered_jobs() {
            let mut placed = false;
            for (route_key, transfer_time) in self.ordered_routes(job.id) {
                if let Some(taken) = place_in_consecutive_slots(
                    &mut capacity,
                    self.table,
                    job,
                    &route_key,
                    transfer_time,
                ) {
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
