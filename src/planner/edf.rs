use crate::associations::AssociationTable;
use crate::capacity::CapacityModel;
use crate::jobs::Job;
use crate::planner::sjf::place_in_consecutive_slots;
use crate::planner::{
    entry_for, jobs_by_deadline, mark_unscheduled, Planner, PlannerKind, Schedule,
};

/// Earliest-deadline-first: same consecutive-slot first-fit as SJF, but jobs
/// go strictly by deadline and routes are tried in associations-table order.
pub struct EarliestDeadlineFirst<'a> {
    table: &'a AssociationTable,
    jobs: &'a [Job],
}

impl<'a> EarliestDeadlineFirst<'a> {
    pub fn new(table: &'a AssociationTable, jobs: &'a [Job]) -> Self {
        EarliestDeadlineFirst { table, jobs }
    }
}

impl Planner for EarliestDeadlineFirst<'_> {
    fn kind(&self) -> PlannerKind {
        PlannerKind::EarliestDeadlineFirst
    }

    fn plan(&mut self) -> Schedule {
        let mut capacity = CapacityModel::for_table(self.table);
        let mut entries = Vec::new();
        let mut unscheduled = Vec::new();

        for job in jobs_by_deadline(self.jobs, |_| 0u8) {
            let mut placed = false;
            for route_key in self.table.routes_for_job(job.id) {
                let transfer_time = match self.table.transfer_time_for(job.id, route_key) {
                    Some(t) => t,
                    None => continue,
                };
                if let Some(taken) = place_in_consecutive_slots(
                    &mut capacity,
                    self.table,
                    job,
                    route_key,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::associations::tests::row;

    fn job(id: u64, deadline: u32) -> Job {
        Job {
            id,
            size_bytes: 1_000_000,
            files_count: 1,
            deadline_hour: deadline,
            type_tag: None,
        }
    }

    #[test]
    fn tight_deadlines_place_first() {
        let table = AssociationTable::from_rows(vec![
            row("a_z", 1, 0, 3600.0, 1.0),
            row("a_z", 1, 1, 3600.0, 1.0),
            row("a_z", 2, 0, 3600.0, 1.0),
            row("a_z", 2, 1, 3600.0, 1.0),
        ]);
        // job 2 has the earlier deadline and must claim hour 0
        let jobs = vec![job(1, 1), job(2, 0)];
        let schedule = EarliestDeadlineFirst::new(&table, &jobs).plan();

        assert!(schedule.unscheduled_job_ids.is_empty());
        assert_eq!(schedule.entries[0].job_id, 2);
        assert_eq!(schedule.entries[0].forecast_id, 0);
        assert_eq!(schedule.entries[1].job_id, 1);
        assert_eq!(schedule.entries[1].forecast_id, 1);
    }

    #[test]
    fn routes_tried_in_table_order() {
        // both routes fit; EDF takes the lexicographically first route
        let table = AssociationTable::from_rows(vec![
            row("b_z", 1, 0, 1000.0, 1.0),
            row("a_z", 1, 0, 9999.0, 1.0),
            row("a_z", 1, 1, 9999.0, 1.0),
            row("a_z", 1, 2, 9999.0, 1.0),
        ]);
        let jobs = vec![job(1, 2)];
        let schedule = EarliestDeadlineFirst::new(&table, &jobs).plan();
        assert!(schedule.entries.iter().all(|e| e.route_key == "a_z"));
    }

    #[test]
    fn deadline_zero_with_long_transfer_is_unscheduled() {
        let table = AssociationTable::from_rows(vec![
            row("a_z", 1, 0, 4000.0, 1.0),
            row("a_z", 1, 1, 4000.0, 1.0),
            row("a_z", 1, 2, 4000.0, 1.0),
        ]);
        let jobs = vec![job(1, 0)];
        let schedule = EarliestDeadlineFirst::new(&table, &jobs).plan();
        assert_eq!(schedule.unscheduled_job_ids, vec![1]);
        assert!(schedule.entries.is_empty());
    }
}
