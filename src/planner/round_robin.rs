use crate::associations::AssociationTable;
use crate::capacity::CapacityModel;
use crate::jobs::Job;
use crate::planner::{
    eligible_rows, entry_for, jobs_by_deadline, mark_unscheduled, try_place_on_route, Planner,
    PlannerKind, Schedule,
};

/// Spreads jobs over routes with a rotating cursor. The cursor advances
/// exactly once per job, successful or not, so consecutive jobs start on
/// consecutive routes.
pub struct RoundRobin<'a> {
    table: &'a AssociationTable,
    jobs: &'a [Job],
}

impl<'a> RoundRobin<'a> {
    pub fn new(table: &'a AssociationTable, jobs: &'a [Job]) -> Self {
        RoundRobin { table, jobs }
    }
}

impl Planner for RoundRobin<'_> {
    fn kind(&self) -> PlannerKind {
        PlannerKind::RoundRobin
    }

    fn plan(&mut self) -> Schedule {
        let routes = self.table.route_keys();
        if routes.is_empty() {
            return Schedule::empty(self.kind(), self.jobs);
        }

        let mut capacity = CapacityModel::for_table(self.table);
        let mut entries = Vec::new();
        let mut unscheduled = Vec::new();
        let mut cursor = 0usize;

        for job in jobs_by_deadline(self.jobs, |_| 0u8) {
            let mut placed = false;
            for offset in 0..routes.len() {
                let route_key = &routes[(cursor + offset) % routes.len()];
                let walk = eligible_rows(self.table, job.id, route_key, job.deadline_hour);
                if walk.is_empty() {
                    continue;
                }
                let required = match self.table.transfer_time_for(job.id, route_key) {
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
            cursor = (cursor + 1) % routes.len();
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

    fn three_route_table() -> AssociationTable {
        let mut rows = Vec::new();
        for route in &["r1_z", "r2_z", "r3_z"] {
            for job_id in 1..=3 {
                rows.push(row(route, job_id, 0, 1000.0, 1.0));
            }
        }
        AssociationTable::from_rows(rows)
    }

    #[test]
    fn cursor_rotates_across_jobs() {
        let table = three_route_table();
        let jobs = vec![job(1, 0), job(2, 0), job(3, 0)];
        let schedule = RoundRobin::new(&table, &jobs).plan();

        let placements: Vec<(u64, &str)> = schedule
            .entries
            .iter()
            .map(|e| (e.job_id, e.route_key.as_str()))
            .collect();
        assert_eq!(
            placements,
            vec![(1, "r1_z"), (2, "r2_z"), (3, "r3_z")]
        );
    }

    #[test]
    fn full_route_falls_through_to_next() {
        // one route with a single 3600s slot, another with two slots
        let table = AssociationTable::from_rows(vec![
            row("r1_z", 1, 0, 3600.0, 1.0),
            row("r1_z", 2, 0, 3600.0, 1.0),
            row("r2_z", 1, 0, 3600.0, 1.0),
            row("r2_z", 1, 1, 3600.0, 1.0),
            row("r2_z", 2, 0, 3600.0, 1.0),
            row("r2_z", 2, 1, 3600.0, 1.0),
        ]);
        let jobs = vec![job(1, 1), job(2, 1)];
        let schedule = RoundRobin::new(&table, &jobs).plan();

        // job 1 fills r1 hour 0; job 2 starts at r2
        assert!(schedule.unscheduled_job_ids.is_empty());
        let job2_routes: Vec<&str> = schedule
            .entries
            .iter()
            .filter(|e| e.job_id == 2)
            .map(|e| e.route_key.as_str())
            .collect();
        assert!(job2_routes.iter().all(|r| *r == "r2_z"));
    }

    #[test]
    fn impossible_deadline_is_unscheduled() {
        let table = AssociationTable::from_rows(vec![
            row("r1_z", 1, 0, 4000.0, 1.0),
            row("r1_z", 1, 1, 4000.0, 1.0),
        ]);
        // 4000s cannot fit in the single hour before the deadline
        let jobs = vec![job(1, 0)];
        let schedule = RoundRobin::new(&table, &jobs).plan();
        assert_eq!(schedule.unscheduled_job_ids, vec![1]);
        assert!(schedule.entries.is_empty());
    }
}
