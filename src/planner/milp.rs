use std::collections::HashMap;

use good_lp::solvers::coin_cbc::coin_cbc;
use good_lp::{constraint, variable, variables, Expression, Solution, SolverModel, Variable};

use crate::associations::AssociationTable;
use crate::capacity::SLOT_SECONDS;
use crate::config::Milp;
use crate::error::PlanError;
use crate::jobs::Job;
use crate::planner::{entry_for, Planner, PlannerKind, Schedule};

/// Weight of the carbon term against job completion in the binary
/// formulation; small enough that completing one more job always wins.
const BINARY_CARBON_WEIGHT: f64 = 1e-3;

/// Slack above which a job counts as not fully placed, in seconds.
const UNMET_TOLERANCE: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Formulation {
    /// Continuous allocations with per-job slack, penalized in the
    /// objective; partial placements survive into the schedule.
    Normalized,
    /// A completion indicator per job; incomplete jobs are dropped
    /// entirely.
    Binary,
}

struct VarRef {
    row_idx: usize,
    job_id: u64,
    var: Variable,
}

/// Mixed-integer planner minimizing total carbon subject to per-slot
/// capacity and per-job completion, solved with CBC under a caller-supplied
/// time budget.
pub struct MilpGreenPlanner<'a> {
    table: &'a AssociationTable,
    jobs: &'a [Job],
    formulation: Formulation,
    options: Milp,
}

impl<'a> MilpGreenPlanner<'a> {
    pub fn new(
        table: &'a AssociationTable,
        jobs: &'a [Job],
        formulation: Formulation,
        options: Milp,
    ) -> Self {
        MilpGreenPlanner {
            table,
            jobs,
            formulation,
            options,
        }
    }

    /// Seconds the solver must cover for a job: the slowest transfer time
    /// over the job's candidate routes, so any route mix is sufficient.
    fn required_seconds(&self, job_id: u64) -> Option<f64> {
        self.table
            .rows_for_job(job_id)
            .iter()
            .map(|&idx| self.table.transfer_time_s(idx))
            .fold(None, |best, t| match best {
                Some(b) if b >= t => Some(b),
                _ => Some(t),
            })
    }

    /// Per-variable seconds credited toward completion and counted against
    /// slot capacity in the normalized formulation.
    fn per_slot_seconds(&self, row_idx: usize) -> f64 {
        self.table.transfer_time_s(row_idx).min(SLOT_SECONDS)
    }

    fn default_penalty(&self) -> f64 {
        let horizon_seconds = self.table.forecast_ids().len() as f64 * SLOT_SECONDS;
        let max_carbon_per_second = (0..self.table.len())
            .map(|idx| self.table.carbon_emissions_g(idx) / self.per_slot_seconds(idx))
            .fold(0.0, f64::max);
        (max_carbon_per_second * horizon_seconds).max(1e6)
    }

    fn solve(&self) -> Result<Schedule, PlanError> {
        let deadlines: HashMap<u64, u32> =
            self.jobs.iter().map(|j| (j.id, j.deadline_hour)).collect();

        let mut problem = variables!();
        let mut var_refs: Vec<VarRef> = Vec::new();
        for job in self.jobs {
            for &row_idx in self.table.rows_for_job(job.id) {
                if self.table.forecast_id(row_idx) > job.deadline_hour {
                    continue;
                }
                var_refs.push(VarRef {
                    row_idx,
                    job_id: job.id,
                    var: problem.add(variable().min(0.0).max(1.0)),
                });
            }
        }
        if var_refs.is_empty() {
            return Err(PlanError::SolverInfeasible(
                "no eligible (job, slot, route) combinations".to_string(),
            ));
        }

        let solvable_jobs: Vec<&Job> = self
            .jobs
            .iter()
            .filter(|j| var_refs.iter().any(|v| v.job_id == j.id))
            .collect();

        let mut unmet_vars: HashMap<u64, Variable> = HashMap::new();
        let mut completion_vars: HashMap<u64, Variable> = HashMap::new();
        match self.formulation {
            Formulation::Normalized => {
                for job in &solvable_jobs {
                    unmet_vars.insert(job.id, problem.add(variable().min(0.0)));
                }
            }
            Formulation::Binary => {
                for job in &solvable_jobs {
                    completion_vars.insert(job.id, problem.add(variable().binary()));
                }
            }
        }

        let carbon_total: Expression = var_refs
            .iter()
            .map(|v| v.var * self.table.carbon_emissions_g(v.row_idx))
            .sum();

        let objective: Expression = match self.formulation {
            Formulation::Normalized => {
                let penalty = self.options.penalty.unwrap_or_else(|| self.default_penalty());
                let slack: Expression = unmet_vars.values().map(|&u| u * penalty).sum();
                carbon_total + slack
            }
            Formulation::Binary => {
                let max_carbon = (0..self.table.len())
                    .map(|idx| self.table.carbon_emissions_g(idx))
                    .fold(0.0, f64::max)
                    .max(1e-9);
                let completions: Expression =
                    completion_vars.values().map(|&y| y * 1.0).sum();
                carbon_total * (BINARY_CARBON_WEIGHT / max_carbon) - completions
            }
        };

        let mut model = problem.minimise(objective).using(coin_cbc);
        model.set_parameter("logLevel", "0");
        model.set_parameter("sec", &format!("{}", self.options.time_limit_secs));

        // per-job completion
        for job in &solvable_jobs {
            let required = match self.required_seconds(job.id) {
                Some(r) => r,
                None => continue,
            };
            let coverage: Expression = var_refs
                .iter()
                .filter(|v| v.job_id == job.id)
                .map(|v| {
                    let seconds = match self.formulation {
                        Formulation::Normalized => self.per_slot_seconds(v.row_idx),
                        Formulation::Binary => self.table.transfer_time_s(v.row_idx),
                    };
                    v.var * seconds
                })
                .sum();
            match self.formulation {
                Formulation::Normalized => {
                    let unmet = unmet_vars[&job.id];
                    model = model.with(constraint!(coverage + unmet >= required));
                }
                Formulation::Binary => {
                    let y = completion_vars[&job.id];
                    model = model.with(constraint!(coverage - y * required >= 0.0));
                    for v in var_refs.iter().filter(|v| v.job_id == job.id) {
                        model = model.with(constraint!(v.var - y <= 0.0));
                    }
                }
            }
        }

        // per (route, slot) capacity
        let mut slot_groups: HashMap<(String, u32), Vec<&VarRef>> = HashMap::new();
        for v in &var_refs {
            slot_groups
                .entry((
                    self.table.route_key(v.row_idx).to_string(),
                    self.table.forecast_id(v.row_idx),
                ))
                .or_default()
                .push(v);
        }
        for group in slot_groups.values() {
            let load: Expression = group
                .iter()
                .map(|v| {
                    let seconds = match self.formulation {
                        Formulation::Normalized => self.per_slot_seconds(v.row_idx),
                        Formulation::Binary => self.table.transfer_time_s(v.row_idx),
                    };
                    v.var * seconds
                })
                .sum();
            model = model.with(constraint!(load <= SLOT_SECONDS));
        }

        let solution = model
            .solve()
            .map_err(|e| PlanError::SolverInfeasible(e.to_string()))?;

        Ok(self.reconstruct(&solution, &var_refs, &unmet_vars, &completion_vars, &deadlines))
    }

    fn reconstruct(
        &self,
        solution: &impl Solution,
        var_refs: &[VarRef],
        unmet_vars: &HashMap<u64, Variable>,
        completion_vars: &HashMap<u64, Variable>,
        deadlines: &HashMap<u64, u32>,
    ) -> Schedule {
        let mut allocations: Vec<(usize, f64)> = Vec::new();
        for v in var_refs {
            if let Formulation::Binary = self.formulation {
                if solution.value(completion_vars[&v.job_id]) < 0.5 {
                    continue;
                }
            }
            let fraction = solution.value(v.var);
            if fraction <= self.options.epsilon {
                continue;
            }
            let seconds = match self.formulation {
                Formulation::Normalized => fraction * self.per_slot_seconds(v.row_idx),
                Formulation::Binary => fraction * self.table.transfer_time_s(v.row_idx),
            }
            .min(SLOT_SECONDS);
            if seconds <= 0.0 {
                continue;
            }
            allocations.push((v.row_idx, seconds));
        }
        allocations.sort_by(|a, b| {
            let ka = (
                self.table.forecast_id(a.0),
                self.table.job_id(a.0),
                self.table.route_key(a.0),
            );
            let kb = (
                self.table.forecast_id(b.0),
                self.table.job_id(b.0),
                self.table.route_key(b.0),
            );
            ka.cmp(&kb)
        });

        let entries: Vec<_> = allocations
            .iter()
            .map(|&(row_idx, seconds)| {
                let deadline = deadlines
                    .get(&self.table.job_id(row_idx))
                    .copied()
                    .unwrap_or(0);
                entry_for(self.table, row_idx, seconds, deadline)
            })
            .collect();

        let mut unscheduled: Vec<u64> = Vec::new();
        for job in self.jobs {
            let placed = entries.iter().any(|e| e.job_id == job.id);
            let incomplete = match self.formulation {
                Formulation::Normalized => unmet_vars
                    .get(&job.id)
                    .map(|&u| solution.value(u) > UNMET_TOLERANCE)
                    .unwrap_or(true),
                Formulation::Binary => completion_vars
                    .get(&job.id)
                    .map(|&y| solution.value(y) < 0.5)
                    .unwrap_or(true),
            };
            if !placed || incomplete {
                unscheduled.push(job.id);
            }
        }
        unscheduled.sort_unstable();
        unscheduled.dedup();

        Schedule {
            planner: self.kind(),
            entries,
            unscheduled_job_ids: unscheduled,
        }
    }
}

impl Planner for MilpGreenPlanner<'_> {
    fn kind(&self) -> PlannerKind {
        match self.formulation {
            Formulation::Normalized => PlannerKind::MilpNormalized,
            Formulation::Binary => PlannerKind::MilpBinary,
        }
    }

    /// Degrades to an empty schedule when the solver reports infeasible or
    /// unknown; a feasible incumbent under the time limit is reconstructed.
    fn plan(&mut self) -> Schedule {
        match self.solve() {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!(planner = %self.kind(), error = %e, "solver produced no plan");
                Schedule::empty(self.kind(), self.jobs)
            }
        }
    }
}
