use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Error};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::jobs::Job;
use crate::planner::Schedule;

/// A job counts as complete once at least this share of its bytes moved.
const COMPLETION_THRESHOLD: f64 = 0.99;

/// Flat per-plan summary; one row of `algorithm_comparison.csv`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PlanSummary {
    pub planner: String,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub partial_jobs: usize,
    pub unscheduled_jobs: usize,
    pub deadline_met_jobs: usize,
    pub total_emissions_g: f64,
    pub avg_emissions_per_job_g: f64,
    pub total_allocated_seconds: f64,
    pub avg_throughput_bps: f64,
    pub median_throughput_bps: u64,
    pub p90_throughput_bps: u64,
    pub total_transferred_bytes: f64,
    pub emissions_per_byte_g: f64,
    pub runtime_seconds: f64,
}

/// Seconds and grams a plan put on each route.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteUtilization {
    pub allocated_seconds: f64,
    pub carbon_emissions_g: f64,
}

/// Computes summary statistics over planner outputs. Deterministic for
/// identical schedules.
pub struct ScheduleEvaluator<'a> {
    jobs: &'a [Job],
}

impl<'a> ScheduleEvaluator<'a> {
    pub fn new(jobs: &'a [Job]) -> Self {
        ScheduleEvaluator { jobs }
    }

    pub fn evaluate(&self, schedule: &Schedule, runtime_seconds: f64) -> PlanSummary {
        let mut throughput_hist = Histogram::<u64>::new(3).unwrap();

        let mut completed = 0usize;
        let mut partial = 0usize;
        let mut deadline_met = 0usize;
        let mut total_bytes = 0.0f64;

        for job in self.jobs {
            let entries: Vec<_> = schedule
                .entries
                .iter()
                .filter(|e| e.job_id == job.id)
                .collect();
            if entries.is_empty() {
                continue;
            }
            let bytes: f64 = entries
                .iter()
                .map(|e| e.throughput_bps * e.allocated_seconds / 8.0)
                .sum();
            total_bytes += bytes;
            let complete = bytes >= COMPLETION_THRESHOLD * job.size_bytes as f64;
            if complete {
                completed += 1;
                if entries.iter().all(|e| e.forecast_id <= job.deadline_hour) {
                    deadline_met += 1;
                }
            } else {
                partial += 1;
            }
        }

        for entry in &schedule.entries {
            let _ = throughput_hist.record(entry.throughput_bps.max(0.0) as u64);
        }

        let total_emissions: f64 = schedule.total_emissions_g();
        let total_allocated: f64 = schedule.entries.iter().map(|e| e.allocated_seconds).sum();
        let weighted_throughput: f64 = schedule
            .entries
            .iter()
            .map(|e| e.throughput_bps * e.allocated_seconds)
            .sum();

        PlanSummary {
            planner: schedule.planner.to_string(),
            total_jobs: self.jobs.len(),
            completed_jobs: completed,
            partial_jobs: partial,
            unscheduled_jobs: schedule.unscheduled_job_ids.len(),
            deadline_met_jobs: deadline_met,
            total_emissions_g: total_emissions,
            avg_emissions_per_job_g: if completed + partial > 0 {
                total_emissions / (completed + partial) as f64
            } else {
                0.0
            },
            total_allocated_seconds: total_allocated,
            avg_throughput_bps: if total_allocated > 0.0 {
                weighted_throughput / total_allocated
            } else {
                0.0
            },
            median_throughput_bps: throughput_hist.value_at_quantile(0.5),
            p90_throughput_bps: throughput_hist.value_at_quantile(0.9),
            total_transferred_bytes: total_bytes,
            emissions_per_byte_g: if total_bytes > 0.0 {
                total_emissions / total_bytes
            } else {
                0.0
            },
            runtime_seconds,
        }
    }

    pub fn route_utilization(&self, schedule: &Schedule) -> BTreeMap<String, RouteUtilization> {
        let mut utilization: BTreeMap<String, RouteUtilization> = BTreeMap::new();
        for entry in &schedule.entries {
            let slot = utilization
                .entry(entry.route_key.clone())
                .or_insert(RouteUtilization {
                    allocated_seconds: 0.0,
                    carbon_emissions_g: 0.0,
                });
            slot.allocated_seconds += entry.allocated_seconds;
            slot.carbon_emissions_g += entry.carbon_emissions_g;
        }
        utilization
    }
}

/// Winners across one comparison run; ties go to the earlier summary.
#[derive(Clone, Debug, PartialEq)]
pub struct ComparisonReport {
    pub best_completion: String,
    pub lowest_emissions: String,
    pub best_throughput: String,
    pub best_deadline_compliance: String,
}

pub fn compare(summaries: &[PlanSummary]) -> Option<ComparisonReport> {
    if summaries.is_empty() {
        return None;
    }
    let pick = |better: &dyn Fn(&PlanSummary, &PlanSummary) -> bool| -> String {
        let mut best = &summaries[0];
        for candidate in &summaries[1..] {
            if better(candidate, best) {
                best = candidate;
            }
        }
        best.planner.clone()
    };
    Some(ComparisonReport {
        best_completion: pick(&|a, b| a.completed_jobs > b.completed_jobs),
        lowest_emissions: pick(&|a, b| a.total_emissions_g < b.total_emissions_g),
        best_throughput: pick(&|a, b| a.avg_throughput_bps > b.avg_throughput_bps),
        best_deadline_compliance: pick(&|a, b| a.deadline_met_jobs > b.deadline_met_jobs),
    })
}

pub fn write_comparison_csv(path: &Path, summaries: &[PlanSummary]) -> Result<(), Error> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for summary in summaries {
        writer.serialize(summary)?;
    }
    writer.flush()?;
    Ok(())
}
