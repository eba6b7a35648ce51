use std::fs::File;
use std::io::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Error};
use structopt::StructOpt;

use carbon_transfer_scheduler::builder::AssociationBuilder;
use carbon_transfer_scheduler::evaluator::{compare, write_comparison_csv, ScheduleEvaluator};
use carbon_transfer_scheduler::jobs::load_jobs;
use carbon_transfer_scheduler::planner::{planner_for, PlannerKind};
use carbon_transfer_scheduler::traceroute::load_routes;
use carbon_transfer_scheduler::{
    AssociationTable, Config, ExternalSimulator, ForecastStore, NodeMap, Validate, ZoneResolver,
};

#[derive(Debug, StructOpt)]
struct Opt {
    /// Command
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Generate a default configuration file.
    GenerateConfig {
        /// Output path for default config file
        #[structopt(short, long, parse(from_os_str))]
        output: PathBuf,
    },
    /// Build the forecast window and the associations table.
    Gen {
        /// Config file path
        #[structopt(short, long, parse(from_os_str))]
        config: PathBuf,
    },
    /// Run one planner, or all of them, against the associations table.
    Schedule {
        /// Planner selector: green, worst, rr, sjf, edf, milp_norm,
        /// milp_binary, or all
        #[structopt(default_value = "green")]
        planner: String,
        /// Config file path
        #[structopt(short, long, parse(from_os_str))]
        config: PathBuf,
    },
}

fn load_config(path: PathBuf) -> Result<Config, Error> {
    let mut buf = String::new();
    File::open(&path)
        .with_context(|| format!("failed to open config {}", path.display()))?
        .read_to_string(&mut buf)?;
    let config: Config = toml::from_str(&buf)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config.validate()
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let opt = Opt::from_args();
    match opt.cmd {
        Command::GenerateConfig { output } => {
            let config_toml = toml::to_string_pretty(&Config::default())?;
            File::create(&output)
                .with_context(|| format!("failed to create {}", output.display()))?
                .write_all(config_toml.as_bytes())?;
            Ok(())
        }
        Command::Gen { config } => gen(load_config(config)?).await,
        Command::Schedule { planner, config } => schedule(planner, load_config(config)?),
    }
}

async fn gen(config: Config) -> Result<(), Error> {
    let nodes = NodeMap::load(&config.paths.nodes)?;
    let jobs = load_jobs(&config.paths.jobs)?;
    let routes = load_routes(&config.paths.traceroutes, nodes.destination())?;

    let resolver = ZoneResolver::from_geojson(&config.paths.world_geojson)?;
    let forecast = ForecastStore::from_csv(
        &config.paths.historical_ci,
        config.forecast.start,
        config.forecast.length_hours,
    )?;
    forecast.write_window_csv(&config.paths.forecast_window_csv)?;

    std::fs::create_dir_all(&config.paths.energy_data_dir)?;
    std::fs::create_dir_all(&config.paths.platform_dir)?;
    let simulator = Arc::new(ExternalSimulator::new(
        nodes.clone(),
        config.simulation.clone(),
        config.paths.energy_data_dir.clone(),
        config.paths.platform_dir.clone(),
    ));

    let builder = AssociationBuilder::new(&nodes, &jobs, &routes, &forecast, &resolver);
    let simulations = builder
        .run_simulations(simulator, config.simulation.workers)
        .await;
    let table = builder.build(&simulations);
    if table.is_empty() {
        return Err(anyhow!("no associations could be built; nothing to plan against"));
    }
    table.write_csv(&config.paths.associations_csv)?;
    Ok(())
}

fn schedule(selector: String, config: Config) -> Result<(), Error> {
    let jobs = load_jobs(&config.paths.jobs)?;
    let table = AssociationTable::read_csv(&config.paths.associations_csv)?;
    std::fs::create_dir_all(&config.paths.schedules_dir)?;

    let kinds: Vec<PlannerKind> = if selector == "all" {
        PlannerKind::ALL.to_vec()
    } else {
        vec![selector.parse()?]
    };

    let evaluator = ScheduleEvaluator::new(&jobs);
    let mut summaries = Vec::new();
    for kind in kinds {
        let started = Instant::now();
        let plan = planner_for(kind, &table, &jobs, &config.milp).plan();
        let runtime = started.elapsed().as_secs_f64();
        tracing::info!(
            planner = %kind,
            entries = plan.entries.len(),
            unscheduled = plan.unscheduled_job_ids.len(),
            runtime,
            "planner finished"
        );

        let csv_path = config.paths.schedules_dir.join(format!("{}.csv", kind));
        plan.write_csv(&csv_path)?;

        for (route_key, utilization) in evaluator.route_utilization(&plan) {
            tracing::info!(
                planner = %kind,
                %route_key,
                allocated_seconds = utilization.allocated_seconds,
                carbon_emissions_g = utilization.carbon_emissions_g,
                "route utilization"
            );
        }
        summaries.push(evaluator.evaluate(&plan, runtime));
    }

    let comparison_path = config.paths.schedules_dir.join("algorithm_comparison.csv");
    write_comparison_csv(&comparison_path, &summaries)?;
    if let Some(report) = compare(&summaries) {
        tracing::info!(
            best_completion = %report.best_completion,
            lowest_emissions = %report.lowest_emissions,
            best_throughput = %report.best_throughput,
            best_deadline_compliance = %report.best_deadline_compliance,
            "algorithm comparison"
        );
    }
    Ok(())
}
