use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rayon::prelude::*;
use tokio::sync::{mpsc, Semaphore};

use crate::associations::{AssociationRow, AssociationTable};
use crate::forecast::ForecastStore;
use crate::jobs::Job;
use crate::nodes::NodeMap;
use crate::simulator::{link_name, router_name, SimOutput, SimulatorBackend};
use crate::traceroute::Route;
use crate::zones::ZoneResolver;

const JOULES_PER_KWH: f64 = 3.6e6;
const SECONDS_PER_HOUR: f64 = 3600.0;

/// A (route, job) simulation that produced no usable output. Kept so an
/// absent associations row always traces back to a recorded failure.
#[derive(Clone, Debug)]
pub struct FailedSimulation {
    pub route_key: String,
    pub job_id: u64,
    pub reason: String,
}

#[derive(Default)]
pub struct SimulationResults {
    pub outputs: HashMap<(String, u64), SimOutput>,
    pub failures: Vec<FailedSimulation>,
}

impl SimulationResults {
    pub fn from_outputs(outputs: Vec<SimOutput>) -> Self {
        let mut results = SimulationResults::default();
        for output in outputs {
            results
                .outputs
                .insert((output.route_key.clone(), output.job_id), output);
        }
        results
    }
}

/// Builds the associations table: per-(route, job) energy simulations fanned
/// out over a bounded worker pool, then per-hop emissions across the forecast
/// horizon fanned out over rayon.
pub struct AssociationBuilder<'a> {
    nodes: &'a NodeMap,
    jobs: &'a [Job],
    routes: &'a BTreeMap<String, Route>,
    forecast: &'a ForecastStore,
    resolver: &'a ZoneResolver,
}

impl<'a> AssociationBuilder<'a> {
    pub fn new(
        nodes: &'a NodeMap,
        jobs: &'a [Job],
        routes: &'a BTreeMap<String, Route>,
        forecast: &'a ForecastStore,
        resolver: &'a ZoneResolver,
    ) -> Self {
        AssociationBuilder {
            nodes,
            jobs,
            routes,
            forecast,
            resolver,
        }
    }

    /// Routes whose first hop is a source-type node and whose last hop is
    /// the destination node; anything else never reaches the table.
    pub fn eligible_routes(&self) -> Vec<&'a Route> {
        self.routes
            .values()
            .filter(|route| {
                let ok = self.nodes.is_source(&route.source)
                    && self.nodes.is_destination(&route.destination);
                if !ok {
                    tracing::debug!(route_key = %route.key(), "skipping ineligible route");
                }
                ok
            })
            .collect()
    }

    /// Runs one simulation per eligible (route, job) on a pool of
    /// `workers` blocking tasks. Completed results are retained even if the
    /// caller drops the future mid-flight; failures are recorded, not fatal.
    pub async fn run_simulations(
        &self,
        backend: Arc<dyn SimulatorBackend>,
        workers: usize,
    ) -> SimulationResults {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut spawned = 0usize;
        for route in self.eligible_routes() {
            for job in self.jobs {
                let route = route.clone();
                let job = job.clone();
                let backend = backend.clone();
                let semaphore = semaphore.clone();
                let tx = tx.clone();
                spawned += 1;
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let key = (route.key(), job.id);
                    let result =
                        tokio::task::spawn_blocking(move || backend.run(&route, &job)).await;
                    let _ = tx.send((key, result));
                });
            }
        }
        drop(tx);

        let mut results = SimulationResults::default();
        while let Some(((route_key, job_id), outcome)) = rx.recv().await {
            match outcome {
                Ok(Ok(output)) => {
                    results.outputs.insert((route_key, job_id), output);
                }
                Ok(Err(e)) => {
                    tracing::warn!(%route_key, job_id, error = %e, "simulation failed");
                    results.failures.push(FailedSimulation {
                        route_key,
                        job_id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(%route_key, job_id, error = %e, "simulation worker panicked");
                    results.failures.push(FailedSimulation {
                        route_key,
                        job_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            spawned,
            completed = results.outputs.len(),
            failed = results.failures.len(),
            "simulation fan-out finished"
        );
        results
    }

    /// Computes every AssociationRow from the simulation results. Row
    /// multiplicity comes straight from the parallel collect; ordering is
    /// restored by the table constructor.
    pub fn build(&self, sims: &SimulationResults) -> AssociationTable {
        let horizon = self.forecast.horizon();
        let mut combos: Vec<(&Route, Vec<Option<String>>, &Job, &SimOutput)> = Vec::new();
        for route in self.eligible_routes() {
            let zones = self.hop_zones(route);
            for job in self.jobs {
                match sims.outputs.get(&(route.key(), job.id)) {
                    Some(output) => combos.push((route, zones.clone(), job, output)),
                    None => {
                        tracing::debug!(
                            route_key = %route.key(),
                            job_id = job.id,
                            "no simulation output, omitting rows"
                        );
                    }
                }
            }
        }

        let rows: Vec<AssociationRow> = combos
            .par_iter()
            .flat_map_iter(|(route, zones, job, output)| {
                self.rows_for_combo(route, zones, job, output, horizon)
            })
            .collect();

        tracing::info!(rows = rows.len(), "computed association rows");
        AssociationTable::from_rows(rows)
    }

    /// Per-hop zone ids under the coordinate fallback. Unresolved hops and
    /// hops outside every zone polygon contribute zero CI.
    fn hop_zones(&self, route: &Route) -> Vec<Option<String>> {
        route
            .effective_coordinates()
            .iter()
            .enumerate()
            .map(|(i, coords)| match coords {
                Some((lon, lat)) => {
                    let zone = self.resolver.resolve(*lon, *lat);
                    if zone.is_none() {
                        tracing::warn!(
                            route_key = %route.key(),
                            hop = i,
                            lon,
                            lat,
                            "hop is outside every zone polygon"
                        );
                    }
                    zone.map(String::from)
                }
                None => {
                    tracing::warn!(route_key = %route.key(), hop = i, "hop has no usable coordinates");
                    None
                }
            })
            .collect()
    }

    fn rows_for_combo(
        &self,
        route: &Route,
        zones: &[Option<String>],
        job: &Job,
        output: &SimOutput,
        horizon: u32,
    ) -> Vec<AssociationRow> {
        let transfer_time = output.transfer_duration_seconds;
        if transfer_time <= 0.0 {
            tracing::warn!(
                route_key = %output.route_key,
                job_id = job.id,
                "simulator reported non-positive duration, omitting rows"
            );
            return Vec::new();
        }
        let throughput = (job.size_bytes * 8) as f64 / transfer_time;

        (0..horizon)
            .map(|forecast_id| AssociationRow {
                source_node: route.source.clone(),
                destination_node: route.destination.clone(),
                route_key: output.route_key.clone(),
                job_id: job.id,
                forecast_id,
                transfer_time_s: transfer_time,
                throughput_bps: throughput,
                host_joules: output.total_host_joules,
                link_joules: output.total_link_joules,
                total_joules: output.total_joules(),
                carbon_emissions_g: self.emissions_for(route, zones, output, forecast_id),
            })
            .collect()
    }

    /// Grams of CO2 for a transfer starting at `forecast_id`: each hop's
    /// energy is spread over the hours the transfer spans and weighted by
    /// that hop's hourly carbon intensity.
    fn emissions_for(
        &self,
        route: &Route,
        zones: &[Option<String>],
        output: &SimOutput,
        forecast_id: u32,
    ) -> f64 {
        let horizon = self.forecast.horizon();
        let route_key = &output.route_key;
        let hours = output.transfer_duration_seconds / SECONDS_PER_HOUR;
        let spanned = (hours.ceil() as u32).min(horizon).max(1);
        let last = route.hops.len() - 1;

        let mut total_g = 0.0;
        for (i, zone) in zones.iter().enumerate() {
            let zone = match zone {
                Some(zone) => zone,
                None => continue,
            };
            let host = if i == 0 {
                route.source.clone()
            } else if i == last {
                route.destination.clone()
            } else {
                router_name(route_key, i)
            };
            let host_joules = output.host_energy.get(&host).copied().unwrap_or(0.0);
            let link_joules = if i == 0 {
                0.0
            } else {
                output
                    .link_energy
                    .get(&link_name(route_key, i))
                    .copied()
                    .unwrap_or(0.0)
            };
            let hourly_joules = (host_joules + link_joules) / hours;

            for k in 0..spanned {
                let hour = (forecast_id + k) % horizon;
                let ci = match self.forecast.get(zone, hour) {
                    Ok(ci) => ci,
                    Err(e) => {
                        tracing::warn!(error = %e, "degrading missing forecast to zero CI");
                        continue;
                    }
                };
                let fraction = if k + 1 == spanned {
                    hours - (spanned - 1) as f64
                } else {
                    1.0
                };
                total_g += hourly_joules * fraction / JOULES_PER_KWH * ci;
            }
        }
        total_g
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{Node, NodeType, PowerRange};
    use crate::simulator::StubSimulator;
    use crate::traceroute::Hop;
    use chrono::{TimeZone, Utc};
    use geo::polygon;

    fn node(name: &str, kind: NodeType) -> Node {
        Node {
            name: name.to_string(),
            kind,
            cpu_cores: 8,
            total_ram: 64.0,
            nic_speed: "1Gbps".parse().unwrap(),
            gf: 100.0,
            power: PowerRange {
                min: 100.0,
                max: 300.0,
            },
        }
    }

    fn hop(ip: &str, ttl: u32, lon: f64, lat: f64) -> Hop {
        Hop {
            ip: ip.to_string(),
            ttl,
            rtt_ms: 1.0,
            lat: Some(lat),
            lon: Some(lon),
        }
    }

    fn fixture() -> (
        NodeMap,
        Vec<Job>,
        BTreeMap<String, Route>,
        ZoneResolver,
    ) {
        let nodes = NodeMap::from_nodes(vec![
            node("A", NodeType::Source),
            node("B", NodeType::Destination),
        ])
        .unwrap();
        let jobs = vec![Job {
            id: 1,
            size_bytes: 1_000_000_000,
            files_count: 1,
            deadline_hour: 0,
            type_tag: None,
        }];
        let route = Route {
            source: "A".into(),
            destination: "B".into(),
            hops: vec![hop("10.0.0.1", 1, 0.5, 0.5), hop("10.0.0.2", 2, 0.5, 0.5)],
        };
        let mut routes = BTreeMap::new();
        routes.insert(route.key(), route);
        let resolver = ZoneResolver::from_polygons(vec![(
            "Z".to_string(),
            polygon![
                (x: 0.0, y: 0.0),
                (x: 1.0, y: 0.0),
                (x: 1.0, y: 1.0),
                (x: 0.0, y: 1.0),
                (x: 0.0, y: 0.0),
            ],
        )]);
        (nodes, jobs, routes, resolver)
    }

    fn store(cis: &[f64]) -> ForecastStore {
        let mut series = BTreeMap::new();
        series.insert("Z".to_string(), cis.to_vec());
        ForecastStore::from_series(
            Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap(),
            cis.len() as u32,
            series,
        )
    }

    #[test]
    fn single_slot_emissions_match_energy_times_ci() {
        let (nodes, jobs, routes, resolver) = fixture();
        let forecast = store(&[100.0]);
        let builder = AssociationBuilder::new(&nodes, &jobs, &routes, &forecast, &resolver);

        // 3.6e6 J over 1000s at ci=100 -> exactly 1 kWh -> 100 g
        let route = &routes["A_B"];
        let stub = StubSimulator::with_uniform_energy(&[route], &jobs, 1000.0, 3.6e6);
        let sims = SimulationResults::from_outputs(vec![stub
            .run(route, &jobs[0])
            .unwrap()]);

        let table = builder.build(&sims);
        assert_eq!(table.len(), 1);
        assert!((table.carbon_emissions_g(0) - 100.0).abs() < 1e-9);
        assert!((table.throughput_bps(0) - 8e6).abs() < 1e-6);
        assert_eq!(table.transfer_time_s(0), 1000.0);
    }

    #[test]
    fn emissions_scale_with_hourly_ci() {
        let (nodes, jobs, routes, resolver) = fixture();
        let forecast = store(&[200.0, 50.0]);
        let builder = AssociationBuilder::new(&nodes, &jobs, &routes, &forecast, &resolver);

        let route = &routes["A_B"];
        let stub = StubSimulator::with_uniform_energy(&[route], &jobs, 1800.0, 3.6e6);
        let sims = SimulationResults::from_outputs(vec![stub
            .run(route, &jobs[0])
            .unwrap()]);

        let table = builder.build(&sims);
        assert_eq!(table.len(), 2);
        // transfer fits inside one hour, so each start hour uses only its
        // own CI and the ratio of the rows is the ratio of the CIs
        let row0 = table.carbon_emissions_g(0);
        let row1 = table.carbon_emissions_g(1);
        assert!((row0 / row1 - 4.0).abs() < 1e-9);
        assert!((row0 - 200.0).abs() < 1e-9);
    }

    #[test]
    fn multi_hour_transfer_weights_partial_last_hour() {
        let (nodes, jobs, routes, resolver) = fixture();
        let forecast = store(&[100.0, 200.0, 400.0]);
        let builder = AssociationBuilder::new(&nodes, &jobs, &routes, &forecast, &resolver);

        // 1.5h transfer: hour 0 full, hour 1 half
        let route = &routes["A_B"];
        let stub = StubSimulator::with_uniform_energy(&[route], &jobs, 5400.0, 3.6e6);
        let sims = SimulationResults::from_outputs(vec![stub
            .run(route, &jobs[0])
            .unwrap()]);

        let table = builder.build(&sims);
        // starting at hour 0: E_h = 1/1.5 kWh; 1.0*100 + 0.5*200 weighted
        let expected = (1.0 / 1.5) * (1.0 * 100.0 + 0.5 * 200.0);
        assert!((table.carbon_emissions_g(0) - expected).abs() < 1e-9);
        // starting at hour 2 wraps to hour 0
        let expected_wrap = (1.0 / 1.5) * (1.0 * 400.0 + 0.5 * 100.0);
        assert!((table.carbon_emissions_g(2) - expected_wrap).abs() < 1e-9);
    }

    #[test]
    fn missing_sim_output_omits_rows() {
        let (nodes, jobs, routes, resolver) = fixture();
        let forecast = store(&[100.0]);
        let builder = AssociationBuilder::new(&nodes, &jobs, &routes, &forecast, &resolver);

        let table = builder.build(&SimulationResults::default());
        assert!(table.is_empty());
    }

    #[test]
    fn ineligible_routes_are_skipped() {
        let (nodes, jobs, mut routes, resolver) = fixture();
        // reversed route: destination-type node in source position
        routes.insert(
            "B_A".to_string(),
            Route {
                source: "B".into(),
                destination: "A".into(),
                hops: vec![hop("1.1.1.1", 1, 0.5, 0.5), hop("2.2.2.2", 2, 0.5, 0.5)],
            },
        );
        let forecast = store(&[100.0]);
        let builder = AssociationBuilder::new(&nodes, &jobs, &routes, &forecast, &resolver);
        let eligible: Vec<String> = builder
            .eligible_routes()
            .iter()
            .map(|r| r.key())
            .collect();
        assert_eq!(eligible, vec!["A_B".to_string()]);
    }

    #[tokio::test]
    async fn simulation_fanout_collects_outputs_and_failures() {
        let (nodes, _, routes, resolver) = fixture();
        let jobs = vec![
            Job {
                id: 1,
                size_bytes: 1_000_000,
                files_count: 1,
                deadline_hour: 0,
                type_tag: None,
            },
            Job {
                id: 2,
                size_bytes: 1_000_000,
                files_count: 1,
                deadline_hour: 0,
                type_tag: None,
            },
        ];
        let forecast = store(&[100.0]);
        let builder = AssociationBuilder::new(&nodes, &jobs, &routes, &forecast, &resolver);

        // stub only knows job 1; job 2 must surface as a recorded failure
        let route = &routes["A_B"];
        let stub = StubSimulator::with_uniform_energy(&[route], &jobs[..1], 10.0, 100.0);
        let results = builder.run_simulations(Arc::new(stub), 4).await;

        assert_eq!(results.outputs.len(), 1);
        assert_eq!(results.failures.len(), 1);
        assert_eq!(results.failures[0].job_id, 2);
    }
}
