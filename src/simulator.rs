use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::config::Simulation;
use crate::error::PlanError;
use crate::jobs::Job;
use crate::nodes::NodeMap;
use crate::traceroute::Route;

/// Energy result for one (route, job) pair, as reported by the network
/// simulator. Per-host and per-link joules use the platform naming
/// convention: endpoints by node name, hop i as `router_{route_key}_{i}`
/// with incoming link `link_{route_key}_{i}`.
#[derive(Clone, Debug)]
pub struct SimOutput {
    pub route_key: String,
    pub job_id: u64,
    pub transfer_duration_seconds: f64,
    pub host_energy: HashMap<String, f64>,
    pub link_energy: HashMap<String, f64>,
    pub total_host_joules: f64,
    pub total_link_joules: f64,
}

impl SimOutput {
    pub fn total_joules(&self) -> f64 {
        self.total_host_joules + self.total_link_joules
    }
}

pub fn router_name(route_key: &str, hop_index: usize) -> String {
    format!("router_{}_{}", route_key, hop_index)
}

pub fn link_name(route_key: &str, hop_index: usize) -> String {
    format!("link_{}_{}", route_key, hop_index)
}

/// Seam between the association builder and the external simulator, so tests
/// can substitute a deterministic stub.
pub trait SimulatorBackend: Send + Sync {
    fn run(&self, route: &Route, job: &Job) -> Result<SimOutput, PlanError>;
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostClass {
    Endpoint,
    Router,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkClass {
    Standard,
    Backbone,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HostSpec {
    pub name: String,
    pub class: HostClass,
    pub cores: u32,
    pub gflops: f64,
    /// low:mean:high draw in watts
    pub wattage_per_state: [f64; 3],
    pub wattage_off: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LinkSpec {
    pub name: String,
    pub class: LinkClass,
    pub src: String,
    pub dst: String,
    pub bandwidth_bps: u64,
    pub latency_ms: f64,
    pub wattage_range: [f64; 2],
    pub wattage_off: f64,
}

/// Platform description handed to the simulator: every hop of the route as a
/// host plus the links between consecutive hops.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PlatformSpec {
    pub route_key: String,
    pub source: String,
    pub destination: String,
    pub hosts: Vec<HostSpec>,
    pub links: Vec<LinkSpec>,
}

impl PlatformSpec {
    pub fn from_route(route: &Route, nodes: &NodeMap, sim: &Simulation) -> Result<Self, PlanError> {
        let route_key = route.key();
        let source = nodes.get(&route.source).ok_or_else(|| {
            PlanError::InputMalformed(format!("route {} has unknown source node", route_key))
        })?;
        let destination = nodes.get(&route.destination).ok_or_else(|| {
            PlanError::InputMalformed(format!("route {} has unknown destination node", route_key))
        })?;

        let last = route.hops.len() - 1;
        let mut hosts = Vec::with_capacity(route.hops.len());
        let mut links = Vec::with_capacity(last);
        for (i, hop) in route.hops.iter().enumerate() {
            let endpoint = if i == 0 {
                Some(source)
            } else if i == last {
                Some(destination)
            } else {
                None
            };
            match endpoint {
                Some(node) => hosts.push(HostSpec {
                    name: node.name.clone(),
                    class: HostClass::Endpoint,
                    cores: node.cpu_cores,
                    gflops: node.gf,
                    wattage_per_state: [node.power.min, node.power.mean(), node.power.max],
                    wattage_off: sim.router_power.off,
                }),
                None => hosts.push(HostSpec {
                    name: router_name(&route_key, i),
                    class: HostClass::Router,
                    cores: 4,
                    gflops: 50.0,
                    wattage_per_state: [
                        sim.router_power.low,
                        sim.router_power.mean,
                        sim.router_power.high,
                    ],
                    wattage_off: sim.router_power.off,
                }),
            }
            if i == 0 {
                continue;
            }
            // edge links run at the endpoint's NIC speed; everything in the
            // middle is backbone at the configured constant
            let (class, profile, bandwidth) = if i == 1 {
                (LinkClass::Standard, &sim.standard_link, source.nic_speed.bps)
            } else if i == last {
                (
                    LinkClass::Standard,
                    &sim.standard_link,
                    destination.nic_speed.bps,
                )
            } else {
                (
                    LinkClass::Backbone,
                    &sim.backbone_link,
                    sim.backbone_bandwidth_bps,
                )
            };
            links.push(LinkSpec {
                name: link_name(&route_key, i),
                class,
                src: hosts[i - 1].name.clone(),
                dst: hosts[i].name.clone(),
                bandwidth_bps: bandwidth,
                latency_ms: hop.rtt_ms,
                wattage_range: [profile.watts_min, profile.watts_max],
                wattage_off: profile.watts_off,
            });
        }

        Ok(PlatformSpec {
            route_key,
            source: route.source.clone(),
            destination: route.destination.clone(),
            hosts,
            links,
        })
    }
}

#[derive(Deserialize)]
struct EnergyFile {
    hosts: HashMap<String, f64>,
    links: HashMap<String, f64>,
    total_energy_hosts: f64,
    total_link_energy: f64,
    transfer_duration: f64,
    #[serde(rename = "job_size_bytes", default)]
    _job_size_bytes: Option<u64>,
}

pub fn energy_file_name(route_key: &str, job_id: u64) -> String {
    format!("energy_consumption_{}_{}_.json", route_key, job_id)
}

/// Adapter around the external simulator process. One invocation per
/// (route, job); results land as JSON files in `energy_data_dir` and act as
/// a disk cache, so reruns skip finished simulations.
pub struct ExternalSimulator {
    nodes: NodeMap,
    config: Simulation,
    energy_data_dir: PathBuf,
    platform_dir: PathBuf,
}

impl ExternalSimulator {
    pub fn new(
        nodes: NodeMap,
        config: Simulation,
        energy_data_dir: PathBuf,
        platform_dir: PathBuf,
    ) -> Self {
        ExternalSimulator {
            nodes,
            config,
            energy_data_dir,
            platform_dir,
        }
    }

    fn unavailable(route_key: &str, job_id: u64, reason: String) -> PlanError {
        PlanError::SimulatorUnavailable {
            route_key: route_key.to_string(),
            job_id,
            reason,
        }
    }

    fn write_platform(&self, route: &Route) -> Result<PathBuf, PlanError> {
        let spec = PlatformSpec::from_route(route, &self.nodes, &self.config)?;
        let path = self
            .platform_dir
            .join(format!("{}_platform.json", spec.route_key));
        let file = File::create(&path).map_err(|e| {
            PlanError::InputMalformed(format!("cannot create {}: {}", path.display(), e))
        })?;
        serde_json::to_writer_pretty(file, &spec).map_err(|e| {
            PlanError::InputMalformed(format!("cannot write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }
}

impl SimulatorBackend for ExternalSimulator {
    fn run(&self, route: &Route, job: &Job) -> Result<SimOutput, PlanError> {
        let route_key = route.key();
        let output_path = self
            .energy_data_dir
            .join(energy_file_name(&route_key, job.id));

        if !output_path.exists() {
            let platform = self.write_platform(route)?;
            let status = Command::new(&self.config.command)
                .arg(&platform)
                .arg(self.config.flows.to_string())
                .arg(job.size_bytes.to_string())
                .arg(job.id.to_string())
                .arg(&route.destination)
                .status()
                .map_err(|e| Self::unavailable(&route_key, job.id, e.to_string()))?;
            if !status.success() {
                return Err(Self::unavailable(
                    &route_key,
                    job.id,
                    format!("simulator exited with {}", status),
                ));
            }
        }

        parse_energy_file(&output_path, &route_key, job.id)
    }
}

/// Parses and validates one `energy_consumption_*.json` artifact. A schema
/// mismatch or an inconsistent per-host sum is a contract violation, not a
/// recoverable simulation failure.
pub fn parse_energy_file(
    path: &Path,
    route_key: &str,
    job_id: u64,
) -> Result<SimOutput, PlanError> {
    let file = File::open(path).map_err(|e| PlanError::SimulatorUnavailable {
        route_key: route_key.to_string(),
        job_id,
        reason: format!("missing output {}: {}", path.display(), e),
    })?;
    let parsed: EnergyFile = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        PlanError::InputMalformed(format!("bad energy schema in {}: {}", path.display(), e))
    })?;

    if parsed.transfer_duration <= 0.0 {
        return Err(PlanError::InputMalformed(format!(
            "{} reports non-positive transfer duration",
            path.display()
        )));
    }
    let host_sum: f64 = parsed.hosts.values().sum();
    let tolerance = parsed.total_energy_hosts.abs() * 1e-3 + 1.0;
    if (host_sum - parsed.total_energy_hosts).abs() > tolerance {
        return Err(PlanError::InputMalformed(format!(
            "{}: per-host joules sum to {} but total is {}",
            path.display(),
            host_sum,
            parsed.total_energy_hosts
        )));
    }

    Ok(SimOutput {
        route_key: route_key.to_string(),
        job_id,
        transfer_duration_seconds: parsed.transfer_duration,
        host_energy: parsed.hosts,
        link_energy: parsed.links,
        total_host_joules: parsed.total_energy_hosts,
        total_link_joules: parsed.total_link_energy,
    })
}

/// Deterministic in-memory backend for tests.
#[derive(Default)]
pub struct StubSimulator {
    outputs: HashMap<(String, u64), SimOutput>,
}

impl StubSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, output: SimOutput) {
        self.outputs
            .insert((output.route_key.clone(), output.job_id), output);
    }

    /// Convenience constructor spreading `total_joules` evenly over the
    /// route's hops (hosts only, no link energy).
    pub fn with_uniform_energy(
        routes: &[&Route],
        jobs: &[Job],
        transfer_duration_seconds: f64,
        total_joules: f64,
    ) -> Self {
        let mut stub = Self::new();
        for route in routes {
            let route_key = route.key();
            let last = route.hops.len() - 1;
            let per_hop = total_joules / route.hops.len() as f64;
            for job in jobs {
                let mut host_energy = HashMap::new();
                for i in 0..route.hops.len() {
                    let name = if i == 0 {
                        route.source.clone()
                    } else if i == last {
                        route.destination.clone()
                    } else {
                        router_name(&route_key, i)
                    };
                    host_energy.insert(name, per_hop);
                }
                stub.insert(SimOutput {
                    route_key: route_key.clone(),
                    job_id: job.id,
                    transfer_duration_seconds,
                    host_energy,
                    link_energy: HashMap::new(),
                    total_host_joules: total_joules,
                    total_link_joules: 0.0,
                });
            }
        }
        stub
    }
}

impl SimulatorBackend for StubSimulator {
    fn run(&self, route: &Route, job: &Job) -> Result<SimOutput, PlanError> {
        let route_key = route.key();
        self.outputs
            .get(&(route_key.clone(), job.id))
            .cloned()
            .ok_or_else(|| PlanError::SimulatorUnavailable {
                route_key,
                job_id: job.id,
                reason: "no stubbed output".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{Node, NodeType, PowerRange};
    use crate::traceroute::Hop;
    use std::io::Write;

    fn nodes() -> NodeMap {
        let mk = |name: &str, kind, nic: &str, min, max| Node {
            name: name.to_string(),
            kind,
            cpu_cores: 8,
            total_ram: 64.0,
            nic_speed: nic.parse().unwrap(),
            gf: 100.0,
            power: PowerRange { min, max },
        };
        NodeMap::from_nodes(vec![
            mk("siteA", NodeType::Source, "1Gbps", 100.0, 300.0),
            mk("hub", NodeType::Destination, "40Gbps", 200.0, 600.0),
        ])
        .unwrap()
    }

    fn route() -> Route {
        let hop = |ip: &str, ttl| Hop {
            ip: ip.to_string(),
            ttl,
            rtt_ms: ttl as f64,
            lat: None,
            lon: None,
        };
        Route {
            source: "siteA".into(),
            destination: "hub".into(),
            hops: vec![hop("10.0.0.1", 1), hop("10.0.0.2", 2), hop("10.0.0.3", 3)],
        }
    }

    #[test]
    fn platform_spec_classes_and_naming() {
        let sim = Simulation::default();
        let spec = PlatformSpec::from_route(&route(), &nodes(), &sim).unwrap();

        assert_eq!(spec.hosts.len(), 3);
        assert_eq!(spec.hosts[0].name, "siteA");
        assert_eq!(spec.hosts[0].class, HostClass::Endpoint);
        assert_eq!(spec.hosts[0].wattage_per_state, [100.0, 200.0, 300.0]);
        assert_eq!(spec.hosts[1].name, "router_siteA_hub_1");
        assert_eq!(spec.hosts[1].class, HostClass::Router);
        assert_eq!(spec.hosts[1].wattage_per_state, [50.0, 275.0, 500.0]);
        assert_eq!(spec.hosts[2].name, "hub");

        assert_eq!(spec.links.len(), 2);
        assert_eq!(spec.links[0].name, "link_siteA_hub_1");
        assert_eq!(spec.links[0].class, LinkClass::Standard);
        assert_eq!(spec.links[0].bandwidth_bps, 1_000_000_000);
        assert_eq!(spec.links[1].class, LinkClass::Standard);
        assert_eq!(spec.links[1].bandwidth_bps, 40_000_000_000);
    }

    #[test]
    fn backbone_links_between_routers() {
        let sim = Simulation::default();
        let mut r = route();
        r.hops.push(Hop {
            ip: "10.0.0.4".into(),
            ttl: 4,
            rtt_ms: 4.0,
            lat: None,
            lon: None,
        });
        let spec = PlatformSpec::from_route(&r, &nodes(), &sim).unwrap();
        assert_eq!(spec.links[1].class, LinkClass::Backbone);
        assert_eq!(spec.links[1].bandwidth_bps, 10_000_000_000);
        assert_eq!(spec.links[1].wattage_range, [100.0, 200.0]);
    }

    #[test]
    fn energy_file_parses_and_checks_totals() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "hosts": {{"siteA": 1000.0, "hub": 2000.0}},
                "links": {{"link_siteA_hub_1": 500.0}},
                "total_energy_hosts": 3000.0,
                "total_link_energy": 500.0,
                "transfer_duration": 120.5,
                "job_size_bytes": 1000000
            }}"#
        )
        .unwrap();

        let out = parse_energy_file(file.path(), "siteA_hub", 1).unwrap();
        assert_eq!(out.transfer_duration_seconds, 120.5);
        assert_eq!(out.total_joules(), 3500.0);
        assert_eq!(out.host_energy["hub"], 2000.0);
    }

    #[test]
    fn inconsistent_host_total_is_contract_violation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "hosts": {{"siteA": 1000.0}},
                "links": {{}},
                "total_energy_hosts": 9000.0,
                "total_link_energy": 0.0,
                "transfer_duration": 10.0
            }}"#
        )
        .unwrap();
        assert!(matches!(
            parse_energy_file(file.path(), "siteA_hub", 1),
            Err(PlanError::InputMalformed(_))
        ));
    }

    #[test]
    fn missing_output_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        assert!(matches!(
            parse_energy_file(&path, "siteA_hub", 3),
            Err(PlanError::SimulatorUnavailable { job_id: 3, .. })
        ));
    }

    #[test]
    fn stub_returns_fixed_outputs() {
        let r = route();
        let job = Job {
            id: 1,
            size_bytes: 8,
            files_count: 1,
            deadline_hour: 0,
            type_tag: None,
        };
        let stub =
            StubSimulator::with_uniform_energy(&[&r], &[job.clone()], 100.0, 300.0);
        let out = stub.run(&r, &job).unwrap();
        assert_eq!(out.host_energy.len(), 3);
        assert_eq!(out.host_energy["siteA"], 100.0);
        assert_eq!(out.host_energy["router_siteA_hub_1"], 100.0);

        let other = Job {
            id: 9,
            ..job
        };
        assert!(stub.run(&r, &other).is_err());
    }
}
