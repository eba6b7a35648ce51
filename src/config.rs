use std::path::PathBuf;

use anyhow::{anyhow, Error};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub trait Validate: Sized {
    fn validate(self) -> Result<Self, Error>;
}

#[derive(Default, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub paths: Paths,
    pub forecast: Forecast,
    pub simulation: Simulation,
    pub milp: Milp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Paths {
    pub nodes: PathBuf,
    pub jobs: PathBuf,
    pub traceroutes: PathBuf,
    pub historical_ci: PathBuf,
    pub world_geojson: PathBuf,
    pub associations_csv: PathBuf,
    pub forecast_window_csv: PathBuf,
    pub schedules_dir: PathBuf,
    pub energy_data_dir: PathBuf,
    pub platform_dir: PathBuf,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Forecast {
    /// Start of the forecast window, UTC.
    pub start: DateTime<Utc>,
    /// Horizon H in one-hour buckets.
    pub length_hours: u32,
}

/// Wattage profile for intermediate routers: per-state low/mean/high draw
/// plus the off state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RouterPower {
    pub low: f64,
    pub mean: f64,
    pub high: f64,
    pub off: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LinkProfile {
    pub watts_min: f64,
    pub watts_max: f64,
    pub watts_off: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Simulation {
    /// Command invoked per (route, job); receives the platform file, flow
    /// count, job size, job id, and destination host.
    pub command: PathBuf,
    /// Bounded worker pool for simulator invocations.
    pub workers: usize,
    pub flows: u32,
    pub router_power: RouterPower,
    /// Endpoint-adjacent links; bandwidth comes from the endpoint NIC.
    pub standard_link: LinkProfile,
    /// Router-to-router links at a fixed bandwidth.
    pub backbone_link: LinkProfile,
    pub backbone_bandwidth_bps: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Milp {
    pub time_limit_secs: f64,
    /// Allocations with a solved fraction at or below this are dropped.
    pub epsilon: f64,
    /// Penalty weight for unmet seconds in the normalized formulation;
    /// derived from the associations table when unset.
    pub penalty: Option<f64>,
}

impl Validate for Config {
    fn validate(self) -> Result<Self, Error> {
        Ok(Self {
            paths: self.paths,
            forecast: self.forecast.validate()?,
            simulation: self.simulation.validate()?,
            milp: self.milp.validate()?,
        })
    }
}

impl Validate for Forecast {
    fn validate(self) -> Result<Self, Error> {
        if self.length_hours == 0 {
            return Err(anyhow!("forecast length must be at least one hour"));
        }
        Ok(self)
    }
}

impl Validate for Simulation {
    fn validate(self) -> Result<Self, Error> {
        if self.workers == 0 {
            return Err(anyhow!("simulation worker pool must have at least one worker"));
        }
        if self.router_power.low > self.router_power.high {
            return Err(anyhow!(
                "router power low {} exceeds high {}",
                self.router_power.low,
                self.router_power.high
            ));
        }
        for link in [&self.standard_link, &self.backbone_link].iter() {
            if link.watts_min > link.watts_max {
                return Err(anyhow!(
                    "link wattage range is inverted: {} > {}",
                    link.watts_min,
                    link.watts_max
                ));
            }
        }
        Ok(self)
    }
}

impl Validate for Milp {
    fn validate(self) -> Result<Self, Error> {
        if self.time_limit_secs <= 0.0 {
            return Err(anyhow!("solver time limit must be positive"));
        }
        if !(0.0..1.0).contains(&self.epsilon) {
            return Err(anyhow!("epsilon {} must be in [0.0, 1.0)", self.epsilon));
        }
        Ok(self)
    }
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            nodes: "config/nodes.json".into(),
            jobs: "config/jobs.json".into(),
            traceroutes: "config/traceroutes".into(),
            historical_ci: "data/historical_ci.csv".into(),
            world_geojson: "config/world.geojson".into(),
            associations_csv: "data/associations_df.csv".into(),
            forecast_window_csv: "data/forecast_window.csv".into(),
            schedules_dir: "schedules".into(),
            energy_data_dir: "data".into(),
            platform_dir: "config/platforms".into(),
        }
    }
}

impl Default for Forecast {
    fn default() -> Self {
        Forecast {
            start: Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap(),
            length_hours: 71,
        }
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Simulation {
            command: "simulator/run.sh".into(),
            workers: 20,
            flows: 1,
            router_power: RouterPower {
                low: 50.0,
                mean: 275.0,
                high: 500.0,
                off: 5.0,
            },
            standard_link: LinkProfile {
                watts_min: 80.0,
                watts_max: 130.0,
                watts_off: 10.0,
            },
            backbone_link: LinkProfile {
                watts_min: 100.0,
                watts_max: 200.0,
                watts_off: 10.0,
            },
            backbone_bandwidth_bps: 10_000_000_000,
        }
    }
}

impl Default for Milp {
    fn default() -> Self {
        Milp {
            time_limit_secs: 5000.0,
            epsilon: 1e-3,
            penalty: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip() {
        let config = Config::default();

        let tomled = toml::to_string_pretty(&config).unwrap();
        let config2: Config = toml::from_str(&tomled).unwrap();

        assert_eq!(config, config2);
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = Config::default();
        config.simulation.workers = 0;
        assert!(config.validate().is_err());
    }
}
