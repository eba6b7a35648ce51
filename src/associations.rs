use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

/// One (route, job, forecast-hour) prediction, the unit of the associations
/// table and of its CSV form.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AssociationRow {
    pub source_node: String,
    pub destination_node: String,
    pub route_key: String,
    pub job_id: u64,
    pub forecast_id: u32,
    pub transfer_time_s: f64,
    pub throughput_bps: f64,
    pub host_joules: f64,
    pub link_joules: f64,
    pub total_joules: f64,
    pub carbon_emissions_g: f64,
}

/// Column-oriented associations table. Rows are sorted by
/// (route_key, job_id, forecast_id) on construction so every index walk and
/// every planner consuming the table is deterministic; lookups run over the
/// auxiliary indexes, not the columns.
#[derive(Default, Debug)]
pub struct AssociationTable {
    source_node: Vec<String>,
    destination_node: Vec<String>,
    route_key: Vec<String>,
    job_id: Vec<u64>,
    forecast_id: Vec<u32>,
    transfer_time_s: Vec<f64>,
    throughput_bps: Vec<f64>,
    host_joules: Vec<f64>,
    link_joules: Vec<f64>,
    total_joules: Vec<f64>,
    carbon_emissions_g: Vec<f64>,

    by_job_route: HashMap<(u64, String), Vec<usize>>,
    by_route_slot: HashMap<(String, u32), Vec<usize>>,
    by_job: HashMap<u64, Vec<usize>>,
    route_keys: Vec<String>,
}

impl AssociationTable {
    pub fn from_rows(mut rows: Vec<AssociationRow>) -> Self {
        rows.sort_by(|a, b| {
            (&a.route_key, a.job_id, a.forecast_id).cmp(&(&b.route_key, b.job_id, b.forecast_id))
        });

        let mut table = AssociationTable::default();
        for (idx, row) in rows.into_iter().enumerate() {
            table
                .by_job_route
                .entry((row.job_id, row.route_key.clone()))
                .or_default()
                .push(idx);
            table
                .by_route_slot
                .entry((row.route_key.clone(), row.forecast_id))
                .or_default()
                .push(idx);
            table.by_job.entry(row.job_id).or_default().push(idx);
            if table.route_keys.last() != Some(&row.route_key) {
                table.route_keys.push(row.route_key.clone());
            }

            table.source_node.push(row.source_node);
            table.destination_node.push(row.destination_node);
            table.route_key.push(row.route_key);
            table.job_id.push(row.job_id);
            table.forecast_id.push(row.forecast_id);
            table.transfer_time_s.push(row.transfer_time_s);
            table.throughput_bps.push(row.throughput_bps);
            table.host_joules.push(row.host_joules);
            table.link_joules.push(row.link_joules);
            table.total_joules.push(row.total_joules);
            table.carbon_emissions_g.push(row.carbon_emissions_g);
        }
        table.route_keys.sort();
        table.route_keys.dedup();
        table
    }

    pub fn len(&self) -> usize {
        self.route_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.route_key.is_empty()
    }

    pub fn row(&self, idx: usize) -> AssociationRow {
        AssociationRow {
            source_node: self.source_node[idx].clone(),
            destination_node: self.destination_node[idx].clone(),
            route_key: self.route_key[idx].clone(),
            job_id: self.job_id[idx],
            forecast_id: self.forecast_id[idx],
            transfer_time_s: self.transfer_time_s[idx],
            throughput_bps: self.throughput_bps[idx],
            host_joules: self.host_joules[idx],
            link_joules: self.link_joules[idx],
            total_joules: self.total_joules[idx],
            carbon_emissions_g: self.carbon_emissions_g[idx],
        }
    }

    pub fn source_node(&self, idx: usize) -> &str {
        &self.source_node[idx]
    }

    pub fn destination_node(&self, idx: usize) -> &str {
        &self.destination_node[idx]
    }

    pub fn route_key(&self, idx: usize) -> &str {
        &self.route_key[idx]
    }

    pub fn job_id(&self, idx: usize) -> u64 {
        self.job_id[idx]
    }

    pub fn forecast_id(&self, idx: usize) -> u32 {
        self.forecast_id[idx]
    }

    pub fn transfer_time_s(&self, idx: usize) -> f64 {
        self.transfer_time_s[idx]
    }

    pub fn throughput_bps(&self, idx: usize) -> f64 {
        self.throughput_bps[idx]
    }

    pub fn carbon_emissions_g(&self, idx: usize) -> f64 {
        self.carbon_emissions_g[idx]
    }

    /// All distinct route keys, sorted.
    pub fn route_keys(&self) -> &[String] {
        &self.route_keys
    }

    /// All distinct forecast ids present, sorted.
    pub fn forecast_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.forecast_id.clone();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Row indexes for one (job, route), in forecast order.
    pub fn rows_for_job_route(&self, job_id: u64, route_key: &str) -> &[usize] {
        self.by_job_route
            .get(&(job_id, route_key.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Row indexes for everything placed on one (route, slot).
    pub fn rows_for_route_slot(&self, route_key: &str, forecast_id: u32) -> &[usize] {
        self.by_route_slot
            .get(&(route_key.to_string(), forecast_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn rows_for_job(&self, job_id: u64) -> &[usize] {
        self.by_job
            .get(&job_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Route keys with rows for this job, in table (route_key) order.
    pub fn routes_for_job(&self, job_id: u64) -> Vec<&str> {
        let mut routes: Vec<&str> = Vec::new();
        for &idx in self.rows_for_job(job_id) {
            let key = self.route_key(idx);
            if routes.last() != Some(&key) {
                routes.push(key);
            }
        }
        routes
    }

    /// Transfer time of a job on a route; constant across the route's slots.
    pub fn transfer_time_for(&self, job_id: u64, route_key: &str) -> Option<f64> {
        self.rows_for_job_route(job_id, route_key)
            .first()
            .map(|&idx| self.transfer_time_s[idx])
    }

    pub fn min_transfer_time_for(&self, job_id: u64) -> Option<f64> {
        self.routes_for_job(job_id)
            .iter()
            .filter_map(|route| self.transfer_time_for(job_id, route))
            .fold(None, |best, t| match best {
                Some(b) if b <= t => Some(b),
                _ => Some(t),
            })
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), Error> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for idx in 0..self.len() {
            writer.serialize(self.row(idx))?;
        }
        writer.flush()?;
        tracing::info!(rows = self.len(), path = %path.display(), "wrote associations table");
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self, Error> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open associations table {}", path.display()))?;
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: AssociationRow = record.context("bad associations row")?;
            rows.push(row);
        }
        tracing::info!(rows = rows.len(), path = %path.display(), "loaded associations table");
        Ok(Self::from_rows(rows))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn row(
        route_key: &str,
        job_id: u64,
        forecast_id: u32,
        transfer_time_s: f64,
        carbon: f64,
    ) -> AssociationRow {
        let (source, destination) = {
            let mut parts = route_key.splitn(2, '_');
            (
                parts.next().unwrap_or("src").to_string(),
                parts.next().unwrap_or("dst").to_string(),
            )
        };
        AssociationRow {
            source_node: source,
            destination_node: destination,
            route_key: route_key.to_string(),
            job_id,
            forecast_id,
            transfer_time_s,
            throughput_bps: 1e9,
            host_joules: 1000.0,
            link_joules: 100.0,
            total_joules: 1100.0,
            carbon_emissions_g: carbon,
        }
    }

    #[test]
    fn rows_sorted_and_indexed() {
        let table = AssociationTable::from_rows(vec![
            row("b_z", 2, 1, 100.0, 5.0),
            row("a_z", 1, 1, 100.0, 2.0),
            row("a_z", 1, 0, 100.0, 3.0),
            row("b_z", 1, 0, 200.0, 4.0),
        ]);

        assert_eq!(table.len(), 4);
        assert_eq!(table.route_key(0), "a_z");
        assert_eq!(table.forecast_id(0), 0);
        assert_eq!(table.route_keys(), &["a_z".to_string(), "b_z".to_string()]);

        let idxs = table.rows_for_job_route(1, "a_z");
        assert_eq!(idxs.len(), 2);
        assert_eq!(table.forecast_id(idxs[0]), 0);
        assert_eq!(table.forecast_id(idxs[1]), 1);

        assert_eq!(table.routes_for_job(1), vec!["a_z", "b_z"]);
        assert_eq!(table.transfer_time_for(1, "b_z"), Some(200.0));
        assert_eq!(table.min_transfer_time_for(1), Some(100.0));
        assert_eq!(table.rows_for_route_slot("a_z", 1).len(), 1);
        assert!(table.rows_for_job_route(9, "a_z").is_empty());
    }

    #[test]
    fn csv_round_trip_is_exact() {
        let table = AssociationTable::from_rows(vec![
            row("a_z", 1, 0, 123.456, 7.000000001),
            row("a_z", 1, 1, 123.456, 6.5),
        ]);
        let file = tempfile::NamedTempFile::new().unwrap();
        table.write_csv(file.path()).unwrap();

        let reloaded = AssociationTable::read_csv(file.path()).unwrap();
        assert_eq!(reloaded.len(), table.len());
        for idx in 0..table.len() {
            let a = table.row(idx);
            let b = reloaded.row(idx);
            assert_eq!(a.route_key, b.route_key);
            assert!((a.carbon_emissions_g - b.carbon_emissions_g).abs() < 1e-9);
            assert!((a.transfer_time_s - b.transfer_time_s).abs() < 1e-9);
        }
    }
}
