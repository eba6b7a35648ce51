use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Error};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlanError;

/// Carbon-intensity series per zone over a fixed forecast window.
///
/// Rows of the historical CSV falling inside `[start, start + horizon hours)`
/// are normalized to integer hour offsets by row order within the window, so
/// `get` is a plain (zone, hour) lookup.
pub struct ForecastStore {
    start: DateTime<Utc>,
    horizon: u32,
    series: BTreeMap<String, Vec<f64>>,
}

#[derive(Deserialize)]
struct CiRecord {
    datetime: String,
    zone_id: String,
    ci: f64,
    #[serde(rename = "ci_lifecycle", default)]
    _ci_lifecycle: Option<f64>,
}

#[derive(Serialize, Deserialize)]
struct WindowRecord {
    zone_id: String,
    hour_offset: u32,
    ci: f64,
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, Error> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    Err(anyhow!("unrecognized datetime {:?}", raw))
}

impl ForecastStore {
    /// Builds a store directly from per-zone series; test and cache entry
    /// point. Series longer than the horizon are truncated.
    pub fn from_series(
        start: DateTime<Utc>,
        horizon: u32,
        series: BTreeMap<String, Vec<f64>>,
    ) -> Self {
        let series = series
            .into_iter()
            .map(|(zone, mut values)| {
                values.truncate(horizon as usize);
                (zone, values)
            })
            .collect();
        ForecastStore {
            start,
            horizon,
            series,
        }
    }

    pub fn from_csv(path: &Path, start: DateTime<Utc>, horizon: u32) -> Result<Self, Error> {
        if horizon == 0 {
            return Err(anyhow!("forecast horizon must be at least one hour"));
        }
        let end = start + Duration::hours(i64::from(horizon));
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open historical CI file {}", path.display()))?;

        let mut series: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for record in reader.deserialize() {
            let record: CiRecord = record.context("bad historical CI record")?;
            let at = parse_datetime(&record.datetime)?;
            if at < start || at >= end {
                continue;
            }
            if record.ci < 0.0 {
                return Err(anyhow!(
                    "negative carbon intensity for zone {} at {}",
                    record.zone_id,
                    record.datetime
                ));
            }
            let values = series.entry(record.zone_id).or_default();
            if values.len() < horizon as usize {
                values.push(record.ci);
            }
        }
        if series.is_empty() {
            return Err(anyhow!(
                "historical CI file {} has no rows inside the forecast window",
                path.display()
            ));
        }
        tracing::info!(
            zones = series.len(),
            horizon,
            start = %start,
            "loaded forecast window"
        );
        Ok(ForecastStore {
            start,
            horizon,
            series,
        })
    }

    pub fn get(&self, zone_id: &str, hour_offset: u32) -> Result<f64, PlanError> {
        self.series
            .get(zone_id)
            .and_then(|values| values.get(hour_offset as usize))
            .copied()
            .ok_or_else(|| PlanError::ForecastMissing {
                zone: zone_id.to_string(),
                hour: hour_offset,
            })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn horizon(&self) -> u32 {
        self.horizon
    }

    pub fn zones(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// Persists the normalized window for reuse across planner runs.
    pub fn write_window_csv(&self, path: &Path) -> Result<(), Error> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for (zone, values) in &self.series {
            for (hour, ci) in values.iter().enumerate() {
                writer.serialize(WindowRecord {
                    zone_id: zone.clone(),
                    hour_offset: hour as u32,
                    ci: *ci,
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn from_window_csv(path: &Path, start: DateTime<Utc>, horizon: u32) -> Result<Self, Error> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open forecast window {}", path.display()))?;
        let mut series: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for record in reader.deserialize() {
            let record: WindowRecord = record.context("bad forecast window record")?;
            let values = series.entry(record.zone_id).or_default();
            if values.len() != record.hour_offset as usize {
                return Err(anyhow!(
                    "forecast window rows out of order at hour {}",
                    record.hour_offset
                ));
            }
            values.push(record.ci);
        }
        Ok(Self::from_series(start, horizon, series))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()
    }

    #[test]
    fn window_filtering_and_row_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "datetime,zone_id,ci,ci_lifecycle").unwrap();
        // one row before the window, three inside, one after
        writeln!(file, "2024-03-10 23:00:00+00:00,DE,999,1000").unwrap();
        writeln!(file, "2024-03-11 00:00:00+00:00,DE,100,120").unwrap();
        writeln!(file, "2024-03-11 01:00:00+00:00,DE,50,60").unwrap();
        writeln!(file, "2024-03-11 02:00:00+00:00,DE,75,80").unwrap();
        writeln!(file, "2024-03-11 03:00:00+00:00,DE,888,900").unwrap();
        writeln!(file, "2024-03-11 00:00:00+00:00,FR,20,25").unwrap();

        let store = ForecastStore::from_csv(file.path(), start(), 3).unwrap();
        assert_eq!(store.get("DE", 0).unwrap(), 100.0);
        assert_eq!(store.get("DE", 1).unwrap(), 50.0);
        assert_eq!(store.get("DE", 2).unwrap(), 75.0);
        assert_eq!(store.get("FR", 0).unwrap(), 20.0);
        assert!(matches!(
            store.get("DE", 3),
            Err(PlanError::ForecastMissing { .. })
        ));
        assert!(matches!(
            store.get("ES", 0),
            Err(PlanError::ForecastMissing { .. })
        ));
    }

    #[test]
    fn rfc3339_datetimes_accepted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "datetime,zone_id,ci,ci_lifecycle").unwrap();
        writeln!(file, "2024-03-11T00:00:00Z,US-CAL-CISO,212.5,230").unwrap();
        let store = ForecastStore::from_csv(file.path(), start(), 1).unwrap();
        assert_eq!(store.get("US-CAL-CISO", 0).unwrap(), 212.5);
    }

    #[test]
    fn window_csv_round_trip() {
        let mut series = BTreeMap::new();
        series.insert("DE".to_string(), vec![100.0, 50.0]);
        series.insert("FR".to_string(), vec![20.0]);
        let store = ForecastStore::from_series(start(), 2, series);

        let file = tempfile::NamedTempFile::new().unwrap();
        store.write_window_csv(file.path()).unwrap();
        let reloaded = ForecastStore::from_window_csv(file.path(), start(), 2).unwrap();
        assert_eq!(reloaded.get("DE", 1).unwrap(), 50.0);
        assert_eq!(reloaded.get("FR", 0).unwrap(), 20.0);
        assert!(reloaded.get("FR", 1).is_err());
    }
}
