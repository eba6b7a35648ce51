use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Error};
use serde::Deserialize;
use serde_json::Value;

/// One traceroute hop. Coordinates are absent when geolocation failed for
/// the hop's address.
#[derive(Clone, Debug)]
pub struct Hop {
    pub ip: String,
    pub ttl: u32,
    pub rtt_ms: f64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl Hop {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lon, self.lat) {
            (Some(lon), Some(lat)) => Some((lon, lat)),
            _ => None,
        }
    }
}

/// An ordered hop sequence between a source node and the destination node.
#[derive(Clone, Debug)]
pub struct Route {
    pub source: String,
    pub destination: String,
    pub hops: Vec<Hop>,
}

impl Route {
    pub fn key(&self) -> String {
        format!("{}_{}", self.source, self.destination)
    }

    /// Per-hop coordinates with the deterministic fallback: a hop without
    /// its own fix borrows the nearest preceding hop's coordinates, then the
    /// nearest following hop's, and stays unresolved if the whole route has
    /// none.
    pub fn effective_coordinates(&self) -> Vec<Option<(f64, f64)>> {
        let own: Vec<Option<(f64, f64)>> = self.hops.iter().map(Hop::coordinates).collect();
        let mut resolved = own.clone();
        for i in 0..own.len() {
            if resolved[i].is_some() {
                continue;
            }
            if let Some(coords) = own[..i].iter().rev().flatten().next() {
                resolved[i] = Some(*coords);
            } else if let Some(coords) = own[i + 1..].iter().flatten().next() {
                resolved[i] = Some(*coords);
            }
        }
        resolved
    }
}

#[derive(Deserialize)]
struct GeoRecord {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
struct HopRecord {
    ip: String,
    ttl: u32,
    rtt_ms: f64,
    #[serde(default)]
    geo: Option<GeoRecord>,
}

#[derive(Deserialize)]
struct RouteMetadata {
    source: String,
    destination: String,
}

#[derive(Deserialize)]
struct RouteRecord {
    metadata: RouteMetadata,
    hops: Vec<HopRecord>,
}

/// Loads traceroutes from either a directory of JSON-Lines files (one route
/// per line) or a single legacy map-shaped JSON file. Routes are keyed and
/// returned in route_key order; a later record for the same key replaces an
/// earlier one.
pub fn load_routes(path: &Path, destination: &str) -> Result<BTreeMap<String, Route>, Error> {
    let mut routes = BTreeMap::new();
    if path.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)
            .with_context(|| format!("failed to read traceroute directory {}", path.display()))?
            .collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            if entry.path().is_dir() {
                continue;
            }
            load_jsonl_file(&entry.path(), &mut routes)?;
        }
    } else {
        let route = load_legacy_file(path, destination)?;
        routes.insert(route.key(), route);
    }
    for route in routes.values() {
        if route.hops.len() < 2 {
            return Err(anyhow!(
                "route {} has {} hops, need at least source and destination",
                route.key(),
                route.hops.len()
            ));
        }
    }
    tracing::info!(routes = routes.len(), "loaded traceroutes");
    Ok(routes)
}

fn load_jsonl_file(path: &Path, routes: &mut BTreeMap<String, Route>) -> Result<(), Error> {
    let file = File::open(path)
        .with_context(|| format!("failed to open traceroute file {}", path.display()))?;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: RouteRecord = serde_json::from_str(&line).with_context(|| {
            format!("bad traceroute record at {}:{}", path.display(), lineno + 1)
        })?;
        let hops = record
            .hops
            .into_iter()
            .map(|h| Hop {
                ip: h.ip,
                ttl: h.ttl,
                rtt_ms: h.rtt_ms,
                lat: h.geo.as_ref().map(|g| g.lat),
                lon: h.geo.as_ref().map(|g| g.lon),
            })
            .collect();
        let route = Route {
            source: record.metadata.source,
            destination: record.metadata.destination,
            hops,
        };
        routes.insert(route.key(), route);
    }
    Ok(())
}

/// The legacy format is one JSON object per source: hop IPs as keys mapped to
/// `{lon, lat, rtt, ttl}`, plus scalar metadata entries. A JSON map carries
/// no order, so hops sort by ttl.
fn load_legacy_file(path: &Path, destination: &str) -> Result<Route, Error> {
    let file = File::open(path)
        .with_context(|| format!("failed to open traceroute file {}", path.display()))?;
    let raw: BTreeMap<String, Value> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse traceroute file {}", path.display()))?;

    let source = match raw.get("node_id").and_then(Value::as_str) {
        Some(node_id) => node_id.to_string(),
        None => path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("cannot infer source for {}", path.display()))?
            .to_string(),
    };

    let mut hops = Vec::new();
    for (key, value) in &raw {
        if matches!(key.as_str(), "time" | "node_id" | "job_id") {
            continue;
        }
        let entry = value
            .as_object()
            .ok_or_else(|| anyhow!("hop entry {} is not an object", key))?;
        hops.push(Hop {
            ip: key.clone(),
            ttl: entry.get("ttl").and_then(Value::as_u64).unwrap_or(0) as u32,
            rtt_ms: entry.get("rtt").and_then(Value::as_f64).unwrap_or(0.0),
            lat: entry.get("lat").and_then(Value::as_f64),
            lon: entry.get("lon").and_then(Value::as_f64),
        });
    }
    hops.sort_by_key(|h| h.ttl);

    Ok(Route {
        source,
        destination: destination.to_string(),
        hops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn hop(ip: &str, ttl: u32, coords: Option<(f64, f64)>) -> Hop {
        Hop {
            ip: ip.to_string(),
            ttl,
            rtt_ms: ttl as f64,
            lat: coords.map(|c| c.1),
            lon: coords.map(|c| c.0),
        }
    }

    #[test]
    fn coordinate_fallback_prefers_preceding_hop() {
        let route = Route {
            source: "a".into(),
            destination: "z".into(),
            hops: vec![
                hop("10.0.0.1", 1, Some((1.0, 1.0))),
                hop("10.0.0.2", 2, None),
                hop("10.0.0.3", 3, Some((3.0, 3.0))),
            ],
        };
        let coords = route.effective_coordinates();
        assert_eq!(coords[1], Some((1.0, 1.0)));
    }

    #[test]
    fn coordinate_fallback_scans_forward_when_nothing_precedes() {
        let route = Route {
            source: "a".into(),
            destination: "z".into(),
            hops: vec![
                hop("10.0.0.1", 1, None),
                hop("10.0.0.2", 2, None),
                hop("10.0.0.3", 3, Some((3.0, 3.0))),
            ],
        };
        let coords = route.effective_coordinates();
        assert_eq!(coords[0], Some((3.0, 3.0)));
        assert_eq!(coords[1], Some((3.0, 3.0)));
    }

    #[test]
    fn coordinate_fallback_leaves_bare_routes_unresolved() {
        let route = Route {
            source: "a".into(),
            destination: "z".into(),
            hops: vec![hop("10.0.0.1", 1, None), hop("10.0.0.2", 2, None)],
        };
        assert_eq!(route.effective_coordinates(), vec![None, None]);
    }

    #[test]
    fn jsonl_directory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("siteA.jsonl")).unwrap();
        writeln!(
            file,
            r#"{{"metadata":{{"source":"siteA","destination":"hub"}},"hops":[{{"ip":"1.1.1.1","ttl":1,"rtt_ms":0.4,"geo":{{"lat":40.0,"lon":-74.0}}}},{{"ip":"2.2.2.2","ttl":2,"rtt_ms":9.1}}]}}"#
        )
        .unwrap();

        let routes = load_routes(dir.path(), "hub").unwrap();
        let route = &routes["siteA_hub"];
        assert_eq!(route.hops.len(), 2);
        assert_eq!(route.hops[0].coordinates(), Some((-74.0, 40.0)));
        assert_eq!(route.hops[1].coordinates(), None);
    }

    #[test]
    fn legacy_file_orders_hops_by_ttl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "node_id": "siteB",
                "time": "2024-03-11T00:00:00Z",
                "9.9.9.9": {{"lon": 3.0, "lat": 3.0, "rtt": 20.0, "ttl": 3}},
                "8.8.8.8": {{"lon": 1.0, "lat": 1.0, "rtt": 5.0, "ttl": 1}},
                "7.7.7.7": {{"lon": 2.0, "lat": 2.0, "rtt": 11.0, "ttl": 2}}
            }}"#
        )
        .unwrap();

        let routes = load_routes(file.path(), "hub").unwrap();
        let route = &routes["siteB_hub"];
        assert_eq!(route.source, "siteB");
        let ips: Vec<&str> = route.hops.iter().map(|h| h.ip.as_str()).collect();
        assert_eq!(ips, vec!["8.8.8.8", "7.7.7.7", "9.9.9.9"]);
    }
}
