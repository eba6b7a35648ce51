use std::convert::TryFrom;
use std::path::Path;

use anyhow::{anyhow, Context, Error};
use geo::{Contains, MultiPolygon, Point, Polygon};
use geojson::{FeatureCollection, GeoJson};

enum ZoneGeometry {
    Polygon(Polygon<f64>),
    MultiPolygon(MultiPolygon<f64>),
}

impl ZoneGeometry {
    fn contains(&self, point: &Point<f64>) -> bool {
        match self {
            ZoneGeometry::Polygon(p) => p.contains(point),
            ZoneGeometry::MultiPolygon(mp) => mp.contains(point),
        }
    }
}

/// Maps coordinates to an electricity-zone identifier by point-in-polygon
/// over the world zone polygons. Features keep file order; the first
/// containing feature wins, so `resolve` is stable for identical inputs.
pub struct ZoneResolver {
    zones: Vec<(String, ZoneGeometry)>,
}

impl ZoneResolver {
    pub fn from_geojson(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read geojson {}", path.display()))?;
        let geojson: GeoJson = raw
            .parse()
            .with_context(|| format!("failed to parse geojson {}", path.display()))?;
        let collection = FeatureCollection::try_from(geojson)
            .map_err(|e| anyhow!("{} is not a feature collection: {}", path.display(), e))?;

        let mut zones = Vec::new();
        for feature in collection.features {
            let name = match feature.property("zoneName").and_then(|v| v.as_str()) {
                Some(name) => name.to_string(),
                None => {
                    tracing::warn!("skipping zone feature without zoneName");
                    continue;
                }
            };
            let geometry = match feature.geometry.as_ref() {
                Some(g) => g,
                None => {
                    tracing::warn!(zone = %name, "skipping zone feature without geometry");
                    continue;
                }
            };
            let geometry = match geo::Geometry::<f64>::try_from(geometry) {
                Ok(geo::Geometry::Polygon(p)) => ZoneGeometry::Polygon(p),
                Ok(geo::Geometry::MultiPolygon(mp)) => ZoneGeometry::MultiPolygon(mp),
                Ok(_) => {
                    tracing::warn!(zone = %name, "skipping non-area zone geometry");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(zone = %name, error = %e, "skipping unreadable zone geometry");
                    continue;
                }
            };
            zones.push((name, geometry));
        }
        if zones.is_empty() {
            return Err(anyhow!("{} contains no usable zones", path.display()));
        }
        tracing::info!(zones = zones.len(), "loaded zone polygons");
        Ok(ZoneResolver { zones })
    }

    /// Test entry point building a resolver from in-memory polygons.
    pub fn from_polygons(zones: Vec<(String, Polygon<f64>)>) -> Self {
        ZoneResolver {
            zones: zones
                .into_iter()
                .map(|(name, p)| (name, ZoneGeometry::Polygon(p)))
                .collect(),
        }
    }

    pub fn resolve(&self, lon: f64, lat: f64) -> Option<&str> {
        let point = Point::new(lon, lat);
        self.zones
            .iter()
            .find(|(_, geometry)| geometry.contains(&point))
            .map(|(name, _)| name.as_str())
    }
}
