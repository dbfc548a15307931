//! Geometry sources, the attribute join that produces map features, and the
//! locality boundary dissolve.

use geo::{Area, BooleanOps, CoordsIter, MultiPolygon};
use geojson::{feature::Id, Feature, FeatureCollection, GeoJson};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

use crate::error::JoinRecordError;
use crate::types::{PriorityTier, Zone, ZoneCode, ZoneRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Polygon geometry read from a shapefile or GeoJSON.
    Native,
    /// GeoJSON text embedded in a tabular column.
    Serialized,
}

/// A geometry provider keyed by zone code. The join and dissolve only see
/// this trait, so either source yields the same output.
pub trait GeometrySource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// All codes with an entry, ascending.
    fn codes(&self) -> Vec<ZoneCode>;

    fn locality(&self, code: ZoneCode) -> Option<&str>;

    /// `None` when the code has no entry; `Some(Err)` when it has one that
    /// cannot be used as a polygon.
    fn shape(&self, code: ZoneCode) -> Option<Result<MultiPolygon<f64>, JoinRecordError>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct NativeEntry {
    locality: Option<String>,
    geometry: geo::Geometry<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct NativeGeometry {
    entries: BTreeMap<ZoneCode, NativeEntry>,
}

impl NativeGeometry {
    /// Keeps the first entry for a repeated code.
    pub fn insert(&mut self, code: ZoneCode, locality: Option<String>, geometry: geo::Geometry<f64>) {
        if self.entries.contains_key(&code) {
            warn!("Duplicate geometry for zone {}; keeping the first", code);
            return;
        }
        self.entries.insert(code, NativeEntry { locality, geometry });
    }
}

impl GeometrySource for NativeGeometry {
    fn kind(&self) -> SourceKind {
        SourceKind::Native
    }

    fn codes(&self) -> Vec<ZoneCode> {
        self.entries.keys().copied().collect()
    }

    fn locality(&self, code: ZoneCode) -> Option<&str> {
        self.entries.get(&code)?.locality.as_deref()
    }

    fn shape(&self, code: ZoneCode) -> Option<Result<MultiPolygon<f64>, JoinRecordError>> {
        let entry = self.entries.get(&code)?;
        Some(to_multipolygon(code, entry.geometry.clone()))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone)]
struct SerializedEntry {
    locality: Option<String>,
    shape: String,
}

#[derive(Debug, Clone, Default)]
pub struct SerializedGeometry {
    entries: BTreeMap<ZoneCode, SerializedEntry>,
}

impl SerializedGeometry {
    /// Keeps the first entry for a repeated code. The shape text is only
    /// parsed when joined.
    pub fn insert(&mut self, code: ZoneCode, locality: Option<String>, shape: String) {
        if self.entries.contains_key(&code) {
            warn!("Duplicate serialized shape for zone {}; keeping the first", code);
            return;
        }
        self.entries.insert(code, SerializedEntry { locality, shape });
    }
}

impl GeometrySource for SerializedGeometry {
    fn kind(&self) -> SourceKind {
        SourceKind::Serialized
    }

    fn codes(&self) -> Vec<ZoneCode> {
        self.entries.keys().copied().collect()
    }

    fn locality(&self, code: ZoneCode) -> Option<&str> {
        self.entries.get(&code)?.locality.as_deref()
    }

    fn shape(&self, code: ZoneCode) -> Option<Result<MultiPolygon<f64>, JoinRecordError>> {
        let entry = self.entries.get(&code)?;
        Some(parse_shape(code, &entry.shape))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Parses a GeoJSON geometry, or a Feature wrapping one.
pub fn parse_shape(code: ZoneCode, text: &str) -> Result<MultiPolygon<f64>, JoinRecordError> {
    let unparsable = |reason: String| JoinRecordError::UnparsableShape { code, reason };

    let geometry = match text.trim().parse::<GeoJson>().map_err(|e| unparsable(e.to_string()))? {
        GeoJson::Geometry(g) => g,
        GeoJson::Feature(Feature { geometry: Some(g), .. }) => g,
        GeoJson::Feature(_) => return Err(JoinRecordError::EmptyGeometry { code }),
        GeoJson::FeatureCollection(_) => {
            return Err(unparsable("expected a geometry, found a FeatureCollection".into()))
        }
    };
    let geometry: geo::Geometry<f64> = geometry
        .value
        .try_into()
        .map_err(|e: geojson::Error| unparsable(e.to_string()))?;
    to_multipolygon(code, geometry)
}

fn to_multipolygon(code: ZoneCode, geometry: geo::Geometry<f64>) -> Result<MultiPolygon<f64>, JoinRecordError> {
    let shape = match geometry {
        geo::Geometry::MultiPolygon(mp) => mp,
        geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
        other => {
            return Err(JoinRecordError::NotPolygonal {
                code,
                kind: geometry_kind(&other).to_string(),
            })
        }
    };
    if shape.coords_iter().next().is_none() {
        return Err(JoinRecordError::EmptyGeometry { code });
    }
    if !shape.coords_iter().all(|c| c.x.is_finite() && c.y.is_finite()) {
        return Err(JoinRecordError::NonFiniteCoordinates { code });
    }
    Ok(shape)
}

fn geometry_kind(geometry: &geo::Geometry<f64>) -> &'static str {
    match geometry {
        geo::Geometry::Point(_) => "Point",
        geo::Geometry::Line(_) => "Line",
        geo::Geometry::LineString(_) => "LineString",
        geo::Geometry::Polygon(_) => "Polygon",
        geo::Geometry::MultiPoint(_) => "MultiPoint",
        geo::Geometry::MultiLineString(_) => "MultiLineString",
        geo::Geometry::MultiPolygon(_) => "MultiPolygon",
        geo::Geometry::GeometryCollection(_) => "GeometryCollection",
        geo::Geometry::Rect(_) => "Rect",
        geo::Geometry::Triangle(_) => "Triangle",
    }
}

#[derive(Serialize)]
struct ZoneProperties<'a> {
    code: ZoneCode,
    name: &'a str,
    locality: &'a str,
    rank: u32,
    selected_population: u64,
    total_population: u64,
    group_a: u64,
    group_b: u64,
    group_c: u64,
    group_d: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    coverage_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gap: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority_tier: Option<PriorityTier>,
}

impl<'a> ZoneProperties<'a> {
    fn from_row(row: &'a ZoneRow) -> Self {
        let zone = &row.ranked.zone;
        let groups = zone.group_population;
        ZoneProperties {
            code: zone.code,
            name: &zone.name,
            locality: &zone.locality,
            rank: row.ranked.rank,
            selected_population: row.ranked.selected_population,
            total_population: zone.total_population,
            group_a: groups[0],
            group_b: groups[1],
            group_c: groups[2],
            group_d: groups[3],
            coverage_rate: row.coverage.as_ref().map(|c| c.coverage_rate),
            gap: row.coverage.as_ref().map(|c| c.gap),
            priority_tier: row.coverage.as_ref().map(|c| c.priority_tier),
        }
    }
}

fn properties<T: Serialize>(code: ZoneCode, value: &T) -> Result<geojson::JsonObject, JoinRecordError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(JoinRecordError::Attributes {
            code,
            reason: "properties are not an object".into(),
        }),
        Err(e) => Err(JoinRecordError::Attributes {
            code,
            reason: e.to_string(),
        }),
    }
}

fn feature(id: String, shape: &MultiPolygon<f64>, properties: geojson::JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::from(shape))),
        id: Some(Id::String(id)),
        properties: Some(properties),
        foreign_members: None,
    }
}

fn zone_feature(row: &ZoneRow, source: &dyn GeometrySource) -> Option<Result<Feature, JoinRecordError>> {
    let code = row.ranked.code();
    let shape = match source.shape(code)? {
        Ok(shape) => shape,
        Err(e) => return Some(Err(e)),
    };
    let props = match properties(code, &ZoneProperties::from_row(row)) {
        Ok(props) => props,
        Err(e) => return Some(Err(e)),
    };
    Some(Ok(feature(code.to_string(), &shape, props)))
}

/// Zone features ready for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct MapLayer {
    pub source: SourceKind,
    pub features: FeatureCollection,
    /// Rows whose geometry entry existed but could not be used.
    pub dropped: usize,
    /// Rows with no geometry entry at all.
    pub unmatched: usize,
}

/// Inner join of rows and geometry on zone code. Feature id is the code as
/// a string. A bad record is dropped and counted; it never aborts the join.
pub fn join_geometry(rows: &[ZoneRow], source: &dyn GeometrySource) -> MapLayer {
    let mut features = Vec::with_capacity(rows.len());
    let mut dropped = 0;
    let mut unmatched = 0;

    for row in rows {
        match zone_feature(row, source) {
            Some(Ok(f)) => features.push(f),
            Some(Err(e)) => {
                debug!("Dropping map feature: {}", e);
                dropped += 1;
            }
            None => unmatched += 1,
        }
    }

    if dropped > 0 {
        warn!("{} of {} zones dropped from the map", dropped, rows.len());
    }

    MapLayer {
        source: source.kind(),
        features: FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        },
        dropped,
        unmatched,
    }
}

#[derive(Serialize)]
struct LocalityProperties<'a> {
    locality: &'a str,
    zone_count: usize,
}

/// One merged outline per locality.
#[derive(Debug, Clone, Serialize)]
pub struct BoundaryLayer {
    pub features: FeatureCollection,
    /// Localities that could not be dissolved.
    pub failed: Vec<String>,
}

/// Merges zone geometries by locality. The locality comes from the geometry
/// source when it has one, otherwise from the zone dataset. Unusable shapes
/// are left out of their locality; a locality whose union fails is reported
/// in `failed` without affecting the others.
pub fn dissolve_localities(source: &dyn GeometrySource, zones: &[Zone]) -> BoundaryLayer {
    let zone_localities: HashMap<ZoneCode, &str> =
        zones.iter().map(|z| (z.code, z.locality.as_str())).collect();

    let mut groups: BTreeMap<String, Vec<MultiPolygon<f64>>> = BTreeMap::new();
    for code in source.codes() {
        let Some(locality) = source
            .locality(code)
            .or_else(|| zone_localities.get(&code).copied())
        else {
            debug!("Zone {} has no locality; left out of boundaries", code);
            continue;
        };
        match source.shape(code) {
            Some(Ok(shape)) => groups.entry(locality.to_string()).or_default().push(shape),
            Some(Err(e)) => debug!("Skipping shape in dissolve: {}", e),
            None => {}
        }
    }

    let mut features = Vec::with_capacity(groups.len());
    let mut failed = Vec::new();
    for (locality, shapes) in &groups {
        let merged = match union_all(shapes) {
            Some(merged) => merged,
            None => {
                warn!("Could not dissolve boundaries for locality {}", locality);
                failed.push(locality.clone());
                continue;
            }
        };
        let props = LocalityProperties {
            locality,
            zone_count: shapes.len(),
        };
        match properties(0, &props) {
            Ok(props) => features.push(feature(locality.clone(), &merged, props)),
            Err(e) => {
                warn!("Locality {}: {}", locality, e);
                failed.push(locality.clone());
            }
        }
    }

    BoundaryLayer {
        features: FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        },
        failed,
    }
}

/// Union of all shapes, or `None` if the boolean ops panic on degenerate
/// input or the result encloses no area.
fn union_all(shapes: &[MultiPolygon<f64>]) -> Option<MultiPolygon<f64>> {
    let (first, rest) = shapes.split_first()?;
    let merged = panic::catch_unwind(AssertUnwindSafe(|| {
        rest.iter().fold(first.clone(), |acc, shape| acc.union(shape))
    }))
    .ok()?;
    (!merged.0.is_empty() && merged.unsigned_area() > 0.0).then_some(merged)
}
