use crate::config::{AppConfig, ColumnConfig};
use crate::coverage::BeneficiaryTable;
use crate::error::{Notice, SourceName};
use crate::geometry::{GeometrySource, NativeGeometry, SerializedGeometry};
use crate::types::{Group, Zone, ZoneCode, ZoneDataset};
use anyhow::{anyhow, Context, Result};
use csv::{ReaderBuilder, StringRecord};
use geo::MultiPolygon;
use sha2::{Digest, Sha256};
use shapefile::dbase::FieldValue;
use shapefile::Reader;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything the engine reads, loaded once per process.
pub struct Sources {
    pub dataset: ZoneDataset,
    pub geometry: Option<Arc<dyn GeometrySource>>,
    pub beneficiaries: Option<BeneficiaryTable>,
    /// Why optional outputs are disabled, if they are.
    pub notices: Vec<Notice>,
    /// Content hash of every loaded source file.
    pub version: String,
}

impl Sources {
    pub fn new(dataset: ZoneDataset, version: impl Into<String>) -> Self {
        Sources {
            dataset,
            geometry: None,
            beneficiaries: None,
            notices: Vec::new(),
            version: version.into(),
        }
    }

    pub fn with_geometry(mut self, geometry: impl GeometrySource + 'static) -> Self {
        self.geometry = Some(Arc::new(geometry));
        self
    }

    pub fn with_beneficiaries(mut self, beneficiaries: BeneficiaryTable) -> Self {
        self.beneficiaries = Some(beneficiaries);
        self
    }
}

pub fn load_sources(config: &AppConfig) -> Result<Sources> {
    info!("Loading data...");
    let mut hasher = Sha256::new();
    let mut notices = Vec::new();

    // 1. Zone dataset (required)
    let bytes = read_hashed(&config.input.zones_csv, &mut hasher)
        .with_context(|| format!("Failed to read zone dataset: {:?}", config.input.zones_csv))?;
    let dataset = parse_zones(&bytes, &config.columns)?;
    info!(
        "Loaded {} zones with groups {:?}",
        dataset.len(),
        dataset.available_groups
    );

    // 2. Beneficiaries (optional)
    let beneficiaries = match &config.input.beneficiaries_csv {
        None => {
            notices.push(Notice::missing(SourceName::Beneficiaries, "no beneficiaries source configured"));
            None
        }
        Some(path) => match read_hashed(path, &mut hasher).and_then(|bytes| {
            parse_beneficiaries(
                &bytes,
                &config.input.beneficiaries_code_column,
                &config.input.beneficiaries_count_column,
            )
        }) {
            Ok(table) => {
                info!("Loaded beneficiaries for {} zones", table.len());
                Some(table)
            }
            Err(e) => {
                warn!("Coverage analysis disabled: {:#}", e);
                notices.push(Notice::missing(SourceName::Beneficiaries, format!("{:#}", e)));
                None
            }
        },
    };

    // 3. Geometry (optional): primary source, then the serialized fallback
    let mut geometry = None;
    let mut failures = Vec::new();
    for path in [&config.input.geometry, &config.input.geometry_fallback]
        .into_iter()
        .flatten()
    {
        match load_geometry(config, path, &mut hasher) {
            Ok(source) => {
                info!("Loaded {} geometries from {:?}", source.len(), path);
                geometry = Some(source);
                break;
            }
            Err(e) => {
                warn!("Could not load geometry from {:?}: {:#}", path, e);
                failures.push(format!("{:?}: {:#}", path, e));
            }
        }
    }
    if geometry.is_none() {
        let detail = if failures.is_empty() {
            "no geometry source configured".to_string()
        } else {
            failures.join("; ")
        };
        notices.push(Notice::missing(SourceName::Geometry, detail));
    }

    Ok(Sources {
        dataset,
        geometry,
        beneficiaries,
        notices,
        version: hex::encode(hasher.finalize()),
    })
}

fn read_hashed(path: &Path, hasher: &mut Sha256) -> Result<Vec<u8>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    hasher.update(&bytes);
    Ok(bytes)
}

fn header_indices(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_string(), i))
        .collect()
}

/// Largest count accepted from a source cell; above it the cell is corrupt.
const MAX_COUNT: u64 = 1_000_000_000_000;

/// Counts tolerate blanks and spreadsheet floats like `12.0`; anything else,
/// including values above `MAX_COUNT`, reads as 0.
fn parse_count(raw: Option<&str>) -> u64 {
    let raw = raw.unwrap_or("").trim();
    if raw.is_empty() {
        return 0;
    }
    let count = raw.parse::<u64>().unwrap_or_else(|_| match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 && v <= MAX_COUNT as f64 => v.round() as u64,
        _ => 0,
    });
    if count > MAX_COUNT {
        debug!("Count {:?} out of range; reading as 0", raw);
        return 0;
    }
    count
}

fn parse_integer(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    raw.parse::<u32>().ok().or_else(|| {
        let v = raw.parse::<f64>().ok()?;
        (v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX)).then_some(v as u32)
    })
}

/// Zone code from a string field, honoring the optional prefix.
pub fn parse_code(raw: &str, prefix: Option<&str>) -> Option<ZoneCode> {
    let raw = raw.trim();
    match prefix {
        Some(p) if !p.is_empty() => parse_integer(raw.strip_prefix(p)?),
        _ => parse_integer(raw),
    }
}

pub fn parse_zones(bytes: &[u8], columns: &ColumnConfig) -> Result<ZoneDataset> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = rdr.headers().context("Zone dataset has no header row")?.clone();
    let idx = header_indices(&headers);

    let code_idx = *idx
        .get(&columns.code)
        .ok_or_else(|| anyhow!("Code column '{}' not found in zone dataset", columns.code))?;
    let name_idx = idx.get(&columns.name).copied();
    let locality_idx = idx.get(&columns.locality).copied();
    let total_idx = idx.get(&columns.total_population).copied();
    let rank_idx = idx.get(&columns.original_rank).copied();

    let mut group_idx = [None; 4];
    let mut male_idx = [None; 4];
    let mut female_idx = [None; 4];
    let mut available_groups = BTreeSet::new();
    for g in Group::ALL {
        group_idx[g.index()] = idx.get(&columns.group(g)).copied();
        male_idx[g.index()] = idx.get(&columns.male(g)).copied();
        female_idx[g.index()] = idx.get(&columns.female(g)).copied();
        if group_idx[g.index()].is_some() {
            available_groups.insert(g);
        }
    }
    if available_groups.is_empty() {
        return Err(anyhow!(
            "Zone dataset has no group population columns (expected '{}A'..'{}D')",
            columns.group_prefix,
            columns.group_prefix
        ));
    }

    let counts = |record: &StringRecord, indices: &[Option<usize>; 4]| -> [u64; 4] {
        indices.map(|i| i.map_or(0, |i| parse_count(record.get(i))))
    };

    let mut zones = Vec::new();
    let mut seen = BTreeSet::new();
    for (line, result) in rdr.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping unreadable zone row {}: {}", line + 2, e);
                continue;
            }
        };
        let raw_code = record.get(code_idx).unwrap_or("");
        let Some(code) = parse_integer(raw_code) else {
            warn!("Skipping zone row {} with invalid code {:?}", line + 2, raw_code);
            continue;
        };
        if !seen.insert(code) {
            warn!("Skipping duplicate zone code {} at row {}", code, line + 2);
            continue;
        }

        let text = |i: Option<usize>| i.and_then(|i| record.get(i)).map(str::trim).unwrap_or("");
        let locality = match text(locality_idx) {
            "" => "Sin datos".to_string(),
            s => s.to_string(),
        };

        zones.push(Zone {
            code,
            name: text(name_idx).to_string(),
            locality,
            group_population: counts(&record, &group_idx),
            group_male: counts(&record, &male_idx),
            group_female: counts(&record, &female_idx),
            total_population: total_idx.map_or(0, |i| parse_count(record.get(i))),
            original_rank: rank_idx.and_then(|i| record.get(i)).and_then(parse_integer),
        });
    }

    if zones.is_empty() {
        return Err(anyhow!("Zone dataset contains no usable rows"));
    }

    Ok(ZoneDataset {
        zones,
        available_groups,
    })
}

/// Duplicate codes are summed.
pub fn parse_beneficiaries(bytes: &[u8], code_column: &str, count_column: &str) -> Result<BeneficiaryTable> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = rdr.headers().context("Beneficiaries source has no header row")?.clone();
    let idx = header_indices(&headers);

    let code_idx = *idx
        .get(code_column)
        .ok_or_else(|| anyhow!("Code column '{}' not found in beneficiaries source", code_column))?;
    let count_idx = *idx
        .get(count_column)
        .ok_or_else(|| anyhow!("Count column '{}' not found in beneficiaries source", count_column))?;

    let mut table = BeneficiaryTable::new();
    for result in rdr.records() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping unreadable beneficiaries row: {}", e);
                continue;
            }
        };
        match record.get(code_idx).and_then(parse_integer) {
            Some(code) => {
                let served = table.entry(code).or_insert(0);
                *served = served.saturating_add(parse_count(record.get(count_idx)));
            }
            None => debug!("Skipping beneficiaries row without a code"),
        }
    }
    Ok(table)
}

fn load_geometry(config: &AppConfig, path: &Path, hasher: &mut Sha256) -> Result<Arc<dyn GeometrySource>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("Input geometry file has no extension"))?;

    let source: Arc<dyn GeometrySource> = match extension.as_str() {
        "shp" => Arc::new(load_shapefile(config, path, hasher)?),
        "json" | "geojson" => {
            let bytes = read_hashed(path, hasher)?;
            Arc::new(parse_geojson(config, &bytes)?)
        }
        "csv" => {
            let bytes = read_hashed(path, hasher)?;
            Arc::new(parse_serialized(config, &bytes)?)
        }
        _ => return Err(anyhow!("Unsupported geometry format: {}", extension)),
    };

    if source.is_empty() {
        return Err(anyhow!("Geometry source has no usable entries"));
    }
    Ok(source)
}

fn field_code(value: Option<&FieldValue>, prefix: Option<&str>) -> Option<ZoneCode> {
    match value? {
        FieldValue::Character(Some(s)) => parse_code(s, prefix),
        FieldValue::Numeric(Some(n)) => parse_integer(&n.to_string()),
        FieldValue::Integer(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

fn field_text(value: Option<&FieldValue>) -> Option<String> {
    match value? {
        FieldValue::Character(Some(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn load_shapefile(config: &AppConfig, path: &Path, hasher: &mut Sha256) -> Result<NativeGeometry> {
    read_hashed(path, hasher)?;
    // attributes live in the sidecar .dbf
    if let Ok(dbf) = fs::read(path.with_extension("dbf")) {
        hasher.update(&dbf);
    }

    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;
    let prefix = config.input.code_prefix.as_deref();
    let mut source = NativeGeometry::default();

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Skipping unreadable shapefile record: {}", e);
                continue;
            }
        };

        let Some(code) = field_code(record.get(&config.input.geometry_code_field), prefix) else {
            continue; // no code, or outside the prefix (e.g. rural units)
        };
        let locality = field_text(record.get(&config.input.geometry_locality_field));

        let converted: Result<MultiPolygon<f64>, String> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon.try_into().map_err(|e| format!("{:?}", e)),
            shapefile::Shape::PolygonM(polygon) => polygon.try_into().map_err(|e| format!("{:?}", e)),
            shapefile::Shape::PolygonZ(polygon) => polygon.try_into().map_err(|e| format!("{:?}", e)),
            other => Err(format!("{:?} is not a polygon", other.shapetype())),
        };
        match converted {
            Ok(mp) => source.insert(code, locality, geo::Geometry::MultiPolygon(mp)),
            Err(e) => warn!("Skipping shape for zone {}: {}", code, e),
        }
    }

    Ok(source)
}

pub fn parse_geojson(config: &AppConfig, bytes: &[u8]) -> Result<NativeGeometry> {
    use geojson::GeoJson;

    let geojson = GeoJson::from_reader(bytes).context("Failed to parse GeoJSON")?;
    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let prefix = config.input.code_prefix.as_deref();
    let mut source = NativeGeometry::default();

    for feature in collection.features {
        let props = feature.properties.as_ref();
        let code = match props.and_then(|p| p.get(&config.input.geometry_code_field)) {
            Some(serde_json::Value::String(s)) => parse_code(s, prefix),
            Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        let Some(code) = code else { continue };
        let locality = props
            .and_then(|p| p.get(&config.input.geometry_locality_field))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let Some(geometry) = feature.geometry else {
            debug!("Feature for zone {} has no geometry", code);
            continue;
        };
        match geo::Geometry::<f64>::try_from(geometry.value) {
            Ok(g) => source.insert(code, locality, g),
            Err(e) => warn!("Skipping geometry for zone {}: {}", code, e),
        }
    }

    Ok(source)
}

pub fn parse_serialized(config: &AppConfig, bytes: &[u8]) -> Result<SerializedGeometry> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = rdr.headers().context("Geometry table has no header row")?.clone();
    let idx = header_indices(&headers);

    let code_idx = *idx.get(&config.input.geometry_code_field).ok_or_else(|| {
        anyhow!("Code column '{}' not found in geometry table", config.input.geometry_code_field)
    })?;
    let shape_idx = *idx.get(&config.input.geometry_shape_field).ok_or_else(|| {
        anyhow!("Shape column '{}' not found in geometry table", config.input.geometry_shape_field)
    })?;
    let locality_idx = idx.get(&config.input.geometry_locality_field).copied();
    let prefix = config.input.code_prefix.as_deref();

    let mut source = SerializedGeometry::default();
    for result in rdr.records() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping unreadable geometry row: {}", e);
                continue;
            }
        };
        let Some(code) = record.get(code_idx).and_then(|raw| parse_code(raw, prefix)) else {
            continue;
        };
        let locality = locality_idx
            .and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let shape = record.get(shape_idx).unwrap_or("").to_string();
        source.insert(code, locality, shape);
    }

    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::tests::square_json;
    use crate::geometry::SourceKind;
    use std::path::PathBuf;

    const ZONES: &str = "\
CODIGO_UPZ,UPZ,LOCALIDAD,GRUPO_A,GRUPO_B,GRUPO_C,GRUPO_D,HOMBRES_A,HOMBRES_B,HOMBRES_C,HOMBRES_D,MUJERES_A,MUJERES_B,MUJERES_C,MUJERES_D,JOVENES_TOTAL,RANKING
101,Patio Bonito,Kennedy,50,30,20,10,25,15,10,5,25,15,10,5,120,2
102,Bosa Central,Bosa,5,5,5,5,2,2,2,2,3,3,3,3,25.0,1
abc,Broken,Bosa,1,1,1,1,0,0,0,0,1,1,1,1,4,3
101,Duplicate,Kennedy,9,9,9,9,0,0,0,0,9,9,9,9,36,4
";

    fn config(dir: &Path, geometry: Option<&str>, fallback: Option<&str>, beneficiaries: Option<&str>) -> AppConfig {
        let opt = |name: &str, v: Option<&str>| {
            v.map(|v| format!("{} = {:?}\n", name, dir.join(v)))
                .unwrap_or_default()
        };
        let text = format!(
            "[input]\nzones_csv = {:?}\n{}{}{}",
            dir.join("zones.csv"),
            opt("geometry", geometry),
            opt("geometry_fallback", fallback),
            opt("beneficiaries_csv", beneficiaries),
        );
        toml::from_str(&text).unwrap()
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_zone_rows_and_skips_bad_ones() {
        let dataset = parse_zones(ZONES.as_bytes(), &ColumnConfig::default()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.available_groups.len(), 4);

        let z = &dataset.zones[0];
        assert_eq!(z.code, 101);
        assert_eq!(z.name, "Patio Bonito");
        assert_eq!(z.group_population, [50, 30, 20, 10]);
        assert_eq!(z.group_male, [25, 15, 10, 5]);
        assert_eq!(z.original_rank, Some(2));
        assert_eq!(dataset.zones[1].total_population, 25);
        assert_eq!(dataset.localities(), vec!["Bosa", "Kennedy"]);
    }

    #[test]
    fn missing_group_columns_mark_groups_unavailable() {
        let csv = "CODIGO_UPZ,LOCALIDAD,GRUPO_A,GRUPO_B\n1,Suba,3,4\n";
        let dataset = parse_zones(csv.as_bytes(), &ColumnConfig::default()).unwrap();
        assert_eq!(
            dataset.available_groups,
            [Group::A, Group::B].into_iter().collect()
        );
        assert_eq!(dataset.zones[0].group_male, [0; 4]);
        assert_eq!(dataset.zones[0].original_rank, None);
    }

    #[test]
    fn dataset_without_code_column_is_fatal() {
        let err = parse_zones(b"UPZ,GRUPO_A\nX,1\n", &ColumnConfig::default()).unwrap_err();
        assert!(err.to_string().contains("CODIGO_UPZ"));
    }

    #[test]
    fn beneficiaries_sum_duplicates() {
        let csv = "CODIGO_UPZ,BENEFICIARIOS\n101,30\n101,10\n102,\n,5\n";
        let table = parse_beneficiaries(csv.as_bytes(), "CODIGO_UPZ", "BENEFICIARIOS").unwrap();
        assert_eq!(table.get(&101), Some(&40));
        assert_eq!(table.get(&102), Some(&0));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn out_of_range_counts_read_as_zero() {
        assert_eq!(parse_count(Some("1e20")), 0);
        assert_eq!(parse_count(Some("18446744073709551615")), 0);
        assert_eq!(parse_count(Some("-3")), 0);
        assert_eq!(parse_count(Some(" 12.0 ")), 12);
        assert_eq!(parse_count(Some("1000000000000")), MAX_COUNT);
    }

    #[test]
    fn codes_honor_prefix() {
        assert_eq!(parse_code("UPZ85", Some("UPZ")), Some(85));
        assert_eq!(parse_code("UPR3", Some("UPZ")), None);
        assert_eq!(parse_code(" 12.0 ", None), Some(12));
        assert_eq!(parse_code("12.5", None), None);
    }

    #[test]
    fn loads_everything_and_hashes_content() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "zones.csv", ZONES);
        write(dir.path(), "benef.csv", "CODIGO_UPZ,BENEFICIARIOS\n101,40\n");
        let geo = format!(
            "CODIGO_UPZ,LOCALIDAD,geo_shape\n101,Kennedy,{:?}\n102,Bosa,not-a-shape\n",
            square_json(0.0, 0.0)
        );
        // {:?} gives a quoted string with escaped inner quotes; CSV wants doubled quotes
        write(dir.path(), "geo.csv", &geo.replace("\\\"", "\"\""));

        let config = config(dir.path(), Some("geo.csv"), None, Some("benef.csv"));
        let sources = load_sources(&config).unwrap();
        assert!(sources.notices.is_empty());
        assert_eq!(sources.beneficiaries.as_ref().unwrap().get(&101), Some(&40));
        let geometry = sources.geometry.as_ref().unwrap();
        assert_eq!(geometry.kind(), SourceKind::Serialized);
        assert_eq!(geometry.len(), 2);
        assert!(geometry.shape(101).unwrap().is_ok());
        assert!(geometry.shape(102).unwrap().is_err());
        assert_eq!(sources.version.len(), 64);

        let again = load_sources(&config).unwrap();
        assert_eq!(again.version, sources.version);
        write(dir.path(), "benef.csv", "CODIGO_UPZ,BENEFICIARIOS\n101,41\n");
        assert_ne!(load_sources(&config).unwrap().version, sources.version);
    }

    #[test]
    fn missing_optional_sources_become_notices() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "zones.csv", ZONES);
        let config = config(dir.path(), Some("missing.shp"), None, Some("missing.csv"));

        let sources = load_sources(&config).unwrap();
        assert!(sources.geometry.is_none());
        assert!(sources.beneficiaries.is_none());
        assert_eq!(sources.notices.len(), 2);
        assert!(sources.notices.iter().any(|n| matches!(
            n,
            Notice::MissingSource { source: SourceName::Geometry, .. }
        )));
    }

    #[test]
    fn falls_back_to_serialized_geometry() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "zones.csv", ZONES);
        write(dir.path(), "broken.geojson", "{\"type\": \"Point\"");
        let geo = format!("CODIGO_UPZ,geo_shape\n101,{:?}\n", square_json(0.0, 0.0));
        write(dir.path(), "geo.csv", &geo.replace("\\\"", "\"\""));

        let config = config(dir.path(), Some("broken.geojson"), Some("geo.csv"), None);
        let sources = load_sources(&config).unwrap();
        assert_eq!(sources.geometry.as_ref().unwrap().kind(), SourceKind::Serialized);
        // only the beneficiaries notice remains
        assert_eq!(sources.notices.len(), 1);
    }

    #[test]
    fn parses_geojson_with_prefixed_codes() {
        let text = format!(
            r#"{{"type":"FeatureCollection","features":[
                {{"type":"Feature","properties":{{"CODIGO_UPZ":"UPZ7","LOCALIDAD":"Suba"}},"geometry":{}}},
                {{"type":"Feature","properties":{{"CODIGO_UPZ":"UPR1"}},"geometry":{}}},
                {{"type":"Feature","properties":{{"CODIGO_UPZ":8}},"geometry":null}}
            ]}}"#,
            square_json(0.0, 0.0),
            square_json(2.0, 0.0)
        );
        let mut config = config(Path::new("/tmp"), None, None, None);
        config.input.code_prefix = Some("UPZ".into());

        let source = parse_geojson(&config, text.as_bytes()).unwrap();
        assert_eq!(source.codes(), vec![7]);
        assert_eq!(source.locality(7), Some("Suba"));
    }

    #[test]
    fn missing_zone_dataset_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), None, None, None);
        assert!(load_sources(&config).is_err());
    }
}
