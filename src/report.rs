use crate::data::Sources;
use crate::geometry::dissolve_localities;
use crate::pipeline::{self, Analysis, Request};
use crate::types::{PriorityTier, ZoneCode, ZoneRow};
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// One row of the exported ranked/gap table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    pub code: ZoneCode,
    pub name: String,
    pub locality: String,
    pub rank: u32,
    pub original_rank: Option<u32>,
    pub rank_change: Option<i64>,
    pub selected_population: u64,
    pub selected_male: u64,
    pub selected_female: u64,
    pub total_population: u64,
    pub group_a: u64,
    pub group_b: u64,
    pub group_c: u64,
    pub group_d: u64,
    pub beneficiaries: Option<u64>,
    pub coverage_rate: Option<f64>,
    pub gap: Option<i64>,
    pub priority_tier: Option<PriorityTier>,
}

impl From<&ZoneRow> for TableRow {
    fn from(row: &ZoneRow) -> Self {
        let zone = &row.ranked.zone;
        let [group_a, group_b, group_c, group_d] = zone.group_population;
        TableRow {
            code: zone.code,
            name: zone.name.clone(),
            locality: zone.locality.clone(),
            rank: row.ranked.rank,
            original_rank: zone.original_rank,
            rank_change: row.ranked.rank_change(),
            selected_population: row.ranked.selected_population,
            selected_male: row.ranked.selected_male,
            selected_female: row.ranked.selected_female,
            total_population: zone.total_population,
            group_a,
            group_b,
            group_c,
            group_d,
            beneficiaries: row.coverage.as_ref().map(|c| c.beneficiaries),
            coverage_rate: row.coverage.as_ref().map(|c| c.coverage_rate),
            gap: row.coverage.as_ref().map(|c| c.gap),
            priority_tier: row.coverage.as_ref().map(|c| c.priority_tier),
        }
    }
}

pub fn write_table<W: Write>(writer: W, rows: &[ZoneRow]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(TableRow::from(row))?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("Failed to write {:?}", path))
}

/// Files written for one selection.
#[derive(Debug, Clone)]
pub struct ReportFiles {
    pub selection: String,
    pub rows: usize,
    pub table: PathBuf,
    pub summary: PathBuf,
    pub zones: Option<PathBuf>,
}

fn write_scenario(dir: &Path, analysis: &Analysis) -> Result<ReportFiles> {
    let label = analysis.selection.compact();

    let table = dir.join(format!("ranking_{}.csv", label));
    let file = File::create(&table).with_context(|| format!("Failed to create {:?}", table))?;
    write_table(BufWriter::new(file), &analysis.rows)?;

    let summary = dir.join(format!("summary_{}.json", label));
    write_json(&summary, analysis)?;

    let zones = match &analysis.map {
        Some(layer) => {
            let path = dir.join(format!("zones_{}.geojson", label));
            write_json(&path, &layer.features)?;
            Some(path)
        }
        None => None,
    };

    Ok(ReportFiles {
        selection: analysis.selection.to_string(),
        rows: analysis.rows.len(),
        table,
        summary,
        zones,
    })
}

/// Runs every request independently (in parallel) over the shared sources
/// and writes its table, summary and map features. Locality boundaries do
/// not depend on the selection and are written once.
pub fn generate_reports(dir: &Path, sources: &Sources, requests: &[Request]) -> Result<Vec<ReportFiles>> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory {:?}", dir))?;

    if let Some(geometry) = sources.geometry.as_deref() {
        let boundaries = dissolve_localities(geometry, &sources.dataset.zones);
        info!(
            "Dissolved {} locality boundaries ({} failed)",
            boundaries.features.features.len(),
            boundaries.failed.len()
        );
        write_json(&dir.join("localities.geojson"), &boundaries.features)?;
    }

    requests
        .par_iter()
        .map(|request| {
            let analysis = pipeline::run(sources, request);
            info!("Writing report for groups {}", analysis.selection);
            write_scenario(dir, &analysis)
        })
        .collect()
}
