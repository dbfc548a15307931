//! One full recomputation: rank, gaps, filter, summaries, map join.

use serde::Serialize;

use crate::coverage::compute_gaps;
use crate::data::Sources;
use crate::error::Notice;
use crate::filter::Filter;
use crate::geometry::{join_geometry, MapLayer};
use crate::ranking::{compare_ranks, rank, RankShift};
use crate::selection::GroupSelection;
use crate::summary::{by_locality, summarize, LocalitySummary, Summary};
use crate::types::ZoneRow;

/// The inputs an analyst controls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub selection: GroupSelection,
    pub filter: Filter,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub selection: GroupSelection,
    pub filter: Filter,
    /// Filtered rows in rank order. Ranks are over the whole dataset.
    #[serde(skip)]
    pub rows: Vec<ZoneRow>,
    pub summary: Summary,
    pub localities: Vec<LocalitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank_shift: Option<RankShift>,
    #[serde(skip)]
    pub map: Option<MapLayer>,
    pub notices: Vec<Notice>,
}

/// Recomputes every derived product from the read-only sources. Nothing is
/// cached or mutated here.
pub fn run(sources: &Sources, request: &Request) -> Analysis {
    let ranked = rank(&sources.dataset.zones, &request.selection);

    let rows: Vec<ZoneRow> = match &sources.beneficiaries {
        Some(table) => {
            let gaps = compute_gaps(&ranked, table);
            ranked
                .into_iter()
                .zip(gaps)
                .map(|(ranked, gap)| ZoneRow {
                    ranked,
                    coverage: Some(gap),
                })
                .collect()
        }
        None => ranked
            .into_iter()
            .map(|ranked| ZoneRow {
                ranked,
                coverage: None,
            })
            .collect(),
    };

    let rows = request.filter.apply(rows);
    let coverage_enabled = sources.beneficiaries.is_some();

    let summary = summarize(&rows, &request.selection, coverage_enabled);
    let localities = by_locality(&rows, coverage_enabled);
    let rank_shift = compare_ranks(rows.iter().map(|r| &r.ranked));
    let map = sources
        .geometry
        .as_deref()
        .map(|source| join_geometry(&rows, source));

    tracing::debug!(
        "Selection {} -> {} rows ({} on map)",
        request.selection,
        rows.len(),
        map.as_ref().map_or(0, |m| m.features.features.len())
    );

    Analysis {
        selection: request.selection.clone(),
        filter: request.filter.clone(),
        rows,
        summary,
        localities,
        rank_shift,
        map,
        notices: sources.notices.clone(),
    }
}
