use serde::Serialize;

use crate::types::{RankedZone, ZoneRow};

/// Label used by the dashboard for "no locality filter".
pub const ALL_LOCALITIES: &str = "Todas las localidades";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalityFilter {
    #[default]
    All,
    Named(String),
}

impl LocalityFilter {
    pub fn parse(input: Option<&str>) -> LocalityFilter {
        match input.map(str::trim) {
            None | Some("") => LocalityFilter::All,
            Some(s) if s.eq_ignore_ascii_case("all") || s == ALL_LOCALITIES => LocalityFilter::All,
            Some(s) => LocalityFilter::Named(s.to_string()),
        }
    }

    pub fn matches(&self, locality: &str) -> bool {
        match self {
            LocalityFilter::All => true,
            LocalityFilter::Named(name) => name == locality,
        }
    }
}

/// Inclusive bounds against the dynamic rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RankRange {
    pub min: u32,
    pub max: u32,
}

impl RankRange {
    pub fn contains(&self, rank: u32) -> bool {
        self.min <= rank && rank <= self.max
    }

    /// Fills in missing bounds. With neither bound given the range is
    /// `1..=min(window, zone_count)`; without a window it is unrestricted.
    pub fn resolve(
        min: Option<u32>,
        max: Option<u32>,
        zone_count: usize,
        window: Option<u32>,
    ) -> Option<RankRange> {
        let n = u32::try_from(zone_count).unwrap_or(u32::MAX);
        match (min, max) {
            (None, None) => window.map(|w| RankRange { min: 1, max: w.min(n) }),
            (min, max) => Some(RankRange {
                min: min.unwrap_or(1),
                max: max.unwrap_or(n),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Filter {
    pub locality: LocalityFilter,
    pub rank_range: Option<RankRange>,
}

impl Filter {
    pub fn matches(&self, ranked: &RankedZone) -> bool {
        self.locality.matches(&ranked.zone.locality)
            && self.rank_range.map_or(true, |r| r.contains(ranked.rank))
    }

    /// Keeps matching rows in their existing (ranked) order.
    pub fn apply(&self, rows: Vec<ZoneRow>) -> Vec<ZoneRow> {
        rows.into_iter().filter(|row| self.matches(&row.ranked)).collect()
    }
}
