//! Coverage rate, gap and priority tier per zone and over aggregates.

use serde::Serialize;
use std::collections::HashMap;

use crate::types::{CoverageRecord, PriorityTier, RankedZone, ZoneCode};

/// Beneficiaries already served, keyed by zone code.
pub type BeneficiaryTable = HashMap<ZoneCode, u64>;

pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// `part / whole * 100` to one decimal, or 0 when `whole` is 0.
pub fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round_one_decimal(part as f64 / whole as f64 * 100.0)
}

impl PriorityTier {
    /// Thresholds are checked highest first; each lower bound is inclusive.
    pub fn classify(coverage_rate: f64) -> PriorityTier {
        if coverage_rate >= 100.0 {
            PriorityTier::Complete
        } else if coverage_rate >= 75.0 {
            PriorityTier::Low
        } else if coverage_rate >= 50.0 {
            PriorityTier::Medium
        } else if coverage_rate >= 25.0 {
            PriorityTier::High
        } else {
            PriorityTier::Critical
        }
    }
}

impl CoverageRecord {
    pub fn new(code: ZoneCode, selected_population: u64, beneficiaries: u64) -> Self {
        let coverage_rate = percent(beneficiaries, selected_population);
        CoverageRecord {
            code,
            selected_population,
            beneficiaries,
            coverage_rate,
            gap: gap(selected_population, beneficiaries),
            priority_tier: PriorityTier::classify(coverage_rate),
        }
    }
}

/// `selected - served`, clamped to the `i64` range.
fn gap(selected: u64, served: u64) -> i64 {
    let diff = i128::from(selected) - i128::from(served);
    i64::try_from(diff).unwrap_or(if diff < 0 { i64::MIN } else { i64::MAX })
}

/// One record per ranked zone, in ranked order. Zones missing from the
/// beneficiaries table count as zero served.
pub fn compute_gaps(ranked: &[RankedZone], beneficiaries: &BeneficiaryTable) -> Vec<CoverageRecord> {
    ranked
        .iter()
        .map(|r| {
            let served = beneficiaries.get(&r.code()).copied().unwrap_or(0);
            CoverageRecord::new(r.code(), r.selected_population, served)
        })
        .collect()
}

/// Coverage over a set of zones, computed from summed numerator and
/// denominator rather than averaged rates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageTotals {
    pub zones: usize,
    pub selected_population: u64,
    pub beneficiaries: u64,
    pub coverage_rate: f64,
    pub gap: i64,
    pub priority_tier: PriorityTier,
}

impl CoverageTotals {
    pub fn sum<'a>(records: impl IntoIterator<Item = &'a CoverageRecord>) -> CoverageTotals {
        let (zones, selected, served) = records
            .into_iter()
            .fold((0usize, 0u64, 0u64), |(n, s, b), r| {
                (
                    n + 1,
                    s.saturating_add(r.selected_population),
                    b.saturating_add(r.beneficiaries),
                )
            });
        let record = CoverageRecord::new(0, selected, served);
        CoverageTotals {
            zones,
            selected_population: selected,
            beneficiaries: served,
            coverage_rate: record.coverage_rate,
            gap: record.gap,
            priority_tier: record.priority_tier,
        }
    }
}
