//! Dynamic ranking by selected-group population.

use serde::Serialize;

use crate::selection::GroupSelection;
use crate::types::{RankedZone, Zone};

/// Positions a zone must move before the change counts as significant.
pub const SIGNIFICANT_SHIFT: i64 = 5;

/// Ranks zones descending by the population of the selected groups.
///
/// Equal populations keep their input order (input index is the secondary
/// ascending key), and ranks are assigned by position: `1..=n`, no gaps, no
/// shared ranks. The input slice is not modified.
pub fn rank(zones: &[Zone], selection: &GroupSelection) -> Vec<RankedZone> {
    let mut keyed: Vec<(usize, u64)> = zones
        .iter()
        .enumerate()
        .map(|(i, z)| (i, selection.sum(&z.group_population)))
        .collect();

    keyed.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    keyed
        .into_iter()
        .enumerate()
        .map(|(pos, (i, selected_population))| {
            let zone = &zones[i];
            RankedZone {
                selected_population,
                selected_male: selection.sum(&zone.group_male),
                selected_female: selection.sum(&zone.group_female),
                rank: pos as u32 + 1,
                zone: zone.clone(),
            }
        })
        .collect()
}

/// How the dynamic ranking moved against the published one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RankShift {
    pub rose: usize,
    pub fell: usize,
    pub unchanged: usize,
}

/// Counts zones that moved more than `SIGNIFICANT_SHIFT` places. Returns
/// `None` when no zone has a published rank.
pub fn compare_ranks<'a>(ranked: impl IntoIterator<Item = &'a RankedZone>) -> Option<RankShift> {
    let mut shift = RankShift::default();
    let mut seen = false;
    for change in ranked.into_iter().filter_map(RankedZone::rank_change) {
        seen = true;
        if change > SIGNIFICANT_SHIFT {
            shift.rose += 1;
        } else if change < -SIGNIFICANT_SHIFT {
            shift.fell += 1;
        } else {
            shift.unchanged += 1;
        }
    }
    seen.then_some(shift)
}
