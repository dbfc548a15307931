//! Totals over a filtered set of rows. Every ratio is recomputed from summed
//! counts.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::coverage::{percent, CoverageTotals};
use crate::selection::GroupSelection;
use crate::types::{Group, GroupCounts, ZoneRow};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupTotal {
    pub group: Group,
    pub description: &'static str,
    pub included: bool,
    pub total: u64,
    pub male: u64,
    pub female: u64,
    /// Share of the four-group sum.
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub zones: usize,
    pub total_population: u64,
    pub selected_population: u64,
    pub selected_share: f64,
    pub selected_male: u64,
    pub selected_female: u64,
    pub male_share: f64,
    pub female_share: f64,
    pub groups: Vec<GroupTotal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageTotals>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalitySummary {
    pub locality: String,
    pub zones: usize,
    pub selected_population: u64,
    pub total_population: u64,
    pub group_population: GroupCounts,
    pub selected_male: u64,
    pub selected_female: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageTotals>,
}

fn coverage_of(rows: &[&ZoneRow], enabled: bool) -> Option<CoverageTotals> {
    enabled.then(|| CoverageTotals::sum(rows.iter().filter_map(|r| r.coverage.as_ref())))
}

fn saturating_sum(values: impl IntoIterator<Item = u64>) -> u64 {
    values.into_iter().fold(0, u64::saturating_add)
}

pub fn summarize(rows: &[ZoneRow], selection: &GroupSelection, coverage_enabled: bool) -> Summary {
    let mut groups = [0u64; 4];
    let mut male = [0u64; 4];
    let mut female = [0u64; 4];
    let mut total_population = 0;
    let mut selected_population = 0;
    let mut selected_male = 0;
    let mut selected_female = 0;

    for row in rows {
        let zone = &row.ranked.zone;
        for g in Group::ALL {
            let i = g.index();
            groups[i] = groups[i].saturating_add(zone.group_population[i]);
            male[i] = male[i].saturating_add(zone.group_male[i]);
            female[i] = female[i].saturating_add(zone.group_female[i]);
        }
        total_population = zone.total_population.saturating_add(total_population);
        selected_population = row.ranked.selected_population.saturating_add(selected_population);
        selected_male = row.ranked.selected_male.saturating_add(selected_male);
        selected_female = row.ranked.selected_female.saturating_add(selected_female);
    }

    let all_groups = saturating_sum(groups);
    let sexed = selected_male.saturating_add(selected_female);
    let refs: Vec<&ZoneRow> = rows.iter().collect();

    Summary {
        zones: rows.len(),
        total_population,
        selected_population,
        selected_share: percent(selected_population, total_population),
        selected_male,
        selected_female,
        male_share: percent(selected_male, sexed),
        female_share: percent(selected_female, sexed),
        groups: Group::ALL
            .into_iter()
            .map(|g| GroupTotal {
                group: g,
                description: g.description(),
                included: selection.contains(g),
                total: groups[g.index()],
                male: male[g.index()],
                female: female[g.index()],
                share: percent(groups[g.index()], all_groups),
            })
            .collect(),
        coverage: coverage_of(&refs, coverage_enabled),
    }
}

/// Per-locality aggregation, largest selected population first, ties by name.
pub fn by_locality(rows: &[ZoneRow], coverage_enabled: bool) -> Vec<LocalitySummary> {
    let mut grouped: BTreeMap<&str, Vec<&ZoneRow>> = BTreeMap::new();
    for row in rows {
        grouped.entry(&row.ranked.zone.locality).or_default().push(row);
    }

    let mut out: Vec<LocalitySummary> = grouped
        .into_iter()
        .map(|(locality, members)| {
            let mut group_population = [0u64; 4];
            for row in &members {
                for (acc, v) in group_population.iter_mut().zip(row.ranked.zone.group_population) {
                    *acc = acc.saturating_add(v);
                }
            }
            LocalitySummary {
                locality: locality.to_string(),
                zones: members.len(),
                selected_population: saturating_sum(members.iter().map(|r| r.ranked.selected_population)),
                total_population: saturating_sum(members.iter().map(|r| r.ranked.zone.total_population)),
                group_population,
                selected_male: saturating_sum(members.iter().map(|r| r.ranked.selected_male)),
                selected_female: saturating_sum(members.iter().map(|r| r.ranked.selected_female)),
                coverage: coverage_of(&members, coverage_enabled),
            }
        })
        .collect();

    // BTreeMap order already breaks ties by name; the sort is stable.
    out.sort_by(|a, b| b.selected_population.cmp(&a.selected_population));
    out
}

/// The first `n` rows in ranked order.
pub fn top(rows: &[ZoneRow], n: usize) -> &[ZoneRow] {
    &rows[..n.min(rows.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{compute_gaps, BeneficiaryTable};
    use crate::ranking::{rank, tests::zone};

    fn rows(with_coverage: bool) -> Vec<ZoneRow> {
        let mut zones = vec![
            zone(1, [100, 0, 0, 50]),
            zone(2, [10, 0, 0, 0]),
            zone(3, [20, 20, 0, 0]),
        ];
        zones[1].locality = "Usme".into();
        zones[2].locality = "Usme".into();
        let ranked = rank(&zones, &GroupSelection::default());
        let served: BeneficiaryTable = [(1, 10), (2, 10)].into_iter().collect();
        let gaps = compute_gaps(&ranked, &served);
        ranked
            .into_iter()
            .zip(gaps)
            .map(|(ranked, gap)| ZoneRow {
                ranked,
                coverage: with_coverage.then_some(gap),
            })
            .collect()
    }

    #[test]
    fn totals_saturate_on_huge_counts() {
        let big = u64::MAX / 2 + 1;
        let zones = vec![zone(1, [big, 0, 0, 0]), zone(2, [big, 0, 0, 0])];
        let rows: Vec<ZoneRow> = rank(&zones, &GroupSelection::default())
            .into_iter()
            .map(|ranked| ZoneRow { ranked, coverage: None })
            .collect();

        let s = summarize(&rows, &GroupSelection::default(), false);
        assert_eq!(s.selected_population, u64::MAX);
        assert_eq!(s.groups[0].total, u64::MAX);
        let localities = by_locality(&rows, false);
        assert_eq!(localities[0].selected_population, u64::MAX);
    }

    #[test]
    fn summary_totals() {
        let s = summarize(&rows(false), &GroupSelection::default(), false);
        assert_eq!(s.zones, 3);
        assert_eq!(s.selected_population, 150);
        assert_eq!(s.total_population, 200);
        assert_eq!(s.selected_share, 75.0);
        assert_eq!(s.selected_male + s.selected_female, 150);
        assert!(s.coverage.is_none());

        let d = &s.groups[3];
        assert_eq!(d.group, Group::D);
        assert!(!d.included);
        assert_eq!(d.total, 50);
        assert_eq!(d.share, 25.0);
        assert!(s.groups[0].included);
    }

    #[test]
    fn empty_summary_has_zero_shares() {
        let s = summarize(&[], &GroupSelection::default(), true);
        assert_eq!(s.selected_share, 0.0);
        assert_eq!(s.male_share, 0.0);
        assert_eq!(s.coverage.as_ref().unwrap().coverage_rate, 0.0);
    }

    #[test]
    fn localities_sorted_and_coverage_pooled() {
        let locs = by_locality(&rows(true), true);
        assert_eq!(locs.len(), 2);
        assert_eq!(locs[0].locality, "Kennedy");
        assert_eq!(locs[0].selected_population, 100);

        let usme = &locs[1];
        assert_eq!(usme.zones, 2);
        assert_eq!(usme.selected_population, 50);
        assert_eq!(usme.group_population, [30, 20, 0, 0]);
        let coverage = usme.coverage.as_ref().unwrap();
        // (0 + 10) / (40 + 10), not the mean of 0% and 100%
        assert_eq!(coverage.coverage_rate, 20.0);
        assert_eq!(coverage.gap, 40);
    }

    #[test]
    fn top_is_bounded() {
        let rows = rows(false);
        assert_eq!(top(&rows, 2).len(), 2);
        assert_eq!(top(&rows, 10).len(), 3);
        assert_eq!(top(&rows, 2)[0].ranked.rank, 1);
    }
}
