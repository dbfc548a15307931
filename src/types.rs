use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigurationError;

pub type ZoneCode = u32;

/// SISBEN IV groups, ordered from most to least vulnerable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Group {
    A,
    B,
    C,
    D,
}

impl Group {
    pub const ALL: [Group; 4] = [Group::A, Group::B, Group::C, Group::D];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn letter(self) -> &'static str {
        match self {
            Group::A => "A",
            Group::B => "B",
            Group::C => "C",
            Group::D => "D",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Group::A => "Pobreza Extrema",
            Group::B => "Pobreza Moderada",
            Group::C => "Vulnerable",
            Group::D => "No Vulnerable",
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

impl FromStr for Group {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let letter = s
            .strip_prefix("GRUPO_")
            .or_else(|| s.strip_prefix("Grupo "))
            .unwrap_or(s);
        match letter.to_ascii_uppercase().as_str() {
            "A" => Ok(Group::A),
            "B" => Ok(Group::B),
            "C" => Ok(Group::C),
            "D" => Ok(Group::D),
            _ => Err(ConfigurationError::UnknownGroup(s.to_string())),
        }
    }
}

/// Per-group counts indexed by `Group::index`.
pub type GroupCounts = [u64; 4];

/// One administrative spatial unit (UPZ).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub code: ZoneCode,
    pub name: String,
    pub locality: String,
    pub group_population: GroupCounts,
    pub group_male: GroupCounts,
    pub group_female: GroupCounts,
    /// Reported independently; not guaranteed to bound the group sum.
    pub total_population: u64,
    /// Previously published static rank, if the dataset carries one.
    pub original_rank: Option<u32>,
}

/// The immutable tabular source, loaded once.
#[derive(Debug, Clone, Default)]
pub struct ZoneDataset {
    pub zones: Vec<Zone>,
    /// Groups whose population column exists in the source.
    pub available_groups: BTreeSet<Group>,
}

impl ZoneDataset {
    pub fn localities(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.zones.iter().map(|z| z.locality.as_str()).collect();
        set.into_iter().map(str::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

/// A zone with its selection-dependent population and dynamic rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedZone {
    pub zone: Zone,
    pub selected_population: u64,
    pub selected_male: u64,
    pub selected_female: u64,
    /// 1-based, dense, by position in the sorted order.
    pub rank: u32,
}

impl RankedZone {
    pub fn code(&self) -> ZoneCode {
        self.zone.code
    }

    /// Positive when the zone moved up relative to the published rank.
    pub fn rank_change(&self) -> Option<i64> {
        self.zone
            .original_rank
            .map(|orig| i64::from(orig) - i64::from(self.rank))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityTier {
    #[serde(rename = "Cobertura completa")]
    Complete,
    #[serde(rename = "Baja")]
    Low,
    #[serde(rename = "Media")]
    Medium,
    #[serde(rename = "Alta")]
    High,
    #[serde(rename = "Critica")]
    Critical,
}

impl PriorityTier {
    pub fn label(self) -> &'static str {
        match self {
            PriorityTier::Complete => "Cobertura completa",
            PriorityTier::Low => "Baja",
            PriorityTier::Medium => "Media",
            PriorityTier::High => "Alta",
            PriorityTier::Critical => "Critica",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageRecord {
    pub code: ZoneCode,
    pub selected_population: u64,
    pub beneficiaries: u64,
    /// Percent, one decimal.
    pub coverage_rate: f64,
    /// May be negative when over-covered.
    pub gap: i64,
    pub priority_tier: PriorityTier,
}

/// A ranked zone plus its coverage record when beneficiaries are loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRow {
    pub ranked: RankedZone,
    pub coverage: Option<CoverageRecord>,
}
