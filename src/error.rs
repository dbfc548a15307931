use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::types::{Group, ZoneCode};

/// Rejected group selection. Callers recover by substituting the default
/// selection; this never aborts a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("group selection is empty")]
    EmptySelection,

    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    /// The group is known but the zone dataset has no column for it.
    #[error("group {0} has no population column in the zone dataset")]
    UnavailableGroup(Group),
}

/// A single record that could not be turned into a map feature.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinRecordError {
    #[error("zone {code}: serialized shape is not valid GeoJSON: {reason}")]
    UnparsableShape { code: ZoneCode, reason: String },

    #[error("zone {code}: geometry type {kind} is not a polygon")]
    NotPolygonal { code: ZoneCode, kind: String },

    #[error("zone {code}: geometry is empty")]
    EmptyGeometry { code: ZoneCode },

    #[error("zone {code}: geometry has non-finite coordinates")]
    NonFiniteCoordinates { code: ZoneCode },

    #[error("zone {code}: attributes could not be encoded: {reason}")]
    Attributes { code: ZoneCode, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    Geometry,
    Beneficiaries,
}

/// Non-blocking notices surfaced alongside results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// An optional source is unavailable; the output depending on it is disabled.
    MissingSource { source: SourceName, detail: String },
    /// The requested selection was rejected and the default used instead.
    SelectionSubstituted { reason: String, used: String },
}

impl Notice {
    pub fn missing(source: SourceName, detail: impl Into<String>) -> Self {
        Notice::MissingSource {
            source,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceName::Geometry => write!(f, "geometry"),
            SourceName::Beneficiaries => write!(f, "beneficiaries"),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::MissingSource { source, detail } => {
                write!(f, "{} source unavailable ({}); dependent outputs disabled", source, detail)
            }
            Notice::SelectionSubstituted { reason, used } => {
                write!(f, "group selection rejected ({}); using {}", reason, used)
            }
        }
    }
}
