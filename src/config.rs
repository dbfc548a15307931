use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::Group;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub columns: ColumnConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub zones_csv: PathBuf,
    /// `.shp`, `.geojson`/`.json` or a `.csv` with serialized shapes.
    pub geometry: Option<PathBuf>,
    /// Serialized-shape CSV used when `geometry` is absent or fails to load.
    pub geometry_fallback: Option<PathBuf>,
    pub beneficiaries_csv: Option<PathBuf>,
    #[serde(default = "default_code_column")]
    pub geometry_code_field: String,
    #[serde(default = "default_locality_column")]
    pub geometry_locality_field: String,
    #[serde(default = "default_shape_column")]
    pub geometry_shape_field: String,
    /// Prefix stripped from string codes, e.g. `UPZ` in `UPZ85`. Entries
    /// without it are excluded.
    pub code_prefix: Option<String>,
    #[serde(default = "default_code_column")]
    pub beneficiaries_code_column: String,
    #[serde(default = "default_beneficiaries_column")]
    pub beneficiaries_count_column: String,
}

/// Header names in the zone dataset.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ColumnConfig {
    pub code: String,
    pub name: String,
    pub locality: String,
    pub total_population: String,
    pub original_rank: String,
    pub group_prefix: String,
    pub male_prefix: String,
    pub female_prefix: String,
}

impl ColumnConfig {
    pub fn group(&self, group: Group) -> String {
        format!("{}{}", self.group_prefix, group.letter())
    }

    pub fn male(&self, group: Group) -> String {
        format!("{}{}", self.male_prefix, group.letter())
    }

    pub fn female(&self, group: Group) -> String {
        format!("{}{}", self.female_prefix, group.letter())
    }
}

impl Default for ColumnConfig {
    fn default() -> Self {
        ColumnConfig {
            code: default_code_column(),
            name: "UPZ".into(),
            locality: default_locality_column(),
            total_population: "JOVENES_TOTAL".into(),
            original_rank: "RANKING".into(),
            group_prefix: "GRUPO_".into(),
            male_prefix: "HOMBRES_".into(),
            female_prefix: "MUJERES_".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Rows shown when no rank bounds are given; 0 shows all.
    pub default_rank_window: u32,
}

impl ProcessingConfig {
    pub fn rank_window(&self) -> Option<u32> {
        (self.default_rank_window > 0).then_some(self.default_rank_window)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        ProcessingConfig {
            default_rank_window: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dir: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 3000,
            static_dir: None,
        }
    }
}

fn default_code_column() -> String {
    "CODIGO_UPZ".into()
}

fn default_locality_column() -> String {
    "LOCALIDAD".into()
}

fn default_shape_column() -> String {
    "geo_shape".into()
}

fn default_beneficiaries_column() -> String {
    "BENEFICIARIOS".into()
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let mut config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Makes relative input/output paths relative to the config file.
    fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.input.zones_csv);
        join(&mut self.output.dir);
        for optional in [
            &mut self.input.geometry,
            &mut self.input.geometry_fallback,
            &mut self.input.beneficiaries_csv,
            &mut self.server.static_dir,
        ] {
            if let Some(p) = optional {
                join(p);
            }
        }
    }
}
