//! Pipeline configuration, loaded from TOML. Every field has a default that
//! matches the source books and the production layout.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ObservatoryError, Result};
use crate::facts::{Flow, Granularity};
use crate::metrics::MetricsConfig;
use crate::parser::LayoutConfig;
use crate::reconcile::ReconcileConfig;

/// Workbook path per (granularity, flow).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePaths {
    pub national_import: PathBuf,
    pub national_export: PathBuf,
    pub category_import: PathBuf,
    pub category_export: PathBuf,
}

impl Default for SourcePaths {
    fn default() -> Self {
        Self {
            national_import: PathBuf::from("data/cdro_F8.xlsx"),
            national_export: PathBuf::from("data/cdro_G6.xlsx"),
            category_import: PathBuf::from("data/cdro_F1.xlsx"),
            category_export: PathBuf::from("data/cdro_G1.xlsx"),
        }
    }
}

impl SourcePaths {
    pub fn path(&self, granularity: Granularity, flow: Flow) -> &Path {
        match (granularity, flow) {
            (Granularity::National, Flow::Import) => &self.national_import,
            (Granularity::National, Flow::Export) => &self.national_export,
            (Granularity::Category, Flow::Import) => &self.category_import,
            (Granularity::Category, Flow::Export) => &self.category_export,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store_dir: PathBuf,
    /// Parquet mirror directory. Unset disables the mirror.
    pub mirror_dir: Option<PathBuf>,
    pub sources: SourcePaths,
    pub layout: LayoutConfig,
    pub reconcile: ReconcileConfig,
    pub metrics: MetricsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("store"),
            mirror_dir: Some(PathBuf::from("mirror")),
            sources: SourcePaths::default(),
            layout: LayoutConfig::default(),
            reconcile: ReconcileConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.reconcile;
        if !(r.tolerance_usd >= 0.0) || !(r.major_threshold_usd >= 0.0) {
            return Err(ObservatoryError::Config(
                "reconcile thresholds must be non-negative".into(),
            ));
        }
        if r.major_threshold_usd < r.tolerance_usd {
            return Err(ObservatoryError::Config(format!(
                "major_threshold_usd ({}) is below tolerance_usd ({})",
                r.major_threshold_usd, r.tolerance_usd
            )));
        }
        if self.metrics.base_year.is_some() != self.metrics.base_month.is_some() {
            return Err(ObservatoryError::Config(
                "metrics.base_year and metrics.base_month must be set together".into(),
            ));
        }
        if self.layout.min_name_len == 0 {
            return Err(ObservatoryError::Config(
                "layout.min_name_len must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
