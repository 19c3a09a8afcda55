use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObservatoryError {
    #[error("Table not found: {0}")]
    TableMissing(String),

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("Source workbook(s) not found: {}", display_paths(.0))]
    SourceMissing(Vec<PathBuf>),

    #[error("Cannot open workbook {}: {message}", .path.display())]
    Workbook { path: PathBuf, message: String },

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config: {0}")]
    Config(String),

    #[error("InvalidData: {0}")]
    InvalidData(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<toml::de::Error> for ObservatoryError {
    fn from(err: toml::de::Error) -> Self {
        ObservatoryError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ObservatoryError>;
