//! Table store: named tables, each written as a full replace.
//!
//! `FileStore` keeps one Arrow IPC file per table and mirrors every write to
//! Parquet for external consumers. `MemoryStore` keeps frames in a map.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{debug, info};

use crate::error::Result;

pub trait TableStore {
    /// Replace `name` with `frame`. Never appends.
    fn write_table(&mut self, name: &str, frame: &mut DataFrame) -> Result<()>;

    /// `None` when the table has never been written.
    fn read_table(&self, name: &str) -> Result<Option<DataFrame>>;

    fn has_table(&self, name: &str) -> Result<bool>;
}

/// Directory-backed store.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    mirror: Option<PathBuf>,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, mirror: None })
    }

    /// Also write every table as `<mirror>/<name>.parquet`.
    pub fn with_parquet_mirror(mut self, mirror: impl Into<PathBuf>) -> Result<Self> {
        let mirror = mirror.into();
        fs::create_dir_all(&mirror)?;
        self.mirror = Some(mirror);
        Ok(self)
    }

    pub fn table_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.ipc"))
    }

    pub fn mirror_path(&self, name: &str) -> Option<PathBuf> {
        self.mirror
            .as_ref()
            .map(|dir| dir.join(format!("{name}.parquet")))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write through a temporary sibling, then rename over the target.
fn replace_file(path: &Path, write: impl FnOnce(&mut File) -> Result<()>) -> Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        write(&mut file)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl TableStore for FileStore {
    fn write_table(&mut self, name: &str, frame: &mut DataFrame) -> Result<()> {
        let path = self.table_path(name);
        replace_file(&path, |file| {
            IpcWriter::new(file).finish(frame)?;
            Ok(())
        })?;
        debug!(table = name, path = %path.display(), rows = frame.height(), "table replaced");

        if let Some(mirror) = self.mirror_path(name) {
            replace_file(&mirror, |file| {
                ParquetWriter::new(file).finish(frame)?;
                Ok(())
            })?;
            debug!(table = name, path = %mirror.display(), "parquet mirror written");
        }

        info!(table = name, rows = frame.height(), "table written");
        Ok(())
    }

    fn read_table(&self, name: &str) -> Result<Option<DataFrame>> {
        let path = self.table_path(name);
        if !path.is_file() {
            return Ok(None);
        }
        let file = File::open(&path)?;
        Ok(Some(IpcReader::new(file).finish()?))
    }

    fn has_table(&self, name: &str) -> Result<bool> {
        Ok(self.table_path(name).is_file())
    }
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: BTreeMap<String, DataFrame>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableStore for MemoryStore {
    fn write_table(&mut self, name: &str, frame: &mut DataFrame) -> Result<()> {
        self.tables.insert(name.to_string(), frame.clone());
        Ok(())
    }

    fn read_table(&self, name: &str) -> Result<Option<DataFrame>> {
        Ok(self.tables.get(name).cloned())
    }

    fn has_table(&self, name: &str) -> Result<bool> {
        Ok(self.tables.contains_key(name))
    }
}
