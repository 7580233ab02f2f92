use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;

/// Comma-separated dump file. Truncated on open; every row is flushed.
pub struct CsvDump {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl CsvDump {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)
            .with_context(|| format!("failed to create dump {}", path.display()))?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn write_row(&self, fields: &[&dyn Display]) -> Result<()> {
        let mut line = String::new();
        for (index, field) in fields.iter().enumerate() {
            if index > 0 {
                line.push(',');
            }
            line.push_str(&field.to_string());
        }
        line.push('\n');

        let mut writer = self.writer.lock();
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.flush())
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
