//! Results directory management for cap-bench
//!
//! Automatically creates structured output directories containing:
//! - Probe/sweep CSV records
//! - Normalized-metric CSV records
//! - Configuration file copy
//! - Run metadata (JSON)
//!
//! Directory format: capb-{YYYYMMDD}-{HHMM}-{run_name}/

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::RESULTS_DIR_PREFIX;

/// Metadata about a benchmark run
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub run_name: String,
    pub config_path: Option<String>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_secs: Option<f64>,
    pub command_line: Vec<String>,
    pub hostname: String,
}

impl RunMetadata {
    pub fn new(run_name: String, config_path: Option<String>) -> Self {
        let version = env!("CARGO_PKG_VERSION").to_string();
        let start_time = Local::now().to_rfc3339();
        let hostname = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();
        let command_line = std::env::args().collect();

        Self {
            version,
            run_name,
            config_path,
            start_time,
            end_time: None,
            duration_secs: None,
            command_line,
            hostname,
        }
    }

    pub fn finalize(&mut self, duration_secs: f64) {
        self.end_time = Some(Local::now().to_rfc3339());
        self.duration_secs = Some(duration_secs);
    }
}

/// Results directory manager
pub struct ResultsDir {
    path: PathBuf,
    metadata: RunMetadata,
}

impl ResultsDir {
    /// Create a results directory with the standard naming convention.
    /// The run name comes from `custom_name` or the config filename stem.
    pub fn create(
        config_path: Option<&Path>,
        custom_name: Option<&str>,
        base_dir: &Path,
    ) -> Result<Self> {
        let run_name = if let Some(name) = custom_name {
            name.to_string()
        } else {
            config_path
                .and_then(|p| p.file_stem())
                .and_then(|s| s.to_str())
                .unwrap_or("run")
                .to_string()
        };

        let now = Local::now();
        let dir_name = format!(
            "{}-{}-{}",
            RESULTS_DIR_PREFIX,
            now.format("%Y%m%d-%H%M"),
            run_name
        );
        let dir_path = base_dir.join(&dir_name);

        fs::create_dir_all(&dir_path).with_context(|| {
            format!("Failed to create results directory: {}", dir_path.display())
        })?;

        if let Some(config) = config_path {
            let config_dest = dir_path.join("config.yaml");
            fs::copy(config, &config_dest)
                .with_context(|| "Failed to copy config to results directory".to_string())?;
        }

        let metadata = RunMetadata::new(
            run_name,
            config_path.map(|p| p.to_string_lossy().to_string()),
        );

        tracing::info!("Created results directory: {}", dir_path.display());

        Ok(Self {
            path: dir_path,
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write metadata to metadata.json
    pub fn write_metadata(&self) -> Result<()> {
        let metadata_path = self.path.join("metadata.json");
        let json = serde_json::to_string_pretty(&self.metadata)
            .context("Failed to serialize run metadata")?;
        fs::write(&metadata_path, json)
            .with_context(|| format!("Failed to write {}", metadata_path.display()))?;
        Ok(())
    }

    /// Record end time and duration, then persist metadata.
    pub fn finalize(&mut self, duration_secs: f64) -> Result<()> {
        self.metadata.finalize(duration_secs);
        self.write_metadata()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_finalize() {
        let base = tempfile::tempdir().unwrap();
        let mut dir = ResultsDir::create(None, Some("probe"), base.path()).unwrap();
        assert!(dir.path().is_dir());
        let name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("capb-"));
        assert!(name.ends_with("-probe"));

        dir.finalize(1.5).unwrap();
        let json = std::fs::read_to_string(dir.path().join("metadata.json")).unwrap();
        let meta: RunMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta.run_name, "probe");
        assert_eq!(meta.duration_secs, Some(1.5));
        assert!(meta.end_time.is_some());
    }
}
