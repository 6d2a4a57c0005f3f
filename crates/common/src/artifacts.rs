//! Artifact directory layout

use std::path::{Path, PathBuf};

use crate::config::ArtifactsConfig;
use crate::error::Result;

const SUBDIRS: [&str; 5] = ["screenshots", "videos", "traces", "logs", "reports"];

/// Where a run leaves its screenshots, traces, logs and reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &ArtifactsConfig) -> Self {
        Self::new(&config.path)
    }

    /// Create the root and every subdirectory
    pub fn prepare(&self) -> Result<()> {
        for dir in SUBDIRS {
            std::fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn screenshots(&self) -> PathBuf {
        self.root.join("screenshots")
    }

    pub fn videos(&self) -> PathBuf {
        self.root.join("videos")
    }

    pub fn traces(&self) -> PathBuf {
        self.root.join("traces")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn reports(&self) -> PathBuf {
        self.root.join("reports")
    }
}
