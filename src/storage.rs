// src/storage.rs - Telemetry runs and parameter presets on disk
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::motion::motor::{AxisId, ParamMap, ValidationError};
use crate::motion::registry::MotorSet;
use crate::telemetry::TelemetryRun;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid name '{0}'")]
    InvalidName(String),
}

/// Named parameter targets, per axis with an optional fallback for every other axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub created: DateTime<Utc>,
    /// Applied to axes with no entry in `motors`.
    #[serde(default)]
    pub all: ParamMap,
    #[serde(default)]
    pub motors: BTreeMap<AxisId, ParamMap>,
}

impl Preset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: Utc::now(),
            all: ParamMap::new(),
            motors: BTreeMap::new(),
        }
    }

    /// Capture the current targets of every motor in a set.
    pub fn from_set(name: impl Into<String>, set: &MotorSet) -> Self {
        let mut preset = Self::new(name);
        for motor in set.motors() {
            preset.motors.insert(motor.axis(), motor.write_params().clone());
        }
        preset
    }

    pub fn params_for(&self, axis: AxisId) -> Option<&ParamMap> {
        self.motors
            .get(&axis)
            .or((!self.all.is_empty()).then_some(&self.all))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for params in std::iter::once(&self.all).chain(self.motors.values()) {
            for (param, value) in params {
                param.validate(*value)?;
            }
        }
        Ok(())
    }
}

/// Header of a stored run, without its samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub interval: f64,
    pub duration: f64,
    pub completed: bool,
    pub sample_count: usize,
}

impl From<&TelemetryRun> for RunSummary {
    fn from(run: &TelemetryRun) -> Self {
        Self {
            id: run.id,
            timestamp: run.timestamp,
            interval: run.interval,
            duration: run.duration,
            completed: run.completed,
            sample_count: run.samples.len(),
        }
    }
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn save_run(&self, run: &TelemetryRun) -> Result<(), StoreError>;
    async fn load_run(&self, id: Uuid) -> Result<TelemetryRun, StoreError>;
    /// Oldest first.
    async fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError>;
}

#[async_trait]
pub trait PresetStore: Send + Sync {
    async fn save_preset(&self, preset: &Preset) -> Result<(), StoreError>;
    async fn load_preset(&self, name: &str) -> Result<Preset, StoreError>;
    async fn list_presets(&self) -> Result<Vec<String>, StoreError>;
}

/// Stores each run and preset as one JSON file:
///
/// ```text
/// <root>/runs/<timestamp>_<id>.json
/// <root>/presets/<name>.json
/// ```
#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn presets_dir(&self) -> PathBuf {
        self.root.join("presets")
    }

    fn preset_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' '));
        if !valid {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.presets_dir().join(format!("{}.json", name)))
    }

    async fn json_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl TelemetryStore for JsonStore {
    async fn save_run(&self, run: &TelemetryRun) -> Result<(), StoreError> {
        let dir = self.runs_dir();
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}_{}.json", run.timestamp.format("%Y%m%dT%H%M%S%.3f"), run.id));
        tracing::info!("Writing telemetry run {} to {}", run.id, path.display());
        fs::write(&path, serde_json::to_vec_pretty(run)?).await?;
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> Result<TelemetryRun, StoreError> {
        let suffix = format!("_{}.json", id);
        for path in Self::json_files(&self.runs_dir()).await? {
            if path.to_string_lossy().ends_with(&suffix) {
                let content = fs::read(&path).await?;
                return Ok(serde_json::from_slice(&content)?);
            }
        }
        Err(StoreError::NotFound(format!("telemetry run {}", id)))
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        let mut summaries = Vec::new();
        for path in Self::json_files(&self.runs_dir()).await? {
            let content = fs::read(&path).await?;
            let run: TelemetryRun = serde_json::from_slice(&content)?;
            summaries.push(RunSummary::from(&run));
        }
        summaries.sort_by_key(|summary| summary.timestamp);
        Ok(summaries)
    }
}

#[async_trait]
impl PresetStore for JsonStore {
    async fn save_preset(&self, preset: &Preset) -> Result<(), StoreError> {
        let path = self.preset_path(&preset.name)?;
        fs::create_dir_all(self.presets_dir()).await?;
        tracing::info!("Saving preset '{}'", preset.name);
        fs::write(&path, serde_json::to_vec_pretty(preset)?).await?;
        Ok(())
    }

    async fn load_preset(&self, name: &str) -> Result<Preset, StoreError> {
        let path = self.preset_path(name)?;
        match fs::read(&path).await {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("preset '{}'", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_presets(&self) -> Result<Vec<String>, StoreError> {
        Ok(Self::json_files(&self.presets_dir())
            .await?
            .iter()
            .filter_map(|path| path.file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .collect())
    }
}
