use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use strata_core::{ARC_ACTIVE_DAYS, ARC_GAP_DAYS, PHASE_ACTIVE_DAYS, PHASE_GAP_DAYS};
use strata_inference::InferenceConfig;
use strata_jobs::{DrainConfig, JobConfig};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StrataConfig {
    pub db_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub jobs: JobsSection,
    pub drain: DrainSection,
    pub inference: InferenceSection,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobsSection {
    pub debounce_window_secs: i64,
    pub max_error_chars: usize,
    pub stale_after_secs: i64,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            debounce_window_secs: 60,
            max_error_chars: 1_000,
            stale_after_secs: 900,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DrainSection {
    pub batch_size: usize,
    pub lock_path: Option<PathBuf>,
}

impl Default for DrainSection {
    fn default() -> Self {
        Self {
            batch_size: 25,
            lock_path: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceSection {
    pub arc_gap_days: i64,
    pub arc_active_days: i64,
    pub phase_gap_days: i64,
    pub phase_active_days: i64,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            arc_gap_days: ARC_GAP_DAYS,
            arc_active_days: ARC_ACTIVE_DAYS,
            phase_gap_days: PHASE_GAP_DAYS,
            phase_active_days: PHASE_ACTIVE_DAYS,
        }
    }
}

impl StrataConfig {
    pub fn job_config(&self) -> JobConfig {
        JobConfig {
            debounce_window: Duration::seconds(self.jobs.debounce_window_secs.max(0)),
            max_error_chars: self.jobs.max_error_chars,
            stale_after: Duration::seconds(self.jobs.stale_after_secs.max(1)),
        }
    }

    pub fn inference_config(&self) -> InferenceConfig {
        InferenceConfig {
            arc_gap: Duration::days(self.inference.arc_gap_days),
            arc_active_window: Duration::days(self.inference.arc_active_days),
            phase_gap: Duration::days(self.inference.phase_gap_days),
            phase_active_window: Duration::days(self.inference.phase_active_days),
        }
    }

    pub fn drain_config(&self) -> DrainConfig {
        DrainConfig {
            batch_size: self.drain.batch_size,
            lock_path: self.drain.lock_path.clone(),
            job: self.job_config(),
            inference: self.inference_config(),
        }
    }

    /// Explicit flag, then the config file, then the platform data dir.
    pub fn resolve_db_path(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.db_path.clone())
            .unwrap_or_else(default_db_path)
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("strata")
        .join("config.toml")
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("strata")
        .join("strata.db")
}

/// Missing file means defaults; a malformed file is an error.
pub fn load_config(path: &Path) -> Result<StrataConfig> {
    if !path.exists() {
        return Ok(StrataConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config, StrataConfig::default());
        assert_eq!(config.job_config(), JobConfig::default());
        assert_eq!(config.inference_config(), InferenceConfig::default());
        assert_eq!(config.drain_config().batch_size, 25);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "db_path = \"/var/lib/strata/strata.db\"\n\n[jobs]\ndebounce_window_secs = 5\n\n[drain]\nlock_path = \"/run/strata/drain.lock\""
        )
        .expect("write config");

        let config = load_config(file.path()).expect("load");
        assert_eq!(config.job_config().debounce_window, Duration::seconds(5));
        assert_eq!(config.job_config().max_error_chars, 1_000);
        assert_eq!(
            config.drain_config().lock_path,
            Some(PathBuf::from("/run/strata/drain.lock"))
        );
        assert_eq!(
            config.resolve_db_path(None),
            PathBuf::from("/var/lib/strata/strata.db")
        );
        assert_eq!(
            config.resolve_db_path(Some(PathBuf::from("override.db"))),
            PathBuf::from("override.db")
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "[jobs\nbroken").expect("write config");
        assert!(load_config(file.path()).is_err());
    }
}
