//! Trigger catalog file read, parse, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use chime_core::types::{CronTriggerDefinition, TriggerCatalog};

/// On-disk shape of the trigger catalog.
#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    cron_triggers: Vec<CronTriggerDefinition>,
}

/// A catalog validation finding with trigger path and message.
#[derive(Debug, Error)]
#[error("catalog error at '{path}': {message}")]
pub struct CatalogValidationError {
    pub path: String,
    pub message: String,
}

/// All errors and warnings found in one validation pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<CatalogValidationError>,
    pub warnings: Vec<CatalogValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(CatalogValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(CatalogValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Load and parse the trigger catalog from disk.
///
/// Returns an empty catalog if the file doesn't exist, so an engine can be
/// brought up before any triggers are defined.
pub async fn load_catalog(path: &Path) -> Result<TriggerCatalog> {
    if !path.exists() {
        warn!(path = %path.display(), "Catalog file does not exist; starting with no triggers");
        return Ok(TriggerCatalog::default());
    }

    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;

    let catalog = parse_catalog(&raw)
        .with_context(|| format!("Failed to load catalog at: {}", path.display()))?;

    info!(
        path = %path.display(),
        triggers = catalog.cron_triggers.len(),
        "Loaded trigger catalog"
    );
    Ok(catalog)
}

/// Parse catalog YAML, validate it, and build the name-keyed snapshot.
pub fn parse_catalog(raw: &str) -> Result<TriggerCatalog> {
    let file: CatalogFile = serde_yaml::from_str(raw).context("Failed to parse catalog YAML")?;

    let report = validate_definitions(&file.cron_triggers);
    for warning in &report.warnings {
        warn!(path = %warning.path, message = %warning.message, "Catalog warning");
    }
    if !report.is_valid() {
        let joined = report
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        bail!("invalid trigger catalog: {joined}");
    }

    Ok(TriggerCatalog::new(file.cron_triggers))
}

/// Structural validation of trigger definitions.
///
/// Cron expression syntax is checked by the scheduler when it first parses a
/// definition; here we catch what would corrupt the name-keyed snapshot.
pub fn validate_definitions(definitions: &[CronTriggerDefinition]) -> ValidationReport {
    let mut report = ValidationReport::default();

    if definitions.is_empty() {
        report.warn("cron_triggers", "No triggers defined; generator will idle");
    }

    let mut seen = std::collections::HashSet::new();
    for (i, def) in definitions.iter().enumerate() {
        let path = if def.name.is_empty() {
            format!("cron_triggers[{i}]")
        } else {
            format!("cron_triggers.{}", def.name)
        };

        if def.name.trim().is_empty() {
            report.error(&path, "trigger name must not be empty");
        } else if !seen.insert(def.name.clone()) {
            report.error(&path, "duplicate trigger name");
        }

        if def.schedule.trim().is_empty() {
            report.error(&path, "schedule must not be empty");
        }

        if def.retry_conf.num_retries < 0 {
            report.error(&path, "num_retries must be non-negative");
        }
    }

    report
}
