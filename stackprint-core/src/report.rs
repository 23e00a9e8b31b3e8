// Result persistence

use serde::Serialize;
use stackprint_scanner::Fingerprint;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_OUTPUT_PATH: &str = "fingerprints.json";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown report format: {0}")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Text,
}

impl FromStr for ReportFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "text" | "txt" => Ok(ReportFormat::Text),
            _ => Err(ReportError::UnknownFormat(s.to_string())),
        }
    }
}

/// Tab-indented JSON array, one object per fingerprint.
pub fn generate_json_report(fingerprints: &[Fingerprint]) -> Result<String, ReportError> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    fingerprints.serialize(&mut serializer)?;
    // serde_json only ever emits UTF-8
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub fn save_report(content: &str, path: &Path) -> Result<(), ReportError> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Overwrite `path` with the JSON rendering of every fingerprint.
pub fn save_fingerprints(fingerprints: &[Fingerprint], path: &Path) -> Result<(), ReportError> {
    let content = generate_json_report(fingerprints)?;
    save_report(&content, path)?;
    info!(
        "Saved {} fingerprint(s) to {}",
        fingerprints.len(),
        path.display()
    );
    Ok(())
}
