use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex"));

/// Organism name in the archive's directory convention: lowercase, runs of
/// anything outside `[a-z0-9]` collapsed to `_`, no leading/trailing `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganismName(String);

impl OrganismName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrganismName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrganismName {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lowered = value.trim().to_lowercase();
        let normalized = NON_ALNUM.replace_all(&lowered, "_");
        let normalized = normalized.trim_matches('_');
        if normalized.is_empty() {
            return Err(HarvestError::InvalidOrganismName(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// One row of the organism source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organism {
    pub name: String,
    #[serde(default)]
    pub taxid: Option<u32>,
}

impl Organism {
    pub fn new(name: impl Into<String>, taxid: Option<u32>) -> Self {
        Self {
            name: name.into(),
            taxid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub organism_name: OrganismName,
    pub display_name: String,
    pub taxid: Option<u32>,
    pub release: u32,
}

impl WorkUnit {
    pub fn key(&self) -> String {
        unit_key(self.release, &self.organism_name)
    }
}

pub fn unit_key(release: u32, organism: &OrganismName) -> String {
    format!("{release}/{organism}")
}

/// Splits a `release/organism` key back into its parts.
pub fn parse_unit_key(key: &str) -> Option<(u32, OrganismName)> {
    let (release, organism) = key.split_once('/')?;
    let release = release.parse().ok()?;
    let organism = organism.parse().ok()?;
    Some((release, organism))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Success,
    NotFound,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Success => "success",
            DownloadStatus::NotFound => "not_found",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecompressionState {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub status: DownloadStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decompression: Option<DecompressionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decompression_error: Option<String>,
}

impl DownloadOutcome {
    pub fn success(attempts: u32, bytes_written: u64, url: Option<String>) -> Self {
        Self {
            status: DownloadStatus::Success,
            attempts: attempts.max(1),
            bytes_written: Some(bytes_written),
            error_message: None,
            timestamp: Utc::now(),
            url,
            resumed: false,
            decompression: None,
            decompression_error: None,
        }
    }

    pub fn not_found(attempts: u32, message: impl Into<String>, url: Option<String>) -> Self {
        Self::terminal(DownloadStatus::NotFound, attempts, message.into(), url)
    }

    pub fn failed(attempts: u32, message: impl Into<String>, url: Option<String>) -> Self {
        Self::terminal(DownloadStatus::Failed, attempts, message.into(), url)
    }

    fn terminal(status: DownloadStatus, attempts: u32, message: String, url: Option<String>) -> Self {
        Self {
            status,
            attempts: attempts.max(1),
            bytes_written: None,
            error_message: Some(message),
            timestamp: Utc::now(),
            url,
            resumed: false,
            decompression: None,
            decompression_error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DownloadStatus::Success
    }

    pub fn decompression_failed(&self) -> bool {
        self.decompression == Some(DecompressionState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn normalizes_organism_names() {
        let name: OrganismName = "Homo sapiens".parse().unwrap();
        assert_eq!(name.as_str(), "homo_sapiens");

        let name: OrganismName = "Escherichia coli K-12".parse().unwrap();
        assert_eq!(name.as_str(), "escherichia_coli_k_12");

        let name: OrganismName = "  (Mus) musculus  ".parse().unwrap();
        assert_eq!(name.as_str(), "mus_musculus");
    }

    #[test]
    fn rejects_names_without_alphanumerics() {
        let err = " -- ".parse::<OrganismName>().unwrap_err();
        assert_matches!(err, HarvestError::InvalidOrganismName(_));
    }

    #[test]
    fn unit_keys_round_trip() {
        let name: OrganismName = "mus_musculus".parse().unwrap();
        let key = unit_key(13, &name);
        assert_eq!(key, "13/mus_musculus");
        assert_eq!(parse_unit_key(&key), Some((13, name)));
        assert_eq!(parse_unit_key("nope"), None);
    }

    #[test]
    fn outcome_fields_follow_status() {
        let ok = DownloadOutcome::success(2, 10, None);
        assert!(ok.error_message.is_none());
        assert_eq!(ok.bytes_written, Some(10));

        let missing = DownloadOutcome::not_found(0, "absent", None);
        assert_eq!(missing.attempts, 1);
        assert!(missing.bytes_written.is_none());
        assert_eq!(missing.error_message.as_deref(), Some("absent"));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&DownloadStatus::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
    }
}
