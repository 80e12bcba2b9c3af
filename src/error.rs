use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid release range: start {start} is after end {end}")]
    InvalidRange { start: u32, end: u32 },

    #[error("organism list is empty")]
    EmptyOrganismList,

    #[error("invalid organism name: {0:?}")]
    InvalidOrganismName(String),

    #[error("environment variable {0} is not set")]
    #[diagnostic(help("export the connection string before running, e.g. `export {0}=...`"))]
    MissingEnv(String),

    #[error("shard index {index} is out of range for {count} shards")]
    ShardOutOfRange { index: usize, count: usize },

    #[error("{count} shards requested but the release range holds {releases} releases")]
    #[diagnostic(help("shards are partitioned by release: submit one array task per release"))]
    ShardMismatch { count: usize, releases: usize },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("organism query failed: {0}")]
    OrganismQuery(String),

    #[error("release listing request failed: {0}")]
    ListingHttp(String),

    #[error("release listing returned status {status}: {message}")]
    ListingStatus { status: u16, message: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("failed to run {program}: {message}")]
    CommandSpawn { program: String, message: String },

    #[error("failed to decompress {path}: {message}")]
    Decompression { path: String, message: String },

    #[error("failed to parse summary {path}: {message}")]
    SummaryParse { path: String, message: String },

    #[error("merge incomplete: found {found} of {expected} shard summaries")]
    #[diagnostic(help(
        "the partial merged summary was written and flagged incomplete; rerun the missing shards"
    ))]
    MergeIncomplete { found: usize, expected: usize },

    #[error("no merged summary found at {0}")]
    #[diagnostic(help("run `gff-harvest merge` first"))]
    MissingMergedSummary(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl HarvestError {
    /// Pre-flight failures: nothing was attempted and rerunning unchanged will fail again.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            HarvestError::InvalidConfig(_)
                | HarvestError::InvalidRange { .. }
                | HarvestError::EmptyOrganismList
                | HarvestError::InvalidOrganismName(_)
                | HarvestError::MissingEnv(_)
                | HarvestError::ShardOutOfRange { .. }
                | HarvestError::ShardMismatch { .. }
                | HarvestError::ConfigRead(_)
                | HarvestError::ConfigParse(_)
        )
    }
}
