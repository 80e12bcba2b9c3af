use std::collections::BTreeMap;
use std::fs;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

pub const DEFAULT_CONFIG_FILE: &str = "gff-harvest.json";
pub const DEFAULT_BASE_URL: &str = "https://ftp.ebi.ac.uk/pub/databases/RNAcentral/releases";
pub const DEFAULT_CONNECTION_ENV: &str = "PGDATABASE";
pub const TASK_ID_ENV: &str = "SLURM_ARRAY_TASK_ID";
pub const TASK_COUNT_ENV: &str = "SLURM_ARRAY_TASK_COUNT";

pub const DEFAULT_ORGANISM_QUERY: &str = "SELECT esp.taxid, rnc_taxonomy.name AS organism_name \
FROM ensembl_stable_prefixes esp \
JOIN rnc_taxonomy ON esp.taxid = rnc_taxonomy.id \
ORDER BY rnc_taxonomy.name";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub release_start: Option<u32>,
    #[serde(default)]
    pub release_end: Option<u32>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub organisms: OrganismSection,
    #[serde(default)]
    pub converter: ConverterSection,
    /// Database organism name (normalized) to archive organism name.
    #[serde(default)]
    pub name_overrides: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DownloadSection {
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_seconds: Option<u64>,
    #[serde(default)]
    pub wget: Option<String>,
    #[serde(default)]
    pub use_listing: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OrganismSection {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub connection_env: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub psql: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConverterSection {
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub append_path: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseRange {
    pub start: u32,
    pub end: u32,
}

impl ReleaseRange {
    pub fn new(start: u32, end: u32) -> Result<Self, HarvestError> {
        if start > end {
            return Err(HarvestError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn release_count(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, release: u32) -> bool {
        (self.start..=self.end).contains(&release)
    }

    pub fn iter(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }
}

impl FromStr for ReleaseRange {
    type Err = HarvestError;

    /// Accepts `START-END` or a single release.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim().parse::<u32>().map_err(|_| {
                HarvestError::InvalidConfig(format!("invalid release range {value:?}"))
            })
        };
        match value.split_once('-') {
            Some((start, end)) => Self::new(parse(start)?, parse(end)?),
            None => {
                let release = parse(value)?;
                Self::new(release, release)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    pub max_parallel: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub wget: String,
    pub use_listing: bool,
}

#[derive(Debug, Clone)]
pub enum OrganismSourceConfig {
    File(Utf8PathBuf),
    Psql {
        program: String,
        connection_env: String,
        query: String,
    },
}

#[derive(Debug, Clone)]
pub struct ConverterConfig {
    pub runtime: String,
    pub image: Option<String>,
    pub append_path: Option<String>,
    pub timeout: Duration,
    pub max_parallel: usize,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub releases: ReleaseRange,
    pub base_url: String,
    pub data_dir: Utf8PathBuf,
    pub state_dir: Utf8PathBuf,
    pub download: DownloadPolicy,
    pub organisms: OrganismSourceConfig,
    pub converter: ConverterConfig,
    pub name_overrides: BTreeMap<String, String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `gff-harvest.json` from the working directory. A
    /// missing default file falls back to built-in defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(HarvestError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let releases = ReleaseRange::new(
            config.release_start.unwrap_or(12),
            config.release_end.unwrap_or(25),
        )?;

        let download = DownloadPolicy {
            max_parallel: config.download.max_parallel.unwrap_or(5),
            timeout: Duration::from_secs(config.download.timeout_seconds.unwrap_or(300)),
            max_retries: config.download.max_retries.unwrap_or(3),
            retry_delay: Duration::from_secs(config.download.retry_delay_seconds.unwrap_or(5)),
            wget: config.download.wget.unwrap_or_else(|| "wget".to_string()),
            use_listing: config.download.use_listing.unwrap_or(true),
        };
        if download.max_parallel == 0 {
            return Err(HarvestError::InvalidConfig(
                "download.max_parallel must be at least 1".to_string(),
            ));
        }
        if download.max_retries == 0 {
            return Err(HarvestError::InvalidConfig(
                "download.max_retries must be at least 1".to_string(),
            ));
        }
        if download.timeout.is_zero() {
            return Err(HarvestError::InvalidConfig(
                "download.timeout_seconds must be positive".to_string(),
            ));
        }

        let organisms = match config.organisms.file {
            Some(file) => OrganismSourceConfig::File(Utf8PathBuf::from(file)),
            None => OrganismSourceConfig::Psql {
                program: config.organisms.psql.unwrap_or_else(|| "psql".to_string()),
                connection_env: config
                    .organisms
                    .connection_env
                    .unwrap_or_else(|| DEFAULT_CONNECTION_ENV.to_string()),
                query: config
                    .organisms
                    .query
                    .unwrap_or_else(|| DEFAULT_ORGANISM_QUERY.to_string()),
            },
        };

        let converter = ConverterConfig {
            runtime: config
                .converter
                .runtime
                .unwrap_or_else(|| "singularity".to_string()),
            image: config.converter.image,
            append_path: config.converter.append_path,
            timeout: Duration::from_secs(config.converter.timeout_seconds.unwrap_or(600)),
            max_parallel: config.converter.max_parallel.unwrap_or(4).max(1),
        };

        let base_url = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(ResolvedConfig {
            schema_version,
            releases,
            base_url,
            data_dir: Utf8PathBuf::from(config.data_dir.unwrap_or_else(|| "data".to_string())),
            state_dir: Utf8PathBuf::from(config.state_dir.unwrap_or_else(|| "logs".to_string())),
            download,
            organisms,
            converter,
            name_overrides: config.name_overrides,
        })
    }
}

/// Which array task this process is, as handed over by the batch scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSelection {
    pub task_index: usize,
    pub task_count: usize,
}

impl ShardSelection {
    /// Explicit values win over the scheduler environment. With neither, the
    /// run is a standalone single shard.
    pub fn resolve<F>(
        index: Option<usize>,
        count: Option<usize>,
        lookup: F,
    ) -> Result<Self, HarvestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let task_index = match index {
            Some(value) => Some(value),
            None => parse_env_usize(TASK_ID_ENV, lookup(TASK_ID_ENV))?,
        };
        let task_count = match count {
            Some(value) => Some(value),
            None => parse_env_usize(TASK_COUNT_ENV, lookup(TASK_COUNT_ENV))?,
        };

        let selection = Self {
            task_index: task_index.unwrap_or(0),
            task_count: task_count.unwrap_or(1),
        };
        if selection.task_count == 0 {
            return Err(HarvestError::InvalidConfig(
                "task count must be at least 1".to_string(),
            ));
        }
        Ok(selection)
    }

    pub fn from_env(index: Option<usize>, count: Option<usize>) -> Result<Self, HarvestError> {
        Self::resolve(index, count, |key| std::env::var(key).ok())
    }
}

fn parse_env_usize(key: &str, value: Option<String>) -> Result<Option<usize>, HarvestError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| HarvestError::InvalidConfig(format!("{key} is not an integer: {value:?}")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_match_pipeline_settings() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.releases, ReleaseRange { start: 12, end: 25 });
        assert_eq!(resolved.releases.release_count(), 14);
        assert_eq!(resolved.download.max_parallel, 5);
        assert_eq!(resolved.download.max_retries, 3);
        assert_eq!(resolved.download.timeout, Duration::from_secs(300));
        assert_eq!(resolved.download.retry_delay, Duration::from_secs(5));
        assert_eq!(resolved.base_url, DEFAULT_BASE_URL);
        assert_matches!(
            resolved.organisms,
            OrganismSourceConfig::Psql { ref connection_env, .. } if connection_env == "PGDATABASE"
        );
    }

    #[test]
    fn rejects_inverted_range() {
        let config = Config {
            release_start: Some(20),
            release_end: Some(12),
            ..Config::default()
        };
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, HarvestError::InvalidRange { start: 20, end: 12 });
        assert!(err.is_configuration());
    }

    #[test]
    fn parses_release_range_argument() {
        assert_eq!(
            "20-25".parse::<ReleaseRange>().unwrap(),
            ReleaseRange { start: 20, end: 25 }
        );
        assert_eq!(
            "18".parse::<ReleaseRange>().unwrap(),
            ReleaseRange { start: 18, end: 18 }
        );
        assert_matches!(
            "25-20".parse::<ReleaseRange>(),
            Err(HarvestError::InvalidRange { start: 25, end: 20 })
        );
        assert_matches!("x-3".parse::<ReleaseRange>(), Err(HarvestError::InvalidConfig(_)));
    }

    #[test]
    fn shard_selection_prefers_explicit_values() {
        let env = |key: &str| match key {
            TASK_ID_ENV => Some("3".to_string()),
            TASK_COUNT_ENV => Some("14".to_string()),
            _ => None,
        };
        let from_env = ShardSelection::resolve(None, None, env).unwrap();
        assert_eq!(from_env.task_index, 3);
        assert_eq!(from_env.task_count, 14);

        let explicit = ShardSelection::resolve(Some(1), Some(2), env).unwrap();
        assert_eq!(explicit.task_index, 1);
        assert_eq!(explicit.task_count, 2);

        let standalone = ShardSelection::resolve(None, None, |_| None).unwrap();
        assert_eq!(standalone.task_index, 0);
        assert_eq!(standalone.task_count, 1);
    }

    #[test]
    fn shard_selection_rejects_garbage() {
        let err = ShardSelection::resolve(None, None, |key| {
            (key == TASK_ID_ENV).then(|| "abc".to_string())
        })
        .unwrap_err();
        assert_matches!(err, HarvestError::InvalidConfig(_));
    }
}
