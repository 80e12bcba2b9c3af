use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::Builder;

use crate::config::ResolvedConfig;
use crate::domain::OrganismName;
use crate::error::HarvestError;

const SHARD_PREFIX: &str = "summary_shard_";

/// On-disk layout: downloaded data under `data_root`, run state (summaries)
/// under `state_root`.
#[derive(Debug, Clone)]
pub struct Store {
    data_root: Utf8PathBuf,
    state_root: Utf8PathBuf,
}

impl Store {
    pub fn new_with_paths(data_root: Utf8PathBuf, state_root: Utf8PathBuf) -> Self {
        Self {
            data_root,
            state_root,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new_with_paths(config.data_dir.clone(), config.state_dir.clone())
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn state_root(&self) -> &Utf8Path {
        &self.state_root
    }

    pub fn release_dir(&self, release: u32) -> Utf8PathBuf {
        self.data_root.join(format!("release_{release}"))
    }

    pub fn organism_dir(&self, release: u32, organism: &OrganismName) -> Utf8PathBuf {
        self.release_dir(release).join(organism.as_str())
    }

    pub fn compressed_path(&self, release: u32, organism: &OrganismName) -> Utf8PathBuf {
        self.organism_dir(release, organism)
            .join(format!("{organism}.gff3.gz"))
    }

    pub fn decompressed_path(&self, release: u32, organism: &OrganismName) -> Utf8PathBuf {
        self.organism_dir(release, organism)
            .join(format!("{organism}.gff3"))
    }

    pub fn shards_dir(&self) -> Utf8PathBuf {
        self.state_root.join("shards")
    }

    pub fn shard_summary_path(&self, shard_id: usize) -> Utf8PathBuf {
        self.shards_dir()
            .join(format!("{SHARD_PREFIX}{shard_id}.json"))
    }

    pub fn merged_summary_path(&self) -> Utf8PathBuf {
        self.state_root.join("merged_summary.json")
    }

    pub fn retry_summary_path(&self) -> Utf8PathBuf {
        self.state_root.join("retry_summary.json")
    }

    pub fn convert_summary_path(&self, shard_id: usize) -> Utf8PathBuf {
        self.state_root
            .join("convert")
            .join(format!("convert_shard_{shard_id}.json"))
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), HarvestError> {
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("create {path}: {err}")))
    }

    /// Pretty JSON, written to a temp file beside `path` and renamed over it.
    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), HarvestError> {
        let mut content = serde_json::to_vec_pretty(value)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        content.push(b'\n');
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        Self::ensure_dir(parent)?;
        let mut temp = Builder::new()
            .prefix(".gff-harvest")
            .suffix(".tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("persist {path}: {err}")))?;
        Ok(())
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, HarvestError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_str(&content).map_err(|err| HarvestError::SummaryParse {
            path: path.to_string(),
            message: err.to_string(),
        })
    }

    /// Shard summary files present on disk, ordered by shard id.
    pub fn list_shard_summaries(&self) -> Result<Vec<(usize, Utf8PathBuf)>, HarvestError> {
        let dir = self.shards_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("read {dir}: {err}")))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(shard_id) = parse_shard_file_name(&name) else {
                continue;
            };
            found.push((shard_id, dir.join(name)));
        }
        found.sort();
        Ok(found)
    }
}

fn parse_shard_file_name(name: &str) -> Option<usize> {
    name.strip_prefix(SHARD_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}
