use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::config::ConverterConfig;
use crate::error::HarvestError;

const APPEND_PATH_ENV: &str = "SINGULARITYENV_APPEND_PATH";
const GENES_SUFFIX: &str = ".genes.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvertStatus {
    Converted,
    Skipped,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOutcome {
    pub status: ConvertStatus,
    pub gff_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

/// One decompressed GFF3 file awaiting conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertTask {
    pub release: u32,
    pub organism: String,
    pub gff_file: Utf8PathBuf,
    pub taxid: Option<u32>,
}

impl ConvertTask {
    pub fn key(&self) -> String {
        format!("{}/{}", self.release, self.organism)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertStatistics {
    pub total: usize,
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertSummary {
    pub shard_id: usize,
    pub release: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: BTreeMap<String, ConvertOutcome>,
    pub statistics: ConvertStatistics,
}

impl ConvertSummary {
    pub fn new(
        shard_id: usize,
        release: u32,
        started_at: DateTime<Utc>,
        outcomes: BTreeMap<String, ConvertOutcome>,
    ) -> Self {
        let mut statistics = ConvertStatistics::default();
        for outcome in outcomes.values() {
            statistics.total += 1;
            match outcome.status {
                ConvertStatus::Converted => statistics.converted += 1,
                ConvertStatus::Skipped => statistics.skipped += 1,
                ConvertStatus::Failed => statistics.failed += 1,
                ConvertStatus::TimedOut => statistics.timed_out += 1,
            }
        }
        Self {
            shard_id,
            release,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            statistics,
        }
    }
}

/// Drives the containerized `rnac genes convert` over decompressed files.
pub struct Converter<C: CommandRunner> {
    runner: Arc<C>,
    config: ConverterConfig,
}

impl<C: CommandRunner> Converter<C> {
    pub fn new(runner: Arc<C>, config: ConverterConfig) -> Result<Self, HarvestError> {
        if config.image.as_deref().is_none_or(|image| image.trim().is_empty()) {
            return Err(HarvestError::InvalidConfig(
                "converter.image must be set to convert GFF files".to_string(),
            ));
        }
        Ok(Self { runner, config })
    }

    pub fn max_parallel(&self) -> usize {
        self.config.max_parallel
    }

    pub fn convert(&self, task: &ConvertTask) -> ConvertOutcome {
        let outcome = |status, reason: Option<String>, exit_code| ConvertOutcome {
            status,
            gff_file: task.gff_file.to_string(),
            taxid: task.taxid,
            reason,
            exit_code,
            timestamp: Utc::now(),
        };

        let Some(taxid) = task.taxid else {
            warn!(organism = %task.organism, "no taxid, skipping conversion");
            return outcome(ConvertStatus::Skipped, Some("no_taxid".to_string()), None);
        };
        let Some(dir) = task.gff_file.parent() else {
            return outcome(
                ConvertStatus::Failed,
                Some("gff file has no parent directory".to_string()),
                None,
            );
        };
        if has_genes_output(dir) {
            info!(gff = %task.gff_file, "genes output exists, skipping");
            return outcome(
                ConvertStatus::Skipped,
                Some("already_processed".to_string()),
                None,
            );
        }

        let spec = self.command(task, dir, taxid);
        debug!(command = %spec.display(), cwd = %dir, "running converter");
        match self.runner.execute(&spec, self.config.timeout) {
            Ok(output) if output.timed_out => {
                warn!(gff = %task.gff_file, "conversion timed out");
                outcome(ConvertStatus::TimedOut, None, None)
            }
            Ok(output) if output.success() => {
                info!(gff = %task.gff_file, taxid, "converted");
                outcome(ConvertStatus::Converted, None, Some(0))
            }
            Ok(output) => {
                let stderr = output.stderr.trim().to_string();
                warn!(gff = %task.gff_file, code = ?output.exit_code, "conversion failed");
                outcome(
                    ConvertStatus::Failed,
                    (!stderr.is_empty()).then_some(stderr),
                    output.exit_code,
                )
            }
            Err(err) => {
                warn!(gff = %task.gff_file, error = %err, "could not run converter");
                outcome(ConvertStatus::Failed, Some(err.to_string()), None)
            }
        }
    }

    fn command(&self, task: &ConvertTask, dir: &Utf8Path, taxid: u32) -> CommandSpec {
        let file_name = task.gff_file.file_name().unwrap_or(task.gff_file.as_str());
        let mut spec = CommandSpec::new(&self.config.runtime)
            .arg("exec")
            .args(self.config.image.iter().cloned())
            .args(["rnac", "genes", "convert", "--gff_file", file_name])
            .arg("--taxid")
            .arg(taxid.to_string())
            .current_dir(dir.as_std_path());
        if let Some(path) = &self.config.append_path {
            spec = spec.env(APPEND_PATH_ENV, path);
        }
        spec
    }
}

fn has_genes_output(dir: &Utf8Path) -> bool {
    fs::read_dir(dir.as_std_path())
        .map(|entries| {
            entries.filter_map(Result::ok).any(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(GENES_SUFFIX))
            })
        })
        .unwrap_or(false)
}

/// Decompressed `*.gff3` files under `release_dir/<organism>/`, sorted.
pub fn find_gff_files(release_dir: &Utf8Path) -> Result<Vec<(String, Utf8PathBuf)>, HarvestError> {
    if !release_dir.as_std_path().is_dir() {
        return Ok(Vec::new());
    }
    let io_err = |err: std::io::Error| HarvestError::Filesystem(format!("{release_dir}: {err}"));
    let mut found = Vec::new();
    for organism in fs::read_dir(release_dir.as_std_path()).map_err(io_err)? {
        let organism = organism.map_err(io_err)?;
        let Some(organism_name) = organism.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !organism.path().is_dir() {
            continue;
        }
        let organism_dir = release_dir.join(&organism_name);
        for file in fs::read_dir(organism_dir.as_std_path()).map_err(io_err)? {
            let file = file.map_err(io_err)?;
            let Some(file_name) = file.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if file_name.ends_with(".gff3") && !file_name.starts_with('.') {
                found.push((organism_name.clone(), organism_dir.join(file_name)));
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::command::CommandOutput;

    #[derive(Default)]
    struct FakeRuntime {
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl CommandRunner for FakeRuntime {
        fn execute(
            &self,
            spec: &CommandSpec,
            _timeout: Duration,
        ) -> Result<CommandOutput, HarvestError> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok(CommandOutput {
                exit_code: Some(0),
                ..CommandOutput::default()
            })
        }
    }

    fn config() -> ConverterConfig {
        ConverterConfig {
            runtime: "singularity".to_string(),
            image: Some("/images/rnac.sif".to_string()),
            append_path: Some("/opt/bin".to_string()),
            timeout: Duration::from_secs(600),
            max_parallel: 2,
        }
    }

    fn task(temp: &tempfile::TempDir, taxid: Option<u32>) -> ConvertTask {
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let dir = root.join("release_12/homo_sapiens");
        fs::create_dir_all(&dir).unwrap();
        let gff_file = dir.join("homo_sapiens.gff3");
        fs::write(&gff_file, "##gff-version 3\n").unwrap();
        ConvertTask {
            release: 12,
            organism: "homo_sapiens".to_string(),
            gff_file,
            taxid,
        }
    }

    #[test]
    fn requires_an_image() {
        let mut config = config();
        config.image = None;
        assert!(Converter::new(Arc::new(FakeRuntime::default()), config).is_err());
    }

    #[test]
    fn runs_converter_in_organism_dir() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let converter = Converter::new(runtime.clone(), config()).unwrap();
        let task = task(&temp, Some(9606));

        let outcome = converter.convert(&task);
        assert_eq!(outcome.status, ConvertStatus::Converted);

        let calls = runtime.calls.lock().unwrap();
        assert_eq!(
            calls[0].args,
            vec![
                "exec",
                "/images/rnac.sif",
                "rnac",
                "genes",
                "convert",
                "--gff_file",
                "homo_sapiens.gff3",
                "--taxid",
                "9606"
            ]
        );
        assert_eq!(
            calls[0].cwd.as_deref(),
            task.gff_file.parent().map(Utf8Path::as_std_path)
        );
        assert_eq!(
            calls[0].env,
            vec![(APPEND_PATH_ENV.to_string(), "/opt/bin".to_string())]
        );
    }

    #[test]
    fn skips_without_taxid_or_with_existing_output() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let converter = Converter::new(runtime.clone(), config()).unwrap();

        let missing_taxid = converter.convert(&task(&temp, None));
        assert_eq!(missing_taxid.status, ConvertStatus::Skipped);
        assert_eq!(missing_taxid.reason.as_deref(), Some("no_taxid"));

        let task = task(&temp, Some(9606));
        fs::write(
            task.gff_file.parent().unwrap().join("homo_sapiens.genes.json"),
            "[]",
        )
        .unwrap();
        let done = converter.convert(&task);
        assert_eq!(done.reason.as_deref(), Some("already_processed"));
        assert!(runtime.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn finds_decompressed_files_only() {
        let temp = tempfile::tempdir().unwrap();
        let task = task(&temp, None);
        let dir = task.gff_file.parent().unwrap();
        fs::write(dir.join("homo_sapiens.gff3.gz"), b"gz").unwrap();

        let found = find_gff_files(dir.parent().unwrap()).unwrap();
        assert_eq!(found, vec![("homo_sapiens".to_string(), task.gff_file)]);
    }
}
