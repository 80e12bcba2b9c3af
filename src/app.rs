use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::CommandRunner;
use crate::config::{ResolvedConfig, ShardSelection};
use crate::convert::{
    ConvertOutcome, ConvertStatus, ConvertSummary, ConvertTask, Converter, find_gff_files,
};
use crate::decompress::Decompressor;
use crate::domain::{
    DecompressionState, DownloadOutcome, DownloadStatus, Organism, OrganismName, WorkUnit,
};
use crate::download::Downloader;
use crate::error::HarvestError;
use crate::listing::{ListingClient, ReleaseListing};
use crate::plan::{assign_shard, enumerate, shard_release};
use crate::pool::run_pool;
use crate::report::{DataDirStatus, scan_data_dir};
use crate::resolve::{Resolution, Resolver};
use crate::store::Store;
use crate::summary::{GlobalSummary, ShardSummary, Statistics, merge};

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Fetch,
    Retry,
    Convert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
    pub progress: Option<Progress>,
    pub status: Option<DownloadStatus>,
}

impl ProgressEvent {
    pub fn phase(phase: &str, detail: impl AsRef<str>) -> Self {
        Self {
            message: format!("phase={phase}; {}", detail.as_ref()),
            elapsed: None,
            progress: None,
            status: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedShard {
    pub shard_id: usize,
    pub release: u32,
    pub units: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanResult {
    pub release_start: u32,
    pub release_end: u32,
    pub organisms: usize,
    pub total_units: usize,
    pub shards: Vec<PlannedShard>,
    /// Unit keys of the selected shard, when one was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub shard_id: usize,
    pub release: u32,
    pub summary_path: String,
    pub statistics: Statistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub summary_path: String,
    pub shards_found: usize,
    pub expected_shards: usize,
    pub complete: bool,
    pub statistics: Statistics,
}

#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub include_not_found: bool,
    pub list_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub previous_status: DownloadStatus,
    pub final_status: DownloadStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub recovered: usize,
    pub results: BTreeMap<String, RetryRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryResult {
    pub candidates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RetrySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertResult {
    pub summary_path: String,
    pub summary: ConvertSummary,
}

/// What the release directory index says for one release.
enum ReleaseIndex {
    /// Listing is disabled; default file names are used.
    Unused,
    Listed(ReleaseListing),
    /// The index could not be fetched. Units of the release are failed.
    Unavailable(String),
}

impl ReleaseIndex {
    fn listing(&self) -> Option<&ReleaseListing> {
        match self {
            ReleaseIndex::Listed(listing) => Some(listing),
            _ => None,
        }
    }
}

pub struct App<C: CommandRunner, L: ListingClient> {
    config: ResolvedConfig,
    store: Store,
    runner: Arc<C>,
    listing: L,
}

impl<C: CommandRunner, L: ListingClient> App<C, L> {
    pub fn new(config: ResolvedConfig, runner: Arc<C>, listing: L) -> Self {
        let store = Store::from_config(&config);
        Self {
            config,
            store,
            runner,
            listing,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn plan(
        &self,
        organisms: &[Organism],
        selection: Option<ShardSelection>,
    ) -> Result<PlanResult, HarvestError> {
        let releases = self.config.releases;
        let units = enumerate(organisms, releases)?;
        let shards = releases
            .iter()
            .enumerate()
            .map(|(shard_id, release)| PlannedShard {
                shard_id,
                release,
                units: units.iter().filter(|unit| unit.release == release).count(),
            })
            .collect();
        let selected = match selection {
            Some(selection) => Some(
                assign_shard(selection, releases, &units)?
                    .iter()
                    .map(WorkUnit::key)
                    .collect(),
            ),
            None => None,
        };
        Ok(PlanResult {
            release_start: releases.start,
            release_end: releases.end,
            organisms: units.len() / releases.release_count(),
            total_units: units.len(),
            shards,
            selected,
        })
    }

    /// Downloads and decompresses one shard's units, then writes its summary.
    pub fn fetch(
        &self,
        organisms: Vec<Organism>,
        selection: ShardSelection,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, HarvestError> {
        let started = Instant::now();
        let releases = self.config.releases;
        let release = shard_release(selection, releases)?;
        let all_units = enumerate(&organisms, releases)?;
        let units = assign_shard(selection, releases, &all_units)?;
        info!(
            shard = selection.task_index,
            release,
            units = units.len(),
            "starting shard"
        );
        sink.event(ProgressEvent::phase(
            "Plan",
            format!("shard {} owns release {release}: {} units", selection.task_index, units.len()),
        ));

        let mut summary = ShardSummary::new(
            selection.task_index,
            selection.task_count,
            vec![release],
            organisms,
        );

        let index = self.release_index(release, sink);
        let outcomes = self.run_units(&units, |_| &index, sink);
        for (unit, outcome) in units.iter().zip(outcomes) {
            summary.record(unit.key(), outcome);
        }
        summary.finish();

        let path = self.store.shard_summary_path(selection.task_index);
        Store::write_json_atomic(&path, &summary)?;
        info!(
            shard = selection.task_index,
            success = summary.statistics.success,
            not_found = summary.statistics.not_found,
            failed = summary.statistics.failed,
            path = %path,
            "shard finished"
        );
        sink.event(ProgressEvent {
            message: format!("phase=Store; wrote {path}"),
            elapsed: Some(started.elapsed()),
            progress: None,
            status: None,
        });

        Ok(FetchResult {
            shard_id: selection.task_index,
            release,
            summary_path: path.to_string(),
            statistics: summary.statistics,
        })
    }

    /// Runs every release's shard in turn in this process. Each shard writes
    /// its own summary, so `merge` reads them as it would after an array job.
    pub fn fetch_all(
        &self,
        organisms: Vec<Organism>,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<FetchResult>, HarvestError> {
        let task_count = self.config.releases.release_count();
        info!(shards = task_count, "fetching all releases sequentially");
        (0..task_count)
            .map(|task_index| {
                let selection = ShardSelection {
                    task_index,
                    task_count,
                };
                self.fetch(organisms.clone(), selection, sink)
            })
            .collect()
    }

    /// Merges every shard summary on disk into the global summary. The merged
    /// file is written even when shards are missing; that case then returns
    /// [`HarvestError::MergeIncomplete`].
    pub fn merge(&self, expected_shards: Option<usize>) -> Result<MergeResult, HarvestError> {
        self.merge_with_organisms(expected_shards, &[])
    }

    /// Like [`App::merge`], with `organisms` added to the expected work set so
    /// units of shards that never wrote a summary are listed as missing.
    pub fn merge_with_organisms(
        &self,
        expected_shards: Option<usize>,
        organisms: &[Organism],
    ) -> Result<MergeResult, HarvestError> {
        let releases = self.config.releases;
        let expected_shards = expected_shards.unwrap_or_else(|| releases.release_count());

        let mut summaries = Vec::new();
        for (shard_id, path) in self.store.list_shard_summaries()? {
            let summary: ShardSummary = Store::read_json(&path)?;
            if summary.shard_id != shard_id {
                warn!(%path, recorded = summary.shard_id, "shard id differs from file name");
            }
            summaries.push(summary);
        }
        info!(found = summaries.len(), expected = expected_shards, "merging shard summaries");

        let merged = merge(&summaries, releases, expected_shards, organisms);
        let path = self.store.merged_summary_path();
        Store::write_json_atomic(&path, &merged)?;

        if !merged.complete {
            warn!(
                found = merged.shards.len(),
                expected = expected_shards,
                missing_units = merged.missing_shard_data.len(),
                "merged summary is incomplete"
            );
            return Err(HarvestError::MergeIncomplete {
                found: merged.shards.len(),
                expected: expected_shards,
            });
        }

        Ok(MergeResult {
            summary_path: path.to_string(),
            shards_found: merged.shards.len(),
            expected_shards,
            complete: merged.complete,
            statistics: merged.statistics,
        })
    }

    pub fn load_merged(&self) -> Result<GlobalSummary, HarvestError> {
        let path = self.store.merged_summary_path();
        if !path.as_std_path().exists() {
            return Err(HarvestError::MissingMergedSummary(path.to_string()));
        }
        Store::read_json(&path)
    }

    /// Re-attempts failed units of the merged summary. Each new outcome
    /// replaces the recorded one.
    pub fn retry(
        &self,
        options: RetryOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RetryResult, HarvestError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut merged = self.load_merged()?;

        let mut previous = HashMap::new();
        let mut units = Vec::new();
        for (release, organism, outcome) in merged.iter_outcomes() {
            let wanted = match outcome.status {
                DownloadStatus::Failed => true,
                DownloadStatus::NotFound => options.include_not_found,
                DownloadStatus::Success => outcome.decompression_failed(),
            };
            if !wanted {
                continue;
            }
            let Ok(organism_name) = organism.parse::<OrganismName>() else {
                warn!(%organism, release, "skipping unparseable organism name");
                continue;
            };
            let unit = WorkUnit {
                display_name: organism.to_string(),
                organism_name,
                taxid: None,
                release,
            };
            previous.insert(unit.key(), outcome.status);
            units.push(unit);
        }
        let candidates: Vec<String> = units.iter().map(WorkUnit::key).collect();
        info!(candidates = candidates.len(), "retry candidates");

        if options.list_only || units.is_empty() {
            return Ok(RetryResult {
                candidates,
                summary: None,
                summary_path: None,
            });
        }
        sink.event(ProgressEvent::phase(
            "Plan",
            format!("retrying {} units", units.len()),
        ));

        let mut indexes: BTreeMap<u32, ReleaseIndex> = BTreeMap::new();
        for unit in &units {
            if !indexes.contains_key(&unit.release) {
                let index = self.release_index(unit.release, sink);
                indexes.insert(unit.release, index);
            }
        }
        let outcomes = self.run_units(&units, |unit| &indexes[&unit.release], sink);

        let mut results = BTreeMap::new();
        let mut recovered = 0;
        for (unit, outcome) in units.iter().zip(outcomes) {
            let key = unit.key();
            let previous_status = previous
                .get(&key)
                .copied()
                .unwrap_or(DownloadStatus::Failed);
            if outcome.is_success() && !outcome.decompression_failed() {
                recovered += 1;
            }
            results.insert(
                key,
                RetryRecord {
                    previous_status,
                    final_status: outcome.status,
                    attempts: outcome.attempts,
                    error_message: outcome.error_message.clone(),
                },
            );
            merged.replace(unit.release, &unit.organism_name, outcome);
        }

        let summary = RetrySummary {
            started_at,
            finished_at: Utc::now(),
            candidates: units.len(),
            recovered,
            results,
        };
        Store::write_json_atomic(&self.store.merged_summary_path(), &merged)?;
        let summary_path = self.store.retry_summary_path();
        Store::write_json_atomic(&summary_path, &summary)?;
        info!(recovered, candidates = units.len(), "retry finished");
        sink.event(ProgressEvent {
            message: format!("phase=Store; recovered {recovered} of {}", units.len()),
            elapsed: Some(started.elapsed()),
            progress: None,
            status: None,
        });

        Ok(RetryResult {
            candidates,
            summary: Some(summary),
            summary_path: Some(summary_path.to_string()),
        })
    }

    /// Converts the decompressed files of the shard's release to gene records.
    pub fn convert(
        &self,
        organisms: &[Organism],
        selection: ShardSelection,
        sink: &dyn ProgressSink,
    ) -> Result<ConvertResult, HarvestError> {
        let started_at = Utc::now();
        let release = shard_release(selection, self.config.releases)?;
        let converter = Converter::new(self.runner.clone(), self.config.converter.clone())?;

        let taxids: HashMap<String, Option<u32>> = organisms
            .iter()
            .filter_map(|organism| {
                let name = organism.name.parse::<OrganismName>().ok()?;
                Some((name.to_string(), organism.taxid))
            })
            .collect();
        let tasks: Vec<ConvertTask> = find_gff_files(&self.store.release_dir(release))?
            .into_iter()
            .map(|(organism, gff_file)| ConvertTask {
                release,
                taxid: taxids.get(&organism).copied().flatten(),
                organism,
                gff_file,
            })
            .collect();
        info!(release, files = tasks.len(), "converting GFF files");
        sink.event(ProgressEvent::phase(
            "Plan",
            format!("release {release}: {} files to convert", tasks.len()),
        ));

        let total = tasks.len();
        let mut done = 0;
        let results = run_pool(
            &tasks,
            converter.max_parallel(),
            |task| converter.convert(task),
            |task, message| ConvertOutcome {
                status: ConvertStatus::Failed,
                gff_file: task.gff_file.to_string(),
                taxid: task.taxid,
                reason: Some(message),
                exit_code: None,
                timestamp: Utc::now(),
            },
            |task, outcome| {
                done += 1;
                sink.event(ProgressEvent {
                    message: format!("phase=Convert; {} {:?}", task.key(), outcome.status),
                    elapsed: None,
                    progress: Some(Progress { done, total }),
                    status: None,
                });
            },
        );

        let outcomes = tasks
            .iter()
            .map(ConvertTask::key)
            .zip(results)
            .collect();
        let summary = ConvertSummary::new(selection.task_index, release, started_at, outcomes);
        let path = self.store.convert_summary_path(selection.task_index);
        Store::write_json_atomic(&path, &summary)?;
        info!(
            converted = summary.statistics.converted,
            skipped = summary.statistics.skipped,
            failed = summary.statistics.failed,
            "conversion finished"
        );

        Ok(ConvertResult {
            summary_path: path.to_string(),
            summary,
        })
    }

    pub fn status(&self) -> Result<DataDirStatus, HarvestError> {
        scan_data_dir(&self.store)
    }

    fn release_index(&self, release: u32, sink: &dyn ProgressSink) -> ReleaseIndex {
        if !self.config.download.use_listing {
            return ReleaseIndex::Unused;
        }
        sink.event(ProgressEvent::phase(
            "Resolve",
            format!("listing release {release}"),
        ));
        match self.listing.list_release(release) {
            Ok(listing) => {
                info!(release, files = listing.files.len(), "fetched release listing");
                ReleaseIndex::Listed(listing)
            }
            Err(err) => {
                warn!(release, error = %err, "release listing unavailable, failing its units");
                ReleaseIndex::Unavailable(err.to_string())
            }
        }
    }

    fn run_units<'a, F>(
        &self,
        units: &[WorkUnit],
        index_for: F,
        sink: &dyn ProgressSink,
    ) -> Vec<DownloadOutcome>
    where
        F: Fn(&WorkUnit) -> &'a ReleaseIndex + Sync,
    {
        let downloader = Downloader::new(self.runner.clone(), self.config.download.clone());
        let resolver = Resolver::new(self.config.base_url.clone(), self.store.clone())
            .with_overrides(&self.config.name_overrides);
        let decompressor = Decompressor::new();

        let total = units.len();
        let mut done = 0;
        run_pool(
            units,
            self.config.download.max_parallel,
            |unit| {
                process_unit(
                    &downloader,
                    &resolver,
                    &decompressor,
                    unit,
                    index_for(unit),
                )
            },
            |unit, message| {
                warn!(unit = %unit.key(), %message, "unit aborted");
                DownloadOutcome::failed(1, format!("worker panicked: {message}"), None)
            },
            |unit, outcome| {
                done += 1;
                sink.event(ProgressEvent {
                    message: format!("phase=Fetch; {} {}", unit.key(), outcome.status),
                    elapsed: None,
                    progress: Some(Progress { done, total }),
                    status: Some(outcome.status),
                });
            },
        )
    }
}

fn process_unit<C: CommandRunner>(
    downloader: &Downloader<C>,
    resolver: &Resolver,
    decompressor: &Decompressor,
    unit: &WorkUnit,
    index: &ReleaseIndex,
) -> DownloadOutcome {
    if let ReleaseIndex::Unavailable(message) = index {
        return DownloadOutcome::failed(
            1,
            format!("release listing unavailable: {message}"),
            None,
        );
    }
    let target = match resolver.resolve(unit, index.listing()) {
        Resolution::Target(target) => target,
        Resolution::Absent { remote_name } => {
            info!(unit = %unit.key(), %remote_name, "not in release listing");
            return DownloadOutcome::not_found(
                1,
                format!("no GFF3 file for {remote_name} in release {}", unit.release),
                None,
            );
        }
    };

    if target.compressed_path.as_std_path().exists() {
        let bytes = fs::metadata(target.compressed_path.as_std_path())
            .map(|meta| meta.len())
            .unwrap_or(0);
        let mut outcome = DownloadOutcome::success(1, bytes, Some(target.url.clone()));
        outcome.resumed = true;
        match decompressor.decompress(&target.compressed_path, &target.decompressed_path) {
            Ok(state) => {
                info!(unit = %unit.key(), "already downloaded");
                outcome.decompression = Some(state);
                return outcome;
            }
            Err(err) => {
                warn!(
                    unit = %unit.key(),
                    error = %err,
                    "existing archive unreadable, downloading again"
                );
                if let Err(remove) = fs::remove_file(target.compressed_path.as_std_path()) {
                    warn!(path = %target.compressed_path, error = %remove, "cannot remove archive");
                    outcome.decompression = Some(DecompressionState::Failed);
                    outcome.decompression_error = Some(err.to_string());
                    return outcome;
                }
            }
        }
    }

    let mut outcome = downloader.download(&target.url, &target.compressed_path);
    if outcome.is_success() {
        match decompressor.decompress(&target.compressed_path, &target.decompressed_path) {
            Ok(state) => outcome.decompression = Some(state),
            Err(err) => {
                warn!(unit = %unit.key(), error = %err, "decompression failed");
                outcome.decompression = Some(DecompressionState::Failed);
                outcome.decompression_error = Some(err.to_string());
            }
        }
    }
    outcome
}
