use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ReleaseRange;
use crate::domain::{
    DownloadOutcome, DownloadStatus, Organism, OrganismName, parse_unit_key, unit_key,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: usize,
    pub success: usize,
    pub not_found: usize,
    pub failed: usize,
    #[serde(default)]
    pub resumed: usize,
    #[serde(default)]
    pub decompression_failed: usize,
}

impl Statistics {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a DownloadOutcome>) -> Self {
        let mut stats = Self::default();
        for outcome in outcomes {
            stats.total += 1;
            match outcome.status {
                DownloadStatus::Success => stats.success += 1,
                DownloadStatus::NotFound => stats.not_found += 1,
                DownloadStatus::Failed => stats.failed += 1,
            }
            if outcome.resumed {
                stats.resumed += 1;
            }
            if outcome.decompression_failed() {
                stats.decompression_failed += 1;
            }
        }
        stats
    }
}

/// Everything one shard recorded, written once when the shard finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSummary {
    pub shard_id: usize,
    pub task_count: usize,
    pub releases: Vec<u32>,
    /// The full organism list the shard enumerated from.
    pub organisms: Vec<Organism>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Keyed by `release/organism`.
    pub outcomes: BTreeMap<String, DownloadOutcome>,
    pub statistics: Statistics,
}

impl ShardSummary {
    pub fn new(
        shard_id: usize,
        task_count: usize,
        releases: Vec<u32>,
        organisms: Vec<Organism>,
    ) -> Self {
        Self {
            shard_id,
            task_count,
            releases,
            organisms,
            started_at: Utc::now(),
            finished_at: None,
            outcomes: BTreeMap::new(),
            statistics: Statistics::default(),
        }
    }

    pub fn record(&mut self, key: String, outcome: DownloadOutcome) {
        self.outcomes.insert(key, outcome);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.statistics = Statistics::from_outcomes(self.outcomes.values());
    }
}

/// Outcomes of every shard, merged.
///
/// Each work unit of the enumerated set appears exactly once: in `by_release`
/// when some shard recorded it, otherwise in `missing_shard_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub release_start: u32,
    pub release_end: u32,
    pub expected_shards: usize,
    pub shards: Vec<usize>,
    pub complete: bool,
    pub by_release: BTreeMap<u32, BTreeMap<String, DownloadOutcome>>,
    pub missing_shard_data: Vec<String>,
    pub statistics: Statistics,
}

impl GlobalSummary {
    pub fn outcome(&self, release: u32, organism: &OrganismName) -> Option<&DownloadOutcome> {
        self.by_release.get(&release)?.get(organism.as_str())
    }

    /// Replaces (or inserts) the outcome of one unit and drops it from the
    /// missing list.
    pub fn replace(&mut self, release: u32, organism: &OrganismName, outcome: DownloadOutcome) {
        self.by_release
            .entry(release)
            .or_default()
            .insert(organism.to_string(), outcome);
        let key = unit_key(release, organism);
        self.missing_shard_data.retain(|missing| *missing != key);
        self.refresh_statistics();
    }

    pub fn refresh_statistics(&mut self) {
        self.statistics = Statistics::from_outcomes(
            self.by_release
                .values()
                .flat_map(|organisms| organisms.values()),
        );
    }

    /// `(release, organism, outcome)` triples in release then organism order.
    pub fn iter_outcomes(&self) -> impl Iterator<Item = (u32, &str, &DownloadOutcome)> {
        self.by_release.iter().flat_map(|(release, organisms)| {
            organisms
                .iter()
                .map(move |(organism, outcome)| (*release, organism.as_str(), outcome))
        })
    }
}

/// Unions shard outcomes into a [`GlobalSummary`].
///
/// The expected work set is the configured range crossed with the organisms
/// the shards recorded plus `known_organisms`. Without any shard file and
/// without `known_organisms` nothing can be itemized as missing; the summary
/// is still incomplete. Output depends only on the inputs.
pub fn merge(
    summaries: &[ShardSummary],
    releases: ReleaseRange,
    expected_shards: usize,
    known_organisms: &[Organism],
) -> GlobalSummary {
    let mut by_release: BTreeMap<u32, BTreeMap<String, DownloadOutcome>> = BTreeMap::new();
    let mut shards = BTreeSet::new();
    let mut organisms = BTreeSet::new();

    let listed = summaries
        .iter()
        .flat_map(|summary| &summary.organisms)
        .chain(known_organisms);
    for organism in listed {
        match organism.name.parse::<OrganismName>() {
            Ok(name) => {
                organisms.insert(name);
            }
            Err(err) => warn!(organism = %organism.name, error = %err, "ignoring organism"),
        }
    }

    for summary in summaries {
        shards.insert(summary.shard_id);
        for (key, outcome) in &summary.outcomes {
            let Some((release, organism)) = parse_unit_key(key) else {
                warn!(shard = summary.shard_id, %key, "ignoring malformed outcome key");
                continue;
            };
            if !releases.contains(release) {
                warn!(shard = summary.shard_id, %key, "ignoring outcome outside release range");
                continue;
            }
            let previous = by_release
                .entry(release)
                .or_default()
                .insert(organism.to_string(), outcome.clone());
            if previous.is_some() {
                warn!(shard = summary.shard_id, %key, "unit recorded by more than one shard");
            }
            organisms.insert(organism);
        }
    }

    let mut missing_shard_data = Vec::new();
    for release in releases.iter() {
        let recorded = by_release.get(&release);
        for organism in &organisms {
            let present = recorded.is_some_and(|map| map.contains_key(organism.as_str()));
            if !present {
                missing_shard_data.push(unit_key(release, organism));
            }
        }
    }

    let statistics =
        Statistics::from_outcomes(by_release.values().flat_map(|organisms| organisms.values()));
    let complete = shards.len() >= expected_shards && missing_shard_data.is_empty();

    GlobalSummary {
        release_start: releases.start,
        release_end: releases.end,
        expected_shards,
        shards: shards.into_iter().collect(),
        complete,
        by_release,
        missing_shard_data,
        statistics,
    }
}
