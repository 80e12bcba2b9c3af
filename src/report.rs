use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;

use serde::Serialize;

use crate::domain::{DownloadStatus, parse_unit_key};
use crate::error::HarvestError;
use crate::store::Store;
use crate::summary::GlobalSummary;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseCoverage {
    pub release: u32,
    pub total: usize,
    pub success: usize,
    pub not_found: usize,
    pub failed: usize,
    pub decompression_failed: usize,
    /// Units of this release whose shard never reported.
    pub missing: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub organism: String,
    pub release: u32,
    pub status: DownloadStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageClass {
    Complete,
    Partial,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganismCoverage {
    pub organism: String,
    pub releases_available: Vec<u32>,
    pub class: CoverageClass,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    pub release_start: u32,
    pub release_end: u32,
    pub complete: bool,
    pub releases: Vec<ReleaseCoverage>,
    pub success_rate: f64,
    pub gaps: Vec<Gap>,
    pub organisms: Vec<OrganismCoverage>,
    pub missing_shard_data: Vec<String>,
}

/// Summarizes a merged summary. Read-only.
pub fn coverage(summary: &GlobalSummary) -> CoverageReport {
    let mut releases: BTreeMap<u32, ReleaseCoverage> = BTreeMap::new();
    let mut available: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
    let mut gaps = Vec::new();

    for (release, organism, outcome) in summary.iter_outcomes() {
        let entry = releases.entry(release).or_insert_with(|| ReleaseCoverage {
            release,
            ..ReleaseCoverage::default()
        });
        entry.total += 1;
        if outcome.decompression_failed() {
            entry.decompression_failed += 1;
        }
        let organism_releases = available.entry(organism).or_default();
        match outcome.status {
            DownloadStatus::Success => {
                entry.success += 1;
                organism_releases.push(release);
            }
            status => {
                if status == DownloadStatus::NotFound {
                    entry.not_found += 1;
                } else {
                    entry.failed += 1;
                }
                gaps.push(Gap {
                    organism: organism.to_string(),
                    release,
                    status,
                    error_message: outcome.error_message.clone(),
                });
            }
        }
    }

    for key in &summary.missing_shard_data {
        if let Some((release, _)) = parse_unit_key(key) {
            releases
                .entry(release)
                .or_insert_with(|| ReleaseCoverage {
                    release,
                    ..ReleaseCoverage::default()
                })
                .missing += 1;
        }
    }

    let merged_releases = summary.by_release.len();
    let organisms = available
        .into_iter()
        .map(|(organism, releases_available)| {
            let class = match releases_available.len() {
                0 => CoverageClass::None,
                n if n >= merged_releases => CoverageClass::Complete,
                _ => CoverageClass::Partial,
            };
            OrganismCoverage {
                organism: organism.to_string(),
                releases_available,
                class,
            }
        })
        .collect();

    let recorded = summary.statistics.total;
    let success_rate = if recorded == 0 {
        0.0
    } else {
        summary.statistics.success as f64 / recorded as f64 * 100.0
    };

    CoverageReport {
        release_start: summary.release_start,
        release_end: summary.release_end,
        complete: summary.complete,
        releases: releases.into_values().collect(),
        success_rate,
        gaps,
        organisms,
        missing_shard_data: summary.missing_shard_data.clone(),
    }
}

impl CoverageReport {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Coverage for releases {}..={}{}",
            self.release_start,
            self.release_end,
            if self.complete { "" } else { " (INCOMPLETE)" }
        );
        let _ = writeln!(
            out,
            "{:>8} {:>7} {:>8} {:>10} {:>7} {:>7} {:>8}",
            "release", "total", "success", "not_found", "failed", "gunzip", "missing"
        );
        for release in &self.releases {
            let _ = writeln!(
                out,
                "{:>8} {:>7} {:>8} {:>10} {:>7} {:>7} {:>8}",
                release.release,
                release.total,
                release.success,
                release.not_found,
                release.failed,
                release.decompression_failed,
                release.missing
            );
        }
        let _ = writeln!(out, "\nOverall success rate: {:.1}%", self.success_rate);

        let count = |class: CoverageClass| {
            self.organisms
                .iter()
                .filter(|organism| organism.class == class)
                .count()
        };
        let _ = writeln!(
            out,
            "Organisms: {} complete, {} partial, {} none",
            count(CoverageClass::Complete),
            count(CoverageClass::Partial),
            count(CoverageClass::None)
        );

        if !self.gaps.is_empty() {
            let _ = writeln!(out, "\nGaps:");
            for gap in &self.gaps {
                let _ = writeln!(
                    out,
                    "  {}/{} {}{}",
                    gap.release,
                    gap.organism,
                    gap.status,
                    gap.error_message
                        .as_deref()
                        .map(|message| format!(": {message}"))
                        .unwrap_or_default()
                );
            }
        }
        if !self.missing_shard_data.is_empty() {
            let _ = writeln!(
                out,
                "\n{} units have no shard data",
                self.missing_shard_data.len()
            );
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseDirStatus {
    pub release: u32,
    pub organisms: usize,
    pub compressed_files: usize,
    pub decompressed_files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataDirStatus {
    pub data_dir: String,
    pub releases: Vec<ReleaseDirStatus>,
    pub total_bytes: u64,
}

/// Walks `{data_dir}/release_N/<organism>/` and tallies what is on disk.
pub fn scan_data_dir(store: &Store) -> Result<DataDirStatus, HarvestError> {
    let root = store.data_root();
    let mut status = DataDirStatus {
        data_dir: root.to_string(),
        ..DataDirStatus::default()
    };
    if !root.as_std_path().is_dir() {
        return Ok(status);
    }

    let io_err = |err: std::io::Error| HarvestError::Filesystem(err.to_string());
    for entry in fs::read_dir(root.as_std_path()).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name();
        let Some(release) = name
            .to_str()
            .and_then(|name| name.strip_prefix("release_"))
            .and_then(|number| number.parse::<u32>().ok())
        else {
            continue;
        };
        if !entry.path().is_dir() {
            continue;
        }

        let mut release_status = ReleaseDirStatus {
            release,
            ..ReleaseDirStatus::default()
        };
        for organism in fs::read_dir(entry.path()).map_err(io_err)? {
            let organism = organism.map_err(io_err)?;
            if !organism.path().is_dir() {
                continue;
            }
            release_status.organisms += 1;
            for file in fs::read_dir(organism.path()).map_err(io_err)? {
                let file = file.map_err(io_err)?;
                let file_name = file.file_name();
                let file_name = file_name.to_string_lossy();
                if file_name.starts_with('.') {
                    continue;
                }
                if file_name.ends_with(".gff3.gz") {
                    release_status.compressed_files += 1;
                } else if file_name.ends_with(".gff3") {
                    release_status.decompressed_files += 1;
                }
                release_status.bytes += file.metadata().map_err(io_err)?.len();
            }
        }
        status.total_bytes += release_status.bytes;
        status.releases.push(release_status);
    }
    status.releases.sort_by_key(|release| release.release);
    Ok(status)
}

impl DataDirStatus {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Data directory: {}", self.data_dir);
        if self.releases.is_empty() {
            let _ = writeln!(out, "  (no releases downloaded)");
            return out;
        }
        for release in &self.releases {
            let _ = writeln!(
                out,
                "  release_{:<4} {:>5} organisms {:>5} .gz {:>5} .gff3 {:>12} bytes",
                release.release,
                release.organisms,
                release.compressed_files,
                release.decompressed_files,
                release.bytes
            );
        }
        let _ = writeln!(out, "  total {} bytes", self.total_bytes);
        out
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::config::ReleaseRange;
    use crate::domain::{DecompressionState, DownloadOutcome, Organism};
    use crate::summary::{ShardSummary, merge};

    fn merged() -> GlobalSummary {
        let organisms = vec![
            Organism::new("Homo sapiens", None),
            Organism::new("Mus musculus", None),
            Organism::new("Danio rerio", None),
        ];
        let mut first = ShardSummary::new(0, 3, vec![12], organisms.clone());
        first.record("12/homo_sapiens".into(), DownloadOutcome::success(1, 10, None));
        first.record("12/mus_musculus".into(), DownloadOutcome::success(1, 10, None));
        first.record(
            "12/danio_rerio".into(),
            DownloadOutcome::not_found(1, "404", None),
        );
        let mut second = ShardSummary::new(1, 3, vec![13], organisms);
        let mut broken = DownloadOutcome::success(1, 10, None);
        broken.decompression = Some(DecompressionState::Failed);
        second.record("13/homo_sapiens".into(), broken);
        second.record(
            "13/mus_musculus".into(),
            DownloadOutcome::failed(3, "timeout", None),
        );
        second.record(
            "13/danio_rerio".into(),
            DownloadOutcome::not_found(1, "404", None),
        );
        merge(&[first, second], ReleaseRange::new(12, 14).unwrap(), 3, &[])
    }

    #[test]
    fn counts_per_release_and_gaps() {
        let report = coverage(&merged());
        assert!(!report.complete);
        assert_eq!(report.releases.len(), 3);
        let r13 = &report.releases[1];
        assert_eq!(
            (r13.total, r13.success, r13.not_found, r13.failed, r13.decompression_failed),
            (3, 1, 1, 1, 1)
        );
        assert_eq!(report.releases[2].missing, 3);
        assert_eq!(report.gaps.len(), 3);
        assert!((report.success_rate - 50.0).abs() < 1e-9);
    }

    #[test]
    fn classifies_organism_coverage() {
        let report = coverage(&merged());
        let class = |name: &str| {
            report
                .organisms
                .iter()
                .find(|organism| organism.organism == name)
                .map(|organism| organism.class)
        };
        assert_eq!(class("homo_sapiens"), Some(CoverageClass::Complete));
        assert_eq!(class("mus_musculus"), Some(CoverageClass::Partial));
        assert_eq!(class("danio_rerio"), Some(CoverageClass::None));
        assert!(report.render_text().contains("1 complete, 1 partial, 1 none"));
    }

    #[test]
    fn scans_release_layout() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new_with_paths(root.join("data"), root.join("logs"));
        let name = "homo_sapiens".parse().unwrap();
        let compressed = store.compressed_path(12, &name);
        fs::create_dir_all(compressed.parent().unwrap()).unwrap();
        fs::write(&compressed, b"1234").unwrap();
        fs::write(store.decompressed_path(12, &name), b"123456").unwrap();
        fs::create_dir_all(store.data_root().join("notes")).unwrap();

        let status = scan_data_dir(&store).unwrap();
        assert_eq!(
            status.releases,
            vec![ReleaseDirStatus {
                release: 12,
                organisms: 1,
                compressed_files: 1,
                decompressed_files: 1,
                bytes: 10,
            }]
        );
        assert_eq!(status.total_bytes, 10);
    }
}
