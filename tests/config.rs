use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use gff_harvest::config::{ConfigLoader, OrganismSourceConfig, ReleaseRange};
use gff_harvest::error::HarvestError;

fn write_config(dir: &tempfile::TempDir, content: &str) -> String {
    let path = dir.path().join("gff-harvest.json");
    fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn parses_full_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"{
            "schema_version": 1,
            "release_start": 20,
            "release_end": 22,
            "base_url": "https://mirror.example.org/releases/",
            "data_dir": "/scratch/gff",
            "state_dir": "/scratch/gff-logs",
            "download": { "max_parallel": 8, "timeout_seconds": 120, "max_retries": 5 },
            "organisms": { "file": "organisms.tsv" },
            "converter": { "image": "/images/rnac.sif", "append_path": "/opt/bin" },
            "name_overrides": { "felis_catus": "felis_catus_v9" }
        }"#,
    );

    let resolved = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(resolved.releases, ReleaseRange { start: 20, end: 22 });
    assert_eq!(resolved.base_url, "https://mirror.example.org/releases");
    assert_eq!(resolved.data_dir, "/scratch/gff");
    assert_eq!(resolved.download.max_parallel, 8);
    assert_eq!(resolved.download.timeout, Duration::from_secs(120));
    assert_eq!(resolved.download.max_retries, 5);
    assert_eq!(resolved.download.retry_delay, Duration::from_secs(5));
    assert_matches!(resolved.organisms, OrganismSourceConfig::File(ref file) if file == "organisms.tsv");
    assert_eq!(resolved.converter.runtime, "singularity");
    assert_eq!(resolved.converter.timeout, Duration::from_secs(600));
    assert_eq!(
        resolved.name_overrides.get("felis_catus").map(String::as_str),
        Some("felis_catus_v9")
    );
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, HarvestError::ConfigRead(_));
    assert!(err.is_configuration());
}

#[test]
fn malformed_json_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "{ \"release_start\": ");
    let err = ConfigLoader::resolve(Some(&path)).unwrap_err();
    assert_matches!(err, HarvestError::ConfigParse(_));
}

#[test]
fn rejects_invalid_download_settings() {
    let dir = tempfile::tempdir().unwrap();
    for content in [
        r#"{ "download": { "max_parallel": 0 } }"#,
        r#"{ "download": { "max_retries": 0 } }"#,
        r#"{ "download": { "timeout_seconds": 0 } }"#,
        r#"{ "schema_version": 2 }"#,
    ] {
        let path = write_config(&dir, content);
        let err = ConfigLoader::resolve(Some(&path)).unwrap_err();
        assert_matches!(err, HarvestError::InvalidConfig(_), "{content}");
    }
}
