use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};

use camino::Utf8Path;
use flate2::read::MultiGzDecoder;
use tempfile::Builder;
use tracing::{debug, info};

use crate::domain::DecompressionState;
use crate::error::HarvestError;

/// Expands `.gff3.gz` archives next to themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decompressor;

impl Decompressor {
    pub fn new() -> Self {
        Self
    }

    /// Returns `Skipped` when `target` already exists. Output is streamed to a
    /// temp file and renamed, so a failed run never leaves a partial target.
    pub fn decompress(
        &self,
        source: &Utf8Path,
        target: &Utf8Path,
    ) -> Result<DecompressionState, HarvestError> {
        if target.as_std_path().exists() {
            debug!(%target, "already decompressed");
            return Ok(DecompressionState::Skipped);
        }
        let error = |message: String| HarvestError::Decompression {
            path: source.to_string(),
            message,
        };

        let parent = target
            .parent()
            .ok_or_else(|| error(format!("{target} has no parent directory")))?;
        let input = File::open(source.as_std_path()).map_err(|err| error(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".gff3.")
            .suffix(".part")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| error(err.to_string()))?;

        let mut decoder = MultiGzDecoder::new(BufReader::new(input));
        let mut writer = BufWriter::new(temp.as_file());
        let bytes = io::copy(&mut decoder, &mut writer).map_err(|err| error(err.to_string()))?;
        writer.flush().map_err(|err| error(err.to_string()))?;
        drop(writer);

        temp.persist(target.as_std_path())
            .map_err(|err| error(err.to_string()))?;
        info!(%target, bytes, "decompressed");
        Ok(DecompressionState::Ok)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn gzip(content: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap()
    }

    fn paths(temp: &tempfile::TempDir) -> (Utf8PathBuf, Utf8PathBuf) {
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (root.join("x.gff3.gz"), root.join("x.gff3"))
    }

    #[test]
    fn decompresses_then_skips() {
        let temp = tempfile::tempdir().unwrap();
        let (source, target) = paths(&temp);
        fs::write(&source, gzip(b"##gff-version 3\n")).unwrap();

        let decompressor = Decompressor::new();
        assert_eq!(
            decompressor.decompress(&source, &target).unwrap(),
            DecompressionState::Ok
        );
        assert_eq!(fs::read(&target).unwrap(), b"##gff-version 3\n");

        assert_eq!(
            decompressor.decompress(&source, &target).unwrap(),
            DecompressionState::Skipped
        );
        assert_eq!(fs::read(&target).unwrap(), b"##gff-version 3\n");
    }

    #[test]
    fn corrupt_input_leaves_nothing_behind() {
        let temp = tempfile::tempdir().unwrap();
        let (source, target) = paths(&temp);
        let mut truncated = gzip(&[b'a'; 4096]);
        truncated.truncate(truncated.len() / 2);
        fs::write(&source, truncated).unwrap();

        let err = Decompressor::new().decompress(&source, &target).unwrap_err();
        assert_matches!(err, HarvestError::Decompression { .. });
        assert!(!target.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }
}
