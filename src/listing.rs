use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::HarvestError;

static HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"href="(?:[^"]*/)?([^"/?#]+\.gff3\.gz)""#).expect("static regex")
});

/// GFF3 files published for one release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseListing {
    pub release: u32,
    pub files: Vec<String>,
}

impl ReleaseListing {
    pub fn new(release: u32, files: Vec<String>) -> Self {
        Self { release, files }
    }

    /// First file named `{organism}.<assembly>.gff3.gz`.
    pub fn find(&self, organism: &str) -> Option<&str> {
        let prefix = format!("{organism}.");
        self.files
            .iter()
            .map(String::as_str)
            .find(|file| file.starts_with(&prefix) && file.ends_with(".gff3.gz"))
    }
}

pub trait ListingClient: Send + Sync {
    fn list_release(&self, release: u32) -> Result<ReleaseListing, HarvestError>;
}

pub fn release_dir_url(base_url: &str, release: u32) -> String {
    format!("{base_url}/{release}.0/genome_coordinates/gff3/")
}

#[derive(Clone)]
pub struct HttpListingClient {
    client: Client,
    base_url: String,
}

impl HttpListingClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("gff-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::ListingHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| HarvestError::ListingHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl ListingClient for HttpListingClient {
    fn list_release(&self, release: u32) -> Result<ReleaseListing, HarvestError> {
        let url = release_dir_url(&self.base_url, release);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| HarvestError::ListingHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "listing request failed".to_string());
            return Err(HarvestError::ListingStatus { status, message });
        }
        let body = response
            .text()
            .map_err(|err| HarvestError::ListingHttp(err.to_string()))?;
        Ok(ReleaseListing::new(release, parse_listing(&body)))
    }
}

/// Extracts `.gff3.gz` names from an HTML index page or a plain name-per-line listing.
pub fn parse_listing(body: &str) -> Vec<String> {
    let mut files: Vec<String> = HREF
        .captures_iter(body)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    if files.is_empty() {
        files = body
            .lines()
            .map(str::trim)
            .filter(|line| line.ends_with(".gff3.gz") && !line.contains(char::is_whitespace))
            .map(str::to_string)
            .collect();
    }
    files.dedup();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"<html><body><pre>
<a href="../">Parent Directory</a>
<a href="homo_sapiens.GRCh38.gff3.gz">homo_sapiens.GRCh38.gff3.gz</a>   2023-01-01 12:00  10M
<a href="mus_musculus.GRCm39.gff3.gz">mus_musculus.GRCm39.gff3.gz</a>   2023-01-01 12:00  8M
<a href="mus_musculus_castaneus.CAST_EiJ_v1.gff3.gz">mus_musculus_castaneus.CAST_EiJ_v1.gff3.gz</a>
<a href="README.txt">README.txt</a>
</pre></body></html>"#;

    #[test]
    fn parses_html_index() {
        let files = parse_listing(INDEX);
        assert_eq!(
            files,
            vec![
                "homo_sapiens.GRCh38.gff3.gz",
                "mus_musculus.GRCm39.gff3.gz",
                "mus_musculus_castaneus.CAST_EiJ_v1.gff3.gz",
            ]
        );
    }

    #[test]
    fn parses_plain_listing() {
        let files = parse_listing("danio_rerio.GRCz11.gff3.gz\nnotes.txt\n");
        assert_eq!(files, vec!["danio_rerio.GRCz11.gff3.gz"]);
    }

    #[test]
    fn find_requires_exact_organism_prefix() {
        let listing = ReleaseListing::new(21, parse_listing(INDEX));
        assert_eq!(listing.find("mus_musculus"), Some("mus_musculus.GRCm39.gff3.gz"));
        assert_eq!(
            listing.find("mus_musculus_castaneus"),
            Some("mus_musculus_castaneus.CAST_EiJ_v1.gff3.gz")
        );
        assert_eq!(listing.find("mus"), None);
    }

    #[test]
    fn release_dir_layout() {
        assert_eq!(
            release_dir_url("https://example.org/releases", 21),
            "https://example.org/releases/21.0/genome_coordinates/gff3/"
        );
    }
}
