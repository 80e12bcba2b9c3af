use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::domain::WorkUnit;
use crate::listing::{ReleaseListing, release_dir_url};
use crate::store::Store;

/// Database names (normalized) that the archive publishes under another name.
const NAMING_EXCEPTIONS: &[(&str, &str)] = &[
    ("canis_familiaris", "canis_lupus_familiaris"),
    ("saccharomyces_cerevisiae_s288c", "saccharomyces_cerevisiae"),
    ("escherichia_coli_str_k_12_substr_mg1655", "escherichia_coli"),
    ("bos_indicus_x_bos_taurus", "bos_indicus_hybrid"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: String,
    pub remote_file: String,
    pub compressed_path: Utf8PathBuf,
    pub decompressed_path: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Target(Target),
    /// The release listing holds no file for this organism.
    Absent { remote_name: String },
}

#[derive(Debug, Clone)]
pub struct Resolver {
    base_url: String,
    store: Store,
    overrides: BTreeMap<String, String>,
}

impl Resolver {
    pub fn new(base_url: impl Into<String>, store: Store) -> Self {
        let overrides = NAMING_EXCEPTIONS
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
            overrides,
        }
    }

    /// Adds configured renames on top of the built-in exceptions.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, String>) -> Self {
        for (from, to) in overrides {
            self.overrides.insert(from.clone(), to.clone());
        }
        self
    }

    pub fn remote_name(&self, unit: &WorkUnit) -> String {
        let name = unit.organism_name.as_str();
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn resolve(&self, unit: &WorkUnit, listing: Option<&ReleaseListing>) -> Resolution {
        let remote_name = self.remote_name(unit);
        let remote_file = match listing {
            Some(listing) => match listing.find(&remote_name) {
                Some(file) => file.to_string(),
                None => return Resolution::Absent { remote_name },
            },
            None => format!("{remote_name}.gff3.gz"),
        };

        Resolution::Target(Target {
            url: format!(
                "{}{}",
                release_dir_url(&self.base_url, unit.release),
                remote_file
            ),
            remote_file,
            compressed_path: self
                .store
                .compressed_path(unit.release, &unit.organism_name),
            decompressed_path: self
                .store
                .decompressed_path(unit.release, &unit.organism_name),
        })
    }
}
