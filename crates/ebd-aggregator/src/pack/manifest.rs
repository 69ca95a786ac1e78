//! Pack manifest (`packs.json.gz`)

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{gzip_json, write_atomic};
use crate::error::Result;
use crate::region::RegionLevel;

/// One downloadable region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackEntry {
    pub region: String,
    /// Display name, or the code when none is known
    pub name: String,
    pub level: RegionLevel,
    pub parent: Option<String>,
    pub hotspots: usize,
    /// `[lat, lng]` markers shown before the pack is downloaded
    pub clusters: Vec<[f64; 2]>,
    /// Compressed size in bytes
    pub size: u64,
    pub sha256: String,
    /// Object key relative to the bucket root
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub v: String,
    pub packs: Vec<PackEntry>,
}

impl Manifest {
    /// Entries are sorted by region code
    pub fn new(version: impl Into<String>, mut packs: Vec<PackEntry>) -> Self {
        packs.sort_by(|a, b| a.region.cmp(&b.region));
        Self {
            v: version.into(),
            packs,
        }
    }

    pub fn get(&self, region: &str) -> Option<&PackEntry> {
        self.packs
            .binary_search_by(|p| p.region.as_str().cmp(region))
            .ok()
            .map(|idx| &self.packs[idx])
    }

    pub fn total_size(&self) -> u64 {
        self.packs.iter().map(|p| p.size).sum()
    }

    /// Write gzipped, atomically
    pub fn write(&self, path: &Path) -> Result<u64> {
        let bytes = gzip_json(self)?;
        write_atomic(path, &bytes)?;
        Ok(bytes.len() as u64)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        Ok(serde_json::from_reader(decoder)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn entry(region: &str, level: RegionLevel) -> PackEntry {
        PackEntry {
            region: region.to_string(),
            name: format!("{} name", region),
            level,
            parent: None,
            hotspots: 1,
            clusters: vec![[1.0, 2.0]],
            size: 10,
            sha256: "00".to_string(),
            path: format!("v1/{}.json.gz", region),
        }
    }

    #[test]
    fn test_sorted_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1/packs.json.gz");

        let manifest = Manifest::new(
            "v1",
            vec![
                entry("US-CA", RegionLevel::Subnational1),
                entry("US", RegionLevel::Country),
            ],
        );
        manifest.write(&path).unwrap();

        let read = Manifest::read(&path).unwrap();
        assert_eq!(read, manifest);
        assert_eq!(read.packs[0].region, "US");
        assert!(read.get("US-CA").is_some());
        assert!(read.get("MX").is_none());
        assert_eq!(read.total_size(), 20);
    }

    #[test]
    fn test_level_serialized_lowercase() {
        let json = serde_json::to_value(entry("US", RegionLevel::Country)).unwrap();
        assert_eq!(json["level"], "country");
    }
}
