//! Reading and writing the normalized reference files

use ebd_common::publish::PartialFile;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::client::{build_species, EbirdClient};
use super::ReferenceData;
use crate::error::{PipelineError, Result};
use crate::models::{Hotspot, Region, Species};

/// Locations of the three reference files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePaths {
    pub species: PathBuf,
    pub hotspots: PathBuf,
    /// Region display names; optional when loading
    pub regions: PathBuf,
}

impl ReferencePaths {
    /// `species.json`, `hotspots.json` and `regions.json` under `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            species: dir.join("species.json"),
            hotspots: dir.join("hotspots.json"),
            regions: dir.join("regions.json"),
        }
    }

    pub fn files(&self) -> Vec<PathBuf> {
        vec![self.species.clone(), self.hotspots.clone(), self.regions.clone()]
    }
}

/// Counts from a reference fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSummary {
    pub species: usize,
    pub hotspots: usize,
    pub regions: usize,
    /// Countries whose hotspot request failed and were skipped
    pub failed_countries: usize,
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let file = File::open(path).map_err(|e| {
        PipelineError::MissingReference(format!("cannot open {} file {}: {}", what, path.display(), e))
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let partial = PartialFile::create(path)?;
    let mut writer = BufWriter::new(File::create(partial.path())?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    drop(writer);
    partial.publish()?;
    Ok(())
}

/// Load the reference files into a [`ReferenceData`]
///
/// A missing regions file only costs the display names, so it is not an
/// error.
pub fn load_reference(paths: &ReferencePaths) -> Result<ReferenceData> {
    let species: Vec<Species> = read_json(&paths.species, "species")?;
    let hotspots: Vec<Hotspot> = read_json(&paths.hotspots, "hotspot")?;
    let regions: Vec<Region> = if paths.regions.is_file() {
        read_json(&paths.regions, "region")?
    } else {
        warn!(path = %paths.regions.display(), "No region names file, packs will show codes");
        Vec::new()
    };

    info!(
        species = species.len(),
        hotspots = hotspots.len(),
        regions = regions.len(),
        "Loaded reference data"
    );

    Ok(ReferenceData::new(species, hotspots)?.with_regions(regions))
}

/// Write the reference files atomically
pub fn write_reference(
    paths: &ReferencePaths,
    species: &[Species],
    hotspots: &[Hotspot],
    regions: &[Region],
) -> Result<()> {
    write_json(&paths.species, &species)?;
    write_json(&paths.hotspots, &hotspots)?;
    write_json(&paths.regions, &regions)?;
    Ok(())
}

/// Fetch taxonomy, hotspots and region names from eBird and write the
/// reference files
///
/// Nothing is written unless species and hotspots both come back non-empty.
pub async fn fetch_reference(client: &EbirdClient, paths: &ReferencePaths) -> Result<ReferenceSummary> {
    let species = build_species(client.fetch_taxonomy().await?);
    if species.is_empty() {
        return Err(PipelineError::MissingReference(
            "eBird taxonomy returned no species".to_string(),
        ));
    }

    let fetched = client.fetch_all_hotspots().await?;
    let mut hotspots = fetched.hotspots;
    if hotspots.is_empty() {
        return Err(PipelineError::MissingReference(
            "eBird returned no hotspots".to_string(),
        ));
    }
    hotspots.sort_by(|a, b| a.id.cmp(&b.id));
    hotspots.dedup_by(|a, b| a.id == b.id);

    let mut regions = fetched.regions;
    regions.sort_by(|a, b| a.code.cmp(&b.code));
    regions.dedup_by(|a, b| a.code == b.code);

    write_reference(paths, &species, &hotspots, &regions)?;

    Ok(ReferenceSummary {
        species: species.len(),
        hotspots: hotspots.len(),
        regions: regions.len(),
        failed_countries: fetched.failed_countries,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ReferencePaths::in_dir(&dir.path().join("reference"));

        let species = vec![Species {
            id: 1,
            sci_name: "Struthio camelus".to_string(),
            name: "Common Ostrich".to_string(),
            code: "ostric2".to_string(),
            taxon_order: 1.0,
        }];
        let hotspots = vec![Hotspot {
            id: "L1".to_string(),
            name: "Pond".to_string(),
            country_code: "KE".to_string(),
            subnational1_code: Some("KE-30".to_string()),
            subnational2_code: None,
            lat: -1.0,
            lng: 36.8,
            num_species: Some(12),
            num_checklists: None,
        }];

        let regions = vec![Region {
            code: "KE-30".to_string(),
            name: "Nairobi".to_string(),
        }];

        write_reference(&paths, &species, &hotspots, &regions).unwrap();
        let reference = load_reference(&paths).unwrap();

        assert_eq!(reference.species(), species.as_slice());
        assert_eq!(reference.hotspots(), hotspots.as_slice());
        assert_eq!(reference.regions(), regions);
    }

    #[test]
    fn test_regions_file_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ReferencePaths::in_dir(dir.path());
        std::fs::write(
            &paths.species,
            r#"[{"id":1,"sci_name":"A a","name":"A","code":"aa","taxon_order":1.0}]"#,
        )
        .unwrap();
        std::fs::write(
            &paths.hotspots,
            r#"[{"id":"L1","name":"Pond","country_code":"US","lat":1.0,"lng":2.0}]"#,
        )
        .unwrap();

        let reference = load_reference(&paths).unwrap();
        assert!(reference.regions().is_empty());
        assert_eq!(reference.region_name("US"), None);
    }

    #[test]
    fn test_missing_file_is_missing_reference() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_reference(&ReferencePaths::in_dir(&dir.path().join("nope"))).unwrap_err();
        assert!(matches!(err, PipelineError::MissingReference(_)));
    }

    #[test]
    fn test_empty_file_is_missing_reference() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ReferencePaths::in_dir(dir.path());
        std::fs::write(&paths.species, "[]").unwrap();
        std::fs::write(&paths.hotspots, "[]").unwrap();

        let err = load_reference(&paths).unwrap_err();
        assert!(matches!(err, PipelineError::MissingReference(_)));
    }
}
