//! Species and hotspot reference data
//!
//! The reference universe is fetched once per release from the eBird API,
//! stored as normalized JSON next to the dataset, and loaded in full before
//! aggregation starts. Aggregation only ever emits ids found here.

pub mod client;
pub mod loader;

pub use client::{EbirdClient, EbirdClientConfig};
pub use loader::{fetch_reference, load_reference, write_reference, ReferencePaths, ReferenceSummary};

use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::models::{Hotspot, Region, Species};

/// Fully loaded reference tables with join indexes
#[derive(Debug, Clone)]
pub struct ReferenceData {
    species: Vec<Species>,
    hotspots: Vec<Hotspot>,
    species_by_name: HashMap<String, u32>,
    hotspot_index: HashMap<String, usize>,
    region_names: BTreeMap<String, String>,
}

impl ReferenceData {
    /// Index the tables, sorted by id
    ///
    /// Fails with [`PipelineError::MissingReference`] if either table is
    /// empty. Duplicate ids or scientific names keep the first entry.
    pub fn new(mut species: Vec<Species>, mut hotspots: Vec<Hotspot>) -> Result<Self> {
        if species.is_empty() {
            return Err(PipelineError::MissingReference(
                "species table is empty".to_string(),
            ));
        }
        if hotspots.is_empty() {
            return Err(PipelineError::MissingReference(
                "hotspot table is empty".to_string(),
            ));
        }

        species.sort_by_key(|s| s.id);
        let before = species.len();
        species.dedup_by_key(|s| s.id);
        if species.len() != before {
            warn!(dropped = before - species.len(), "Duplicate species ids in reference");
        }

        hotspots.sort_by(|a, b| a.id.cmp(&b.id));
        let before = hotspots.len();
        hotspots.dedup_by(|a, b| a.id == b.id);
        if hotspots.len() != before {
            warn!(dropped = before - hotspots.len(), "Duplicate hotspot ids in reference");
        }

        let mut species_by_name = HashMap::with_capacity(species.len());
        for s in &species {
            species_by_name.entry(s.sci_name.clone()).or_insert(s.id);
        }

        let hotspot_index = hotspots
            .iter()
            .enumerate()
            .map(|(idx, h)| (h.id.clone(), idx))
            .collect();

        Ok(Self {
            species,
            hotspots,
            species_by_name,
            hotspot_index,
            region_names: BTreeMap::new(),
        })
    }

    /// Attach display names for region codes; a repeated code keeps the
    /// last name
    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.region_names
            .extend(regions.into_iter().map(|r| (r.code, r.name)));
        self
    }

    /// Species id for an exact, case-sensitive scientific name
    pub fn species_id(&self, sci_name: &str) -> Option<u32> {
        self.species_by_name.get(sci_name).copied()
    }

    pub fn hotspot(&self, id: &str) -> Option<&Hotspot> {
        self.hotspot_index.get(id).map(|&idx| &self.hotspots[idx])
    }

    pub fn has_hotspot(&self, id: &str) -> bool {
        self.hotspot_index.contains_key(id)
    }

    pub fn species(&self) -> &[Species] {
        &self.species
    }

    pub fn hotspots(&self) -> &[Hotspot] {
        &self.hotspots
    }

    pub fn region_name(&self, code: &str) -> Option<&str> {
        self.region_names.get(code).map(String::as_str)
    }

    /// Named regions ordered by code
    pub fn regions(&self) -> Vec<Region> {
        self.region_names
            .iter()
            .map(|(code, name)| Region {
                code: code.clone(),
                name: name.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn species(id: u32, sci: &str, code: &str) -> Species {
        Species {
            id,
            sci_name: sci.to_string(),
            name: code.to_uppercase(),
            code: code.to_string(),
            taxon_order: f64::from(id),
        }
    }

    fn hotspot(id: &str) -> Hotspot {
        Hotspot {
            id: id.to_string(),
            name: id.to_string(),
            country_code: "US".to_string(),
            subnational1_code: None,
            subnational2_code: None,
            lat: 0.0,
            lng: 0.0,
            num_species: None,
            num_checklists: None,
        }
    }

    #[test]
    fn test_empty_tables_are_fatal() {
        let err = ReferenceData::new(vec![], vec![hotspot("L1")]).unwrap_err();
        assert!(matches!(err, PipelineError::MissingReference(_)));

        let err = ReferenceData::new(vec![species(1, "A a", "aa")], vec![]).unwrap_err();
        assert!(matches!(err, PipelineError::MissingReference(_)));
    }

    #[test]
    fn test_species_lookup_is_case_sensitive() {
        let reference =
            ReferenceData::new(vec![species(1, "Anas platyrhynchos", "mallar3")], vec![hotspot("L1")])
                .unwrap();
        assert_eq!(reference.species_id("Anas platyrhynchos"), Some(1));
        assert_eq!(reference.species_id("anas platyrhynchos"), None);
        assert!(reference.has_hotspot("L1"));
        assert!(!reference.has_hotspot("L2"));
    }

    #[test]
    fn test_sorted_and_deduplicated() {
        let reference = ReferenceData::new(
            vec![species(2, "B b", "bb"), species(1, "A a", "aa"), species(2, "B c", "bc")],
            vec![hotspot("L9"), hotspot("L1"), hotspot("L9")],
        )
        .unwrap();

        let ids: Vec<u32> = reference.species().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);
        let hotspots: Vec<&str> = reference.hotspots().iter().map(|h| h.id.as_str()).collect();
        assert_eq!(hotspots, vec!["L1", "L9"]);
        assert_eq!(reference.hotspot("L9").map(|h| h.id.as_str()), Some("L9"));
    }

    #[test]
    fn test_region_names() {
        let region = |code: &str, name: &str| Region {
            code: code.to_string(),
            name: name.to_string(),
        };
        let reference = ReferenceData::new(vec![species(1, "A a", "aa")], vec![hotspot("L1")])
            .unwrap()
            .with_regions(vec![region("US-CA", "California"), region("US", "United States")]);

        assert_eq!(reference.region_name("US"), Some("United States"));
        assert_eq!(reference.region_name("US-NV"), None);
        let codes: Vec<String> = reference.regions().into_iter().map(|r| r.code).collect();
        assert_eq!(codes, ["US", "US-CA"]);
    }
}
