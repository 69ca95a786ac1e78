//! Per-region bundle document
//!
//! A bundle is everything a client needs to render one region offline: the
//! species it references, every hotspot in the region and the month/year
//! targets for those hotspots. Ordering is fixed (species by id, hotspots
//! and targets by location id) so identical tables produce identical bytes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{Hotspot, MonthAggregate, Region, Species, YearAggregate};
use crate::region::{resolve_hotspot, RegionNode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub v: String,
    pub region: String,
    pub z: f64,
    pub min_samples: u32,
    pub species: Vec<BundleSpecies>,
    pub hotspots: Vec<BundleHotspot>,
    pub months: Vec<MonthTargets>,
    pub years: Vec<YearTargets>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpecies {
    pub code: String,
    pub name: String,
    pub sci_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleHotspot {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub country: String,
    pub state: Option<String>,
    pub county: Option<String>,
    /// Falls back to the country code when no name is known
    pub country_name: String,
    pub state_name: Option<String>,
    pub county_name: Option<String>,
    /// Species with at least one month row at this hotspot
    pub species: u32,
    /// Lifetime checklists reported by eBird
    pub checklists: Option<u32>,
}

/// Month targets for one hotspot
///
/// `samples[m]` is `None` when month `m + 1` has no row; each species entry
/// is `[code, [obs × 12]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthTargets {
    pub id: String,
    pub samples: [Option<u32>; 12],
    pub species: Vec<(String, [u32; 12])>,
}

/// Year targets for one hotspot; each species entry is `[code, obs, score]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearTargets {
    pub id: String,
    pub samples: u32,
    pub species: Vec<(String, u32, f64)>,
}

/// Read-only lookups shared by every region task
#[derive(Debug, Clone)]
pub struct BundleContext {
    pub version: String,
    pub z: f64,
    pub min_samples: u32,
    species: BTreeMap<u32, Species>,
    hotspots: HashMap<String, Hotspot>,
    region_names: HashMap<String, String>,
}

impl BundleContext {
    pub fn new(
        version: String,
        z: f64,
        min_samples: u32,
        species: Vec<Species>,
        hotspots: Vec<Hotspot>,
        regions: Vec<Region>,
    ) -> Self {
        Self {
            version,
            z,
            min_samples,
            species: species.into_iter().map(|s| (s.id, s)).collect(),
            hotspots: hotspots.into_iter().map(|h| (h.id.clone(), h)).collect(),
            region_names: regions.into_iter().map(|r| (r.code, r.name)).collect(),
        }
    }

    pub fn hotspot(&self, id: &str) -> Option<&Hotspot> {
        self.hotspots.get(id)
    }

    pub fn region_name(&self, code: &str) -> Option<&str> {
        self.region_names.get(code).map(String::as_str)
    }

    fn species_code(&self, id: u32) -> Option<&str> {
        self.species.get(&id).map(|s| s.code.as_str())
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Assemble the bundle for `node`
///
/// `months` must be ordered by (location, species, month) and `years` by
/// (location, species), as [`crate::storage::TargetsReader`] returns them.
pub fn build_bundle(
    ctx: &BundleContext,
    node: &RegionNode,
    months: &[MonthAggregate],
    years: &[YearAggregate],
) -> Bundle {
    let mut used_species = BTreeSet::new();

    let mut month_targets: Vec<MonthTargets> = Vec::new();
    let mut species_at: HashMap<&str, u32> = HashMap::new();
    for location in months.chunk_by(|a, b| a.location_id == b.location_id) {
        let mut samples = [None; 12];
        let mut species: Vec<(String, [u32; 12])> = Vec::new();

        for rows in location.chunk_by(|a, b| a.species_id == b.species_id) {
            let Some(code) = ctx.species_code(rows[0].species_id) else {
                continue;
            };
            let mut obs = [0u32; 12];
            for row in rows {
                let idx = usize::from(row.month.clamp(1, 12) - 1);
                obs[idx] = row.obs;
                samples[idx] = Some(row.samples);
            }
            used_species.insert(rows[0].species_id);
            species.push((code.to_string(), obs));
        }

        species_at.insert(location[0].location_id.as_str(), species.len() as u32);
        month_targets.push(MonthTargets {
            id: location[0].location_id.clone(),
            samples,
            species,
        });
    }

    let mut year_targets: Vec<YearTargets> = Vec::new();
    for location in years.chunk_by(|a, b| a.location_id == b.location_id) {
        let species = location
            .iter()
            .filter_map(|row| {
                let code = ctx.species_code(row.species_id)?;
                used_species.insert(row.species_id);
                Some((code.to_string(), row.obs, round4(row.score)))
            })
            .collect();

        year_targets.push(YearTargets {
            id: location[0].location_id.clone(),
            samples: location[0].samples,
            species,
        });
    }

    let hotspots = node
        .hotspots
        .iter()
        .filter_map(|id| ctx.hotspot(id))
        .map(|h| {
            let chain = resolve_hotspot(h).map(|r| r.chain()).unwrap_or_default();
            let level = |depth: usize| chain.get(depth).map(|c| c.as_str().to_string());
            let name_of = |code: &Option<String>| {
                code.as_deref()
                    .and_then(|c| ctx.region_name(c))
                    .map(str::to_string)
            };
            let country = level(0).unwrap_or_else(|| h.country_code.clone());
            let state = level(1);
            let county = level(2);
            BundleHotspot {
                id: h.id.clone(),
                name: h.name.clone(),
                lat: h.lat,
                lng: h.lng,
                country_name: ctx
                    .region_name(&country)
                    .map_or_else(|| country.clone(), str::to_string),
                state_name: name_of(&state),
                county_name: name_of(&county),
                country,
                state,
                county,
                species: species_at.get(h.id.as_str()).copied().unwrap_or(0),
                checklists: h.num_checklists,
            }
        })
        .collect();

    let species = used_species
        .iter()
        .filter_map(|id| ctx.species.get(id))
        .map(|s| BundleSpecies {
            code: s.code.clone(),
            name: s.name.clone(),
            sci_name: s.sci_name.clone(),
        })
        .collect();

    Bundle {
        v: ctx.version.clone(),
        region: node.code.clone(),
        z: ctx.z,
        min_samples: ctx.min_samples,
        species,
        hotspots,
        months: month_targets,
        years: year_targets,
    }
}
