//! eBird API 2.0 client for taxonomy and hotspot reference data

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{Hotspot, Region, Species};

pub const DEFAULT_API_BASE: &str = "https://api.ebird.org";
pub const DEFAULT_HOTSPOT_DELAY_MS: u64 = 2000;
const API_KEY_HEADER: &str = "X-eBirdApiToken";

/// Connection settings for [`EbirdClient`]
#[derive(Debug, Clone)]
pub struct EbirdClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Pause between per-country hotspot requests
    pub hotspot_delay: Duration,
}

impl Default for EbirdClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            api_key: None,
            timeout_secs: 60,
            max_retries: 3,
            hotspot_delay: Duration::from_millis(DEFAULT_HOTSPOT_DELAY_MS),
        }
    }
}

impl EbirdClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_hotspot_delay(mut self, delay: Duration) -> Self {
        self.hotspot_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Taxonomy entry as served by `/v2/ref/taxonomy/ebird`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonEntry {
    pub sci_name: String,
    pub com_name: String,
    pub species_code: String,
    pub taxon_order: f64,
    #[serde(default)]
    pub category: Option<String>,
}

/// Entry from `/v2/ref/region/list/{level}/{parent}`
#[derive(Debug, Clone, Deserialize)]
pub struct RegionEntry {
    pub code: String,
    pub name: String,
}

impl From<RegionEntry> for Region {
    fn from(entry: RegionEntry) -> Self {
        Region {
            code: entry.code,
            name: entry.name,
        }
    }
}

/// Everything gathered by [`EbirdClient::fetch_all_hotspots`]
#[derive(Debug, Clone, Default)]
pub struct HotspotFetch {
    pub hotspots: Vec<Hotspot>,
    /// Country, state and county names
    pub regions: Vec<Region>,
    /// Countries whose hotspot request failed and were skipped
    pub failed_countries: usize,
}

/// Hotspot entry from `/v2/ref/hotspot/{region}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotspotEntry {
    pub loc_id: String,
    #[serde(default)]
    pub loc_name: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub subnational1_code: Option<String>,
    #[serde(default)]
    pub subnational2_code: Option<String>,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub num_species_all_time: Option<u32>,
    #[serde(default)]
    pub num_checklists_all_time: Option<u32>,
}

/// Number species in taxonomic order starting at 1
///
/// Non-species categories are dropped if the endpoint returned any.
pub fn build_species(mut taxa: Vec<TaxonEntry>) -> Vec<Species> {
    taxa.retain(|t| t.category.as_deref().is_none_or(|c| c == "species"));
    taxa.sort_by(|a, b| a.taxon_order.total_cmp(&b.taxon_order));

    taxa.into_iter()
        .enumerate()
        .map(|(idx, t)| Species {
            id: idx as u32 + 1,
            sci_name: t.sci_name,
            name: t.com_name,
            code: t.species_code,
            taxon_order: t.taxon_order,
        })
        .collect()
}

/// Convert an API hotspot, dropping "stakeout" locations (temporary rarity
/// chases, not real hotspots)
pub fn normalize_hotspot(entry: HotspotEntry) -> Option<Hotspot> {
    let name = entry.loc_name.trim().to_string();
    if name.to_lowercase().starts_with("stakeout") {
        return None;
    }

    let blank_to_none = |code: Option<String>| {
        code.map(|c| c.trim().to_string()).filter(|c| !c.is_empty())
    };

    Some(Hotspot {
        id: entry.loc_id,
        name,
        country_code: entry.country_code.trim().to_string(),
        subnational1_code: blank_to_none(entry.subnational1_code),
        subnational2_code: blank_to_none(entry.subnational2_code),
        lat: entry.lat,
        lng: entry.lng,
        num_species: entry.num_species_all_time,
        num_checklists: entry.num_checklists_all_time,
    })
}

/// HTTP client for the eBird reference endpoints
pub struct EbirdClient {
    client: Client,
    config: EbirdClientConfig,
}

impl EbirdClient {
    pub fn new(config: EbirdClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("ebd-aggregator/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &EbirdClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut request = self.client.get(&url);
            if let Some(key) = &self.config.api_key {
                request = request.header(API_KEY_HEADER, key);
            }

            let outcome = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json::<T>().await?);
                },
                Ok(response) => Err(PipelineError::Api {
                    status: response.status().as_u16(),
                    url: url.clone(),
                }),
                Err(err) => Err(PipelineError::Network(err)),
            };

            let retryable = match &outcome {
                Err(PipelineError::Api { status, .. }) => {
                    *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
                },
                Err(PipelineError::Network(err)) => err.is_timeout() || err.is_connect(),
                _ => false,
            };

            if !retryable || attempt >= self.config.max_retries.max(1) {
                return outcome;
            }

            let backoff = Duration::from_secs(2u64.pow(attempt));
            warn!(
                url = %url,
                attempt = attempt,
                backoff_secs = backoff.as_secs(),
                "eBird request failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    pub async fn fetch_taxonomy(&self) -> Result<Vec<TaxonEntry>> {
        let taxa: Vec<TaxonEntry> = self
            .get_json("/v2/ref/taxonomy/ebird?fmt=json&cat=species")
            .await?;
        info!(entries = taxa.len(), "Fetched eBird taxonomy");
        Ok(taxa)
    }

    /// Child regions of `parent` at `level` ("country", "subnational1" or
    /// "subnational2")
    pub async fn fetch_region_list(&self, level: &str, parent: &str) -> Result<Vec<RegionEntry>> {
        self.get_json(&format!("/v2/ref/region/list/{}/{}?fmt=json", level, parent))
            .await
    }

    pub async fn fetch_countries(&self) -> Result<Vec<RegionEntry>> {
        self.fetch_region_list("country", "world").await
    }

    pub async fn fetch_hotspots(&self, region: &str) -> Result<Vec<HotspotEntry>> {
        self.get_json(&format!("/v2/ref/hotspot/{}?fmt=json", region))
            .await
    }

    /// State and county names for one country
    ///
    /// Names are cosmetic, so a failed list is logged and left out.
    async fn fetch_subregion_names(&self, country: &str) -> Vec<Region> {
        let mut names = Vec::new();
        for level in ["subnational1", "subnational2"] {
            match self.fetch_region_list(level, country).await {
                Ok(entries) => names.extend(entries.into_iter().map(Region::from)),
                Err(e) => {
                    debug!(country = %country, level = level, error = %e, "No region names");
                },
            }
        }
        names
    }

    /// Hotspots and region names for every country, paced by the
    /// configured delay
    ///
    /// A country whose hotspot request fails is logged and skipped; the
    /// result says how many were lost.
    pub async fn fetch_all_hotspots(&self) -> Result<HotspotFetch> {
        let countries = self.fetch_countries().await?;
        let total = countries.len();
        let mut fetch = HotspotFetch::default();

        info!(countries = total, "Fetching hotspots by country");

        for (i, country) in countries.into_iter().enumerate() {
            match self.fetch_hotspots(&country.code).await {
                Ok(entries) => {
                    let before = fetch.hotspots.len();
                    fetch
                        .hotspots
                        .extend(entries.into_iter().filter_map(normalize_hotspot));
                    let subregions = self.fetch_subregion_names(&country.code).await;
                    debug!(
                        country = %country.code,
                        progress = %format!("{}/{}", i + 1, total),
                        hotspots = fetch.hotspots.len() - before,
                        regions = subregions.len(),
                        "Fetched country hotspots"
                    );
                    fetch.regions.extend(subregions);
                },
                Err(e) => {
                    fetch.failed_countries += 1;
                    warn!(country = %country.code, name = %country.name, error = %e, "Skipping country");
                },
            }
            fetch.regions.push(country.into());

            if i + 1 < total && !self.config.hotspot_delay.is_zero() {
                tokio::time::sleep(self.config.hotspot_delay).await;
            }
        }

        Ok(fetch)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn taxon(sci: &str, code: &str, order: f64) -> TaxonEntry {
        TaxonEntry {
            sci_name: sci.to_string(),
            com_name: format!("{} common", code),
            species_code: code.to_string(),
            taxon_order: order,
            category: Some("species".to_string()),
        }
    }

    #[test]
    fn test_species_numbered_in_taxon_order() {
        let species = build_species(vec![
            taxon("Cardinalis cardinalis", "norcar", 30_000.0),
            taxon("Struthio camelus", "ostric2", 1.0),
            taxon("Anas platyrhynchos", "mallar3", 300.5),
        ]);

        let codes: Vec<(u32, &str)> = species.iter().map(|s| (s.id, s.code.as_str())).collect();
        assert_eq!(codes, vec![(1, "ostric2"), (2, "mallar3"), (3, "norcar")]);
    }

    #[test]
    fn test_non_species_categories_dropped() {
        let mut spuh = taxon("Anas sp.", "duck", 2.0);
        spuh.category = Some("spuh".to_string());
        let species = build_species(vec![taxon("Struthio camelus", "ostric2", 1.0), spuh]);
        assert_eq!(species.len(), 1);
    }

    #[test]
    fn test_stakeouts_excluded_and_blank_codes_cleared() {
        let json = r#"[
            {"locId":"L1","locName":"Central Park","countryCode":"US","subnational1Code":"US-NY","subnational2Code":"","lat":40.78,"lng":-73.96,"numSpeciesAllTime":280},
            {"locId":"L2","locName":"Stakeout Snowy Owl","countryCode":"US","subnational1Code":"US-NY","lat":40.0,"lng":-73.0}
        ]"#;
        let entries: Vec<HotspotEntry> = serde_json::from_str(json).unwrap();
        let hotspots: Vec<Hotspot> = entries.into_iter().filter_map(normalize_hotspot).collect();

        assert_eq!(hotspots.len(), 1);
        assert_eq!(hotspots[0].subnational2_code, None);
        assert_eq!(hotspots[0].num_species, Some(280));
        assert_eq!(hotspots[0].num_checklists, None);
    }
}
