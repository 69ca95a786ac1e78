//! Core data models shared by the aggregation and packing stages

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A species from the eBird taxonomy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct Species {
    /// Position in taxonomic order, numbered from 1
    pub id: u32,
    /// Scientific name (e.g., "Cardinalis cardinalis"), the join key for EBD rows
    pub sci_name: String,
    /// Common name (e.g., "Northern Cardinal")
    pub name: String,
    /// eBird species code (e.g., "norcar")
    pub code: String,
    pub taxon_order: f64,
}

/// A public birding hotspot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct Hotspot {
    /// eBird location id (e.g., "L123456")
    pub id: String,
    pub name: String,
    pub country_code: String,
    #[serde(default)]
    pub subnational1_code: Option<String>,
    #[serde(default)]
    pub subnational2_code: Option<String>,
    pub lat: f64,
    pub lng: f64,
    /// Lifetime species count reported by eBird
    #[serde(default)]
    pub num_species: Option<u32>,
    /// Lifetime checklist count reported by eBird
    #[serde(default)]
    pub num_checklists: Option<u32>,
}

/// Display name of a country, state or county
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct Region {
    /// eBird region code (e.g., "US-CA")
    pub code: String,
    pub name: String,
}

/// One row of the filtered observation file
#[derive(Debug, Clone, PartialEq)]
pub struct ChecklistRecord {
    pub location_id: String,
    pub date: NaiveDate,
    pub checklist_id: String,
    /// Shared by every checklist of one group outing; `None` when blank
    pub group_id: Option<String>,
    pub locality_type: String,
    pub all_species_reported: bool,
    pub category: String,
    pub sci_name: String,
}

impl ChecklistRecord {
    pub fn month(&self) -> u8 {
        self.date.month() as u8
    }
}

/// One row of the filtered sampling-event file
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingRecord {
    pub location_id: String,
    pub date: NaiveDate,
    pub checklist_id: String,
    pub group_id: Option<String>,
    /// Absent when the sampling file was projected without the filter columns
    pub locality_type: Option<String>,
    pub all_species_reported: Option<bool>,
}

impl SamplingRecord {
    pub fn month(&self) -> u8 {
        self.date.month() as u8
    }
}

/// Statistics for one (location, month, species)
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct MonthAggregate {
    pub location_id: String,
    /// Month of year, 1-12, pooled across years
    pub month: u8,
    pub species_id: u32,
    pub obs: u32,
    pub samples: u32,
    pub score: f64,
}

/// Statistics for one (location, species) over the whole annual cycle
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct YearAggregate {
    pub location_id: String,
    pub species_id: u32,
    pub obs: u32,
    pub samples: u32,
    pub score: f64,
}

/// A finished aggregate on its way to storage
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateRow {
    Month(MonthAggregate),
    Year(YearAggregate),
}

impl AggregateRow {
    pub fn obs(&self) -> u32 {
        match self {
            AggregateRow::Month(m) => m.obs,
            AggregateRow::Year(y) => y.obs,
        }
    }

    pub fn samples(&self) -> u32 {
        match self {
            AggregateRow::Month(m) => m.samples,
            AggregateRow::Year(y) => y.samples,
        }
    }
}
