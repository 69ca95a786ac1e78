//! Shared fixtures for ebd-aggregator integration tests
//!
//! Builds a tiny reference set and filtered TSV inputs in a temp directory:
//!
//! | hotspot | country | subnational1 | subnational2 |
//! |---------|---------|--------------|--------------|
//! | L1      | US      | US-CA        | US-CA-001    |
//! | L2      | US      | US-CA        | US-CA-001    |
//! | L3      | US      | US-NY        |              |
//! | L4      | MX      | MX-ROO       |              |
//!
//! Every region has a display name except MX-ROO.

#![allow(dead_code)]

use ebd_aggregator::aggregate::{AggregateJob, AggregationConfig};
use ebd_aggregator::engine::{EngineSettings, MIN_MEMORY_LIMIT};
use ebd_aggregator::models::{Hotspot, MonthAggregate, Region, Species, YearAggregate};
use ebd_aggregator::reference::{write_reference, ReferenceData, ReferencePaths};
use ebd_aggregator::score::DEFAULT_Z;
use ebd_aggregator::storage::{DEFAULT_INSERT_BATCH, TargetsReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const OBS_HEADER: &str = "LOCALITY ID\tOBSERVATION DATE\tSAMPLING EVENT IDENTIFIER\tGROUP IDENTIFIER\tLOCALITY TYPE\tALL SPECIES REPORTED\tCATEGORY\tSCIENTIFIC NAME\tOBSERVATION COUNT";

pub const SAMPLING_HEADER: &str = "LOCALITY ID\tOBSERVATION DATE\tSAMPLING EVENT IDENTIFIER\tGROUP IDENTIFIER\tLOCALITY TYPE\tALL SPECIES REPORTED";

pub const ALPHA: &str = "Alpha alpha";
pub const BETA: &str = "Beta beta";
pub const GAMMA: &str = "Gamma gamma";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ebd_aggregator=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn species() -> Vec<Species> {
    [(ALPHA, "Alpha", "alpha1"), (BETA, "Beta", "beta1"), (GAMMA, "Gamma", "gamma1")]
        .iter()
        .enumerate()
        .map(|(i, (sci, name, code))| Species {
            id: i as u32 + 1,
            sci_name: sci.to_string(),
            name: name.to_string(),
            code: code.to_string(),
            taxon_order: (i + 1) as f64 * 10.0,
        })
        .collect()
}

pub fn hotspot(id: &str, country: &str, sub1: Option<&str>, sub2: Option<&str>, lat: f64, lng: f64) -> Hotspot {
    Hotspot {
        id: id.to_string(),
        name: format!("{} Marsh", id),
        country_code: country.to_string(),
        subnational1_code: sub1.map(String::from),
        subnational2_code: sub2.map(String::from),
        lat,
        lng,
        num_species: Some(100),
        num_checklists: Some(250),
    }
}

pub fn hotspots() -> Vec<Hotspot> {
    vec![
        hotspot("L1", "US", Some("US-CA"), Some("US-CA-001"), 37.80, -122.27),
        hotspot("L2", "US", Some("US-CA"), Some("US-CA-001"), 37.75, -122.20),
        hotspot("L3", "US", Some("US-NY"), None, 40.78, -73.97),
        hotspot("L4", "MX", Some("MX-ROO"), None, 20.63, -87.07),
    ]
}

pub fn regions() -> Vec<Region> {
    [
        ("MX", "Mexico"),
        ("US", "United States"),
        ("US-CA", "California"),
        ("US-CA-001", "Alameda"),
        ("US-NY", "New York"),
    ]
    .iter()
    .map(|(code, name)| Region {
        code: code.to_string(),
        name: name.to_string(),
    })
    .collect()
}

pub fn reference() -> Arc<ReferenceData> {
    Arc::new(
        ReferenceData::new(species(), hotspots())
            .unwrap()
            .with_regions(regions()),
    )
}

/// Write the reference files under `dir/reference`
pub fn write_reference_files(dir: &Path) -> ReferencePaths {
    let paths = ReferencePaths::in_dir(&dir.join("reference"));
    write_reference(&paths, &species(), &hotspots(), &regions()).unwrap();
    paths
}

/// A complete, species-level hotspot observation row
pub fn obs_row(location: &str, date: &str, checklist: &str, group: Option<&str>, sci_name: &str) -> String {
    format!(
        "{}\t{}\t{}\t{}\tH\t1\tspecies\t{}\t1",
        location,
        date,
        checklist,
        group.unwrap_or(""),
        sci_name
    )
}

pub fn sampling_row(location: &str, date: &str, checklist: &str, group: Option<&str>) -> String {
    format!("{}\t{}\t{}\t{}\tH\t1", location, date, checklist, group.unwrap_or(""))
}

pub fn write_tsv(path: &Path, header: &str, rows: &[String]) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut body = String::from(header);
    body.push('\n');
    for row in rows {
        body.push_str(row);
        body.push('\n');
    }
    std::fs::write(path, body).unwrap();
    path.to_path_buf()
}

/// Engine limits with the scratch directory next to `output`
pub fn engine(output: &Path, memory_limit: u64, threads: usize) -> EngineSettings {
    let root = output.parent().unwrap_or(Path::new(".")).join("engine");
    EngineSettings::new(memory_limit, threads, root).unwrap()
}

pub fn job(
    observations: &Path,
    sampling: Option<&Path>,
    output: &Path,
    min_samples: u32,
) -> AggregateJob {
    AggregateJob {
        observations: observations.to_path_buf(),
        sampling: sampling.map(Path::to_path_buf),
        output: output.to_path_buf(),
        version: "test-2025".to_string(),
        config: AggregationConfig {
            z: DEFAULT_Z,
            min_samples,
        },
        engine: engine(output, MIN_MEMORY_LIMIT, 2),
        channel_capacity: 16,
        insert_batch: DEFAULT_INSERT_BATCH,
    }
}

/// Every month and year row of a finished database
pub async fn read_all(database: &Path) -> (Vec<MonthAggregate>, Vec<YearAggregate>) {
    let reader = TargetsReader::open(database, 1).await.unwrap();
    let mut months = Vec::new();
    let mut years = Vec::new();
    for country in ["MX", "US"] {
        months.extend(reader.region_month_rows(country).await.unwrap());
        years.extend(reader.region_year_rows(country).await.unwrap());
    }
    reader.close().await;
    (months, years)
}

/// Ten June checklists at L2 where Beta appears on four of them
pub fn june_rows() -> Vec<String> {
    let mut rows = Vec::new();
    for i in 0..10 {
        let date = format!("2023-06-{:02}", i + 1);
        let checklist = format!("S2{:02}", i);
        rows.push(obs_row("L2", &date, &checklist, None, ALPHA));
        if i < 4 {
            rows.push(obs_row("L2", &date, &checklist, None, BETA));
        }
    }
    rows
}
