//! Aggregation engine
//!
//! Turns the filtered observation (and optional sampling) stream into
//! monthly and yearly (location, species) statistics.
//!
//! # Flow
//!
//! 1. **Collect**: each valid row becomes a compact key appended to the
//!    scratch engine ([`crate::engine`]): `(location, month, species, unit)`
//!    for detections and `(location, month, unit)` for sampling events.
//!    Every detection also records its sampling event, so the denominator
//!    always covers the numerator.
//! 2. **Group**: DuckDB counts distinct units per (location, month) for
//!    samples and per (location, month, species) for obs, then pools the
//!    months into per-year totals.
//! 3. **Emit**: totals meeting the minimum-evidence threshold are scored and
//!    handed to a callback, which in the pipeline forwards them through a
//!    bounded channel to the SQLite writer.
//!
//! Memory is bounded by the engine's memory limit; DuckDB spills past it.

use ebd_common::format::format_duration;
use ebd_common::publish::PartialFile;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dedup::SamplingUnit;
use crate::engine::{EngineSettings, KeyLoader, Scratch};
use crate::error::{PipelineError, Result};
use crate::models::{AggregateRow, MonthAggregate, YearAggregate};
use crate::parser::{classify, classify_sampling, ObservationReader, Rejection, SamplingReader};
use crate::reference::ReferenceData;
use crate::score::{WilsonScorer, DEFAULT_Z};
use crate::storage::{TargetsWriter, WriteSummary};

pub const DEFAULT_MIN_SAMPLES: u32 = 2;

/// Unknown species names logged individually before going quiet
const UNKNOWN_SPECIES_LOG_LIMIT: usize = 10;

const PROGRESS_INTERVAL: u64 = 10_000_000;

/// Scoring parameters for one run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationConfig {
    pub z: f64,
    /// Aggregates with fewer samples are dropped, at both grains
    pub min_samples: u32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            z: DEFAULT_Z,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

/// Row-level diagnostics for one aggregation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationStats {
    pub rows_read: u64,
    pub malformed_rows: u64,
    pub rejected_not_hotspot: u64,
    pub rejected_incomplete: u64,
    pub rejected_not_species: u64,
    pub unknown_species: u64,
    pub unknown_location: u64,
    pub sampling_rows_read: u64,
    pub sampling_malformed: u64,
    pub sampling_rejected: u64,
    pub sampling_unknown_location: u64,
    /// Keys appended to the engine, duplicates included
    pub observation_keys: u64,
    pub sample_keys: u64,
    pub locations: u64,
    pub month_rows: u64,
    pub year_rows: u64,
    #[serde(skip)]
    pub unknown_species_names: BTreeSet<String>,
}

impl AggregationStats {
    fn record_unknown_species(&mut self, sci_name: &str) {
        self.unknown_species += 1;
        if self.unknown_species_names.len() < UNKNOWN_SPECIES_LOG_LIMIT
            && self.unknown_species_names.insert(sci_name.to_string())
        {
            warn!(sci_name = %sci_name, "Scientific name not in species reference, dropping rows");
        }
    }

    fn record_rejection(&mut self, rejection: Rejection) {
        match rejection {
            Rejection::NotHotspot => self.rejected_not_hotspot += 1,
            Rejection::Incomplete => self.rejected_incomplete += 1,
            Rejection::NotSpeciesLevel => self.rejected_not_species += 1,
        }
    }

    /// Rows that became detection keys
    pub fn accepted_rows(&self) -> u64 {
        self.rows_read
            - self.malformed_rows
            - self.rejected_not_hotspot
            - self.rejected_incomplete
            - self.rejected_not_species
            - self.unknown_species
            - self.unknown_location
    }
}

/// Aggregation over a scratch [`crate::engine`] database
pub struct AggregationEngine {
    config: AggregationConfig,
    scorer: WilsonScorer,
    reference: Arc<ReferenceData>,
    settings: EngineSettings,
}

impl AggregationEngine {
    pub fn new(config: AggregationConfig, reference: Arc<ReferenceData>, settings: EngineSettings) -> Self {
        Self {
            scorer: WilsonScorer::new(config.z),
            config,
            reference,
            settings,
        }
    }

    /// Aggregate both inputs, handing every finished row to `emit`
    ///
    /// Month rows come first, ordered by (location, month, species), then
    /// year rows ordered by (location, species).
    pub fn run<R1, R2, F>(
        &self,
        observations: ObservationReader<R1>,
        sampling: Option<SamplingReader<R2>>,
        mut emit: F,
    ) -> Result<AggregationStats>
    where
        R1: Read,
        R2: Read,
        F: FnMut(AggregateRow) -> Result<()>,
    {
        let mut stats = AggregationStats::default();
        let scratch = Scratch::open(&self.settings)?;

        let started = Instant::now();
        let mut loader = scratch.loader()?;
        self.collect_observations(observations, &mut loader, &mut stats)?;
        info!(
            rows = stats.rows_read,
            accepted = stats.accepted_rows(),
            malformed = stats.malformed_rows,
            unknown_species = stats.unknown_species,
            unknown_location = stats.unknown_location,
            elapsed = %format_duration(started.elapsed()),
            "Collected observation rows"
        );

        if let Some(sampling) = sampling {
            let started = Instant::now();
            self.collect_sampling(sampling, &mut loader, &mut stats)?;
            info!(
                rows = stats.sampling_rows_read,
                malformed = stats.sampling_malformed,
                rejected = stats.sampling_rejected,
                unknown_location = stats.sampling_unknown_location,
                elapsed = %format_duration(started.elapsed()),
                "Collected sampling rows"
            );
        }
        let (observation_keys, sample_keys) = loader.finish()?;
        stats.observation_keys = observation_keys;
        stats.sample_keys = sample_keys;

        let started = Instant::now();
        scratch.group()?;
        stats.locations = scratch.location_count()?;

        let min_samples = self.config.min_samples;
        stats.month_rows = scratch.month_totals(min_samples, |t| {
            emit(AggregateRow::Month(MonthAggregate {
                score: self.scorer.score(t.obs, t.samples),
                location_id: t.location_id,
                month: t.month,
                species_id: t.species_id,
                obs: t.obs,
                samples: t.samples,
            }))
        })?;
        stats.year_rows = scratch.year_totals(min_samples, |t| {
            emit(AggregateRow::Year(YearAggregate {
                score: self.scorer.score(t.obs, t.samples),
                location_id: t.location_id,
                species_id: t.species_id,
                obs: t.obs,
                samples: t.samples,
            }))
        })?;

        info!(
            locations = stats.locations,
            month_rows = stats.month_rows,
            year_rows = stats.year_rows,
            elapsed = %format_duration(started.elapsed()),
            "Grouped aggregation keys"
        );

        Ok(stats)
    }

    fn collect_observations<R: Read>(
        &self,
        reader: ObservationReader<R>,
        loader: &mut KeyLoader<'_>,
        stats: &mut AggregationStats,
    ) -> Result<()> {
        for row in reader {
            stats.rows_read += 1;
            if stats.rows_read % PROGRESS_INTERVAL == 0 {
                info!(rows = stats.rows_read, "Reading observations");
            }

            let record = match row? {
                Ok(record) => record,
                Err(e) => {
                    stats.malformed_rows += 1;
                    debug!(row = stats.rows_read, error = %e, "Skipping malformed observation row");
                    continue;
                },
            };

            let rejection = classify(&record);
            if let Some(r @ (Rejection::NotHotspot | Rejection::Incomplete)) = rejection {
                stats.record_rejection(r);
                continue;
            }

            if !self.reference.has_hotspot(&record.location_id) {
                stats.unknown_location += 1;
                continue;
            }

            let month = record.month();
            let unit = SamplingUnit::new(record.date, record.group_id.as_deref(), &record.checklist_id);

            // A complete hotspot checklist is a sample even when this row's
            // taxon is not counted
            loader.push_sample(&record.location_id, month, unit.as_str())?;

            if let Some(r) = rejection {
                stats.record_rejection(r);
                continue;
            }

            let Some(species_id) = self.reference.species_id(&record.sci_name) else {
                stats.record_unknown_species(&record.sci_name);
                continue;
            };

            loader.push_observation(&record.location_id, month, species_id, unit.as_str())?;
        }
        Ok(())
    }

    fn collect_sampling<R: Read>(
        &self,
        reader: SamplingReader<R>,
        loader: &mut KeyLoader<'_>,
        stats: &mut AggregationStats,
    ) -> Result<()> {
        for row in reader {
            stats.sampling_rows_read += 1;

            let record = match row? {
                Ok(record) => record,
                Err(e) => {
                    stats.sampling_malformed += 1;
                    debug!(row = stats.sampling_rows_read, error = %e, "Skipping malformed sampling row");
                    continue;
                },
            };

            if classify_sampling(&record).is_some() {
                stats.sampling_rejected += 1;
                continue;
            }
            if !self.reference.has_hotspot(&record.location_id) {
                stats.sampling_unknown_location += 1;
                continue;
            }

            let unit = SamplingUnit::new(record.date, record.group_id.as_deref(), &record.checklist_id);
            loader.push_sample(&record.location_id, record.month(), unit.as_str())?;
        }
        Ok(())
    }
}

/// Inputs and tuning for one database build
#[derive(Debug, Clone)]
pub struct AggregateJob {
    pub observations: PathBuf,
    pub sampling: Option<PathBuf>,
    pub output: PathBuf,
    pub version: String,
    pub config: AggregationConfig,
    pub engine: EngineSettings,
    pub channel_capacity: usize,
    pub insert_batch: usize,
}

/// Outcome of [`aggregate_to_database`]
#[derive(Debug, Clone)]
pub struct AggregationReport {
    pub stats: AggregationStats,
    pub written: WriteSummary,
    pub output: PathBuf,
    pub elapsed: Duration,
}

impl AggregationReport {
    pub fn summary(&self) -> String {
        format!(
            "{} month rows, {} year rows over {} locations from {} rows ({} malformed, {} unknown species, {} unknown locations) in {}",
            self.written.month_rows,
            self.written.year_rows,
            self.stats.locations,
            self.stats.rows_read,
            self.stats.malformed_rows,
            self.stats.unknown_species,
            self.stats.unknown_location,
            format_duration(self.elapsed)
        )
    }
}

/// Build the targets database from filtered inputs
///
/// Headers are validated and the reference tables written before any
/// aggregate row; the database only appears at `job.output` after the
/// transaction commits.
pub async fn aggregate_to_database(
    job: &AggregateJob,
    reference: Arc<ReferenceData>,
) -> Result<AggregationReport> {
    let started = Instant::now();

    let observations = ObservationReader::open(&job.observations)?;
    let sampling = job
        .sampling
        .as_deref()
        .map(SamplingReader::open)
        .transpose()?;

    let partial = PartialFile::create(&job.output)?;
    let mut writer = TargetsWriter::create(partial.path(), job.insert_batch).await?;
    if let Err(e) = writer.insert_reference(&reference).await {
        writer.abort().await;
        return Err(e);
    }

    let (tx, mut rx) = mpsc::channel::<AggregateRow>(job.channel_capacity.max(1));
    let engine = AggregationEngine::new(job.config, reference, job.engine.clone());
    let producer = tokio::task::spawn_blocking(move || {
        engine.run(observations, sampling, |row| {
            tx.blocking_send(row)
                .map_err(|_| PipelineError::Aborted("database writer stopped".to_string()))
        })
    });

    let mut write_error = None;
    while let Some(row) = rx.recv().await {
        if let Err(e) = writer.push(row).await {
            write_error = Some(e);
            break;
        }
    }
    drop(rx);

    let produced = producer
        .await
        .map_err(|e| PipelineError::Aborted(format!("aggregation task failed: {}", e)));

    let stats = match (write_error, produced) {
        (Some(e), _) | (None, Err(e)) | (None, Ok(Err(e))) => {
            writer.abort().await;
            return Err(e);
        },
        (None, Ok(Ok(stats))) => stats,
    };

    let metadata = vec![
        ("version".to_string(), job.version.clone()),
        ("z".to_string(), job.config.z.to_string()),
        ("min_samples".to_string(), job.config.min_samples.to_string()),
        ("rows_read".to_string(), stats.rows_read.to_string()),
        ("locations".to_string(), stats.locations.to_string()),
    ];
    let written = writer.finish(&metadata).await?;
    let output = partial.publish()?;

    Ok(AggregationReport {
        stats,
        written,
        output,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::MIN_MEMORY_LIMIT;
    use crate::models::{Hotspot, Species};
    use std::path::Path;

    const OBS_HEADER: &str = "LOCALITY ID\tOBSERVATION DATE\tSAMPLING EVENT IDENTIFIER\tGROUP IDENTIFIER\tLOCALITY TYPE\tALL SPECIES REPORTED\tCATEGORY\tSCIENTIFIC NAME\tOBSERVATION COUNT";

    fn reference() -> Arc<ReferenceData> {
        let species = vec![
            Species {
                id: 1,
                sci_name: "Alpha alpha".to_string(),
                name: "Alpha".to_string(),
                code: "alpha1".to_string(),
                taxon_order: 1.0,
            },
            Species {
                id: 2,
                sci_name: "Beta beta".to_string(),
                name: "Beta".to_string(),
                code: "beta1".to_string(),
                taxon_order: 2.0,
            },
        ];
        let hotspots = ["L1", "L2"]
            .iter()
            .map(|id| Hotspot {
                id: id.to_string(),
                name: id.to_string(),
                country_code: "US".to_string(),
                subnational1_code: Some("US-CA".to_string()),
                subnational2_code: None,
                lat: 0.0,
                lng: 0.0,
                num_species: None,
                num_checklists: None,
            })
            .collect();
        Arc::new(ReferenceData::new(species, hotspots).unwrap())
    }

    fn run(rows: &[&str], min_samples: u32) -> (Vec<AggregateRow>, AggregationStats) {
        let input = format!("{}\n{}\n", OBS_HEADER, rows.join("\n"));
        let reader = ObservationReader::new(input.as_bytes(), Path::new("obs.tsv")).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let engine = AggregationEngine::new(
            AggregationConfig { z: DEFAULT_Z, min_samples },
            reference(),
            EngineSettings::new(MIN_MEMORY_LIMIT, 2, dir.path()).unwrap(),
        );

        let mut out = Vec::new();
        let stats = engine
            .run(reader, None::<SamplingReader<&[u8]>>, |row| {
                out.push(row);
                Ok(())
            })
            .unwrap();
        (out, stats)
    }

    fn month_rows(rows: &[AggregateRow]) -> Vec<&MonthAggregate> {
        rows.iter()
            .filter_map(|r| match r {
                AggregateRow::Month(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_group_counts_once() {
        let rows = [
            "L1\t2024-03-02\tS1\tG1\tH\t1\tspecies\tAlpha alpha\t3",
            "L1\t2024-03-02\tS2\tG1\tH\t1\tspecies\tAlpha alpha\t2",
            "L1\t2024-03-02\tS3\tG1\tH\t1\tspecies\tAlpha alpha\tX",
        ];
        let (out, _) = run(&rows, 1);
        let months = month_rows(&out);
        assert_eq!(months.len(), 1);
        assert_eq!((months[0].obs, months[0].samples), (1, 1));
    }

    #[test]
    fn test_threshold_drops_rows() {
        let rows = [
            "L1\t2024-03-02\tS1\tG1\tH\t1\tspecies\tAlpha alpha\t3",
            "L1\t2024-03-02\tS2\tG1\tH\t1\tspecies\tBeta beta\t1",
        ];
        let (out, stats) = run(&rows, DEFAULT_MIN_SAMPLES);
        assert!(out.is_empty());
        assert_eq!(stats.month_rows, 0);
        assert_eq!(stats.year_rows, 0);
    }

    #[test]
    fn test_samples_include_checklists_without_the_species() {
        let rows = [
            "L2\t2024-06-01\tS1\t\tH\t1\tspecies\tAlpha alpha\t1",
            "L2\t2024-06-02\tS2\t\tH\t1\tspecies\tBeta beta\t1",
            "L2\t2024-06-03\tS3\t\tH\t1\tspecies\tBeta beta\t1",
        ];
        let (out, _) = run(&rows, 2);
        let alpha = month_rows(&out).into_iter().find(|m| m.species_id == 1).unwrap();
        assert_eq!((alpha.obs, alpha.samples), (1, 3));
    }

    #[test]
    fn test_year_pools_months_and_reapplies_threshold() {
        // One checklist per month: no month reaches 2 samples, the year does
        let rows = [
            "L1\t2024-01-05\tS1\t\tH\t1\tspecies\tAlpha alpha\t1",
            "L1\t2023-07-05\tS2\t\tH\t1\tspecies\tAlpha alpha\t1",
            "L1\t2024-11-05\tS3\t\tH\t1\tspecies\tBeta beta\t1",
        ];
        let (out, stats) = run(&rows, 2);
        assert_eq!(stats.month_rows, 0);

        let years: Vec<&YearAggregate> = out
            .iter()
            .filter_map(|r| match r {
                AggregateRow::Year(y) => Some(y),
                _ => None,
            })
            .collect();
        assert_eq!(years.len(), 2);
        assert_eq!((years[0].species_id, years[0].obs, years[0].samples), (1, 2, 3));
        assert_eq!((years[1].species_id, years[1].obs, years[1].samples), (2, 1, 3));
    }

    #[test]
    fn test_rejections_and_unknowns_are_counted() {
        let rows = [
            "L1\t2024-03-02\tS1\t\tP\t1\tspecies\tAlpha alpha\t1",
            "L1\t2024-03-02\tS2\t\tH\t0\tspecies\tAlpha alpha\t1",
            "L1\t2024-03-02\tS3\t\tH\t1\tspuh\tAlpha sp.\t1",
            "L1\t2024-03-02\tS4\t\tH\t1\tspecies\tGamma gamma\t1",
            "L9\t2024-03-02\tS5\t\tH\t1\tspecies\tAlpha alpha\t1",
            "L1\tnot-a-date\tS6\t\tH\t1\tspecies\tAlpha alpha\t1",
        ];
        let (out, stats) = run(&rows, 1);
        assert_eq!(stats.rows_read, 6);
        assert_eq!(stats.rejected_not_hotspot, 1);
        assert_eq!(stats.rejected_incomplete, 1);
        assert_eq!(stats.rejected_not_species, 1);
        assert_eq!(stats.unknown_species, 1);
        assert_eq!(stats.unknown_location, 1);
        assert_eq!(stats.malformed_rows, 1);
        assert_eq!(stats.accepted_rows(), 0);
        assert!(stats.unknown_species_names.contains("Gamma gamma"));
        // S3 and S4 are complete hotspot checklists with no counted species
        assert!(month_rows(&out).is_empty());
    }

    #[test]
    fn test_group_members_reporting_different_species() {
        let rows = [
            "L1\t2024-03-02\tS1\tG1\tH\t1\tspecies\tAlpha alpha\t3",
            "L1\t2024-03-02\tS2\tG1\tH\t1\tspecies\tBeta beta\t1",
        ];
        let (out, stats) = run(&rows, 1);
        assert_eq!(stats.sample_keys, 2);
        let counts: Vec<(u32, u32, u32)> = month_rows(&out)
            .iter()
            .map(|m| (m.species_id, m.obs, m.samples))
            .collect();
        assert_eq!(counts, vec![(1, 1, 1), (2, 1, 1)]);
    }

    #[test]
    fn test_month_rows_precede_year_rows() {
        let rows = [
            "L2\t2024-06-01\tS1\t\tH\t1\tspecies\tBeta beta\t1",
            "L1\t2024-06-01\tS2\t\tH\t1\tspecies\tAlpha alpha\t1",
        ];
        let (out, stats) = run(&rows, 1);
        assert_eq!((stats.month_rows, stats.year_rows, stats.locations), (2, 2, 2));

        let kinds: Vec<(&str, &str)> = out
            .iter()
            .map(|r| match r {
                AggregateRow::Month(m) => ("month", m.location_id.as_str()),
                AggregateRow::Year(y) => ("year", y.location_id.as_str()),
            })
            .collect();
        assert_eq!(kinds, vec![("month", "L1"), ("month", "L2"), ("year", "L1"), ("year", "L2")]);
    }
}
