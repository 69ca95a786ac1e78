//! Columnar grouping engine
//!
//! Aggregation validates rows in Rust and appends compact keys to a scratch
//! DuckDB database. DuckDB then computes the grouped distinct counts on its
//! own thread pool, spilling to the scratch directory once the memory limit
//! is reached. The scratch directory is removed when the [`Scratch`] drops.
//!
//! Tables:
//!
//! - `observations(location_id, month, species_id, unit)`: one row per
//!   detection of a species on a sampling unit
//! - `samples(location_id, month, unit)`: one row per sampling unit seen
//!
//! Duplicates are expected in both; every count is `COUNT(DISTINCT unit)`.

use duckdb::{params, Appender, Connection};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use ebd_common::format::format_size;

/// Smallest memory limit handed to DuckDB
pub const MIN_MEMORY_LIMIT: u64 = 64 * 1024 * 1024;

const SCHEMA: &str = r#"
CREATE TABLE observations (
    location_id VARCHAR NOT NULL,
    month INTEGER NOT NULL,
    species_id BIGINT NOT NULL,
    unit VARCHAR NOT NULL
);

CREATE TABLE samples (
    location_id VARCHAR NOT NULL,
    month INTEGER NOT NULL,
    unit VARCHAR NOT NULL
);
"#;

const GROUP_MONTHS: &str = r#"
CREATE TABLE month_samples AS
    SELECT location_id, month, COUNT(DISTINCT unit) AS samples
    FROM samples
    GROUP BY location_id, month;

CREATE TABLE month_obs AS
    SELECT location_id, month, species_id, COUNT(DISTINCT unit) AS obs
    FROM observations
    GROUP BY location_id, month, species_id;
"#;

const INCONSISTENT_MONTH: &str = r#"
SELECT o.location_id, o.month, o.species_id, o.obs, s.samples
FROM month_obs o
LEFT JOIN month_samples s ON s.location_id = o.location_id AND s.month = o.month
WHERE s.samples IS NULL OR o.obs > s.samples
ORDER BY o.location_id, o.month, o.species_id
LIMIT 1
"#;

const MONTH_TOTALS: &str = r#"
SELECT o.location_id, o.month, o.species_id, o.obs, s.samples
FROM month_obs o
JOIN month_samples s ON s.location_id = o.location_id AND s.month = o.month
WHERE s.samples >= ?
ORDER BY o.location_id, o.month, o.species_id
"#;

// Units carry their date, so monthly distinct counts add up to the year
const YEAR_TOTALS: &str = r#"
WITH year_samples AS (
    SELECT location_id, CAST(SUM(samples) AS BIGINT) AS samples
    FROM month_samples
    GROUP BY location_id
), year_obs AS (
    SELECT location_id, species_id, CAST(SUM(obs) AS BIGINT) AS obs
    FROM month_obs
    GROUP BY location_id, species_id
)
SELECT o.location_id, o.species_id, o.obs, s.samples
FROM year_obs o
JOIN year_samples s ON s.location_id = o.location_id
WHERE s.samples >= ?
ORDER BY o.location_id, o.species_id
"#;

/// Resource ceilings for the grouping engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    memory_limit: u64,
    threads: usize,
    temp_root: PathBuf,
}

impl EngineSettings {
    /// Fails with [`PipelineError::ResourceExhausted`] below [`MIN_MEMORY_LIMIT`]
    pub fn new(memory_limit: u64, threads: usize, temp_root: impl Into<PathBuf>) -> Result<Self> {
        if memory_limit < MIN_MEMORY_LIMIT {
            return Err(PipelineError::ResourceExhausted(format!(
                "memory limit {} is below the {} the aggregation engine needs",
                format_size(memory_limit),
                format_size(MIN_MEMORY_LIMIT)
            )));
        }
        Ok(Self {
            memory_limit,
            threads: threads.max(1),
            temp_root: temp_root.into(),
        })
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }
}

/// Quote a value as a SQL string literal
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn to_count(value: i64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| PipelineError::Aborted(format!("{} count {} out of range", what, value)))
}

fn to_month(value: i32) -> Result<u8> {
    match u8::try_from(value) {
        Ok(month @ 1..=12) => Ok(month),
        _ => Err(PipelineError::Aborted(format!("month {} out of range", value))),
    }
}

/// Distinct-unit counts for one (location, month, species)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthTotal {
    pub location_id: String,
    pub month: u8,
    pub species_id: u32,
    pub obs: u32,
    pub samples: u32,
}

/// Counts for one (location, species) pooled over every month
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearTotal {
    pub location_id: String,
    pub species_id: u32,
    pub obs: u32,
    pub samples: u32,
}

/// Scratch database for one aggregation run
pub struct Scratch {
    conn: Connection,
    dir: TempDir,
}

impl Scratch {
    pub fn open(settings: &EngineSettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.temp_root).map_err(|e| {
            PipelineError::from_io_with_context(e, "creating engine temp directory")
        })?;
        let dir = tempfile::Builder::new()
            .prefix("ebd-aggregate-")
            .tempdir_in(&settings.temp_root)
            .map_err(|e| PipelineError::from_io_with_context(e, "creating engine scratch directory"))?;

        let conn = Connection::open(dir.path().join("keys.duckdb"))?;
        let spill = dir.path().join("spill");
        conn.execute_batch(&format!(
            "SET memory_limit = '{}MiB';\n\
             SET threads = {};\n\
             SET temp_directory = {};\n\
             SET preserve_insertion_order = false;",
            settings.memory_limit >> 20,
            settings.threads,
            sql_literal(&spill.to_string_lossy())
        ))?;
        conn.execute_batch(SCHEMA)?;

        info!(
            memory_limit = %format_size(settings.memory_limit),
            threads = settings.threads,
            scratch = %dir.path().display(),
            "Aggregation engine ready"
        );
        Ok(Self { conn, dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Appenders for both key tables
    pub fn loader(&self) -> Result<KeyLoader<'_>> {
        Ok(KeyLoader {
            observations: self.conn.appender("observations")?,
            samples: self.conn.appender("samples")?,
            observation_keys: 0,
            sample_keys: 0,
        })
    }

    /// Materialize the monthly distinct counts and check them
    ///
    /// Every detection must fall on a sampled (location, month) with at
    /// least as many units; anything else means the keys were loaded wrong.
    pub fn group(&self) -> Result<()> {
        self.conn.execute_batch(GROUP_MONTHS)?;

        let mut stmt = self.conn.prepare(INCONSISTENT_MONTH)?;
        let mut rows = stmt.query(params![])?;
        if let Some(row) = rows.next()? {
            let location: String = row.get(0)?;
            let month: i32 = row.get(1)?;
            let species_id: i64 = row.get(2)?;
            let obs: i64 = row.get(3)?;
            let samples: Option<i64> = row.get(4)?;
            return Err(PipelineError::Aborted(match samples {
                None => format!(
                    "{} month {} species {}: observations without sampling events",
                    location, month, species_id
                ),
                Some(samples) => format!(
                    "{} month {} species {}: {} observations exceed {} samples",
                    location, month, species_id, obs, samples
                ),
            }));
        }
        Ok(())
    }

    /// Locations with at least one sampling unit
    pub fn location_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT location_id) FROM month_samples",
            params![],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Month totals with at least `min_samples`, ordered by key
    ///
    /// Requires [`Scratch::group`].
    pub fn month_totals<F>(&self, min_samples: u32, mut emit: F) -> Result<u64>
    where
        F: FnMut(MonthTotal) -> Result<()>,
    {
        let mut stmt = self.conn.prepare(MONTH_TOTALS)?;
        let mut rows = stmt.query(params![i64::from(min_samples)])?;
        let mut emitted = 0;
        while let Some(row) = rows.next()? {
            emit(MonthTotal {
                location_id: row.get(0)?,
                month: to_month(row.get(1)?)?,
                species_id: to_count(row.get(2)?, "species id")?,
                obs: to_count(row.get(3)?, "observation")?,
                samples: to_count(row.get(4)?, "sample")?,
            })?;
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Year totals with at least `min_samples` pooled samples
    ///
    /// The threshold applies to the pooled count, so a location can pass here
    /// without any single month passing. Requires [`Scratch::group`].
    pub fn year_totals<F>(&self, min_samples: u32, mut emit: F) -> Result<u64>
    where
        F: FnMut(YearTotal) -> Result<()>,
    {
        let mut stmt = self.conn.prepare(YEAR_TOTALS)?;
        let mut rows = stmt.query(params![i64::from(min_samples)])?;
        let mut emitted = 0;
        while let Some(row) = rows.next()? {
            emit(YearTotal {
                location_id: row.get(0)?,
                species_id: to_count(row.get(1)?, "species id")?,
                obs: to_count(row.get(2)?, "observation")?,
                samples: to_count(row.get(3)?, "sample")?,
            })?;
            emitted += 1;
        }
        Ok(emitted)
    }
}

/// Streams keys into the scratch tables
pub struct KeyLoader<'a> {
    observations: Appender<'a>,
    samples: Appender<'a>,
    observation_keys: u64,
    sample_keys: u64,
}

impl KeyLoader<'_> {
    pub fn push_observation(
        &mut self,
        location_id: &str,
        month: u8,
        species_id: u32,
        unit: &str,
    ) -> Result<()> {
        self.observations.append_row(params![
            location_id,
            i32::from(month),
            i64::from(species_id),
            unit
        ])?;
        self.observation_keys += 1;
        Ok(())
    }

    pub fn push_sample(&mut self, location_id: &str, month: u8, unit: &str) -> Result<()> {
        self.samples
            .append_row(params![location_id, i32::from(month), unit])?;
        self.sample_keys += 1;
        Ok(())
    }

    /// Flush both appenders, returning (observation, sample) key counts
    pub fn finish(mut self) -> Result<(u64, u64)> {
        self.observations.flush()?;
        self.samples.flush()?;
        debug!(
            observations = self.observation_keys,
            samples = self.sample_keys,
            "Loaded aggregation keys"
        );
        Ok((self.observation_keys, self.sample_keys))
    }
}
