//! SQLite persistence for the targets database
//!
//! The writer owns a single connection and one transaction spanning the
//! whole build. Nothing is visible at the target path until the caller
//! publishes the file after [`TargetsWriter::finish`].

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{AggregateRow, Hotspot, MonthAggregate, Region, Species, YearAggregate};
use crate::reference::ReferenceData;
use crate::region::{is_valid_code, resolve_hotspot, RegionLevel};

pub const DEFAULT_INSERT_BATCH: usize = 500;

/// Largest batch that stays under SQLite's bound-parameter limit for the
/// widest insert
pub const MAX_INSERT_BATCH: usize = 5000;

const SCHEMA: &str = r#"
CREATE TABLE species (
    id INTEGER PRIMARY KEY,
    sci_name TEXT NOT NULL,
    name TEXT NOT NULL,
    code TEXT NOT NULL UNIQUE,
    taxon_order REAL NOT NULL
);

CREATE TABLE hotspots (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    country_code TEXT NOT NULL,
    subnational1_code TEXT,
    subnational2_code TEXT,
    region_code TEXT,
    lat REAL NOT NULL,
    lng REAL NOT NULL,
    num_species INTEGER,
    num_checklists INTEGER
);

CREATE TABLE regions (
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE month_obs (
    location_id TEXT NOT NULL REFERENCES hotspots(id),
    month INTEGER NOT NULL CHECK (month BETWEEN 1 AND 12),
    species_id INTEGER NOT NULL REFERENCES species(id),
    obs INTEGER NOT NULL,
    samples INTEGER NOT NULL,
    score REAL NOT NULL,
    PRIMARY KEY (location_id, month, species_id),
    CHECK (obs <= samples)
);

CREATE TABLE year_obs (
    location_id TEXT NOT NULL REFERENCES hotspots(id),
    species_id INTEGER NOT NULL REFERENCES species(id),
    obs INTEGER NOT NULL,
    samples INTEGER NOT NULL,
    score REAL NOT NULL,
    PRIMARY KEY (location_id, species_id),
    CHECK (obs <= samples)
);

CREATE TABLE metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

// Built after the bulk load so inserts don't pay for them
const INDEXES: &str = r#"
CREATE INDEX idx_month_obs_species_score ON month_obs (species_id, score DESC);
CREATE INDEX idx_year_obs_species_score ON year_obs (species_id, score DESC);
CREATE INDEX idx_hotspots_region ON hotspots (region_code);
CREATE INDEX idx_hotspots_country ON hotspots (country_code);
CREATE INDEX idx_hotspots_subnational1 ON hotspots (subnational1_code);
CREATE INDEX idx_hotspots_subnational2 ON hotspots (subnational2_code);
"#;

/// Row counts written by a [`TargetsWriter`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub species: u64,
    pub hotspots: u64,
    pub regions: u64,
    pub month_rows: u64,
    pub year_rows: u64,
}

/// Bulk writer for a fresh targets database
pub struct TargetsWriter {
    pool: SqlitePool,
    tx: Transaction<'static, Sqlite>,
    batch_size: usize,
    months: Vec<MonthAggregate>,
    years: Vec<YearAggregate>,
    summary: WriteSummary,
}

impl TargetsWriter {
    /// Create the database at `path` and open the build transaction
    ///
    /// `path` must not exist yet; callers write to a partial path.
    pub async fn create(path: &Path, batch_size: usize) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Memory)
            .synchronous(SqliteSynchronous::Off);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(SCHEMA).execute(&mut *tx).await?;

        let batch_size = batch_size.clamp(1, MAX_INSERT_BATCH);
        debug!(path = %path.display(), batch_size = batch_size, "Created targets database");

        Ok(Self {
            pool,
            tx,
            batch_size,
            months: Vec::with_capacity(batch_size),
            years: Vec::with_capacity(batch_size),
            summary: WriteSummary::default(),
        })
    }

    /// Write the species, hotspot and region name tables
    ///
    /// Hotspots get their resolved region code; a malformed subnational
    /// code is stored as NULL rather than propagated.
    pub async fn insert_reference(&mut self, reference: &ReferenceData) -> Result<()> {
        for chunk in reference.species().chunks(self.batch_size) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO species (id, sci_name, name, code, taxon_order) ",
            );
            builder.push_values(chunk, |mut b, s| {
                b.push_bind(s.id)
                    .push_bind(&s.sci_name)
                    .push_bind(&s.name)
                    .push_bind(&s.code)
                    .push_bind(s.taxon_order);
            });
            builder.build().execute(&mut *self.tx).await?;
            self.summary.species += chunk.len() as u64;
        }

        let mut unresolved = 0u64;
        for chunk in reference.hotspots().chunks(self.batch_size) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO hotspots (id, name, country_code, subnational1_code, subnational2_code, \
                 region_code, lat, lng, num_species, num_checklists) ",
            );
            builder.push_values(chunk, |mut b, h| {
                let region = resolve_hotspot(h);
                if region.is_none() {
                    unresolved += 1;
                }
                let subnational1 = h
                    .subnational1_code
                    .as_deref()
                    .filter(|c| is_valid_code(c, RegionLevel::Subnational1));
                let subnational2 = h
                    .subnational2_code
                    .as_deref()
                    .filter(|c| is_valid_code(c, RegionLevel::Subnational2));

                b.push_bind(&h.id)
                    .push_bind(&h.name)
                    .push_bind(&h.country_code)
                    .push_bind(subnational1)
                    .push_bind(subnational2)
                    .push_bind(region.map(|r| r.as_str().to_string()))
                    .push_bind(h.lat)
                    .push_bind(h.lng)
                    .push_bind(h.num_species)
                    .push_bind(h.num_checklists);
            });
            builder.build().execute(&mut *self.tx).await?;
            self.summary.hotspots += chunk.len() as u64;
        }

        let regions = reference.regions();
        for chunk in regions.chunks(self.batch_size) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO regions (code, name) ");
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(&r.code).push_bind(&r.name);
            });
            builder.build().execute(&mut *self.tx).await?;
            self.summary.regions += chunk.len() as u64;
        }

        if unresolved > 0 {
            warn!(hotspots = unresolved, "Hotspots without a usable region code");
        }
        info!(
            species = self.summary.species,
            hotspots = self.summary.hotspots,
            regions = self.summary.regions,
            "Wrote reference tables"
        );
        Ok(())
    }

    pub async fn push(&mut self, row: AggregateRow) -> Result<()> {
        match row {
            AggregateRow::Month(m) => {
                self.months.push(m);
                if self.months.len() >= self.batch_size {
                    self.flush_months().await?;
                }
            },
            AggregateRow::Year(y) => {
                self.years.push(y);
                if self.years.len() >= self.batch_size {
                    self.flush_years().await?;
                }
            },
        }
        Ok(())
    }

    async fn flush_months(&mut self) -> Result<()> {
        if self.months.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO month_obs (location_id, month, species_id, obs, samples, score) ",
        );
        builder.push_values(&self.months, |mut b, m| {
            b.push_bind(&m.location_id)
                .push_bind(m.month)
                .push_bind(m.species_id)
                .push_bind(m.obs)
                .push_bind(m.samples)
                .push_bind(m.score);
        });
        builder.build().execute(&mut *self.tx).await?;

        self.summary.month_rows += self.months.len() as u64;
        self.months.clear();
        Ok(())
    }

    async fn flush_years(&mut self) -> Result<()> {
        if self.years.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO year_obs (location_id, species_id, obs, samples, score) ",
        );
        builder.push_values(&self.years, |mut b, y| {
            b.push_bind(&y.location_id)
                .push_bind(y.species_id)
                .push_bind(y.obs)
                .push_bind(y.samples)
                .push_bind(y.score);
        });
        builder.build().execute(&mut *self.tx).await?;

        self.summary.year_rows += self.years.len() as u64;
        self.years.clear();
        Ok(())
    }

    /// Flush pending rows, index, record metadata and commit
    pub async fn finish(mut self, metadata: &[(String, String)]) -> Result<WriteSummary> {
        self.flush_months().await?;
        self.flush_years().await?;

        sqlx::raw_sql(INDEXES).execute(&mut *self.tx).await?;

        let counts = [
            ("month_rows".to_string(), self.summary.month_rows.to_string()),
            ("year_rows".to_string(), self.summary.year_rows.to_string()),
        ];
        for (key, value) in metadata.iter().chain(counts.iter()) {
            sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)")
                .bind(key)
                .bind(value)
                .execute(&mut *self.tx)
                .await?;
        }

        self.tx.commit().await?;
        self.pool.close().await;

        info!(
            month_rows = self.summary.month_rows,
            year_rows = self.summary.year_rows,
            "Committed targets database"
        );
        Ok(self.summary)
    }

    /// Roll back and close after a failed build
    pub async fn abort(self) {
        if let Err(e) = self.tx.rollback().await {
            warn!(error = %e, "Rollback of targets database failed");
        }
        self.pool.close().await;
    }
}

/// Read-only access to a finished targets database
#[derive(Clone)]
pub struct TargetsReader {
    pool: SqlitePool,
}

impl TargetsReader {
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self> {
        if !path.is_file() {
            return Err(PipelineError::MissingInput {
                stage: "pack".to_string(),
                path: path.to_path_buf(),
            });
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// All species in taxonomic order
    pub async fn species(&self) -> Result<Vec<Species>> {
        let rows = sqlx::query_as::<_, Species>(
            "SELECT id, sci_name, name, code, taxon_order FROM species ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// All hotspots ordered by id
    pub async fn hotspots(&self) -> Result<Vec<Hotspot>> {
        let rows = sqlx::query_as::<_, Hotspot>(
            "SELECT id, name, country_code, subnational1_code, subnational2_code, lat, lng, \
             num_species, num_checklists FROM hotspots ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Region display names ordered by code
    pub async fn regions(&self) -> Result<Vec<Region>> {
        let rows = sqlx::query_as::<_, Region>("SELECT code, name FROM regions ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Month rows for hotspots resolving to `region` or any descendant
    pub async fn region_month_rows(&self, region: &str) -> Result<Vec<MonthAggregate>> {
        let rows = sqlx::query_as::<_, MonthAggregate>(
            r#"
            SELECT m.location_id, m.month, m.species_id, m.obs, m.samples, m.score
            FROM month_obs m
            JOIN hotspots h ON h.id = m.location_id
            WHERE h.region_code = ?1 OR h.region_code LIKE ?1 || '-%'
            ORDER BY m.location_id, m.species_id, m.month
            "#,
        )
        .bind(region)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Year rows for hotspots resolving to `region` or any descendant
    pub async fn region_year_rows(&self, region: &str) -> Result<Vec<YearAggregate>> {
        let rows = sqlx::query_as::<_, YearAggregate>(
            r#"
            SELECT y.location_id, y.species_id, y.obs, y.samples, y.score
            FROM year_obs y
            JOIN hotspots h ON h.id = y.location_id
            WHERE h.region_code = ?1 OR h.region_code LIKE ?1 || '-%'
            ORDER BY y.location_id, y.species_id
            "#,
        )
        .bind(region)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn metadata(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM metadata WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
