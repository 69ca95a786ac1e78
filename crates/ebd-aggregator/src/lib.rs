//! EBD Aggregator Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Turns an eBird Basic Dataset release into per-hotspot, per-species
//! reporting statistics and per-region download packs.
//!
//! # Pipeline
//!
//! 1. **Filter** ([`filter`]): project the raw extract to the columns the
//!    engine needs, keeping complete hotspot checklists.
//! 2. **Reference** ([`reference`]): fetch the taxonomy and hotspot list from
//!    the eBird API.
//! 3. **Aggregate** ([`aggregate`]): deduplicate group checklists, count
//!    observations and samples per (location, species, month) and per
//!    (location, species), score them, and write a SQLite database
//!    ([`storage`]).
//! 4. **Pack** ([`pack`]): write one gzipped bundle per region of the
//!    country/subnational hierarchy ([`region`]) plus a manifest.
//! 5. **Upload** ([`upload`]): publish packs to S3-compatible storage.
//!
//! Stages are wrapped by [`stage::materialize`], which skips any stage whose
//! outputs already exist.
//!
//! # Example
//!
//! ```no_run
//! use ebd_aggregator::config::PipelineConfig;
//! use ebd_aggregator::stages::run_all;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     config.validate()?;
//!     for (stage, outcome) in run_all(Arc::new(config), "dec-2025", false).await? {
//!         println!("{}: {:?}", stage, outcome);
//!     }
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod filter;
pub mod models;
pub mod pack;
pub mod parser;
pub mod reference;
pub mod region;
pub mod score;
pub mod stage;
pub mod stages;
pub mod storage;
pub mod upload;

pub use error::{PipelineError, Result};
