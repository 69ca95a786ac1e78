//! Concrete pipeline stages and the release directory layout

use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::aggregate::{aggregate_to_database, AggregateJob};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::filter::{filter_observations, filter_sampling};
use crate::pack::{manifest_path, pack_regions, PackConfig};
use crate::reference::{fetch_reference, load_reference, EbirdClient, ReferencePaths};
use crate::stage::{materialize, Stage, StageOutcome};

/// File layout for one release under the data directory
///
/// ```text
/// datasets/ebd-<release>.txt.gz              raw observations
/// datasets/ebd-sampling-<release>.txt.gz     raw sampling events
/// datasets/ebd-<release>-filtered.tsv
/// datasets/ebd-sampling-<release>-filtered.tsv
/// reference/species.json
/// reference/hotspots.json
/// reference/regions.json
/// output/targets-<release>.db
/// output/packs/<release>/...
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPaths {
    pub release: String,
    pub raw_observations: PathBuf,
    pub raw_sampling: PathBuf,
    pub filtered_observations: PathBuf,
    pub filtered_sampling: PathBuf,
    pub reference: ReferencePaths,
    pub database: PathBuf,
    pub packs_dir: PathBuf,
}

impl DatasetPaths {
    pub fn new(data_dir: &Path, release: &str) -> Self {
        let datasets = data_dir.join("datasets");
        let output = data_dir.join("output");
        Self {
            release: release.to_string(),
            raw_observations: datasets.join(format!("ebd-{}.txt.gz", release)),
            raw_sampling: datasets.join(format!("ebd-sampling-{}.txt.gz", release)),
            filtered_observations: datasets.join(format!("ebd-{}-filtered.tsv", release)),
            filtered_sampling: datasets.join(format!("ebd-sampling-{}-filtered.tsv", release)),
            reference: ReferencePaths::in_dir(&data_dir.join("reference")),
            database: output.join(format!("targets-{}.db", release)),
            packs_dir: output.join("packs"),
        }
    }

    pub fn manifest(&self) -> PathBuf {
        manifest_path(&self.packs_dir, &self.release)
    }

    /// Filtered sampling file, if one has been produced
    pub fn sampling_input(&self) -> Option<PathBuf> {
        self.filtered_sampling
            .is_file()
            .then(|| self.filtered_sampling.clone())
    }
}

pub struct FilterObservationsStage {
    pub paths: DatasetPaths,
}

#[async_trait]
impl Stage for FilterObservationsStage {
    fn name(&self) -> &'static str {
        "filter-observations"
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.paths.raw_observations.clone()]
    }

    fn outputs(&self) -> Vec<PathBuf> {
        vec![self.paths.filtered_observations.clone()]
    }

    async fn run(&self) -> anyhow::Result<String> {
        let input = self.paths.raw_observations.clone();
        let output = self.paths.filtered_observations.clone();
        let report = tokio::task::spawn_blocking(move || filter_observations(&input, &output))
            .await?
            .context("Failed to filter observations")?;
        Ok(report.summary())
    }
}

pub struct FilterSamplingStage {
    pub paths: DatasetPaths,
}

#[async_trait]
impl Stage for FilterSamplingStage {
    fn name(&self) -> &'static str {
        "filter-sampling"
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.paths.raw_sampling.clone()]
    }

    fn outputs(&self) -> Vec<PathBuf> {
        vec![self.paths.filtered_sampling.clone()]
    }

    async fn run(&self) -> anyhow::Result<String> {
        let input = self.paths.raw_sampling.clone();
        let output = self.paths.filtered_sampling.clone();
        let report = tokio::task::spawn_blocking(move || filter_sampling(&input, &output))
            .await?
            .context("Failed to filter sampling events")?;
        Ok(report.summary())
    }
}

pub struct FetchReferenceStage {
    pub paths: DatasetPaths,
    pub config: Arc<PipelineConfig>,
}

#[async_trait]
impl Stage for FetchReferenceStage {
    fn name(&self) -> &'static str {
        "fetch-reference"
    }

    fn inputs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<PathBuf> {
        self.paths.reference.files()
    }

    async fn run(&self) -> anyhow::Result<String> {
        let client = EbirdClient::new(self.config.ebird_client())?;
        let summary = fetch_reference(&client, &self.paths.reference)
            .await
            .context("Failed to fetch reference data")?;

        if summary.failed_countries > 0 {
            warn!(countries = summary.failed_countries, "Some countries returned no hotspots");
        }
        Ok(format!(
            "{} species, {} hotspots, {} region names ({} countries failed)",
            summary.species, summary.hotspots, summary.regions, summary.failed_countries
        ))
    }
}

pub struct AggregateStage {
    pub paths: DatasetPaths,
    pub config: Arc<PipelineConfig>,
}

impl AggregateStage {
    pub fn job(&self) -> Result<AggregateJob> {
        Ok(AggregateJob {
            observations: self.paths.filtered_observations.clone(),
            sampling: self.paths.sampling_input(),
            output: self.paths.database.clone(),
            version: self.paths.release.clone(),
            config: self.config.aggregation(),
            engine: self.config.engine_settings()?,
            channel_capacity: self.config.channel_capacity,
            insert_batch: self.config.insert_batch,
        })
    }
}

#[async_trait]
impl Stage for AggregateStage {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![
            self.paths.filtered_observations.clone(),
            self.paths.reference.species.clone(),
            self.paths.reference.hotspots.clone(),
        ]
    }

    fn outputs(&self) -> Vec<PathBuf> {
        vec![self.paths.database.clone()]
    }

    async fn run(&self) -> anyhow::Result<String> {
        let files = self.paths.reference.clone();
        let reference = tokio::task::spawn_blocking(move || load_reference(&files))
            .await?
            .context("Failed to load reference data")?;

        let job = self.job()?;
        if job.sampling.is_none() {
            info!("No filtered sampling file, deriving samples from observations");
        }

        let report = aggregate_to_database(&job, Arc::new(reference))
            .await
            .context("Aggregation failed")?;
        Ok(report.summary())
    }
}

pub struct PackStage {
    pub paths: DatasetPaths,
    pub config: Arc<PipelineConfig>,
}

impl PackStage {
    pub fn pack_config(&self) -> PackConfig {
        PackConfig {
            database: self.paths.database.clone(),
            output_dir: self.paths.packs_dir.clone(),
            version: Some(self.paths.release.clone()),
            threads: self.config.threads,
        }
    }
}

#[async_trait]
impl Stage for PackStage {
    fn name(&self) -> &'static str {
        "pack"
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.paths.database.clone()]
    }

    fn outputs(&self) -> Vec<PathBuf> {
        vec![self.paths.manifest()]
    }

    async fn run(&self) -> anyhow::Result<String> {
        let report = pack_regions(&self.pack_config())
            .await
            .context("Packing failed")?;
        Ok(report.summary())
    }
}

/// Run every stage for `release` in order, skipping those already done
///
/// Sampling is optional: without a raw or filtered sampling file the
/// aggregation derives its denominator from observations alone.
pub async fn run_all(
    config: Arc<PipelineConfig>,
    release: &str,
    force: bool,
) -> anyhow::Result<Vec<(&'static str, StageOutcome)>> {
    let paths = DatasetPaths::new(&config.data_dir, release);
    let mut stages: Vec<Box<dyn Stage>> = vec![Box::new(FilterObservationsStage {
        paths: paths.clone(),
    })];

    if paths.raw_sampling.is_file() || paths.filtered_sampling.is_file() {
        stages.push(Box::new(FilterSamplingStage {
            paths: paths.clone(),
        }));
    } else {
        warn!(
            path = %paths.raw_sampling.display(),
            "No sampling file, checklists without target species will not count as samples"
        );
    }

    stages.push(Box::new(FetchReferenceStage {
        paths: paths.clone(),
        config: Arc::clone(&config),
    }));
    stages.push(Box::new(AggregateStage {
        paths: paths.clone(),
        config: Arc::clone(&config),
    }));
    stages.push(Box::new(PackStage {
        paths,
        config,
    }));

    let mut outcomes = Vec::with_capacity(stages.len());
    for stage in &stages {
        let outcome = materialize(stage.as_ref(), force)
            .await
            .with_context(|| format!("Stage '{}' failed", stage.name()))?;
        outcomes.push((stage.name(), outcome));
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_layout() {
        let paths = DatasetPaths::new(Path::new("/data"), "dec-2025");
        assert_eq!(paths.raw_observations, Path::new("/data/datasets/ebd-dec-2025.txt.gz"));
        assert_eq!(
            paths.filtered_sampling,
            Path::new("/data/datasets/ebd-sampling-dec-2025-filtered.tsv")
        );
        assert_eq!(paths.database, Path::new("/data/output/targets-dec-2025.db"));
        assert_eq!(paths.reference.regions, Path::new("/data/reference/regions.json"));
        assert_eq!(paths.manifest(), Path::new("/data/output/packs/dec-2025/packs.json.gz"));
        assert_eq!(paths.sampling_input(), None);
    }
}
