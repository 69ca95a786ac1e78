//! Region packer
//!
//! Reads a finished targets database and writes one gzipped bundle per
//! region of the hierarchy, then the manifest listing them:
//!
//! ```text
//! <output>/<version>/US.json.gz
//! <output>/<version>/US-CA.json.gz
//! <output>/<version>/US-CA-001.json.gz
//! <output>/<version>/packs.json.gz
//! ```
//!
//! Regions are independent, so they are packed concurrently with a bounded
//! degree. Each bundle is published atomically and the manifest goes last,
//! which means a manifest on disk always describes complete bundles.

pub mod bundle;
pub mod cluster;
pub mod manifest;

pub use bundle::{build_bundle, Bundle, BundleContext};
pub use manifest::{Manifest, PackEntry};

use ebd_common::checksum::digest_bytes;
use ebd_common::format::{format_duration, format_size};
use ebd_common::publish::PartialFile;
use flate2::{Compression, GzBuilder};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::aggregate::DEFAULT_MIN_SAMPLES;
use crate::error::{PipelineError, Result};
use crate::region::{RegionNode, RegionTree};
use crate::score::DEFAULT_Z;
use crate::storage::TargetsReader;

pub const MANIFEST_FILE: &str = "packs.json.gz";
const GZIP_LEVEL: u32 = 9;

/// Serialize to compact JSON and gzip with a zeroed header timestamp
pub fn gzip_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::with_capacity(json.len() / 4), Compression::new(GZIP_LEVEL));
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let partial = PartialFile::create(path)?;
    std::fs::write(partial.path(), bytes)
        .map_err(|e| PipelineError::from_io_with_context(e, "writing pack"))?;
    partial.publish()?;
    Ok(())
}

/// Pack version from a database named like `targets-dec-2025.db`
pub fn version_from_database(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.strip_prefix("targets-") {
        Some(version) => version.to_string(),
        None => stem,
    }
}

pub fn manifest_path(output_dir: &Path, version: &str) -> PathBuf {
    output_dir.join(version).join(MANIFEST_FILE)
}

#[derive(Debug, Clone)]
pub struct PackConfig {
    pub database: PathBuf,
    pub output_dir: PathBuf,
    /// Defaults to the version derived from the database filename
    pub version: Option<String>,
    /// Regions packed at once
    pub threads: usize,
}

impl PackConfig {
    pub fn resolved_version(&self) -> String {
        self.version
            .clone()
            .unwrap_or_else(|| version_from_database(&self.database))
    }
}

#[derive(Debug, Clone)]
pub struct PackReport {
    pub version: String,
    pub regions: usize,
    pub bytes: u64,
    pub unresolved_hotspots: usize,
    pub manifest: PathBuf,
    pub elapsed: Duration,
}

impl PackReport {
    pub fn summary(&self) -> String {
        format!(
            "{} packs for version {} ({}) in {}",
            self.regions,
            self.version,
            format_size(self.bytes),
            format_duration(self.elapsed)
        )
    }
}

async fn metadata_or<T: std::str::FromStr>(reader: &TargetsReader, key: &str, default: T) -> Result<T> {
    Ok(reader
        .metadata(key)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(default))
}

/// Pack every region of the database
pub async fn pack_regions(config: &PackConfig) -> Result<PackReport> {
    let started = Instant::now();
    let threads = config.threads.max(1);
    let version = config.resolved_version();
    if version.is_empty() {
        return Err(PipelineError::Aborted(format!(
            "cannot derive a pack version from {}",
            config.database.display()
        )));
    }

    let reader = TargetsReader::open(&config.database, threads as u32).await?;
    let z = metadata_or(&reader, "z", DEFAULT_Z).await?;
    let min_samples = metadata_or(&reader, "min_samples", DEFAULT_MIN_SAMPLES).await?;
    let species = reader.species().await?;
    let hotspots = reader.hotspots().await?;
    let regions = reader.regions().await?;

    let tree = RegionTree::build(&hotspots);
    if !tree.unresolved().is_empty() {
        warn!(
            hotspots = tree.unresolved().len(),
            "Hotspots without a region code are left out of every pack"
        );
    }

    info!(
        version = %version,
        regions = tree.len(),
        species = species.len(),
        hotspots = hotspots.len(),
        names = regions.len(),
        concurrency = threads,
        "Packing regions"
    );

    let ctx = Arc::new(BundleContext::new(
        version.clone(),
        z,
        min_samples,
        species,
        hotspots,
        regions,
    ));
    let version_dir = config.output_dir.join(&version);

    let nodes: Vec<RegionNode> = tree.nodes().cloned().collect();
    let entries: Vec<PackEntry> = stream::iter(nodes)
        .map(|node| {
            let reader = reader.clone();
            let ctx = Arc::clone(&ctx);
            let dir = version_dir.clone();
            async move { pack_region(&reader, ctx, node, &dir).await }
        })
        .buffer_unordered(threads)
        .try_collect()
        .await?;
    reader.close().await;

    let manifest = Manifest::new(version.clone(), entries);
    let manifest_file = manifest_path(&config.output_dir, &version);
    manifest.write(&manifest_file)?;

    let report = PackReport {
        version,
        regions: manifest.packs.len(),
        bytes: manifest.total_size(),
        unresolved_hotspots: tree.unresolved().len(),
        manifest: manifest_file,
        elapsed: started.elapsed(),
    };
    info!("Packing complete: {}", report.summary());
    Ok(report)
}

async fn pack_region(
    reader: &TargetsReader,
    ctx: Arc<BundleContext>,
    node: RegionNode,
    dir: &Path,
) -> Result<PackEntry> {
    let months = reader.region_month_rows(&node.code).await?;
    let years = reader.region_year_rows(&node.code).await?;
    let path = dir.join(format!("{}.json.gz", node.code));

    tokio::task::spawn_blocking(move || -> Result<PackEntry> {
        let bundle = build_bundle(&ctx, &node, &months, &years);
        let bytes = gzip_json(&bundle)?;
        let digest = digest_bytes(&bytes);
        write_atomic(&path, &bytes)?;

        let points: Vec<cluster::Point> = node
            .hotspots
            .iter()
            .filter_map(|id| ctx.hotspot(id))
            .map(|h| (h.lat, h.lng))
            .collect();

        debug!(
            region = %node.code,
            hotspots = node.hotspots.len(),
            targets = bundle.months.len(),
            size = %format_size(digest.size),
            "Wrote pack"
        );

        Ok(PackEntry {
            path: format!("{}/{}.json.gz", ctx.version, node.code),
            name: ctx.region_name(&node.code).unwrap_or(&node.code).to_string(),
            region: node.code,
            level: node.level,
            parent: node.parent,
            hotspots: node.hotspots.len(),
            clusters: cluster::cluster_centers(&points),
            size: digest.size,
            sha256: digest.sha256,
        })
    })
    .await
    .map_err(|e| PipelineError::Aborted(format!("packing task failed: {}", e)))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_version_from_database() {
        assert_eq!(version_from_database(Path::new("out/targets-dec-2025.db")), "dec-2025");
        assert_eq!(version_from_database(Path::new("custom.db")), "custom");
    }

    #[test]
    fn test_gzip_is_deterministic() {
        let a = gzip_json(&serde_json::json!({"a": [1, 2, 3]})).unwrap();
        let b = gzip_json(&serde_json::json!({"a": [1, 2, 3]})).unwrap();
        assert_eq!(a, b);

        let mut json = String::new();
        GzDecoder::new(a.as_slice()).read_to_string(&mut json).unwrap();
        assert_eq!(json, r#"{"a":[1,2,3]}"#);
    }
}
