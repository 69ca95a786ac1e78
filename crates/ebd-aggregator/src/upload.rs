//! Pack upload to S3-compatible object storage
//!
//! Bundles are immutable per version and cached for a year; the manifest at
//! the bucket root is the only mutable object and goes up last.

use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    Client,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};
use crate::pack::MANIFEST_FILE;

pub const BUNDLE_CACHE_CONTROL: &str = "public, max-age=31536000";
pub const MANIFEST_CACHE_CONTROL: &str = "public, max-age=7200";

/// One file to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub path: PathBuf,
    pub key: String,
    pub cache_control: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: usize,
    pub failed: usize,
    pub bytes: u64,
}

/// Files for `version`, bundles in name order followed by the manifest
pub fn plan_uploads(packs_dir: &Path, version: &str) -> Result<Vec<UploadItem>> {
    let version_dir = packs_dir.join(version);
    let manifest = version_dir.join(MANIFEST_FILE);
    if !manifest.is_file() {
        return Err(PipelineError::MissingInput {
            stage: "upload".to_string(),
            path: manifest,
        });
    }

    let mut bundles = Vec::new();
    for entry in std::fs::read_dir(&version_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if name == MANIFEST_FILE || !name.ends_with(".json.gz") || !path.is_file() {
            continue;
        }
        bundles.push(UploadItem {
            key: format!("{}/{}", version, name),
            path,
            cache_control: BUNDLE_CACHE_CONTROL,
        });
    }
    bundles.sort_by(|a, b| a.key.cmp(&b.key));

    bundles.push(UploadItem {
        path: manifest,
        key: MANIFEST_FILE.to_string(),
        cache_control: MANIFEST_CACHE_CONTROL,
    });
    Ok(bundles)
}

#[derive(Clone)]
pub struct PackUploader {
    client: Client,
    bucket: String,
}

impl PackUploader {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => aws_sdk_s3::Config::builder()
                .credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "ebd-aggregator",
                ))
                .region(Region::new(config.region.clone())),
            _ => {
                debug!("No S3 keys configured, using the default AWS credential chain");
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(bucket = %config.bucket, endpoint = ?config.endpoint, "Storage client initialized");

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        })
    }

    #[instrument(skip(self, item), fields(key = %item.key))]
    async fn upload(&self, item: &UploadItem) -> Result<u64> {
        let data = tokio::fs::read(&item.path).await?;
        let size = data.len() as u64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&item.key)
            .body(ByteStream::from(data))
            .content_type("application/json")
            .content_encoding("gzip")
            .cache_control(item.cache_control)
            .send()
            .await
            .map_err(|e| PipelineError::Upload(format!("{}: {}", item.key, DisplayErrorContext(&e))))?;

        debug!(bytes = size, "Uploaded to s3://{}/{}", self.bucket, item.key);
        Ok(size)
    }

    /// Upload every bundle of `version`, then the manifest
    ///
    /// All bundles are attempted even after a failure. The manifest is held
    /// back if any bundle failed so clients never see a pack that is missing.
    pub async fn upload_packs(&self, packs_dir: &Path, version: &str) -> Result<UploadReport> {
        let items = plan_uploads(packs_dir, version)?;
        let total = items.len();
        let mut report = UploadReport::default();

        info!(files = total, bucket = %self.bucket, version = %version, "Uploading packs");

        for item in &items {
            if item.key == MANIFEST_FILE && report.failed > 0 {
                warn!("Skipping manifest upload because bundle uploads failed");
                report.failed += 1;
                continue;
            }

            match self.upload(item).await {
                Ok(bytes) => {
                    report.uploaded += 1;
                    report.bytes += bytes;
                },
                Err(e) => {
                    report.failed += 1;
                    warn!(key = %item.key, error = %e, "Upload failed");
                },
            }
        }

        if report.failed > 0 {
            return Err(PipelineError::Upload(format!(
                "{} of {} files failed to upload",
                report.failed, total
            )));
        }

        info!(uploaded = report.uploaded, bytes = report.bytes, "Upload complete");
        Ok(report)
    }
}
