//! Materialize-or-skip stage runner
//!
//! Every stage declares the files it reads and the files it produces. A
//! stage whose outputs all exist (non-empty) is skipped, so an interrupted
//! `run-all` resumes where it stopped. Outputs are published atomically by
//! the stages themselves, which keeps "exists" equivalent to "complete".

use async_trait::async_trait;
use ebd_common::format::format_duration;
use ebd_common::publish::is_materialized;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::PipelineError;

/// Outcome of a completed stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: String,
    /// One-line human summary
    pub summary: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Skipped,
    Completed(StageReport),
}

impl StageOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutcome::Skipped)
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Files that must exist before the stage can run
    fn inputs(&self) -> Vec<PathBuf>;

    /// Files whose presence means the stage is done
    fn outputs(&self) -> Vec<PathBuf>;

    /// Produce the outputs, returning a one-line summary
    async fn run(&self) -> anyhow::Result<String>;
}

/// Run `stage` unless its outputs already exist
///
/// `force` reruns regardless. Missing inputs fail with
/// [`PipelineError::MissingInput`] before any work starts.
pub async fn materialize(stage: &dyn Stage, force: bool) -> anyhow::Result<StageOutcome> {
    let outputs = stage.outputs();
    if !force && !outputs.is_empty() && outputs.iter().all(|p| is_materialized(p)) {
        info!(stage = stage.name(), "Outputs present, skipping stage");
        return Ok(StageOutcome::Skipped);
    }

    if let Some(missing) = stage.inputs().into_iter().find(|p| !is_materialized(p)) {
        return Err(PipelineError::MissingInput {
            stage: stage.name().to_string(),
            path: missing,
        }
        .into());
    }

    info!(stage = stage.name(), "Starting stage");
    let started = Instant::now();
    let summary = stage.run().await?;
    let elapsed = started.elapsed();

    info!(
        stage = stage.name(),
        elapsed = %format_duration(elapsed),
        "Stage complete: {}",
        summary
    );

    Ok(StageOutcome::Completed(StageReport {
        stage: stage.name().to_string(),
        summary,
        elapsed,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Touch {
        input: Option<PathBuf>,
        output: PathBuf,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Stage for Touch {
        fn name(&self) -> &'static str {
            "touch"
        }

        fn inputs(&self) -> Vec<PathBuf> {
            self.input.iter().cloned().collect()
        }

        fn outputs(&self) -> Vec<PathBuf> {
            vec![self.output.clone()]
        }

        async fn run(&self) -> anyhow::Result<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            std::fs::write(&self.output, b"done")?;
            Ok("touched".to_string())
        }
    }

    #[tokio::test]
    async fn test_runs_once_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Touch {
            input: None,
            output: dir.path().join("out.txt"),
            runs: AtomicUsize::new(0),
        };

        let first = materialize(&stage, false).await.unwrap();
        assert!(matches!(first, StageOutcome::Completed(ref r) if r.summary == "touched"));
        assert!(materialize(&stage, false).await.unwrap().is_skipped());
        assert_eq!(stage.runs.load(Ordering::SeqCst), 1);

        materialize(&stage, true).await.unwrap();
        assert_eq!(stage.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_output_is_not_materialized() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.txt");
        std::fs::write(&output, b"").unwrap();
        let stage = Touch {
            input: None,
            output,
            runs: AtomicUsize::new(0),
        };

        assert!(!materialize(&stage, false).await.unwrap().is_skipped());
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Touch {
            input: Some(dir.path().join("missing.tsv")),
            output: dir.path().join("out.txt"),
            runs: AtomicUsize::new(0),
        };

        let err = materialize(&stage, false).await.unwrap_err();
        let pipeline = err.downcast_ref::<PipelineError>().unwrap();
        assert!(matches!(pipeline, PipelineError::MissingInput { stage, .. } if stage == "touch"));
        assert_eq!(stage.runs.load(Ordering::SeqCst), 0);
    }
}
