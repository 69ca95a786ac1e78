//! Record filter: raw EBD extract to narrow working file
//!
//! Streams the release file once, keeps complete hotspot checklists and
//! projects the columns the aggregation engine reads. Non-species rows are
//! kept: they still make their checklist a sample. The output is published
//! atomically.

use csv::{QuoteStyle, StringRecord, WriterBuilder};
use ebd_common::format::{format_duration, format_size};
use ebd_common::publish::PartialFile;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::parser::{
    locate_columns, open_input, parse_flag, tsv_reader, ALL_SPECIES_REPORTED, HOTSPOT_LOCALITY,
    LOCALITY_TYPE, OBSERVATION_COLUMNS, SAMPLING_COLUMNS, SAMPLING_FILTER_COLUMNS,
};

const PROGRESS_INTERVAL: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Observations,
    Sampling,
}

impl FilterKind {
    /// Output columns, in order
    pub fn columns(self) -> Vec<&'static str> {
        match self {
            FilterKind::Observations => OBSERVATION_COLUMNS.to_vec(),
            FilterKind::Sampling => SAMPLING_COLUMNS
                .iter()
                .chain(SAMPLING_FILTER_COLUMNS.iter())
                .copied()
                .collect(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FilterKind::Observations => "observations",
            FilterKind::Sampling => "sampling",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub rows_read: u64,
    pub rows_written: u64,
    /// Rows from incomplete or non-hotspot checklists
    pub rows_skipped: u64,
    /// Rows the csv reader could not split
    pub rows_unreadable: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

impl FilterReport {
    pub fn summary(&self) -> String {
        format!(
            "{} of {} rows kept ({} skipped, {} unreadable), {} written in {}",
            self.rows_written,
            self.rows_read,
            self.rows_skipped,
            self.rows_unreadable,
            format_size(self.bytes_written),
            format_duration(self.elapsed)
        )
    }
}

pub fn filter_observations(input: &Path, output: &Path) -> Result<FilterReport> {
    filter_file(input, output, FilterKind::Observations)
}

pub fn filter_sampling(input: &Path, output: &Path) -> Result<FilterReport> {
    filter_file(input, output, FilterKind::Sampling)
}

fn position(columns: &[&str], name: &str) -> Option<usize> {
    columns.iter().position(|c| *c == name)
}

pub fn filter_file(input: &Path, output: &Path, kind: FilterKind) -> Result<FilterReport> {
    let started = Instant::now();
    let mut reader = tsv_reader(open_input(input)?);
    let headers = reader.headers()?.clone();

    let columns = kind.columns();
    let indices = locate_columns(&headers, &columns, input)?;
    let locality = position(&columns, LOCALITY_TYPE).map(|i| indices[i]);
    let all_species = position(&columns, ALL_SPECIES_REPORTED).map(|i| indices[i]);

    info!(
        kind = kind.as_str(),
        input = %input.display(),
        output = %output.display(),
        columns = columns.len(),
        "Filtering EBD file"
    );

    let partial = PartialFile::create(output)?;
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(QuoteStyle::Never)
        .from_path(partial.path())?;
    writer.write_record(&columns)?;

    let mut report = FilterReport::default();
    let mut record = StringRecord::new();
    let field = |record: &StringRecord, idx: Option<usize>| {
        idx.and_then(|i| record.get(i)).map(str::trim).unwrap_or_default().to_string()
    };

    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {},
            Err(e) if e.is_io_error() => return Err(PipelineError::Csv(e)),
            Err(e) => {
                report.rows_read += 1;
                report.rows_unreadable += 1;
                debug!(error = %e, "Skipping unreadable row");
                continue;
            },
        }
        report.rows_read += 1;

        let keep = parse_flag(&field(&record, all_species))
            && field(&record, locality) == HOTSPOT_LOCALITY;
        if !keep {
            report.rows_skipped += 1;
            continue;
        }

        writer.write_record(indices.iter().map(|&i| record.get(i).unwrap_or_default()))?;
        report.rows_written += 1;

        if report.rows_written % PROGRESS_INTERVAL == 0 {
            let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
            info!(
                rows = report.rows_written,
                elapsed = %format_duration(started.elapsed()),
                rows_per_sec = (report.rows_written as f64 / elapsed) as u64,
                "Filtering progress"
            );
        }
    }

    writer
        .flush()
        .map_err(|e| PipelineError::from_io_with_context(e, "writing filtered file"))?;
    drop(writer);

    report.bytes_written = std::fs::metadata(partial.path())?.len();
    partial.publish()?;
    report.elapsed = started.elapsed();

    info!(kind = kind.as_str(), "Filter complete: {}", report.summary());
    Ok(report)
}
