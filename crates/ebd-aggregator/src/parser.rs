//! Readers for the filtered EBD working files
//!
//! Both files are tab-separated with a header row and no quoting (EBD
//! free-text fields routinely contain stray `"` characters). The header is
//! validated up front: a missing column fails the whole stage, while a bad
//! individual row is reported as a [`RowError`] and skipped by the caller.

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::models::{ChecklistRecord, SamplingRecord};

pub const LOCALITY_ID: &str = "LOCALITY ID";
pub const OBSERVATION_DATE: &str = "OBSERVATION DATE";
pub const SAMPLING_EVENT_IDENTIFIER: &str = "SAMPLING EVENT IDENTIFIER";
pub const GROUP_IDENTIFIER: &str = "GROUP IDENTIFIER";
pub const LOCALITY_TYPE: &str = "LOCALITY TYPE";
pub const ALL_SPECIES_REPORTED: &str = "ALL SPECIES REPORTED";
pub const CATEGORY: &str = "CATEGORY";
pub const SCIENTIFIC_NAME: &str = "SCIENTIFIC NAME";
pub const OBSERVATION_COUNT: &str = "OBSERVATION COUNT";

/// Columns the observation file must carry, in output order
pub const OBSERVATION_COLUMNS: [&str; 9] = [
    LOCALITY_ID,
    OBSERVATION_DATE,
    SAMPLING_EVENT_IDENTIFIER,
    GROUP_IDENTIFIER,
    LOCALITY_TYPE,
    ALL_SPECIES_REPORTED,
    CATEGORY,
    SCIENTIFIC_NAME,
    OBSERVATION_COUNT,
];

/// Columns the sampling file must carry
pub const SAMPLING_COLUMNS: [&str; 4] = [
    LOCALITY_ID,
    OBSERVATION_DATE,
    SAMPLING_EVENT_IDENTIFIER,
    GROUP_IDENTIFIER,
];

/// Optional sampling columns, applied as filters when present
pub const SAMPLING_FILTER_COLUMNS: [&str; 2] = [LOCALITY_TYPE, ALL_SPECIES_REPORTED];

/// Locality type of public hotspots
pub const HOTSPOT_LOCALITY: &str = "H";

/// Taxonomic categories treated as species-level
pub const SPECIES_CATEGORIES: [&str; 3] = ["species", "issf", "form"];

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Why a single row could not be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    MissingField(&'static str),
    InvalidDate(String),
    Unreadable(String),
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowError::MissingField(column) => write!(f, "missing {}", column),
            RowError::InvalidDate(value) => write!(f, "invalid date '{}'", value),
            RowError::Unreadable(reason) => write!(f, "unreadable row: {}", reason),
        }
    }
}

/// Why a well-formed row is outside the aggregation universe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotHotspot,
    Incomplete,
    NotSpeciesLevel,
}

/// Either a parsed row or the reason it was skipped
pub type RowResult<T> = std::result::Result<T, RowError>;

/// Open a plain or gzip-compressed (`.gz`) input
pub fn open_input(path: &Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    let is_gzip = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));

    if is_gzip {
        Ok(Box::new(BufReader::with_capacity(
            1 << 20,
            MultiGzDecoder::new(BufReader::new(file)),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(1 << 20, file)))
    }
}

/// Tab-separated reader configured for EBD files
pub fn tsv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader)
}

/// Index of each required column, or every missing column name
pub fn locate_columns(headers: &StringRecord, required: &[&str], file: &Path) -> Result<Vec<usize>> {
    let mut indexes = Vec::with_capacity(required.len());
    let mut missing = Vec::new();

    for column in required {
        match headers.iter().position(|h| h.trim() == *column) {
            Some(idx) => indexes.push(idx),
            None => missing.push(column.to_string()),
        }
    }

    if missing.is_empty() {
        Ok(indexes)
    } else {
        Err(PipelineError::MissingColumns {
            file: file.to_path_buf(),
            columns: missing,
        })
    }
}

fn optional_column(headers: &StringRecord, column: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == column)
}

fn required_field<'r>(record: &'r StringRecord, idx: usize, column: &'static str) -> RowResult<&'r str> {
    record
        .get(idx)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(RowError::MissingField(column))
}

fn optional_field(record: &StringRecord, idx: usize) -> Option<String> {
    record
        .get(idx)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

pub fn parse_date(value: &str) -> RowResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|_| RowError::InvalidDate(value.to_string()))
}

pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True")
}

/// Classify a parsed observation against the hotspot, completeness and
/// species-level rules
pub fn classify(record: &ChecklistRecord) -> Option<Rejection> {
    if record.locality_type != HOTSPOT_LOCALITY {
        Some(Rejection::NotHotspot)
    } else if !record.all_species_reported {
        Some(Rejection::Incomplete)
    } else if !SPECIES_CATEGORIES.contains(&record.category.as_str()) {
        Some(Rejection::NotSpeciesLevel)
    } else {
        None
    }
}

/// Split csv errors into fatal IO failures and skippable bad rows
fn absorb_row_error(err: csv::Error) -> Result<RowError> {
    if err.is_io_error() {
        return Err(PipelineError::Csv(err));
    }
    Ok(RowError::Unreadable(err.to_string()))
}

/// Streaming reader over the filtered observation file
pub struct ObservationReader<R: Read> {
    reader: csv::Reader<R>,
    columns: Vec<usize>,
    record: StringRecord,
}

impl ObservationReader<Box<dyn Read + Send>> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::new(open_input(path)?, path)
    }
}

impl<R: Read> ObservationReader<R> {
    /// Wrap a reader, validating the header against [`OBSERVATION_COLUMNS`]
    pub fn new(input: R, source: &Path) -> Result<Self> {
        let mut reader = tsv_reader(input);
        let headers = reader.headers()?.clone();
        let columns = locate_columns(&headers, &OBSERVATION_COLUMNS, source)?;
        Ok(Self {
            reader,
            columns,
            record: StringRecord::new(),
        })
    }

    fn parse_current(&self) -> RowResult<ChecklistRecord> {
        let r = &self.record;
        let c = &self.columns;

        let location_id = required_field(r, c[0], LOCALITY_ID)?;
        let date = parse_date(required_field(r, c[1], OBSERVATION_DATE)?)?;
        let checklist_id = required_field(r, c[2], SAMPLING_EVENT_IDENTIFIER)?;
        let sci_name = required_field(r, c[7], SCIENTIFIC_NAME)?;

        Ok(ChecklistRecord {
            location_id: location_id.to_string(),
            date,
            checklist_id: checklist_id.to_string(),
            group_id: optional_field(r, c[3]),
            locality_type: r.get(c[4]).map(str::trim).unwrap_or_default().to_string(),
            all_species_reported: r.get(c[5]).is_some_and(parse_flag),
            category: r.get(c[6]).map(str::trim).unwrap_or_default().to_string(),
            sci_name: sci_name.to_string(),
        })
    }
}

impl<R: Read> Iterator for ObservationReader<R> {
    type Item = Result<RowResult<ChecklistRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_record(&mut self.record) {
            Ok(false) => None,
            Ok(true) => Some(Ok(self.parse_current())),
            Err(err) => Some(absorb_row_error(err).map(Err)),
        }
    }
}

/// Streaming reader over the filtered sampling-event file
pub struct SamplingReader<R: Read> {
    reader: csv::Reader<R>,
    columns: Vec<usize>,
    locality_type: Option<usize>,
    all_species: Option<usize>,
    record: StringRecord,
}

impl SamplingReader<Box<dyn Read + Send>> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::new(open_input(path)?, path)
    }
}

impl<R: Read> SamplingReader<R> {
    pub fn new(input: R, source: &Path) -> Result<Self> {
        let mut reader = tsv_reader(input);
        let headers = reader.headers()?.clone();
        let columns = locate_columns(&headers, &SAMPLING_COLUMNS, source)?;
        Ok(Self {
            reader,
            columns,
            locality_type: optional_column(&headers, LOCALITY_TYPE),
            all_species: optional_column(&headers, ALL_SPECIES_REPORTED),
            record: StringRecord::new(),
        })
    }

    fn parse_current(&self) -> RowResult<SamplingRecord> {
        let r = &self.record;
        let c = &self.columns;

        let location_id = required_field(r, c[0], LOCALITY_ID)?;
        let date = parse_date(required_field(r, c[1], OBSERVATION_DATE)?)?;
        let checklist_id = required_field(r, c[2], SAMPLING_EVENT_IDENTIFIER)?;

        Ok(SamplingRecord {
            location_id: location_id.to_string(),
            date,
            checklist_id: checklist_id.to_string(),
            group_id: optional_field(r, c[3]),
            locality_type: self
                .locality_type
                .map(|idx| r.get(idx).map(str::trim).unwrap_or_default().to_string()),
            all_species_reported: self
                .all_species
                .map(|idx| r.get(idx).is_some_and(parse_flag)),
        })
    }
}

impl<R: Read> Iterator for SamplingReader<R> {
    type Item = Result<RowResult<SamplingRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_record(&mut self.record) {
            Ok(false) => None,
            Ok(true) => Some(Ok(self.parse_current())),
            Err(err) => Some(absorb_row_error(err).map(Err)),
        }
    }
}

/// Sampling rows outside the hotspot/complete universe, when the columns exist
pub fn classify_sampling(record: &SamplingRecord) -> Option<Rejection> {
    if record
        .locality_type
        .as_deref()
        .is_some_and(|t| t != HOTSPOT_LOCALITY)
    {
        Some(Rejection::NotHotspot)
    } else if record.all_species_reported == Some(false) {
        Some(Rejection::Incomplete)
    } else {
        None
    }
}
