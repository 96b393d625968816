//! Raw-record ingestion from CSV exports.
//!
//! The header must carry exactly the raw schema's columns (in any order) and
//! every row must have one cell per column; anything else aborts ingestion.
//! Bad cells never do. A row whose date or demographics cannot be read is
//! dropped and counted, and an unparseable number or flag is read as missing.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{IngestQuality, Partition, ServiceRecord, StudentStatus, StudentYear};

pub const RAW_COLUMNS: [&str; 14] = [
    "student_id",
    "appointment_date",
    "service_type",
    "counselor_id",
    "duration_minutes",
    "student_year",
    "student_college",
    "student_status",
    "international_student",
    "first_generation",
    "referral_source",
    "wait_days",
    "no_show",
    "follow_up_scheduled",
];

/// Raw records in ingestion order, pulled once from a source.
#[derive(Debug, Clone, Default)]
pub struct RawBatch {
    records: Vec<ServiceRecord>,
    quality: IngestQuality,
}

impl RawBatch {
    pub fn new(records: Vec<ServiceRecord>) -> Self {
        Self::with_quality(records, IngestQuality::default())
    }

    pub fn with_quality(records: Vec<ServiceRecord>, quality: IngestQuality) -> Self {
        Self { records, quality }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// All records, including ones without a usable date.
    pub fn records(&self) -> &[ServiceRecord] {
        &self.records
    }

    /// Counters for rows and cells the source could not take as-is.
    pub fn quality(&self) -> IngestQuality {
        self.quality
    }

    pub fn partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self
            .records
            .iter()
            .filter_map(|record| record.appointment_date.map(Partition::of))
            .collect();
        partitions.sort();
        partitions.dedup();
        partitions
    }

    /// Records of one partition, preserving ingestion order.
    pub fn pull(&self, partition: Partition) -> Vec<ServiceRecord> {
        self.records
            .iter()
            .filter(|record| record.appointment_date.map(Partition::of) == Some(partition))
            .cloned()
            .collect()
    }

    /// Narrows the batch to a single partition. Dropped rows have no
    /// trustworthy partition, so the source-wide quality counters carry over.
    pub fn restrict(&self, partition: Partition) -> RawBatch {
        RawBatch::with_quality(self.pull(partition), self.quality)
    }
}

pub fn read_csv_path(path: &Path) -> Result<RawBatch> {
    let file = std::fs::File::open(path).map_err(|err| PipelineError::io(path, err))?;
    let batch = read_csv(file)?;
    info!(path = %path.display(), records = batch.len(), "raw records loaded");
    Ok(batch)
}

pub fn read_csv<R: Read>(input: R) -> Result<RawBatch> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);
    let columns = column_index(reader.headers()?)?;

    let mut records = Vec::new();
    let mut quality = IngestQuality::default();
    for (index, row) in reader.records().enumerate() {
        let row = row?;
        let line = row
            .position()
            .map(|position| position.line())
            .unwrap_or(index as u64 + 2);
        let mut cells = Row {
            record: &row,
            columns: &columns,
            line,
            coerced: 0,
        };
        let parsed = parse_row(&mut cells);
        quality.coerced_cells += cells.coerced;
        match parsed {
            Ok(record) => records.push(record),
            Err(RowDefect::MalformedDate) => quality.malformed_date += 1,
            Err(RowDefect::MalformedDemographics) => quality.malformed_demographics += 1,
        }
    }

    if quality != IngestQuality::default() {
        warn!(
            malformed_date = quality.malformed_date,
            malformed_demographics = quality.malformed_demographics,
            coerced_cells = quality.coerced_cells,
            "malformed cells in raw csv"
        );
    }
    debug!(records = records.len(), "parsed raw csv");
    Ok(RawBatch::with_quality(records, quality))
}

fn column_index(headers: &csv::StringRecord) -> Result<HashMap<&'static str, usize>> {
    let mut index = HashMap::new();
    let mut unexpected = Vec::new();

    for (position, header) in headers.iter().enumerate() {
        match RAW_COLUMNS.iter().find(|column| **column == header) {
            Some(column) if !index.contains_key(column) => {
                index.insert(*column, position);
            }
            _ => unexpected.push(header.to_string()),
        }
    }

    let missing: Vec<&str> = RAW_COLUMNS
        .iter()
        .copied()
        .filter(|column| !index.contains_key(column))
        .collect();

    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(PipelineError::ColumnSet {
            missing: missing.join(", "),
            unexpected: unexpected.join(", "),
        });
    }
    Ok(index)
}

/// Why a row could not become a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowDefect {
    MalformedDate,
    MalformedDemographics,
}

struct Row<'a> {
    record: &'a csv::StringRecord,
    columns: &'a HashMap<&'static str, usize>,
    line: u64,
    coerced: u64,
}

impl<'a> Row<'a> {
    fn cell(&self, column: &'static str) -> &'a str {
        let record = self.record;
        self.columns
            .get(column)
            .and_then(move |position| record.get(*position))
            .unwrap_or("")
    }

    fn optional_text(&self, column: &'static str) -> Option<String> {
        let value = self.cell(column);
        (!value.is_empty()).then(|| value.to_string())
    }

    fn coerce(&mut self, column: &'static str, value: &str, expected: &str) {
        debug!(row = self.line, column, value, expected, "unparseable cell read as missing");
        self.coerced += 1;
    }

    fn optional_date(&self, column: &'static str) -> std::result::Result<Option<NaiveDate>, RowDefect> {
        let value = self.cell(column);
        if value.is_empty() {
            return Ok(None);
        }
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .map_err(|err| {
                debug!(row = self.line, column, value, error = %err, "malformed date; row dropped");
                RowDefect::MalformedDate
            })
    }

    fn optional_count(&mut self, column: &'static str) -> Option<u32> {
        let value = self.cell(column);
        if value.is_empty() {
            return None;
        }
        match value.parse::<u32>() {
            Ok(count) => Some(count),
            Err(_) => {
                self.coerce(column, value, "non-negative integer");
                None
            }
        }
    }

    fn flag(&mut self, column: &'static str) -> bool {
        let value = self.cell(column);
        if value.is_empty() {
            return false;
        }
        parse_bool(value).unwrap_or_else(|| {
            self.coerce(column, value, "boolean");
            false
        })
    }

    fn demographic<T>(
        &self,
        column: &'static str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> std::result::Result<T, RowDefect> {
        let value = self.cell(column);
        parse(value).ok_or_else(|| {
            debug!(row = self.line, column, value, "unusable demographic; row dropped");
            RowDefect::MalformedDemographics
        })
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => Some(true),
        "false" | "f" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_row(row: &mut Row<'_>) -> std::result::Result<ServiceRecord, RowDefect> {
    let appointment_date = row.optional_date("appointment_date")?;
    let student_year = row.demographic("student_year", StudentYear::parse)?;
    let student_status = row.demographic("student_status", StudentStatus::parse)?;

    Ok(ServiceRecord {
        student_id: row.optional_text("student_id"),
        appointment_date,
        service_type: row.cell("service_type").to_string(),
        counselor_id: row.cell("counselor_id").to_string(),
        duration_minutes: row.optional_count("duration_minutes"),
        student_year,
        student_college: row.cell("student_college").to_string(),
        student_status,
        international_student: row.flag("international_student"),
        first_generation: row.flag("first_generation"),
        referral_source: row.cell("referral_source").to_string(),
        wait_days: row.optional_count("wait_days"),
        no_show: row.flag("no_show"),
        follow_up_scheduled: row.flag("follow_up_scheduled"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "student_id,appointment_date,service_type,counselor_id,duration_minutes,student_year,student_college,student_status,international_student,first_generation,referral_source,wait_days,no_show,follow_up_scheduled";

    fn csv_with(rows: &[&str]) -> String {
        let mut out = String::from(HEADER);
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out
    }

    #[test]
    fn parses_rows_with_missing_optional_values() {
        let input = csv_with(&[
            "STU000001,2023-01-01,Individual Counseling,CNS001,50,Freshman,College of Music,Full-time,false,true,Self-referral,5,false,true",
            ",2023-01-02,Workshop,CNS002,,Senior,College of Health,Part-time,TRUE,0,Peer,,yes,no",
        ]);

        let batch = read_csv(input.as_bytes()).unwrap();
        assert_eq!(batch.len(), 2);

        let first = &batch.records()[0];
        assert_eq!(first.student_id.as_deref(), Some("STU000001"));
        assert_eq!(first.duration_minutes, Some(50));
        assert!(first.first_generation);

        let second = &batch.records()[1];
        assert_eq!(second.student_id, None);
        assert_eq!(second.duration_minutes, None);
        assert_eq!(second.wait_days, None);
        assert_eq!(second.student_status, StudentStatus::PartTime);
        assert!(second.international_student);
        assert!(second.no_show);
    }

    #[test]
    fn column_order_does_not_matter() {
        let input = "no_show,follow_up_scheduled,student_id,appointment_date,service_type,counselor_id,duration_minutes,student_year,student_college,student_status,international_student,first_generation,referral_source,wait_days\nfalse,false,S1,2023-02-03,Assessment,C1,30,Junior,College of Business,Full-time,false,false,Faculty,4";
        let batch = read_csv(input.as_bytes()).unwrap();
        assert_eq!(batch.records()[0].student_id.as_deref(), Some("S1"));
        assert_eq!(batch.records()[0].wait_days, Some(4));
    }

    #[test]
    fn missing_column_is_a_schema_violation() {
        let input = "student_id,appointment_date\nS1,2023-01-01";
        let err = read_csv(input.as_bytes()).unwrap_err();
        assert!(err.is_schema_violation());
        assert!(err.to_string().contains("wait_days"));
    }

    #[test]
    fn unexpected_column_is_a_schema_violation() {
        let input = format!("{HEADER},favorite_color\n");
        let err = read_csv(input.as_bytes()).unwrap_err();
        match err {
            PipelineError::ColumnSet { unexpected, .. } => assert_eq!(unexpected, "favorite_color"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unparseable_numbers_and_flags_are_read_as_missing() {
        let input = csv_with(&[
            "S1,2023-01-01,Workshop,C1,ninety,Junior,College of Music,Full-time,maybe,false,Peer,-2,false,false",
        ]);
        let batch = read_csv(input.as_bytes()).unwrap();

        assert_eq!(batch.len(), 1);
        let record = &batch.records()[0];
        assert_eq!(record.duration_minutes, None);
        assert_eq!(record.wait_days, None);
        assert!(!record.international_student);
        assert_eq!(batch.quality().coerced_cells, 3);
        assert_eq!(batch.quality().dropped(), 0);
    }

    #[test]
    fn malformed_date_row_is_dropped_and_neighbours_survive() {
        let input = csv_with(&[
            "S1,2023-02-01,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Peer,3,false,false",
            "S2,2023-02-30,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Peer,3,false,false",
            "S3,2023-02-03,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Peer,3,false,false",
        ]);
        let batch = read_csv(input.as_bytes()).unwrap();

        let students: Vec<_> = batch
            .records()
            .iter()
            .filter_map(|record| record.student_id.as_deref())
            .collect();
        assert_eq!(students, vec!["S1", "S3"]);
        assert_eq!(batch.quality().malformed_date, 1);
        assert_eq!(batch.quality().dropped(), 1);
    }

    #[test]
    fn blank_or_unknown_demographics_drop_the_row() {
        let input = csv_with(&[
            "S1,2023-01-01,Workshop,C1,30,,College of Music,Full-time,false,false,Peer,3,false,false",
            "S2,2023-01-01,Workshop,C1,30,Junior,College of Music,Sometimes,false,false,Peer,3,false,false",
            "S3,2023-01-01,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Peer,3,false,false",
        ]);
        let batch = read_csv(input.as_bytes()).unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records()[0].student_id.as_deref(), Some("S3"));
        assert_eq!(batch.quality().malformed_demographics, 2);
    }

    #[test]
    fn ragged_row_is_a_schema_violation() {
        let input = csv_with(&["S1,2023-01-01,Workshop"]);
        let err = read_csv(input.as_bytes()).unwrap_err();
        assert!(err.is_schema_violation());
    }

    #[test]
    fn invalid_utf8_is_a_schema_violation() {
        let mut input = csv_with(&[
            "S1,2023-01-01,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Pe",
        ])
        .into_bytes();
        input.push(0xff);
        input.extend_from_slice(b"er,3,false,false");
        let err = read_csv(input.as_slice()).unwrap_err();
        assert!(err.is_schema_violation());
    }

    #[test]
    fn restrict_keeps_source_quality_counters() {
        let input = csv_with(&[
            "S1,2023-01-01,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Peer,3,false,false",
            "S2,2023-13-01,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Peer,3,false,false",
        ]);
        let batch = read_csv(input.as_bytes()).unwrap();
        let scoped = batch.restrict(Partition { year: 2023, month: 1 });
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped.quality().malformed_date, 1);
    }

    #[test]
    fn partitions_are_sorted_and_pull_keeps_order() {
        let input = csv_with(&[
            "S2,2023-03-05,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Peer,3,false,false",
            "S1,2023-01-09,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Peer,3,false,false",
            "S3,2023-03-01,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Peer,3,false,false",
            "S4,,Workshop,C1,30,Junior,College of Music,Full-time,false,false,Peer,3,false,false",
        ]);
        let batch = read_csv(input.as_bytes()).unwrap();

        let partitions = batch.partitions();
        assert_eq!(
            partitions,
            vec![
                Partition { year: 2023, month: 1 },
                Partition { year: 2023, month: 3 }
            ]
        );

        let march: Vec<_> = batch
            .pull(Partition { year: 2023, month: 3 })
            .into_iter()
            .filter_map(|record| record.student_id)
            .collect();
        assert_eq!(march, vec!["S2".to_string(), "S3".to_string()]);
        assert_eq!(batch.restrict(Partition { year: 2023, month: 1 }).len(), 1);
    }
}
