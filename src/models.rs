use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StudentYear {
    Freshman,
    Sophomore,
    Junior,
    Senior,
    Graduate,
}

impl StudentYear {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "freshman" => Some(Self::Freshman),
            "sophomore" => Some(Self::Sophomore),
            "junior" => Some(Self::Junior),
            "senior" => Some(Self::Senior),
            "graduate" => Some(Self::Graduate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Freshman => "Freshman",
            Self::Sophomore => "Sophomore",
            Self::Junior => "Junior",
            Self::Senior => "Senior",
            Self::Graduate => "Graduate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StudentStatus {
    #[serde(rename = "Full-time")]
    FullTime,
    #[serde(rename = "Part-time")]
    PartTime,
}

impl StudentStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full-time" | "fulltime" | "full time" => Some(Self::FullTime),
            "part-time" | "parttime" | "part time" => Some(Self::PartTime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullTime => "Full-time",
            Self::PartTime => "Part-time",
        }
    }
}

/// Coarse grouping of the free-form `service_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceCategory {
    Counseling,
    Crisis,
    Group,
    Assessment,
    Workshop,
    Other,
}

impl ServiceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counseling => "Counseling",
            Self::Crisis => "Crisis",
            Self::Group => "Group",
            Self::Assessment => "Assessment",
            Self::Workshop => "Workshop",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Year/month slice of the record log; the unit of batch parallelism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub year: i32,
    pub month: u32,
}

impl Partition {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl FromStr for Partition {
    type Err = String;

    /// Parses `YYYY-MM`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (year, month) = value
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got `{value}`"))?;
        let year: i32 = year
            .parse()
            .map_err(|_| format!("invalid year in `{value}`"))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("invalid month in `{value}`"))?;
        if !(1..=12).contains(&month) {
            return Err(format!("month out of range in `{value}`"));
        }
        Ok(Self { year, month })
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "year={}/month={:02}", self.year, self.month)
    }
}

/// A raw appointment row as it arrives from the record source.
///
/// `student_id` and `appointment_date` are optional here because the source
/// may hand over rows without them; the enricher rejects such rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub student_id: Option<String>,
    pub appointment_date: Option<NaiveDate>,
    pub service_type: String,
    pub counselor_id: String,
    pub duration_minutes: Option<u32>,
    pub student_year: StudentYear,
    pub student_college: String,
    pub student_status: StudentStatus,
    pub international_student: bool,
    pub first_generation: bool,
    pub referral_source: String,
    pub wait_days: Option<u32>,
    pub no_show: bool,
    pub follow_up_scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub student_id: String,
    pub appointment_date: NaiveDate,
    pub service_type: String,
    pub counselor_id: String,
    pub duration_minutes: Option<u32>,
    pub student_year: StudentYear,
    pub student_college: String,
    pub student_status: StudentStatus,
    pub international_student: bool,
    pub first_generation: bool,
    pub referral_source: String,
    pub wait_days: Option<u32>,
    pub no_show: bool,
    pub follow_up_scheduled: bool,
    pub service_category: ServiceCategory,
    pub visit_number: u32,
    pub days_since_last_visit: Option<u32>,
    pub high_risk_indicator: bool,
    pub year: i32,
    pub month: u32,
    /// 1 = Sunday through 7 = Saturday.
    pub day_of_week: u32,
    pub is_weekend: bool,
}

impl EnrichedRecord {
    pub fn partition(&self) -> Partition {
        Partition {
            year: self.year,
            month: self.month,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemographicUsage {
    pub student_year: StudentYear,
    pub student_college: String,
    pub international_student: bool,
    pub first_generation: bool,
    pub total_visits: u64,
    pub unique_students: u64,
    pub avg_duration: Option<f64>,
    pub avg_wait_days: Option<f64>,
    pub no_shows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyTrend {
    pub year: i32,
    pub month: u32,
    pub service_category: ServiceCategory,
    pub visit_count: u64,
    pub avg_wait_days: Option<f64>,
    pub unique_students: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceGap {
    pub service_category: ServiceCategory,
    pub student_college: String,
    pub demand: u64,
    pub avg_wait: Option<f64>,
    pub extended_wait_count: u64,
    pub counselor_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounselorWorkload {
    pub counselor_id: String,
    pub year: i32,
    pub month: u32,
    pub appointments: u64,
    pub total_minutes: u64,
    pub unique_students: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRetention {
    pub student_id: String,
    pub total_visits: u64,
    pub first_visit: NaiveDate,
    pub last_visit: NaiveDate,
    pub avg_visit_frequency: Option<f64>,
}

/// Appointments per weekday within a month, with the counselors who saw them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalDemand {
    pub year: i32,
    pub month: u32,
    /// 1 = Sunday through 7 = Saturday.
    pub day_of_week: u32,
    pub service_category: ServiceCategory,
    pub appointment_count: u64,
    pub avg_wait_days: Option<f64>,
    pub available_counselors: u64,
}

/// Per-student usage averaged over a (year, international, first-generation)
/// population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationUsage {
    pub student_year: StudentYear,
    pub international_student: bool,
    pub first_generation: bool,
    pub student_count: u64,
    pub total_visits: u64,
    pub avg_visits_per_student: Option<f64>,
    /// Mean over students of each student's own mean wait.
    pub avg_wait_days: Option<f64>,
}

/// The rollups produced by one run, each sorted by its key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryTables {
    pub demographic_usage: Vec<DemographicUsage>,
    pub monthly_trends: Vec<MonthlyTrend>,
    pub service_gaps: Vec<ServiceGap>,
    pub counselor_workload: Vec<CounselorWorkload>,
    pub student_retention: Vec<StudentRetention>,
    pub temporal_demand: Vec<TemporalDemand>,
    pub population_usage: Vec<PopulationUsage>,
}

/// Rows and cells the record source could not take as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestQuality {
    /// Rows dropped because `appointment_date` was not a calendar date.
    pub malformed_date: u64,
    /// Rows dropped because `student_year` or `student_status` was unusable.
    pub malformed_demographics: u64,
    /// Unparseable numeric or boolean cells read as missing.
    pub coerced_cells: u64,
}

impl IngestQuality {
    pub fn dropped(&self) -> u64 {
        self.malformed_date + self.malformed_demographics
    }
}

/// Data-quality counters from one enrichment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichStats {
    pub received: u64,
    pub accepted: u64,
    pub missing_student_id: u64,
    pub missing_date: u64,
    pub date_out_of_range: u64,
    pub duplicates: u64,
    #[serde(default)]
    pub ingest: IngestQuality,
}

impl EnrichStats {
    pub fn rejected(&self) -> u64 {
        self.missing_student_id + self.missing_date + self.date_out_of_range + self.ingest.dropped()
    }

    /// Folds in the rows the source dropped before enrichment saw them.
    pub fn with_ingest(mut self, ingest: IngestQuality) -> Self {
        self.received += ingest.dropped();
        self.ingest = ingest;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub service_category: ServiceCategory,
    pub records: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub total_records: u64,
    pub unique_students: u64,
    pub first_appointment: Option<NaiveDate>,
    pub last_appointment: Option<NaiveDate>,
    pub high_risk_records: u64,
    pub partitions: usize,
    pub categories: Vec<CategoryCount>,
    pub enrichment: EnrichStats,
}
