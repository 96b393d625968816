//! The rollups over enriched records.
//!
//! Means are carried as integer (sum, count) pairs and distinct counts as
//! sets until `finish`, so per-partition rollups merge exactly and in any
//! order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::models::{
    CounselorWorkload, DemographicUsage, EnrichedRecord, MonthlyTrend, Partition,
    PopulationUsage, ServiceCategory, ServiceGap, StudentRetention, StudentYear, SummaryTables,
    TemporalDemand,
};

trait Merge {
    fn merge(&mut self, other: Self);
}

fn merge_maps<K: Ord, V: Merge>(into: &mut BTreeMap<K, V>, from: BTreeMap<K, V>) {
    for (key, value) in from {
        match into.get_mut(&key) {
            Some(existing) => existing.merge(value),
            None => {
                into.insert(key, value);
            }
        }
    }
}

/// Running mean that ignores missing values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeanAcc {
    sum: u64,
    count: u64,
}

impl MeanAcc {
    pub fn push(&mut self, value: Option<u32>) {
        if let Some(value) = value {
            self.sum += u64::from(value);
            self.count += 1;
        }
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }
}

impl Merge for MeanAcc {
    fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.count += other.count;
    }
}

impl Merge for BTreeSet<String> {
    fn merge(&mut self, other: Self) {
        self.extend(other);
    }
}

impl<K: Ord, V: Merge> Merge for BTreeMap<K, V> {
    fn merge(&mut self, other: Self) {
        merge_maps(self, other);
    }
}

type DemographicKey = (StudentYear, String, bool, bool);

#[derive(Debug, Clone, Default)]
struct DemographicAcc {
    visits: u64,
    students: BTreeSet<String>,
    duration: MeanAcc,
    wait: MeanAcc,
    no_shows: u64,
}

impl Merge for DemographicAcc {
    fn merge(&mut self, other: Self) {
        self.visits += other.visits;
        self.students.merge(other.students);
        self.duration.merge(other.duration);
        self.wait.merge(other.wait);
        self.no_shows += other.no_shows;
    }
}

#[derive(Debug, Clone, Default)]
struct MonthlyAcc {
    visits: u64,
    wait: MeanAcc,
    students: BTreeSet<String>,
}

impl Merge for MonthlyAcc {
    fn merge(&mut self, other: Self) {
        self.visits += other.visits;
        self.wait.merge(other.wait);
        self.students.merge(other.students);
    }
}

#[derive(Debug, Clone, Default)]
struct GapAcc {
    demand: u64,
    wait: MeanAcc,
    extended: u64,
    counselors: BTreeSet<String>,
}

impl Merge for GapAcc {
    fn merge(&mut self, other: Self) {
        self.demand += other.demand;
        self.wait.merge(other.wait);
        self.extended += other.extended;
        self.counselors.merge(other.counselors);
    }
}

#[derive(Debug, Clone, Default)]
struct WorkloadAcc {
    appointments: u64,
    minutes: u64,
    students: BTreeSet<String>,
}

impl Merge for WorkloadAcc {
    fn merge(&mut self, other: Self) {
        self.appointments += other.appointments;
        self.minutes += other.minutes;
        self.students.merge(other.students);
    }
}

#[derive(Debug, Clone)]
struct RetentionAcc {
    visits: u64,
    first: NaiveDate,
    last: NaiveDate,
    gaps: MeanAcc,
}

impl Merge for RetentionAcc {
    fn merge(&mut self, other: Self) {
        self.visits += other.visits;
        self.first = self.first.min(other.first);
        self.last = self.last.max(other.last);
        self.gaps.merge(other.gaps);
    }
}

type TemporalKey = (i32, u32, u32, ServiceCategory);

#[derive(Debug, Clone, Default)]
struct TemporalAcc {
    appointments: u64,
    wait: MeanAcc,
    counselors: BTreeSet<String>,
}

impl Merge for TemporalAcc {
    fn merge(&mut self, other: Self) {
        self.appointments += other.appointments;
        self.wait.merge(other.wait);
        self.counselors.merge(other.counselors);
    }
}

type PopulationKey = (StudentYear, bool, bool);

/// One student's visits within a population.
#[derive(Debug, Clone, Default)]
struct StudentAcc {
    visits: u64,
    wait: MeanAcc,
}

impl Merge for StudentAcc {
    fn merge(&mut self, other: Self) {
        self.visits += other.visits;
        self.wait.merge(other.wait);
    }
}

/// Combinable accumulator state for every rollup.
#[derive(Debug, Clone)]
pub struct Rollups {
    extended_wait_days: u32,
    demographic: BTreeMap<DemographicKey, DemographicAcc>,
    monthly: BTreeMap<(i32, u32, ServiceCategory), MonthlyAcc>,
    gaps: BTreeMap<(ServiceCategory, String), GapAcc>,
    workload: BTreeMap<(String, i32, u32), WorkloadAcc>,
    retention: BTreeMap<String, RetentionAcc>,
    temporal: BTreeMap<TemporalKey, TemporalAcc>,
    populations: BTreeMap<PopulationKey, BTreeMap<String, StudentAcc>>,
}

impl Rollups {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            extended_wait_days: config.extended_wait_days,
            demographic: BTreeMap::new(),
            monthly: BTreeMap::new(),
            gaps: BTreeMap::new(),
            workload: BTreeMap::new(),
            retention: BTreeMap::new(),
            temporal: BTreeMap::new(),
            populations: BTreeMap::new(),
        }
    }

    pub fn from_records(records: &[EnrichedRecord], config: &PipelineConfig) -> Self {
        let mut rollups = Self::new(config);
        for record in records {
            rollups.add(record);
        }
        rollups
    }

    pub fn add(&mut self, record: &EnrichedRecord) {
        let extended_wait_days = self.extended_wait_days;
        let demographic = self
            .demographic
            .entry((
                record.student_year,
                record.student_college.clone(),
                record.international_student,
                record.first_generation,
            ))
            .or_default();
        demographic.visits += 1;
        demographic.students.insert(record.student_id.clone());
        demographic.duration.push(record.duration_minutes);
        demographic.wait.push(record.wait_days);
        demographic.no_shows += u64::from(record.no_show);

        let monthly = self
            .monthly
            .entry((record.year, record.month, record.service_category))
            .or_default();
        monthly.visits += 1;
        monthly.wait.push(record.wait_days);
        monthly.students.insert(record.student_id.clone());

        let gap = self
            .gaps
            .entry((record.service_category, record.student_college.clone()))
            .or_default();
        gap.demand += 1;
        gap.wait.push(record.wait_days);
        gap.extended += u64::from(record.wait_days.is_some_and(|wait| wait > extended_wait_days));
        gap.counselors.insert(record.counselor_id.clone());

        let workload = self
            .workload
            .entry((record.counselor_id.clone(), record.year, record.month))
            .or_default();
        workload.appointments += 1;
        workload.minutes += record.duration_minutes.map(u64::from).unwrap_or(0);
        workload.students.insert(record.student_id.clone());

        let retention = self
            .retention
            .entry(record.student_id.clone())
            .or_insert_with(|| RetentionAcc {
                visits: 0,
                first: record.appointment_date,
                last: record.appointment_date,
                gaps: MeanAcc::default(),
            });
        retention.visits += 1;
        retention.first = retention.first.min(record.appointment_date);
        retention.last = retention.last.max(record.appointment_date);
        retention.gaps.push(record.days_since_last_visit);

        let temporal = self
            .temporal
            .entry((
                record.year,
                record.month,
                record.day_of_week,
                record.service_category,
            ))
            .or_default();
        temporal.appointments += 1;
        temporal.wait.push(record.wait_days);
        temporal.counselors.insert(record.counselor_id.clone());

        let student = self
            .populations
            .entry((
                record.student_year,
                record.international_student,
                record.first_generation,
            ))
            .or_default()
            .entry(record.student_id.clone())
            .or_default();
        student.visits += 1;
        student.wait.push(record.wait_days);
    }

    pub fn merge(mut self, other: Self) -> Self {
        merge_maps(&mut self.demographic, other.demographic);
        merge_maps(&mut self.monthly, other.monthly);
        merge_maps(&mut self.gaps, other.gaps);
        merge_maps(&mut self.workload, other.workload);
        merge_maps(&mut self.retention, other.retention);
        merge_maps(&mut self.temporal, other.temporal);
        merge_maps(&mut self.populations, other.populations);
        self
    }

    /// Final division; rows come out sorted by key.
    pub fn finish(&self) -> SummaryTables {
        SummaryTables {
            demographic_usage: self
                .demographic
                .iter()
                .map(|((year, college, international, first_gen), acc)| DemographicUsage {
                    student_year: *year,
                    student_college: college.clone(),
                    international_student: *international,
                    first_generation: *first_gen,
                    total_visits: acc.visits,
                    unique_students: acc.students.len() as u64,
                    avg_duration: acc.duration.mean(),
                    avg_wait_days: acc.wait.mean(),
                    no_shows: acc.no_shows,
                })
                .collect(),
            monthly_trends: self
                .monthly
                .iter()
                .map(|((year, month, category), acc)| MonthlyTrend {
                    year: *year,
                    month: *month,
                    service_category: *category,
                    visit_count: acc.visits,
                    avg_wait_days: acc.wait.mean(),
                    unique_students: acc.students.len() as u64,
                })
                .collect(),
            service_gaps: self
                .gaps
                .iter()
                .map(|((category, college), acc)| ServiceGap {
                    service_category: *category,
                    student_college: college.clone(),
                    demand: acc.demand,
                    avg_wait: acc.wait.mean(),
                    extended_wait_count: acc.extended,
                    counselor_count: acc.counselors.len() as u64,
                })
                .collect(),
            counselor_workload: self
                .workload
                .iter()
                .map(|((counselor, year, month), acc)| CounselorWorkload {
                    counselor_id: counselor.clone(),
                    year: *year,
                    month: *month,
                    appointments: acc.appointments,
                    total_minutes: acc.minutes,
                    unique_students: acc.students.len() as u64,
                })
                .collect(),
            student_retention: self
                .retention
                .iter()
                .map(|(student, acc)| StudentRetention {
                    student_id: student.clone(),
                    total_visits: acc.visits,
                    first_visit: acc.first,
                    last_visit: acc.last,
                    avg_visit_frequency: acc.gaps.mean(),
                })
                .collect(),
            temporal_demand: self
                .temporal
                .iter()
                .map(|((year, month, day_of_week, category), acc)| TemporalDemand {
                    year: *year,
                    month: *month,
                    day_of_week: *day_of_week,
                    service_category: *category,
                    appointment_count: acc.appointments,
                    avg_wait_days: acc.wait.mean(),
                    available_counselors: acc.counselors.len() as u64,
                })
                .collect(),
            population_usage: self
                .populations
                .iter()
                .map(|(key, students)| population_row(*key, students))
                .collect(),
        }
    }
}

/// Students are summed in key order, so the float mean of means is the same
/// however the partials were merged.
fn population_row(
    (student_year, international_student, first_generation): PopulationKey,
    students: &BTreeMap<String, StudentAcc>,
) -> PopulationUsage {
    let student_count = students.len() as u64;
    let total_visits: u64 = students.values().map(|student| student.visits).sum();
    let waits: Vec<f64> = students
        .values()
        .filter_map(|student| student.wait.mean())
        .collect();

    PopulationUsage {
        student_year,
        international_student,
        first_generation,
        student_count,
        total_visits,
        avg_visits_per_student: (student_count > 0)
            .then(|| total_visits as f64 / student_count as f64),
        avg_wait_days: (!waits.is_empty())
            .then(|| waits.iter().sum::<f64>() / waits.len() as f64),
    }
}

pub fn aggregate(records: &[EnrichedRecord], config: &PipelineConfig) -> SummaryTables {
    Rollups::from_records(records, config).finish()
}

/// Rolls up each (year, month) partition in parallel and merges the partials.
pub fn aggregate_partitioned(records: &[EnrichedRecord], config: &PipelineConfig) -> SummaryTables {
    let mut partitions: BTreeMap<Partition, Vec<&EnrichedRecord>> = BTreeMap::new();
    for record in records {
        partitions.entry(record.partition()).or_default().push(record);
    }
    info!(partitions = partitions.len(), records = records.len(), "aggregating partitions");

    let rollups = partitions
        .into_par_iter()
        .map(|(partition, members)| {
            let mut rollups = Rollups::new(config);
            for record in members {
                rollups.add(record);
            }
            debug!(%partition, groups = rollups.retention.len(), "partition rolled up");
            rollups
        })
        .reduce(|| Rollups::new(config), Rollups::merge);

    rollups.finish()
}
