use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{Datelike, NaiveDate};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::models::{EnrichStats, EnrichedRecord, ServiceCategory, ServiceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingStudentId,
    MissingDate,
    DateOutOfRange,
}

#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub records: Vec<EnrichedRecord>,
    pub stats: EnrichStats,
}

struct Accepted {
    student_id: String,
    appointment_date: NaiveDate,
    record: ServiceRecord,
}

pub struct Enricher<'a> {
    config: &'a PipelineConfig,
}

impl<'a> Enricher<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    fn validate(&self, record: &ServiceRecord) -> Result<(String, NaiveDate), RejectReason> {
        let student_id = record
            .student_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(RejectReason::MissingStudentId)?;
        let date = record.appointment_date.ok_or(RejectReason::MissingDate)?;
        if date < self.config.min_appointment_date || date > self.config.max_appointment_date {
            return Err(RejectReason::DateOutOfRange);
        }
        Ok((student_id.to_string(), date))
    }

    /// Validates, deduplicates and sequences one batch of raw records.
    ///
    /// Output is ordered by student id, then visit number. Bad rows are
    /// counted in the returned stats and skipped.
    pub fn enrich(&self, raw: &[ServiceRecord]) -> Enrichment {
        let mut stats = EnrichStats {
            received: raw.len() as u64,
            ..EnrichStats::default()
        };
        let mut seen: HashSet<(String, NaiveDate, String)> = HashSet::new();
        let mut by_student: BTreeMap<String, Vec<Accepted>> = BTreeMap::new();

        for (position, record) in raw.iter().enumerate() {
            let (student_id, appointment_date) = match self.validate(record) {
                Ok(identity) => identity,
                Err(reason) => {
                    debug!(position, ?reason, "raw record rejected");
                    match reason {
                        RejectReason::MissingStudentId => stats.missing_student_id += 1,
                        RejectReason::MissingDate => stats.missing_date += 1,
                        RejectReason::DateOutOfRange => stats.date_out_of_range += 1,
                    }
                    continue;
                }
            };

            let key = (
                student_id.clone(),
                appointment_date,
                record.service_type.clone(),
            );
            if !seen.insert(key) {
                stats.duplicates += 1;
                continue;
            }

            by_student
                .entry(student_id.clone())
                .or_default()
                .push(Accepted {
                    student_id,
                    appointment_date,
                    record: record.clone(),
                });
        }

        let mut records = Vec::with_capacity(seen.len());
        for (_, mut visits) in by_student {
            // Stable: same-day visits keep ingestion order.
            visits.sort_by_key(|visit| visit.appointment_date);
            self.sequence_student(visits, &mut records);
        }

        stats.accepted = records.len() as u64;
        if stats.rejected() > 0 || stats.duplicates > 0 {
            warn!(
                rejected = stats.rejected(),
                missing_student_id = stats.missing_student_id,
                missing_date = stats.missing_date,
                date_out_of_range = stats.date_out_of_range,
                duplicates = stats.duplicates,
                "data-quality rejects during enrichment"
            );
        }
        info!(
            received = stats.received,
            accepted = stats.accepted,
            "enrichment complete"
        );

        Enrichment { records, stats }
    }

    /// One ordered pass over a student's visits with a bounded no-show window.
    fn sequence_student(&self, visits: Vec<Accepted>, out: &mut Vec<EnrichedRecord>) {
        let window_len = self.config.no_show_window;
        let mut window: VecDeque<bool> = VecDeque::with_capacity(window_len);
        let mut previous: Option<NaiveDate> = None;

        for (index, visit) in visits.into_iter().enumerate() {
            let Accepted {
                student_id,
                appointment_date,
                record,
            } = visit;

            if window.len() == window_len {
                window.pop_front();
            }
            window.push_back(record.no_show);
            let recent_no_shows = window.iter().filter(|no_show| **no_show).count();

            let service_category = self.config.categorize(&record.service_type);
            let over_critical_wait = record
                .wait_days
                .is_some_and(|wait| wait > self.config.critical_wait_days);
            let high_risk_indicator = service_category == ServiceCategory::Crisis
                || recent_no_shows >= self.config.no_show_threshold
                || over_critical_wait;

            let days_since_last_visit = previous
                .map(|prior| (appointment_date - prior).num_days())
                .and_then(|days| u32::try_from(days).ok());
            previous = Some(appointment_date);

            let weekday = appointment_date.weekday().number_from_sunday();

            out.push(EnrichedRecord {
                student_id,
                appointment_date,
                service_type: record.service_type,
                counselor_id: record.counselor_id,
                duration_minutes: record.duration_minutes,
                student_year: record.student_year,
                student_college: record.student_college,
                student_status: record.student_status,
                international_student: record.international_student,
                first_generation: record.first_generation,
                referral_source: record.referral_source,
                wait_days: record.wait_days,
                no_show: record.no_show,
                follow_up_scheduled: record.follow_up_scheduled,
                service_category,
                visit_number: index as u32 + 1,
                days_since_last_visit,
                high_risk_indicator,
                year: appointment_date.year(),
                month: appointment_date.month(),
                day_of_week: weekday,
                is_weekend: weekday == 1 || weekday == 7,
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{StudentStatus, StudentYear};
    use proptest::prelude::*;

    pub(crate) fn raw(student: &str, date: &str, service_type: &str, wait: Option<u32>) -> ServiceRecord {
        ServiceRecord {
            student_id: Some(student.to_string()),
            appointment_date: Some(NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap()),
            service_type: service_type.to_string(),
            counselor_id: "CNS001".to_string(),
            duration_minutes: Some(50),
            student_year: StudentYear::Junior,
            student_college: "College of Music".to_string(),
            student_status: StudentStatus::FullTime,
            international_student: false,
            first_generation: false,
            referral_source: "Self-referral".to_string(),
            wait_days: wait,
            no_show: false,
            follow_up_scheduled: false,
        }
    }

    fn no_show(mut record: ServiceRecord) -> ServiceRecord {
        record.no_show = true;
        record
    }

    #[test]
    fn duplicate_visit_collapses_and_sequence_is_assigned() {
        let config = PipelineConfig::default();
        let input = vec![
            raw("S1", "2023-01-01", "Counseling", Some(5)),
            raw("S1", "2023-01-10", "Counseling", Some(20)),
            raw("S1", "2023-01-10", "Counseling", Some(20)),
        ];

        let out = Enricher::new(&config).enrich(&input);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.stats.duplicates, 1);
        assert_eq!(out.records[0].visit_number, 1);
        assert_eq!(out.records[0].days_since_last_visit, None);
        assert_eq!(out.records[1].visit_number, 2);
        assert_eq!(out.records[1].days_since_last_visit, Some(9));
        assert!(!out.records[0].high_risk_indicator);
        assert!(out.records[1].high_risk_indicator, "wait of 20 days exceeds 14");
    }

    #[test]
    fn bad_rows_are_counted_not_fatal() {
        let config = PipelineConfig::default();
        let mut missing_id = raw("S1", "2023-01-01", "Workshop", None);
        missing_id.student_id = Some("   ".to_string());
        let mut missing_date = raw("S2", "2023-01-01", "Workshop", None);
        missing_date.appointment_date = None;
        let ancient = raw("S3", "1970-01-01", "Workshop", None);
        let good = raw("S4", "2023-01-01", "Workshop", None);

        let out = Enricher::new(&config).enrich(&[missing_id, missing_date, ancient, good]);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.stats.received, 4);
        assert_eq!(out.stats.accepted, 1);
        assert_eq!(out.stats.missing_student_id, 1);
        assert_eq!(out.stats.missing_date, 1);
        assert_eq!(out.stats.date_out_of_range, 1);
        assert_eq!(out.stats.rejected(), 3);
    }

    #[test]
    fn same_day_visits_keep_ingestion_order() {
        let config = PipelineConfig::default();
        let input = vec![
            raw("S1", "2023-02-01", "Workshop", None),
            raw("S1", "2023-01-15", "Assessment", None),
            raw("S1", "2023-01-15", "Group Therapy", None),
        ];

        let out = Enricher::new(&config).enrich(&input);
        let order: Vec<_> = out.records.iter().map(|r| r.service_type.as_str()).collect();
        assert_eq!(order, vec!["Assessment", "Group Therapy", "Workshop"]);
        assert_eq!(out.records[1].days_since_last_visit, Some(0));
        assert_eq!(out.records[2].days_since_last_visit, Some(17));
    }

    #[test]
    fn categories_and_calendar_fields_are_derived() {
        let config = PipelineConfig::default();
        let input = vec![
            raw("S1", "2023-01-07", "crisis support", None),
            raw("S2", "2023-01-09", "Follow-up", None),
        ];

        let out = Enricher::new(&config).enrich(&input);
        let crisis = &out.records[0];
        assert_eq!(crisis.service_category, ServiceCategory::Crisis);
        assert!(crisis.high_risk_indicator);
        assert_eq!(crisis.day_of_week, 7);
        assert!(crisis.is_weekend);
        assert_eq!((crisis.year, crisis.month), (2023, 1));

        let other = &out.records[1];
        assert_eq!(other.service_category, ServiceCategory::Other);
        assert_eq!(other.day_of_week, 2);
        assert!(!other.is_weekend);
    }

    #[test]
    fn no_show_window_slides_over_last_three_visits() {
        let config = PipelineConfig::default();
        let input = vec![
            no_show(raw("S1", "2023-01-01", "Workshop", None)),
            raw("S1", "2023-01-08", "Workshop", None),
            no_show(raw("S1", "2023-01-15", "Workshop", None)),
            raw("S1", "2023-01-22", "Workshop", None),
            raw("S1", "2023-01-29", "Workshop", None),
        ];

        let flags: Vec<bool> = Enricher::new(&config)
            .enrich(&input)
            .records
            .iter()
            .map(|r| r.high_risk_indicator)
            .collect();
        assert_eq!(flags, vec![false, false, true, false, false]);
    }

    #[test]
    fn window_and_threshold_are_configurable() {
        let config = PipelineConfig {
            no_show_window: 1,
            no_show_threshold: 1,
            critical_wait_days: 30,
            ..PipelineConfig::default()
        };
        let input = vec![
            no_show(raw("S1", "2023-01-01", "Workshop", Some(20))),
            raw("S1", "2023-01-08", "Workshop", Some(20)),
        ];

        let out = Enricher::new(&config).enrich(&input);
        assert!(out.records[0].high_risk_indicator);
        assert!(!out.records[1].high_risk_indicator);
    }

    pub(crate) fn raw_batch_strategy() -> impl Strategy<Value = Vec<ServiceRecord>> {
        let record = (
            0usize..6,
            0i64..120,
            prop::sample::select(vec!["Individual Counseling", "Crisis Support", "Workshop", "Assessment", "Group Therapy"]),
            prop::option::of(0u32..30),
            any::<bool>(),
        )
            .prop_map(|(student, offset, service_type, wait, missed)| {
                let date = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap() + chrono::Duration::days(offset);
                let mut record = raw(
                    &format!("STU{student:06}"),
                    &date.format("%Y-%m-%d").to_string(),
                    service_type,
                    wait,
                );
                record.no_show = missed;
                record
            });
        prop::collection::vec(record, 0..60)
    }

    proptest! {
        #[test]
        fn visit_numbers_are_gapless_and_deltas_defined_after_first(batch in raw_batch_strategy()) {
            let config = PipelineConfig::default();
            let out = Enricher::new(&config).enrich(&batch);

            let mut expected: BTreeMap<&str, u32> = BTreeMap::new();
            for record in &out.records {
                let next = expected.entry(record.student_id.as_str()).or_insert(0);
                *next += 1;
                prop_assert_eq!(record.visit_number, *next);
                prop_assert_eq!(record.days_since_last_visit.is_none(), record.visit_number == 1);
            }
        }

        #[test]
        fn appending_duplicates_does_not_change_output(batch in raw_batch_strategy()) {
            let config = PipelineConfig::default();
            let enricher = Enricher::new(&config);
            let once = enricher.enrich(&batch);

            let mut doubled = batch.clone();
            doubled.extend(batch.iter().cloned());
            let twice = enricher.enrich(&doubled);

            prop_assert_eq!(&once.records, &twice.records);
            prop_assert_eq!(enricher.enrich(&batch).records, once.records);
        }
    }
}
