use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::{info, info_span};
use uuid::Uuid;

use crate::aggregate::{aggregate, aggregate_partitioned};
use crate::config::PipelineConfig;
use crate::enrich::Enricher;
use crate::ingest::RawBatch;
use crate::models::{CategoryCount, EnrichStats, EnrichedRecord, RunSummary, ServiceCategory};
use crate::store::Snapshot;

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub snapshot: Snapshot,
    pub records: Vec<EnrichedRecord>,
}

/// Enriches the full history, then rolls it up partition by partition.
///
/// Sequencing needs every visit of a student, so enrichment always sees the
/// whole batch; only aggregation fans out per (year, month).
pub fn run(batch: &RawBatch, config: &PipelineConfig) -> PipelineOutput {
    let run_id = Uuid::new_v4();
    let span = info_span!("pipeline_run", %run_id);
    let _guard = span.enter();

    let partitions = batch.partitions().len();
    info!(raw_records = batch.len(), partitions, "run started");
    let mut enrichment = Enricher::new(config).enrich(batch.records());
    enrichment.stats = enrichment.stats.with_ingest(batch.quality());
    let tables = if partitions > 1 {
        aggregate_partitioned(&enrichment.records, config)
    } else {
        aggregate(&enrichment.records, config)
    };
    let summary = summarize(run_id, &enrichment.records, enrichment.stats);

    info!(
        demographic_usage = tables.demographic_usage.len(),
        monthly_trends = tables.monthly_trends.len(),
        service_gaps = tables.service_gaps.len(),
        counselor_workload = tables.counselor_workload.len(),
        student_retention = tables.student_retention.len(),
        temporal_demand = tables.temporal_demand.len(),
        population_usage = tables.population_usage.len(),
        "rollups computed"
    );

    PipelineOutput {
        snapshot: Snapshot { summary, tables },
        records: enrichment.records,
    }
}

pub fn summarize(run_id: Uuid, records: &[EnrichedRecord], enrichment: EnrichStats) -> RunSummary {
    let students: BTreeSet<&str> = records.iter().map(|r| r.student_id.as_str()).collect();
    let partitions: BTreeSet<_> = records.iter().map(EnrichedRecord::partition).collect();

    let mut by_category: BTreeMap<ServiceCategory, u64> = BTreeMap::new();
    for record in records {
        *by_category.entry(record.service_category).or_insert(0) += 1;
    }
    let mut categories: Vec<CategoryCount> = by_category
        .into_iter()
        .map(|(service_category, records)| CategoryCount {
            service_category,
            records,
        })
        .collect();
    categories.sort_by(|a, b| b.records.cmp(&a.records));

    RunSummary {
        run_id,
        generated_at: Utc::now(),
        total_records: records.len() as u64,
        unique_students: students.len() as u64,
        first_appointment: records.iter().map(|r| r.appointment_date).min(),
        last_appointment: records.iter().map(|r| r.appointment_date).max(),
        high_risk_records: records.iter().filter(|r| r.high_risk_indicator).count() as u64,
        partitions: partitions.len(),
        categories,
        enrichment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, pct_extended_wait};
    use crate::ingest::read_csv;
    use crate::store::table_bytes;
    use chrono::NaiveDate;

    const INPUT: &str = "\
student_id,appointment_date,service_type,counselor_id,duration_minutes,student_year,student_college,student_status,international_student,first_generation,referral_source,wait_days,no_show,follow_up_scheduled
S1,2023-01-01,Counseling,CNS001,50,Junior,College of Music,Full-time,false,false,Self-referral,5,false,true
S1,2023-01-10,Counseling,CNS001,50,Junior,College of Music,Full-time,false,false,Follow-up,20,false,false
S1,2023-01-10,Counseling,CNS001,50,Junior,College of Music,Full-time,false,false,Follow-up,20,false,false
S2,2023-02-14,Crisis Support,CNS002,30,Graduate,College of Health,Part-time,true,false,Emergency,1,false,true
,2023-02-15,Workshop,CNS003,90,Senior,College of Health,Full-time,false,true,Peer,2,false,false
";

    #[test]
    fn end_to_end_counseling_gap() {
        let batch = read_csv(INPUT.as_bytes()).unwrap();
        let config = PipelineConfig::default();
        let output = run(&batch, &config);

        assert_eq!(output.records.len(), 3);
        let summary = &output.snapshot.summary;
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.unique_students, 2);
        assert_eq!(summary.enrichment.duplicates, 1);
        assert_eq!(summary.enrichment.missing_student_id, 1);
        assert_eq!(summary.first_appointment, NaiveDate::from_ymd_opt(2023, 1, 1));
        assert_eq!(summary.last_appointment, NaiveDate::from_ymd_opt(2023, 2, 14));
        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.high_risk_records, 2);
        assert_eq!(summary.categories[0].service_category, ServiceCategory::Counseling);
        assert_eq!(summary.categories[0].records, 2);

        let gap = output
            .snapshot
            .tables
            .service_gaps
            .iter()
            .find(|gap| gap.service_category == ServiceCategory::Counseling)
            .unwrap();
        assert_eq!(gap.demand, 2);
        assert_eq!(gap.extended_wait_count, 1);
        assert_eq!(pct_extended_wait(gap.extended_wait_count, gap.demand), 50.0);

        let views = classify(&output.snapshot.tables, &config);
        assert_eq!(views.service_gaps.len(), 2);
    }

    #[test]
    fn rerun_produces_identical_table_bytes() {
        let batch = read_csv(INPUT.as_bytes()).unwrap();
        let config = PipelineConfig::default();
        let first = run(&batch, &config).snapshot.tables;
        let second = run(&batch, &config).snapshot.tables;

        assert_eq!(
            table_bytes(&first.demographic_usage).unwrap(),
            table_bytes(&second.demographic_usage).unwrap()
        );
        assert_eq!(
            table_bytes(&first.monthly_trends).unwrap(),
            table_bytes(&second.monthly_trends).unwrap()
        );
        assert_eq!(
            table_bytes(&first.student_retention).unwrap(),
            table_bytes(&second.student_retention).unwrap()
        );
        assert_eq!(first, second);
    }

    #[test]
    fn single_partition_run_sequences_within_the_partition() {
        let batch = read_csv(INPUT.as_bytes()).unwrap();
        let scoped = batch.restrict("2023-02".parse().unwrap());
        let output = run(&scoped, &PipelineConfig::default());

        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].student_id, "S2");
        assert_eq!(output.records[0].visit_number, 1);
        assert_eq!(output.snapshot.summary.partitions, 1);
        assert_eq!(output.snapshot.tables.monthly_trends.len(), 1);
    }

    #[test]
    fn malformed_rows_are_counted_and_the_rest_published() {
        let input = format!(
            "{}S3,2023-02-30,Workshop,CNS003,90,Senior,College of Health,Full-time,false,true,Peer,2,false,false\n\
             S4,2023-03-01,Workshop,CNS003,lots,,College of Health,Full-time,false,true,Peer,2,false,false\n\
             S5,2023-03-02,Workshop,CNS003,lots,Senior,College of Health,Full-time,false,true,Peer,-1,false,false\n",
            INPUT
        );
        let batch = read_csv(input.as_bytes()).unwrap();
        let output = run(&batch, &PipelineConfig::default());

        let stats = &output.snapshot.summary.enrichment;
        assert_eq!(stats.ingest.malformed_date, 1);
        assert_eq!(stats.ingest.malformed_demographics, 1);
        assert_eq!(stats.ingest.coerced_cells, 2);
        assert_eq!(stats.received, 8);
        assert_eq!(stats.rejected(), 3);
        assert_eq!(output.records.len(), 4);
        assert!(output.records.iter().any(|r| r.student_id == "S5" && r.wait_days.is_none()));
    }

    #[test]
    fn empty_batch_runs_cleanly() {
        let output = run(&RawBatch::default(), &PipelineConfig::default());
        assert!(output.records.is_empty());
        assert_eq!(output.snapshot.summary.first_appointment, None);
        assert_eq!(output.snapshot.summary.partitions, 0);
    }
}
