use std::fmt::Write;

use crate::classify::{self, EngagementTier, WaitSeverity};
use crate::config::PipelineConfig;
use crate::store::Snapshot;

fn days(value: Option<f64>) -> String {
    value
        .map(|days| format!("{days:.1} days"))
        .unwrap_or_else(|| "n/a".to_string())
}

fn per_counselor(value: Option<f64>) -> String {
    value
        .map(|ratio| format!("{ratio:.1} per counselor"))
        .unwrap_or_else(|| "no counselors".to_string())
}

pub fn build_report(snapshot: &Snapshot, config: &PipelineConfig, limit: usize) -> String {
    let summary = &snapshot.summary;
    let tables = &snapshot.tables;
    let views = classify::classify(tables, config);

    let mut output = String::new();

    let _ = writeln!(output, "# Service Gap Report");
    let _ = writeln!(
        output,
        "Run {} generated {}",
        summary.run_id,
        summary.generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Run Summary");
    let _ = writeln!(output, "- Records: {}", summary.total_records);
    let _ = writeln!(output, "- Unique students: {}", summary.unique_students);
    match (summary.first_appointment, summary.last_appointment) {
        (Some(first), Some(last)) => {
            let _ = writeln!(output, "- Date range: {first} to {last}");
        }
        _ => {
            let _ = writeln!(output, "- Date range: no appointments");
        }
    }
    let _ = writeln!(output, "- High-risk records: {}", summary.high_risk_records);
    let _ = writeln!(
        output,
        "- Rejected rows: {} ({} duplicates collapsed)",
        summary.enrichment.rejected(),
        summary.enrichment.duplicates
    );
    let ingest = &summary.enrichment.ingest;
    if ingest.dropped() > 0 || ingest.coerced_cells > 0 {
        let _ = writeln!(
            output,
            "- Malformed input: {} bad dates, {} bad demographics, {} cells read as missing",
            ingest.malformed_date, ingest.malformed_demographics, ingest.coerced_cells
        );
    }
    for category in &summary.categories {
        let _ = writeln!(
            output,
            "- {}: {} records",
            category.service_category, category.records
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Longest Waits by Segment");

    let mut segments: Vec<_> = views
        .demographics
        .iter()
        .filter(|view| view.wait_severity != WaitSeverity::Normal)
        .collect();
    segments.sort_by(|a, b| {
        b.usage
            .avg_wait_days
            .partial_cmp(&a.usage.avg_wait_days)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if segments.is_empty() {
        let _ = writeln!(output, "No segments above the normal wait range.");
    } else {
        for view in segments.iter().take(limit) {
            let usage = view.usage;
            let _ = writeln!(
                output,
                "- [{}] {} {} (international: {}, first-gen: {}): {} over {} visits, {} ({:.1} visits/student)",
                view.wait_severity.as_str(),
                usage.student_year.as_str(),
                usage.student_college,
                usage.international_student,
                usage.first_generation,
                days(usage.avg_wait_days),
                usage.total_visits,
                view.service_gap,
                view.utilization_rate
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Service Gaps");

    let mut gaps: Vec<_> = views.service_gaps.iter().collect();
    gaps.sort_by(|a, b| {
        b.pct_extended_wait
            .partial_cmp(&a.pct_extended_wait)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.gap.demand.cmp(&a.gap.demand))
    });

    if gaps.is_empty() {
        let _ = writeln!(output, "No service demand recorded.");
    } else {
        for view in gaps.iter().take(limit) {
            let _ = writeln!(
                output,
                "- {} / {}: demand {}, avg wait {}, {:.2}% extended ({}), {}",
                view.gap.service_category,
                view.gap.student_college,
                view.gap.demand,
                days(view.gap.avg_wait),
                view.pct_extended_wait,
                view.adequacy.as_str(),
                per_counselor(view.demand_per_counselor)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Peak Months by Category");

    let peaks: Vec<_> = views
        .demand_ranks
        .iter()
        .filter(|ranked| ranked.demand_rank == 1)
        .collect();
    if peaks.is_empty() {
        let _ = writeln!(output, "No monthly demand recorded.");
    } else {
        for ranked in peaks {
            let trend = ranked.trend;
            let _ = writeln!(
                output,
                "- {} peaked {}-{:02} with {} visits from {} students",
                trend.service_category,
                trend.year,
                trend.month,
                trend.visit_count,
                trend.unique_students
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Peak Demand Slots");

    let mut slots: Vec<_> = views.temporal.iter().filter(|view| view.peak_demand).collect();
    slots.sort_by(|a, b| {
        b.demand_per_counselor
            .partial_cmp(&a.demand_per_counselor)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if slots.is_empty() {
        let _ = writeln!(output, "No peak demand slots.");
    } else {
        for view in slots.iter().take(limit) {
            let demand = view.demand;
            let _ = writeln!(
                output,
                "- {} {}-{:02} {}: {} appointments across {} counselors ({})",
                view.day_name,
                demand.year,
                demand.month,
                demand.service_category,
                demand.appointment_count,
                demand.available_counselors,
                per_counselor(view.demand_per_counselor)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Underserved Populations");

    let mut underserved: Vec<_> = views
        .populations
        .iter()
        .filter(|view| view.underserved)
        .collect();
    underserved.sort_by(|a, b| {
        a.equity_score
            .partial_cmp(&b.equity_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if underserved.is_empty() {
        let _ = writeln!(output, "No underserved populations.");
    } else {
        for view in underserved.iter().take(limit) {
            let population = view.population;
            let _ = writeln!(
                output,
                "- {} (international: {}, first-gen: {}): equity {:.2}, {:.1} visits/student, avg wait {}",
                population.student_year.as_str(),
                population.international_student,
                population.first_generation,
                view.equity_score.unwrap_or(0.0),
                population.avg_visits_per_student.unwrap_or(0.0),
                days(population.avg_wait_days)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Engagement Tiers");
    for tier in &views.tiers {
        let _ = writeln!(
            output,
            "- {}: {} students (mean {:.1} visits)",
            tier.tier.as_str(),
            tier.students,
            tier.mean_visits
        );
    }

    let mut engaged: Vec<_> = views
        .retention
        .iter()
        .filter(|view| matches!(view.tier, Some(EngagementTier::Regular | EngagementTier::Frequent)))
        .collect();
    engaged.sort_by(|a, b| {
        b.retention
            .total_visits
            .cmp(&a.retention.total_visits)
            .then(a.retention.student_id.cmp(&b.retention.student_id))
    });
    if !engaged.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Most Engaged Students");
        for view in engaged.iter().take(limit) {
            let retention = view.retention;
            let _ = writeln!(
                output,
                "- {}: {} visits {} to {}, every {}",
                retention.student_id,
                retention.total_visits,
                retention.first_visit,
                retention.last_visit,
                days(retention.avg_visit_frequency)
            );
        }
    }

    let mut workload = tables.counselor_workload.clone();
    workload.sort_by(|a, b| {
        b.appointments
            .cmp(&a.appointments)
            .then(a.counselor_id.cmp(&b.counselor_id))
    });
    let _ = writeln!(output);
    let _ = writeln!(output, "## Busiest Counselor Months");

    if workload.is_empty() {
        let _ = writeln!(output, "No appointments recorded.");
    } else {
        for row in workload.iter().take(limit) {
            let _ = writeln!(
                output,
                "- {} in {}-{:02}: {} appointments, {} minutes, {} students",
                row.counselor_id,
                row.year,
                row.month,
                row.appointments,
                row.total_minutes,
                row.unique_students
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::tests::raw;
    use crate::ingest::RawBatch;
    use crate::models::{IngestQuality, StudentYear};
    use crate::pipeline;

    #[test]
    fn report_lists_gaps_and_tiers() {
        let config = PipelineConfig::default();
        let batch = RawBatch::new(vec![
            raw("S1", "2023-01-01", "Individual Counseling", Some(5)),
            raw("S1", "2023-01-10", "Individual Counseling", Some(20)),
        ]);
        let output = pipeline::run(&batch, &config);

        let report = build_report(&output.snapshot, &config, 10);
        assert!(report.starts_with("# Service Gap Report"));
        assert!(report.contains("- Records: 2"));
        assert!(report.contains("- Date range: 2023-01-01 to 2023-01-10"));
        assert!(report.contains("[High] Junior College of Music"));
        assert!(report.contains(
            "- Counseling / College of Music: demand 2, avg wait 12.5 days, 50.00% extended (Needs Improvement), 2.0 per counselor"
        ));
        assert!(report.contains("No peak demand slots."));
        assert!(report.contains("- Counseling peaked 2023-01 with 2 visits from 1 students"));
        assert!(report.contains("- Occasional: 1 students (mean 2.0 visits)"));
        assert!(report.contains("- CNS001 in 2023-01: 2 appointments, 100 minutes, 1 students"));
    }

    #[test]
    fn regular_students_are_listed() {
        let config = PipelineConfig::default();
        let visits: Vec<_> = (1..=5)
            .map(|day| raw("S9", &format!("2023-03-{:02}", day * 2), "Workshop", Some(2)))
            .collect();
        let output = pipeline::run(&RawBatch::new(visits), &config);

        let report = build_report(&output.snapshot, &config, 10);
        assert!(report.contains("## Most Engaged Students"));
        assert!(report.contains("- S9: 5 visits 2023-03-02 to 2023-03-10, every 2.0 days"));
    }

    #[test]
    fn underserved_population_is_listed() {
        let config = PipelineConfig::default();
        let mut visits = vec![raw("S1", "2023-04-03", "Workshop", Some(20))];
        for day in [3, 10, 17] {
            let mut visit = raw("S2", &format!("2023-04-{day:02}"), "Workshop", Some(2));
            visit.student_year = StudentYear::Senior;
            visits.push(visit);
        }
        let output = pipeline::run(&RawBatch::new(visits), &config);

        let report = build_report(&output.snapshot, &config, 10);
        assert!(report.contains("## Underserved Populations"));
        assert!(report.contains(
            "- Junior (international: false, first-gen: false): equity 0.5"
        ));
        assert!(report.contains("1.0 visits/student, avg wait 20.0 days"));
        assert!(!report.contains("- Senior (international"));
    }

    #[test]
    fn malformed_input_is_summarised() {
        let config = PipelineConfig::default();
        let batch = RawBatch::with_quality(
            vec![raw("S1", "2023-01-01", "Workshop", Some(1))],
            IngestQuality {
                malformed_date: 2,
                malformed_demographics: 0,
                coerced_cells: 1,
            },
        );
        let output = pipeline::run(&batch, &config);
        let report = build_report(&output.snapshot, &config, 10);
        assert!(report.contains("- Rejected rows: 2 (0 duplicates collapsed)"));
        assert!(report.contains(
            "- Malformed input: 2 bad dates, 0 bad demographics, 1 cells read as missing"
        ));
    }

    #[test]
    fn empty_snapshot_still_renders() {
        let config = PipelineConfig::default();
        let output = pipeline::run(&RawBatch::default(), &config);
        let report = build_report(&output.snapshot, &config, 5);
        assert!(report.contains("No segments above the normal wait range."));
        assert!(report.contains("No service demand recorded."));
        assert!(report.contains("No underserved populations."));
        assert!(!report.contains("Malformed input"));
        assert!(report.contains("- One-time: 0 students (mean 0.0 visits)"));
        assert!(!report.contains("## Most Engaged Students"));
    }
}
