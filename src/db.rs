use anyhow::Context;
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ingest::{self, RawBatch};
use crate::models::{ServiceRecord, StudentStatus, StudentYear};
use crate::store::Snapshot;

fn count(value: u64) -> anyhow::Result<i64> {
    i64::try_from(value).with_context(|| format!("count {value} does not fit in BIGINT"))
}

fn small(column: &str, value: Option<u32>) -> anyhow::Result<Option<i32>> {
    value
        .map(|value| {
            i32::try_from(value)
                .with_context(|| format!("{column} value {value} does not fit in INTEGER"))
        })
        .transpose()
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Appends a CSV export to the raw log. Rows whose natural key is already
/// stored are skipped, missing keys included. The whole file is read before
/// anything is written; rows ingestion drops never reach the log.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let batch = ingest::read_csv_path(csv_path)
        .with_context(|| format!("failed to read {}", csv_path.display()))?;

    let quality = batch.quality();
    if quality.dropped() > 0 {
        warn!(
            malformed_date = quality.malformed_date,
            malformed_demographics = quality.malformed_demographics,
            "malformed rows left out of the raw log"
        );
    }

    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;

    for record in batch.records() {
        let result = sqlx::query(
            r#"
            INSERT INTO service_gap.raw_service_records
            (student_id, appointment_date, service_type, counselor_id, duration_minutes,
             student_year, student_college, student_status, international_student,
             first_generation, referral_source, wait_days, no_show, follow_up_scheduled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (student_id, appointment_date, service_type) DO NOTHING
            "#,
        )
        .bind(&record.student_id)
        .bind(record.appointment_date)
        .bind(&record.service_type)
        .bind(&record.counselor_id)
        .bind(small("duration_minutes", record.duration_minutes)?)
        .bind(record.student_year.as_str())
        .bind(&record.student_college)
        .bind(record.student_status.as_str())
        .bind(record.international_student)
        .bind(record.first_generation)
        .bind(&record.referral_source)
        .bind(small("wait_days", record.wait_days)?)
        .bind(record.no_show)
        .bind(record.follow_up_scheduled)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Pulls the raw log in ingestion order.
pub async fn fetch_raw_records(pool: &PgPool) -> anyhow::Result<RawBatch> {
    let rows = sqlx::query(
        "SELECT id, student_id, appointment_date, service_type, counselor_id, duration_minutes, \
         student_year, student_college, student_status, international_student, first_generation, \
         referral_source, wait_days, no_show, follow_up_scheduled \
         FROM service_gap.raw_service_records \
         ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.get("id");
        let year: String = row.get("student_year");
        let status: String = row.get("student_status");
        let duration: Option<i32> = row.get("duration_minutes");
        let wait: Option<i32> = row.get("wait_days");

        records.push(ServiceRecord {
            student_id: row.get("student_id"),
            appointment_date: row.get::<Option<NaiveDate>, _>("appointment_date"),
            service_type: row.get("service_type"),
            counselor_id: row.get("counselor_id"),
            duration_minutes: duration.and_then(|value| u32::try_from(value).ok()),
            student_year: StudentYear::parse(&year)
                .with_context(|| format!("raw record {id}: unknown student_year `{year}`"))?,
            student_college: row.get("student_college"),
            student_status: StudentStatus::parse(&status)
                .with_context(|| format!("raw record {id}: unknown student_status `{status}`"))?,
            international_student: row.get("international_student"),
            first_generation: row.get("first_generation"),
            referral_source: row.get("referral_source"),
            wait_days: wait.and_then(|value| u32::try_from(value).ok()),
            no_show: row.get("no_show"),
            follow_up_scheduled: row.get("follow_up_scheduled"),
        });
    }

    info!(records = records.len(), "raw records fetched from postgres");
    Ok(RawBatch::new(records))
}

async fn insert_tables(
    tx: &mut Transaction<'_, Postgres>,
    run_id: Uuid,
    snapshot: &Snapshot,
) -> anyhow::Result<()> {
    let tables = &snapshot.tables;

    for row in &tables.demographic_usage {
        sqlx::query(
            r#"
            INSERT INTO service_gap.demographic_usage
            (run_id, student_year, student_college, international_student, first_generation,
             total_visits, unique_students, avg_duration, avg_wait_days, no_shows)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(run_id)
        .bind(row.student_year.as_str())
        .bind(&row.student_college)
        .bind(row.international_student)
        .bind(row.first_generation)
        .bind(count(row.total_visits)?)
        .bind(count(row.unique_students)?)
        .bind(row.avg_duration)
        .bind(row.avg_wait_days)
        .bind(count(row.no_shows)?)
        .execute(&mut **tx)
        .await?;
    }

    for row in &tables.monthly_trends {
        sqlx::query(
            r#"
            INSERT INTO service_gap.monthly_trends
            (run_id, year, month, service_category, visit_count, avg_wait_days, unique_students)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run_id)
        .bind(row.year)
        .bind(row.month as i32)
        .bind(row.service_category.as_str())
        .bind(count(row.visit_count)?)
        .bind(row.avg_wait_days)
        .bind(count(row.unique_students)?)
        .execute(&mut **tx)
        .await?;
    }

    for row in &tables.service_gaps {
        sqlx::query(
            r#"
            INSERT INTO service_gap.service_gaps
            (run_id, service_category, student_college, demand, avg_wait, extended_wait_count,
             counselor_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run_id)
        .bind(row.service_category.as_str())
        .bind(&row.student_college)
        .bind(count(row.demand)?)
        .bind(row.avg_wait)
        .bind(count(row.extended_wait_count)?)
        .bind(count(row.counselor_count)?)
        .execute(&mut **tx)
        .await?;
    }

    for row in &tables.counselor_workload {
        sqlx::query(
            r#"
            INSERT INTO service_gap.counselor_workload
            (run_id, counselor_id, year, month, appointments, total_minutes, unique_students)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run_id)
        .bind(&row.counselor_id)
        .bind(row.year)
        .bind(row.month as i32)
        .bind(count(row.appointments)?)
        .bind(count(row.total_minutes)?)
        .bind(count(row.unique_students)?)
        .execute(&mut **tx)
        .await?;
    }

    for row in &tables.student_retention {
        sqlx::query(
            r#"
            INSERT INTO service_gap.student_retention
            (run_id, student_id, total_visits, first_visit, last_visit, avg_visit_frequency)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run_id)
        .bind(&row.student_id)
        .bind(count(row.total_visits)?)
        .bind(row.first_visit)
        .bind(row.last_visit)
        .bind(row.avg_visit_frequency)
        .execute(&mut **tx)
        .await?;
    }

    for row in &tables.temporal_demand {
        sqlx::query(
            r#"
            INSERT INTO service_gap.temporal_demand
            (run_id, year, month, day_of_week, service_category, appointment_count,
             avg_wait_days, available_counselors)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run_id)
        .bind(row.year)
        .bind(row.month as i32)
        .bind(row.day_of_week as i32)
        .bind(row.service_category.as_str())
        .bind(count(row.appointment_count)?)
        .bind(row.avg_wait_days)
        .bind(count(row.available_counselors)?)
        .execute(&mut **tx)
        .await?;
    }

    for row in &tables.population_usage {
        sqlx::query(
            r#"
            INSERT INTO service_gap.population_usage
            (run_id, student_year, international_student, first_generation, student_count,
             total_visits, avg_visits_per_student, avg_wait_days)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run_id)
        .bind(row.student_year.as_str())
        .bind(row.international_student)
        .bind(row.first_generation)
        .bind(count(row.student_count)?)
        .bind(count(row.total_visits)?)
        .bind(row.avg_visits_per_student)
        .bind(row.avg_wait_days)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

/// Writes the snapshot's tables under its run id and repoints
/// `current_snapshot`, all in one transaction. Readers of the previous run id
/// are unaffected; a failure rolls everything back.
pub async fn publish_snapshot(pool: &PgPool, snapshot: &Snapshot) -> anyhow::Result<()> {
    let run_id = snapshot.summary.run_id;
    let manifest = serde_json::to_value(&snapshot.summary)?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO service_gap.snapshots (run_id, generated_at, manifest) VALUES ($1, $2, $3)",
    )
    .bind(run_id)
    .bind(snapshot.summary.generated_at)
    .bind(manifest)
    .execute(&mut *tx)
    .await?;

    insert_tables(&mut tx, run_id, snapshot)
        .await
        .with_context(|| format!("failed to write summary tables for run {run_id}"))?;

    sqlx::query(
        r#"
        INSERT INTO service_gap.current_snapshot (singleton, run_id, published_at)
        VALUES (TRUE, $1, now())
        ON CONFLICT (singleton) DO UPDATE
        SET run_id = EXCLUDED.run_id, published_at = EXCLUDED.published_at
        "#,
    )
    .bind(run_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!(%run_id, "snapshot published to postgres");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_that_fit_are_passed_through() {
        assert_eq!(small("wait_days", Some(14)).unwrap(), Some(14));
        assert_eq!(small("wait_days", None).unwrap(), None);
        assert_eq!(count(42).unwrap(), 42);
    }

    #[test]
    fn oversized_values_are_errors_not_clamped() {
        let err = small("duration_minutes", Some(u32::MAX)).unwrap_err();
        assert!(err.to_string().contains("duration_minutes"));
        assert!(small("wait_days", Some(i32::MAX as u32 + 1)).is_err());
        assert!(count(u64::MAX).is_err());
    }
}
