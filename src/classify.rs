//! Read-only classifications computed on demand from a summary snapshot.
//!
//! Views borrow the summary rows they classify; nothing here can mutate a
//! published table.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::{GapConfig, PipelineConfig, SeverityConfig};
use crate::models::{
    DemographicUsage, MonthlyTrend, PopulationUsage, ServiceCategory, ServiceGap,
    StudentRetention, SummaryTables, TemporalDemand,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum WaitSeverity {
    Critical,
    High,
    Normal,
}

impl WaitSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::High => "High",
            Self::Normal => "Normal",
        }
    }
}

/// Groups without any recorded wait classify as Normal.
pub fn wait_severity(avg_wait: Option<f64>, thresholds: &SeverityConfig) -> WaitSeverity {
    match avg_wait {
        Some(wait) if wait > thresholds.critical_above => WaitSeverity::Critical,
        Some(wait) if wait >= thresholds.high_from => WaitSeverity::High,
        _ => WaitSeverity::Normal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EngagementTier {
    OneTime,
    Occasional,
    Regular,
    Frequent,
}

impl EngagementTier {
    pub const ALL: [EngagementTier; 4] = [
        Self::OneTime,
        Self::Occasional,
        Self::Regular,
        Self::Frequent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneTime => "One-time",
            Self::Occasional => "Occasional",
            Self::Regular => "Regular",
            Self::Frequent => "Frequent",
        }
    }
}

/// `None` for a student row with no visits.
pub fn engagement_tier(total_visits: u64) -> Option<EngagementTier> {
    match total_visits {
        0 => None,
        1 => Some(EngagementTier::OneTime),
        2..=4 => Some(EngagementTier::Occasional),
        5..=10 => Some(EngagementTier::Regular),
        _ => Some(EngagementTier::Frequent),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Adequacy {
    Excellent,
    Good,
    NeedsImprovement,
    Critical,
}

impl Adequacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "Excellent",
            Self::Good => "Good",
            Self::NeedsImprovement => "Needs Improvement",
            Self::Critical => "Critical",
        }
    }
}

pub fn adequacy(pct_extended_wait: f64) -> Adequacy {
    if pct_extended_wait <= 10.0 {
        Adequacy::Excellent
    } else if pct_extended_wait <= 25.0 {
        Adequacy::Good
    } else if pct_extended_wait <= 50.0 {
        Adequacy::NeedsImprovement
    } else {
        Adequacy::Critical
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum GapLevel {
    High,
    Moderate,
    Adequate,
}

impl GapLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "High Gap",
            Self::Moderate => "Moderate Gap",
            Self::Adequate => "Adequate",
        }
    }
}

impl fmt::Display for GapLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `extended / demand * 100` rounded to two places; 0 when there is no demand.
pub fn pct_extended_wait(extended_wait_count: u64, demand: u64) -> f64 {
    if demand == 0 {
        return 0.0;
    }
    let pct = extended_wait_count as f64 / demand as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

pub fn utilization_rate(total_visits: u64, unique_students: u64) -> f64 {
    if unique_students == 0 {
        return 0.0;
    }
    total_visits as f64 / unique_students as f64
}

/// `None` when nobody was available to take the demand.
pub fn demand_per_counselor(demand: u64, counselors: u64) -> Option<f64> {
    (counselors > 0).then(|| demand as f64 / counselors as f64)
}

/// Quantile with linear interpolation between the closest ranks.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let last = sorted.len().checked_sub(1)?;
    let position = q.clamp(0.0, 1.0) * last as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64))
}

pub fn day_name(day_of_week: u32) -> &'static str {
    match day_of_week {
        1 => "Sunday",
        2 => "Monday",
        3 => "Tuesday",
        4 => "Wednesday",
        5 => "Thursday",
        6 => "Friday",
        7 => "Saturday",
        _ => "Unknown",
    }
}

pub fn gap_level(usage: &DemographicUsage, thresholds: &GapConfig) -> GapLevel {
    if usage.total_visits == 0 {
        return GapLevel::Adequate;
    }
    let wait = usage.avg_wait_days.unwrap_or(0.0);
    let utilization = utilization_rate(usage.total_visits, usage.unique_students);
    if wait > thresholds.high_wait_above || utilization < thresholds.high_utilization_below {
        GapLevel::High
    } else if wait > thresholds.moderate_wait_above
        || utilization < thresholds.moderate_utilization_below
    {
        GapLevel::Moderate
    } else {
        GapLevel::Adequate
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemographicView<'a> {
    pub usage: &'a DemographicUsage,
    pub wait_severity: WaitSeverity,
    pub utilization_rate: f64,
    pub service_gap: GapLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceGapView<'a> {
    pub gap: &'a ServiceGap,
    pub wait_severity: WaitSeverity,
    pub pct_extended_wait: f64,
    pub adequacy: Adequacy,
    pub demand_per_counselor: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemporalView<'a> {
    pub demand: &'a TemporalDemand,
    pub day_name: &'static str,
    pub demand_per_counselor: Option<f64>,
    pub peak_demand: bool,
}

/// Ratios are against the mean over populations. A ratio whose denominator
/// is zero or missing is `None`, and then so is the equity score.
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationView<'a> {
    pub population: &'a PopulationUsage,
    pub visit_ratio: Option<f64>,
    pub wait_ratio: Option<f64>,
    pub equity_score: Option<f64>,
    pub underserved: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedTrend<'a> {
    pub trend: &'a MonthlyTrend,
    pub demand_rank: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionView<'a> {
    pub retention: &'a StudentRetention,
    pub tier: Option<EngagementTier>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSummary {
    pub tier: EngagementTier,
    pub students: u64,
    pub mean_visits: f64,
}

pub fn classify_demographics<'a>(
    rows: &'a [DemographicUsage],
    config: &PipelineConfig,
) -> Vec<DemographicView<'a>> {
    rows.iter()
        .map(|usage| DemographicView {
            usage,
            wait_severity: wait_severity(usage.avg_wait_days, &config.severity),
            utilization_rate: utilization_rate(usage.total_visits, usage.unique_students),
            service_gap: gap_level(usage, &config.gap),
        })
        .collect()
}

pub fn classify_service_gaps<'a>(
    rows: &'a [ServiceGap],
    config: &PipelineConfig,
) -> Vec<ServiceGapView<'a>> {
    rows.iter()
        .map(|gap| {
            let pct = pct_extended_wait(gap.extended_wait_count, gap.demand);
            ServiceGapView {
                gap,
                wait_severity: wait_severity(gap.avg_wait, &config.severity),
                pct_extended_wait: pct,
                adequacy: adequacy(pct),
                demand_per_counselor: demand_per_counselor(gap.demand, gap.counselor_count),
            }
        })
        .collect()
}

/// Competition ranking of months by visit count within each category.
///
/// Tied counts share a rank and the next distinct count takes its 1-based
/// position, so ranks `1, 1, 3` are possible. Output is ordered by category,
/// then rank, then (year, month).
pub fn rank_demand(rows: &[MonthlyTrend]) -> Vec<RankedTrend<'_>> {
    let mut by_category: BTreeMap<ServiceCategory, Vec<&MonthlyTrend>> = BTreeMap::new();
    for row in rows {
        by_category.entry(row.service_category).or_default().push(row);
    }

    let mut ranked = Vec::with_capacity(rows.len());
    for (_, mut members) in by_category {
        members.sort_by(|a, b| {
            b.visit_count
                .cmp(&a.visit_count)
                .then((a.year, a.month).cmp(&(b.year, b.month)))
        });

        let mut rank = 0u32;
        let mut previous = None;
        for (position, trend) in members.into_iter().enumerate() {
            if previous != Some(trend.visit_count) {
                rank = position as u32 + 1;
                previous = Some(trend.visit_count);
            }
            ranked.push(RankedTrend {
                trend,
                demand_rank: rank,
            });
        }
    }
    ranked
}

/// Flags weekday slots whose demand per counselor is above the configured
/// quantile of all slots.
pub fn classify_temporal<'a>(
    rows: &'a [TemporalDemand],
    config: &PipelineConfig,
) -> Vec<TemporalView<'a>> {
    let ratios: Vec<Option<f64>> = rows
        .iter()
        .map(|row| demand_per_counselor(row.appointment_count, row.available_counselors))
        .collect();
    let defined: Vec<f64> = ratios.iter().flatten().copied().collect();
    let threshold = quantile(&defined, config.gap.peak_demand_quantile);

    rows.iter()
        .zip(ratios)
        .map(|(demand, ratio)| TemporalView {
            demand,
            day_name: day_name(demand.day_of_week),
            demand_per_counselor: ratio,
            peak_demand: matches!((ratio, threshold), (Some(ratio), Some(threshold)) if ratio > threshold),
        })
        .collect()
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0u64), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(numerator), Some(denominator)) if denominator > 0.0 => Some(numerator / denominator),
        _ => None,
    }
}

/// Equity score per population: the mean of how often its students visit
/// relative to everyone and how short their waits are relative to everyone.
pub fn classify_populations<'a>(
    rows: &'a [PopulationUsage],
    config: &PipelineConfig,
) -> Vec<PopulationView<'a>> {
    let overall_visits = mean(rows.iter().filter_map(|row| row.avg_visits_per_student));
    let overall_wait = mean(rows.iter().filter_map(|row| row.avg_wait_days));

    rows.iter()
        .map(|population| {
            let visit_ratio = ratio(population.avg_visits_per_student, overall_visits);
            let wait_ratio = ratio(overall_wait, population.avg_wait_days);
            let equity_score = visit_ratio
                .zip(wait_ratio)
                .map(|(visits, wait)| (visits + wait) / 2.0);
            PopulationView {
                population,
                visit_ratio,
                wait_ratio,
                equity_score,
                underserved: equity_score
                    .is_some_and(|score| score < config.gap.underserved_equity_below),
            }
        })
        .collect()
}

pub fn classify_retention(rows: &[StudentRetention]) -> Vec<RetentionView<'_>> {
    rows.iter()
        .map(|retention| RetentionView {
            retention,
            tier: engagement_tier(retention.total_visits),
        })
        .collect()
}

/// Student count and mean visits per tier, in tier order; empty tiers included.
pub fn summarize_tiers(rows: &[StudentRetention]) -> Vec<TierSummary> {
    let mut totals: BTreeMap<EngagementTier, (u64, u64)> = EngagementTier::ALL
        .into_iter()
        .map(|tier| (tier, (0, 0)))
        .collect();

    for row in rows {
        if let Some(tier) = engagement_tier(row.total_visits) {
            if let Some(entry) = totals.get_mut(&tier) {
                entry.0 += 1;
                entry.1 += row.total_visits;
            }
        }
    }

    totals
        .into_iter()
        .map(|(tier, (students, visits))| TierSummary {
            tier,
            students,
            mean_visits: if students == 0 {
                0.0
            } else {
                visits as f64 / students as f64
            },
        })
        .collect()
}

/// Every derived view over one snapshot.
#[derive(Debug, Clone)]
pub struct ClassifiedViews<'a> {
    pub demographics: Vec<DemographicView<'a>>,
    pub service_gaps: Vec<ServiceGapView<'a>>,
    pub demand_ranks: Vec<RankedTrend<'a>>,
    pub retention: Vec<RetentionView<'a>>,
    pub tiers: Vec<TierSummary>,
    pub temporal: Vec<TemporalView<'a>>,
    pub populations: Vec<PopulationView<'a>>,
}

pub fn classify<'a>(tables: &'a SummaryTables, config: &PipelineConfig) -> ClassifiedViews<'a> {
    ClassifiedViews {
        demographics: classify_demographics(&tables.demographic_usage, config),
        service_gaps: classify_service_gaps(&tables.service_gaps, config),
        demand_ranks: rank_demand(&tables.monthly_trends),
        retention: classify_retention(&tables.student_retention),
        tiers: summarize_tiers(&tables.student_retention),
        temporal: classify_temporal(&tables.temporal_demand, config),
        populations: classify_populations(&tables.population_usage, config),
    }
}
