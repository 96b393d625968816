use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::models::ServiceCategory;

/// Tunable thresholds and the service taxonomy used by a run.
///
/// Every field has a default so a config file only needs to name what it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// A visit waiting longer than this many days is flagged high risk.
    pub critical_wait_days: u32,
    /// Visits waiting longer than this count toward `extended_wait_count`.
    pub extended_wait_days: u32,
    pub no_show_window: usize,
    pub no_show_threshold: usize,
    pub min_appointment_date: NaiveDate,
    pub max_appointment_date: NaiveDate,
    pub severity: SeverityConfig,
    pub gap: GapConfig,
    /// Lower-cased `service_type` to category. Unlisted types map to Other.
    pub categories: BTreeMap<String, ServiceCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    pub critical_above: f64,
    pub high_from: f64,
}

/// Gap analysis thresholds, independent of the severity bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    pub high_wait_above: f64,
    pub moderate_wait_above: f64,
    pub high_utilization_below: f64,
    pub moderate_utilization_below: f64,
    /// Weekday slots above this quantile of demand per counselor are peaks.
    pub peak_demand_quantile: f64,
    pub underserved_equity_below: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            critical_wait_days: 14,
            extended_wait_days: 14,
            no_show_window: 3,
            no_show_threshold: 2,
            min_appointment_date: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN),
            max_appointment_date: NaiveDate::from_ymd_opt(2100, 12, 31).unwrap_or(NaiveDate::MAX),
            severity: SeverityConfig::default(),
            gap: GapConfig::default(),
            categories: default_categories(),
        }
    }
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            critical_above: 14.0,
            high_from: 7.0,
        }
    }
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            high_wait_above: 7.0,
            moderate_wait_above: 3.0,
            high_utilization_below: 2.0,
            moderate_utilization_below: 3.0,
            peak_demand_quantile: 0.75,
            underserved_equity_below: 0.7,
        }
    }
}

fn default_categories() -> BTreeMap<String, ServiceCategory> {
    [
        ("individual counseling", ServiceCategory::Counseling),
        ("therapy session", ServiceCategory::Counseling),
        ("counseling", ServiceCategory::Counseling),
        ("crisis support", ServiceCategory::Crisis),
        ("emergency", ServiceCategory::Crisis),
        ("crisis", ServiceCategory::Crisis),
        ("group therapy", ServiceCategory::Group),
        ("group", ServiceCategory::Group),
        ("assessment", ServiceCategory::Assessment),
        ("workshop", ServiceCategory::Workshop),
    ]
    .into_iter()
    .map(|(service_type, category)| (service_type.to_string(), category))
    .collect()
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config_error = |detail: String| PipelineError::Config {
            path: path.to_path_buf(),
            detail,
        };
        let content = std::fs::read_to_string(path).map_err(|err| config_error(err.to_string()))?;
        let mut config: PipelineConfig =
            toml::from_str(&content).map_err(|err| config_error(err.to_string()))?;

        config.categories = config
            .categories
            .into_iter()
            .map(|(service_type, category)| (service_type.trim().to_lowercase(), category))
            .collect();
        config.validate().map_err(config_error)?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.min_appointment_date > self.max_appointment_date {
            return Err(format!(
                "min_appointment_date {} is after max_appointment_date {}",
                self.min_appointment_date, self.max_appointment_date
            ));
        }
        if self.no_show_window == 0 {
            return Err("no_show_window must be at least 1".to_string());
        }
        if self.no_show_threshold == 0 || self.no_show_threshold > self.no_show_window {
            return Err(format!(
                "no_show_threshold must be between 1 and no_show_window ({})",
                self.no_show_window
            ));
        }
        if self.severity.high_from > self.severity.critical_above {
            return Err("severity.high_from must not exceed severity.critical_above".to_string());
        }
        if !(0.0..=1.0).contains(&self.gap.peak_demand_quantile) {
            return Err("gap.peak_demand_quantile must be between 0 and 1".to_string());
        }
        Ok(())
    }

    /// Case-insensitive taxonomy lookup.
    pub fn categorize(&self, service_type: &str) -> ServiceCategory {
        self.categories
            .get(&service_type.trim().to_lowercase())
            .copied()
            .unwrap_or(ServiceCategory::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn categorize_ignores_case_and_whitespace() {
        let config = PipelineConfig::default();
        assert_eq!(config.categorize("Crisis Support"), ServiceCategory::Crisis);
        assert_eq!(config.categorize("  THERAPY session "), ServiceCategory::Counseling);
        assert_eq!(config.categorize("Workshop"), ServiceCategory::Workshop);
        assert_eq!(config.categorize("Follow-up"), ServiceCategory::Other);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "critical_wait_days = 10\n\n[categories]\n\"Follow-Up\" = \"Counseling\""
        )
        .unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.critical_wait_days, 10);
        assert_eq!(config.extended_wait_days, 14);
        assert_eq!(config.no_show_window, 3);
        assert_eq!(config.categorize("follow-up"), ServiceCategory::Counseling);
        // A categories table in the file replaces the default mapping.
        assert_eq!(config.categorize("Crisis Support"), ServiceCategory::Other);
    }

    #[test]
    fn rejects_inverted_date_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "min_appointment_date = \"2024-01-01\"\nmax_appointment_date = \"2023-01-01\""
        )
        .unwrap();

        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Config { .. }));
    }

    #[test]
    fn gap_thresholds_load_from_their_own_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gap]\nhigh_wait_above = 10.0\nunderserved_equity_below = 0.5").unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.gap.high_wait_above, 10.0);
        assert_eq!(config.gap.moderate_wait_above, 3.0);
        assert_eq!(config.gap.peak_demand_quantile, 0.75);
        assert_eq!(config.gap.underserved_equity_below, 0.5);
        assert_eq!(config.severity, SeverityConfig::default());
    }

    #[test]
    fn rejects_quantile_outside_unit_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gap]\npeak_demand_quantile = 1.5").unwrap();
        assert!(PipelineConfig::load(file.path()).is_err());
    }

    #[test]
    fn rejects_threshold_larger_than_window() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no_show_window = 2\nno_show_threshold = 3").unwrap();
        assert!(PipelineConfig::load(file.path()).is_err());
    }
}
