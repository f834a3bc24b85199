use crate::errors::{AppError, AppResult};
use crate::models::{Branch, MetricDefinition, StaffGroup};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "METRICS_ETL_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "metrics-etl.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub signals: SignalSettings,
    pub occupancy: OccupancySettings,
    pub imports: ImportSettings,
    pub scheduler: SchedulerSettings,
    pub reference: ReferenceConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/metrics.db"),
            log_dir: None,
            signals: SignalSettings::default(),
            occupancy: OccupancySettings::default(),
            imports: ImportSettings::default(),
            scheduler: SchedulerSettings::default(),
            reference: ReferenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Thresholds {
    pub warning_pct: f64,
    pub critical_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning_pct: 10.0,
            critical_pct: 25.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignalSettings {
    #[serde(flatten)]
    pub defaults: Thresholds,
    /// Per-metric overrides keyed by metric code.
    pub overrides: BTreeMap<String, Thresholds>,
    /// Daily cash reconciliation. Off unless configured.
    pub cash_control: Option<CashControlSettings>,
}

/// Metric codes for the cash reconciliation: each day's closing balance should
/// equal the previous closing balance plus cash revenue and deposits, minus withdrawals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CashControlSettings {
    pub balance_metric: String,
    pub cash_revenue_metric: String,
    pub deposits_metric: String,
    pub withdrawals_metric: String,
    /// Smallest absolute difference that counts as a discrepancy.
    pub tolerance: f64,
}

impl Default for CashControlSettings {
    fn default() -> Self {
        Self {
            balance_metric: "cash_balance_end_day".to_string(),
            cash_revenue_metric: "revenue_cash".to_string(),
            deposits_metric: "deposit_total".to_string(),
            withdrawals_metric: "withdrawals_total".to_string(),
            tolerance: 1000.0,
        }
    }
}

impl CashControlSettings {
    pub fn metric_codes(&self) -> [&str; 4] {
        [
            self.balance_metric.as_str(),
            self.cash_revenue_metric.as_str(),
            self.deposits_metric.as_str(),
            self.withdrawals_metric.as_str(),
        ]
    }
}

impl SignalSettings {
    pub fn thresholds_for(&self, metric_code: &str) -> Thresholds {
        self.overrides.get(metric_code).copied().unwrap_or(self.defaults)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OccupancySettings {
    pub open_hour: u32,
    pub close_hour: u32,
}

impl Default for OccupancySettings {
    fn default() -> Self {
        Self {
            open_hour: 10,
            close_hour: 22,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportSettings {
    pub max_bad_rows: u32,
    pub fetch_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            max_bad_rows: 25,
            fetch_timeout_ms: 30_000,
            max_retries: 3,
            retry_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerSettings {
    pub global_limit: usize,
    pub max_queue_size: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            global_limit: 2,
            max_queue_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReferenceConfig {
    pub branches: Vec<Branch>,
    pub metrics: Vec<MetricDefinition>,
    pub staff_groups: Vec<StaffGroup>,
    pub ignore_branch_codes: Vec<String>,
    pub ignore_labels: Vec<String>,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            branches: Vec::new(),
            metrics: Vec::new(),
            staff_groups: Vec::new(),
            ignore_branch_codes: vec!["SUM".to_string(), "СУМ".to_string()],
            ignore_labels: Vec::new(),
        }
    }
}

impl EngineSettings {
    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let settings: Self = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Config(format!("cannot read {}: {}", path.display(), error)))?;
        let mut settings = Self::from_yaml(&raw)?;
        // Relative paths in the file are relative to the file itself.
        if let Some(base) = path.parent() {
            if settings.db_path.is_relative() {
                settings.db_path = base.join(&settings.db_path);
            }
            if let Some(log_dir) = settings.log_dir.as_mut() {
                if log_dir.is_relative() {
                    *log_dir = base.join(&*log_dir);
                }
            }
        }
        Ok(settings)
    }

    /// Resolves the config path: explicit argument, then `METRICS_ETL_CONFIG`, then the default file.
    pub fn resolve_path(cli_arg: Option<&Path>) -> PathBuf {
        if let Some(path) = cli_arg {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    pub fn validate(&self) -> AppResult<()> {
        let window = self.occupancy;
        if window.open_hour >= window.close_hour || window.close_hour > 24 {
            return Err(AppError::Config(format!(
                "occupancy window [{}, {}) must satisfy open < close <= 24",
                window.open_hour, window.close_hour
            )));
        }

        let mut all_thresholds = vec![("default".to_string(), self.signals.defaults)];
        all_thresholds.extend(self.signals.overrides.iter().map(|(code, t)| (code.clone(), *t)));
        for (scope, thresholds) in all_thresholds {
            if thresholds.warning_pct < 0.0 || thresholds.warning_pct > thresholds.critical_pct {
                return Err(AppError::Config(format!(
                    "thresholds for {} must satisfy 0 <= warning <= critical",
                    scope
                )));
            }
        }

        if let Some(cash) = &self.signals.cash_control {
            if !cash.tolerance.is_finite() || cash.tolerance < 0.0 {
                return Err(AppError::Config("cash control tolerance must be a non-negative number".to_string()));
            }
            for code in cash.metric_codes() {
                match self.reference.metric(code) {
                    Some(metric) if !metric.is_derived => {}
                    Some(_) => {
                        return Err(AppError::Config(format!("cash control metric {} must not be derived", code)));
                    }
                    None => {
                        return Err(AppError::Config(format!("cash control references unknown metric {}", code)));
                    }
                }
            }
        }

        self.reference.validate()
    }
}

impl ReferenceConfig {
    pub fn metric(&self, code: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|metric| metric.code == code)
    }

    pub fn validate(&self) -> AppResult<()> {
        let codes: HashSet<&str> = self.metrics.iter().map(|metric| metric.code.as_str()).collect();
        if codes.len() != self.metrics.len() {
            return Err(AppError::Config("metric codes must be unique".to_string()));
        }

        for metric in &self.metrics {
            match (&metric.formula, metric.is_derived) {
                (Some(formula), true) => {
                    if formula.inputs.is_empty() {
                        return Err(AppError::Config(format!("derived metric {} has no inputs", metric.code)));
                    }
                    if let Some(arity) = formula.kind.arity() {
                        if formula.inputs.len() != arity {
                            return Err(AppError::Config(format!(
                                "derived metric {} needs exactly {} inputs for {}",
                                metric.code,
                                arity,
                                formula.kind.as_str()
                            )));
                        }
                    }
                    if let Some(unknown) = formula.inputs.iter().find(|input| !codes.contains(input.as_str())) {
                        return Err(AppError::Config(format!(
                            "derived metric {} references unknown metric {}",
                            metric.code, unknown
                        )));
                    }
                }
                (None, true) => {
                    return Err(AppError::Config(format!("derived metric {} has no formula", metric.code)));
                }
                (Some(_), false) => {
                    return Err(AppError::Config(format!(
                        "metric {} declares a formula but is not derived",
                        metric.code
                    )));
                }
                (None, false) => {}
            }
        }

        let branches: HashSet<&str> = self.branches.iter().map(|branch| branch.code.as_str()).collect();
        for group in &self.staff_groups {
            if !branches.contains(group.branch_code.as_str()) {
                return Err(AppError::Config(format!(
                    "staff group {} references unknown branch {}",
                    group.group_id, group.branch_code
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::EngineSettings;
    use crate::models::AggregationMethod;

    const SAMPLE: &str = r#"
dbPath: data/test.db
signals:
  warningPct: 5
  criticalPct: 20
  overrides:
    coffee_checks:
      warningPct: 15
      criticalPct: 30
occupancy:
  openHour: 9
  closeHour: 21
reference:
  branches:
    - code: B1
      name: Branch One
  metrics:
    - code: coffee_revenue_total
      label: Coffee revenue
      sourceLabels: ["Кофейня"]
    - code: coffee_checks
      label: Checks
    - code: avg_check
      label: Average check
      isDerived: true
      aggregation: average
      formula:
        kind: ratio
        inputs: [coffee_revenue_total, coffee_checks]
  staffGroups:
    - branchCode: B1
      groupId: hair
      name: Hairdressers
      members:
        - staffId: S1
        - staffId: S2
          until: 2025-03-31
"#;

    #[test]
    fn parses_yaml_with_defaults_and_overrides() {
        let settings = EngineSettings::from_yaml(SAMPLE).expect("settings");
        assert_eq!(settings.occupancy.open_hour, 9);
        assert_eq!(settings.imports.max_retries, 3);
        assert_eq!(settings.signals.thresholds_for("coffee_checks").warning_pct, 15.0);
        assert_eq!(settings.signals.thresholds_for("avg_check").critical_pct, 20.0);
        let avg_check = settings.reference.metric("avg_check").expect("metric");
        assert_eq!(avg_check.aggregation, AggregationMethod::Average);
        assert_eq!(settings.reference.staff_groups[0].members.len(), 2);
        assert!(settings.reference.ignore_branch_codes.contains(&"SUM".to_string()));
    }

    #[test]
    fn rejects_inverted_window_and_unknown_formula_inputs() {
        let inverted = SAMPLE.replace("openHour: 9", "openHour: 22");
        assert!(EngineSettings::from_yaml(&inverted).is_err());

        let dangling = SAMPLE.replace("inputs: [coffee_revenue_total, coffee_checks]", "inputs: [nope]");
        let error = EngineSettings::from_yaml(&dangling).expect_err("unknown input");
        assert!(error.to_string().contains("unknown metric nope"));
    }

    #[test]
    fn cash_control_needs_stored_metrics() {
        assert!(EngineSettings::from_yaml(SAMPLE).expect("settings").signals.cash_control.is_none());

        let configured = SAMPLE.replace(
            "  criticalPct: 20\n",
            "  criticalPct: 20\n  cashControl:\n    balanceMetric: coffee_revenue_total\n    cashRevenueMetric: coffee_checks\n    depositsMetric: coffee_checks\n    withdrawalsMetric: coffee_checks\n    tolerance: 500\n",
        );
        let settings = EngineSettings::from_yaml(&configured).expect("settings");
        let cash = settings.signals.cash_control.expect("cash control");
        assert_eq!(cash.tolerance, 500.0);
        assert_eq!(cash.balance_metric, "coffee_revenue_total");

        let derived = configured.replace("balanceMetric: coffee_revenue_total", "balanceMetric: avg_check");
        let error = EngineSettings::from_yaml(&derived).expect_err("derived balance");
        assert!(error.to_string().contains("must not be derived"));

        let unknown = configured.replace("depositsMetric: coffee_checks", "depositsMetric: deposit_total");
        assert!(EngineSettings::from_yaml(&unknown).is_err());
    }
}
