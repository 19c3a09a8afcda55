//! Reconciliation (QA): monthly sums against the reported annual totals.
//!
//! Findings are documented, never corrected, and never block later stages.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tabled::settings::object::Columns;
use tabled::settings::{Alignment, Modify, Style};
use tabled::{Table, Tabled};
use tracing::warn;

use crate::facts::{FactRecord, Flow};

/// Thresholds for flagging and tiering discrepancies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// `|delta|` at or below this is clean.
    pub tolerance_usd: f64,
    /// `|delta|` above this is a major discrepancy.
    pub major_threshold_usd: f64,
    /// Rows shown in the console table.
    pub report_limit: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tolerance_usd: 1_000.0,
            major_threshold_usd: 10_000_000.0,
            report_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Minor,
    Major,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Minor => f.write_str("minor"),
            Severity::Major => f.write_str("major"),
        }
    }
}

/// What to do with groups carrying a major discrepancy when deriving KPIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MajorDiscrepancyPolicy {
    #[default]
    Retain,
    Exclude,
}

/// Grouping key: (year, flow, category).
pub type GroupKey = (i32, Flow, Option<String>);

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationFinding {
    pub year: i32,
    pub flow: Flow,
    pub category: Option<String>,
    pub reported_total: f64,
    pub sum_of_months: f64,
    pub delta: f64,
    pub severity: Severity,
}

impl ReconciliationFinding {
    pub fn key(&self) -> GroupKey {
        (self.year, self.flow, self.category.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationReport {
    /// Flagged groups, worst first.
    pub findings: Vec<ReconciliationFinding>,
    pub groups_checked: usize,
    /// Groups with month facts but no reported total.
    pub missing_totals: usize,
    pub report_limit: usize,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    /// Groups whose discrepancy is major.
    pub fn major_groups(&self) -> BTreeSet<GroupKey> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Major)
            .map(|f| f.key())
            .collect()
    }
}

#[derive(Default)]
struct GroupSums {
    sum_of_months: f64,
    month_count: usize,
    reported_total: Option<f64>,
    side_sum: Option<f64>,
}

/// Compare each group's monthly sum against its reported annual total.
pub fn reconcile(facts: &[FactRecord], config: &ReconcileConfig) -> ReconciliationReport {
    let mut groups: BTreeMap<GroupKey, GroupSums> = BTreeMap::new();

    for fact in facts {
        let sums = groups
            .entry((fact.year, fact.flow, fact.category.clone()))
            .or_default();
        if fact.is_total() {
            sums.reported_total = Some(sums.reported_total.unwrap_or(0.0) + fact.usd);
            if let Some(side) = fact.months_sum {
                sums.side_sum = Some(sums.side_sum.unwrap_or(0.0) + side);
            }
        } else {
            sums.sum_of_months += fact.usd;
            sums.month_count += 1;
        }
    }

    let mut report = ReconciliationReport {
        groups_checked: groups.len(),
        report_limit: config.report_limit,
        ..Default::default()
    };

    for ((year, flow, category), sums) in groups {
        if let Some(side) = sums.side_sum {
            if (side - sums.sum_of_months).abs() > 1e-6 {
                warn!(
                    year,
                    %flow,
                    category = category.as_deref().unwrap_or("-"),
                    grouped = sums.sum_of_months,
                    row_sum = side,
                    "grouped month sum differs from row sum; duplicated month facts?"
                );
            }
        }

        let Some(reported_total) = sums.reported_total else {
            if sums.month_count > 0 {
                report.missing_totals += 1;
            }
            continue;
        };

        let delta = reported_total - sums.sum_of_months;
        if delta.abs() <= config.tolerance_usd {
            continue;
        }
        let severity = if delta.abs() > config.major_threshold_usd {
            Severity::Major
        } else {
            Severity::Minor
        };

        report.findings.push(ReconciliationFinding {
            year,
            flow,
            category,
            reported_total,
            sum_of_months: sums.sum_of_months,
            delta,
            severity,
        });
    }

    // Stable sort keeps group order among equal deltas.
    report
        .findings
        .sort_by(|a, b| b.delta.abs().total_cmp(&a.delta.abs()));

    for finding in report.findings.iter().filter(|f| f.severity == Severity::Major) {
        warn!(
            year = finding.year,
            flow = %finding.flow,
            category = finding.category.as_deref().unwrap_or("-"),
            delta = finding.delta,
            "major reconciliation discrepancy"
        );
    }

    report
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

/// Thousands-separated, rounded to whole dollars.
pub fn format_usd(value: f64) -> String {
    let rounded = value.round();
    let digits = format!("{:.0}", rounded.abs());
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if rounded < 0.0 {
        format!("-{out}")
    } else {
        out
    }
}

/// One line of the console discrepancy table.
#[derive(Tabled)]
struct FindingRow {
    #[tabled(rename = "Year")]
    year: i32,
    #[tabled(rename = "Flow")]
    flow: String,
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "Reported total")]
    reported_total: String,
    #[tabled(rename = "Sum of months")]
    sum_of_months: String,
    #[tabled(rename = "Δ")]
    delta: String,
    #[tabled(rename = "Severity")]
    severity: String,
}

impl From<&ReconciliationFinding> for FindingRow {
    fn from(finding: &ReconciliationFinding) -> Self {
        Self {
            year: finding.year,
            flow: finding.flow.to_string(),
            category: finding
                .category
                .as_deref()
                .map(|c| truncate(c, 30))
                .unwrap_or_else(|| "-".to_string()),
            reported_total: format_usd(finding.reported_total),
            sum_of_months: format_usd(finding.sum_of_months),
            delta: format_usd(finding.delta),
            severity: finding.severity.to_string(),
        }
    }
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            writeln!(
                f,
                "QA: annual totals match month sums ({} groups checked)",
                self.groups_checked
            )?;
        } else {
            writeln!(
                f,
                "QA: {} discrepancies above tolerance ({} minor, {} major) in {} groups",
                self.findings.len(),
                self.count(Severity::Minor),
                self.count(Severity::Major),
                self.groups_checked
            )?;

            let limit = self.report_limit.max(1);
            let rows: Vec<FindingRow> = self.findings.iter().take(limit).map(FindingRow::from).collect();
            let table = Table::new(rows)
                .with(Style::rounded())
                .with(Modify::new(Columns::new(3..6)).with(Alignment::right()))
                .to_string();
            writeln!(f, "{table}")?;

            if self.findings.len() > limit {
                writeln!(f, "... {} more not shown", self.findings.len() - limit)?;
            }
        }
        if self.missing_totals > 0 {
            writeln!(f, "QA: {} groups have no reported total", self.missing_totals)?;
        }
        Ok(())
    }
}
