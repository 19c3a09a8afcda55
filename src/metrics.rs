//! Metrics deriver: long-form facts → wide KPI table.
//!
//! The pivot runs as a Polars lazy query. The per-series math (lags, rolling
//! means, base indices) walks each series in chronological order, one series
//! per category or a single national series.

use std::collections::HashMap;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calendar::{period_index, MonthLabel};
use crate::error::{ObservatoryError, Result};
use crate::facts::{month_order_frame, require_columns, Granularity};
use crate::reconcile::MajorDiscrepancyPolicy;
use crate::schema::{fact, kpi};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Base period for the 100-index. Unset means each series' first period.
    pub base_year: Option<i32>,
    pub base_month: Option<MonthLabel>,
    pub major_policy: MajorDiscrepancyPolicy,
}

impl MetricsConfig {
    pub fn base_period(&self) -> Option<(i32, MonthLabel)> {
        match (self.base_year, self.base_month) {
            (Some(year), Some(month)) => Some((year, month)),
            _ => None,
        }
    }
}

/// One wide KPI row.
#[derive(Debug, Clone, PartialEq)]
pub struct KpiRecord {
    pub year: i32,
    pub month: MonthLabel,
    pub category: Option<String>,
    pub export: Option<f64>,
    pub import: Option<f64>,
    pub balance: Option<f64>,
    pub export_mom_pct: Option<f64>,
    pub export_yoy_pct: Option<f64>,
    pub import_mom_pct: Option<f64>,
    pub import_yoy_pct: Option<f64>,
    /// Trailing mean over up to three periods, rounded to whole dollars.
    pub export_ma3: Option<f64>,
    pub import_ma3: Option<f64>,
    pub balance_ma3: Option<f64>,
    pub export_idx: Option<f64>,
    pub import_idx: Option<f64>,
    /// Category tables only.
    pub coverage_ratio: Option<f64>,
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Percentage change from `prev` to `cur`, 2 decimals.
pub fn pct_change(cur: Option<f64>, prev: Option<f64>) -> Option<f64> {
    let (cur, prev) = (cur?, prev?);
    if prev == 0.0 {
        return None;
    }
    Some(round_to((cur / prev - 1.0) * 100.0, 2))
}

/// export / import, 4 decimals. Null instead of infinity.
pub fn coverage_ratio(export: Option<f64>, import: Option<f64>) -> Option<f64> {
    let (export, import) = (export?, import?);
    if import == 0.0 {
        return None;
    }
    Some(round_to(export / import, 4))
}

fn mean_of_present(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

fn key_columns(granularity: Granularity) -> Vec<&'static str> {
    match granularity {
        Granularity::National => vec![fact::YEAR, fact::MONTH],
        Granularity::Category => vec![fact::YEAR, fact::MONTH, fact::CATEGORY],
    }
}

fn chronological_order(granularity: Granularity) -> Vec<&'static str> {
    match granularity {
        Granularity::National => vec![fact::YEAR, kpi::MONTH_NUM],
        Granularity::Category => vec![fact::CATEGORY, fact::YEAR, kpi::MONTH_NUM],
    }
}

/// Pivot month facts to one row per (year, month[, category]) with `export`,
/// `import`, `balance` and `month_num` columns. A flow with no fact is null.
pub fn wide_frame(facts: &DataFrame, granularity: Granularity) -> Result<DataFrame> {
    let mut required = vec![fact::YEAR, fact::MONTH, fact::FLOW, fact::USD];
    if granularity.has_category() {
        required.push(fact::CATEGORY);
    }
    require_columns(facts, &required)?;

    let keys: Vec<Expr> = key_columns(granularity).into_iter().map(col).collect();
    let months_only = facts
        .clone()
        .lazy()
        .filter(col(fact::MONTH).neq(lit(fact::TOTAL_LABEL)));

    let flow_sum = |flow: &'static str, alias: &'static str| {
        months_only
            .clone()
            .filter(col(fact::FLOW).eq(lit(flow)))
            .group_by(keys.clone())
            .agg([col(fact::USD).sum().alias(alias)])
    };

    let wide = flow_sum(crate::schema::flow::EXPORT, kpi::EXPORT)
        .join(
            flow_sum(crate::schema::flow::IMPORT, kpi::IMPORT),
            keys.clone(),
            keys.clone(),
            JoinArgs::new(JoinType::Full).with_coalesce(JoinCoalesce::CoalesceColumns),
        )
        .join(
            month_order_frame()?.lazy(),
            [col(fact::MONTH)],
            [col(fact::MONTH)],
            JoinArgs::new(JoinType::Left),
        )
        .with_columns([(col(kpi::EXPORT) - col(kpi::IMPORT)).alias(kpi::BALANCE)])
        .sort(chronological_order(granularity), SortMultipleOptions::default())
        .collect()?;

    Ok(wide)
}

/// Wide row as read back from the pivot.
#[derive(Debug, Clone)]
struct WideRow {
    year: i32,
    month: MonthLabel,
    category: Option<String>,
    export: Option<f64>,
    import: Option<f64>,
}

fn wide_rows(wide: &DataFrame, granularity: Granularity) -> Result<Vec<WideRow>> {
    let years = wide.column(fact::YEAR)?.i32()?;
    let month_nums = wide.column(kpi::MONTH_NUM)?.i32()?;
    let exports = wide.column(kpi::EXPORT)?.f64()?;
    let imports = wide.column(kpi::IMPORT)?.f64()?;
    let categories = if granularity.has_category() {
        Some(wide.column(fact::CATEGORY)?.str()?)
    } else {
        None
    };

    let mut rows = Vec::with_capacity(wide.height());
    for i in 0..wide.height() {
        let year = years
            .get(i)
            .ok_or_else(|| ObservatoryError::InvalidData(format!("Null year at wide row {i}")))?;
        let Some(month) = month_nums
            .get(i)
            .and_then(|n| MonthLabel::from_number(n as u32))
        else {
            warn!(year, row = i, "dropping fact row with unknown month label");
            continue;
        };
        rows.push(WideRow {
            year,
            month,
            category: categories.and_then(|c| c.get(i)).map(str::to_string),
            export: exports.get(i),
            import: imports.get(i),
        });
    }
    Ok(rows)
}

/// KPI math over a single chronologically sorted series.
fn derive_series(
    rows: &[WideRow],
    base: Option<(i32, MonthLabel)>,
    with_coverage: bool,
) -> Vec<KpiRecord> {
    let position: HashMap<i64, usize> = rows
        .iter()
        .enumerate()
        .map(|(i, r)| (period_index(r.year, r.month), i))
        .collect();
    let lag = |i: usize, periods: i64| -> Option<&WideRow> {
        let target = period_index(rows[i].year, rows[i].month) - periods;
        position.get(&target).map(|&j| &rows[j])
    };
    let balance = |r: &WideRow| -> Option<f64> { Some(r.export? - r.import?) };

    let base_row = match base {
        Some((year, month)) => position
            .get(&period_index(year, month))
            .map(|&j| &rows[j]),
        None => rows.first(),
    };
    // Absent or zero base values fall back to 1.
    let base_export = base_row
        .and_then(|r| r.export)
        .filter(|v| *v != 0.0)
        .unwrap_or(1.0);
    let base_import = base_row
        .and_then(|r| r.import)
        .filter(|v| *v != 0.0)
        .unwrap_or(1.0);

    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let prev = lag(i, 1);
        let year_ago = lag(i, 12);
        let window: Vec<&WideRow> = (0..3).filter_map(|k| lag(i, k)).collect();

        out.push(KpiRecord {
            year: row.year,
            month: row.month,
            category: row.category.clone(),
            export: row.export,
            import: row.import,
            balance: balance(row),
            export_mom_pct: pct_change(row.export, prev.and_then(|p| p.export)),
            export_yoy_pct: pct_change(row.export, year_ago.and_then(|p| p.export)),
            import_mom_pct: pct_change(row.import, prev.and_then(|p| p.import)),
            import_yoy_pct: pct_change(row.import, year_ago.and_then(|p| p.import)),
            export_ma3: mean_of_present(window.iter().map(|r| r.export)).map(|v| round_to(v, 0)),
            import_ma3: mean_of_present(window.iter().map(|r| r.import)).map(|v| round_to(v, 0)),
            balance_ma3: mean_of_present(window.iter().map(|&r| balance(r))).map(|v| round_to(v, 0)),
            export_idx: row.export.map(|v| round_to(v / base_export * 100.0, 2)),
            import_idx: row.import.map(|v| round_to(v / base_import * 100.0, 2)),
            coverage_ratio: if with_coverage {
                coverage_ratio(row.export, row.import)
            } else {
                None
            },
        });
    }
    out
}

/// KPI records plus the number of independent series they came from.
#[derive(Debug, Clone, Default)]
pub struct DerivedKpis {
    pub records: Vec<KpiRecord>,
    pub series: usize,
}

impl DerivedKpis {
    /// First and last year covered.
    pub fn year_range(&self) -> Option<(i32, i32)> {
        let years = self.records.iter().map(|r| r.year);
        Some((years.clone().min()?, years.max()?))
    }
}

/// Derive the KPI records from a fact table frame.
pub fn derive_kpis(
    facts: &DataFrame,
    granularity: Granularity,
    config: &MetricsConfig,
) -> Result<DerivedKpis> {
    let wide = wide_frame(facts, granularity)?;
    let rows = wide_rows(&wide, granularity)?;

    let mut derived = DerivedKpis {
        records: Vec::with_capacity(rows.len()),
        series: 0,
    };
    for chunk in rows.chunk_by(|a, b| a.category == b.category) {
        derived.records.extend(derive_series(
            chunk,
            config.base_period(),
            granularity.has_category(),
        ));
        derived.series += 1;
    }

    debug!(%granularity, rows = derived.records.len(), series = derived.series, "derived KPI series");
    Ok(derived)
}

/// Build the KPI table frame.
pub fn kpis_to_frame(records: &[KpiRecord], granularity: Granularity) -> Result<DataFrame> {
    let f64_col = |name: &str, get: fn(&KpiRecord) -> Option<f64>| {
        Column::new(name.into(), records.iter().map(get).collect::<Vec<_>>())
    };

    let mut columns: Vec<Column> = vec![
        Column::new(
            fact::YEAR.into(),
            records.iter().map(|r| r.year).collect::<Vec<_>>(),
        ),
        Column::new(
            fact::MONTH.into(),
            records.iter().map(|r| r.month.label()).collect::<Vec<_>>(),
        ),
        Column::new(
            kpi::MONTH_NUM.into(),
            records
                .iter()
                .map(|r| r.month.number() as i32)
                .collect::<Vec<_>>(),
        ),
    ];
    if granularity.has_category() {
        columns.push(Column::new(
            fact::CATEGORY.into(),
            records
                .iter()
                .map(|r| r.category.as_deref())
                .collect::<Vec<_>>(),
        ));
    }
    columns.extend([
        f64_col(kpi::EXPORT, |r| r.export),
        f64_col(kpi::IMPORT, |r| r.import),
        f64_col(kpi::BALANCE, |r| r.balance),
    ]);
    if granularity.has_category() {
        columns.push(f64_col(kpi::COVERAGE_RATIO, |r| r.coverage_ratio));
    }
    columns.extend([
        f64_col(kpi::EXPORT_MOM_PCT, |r| r.export_mom_pct),
        f64_col(kpi::EXPORT_YOY_PCT, |r| r.export_yoy_pct),
        f64_col(kpi::IMPORT_MOM_PCT, |r| r.import_mom_pct),
        f64_col(kpi::IMPORT_YOY_PCT, |r| r.import_yoy_pct),
        f64_col(kpi::EXPORT_MA3, |r| r.export_ma3),
        f64_col(kpi::IMPORT_MA3, |r| r.import_ma3),
        f64_col(kpi::BALANCE_MA3, |r| r.balance_ma3),
        f64_col(kpi::EXPORT_IDX, |r| r.export_idx),
        f64_col(kpi::IMPORT_IDX, |r| r.import_idx),
    ]);

    Ok(DataFrame::new(columns)?)
}
