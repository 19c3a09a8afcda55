//! Long-form fact records and their columnar representation.

use std::fmt;

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calendar::{MonthLabel, Period};
use crate::error::{ObservatoryError, Result};
use crate::schema::{fact, flow, kpi, tables};

/// Direction of trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    Export,
    Import,
}

impl Flow {
    pub const ALL: [Flow; 2] = [Flow::Export, Flow::Import];

    pub fn as_str(self) -> &'static str {
        match self {
            Flow::Export => flow::EXPORT,
            Flow::Import => flow::IMPORT,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            flow::EXPORT => Some(Flow::Export),
            flow::IMPORT => Some(Flow::Import),
            _ => None,
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// National aggregate stream or per-category stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    National,
    Category,
}

impl Granularity {
    pub const ALL: [Granularity; 2] = [Granularity::National, Granularity::Category];

    pub fn fact_table(self) -> &'static str {
        match self {
            Granularity::National => tables::TRADE,
            Granularity::Category => tables::TRADE_PROD,
        }
    }

    pub fn kpi_table(self) -> &'static str {
        match self {
            Granularity::National => tables::KPI_MONTHLY,
            Granularity::Category => tables::KPI_PROD_MONTHLY,
        }
    }

    pub fn has_category(self) -> bool {
        matches!(self, Granularity::Category)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::National => f.write_str("national"),
            Granularity::Category => f.write_str("category"),
        }
    }
}

/// One observed USD value.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRecord {
    pub year: i32,
    pub month: Period,
    pub flow: Flow,
    pub category: Option<String>,
    pub usd: f64,
    /// Row-level sum of monthly cells, carried by parser-emitted `Total`
    /// records only. Never persisted.
    pub months_sum: Option<f64>,
}

impl FactRecord {
    pub fn month(year: i32, month: MonthLabel, flow: Flow, category: Option<String>, usd: f64) -> Self {
        Self {
            year,
            month: Period::Month(month),
            flow,
            category,
            usd,
            months_sum: None,
        }
    }

    pub fn total(
        year: i32,
        flow: Flow,
        category: Option<String>,
        usd: f64,
        months_sum: Option<f64>,
    ) -> Self {
        Self {
            year,
            month: Period::Total,
            flow,
            category,
            usd,
            months_sum,
        }
    }

    pub fn is_total(&self) -> bool {
        self.month == Period::Total
    }
}

/// Persisted row order: flow, year, category, month order with `Total` last.
pub fn sort_facts(records: &mut [FactRecord]) {
    records.sort_by(|a, b| {
        a.flow
            .cmp(&b.flow)
            .then(a.year.cmp(&b.year))
            .then_with(|| a.category.cmp(&b.category))
            .then(a.month.cmp(&b.month))
    });
}

/// Build the fact table frame. The `category` column only exists for
/// category granularity.
pub fn facts_to_frame(records: &[FactRecord], granularity: Granularity) -> Result<DataFrame> {
    let mut sorted = records.to_vec();
    sort_facts(&mut sorted);

    let years: Vec<i32> = sorted.iter().map(|r| r.year).collect();
    let months: Vec<&str> = sorted.iter().map(|r| r.month.label()).collect();
    let flows: Vec<&str> = sorted.iter().map(|r| r.flow.as_str()).collect();
    let usd: Vec<f64> = sorted.iter().map(|r| r.usd).collect();

    let mut columns: Vec<Column> = vec![
        Column::new(fact::YEAR.into(), years),
        Column::new(fact::MONTH.into(), months),
        Column::new(fact::FLOW.into(), flows),
    ];
    if granularity.has_category() {
        let categories: Vec<Option<&str>> =
            sorted.iter().map(|r| r.category.as_deref()).collect();
        columns.push(Column::new(fact::CATEGORY.into(), categories));
    }
    columns.push(Column::new(fact::USD.into(), usd));

    Ok(DataFrame::new(columns)?)
}

/// Read fact records back from a stored frame.
pub fn frame_to_facts(df: &DataFrame) -> Result<Vec<FactRecord>> {
    require_columns(df, &[fact::YEAR, fact::MONTH, fact::FLOW, fact::USD])?;

    let years = df.column(fact::YEAR)?.i32()?;
    let months = df.column(fact::MONTH)?.str()?;
    let flows = df.column(fact::FLOW)?.str()?;
    let usd = df.column(fact::USD)?.f64()?;
    let categories = match df.column(fact::CATEGORY) {
        Ok(c) => Some(c.str()?),
        Err(_) => None,
    };

    let mut records = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let year = years
            .get(i)
            .ok_or_else(|| ObservatoryError::InvalidData(format!("Null year at row {i}")))?;
        let month_text = months
            .get(i)
            .ok_or_else(|| ObservatoryError::InvalidData(format!("Null month at row {i}")))?;
        let month = Period::parse(month_text).ok_or_else(|| {
            ObservatoryError::InvalidData(format!("Unknown month label '{month_text}' at row {i}"))
        })?;
        let flow_text = flows
            .get(i)
            .ok_or_else(|| ObservatoryError::InvalidData(format!("Null flow at row {i}")))?;
        let flow = Flow::parse(flow_text).ok_or_else(|| {
            ObservatoryError::InvalidData(format!("Unknown flow '{flow_text}' at row {i}"))
        })?;
        let value = usd
            .get(i)
            .ok_or_else(|| ObservatoryError::InvalidData(format!("Null usd at row {i}")))?;
        let category = categories
            .and_then(|c| c.get(i))
            .map(|s| s.to_string());

        records.push(FactRecord {
            year,
            month,
            flow,
            category,
            usd: value,
            months_sum: None,
        });
    }
    Ok(records)
}

/// Lookup frame mapping each month label to its number.
pub fn month_order_frame() -> Result<DataFrame> {
    let labels: Vec<&str> = MonthLabel::ALL.iter().map(|m| m.label()).collect();
    let numbers: Vec<i32> = MonthLabel::ALL.iter().map(|m| m.number() as i32).collect();
    Ok(DataFrame::new(vec![
        Column::new(fact::MONTH.into(), labels),
        Column::new(kpi::MONTH_NUM.into(), numbers),
    ])?)
}

pub fn require_columns(df: &DataFrame, required: &[&str]) -> Result<()> {
    for &col_name in required {
        if df.column(col_name).is_err() {
            return Err(ObservatoryError::MissingColumn(col_name.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<FactRecord> {
        vec![
            FactRecord::total(2024, Flow::Import, Some("Cobre".into()), 30.0, Some(30.0)),
            FactRecord::month(2024, MonthLabel::Febrero, Flow::Import, Some("Cobre".into()), 20.0),
            FactRecord::month(2024, MonthLabel::Enero, Flow::Import, Some("Cobre".into()), 10.0),
            FactRecord::month(2023, MonthLabel::Enero, Flow::Export, Some("Oro".into()), 5.0),
        ]
    }

    #[test]
    fn category_frame_orders_rows_and_keeps_category() {
        let df = facts_to_frame(&sample(), Granularity::Category).unwrap();
        assert_eq!(df.height(), 4);
        assert!(df.column(fact::CATEGORY).is_ok());

        let months: Vec<&str> = df
            .column(fact::MONTH)
            .unwrap()
            .str()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(months, vec!["Enero", "Enero", "Febrero", "Total"]);
    }

    #[test]
    fn national_frame_omits_category() {
        let records: Vec<FactRecord> = sample()
            .into_iter()
            .map(|mut r| {
                r.category = None;
                r
            })
            .collect();
        let df = facts_to_frame(&records, Granularity::National).unwrap();
        assert!(df.column(fact::CATEGORY).is_err());
        assert_eq!(df.width(), 4);
    }

    #[test]
    fn frame_round_trip_drops_side_channel() {
        let df = facts_to_frame(&sample(), Granularity::Category).unwrap();
        let back = frame_to_facts(&df).unwrap();
        assert_eq!(back.len(), 4);
        assert!(back.iter().all(|r| r.months_sum.is_none()));
        let total = back.iter().find(|r| r.is_total()).unwrap();
        assert_eq!(total.usd, 30.0);
        assert_eq!(total.category.as_deref(), Some("Cobre"));
    }

    #[test]
    fn missing_columns_are_reported() {
        let df = DataFrame::new(vec![Column::new(fact::YEAR.into(), vec![2024i32])]).unwrap();
        let err = frame_to_facts(&df).unwrap_err();
        assert!(matches!(err, ObservatoryError::MissingColumn(c) if c == fact::MONTH));
    }
}
