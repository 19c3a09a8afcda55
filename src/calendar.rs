//! Fixed month table used for display labels and chronological ordering.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::fact::TOTAL_LABEL;

/// One of the twelve month labels as they appear in the source books.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MonthLabel {
    #[serde(rename = "Enero")]
    Enero,
    #[serde(rename = "Febrero")]
    Febrero,
    #[serde(rename = "Marzo")]
    Marzo,
    #[serde(rename = "Abril")]
    Abril,
    #[serde(rename = "Mayo")]
    Mayo,
    #[serde(rename = "Junio")]
    Junio,
    #[serde(rename = "Julio")]
    Julio,
    #[serde(rename = "Agosto")]
    Agosto,
    #[serde(rename = "Septiembre")]
    Septiembre,
    #[serde(rename = "Octubre")]
    Octubre,
    #[serde(rename = "Noviembre")]
    Noviembre,
    #[serde(rename = "Diciembre")]
    Diciembre,
}

impl MonthLabel {
    /// Calendar order. Index + 1 is the month number.
    pub const ALL: [MonthLabel; 12] = [
        MonthLabel::Enero,
        MonthLabel::Febrero,
        MonthLabel::Marzo,
        MonthLabel::Abril,
        MonthLabel::Mayo,
        MonthLabel::Junio,
        MonthLabel::Julio,
        MonthLabel::Agosto,
        MonthLabel::Septiembre,
        MonthLabel::Octubre,
        MonthLabel::Noviembre,
        MonthLabel::Diciembre,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MonthLabel::Enero => "Enero",
            MonthLabel::Febrero => "Febrero",
            MonthLabel::Marzo => "Marzo",
            MonthLabel::Abril => "Abril",
            MonthLabel::Mayo => "Mayo",
            MonthLabel::Junio => "Junio",
            MonthLabel::Julio => "Julio",
            MonthLabel::Agosto => "Agosto",
            MonthLabel::Septiembre => "Septiembre",
            MonthLabel::Octubre => "Octubre",
            MonthLabel::Noviembre => "Noviembre",
            MonthLabel::Diciembre => "Diciembre",
        }
    }

    /// Month of year, 1..=12.
    pub fn number(self) -> u32 {
        self as u32 + 1
    }

    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            1..=12 => Some(Self::ALL[(number - 1) as usize]),
            _ => None,
        }
    }

    /// Exact match after trimming surrounding whitespace.
    pub fn from_label(text: &str) -> Option<Self> {
        let text = text.trim();
        Self::ALL.iter().copied().find(|m| m.label() == text)
    }
}

impl fmt::Display for MonthLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Month column of a fact: a calendar month or the reported annual total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Period {
    Month(MonthLabel),
    Total,
}

impl Period {
    pub fn label(self) -> &'static str {
        match self {
            Period::Month(m) => m.label(),
            Period::Total => TOTAL_LABEL,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        if text.trim() == TOTAL_LABEL {
            return Some(Period::Total);
        }
        MonthLabel::from_label(text).map(Period::Month)
    }

    pub fn month(self) -> Option<MonthLabel> {
        match self {
            Period::Month(m) => Some(m),
            Period::Total => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Monotonic period index used for calendar-aware lags.
pub fn period_index(year: i32, month: MonthLabel) -> i64 {
    year as i64 * 12 + month.number() as i64 - 1
}
