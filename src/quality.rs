//! Completeness checks over parsed facts and derived KPI tables.
//!
//! Like reconciliation findings, these are reported and never block a stage.

use std::collections::BTreeSet;

use crate::facts::{FactRecord, Granularity};
use crate::metrics::KpiRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataQuality {
    /// Facts with a negative USD value.
    pub negative_values: usize,
    /// Category facts whose category is missing or blank.
    pub unnamed_categories: usize,
    pub flows: usize,
    pub years: usize,
    /// Distinct named categories. Zero for national facts.
    pub categories: usize,
}

impl DataQuality {
    pub fn assess(facts: &[FactRecord], granularity: Granularity) -> Self {
        let mut flows = BTreeSet::new();
        let mut years = BTreeSet::new();
        let mut categories = BTreeSet::new();
        let mut quality = DataQuality::default();

        for fact in facts {
            flows.insert(fact.flow);
            years.insert(fact.year);
            if fact.usd < 0.0 {
                quality.negative_values += 1;
            }
            if granularity.has_category() {
                match fact.category.as_deref().map(str::trim) {
                    Some(name) if !name.is_empty() => {
                        categories.insert(name);
                    }
                    _ => quality.unnamed_categories += 1,
                }
            }
        }

        quality.flows = flows.len();
        quality.years = years.len();
        quality.categories = categories.len();
        quality
    }

    pub fn is_clean(&self) -> bool {
        self.negative_values == 0 && self.unnamed_categories == 0
    }
}

/// Categories present in the facts but absent from the KPI rows, sorted.
/// A category whose groups were all excluded, or that only carries annual
/// totals, ends up here.
pub fn categories_without_kpis(facts: &[FactRecord], kpis: &[KpiRecord]) -> Vec<String> {
    let derived: BTreeSet<&str> = kpis.iter().filter_map(|k| k.category.as_deref()).collect();
    facts
        .iter()
        .filter_map(|f| f.category.as_deref())
        .filter(|c| !derived.contains(c))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}
