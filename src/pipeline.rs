//! Stage runners: ETL (books → facts + QA) and metrics (facts → KPIs).
//!
//! Stages only talk through the store, so each can be re-run on its own.

use chrono::{DateTime, Utc};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::book::{open_book, Book};
use crate::config::PipelineConfig;
use crate::error::{ObservatoryError, Result};
use crate::facts::{facts_to_frame, frame_to_facts, FactRecord, Flow, Granularity};
use crate::metrics::{derive_kpis, kpis_to_frame, KpiRecord};
use crate::parser::{parse_book, DefaultLayout, SheetSkip};
use crate::quality::{categories_without_kpis, DataQuality};
use crate::query::{rank_categories, CategoryTotal};
use crate::reconcile::{reconcile, MajorDiscrepancyPolicy, ReconciliationReport};
use crate::store::TableStore;

#[derive(Debug, Clone)]
pub struct EtlOutcome {
    pub run_id: Uuid,
    pub granularity: Granularity,
    pub finished_at: DateTime<Utc>,
    pub fact_rows: usize,
    /// Category rows that produced at least one month fact, summed over sheets.
    pub category_rows: usize,
    /// Years parsed from at least one book, ascending.
    pub years: Vec<i32>,
    pub skipped: Vec<SheetSkip>,
    pub report: ReconciliationReport,
    pub quality: DataQuality,
}

#[derive(Debug, Clone)]
pub struct MetricsOutcome {
    pub run_id: Uuid,
    pub granularity: Granularity,
    pub finished_at: DateTime<Utc>,
    pub kpi_rows: usize,
    /// Distinct KPI series: one for national, one per category otherwise.
    pub series: usize,
    /// First and last year covered by the KPI table.
    pub years: Option<(i32, i32)>,
    /// Groups dropped under `MajorDiscrepancyPolicy::Exclude`.
    pub excluded_groups: usize,
    /// National only: the last three periods.
    pub recent: Vec<KpiRecord>,
    /// Category only: the five largest exporters summed over the latest year.
    pub top_categories: Vec<CategoryTotal>,
    /// Categories in the fact table with no KPI row.
    pub categories_without_kpis: Vec<String>,
}

/// Read the two source books for `granularity` and run the ETL stage.
///
/// Every missing workbook is reported in one error before anything is parsed.
pub fn run_etl<S: TableStore + ?Sized>(
    config: &PipelineConfig,
    store: &mut S,
    granularity: Granularity,
) -> Result<EtlOutcome> {
    let sources: Vec<_> = Flow::ALL
        .iter()
        .map(|&flow| (flow, config.sources.path(granularity, flow)))
        .collect();

    let missing: Vec<_> = sources
        .iter()
        .filter(|(_, path)| !path.is_file())
        .map(|(_, path)| path.to_path_buf())
        .collect();
    if !missing.is_empty() {
        return Err(ObservatoryError::SourceMissing(missing));
    }

    let mut books = Vec::with_capacity(sources.len());
    for (flow, path) in sources {
        info!(%flow, %granularity, path = %path.display(), "opening workbook");
        books.push((flow, open_book(path)?));
    }
    ingest_books(config, store, granularity, &books)
}

/// ETL over already opened books: parse, reconcile, replace the fact table.
pub fn ingest_books<S: TableStore + ?Sized>(
    config: &PipelineConfig,
    store: &mut S,
    granularity: Granularity,
    books: &[(Flow, Book)],
) -> Result<EtlOutcome> {
    let run_id = Uuid::new_v4();
    let span = info_span!("etl", %run_id, %granularity);
    let _guard = span.enter();

    let layout = DefaultLayout::new(config.layout.clone());
    let mut facts: Vec<FactRecord> = Vec::new();
    let mut skipped = Vec::new();
    let mut years = Vec::new();
    let mut category_rows = 0;
    for (flow, book) in books {
        let parsed = parse_book(book, *flow, granularity, &layout);
        facts.extend(parsed.records);
        skipped.extend(parsed.skipped);
        years.extend(parsed.years);
        category_rows += parsed.categories_found;
    }
    years.sort_unstable();
    years.dedup();

    if facts.is_empty() {
        warn!("no facts parsed; the fact table will be empty");
    }

    let report = reconcile(&facts, &config.reconcile);
    info!(
        groups = report.groups_checked,
        findings = report.findings.len(),
        missing_totals = report.missing_totals,
        "reconciliation finished"
    );

    let quality = log_quality(DataQuality::assess(&facts, granularity));

    let mut frame = facts_to_frame(&facts, granularity)?;
    store.write_table(granularity.fact_table(), &mut frame)?;

    Ok(EtlOutcome {
        run_id,
        granularity,
        finished_at: Utc::now(),
        fact_rows: frame.height(),
        category_rows,
        years,
        skipped,
        report,
        quality,
    })
}

fn log_quality(quality: DataQuality) -> DataQuality {
    if quality.negative_values > 0 {
        warn!(count = quality.negative_values, "facts with negative values");
    }
    if quality.unnamed_categories > 0 {
        warn!(count = quality.unnamed_categories, "category facts without a name");
    }
    info!(
        flows = quality.flows,
        years = quality.years,
        categories = quality.categories,
        "fact coverage"
    );
    quality
}

/// Derive and replace the KPI table for `granularity`.
pub fn run_metrics<S: TableStore + ?Sized>(
    config: &PipelineConfig,
    store: &mut S,
    granularity: Granularity,
) -> Result<MetricsOutcome> {
    let run_id = Uuid::new_v4();
    let span = info_span!("metrics", %run_id, %granularity);
    let _guard = span.enter();

    let table = granularity.fact_table();
    let stored = store
        .read_table(table)?
        .ok_or_else(|| ObservatoryError::TableMissing(table.to_string()))?;
    let records = frame_to_facts(&stored)?;

    let (facts, excluded_groups) = match config.metrics.major_policy {
        MajorDiscrepancyPolicy::Retain => (stored, 0),
        MajorDiscrepancyPolicy::Exclude => {
            let majors = reconcile(&records, &config.reconcile).major_groups();
            if !majors.is_empty() {
                warn!(groups = majors.len(), "excluding groups with major discrepancies");
            }
            let kept: Vec<FactRecord> = records
                .iter()
                .filter(|r| !majors.contains(&(r.year, r.flow, r.category.clone())))
                .cloned()
                .collect();
            (facts_to_frame(&kept, granularity)?, majors.len())
        }
    };

    let kpis = derive_kpis(&facts, granularity, &config.metrics)?;
    let years = kpis.year_range();
    let mut frame = kpis_to_frame(&kpis.records, granularity)?;
    store.write_table(granularity.kpi_table(), &mut frame)?;
    info!(
        rows = kpis.records.len(),
        series = kpis.series,
        first_year = years.map(|(first, _)| first),
        last_year = years.map(|(_, last)| last),
        "KPI table written"
    );

    let missing = categories_without_kpis(&records, &kpis.records);
    if !missing.is_empty() {
        warn!(count = missing.len(), categories = ?missing, "categories without KPI rows");
    }

    let (recent, top_categories) = match granularity {
        Granularity::National => {
            let start = kpis.records.len().saturating_sub(3);
            (kpis.records[start..].to_vec(), Vec::new())
        }
        Granularity::Category => (Vec::new(), rank_categories(&frame, 5, Flow::Export, None)?),
    };

    Ok(MetricsOutcome {
        run_id,
        granularity,
        finished_at: Utc::now(),
        kpi_rows: kpis.records.len(),
        series: kpis.series,
        years,
        excluded_groups,
        recent,
        top_categories,
        categories_without_kpis: missing,
    })
}
