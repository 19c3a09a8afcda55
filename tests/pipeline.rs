use std::fs;

use trade_observatory::book::{Book, CellValue, Sheet};
use trade_observatory::calendar::MonthLabel;
use trade_observatory::config::SourcePaths;
use trade_observatory::metrics::round_to;
use trade_observatory::query::{CategorySelection, FlowSelection, QueryFacade, TradeQuery};
use trade_observatory::schema::{kpi, tables};
use trade_observatory::{
    ingest_books, run_etl, run_metrics, FileStore, Flow, Granularity, MajorDiscrepancyPolicy,
    MemoryStore, MetricsConfig, ObservatoryError, PipelineConfig, TableStore,
};

fn t(s: &str) -> CellValue {
    CellValue::text(s)
}

fn header() -> Vec<CellValue> {
    let mut row = vec![CellValue::Empty, CellValue::Empty, t("Descripción")];
    row.extend(MonthLabel::ALL.iter().map(|m| t(m.label())));
    row.push(t("Total"));
    row
}

fn value_row(name: &str, months: &[f64], total: f64) -> Vec<CellValue> {
    let mut row = vec![CellValue::Empty, CellValue::Empty, t(name)];
    row.extend(months.iter().map(|v| CellValue::Number(*v)));
    row.push(CellValue::Number(total));
    row
}

/// Year sheet in the published layout: title block, header, units row, body.
fn year_sheet(year: i32, body: Vec<Vec<CellValue>>) -> Sheet {
    let mut rows = vec![
        vec![t("Banco Central - Comercio exterior")],
        vec![],
        header(),
        vec![t("(Millones de US$)")],
        vec![],
    ];
    rows.extend(body);
    rows.push(vec![t("Fuente: aduanas")]);
    Sheet::new(year.to_string(), rows)
}

fn ramp() -> Vec<f64> {
    (1..=12).map(|i| i as f64 * 100.0).collect()
}

fn national_books() -> Vec<(Flow, Book)> {
    let exports = year_sheet(
        2024,
        vec![
            value_row("Incluye reexportaciones", &[1.0; 12], 12.0),
            value_row("Total general", &ramp(), 7_800.0),
        ],
    );
    let imports = year_sheet(
        2024,
        vec![value_row("Total general", &[50.0; 12], 600.0)],
    );
    vec![
        (Flow::Export, Book::new(vec![exports, Sheet::new("Notas", vec![])])),
        (Flow::Import, Book::new(vec![imports])),
    ]
}

fn category_row(name: &str, january: f64) -> Vec<CellValue> {
    month_row(name, MonthLabel::Enero, january)
}

/// Category row reporting a single month, with a matching Total.
fn month_row(name: &str, month: MonthLabel, usd: f64) -> Vec<CellValue> {
    let mut months = [0.0; 12];
    months[month.number() as usize - 1] = usd;
    value_row(name, &months, usd)
}

fn category_books() -> Vec<(Flow, Book)> {
    let body = vec![
        category_row("Aceite", 500.0),
        category_row("Banano", 300.0),
        category_row("Cobre", 800.0),
        category_row("Total general", 1_600.0),
    ];
    vec![(Flow::Export, Book::new(vec![year_sheet(2024, body)]))]
}

#[test]
fn national_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FileStore::open(dir.path().join("store"))
        .unwrap()
        .with_parquet_mirror(dir.path().join("mirror"))
        .unwrap();
    let config = PipelineConfig::default();

    let etl = ingest_books(&config, &mut store, Granularity::National, &national_books()).unwrap();
    assert!(etl.report.is_clean());
    assert_eq!(etl.report.groups_checked, 2);
    assert!(etl.skipped.is_empty());
    assert_eq!(etl.years, vec![2024]);
    // 12 months + Total, per flow.
    assert_eq!(etl.fact_rows, 26);

    let metrics = run_metrics(&config, &mut store, Granularity::National).unwrap();
    assert_eq!(metrics.kpi_rows, 12);

    let facade = QueryFacade::new(&store);
    let view = facade.national_view(&TradeQuery::new()).unwrap().unwrap();
    assert!(view.has_kpi);
    assert_eq!(view.frame.height(), 12);

    let col = |name: &str| view.frame.column(name).unwrap().f64().unwrap().clone();
    let mom = col(kpi::EXPORT_MOM_PCT);
    assert_eq!(mom.get(0), None);
    assert_eq!(mom.get(11), Some(round_to((1200.0 / 1100.0 - 1.0) * 100.0, 2)));
    assert_eq!(mom.get(11), Some(9.09));
    assert_eq!(col(kpi::EXPORT_IDX).get(0), Some(100.0));
    assert_eq!(col(kpi::EXPORT_IDX).get(11), Some(1200.0));
    assert_eq!(col(kpi::BALANCE).get(0), Some(50.0));
    assert!(col(kpi::EXPORT_YOY_PCT).iter().all(|v| v.is_none()));

    let monthly = facade.monthly_totals(Flow::Export, None).unwrap();
    assert_eq!(monthly.len(), 12);
    assert_eq!(monthly[11].month, MonthLabel::Diciembre);
    assert_eq!(monthly.iter().map(|m| m.usd).sum::<f64>(), 7_800.0);
}

#[test]
fn perturbed_month_is_reported_with_its_delta() {
    let mut months = ramp();
    months[5] -= 2_500.0;
    let books = vec![(
        Flow::Export,
        Book::new(vec![year_sheet(2024, vec![value_row("Total general", &months, 7_800.0)])]),
    )];
    let mut store = MemoryStore::new();
    let etl = ingest_books(&PipelineConfig::default(), &mut store, Granularity::National, &books)
        .unwrap();
    assert_eq!(etl.report.findings.len(), 1);
    assert_eq!(etl.report.findings[0].delta, 2_500.0);
    assert!(store.has_table(tables::TRADE).unwrap());
}

#[test]
fn rerunning_etl_rewrites_identical_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FileStore::open(dir.path().join("store"))
        .unwrap()
        .with_parquet_mirror(dir.path().join("mirror"))
        .unwrap();
    let config = PipelineConfig::default();

    let snapshot = |store: &FileStore| {
        (
            fs::read(store.table_path(tables::TRADE)).unwrap(),
            fs::read(store.mirror_path(tables::TRADE).unwrap()).unwrap(),
        )
    };

    ingest_books(&config, &mut store, Granularity::National, &national_books()).unwrap();
    let first = snapshot(&store);
    ingest_books(&config, &mut store, Granularity::National, &national_books()).unwrap();
    let second = snapshot(&store);

    assert_eq!(first, second);
    let rows = store.read_table(tables::TRADE).unwrap().unwrap().height();
    assert_eq!(rows, 26);
}

#[test]
fn missing_sources_fail_before_parsing() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        store_dir: dir.path().join("store"),
        mirror_dir: None,
        sources: SourcePaths {
            national_import: dir.path().join("F8.xlsx"),
            national_export: dir.path().join("G6.xlsx"),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut store = FileStore::open(&config.store_dir).unwrap();

    let err = run_etl(&config, &mut store, Granularity::National).unwrap_err();
    match err {
        ObservatoryError::SourceMissing(paths) => {
            assert_eq!(paths.len(), 2);
            assert!(paths.contains(&dir.path().join("G6.xlsx")));
            assert!(paths.contains(&dir.path().join("F8.xlsx")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!store.has_table(tables::TRADE).unwrap());
}

#[test]
fn category_queries_fall_back_then_use_kpis() {
    let mut store = MemoryStore::new();
    let config = PipelineConfig::default();
    let etl = ingest_books(&config, &mut store, Granularity::Category, &category_books()).unwrap();
    assert!(etl.report.is_clean());

    let facade = QueryFacade::new(&store);
    let top = facade.top_categories(2, Flow::Export, None).unwrap();
    let order: Vec<_> = top.iter().map(|t| t.category.as_str()).collect();
    assert_eq!(order, vec!["Cobre", "Aceite"]);

    let query = TradeQuery::new()
        .flows(FlowSelection::Export)
        .categories(CategorySelection::TopN { n: 2, flow: Flow::Export });
    let fallback = facade.category_view(&query).unwrap().unwrap();
    assert!(!fallback.has_kpi);
    assert_eq!(fallback.frame.height(), 2);
    assert!(fallback.frame.column(kpi::IMPORT).is_err());

    run_metrics(&config, &mut store, Granularity::Category).unwrap();
    let facade = QueryFacade::new(&store);
    assert!(facade.capabilities().unwrap().has_category_kpi);
    let view = facade.category_view(&query).unwrap().unwrap();
    assert!(view.has_kpi);
    assert_eq!(view.frame.height(), 2);
    assert!(view.frame.column(kpi::EXPORT_IDX).is_ok());
}

#[test]
fn metrics_rank_top_categories_over_the_latest_year() {
    let books = vec![(
        Flow::Export,
        Book::new(vec![
            year_sheet(2023, vec![month_row("Bbb", MonthLabel::Marzo, 90_000.0)]),
            year_sheet(
                2024,
                vec![
                    month_row("Aaa", MonthLabel::Enero, 1_000.0),
                    month_row("Bbb", MonthLabel::Febrero, 10.0),
                ],
            ),
        ]),
    )];
    let mut store = MemoryStore::new();
    let config = PipelineConfig::default();
    let etl = ingest_books(&config, &mut store, Granularity::Category, &books).unwrap();
    assert_eq!(etl.category_rows, 3);
    assert_eq!(etl.quality.categories, 2);
    assert_eq!(etl.quality.years, 2);

    let metrics = run_metrics(&config, &mut store, Granularity::Category).unwrap();
    // Bbb reports the latest month and led 2023, but Aaa leads 2024.
    let order: Vec<_> = metrics.top_categories.iter().map(|t| t.category.as_str()).collect();
    assert_eq!(order, vec!["Aaa", "Bbb"]);
    assert_eq!(metrics.top_categories[0].usd, 1_000.0);
    assert_eq!(metrics.series, 2);
    assert_eq!(metrics.years, Some((2023, 2024)));
    assert!(metrics.recent.is_empty());
}

#[test]
fn quality_summary_flags_negatives_and_categories_left_without_kpis() {
    let body = vec![
        category_row("Cobre", 800.0),
        value_row("Oro", &[-5.0; 12], 50_000_000.0),
    ];
    let books = vec![(Flow::Export, Book::new(vec![year_sheet(2024, body)]))];
    let config = PipelineConfig {
        metrics: MetricsConfig {
            major_policy: MajorDiscrepancyPolicy::Exclude,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut store = MemoryStore::new();

    let etl = ingest_books(&config, &mut store, Granularity::Category, &books).unwrap();
    assert_eq!(etl.quality.negative_values, 12);
    assert_eq!(etl.quality.unnamed_categories, 0);
    assert_eq!(etl.quality.categories, 2);
    assert_eq!(etl.quality.flows, 1);
    assert!(!etl.quality.is_clean());

    let metrics = run_metrics(&config, &mut store, Granularity::Category).unwrap();
    assert_eq!(metrics.excluded_groups, 1);
    assert_eq!(metrics.categories_without_kpis, vec!["Oro".to_string()]);
    assert_eq!(metrics.series, 1);
}
