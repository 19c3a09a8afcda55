//! Trade observatory: monthly foreign-trade statistics from spreadsheet
//! releases to a reconciled fact store and derived KPI tables.
//!
//! Stages:
//! 1. [`parser`] turns year-per-sheet workbooks into long-form facts.
//! 2. [`reconcile`] checks monthly sums against reported annual totals.
//! 3. [`store`] replaces named tables atomically.
//! 4. [`metrics`] pivots facts and derives the KPI series.
//! 5. [`query`] serves filtered views with a fallback when KPIs are absent.

pub mod book;
pub mod calendar;
pub mod config;
pub mod error;
pub mod facts;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod quality;
pub mod query;
pub mod reconcile;
pub mod schema;
pub mod store;

pub use book::{open_book, Book, CellValue, Sheet};
pub use calendar::{MonthLabel, Period};
pub use config::PipelineConfig;
pub use error::{ObservatoryError, Result};
pub use facts::{FactRecord, Flow, Granularity};
pub use metrics::{derive_kpis, DerivedKpis, KpiRecord, MetricsConfig};
pub use parser::{parse_book, DefaultLayout, LayoutConfig, SheetLayout};
pub use pipeline::{ingest_books, run_etl, run_metrics, EtlOutcome, MetricsOutcome};
pub use quality::DataQuality;
pub use query::{Capabilities, QueryFacade, TradeQuery, TradeView};
pub use reconcile::{reconcile, MajorDiscrepancyPolicy, ReconcileConfig, ReconciliationReport};
pub use store::{FileStore, MemoryStore, TableStore};
