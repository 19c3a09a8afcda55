//! Read-only façade over the stored tables.
//!
//! Every view prefers the KPI table and falls back to a pivot recomputed from
//! the fact table when metrics have not been derived yet. `TradeView::has_kpi`
//! tells callers which one they got.

use chrono::{DateTime, TimeDelta, Utc};
use polars::prelude::*;
use tracing::debug;

use crate::calendar::MonthLabel;
use crate::error::Result;
use crate::facts::{month_order_frame, require_columns, Flow, Granularity};
use crate::metrics::wide_frame;
use crate::schema::{fact, kpi, tables};
use crate::store::TableStore;

/// Which tables the store currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub has_facts: bool,
    pub has_category_facts: bool,
    pub has_kpi: bool,
    pub has_category_kpi: bool,
}

impl Capabilities {
    pub fn probe<S: TableStore + ?Sized>(store: &S) -> Result<Self> {
        Ok(Self {
            has_facts: store.has_table(tables::TRADE)?,
            has_category_facts: store.has_table(tables::TRADE_PROD)?,
            has_kpi: store.has_table(tables::KPI_MONTHLY)?,
            has_category_kpi: store.has_table(tables::KPI_PROD_MONTHLY)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlowSelection {
    Export,
    Import,
    #[default]
    Both,
}

impl FlowSelection {
    /// Whether a view column survives this selection. Balance and coverage
    /// columns need both flows.
    fn keeps(self, column: &str) -> bool {
        let needs_both = column.starts_with(kpi::BALANCE) || column == kpi::COVERAGE_RATIO;
        match self {
            FlowSelection::Both => true,
            FlowSelection::Export => !needs_both && !column.starts_with(kpi::IMPORT),
            FlowSelection::Import => !needs_both && !column.starts_with(kpi::EXPORT),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum CategorySelection {
    #[default]
    All,
    Named(Vec<String>),
    /// The `n` largest categories by `flow` in the latest year.
    TopN { n: usize, flow: Flow },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeQuery {
    /// Inclusive year range.
    pub years: Option<(i32, i32)>,
    pub flows: FlowSelection,
    pub categories: CategorySelection,
}

impl TradeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn years(mut self, from: i32, to: i32) -> Self {
        self.years = Some((from, to));
        self
    }

    pub fn flows(mut self, flows: FlowSelection) -> Self {
        self.flows = flows;
        self
    }

    pub fn categories(mut self, categories: CategorySelection) -> Self {
        self.categories = categories;
        self
    }
}

#[derive(Debug, Clone)]
pub struct TradeView {
    pub frame: DataFrame,
    /// False when the frame is the fallback pivot without derived KPIs.
    pub has_kpi: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryTotal {
    pub category: String,
    pub usd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyTotal {
    pub year: i32,
    pub month: MonthLabel,
    pub usd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YearlyTotal {
    pub year: i32,
    pub export: f64,
    pub import: f64,
    pub balance: f64,
}

fn flow_column(flow: Flow) -> &'static str {
    match flow {
        Flow::Export => kpi::EXPORT,
        Flow::Import => kpi::IMPORT,
    }
}

fn chronological_order(granularity: Granularity) -> Vec<&'static str> {
    match granularity {
        Granularity::National => vec![fact::YEAR, kpi::MONTH_NUM],
        Granularity::Category => vec![fact::CATEGORY, fact::YEAR, kpi::MONTH_NUM],
    }
}

fn year_filter(lf: LazyFrame, years: Option<(i32, i32)>) -> LazyFrame {
    match years {
        Some((from, to)) => lf.filter(
            col(fact::YEAR)
                .gt_eq(lit(from))
                .and(col(fact::YEAR).lt_eq(lit(to))),
        ),
        None => lf,
    }
}

/// Rank categories of a wide frame by one flow's sum in `year`, or in the
/// latest year present.
pub(crate) fn rank_categories(
    wide: &DataFrame,
    n: usize,
    flow: Flow,
    year: Option<i32>,
) -> Result<Vec<CategoryTotal>> {
    require_columns(wide, &[fact::YEAR, fact::CATEGORY, flow_column(flow)])?;
    let year = match year.or_else(|| wide.column(fact::YEAR).ok()?.i32().ok()?.max()) {
        Some(year) => year,
        None => return Ok(Vec::new()),
    };

    let totals = wide
        .clone()
        .lazy()
        .filter(col(fact::YEAR).eq(lit(year)))
        .group_by([col(fact::CATEGORY)])
        .agg([col(flow_column(flow)).sum().alias(fact::USD)])
        .collect()?;

    let categories = totals.column(fact::CATEGORY)?.str()?;
    let usd = totals.column(fact::USD)?.f64()?;
    let mut ranked: Vec<CategoryTotal> = categories
        .iter()
        .zip(usd.iter())
        .filter_map(|(category, usd)| {
            Some(CategoryTotal {
                category: category?.to_string(),
                usd: usd.unwrap_or(0.0),
            })
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.usd
            .total_cmp(&a.usd)
            .then_with(|| a.category.cmp(&b.category))
    });
    ranked.truncate(n);
    Ok(ranked)
}

pub struct QueryFacade<'s, S: TableStore + ?Sized> {
    store: &'s S,
}

impl<'s, S: TableStore + ?Sized> QueryFacade<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    pub fn capabilities(&self) -> Result<Capabilities> {
        Capabilities::probe(self.store)
    }

    /// KPI frame when present, otherwise the pivot recomputed from facts.
    fn wide_source(&self, granularity: Granularity) -> Result<Option<TradeView>> {
        if let Some(frame) = self.store.read_table(granularity.kpi_table())? {
            return Ok(Some(TradeView { frame, has_kpi: true }));
        }
        match self.store.read_table(granularity.fact_table())? {
            Some(facts) => {
                debug!(%granularity, "no KPI table, falling back to fact pivot");
                Ok(Some(TradeView {
                    frame: wide_frame(&facts, granularity)?,
                    has_kpi: false,
                }))
            }
            None => Ok(None),
        }
    }

    fn view(&self, granularity: Granularity, query: &TradeQuery) -> Result<Option<TradeView>> {
        let Some(source) = self.wide_source(granularity)? else {
            return Ok(None);
        };

        let selected = match (&query.categories, granularity.has_category()) {
            (CategorySelection::Named(names), true) => Some(names.clone()),
            (CategorySelection::TopN { n, flow }, true) => Some(
                rank_categories(&source.frame, *n, *flow, None)?
                    .into_iter()
                    .map(|t| t.category)
                    .collect(),
            ),
            _ => None,
        };

        let kept: Vec<Expr> = source
            .frame
            .get_column_names()
            .into_iter()
            .filter(|name| query.flows.keeps(name.as_str()))
            .map(|name| col(name.clone()))
            .collect();

        let mut lf = year_filter(source.frame.lazy(), query.years);
        if let Some(names) = selected {
            let names = Series::new("categories".into(), names);
            lf = lf.filter(col(fact::CATEGORY).is_in(lit(names), false));
        }
        let frame = lf
            .sort(chronological_order(granularity), SortMultipleOptions::default())
            .select(kept)
            .collect()?;

        Ok(Some(TradeView {
            frame,
            has_kpi: source.has_kpi,
        }))
    }

    /// National series. `None` when no national data has been loaded.
    pub fn national_view(&self, query: &TradeQuery) -> Result<Option<TradeView>> {
        self.view(Granularity::National, query)
    }

    /// Per-category series. `None` when no category data has been loaded.
    pub fn category_view(&self, query: &TradeQuery) -> Result<Option<TradeView>> {
        self.view(Granularity::Category, query)
    }

    /// Categories ranked by summed `flow` value in `year` (latest if unset),
    /// largest first, ties by name.
    pub fn top_categories(
        &self,
        n: usize,
        flow: Flow,
        year: Option<i32>,
    ) -> Result<Vec<CategoryTotal>> {
        match self.wide_source(Granularity::Category)? {
            Some(source) => rank_categories(&source.frame, n, flow, year),
            None => Ok(Vec::new()),
        }
    }

    /// National monthly sums of one flow, in chronological order.
    pub fn monthly_totals(
        &self,
        flow: Flow,
        years: Option<(i32, i32)>,
    ) -> Result<Vec<MonthlyTotal>> {
        let Some(facts) = self.store.read_table(tables::TRADE)? else {
            return Ok(Vec::new());
        };
        require_columns(&facts, &[fact::YEAR, fact::MONTH, fact::FLOW, fact::USD])?;

        let months = facts
            .lazy()
            .filter(col(fact::MONTH).neq(lit(fact::TOTAL_LABEL)))
            .filter(col(fact::FLOW).eq(lit(flow.as_str())));
        let df = year_filter(months, years)
            .group_by([col(fact::YEAR), col(fact::MONTH)])
            .agg([col(fact::USD).sum()])
            .join(
                month_order_frame()?.lazy(),
                [col(fact::MONTH)],
                [col(fact::MONTH)],
                JoinArgs::new(JoinType::Inner),
            )
            .sort(vec![fact::YEAR, kpi::MONTH_NUM], SortMultipleOptions::default())
            .collect()?;

        let years = df.column(fact::YEAR)?.i32()?;
        let month_nums = df.column(kpi::MONTH_NUM)?.i32()?;
        let usd = df.column(fact::USD)?.f64()?;
        let totals = (0..df.height())
            .filter_map(|i| {
                Some(MonthlyTotal {
                    year: years.get(i)?,
                    month: MonthLabel::from_number(month_nums.get(i)? as u32)?,
                    usd: usd.get(i).unwrap_or(0.0),
                })
            })
            .collect();
        Ok(totals)
    }

    /// Export, import and balance per year, from month facts.
    pub fn yearly_totals(&self, granularity: Granularity) -> Result<Vec<YearlyTotal>> {
        let Some(facts) = self.store.read_table(granularity.fact_table())? else {
            return Ok(Vec::new());
        };
        require_columns(&facts, &[fact::YEAR, fact::MONTH, fact::FLOW, fact::USD])?;

        let flow_sum = |flow: Flow| {
            col(fact::USD)
                .filter(col(fact::FLOW).eq(lit(flow.as_str())))
                .sum()
                .alias(flow_column(flow))
        };
        let df = facts
            .lazy()
            .filter(col(fact::MONTH).neq(lit(fact::TOTAL_LABEL)))
            .group_by([col(fact::YEAR)])
            .agg([flow_sum(Flow::Export), flow_sum(Flow::Import)])
            .sort(vec![fact::YEAR], SortMultipleOptions::default())
            .collect()?;

        let years = df.column(fact::YEAR)?.i32()?;
        let exports = df.column(kpi::EXPORT)?.f64()?;
        let imports = df.column(kpi::IMPORT)?.f64()?;
        let totals = (0..df.height())
            .filter_map(|i| {
                let export = exports.get(i).unwrap_or(0.0);
                let import = imports.get(i).unwrap_or(0.0);
                Some(YearlyTotal {
                    year: years.get(i)?,
                    export,
                    import,
                    balance: export - import,
                })
            })
            .collect();
        Ok(totals)
    }
}

/// A value plus the time it was loaded. The caller decides how old is too old.
#[derive(Debug, Clone)]
pub struct Memoized<T> {
    entry: Option<(T, DateTime<Utc>)>,
}

impl<T> Default for Memoized<T> {
    fn default() -> Self {
        Self { entry: None }
    }
}

impl<T> Memoized<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value if younger than `max_age`, otherwise the result of `load`.
    /// A failed load leaves the memo empty.
    pub fn get_or_refresh<F>(&mut self, max_age: TimeDelta, now: DateTime<Utc>, load: F) -> Result<&T>
    where
        F: FnOnce() -> Result<T>,
    {
        match self.entry.take() {
            Some((value, loaded)) if now - loaded <= max_age => {
                Ok(&self.entry.insert((value, loaded)).0)
            }
            _ => {
                let value = load()?;
                Ok(&self.entry.insert((value, now)).0)
            }
        }
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::facts::{facts_to_frame, FactRecord};
    use crate::metrics::{derive_kpis, kpis_to_frame, MetricsConfig};
    use crate::store::MemoryStore;

    fn national_facts() -> Vec<FactRecord> {
        let mut facts = Vec::new();
        for year in [2023, 2024] {
            for (i, month) in MonthLabel::ALL.iter().take(3).enumerate() {
                let base = (year - 2022) as f64 * 100.0 + i as f64 * 10.0;
                facts.push(FactRecord::month(year, *month, Flow::Export, None, base));
                facts.push(FactRecord::month(year, *month, Flow::Import, None, base / 2.0));
            }
            facts.push(FactRecord::total(year, Flow::Export, None, 0.0, None));
        }
        facts
    }

    fn category_facts() -> Vec<FactRecord> {
        let mut facts = Vec::new();
        // 2023 ranks B first; the latest year must win.
        for (cat, usd) in [("A", 10.0), ("B", 9_000.0), ("C", 20.0)] {
            facts.push(FactRecord::month(2023, MonthLabel::Enero, Flow::Export, Some(cat.into()), usd));
        }
        for (cat, usd) in [("A", 500.0), ("B", 300.0), ("C", 800.0)] {
            facts.push(FactRecord::month(2024, MonthLabel::Enero, Flow::Export, Some(cat.into()), usd / 2.0));
            facts.push(FactRecord::month(2024, MonthLabel::Febrero, Flow::Export, Some(cat.into()), usd / 2.0));
            facts.push(FactRecord::month(2024, MonthLabel::Enero, Flow::Import, Some(cat.into()), 1.0));
        }
        facts
    }

    fn store_with_facts() -> MemoryStore {
        let mut store = MemoryStore::new();
        store
            .write_table(tables::TRADE, &mut facts_to_frame(&national_facts(), Granularity::National).unwrap())
            .unwrap();
        store
            .write_table(
                tables::TRADE_PROD,
                &mut facts_to_frame(&category_facts(), Granularity::Category).unwrap(),
            )
            .unwrap();
        store
    }

    fn add_kpis(store: &mut MemoryStore, granularity: Granularity) {
        let facts = store.read_table(granularity.fact_table()).unwrap().unwrap();
        let kpis = derive_kpis(&facts, granularity, &MetricsConfig::default()).unwrap();
        store
            .write_table(granularity.kpi_table(), &mut kpis_to_frame(&kpis.records, granularity).unwrap())
            .unwrap();
    }

    fn names(df: &DataFrame) -> Vec<String> {
        df.get_column_names().iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn empty_store_has_no_views() {
        let store = MemoryStore::new();
        let facade = QueryFacade::new(&store);
        assert_eq!(facade.capabilities().unwrap(), Capabilities::default());
        assert!(facade.national_view(&TradeQuery::new()).unwrap().is_none());
        assert!(facade.category_view(&TradeQuery::new()).unwrap().is_none());
        assert!(facade.top_categories(3, Flow::Export, None).unwrap().is_empty());
        assert!(facade.monthly_totals(Flow::Export, None).unwrap().is_empty());
    }

    #[test]
    fn falls_back_to_fact_pivot_without_kpis() {
        let store = store_with_facts();
        let facade = QueryFacade::new(&store);
        let caps = facade.capabilities().unwrap();
        assert!(caps.has_facts && caps.has_category_facts);
        assert!(!caps.has_kpi);

        let view = facade.national_view(&TradeQuery::new()).unwrap().unwrap();
        assert!(!view.has_kpi);
        assert_eq!(view.frame.height(), 6);
        let cols = names(&view.frame);
        assert!(cols.contains(&kpi::BALANCE.to_string()));
        assert!(!cols.contains(&kpi::EXPORT_MOM_PCT.to_string()));
    }

    #[test]
    fn kpi_view_filters_years_and_flows() {
        let mut store = store_with_facts();
        add_kpis(&mut store, Granularity::National);
        let facade = QueryFacade::new(&store);

        let query = TradeQuery::new().years(2024, 2024).flows(FlowSelection::Export);
        let view = facade.national_view(&query).unwrap().unwrap();
        assert!(view.has_kpi);
        assert_eq!(view.frame.height(), 3);

        let cols = names(&view.frame);
        assert!(cols.contains(&kpi::EXPORT_YOY_PCT.to_string()));
        assert!(cols.iter().all(|c| !c.starts_with("import") && !c.starts_with("balance")));

        let months: Vec<i32> = view
            .frame
            .column(kpi::MONTH_NUM)
            .unwrap()
            .i32()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(months, vec![1, 2, 3]);
    }

    #[test]
    fn top_categories_use_latest_year() {
        let store = store_with_facts();
        let facade = QueryFacade::new(&store);

        let top = facade.top_categories(2, Flow::Export, None).unwrap();
        let order: Vec<_> = top.iter().map(|t| t.category.as_str()).collect();
        assert_eq!(order, vec!["C", "A"]);
        assert_eq!(top[0].usd, 800.0);

        let older = facade.top_categories(1, Flow::Export, Some(2023)).unwrap();
        assert_eq!(older[0].category, "B");

        // All imports tie at 1.0: name order decides.
        let imports = facade.top_categories(3, Flow::Import, None).unwrap();
        let order: Vec<_> = imports.iter().map(|t| t.category.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn category_view_applies_selection() {
        let mut store = store_with_facts();
        add_kpis(&mut store, Granularity::Category);
        let facade = QueryFacade::new(&store);

        let top = TradeQuery::new().categories(CategorySelection::TopN { n: 1, flow: Flow::Export });
        let view = facade.category_view(&top).unwrap().unwrap();
        assert!(view.has_kpi);
        let cats: Vec<&str> = view
            .frame
            .column(fact::CATEGORY)
            .unwrap()
            .str()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert!(cats.iter().all(|c| *c == "C"));
        assert_eq!(cats.len(), 3);

        let named = TradeQuery::new()
            .categories(CategorySelection::Named(vec!["A".into(), "B".into()]))
            .flows(FlowSelection::Import);
        let view = facade.category_view(&named).unwrap().unwrap();
        assert_eq!(view.frame.height(), 6);
        assert!(view.frame.column(kpi::COVERAGE_RATIO).is_err());
        assert!(view.frame.column(kpi::IMPORT_IDX).is_ok());
    }

    #[test]
    fn monthly_and_yearly_totals() {
        let store = store_with_facts();
        let facade = QueryFacade::new(&store);

        let monthly = facade.monthly_totals(Flow::Export, Some((2024, 2024))).unwrap();
        assert_eq!(monthly.len(), 3);
        assert_eq!(monthly[0].month, MonthLabel::Enero);
        assert_eq!(monthly[2].usd, 220.0);

        let yearly = facade.yearly_totals(Granularity::National).unwrap();
        assert_eq!(yearly.len(), 2);
        assert_eq!(yearly[0].year, 2023);
        assert_eq!(yearly[0].export, 330.0);
        assert_eq!(yearly[0].balance, 165.0);
    }

    #[test]
    fn memo_reloads_only_when_stale() {
        let calls = Cell::new(0);
        let load = |v: i32| {
            let calls = &calls;
            move || -> Result<i32> {
                calls.set(calls.get() + 1);
                Ok(v)
            }
        };
        let mut memo = Memoized::new();
        let start = Utc::now();
        let max_age = TimeDelta::minutes(5);

        assert_eq!(*memo.get_or_refresh(max_age, start, load(1)).unwrap(), 1);
        let later = start + TimeDelta::minutes(4);
        assert_eq!(*memo.get_or_refresh(max_age, later, load(2)).unwrap(), 1);
        assert_eq!(calls.get(), 1);

        let stale = start + TimeDelta::minutes(6);
        assert_eq!(*memo.get_or_refresh(max_age, stale, load(3)).unwrap(), 3);
        assert_eq!(calls.get(), 2);

        memo.invalidate();
        assert_eq!(*memo.get_or_refresh(max_age, stale, load(4)).unwrap(), 4);
        assert_eq!(calls.get(), 3);
    }
}
