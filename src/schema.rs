/// Column- and table-name constants.
/// Single source of truth for every frame the pipeline writes or reads.

// ── Persisted tables ────────────────────────────────────────────────────────
pub mod tables {
    pub const TRADE: &str = "trade";
    pub const TRADE_PROD: &str = "trade_prod";
    pub const KPI_MONTHLY: &str = "kpi_monthly";
    pub const KPI_PROD_MONTHLY: &str = "kpi_prod_monthly";
}

// ── Long-form fact columns ──────────────────────────────────────────────────
pub mod fact {
    pub const YEAR: &str = "year";
    pub const MONTH: &str = "month";
    pub const FLOW: &str = "flow";
    pub const CATEGORY: &str = "category";
    pub const USD: &str = "usd";

    /// Month label used for the reported annual figure.
    pub const TOTAL_LABEL: &str = "Total";
}

// ── Flow values ─────────────────────────────────────────────────────────────
pub mod flow {
    pub const EXPORT: &str = "export";
    pub const IMPORT: &str = "import";
}

// ── Wide KPI columns ────────────────────────────────────────────────────────
pub mod kpi {
    pub const MONTH_NUM: &str = "month_num";
    pub const EXPORT: &str = "export";
    pub const IMPORT: &str = "import";
    pub const BALANCE: &str = "balance";

    pub const EXPORT_MOM_PCT: &str = "export_mom_pct";
    pub const EXPORT_YOY_PCT: &str = "export_yoy_pct";
    pub const IMPORT_MOM_PCT: &str = "import_mom_pct";
    pub const IMPORT_YOY_PCT: &str = "import_yoy_pct";

    pub const EXPORT_MA3: &str = "export_ma3";
    pub const IMPORT_MA3: &str = "import_ma3";
    pub const BALANCE_MA3: &str = "balance_ma3";

    pub const EXPORT_IDX: &str = "export_idx";
    pub const IMPORT_IDX: &str = "import_idx";

    pub const COVERAGE_RATIO: &str = "coverage_ratio";
}
