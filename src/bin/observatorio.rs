//! Observatorio CLI
//!
//! ```bash
//! observatorio etl                      # both granularities
//! observatorio metrics --granularity national
//! observatorio top --n 10 --flow export
//! observatorio capabilities
//! ```
//!
//! Set RUST_LOG=debug for per-sheet logging.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use trade_observatory::query::QueryFacade;
use trade_observatory::reconcile::format_usd;
use trade_observatory::{
    run_etl, run_metrics, FileStore, Flow, Granularity, PipelineConfig, TableStore,
};

#[derive(Parser)]
#[command(name = "observatorio")]
#[command(about = "Monthly trade statistics: workbooks to reconciled facts and KPIs")]
#[command(version)]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, env = "OBSERVATORIO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse source workbooks, reconcile, and replace the fact tables
    Etl {
        #[arg(long, value_enum, default_value = "all")]
        granularity: GranularityArg,
    },
    /// Derive the KPI tables from stored facts
    Metrics {
        #[arg(long, value_enum, default_value = "all")]
        granularity: GranularityArg,
    },
    /// Largest categories by one flow
    Top {
        #[arg(long, default_value_t = 10)]
        n: usize,
        #[arg(long, value_enum)]
        flow: FlowArg,
        /// Year to rank (latest when omitted)
        #[arg(long)]
        year: Option<i32>,
    },
    /// Show which tables the store holds
    Capabilities,
}

#[derive(Clone, Copy, ValueEnum)]
enum GranularityArg {
    National,
    Category,
    All,
}

impl GranularityArg {
    fn expand(self) -> Vec<Granularity> {
        match self {
            GranularityArg::National => vec![Granularity::National],
            GranularityArg::Category => vec![Granularity::Category],
            GranularityArg::All => Granularity::ALL.to_vec(),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FlowArg {
    Export,
    Import,
}

impl From<FlowArg> for Flow {
    fn from(arg: FlowArg) -> Self {
        match arg {
            FlowArg::Export => Flow::Export,
            FlowArg::Import => Flow::Import,
        }
    }
}

fn open_store(config: &PipelineConfig) -> Result<FileStore> {
    let store = FileStore::open(&config.store_dir)
        .with_context(|| format!("opening store {}", config.store_dir.display()))?;
    match &config.mirror_dir {
        Some(dir) => store
            .with_parquet_mirror(dir)
            .with_context(|| format!("opening mirror {}", dir.display())),
        None => Ok(store),
    }
}

fn etl(config: &PipelineConfig, store: &mut impl TableStore, granularity: Granularity) -> Result<()> {
    let outcome = run_etl(config, store, granularity).map_err(|e| {
        println!("✗ etl {granularity}: {e}");
        e
    })?;

    print!("{}", outcome.report);
    for skip in &outcome.skipped {
        println!("  skipped sheet '{}' ({}): {}", skip.sheet, skip.year, skip.reason);
    }
    let span = match (outcome.years.first(), outcome.years.last()) {
        (Some(first), Some(last)) => format!("{first}-{last}"),
        _ => "no years".to_string(),
    };
    let q = &outcome.quality;
    if !q.is_clean() {
        println!(
            "  quality: {} negative values, {} unnamed category facts",
            q.negative_values, q.unnamed_categories
        );
    }
    if granularity.has_category() {
        println!("  {} category rows, {} distinct categories", outcome.category_rows, q.categories);
    }
    println!(
        "✓ etl {granularity}: {} facts, {span}, run {} at {}",
        outcome.fact_rows,
        outcome.run_id,
        outcome.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    Ok(())
}

fn metrics(
    config: &PipelineConfig,
    store: &mut impl TableStore,
    granularity: Granularity,
) -> Result<()> {
    let outcome = run_metrics(config, store, granularity).map_err(|e| {
        println!("✗ metrics {granularity}: {e}");
        e
    })?;

    let years = match outcome.years {
        Some((first, last)) => format!("{first}-{last}"),
        None => "no years".to_string(),
    };
    println!(
        "✓ metrics {granularity}: {} KPI rows, {} series, {years}, run {} at {}",
        outcome.kpi_rows,
        outcome.series,
        outcome.run_id,
        outcome.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if outcome.excluded_groups > 0 {
        println!("  {} groups excluded for major discrepancies", outcome.excluded_groups);
    }
    if !outcome.categories_without_kpis.is_empty() {
        println!(
            "  no KPIs for: {}",
            outcome.categories_without_kpis.join(", ")
        );
    }
    for k in &outcome.recent {
        let fmt = |v: Option<f64>| v.map(format_usd).unwrap_or_else(|| "-".into());
        println!(
            "  {} {:<10} exp {:>16}  imp {:>16}  bal {:>16}",
            k.year,
            k.month.label(),
            fmt(k.export),
            fmt(k.import),
            fmt(k.balance)
        );
    }
    for (rank, t) in outcome.top_categories.iter().enumerate() {
        println!("  {:>3}. {:<40} {:>18}", rank + 1, t.category, format_usd(t.usd));
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let mut store = open_store(&config)?;

    match cli.command {
        Commands::Etl { granularity } => {
            for g in granularity.expand() {
                etl(&config, &mut store, g)?;
            }
        }
        Commands::Metrics { granularity } => {
            for g in granularity.expand() {
                metrics(&config, &mut store, g)?;
            }
        }
        Commands::Top { n, flow, year } => {
            let facade = QueryFacade::new(&store);
            let flow = Flow::from(flow);
            let top = facade.top_categories(n, flow, year)?;
            if top.is_empty() {
                println!("no category data");
            }
            for (rank, t) in top.iter().enumerate() {
                println!("{:>3}. {:<40} {:>18}", rank + 1, t.category, format_usd(t.usd));
            }
        }
        Commands::Capabilities => {
            let caps = QueryFacade::new(&store).capabilities()?;
            let mark = |present: bool| if present { "✓" } else { "✗" };
            println!("{} national facts", mark(caps.has_facts));
            println!("{} category facts", mark(caps.has_category_facts));
            println!("{} national KPIs", mark(caps.has_kpi));
            println!("{} category KPIs", mark(caps.has_category_kpi));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
