use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use log::{error, info, LevelFilter};
use monthly_kpi_reconciler::{
    parse_reference_month, run_pipeline, today_month, CsvExtractor, Extractor, KpiRules,
    KpiSelection, LoadOptions, PipelineConfig, ReportingWindow, Session, SqliteExtractor,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "kpi-etl")]
#[command(about = "Refreshes the monthly KPI tables (receita/comissao, folha, financeiro)", long_about = None)]
struct Cli {
    /// Only this entity; all entities when omitted
    #[arg(long = "employee", visible_alias = "farmer-id", value_name = "ID")]
    employee: Option<String>,

    /// Months before the reference month to include
    #[arg(long, default_value_t = 11)]
    months_back: u32,

    /// Month treated as current (defaults to today's month)
    #[arg(long, value_name = "YYYY-MM")]
    reference_month: Option<String>,

    #[arg(long, value_enum, ignore_case = true, default_value = "info")]
    log_level: LogLevel,

    #[arg(long)]
    only_receita: bool,

    #[arg(long)]
    only_folha: bool,

    #[arg(long)]
    only_financeiro: bool,

    /// Rewrite rows of closed months. One-time backfills only
    #[arg(long)]
    force_historical: bool,

    #[arg(long, env = "KPI_SOURCE_DB", value_name = "PATH")]
    source_db: Option<PathBuf>,

    #[arg(long, env = "KPI_DESTINATION_DB", value_name = "PATH", default_value = "analysis.db")]
    destination_db: PathBuf,

    /// Read revenue.csv and payroll.csv from this directory instead of --source-db
    #[arg(long, value_name = "DIR")]
    source_csv_dir: Option<PathBuf>,

    /// JSON rules file; built-in rules when omitted
    #[arg(long, value_name = "PATH")]
    rules: Option<PathBuf>,

    /// Print the JSON schema of the rules file and exit
    #[arg(long)]
    print_rules_schema: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Error | LogLevel::Critical => LevelFilter::Error,
        }
    }
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.into())
        .format_timestamp_secs()
        .init();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!("{:#}", err);
            eprintln!("error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<bool> {
    if cli.print_rules_schema {
        println!("{}", KpiRules::schema_as_json()?);
        return Ok(true);
    }

    let rules = match &cli.rules {
        Some(path) => KpiRules::from_json_file(path)
            .with_context(|| format!("loading rules from {}", path.display()))?,
        None => KpiRules::default(),
    };

    let current_month = match &cli.reference_month {
        Some(text) => parse_reference_month(text)?,
        None => today_month(),
    };

    let mut config = PipelineConfig::new(ReportingWindow::new(current_month, cli.months_back));
    config.entity = cli.employee.clone();
    config.selection =
        KpiSelection::from_flags(cli.only_receita, cli.only_folha, cli.only_financeiro);
    config.force_historical = cli.force_historical;
    config.rules = rules;

    let (extractor, mut session): (Box<dyn Extractor>, Session) =
        match (&cli.source_csv_dir, &cli.source_db) {
            (Some(dir), _) => (
                Box::new(CsvExtractor::new(dir)) as Box<dyn Extractor>,
                Session::open_destination(&cli.destination_db)?,
            ),
            (None, Some(db)) => (
                Box::new(
                    SqliteExtractor::open(db)
                        .with_context(|| format!("opening source {}", db.display()))?,
                ) as Box<dyn Extractor>,
                Session::open(db, &cli.destination_db)?,
            ),
            (None, None) => {
                bail!("no source: pass --source-db (or set KPI_SOURCE_DB) or --source-csv-dir")
            }
        };

    if config.force_historical {
        info!("Historical rows will be rewritten for this run");
    }

    let summary = run_pipeline(
        &config,
        extractor.as_ref(),
        &mut session,
        LoadOptions::now().loaded_at,
    );

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }

    Ok(summary.is_success())
}
