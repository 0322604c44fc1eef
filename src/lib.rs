//! # Monthly KPI Reconciler
//!
//! Computes monthly financial KPIs (revenue, commission, payroll and the
//! consolidated financial figure) per entity and month, and reconciles them
//! into destination tables that can be refreshed any number of times over
//! overlapping windows without duplicating, losing or double-counting rows.
//!
//! ## Core Concepts
//!
//! - **Reporting window**: the current month plus the `N` months before it
//! - **Natural key**: entity + month + KPI (+ category where rows are per category)
//! - **Provenance**: closed months are `historical` and frozen once stored;
//!   the open month is `current` and is overwritten on every run
//! - **Reconciliation report**: inserted / updated / skipped / removed counts
//!   plus row-level validation failures
//!
//! ## Example
//!
//! ```rust,ignore
//! use monthly_kpi_reconciler::*;
//!
//! let window = ReportingWindow::new("2024-11".parse()?, 11);
//! let config = PipelineConfig::new(window);
//! let extractor = SqliteExtractor::open("source.db")?;
//! let mut session = Session::open("source.db", "analysis.db")?;
//!
//! let summary = run_pipeline(&config, &extractor, &mut session, LoadOptions::now().loaded_at);
//! println!("{}", summary);
//! ```

pub mod error;
pub mod extract;
pub mod key;
pub mod load;
pub mod migration;
pub mod pipeline;
pub mod rules;
pub mod schema;
pub mod session;
pub mod store;
pub mod transform;
pub mod utils;

pub use error::{KpiError, Result};
pub use extract::{
    CsvExtractor, ExtractionQuery, Extractor, InMemoryExtractor, RecordSource, SqliteExtractor,
};
pub use key::NaturalKey;
pub use load::{load, LoadOptions, LoadScope, Loader, ReconciliationReport, RowFailure};
pub use pipeline::{KpiOutcome, KpiPipeline, KpiSelection, PipelineConfig, RunSummary};
pub use rules::{CommissionPolicy, CommissionTargets, CommissionTier, KpiRules, RevenueTarget};
pub use schema::*;
pub use session::Session;
pub use store::{fetch_row, fetch_rows, table_digest};
pub use transform::{transform, Transformer};
pub use utils::*;

use chrono::NaiveDateTime;

/// Runs every KPI selected in `config` and returns the per-KPI outcome.
pub fn run_pipeline(
    config: &PipelineConfig,
    extractor: &dyn Extractor,
    session: &mut Session,
    loaded_at: NaiveDateTime,
) -> RunSummary {
    KpiPipeline::new(config, extractor).run(session, loaded_at)
}
