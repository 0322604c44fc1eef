//! Drives extract, transform and load for each selected KPI.
//!
//! KPIs run one after another and independently: an extraction or load
//! error aborts that KPI only, is recorded in the [`RunSummary`], and the
//! next KPI still runs.

use crate::error::Result;
use crate::extract::{ExtractionQuery, Extractor, RecordSource};
use crate::load::{LoadOptions, LoadScope, Loader, ReconciliationReport};
use crate::rules::KpiRules;
use crate::schema::{DestinationTable, KpiType, ReportingWindow};
use crate::session::Session;
use crate::transform::Transformer;
use chrono::NaiveDateTime;
use log::{error, info};
use serde::Serialize;
use std::fmt;

/// Which destination tables a run refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KpiSelection {
    pub receita: bool,
    pub folha: bool,
    pub financeiro: bool,
}

impl KpiSelection {
    pub fn all() -> Self {
        Self {
            receita: true,
            folha: true,
            financeiro: true,
        }
    }

    /// Builds a selection from `--only-*` flags. No flag set means everything.
    pub fn from_flags(only_receita: bool, only_folha: bool, only_financeiro: bool) -> Self {
        if !(only_receita || only_folha || only_financeiro) {
            return Self::all();
        }
        Self {
            receita: only_receita,
            folha: only_folha,
            financeiro: only_financeiro,
        }
    }

    /// KPIs in run order.
    pub fn kpis(&self) -> Vec<KpiType> {
        let mut kpis = Vec::new();
        if self.receita {
            kpis.extend([KpiType::Revenue, KpiType::Commission]);
        }
        if self.folha {
            kpis.push(KpiType::Payroll);
        }
        if self.financeiro {
            kpis.push(KpiType::Financial);
        }
        kpis
    }
}

impl Default for KpiSelection {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub window: ReportingWindow,
    pub entity: Option<String>,
    pub selection: KpiSelection,
    pub force_historical: bool,
    pub rules: KpiRules,
}

impl PipelineConfig {
    pub fn new(window: ReportingWindow) -> Self {
        Self {
            window,
            entity: None,
            selection: KpiSelection::all(),
            force_historical: false,
            rules: KpiRules::default(),
        }
    }

    pub fn query(&self) -> ExtractionQuery {
        let query = ExtractionQuery::new(self.window);
        match &self.entity {
            Some(entity) => query.for_entity(entity),
            None => query,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KpiOutcome {
    pub kpi: KpiType,
    pub table: DestinationTable,
    pub report: Option<ReconciliationReport>,
    pub error: Option<String>,
}

impl KpiOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub window: ReportingWindow,
    pub entity: Option<String>,
    pub outcomes: Vec<KpiOutcome>,
}

impl RunSummary {
    /// True when no KPI aborted. Rows rejected by validation do not count
    /// against the run; they are listed in the reports.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(KpiOutcome::succeeded)
    }

    pub fn failed_kpis(&self) -> Vec<KpiType> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.kpi)
            .collect()
    }

    pub fn report_for(&self, kpi: KpiType) -> Option<&ReconciliationReport> {
        self.outcomes
            .iter()
            .find(|o| o.kpi == kpi)
            .and_then(|o| o.report.as_ref())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "KPI run {}..={} ({})",
            self.window
                .start_month()
                .map(|m| m.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            self.window.current_month,
            self.entity.as_deref().unwrap_or("all entities")
        )?;

        for outcome in &self.outcomes {
            if let Some(err) = &outcome.error {
                writeln!(f, "  {:<10} FAILED: {}", outcome.kpi, err)?;
            } else if let Some(report) = &outcome.report {
                writeln!(f, "  {:<10} {}", outcome.kpi, report)?;
                for failure in &report.failures {
                    writeln!(f, "      rejected {}: {}", failure.key, failure.reason)?;
                }
            }
        }

        write!(
            f,
            "{}",
            if self.is_success() { "OK" } else { "FAILED" }
        )
    }
}

pub struct KpiPipeline<'a> {
    config: &'a PipelineConfig,
    extractor: &'a dyn Extractor,
}

impl<'a> KpiPipeline<'a> {
    pub fn new(config: &'a PipelineConfig, extractor: &'a dyn Extractor) -> Self {
        Self { config, extractor }
    }

    pub fn run(&self, session: &mut Session, loaded_at: NaiveDateTime) -> RunSummary {
        let options =
            LoadOptions::new(loaded_at).forcing_historical(self.config.force_historical);

        info!(
            "Starting run: window {} months back from {}, KPIs {:?}",
            self.config.window.months_back,
            self.config.window.current_month,
            self.config.selection.kpis()
        );

        let outcomes = self
            .config
            .selection
            .kpis()
            .into_iter()
            .map(|kpi| {
                let table = DestinationTable::for_kpi(kpi);
                match self.run_kpi(session, kpi, &options) {
                    Ok(report) => KpiOutcome {
                        kpi,
                        table,
                        report: Some(report),
                        error: None,
                    },
                    Err(err) => {
                        error!("{} aborted: {}", kpi, err);
                        KpiOutcome {
                            kpi,
                            table,
                            report: None,
                            error: Some(err.to_string()),
                        }
                    }
                }
            })
            .collect();

        RunSummary {
            window: self.config.window,
            entity: self.config.entity.clone(),
            outcomes,
        }
    }

    /// One KPI end to end, committed in its own transaction. The load is
    /// scoped to this KPI, the configured window and entity filter.
    pub fn run_kpi(
        &self,
        session: &mut Session,
        kpi: KpiType,
        options: &LoadOptions,
    ) -> Result<ReconciliationReport> {
        let query = self.config.query();
        let transformer = Transformer::new(&self.config.rules, self.config.window);

        let aggregates = match kpi {
            KpiType::Financial => {
                let revenue = self.extractor.extract(RecordSource::Revenue, &query)?;
                let payroll = self.extractor.extract(RecordSource::Payroll, &query)?;
                transformer.consolidate(&revenue, &payroll)?
            }
            _ => {
                let mut rows = Vec::new();
                for source in RecordSource::for_kpi(kpi) {
                    rows.extend(self.extractor.extract(*source, &query)?);
                }
                transformer.transform(kpi, &rows)?
            }
        };

        let scope =
            LoadScope::new(kpi, self.config.window).for_entity(self.config.entity.as_deref());

        Loader::new(session, &self.config.rules).load(
            &aggregates,
            DestinationTable::for_kpi(kpi),
            &options.clone().scoped(scope),
        )
    }
}
