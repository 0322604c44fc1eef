//! Reconciles monthly aggregates into the destination tables.
//!
//! Per natural key the decision is:
//!
//! - no stored row: insert it, whatever the provenance;
//! - stored row is `current`: overwrite it and bump `updated_at`;
//! - stored row is `historical`: leave it alone unless the load is forced.
//!
//! For `receita_comissao` the decision is taken once per aggregate, and
//! category rows the aggregate no longer carries are removed along with the
//! overwrite. Every call runs in a single transaction.
//!
//! A scoped load also retires `current` groups inside its window and entity
//! filter that this call did not produce: their source rows are gone, so the
//! stored rows no longer describe anything.

use crate::error::{KpiError, Result};
use crate::key::{normalize_entity, NaturalKey};
use crate::rules::KpiRules;
use crate::schema::{DestinationTable, KpiType, MonthlyAggregate, Provenance, ReportingWindow};
use crate::session::Session;
use crate::store;
use crate::transform::COMMISSION_BONUS_PART;
use chrono::NaiveDateTime;
use log::{debug, info, warn};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// Rewrite rows already marked historical. One-time backfills only.
    pub force_historical: bool,
    /// Stamped into `created_at`/`updated_at` of every row this call writes.
    pub loaded_at: NaiveDateTime,
    /// What the aggregates were computed from. Unscoped loads never retire rows.
    pub scope: Option<LoadScope>,
}

/// The slice of a table a load call is authoritative for.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadScope {
    pub kpi: KpiType,
    pub window: ReportingWindow,
    pub entity: Option<String>,
}

impl LoadScope {
    pub fn new(kpi: KpiType, window: ReportingWindow) -> Self {
        Self {
            kpi,
            window,
            entity: None,
        }
    }

    pub fn for_entity(mut self, entity: Option<&str>) -> Self {
        self.entity = entity.map(normalize_entity);
        self
    }
}

impl LoadOptions {
    pub fn new(loaded_at: NaiveDateTime) -> Self {
        Self {
            force_historical: false,
            loaded_at,
            scope: None,
        }
    }

    pub fn now() -> Self {
        Self::new(chrono::Local::now().naive_local())
    }

    pub fn forcing_historical(mut self, force: bool) -> Self {
        self.force_historical = force;
        self
    }

    pub fn scoped(mut self, scope: LoadScope) -> Self {
        self.scope = Some(scope);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowFailure {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub table: DestinationTable,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub removed: usize,
    pub failures: Vec<RowFailure>,
}

impl ReconciliationReport {
    pub fn new(table: DestinationTable) -> Self {
        Self {
            table,
            inserted: 0,
            updated: 0,
            skipped: 0,
            removed: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} inserted, {} updated, {} skipped, {} removed, {} failed",
            self.table,
            self.inserted,
            self.updated,
            self.skipped,
            self.removed,
            self.failures.len()
        )
    }
}

// One destination row ready to be written
struct PreparedRow {
    key: NaturalKey,
    amount: Decimal,
    basis: Option<Decimal>,
    net_amount: Option<Decimal>,
    breakdown: BTreeMap<String, Decimal>,
}

pub struct Loader<'a> {
    session: &'a mut Session,
    rules: &'a KpiRules,
}

impl<'a> Loader<'a> {
    pub fn new(session: &'a mut Session, rules: &'a KpiRules) -> Self {
        Self { session, rules }
    }

    /// Reconciles `aggregates` into `table` and commits.
    ///
    /// Aggregates failing validation are reported and skipped; the rest of
    /// the batch still loads. A database error rolls the whole call back and
    /// is returned as [`KpiError::Load`].
    ///
    /// With a [`LoadScope`], `current` groups in scope that no valid aggregate
    /// covered are deleted in the same transaction and counted as removed.
    pub fn load(
        &mut self,
        aggregates: &[MonthlyAggregate],
        table: DestinationTable,
        options: &LoadOptions,
    ) -> Result<ReconciliationReport> {
        self.session.ensure_destination(table)?;

        let rules = self.rules;
        let mut report = ReconciliationReport::new(table);
        let mut produced = HashSet::new();

        let tx = self
            .session
            .connection_mut()
            .transaction()
            .map_err(|e| KpiError::load(table.table_name(), e))?;

        for aggregate in aggregates {
            if let Err(err) = validate(aggregate, table, rules) {
                let (key, reason) = match err {
                    KpiError::Validation { key, details } => (key, details),
                    other => (aggregate.key().to_string(), other.to_string()),
                };
                warn!("Rejected {}: {}", key, reason);
                report.failures.push(RowFailure { key, reason });
                continue;
            }

            reconcile(&tx, table, aggregate, options, &mut report).map_err(|e| match e {
                KpiError::Load { .. } => e,
                other => KpiError::load(table.table_name(), other),
            })?;

            let group = aggregate.key();
            produced.insert((group.entity_id, group.reference_month.to_string()));
        }

        if let Some(scope) = &options.scope {
            retire_stale(&tx, table, scope, &produced, &mut report).map_err(|e| match e {
                KpiError::Load { .. } => e,
                other => KpiError::load(table.table_name(), other),
            })?;
        }

        tx.commit()
            .map_err(|e| KpiError::load(table.table_name(), e))?;

        info!("{}", report);
        Ok(report)
    }
}

/// Checks an aggregate against the table it is about to be written to.
pub fn validate(aggregate: &MonthlyAggregate, table: DestinationTable, rules: &KpiRules) -> Result<()> {
    let key = aggregate.key().to_string();
    let fail = |details: String| KpiError::Validation {
        key: key.clone(),
        details,
    };

    if aggregate.entity_id.trim().is_empty() {
        return Err(fail("empty entity id".to_string()));
    }

    if !table.accepts(aggregate.kpi_type) {
        return Err(fail(format!(
            "{} aggregates do not belong in {}",
            aggregate.kpi_type, table
        )));
    }

    if aggregate.amount_breakdown.is_empty() {
        return Err(fail("aggregate carries no amounts".to_string()));
    }

    if !rules.allows_negative(aggregate.kpi_type) {
        if let Some((category, amount)) = aggregate
            .amount_breakdown
            .iter()
            .find(|(_, amount)| amount.is_sign_negative() && !amount.is_zero())
        {
            return Err(fail(format!(
                "negative amount {} in '{}' is not allowed for {}",
                amount, category, aggregate.kpi_type
            )));
        }
    }

    Ok(())
}

fn prepare_rows(table: DestinationTable, aggregate: &MonthlyAggregate) -> Vec<PreparedRow> {
    if table.uses_source() {
        return aggregate
            .amount_breakdown
            .iter()
            .map(|(category, amount)| PreparedRow {
                key: NaturalKey::for_row(
                    table,
                    &aggregate.entity_id,
                    aggregate.reference_month,
                    aggregate.kpi_type,
                    Some(category.as_str()),
                ),
                amount: *amount,
                basis: aggregate.basis_breakdown.get(category).copied(),
                net_amount: aggregate.net_breakdown.get(category).copied(),
                breakdown: match &aggregate.attainment {
                    Some(attainment) if category == COMMISSION_BONUS_PART => attainment.as_breakdown(),
                    _ => BTreeMap::new(),
                },
            })
            .collect();
    }

    let sum_of = |parts: &BTreeMap<String, Decimal>| {
        (!parts.is_empty()).then(|| parts.values().copied().sum::<Decimal>())
    };

    vec![PreparedRow {
        key: NaturalKey::for_row(
            table,
            &aggregate.entity_id,
            aggregate.reference_month,
            aggregate.kpi_type,
            None,
        ),
        amount: aggregate.total(),
        basis: sum_of(&aggregate.basis_breakdown),
        net_amount: sum_of(&aggregate.net_breakdown),
        breakdown: aggregate.amount_breakdown.clone(),
    }]
}

fn reconcile(
    conn: &Connection,
    table: DestinationTable,
    aggregate: &MonthlyAggregate,
    options: &LoadOptions,
    report: &mut ReconciliationReport,
) -> Result<()> {
    let group = aggregate.key();
    let rows = prepare_rows(table, aggregate);
    let stored = store::group_state(conn, table, &group)?;

    let frozen = stored
        .iter()
        .any(|(_, provenance)| *provenance == Provenance::Historical);

    if frozen && !options.force_historical {
        debug!("{} is historical, skipping {} rows", group, rows.len());
        report.skipped += rows.len();
        return Ok(());
    }
    if frozen {
        warn!("Rewriting historical {} (forced)", group);
    }

    let stored_sources: HashSet<&str> = stored.iter().map(|(source, _)| source.as_str()).collect();
    let mut kept_sources = HashSet::new();

    for row in &rows {
        kept_sources.insert(row.key.source_column().to_string());

        if stored_sources.contains(row.key.source_column()) {
            update_row(conn, table, aggregate, row, options)?;
            report.updated += 1;
        } else {
            insert_row(conn, table, aggregate, row, options)?;
            report.inserted += 1;
        }
    }

    for source in stored_sources {
        if kept_sources.contains(source) {
            continue;
        }
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE entity_id = ?1 AND reference_month = ?2 \
                 AND kpi_type = ?3 AND source = ?4",
                table.qualified_name()
            ),
            params![
                group.entity_id,
                group.reference_month.to_string(),
                group.kpi_type.as_str(),
                source
            ],
        )?;
        debug!("{}: removed stale category '{}'", group, source);
        report.removed += 1;
    }

    Ok(())
}

// Deletes in-scope current groups missing from `produced`
fn retire_stale(
    conn: &Connection,
    table: DestinationTable,
    scope: &LoadScope,
    produced: &HashSet<(String, String)>,
    report: &mut ReconciliationReport,
) -> Result<()> {
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT entity_id, reference_month FROM {} \
         WHERE kpi_type = ?1 AND provenance = ?2 AND reference_month BETWEEN ?3 AND ?4 \
         AND (?5 IS NULL OR entity_id = ?5) \
         ORDER BY entity_id, reference_month",
        table.qualified_name()
    ))?;

    let groups = stmt
        .query_map(
            params![
                scope.kpi.as_str(),
                Provenance::Current.as_str(),
                scope.window.start_month()?.to_string(),
                scope.window.current_month.to_string(),
                scope.entity
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for group in groups {
        if produced.contains(&group) {
            continue;
        }
        let (entity_id, month) = group;
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE entity_id = ?1 AND reference_month = ?2 \
                 AND kpi_type = ?3 AND provenance = ?4",
                table.qualified_name()
            ),
            params![entity_id, month, scope.kpi.as_str(), Provenance::Current.as_str()],
        )?;
        warn!(
            "{}/{}/{}: no source rows left, removed {} current rows",
            entity_id, month, scope.kpi, removed
        );
        report.removed += removed;
    }

    Ok(())
}

fn insert_row(
    conn: &Connection,
    table: DestinationTable,
    aggregate: &MonthlyAggregate,
    row: &PreparedRow,
    options: &LoadOptions,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (entity_id, entity_name, reference_month, mes, kpi_type, source,
                 amount, basis, net_amount, breakdown, provenance, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            table.qualified_name()
        ),
        params![
            row.key.entity_id,
            aggregate.entity_name,
            row.key.reference_month.to_string(),
            row.key.reference_month.first_day()?,
            row.key.kpi_type.as_str(),
            row.key.source_column(),
            row.amount.to_string(),
            row.basis.map(|v| v.to_string()),
            row.net_amount.map(|v| v.to_string()),
            serde_json::to_string(&row.breakdown)?,
            aggregate.source_provenance.as_str(),
            options.loaded_at,
        ],
    )?;
    debug!("Inserted {}", row.key);
    Ok(())
}

fn update_row(
    conn: &Connection,
    table: DestinationTable,
    aggregate: &MonthlyAggregate,
    row: &PreparedRow,
    options: &LoadOptions,
) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {} SET entity_name = COALESCE(?5, entity_name), amount = ?6, basis = ?7,
                 net_amount = ?8, breakdown = ?9, provenance = ?10, updated_at = ?11
             WHERE entity_id = ?1 AND reference_month = ?2 AND kpi_type = ?3 AND source = ?4",
            table.qualified_name()
        ),
        params![
            row.key.entity_id,
            row.key.reference_month.to_string(),
            row.key.kpi_type.as_str(),
            row.key.source_column(),
            aggregate.entity_name,
            row.amount.to_string(),
            row.basis.map(|v| v.to_string()),
            row.net_amount.map(|v| v.to_string()),
            serde_json::to_string(&row.breakdown)?,
            aggregate.source_provenance.as_str(),
            options.loaded_at,
        ],
    )?;
    debug!("Updated {}", row.key);
    Ok(())
}

/// Convenience wrapper over [`Loader::load`].
pub fn load(
    session: &mut Session,
    rules: &KpiRules,
    aggregates: &[MonthlyAggregate],
    table: DestinationTable,
    options: &LoadOptions,
) -> Result<ReconciliationReport> {
    Loader::new(session, rules).load(aggregates, table, options)
}
