//! Read side of the destination tables.

use crate::error::{KpiError, Result};
use crate::key::NaturalKey;
use crate::schema::{DestinationRow, DestinationTable, KpiType, Provenance};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;

const ROW_COLUMNS: &str = "entity_id, entity_name, reference_month, kpi_type, source, \
     amount, basis, net_amount, breakdown, provenance, created_at, updated_at";

struct StoredRow {
    entity_id: String,
    entity_name: Option<String>,
    reference_month: String,
    kpi_type: String,
    source: String,
    amount: String,
    basis: Option<String>,
    net_amount: Option<String>,
    breakdown: String,
    provenance: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_id: row.get(0)?,
            entity_name: row.get(1)?,
            reference_month: row.get(2)?,
            kpi_type: row.get(3)?,
            source: row.get(4)?,
            amount: row.get(5)?,
            basis: row.get(6)?,
            net_amount: row.get(7)?,
            breakdown: row.get(8)?,
            provenance: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_destination(self, table: DestinationTable) -> Result<DestinationRow> {
        let source = (!self.source.is_empty()).then_some(self.source.as_str());
        let key = NaturalKey::for_row(
            table,
            &self.entity_id,
            self.reference_month.parse()?,
            self.kpi_type.parse()?,
            source,
        );

        Ok(DestinationRow {
            amount: parse_decimal(&key, &self.amount)?,
            basis: self.basis.as_deref().map(|v| parse_decimal(&key, v)).transpose()?,
            net_amount: self
                .net_amount
                .as_deref()
                .map(|v| parse_decimal(&key, v))
                .transpose()?,
            breakdown: serde_json::from_str(&self.breakdown)?,
            provenance: Provenance::from_str(&self.provenance)?,
            entity_name: self.entity_name,
            created_at: self.created_at,
            updated_at: self.updated_at,
            key,
        })
    }
}

fn parse_decimal(key: &NaturalKey, text: &str) -> Result<Decimal> {
    Decimal::from_str(text).map_err(|e| KpiError::Validation {
        key: key.to_string(),
        details: format!("stored amount '{}' is not a decimal: {}", text, e),
    })
}

/// Source and provenance of every stored row belonging to `group`.
pub(crate) fn group_state(
    conn: &Connection,
    table: DestinationTable,
    group: &NaturalKey,
) -> Result<Vec<(String, Provenance)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT source, provenance FROM {} \
         WHERE entity_id = ?1 AND reference_month = ?2 AND kpi_type = ?3",
        table.qualified_name()
    ))?;

    let rows = stmt
        .query_map(
            params![
                group.entity_id,
                group.reference_month.to_string(),
                group.kpi_type.as_str()
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(source, provenance)| -> Result<(String, Provenance)> {
            Ok((source, provenance.parse()?))
        })
        .collect()
}

/// Every row of `table`, ordered by natural key.
pub fn fetch_rows(conn: &Connection, table: DestinationTable) -> Result<Vec<DestinationRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} ORDER BY entity_id, reference_month, kpi_type, source",
        ROW_COLUMNS,
        table.qualified_name()
    ))?;

    let stored = stmt
        .query_map([], StoredRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    stored
        .into_iter()
        .map(|row| row.into_destination(table))
        .collect()
}

pub fn fetch_row(
    conn: &Connection,
    table: DestinationTable,
    key: &NaturalKey,
) -> Result<Option<DestinationRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} \
         WHERE entity_id = ?1 AND reference_month = ?2 AND kpi_type = ?3 AND source = ?4",
        ROW_COLUMNS,
        table.qualified_name()
    ))?;

    let mut rows = stmt.query_map(
        params![
            key.entity_id,
            key.reference_month.to_string(),
            key.kpi_type.as_str(),
            key.source_column()
        ],
        StoredRow::from_row,
    )?;

    match rows.next() {
        Some(row) => Ok(Some(row?.into_destination(table)?)),
        None => Ok(None),
    }
}

/// Sum of `amount` per (entity, month) for the given KPI.
pub fn monthly_totals(
    conn: &Connection,
    table: DestinationTable,
    kpi: KpiType,
) -> Result<BTreeMap<(String, String), Decimal>> {
    let mut totals = BTreeMap::new();
    for row in fetch_rows(conn, table)? {
        if row.key.kpi_type != kpi {
            continue;
        }
        *totals
            .entry((row.key.entity_id.clone(), row.key.reference_month.to_string()))
            .or_insert(Decimal::ZERO) += row.amount;
    }
    Ok(totals)
}

/// SHA-256 over the content of `table`, timestamps excluded. Two runs that
/// reconciled to the same rows produce the same digest.
pub fn table_digest(conn: &Connection, table: DestinationTable) -> Result<String> {
    let mut hasher = Sha256::new();

    for row in fetch_rows(conn, table)? {
        let line = format!(
            "{}|{}|{}|{}|{}|{}|{}\n",
            row.key,
            row.entity_name.as_deref().unwrap_or(""),
            row.amount,
            row.basis.map(|v| v.to_string()).unwrap_or_default(),
            row.net_amount.map(|v| v.to_string()).unwrap_or_default(),
            serde_json::to_string(&row.breakdown)?,
            row.provenance
        );
        hasher.update(line.as_bytes());
    }

    Ok(format!("{:x}", hasher.finalize()))
}
