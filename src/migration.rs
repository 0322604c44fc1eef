//! Idempotent destination schema setup.
//!
//! Only ever creates what is missing. Existing tables are never dropped or
//! altered.

use crate::error::{KpiError, Result};
use crate::schema::{DestinationTable, DESTINATION_SCHEMA};
use log::info;
use rusqlite::{Connection, OptionalExtension};

/// DDL for one destination table. All three share the same column layout;
/// tables without per-category rows store `''` in `source`.
pub fn create_table_sql(table: DestinationTable) -> String {
    let name = table.table_name();
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {schema}.{name} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            entity_name TEXT,
            reference_month TEXT NOT NULL,
            mes DATE NOT NULL,
            kpi_type TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT '',
            amount TEXT NOT NULL,
            basis TEXT,
            net_amount TEXT,
            breakdown TEXT NOT NULL DEFAULT '{{}}',
            provenance TEXT NOT NULL CHECK (provenance IN ('historical', 'current')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (entity_id, reference_month, kpi_type, source)
        );
        CREATE INDEX IF NOT EXISTS {schema}.idx_{name}_month ON {name} (reference_month);
        "#,
        schema = DESTINATION_SCHEMA,
        name = name,
    )
}

pub fn table_exists(conn: &Connection, table: DestinationTable) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            &format!(
                "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
                DESTINATION_SCHEMA
            ),
            [table.table_name()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn ensure_table(conn: &Connection, table: DestinationTable) -> Result<()> {
    if table_exists(conn, table)? {
        info!("Table {} verified", table.qualified_name());
        return Ok(());
    }

    conn.execute_batch(&create_table_sql(table))
        .map_err(|e| KpiError::load(table.table_name(), e))?;

    info!("Table {} created", table.qualified_name());
    Ok(())
}

pub fn ensure_all(conn: &Connection) -> Result<()> {
    for table in DestinationTable::ALL {
        ensure_table(conn, table)?;
    }
    Ok(())
}
