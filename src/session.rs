use crate::error::Result;
use crate::migration;
use crate::schema::{DestinationTable, DESTINATION_SCHEMA};
use log::{debug, info};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the database connection for one run.
///
/// The source database is opened as `main`; the destination database is
/// attached under the `analysis` namespace. Dropping the session closes the
/// connection and rolls back anything left uncommitted.
pub struct Session {
    conn: Connection,
    migrated: HashSet<DestinationTable>,
}

impl Session {
    pub fn open(source_db: impl AsRef<Path>, destination_db: impl AsRef<Path>) -> Result<Self> {
        let source_db = source_db.as_ref();
        let destination_db = destination_db.as_ref();

        let conn = Connection::open(source_db)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        info!(
            "Opened source {} with destination {} attached as '{}'",
            source_db.display(),
            destination_db.display(),
            DESTINATION_SCHEMA
        );

        Self::attach(conn, &destination_db.to_string_lossy())
    }

    /// Destination only, for runs whose raw rows do not come from SQLite.
    pub fn open_destination(destination_db: impl AsRef<Path>) -> Result<Self> {
        let destination_db = destination_db.as_ref();
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        info!(
            "Opened destination {} as '{}'",
            destination_db.display(),
            DESTINATION_SCHEMA
        );

        Self::attach(conn, &destination_db.to_string_lossy())
    }

    /// Source and destination both in memory. Used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::attach(conn, ":memory:")
    }

    fn attach(conn: Connection, destination: &str) -> Result<Self> {
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", DESTINATION_SCHEMA),
            [destination],
        )?;

        Ok(Self {
            conn,
            migrated: HashSet::new(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Runs the create-if-absent migration for `table` once per session.
    pub fn ensure_destination(&mut self, table: DestinationTable) -> Result<()> {
        if self.migrated.contains(&table) {
            debug!("{} already verified in this session", table.qualified_name());
            return Ok(());
        }

        migration::ensure_table(&self.conn, table)?;
        self.migrated.insert(table);
        Ok(())
    }
}
