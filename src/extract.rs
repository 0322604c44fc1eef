//! Raw record extraction.
//!
//! Every extractor answers the same typed [`ExtractionQuery`]: an optional
//! entity filter plus the reporting window. Filters are bound as query
//! parameters, never spliced into SQL text.

use crate::error::{KpiError, Result};
use crate::key::normalize_entity;
use crate::schema::{KpiType, RawRecord, ReportingWindow};
use chrono::NaiveDate;
use log::{debug, info};
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The raw feed a KPI is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordSource {
    Revenue,
    Payroll,
}

impl RecordSource {
    pub fn table_name(&self) -> &'static str {
        match self {
            RecordSource::Revenue => "revenue_records",
            RecordSource::Payroll => "payroll_records",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            RecordSource::Revenue => "revenue.csv",
            RecordSource::Payroll => "payroll.csv",
        }
    }

    /// Feeds `kpi` is computed from. The financial KPI needs both.
    pub fn for_kpi(kpi: KpiType) -> &'static [RecordSource] {
        match kpi {
            KpiType::Revenue | KpiType::Commission => &[RecordSource::Revenue],
            KpiType::Payroll => &[RecordSource::Payroll],
            KpiType::Financial => &[RecordSource::Revenue, RecordSource::Payroll],
        }
    }
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordSource::Revenue => "revenue",
            RecordSource::Payroll => "payroll",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionQuery {
    pub entity: Option<String>,
    pub window: ReportingWindow,
}

impl ExtractionQuery {
    pub fn new(window: ReportingWindow) -> Self {
        Self {
            entity: None,
            window,
        }
    }

    pub fn for_entity(mut self, entity_id: impl AsRef<str>) -> Self {
        self.entity = Some(normalize_entity(entity_id.as_ref()));
        self
    }

    pub fn date_range(&self) -> Result<(NaiveDate, NaiveDate)> {
        self.window.date_range()
    }

    /// Whether `record` falls inside the window and passes the entity filter.
    pub fn matches(&self, record: &RawRecord) -> bool {
        let entity_ok = match &self.entity {
            Some(entity) => normalize_entity(&record.entity_id) == *entity,
            None => true,
        };
        entity_ok && self.window.contains(record.reference_month())
    }
}

pub trait Extractor {
    fn extract(&self, source: RecordSource, query: &ExtractionQuery) -> Result<Vec<RawRecord>>;
}

/// Reads `revenue_records` / `payroll_records` from a SQLite database.
pub struct SqliteExtractor {
    conn: Connection,
}

impl SqliteExtractor {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| KpiError::extraction(path.display().to_string(), e))?;
        Ok(Self::new(conn))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Creates both source tables if missing.
    pub fn create_source_tables(conn: &Connection) -> Result<()> {
        for source in [RecordSource::Revenue, RecordSource::Payroll] {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_id TEXT NOT NULL,
                    entity_name TEXT,
                    record_date TEXT NOT NULL,
                    amount TEXT NOT NULL,
                    category TEXT NOT NULL
                );",
                source.table_name()
            ))?;
        }
        Ok(())
    }

    pub fn insert_record(conn: &Connection, source: RecordSource, record: &RawRecord) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {} (entity_id, entity_name, record_date, amount, category)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                source.table_name()
            ),
            params![
                record.entity_id,
                record.entity_name,
                record.date,
                record.amount.to_string(),
                record.category
            ],
        )?;
        Ok(())
    }

    fn query(&self, source: RecordSource, query: &ExtractionQuery) -> Result<Vec<RawRecord>> {
        let (start, end) = query.date_range()?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT entity_id, entity_name, record_date, amount, category
             FROM {}
             WHERE date(record_date) BETWEEN ?1 AND ?2
               AND (?3 IS NULL OR trim(entity_id) = ?3)
             ORDER BY entity_id, record_date",
            source.table_name()
        ))?;

        let rows = stmt
            .query_map(params![start, end, query.entity], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Value>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(entity_id, entity_name, date, amount, category)| -> Result<RawRecord> {
                Ok(RawRecord {
                    date: parse_record_date(&date)?,
                    amount: decimal_from_value(amount)?,
                    entity_id,
                    entity_name,
                    category,
                })
            })
            .collect()
    }
}

impl Extractor for SqliteExtractor {
    fn extract(&self, source: RecordSource, query: &ExtractionQuery) -> Result<Vec<RawRecord>> {
        let records = self
            .query(source, query)
            .map_err(|e| KpiError::extraction(source.to_string(), e))?;

        info!(
            "Extracted {} {} rows from {}",
            records.len(),
            source,
            source.table_name()
        );
        Ok(records)
    }
}

// Accepts plain dates and datetimes ("2024-11-04 10:30:00")
fn parse_record_date(text: &str) -> Result<NaiveDate> {
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| KpiError::DateError(format!("Invalid record date '{}': {}", text, e)))
}

fn decimal_from_value(value: Value) -> Result<Decimal> {
    match value {
        Value::Integer(i) => Ok(Decimal::from(i)),
        Value::Real(f) => {
            Decimal::try_from(f).map_err(|e| KpiError::extraction("amount", format!("{}: {}", f, e)))
        }
        Value::Text(text) => Decimal::from_str(text.trim())
            .map_err(|e| KpiError::extraction("amount", format!("'{}': {}", text, e))),
        other => Err(KpiError::extraction(
            "amount",
            format!("unsupported column value {:?}", other),
        )),
    }
}

/// Reads `revenue.csv` / `payroll.csv` from a directory.
///
/// Expected header: `entity_id,entity_name,date,amount,category`.
pub struct CsvExtractor {
    dir: PathBuf,
}

impl CsvExtractor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, source: RecordSource) -> PathBuf {
        self.dir.join(source.file_name())
    }

    fn read(&self, path: &Path, query: &ExtractionQuery) -> Result<Vec<RawRecord>> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut records = Vec::new();
        for row in reader.deserialize::<RawRecord>() {
            let record = row?;
            if query.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

impl Extractor for CsvExtractor {
    fn extract(&self, source: RecordSource, query: &ExtractionQuery) -> Result<Vec<RawRecord>> {
        let path = self.path_for(source);
        let records = self
            .read(&path, query)
            .map_err(|e| KpiError::extraction(source.to_string(), format!("{}: {}", path.display(), e)))?;

        info!("Read {} {} rows from {}", records.len(), source, path.display());
        Ok(records)
    }
}

/// Holds records in memory. Used by tests and embedding callers.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExtractor {
    revenue: Vec<RawRecord>,
    payroll: Vec<RawRecord>,
}

impl InMemoryExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, source: RecordSource, records: Vec<RawRecord>) -> Self {
        self.records_mut(source).extend(records);
        self
    }

    pub fn push(&mut self, source: RecordSource, record: RawRecord) {
        self.records_mut(source).push(record);
    }

    fn records_mut(&mut self, source: RecordSource) -> &mut Vec<RawRecord> {
        match source {
            RecordSource::Revenue => &mut self.revenue,
            RecordSource::Payroll => &mut self.payroll,
        }
    }

    fn records(&self, source: RecordSource) -> &[RawRecord] {
        match source {
            RecordSource::Revenue => &self.revenue,
            RecordSource::Payroll => &self.payroll,
        }
    }
}

impl Extractor for InMemoryExtractor {
    fn extract(&self, source: RecordSource, query: &ExtractionQuery) -> Result<Vec<RawRecord>> {
        let records: Vec<RawRecord> = self
            .records(source)
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        debug!("{} of {} in-memory {} rows match", records.len(), self.records(source).len(), source);
        Ok(records)
    }
}
