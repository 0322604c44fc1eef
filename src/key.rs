//! Natural keys shared by the transformer (grouping) and the loader (matching).
//!
//! A key is `entity_id + reference_month + kpi_type`, plus the category
//! (`source`) for tables that keep one row per category. Both passes build
//! keys through this module only, so the two can never disagree on what makes
//! two rows "the same".

use crate::schema::{DestinationTable, KpiType, ReferenceMonth};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NaturalKey {
    pub entity_id: String,
    pub reference_month: ReferenceMonth,
    pub kpi_type: KpiType,
    pub source: Option<String>,
}

impl NaturalKey {
    /// Key of a whole aggregate, as used when grouping raw records.
    pub fn group(entity_id: &str, reference_month: ReferenceMonth, kpi_type: KpiType) -> Self {
        Self {
            entity_id: normalize_entity(entity_id),
            reference_month,
            kpi_type,
            source: None,
        }
    }

    /// Key of one stored row. `source` only participates for tables that store
    /// one row per category.
    pub fn for_row(
        table: DestinationTable,
        entity_id: &str,
        reference_month: ReferenceMonth,
        kpi_type: KpiType,
        source: Option<&str>,
    ) -> Self {
        let source = if table.uses_source() {
            source.map(normalize_source)
        } else {
            None
        };

        Self {
            source,
            ..Self::group(entity_id, reference_month, kpi_type)
        }
    }

    /// The aggregate-level key this row belongs to.
    pub fn group_key(&self) -> Self {
        Self {
            source: None,
            ..self.clone()
        }
    }

    /// Value stored in the `source` column. Tables without per-category rows
    /// store an empty string so the UNIQUE constraint still covers them.
    pub fn source_column(&self) -> &str {
        self.source.as_deref().unwrap_or("")
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.entity_id, self.reference_month, self.kpi_type
        )?;
        if let Some(source) = &self.source {
            write!(f, "/{}", source)?;
        }
        Ok(())
    }
}

pub fn normalize_entity(entity_id: &str) -> String {
    entity_id.trim().to_string()
}

pub fn normalize_source(category: &str) -> String {
    category.trim().to_lowercase()
}
