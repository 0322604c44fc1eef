use crate::error::{KpiError, Result};
use crate::key::NaturalKey;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Namespace every destination table lives under.
pub const DESTINATION_SCHEMA: &str = "analysis";

/// Years a [`ReferenceMonth`] may fall in. Keeps the `YYYY-MM` text sortable.
pub const YEAR_RANGE: std::ops::RangeInclusive<i32> = 1..=9999;

/// A calendar month, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReferenceMonth {
    year: i32,
    month: u32,
}

impl ReferenceMonth {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(KpiError::DateError(format!(
                "Invalid month {} for year {}: must be between 1 and 12",
                month, year
            )));
        }
        if !YEAR_RANGE.contains(&year) {
            return Err(KpiError::DateError(format!(
                "Invalid year {}: must be between {} and {}",
                year,
                YEAR_RANGE.start(),
                YEAR_RANGE.end()
            )));
        }
        Ok(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn month0(&self) -> u32 {
        self.month - 1
    }

    pub fn first_day(&self) -> Result<NaiveDate> {
        crate::utils::first_day_of_month(self.year, self.month)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

impl fmt::Display for ReferenceMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for ReferenceMonth {
    type Err = KpiError;

    fn from_str(s: &str) -> Result<Self> {
        crate::utils::parse_reference_month(s)
    }
}

impl TryFrom<String> for ReferenceMonth {
    type Error = KpiError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ReferenceMonth> for String {
    fn from(value: ReferenceMonth) -> Self {
        value.to_string()
    }
}

/// Rolling window: `current_month - months_back` through `current_month`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportingWindow {
    pub current_month: ReferenceMonth,
    pub months_back: u32,
}

impl ReportingWindow {
    pub fn new(current_month: ReferenceMonth, months_back: u32) -> Self {
        Self {
            current_month,
            months_back,
        }
    }

    pub fn months(&self) -> Result<Vec<ReferenceMonth>> {
        crate::utils::months_in_window(self.current_month, self.months_back)
    }

    pub fn start_month(&self) -> Result<ReferenceMonth> {
        let back = i32::try_from(self.months_back).map_err(|_| {
            KpiError::InvalidWindow(format!("months_back {} is too large", self.months_back))
        })?;
        crate::utils::shift_month(self.current_month, -back)
    }

    pub fn contains(&self, month: ReferenceMonth) -> bool {
        month <= self.current_month
            && crate::utils::months_between(month, self.current_month) <= i64::from(self.months_back)
    }

    pub fn provenance(&self, month: ReferenceMonth) -> Provenance {
        Provenance::for_month(month, self.current_month)
    }

    /// First day of the oldest month through the last day of the current month.
    pub fn date_range(&self) -> Result<(NaiveDate, NaiveDate)> {
        let (start, _) = crate::utils::month_bounds(self.start_month()?)?;
        let (_, end) = crate::utils::month_bounds(self.current_month)?;
        Ok((start, end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum KpiType {
    #[schemars(description = "Gross revenue per category (receita)")]
    Revenue,

    #[schemars(description = "Commission derived from revenue per category (comissao)")]
    Commission,

    #[schemars(description = "Payroll totals summed from payroll-category rows (folha)")]
    Payroll,

    #[schemars(description = "Consolidated monthly figure: commission plus payroll (financeiro)")]
    Financial,
}

impl KpiType {
    pub const ALL: [KpiType; 4] = [
        KpiType::Revenue,
        KpiType::Commission,
        KpiType::Payroll,
        KpiType::Financial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KpiType::Revenue => "revenue",
            KpiType::Commission => "commission",
            KpiType::Payroll => "payroll",
            KpiType::Financial => "financial",
        }
    }
}

impl fmt::Display for KpiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KpiType {
    type Err = KpiError;

    fn from_str(s: &str) -> Result<Self> {
        KpiType::ALL
            .into_iter()
            .find(|kpi| kpi.as_str() == s)
            .ok_or_else(|| KpiError::InvalidRules(format!("Unknown KPI type: {}", s)))
    }
}

/// Whether a month is closed (`Historical`) or still open (`Current`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Historical,
    Current,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Historical => "historical",
            Provenance::Current => "current",
        }
    }

    pub fn for_month(month: ReferenceMonth, current_month: ReferenceMonth) -> Self {
        if month < current_month {
            Provenance::Historical
        } else {
            Provenance::Current
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = KpiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "historical" => Ok(Provenance::Historical),
            "current" => Ok(Provenance::Current),
            other => Err(KpiError::Validation {
                key: "provenance".to_string(),
                details: format!("Unknown provenance: {}", other),
            }),
        }
    }
}

/// One row yielded by an extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub entity_id: String,
    #[serde(default)]
    pub entity_name: Option<String>,
    pub date: NaiveDate,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub category: String,
}

impl RawRecord {
    pub fn new(
        entity_id: impl Into<String>,
        date: NaiveDate,
        amount: Decimal,
        category: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_name: None,
            date,
            amount,
            category: category.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn reference_month(&self) -> ReferenceMonth {
        ReferenceMonth::of(self.date)
    }
}

/// The computed unit of work for one (entity, month, KPI).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyAggregate {
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub reference_month: ReferenceMonth,
    pub kpi_type: KpiType,
    pub amount_breakdown: BTreeMap<String, Decimal>,
    /// Revenue each commission category was computed from. Empty for other KPIs.
    #[serde(default)]
    pub basis_breakdown: BTreeMap<String, Decimal>,
    /// Commission after withholding. Empty for other KPIs.
    #[serde(default)]
    pub net_breakdown: BTreeMap<String, Decimal>,
    /// Revenue target outcome. Only commission aggregates of entities with a target carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attainment: Option<TargetAttainment>,
    pub source_provenance: Provenance,
}

/// How an entity's monthly revenue compares to its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetAttainment {
    pub revenue: Decimal,
    pub target: Decimal,
    /// `revenue / target`, four decimal places.
    pub attainment: Decimal,
    pub bonus_rate: Decimal,
    /// Gross commission the bonus is a share of.
    pub commission: Decimal,
    pub bonus: Decimal,
}

impl TargetAttainment {
    pub fn reached(&self) -> bool {
        self.revenue >= self.target
    }

    /// Flattened for the `breakdown` column of the bonus row.
    pub fn as_breakdown(&self) -> BTreeMap<String, Decimal> {
        BTreeMap::from([
            ("revenue".to_string(), self.revenue),
            ("target".to_string(), self.target),
            ("attainment".to_string(), self.attainment),
            ("bonus_rate".to_string(), self.bonus_rate),
            ("commission".to_string(), self.commission),
            (
                "reached".to_string(),
                if self.reached() { Decimal::ONE } else { Decimal::ZERO },
            ),
        ])
    }
}

impl MonthlyAggregate {
    pub fn total(&self) -> Decimal {
        self.amount_breakdown.values().copied().sum()
    }

    pub fn key(&self) -> NaturalKey {
        NaturalKey::group(&self.entity_id, self.reference_month, self.kpi_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationTable {
    FinanceiroMensal,
    ReceitaComissao,
    FolhaPagamento,
}

impl DestinationTable {
    pub const ALL: [DestinationTable; 3] = [
        DestinationTable::FinanceiroMensal,
        DestinationTable::ReceitaComissao,
        DestinationTable::FolhaPagamento,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            DestinationTable::FinanceiroMensal => "financeiro_mensal",
            DestinationTable::ReceitaComissao => "receita_comissao",
            DestinationTable::FolhaPagamento => "folha_pagamento",
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", DESTINATION_SCHEMA, self.table_name())
    }

    pub fn for_kpi(kpi: KpiType) -> Self {
        match kpi {
            KpiType::Revenue | KpiType::Commission => DestinationTable::ReceitaComissao,
            KpiType::Payroll => DestinationTable::FolhaPagamento,
            KpiType::Financial => DestinationTable::FinanceiroMensal,
        }
    }

    pub fn accepts(&self, kpi: KpiType) -> bool {
        Self::for_kpi(kpi) == *self
    }

    /// `receita_comissao` stores one row per category, so the category joins the key.
    pub fn uses_source(&self) -> bool {
        matches!(self, DestinationTable::ReceitaComissao)
    }
}

impl fmt::Display for DestinationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Persisted form of a `MonthlyAggregate` (or of one category of it).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationRow {
    pub key: NaturalKey,
    pub entity_name: Option<String>,
    pub amount: Decimal,
    pub basis: Option<Decimal>,
    pub net_amount: Option<Decimal>,
    pub breakdown: BTreeMap<String, Decimal>,
    pub provenance: Provenance,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_month_ordering_and_display() {
        let nov = ReferenceMonth::new(2024, 11).unwrap();
        let jan = ReferenceMonth::new(2025, 1).unwrap();
        assert!(nov < jan);
        assert_eq!(nov.to_string(), "2024-11");
        assert!(ReferenceMonth::new(2024, 0).is_err());
        assert!(ReferenceMonth::new(0, 1).is_err());
        assert!(ReferenceMonth::new(10_000, 1).is_err());
    }

    #[test]
    fn test_reference_month_serde_as_text() {
        let month = ReferenceMonth::new(2024, 3).unwrap();
        let json = serde_json::to_string(&month).unwrap();
        assert_eq!(json, "\"2024-03\"");

        let back: ReferenceMonth = serde_json::from_str(&json).unwrap();
        assert_eq!(back, month);
    }

    #[test]
    fn test_window_bounds() {
        let window = ReportingWindow::new(ReferenceMonth::new(2024, 2).unwrap(), 2);
        assert_eq!(window.start_month().unwrap(), ReferenceMonth::new(2023, 12).unwrap());
        assert!(window.contains(ReferenceMonth::new(2023, 12).unwrap()));
        assert!(!window.contains(ReferenceMonth::new(2023, 11).unwrap()));
        assert!(!window.contains(ReferenceMonth::new(2024, 3).unwrap()));

        let (start, end) = window.date_range().unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2023, 12, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn test_provenance_for_month() {
        let current = ReferenceMonth::new(2024, 11).unwrap();
        let previous = ReferenceMonth::new(2024, 10).unwrap();
        assert_eq!(Provenance::for_month(previous, current), Provenance::Historical);
        assert_eq!(Provenance::for_month(current, current), Provenance::Current);
    }

    #[test]
    fn test_table_routing() {
        assert_eq!(
            DestinationTable::for_kpi(KpiType::Commission),
            DestinationTable::ReceitaComissao
        );
        assert!(DestinationTable::ReceitaComissao.accepts(KpiType::Revenue));
        assert!(!DestinationTable::FolhaPagamento.accepts(KpiType::Revenue));
        assert_eq!(
            DestinationTable::FinanceiroMensal.qualified_name(),
            "analysis.financeiro_mensal"
        );
        assert!(DestinationTable::ReceitaComissao.uses_source());
        assert!(!DestinationTable::FolhaPagamento.uses_source());
    }

    #[test]
    fn test_kpi_type_round_trip_through_text() {
        for kpi in KpiType::ALL {
            assert_eq!(kpi.as_str().parse::<KpiType>().unwrap(), kpi);
        }
        assert!("ebitda".parse::<KpiType>().is_err());
    }
}
