use crate::error::{KpiError, Result};
use crate::key::{normalize_source, NaturalKey};
use crate::load::validate;
use crate::rules::KpiRules;
use crate::schema::{
    DestinationTable, KpiType, MonthlyAggregate, RawRecord, ReportingWindow, TargetAttainment,
};
use log::{debug, info, warn};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;

pub const FINANCIAL_COMMISSION_PART: &str = "comissao";
pub const FINANCIAL_PAYROLL_PART: &str = "folha";
/// Commission category holding the revenue-target bonus.
pub const COMMISSION_BONUS_PART: &str = "bonus_meta";

/// Turns raw records into monthly aggregates. Holds no state besides its
/// inputs: the same records, rules and window always give the same output.
pub struct Transformer<'a> {
    rules: &'a KpiRules,
    window: ReportingWindow,
}

// Running totals for one (entity, month, kpi) while grouping
#[derive(Default)]
struct GroupAccumulator {
    entity_name: Option<String>,
    by_category: BTreeMap<String, Decimal>,
}

impl GroupAccumulator {
    fn add(&mut self, record: &RawRecord) {
        if let Some(name) = &record.entity_name {
            // Smallest name wins so input order never changes the output
            let replace = match &self.entity_name {
                Some(existing) => name < existing,
                None => true,
            };
            if replace {
                self.entity_name = Some(name.clone());
            }
        }

        *self
            .by_category
            .entry(normalize_source(&record.category))
            .or_insert(Decimal::ZERO) += record.amount;
    }

    fn total(&self) -> Decimal {
        self.by_category.values().copied().sum()
    }
}

impl<'a> Transformer<'a> {
    pub fn new(rules: &'a KpiRules, window: ReportingWindow) -> Self {
        Self { rules, window }
    }

    pub fn window(&self) -> ReportingWindow {
        self.window
    }

    /// Aggregates `raw_rows` for a single-source KPI (revenue, commission or payroll).
    ///
    /// Months without any matching record produce no aggregate at all.
    /// The financial KPI needs both revenue and payroll rows; use
    /// [`Transformer::consolidate`] for it.
    pub fn transform(&self, kpi: KpiType, raw_rows: &[RawRecord]) -> Result<Vec<MonthlyAggregate>> {
        if kpi == KpiType::Financial {
            return Err(KpiError::InvalidRules(
                "the financial KPI is consolidated from revenue and payroll rows".to_string(),
            ));
        }

        let groups = self.group(kpi, raw_rows);

        let aggregates: Vec<MonthlyAggregate> = groups
            .into_iter()
            .map(|(key, group)| self.build_aggregate(key, group))
            .collect();

        info!(
            "Transformed {} raw rows into {} {} aggregates",
            raw_rows.len(),
            aggregates.len(),
            kpi
        );

        Ok(aggregates)
    }

    /// Builds the `financial` KPI: per entity and month, commission plus payroll.
    ///
    /// The parts are the already-rounded totals of the commission and payroll
    /// aggregates, so the stored total always equals the sum of the stored
    /// commission rows plus the stored payroll row. A part the loader would
    /// reject is left out, since no stored rows will back it.
    pub fn consolidate(
        &self,
        revenue_rows: &[RawRecord],
        payroll_rows: &[RawRecord],
    ) -> Result<Vec<MonthlyAggregate>> {
        let commission = self.transform(KpiType::Commission, revenue_rows)?;
        let payroll = self.transform(KpiType::Payroll, payroll_rows)?;

        let mut merged: BTreeMap<NaturalKey, MonthlyAggregate> = BTreeMap::new();

        for (part, aggregates) in [
            (FINANCIAL_COMMISSION_PART, commission),
            (FINANCIAL_PAYROLL_PART, payroll),
        ] {
            for aggregate in aggregates {
                let table = DestinationTable::for_kpi(aggregate.kpi_type);
                if let Err(err) = validate(&aggregate, table, self.rules) {
                    debug!("Financial {} leaves out '{}': {}", aggregate.key(), part, err);
                    continue;
                }

                let key = NaturalKey::group(
                    &aggregate.entity_id,
                    aggregate.reference_month,
                    KpiType::Financial,
                );
                let entry = merged.entry(key).or_insert_with(|| MonthlyAggregate {
                    entity_id: aggregate.entity_id.clone(),
                    entity_name: None,
                    reference_month: aggregate.reference_month,
                    kpi_type: KpiType::Financial,
                    amount_breakdown: BTreeMap::new(),
                    basis_breakdown: BTreeMap::new(),
                    net_breakdown: BTreeMap::new(),
                    attainment: None,
                    source_provenance: aggregate.source_provenance,
                });

                if entry.entity_name.is_none() {
                    entry.entity_name = aggregate.entity_name.clone();
                }
                entry
                    .amount_breakdown
                    .insert(part.to_string(), aggregate.total());
            }
        }

        info!("Consolidated {} financial aggregates", merged.len());

        Ok(merged.into_values().collect())
    }

    fn group(&self, kpi: KpiType, raw_rows: &[RawRecord]) -> BTreeMap<NaturalKey, GroupAccumulator> {
        let mut groups: BTreeMap<NaturalKey, GroupAccumulator> = BTreeMap::new();
        let mut outside_window = 0usize;
        let mut ignored_categories = 0usize;

        for record in raw_rows {
            let month = record.reference_month();
            if !self.window.contains(month) {
                outside_window += 1;
                continue;
            }

            if kpi == KpiType::Payroll && !self.rules.is_payroll_category(&record.category) {
                ignored_categories += 1;
                continue;
            }

            groups
                .entry(NaturalKey::group(&record.entity_id, month, kpi))
                .or_default()
                .add(record);
        }

        if outside_window > 0 || ignored_categories > 0 {
            debug!(
                "{}: dropped {} rows outside {}..={} and {} rows of non-payroll categories",
                kpi,
                outside_window,
                self.window.start_month().map(|m| m.to_string()).unwrap_or_default(),
                self.window.current_month,
                ignored_categories
            );
        }

        groups
    }

    fn build_aggregate(&self, key: NaturalKey, group: GroupAccumulator) -> MonthlyAggregate {
        let mut amount_breakdown = BTreeMap::new();
        let mut basis_breakdown = BTreeMap::new();
        let mut net_breakdown = BTreeMap::new();
        let mut attainment = None;

        match key.kpi_type {
            KpiType::Commission => {
                let monthly_revenue = group.total();
                let retained = Decimal::ONE - self.rules.withholding_rate;

                for (category, revenue) in &group.by_category {
                    let rate = self.rules.commission_rate(category, monthly_revenue);
                    let gross = round_money(*revenue * rate);

                    amount_breakdown.insert(category.clone(), gross);
                    basis_breakdown.insert(category.clone(), round_money(*revenue));
                    net_breakdown.insert(category.clone(), round_money(gross * retained));
                }

                if let Some(outcome) = self.target_bonus(&key, monthly_revenue, &amount_breakdown) {
                    if amount_breakdown.contains_key(COMMISSION_BONUS_PART) {
                        warn!(
                            "{}: raw category '{}' is shadowed by the target bonus",
                            key, COMMISSION_BONUS_PART
                        );
                    }
                    amount_breakdown.insert(COMMISSION_BONUS_PART.to_string(), outcome.bonus);
                    basis_breakdown.insert(COMMISSION_BONUS_PART.to_string(), outcome.commission);
                    net_breakdown.insert(
                        COMMISSION_BONUS_PART.to_string(),
                        round_money(outcome.bonus * retained),
                    );
                    attainment = Some(outcome);
                }
            }
            _ => {
                for (category, amount) in &group.by_category {
                    amount_breakdown.insert(category.clone(), round_money(*amount));
                }
            }
        }

        debug!(
            "{}: {} categories, total {}",
            key,
            amount_breakdown.len(),
            amount_breakdown.values().copied().sum::<Decimal>()
        );

        MonthlyAggregate {
            source_provenance: self.window.provenance(key.reference_month),
            entity_id: key.entity_id,
            entity_name: group.entity_name,
            reference_month: key.reference_month,
            kpi_type: key.kpi_type,
            amount_breakdown,
            basis_breakdown,
            net_breakdown,
            attainment,
        }
    }

    // Bonus is a share of the month's gross commission, paid only when
    // revenue reaches the target. Missed targets still report their attainment.
    fn target_bonus(
        &self,
        key: &NaturalKey,
        monthly_revenue: Decimal,
        commission: &BTreeMap<String, Decimal>,
    ) -> Option<TargetAttainment> {
        let target = self.rules.targets.for_entity(&key.entity_id)?;
        let commission: Decimal = commission
            .iter()
            .filter(|(category, _)| category.as_str() != COMMISSION_BONUS_PART)
            .map(|(_, amount)| *amount)
            .sum();

        let mut outcome = TargetAttainment {
            revenue: round_money(monthly_revenue),
            target: target.target,
            attainment: monthly_revenue
                .checked_div(target.target)
                .map(|ratio| ratio.round_dp(4))
                .unwrap_or(Decimal::ZERO),
            bonus_rate: target.bonus_rate,
            commission,
            bonus: Decimal::ZERO,
        };
        if outcome.reached() {
            outcome.bonus = round_money(commission * target.bonus_rate);
        }

        debug!(
            "{}: revenue {} against target {} ({}), bonus {}",
            key, outcome.revenue, outcome.target, outcome.attainment, outcome.bonus
        );
        Some(outcome)
    }
}

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Convenience wrapper over [`Transformer::transform`].
pub fn transform(
    kpi: KpiType,
    raw_rows: &[RawRecord],
    window: ReportingWindow,
    rules: &KpiRules,
) -> Result<Vec<MonthlyAggregate>> {
    Transformer::new(rules, window).transform(kpi, raw_rows)
}
