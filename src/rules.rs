use crate::error::{KpiError, Result};
use crate::key::{normalize_entity, normalize_source};
use crate::schema::KpiType;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum CommissionPolicy {
    #[schemars(description = "A single rate applied to every category's revenue (0.10 = 10%).")]
    Percentage {
        #[schemars(with = "String")]
        rate: Decimal,
    },

    #[schemars(
        description = "Fixed schedule: the tier with the highest threshold not above the entity's total monthly revenue sets the rate."
    )]
    Schedule { tiers: Vec<CommissionTier> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct CommissionTier {
    #[schemars(with = "String", description = "Minimum monthly revenue for this tier.")]
    pub threshold: Decimal,

    #[schemars(with = "String", description = "Commission rate for this tier (0.10 = 10%).")]
    pub rate: Decimal,
}

/// A monthly revenue target and the bonus paid for reaching it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct RevenueTarget {
    #[schemars(with = "String", description = "Monthly revenue the entity has to reach.")]
    pub target: Decimal,

    #[schemars(
        with = "String",
        description = "Share of the month's gross commission paid as bonus once the target is reached (0.05 = 5%)."
    )]
    pub bonus_rate: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct CommissionTargets {
    #[serde(default)]
    #[schemars(description = "Target for entities without one of their own. No default means no bonus.")]
    pub default: Option<RevenueTarget>,

    #[serde(default)]
    #[schemars(description = "Per-entity targets keyed by entity id.")]
    pub entities: BTreeMap<String, RevenueTarget>,
}

impl CommissionTargets {
    pub fn for_entity(&self, entity_id: &str) -> Option<&RevenueTarget> {
        let entity_id = normalize_entity(entity_id);
        self.entities
            .iter()
            .find(|(id, _)| normalize_entity(id) == entity_id)
            .map(|(_, target)| target)
            .or(self.default.as_ref())
    }

    fn validate(&self) -> Result<()> {
        let named = self
            .entities
            .iter()
            .map(|(id, target)| (format!("target for '{}'", id), target));

        for (what, target) in self
            .default
            .iter()
            .map(|target| ("default target".to_string(), target))
            .chain(named)
        {
            if target.target <= Decimal::ZERO {
                return Err(KpiError::InvalidRules(format!(
                    "{} {} must be positive",
                    what, target.target
                )));
            }
            check_rate(&format!("bonus rate of {}", what), target.bonus_rate)?;
        }
        Ok(())
    }
}

/// Business rule tables. Static configuration, never touched by a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct KpiRules {
    #[schemars(description = "How commission is derived from revenue.")]
    pub commission: CommissionPolicy,

    #[serde(default)]
    #[schemars(
        with = "BTreeMap<String, String>",
        description = "Per-category rate overrides (e.g. {\"coe\": \"0.95\"}). Take precedence over the policy."
    )]
    pub category_rates: BTreeMap<String, Decimal>,

    #[schemars(
        with = "String",
        description = "Share withheld from gross commission to obtain net commission (0.195 = 19.5%)."
    )]
    pub withholding_rate: Decimal,

    #[serde(default)]
    #[schemars(description = "KPIs whose totals may legitimately be negative (refunds, chargebacks).")]
    pub refundable_kpis: Vec<KpiType>,

    #[schemars(description = "Raw categories that count towards payroll. Other categories are ignored.")]
    pub payroll_categories: Vec<String>,

    #[serde(default)]
    #[schemars(description = "Monthly revenue targets that pay a bonus on top of commission.")]
    pub targets: CommissionTargets,
}

impl Default for KpiRules {
    fn default() -> Self {
        Self {
            commission: CommissionPolicy::Percentage {
                rate: Decimal::new(10, 2),
            },
            category_rates: BTreeMap::new(),
            withholding_rate: Decimal::new(195, 3),
            refundable_kpis: vec![KpiType::Revenue],
            payroll_categories: vec![
                "salario_base".to_string(),
                "comissao".to_string(),
                "bonus".to_string(),
            ],
            targets: CommissionTargets::default(),
        }
    }
}

impl KpiRules {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let rules: KpiRules = serde_json::from_str(json)?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = Decimal::ONE;

        match &self.commission {
            CommissionPolicy::Percentage { rate } => check_rate("commission rate", *rate)?,
            CommissionPolicy::Schedule { tiers } => {
                if tiers.is_empty() {
                    return Err(KpiError::InvalidRules(
                        "Commission schedule needs at least one tier".to_string(),
                    ));
                }
                for tier in tiers {
                    if tier.threshold.is_sign_negative() {
                        return Err(KpiError::InvalidRules(format!(
                            "Tier threshold {} must not be negative",
                            tier.threshold
                        )));
                    }
                    check_rate("tier rate", tier.rate)?;
                }
            }
        }

        for (category, rate) in &self.category_rates {
            check_rate(&format!("rate for category '{}'", category), *rate)?;
        }

        if self.withholding_rate.is_sign_negative() || self.withholding_rate >= unit {
            return Err(KpiError::InvalidRules(format!(
                "Withholding rate {} must be in [0, 1)",
                self.withholding_rate
            )));
        }

        self.targets.validate()
    }

    /// Rate applied to `category` given the entity's total revenue for the month.
    pub fn commission_rate(&self, category: &str, monthly_revenue: Decimal) -> Decimal {
        let category = normalize_source(category);
        if let Some(rate) = self
            .category_rates
            .iter()
            .find(|(name, _)| normalize_source(name) == category)
            .map(|(_, rate)| *rate)
        {
            return rate;
        }

        match &self.commission {
            CommissionPolicy::Percentage { rate } => *rate,
            CommissionPolicy::Schedule { tiers } => tiers
                .iter()
                .filter(|tier| tier.threshold <= monthly_revenue)
                .max_by(|a, b| a.threshold.cmp(&b.threshold))
                .map(|tier| tier.rate)
                .unwrap_or(Decimal::ZERO),
        }
    }

    pub fn allows_negative(&self, kpi: KpiType) -> bool {
        self.refundable_kpis.contains(&kpi)
    }

    pub fn is_payroll_category(&self, category: &str) -> bool {
        let category = normalize_source(category);
        self.payroll_categories
            .iter()
            .any(|c| normalize_source(c) == category)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(KpiRules)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

fn check_rate(what: &str, rate: Decimal) -> Result<()> {
    if rate.is_sign_negative() || rate > Decimal::ONE {
        return Err(KpiError::InvalidRules(format!(
            "{} {} must be between 0 and 1",
            what, rate
        )));
    }
    Ok(())
}
