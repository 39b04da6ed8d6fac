//! Plan and credit package catalog
//!
//! The catalog is immutable at runtime. Prices are in KRW (whole won, no
//! minor unit), which is also the unit the payment gateway charges in.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of the plan every user falls back to.
pub const FREE_PLAN_ID: &str = "free";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Invalid catalog JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Catalog is missing the '{FREE_PLAN_ID}' plan")]
    MissingFreePlan,

    #[error("Duplicate catalog id: {0}")]
    DuplicateId(String),

    #[error("Unknown billing cycle: {0}")]
    UnknownCycle(String),
}

/// Billing cycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    /// Days in one cycle. Used both for period arithmetic and daily rates.
    pub fn days(&self) -> i64 {
        match self {
            BillingCycle::Monthly => 30,
            BillingCycle::Yearly => 365,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BillingCycle {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Ok(BillingCycle::Monthly),
            "yearly" | "annual" | "year" => Ok(BillingCycle::Yearly),
            other => Err(CatalogError::UnknownCycle(other.to_string())),
        }
    }
}

/// Feature flags attached to a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFeatures {
    #[serde(default)]
    pub pdf_export: bool,
    #[serde(default)]
    pub priority_queue: bool,
    #[serde(default)]
    pub custom_templates: bool,
    #[serde(default = "default_seats")]
    pub team_seats: u32,
}

fn default_seats() -> u32 {
    1
}

/// Subscription plan catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub monthly_price: i64,
    pub yearly_price: i64,
    /// Generations allowed per calendar day
    pub daily_generations: i32,
    /// Credits granted at the start of every paid period
    #[serde(default)]
    pub monthly_credits: i64,
    pub languages: Vec<String>,
    #[serde(default)]
    pub features: PlanFeatures,
}

impl Plan {
    /// Free tier: 3 generations a day, Korean and English only
    pub fn free() -> Self {
        Self {
            id: FREE_PLAN_ID.to_string(),
            name: "Free".to_string(),
            monthly_price: 0,
            yearly_price: 0,
            daily_generations: 3,
            monthly_credits: 0,
            languages: vec!["ko".to_string(), "en".to_string()],
            features: PlanFeatures::default(),
        }
    }

    /// Pro tier: 50 generations a day, 300 credits a period, PDF export
    pub fn pro() -> Self {
        Self {
            id: "pro".to_string(),
            name: "Pro".to_string(),
            monthly_price: 29_900,
            yearly_price: 299_000,
            daily_generations: 50,
            monthly_credits: 300,
            languages: ["ko", "en", "ja", "zh", "es"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            features: PlanFeatures {
                pdf_export: true,
                priority_queue: false,
                custom_templates: true,
                team_seats: 1,
            },
        }
    }

    /// Team tier: 200 generations a day, 1,500 credits a period, 5 seats
    pub fn team() -> Self {
        Self {
            id: "team".to_string(),
            name: "Team".to_string(),
            monthly_price: 99_000,
            yearly_price: 990_000,
            daily_generations: 200,
            monthly_credits: 1_500,
            languages: ["ko", "en", "ja", "zh", "es", "fr", "de", "vi"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            features: PlanFeatures {
                pdf_export: true,
                priority_queue: true,
                custom_templates: true,
                team_seats: 5,
            },
        }
    }

    pub fn price(&self, cycle: BillingCycle) -> i64 {
        match cycle {
            BillingCycle::Monthly => self.monthly_price,
            BillingCycle::Yearly => self.yearly_price,
        }
    }

    /// Price per day of the given cycle
    pub fn daily_rate(&self, cycle: BillingCycle) -> f64 {
        self.price(cycle) as f64 / cycle.days() as f64
    }

    pub fn is_free(&self) -> bool {
        self.monthly_price == 0 && self.yearly_price == 0
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.languages.iter().any(|l| l.eq_ignore_ascii_case(language))
    }
}

/// One-off credit package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPackage {
    pub id: String,
    pub name: String,
    pub credits: i64,
    pub price: i64,
    /// Days until purchased credits expire
    pub validity_days: i64,
}

impl CreditPackage {
    fn new(id: &str, name: &str, credits: i64, price: i64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            credits,
            price,
            validity_days: 365,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    plans: Vec<Plan>,
    #[serde(default)]
    credit_packages: Vec<CreditPackage>,
}

/// Immutable plan and credit package catalog
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<String, Plan>,
    packages: HashMap<String, CreditPackage>,
}

impl PlanCatalog {
    /// Catalog shipped with the product
    pub fn builtin() -> Self {
        let plans = [Plan::free(), Plan::pro(), Plan::team()];
        let packages = [
            CreditPackage::new("credits_100", "100 credits", 100, 9_900),
            CreditPackage::new("credits_500", "500 credits", 500, 39_900),
            CreditPackage::new("credits_1200", "1,200 credits", 1_200, 79_900),
        ];
        Self {
            plans: plans.into_iter().map(|p| (p.id.clone(), p)).collect(),
            packages: packages.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Load a catalog from JSON (`{"plans": [...], "credit_packages": [...]}`)
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;

        let mut plans = HashMap::new();
        for plan in file.plans {
            if plans.contains_key(&plan.id) {
                return Err(CatalogError::DuplicateId(plan.id));
            }
            plans.insert(plan.id.clone(), plan);
        }
        if !plans.contains_key(FREE_PLAN_ID) {
            return Err(CatalogError::MissingFreePlan);
        }

        let mut packages = HashMap::new();
        for package in file.credit_packages {
            if packages.contains_key(&package.id) {
                return Err(CatalogError::DuplicateId(package.id));
            }
            packages.insert(package.id.clone(), package);
        }

        Ok(Self { plans, packages })
    }

    pub fn plan(&self, id: &str) -> Option<&Plan> {
        self.plans.get(id)
    }

    pub fn package(&self, id: &str) -> Option<&CreditPackage> {
        self.packages.get(id)
    }

    /// The fallback plan. Guaranteed present by both constructors.
    pub fn free_plan(&self) -> Plan {
        self.plans.get(FREE_PLAN_ID).cloned().unwrap_or_else(Plan::free)
    }

    /// Plans sorted by monthly price
    pub fn plans(&self) -> Vec<&Plan> {
        let mut plans: Vec<&Plan> = self.plans.values().collect();
        plans.sort_by_key(|p| p.monthly_price);
        plans
    }

    /// Credit packages sorted by price
    pub fn packages(&self) -> Vec<&CreditPackage> {
        let mut packages: Vec<&CreditPackage> = self.packages.values().collect();
        packages.sort_by_key(|p| p.price);
        packages
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_has_free_plan() {
        let catalog = PlanCatalog::builtin();
        let free = catalog.free_plan();
        assert!(free.is_free());
        assert_eq!(free.daily_generations, 3);
    }

    #[test]
    fn test_daily_rate_uses_cycle_days() {
        let pro = Plan::pro();
        assert!((pro.daily_rate(BillingCycle::Monthly) - 29_900.0 / 30.0).abs() < 1e-9);
        assert!((pro.daily_rate(BillingCycle::Yearly) - 299_000.0 / 365.0).abs() < 1e-9);
        // yearly list price is higher, daily rate is lower
        assert!(pro.daily_rate(BillingCycle::Yearly) < pro.daily_rate(BillingCycle::Monthly));
    }

    #[test]
    fn test_billing_cycle_parsing() {
        assert_eq!("monthly".parse::<BillingCycle>().unwrap(), BillingCycle::Monthly);
        assert_eq!("annual".parse::<BillingCycle>().unwrap(), BillingCycle::Yearly);
        assert_eq!("YEARLY".parse::<BillingCycle>().unwrap(), BillingCycle::Yearly);
        assert!("weekly".parse::<BillingCycle>().is_err());
    }

    #[test]
    fn test_from_json_requires_free_plan() {
        let json = r#"{"plans": [{"id": "pro", "name": "Pro", "monthly_price": 1000,
            "yearly_price": 10000, "daily_generations": 5, "languages": ["ko"]}]}"#;
        assert!(matches!(
            PlanCatalog::from_json(json),
            Err(CatalogError::MissingFreePlan)
        ));
    }

    #[test]
    fn test_from_json_rejects_duplicates() {
        let json = r#"{"plans": [
            {"id": "free", "name": "Free", "monthly_price": 0, "yearly_price": 0, "daily_generations": 1, "languages": ["ko"]},
            {"id": "free", "name": "Free", "monthly_price": 0, "yearly_price": 0, "daily_generations": 1, "languages": ["ko"]}
        ]}"#;
        assert!(matches!(
            PlanCatalog::from_json(json),
            Err(CatalogError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_language_support() {
        let free = Plan::free();
        assert!(free.supports_language("KO"));
        assert!(!free.supports_language("ja"));
        assert!(Plan::team().supports_language("vi"));
    }
}
