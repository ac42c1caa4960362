// src/rules.rs
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::model::{AmountType, CategoryName, Code, JustifiedKind};

// --- Category Definitions ---

/// Closed set of rule patterns a category can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryPattern {
    /// Fixed limit per period.
    Programmed,
    /// Limit accrues with the contract days covered by the period.
    Vacations,
    /// Compensatory rest; no chain semantics are implemented for it.
    CompensatoryRest,
}

impl FromStr for CategoryPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "programmed" => Ok(CategoryPattern::Programmed),
            "vacations" => Ok(CategoryPattern::Vacations),
            "compensatory_rest" => Ok(CategoryPattern::CompensatoryRest),
            other => Err(ConfigError::UnknownPattern(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PeriodKind {
    Always,
    Year,
    Month,
    /// What `source` left unused in the previous calendar year, usable from
    /// January up to the end of `usable_until_month` (1-12).
    PreviousYear {
        source: CategoryName,
        usable_until_month: u32,
    },
    /// Bound to the `ordinal`-th qualifying child (1-based, by birth date),
    /// from its `from_years` birthday to the day before its `to_years` one.
    Child {
        ordinal: usize,
        from_years: u32,
        to_years: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakableBehaviour {
    pub amount_type: AmountType,
    pub taken_codes: BTreeSet<Code>,
    /// Negative means unlimited.
    pub fixed_limit: i64,
}

impl TakableBehaviour {
    pub fn is_unlimited(&self) -> bool {
        self.fixed_limit < 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacingCode {
    pub code: Code,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionBehaviour {
    pub amount_type: AmountType,
    pub completion_codes: BTreeSet<Code>,
    pub replacing_codes: Vec<ReplacingCode>,
}

impl CompletionBehaviour {
    pub fn is_replacing_code(&self, code: &str) -> bool {
        self.replacing_codes.iter().any(|r| r.code == code)
    }

    /// Largest replacing amount that fits in `residual`.
    pub fn best_replacing(&self, residual: i64) -> Option<&ReplacingCode> {
        self.replacing_codes
            .iter()
            .filter(|r| r.amount > 0 && r.amount <= residual)
            .max_by_key(|r| r.amount)
    }

    /// First pair of replacing codes sharing an amount, if any.
    pub fn conflicting_amounts(&self) -> Option<(&ReplacingCode, &ReplacingCode)> {
        let mut seen: BTreeMap<i64, &ReplacingCode> = BTreeMap::new();
        for replacing in &self.replacing_codes {
            if let Some(previous) = seen.insert(replacing.amount, replacing) {
                return Some((previous, replacing));
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub name: CategoryName,
    #[serde(default)]
    pub description: String,
    pub pattern: CategoryPattern,
    pub period: PeriodKind,
    #[serde(default)]
    pub takable: Option<TakableBehaviour>,
    #[serde(default)]
    pub completion: Option<CompletionBehaviour>,
    /// Successor category checked once this one is exhausted.
    #[serde(default)]
    pub next: Option<CategoryName>,
    /// Replacing records of this category are maintained by the engine.
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub initializable: bool,
}

impl CategoryRule {
    pub fn is_takable_unlimited(&self) -> bool {
        self.takable.as_ref().map_or(false, |t| t.is_unlimited())
    }

    pub fn requires_child(&self) -> bool {
        matches!(self.period, PeriodKind::Child { .. })
    }

    /// Category whose unused entitlement this one carries over, if any.
    pub fn carry_over_source(&self) -> Option<&str> {
        match &self.period {
            PeriodKind::PreviousYear { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Every code whose records feed this category.
    pub fn involved_codes(&self) -> BTreeSet<Code> {
        let mut codes = BTreeSet::new();
        if let Some(takable) = &self.takable {
            codes.extend(takable.taken_codes.iter().cloned());
        }
        if let Some(completion) = &self.completion {
            codes.extend(completion.completion_codes.iter().cloned());
            codes.extend(completion.replacing_codes.iter().map(|r| r.code.clone()));
        }
        codes
    }
}

/// Catalog entry for an absence code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsenceCode {
    pub code: Code,
    #[serde(default)]
    pub description: String,
    pub justified_kinds: Vec<JustifiedKind>,
}

impl AbsenceCode {
    pub fn no_amount_kinds(&self) -> Vec<JustifiedKind> {
        self.justified_kinds
            .iter()
            .copied()
            .filter(|k| k.is_no_amount())
            .collect()
    }
}

// --- Provider ---

/// Read-only access to the category rule tree.
pub trait RuleTreeProvider {
    fn rule_by_name(&self, name: &str) -> Option<&CategoryRule>;

    /// Head of the chain `rule` belongs to.
    fn first_of_chain<'a>(&'a self, rule: &'a CategoryRule) -> &'a CategoryRule;

    /// Categories fed by records of `code`, in name order.
    fn categories_for_code(&self, code: &str) -> Vec<&CategoryRule>;

    fn absence_code(&self, code: &str) -> Option<&AbsenceCode>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTreeDocument {
    pub categories: Vec<CategoryRule>,
    #[serde(default)]
    pub codes: Vec<AbsenceCode>,
}

/// Static rule tree, usually loaded from JSON.
#[derive(Debug, Clone, Default)]
pub struct StaticRuleTree {
    categories: BTreeMap<CategoryName, CategoryRule>,
    codes: BTreeMap<Code, AbsenceCode>,
    by_code: BTreeMap<Code, BTreeSet<CategoryName>>,
}

impl StaticRuleTree {
    pub fn new(categories: Vec<CategoryRule>, codes: Vec<AbsenceCode>) -> Self {
        let mut tree = Self::default();
        for rule in categories {
            for code in rule.involved_codes() {
                tree.by_code
                    .entry(code)
                    .or_default()
                    .insert(rule.name.clone());
            }
            if let Some(previous) = tree.categories.insert(rule.name.clone(), rule) {
                warn!("Category '{}' defined twice, keeping the last one", previous.name);
            }
        }
        for code in codes {
            tree.codes.insert(code.code.clone(), code);
        }
        debug!(
            "Rule tree built: {} categories, {} codes",
            tree.categories.len(),
            tree.codes.len()
        );
        tree
    }

    pub fn from_document(document: RuleTreeDocument) -> Self {
        Self::new(document.categories, document.codes)
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        let document: RuleTreeDocument = serde_json::from_str(json)?;
        Ok(Self::from_document(document))
    }

    pub fn categories(&self) -> impl Iterator<Item = &CategoryRule> {
        self.categories.values()
    }

    fn predecessor_of(&self, name: &str) -> Option<&CategoryRule> {
        self.categories
            .values()
            .find(|rule| rule.next.as_deref() == Some(name))
    }
}

impl RuleTreeProvider for StaticRuleTree {
    fn rule_by_name(&self, name: &str) -> Option<&CategoryRule> {
        self.categories.get(name)
    }

    fn first_of_chain<'a>(&'a self, rule: &'a CategoryRule) -> &'a CategoryRule {
        let mut head = rule;
        let mut visited = BTreeSet::from([rule.name.as_str()]);
        while let Some(previous) = self.predecessor_of(&head.name) {
            if !visited.insert(previous.name.as_str()) {
                // Cyclic chain; the chain builder reports it.
                break;
            }
            head = previous;
        }
        head
    }

    fn categories_for_code(&self, code: &str) -> Vec<&CategoryRule> {
        self.by_code
            .get(code)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| self.categories.get(name))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn absence_code(&self, code: &str) -> Option<&AbsenceCode> {
        self.codes.get(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programmed(name: &str, codes: &[&str], limit: i64, next: Option<&str>) -> CategoryRule {
        CategoryRule {
            name: name.to_string(),
            description: String::new(),
            pattern: CategoryPattern::Programmed,
            period: PeriodKind::Year,
            takable: Some(TakableBehaviour {
                amount_type: AmountType::Units,
                taken_codes: codes.iter().map(|c| c.to_string()).collect(),
                fixed_limit: limit,
            }),
            completion: None,
            next: next.map(String::from),
            automatic: false,
            initializable: false,
        }
    }

    #[test]
    fn first_of_chain_walks_back_to_the_head() {
        let tree = StaticRuleTree::new(
            vec![
                programmed("a", &["A1"], 300, Some("b")),
                programmed("b", &["A1"], 1000, Some("c")),
                programmed("c", &["A1"], -1, None),
            ],
            vec![],
        );
        let c = tree.rule_by_name("c").unwrap();
        assert_eq!(tree.first_of_chain(c).name, "a");
    }

    #[test]
    fn first_of_chain_terminates_on_cycles() {
        let tree = StaticRuleTree::new(
            vec![
                programmed("a", &["A1"], 300, Some("b")),
                programmed("b", &["A1"], 300, Some("a")),
            ],
            vec![],
        );
        let a = tree.rule_by_name("a").unwrap();
        assert_eq!(tree.first_of_chain(a).name, "b");
    }

    #[test]
    fn categories_for_code_are_name_ordered() {
        let tree = StaticRuleTree::new(
            vec![
                programmed("zeta", &["X"], 100, None),
                programmed("alpha", &["X", "Y"], 100, None),
            ],
            vec![],
        );
        let names: Vec<&str> = tree
            .categories_for_code("X")
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(tree.categories_for_code("Q").is_empty());
    }

    #[test]
    fn best_replacing_picks_largest_fitting_amount() {
        let completion = CompletionBehaviour {
            amount_type: AmountType::Minutes,
            completion_codes: BTreeSet::from(["09M".to_string()]),
            replacing_codes: vec![
                ReplacingCode { code: "09H1".into(), amount: 60 },
                ReplacingCode { code: "09H2".into(), amount: 120 },
                ReplacingCode { code: "09H7".into(), amount: 432 },
            ],
        };
        assert_eq!(completion.best_replacing(130).unwrap().code, "09H2");
        assert_eq!(completion.best_replacing(432).unwrap().code, "09H7");
        assert!(completion.best_replacing(59).is_none());
        assert!(completion.conflicting_amounts().is_none());
    }

    #[test]
    fn conflicting_amounts_reports_the_first_shared_amount() {
        let completion = CompletionBehaviour {
            amount_type: AmountType::Minutes,
            completion_codes: BTreeSet::from(["09M".to_string()]),
            replacing_codes: vec![
                ReplacingCode { code: "09H1".into(), amount: 60 },
                ReplacingCode { code: "09X".into(), amount: 120 },
                ReplacingCode { code: "09H2".into(), amount: 120 },
            ],
        };
        let (first, second) = completion.conflicting_amounts().unwrap();
        assert_eq!((first.code.as_str(), second.code.as_str()), ("09X", "09H2"));
    }

    #[test]
    fn rule_tree_parses_from_json() {
        let json = r#"{
            "categories": [{
                "name": "parental",
                "pattern": "programmed",
                "period": { "kind": "child", "ordinal": 1, "from_years": 0, "to_years": 12 },
                "takable": { "amount_type": "units", "taken_codes": ["PAR"], "fixed_limit": 3000 }
            }],
            "codes": [{ "code": "PAR", "justified_kinds": ["all_day"] }]
        }"#;
        let tree = StaticRuleTree::from_json_str(json).expect("valid rule tree");
        let rule = tree.rule_by_name("parental").unwrap();
        assert!(rule.requires_child());
        assert_eq!(tree.absence_code("PAR").unwrap().justified_kinds, vec![JustifiedKind::AllDay]);
    }

    #[test]
    fn previous_year_period_parses_with_its_source() {
        let json = r#"{
            "categories": [{
                "name": "vacations_previous",
                "pattern": "vacations",
                "period": { "kind": "previous_year", "source": "vacations", "usable_until_month": 6 },
                "takable": { "amount_type": "units", "taken_codes": ["VAC"], "fixed_limit": 0 },
                "next": "vacations"
            }]
        }"#;
        let tree = StaticRuleTree::from_json_str(json).expect("valid rule tree");
        let rule = tree.rule_by_name("vacations_previous").unwrap();
        assert_eq!(rule.carry_over_source(), Some("vacations"));
        assert!(!rule.requires_child());
    }
}
