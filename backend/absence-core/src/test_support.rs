// src/test_support.rs
// Fixtures shared by the unit tests of several modules.
use chrono::NaiveDate;
use std::collections::BTreeSet;

use crate::model::{AbsenceRecord, AmountType, Contract, JustifiedKind, PersonId};
use crate::rules::{
    AbsenceCode, CategoryPattern, CategoryRule, CompletionBehaviour, PeriodKind, ReplacingCode,
    StaticRuleTree, TakableBehaviour,
};

pub const PERSON: PersonId = 1;

pub fn d(date_str: &str) -> NaiveDate {
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .unwrap_or_else(|_| panic!("Invalid date string format: {}", date_str))
}

pub fn open_contract(begin: &str) -> Contract {
    Contract {
        begin: d(begin),
        end: None,
    }
}

pub fn closed_contract(begin: &str, end: &str) -> Contract {
    Contract {
        begin: d(begin),
        end: Some(d(end)),
    }
}

pub fn record(id: u64, code: &str, date: &str, kind: JustifiedKind) -> AbsenceRecord {
    AbsenceRecord {
        id,
        person: PERSON,
        code: code.to_string(),
        date: d(date),
        justified_kind: kind,
        justified_minutes: None,
        attendance_day: None,
    }
}

pub fn all_day(id: u64, code: &str, date: &str) -> AbsenceRecord {
    record(id, code, date, JustifiedKind::AllDay)
}

pub fn minutes(id: u64, code: &str, date: &str, minutes: i64) -> AbsenceRecord {
    AbsenceRecord {
        justified_minutes: Some(minutes),
        ..record(id, code, date, JustifiedKind::SpecifiedMinutes)
    }
}

pub fn programmed_rule(
    name: &str,
    codes: &[&str],
    limit: i64,
    period: PeriodKind,
    next: Option<&str>,
) -> CategoryRule {
    CategoryRule {
        name: name.to_string(),
        description: String::new(),
        pattern: CategoryPattern::Programmed,
        period,
        takable: Some(TakableBehaviour {
            amount_type: AmountType::Units,
            taken_codes: codes.iter().map(|c| c.to_string()).collect(),
            fixed_limit: limit,
        }),
        completion: None,
        next: next.map(String::from),
        automatic: false,
        initializable: true,
    }
}

pub fn hourly_rule() -> CategoryRule {
    CategoryRule {
        name: "hourly_permits".into(),
        description: "Hourly permits completed into replacing records".into(),
        pattern: CategoryPattern::Programmed,
        period: PeriodKind::Year,
        takable: Some(TakableBehaviour {
            amount_type: AmountType::Minutes,
            taken_codes: BTreeSet::from(["09M".to_string()]),
            fixed_limit: 1080,
        }),
        completion: Some(CompletionBehaviour {
            amount_type: AmountType::Minutes,
            completion_codes: BTreeSet::from(["09M".to_string()]),
            replacing_codes: vec![
                ReplacingCode { code: "09H1".into(), amount: 60 },
                ReplacingCode { code: "09H2".into(), amount: 120 },
            ],
        }),
        next: None,
        automatic: true,
        initializable: true,
    }
}

fn code(code: &str, kinds: &[JustifiedKind]) -> AbsenceCode {
    AbsenceCode {
        code: code.to_string(),
        description: String::new(),
        justified_kinds: kinds.to_vec(),
    }
}

/// Rule tree used across scanner and chain tests:
///
/// * `leave_current` (5 days a year) chains to `leave_extra` (2 days a year), code `LV`
/// * `hourly_permits`: 18 hours a year of `09M`, completed into `09H1`/`09H2`
/// * `parental_first_child`: 30 days of `PC1` until the first child turns 12
/// * `sick_leave`: unlimited `SK`
/// * `vacations_previous`: what `vacations` left unused last year, usable
///   until the end of June, chained to `vacations`
/// * `vacations`: 28 days a year of `VAC`, accrued over the contract
/// * `comp_rest`: compensatory rest on `CR`
pub fn rule_tree() -> StaticRuleTree {
    let mut vacations = programmed_rule("vacations", &["VAC"], 2800, PeriodKind::Year, None);
    vacations.pattern = CategoryPattern::Vacations;
    let mut vacations_previous = programmed_rule(
        "vacations_previous",
        &["VAC"],
        0,
        PeriodKind::PreviousYear {
            source: "vacations".into(),
            usable_until_month: 6,
        },
        Some("vacations"),
    );
    vacations_previous.pattern = CategoryPattern::Vacations;
    let mut comp_rest = programmed_rule("comp_rest", &["CR"], 500, PeriodKind::Year, None);
    comp_rest.pattern = CategoryPattern::CompensatoryRest;

    StaticRuleTree::new(
        vec![
            programmed_rule("leave_current", &["LV"], 500, PeriodKind::Year, Some("leave_extra")),
            programmed_rule("leave_extra", &["LV"], 200, PeriodKind::Year, None),
            hourly_rule(),
            programmed_rule(
                "parental_first_child",
                &["PC1"],
                3000,
                PeriodKind::Child {
                    ordinal: 1,
                    from_years: 0,
                    to_years: 12,
                },
                None,
            ),
            programmed_rule("sick_leave", &["SK"], -1, PeriodKind::Year, None),
            vacations_previous,
            vacations,
            comp_rest,
        ],
        vec![
            code("LV", &[JustifiedKind::AllDay, JustifiedKind::HalfDay]),
            code("09M", &[JustifiedKind::SpecifiedMinutes]),
            code("09H1", &[JustifiedKind::Nothing]),
            code("09H2", &[JustifiedKind::Nothing]),
            code("PC1", &[JustifiedKind::AllDay]),
            code("SK", &[JustifiedKind::AllDay]),
            code("VAC", &[JustifiedKind::AllDay, JustifiedKind::HalfDay]),
            code("CR", &[JustifiedKind::AllDay]),
        ],
    )
}
