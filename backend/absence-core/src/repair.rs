// src/repair.rs
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::chain::PeriodChain;
use crate::errors::{ScanError, StoreError};
use crate::model::{AbsenceId, AbsenceRecord, CategoryName, Code, JustifiedKind, NewAbsence, PersonId};
use crate::rules::RuleTreeProvider;
use crate::store::{AttendanceDays, LedgerStore};

// --- Plan ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedDeletion {
    pub category: CategoryName,
    pub absence: AbsenceId,
    pub code: Code,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedReplacing {
    pub category: CategoryName,
    pub date: NaiveDate,
    pub code: Code,
    pub justified_kind: JustifiedKind,
}

/// Mutations that bring the replacing records of a chain in line with its
/// completion state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairPlan {
    pub person: PersonId,
    pub deletions: Vec<PlannedDeletion>,
    pub insertions: Vec<PlannedReplacing>,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.insertions.is_empty()
    }
}

/// Plans the repair of every automatic period of `chain`. Compromised days
/// are left alone.
pub fn plan_repair<R: RuleTreeProvider>(
    chain: &PeriodChain,
    rules: &R,
) -> Result<RepairPlan, ScanError> {
    let mut plan = RepairPlan {
        person: chain.person,
        deletions: Vec::new(),
        insertions: Vec::new(),
    };
    let mut planned_deletions: BTreeSet<AbsenceId> = BTreeSet::new();

    for period in chain.periods.iter().filter(|p| p.automatic) {
        for day in period.days().filter(|d| !d.is_compromised()) {
            for wrong in day.existent_wrong_replacing() {
                if planned_deletions.insert(wrong.id) {
                    plan.deletions.push(PlannedDeletion {
                        category: period.category.clone(),
                        absence: wrong.id,
                        code: wrong.code.clone(),
                        date: wrong.date,
                    });
                }
            }
            if !day.is_replacing_missing() {
                continue;
            }
            let Some(correct) = day.correct_replacing() else {
                continue;
            };
            plan.insertions.push(PlannedReplacing {
                category: period.category.clone(),
                date: day.date,
                code: correct.code.clone(),
                justified_kind: replacing_kind(rules, &correct.code)?,
            });
        }
    }

    debug!(
        "Repair plan for chain '{}' (person {}): {} deletions, {} insertions",
        chain.category,
        chain.person,
        plan.deletions.len(),
        plan.insertions.len()
    );
    Ok(plan)
}

/// The single no-amount justification a replacing code may carry.
fn replacing_kind<R: RuleTreeProvider>(rules: &R, code: &str) -> Result<JustifiedKind, ScanError> {
    let absence_code = rules.absence_code(code).ok_or_else(|| {
        ScanError::Precondition(format!("replacing code '{}' is not in the code catalog", code))
    })?;
    match absence_code.no_amount_kinds().as_slice() {
        [kind] => Ok(*kind),
        [] => Err(ScanError::Precondition(format!(
            "replacing code '{}' allows no no-amount justification",
            code
        ))),
        kinds => Err(ScanError::Precondition(format!(
            "replacing code '{}' allows {} no-amount justifications, expected one",
            code,
            kinds.len()
        ))),
    }
}

// --- Apply ---

/// Result of a mutation targeting a record that may have been removed
/// earlier in the same scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Applied {
    Done,
    SkippedRemoved,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairOutcome {
    pub deleted: Vec<AbsenceId>,
    pub skipped: Vec<AbsenceId>,
    pub inserted: Vec<AbsenceRecord>,
}

impl RepairOutcome {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.skipped.is_empty() && self.inserted.is_empty()
    }
}

pub fn delete_replacing<S: LedgerStore>(store: &mut S, id: AbsenceId) -> Result<Applied, StoreError> {
    if store.delete_absence(id)? {
        Ok(Applied::Done)
    } else {
        Ok(Applied::SkippedRemoved)
    }
}

pub fn apply_repair<S>(plan: &RepairPlan, store: &mut S) -> Result<RepairOutcome, ScanError>
where
    S: LedgerStore + AttendanceDays,
{
    let mut outcome = RepairOutcome::default();

    for deletion in &plan.deletions {
        match delete_replacing(store, deletion.absence)? {
            Applied::Done => {
                info!(
                    "Deleted wrong replacing {} ({}) on {} in '{}'",
                    deletion.absence, deletion.code, deletion.date, deletion.category
                );
                outcome.deleted.push(deletion.absence);
            }
            Applied::SkippedRemoved => {
                warn!(
                    "Replacing {} ({}) on {} was already removed, skipping",
                    deletion.absence, deletion.code, deletion.date
                );
                outcome.skipped.push(deletion.absence);
            }
        }
    }

    for insertion in &plan.insertions {
        let day = store.get_or_create_day(plan.person, insertion.date)?;
        let record = store.insert_absence(NewAbsence {
            person: plan.person,
            code: insertion.code.clone(),
            date: insertion.date,
            justified_kind: insertion.justified_kind,
            justified_minutes: None,
            attendance_day: Some(day),
        })?;
        info!(
            "Inserted replacing {} ({}) on {} in '{}'",
            record.id, record.code, record.date, insertion.category
        );
        outcome.inserted.push(record);
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainBuilder, ChainRequest};
    use crate::model::Contract;
    use crate::rules::{AbsenceCode, StaticRuleTree};
    use crate::store::{FixedWorkingTime, InMemoryLedger};
    use crate::test_support::*;

    fn setup_test_environment() -> (StaticRuleTree, FixedWorkingTime, Vec<Contract>) {
        (
            rule_tree(),
            FixedWorkingTime::uniform(432),
            vec![open_contract("2020-01-01")],
        )
    }

    fn chain_for(
        rules: &StaticRuleTree,
        working: &FixedWorkingTime,
        contracts: &[Contract],
        ledger: &InMemoryLedger,
        date: &str,
    ) -> PeriodChain {
        let request = ChainRequest {
            person: PERSON,
            category: "hourly_permits",
            date: d(date),
            contracts,
            dependents: &[],
            initializations: &[],
        };
        ChainBuilder::new(rules, working)
            .build(&request, &ledger.all_absences())
            .expect("chain builds")
    }

    #[test]
    fn missing_replacing_is_planned_and_inserted_on_the_attendance_day() {
        let (rules, working, contracts) = setup_test_environment();
        let mut ledger = InMemoryLedger::new();
        ledger.seed_absence(minutes(1, "09M", "2024-04-01", 45));
        ledger.seed_absence(minutes(2, "09M", "2024-04-02", 30));

        let chain = chain_for(&rules, &working, &contracts, &ledger, "2024-04-01");
        let plan = plan_repair(&chain, &rules).unwrap();
        assert!(plan.deletions.is_empty());
        assert_eq!(
            plan.insertions,
            vec![PlannedReplacing {
                category: "hourly_permits".into(),
                date: d("2024-04-02"),
                code: "09H1".into(),
                justified_kind: JustifiedKind::Nothing,
            }]
        );

        let outcome = apply_repair(&plan, &mut ledger).unwrap();
        let inserted = &outcome.inserted[0];
        assert_eq!(inserted.code, "09H1");
        assert_eq!(inserted.attendance_day, ledger.day_id(PERSON, d("2024-04-02")));
        assert!(inserted.attendance_day.is_some());
    }

    #[test]
    fn repaired_chain_plans_nothing() {
        let (rules, working, contracts) = setup_test_environment();
        let mut ledger = InMemoryLedger::new();
        ledger.seed_absence(minutes(1, "09M", "2024-04-01", 130));
        ledger.seed_absence(record(2, "09H1", "2024-04-01", JustifiedKind::Nothing));

        let chain = chain_for(&rules, &working, &contracts, &ledger, "2024-04-01");
        let plan = plan_repair(&chain, &rules).unwrap();
        assert_eq!(plan.deletions.len(), 1, "09H1 is wrong for 130 minutes");
        assert_eq!(plan.insertions[0].code, "09H2");
        apply_repair(&plan, &mut ledger).unwrap();

        let chain = chain_for(&rules, &working, &contracts, &ledger, "2024-04-01");
        let plan = plan_repair(&chain, &rules).unwrap();
        assert!(plan.is_empty(), "second plan should be empty, got {:?}", plan);
    }

    #[test]
    fn non_automatic_categories_are_not_repaired() {
        let (_, working, contracts) = setup_test_environment();
        let mut hourly = hourly_rule();
        hourly.automatic = false;
        let rules = StaticRuleTree::new(
            vec![hourly],
            vec![AbsenceCode {
                code: "09H1".into(),
                description: String::new(),
                justified_kinds: vec![JustifiedKind::Nothing],
            }],
        );
        let mut ledger = InMemoryLedger::new();
        ledger.seed_absence(minutes(1, "09M", "2024-04-01", 60));

        let chain = chain_for(&rules, &working, &contracts, &ledger, "2024-04-01");
        assert!(plan_repair(&chain, &rules).unwrap().is_empty());
    }

    #[test]
    fn replacing_code_without_unique_no_amount_kind_violates_precondition() {
        let (_, working, contracts) = setup_test_environment();
        let rules = StaticRuleTree::new(
            vec![hourly_rule()],
            vec![AbsenceCode {
                code: "09H1".into(),
                description: String::new(),
                justified_kinds: vec![JustifiedKind::AllDay],
            }],
        );
        let mut ledger = InMemoryLedger::new();
        ledger.seed_absence(minutes(1, "09M", "2024-04-01", 60));

        let chain = chain_for(&rules, &working, &contracts, &ledger, "2024-04-01");
        let err = plan_repair(&chain, &rules).unwrap_err();
        assert!(matches!(err, ScanError::Precondition(msg) if msg.contains("09H1")));
    }

    #[test]
    fn deleting_an_already_removed_record_is_skipped() {
        let mut ledger = InMemoryLedger::new();
        ledger.seed_absence(record(5, "09H2", "2024-04-01", JustifiedKind::Nothing));
        let plan = RepairPlan {
            person: PERSON,
            deletions: vec![
                PlannedDeletion {
                    category: "hourly_permits".into(),
                    absence: 5,
                    code: "09H2".into(),
                    date: d("2024-04-01"),
                },
                PlannedDeletion {
                    category: "hourly_permits".into(),
                    absence: 5,
                    code: "09H2".into(),
                    date: d("2024-04-01"),
                },
            ],
            insertions: vec![],
        };

        let outcome = apply_repair(&plan, &mut ledger).unwrap();
        assert_eq!(outcome.deleted, vec![5]);
        assert_eq!(outcome.skipped, vec![5]);
    }
}
