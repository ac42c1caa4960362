// src/errors.rs
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::model::{AbsenceId, CategoryName, Code, DayId, PersonId};
use crate::rules::CategoryPattern;

// --- Recoverable Problems ---

/// Per-record problem. Persisted as a trouble annotation on the record and
/// never aborts a scan.
#[derive(
    Error, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AbsenceProblem {
    #[error("Absence exceeds the takable limit of its period")]
    LimitExceeded,
    #[error("An all-day absence conflicts with another absence on the same date")]
    AllDayAlreadyExists,
    #[error("The same code is recorded more than once on the same date")]
    DuplicateCode,
    #[error("Absence date is not covered by any contract")]
    OutOfContract,
    #[error("No qualifying child exists for this category")]
    NoChildExist,
}

impl AbsenceProblem {
    /// Stable key used in reports and notifications.
    pub fn key(&self) -> &'static str {
        match self {
            AbsenceProblem::LimitExceeded => "LIMIT_EXCEEDED",
            AbsenceProblem::AllDayAlreadyExists => "ALL_DAY_ALREADY_EXISTS",
            AbsenceProblem::DuplicateCode => "DUPLICATE_CODE",
            AbsenceProblem::OutOfContract => "OUT_OF_CONTRACT",
            AbsenceProblem::NoChildExist => "NO_CHILD_EXIST",
        }
    }
}

// --- Critical Problems ---

/// Internal inconsistency of the rule graph or of the numeric state.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CriticalProblem {
    #[error("Category pattern {pattern:?} is not supported by the engine")]
    UnsupportedPattern { pattern: CategoryPattern },
    #[error("Malformed rule graph: {detail}")]
    MalformedRuleGraph { detail: String },
    #[error("Amount of code '{code}' on {date} cannot be computed")]
    IncalculableAmount { code: Code, date: NaiveDate },
    #[error("Replacing codes '{first}' and '{second}' share the same amount {amount}")]
    ConflictingReplacingAmount {
        first: Code,
        second: Code,
        amount: i64,
    },
    #[error("Date {date} falls in more than one period where exactly one is expected")]
    TwoPeriodsWhereOneExpected { date: NaiveDate },
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Critical error in category '{category}' on {date}: {problem}")]
pub struct CriticalError {
    pub category: CategoryName,
    pub date: NaiveDate,
    pub absence: Option<AbsenceId>,
    pub problem: CriticalProblem,
}

// --- Errors Box ---

/// Accumulates problems raised while evaluating chains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorsBox {
    absence_problems: BTreeMap<AbsenceId, BTreeSet<AbsenceProblem>>,
    critical_errors: Vec<CriticalError>,
}

impl ErrorsBox {
    pub fn add_absence_problem(&mut self, absence: AbsenceId, problem: AbsenceProblem) {
        self.absence_problems
            .entry(absence)
            .or_default()
            .insert(problem);
    }

    pub fn add_critical_error(&mut self, error: CriticalError) {
        if !self.critical_errors.contains(&error) {
            self.critical_errors.push(error);
        }
    }

    pub fn absorb(&mut self, other: &ErrorsBox) {
        for (absence, problems) in &other.absence_problems {
            for problem in problems {
                self.add_absence_problem(*absence, *problem);
            }
        }
        for error in &other.critical_errors {
            self.add_critical_error(error.clone());
        }
    }

    pub fn problems_for(&self, absence: AbsenceId) -> BTreeSet<AbsenceProblem> {
        self.absence_problems
            .get(&absence)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, absence: AbsenceId, problem: AbsenceProblem) -> bool {
        self.absence_problems
            .get(&absence)
            .map_or(false, |problems| problems.contains(&problem))
    }

    pub fn absence_problems(&self) -> &BTreeMap<AbsenceId, BTreeSet<AbsenceProblem>> {
        &self.absence_problems
    }

    pub fn critical_errors(&self) -> &[CriticalError] {
        &self.critical_errors
    }

    pub fn has_critical_errors(&self) -> bool {
        !self.critical_errors.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.absence_problems.is_empty() && self.critical_errors.is_empty()
    }
}

// --- Operational Errors ---

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: u64 },
    #[error("Attendance day {day} belongs to person {actual}, not {expected}")]
    PersonMismatch {
        day: DayId,
        expected: PersonId,
        actual: PersonId,
    },
    #[error("Ledger backend error: {0}")]
    Backend(String),
}

/// Failures that stop the enclosing transaction.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Ledger store error: {0}")]
    Store(#[from] StoreError),
    #[error("Contract violation: {0}")]
    Precondition(String),
}
