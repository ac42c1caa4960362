// src/model.rs
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::errors::AbsenceProblem;

// --- Identifiers ---

pub type PersonId = u64;
pub type AbsenceId = u64;
pub type TroubleId = u64;
pub type DayId = u64;
pub type DependentId = u64;
pub type Code = String;
pub type CategoryName = String;

// --- Justification & Amounts ---

/// How an absence justifies the working day it falls on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JustifiedKind {
    SpecifiedMinutes,
    AllDay,
    AssignAllDay,
    HalfDay,
    /// Justifies nothing; used by replacing records.
    Nothing,
}

impl JustifiedKind {
    pub fn is_no_amount(self) -> bool {
        matches!(self, JustifiedKind::Nothing)
    }

    pub fn is_all_day(self) -> bool {
        matches!(self, JustifiedKind::AllDay | JustifiedKind::AssignAllDay)
    }
}

/// Unit in which a category counts entitlement.
/// `Units` are hundredths of a day (100 = one full day).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountType {
    Units,
    Minutes,
}

pub const UNITS_PER_DAY: i64 = 100;

// --- Absence Records ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsenceRecord {
    pub id: AbsenceId,
    pub person: PersonId,
    pub code: Code,
    pub date: NaiveDate,
    pub justified_kind: JustifiedKind,
    #[serde(default)]
    pub justified_minutes: Option<i64>,
    #[serde(default)]
    pub attendance_day: Option<DayId>,
}

/// An absence not yet persisted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAbsence {
    pub person: PersonId,
    pub code: Code,
    pub date: NaiveDate,
    pub justified_kind: JustifiedKind,
    pub justified_minutes: Option<i64>,
    pub attendance_day: Option<DayId>,
}

/// Persisted record of a currently detected recoverable problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroubleAnnotation {
    pub id: TroubleId,
    pub absence: AbsenceId,
    pub problem: AbsenceProblem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceDay {
    pub id: DayId,
    pub person: PersonId,
    pub date: NaiveDate,
}

// --- Person Context ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub begin: NaiveDate,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl Contract {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.begin && self.end.map_or(true, |end| date <= end)
    }

    pub fn range(&self) -> DateRange {
        DateRange::new(self.begin, self.end.unwrap_or(NaiveDate::MAX))
    }
}

/// A dependent (child) some categories are bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependent {
    pub id: DependentId,
    pub birth_date: NaiveDate,
    /// Flagged dependents never qualify for child-bound categories.
    #[serde(default)]
    pub excluded: bool,
}

/// Administratively entered balance snapshot for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initialization {
    pub category: CategoryName,
    pub date: NaiveDate,
    /// Amount already taken in the period as of `date`.
    #[serde(default)]
    pub taken_amount: i64,
    /// Completion residual carried in as of `date`.
    #[serde(default)]
    pub completion_amount: i64,
    /// Replaces the computed takable total when present.
    #[serde(default)]
    pub takable_total: Option<i64>,
}

// --- Date Ranges ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub begin: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(begin: NaiveDate, end: NaiveDate) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.begin && date <= self.end
    }

    /// Overlap of two ranges, `None` when they are disjoint.
    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        (begin <= end).then(|| DateRange::new(begin, end))
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &DateRange) -> DateRange {
        DateRange::new(self.begin.min(other.begin), self.end.max(other.end))
    }

    /// Inclusive day count.
    pub fn days(&self) -> i64 {
        (self.end - self.begin).num_days() + 1
    }

    pub fn year_of(date: NaiveDate) -> Option<DateRange> {
        let begin = NaiveDate::from_ymd_opt(date.year(), 1, 1)?;
        let end = NaiveDate::from_ymd_opt(date.year(), 12, 31)?;
        Some(DateRange::new(begin, end))
    }

    pub fn month_of(date: NaiveDate) -> Option<DateRange> {
        let begin = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?;
        let next_month = if date.month() == 12 {
            NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)?
        };
        Some(DateRange::new(begin, next_month.pred_opt()?))
    }
}
