// src/ledger.rs
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::errors::{AbsenceProblem, CriticalError, ErrorsBox};
use crate::model::{
    AbsenceRecord, AmountType, CategoryName, Code, DateRange, Initialization, JustifiedKind,
    UNITS_PER_DAY,
};
use crate::rules::{CategoryPattern, CategoryRule, CompletionBehaviour, ReplacingCode};

// --- Amounts ---

/// Amount `record` weighs in `amount_type`. `None` when it depends on a
/// working time that is unknown (or on minutes the record does not carry),
/// or when it does not fit in an `i64`.
pub fn absence_amount(
    record: &AbsenceRecord,
    amount_type: AmountType,
    working_minutes: Option<i64>,
) -> Option<i64> {
    let working = working_minutes.filter(|m| *m > 0);
    match (amount_type, record.justified_kind) {
        (_, JustifiedKind::Nothing) => Some(0),
        (AmountType::Units, JustifiedKind::AllDay | JustifiedKind::AssignAllDay) => {
            Some(UNITS_PER_DAY)
        }
        (AmountType::Units, JustifiedKind::HalfDay) => Some(UNITS_PER_DAY / 2),
        (AmountType::Units, JustifiedKind::SpecifiedMinutes) => {
            let minutes = i128::from(record.justified_minutes?);
            let units = minutes * i128::from(UNITS_PER_DAY) / i128::from(working?);
            i64::try_from(units).ok()
        }
        (AmountType::Minutes, JustifiedKind::SpecifiedMinutes) => record.justified_minutes,
        (AmountType::Minutes, JustifiedKind::AllDay | JustifiedKind::AssignAllDay) => working,
        (AmountType::Minutes, JustifiedKind::HalfDay) => working.map(|m| m / 2),
    }
}

// --- Taken Absence ---

/// Evaluation of one record against the period it is charged to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakenAbsence {
    pub absence: AbsenceRecord,
    pub amount_type: AmountType,
    pub period_takable_total: i64,
    pub period_taken_before: i64,
    pub taken_amount: i64,
    pub before_initialization: bool,
}

impl TakenAbsence {
    pub fn can_admit(&self) -> bool {
        if self.before_initialization {
            return true;
        }
        if self.period_takable_total < 0 {
            return true;
        }
        i128::from(self.period_takable_total)
            - i128::from(self.period_taken_before)
            - i128::from(self.taken_amount)
            >= 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionAbsence {
    pub absence: AbsenceRecord,
    pub amount: i64,
}

// --- Day In Period ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayInPeriod {
    pub date: NaiveDate,
    pub taken_absences: Vec<TakenAbsence>,
    pub completion_absences: Vec<CompletionAbsence>,
    pub existent_replacings: Vec<AbsenceRecord>,
    correct_replacing: Option<ReplacingCode>,
    completion_residual_after: i64,
    compromised: bool,
    before_initialization: bool,
}

impl DayInPeriod {
    pub fn new(date: NaiveDate, before_initialization: bool) -> Self {
        Self {
            date,
            taken_absences: Vec::new(),
            completion_absences: Vec::new(),
            existent_replacings: Vec::new(),
            correct_replacing: None,
            completion_residual_after: 0,
            compromised: false,
            before_initialization,
        }
    }

    /// Replacing the rules require on this date.
    pub fn correct_replacing(&self) -> Option<&ReplacingCode> {
        self.correct_replacing.as_ref()
    }

    pub fn is_compromised(&self) -> bool {
        self.compromised
    }

    pub fn is_before_initialization(&self) -> bool {
        self.before_initialization
    }

    pub fn completion_amount(&self) -> i64 {
        self.completion_absences
            .iter()
            .fold(0_i64, |sum, c| sum.saturating_add(c.amount))
    }

    pub fn taken_amount(&self) -> i64 {
        self.taken_absences
            .iter()
            .filter(|t| !t.before_initialization)
            .fold(0_i64, |sum, t| sum.saturating_add(t.taken_amount))
    }

    pub fn completion_residual_after(&self) -> i64 {
        self.completion_residual_after
    }

    /// Existent replacings whose code is not the required one. Days covered
    /// by an initialization snapshot are never judged.
    pub fn existent_wrong_replacing(&self) -> Vec<&AbsenceRecord> {
        if self.before_initialization {
            return Vec::new();
        }
        self.existent_replacings
            .iter()
            .filter(|r| {
                self.correct_replacing
                    .as_ref()
                    .map_or(true, |correct| correct.code != r.code)
            })
            .collect()
    }

    pub fn is_replacing_missing(&self) -> bool {
        if self.compromised || self.before_initialization {
            return false;
        }
        match &self.correct_replacing {
            Some(correct) => !self.existent_replacings.iter().any(|r| r.code == correct.code),
            None => false,
        }
    }
}

// --- Absence Period ---

/// One contiguous application of a category's rules.
#[derive(Debug, Clone)]
pub struct AbsencePeriod {
    pub category: CategoryName,
    pub pattern: CategoryPattern,
    pub automatic: bool,
    pub range: DateRange,
    pub takable_amount_type: Option<AmountType>,
    pub taken_codes: BTreeSet<Code>,
    /// Negative means unlimited.
    pub takable_total: i64,
    taken_total: i64,
    pub completion: Option<CompletionBehaviour>,
    pub initialization: Option<Initialization>,
    days: BTreeMap<NaiveDate, DayInPeriod>,
    compromised_from: Option<NaiveDate>,
    errors: ErrorsBox,
}

impl AbsencePeriod {
    pub fn new(
        rule: &CategoryRule,
        range: DateRange,
        takable_total: i64,
        initialization: Option<Initialization>,
    ) -> Self {
        let takable_total = initialization
            .as_ref()
            .and_then(|i| i.takable_total)
            .unwrap_or(takable_total);
        let taken_total = initialization.as_ref().map_or(0, |i| i.taken_amount);
        Self {
            category: rule.name.clone(),
            pattern: rule.pattern,
            automatic: rule.automatic,
            range,
            takable_amount_type: rule.takable.as_ref().map(|t| t.amount_type),
            taken_codes: rule
                .takable
                .as_ref()
                .map(|t| t.taken_codes.clone())
                .unwrap_or_default(),
            takable_total,
            taken_total,
            completion: rule.completion.clone(),
            initialization,
            days: BTreeMap::new(),
            compromised_from: None,
            errors: ErrorsBox::default(),
        }
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        self.range.contains(date)
    }

    pub fn takes_code(&self, code: &str) -> bool {
        self.taken_codes.contains(code)
    }

    pub fn completes_code(&self, code: &str) -> bool {
        self.completion
            .as_ref()
            .map_or(false, |c| c.completion_codes.contains(code))
    }

    pub fn replaces_code(&self, code: &str) -> bool {
        self.completion
            .as_ref()
            .map_or(false, |c| c.is_replacing_code(code))
    }

    pub fn is_takable_unlimited(&self) -> bool {
        self.takable_total < 0
    }

    /// Running total charged so far (initialization snapshot included).
    pub fn taken_total(&self) -> i64 {
        self.taken_total
    }

    /// `takable_total - taken_total`, saturating; meaningful only for
    /// limited periods.
    pub fn period_residual_before(&self) -> i64 {
        self.takable_total.saturating_sub(self.taken_total)
    }

    pub fn remaining(&self) -> Option<i64> {
        (!self.is_takable_unlimited()).then(|| self.period_residual_before())
    }

    /// Sets a limit known only once records are at hand. An initialization
    /// carrying its own takable total still wins.
    pub fn seed_takable_total(&mut self, total: i64) {
        if self
            .initialization
            .as_ref()
            .map_or(true, |i| i.takable_total.is_none())
        {
            self.takable_total = total;
        }
    }

    pub fn is_before_initialization(&self, date: NaiveDate) -> bool {
        self.initialization
            .as_ref()
            .map_or(false, |i| date < i.date)
    }

    pub fn days(&self) -> impl Iterator<Item = &DayInPeriod> {
        self.days.values()
    }

    pub fn day(&self, date: NaiveDate) -> Option<&DayInPeriod> {
        self.days.get(&date)
    }

    pub fn errors(&self) -> &ErrorsBox {
        &self.errors
    }

    pub fn compromised_from(&self) -> Option<NaiveDate> {
        self.compromised_from
    }

    fn day_mut(&mut self, date: NaiveDate) -> &mut DayInPeriod {
        let before_initialization = self.is_before_initialization(date);
        self.days
            .entry(date)
            .or_insert_with(|| DayInPeriod::new(date, before_initialization))
    }

    pub fn evaluate(&self, record: &AbsenceRecord, taken_amount: i64) -> TakenAbsence {
        TakenAbsence {
            absence: record.clone(),
            amount_type: self.takable_amount_type.unwrap_or(AmountType::Units),
            period_takable_total: self.takable_total,
            period_taken_before: self.taken_total,
            taken_amount,
            before_initialization: self.is_before_initialization(record.date),
        }
    }

    /// Charges the evaluation to the period. Records that do not fit are
    /// still charged and flagged, never dropped.
    pub fn add_taken_absence(&mut self, taken: TakenAbsence) {
        if !taken.can_admit() {
            warn!(
                "Absence {} ({}) on {} exceeds the limit of '{}': total {}, taken before {}, amount {}",
                taken.absence.id,
                taken.absence.code,
                taken.absence.date,
                self.category,
                taken.period_takable_total,
                taken.period_taken_before,
                taken.taken_amount
            );
            self.errors
                .add_absence_problem(taken.absence.id, AbsenceProblem::LimitExceeded);
        }
        if !taken.before_initialization {
            self.taken_total = self.taken_total.saturating_add(taken.taken_amount);
        }
        let date = taken.absence.date;
        self.day_mut(date).taken_absences.push(taken);
    }

    pub fn add_completion_absence(&mut self, absence: &AbsenceRecord, amount: i64) {
        self.day_mut(absence.date)
            .completion_absences
            .push(CompletionAbsence {
                absence: absence.clone(),
                amount,
            });
    }

    pub fn add_existent_replacing(&mut self, absence: &AbsenceRecord) {
        self.day_mut(absence.date)
            .existent_replacings
            .push(absence.clone());
    }

    /// Marks the period compromised from the error date onward.
    pub fn compromise(&mut self, error: CriticalError) {
        let from = match self.compromised_from {
            Some(existing) => existing.min(error.date),
            None => error.date,
        };
        warn!(
            "Period '{}' {}..{} compromised from {}: {}",
            self.category, self.range.begin, self.range.end, from, error
        );
        self.compromised_from = Some(from);
        self.errors.add_critical_error(error);
    }

    /// Walks the days in order accumulating completion amounts and decides
    /// which replacing each day requires.
    pub fn compute_replacings(&mut self) {
        let Some(completion) = &self.completion else {
            return;
        };
        let compromised_from = self.compromised_from;
        let mut residual = self
            .initialization
            .as_ref()
            .map_or(0, |i| i.completion_amount);

        for (date, day) in self.days.iter_mut() {
            if day.before_initialization {
                continue;
            }
            if compromised_from.map_or(false, |from| *date >= from) {
                day.compromised = true;
                day.correct_replacing = None;
                continue;
            }
            residual = residual.saturating_add(day.completion_amount());
            day.correct_replacing = completion.best_replacing(residual).cloned();
            if let Some(replacing) = &day.correct_replacing {
                residual = residual.saturating_sub(replacing.amount);
            }
            day.completion_residual_after = residual;
        }
        debug!(
            "Replacings computed for '{}' {}..{}: residual {}",
            self.category, self.range.begin, self.range.end, residual
        );
    }

    /// Completion residual left after the last evaluated day.
    pub fn completion_residual(&self) -> Option<i64> {
        self.completion.as_ref()?;
        let initial = self
            .initialization
            .as_ref()
            .map_or(0, |i| i.completion_amount);
        Some(
            self.days
                .values()
                .filter(|d| !d.before_initialization && !d.compromised)
                .last()
                .map_or(initial, |d| d.completion_residual_after),
        )
    }

    pub fn summary(&self) -> PeriodSummary {
        PeriodSummary {
            category: self.category.clone(),
            begin: self.range.begin,
            end: self.range.end,
            amount_type: self.takable_amount_type,
            takable_total: self.takable_total,
            taken_total: self.taken_total,
            remaining: self.remaining(),
            completion_residual: self.completion_residual(),
            compromised: self.compromised_from.is_some(),
        }
    }
}

/// Read-only balance view of a period for reports and recap builders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodSummary {
    pub category: CategoryName,
    pub begin: NaiveDate,
    pub end: NaiveDate,
    pub amount_type: Option<AmountType>,
    pub takable_total: i64,
    pub taken_total: i64,
    pub remaining: Option<i64>,
    pub completion_residual: Option<i64>,
    pub compromised: bool,
}
