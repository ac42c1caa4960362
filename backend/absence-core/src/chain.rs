// src/chain.rs
use chrono::{Datelike, Months, NaiveDate};
use rust_decimal::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::errors::{CriticalError, CriticalProblem, ErrorsBox};
use crate::ledger::{absence_amount, AbsencePeriod, PeriodSummary};
use crate::model::{
    AbsenceId, AbsenceRecord, AmountType, CategoryName, Code, Contract, DateRange, Dependent,
    Initialization, PersonId, UNITS_PER_DAY,
};
use crate::rules::{CategoryPattern, CategoryRule, PeriodKind, RuleTreeProvider};
use crate::store::WorkingTime;

// --- Period Chain ---

/// Ordered periods governing one category chain around a pivot date.
#[derive(Debug, Clone)]
pub struct PeriodChain {
    pub person: PersonId,
    pub category: CategoryName,
    pub date: NaiveDate,
    pub periods: Vec<AbsencePeriod>,
    pub child_is_missing: bool,
    pub errors: ErrorsBox,
    participants: BTreeSet<AbsenceId>,
    /// Earlier days whose records feed carry-over links.
    history: Option<DateRange>,
    carry_overs: Vec<CarryOver>,
}

/// Carry-over link waiting for its limit: what `source` left unused in the
/// year before `year`.
#[derive(Debug, Clone)]
struct CarryOver {
    period: usize,
    carry: CategoryName,
    source: CategoryName,
    usable_until_month: u32,
    year: i32,
    contracts: Vec<Contract>,
    initializations: Vec<Initialization>,
}

impl PeriodChain {
    fn new(person: PersonId, category: &str, date: NaiveDate) -> Self {
        Self {
            person,
            category: category.to_string(),
            date,
            periods: Vec::new(),
            child_is_missing: false,
            errors: ErrorsBox::default(),
            participants: BTreeSet::new(),
            history: None,
            carry_overs: Vec::new(),
        }
    }

    /// Span from the earliest period begin to the latest period end.
    pub fn range(&self) -> Option<DateRange> {
        self.periods
            .iter()
            .map(|p| p.range)
            .reduce(|acc, range| acc.union(&range))
    }

    /// Days whose records the chain needs: its periods plus, for carry-over
    /// links, the earlier years replayed to compute their limits.
    pub fn records_range(&self) -> Option<DateRange> {
        match (self.range(), self.history) {
            (Some(range), Some(history)) => Some(range.union(&history)),
            (range, history) => range.or(history),
        }
    }

    pub fn involved_codes(&self) -> BTreeSet<Code> {
        let mut codes = BTreeSet::new();
        for period in &self.periods {
            codes.extend(period.taken_codes.iter().cloned());
            if let Some(completion) = &period.completion {
                codes.extend(completion.completion_codes.iter().cloned());
                codes.extend(completion.replacing_codes.iter().map(|r| r.code.clone()));
            }
        }
        codes
    }

    pub fn categories(&self) -> Vec<&str> {
        self.periods.iter().map(|p| p.category.as_str()).collect()
    }

    /// Records charged to, completing, or replacing in any period.
    pub fn participants(&self) -> &BTreeSet<AbsenceId> {
        &self.participants
    }

    pub fn period(&self, category: &str) -> Option<&AbsencePeriod> {
        self.periods.iter().find(|p| p.category == category)
    }

    pub fn is_compromised(&self) -> bool {
        self.periods.iter().any(|p| p.compromised_from().is_some())
    }

    /// Entitlement left across the whole chain, `None` if any period is
    /// unlimited.
    pub fn residual(&self) -> Option<i64> {
        self.periods
            .iter()
            .filter(|p| p.takable_amount_type.is_some())
            .try_fold(0_i64, |sum, p| {
                p.remaining().map(|r| sum.saturating_add(r.max(0)))
            })
    }

    pub fn summaries(&self) -> Vec<PeriodSummary> {
        self.periods.iter().map(|p| p.summary()).collect()
    }
}

// --- Chain Builder ---

/// Inputs describing the pivot of a chain.
#[derive(Debug, Clone, Copy)]
pub struct ChainRequest<'a> {
    pub person: PersonId,
    pub category: &'a str,
    pub date: NaiveDate,
    pub contracts: &'a [Contract],
    pub dependents: &'a [Dependent],
    pub initializations: &'a [Initialization],
}

pub struct ChainBuilder<'a, R, W> {
    rules: &'a R,
    working: &'a W,
}

impl<'a, R: RuleTreeProvider, W: WorkingTime> ChainBuilder<'a, R, W> {
    pub fn new(rules: &'a R, working: &'a W) -> Self {
        Self { rules, working }
    }

    /// Builds the chain and charges `prior_absences` to it. Pure: the same
    /// inputs always yield the same chain.
    pub fn build(
        &self,
        request: &ChainRequest<'_>,
        prior_absences: &[AbsenceRecord],
    ) -> Result<PeriodChain, CriticalError> {
        let mut chain = self.build_periods(request)?;
        self.populate(&mut chain, prior_absences)?;
        Ok(chain)
    }

    /// Builds the empty periods of the chain.
    pub fn build_periods(&self, request: &ChainRequest<'_>) -> Result<PeriodChain, CriticalError> {
        let critical = |problem: CriticalProblem| CriticalError {
            category: request.category.to_string(),
            date: request.date,
            absence: None,
            problem,
        };

        let start = self.rules.rule_by_name(request.category).ok_or_else(|| {
            critical(CriticalProblem::MalformedRuleGraph {
                detail: format!("unknown category '{}'", request.category),
            })
        })?;
        let head = self.rules.first_of_chain(start);
        let mut chain = PeriodChain::new(request.person, request.category, request.date);

        let Some(contract) = request.contracts.iter().find(|c| c.contains(request.date)) else {
            debug!(
                "No contract covers {} for person {}, chain '{}' left empty",
                request.date, request.person, request.category
            );
            return Ok(chain);
        };

        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut reached_start = false;
        let mut current = Some(head);

        while let Some(rule) = current {
            if !visited.insert(rule.name.as_str()) {
                return Err(critical(CriticalProblem::MalformedRuleGraph {
                    detail: format!("category '{}' appears twice in its chain", rule.name),
                }));
            }
            reached_start |= rule.name == start.name;
            self.check_rule(rule).map_err(critical)?;

            let Some(natural) = self.natural_range(rule, request, contract).map_err(critical)?
            else {
                debug!(
                    "No qualifying child for '{}' on {} (person {})",
                    rule.name, request.date, request.person
                );
                chain.child_is_missing = true;
                chain.periods.clear();
                chain.carry_overs.clear();
                chain.history = None;
                return Ok(chain);
            };
            let Some(range) = natural.intersect(&contract.range()) else {
                if rule.carry_over_source().is_none() {
                    return Err(critical(CriticalProblem::MalformedRuleGraph {
                        detail: format!("period of '{}' does not meet the contract", rule.name),
                    }));
                }
                debug!(
                    "Carry-over window of '{}' lies outside the contract, link skipped",
                    rule.name
                );
                current = self.successor(rule).map_err(critical)?;
                continue;
            };

            let takable_total = match &rule.period {
                PeriodKind::PreviousYear {
                    source,
                    usable_until_month,
                } => {
                    // Known once the earlier records are at hand.
                    chain.carry_overs.push(CarryOver {
                        period: chain.periods.len(),
                        carry: rule.name.clone(),
                        source: source.clone(),
                        usable_until_month: *usable_until_month,
                        year: request.date.year(),
                        contracts: request.contracts.to_vec(),
                        initializations: request.initializations.to_vec(),
                    });
                    if let Some(history) = history_before(request.contracts, natural.begin) {
                        chain.history =
                            Some(chain.history.map_or(history, |prev| prev.union(&history)));
                    }
                    0
                }
                _ => takable_total(rule, &natural, &range),
            };
            let initialization = initialization_for(rule, &range, request.initializations);
            debug!(
                "Period '{}' {}..{} takable {} (init: {:?})",
                rule.name, range.begin, range.end, takable_total, initialization
            );
            chain
                .periods
                .push(AbsencePeriod::new(rule, range, takable_total, initialization));

            if reached_start && rule.is_takable_unlimited() {
                // Unlimited link absorbs everything; successors are unreachable.
                break;
            }
            current = self.successor(rule).map_err(critical)?;
        }

        Ok(chain)
    }

    fn successor(&self, rule: &CategoryRule) -> Result<Option<&'a CategoryRule>, CriticalProblem> {
        let Some(next) = &rule.next else {
            return Ok(None);
        };
        self.rules
            .rule_by_name(next)
            .map(Some)
            .ok_or_else(|| CriticalProblem::MalformedRuleGraph {
                detail: format!("'{}' chains to unknown category '{}'", rule.name, next),
            })
    }

    fn check_rule(&self, rule: &CategoryRule) -> Result<(), CriticalProblem> {
        match rule.pattern {
            CategoryPattern::Programmed | CategoryPattern::Vacations => {}
            CategoryPattern::CompensatoryRest => {
                return Err(CriticalProblem::UnsupportedPattern {
                    pattern: rule.pattern,
                })
            }
        }
        if rule.takable.is_none() && rule.completion.is_none() {
            return Err(CriticalProblem::MalformedRuleGraph {
                detail: format!("'{}' has neither takable nor completion rules", rule.name),
            });
        }
        if let Some((first, second)) = rule.completion.as_ref().and_then(|c| c.conflicting_amounts())
        {
            return Err(CriticalProblem::ConflictingReplacingAmount {
                first: first.code.clone(),
                second: second.code.clone(),
                amount: first.amount,
            });
        }
        if let PeriodKind::PreviousYear {
            source,
            usable_until_month,
        } = &rule.period
        {
            self.check_carry_over(rule, source, *usable_until_month)?;
        }
        Ok(())
    }

    fn check_carry_over(
        &self,
        rule: &CategoryRule,
        source: &str,
        usable_until_month: u32,
    ) -> Result<(), CriticalProblem> {
        let malformed = |detail: String| CriticalProblem::MalformedRuleGraph { detail };
        if !(1..=12).contains(&usable_until_month) {
            return Err(malformed(format!(
                "'{}' is usable until month {}",
                rule.name, usable_until_month
            )));
        }
        let source_rule = self.rules.rule_by_name(source).ok_or_else(|| {
            malformed(format!("'{}' carries over unknown category '{}'", rule.name, source))
        })?;
        let limited = |r: &CategoryRule| {
            r.takable
                .as_ref()
                .filter(|t| !t.is_unlimited())
                .map(|t| t.amount_type)
        };
        match (limited(rule), limited(source_rule)) {
            (Some(own), Some(carried))
                if own == carried && source_rule.carry_over_source().is_none() =>
            {
                Ok(())
            }
            _ => Err(malformed(format!(
                "'{}' cannot carry over '{}': both need limits in the same unit",
                rule.name, source
            ))),
        }
    }

    /// Period the rule describes around the pivot, before contract clipping.
    /// `Ok(None)` when a child-bound rule has no qualifying child.
    fn natural_range(
        &self,
        rule: &CategoryRule,
        request: &ChainRequest<'_>,
        contract: &Contract,
    ) -> Result<Option<DateRange>, CriticalProblem> {
        let overflow = || CriticalProblem::MalformedRuleGraph {
            detail: format!("period of '{}' overflows the calendar", rule.name),
        };
        let range = match &rule.period {
            PeriodKind::Always => contract.range(),
            PeriodKind::Year => DateRange::year_of(request.date).ok_or_else(overflow)?,
            PeriodKind::Month => DateRange::month_of(request.date).ok_or_else(overflow)?,
            PeriodKind::PreviousYear {
                usable_until_month, ..
            } => carry_window(request.date.year(), *usable_until_month).ok_or_else(overflow)?,
            PeriodKind::Child {
                ordinal,
                from_years,
                to_years,
            } => {
                let mut qualifying: Vec<&Dependent> =
                    request.dependents.iter().filter(|d| !d.excluded).collect();
                qualifying.sort_by_key(|d| (d.birth_date, d.id));
                let Some(child) = ordinal.checked_sub(1).and_then(|i| qualifying.get(i)) else {
                    return Ok(None);
                };
                let begin = child
                    .birth_date
                    .checked_add_months(Months::new(*from_years * 12))
                    .ok_or_else(overflow)?;
                let end = child
                    .birth_date
                    .checked_add_months(Months::new(*to_years * 12))
                    .and_then(|d| d.pred_opt())
                    .ok_or_else(overflow)?;
                if begin > end {
                    return Err(CriticalProblem::MalformedRuleGraph {
                        detail: format!("child period of '{}' is empty", rule.name),
                    });
                }
                let range = DateRange::new(begin, end);
                if !range.contains(request.date) {
                    return Ok(None);
                }
                range
            }
        };
        Ok(Some(range))
    }

    /// Charges every relevant record to the chain, in date order.
    pub fn populate(
        &self,
        chain: &mut PeriodChain,
        absences: &[AbsenceRecord],
    ) -> Result<(), CriticalError> {
        if chain.child_is_missing {
            return Ok(());
        }
        let Some(range) = chain.range() else {
            return Ok(());
        };
        for carry_over in chain.carry_overs.clone() {
            self.seed_carry_over(chain, &carry_over, absences);
        }
        let codes = chain.involved_codes();
        let mut ordered: Vec<&AbsenceRecord> = absences
            .iter()
            .filter(|a| a.person == chain.person && range.contains(a.date) && codes.contains(&a.code))
            .collect();
        ordered.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));

        for absence in ordered {
            let taken = self.dispatch_taken(chain, absence);
            let completed = self.assign_completion(chain, absence)?;
            if taken || completed {
                chain.participants.insert(absence.id);
            }
        }

        for period in &mut chain.periods {
            period.compute_replacings();
            chain.errors.absorb(period.errors());
        }
        debug!(
            "Chain '{}' on {} populated: {} periods, {} participants",
            chain.category,
            chain.date,
            chain.periods.len(),
            chain.participants.len()
        );
        Ok(())
    }

    /// Seeds a carry-over link with what its source left unused in the year
    /// before, replaying the source year by year from the first year with
    /// records. Errors met while replaying compromise the link.
    fn seed_carry_over(
        &self,
        chain: &mut PeriodChain,
        carry_over: &CarryOver,
        absences: &[AbsenceRecord],
    ) {
        let (Some(carry), Some(source)) = (
            self.rules.rule_by_name(&carry_over.carry),
            self.rules.rule_by_name(&carry_over.source),
        ) else {
            return;
        };
        let Some(takable) = &source.takable else {
            return;
        };
        let mut history: Vec<&AbsenceRecord> = absences
            .iter()
            .filter(|a| {
                a.person == chain.person
                    && a.date.year() < carry_over.year
                    && takable.taken_codes.contains(&a.code)
            })
            .collect();
        history.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));

        let first_year = history.first().map_or(carry_over.year, |a| a.date.year());
        let mut carried = entitlement(source, first_year - 1, &carry_over.contracts);
        let mut errors = Vec::new();
        for year in first_year..carry_over.year {
            let Some(year_range) = NaiveDate::from_ymd_opt(year, 1, 1).and_then(DateRange::year_of)
            else {
                break;
            };
            let mut replay = PeriodChain::new(chain.person, &source.name, year_range.end);
            if let Some(window) = carry_window(year, carry_over.usable_until_month)
                .and_then(|w| contract_overlap(&carry_over.contracts, &w))
            {
                let initialization = initialization_for(carry, &window, &carry_over.initializations);
                replay
                    .periods
                    .push(AbsencePeriod::new(carry, window, carried, initialization));
            }
            if let Some(clipped) = contract_overlap(&carry_over.contracts, &year_range) {
                let total = takable_total(source, &year_range, &clipped);
                let initialization = initialization_for(source, &clipped, &carry_over.initializations);
                replay
                    .periods
                    .push(AbsencePeriod::new(source, clipped, total, initialization));
            }
            for absence in history.iter().filter(|a| a.date.year() == year) {
                self.dispatch_taken(&mut replay, absence);
            }
            for period in &replay.periods {
                errors.extend(period.errors().critical_errors().iter().cloned());
            }
            carried = replay
                .period(&source.name)
                .and_then(|p| p.remaining())
                .map_or(0, |r| r.max(0));
        }

        let period = &mut chain.periods[carry_over.period];
        period.seed_takable_total(carried);
        debug!(
            "Carry-over '{}' seeded with {} left by '{}' in {}",
            carry.name,
            carried,
            source.name,
            carry_over.year - 1
        );
        for error in errors {
            period.compromise(error);
        }
    }

    /// Charges the record to the first period that admits it, or to the last
    /// candidate when none does.
    fn dispatch_taken(&self, chain: &mut PeriodChain, absence: &AbsenceRecord) -> bool {
        let candidates: Vec<usize> = chain
            .periods
            .iter()
            .enumerate()
            .filter(|(_, p)| p.covers(absence.date) && p.takes_code(&absence.code))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return false;
        }

        let working = self.working.working_minutes(chain.person, absence.date);
        let mut rejected = None;
        for index in candidates {
            let period = &mut chain.periods[index];
            let amount_type = period.takable_amount_type.unwrap_or(AmountType::Units);
            let Some(amount) = absence_amount(absence, amount_type, working) else {
                let error = incalculable(&period.category, absence);
                period.compromise(error);
                return true;
            };
            let evaluation = period.evaluate(absence, amount);
            if evaluation.can_admit() {
                period.add_taken_absence(evaluation);
                return true;
            }
            rejected = Some((index, evaluation));
        }
        if let Some((index, evaluation)) = rejected {
            chain.periods[index].add_taken_absence(evaluation);
        }
        true
    }

    fn assign_completion(
        &self,
        chain: &mut PeriodChain,
        absence: &AbsenceRecord,
    ) -> Result<bool, CriticalError> {
        let completing = matching_periods(chain, absence, |p, code| p.completes_code(code));
        let replacing = matching_periods(chain, absence, |p, code| p.replaces_code(code));
        if completing.len() > 1 || replacing.len() > 1 {
            return Err(CriticalError {
                category: chain.category.clone(),
                date: absence.date,
                absence: Some(absence.id),
                problem: CriticalProblem::TwoPeriodsWhereOneExpected { date: absence.date },
            });
        }

        if let Some(&index) = completing.first() {
            let working = self.working.working_minutes(chain.person, absence.date);
            let period = &mut chain.periods[index];
            let amount_type = period
                .completion
                .as_ref()
                .map_or(AmountType::Minutes, |c| c.amount_type);
            match absence_amount(absence, amount_type, working) {
                Some(amount) => period.add_completion_absence(absence, amount),
                None => {
                    let error = incalculable(&period.category, absence);
                    period.compromise(error);
                }
            }
        }
        if let Some(&index) = replacing.first() {
            chain.periods[index].add_existent_replacing(absence);
        }
        Ok(!completing.is_empty() || !replacing.is_empty())
    }
}

fn matching_periods(
    chain: &PeriodChain,
    absence: &AbsenceRecord,
    predicate: impl Fn(&AbsencePeriod, &str) -> bool,
) -> Vec<usize> {
    chain
        .periods
        .iter()
        .enumerate()
        .filter(|(_, p)| p.covers(absence.date) && predicate(p, &absence.code))
        .map(|(i, _)| i)
        .collect()
}

fn initialization_for(
    rule: &CategoryRule,
    range: &DateRange,
    initializations: &[Initialization],
) -> Option<Initialization> {
    let found = initializations
        .iter()
        .find(|i| i.category == rule.name && range.contains(i.date))?;
    if !rule.initializable {
        warn!(
            "Ignoring initialization of '{}' on {}: category is not initializable",
            rule.name, found.date
        );
        return None;
    }
    Some(found.clone())
}

/// January up to the end of `usable_until_month` of `year`.
fn carry_window(year: i32, usable_until_month: u32) -> Option<DateRange> {
    let begin = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let last_month = DateRange::month_of(NaiveDate::from_ymd_opt(year, usable_until_month, 1)?)?;
    Some(DateRange::new(begin, last_month.end))
}

/// Part of `range` under the latest contract overlapping it.
fn contract_overlap(contracts: &[Contract], range: &DateRange) -> Option<DateRange> {
    contracts
        .iter()
        .filter_map(|c| range.intersect(&c.range()))
        .max_by_key(|r| r.begin)
}

/// Days before `until` covered by the contracts, replayed for carry-overs.
fn history_before(contracts: &[Contract], until: NaiveDate) -> Option<DateRange> {
    let begin = contracts.iter().map(|c| c.begin).min()?;
    let end = until.pred_opt()?;
    (begin <= end).then(|| DateRange::new(begin, end))
}

/// Full limit `source` grants in `year`, accrued over the contract.
fn entitlement(source: &CategoryRule, year: i32, contracts: &[Contract]) -> i64 {
    let Some(year_range) = NaiveDate::from_ymd_opt(year, 1, 1).and_then(DateRange::year_of) else {
        return 0;
    };
    contract_overlap(contracts, &year_range)
        .map_or(0, |clipped| takable_total(source, &year_range, &clipped).max(0))
}

fn incalculable(category: &str, absence: &AbsenceRecord) -> CriticalError {
    CriticalError {
        category: category.to_string(),
        date: absence.date,
        absence: Some(absence.id),
        problem: CriticalProblem::IncalculableAmount {
            code: absence.code.clone(),
            date: absence.date,
        },
    }
}

/// Limit of the period. Vacation limits accrue with the share of the
/// natural period the contract covers, floored to whole days or minutes.
fn takable_total(rule: &CategoryRule, natural: &DateRange, clipped: &DateRange) -> i64 {
    let Some(takable) = &rule.takable else {
        return -1;
    };
    if takable.is_unlimited() {
        return takable.fixed_limit;
    }
    match rule.pattern {
        CategoryPattern::Vacations => accrued_limit(
            takable.fixed_limit,
            takable.amount_type,
            clipped.days(),
            natural.days(),
        ),
        CategoryPattern::Programmed | CategoryPattern::CompensatoryRest => takable.fixed_limit,
    }
}

pub fn accrued_limit(limit: i64, amount_type: AmountType, covered_days: i64, full_days: i64) -> i64 {
    if full_days <= 0 || covered_days >= full_days {
        return limit;
    }
    let accrued = Decimal::from(limit) * Decimal::from(covered_days) / Decimal::from(full_days);
    let floored = match amount_type {
        AmountType::Units => {
            let per_day = Decimal::from(UNITS_PER_DAY);
            (accrued / per_day).floor() * per_day
        }
        AmountType::Minutes => accrued.floor(),
    };
    floored.to_i64().unwrap_or(0)
}
