// src/scanner.rs
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

use crate::chain::{ChainBuilder, ChainRequest, PeriodChain};
use crate::config::ScanConfig;
use crate::errors::{AbsenceProblem, CriticalError, ErrorsBox, ScanError, StoreError};
use crate::ledger::PeriodSummary;
use crate::model::{
    AbsenceId, AbsenceRecord, CategoryName, Contract, Dependent, Initialization, PersonId,
};
use crate::repair::{apply_repair, plan_repair, Applied};
use crate::rules::RuleTreeProvider;
use crate::store::{AttendanceDays, LedgerStore, LedgerTransaction, PersonDirectory, WorkingTime};

// --- Request & Report ---

/// Everything one scan of one person needs.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub person: PersonId,
    pub from: NaiveDate,
    /// Records to scan, in the order the store returned them. Records of
    /// other persons or dated before `from` are ignored.
    pub absences: Vec<AbsenceRecord>,
    pub dependents: Vec<Dependent>,
    pub contracts: Vec<Contract>,
    pub initializations: Vec<Initialization>,
}

impl ScanRequest {
    /// Assembles a request from the store and the person directory.
    pub fn load<S, D>(
        store: &S,
        directory: &D,
        person: PersonId,
        from: NaiveDate,
    ) -> Result<Self, StoreError>
    where
        S: LedgerStore + ?Sized,
        D: PersonDirectory + ?Sized,
    {
        Ok(Self {
            person,
            from,
            absences: store.absences_in_range(person, from, NaiveDate::MAX)?,
            dependents: directory.dependents(person),
            contracts: directory.contracts(person),
            initializations: directory.initializations(person),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub person: PersonId,
    pub from: NaiveDate,
    pub scanned_absences: usize,
    pub chains_built: usize,
    /// Problems currently detected on each scanned record.
    pub problems: BTreeMap<AbsenceId, BTreeSet<AbsenceProblem>>,
    pub critical_errors: Vec<CriticalError>,
    pub replacings_inserted: Vec<AbsenceRecord>,
    pub replacings_deleted: Vec<AbsenceId>,
    pub skipped_removed: Vec<AbsenceId>,
    pub troubles_added: usize,
    pub troubles_removed: usize,
    pub periods: Vec<PeriodSummary>,
}

impl ScanReport {
    fn new(person: PersonId, from: NaiveDate) -> Self {
        Self {
            person,
            from,
            scanned_absences: 0,
            chains_built: 0,
            problems: BTreeMap::new(),
            critical_errors: Vec::new(),
            replacings_inserted: Vec::new(),
            replacings_deleted: Vec::new(),
            skipped_removed: Vec::new(),
            troubles_added: 0,
            troubles_removed: 0,
            periods: Vec::new(),
        }
    }

    pub fn problems_for(&self, absence: AbsenceId) -> BTreeSet<AbsenceProblem> {
        self.problems.get(&absence).cloned().unwrap_or_default()
    }

    pub fn has_problem(&self, absence: AbsenceId, problem: AbsenceProblem) -> bool {
        self.problems
            .get(&absence)
            .map_or(false, |p| p.contains(&problem))
    }

    /// True when the scan left the ledger untouched.
    pub fn is_noop(&self) -> bool {
        self.replacings_inserted.is_empty()
            && self.replacings_deleted.is_empty()
            && self.troubles_added == 0
            && self.troubles_removed == 0
    }
}

// --- Work Queue ---

/// Records of the scan with the categories each still has to be checked
/// against. A record leaves the queue once all its categories are scanned.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    order: Vec<AbsenceId>,
    records: BTreeMap<AbsenceId, AbsenceRecord>,
    pending: BTreeMap<AbsenceId, BTreeSet<CategoryName>>,
    cursor: usize,
}

impl WorkQueue {
    pub fn new<R: RuleTreeProvider>(
        records: Vec<AbsenceRecord>,
        rules: &R,
        config: &ScanConfig,
    ) -> Self {
        let mut queue = Self {
            order: Vec::with_capacity(records.len()),
            records: BTreeMap::new(),
            pending: BTreeMap::new(),
            cursor: 0,
        };
        for record in records {
            if queue.records.contains_key(&record.id) {
                continue;
            }
            let mut categories = BTreeSet::new();
            for rule in rules.categories_for_code(&record.code) {
                if config.is_excluded(rule) {
                    debug!(
                        "Category '{}' excluded from scan, skipping for absence {}",
                        rule.name, record.id
                    );
                    continue;
                }
                categories.insert(rule.name.clone());
            }
            queue.order.push(record.id);
            queue.pending.insert(record.id, categories);
            queue.records.insert(record.id, record);
        }
        queue
    }

    /// Next record still carrying an unscanned category, with the first such
    /// category.
    pub fn next_group(&mut self) -> Option<(AbsenceRecord, CategoryName)> {
        while let Some(id) = self.order.get(self.cursor) {
            if let Some(category) = self.pending.get(id).and_then(|p| p.iter().next()) {
                let record = self.records.get(id)?.clone();
                return Some((record, category.clone()));
            }
            self.cursor += 1;
        }
        None
    }

    pub fn mark_scanned(&mut self, absence: AbsenceId, category: &str) {
        if let Some(pending) = self.pending.get_mut(&absence) {
            pending.remove(category);
        }
    }

    pub fn mark_all_scanned(&mut self, absence: AbsenceId) {
        if let Some(pending) = self.pending.get_mut(&absence) {
            pending.clear();
        }
    }

    pub fn contains(&self, absence: AbsenceId) -> bool {
        self.records.contains_key(&absence)
    }

    pub fn is_pending(&self, absence: AbsenceId, category: &str) -> bool {
        self.pending
            .get(&absence)
            .map_or(false, |p| p.contains(category))
    }

    /// Queued records, in scan order.
    pub fn records(&self) -> impl Iterator<Item = &AbsenceRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// --- Scanner ---

#[derive(Debug)]
enum ScanPhase {
    SelectingNextGroup,
    BuildingChain {
        pivot: AbsenceRecord,
        category: CategoryName,
    },
    Repairing {
        pivot: AbsenceRecord,
        chain: PeriodChain,
    },
    Reconciling,
}

pub struct Scanner<'a, R, W> {
    rules: &'a R,
    working: &'a W,
    config: ScanConfig,
}

impl<'a, R: RuleTreeProvider, W: WorkingTime> Scanner<'a, R, W> {
    pub fn new(rules: &'a R, working: &'a W, config: ScanConfig) -> Self {
        Self {
            rules,
            working,
            config,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scans, repairs and annotates the records of `request`. Mutations are
    /// not rolled back on error; see [`Scanner::scan_in_transaction`].
    pub fn scan<S>(&self, store: &mut S, request: &ScanRequest) -> Result<ScanReport, ScanError>
    where
        S: LedgerStore + AttendanceDays,
    {
        // Scan order is the order the store returned the records in.
        let records: Vec<AbsenceRecord> = request
            .absences
            .iter()
            .filter(|a| a.person == request.person && a.date >= request.from)
            .cloned()
            .collect();

        info!(
            "Starting scan for person {} from {} ({} absences)",
            request.person,
            request.from,
            records.len()
        );

        let mut queue = WorkQueue::new(records, self.rules, &self.config);
        let mut report = ScanReport::new(request.person, request.from);
        report.scanned_absences = queue.len();

        let mut errors = self.generic_problems(store, &queue, request)?;
        let mut removed: BTreeSet<AbsenceId> = BTreeSet::new();
        let mut periods: BTreeMap<(CategoryName, NaiveDate), PeriodSummary> = BTreeMap::new();
        let builder = ChainBuilder::new(self.rules, self.working);

        let mut phase = ScanPhase::SelectingNextGroup;
        loop {
            phase = match phase {
                ScanPhase::SelectingNextGroup => match queue.next_group() {
                    Some((pivot, category)) => {
                        if errors.contains(pivot.id, AbsenceProblem::OutOfContract) {
                            debug!("Absence {} is out of contract, no chain built", pivot.id);
                            queue.mark_all_scanned(pivot.id);
                            ScanPhase::SelectingNextGroup
                        } else {
                            ScanPhase::BuildingChain { pivot, category }
                        }
                    }
                    None => ScanPhase::Reconciling,
                },

                ScanPhase::BuildingChain { pivot, category } => {
                    // The pivot is marked up front so the queue drains even
                    // when the chain aborts.
                    queue.mark_scanned(pivot.id, &category);
                    match self.build_chain(&builder, store, request, &pivot, &category)? {
                        Ok(chain) if chain.child_is_missing => {
                            warn!(
                                "No qualifying child for absence {} ({}) in '{}'",
                                pivot.id, pivot.code, category
                            );
                            errors.add_absence_problem(pivot.id, AbsenceProblem::NoChildExist);
                            ScanPhase::SelectingNextGroup
                        }
                        Ok(chain) if chain.periods.is_empty() => ScanPhase::SelectingNextGroup,
                        Ok(chain) => ScanPhase::Repairing { pivot, chain },
                        Err(critical) => {
                            error!(
                                "Chain '{}' for person {} around absence {} on {} aborted: {}",
                                category, request.person, pivot.id, pivot.date, critical
                            );
                            errors.add_critical_error(critical);
                            ScanPhase::SelectingNextGroup
                        }
                    }
                }

                ScanPhase::Repairing { pivot, chain } => {
                    report.chains_built += 1;
                    for critical in chain.errors.critical_errors() {
                        error!(
                            "Chain '{}' for person {} around absence {}: {}",
                            chain.category, request.person, pivot.id, critical
                        );
                    }
                    errors.absorb(&chain.errors);

                    let plan = plan_repair(&chain, self.rules)?;
                    let outcome = apply_repair(&plan, store)?;
                    removed.extend(outcome.deleted.iter().copied());
                    removed.extend(outcome.skipped.iter().copied());
                    report.replacings_deleted.extend(outcome.deleted);
                    report.skipped_removed.extend(outcome.skipped);
                    report.replacings_inserted.extend(outcome.inserted);

                    let categories = chain.categories();
                    for absence in chain.participants() {
                        for category in &categories {
                            queue.mark_scanned(*absence, category);
                        }
                    }
                    for summary in chain.summaries() {
                        periods.insert((summary.category.clone(), summary.begin), summary);
                    }
                    ScanPhase::SelectingNextGroup
                }

                ScanPhase::Reconciling => {
                    self.reconcile(store, &queue, &errors, &removed, &mut report)?;
                    break;
                }
            };
        }

        report.problems = errors
            .absence_problems()
            .iter()
            .filter(|(id, _)| queue.contains(**id))
            .map(|(id, problems)| (*id, problems.clone()))
            .collect();
        report.critical_errors = errors.critical_errors().to_vec();
        report.periods = periods.into_values().collect();
        info!(
            "Scan for person {} done: {} chains, {} replacings inserted, {} deleted, troubles +{} -{}, {} critical",
            report.person,
            report.chains_built,
            report.replacings_inserted.len(),
            report.replacings_deleted.len(),
            report.troubles_added,
            report.troubles_removed,
            report.critical_errors.len()
        );
        Ok(report)
    }

    /// Runs [`Scanner::scan`] inside a store transaction; any error rolls
    /// back every repair and annotation.
    pub fn scan_in_transaction<S>(
        &self,
        store: &mut S,
        request: &ScanRequest,
    ) -> Result<ScanReport, ScanError>
    where
        S: LedgerStore + AttendanceDays + LedgerTransaction,
    {
        store.transaction(|store| self.scan(store, request))
    }

    /// Outer `Err` is a store failure; inner `Err` a critical problem of
    /// the chain.
    fn build_chain<S: LedgerStore>(
        &self,
        builder: &ChainBuilder<'_, R, W>,
        store: &S,
        request: &ScanRequest,
        pivot: &AbsenceRecord,
        category: &str,
    ) -> Result<Result<PeriodChain, CriticalError>, StoreError> {
        let chain_request = ChainRequest {
            person: request.person,
            category,
            date: pivot.date,
            contracts: &request.contracts,
            dependents: &request.dependents,
            initializations: &request.initializations,
        };
        let mut chain = match builder.build_periods(&chain_request) {
            Ok(chain) => chain,
            Err(critical) => return Ok(Err(critical)),
        };
        let Some(range) = chain.records_range() else {
            return Ok(Ok(chain));
        };
        let absences = store.absences_in_range(request.person, range.begin, range.end)?;
        Ok(builder.populate(&mut chain, &absences).map(|_| chain))
    }

    /// Problems that hold regardless of any category: duplicate codes,
    /// all-day conflicts and dates outside every contract.
    fn generic_problems<S: LedgerStore>(
        &self,
        store: &S,
        queue: &WorkQueue,
        request: &ScanRequest,
    ) -> Result<ErrorsBox, StoreError> {
        let mut errors = ErrorsBox::default();
        let mut by_date: BTreeMap<NaiveDate, Vec<AbsenceRecord>> = BTreeMap::new();

        for record in queue.records() {
            if !request.contracts.iter().any(|c| c.contains(record.date)) {
                errors.add_absence_problem(record.id, AbsenceProblem::OutOfContract);
            }

            if !by_date.contains_key(&record.date) {
                let same_day = store.absences_in_range(request.person, record.date, record.date)?;
                by_date.insert(record.date, same_day);
            }
            let same_day = &by_date[&record.date];
            let others = same_day.iter().filter(|o| o.id != record.id);

            let mut duplicate = false;
            let mut all_day_conflict = false;
            for other in others {
                duplicate |= other.code == record.code;
                let both_count = !record.justified_kind.is_no_amount()
                    && !other.justified_kind.is_no_amount();
                all_day_conflict |= both_count
                    && (record.justified_kind.is_all_day() || other.justified_kind.is_all_day());
            }
            if duplicate {
                errors.add_absence_problem(record.id, AbsenceProblem::DuplicateCode);
            }
            if all_day_conflict {
                errors.add_absence_problem(record.id, AbsenceProblem::AllDayAlreadyExists);
            }
        }
        Ok(errors)
    }

    /// Aligns persisted annotations with the problems detected now.
    fn reconcile<S: LedgerStore>(
        &self,
        store: &mut S,
        queue: &WorkQueue,
        errors: &ErrorsBox,
        removed: &BTreeSet<AbsenceId>,
        report: &mut ScanReport,
    ) -> Result<(), StoreError> {
        for record in queue.records() {
            if reconcile_one(store, record.id, errors, removed, report)? == Applied::SkippedRemoved {
                debug!(
                    "Absence {} was removed during the scan, not annotating",
                    record.id
                );
            }
        }
        Ok(())
    }
}

fn reconcile_one<S: LedgerStore>(
    store: &mut S,
    absence: AbsenceId,
    errors: &ErrorsBox,
    removed: &BTreeSet<AbsenceId>,
    report: &mut ScanReport,
) -> Result<Applied, StoreError> {
    if removed.contains(&absence) || !store.is_persistent(absence)? {
        return Ok(Applied::SkippedRemoved);
    }
    let wanted = errors.problems_for(absence);
    let mut kept: BTreeSet<AbsenceProblem> = BTreeSet::new();

    for trouble in store.troubles_for(absence)? {
        if wanted.contains(&trouble.problem) && kept.insert(trouble.problem) {
            continue;
        }
        if store.delete_trouble(trouble.id)? {
            debug!(
                "Removed trouble {} ({}) from absence {}",
                trouble.id,
                trouble.problem.key(),
                absence
            );
            report.troubles_removed += 1;
        }
    }
    for problem in wanted.difference(&kept) {
        store.insert_trouble(absence, *problem)?;
        debug!("Added trouble {} to absence {}", problem.key(), absence);
        report.troubles_added += 1;
    }
    Ok(Applied::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn queue_drains_categories_of_a_record_before_moving_on() {
        let rules = crate::rules::StaticRuleTree::new(
            vec![
                programmed_rule("b_cat", &["X"], 100, crate::rules::PeriodKind::Year, None),
                programmed_rule("a_cat", &["X"], 100, crate::rules::PeriodKind::Year, None),
            ],
            vec![],
        );
        let records = vec![all_day(1, "X", "2024-01-02"), all_day(2, "X", "2024-01-03")];
        let mut queue = WorkQueue::new(records, &rules, &ScanConfig::default());

        let (first, category) = queue.next_group().unwrap();
        assert_eq!((first.id, category.as_str()), (1, "a_cat"));
        queue.mark_scanned(1, "a_cat");
        let (second, category) = queue.next_group().unwrap();
        assert_eq!((second.id, category.as_str()), (1, "b_cat"));
        queue.mark_scanned(1, "b_cat");
        assert_eq!(queue.next_group().unwrap().0.id, 2);
        queue.mark_all_scanned(2);
        assert!(queue.next_group().is_none());
    }

    #[test]
    fn queue_keeps_the_order_records_arrive_in() {
        let rules = rule_tree();
        let records = vec![
            all_day(5, "LV", "2024-03-05"),
            all_day(2, "LV", "2024-03-01"),
            all_day(9, "SK", "2024-02-01"),
        ];
        let mut queue = WorkQueue::new(records, &rules, &ScanConfig::default());

        let order: Vec<AbsenceId> = queue.records().map(|r| r.id).collect();
        assert_eq!(order, vec![5, 2, 9]);
        assert_eq!(queue.next_group().unwrap().0.id, 5);
    }

    #[test]
    fn excluded_categories_never_enter_the_queue() {
        let rules = rule_tree();
        let records = vec![all_day(1, "CR", "2024-01-02")];
        let mut queue = WorkQueue::new(records.clone(), &rules, &ScanConfig::default());
        assert!(queue.next_group().is_none());
        assert_eq!(queue.len(), 1, "excluded records are still reconciled");

        let queue = WorkQueue::new(records, &rules, &ScanConfig::scan_all());
        assert!(queue.is_pending(1, "comp_rest"));
    }
}
