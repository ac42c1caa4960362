// src/store.rs
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::errors::{AbsenceProblem, StoreError};
use crate::model::{
    AbsenceId, AbsenceRecord, AttendanceDay, Contract, DayId, Dependent, Initialization,
    NewAbsence, PersonId, TroubleAnnotation, TroubleId,
};

// --- Collaborator Traits ---

/// Persistence of absence records and their trouble annotations.
pub trait LedgerStore {
    /// Records of `person` dated within `[from, to]`, ordered by date then id.
    fn absences_in_range(
        &self,
        person: PersonId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AbsenceRecord>, StoreError>;

    fn absence(&self, id: AbsenceId) -> Result<Option<AbsenceRecord>, StoreError>;

    fn is_persistent(&self, id: AbsenceId) -> Result<bool, StoreError> {
        Ok(self.absence(id)?.is_some())
    }

    fn insert_absence(&mut self, absence: NewAbsence) -> Result<AbsenceRecord, StoreError>;

    /// Returns false when the record was already gone.
    fn delete_absence(&mut self, id: AbsenceId) -> Result<bool, StoreError>;

    fn troubles_for(&self, absence: AbsenceId) -> Result<Vec<TroubleAnnotation>, StoreError>;

    fn insert_trouble(
        &mut self,
        absence: AbsenceId,
        problem: AbsenceProblem,
    ) -> Result<TroubleAnnotation, StoreError>;

    /// Returns false when the annotation was already gone.
    fn delete_trouble(&mut self, id: TroubleId) -> Result<bool, StoreError>;
}

/// Attendance-day aggregates replacing records attach to.
pub trait AttendanceDays {
    fn get_or_create_day(&mut self, person: PersonId, date: NaiveDate)
        -> Result<DayId, StoreError>;
}

/// Day-level working time, in minutes. `None` when unknown.
pub trait WorkingTime {
    fn working_minutes(&self, person: PersonId, date: NaiveDate) -> Option<i64>;
}

/// Person context a rescan needs.
pub trait PersonDirectory {
    fn contracts(&self, person: PersonId) -> Vec<Contract>;
    fn dependents(&self, person: PersonId) -> Vec<Dependent>;
    fn initializations(&self, person: PersonId) -> Vec<Initialization>;
}

/// Transaction boundary: every mutation made by `f` is rolled back when it
/// returns `Err`.
pub trait LedgerTransaction {
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>;
}

// --- In-Memory Implementations ---

/// Serializable snapshot used for fixtures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default)]
    pub absences: Vec<AbsenceRecord>,
    #[serde(default)]
    pub troubles: Vec<TroubleAnnotation>,
    #[serde(default)]
    pub attendance_days: Vec<AttendanceDay>,
    #[serde(default)]
    pub working_minutes: BTreeMap<PersonId, i64>,
    #[serde(default)]
    pub persons: BTreeMap<PersonId, PersonProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonProfile {
    #[serde(default)]
    pub contracts: Vec<Contract>,
    #[serde(default)]
    pub dependents: Vec<Dependent>,
    #[serde(default)]
    pub initializations: Vec<Initialization>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    absences: BTreeMap<AbsenceId, AbsenceRecord>,
    troubles: BTreeMap<TroubleId, TroubleAnnotation>,
    days: BTreeMap<(PersonId, NaiveDate), DayId>,
    next_id: u64,
    mutations: usize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn from_document(document: &LedgerDocument) -> Self {
        let mut ledger = Self::new();
        for absence in &document.absences {
            ledger.absences.insert(absence.id, absence.clone());
        }
        for trouble in &document.troubles {
            ledger.troubles.insert(trouble.id, trouble.clone());
        }
        for day in &document.attendance_days {
            ledger.days.insert((day.person, day.date), day.id);
        }
        let max_id = ledger
            .absences
            .keys()
            .chain(ledger.troubles.keys())
            .chain(ledger.days.values())
            .copied()
            .max()
            .unwrap_or(0);
        ledger.next_id = max_id + 1;
        ledger
    }

    /// Writes the ledger contents back into `document`, keeping its
    /// person profiles and working minutes.
    pub fn to_document(&self, document: &LedgerDocument) -> LedgerDocument {
        LedgerDocument {
            absences: self.absences.values().cloned().collect(),
            troubles: self.troubles.values().cloned().collect(),
            attendance_days: self
                .days
                .iter()
                .map(|((person, date), id)| AttendanceDay {
                    id: *id,
                    person: *person,
                    date: *date,
                })
                .collect(),
            working_minutes: document.working_minutes.clone(),
            persons: document.persons.clone(),
        }
    }

    /// Inserts an already identified record (fixtures, tests).
    pub fn seed_absence(&mut self, absence: AbsenceRecord) {
        self.next_id = self.next_id.max(absence.id + 1);
        self.absences.insert(absence.id, absence);
    }

    pub fn all_absences(&self) -> Vec<AbsenceRecord> {
        self.absences.values().cloned().collect()
    }

    pub fn all_troubles(&self) -> Vec<TroubleAnnotation> {
        self.troubles.values().cloned().collect()
    }

    pub fn day_id(&self, person: PersonId, date: NaiveDate) -> Option<DayId> {
        self.days.get(&(person, date)).copied()
    }

    /// Number of writes since creation.
    pub fn mutation_count(&self) -> usize {
        self.mutations
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }
}

impl LedgerStore for InMemoryLedger {
    fn absences_in_range(
        &self,
        person: PersonId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AbsenceRecord>, StoreError> {
        let mut found: Vec<AbsenceRecord> = self
            .absences
            .values()
            .filter(|a| a.person == person && a.date >= from && a.date <= to)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    fn absence(&self, id: AbsenceId) -> Result<Option<AbsenceRecord>, StoreError> {
        Ok(self.absences.get(&id).cloned())
    }

    fn insert_absence(&mut self, absence: NewAbsence) -> Result<AbsenceRecord, StoreError> {
        if let Some(day) = absence.attendance_day {
            let owner = self
                .days
                .iter()
                .find(|(_, id)| **id == day)
                .map(|((person, _), _)| *person);
            match owner {
                None => {
                    return Err(StoreError::NotFound {
                        entity: "attendance day",
                        id: day,
                    })
                }
                Some(owner) if owner != absence.person => {
                    return Err(StoreError::PersonMismatch {
                        day,
                        expected: absence.person,
                        actual: owner,
                    })
                }
                Some(_) => {}
            }
        }
        let record = AbsenceRecord {
            id: self.allocate_id(),
            person: absence.person,
            code: absence.code,
            date: absence.date,
            justified_kind: absence.justified_kind,
            justified_minutes: absence.justified_minutes,
            attendance_day: absence.attendance_day,
        };
        debug!("Persisting absence {:?}", record);
        self.absences.insert(record.id, record.clone());
        self.mutations += 1;
        Ok(record)
    }

    fn delete_absence(&mut self, id: AbsenceId) -> Result<bool, StoreError> {
        if self.absences.remove(&id).is_none() {
            return Ok(false);
        }
        // Annotations do not outlive their record.
        self.troubles.retain(|_, t| t.absence != id);
        self.mutations += 1;
        Ok(true)
    }

    fn troubles_for(&self, absence: AbsenceId) -> Result<Vec<TroubleAnnotation>, StoreError> {
        Ok(self
            .troubles
            .values()
            .filter(|t| t.absence == absence)
            .cloned()
            .collect())
    }

    fn insert_trouble(
        &mut self,
        absence: AbsenceId,
        problem: AbsenceProblem,
    ) -> Result<TroubleAnnotation, StoreError> {
        if !self.absences.contains_key(&absence) {
            return Err(StoreError::NotFound {
                entity: "absence",
                id: absence,
            });
        }
        let trouble = TroubleAnnotation {
            id: self.allocate_id(),
            absence,
            problem,
        };
        self.troubles.insert(trouble.id, trouble.clone());
        self.mutations += 1;
        Ok(trouble)
    }

    fn delete_trouble(&mut self, id: TroubleId) -> Result<bool, StoreError> {
        let removed = self.troubles.remove(&id).is_some();
        if removed {
            self.mutations += 1;
        }
        Ok(removed)
    }
}

impl AttendanceDays for InMemoryLedger {
    fn get_or_create_day(
        &mut self,
        person: PersonId,
        date: NaiveDate,
    ) -> Result<DayId, StoreError> {
        if let Some(id) = self.days.get(&(person, date)) {
            return Ok(*id);
        }
        let id = self.allocate_id();
        self.days.insert((person, date), id);
        self.mutations += 1;
        debug!("Created attendance day {} for person {} on {}", id, person, date);
        Ok(id)
    }
}

impl LedgerTransaction for InMemoryLedger {
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        let snapshot = self.clone();
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("Transaction failed, rolling back ledger mutations");
                *self = snapshot;
                Err(e)
            }
        }
    }
}

/// Constant daily working time per person.
#[derive(Debug, Clone, Default)]
pub struct FixedWorkingTime {
    per_person: BTreeMap<PersonId, i64>,
    default_minutes: Option<i64>,
}

impl FixedWorkingTime {
    pub fn new(per_person: BTreeMap<PersonId, i64>) -> Self {
        Self {
            per_person,
            default_minutes: None,
        }
    }

    pub fn uniform(minutes: i64) -> Self {
        Self {
            per_person: BTreeMap::new(),
            default_minutes: Some(minutes),
        }
    }
}

impl WorkingTime for FixedWorkingTime {
    fn working_minutes(&self, person: PersonId, _date: NaiveDate) -> Option<i64> {
        self.per_person
            .get(&person)
            .copied()
            .or(self.default_minutes)
    }
}

/// Person profiles keyed by id.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    persons: BTreeMap<PersonId, PersonProfile>,
}

impl StaticDirectory {
    pub fn new(persons: BTreeMap<PersonId, PersonProfile>) -> Self {
        Self { persons }
    }

    pub fn profile(&self, person: PersonId) -> Option<&PersonProfile> {
        self.persons.get(&person)
    }
}

impl PersonDirectory for StaticDirectory {
    fn contracts(&self, person: PersonId) -> Vec<Contract> {
        self.profile(person)
            .map(|p| p.contracts.clone())
            .unwrap_or_default()
    }

    fn dependents(&self, person: PersonId) -> Vec<Dependent> {
        self.profile(person)
            .map(|p| p.dependents.clone())
            .unwrap_or_default()
    }

    fn initializations(&self, person: PersonId) -> Vec<Initialization> {
        self.profile(person)
            .map(|p| p.initializations.clone())
            .unwrap_or_default()
    }
}
