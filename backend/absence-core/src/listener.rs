// src/listener.rs
use chrono::NaiveDate;
use tracing::info;

use crate::errors::ScanError;
use crate::model::PersonId;
use crate::rules::RuleTreeProvider;
use crate::scanner::{ScanReport, ScanRequest, Scanner};
use crate::store::{AttendanceDays, LedgerStore, LedgerTransaction, PersonDirectory, WorkingTime};

/// Rescans a person after changes that can move entitlement around. Each
/// rescan runs in its own transaction.
pub struct ConsistencyListener<'a, R, W, D> {
    scanner: Scanner<'a, R, W>,
    directory: &'a D,
}

impl<'a, R, W, D> ConsistencyListener<'a, R, W, D>
where
    R: RuleTreeProvider,
    W: WorkingTime,
    D: PersonDirectory,
{
    pub fn new(scanner: Scanner<'a, R, W>, directory: &'a D) -> Self {
        Self { scanner, directory }
    }

    /// A contract was created, closed or moved. Everything from its begin
    /// date is rescanned.
    pub fn contract_changed<S>(
        &self,
        store: &mut S,
        person: PersonId,
        contract_begin: NaiveDate,
    ) -> Result<ScanReport, ScanError>
    where
        S: LedgerStore + AttendanceDays + LedgerTransaction,
    {
        self.rescan(store, person, contract_begin, "contract changed")
    }

    /// Working time of a day changed, so day-based amounts from that date on
    /// may differ.
    pub fn time_slot_changed<S>(
        &self,
        store: &mut S,
        person: PersonId,
        date: NaiveDate,
    ) -> Result<ScanReport, ScanError>
    where
        S: LedgerStore + AttendanceDays + LedgerTransaction,
    {
        self.rescan(store, person, date, "time slot changed")
    }

    fn rescan<S>(
        &self,
        store: &mut S,
        person: PersonId,
        from: NaiveDate,
        reason: &str,
    ) -> Result<ScanReport, ScanError>
    where
        S: LedgerStore + AttendanceDays + LedgerTransaction,
    {
        info!("Rescanning person {} from {}: {}", person, from, reason);
        store.transaction(|store| {
            let request = ScanRequest::load(&*store, self.directory, person, from)?;
            self.scanner.scan(store, &request)
        })
    }
}
