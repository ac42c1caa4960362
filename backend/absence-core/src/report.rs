// src/report.rs
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::io;

use crate::ledger::PeriodSummary;
use crate::model::{AbsenceId, AmountType, PersonId};
use crate::scanner::ScanReport;

// --- Amount Presentation ---

/// Raw amount in days (units) or hours (minutes), rounded to two decimals.
pub fn amount_as_decimal(amount: i64, amount_type: AmountType) -> Decimal {
    match amount_type {
        AmountType::Units => Decimal::new(amount, 2),
        AmountType::Minutes => (Decimal::from(amount) / dec!(60)).round_dp(2),
    }
}

pub fn unit_label(amount_type: AmountType) -> &'static str {
    match amount_type {
        AmountType::Units => "days",
        AmountType::Minutes => "hours",
    }
}

// --- CSV Rows ---

#[derive(Debug, Serialize)]
struct TroubleRow {
    person: PersonId,
    absence: AbsenceId,
    problem: &'static str,
    description: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PeriodRow {
    pub category: String,
    pub begin: String,
    pub end: String,
    pub unit: &'static str,
    /// Empty for unlimited periods.
    pub takable: Option<Decimal>,
    pub taken: Decimal,
    pub remaining: Option<Decimal>,
    pub completion_residual: Option<Decimal>,
    pub compromised: bool,
}

impl PeriodRow {
    pub fn from_summary(summary: &PeriodSummary) -> Self {
        let amount_type = summary.amount_type.unwrap_or(AmountType::Units);
        Self {
            category: summary.category.clone(),
            begin: summary.begin.format("%Y-%m-%d").to_string(),
            end: summary.end.format("%Y-%m-%d").to_string(),
            unit: unit_label(amount_type),
            takable: (summary.takable_total >= 0)
                .then(|| amount_as_decimal(summary.takable_total, amount_type)),
            taken: amount_as_decimal(summary.taken_total, amount_type),
            remaining: summary
                .remaining
                .map(|r| amount_as_decimal(r, amount_type)),
            completion_residual: summary
                .completion_residual
                .map(|r| amount_as_decimal(r, AmountType::Minutes)),
            compromised: summary.compromised,
        }
    }
}

/// One row per problem currently detected on a scanned record.
pub fn write_troubles_csv<W: io::Write>(report: &ScanReport, writer: W) -> Result<(), csv::Error> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for (absence, problems) in &report.problems {
        for problem in problems {
            csv_writer.serialize(TroubleRow {
                person: report.person,
                absence: *absence,
                problem: problem.key(),
                description: problem.to_string(),
            })?;
        }
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_periods_csv<W: io::Write>(report: &ScanReport, writer: W) -> Result<(), csv::Error> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for summary in &report.periods {
        csv_writer.serialize(PeriodRow::from_summary(summary))?;
    }
    csv_writer.flush()?;
    Ok(())
}
