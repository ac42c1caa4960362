// src/lib.rs
pub mod chain;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod listener;
pub mod model;
pub mod repair;
pub mod report;
pub mod rules;
pub mod scanner;
pub mod store;

#[cfg(test)]
mod test_support;

pub use chain::{ChainBuilder, ChainRequest, PeriodChain};
pub use config::{ConfigError, EnvConfig, ScanConfig};
pub use errors::{AbsenceProblem, CriticalError, CriticalProblem, ErrorsBox, ScanError, StoreError};
pub use listener::ConsistencyListener;
pub use repair::{apply_repair, plan_repair, Applied, RepairOutcome, RepairPlan};
pub use rules::{RuleTreeProvider, StaticRuleTree};
pub use scanner::{ScanReport, ScanRequest, Scanner};
pub use store::{
    AttendanceDays, InMemoryLedger, LedgerStore, LedgerTransaction, PersonDirectory, WorkingTime,
};
