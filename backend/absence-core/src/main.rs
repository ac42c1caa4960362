// src/main.rs
//! absence-scan: runs one consistency scan over a JSON ledger fixture.
//!
//! Usage:
//!   absence-scan --rules demos/rules.json --ledger demos/ledger.json \
//!     --person 1 --from 2024-01-01 --troubles-csv troubles.csv --output ledger.out.json

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::fs::{self, File};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use absence_core::report::{amount_as_decimal, write_periods_csv, write_troubles_csv};
use absence_core::store::{FixedWorkingTime, LedgerDocument, StaticDirectory};
use absence_core::{
    EnvConfig, InMemoryLedger, ScanRequest, Scanner, StaticRuleTree,
};

/// Scan a person's absences: limits, trouble annotations, replacing repair.
#[derive(Parser, Debug)]
#[command(name = "absence-scan")]
#[command(about = "Check absence entitlements and repair replacing records")]
struct Args {
    /// Rule tree JSON (categories and absence codes)
    #[arg(long, short = 'r')]
    rules: PathBuf,

    /// Ledger fixture JSON (absences, troubles, persons, working minutes)
    #[arg(long, short = 'l')]
    ledger: PathBuf,

    /// Person to scan
    #[arg(long, short = 'p')]
    person: u64,

    /// First date to scan (YYYY-MM-DD)
    #[arg(long, short = 'f')]
    from: NaiveDate,

    /// Write detected troubles as CSV
    #[arg(long)]
    troubles_csv: Option<PathBuf>,

    /// Write period balances as CSV
    #[arg(long)]
    periods_csv: Option<PathBuf>,

    /// Write the updated ledger back as JSON
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Print the report as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let env = EnvConfig::load().context("Failed to read ABSENCE_* environment")?;
    let filter = env.log_filter.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = env
        .into_scan_config()
        .context("Invalid scan configuration")?;

    let rules_json = fs::read_to_string(&args.rules)
        .with_context(|| format!("Failed to read rule tree: {}", args.rules.display()))?;
    let rules = StaticRuleTree::from_json_str(&rules_json)
        .with_context(|| format!("Failed to parse rule tree: {}", args.rules.display()))?;

    let ledger_json = fs::read_to_string(&args.ledger)
        .with_context(|| format!("Failed to read ledger: {}", args.ledger.display()))?;
    let document: LedgerDocument = serde_json::from_str(&ledger_json)
        .with_context(|| format!("Failed to parse ledger: {}", args.ledger.display()))?;

    let directory = StaticDirectory::new(document.persons.clone());
    if directory.profile(args.person).is_none() {
        bail!("Person {} is not in the ledger fixture", args.person);
    }
    let working = FixedWorkingTime::new(document.working_minutes.clone());
    let mut ledger = InMemoryLedger::from_document(&document);
    info!(
        "Loaded {} absences and {} troubles from {}",
        document.absences.len(),
        document.troubles.len(),
        args.ledger.display()
    );

    let request = ScanRequest::load(&ledger, &directory, args.person, args.from)
        .context("Failed to load scan request")?;
    let scanner = Scanner::new(&rules, &working, config);
    let report = scanner
        .scan_in_transaction(&mut ledger, &request)
        .with_context(|| format!("Scan of person {} failed, ledger rolled back", args.person))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Person {} from {}: {} absences, {} chains",
            report.person, report.from, report.scanned_absences, report.chains_built
        );
        println!(
            "Replacings: {} inserted, {} deleted; troubles: +{} -{}",
            report.replacings_inserted.len(),
            report.replacings_deleted.len(),
            report.troubles_added,
            report.troubles_removed
        );
        for (absence, problems) in &report.problems {
            let keys: Vec<&str> = problems.iter().map(|p| p.key()).collect();
            println!("  absence {}: {}", absence, keys.join(", "));
        }
        for period in &report.periods {
            let amount_type = period
                .amount_type
                .unwrap_or(absence_core::model::AmountType::Units);
            let remaining = period
                .remaining
                .map(|r| amount_as_decimal(r, amount_type).to_string())
                .unwrap_or_else(|| "unlimited".into());
            println!(
                "  {} {}..{}: taken {}, remaining {}{}",
                period.category,
                period.begin,
                period.end,
                amount_as_decimal(period.taken_total, amount_type),
                remaining,
                if period.compromised { " (compromised)" } else { "" }
            );
        }
    }
    for critical in &report.critical_errors {
        warn!("{}", critical);
    }

    if let Some(path) = &args.troubles_csv {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        write_troubles_csv(&report, file).context("Failed to write troubles CSV")?;
        info!("Troubles written to {}", path.display());
    }
    if let Some(path) = &args.periods_csv {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        write_periods_csv(&report, file).context("Failed to write periods CSV")?;
        info!("Period balances written to {}", path.display());
    }
    if let Some(path) = &args.output {
        let updated = ledger.to_document(&document);
        fs::write(path, serde_json::to_string_pretty(&updated)?)
            .with_context(|| format!("Failed to write ledger: {}", path.display()))?;
        info!("Updated ledger written to {}", path.display());
    }

    Ok(())
}
