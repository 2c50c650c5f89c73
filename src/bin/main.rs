// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use clap::{Parser, ValueEnum};
use course_billing::{
    Course, CourseCatalog, CourseCode, CourseError, CourseId, CourseType, Engine, ErrorKind,
    InMemoryCatalog, LedgerConfig, TransactionFilter, User, UserId, telemetry,
};
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;

/// Course Billing - Replay billing operations against a course catalog
///
/// Reads register/deposit/pay operations from a CSV file and writes the
/// resulting accounts (or ledger) to stdout.
#[derive(Parser, Debug)]
#[command(name = "course-billing")]
#[command(about = "Replays course billing operations from a CSV file", long_about = None)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: op,user,course,amount
    /// Example: cargo run -- operations.csv > accounts.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Catalog CSV (code,type,price); defaults to the built-in demo catalog
    #[arg(long, value_name = "FILE")]
    catalog: Option<PathBuf>,

    /// Balance credited to each newly registered account
    #[arg(long, default_value = "100")]
    starting_balance: Decimal,

    /// Length of a course rental in days
    #[arg(long, default_value_t = 30)]
    rental_days: u32,

    /// How long to wait for a contended account
    #[arg(long, default_value_t = 500)]
    lock_timeout_ms: u64,

    /// Extra attempts after a lock timeout
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// What to write to stdout
    #[arg(long, value_enum, default_value_t = Output::Accounts)]
    output: Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Output {
    Accounts,
    Transactions,
}

impl Args {
    fn config(&self) -> LedgerConfig {
        LedgerConfig {
            starting_balance: self.starting_balance,
            rental_period_days: self.rental_days,
            lock_timeout_ms: self.lock_timeout_ms,
            max_retries: self.max_retries,
        }
    }
}

fn main() {
    telemetry::init();
    let args = Args::parse();

    let catalog = match &args.catalog {
        Some(path) => match File::open(path)
            .map_err(|e| e.to_string())
            .and_then(|f| load_catalog(BufReader::new(f)).map_err(|e| e.to_string()))
        {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::error!("Error loading catalog '{}': {}", path.display(), e);
                process::exit(1);
            }
        },
        None => InMemoryCatalog::demo(),
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let engine = Engine::in_memory(catalog, args.config());
    if let Err(e) = process_operations(&engine, BufReader::new(file)) {
        tracing::error!("Error processing operations: {}", e);
        process::exit(1);
    }

    let written = match args.output {
        Output::Accounts => write_accounts(&engine, std::io::stdout()),
        Output::Transactions => write_transactions(&engine, std::io::stdout()),
    };
    if let Err(e) = written {
        tracing::error!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw catalog row: `code, type, price`.
#[derive(Debug, Deserialize)]
struct CatalogRecord {
    code: String,
    #[serde(rename = "type")]
    course_type: CourseType,
    #[serde(deserialize_with = "csv::invalid_option")]
    price: Option<Decimal>,
}

#[derive(Debug, thiserror::Error)]
enum CatalogError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("row {row}: {source}")]
    Course { row: u32, source: CourseError },
}

/// Builds a catalog from CSV, numbering courses by row.
///
/// Unlike operations, catalog rows are not skipped: a bad row fails the load.
fn load_catalog<R: Read>(reader: R) -> Result<InMemoryCatalog, CatalogError> {
    let catalog = InMemoryCatalog::new();
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);

    for (id, result) in (1u32..).zip(rdr.deserialize::<CatalogRecord>()) {
        let record = result?;
        Course::new(
            CourseId(id),
            CourseCode::new(record.code),
            record.course_type,
            record.price,
        )
        .and_then(|course| catalog.insert(course))
        .map_err(|source| CatalogError::Course { row: id, source })?;
    }

    Ok(catalog)
}

/// Raw CSV record matching the operations format.
///
/// Fields: `op, user, course, amount`
#[derive(Debug, Deserialize)]
struct OperationRecord {
    op: String,
    user: u32,
    #[serde(default)]
    course: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
}

#[derive(Debug)]
enum Operation {
    Register,
    Deposit(Decimal),
    Pay(CourseCode),
}

impl OperationRecord {
    /// Returns `None` for unknown ops or missing required fields.
    fn into_operation(self) -> Option<(User, Operation)> {
        let user = User::new(UserId(self.user), format!("user{}@example.com", self.user));
        let op = match self.op.to_lowercase().as_str() {
            "register" => Operation::Register,
            "deposit" => Operation::Deposit(self.amount?),
            "pay" => Operation::Pay(CourseCode::new(self.course.filter(|c| !c.is_empty())?)),
            _ => return None,
        };
        Some((user, op))
    }
}

/// Applies operations from a CSV reader to `engine`.
///
/// Streams the input. Malformed rows and rejected operations are logged and
/// skipped; only a broken CSV stream aborts processing.
///
/// # CSV Format
///
/// ```csv
/// op,user,course,amount
/// register,1,,
/// deposit,1,,50.0
/// pay,1,032v,
/// ```
pub fn process_operations<R: Read>(engine: &Engine, reader: R) -> Result<(), csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for result in rdr.deserialize::<OperationRecord>() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!("Skipping malformed row: {}", e);
                continue;
            }
        };
        let Some((user, op)) = record.into_operation() else {
            tracing::debug!("Skipping invalid operation record");
            continue;
        };

        let outcome = match &op {
            Operation::Register => engine.register(&user).map(|_| ()),
            Operation::Deposit(amount) => engine.deposit(&user, *amount).map(|_| ()),
            Operation::Pay(code) => engine.pay(&user, code).map(|_| ()),
        };
        if let Err(e) = outcome {
            match e.kind() {
                ErrorKind::Rejected => tracing::debug!(user = %user.id, ?op, "Skipping: {}", e),
                _ => tracing::warn!(user = %user.id, ?op, "Skipping: {}", e),
            }
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct AccountRow {
    user: UserId,
    balance: Decimal,
    courses: String,
}

/// Writes `user,balance,courses` for every account, ordered by user id.
///
/// `courses` lists the codes of currently held courses, space separated.
pub fn write_accounts<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    let codes: HashMap<CourseId, CourseCode> = engine
        .catalog()
        .courses()
        .into_iter()
        .map(|course| (course.id(), course.code().clone()))
        .collect();

    for id in engine.users() {
        let user = User::new(id, String::new());
        let (Ok(balance), Ok(grants)) = (engine.balance(&user), engine.owned_courses(&user))
        else {
            tracing::warn!(user = %id, "Skipping account that could not be read");
            continue;
        };
        let courses = grants
            .iter()
            .filter_map(|grant| codes.get(&grant.course_id).map(CourseCode::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        wtr.serialize(AccountRow {
            user: id,
            balance: balance.round_dp(4),
            courses,
        })?;
    }

    wtr.flush()?;
    Ok(())
}

/// Writes the full ledger in the persisted transaction shape.
pub fn write_transactions<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    let mut transactions = Vec::new();
    for id in engine.users() {
        let user = User::new(id, String::new());
        match engine.transactions(&user, &TransactionFilter::new()) {
            Ok(history) => transactions.extend(history),
            Err(e) => tracing::warn!(user = %id, "Skipping history: {}", e),
        }
    }
    transactions.sort_by_key(|tx| tx.id());

    for tx in &transactions {
        wtr.serialize(tx)?;
    }

    wtr.flush()?;
    Ok(())
}
