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

//! # Course Billing
//!
//! This library sells access to courses against a prepaid account balance.
//! It decides whether a purchase is allowed, atomically debits the balance,
//! records an immutable ledger entry, and derives time-boxed access for
//! rented courses.
//!
//! ## Core Components
//!
//! - [`Engine`]: purchase, deposit and ownership queries
//! - [`LedgerStore`]: per-account all-or-nothing units of work
//! - [`CourseCatalog`]: code to course type and price lookup
//! - [`Transaction`]: append-only ledger entry
//! - [`LedgerError`]: typed outcomes, classified by [`ErrorKind`]
//!
//! ## Example
//!
//! ```
//! use course_billing::{CourseCode, Engine, InMemoryCatalog, LedgerConfig, LedgerError, User, UserId};
//! use rust_decimal_macros::dec;
//!
//! let engine = Engine::in_memory(InMemoryCatalog::demo(), LedgerConfig::default());
//! let user = User::new(UserId(1), "user@example.com");
//! engine.register(&user).unwrap();
//!
//! // Buy course 032v for 30
//! let receipt = engine.pay(&user, &CourseCode::from("032v")).unwrap();
//! assert!(receipt.success);
//! assert_eq!(receipt.expires_at, None);
//! assert_eq!(engine.balance(&user).unwrap(), dec!(70));
//!
//! // A second purchase is rejected without charging again
//! let again = engine.pay(&user, &CourseCode::from("032v"));
//! assert!(matches!(again, Err(LedgerError::AlreadyOwned { .. })));
//! assert_eq!(engine.balance(&user).unwrap(), dec!(70));
//! ```
//!
//! ## Thread Safety
//!
//! Accounts are locked individually. Purchases and deposits on one account
//! are serialized; operations on different accounts run in parallel.

mod base;
pub mod config;
pub mod course;
mod engine;
pub mod error;
pub mod store;
pub mod telemetry;
mod transaction;

pub use base::{CourseCode, CourseId, TransactionId, User, UserId};
pub use config::LedgerConfig;
pub use course::{Course, CourseCatalog, CourseType, InMemoryCatalog};
pub use engine::{Engine, PaymentReceipt};
pub use error::{CourseError, ErrorKind, LedgerError};
pub use store::{AccountStore, InMemoryLedgerStore, LedgerStore, TransactionStore, UnitOfWork};
pub use transaction::{Grant, PendingTransaction, Transaction, TransactionFilter, TransactionKind};
