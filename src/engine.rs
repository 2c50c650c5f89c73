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

//! Purchase and deposit engine.
//!
//! The [`Engine`] is the central component. It decides whether a purchase is
//! allowed, debits the balance, records the transaction, and derives
//! time-boxed access for rented courses.
//!
//! # Purchase checks
//!
//! In order, first failure wins:
//!
//! 1. An active grant for the course exists: [`LedgerError::AlreadyOwned`].
//! 2. The balance does not cover the price: [`LedgerError::InsufficientFunds`].
//! 3. Otherwise the price is debited and a payment recorded. BUY grants are
//!    permanent; RENT grants expire after the configured rental period.
//!
//! All three steps run inside one [`LedgerStore::atomically`] unit, so two
//! concurrent purchases on the same account are serialized and at most one
//! of them can pass the checks.
//!
//! # Thread Safety
//!
//! `Engine` is `Sync` when its store and catalog are; share it behind an
//! `Arc` across request handlers.

use crate::base::{CourseCode, CourseId, User, UserId};
use crate::config::LedgerConfig;
use crate::course::{Course, CourseCatalog, CourseType, InMemoryCatalog};
use crate::error::{ErrorKind, LedgerError};
use crate::store::{InMemoryLedgerStore, LedgerStore, UnitOfWork};
use crate::transaction::{Grant, PendingTransaction, Transaction, TransactionFilter, outlasts};
use chrono::{DateTime, Utc};
use mockable::{Clock, DefaultClock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Outcome of [`Engine::pay`] as handed back to the calling layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentReceipt {
    pub success: bool,
    pub course_type: CourseType,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Billing engine over a ledger store and a course catalog.
pub struct Engine<S = InMemoryLedgerStore, C = InMemoryCatalog> {
    store: S,
    catalog: C,
    clock: Arc<dyn Clock + Send + Sync>,
    config: LedgerConfig,
}

impl Engine {
    /// In-memory engine reading the system clock.
    pub fn in_memory(catalog: InMemoryCatalog, config: LedgerConfig) -> Self {
        let store = InMemoryLedgerStore::new(config.lock_timeout());
        Engine::new(store, catalog, Arc::new(DefaultClock), config)
    }
}

impl<S, C> Engine<S, C>
where
    S: LedgerStore,
    C: CourseCatalog,
{
    pub fn new(
        store: S,
        catalog: C,
        clock: Arc<dyn Clock + Send + Sync>,
        config: LedgerConfig,
    ) -> Self {
        Engine {
            store,
            catalog,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Opens the user's account and credits the configured starting balance.
    ///
    /// Returns the starting deposit, or `None` when the starting balance is
    /// zero.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::AccountExists`] if the user is already registered.
    /// - [`LedgerError::InvalidAmount`] if the starting balance is negative.
    pub fn register(&self, user: &User) -> Result<Option<Transaction>, LedgerError> {
        let starting = self.config.starting_balance;
        let result = self.store.open_with(user.id, |unit| {
            if starting.is_zero() {
                return Ok(None);
            }
            let now = self.clock.utc();
            unit.append(PendingTransaction::deposit(starting, now)).map(Some)
        });

        match &result {
            Ok(_) => tracing::info!(user = %user.id, balance = %starting, "account registered"),
            Err(err) => log_failure("register", user.id, err),
        }
        result
    }

    /// Credits `amount` to the user's balance.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] if `amount` is not positive.
    /// - [`LedgerError::AmountOverflow`] if the balance would leave the
    ///   `Decimal` range.
    /// - [`LedgerError::AccountNotFound`] for an unregistered user.
    /// - [`LedgerError::LockTimeout`] if the account stays contended after
    ///   every retry.
    pub fn deposit(&self, user: &User, amount: Decimal) -> Result<Transaction, LedgerError> {
        let result = if amount <= Decimal::ZERO {
            Err(LedgerError::InvalidAmount)
        } else {
            self.retrying(user.id, || {
                self.store.atomically(user.id, |unit| {
                    let now = self.clock.utc();
                    unit.append(PendingTransaction::deposit(amount, now))
                })
            })
        };

        match &result {
            Ok(tx) => tracing::info!(user = %user.id, tx = %tx.id(), %amount, "deposit committed"),
            Err(err) => log_failure("deposit", user.id, err),
        }
        result
    }

    /// Buys or rents `course` for `user`.
    ///
    /// Only RENT and BUY courses belong here; free courses are settled by the
    /// caller (see [`Engine::pay`]).
    ///
    /// # Errors
    ///
    /// - [`LedgerError::AlreadyOwned`] if the user holds an active grant.
    /// - [`LedgerError::InsufficientFunds`] if the balance is below the price.
    /// - [`LedgerError::AccountNotFound`] for an unregistered user.
    /// - [`LedgerError::NotPurchasable`] for a free course (debug builds
    ///   panic instead).
    /// - [`LedgerError::RentalOutOfRange`] if the rental period pushes the
    ///   expiry past the representable time range.
    /// - [`LedgerError::LockTimeout`] if the account stays contended after
    ///   every retry.
    pub fn purchase(&self, user: &User, course: &Course) -> Result<Transaction, LedgerError> {
        let course_type = course.course_type();
        debug_assert!(
            !course_type.is_free(),
            "free course {} reached the purchase path",
            course.code()
        );

        let result = if course_type.is_free() {
            Err(LedgerError::NotPurchasable {
                code: course.code().clone(),
            })
        } else {
            self.retrying(user.id, || {
                self.store
                    .atomically(user.id, |unit| self.settle(unit, course))
            })
        };

        match &result {
            Ok(tx) => tracing::info!(
                user = %user.id,
                course = %course.code(),
                tx = %tx.id(),
                price = %tx.amount(),
                expires = ?tx.expires(),
                "purchase committed"
            ),
            Err(err) => log_failure("purchase", user.id, err),
        }
        result
    }

    // Check-then-act for one purchase; runs with the account locked.
    fn settle(
        &self,
        unit: &mut UnitOfWork<'_>,
        course: &Course,
    ) -> Result<Transaction, LedgerError> {
        let now = self.clock.utc();

        if unit.active_grant(course.id(), now).is_some() {
            return Err(LedgerError::AlreadyOwned {
                course: course.code().clone(),
            });
        }

        let price = course.price();
        if unit.balance() < price {
            return Err(LedgerError::InsufficientFunds {
                balance: unit.balance(),
                price,
            });
        }

        let expires = match course.course_type() {
            CourseType::Rent => {
                let expires = now
                    .checked_add_signed(self.config.rental_period())
                    .ok_or(LedgerError::RentalOutOfRange {
                        days: self.config.rental_period_days,
                    })?;
                Some(expires)
            }
            CourseType::Buy | CourseType::Free => None,
        };
        unit.append(PendingTransaction::payment(course.id(), price, now, expires))
    }

    /// Pays for the course with `code`, settling free courses without
    /// touching the ledger.
    ///
    /// # Errors
    ///
    /// [`LedgerError::CourseNotFound`] for an unknown code, otherwise the
    /// errors of [`Engine::purchase`].
    pub fn pay(&self, user: &User, code: &CourseCode) -> Result<PaymentReceipt, LedgerError> {
        let course = self.resolve(code)?;
        if course.course_type().is_free() {
            return Ok(PaymentReceipt {
                success: true,
                course_type: CourseType::Free,
                expires_at: None,
            });
        }

        let tx = self.purchase(user, &course)?;
        Ok(PaymentReceipt {
            success: true,
            course_type: course.course_type(),
            expires_at: tx.expires(),
        })
    }

    pub fn balance(&self, user: &User) -> Result<Decimal, LedgerError> {
        self.store.balance(user.id)
    }

    /// The payment currently granting `user` access to `code`, if any.
    ///
    /// Free courses never have one.
    ///
    /// # Errors
    ///
    /// [`LedgerError::CourseNotFound`] for an unknown code.
    pub fn find_active_grant(
        &self,
        user: &User,
        code: &CourseCode,
    ) -> Result<Option<Transaction>, LedgerError> {
        let course = self.resolve(code)?;
        self.store
            .find_active_grant(user.id, course.id(), self.clock.utc())
    }

    /// The user's history in commit order, narrowed by `filter`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::CourseNotFound`] if the filter names an unknown course.
    pub fn transactions(
        &self,
        user: &User,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let course_id = filter
            .course_code
            .as_ref()
            .map(|code| self.resolve(code).map(|course| course.id()))
            .transpose()?;
        let now = self.clock.utc();

        Ok(self
            .store
            .history(user.id)?
            .into_iter()
            .filter(|tx| filter.matches(tx, course_id, now))
            .collect())
    }

    /// Every course the user can currently access through a payment, one
    /// grant per course ordered by course id. Free courses are not listed.
    pub fn owned_courses(&self, user: &User) -> Result<Vec<Grant>, LedgerError> {
        let now = self.clock.utc();
        let mut grants: BTreeMap<CourseId, Option<DateTime<Utc>>> = BTreeMap::new();

        for tx in self.store.history(user.id)? {
            let Some(course_id) = tx.course_id() else {
                continue;
            };
            if !tx.is_active_at(now) {
                continue;
            }
            grants
                .entry(course_id)
                .and_modify(|best| {
                    if outlasts(tx.expires(), *best) {
                        *best = tx.expires();
                    }
                })
                .or_insert(tx.expires());
        }

        Ok(grants
            .into_iter()
            .map(|(course_id, expires)| Grant { course_id, expires })
            .collect())
    }

    /// Ids of every registered account, ascending.
    pub fn users(&self) -> Vec<UserId> {
        self.store.user_ids()
    }

    fn resolve(&self, code: &CourseCode) -> Result<Course, LedgerError> {
        self.catalog
            .resolve_by_code(code)
            .ok_or_else(|| LedgerError::CourseNotFound { code: code.clone() })
    }

    // Reruns `op` on transient failures, up to `max_retries` extra attempts.
    fn retrying<R>(
        &self,
        user: UserId,
        mut op: impl FnMut() -> Result<R, LedgerError>,
    ) -> Result<R, LedgerError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::debug!(%user, attempt, "account contended, retrying");
                }
                result => return result,
            }
        }
    }
}

fn log_failure(op: &'static str, user: UserId, err: &LedgerError) {
    match err.kind() {
        ErrorKind::Rejected => tracing::debug!(op, %user, reason = %err, "request rejected"),
        ErrorKind::Precondition => {
            tracing::error!(op, %user, reason = %err, "precondition violated")
        }
        ErrorKind::Transient => tracing::warn!(op, %user, reason = %err, "ledger unavailable"),
    }
}
