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

//! Ledger storage.
//!
//! Each account owns a [`parking_lot::Mutex`] guarding its balance together
//! with its transaction log. All mutation goes through
//! [`LedgerStore::atomically`], which locks exactly one account, hands the
//! closure a [`UnitOfWork`], and commits the staged balance and records only
//! if the closure returns `Ok`. There is no lock spanning several accounts.
//!
//! ```
//! use course_billing::{AccountStore, InMemoryLedgerStore, UserId};
//! use rust_decimal_macros::dec;
//! use std::time::Duration;
//!
//! let store = InMemoryLedgerStore::new(Duration::from_millis(100));
//! store.open_account(UserId(1)).unwrap();
//! assert_eq!(store.apply_delta(UserId(1), dec!(25)).unwrap(), dec!(25));
//! assert_eq!(store.balance(UserId(1)).unwrap(), dec!(25));
//! ```

use crate::base::{CourseId, TransactionId, UserId};
use crate::error::LedgerError;
use crate::transaction::{PendingTransaction, Transaction, longest_grant};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Balance storage.
pub trait AccountStore: Send + Sync {
    /// Opens an empty account.
    ///
    /// # Errors
    ///
    /// [`LedgerError::AccountExists`] if the account is already open.
    fn open_account(&self, user: UserId) -> Result<(), LedgerError>;

    fn balance(&self, user: UserId) -> Result<Decimal, LedgerError>;

    /// Adds `delta` to the balance as one conditional update and returns the
    /// new balance. Writes no ledger record.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientFunds`] if the result would be negative.
    fn apply_delta(&self, user: UserId, delta: Decimal) -> Result<Decimal, LedgerError>;

    /// Ids of every open account, ascending.
    fn user_ids(&self) -> Vec<UserId>;
}

/// Append-only transaction log.
pub trait TransactionStore: Send + Sync {
    /// Committed transactions for `user` in commit order.
    fn history(&self, user: UserId) -> Result<Vec<Transaction>, LedgerError>;

    /// Longest-lasting payment granting `course_id` at `now`, if any.
    fn find_active_grant(
        &self,
        user: UserId,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, LedgerError>;
}

/// A store offering all-or-nothing mutation of a single account.
pub trait LedgerStore: AccountStore + TransactionStore {
    /// Runs `f` with exclusive access to `user`'s account.
    ///
    /// Staged changes become visible only if `f` returns `Ok`. On `Err` the
    /// account is left exactly as it was.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::AccountNotFound`] if the account was never opened.
    /// - [`LedgerError::LockTimeout`] if the account stays contended past the
    ///   store's timeout.
    /// - Whatever `f` returns.
    fn atomically<R, F>(&self, user: UserId, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut UnitOfWork<'_>) -> Result<R, LedgerError>;

    /// Opens `user`'s account and runs `f` against it as one unit.
    ///
    /// The account only comes into existence if `f` returns `Ok`.
    fn open_with<R, F>(&self, user: UserId, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut UnitOfWork<'_>) -> Result<R, LedgerError>;
}

#[derive(Debug)]
struct AccountData {
    user_id: UserId,
    balance: Decimal,
    transactions: Vec<Transaction>,
}

impl AccountData {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: Decimal::ZERO,
            transactions: Vec::new(),
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.balance >= Decimal::ZERO,
            "Invariant violated: balance went negative: {}",
            self.balance
        );
    }

    fn commit(&mut self, balance: Decimal, staged: Vec<Transaction>) {
        self.balance = balance;
        self.transactions.extend(staged);
        self.assert_invariants();
    }
}

#[derive(Debug)]
struct Account {
    inner: Mutex<AccountData>,
}

/// Staged view of one locked account.
///
/// Reads see committed state plus anything staged so far in this unit.
pub struct UnitOfWork<'a> {
    data: &'a AccountData,
    next_id: &'a AtomicU64,
    balance: Decimal,
    staged: Vec<Transaction>,
}

impl<'a> UnitOfWork<'a> {
    fn new(data: &'a AccountData, next_id: &'a AtomicU64) -> Self {
        Self {
            data,
            next_id,
            balance: data.balance,
            staged: Vec::new(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.data.user_id
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    /// Stages a balance change.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InsufficientFunds`] if the balance would go negative.
    /// - [`LedgerError::AmountOverflow`] if it would leave the `Decimal` range.
    pub fn apply_delta(&mut self, delta: Decimal) -> Result<Decimal, LedgerError> {
        let next = self
            .balance
            .checked_add(delta)
            .ok_or(LedgerError::AmountOverflow)?;
        if next < Decimal::ZERO {
            return Err(LedgerError::InsufficientFunds {
                balance: self.balance,
                price: -delta,
            });
        }
        self.balance = next;
        Ok(next)
    }

    /// Stages a ledger record together with its balance effect.
    ///
    /// The returned transaction already carries its store-assigned id; it
    /// becomes durable only when the unit commits.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] for a zero or negative amount.
    /// - [`LedgerError::InsufficientFunds`] if a payment exceeds the balance.
    /// - [`LedgerError::AmountOverflow`] if a deposit overflows the balance.
    pub fn append(&mut self, pending: PendingTransaction) -> Result<Transaction, LedgerError> {
        if pending.amount() <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        self.apply_delta(pending.signed_amount())?;
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let transaction = pending.commit(id, self.data.user_id);
        self.staged.push(transaction.clone());
        Ok(transaction)
    }

    /// Committed and staged transactions, oldest first.
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.data.transactions.iter().chain(self.staged.iter())
    }

    /// Longest-lasting payment granting `course_id` at `now`.
    pub fn active_grant(&self, course_id: CourseId, now: DateTime<Utc>) -> Option<&Transaction> {
        longest_grant(self.transactions(), course_id, now)
    }

    fn into_parts(self) -> (Decimal, Vec<Transaction>) {
        (self.balance, self.staged)
    }
}

/// Thread-safe in-memory [`LedgerStore`].
///
/// Accounts are held as `Arc`s so a caller never holds a map shard while
/// waiting on an account lock.
#[derive(Debug)]
pub struct InMemoryLedgerStore {
    accounts: DashMap<UserId, Arc<Account>>,
    next_id: AtomicU64,
    lock_timeout: Duration,
}

impl InMemoryLedgerStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            accounts: DashMap::new(),
            next_id: AtomicU64::new(1),
            lock_timeout,
        }
    }

    fn account(&self, user: UserId) -> Result<Arc<Account>, LedgerError> {
        self.accounts
            .get(&user)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(LedgerError::AccountNotFound { user })
    }

    fn with_locked<R>(
        &self,
        user: UserId,
        f: impl FnOnce(&mut AccountData) -> R,
    ) -> Result<R, LedgerError> {
        let account = self.account(user)?;
        let mut data = account
            .inner
            .try_lock_for(self.lock_timeout)
            .ok_or(LedgerError::LockTimeout { user })?;
        Ok(f(&mut data))
    }
}

impl AccountStore for InMemoryLedgerStore {
    fn open_account(&self, user: UserId) -> Result<(), LedgerError> {
        self.open_with(user, |_| Ok(()))
    }

    fn balance(&self, user: UserId) -> Result<Decimal, LedgerError> {
        self.with_locked(user, |data| data.balance)
    }

    fn apply_delta(&self, user: UserId, delta: Decimal) -> Result<Decimal, LedgerError> {
        self.atomically(user, |unit| unit.apply_delta(delta))
    }

    fn user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.accounts.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }
}

impl TransactionStore for InMemoryLedgerStore {
    fn history(&self, user: UserId) -> Result<Vec<Transaction>, LedgerError> {
        self.with_locked(user, |data| data.transactions.clone())
    }

    fn find_active_grant(
        &self,
        user: UserId,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, LedgerError> {
        self.with_locked(user, |data| {
            longest_grant(&data.transactions, course_id, now).cloned()
        })
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn atomically<R, F>(&self, user: UserId, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut UnitOfWork<'_>) -> Result<R, LedgerError>,
    {
        let account = self.account(user)?;
        let mut data = account
            .inner
            .try_lock_for(self.lock_timeout)
            .ok_or(LedgerError::LockTimeout { user })?;

        let mut unit = UnitOfWork::new(&data, &self.next_id);
        let result = f(&mut unit)?;
        let (balance, staged) = unit.into_parts();
        data.commit(balance, staged);
        Ok(result)
    }

    fn open_with<R, F>(&self, user: UserId, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut UnitOfWork<'_>) -> Result<R, LedgerError>,
    {
        // The vacant entry keeps the shard locked, so no other caller can
        // open or observe the account until it is fully initialised.
        match self.accounts.entry(user) {
            Entry::Occupied(_) => Err(LedgerError::AccountExists { user }),
            Entry::Vacant(entry) => {
                let mut data = AccountData::new(user);
                let mut unit = UnitOfWork::new(&data, &self.next_id);
                let result = f(&mut unit)?;
                let (balance, staged) = unit.into_parts();
                data.commit(balance, staged);
                entry.insert(Arc::new(Account {
                    inner: Mutex::new(data),
                }));
                Ok(result)
            }
        }
    }
}
