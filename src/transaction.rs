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

//! Ledger entries.
//!
//! A [`Transaction`] is written exactly once, when its unit of work commits,
//! and is never mutated afterwards. Ownership of a course is derived from
//! these records alone:
//!
//! - a `Payment` with no `expires` is a permanent grant (BUY);
//! - a `Payment` with `expires` grants access strictly before that instant (RENT);
//! - a `Deposit` never grants anything.

use crate::base::{CourseCode, CourseId, TransactionId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::ser::{Serialize, SerializeStruct, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Payment,
    Deposit,
}

/// A committed ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: TransactionId,
    customer_id: UserId,
    course_id: Option<CourseId>,
    kind: TransactionKind,
    amount: Decimal,
    created: DateTime<Utc>,
    expires: Option<DateTime<Utc>>,
}

impl Transaction {
    const DECIMAL_PRECISION: u32 = 4;

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn customer_id(&self) -> UserId {
        self.customer_id
    }

    pub fn course_id(&self) -> Option<CourseId> {
        self.course_id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Always positive; see [`Transaction::signed_amount`] for direction.
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    /// Balance effect: positive for deposits, negative for payments.
    pub fn signed_amount(&self) -> Decimal {
        match self.kind {
            TransactionKind::Deposit => self.amount,
            TransactionKind::Payment => -self.amount,
        }
    }

    /// Returns `true` if this is a payment that still grants access at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.kind == TransactionKind::Payment && self.expires.is_none_or(|expires| expires > now)
    }

    /// Returns `true` if this payment grants `course_id` at `now`.
    pub fn grants(&self, course_id: CourseId, now: DateTime<Utc>) -> bool {
        self.course_id == Some(course_id) && self.is_active_at(now)
    }
}

impl Serialize for Transaction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Transaction", 7)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("customer_id", &self.customer_id)?;
        state.serialize_field("course_id", &self.course_id)?;
        state.serialize_field("type", &self.kind)?;
        state.serialize_field(
            "amount",
            &self.amount.round_dp(Transaction::DECIMAL_PRECISION),
        )?;
        state.serialize_field("created", &self.created)?;
        state.serialize_field("expires", &self.expires)?;
        state.end()
    }
}

/// A transaction staged inside a unit of work, not yet assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    course_id: Option<CourseId>,
    kind: TransactionKind,
    amount: Decimal,
    created: DateTime<Utc>,
    expires: Option<DateTime<Utc>>,
}

impl PendingTransaction {
    pub fn deposit(amount: Decimal, created: DateTime<Utc>) -> Self {
        Self {
            course_id: None,
            kind: TransactionKind::Deposit,
            amount,
            created,
            expires: None,
        }
    }

    pub fn payment(
        course_id: CourseId,
        amount: Decimal,
        created: DateTime<Utc>,
        expires: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            course_id: Some(course_id),
            kind: TransactionKind::Payment,
            amount,
            created,
            expires,
        }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn signed_amount(&self) -> Decimal {
        match self.kind {
            TransactionKind::Deposit => self.amount,
            TransactionKind::Payment => -self.amount,
        }
    }

    pub(crate) fn commit(self, id: TransactionId, customer_id: UserId) -> Transaction {
        Transaction {
            id,
            customer_id,
            course_id: self.course_id,
            kind: self.kind,
            amount: self.amount,
            created: self.created,
            expires: self.expires,
        }
    }
}

/// A course the user currently has access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Grant {
    pub course_id: CourseId,
    /// `None` for permanent access.
    pub expires: Option<DateTime<Utc>>,
}

/// Returns `true` if access ending at `a` lasts longer than access ending
/// at `b`. `None` means permanent.
pub(crate) fn outlasts(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (None, Some(_)) => true,
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}

/// Picks the longest-lasting active grant for `course_id` from `transactions`.
pub(crate) fn longest_grant<'a, I>(
    transactions: I,
    course_id: CourseId,
    now: DateTime<Utc>,
) -> Option<&'a Transaction>
where
    I: IntoIterator<Item = &'a Transaction>,
{
    transactions
        .into_iter()
        .filter(|tx| tx.grants(course_id, now))
        .fold(None, |best: Option<&Transaction>, tx| match best {
            Some(current) if !outlasts(tx.expires, current.expires) => Some(current),
            _ => Some(tx),
        })
}

/// History filter, mirroring the transaction listing query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub kind: Option<TransactionKind>,
    pub course_code: Option<CourseCode>,
    /// Drop payments whose grant has lapsed.
    pub skip_expired: bool,
}

impl TransactionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: TransactionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn course_code(mut self, code: impl Into<CourseCode>) -> Self {
        self.course_code = Some(code.into());
        self
    }

    pub fn skip_expired(mut self) -> Self {
        self.skip_expired = true;
        self
    }

    /// `course_id` is the resolved id of `course_code`, if one was given.
    pub(crate) fn matches(
        &self,
        tx: &Transaction,
        course_id: Option<CourseId>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.kind.is_some_and(|kind| kind != tx.kind) {
            return false;
        }
        if course_id.is_some() && tx.course_id != course_id {
            return false;
        }
        if self.skip_expired && tx.expires.is_some_and(|expires| expires <= now) {
            return false;
        }
        true
    }
}
