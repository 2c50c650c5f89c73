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

//! Error types for purchase and ledger processing.
//!
//! Every failure is one of three kinds (see [`ErrorKind`]):
//!
//! - **Rejected**: a legitimate outcome of a valid call (already owned,
//!   insufficient funds, unknown course). Surfaced to the user, never retried.
//! - **Precondition**: the caller broke the engine's contract.
//! - **Transient**: the store could not complete the unit of work. Nothing
//!   was committed, so the whole call is safe to retry.

use crate::base::{CourseCode, UserId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Classification of a [`LedgerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Rejected,
    Precondition,
    Transient,
}

/// Ledger processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// User already holds an active grant for the course
    #[error("course {course} is already owned")]
    AlreadyOwned { course: CourseCode },

    /// Balance does not cover the course price
    #[error("insufficient funds: balance {balance}, price {price}")]
    InsufficientFunds { balance: Decimal, price: Decimal },

    /// No course with this code exists in the catalog
    #[error("course {code} not found")]
    CourseNotFound { code: CourseCode },

    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Balance would exceed the representable range
    #[error("amount overflows the balance")]
    AmountOverflow,

    /// Rental expiry lies beyond the representable time range
    #[error("rental period of {days} days is out of range")]
    RentalOutOfRange { days: u32 },

    /// Registration for an account that is already open
    #[error("account {user} already exists")]
    AccountExists { user: UserId },

    /// Operation on an account that was never opened
    #[error("account {user} not found")]
    AccountNotFound { user: UserId },

    /// Free courses never go through the purchase path
    #[error("course {code} cannot be purchased")]
    NotPurchasable { code: CourseCode },

    /// The account stayed locked past the configured timeout
    #[error("account {user} is busy, try again")]
    LockTimeout { user: UserId },
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyOwned { .. }
            | Self::InsufficientFunds { .. }
            | Self::CourseNotFound { .. }
            | Self::InvalidAmount
            | Self::AmountOverflow
            | Self::AccountExists { .. } => ErrorKind::Rejected,
            Self::AccountNotFound { .. }
            | Self::NotPurchasable { .. }
            | Self::RentalOutOfRange { .. } => ErrorKind::Precondition,
            Self::LockTimeout { .. } => ErrorKind::Transient,
        }
    }

    /// Returns `true` when retrying the whole call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// HTTP-equivalent status for the calling layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AlreadyOwned { .. } => 409,
            Self::InsufficientFunds { .. } => 406,
            Self::CourseNotFound { .. } => 404,
            Self::InvalidAmount | Self::AmountOverflow | Self::AccountExists { .. } => 400,
            Self::AccountNotFound { .. }
            | Self::NotPurchasable { .. }
            | Self::RentalOutOfRange { .. } => 500,
            Self::LockTimeout { .. } => 503,
        }
    }
}

/// Errors raised while building or registering catalog entries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CourseError {
    #[error("rent and buy courses require a price")]
    MissingPrice,

    #[error("course price must be positive")]
    NonPositivePrice,

    #[error("free courses cannot carry a price")]
    UnexpectedPrice,

    #[error("course code {0} already exists")]
    DuplicateCode(CourseCode),
}
