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

//! Ledger policy configuration.

use chrono::TimeDelta;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::time::Duration;

/// Policy knobs for the billing engine.
///
/// Missing fields fall back to their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Credited to every new account at registration.
    pub starting_balance: Decimal,
    /// Length of access granted by a RENT purchase.
    pub rental_period_days: u32,
    /// Upper bound on waiting for a contended account.
    pub lock_timeout_ms: u64,
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
}

impl LedgerConfig {
    pub fn rental_period(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.rental_period_days))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            starting_balance: dec!(100),
            rental_period_days: 30,
            lock_timeout_ms: 500,
            max_retries: 3,
        }
    }
}
