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

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use course_billing::{
    Course, CourseCode, CourseId, CourseType, Engine, InMemoryCatalog, InMemoryLedgerStore,
    LedgerConfig, User, UserId,
};
use mockable::Clock;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Mutex::new(start))
    }

    pub fn advance(&self, delta: TimeDelta) {
        *self.0.lock() += delta;
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

/// 2026-01-01T00:00:00Z
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub fn user(id: u32) -> User {
    User::new(UserId(id), format!("user{id}@example.com"))
}

pub fn paid(id: u32, code: &str, course_type: CourseType, price: Decimal) -> Course {
    Course::new(CourseId(id), CourseCode::from(code), course_type, Some(price)).unwrap()
}

/// Engine over the demo catalog, driven by a manual clock starting at [`t0`].
pub fn engine_with_clock(config: LedgerConfig) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = InMemoryLedgerStore::new(config.lock_timeout());
    let engine = Engine::new(store, InMemoryCatalog::demo(), clock.clone(), config);
    (engine, clock)
}

/// Registered user with `balance` and no other history.
pub fn funded_engine(balance: Decimal) -> (Engine, Arc<ManualClock>, User) {
    let config = LedgerConfig {
        starting_balance: balance,
        ..LedgerConfig::default()
    };
    let (engine, clock) = engine_with_clock(config);
    let alice = user(1);
    engine.register(&alice).unwrap();
    (engine, clock, alice)
}
