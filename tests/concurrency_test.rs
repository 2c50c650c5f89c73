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

//! Concurrency tests against the real engine.
//!
//! These run many threads against shared accounts while parking_lot's
//! deadlock detector watches the lock graph, then check the ledger
//! invariants on the final state.

mod common;

use chrono::{DateTime, Utc};
use common::{engine_with_clock, funded_engine, user};
use course_billing::{
    AccountStore, CourseCode, CourseId, Engine, InMemoryLedgerStore, LedgerConfig, LedgerError,
    LedgerStore, Transaction, TransactionFilter, TransactionStore, UnitOfWork, UserId,
};
use parking_lot::deadlock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// === Deadlock Detection Infrastructure ===

/// Starts a background thread that checks for deadlocks.
/// Returns a handle to stop the detector.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

/// Stops the deadlock detector.
fn stop_deadlock_detector(running: Arc<AtomicBool>) {
    running.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150));
}

fn net_of(engine: &Engine, id: u32) -> Decimal {
    engine
        .transactions(&user(id), &TransactionFilter::new())
        .unwrap()
        .iter()
        .map(Transaction::signed_amount)
        .sum()
}

// === Tests ===

/// Many threads race to buy the same course: exactly one wins.
#[test]
fn concurrent_buys_of_one_course_grant_once() {
    let detector = start_deadlock_detector();
    let (engine, _clock, alice) = funded_engine(dec!(1000));
    let engine = Arc::new(engine);

    const NUM_THREADS: usize = 32;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let successes = Arc::new(AtomicU32::new(0));
    let conflicts = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let successes = successes.clone();
            let conflicts = conflicts.clone();
            let alice = alice.clone();
            thread::spawn(move || {
                barrier.wait();
                match engine.pay(&alice, &CourseCode::from("032v")) {
                    Ok(_) => successes.fetch_add(1, Ordering::SeqCst),
                    Err(LedgerError::AlreadyOwned { .. }) => {
                        conflicts.fetch_add(1, Ordering::SeqCst)
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                };
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    stop_deadlock_detector(detector);

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(conflicts.load(Ordering::SeqCst), NUM_THREADS as u32 - 1);
    assert_eq!(engine.balance(&alice).unwrap(), dec!(970));
    assert_eq!(engine.owned_courses(&alice).unwrap().len(), 1);
}

/// Purchases competing for a small balance never overdraw it.
#[test]
fn concurrent_purchases_never_overdraw() {
    let detector = start_deadlock_detector();
    let (engine, _clock, alice) = funded_engine(dec!(50));
    let engine = Arc::new(engine);
    let codes = ["00с3", "032v", "032у", "0а2у"];

    let barrier = Arc::new(Barrier::new(codes.len() * 4));
    let handles: Vec<_> = codes
        .iter()
        .cycle()
        .take(codes.len() * 4)
        .map(|code| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let alice = alice.clone();
            let code = CourseCode::from(*code);
            thread::spawn(move || {
                barrier.wait();
                match engine.pay(&alice, &code) {
                    Ok(_)
                    | Err(LedgerError::AlreadyOwned { .. })
                    | Err(LedgerError::InsufficientFunds { .. }) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    stop_deadlock_detector(detector);

    let balance = engine.balance(&alice).unwrap();
    assert!(balance >= Decimal::ZERO);
    assert_eq!(net_of(&engine, 1), balance);

    // No course was granted twice.
    let payments: Vec<Option<CourseId>> = engine
        .transactions(&alice, &TransactionFilter::new())
        .unwrap()
        .iter()
        .filter(|tx| tx.course_id().is_some())
        .map(|tx| tx.course_id())
        .collect();
    let mut unique = payments.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), payments.len());
}

/// Deposits and purchases across many accounts neither deadlock nor leak money.
#[test]
fn no_deadlock_cross_account_operations() {
    let detector = start_deadlock_detector();
    let (engine, _clock) = engine_with_clock(LedgerConfig::default());
    let engine = Arc::new(engine);

    const NUM_ACCOUNTS: u32 = 10;
    const NUM_THREADS: usize = 20;
    const OPS_PER_THREAD: usize = 50;
    let codes = ["00a1", "00с3", "032v", "032у", "0а2у"];

    for id in 1..=NUM_ACCOUNTS {
        engine.register(&user(id)).unwrap();
    }

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|thread_id| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..OPS_PER_THREAD {
                    let id = ((thread_id + i) % NUM_ACCOUNTS as usize) as u32 + 1;
                    let customer = user(id);
                    if i % 3 == 0 {
                        engine.deposit(&customer, dec!(7.25)).unwrap();
                    } else {
                        let code = CourseCode::from(codes[(thread_id + i) % codes.len()]);
                        match engine.pay(&customer, &code) {
                            Ok(_)
                            | Err(LedgerError::AlreadyOwned { .. })
                            | Err(LedgerError::InsufficientFunds { .. }) => {}
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    }

                    // Also read from a different account
                    let other = user(((thread_id + i + 1) % NUM_ACCOUNTS as usize) as u32 + 1);
                    let _ = engine.owned_courses(&other).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    stop_deadlock_detector(detector);

    for id in 1..=NUM_ACCOUNTS {
        let balance = engine.balance(&user(id)).unwrap();
        assert!(balance >= Decimal::ZERO);
        assert_eq!(net_of(&engine, id), balance, "conservation for user {id}");
    }
}

// === Transient failure handling ===

/// Wraps the in-memory store and times out the first `failures` units of work.
struct FlakyStore {
    inner: InMemoryLedgerStore,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryLedgerStore::new(Duration::from_millis(10)),
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }
}

impl AccountStore for FlakyStore {
    fn open_account(&self, user: UserId) -> Result<(), LedgerError> {
        self.inner.open_account(user)
    }

    fn balance(&self, user: UserId) -> Result<Decimal, LedgerError> {
        self.inner.balance(user)
    }

    fn apply_delta(&self, user: UserId, delta: Decimal) -> Result<Decimal, LedgerError> {
        self.inner.apply_delta(user, delta)
    }

    fn user_ids(&self) -> Vec<UserId> {
        self.inner.user_ids()
    }
}

impl TransactionStore for FlakyStore {
    fn history(&self, user: UserId) -> Result<Vec<Transaction>, LedgerError> {
        self.inner.history(user)
    }

    fn find_active_grant(
        &self,
        user: UserId,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, LedgerError> {
        self.inner.find_active_grant(user, course_id, now)
    }
}

impl LedgerStore for FlakyStore {
    fn atomically<R, F>(&self, user: UserId, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut UnitOfWork<'_>) -> Result<R, LedgerError>,
    {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::LockTimeout { user });
        }
        self.inner.atomically(user, f)
    }

    fn open_with<R, F>(&self, user: UserId, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut UnitOfWork<'_>) -> Result<R, LedgerError>,
    {
        self.inner.open_with(user, f)
    }
}

fn flaky_engine(failures: u32, max_retries: u32) -> Engine<FlakyStore> {
    let config = LedgerConfig {
        max_retries,
        ..LedgerConfig::default()
    };
    let store = FlakyStore::new(failures);
    let clock = Arc::new(common::ManualClock::new(common::t0()));
    let engine = Engine::new(store, course_billing::InMemoryCatalog::demo(), clock, config);
    engine.register(&user(1)).unwrap();
    engine
}

#[test]
fn transient_failures_are_retried() {
    let engine = flaky_engine(2, 3);
    let alice = user(1);

    engine.pay(&alice, &CourseCode::from("032v")).unwrap();

    assert_eq!(engine.store().attempts.load(Ordering::SeqCst), 3);
    assert_eq!(engine.balance(&alice).unwrap(), dec!(70));
}

#[test]
fn retries_are_bounded() {
    let engine = flaky_engine(10, 2);
    let alice = user(1);

    let err = engine.pay(&alice, &CourseCode::from("032v")).unwrap_err();

    assert_eq!(err, LedgerError::LockTimeout { user: alice.id });
    assert!(err.is_retryable());
    assert_eq!(engine.store().attempts.load(Ordering::SeqCst), 3);
    assert_eq!(engine.balance(&alice).unwrap(), dec!(100));
    assert!(engine.owned_courses(&alice).unwrap().is_empty());
}

#[test]
fn business_rejections_are_not_retried() {
    let engine = flaky_engine(0, 3);
    let alice = user(1);
    engine.pay(&alice, &CourseCode::from("032v")).unwrap();
    let before = engine.store().attempts.load(Ordering::SeqCst);

    assert!(matches!(
        engine.pay(&alice, &CourseCode::from("032v")),
        Err(LedgerError::AlreadyOwned { .. })
    ));
    assert_eq!(engine.store().attempts.load(Ordering::SeqCst), before + 1);
}
