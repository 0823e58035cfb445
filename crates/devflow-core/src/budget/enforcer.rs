//! Hierarchical budget enforcement.
//!
//! Three ceilings are checked for every reservation: the monthly limit
//! (shared by all runs), the run limit and the step limit. All state sits
//! behind one mutex so a reservation is all-or-nothing across levels and
//! concurrent runs cannot over-commit the monthly budget.
//!
//! Step accounts belong to one execution of a step (its `scope`), so loop
//! iterations and repeated undo calls each get a fresh step ceiling while
//! retries within an execution share one.
//!
//! Invariant at every level: `reserved + spent <= limit`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use devflow_types::budget::{
    AccountSnapshot, BudgetLevel, BudgetSnapshot, BudgetStatus, ReservationId, Settlement,
};
use devflow_types::config::BudgetConfig;
use devflow_types::event::WorkflowEvent;
use uuid::Uuid;

use super::BudgetError;
use crate::event::EventBus;

/// Float slack so a sequence of reservations summing to the limit fits.
const EPSILON: f64 = 1e-9;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A request to hold `amount` for one attempt of a step.
#[derive(Debug, Clone)]
pub struct BudgetRequest {
    pub run_id: Uuid,
    pub step: String,
    /// One id per step execution; attempts of that execution share it.
    pub scope: Uuid,
    pub amount: f64,
    /// Step ceiling; the configured default applies when `None`.
    pub step_limit: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Account {
    limit: f64,
    reserved: f64,
    spent: f64,
}

impl Account {
    fn new(limit: f64) -> Self {
        Self {
            limit,
            reserved: 0.0,
            spent: 0.0,
        }
    }

    fn available(&self) -> f64 {
        (self.limit - self.reserved - self.spent).max(0.0)
    }

    fn fits(&self, amount: f64) -> bool {
        self.reserved + self.spent + amount <= self.limit + EPSILON
    }

    fn unreserve(&mut self, amount: f64) {
        self.reserved = (self.reserved - amount).max(0.0);
    }

    fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            limit: self.limit,
            reserved: self.reserved,
            spent: self.spent,
        }
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    run_id: Uuid,
    step: String,
    scope: Uuid,
    amount: f64,
}

#[derive(Debug, Default)]
struct Ledger {
    period: String,
    monthly: Account,
    runs: HashMap<Uuid, Account>,
    steps: HashMap<(Uuid, Uuid), Account>,
    reservations: HashMap<ReservationId, Reservation>,
    warned: bool,
}

/// Budget enforcer shared by every run of an engine.
pub struct BudgetEnforcer {
    config: BudgetConfig,
    ledger: Mutex<Ledger>,
    events: EventBus,
    clock: Clock,
}

impl std::fmt::Debug for BudgetEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetEnforcer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn period_of(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

impl BudgetEnforcer {
    pub fn new(config: BudgetConfig, events: EventBus) -> Self {
        Self::with_clock(config, events, Arc::new(Utc::now))
    }

    /// Build an enforcer with an explicit clock (used for month rollover).
    pub fn with_clock(config: BudgetConfig, events: EventBus, clock: Clock) -> Self {
        let ledger = Ledger {
            period: period_of(clock()),
            monthly: Account::new(config.monthly_limit),
            ..Default::default()
        };
        Self {
            config,
            ledger: Mutex::new(ledger),
            events,
            clock,
        }
    }

    /// Open the run-level account. `limit` falls back to the configured
    /// run limit.
    pub fn open_run(&self, run_id: Uuid, limit: Option<f64>) {
        let limit = limit.unwrap_or(self.config.run_limit);
        self.lock().runs.insert(run_id, Account::new(limit));
        tracing::debug!(run_id = %run_id, limit, "opened run budget");
    }

    /// Close the run account, releasing anything it still holds.
    pub fn close_run(&self, run_id: Uuid) -> Option<AccountSnapshot> {
        let mut ledger = self.lock();
        let dangling: Vec<ReservationId> = ledger
            .reservations
            .iter()
            .filter(|(_, r)| r.run_id == run_id)
            .map(|(id, _)| *id)
            .collect();
        for id in dangling {
            if let Some(reservation) = ledger.reservations.remove(&id) {
                ledger.monthly.unreserve(reservation.amount);
                tracing::warn!(run_id = %run_id, step = %reservation.step, "released dangling reservation");
            }
        }
        ledger.steps.retain(|(run, _), _| *run != run_id);
        ledger.runs.remove(&run_id).map(|account| account.snapshot())
    }

    /// Drop the step account of a finished execution. Reservations still
    /// held under `scope` are released.
    pub fn close_scope(&self, run_id: Uuid, scope: Uuid) {
        let mut ledger = self.lock();
        let dangling: Vec<ReservationId> = ledger
            .reservations
            .iter()
            .filter(|(_, r)| r.run_id == run_id && r.scope == scope)
            .map(|(id, _)| *id)
            .collect();
        for id in dangling {
            if let Some(reservation) = ledger.reservations.remove(&id) {
                ledger.monthly.unreserve(reservation.amount);
                if let Some(run) = ledger.runs.get_mut(&run_id) {
                    run.unreserve(reservation.amount);
                }
            }
        }
        ledger.steps.remove(&(run_id, scope));
    }

    /// Atomically reserve `amount` at the monthly, run and step levels.
    pub fn reserve(&self, request: &BudgetRequest) -> Result<ReservationId, BudgetError> {
        let amount = request.amount;
        if !amount.is_finite() || amount < 0.0 {
            return Err(BudgetError::InvalidAmount(amount));
        }
        let step_limit = request.step_limit.unwrap_or(self.config.step_limit);

        let mut ledger = self.lock();
        self.roll_period(&mut ledger);

        let run = *ledger
            .runs
            .get(&request.run_id)
            .ok_or(BudgetError::UnknownRun(request.run_id))?;
        let step_key = (request.run_id, request.scope);
        let step = ledger
            .steps
            .get(&step_key)
            .copied()
            .unwrap_or_else(|| Account::new(step_limit));

        for (level, account) in [
            (BudgetLevel::Monthly, ledger.monthly),
            (BudgetLevel::Run, run),
            (BudgetLevel::Step, step),
        ] {
            if !account.fits(amount) {
                tracing::warn!(
                    run_id = %request.run_id,
                    step = %request.step,
                    level = %level,
                    requested = amount,
                    available = account.available(),
                    "budget reservation denied"
                );
                return Err(BudgetError::Denied {
                    level,
                    requested: amount,
                    available: account.available(),
                });
            }
        }

        ledger.monthly.reserved += amount;
        if let Some(run) = ledger.runs.get_mut(&request.run_id) {
            run.reserved += amount;
        }
        let mut step = step;
        step.reserved += amount;
        ledger.steps.insert(step_key, step);

        let id = ReservationId::new();
        ledger.reservations.insert(
            id,
            Reservation {
                run_id: request.run_id,
                step: request.step.clone(),
                scope: request.scope,
                amount,
            },
        );
        Ok(id)
    }

    /// Settle a reservation against the actual cost.
    ///
    /// Charges `min(actual, headroom)` where headroom is the smallest
    /// remaining amount across the three levels after the reservation is
    /// released, so `spent` never exceeds a limit. Anything beyond that is
    /// reported as [`BudgetError::Overrun`] with the charged amount.
    pub fn reconcile(&self, id: ReservationId, actual: f64) -> Result<Settlement, BudgetError> {
        if !actual.is_finite() || actual < 0.0 {
            self.release(id)?;
            return Err(BudgetError::InvalidAmount(actual));
        }

        let (settlement, status) = {
            let mut ledger = self.lock();
            let reservation = ledger
                .reservations
                .remove(&id)
                .ok_or(BudgetError::UnknownReservation(id))?;
            let step_key = (reservation.run_id, reservation.scope);

            ledger.monthly.unreserve(reservation.amount);
            if let Some(run) = ledger.runs.get_mut(&reservation.run_id) {
                run.unreserve(reservation.amount);
            }
            if let Some(step) = ledger.steps.get_mut(&step_key) {
                step.unreserve(reservation.amount);
            }

            let mut headroom = ledger.monthly.available();
            if let Some(run) = ledger.runs.get(&reservation.run_id) {
                headroom = headroom.min(run.available());
            }
            if let Some(step) = ledger.steps.get(&step_key) {
                headroom = headroom.min(step.available());
            }

            let charged = actual.min(headroom);
            ledger.monthly.spent += charged;
            if let Some(run) = ledger.runs.get_mut(&reservation.run_id) {
                run.spent += charged;
            }
            if let Some(step) = ledger.steps.get_mut(&step_key) {
                step.spent += charged;
            }

            let settlement = Settlement {
                charged,
                overrun: if actual - charged > EPSILON {
                    actual - charged
                } else {
                    0.0
                },
            };
            (settlement, self.check_warning(&mut ledger))
        };

        self.publish_status(status);

        if settlement.overrun > 0.0 {
            tracing::warn!(
                reservation = %id,
                actual,
                charged = settlement.charged,
                "actual cost overran budget"
            );
            return Err(BudgetError::Overrun {
                actual,
                charged: settlement.charged,
            });
        }
        Ok(settlement)
    }

    /// Release a reservation in full (the attempt failed).
    pub fn release(&self, id: ReservationId) -> Result<(), BudgetError> {
        let mut ledger = self.lock();
        let reservation = ledger
            .reservations
            .remove(&id)
            .ok_or(BudgetError::UnknownReservation(id))?;
        ledger.monthly.unreserve(reservation.amount);
        if let Some(run) = ledger.runs.get_mut(&reservation.run_id) {
            run.unreserve(reservation.amount);
        }
        if let Some(step) = ledger
            .steps
            .get_mut(&(reservation.run_id, reservation.scope))
        {
            step.unreserve(reservation.amount);
        }
        Ok(())
    }

    /// Spend against the monthly limit relative to the warning ratio.
    pub fn status(&self) -> BudgetStatus {
        let mut ledger = self.lock();
        self.roll_period(&mut ledger);
        let monthly = ledger.monthly;
        if monthly.spent + EPSILON >= monthly.limit {
            BudgetStatus::Exhausted
        } else if monthly.spent >= monthly.limit * self.config.warning_ratio {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut ledger = self.lock();
        self.roll_period(&mut ledger);
        let mut runs: Vec<(Uuid, AccountSnapshot)> = ledger
            .runs
            .iter()
            .map(|(id, account)| (*id, account.snapshot()))
            .collect();
        runs.sort_by_key(|(id, _)| *id);
        BudgetSnapshot {
            period: ledger.period.clone(),
            monthly: ledger.monthly.snapshot(),
            runs,
            outstanding_reservations: ledger.reservations.len(),
        }
    }

    /// Start a fresh monthly account when the month has rolled over.
    fn roll_period(&self, ledger: &mut Ledger) {
        let current = period_of((self.clock)());
        if current != ledger.period {
            tracing::info!(
                previous = %ledger.period,
                current = %current,
                spent = ledger.monthly.spent,
                "monthly budget period rolled over"
            );
            let reserved = ledger.monthly.reserved;
            ledger.monthly = Account::new(self.config.monthly_limit);
            ledger.monthly.reserved = reserved;
            ledger.period = current;
            ledger.warned = false;
        }
    }

    /// Returns `Warning` exactly once per period when spend crosses the
    /// warning ratio.
    fn check_warning(&self, ledger: &mut Ledger) -> Option<(BudgetStatus, String, f64, f64)> {
        let monthly = ledger.monthly;
        let threshold = monthly.limit * self.config.warning_ratio;
        if !ledger.warned && monthly.spent >= threshold && monthly.limit > 0.0 {
            ledger.warned = true;
            return Some((
                BudgetStatus::Warning,
                ledger.period.clone(),
                monthly.spent,
                monthly.limit,
            ));
        }
        None
    }

    fn publish_status(&self, status: Option<(BudgetStatus, String, f64, f64)>) {
        if let Some((BudgetStatus::Warning, period, spent, limit)) = status {
            tracing::warn!(period = %period, spent, limit, "monthly budget warning threshold crossed");
            self.events
                .publish(WorkflowEvent::BudgetWarning { period, spent, limit });
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        // A panic while holding the lock leaves plain numbers behind; keep
        // using them.
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn config(monthly: f64, run: f64, step: f64) -> BudgetConfig {
        BudgetConfig {
            monthly_limit: monthly,
            run_limit: run,
            step_limit: step,
            warning_ratio: 0.8,
        }
    }

    fn request(run_id: Uuid, step: &str, amount: f64) -> BudgetRequest {
        BudgetRequest {
            run_id,
            step: step.to_string(),
            scope: Uuid::now_v7(),
            amount,
            step_limit: None,
        }
    }

    #[test]
    fn test_reservations_summing_to_limit_succeed_then_reject() {
        let enforcer = BudgetEnforcer::new(config(100.0, 1.0, 1.0), EventBus::new(8));
        let run = Uuid::now_v7();
        enforcer.open_run(run, None);

        for i in 0..10 {
            enforcer
                .reserve(&request(run, &format!("s{i}"), 0.1))
                .unwrap();
        }
        let err = enforcer.reserve(&request(run, "extra", 0.01)).unwrap_err();
        assert!(matches!(
            err,
            BudgetError::Denied {
                level: BudgetLevel::Run,
                ..
            }
        ));
    }

    #[test]
    fn test_release_restores_exact_amount() {
        let enforcer = BudgetEnforcer::new(config(100.0, 10.0, 10.0), EventBus::new(8));
        let run = Uuid::now_v7();
        enforcer.open_run(run, None);

        let held = enforcer.reserve(&request(run, "a", 4.0)).unwrap();
        enforcer.reserve(&request(run, "b", 6.0)).unwrap();
        assert!(enforcer.reserve(&request(run, "c", 4.0)).is_err());

        enforcer.release(held).unwrap();
        enforcer.reserve(&request(run, "c", 4.0)).unwrap();
        assert!(enforcer.reserve(&request(run, "d", 0.001)).is_err());
    }

    #[test]
    fn test_denial_is_all_or_nothing() {
        let enforcer = BudgetEnforcer::new(config(100.0, 10.0, 2.0), EventBus::new(8));
        let run = Uuid::now_v7();
        enforcer.open_run(run, None);

        let err = enforcer.reserve(&request(run, "big", 3.0)).unwrap_err();
        assert!(matches!(
            err,
            BudgetError::Denied {
                level: BudgetLevel::Step,
                ..
            }
        ));
        let snapshot = enforcer.snapshot();
        assert_eq!(snapshot.monthly.reserved, 0.0);
        assert_eq!(snapshot.runs[0].1.reserved, 0.0);
        assert_eq!(snapshot.outstanding_reservations, 0);
    }

    #[test]
    fn test_reconcile_charges_actual_and_settles_once() {
        let enforcer = BudgetEnforcer::new(config(100.0, 10.0, 5.0), EventBus::new(8));
        let run = Uuid::now_v7();
        enforcer.open_run(run, None);

        let id = enforcer.reserve(&request(run, "gen", 2.0)).unwrap();
        let settlement = enforcer.reconcile(id, 1.25).unwrap();
        assert_eq!(settlement.charged, 1.25);
        assert_eq!(settlement.overrun, 0.0);

        assert_eq!(
            enforcer.reconcile(id, 1.0),
            Err(BudgetError::UnknownReservation(id))
        );
        assert_eq!(enforcer.release(id), Err(BudgetError::UnknownReservation(id)));

        let snapshot = enforcer.snapshot();
        assert_eq!(snapshot.monthly.spent, 1.25);
        assert_eq!(snapshot.monthly.reserved, 0.0);
    }

    #[test]
    fn test_overrun_is_capped_at_step_ceiling() {
        let enforcer = BudgetEnforcer::new(config(100.0, 10.0, 3.0), EventBus::new(8));
        let run = Uuid::now_v7();
        enforcer.open_run(run, None);

        let id = enforcer.reserve(&request(run, "gen", 2.0)).unwrap();
        let err = enforcer.reconcile(id, 4.5).unwrap_err();
        assert_eq!(
            err,
            BudgetError::Overrun {
                actual: 4.5,
                charged: 3.0
            }
        );
        let snapshot = enforcer.snapshot();
        assert_eq!(snapshot.runs[0].1.spent, 3.0);
        assert!(snapshot.monthly.spent <= snapshot.monthly.limit);
    }

    #[test]
    fn test_step_ceiling_spans_attempts_of_one_execution() {
        let enforcer = BudgetEnforcer::new(config(100.0, 10.0, 3.0), EventBus::new(8));
        let run = Uuid::now_v7();
        enforcer.open_run(run, None);

        let attempt = request(run, "gen", 2.0);
        let first = enforcer.reserve(&attempt).unwrap();
        enforcer.reconcile(first, 2.0).unwrap();
        assert!(enforcer.reserve(&attempt).is_err());
        assert!(enforcer.reserve(&request(run, "other", 2.0)).is_ok());
    }

    #[test]
    fn test_each_execution_gets_a_fresh_step_ceiling() {
        let enforcer = BudgetEnforcer::new(config(100.0, 10.0, 1.0), EventBus::new(8));
        let run = Uuid::now_v7();
        enforcer.open_run(run, None);

        for _ in 0..5 {
            let attempt = request(run, "body", 0.4);
            let id = enforcer.reserve(&attempt).unwrap();
            enforcer.reconcile(id, 0.4).unwrap();
            enforcer.close_scope(run, attempt.scope);
        }
        let snapshot = enforcer.snapshot();
        assert!((snapshot.runs[0].1.spent - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_close_scope_releases_held_reservations() {
        let enforcer = BudgetEnforcer::new(config(10.0, 10.0, 10.0), EventBus::new(8));
        let run = Uuid::now_v7();
        enforcer.open_run(run, None);
        let attempt = request(run, "gen", 3.0);
        enforcer.reserve(&attempt).unwrap();

        enforcer.close_scope(run, attempt.scope);
        let snapshot = enforcer.snapshot();
        assert_eq!(snapshot.monthly.reserved, 0.0);
        assert_eq!(snapshot.runs[0].1.reserved, 0.0);
        assert_eq!(snapshot.outstanding_reservations, 0);
    }

    #[test]
    fn test_unknown_run_is_rejected() {
        let enforcer = BudgetEnforcer::new(BudgetConfig::default(), EventBus::new(8));
        let run = Uuid::now_v7();
        assert_eq!(
            enforcer.reserve(&request(run, "a", 1.0)),
            Err(BudgetError::UnknownRun(run))
        );
    }

    #[test]
    fn test_close_run_releases_dangling_reservations() {
        let enforcer = BudgetEnforcer::new(config(10.0, 10.0, 10.0), EventBus::new(8));
        let run = Uuid::now_v7();
        enforcer.open_run(run, None);
        enforcer.reserve(&request(run, "a", 4.0)).unwrap();

        let closed = enforcer.close_run(run).unwrap();
        assert_eq!(closed.reserved, 4.0);
        let snapshot = enforcer.snapshot();
        assert_eq!(snapshot.monthly.reserved, 0.0);
        assert!(snapshot.runs.is_empty());
    }

    #[tokio::test]
    async fn test_warning_fires_once_per_period_and_resets_on_rollover() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let now = Arc::new(AtomicI64::new(
            Utc.with_ymd_and_hms(2026, 3, 30, 12, 0, 0)
                .unwrap()
                .timestamp(),
        ));
        let clock_now = Arc::clone(&now);
        let clock: Clock = Arc::new(move || {
            DateTime::from_timestamp(clock_now.load(Ordering::SeqCst), 0).unwrap_or_default()
        });
        let enforcer = BudgetEnforcer::with_clock(config(10.0, 10.0, 10.0), bus, clock);

        let run = Uuid::now_v7();
        enforcer.open_run(run, Some(10.0));
        let a = enforcer.reserve(&request(run, "a", 8.0)).unwrap();
        enforcer.reconcile(a, 8.0).unwrap();
        let b = enforcer.reserve(&request(run, "b", 1.0)).unwrap();
        enforcer.reconcile(b, 1.0).unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, WorkflowEvent::BudgetWarning { ref period, .. } if period == "2026-03"));
        assert!(rx.try_recv().is_err(), "warning must fire once");
        assert_eq!(enforcer.status(), BudgetStatus::Warning);

        now.store(
            Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 1)
                .unwrap()
                .timestamp(),
            Ordering::SeqCst,
        );
        let snapshot = enforcer.snapshot();
        assert_eq!(snapshot.period, "2026-04");
        assert_eq!(snapshot.monthly.spent, 0.0);
        assert_eq!(enforcer.status(), BudgetStatus::Ok);
    }

    #[test]
    fn test_concurrent_reservations_never_overcommit() {
        let enforcer = Arc::new(BudgetEnforcer::new(
            config(5.0, 100.0, 100.0),
            EventBus::new(8),
        ));
        let runs: Vec<Uuid> = (0..4).map(|_| Uuid::now_v7()).collect();
        for run in &runs {
            enforcer.open_run(*run, None);
        }

        let handles: Vec<_> = runs
            .iter()
            .map(|run| {
                let enforcer = Arc::clone(&enforcer);
                let run = *run;
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|i| enforcer.reserve(&request(run, &format!("s{i}"), 0.5)).is_ok())
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 10);
        assert!(enforcer.snapshot().monthly.reserved <= 5.0 + EPSILON);
    }
}
