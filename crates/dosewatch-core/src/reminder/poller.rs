//! Background poller that turns due routines into reminders.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use super::{Reminder, ReminderSink};
use crate::clock::Clock;
use crate::error::Result;
use crate::routine::ScheduleRules;
use crate::storage::RoutineStore;

/// What one poll did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub candidates: usize,
    pub sent: Vec<Reminder>,
    /// Delivered, but the routine changed before it could be marked.
    pub superseded: usize,
    pub failed: usize,
}

pub struct NotificationPoller {
    store: Arc<dyn RoutineStore>,
    sink: Arc<dyn ReminderSink>,
    clock: Arc<dyn Clock>,
    rules: ScheduleRules,
    interval: Duration,
    tick_timeout: Duration,
    in_flight: Arc<AtomicBool>,
}

impl NotificationPoller {
    pub fn new(
        store: Arc<dyn RoutineStore>,
        sink: Arc<dyn ReminderSink>,
        clock: Arc<dyn Clock>,
        rules: ScheduleRules,
    ) -> Self {
        Self {
            store,
            sink,
            clock,
            rules,
            interval: Duration::from_secs(10),
            tick_timeout: Duration::from_secs(5),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout = timeout;
        self
    }

    /// Run one poll: remind on every routine due within the lead time that
    /// has not been reminded for its current due time.
    ///
    /// A routine is marked notified only after its reminder was delivered,
    /// and only if it has not changed since it was read. Failures for one
    /// routine do not stop the others.
    pub fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let candidates = self
            .store
            .list_reminder_candidates(now + self.rules.reminder_lead)?;

        let mut report = TickReport {
            candidates: candidates.len(),
            ..TickReport::default()
        };

        for routine in candidates {
            if !routine.needs_reminder(now, &self.rules) {
                continue;
            }
            let reminder = Reminder::for_routine(&routine, now);
            if let Err(e) = self.sink.deliver(&reminder) {
                tracing::warn!(routine_id = %routine.id, error = %e, "reminder delivery failed");
                report.failed += 1;
                continue;
            }
            match self.store.mark_notified(&routine.id, routine.revision, now) {
                Ok(true) => report.sent.push(reminder),
                Ok(false) => {
                    tracing::debug!(routine_id = %routine.id, "routine changed while reminding");
                    report.superseded += 1;
                }
                Err(e) => {
                    tracing::warn!(routine_id = %routine.id, error = %e, "failed to mark routine notified");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Each tick runs on the blocking pool under a timeout. A tick that
    /// errors or times out is logged and the loop carries on; a new tick
    /// is not started while a timed-out one is still running.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            lead_minutes = self.rules.reminder_lead.num_minutes(),
            "reminder poller started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("reminder poller stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run_tick(self: &Arc<Self>) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            tracing::debug!("previous reminder tick still running, skipping");
            return;
        }

        let poller = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || {
            let result = poller.tick();
            poller.in_flight.store(false, Ordering::Release);
            result
        });

        match tokio::time::timeout(self.tick_timeout, task).await {
            Ok(Ok(Ok(report))) => {
                if !report.sent.is_empty() || report.failed > 0 {
                    tracing::info!(
                        sent = report.sent.len(),
                        failed = report.failed,
                        superseded = report.superseded,
                        "reminder tick finished"
                    );
                }
            }
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "reminder tick failed"),
            Ok(Err(e)) => {
                self.in_flight.store(false, Ordering::Release);
                tracing::error!(error = %e, "reminder tick panicked");
            }
            Err(_) => tracing::warn!(
                timeout_ms = self.tick_timeout.as_millis() as u64,
                "reminder tick timed out"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::ScheduleEngine;
    use crate::error::{CoreError, DatabaseError};
    use crate::reminder::MemorySink;
    use crate::routine::{DoseEvent, Routine};
    use crate::storage::Database;
    use crate::test_support::{sample_spec, t0};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        db: Arc<Database>,
        clock: Arc<ManualClock>,
        sink: Arc<MemorySink>,
        engine: ScheduleEngine,
        poller: NotificationPoller,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0() - chrono::Duration::hours(1)));
        let sink = Arc::new(MemorySink::new());
        let rules = ScheduleRules::default();
        let engine = ScheduleEngine::new(db.clone(), clock.clone(), rules);
        let poller = NotificationPoller::new(db.clone(), sink.clone(), clock.clone(), rules);
        Fixture {
            db,
            clock,
            sink,
            engine,
            poller,
        }
    }

    #[test]
    fn reminds_once_within_lead_time() {
        let f = fixture();
        let routine = f.engine.create_routine("u1", sample_spec()).unwrap();

        f.clock.set(t0() - chrono::Duration::minutes(11));
        assert!(f.poller.tick().unwrap().sent.is_empty());

        f.clock.set(t0() - chrono::Duration::minutes(5));
        let report = f.poller.tick().unwrap();
        assert_eq!(report.sent.len(), 1);
        assert_eq!(report.sent[0].routine_id, routine.id);
        assert_eq!(report.sent[0].timing(), "due in ~5 minutes");
        assert!(f.db.get_routine(&routine.id).unwrap().unwrap().notified);

        f.clock.advance(chrono::Duration::seconds(1));
        assert!(f.poller.tick().unwrap().sent.is_empty());
        assert_eq!(f.sink.reminders().len(), 1);
    }

    #[test]
    fn exactly_one_reminder_per_due_time() {
        let f = fixture();
        let routine = f.engine.create_routine("u1", sample_spec()).unwrap();

        f.clock.set(t0() - chrono::Duration::minutes(30));
        for _ in 0..60 {
            f.poller.tick().unwrap();
            f.clock.advance(chrono::Duration::minutes(1));
        }
        assert_eq!(f.sink.take().len(), 1);

        // Taking the dose re-arms the reminder for the next due time.
        let (after, _) = f.engine.take_dose(&routine.id, f.clock.now()).unwrap();
        assert!(!after.notified);
        f.poller.tick().unwrap();
        assert!(f.sink.reminders().is_empty());

        f.clock
            .set(after.next_dose_time - chrono::Duration::minutes(2));
        f.poller.tick().unwrap();
        let sent = f.sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].due_at, after.next_dose_time);
    }

    #[test]
    fn overdue_routine_is_reminded_as_due_now() {
        let f = fixture();
        f.engine.create_routine("u1", sample_spec()).unwrap();

        f.clock.set(t0() + chrono::Duration::hours(2));
        let report = f.poller.tick().unwrap();
        assert_eq!(report.sent.len(), 1);
        assert_eq!(report.sent[0].timing(), "due now");
    }

    #[test]
    fn edit_re_arms_reminder() {
        let f = fixture();
        let routine = f.engine.create_routine("u1", sample_spec()).unwrap();
        f.clock.set(t0() - chrono::Duration::minutes(1));
        f.poller.tick().unwrap();
        assert!(f.db.get_routine(&routine.id).unwrap().unwrap().notified);

        let mut spec = sample_spec();
        spec.first_dose_time = t0() + chrono::Duration::minutes(5);
        f.engine.edit_routine(&routine.id, spec).unwrap();

        f.poller.tick().unwrap();
        assert_eq!(f.sink.take().len(), 2);
    }

    /// Sink that reschedules the routine the first time it delivers,
    /// as if the user edited it while the reminder was going out.
    struct ReschedulingSink {
        engine: ScheduleEngine,
        first_dose_time: DateTime<Utc>,
        rescheduled: AtomicBool,
        inner: MemorySink,
    }

    impl ReminderSink for ReschedulingSink {
        fn deliver(&self, reminder: &Reminder) -> Result<()> {
            if !self.rescheduled.swap(true, Ordering::SeqCst) {
                let mut spec = sample_spec();
                spec.first_dose_time = self.first_dose_time;
                self.engine.edit_routine(&reminder.routine_id, spec)?;
            }
            self.inner.deliver(reminder)
        }
    }

    #[test]
    fn routine_edited_during_delivery_is_not_marked() {
        let db = Arc::new(Database::open_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0() - chrono::Duration::minutes(5)));
        let rules = ScheduleRules::default();
        let engine = ScheduleEngine::new(db.clone(), clock.clone(), rules);
        let routine = engine.create_routine("u1", sample_spec()).unwrap();
        let moved_to = t0() + chrono::Duration::minutes(30);
        let sink = Arc::new(ReschedulingSink {
            engine: ScheduleEngine::new(db.clone(), clock.clone(), rules),
            first_dose_time: moved_to,
            rescheduled: AtomicBool::new(false),
            inner: MemorySink::new(),
        });
        let poller = NotificationPoller::new(db.clone(), sink.clone(), clock.clone(), rules);

        let first = poller.tick().unwrap();
        assert_eq!(first.superseded, 1);
        assert!(first.sent.is_empty());
        assert_eq!(first.failed, 0);
        let stored = db.get_routine(&routine.id).unwrap().unwrap();
        assert!(!stored.notified);
        assert_eq!(stored.next_dose_time, moved_to);

        clock.set(moved_to - chrono::Duration::minutes(3));
        let second = poller.tick().unwrap();
        assert_eq!(second.sent.len(), 1);
        assert_eq!(second.sent[0].due_at, moved_to);
        assert!(db.get_routine(&routine.id).unwrap().unwrap().notified);
        assert_eq!(sink.inner.reminders().len(), 2);
    }

    struct FailingSink {
        failures_left: AtomicUsize,
        inner: MemorySink,
    }

    impl ReminderSink for FailingSink {
        fn deliver(&self, reminder: &Reminder) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CoreError::Custom("sink offline".into()));
            }
            self.inner.deliver(reminder)
        }
    }

    #[test]
    fn failed_delivery_is_retried_next_tick() {
        let db = Arc::new(Database::open_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0() - chrono::Duration::minutes(3)));
        let rules = ScheduleRules::default();
        let engine = ScheduleEngine::new(db.clone(), clock.clone(), rules);
        let routine = engine.create_routine("u1", sample_spec()).unwrap();
        let sink = Arc::new(FailingSink {
            failures_left: AtomicUsize::new(1),
            inner: MemorySink::new(),
        });
        let poller = NotificationPoller::new(db.clone(), sink.clone(), clock, rules);

        let first = poller.tick().unwrap();
        assert_eq!(first.failed, 1);
        assert!(!db.get_routine(&routine.id).unwrap().unwrap().notified);

        let second = poller.tick().unwrap();
        assert_eq!(second.sent.len(), 1);
        assert_eq!(sink.inner.reminders().len(), 1);
    }

    /// Store whose candidate query always fails.
    struct BrokenStore;

    impl RoutineStore for BrokenStore {
        fn insert_routine(&self, _: &Routine) -> Result<(), DatabaseError> {
            Err(DatabaseError::Locked)
        }
        fn get_routine(&self, _: &str) -> Result<Option<Routine>, DatabaseError> {
            Err(DatabaseError::Locked)
        }
        fn list_routines(&self, _: &str) -> Result<Vec<Routine>, DatabaseError> {
            Err(DatabaseError::Locked)
        }
        fn list_reminder_candidates(&self, _: DateTime<Utc>) -> Result<Vec<Routine>, DatabaseError> {
            Err(DatabaseError::QueryFailed("disk I/O error".into()))
        }
        fn replace_routine(&self, _: &Routine) -> Result<bool, DatabaseError> {
            Err(DatabaseError::Locked)
        }
        fn record_dose(&self, _: &Routine, _: &DoseEvent) -> Result<bool, DatabaseError> {
            Err(DatabaseError::Locked)
        }
        fn mark_notified(&self, _: &str, _: u64, _: DateTime<Utc>) -> Result<bool, DatabaseError> {
            Err(DatabaseError::Locked)
        }
        fn delete_routine(&self, _: &str) -> Result<bool, DatabaseError> {
            Err(DatabaseError::Locked)
        }
        fn list_doses(&self, _: &str) -> Result<Vec<DoseEvent>, DatabaseError> {
            Err(DatabaseError::Locked)
        }
    }

    #[test]
    fn store_failure_surfaces_from_tick() {
        let poller = NotificationPoller::new(
            Arc::new(BrokenStore),
            Arc::new(MemorySink::new()),
            Arc::new(ManualClock::new(t0())),
            ScheduleRules::default(),
        );
        assert!(matches!(poller.tick(), Err(CoreError::Database(_))));
    }

    #[tokio::test]
    async fn run_survives_failing_ticks_and_stops_on_shutdown() {
        let poller = Arc::new(
            NotificationPoller::new(
                Arc::new(BrokenStore),
                Arc::new(MemorySink::new()),
                Arc::new(ManualClock::new(t0())),
                ScheduleRules::default(),
            )
            .with_interval(Duration::from_millis(10)),
        );
        let (tx, rx) = watch::channel(false);
        let handle = poller.spawn(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn run_delivers_reminders() {
        let f = fixture();
        f.engine.create_routine("u1", sample_spec()).unwrap();
        f.clock.set(t0() - chrono::Duration::minutes(4));

        let poller = Arc::new(f.poller.with_interval(Duration::from_millis(10)));
        let (tx, rx) = watch::channel(false);
        let handle = poller.spawn(rx);

        let mut waited = 0;
        while f.sink.reminders().is_empty() && waited < 200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        drop(tx);
        handle.await.unwrap();

        let sent = f.sink.reminders();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].minutes_until_due, 4);
    }
}
