//! Single-flight watering sessions.
//!
//! ```text
//! Idle ──start──▶ Running ──duration elapsed──▶ Idle (completed)
//!                   │  └────pump/io failure───▶ Idle (failed)
//!                   └─cancel─▶ Cancelling ──cleanup──▶ Idle (cancelled)
//! ```
//!
//! Every transition happens under one lock, so concurrent `start` calls from
//! the policy, the button and the API resolve to exactly one winner.  The
//! timed run lives in its own task; cancellation reaches it through a oneshot
//! channel and interrupts the sleep immediately.  Each successful `start`
//! produces exactly one record, which leaves `running` exactly once.

use anyhow::Context;
use irrigation_hw::HardwareAccess;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::IrrigationError;
use crate::model::{now_unix, IrrigationKind, IrrigationRecord, IrrigationStatus};
use crate::notify::NotificationSink;
use crate::state::SharedState;
use crate::store::PersistenceStore;

/// Attempts at writing the final record before giving up.
const RECORD_WRITE_ATTEMPTS: u32 = 3;
const RECORD_RETRY_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct WateringConfig {
    pub flow_rate_lpm: f64,
    /// Wait after the pump stops before the post-humidity snapshot.
    pub settle: Duration,
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WateringState {
    Idle,
    Running,
    Cancelling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    MoistureAboveMax,
    PowerUnsafe,
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requested => "requested",
            Self::MoistureAboveMax => "moisture above max threshold",
            Self::PowerUnsafe => "battery low",
            Self::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// A session exists but is already winding down.
    AlreadyStopping,
    NothingToCancel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WateringStatus {
    pub state: WateringState,
    pub is_watering: bool,
    pub sensor_id: Option<String>,
    pub kind: Option<IrrigationKind>,
    /// Unix seconds.
    pub started_at: Option<i64>,
    pub duration_secs: Option<u64>,
}

impl WateringStatus {
    pub fn idle() -> Self {
        Self {
            state: WateringState::Idle,
            is_watering: false,
            sensor_id: None,
            kind: None,
            started_at: None,
            duration_secs: None,
        }
    }
}

/// Handle to a session task.  Dropping it detaches the session; only tests
/// wait on it.
#[cfg_attr(not(test), allow(dead_code))]
pub struct SessionHandle {
    task: JoinHandle<IrrigationRecord>,
}

#[cfg_attr(not(test), allow(dead_code))]
impl SessionHandle {
    /// Waits for the session to finish and returns its final record.
    pub async fn wait(self) -> anyhow::Result<IrrigationRecord> {
        self.task.await.context("watering session task failed")
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Active {
    generation: u64,
    sensor_id: String,
    kind: IrrigationKind,
    duration: Duration,
    started_at: i64,
    cancel: Option<oneshot::Sender<CancelReason>>,
    /// Pump already stopped after a full run; only bookkeeping remains.
    finishing: bool,
}

enum Session {
    Idle,
    Running(Active),
    Cancelling(Active),
}

struct Inner {
    session: Session,
    power_enabled: bool,
    next_generation: u64,
}

enum Ending {
    Elapsed,
    Cancelled(CancelReason),
    Failed(IrrigationError),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct WateringController {
    hw: Arc<dyn HardwareAccess>,
    store: Arc<dyn PersistenceStore>,
    notifier: Arc<dyn NotificationSink>,
    shared: SharedState,
    cfg: WateringConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<WateringState>,
}

impl WateringController {
    pub fn new(
        hw: Arc<dyn HardwareAccess>,
        store: Arc<dyn PersistenceStore>,
        notifier: Arc<dyn NotificationSink>,
        shared: SharedState,
        cfg: WateringConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(WateringState::Idle);
        Arc::new(Self {
            hw,
            store,
            notifier,
            shared,
            cfg,
            inner: Mutex::new(Inner {
                session: Session::Idle,
                power_enabled: true,
                next_generation: 0,
            }),
            state_tx,
        })
    }

    /// Current state without taking the session lock.
    pub fn state(&self) -> WateringState {
        *self.state_tx.borrow()
    }

    pub fn is_watering(&self) -> bool {
        self.state() != WateringState::Idle
    }

    pub async fn status(&self) -> WateringStatus {
        let inner = self.inner.lock().await;
        let (state, active) = match &inner.session {
            Session::Idle => return WateringStatus::idle(),
            Session::Running(a) => (WateringState::Running, a),
            Session::Cancelling(a) => (WateringState::Cancelling, a),
        };
        WateringStatus {
            state,
            is_watering: true,
            sensor_id: Some(active.sensor_id.clone()),
            kind: Some(active.kind),
            started_at: Some(active.started_at),
            duration_secs: Some(active.duration.as_secs()),
        }
    }

    /// Claim the single session slot and spawn the timed run.
    pub async fn start(
        self: &Arc<Self>,
        sensor_id: &str,
        duration: Duration,
        kind: IrrigationKind,
    ) -> Result<SessionHandle, IrrigationError> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let generation = {
            let mut inner = self.inner.lock().await;
            if !matches!(inner.session, Session::Idle) {
                return Err(IrrigationError::AlreadyWatering);
            }
            if !inner.power_enabled {
                return Err(IrrigationError::PowerUnsafe);
            }
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.session = Session::Running(Active {
                generation,
                sensor_id: sensor_id.to_string(),
                kind,
                duration,
                started_at: now_unix(),
                cancel: Some(cancel_tx),
                finishing: false,
            });
            self.state_tx.send_replace(WateringState::Running);
            generation
        };

        info!(sensor = %sensor_id, %kind, duration_secs = duration.as_secs(), "watering started");
        self.shared
            .write()
            .await
            .record_watering(format!("{kind} watering started on {sensor_id} for {}s", duration.as_secs()));

        let this = Arc::clone(self);
        let sensor_id = sensor_id.to_string();
        let task = tokio::spawn(async move {
            this.run_session(generation, sensor_id, duration, kind, cancel_rx)
                .await
        });
        Ok(SessionHandle { task })
    }

    /// Stop the running session.  The pump is switched off before this
    /// returns; the record is finalized by the session task.
    pub async fn cancel(&self, reason: CancelReason) -> CancelOutcome {
        self.cancel_matching(None, reason).await
    }

    /// Like [`cancel`](Self::cancel), but only when the session in progress
    /// is of `kind`.  The kind is checked under the session lock, so a
    /// session that replaced the one the caller looked at is left running.
    pub async fn cancel_kind(&self, kind: IrrigationKind, reason: CancelReason) -> CancelOutcome {
        self.cancel_matching(Some(kind), reason).await
    }

    async fn cancel_matching(&self, kind: Option<IrrigationKind>, reason: CancelReason) -> CancelOutcome {
        let outcome = {
            let mut inner = self.inner.lock().await;
            let other_kind = match (&inner.session, kind) {
                (Session::Running(a) | Session::Cancelling(a), Some(k)) => a.kind != k,
                _ => false,
            };
            if other_kind {
                CancelOutcome::NothingToCancel
            } else {
                self.cancel_locked(&mut inner, reason)
            }
        };
        if outcome == CancelOutcome::Cancelled {
            self.shared
                .write()
                .await
                .record_watering(format!("watering cancelled: {reason}"));
        }
        outcome
    }

    /// Power interlock.  Disabling cancels any session under the same lock
    /// that `start` takes, so no start can slip in between.
    pub async fn set_power_enabled(&self, enabled: bool) -> CancelOutcome {
        let mut inner = self.inner.lock().await;
        if inner.power_enabled != enabled {
            info!(enabled, "watering power interlock changed");
        }
        inner.power_enabled = enabled;
        if enabled {
            return CancelOutcome::NothingToCancel;
        }
        let outcome = self.cancel_locked(&mut inner, CancelReason::PowerUnsafe);
        if outcome == CancelOutcome::Cancelled {
            warn!("watering force-stopped by power interlock");
        }
        outcome
    }

    /// Resolves once no session is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.state_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|s| *s == WateringState::Idle).await;
    }

    /// Cancel whatever is running, wait for it to be recorded and leave the
    /// pump off.
    pub async fn shutdown(&self) {
        self.cancel(CancelReason::Shutdown).await;
        self.wait_idle().await;
        if let Err(e) = self.hw.set_pump(false) {
            error!(error = %e, "pump off at shutdown failed");
        }
    }

    fn cancel_locked(&self, inner: &mut Inner, reason: CancelReason) -> CancelOutcome {
        match &mut inner.session {
            Session::Idle => return CancelOutcome::NothingToCancel,
            Session::Cancelling(_) => return CancelOutcome::AlreadyStopping,
            Session::Running(a) if a.finishing => return CancelOutcome::AlreadyStopping,
            Session::Running(a) => {
                if let Err(e) = self.hw.set_pump(false) {
                    error!(sensor = %a.sensor_id, error = %e, "pump off on cancel failed");
                }
                if let Some(tx) = a.cancel.take() {
                    let _ = tx.send(reason);
                }
                info!(sensor = %a.sensor_id, %reason, "watering cancelling");
            }
        }
        if let Session::Running(a) = std::mem::replace(&mut inner.session, Session::Idle) {
            inner.session = Session::Cancelling(a);
        }
        self.state_tx.send_replace(WateringState::Cancelling);
        CancelOutcome::Cancelled
    }

    // -----------------------------------------------------------------------
    // Session task
    // -----------------------------------------------------------------------

    async fn run_session(
        self: Arc<Self>,
        generation: u64,
        sensor_id: String,
        duration: Duration,
        kind: IrrigationKind,
        mut cancel_rx: oneshot::Receiver<CancelReason>,
    ) -> IrrigationRecord {
        let before = self.humidity_snapshot(&sensor_id).await;
        let mut record = IrrigationRecord::open(&sensor_id, now_unix(), kind, before);
        record.id = match self.store.save_record(&record).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(sensor = %sensor_id, error = %e, "tentative record not saved, inserting on finish");
                None
            }
        };

        let pumped_since = Instant::now();
        let ending = self.water(generation, duration, &mut cancel_rx).await;

        // Whatever happened, the pump must end up off.  Cancel already tried
        // once; trying again is harmless.
        let pump_off = self.pump_off_with_retry();

        let ran = pumped_since.elapsed();
        match (ending, pump_off) {
            (Ending::Elapsed, Ok(())) => {
                tokio::time::sleep(self.cfg.settle).await;
                record.duration_secs = whole_secs(duration);
                record.water_volume_l = self.volume(duration);
                record.humidity_after = self.humidity_snapshot(&sensor_id).await;
                record.status = IrrigationStatus::Completed;
                record.note = Some(format!("{kind} irrigation completed"));
            }
            (Ending::Cancelled(reason), Ok(())) => {
                record.status = IrrigationStatus::Cancelled;
                record.note = Some(format!("cancelled: {reason}"));
            }
            (Ending::Failed(detail), _) | (_, Err(detail)) => {
                record.duration_secs = whole_secs(ran);
                record.water_volume_l = self.volume(ran);
                record.status = IrrigationStatus::Failed;
                record.note = Some(format!("error: {detail}"));
            }
        }

        self.persist_final(&mut record).await;

        if record.status == IrrigationStatus::Completed {
            self.notifier
                .notify_irrigation_completed(&sensor_id, record.duration_secs, record.humidity_before, record.humidity_after)
                .await;
        }

        info!(
            sensor = %sensor_id,
            status = %record.status,
            duration_secs = record.duration_secs,
            volume_l = record.water_volume_l,
            "watering finished"
        );
        self.shared.write().await.record_watering(format!(
            "{kind} watering on {sensor_id} {}: {}s, {:.2} L",
            record.status, record.duration_secs, record.water_volume_l
        ));

        self.release(generation).await;
        record
    }

    /// Pump on, then wait for the duration or a cancel.
    async fn water(
        &self,
        generation: u64,
        duration: Duration,
        cancel_rx: &mut oneshot::Receiver<CancelReason>,
    ) -> Ending {
        let pump_on = {
            let inner = self.inner.lock().await;
            match &inner.session {
                Session::Running(a) if a.generation == generation => Some(self.hw.set_pump(true)),
                _ => None,
            }
        };
        match pump_on {
            // Cancelled before the pump ever started.
            None => return Ending::Cancelled(cancel_rx.await.unwrap_or(CancelReason::Requested)),
            Some(Err(source)) => return Ending::Failed(IrrigationError::Pump { stage: "on", source }),
            Some(Ok(())) => {}
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            reason = &mut *cancel_rx => {
                return Ending::Cancelled(reason.unwrap_or(CancelReason::Requested));
            }
        }

        // The timer fired; a cancel may still have won the lock first.
        let mut inner = self.inner.lock().await;
        match &mut inner.session {
            Session::Running(a) if a.generation == generation => {
                a.cancel = None;
                a.finishing = true;
                Ending::Elapsed
            }
            _ => Ending::Cancelled(cancel_rx.try_recv().unwrap_or(CancelReason::Requested)),
        }
    }

    fn pump_off_with_retry(&self) -> Result<(), IrrigationError> {
        match self.hw.set_pump(false) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "pump off failed, retrying");
                self.hw
                    .set_pump(false)
                    .map_err(|source| IrrigationError::Pump { stage: "off", source })
            }
        }
    }

    fn volume(&self, ran: Duration) -> f64 {
        ran.as_secs_f64() / 60.0 * self.cfg.flow_rate_lpm
    }

    async fn humidity_snapshot(&self, sensor_id: &str) -> Option<f64> {
        match self.store.query_latest_reading(sensor_id).await {
            Ok(r) => r.map(|r| r.value),
            Err(e) => {
                warn!(sensor = %sensor_id, error = %e, "humidity snapshot failed");
                None
            }
        }
    }

    /// Write the terminal record, retrying with backoff.  A failure here is
    /// logged and surfaced in the event log; it never blocks the release.
    async fn persist_final(&self, record: &mut IrrigationRecord) {
        debug_assert!(record.status.is_terminal());
        let mut last_err = None;
        for attempt in 0..RECORD_WRITE_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RECORD_RETRY_BASE * attempt).await;
            }
            let result = match record.id {
                Some(id) => self.store.update_record(id, &record.finalization()).await,
                None => self.store.save_record(record).await.map(|id| record.id = Some(id)),
            };
            match result {
                Ok(()) => return,
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(e) = last_err {
            error!(sensor = %record.sensor_id, error = %e, "irrigation record not persisted");
            self.shared
                .write()
                .await
                .record_error(format!("irrigation record for {} not persisted: {e:#}", record.sensor_id));
        }
    }

    async fn release(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        let ours = match &inner.session {
            Session::Running(a) | Session::Cancelling(a) => a.generation == generation,
            Session::Idle => false,
        };
        if ours {
            inner.session = Session::Idle;
            self.state_tx.send_replace(WateringState::Idle);
        }
    }
}

fn whole_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state;
    use crate::testutil::{FakeHardware, MemoryStore, Notice, RecordingNotifier};

    const SENSOR: &str = "soil-1";

    struct Rig {
        hw: Arc<FakeHardware>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        ctl: Arc<WateringController>,
    }

    fn rig() -> Rig {
        let hw = Arc::new(FakeHardware::default());
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctl = WateringController::new(
            hw.clone(),
            store.clone(),
            notifier.clone(),
            state::shared(),
            WateringConfig {
                flow_rate_lpm: 2.0,
                settle: Duration::from_secs(5),
            },
        );
        Rig {
            hw,
            store,
            notifier,
            ctl,
        }
    }

    /// Let spawned session tasks run up to their next timer.
    async fn settle_tasks() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completed_session_records_volume_and_snapshots() {
        let r = rig();
        r.store.push_reading(SENSOR, 20.0);

        let handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(30), IrrigationKind::Automatic)
            .await
            .unwrap();
        assert_eq!(r.ctl.state(), WateringState::Running);

        let rec = handle.wait().await.unwrap();
        assert_eq!(rec.status, IrrigationStatus::Completed);
        assert_eq!(rec.duration_secs, 30);
        assert_eq!(rec.water_volume_l, 1.0);
        assert_eq!(rec.humidity_before, Some(20.0));
        assert_eq!(rec.humidity_after, Some(20.0));
        assert_eq!(rec.note.as_deref(), Some("automatic irrigation completed"));

        assert_eq!(r.store.records(), vec![rec]);
        assert_eq!(r.hw.pump_switches(), vec![true, false]);
        assert_eq!(r.ctl.state(), WateringState::Idle);
        assert_eq!(
            r.notifier.notices(),
            vec![Notice::Completed {
                sensor_id: SENSOR.into(),
                duration_secs: 30,
                before: Some(20.0),
                after: Some(20.0)
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn session_lasts_the_configured_duration() {
        let r = rig();
        let started = Instant::now();
        let handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(30), IrrigationKind::Manual)
            .await
            .unwrap();
        handle.wait().await.unwrap();
        // 30 s of watering plus the 5 s settle delay.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(35) && elapsed < Duration::from_secs(36), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_have_exactly_one_winner() {
        let r = rig();
        let d = Duration::from_secs(30);
        let (a, b, c) = tokio::join!(
            r.ctl.start(SENSOR, d, IrrigationKind::Automatic),
            r.ctl.start(SENSOR, d, IrrigationKind::Manual),
            r.ctl.start(SENSOR, d, IrrigationKind::Manual),
        );
        let results = [a, b, c];
        let wins = results.iter().filter(|res| res.is_ok()).count();
        let busy = results
            .iter()
            .filter(|res| matches!(res, Err(IrrigationError::AlreadyWatering)))
            .count();
        assert_eq!((wins, busy), (1, 2));

        r.ctl.wait_idle().await;
        assert_eq!(r.store.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_when_idle_is_a_no_op() {
        let r = rig();
        assert_eq!(r.ctl.cancel(CancelReason::Requested).await, CancelOutcome::NothingToCancel);
        assert!(r.store.records().is_empty());
        assert!(r.hw.pump_switches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn kind_filtered_cancel_leaves_other_kinds_running() {
        let r = rig();
        let handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(600), IrrigationKind::Manual)
            .await
            .unwrap();
        settle_tasks().await;

        let outcome = r
            .ctl
            .cancel_kind(IrrigationKind::Automatic, CancelReason::MoistureAboveMax)
            .await;
        assert_eq!(outcome, CancelOutcome::NothingToCancel);
        assert!(r.hw.pump_on());
        assert_eq!(r.ctl.state(), WateringState::Running);

        let outcome = r.ctl.cancel_kind(IrrigationKind::Manual, CancelReason::Requested).await;
        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert_eq!(handle.wait().await.unwrap().status, IrrigationStatus::Cancelled);
        assert_eq!(
            r.ctl.cancel_kind(IrrigationKind::Manual, CancelReason::Requested).await,
            CancelOutcome::NothingToCancel
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pump_immediately_and_records_cancelled() {
        let r = rig();
        r.store.push_reading(SENSOR, 85.0);
        let handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(600), IrrigationKind::Automatic)
            .await
            .unwrap();
        settle_tasks().await;
        assert!(r.hw.pump_on());

        let outcome = r.ctl.cancel(CancelReason::MoistureAboveMax).await;
        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert!(!r.hw.pump_on(), "pump must be off when cancel returns");
        assert_eq!(r.ctl.state(), WateringState::Cancelling);
        assert_eq!(r.ctl.cancel(CancelReason::Requested).await, CancelOutcome::AlreadyStopping);

        let rec = handle.wait().await.unwrap();
        assert_eq!(rec.status, IrrigationStatus::Cancelled);
        assert_eq!(rec.duration_secs, 0);
        assert_eq!(rec.water_volume_l, 0.0);
        assert_eq!(rec.humidity_after, None);
        assert_eq!(rec.note.as_deref(), Some("cancelled: moisture above max threshold"));
        assert_eq!(r.store.records().len(), 1);
        assert!(r.notifier.notices().is_empty());
        assert_eq!(r.ctl.state(), WateringState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_sleep_promptly() {
        let r = rig();
        let handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(3600), IrrigationKind::Manual)
            .await
            .unwrap();
        settle_tasks().await;
        let t0 = Instant::now();
        r.ctl.cancel(CancelReason::Requested).await;
        handle.wait().await.unwrap();
        assert!(t0.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn power_loss_forces_cancel_and_blocks_starts() {
        let r = rig();
        let handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(600), IrrigationKind::Automatic)
            .await
            .unwrap();
        settle_tasks().await;

        assert_eq!(r.ctl.set_power_enabled(false).await, CancelOutcome::Cancelled);
        assert!(!r.hw.pump_on());
        let rec = handle.wait().await.unwrap();
        assert_eq!(rec.status, IrrigationStatus::Cancelled);
        assert_eq!(rec.note.as_deref(), Some("cancelled: battery low"));

        let err = r
            .ctl
            .start(SENSOR, Duration::from_secs(30), IrrigationKind::Manual)
            .await
            .err();
        assert!(matches!(err, Some(IrrigationError::PowerUnsafe)));

        r.ctl.set_power_enabled(true).await;
        assert!(r
            .ctl
            .start(SENSOR, Duration::from_secs(30), IrrigationKind::Manual)
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_failure_fails_the_session() {
        let r = rig();
        r.hw.fail_pump_on(true);
        let rec = r
            .ctl
            .start(SENSOR, Duration::from_secs(30), IrrigationKind::Manual)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(rec.status, IrrigationStatus::Failed);
        assert!(rec.note.as_deref().unwrap().starts_with("error: pump on"));
        assert!(!r.hw.pump_on());
        assert_eq!(r.ctl.state(), WateringState::Idle);
        assert_eq!(r.store.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tentative_save_failure_still_yields_one_record() {
        let r = rig();
        r.store.fail_record_writes(1);
        let rec = r
            .ctl
            .start(SENSOR, Duration::from_secs(30), IrrigationKind::Manual)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(rec.id.is_some());
        let stored = r.store.records();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, IrrigationStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn final_update_is_retried() {
        let r = rig();
        let handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(30), IrrigationKind::Manual)
            .await
            .unwrap();
        settle_tasks().await;
        // Tentative record is in; make the first final write fail.
        r.store.fail_record_writes(1);
        handle.wait().await.unwrap();
        assert_eq!(r.store.records()[0].status, IrrigationStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn status_describes_running_session() {
        let r = rig();
        assert_eq!(r.ctl.status().await, WateringStatus::idle());
        let _handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(45), IrrigationKind::Manual)
            .await
            .unwrap();
        let st = r.ctl.status().await;
        assert_eq!(st.state, WateringState::Running);
        assert!(st.is_watering);
        assert_eq!(st.sensor_id.as_deref(), Some(SENSOR));
        assert_eq!(st.kind, Some(IrrigationKind::Manual));
        assert_eq!(st.duration_secs, Some(45));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_and_waits_for_record() {
        let r = rig();
        let _handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(600), IrrigationKind::Manual)
            .await
            .unwrap();
        settle_tasks().await;
        r.ctl.shutdown().await;
        assert_eq!(r.ctl.state(), WateringState::Idle);
        let records = r.store.records();
        assert_eq!(records[0].status, IrrigationStatus::Cancelled);
        assert_eq!(records[0].note.as_deref(), Some("cancelled: shutdown"));
        assert!(!r.hw.pump_on());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_off_is_retried_once() {
        let r = rig();
        r.hw.fail_pump_off(1);
        let handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(20), IrrigationKind::Manual)
            .await
            .unwrap();
        let rec = handle.wait().await.unwrap();
        assert_eq!(rec.status, IrrigationStatus::Completed);
        assert!(!r.hw.pump_on());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_stuck_on_fails_session() {
        let r = rig();
        r.hw.fail_pump_off(2);
        let handle = r
            .ctl
            .start(SENSOR, Duration::from_secs(20), IrrigationKind::Manual)
            .await
            .unwrap();
        let rec = handle.wait().await.unwrap();
        assert_eq!(rec.status, IrrigationStatus::Failed);
        assert_eq!(rec.duration_secs, 20);
        assert!(rec.note.as_deref().is_some_and(|n| n.starts_with("error: pump off")));
        assert!(r.notifier.notices().is_empty());
        assert_eq!(r.ctl.state(), WateringState::Idle);
    }
}
