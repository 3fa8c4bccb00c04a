//! Physical override button.
//!
//! The button pulls its input low when pressed.  Each accepted falling edge
//! toggles watering: start a manual session when idle, cancel otherwise.

use irrigation_hw::HardwareAccess;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::model::IrrigationKind;
use crate::watering::{CancelOutcome, CancelReason, WateringController};

/// Accepts a falling edge only if `window` has passed since the last
/// accepted one.
#[derive(Debug)]
pub struct EdgeDebouncer {
    window: Duration,
    last_level: Option<bool>,
    last_accepted: Option<Instant>,
}

impl EdgeDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_level: None,
            last_accepted: None,
        }
    }

    /// Feed one sample; returns true for an accepted falling edge.
    pub fn observe(&mut self, level: bool, now: Instant) -> bool {
        let prev = self.last_level.replace(level);
        if prev != Some(true) || level {
            return false;
        }
        match self.last_accepted {
            Some(t) if now.saturating_duration_since(t) < self.window => false,
            _ => {
                self.last_accepted = Some(now);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Started,
    Stopped,
    /// Start or stop refused, e.g. by the power interlock.
    Ignored,
}

pub struct ManualOverrideInput {
    hw: Arc<dyn HardwareAccess>,
    controller: Arc<WateringController>,
    pin: u8,
    sensor_id: String,
    duration: Duration,
    poll: Duration,
    debouncer: EdgeDebouncer,
}

impl ManualOverrideInput {
    pub fn new(
        hw: Arc<dyn HardwareAccess>,
        controller: Arc<WateringController>,
        pin: u8,
        sensor_id: String,
        duration: Duration,
        poll: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            hw,
            controller,
            pin,
            sensor_id,
            duration,
            poll,
            debouncer: EdgeDebouncer::new(debounce),
        }
    }

    pub async fn toggle(&self) -> Toggle {
        if !self.controller.is_watering() {
            match self
                .controller
                .start(&self.sensor_id, self.duration, IrrigationKind::Manual)
                .await
            {
                Ok(_) => {
                    info!(pin = self.pin, sensor = %self.sensor_id, "button: manual watering started");
                    Toggle::Started
                }
                Err(e) => {
                    warn!(pin = self.pin, error = %e, "button: manual start refused");
                    Toggle::Ignored
                }
            }
        } else {
            match self.controller.cancel(CancelReason::Requested).await {
                CancelOutcome::Cancelled => {
                    info!(pin = self.pin, "button: watering stopped");
                    Toggle::Stopped
                }
                _ => Toggle::Ignored,
            }
        }
    }

    /// Sample one input level; toggles on an accepted edge.
    pub async fn poll_once(&mut self, now: Instant) -> Option<Toggle> {
        let level = match self.hw.read_digital_input(self.pin) {
            Ok(level) => level,
            Err(e) => {
                warn!(pin = self.pin, error = %e, "button read failed");
                return None;
            }
        };
        if self.debouncer.observe(level, now) {
            Some(self.toggle().await)
        } else {
            None
        }
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(pin = self.pin, poll_ms = self.poll.as_millis() as u64, "manual override input started");
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                now = ticker.tick() => {
                    self.poll_once(now).await;
                }
            }
        }
        info!(pin = self.pin, "manual override input stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IrrigationStatus;
    use crate::state;
    use crate::testutil::{FakeHardware, MemoryStore, RecordingNotifier};
    use crate::watering::{WateringConfig, WateringState};

    const PIN: u8 = 17;
    const WINDOW: Duration = Duration::from_millis(500);

    fn ms(base: Instant, n: u64) -> Instant {
        base + Duration::from_millis(n)
    }

    #[test]
    fn bounce_within_window_counts_once() {
        let t = Instant::now();
        let mut d = EdgeDebouncer::new(WINDOW);
        assert!(!d.observe(true, t));
        assert!(d.observe(false, ms(t, 10)));
        assert!(!d.observe(true, ms(t, 60)));
        assert!(!d.observe(false, ms(t, 110)), "second edge 100 ms later");
    }

    #[test]
    fn edge_after_window_is_accepted() {
        let t = Instant::now();
        let mut d = EdgeDebouncer::new(WINDOW);
        d.observe(true, t);
        assert!(d.observe(false, t));
        d.observe(true, ms(t, 200));
        assert!(d.observe(false, ms(t, 500)));
    }

    #[test]
    fn only_falling_edges_count() {
        let t = Instant::now();
        let mut d = EdgeDebouncer::new(WINDOW);
        // First sample low: no previous level, so no edge.
        assert!(!d.observe(false, t));
        assert!(!d.observe(false, ms(t, 1000)));
        assert!(!d.observe(true, ms(t, 2000)));
        assert!(d.observe(false, ms(t, 3000)));
    }

    fn setup() -> (Arc<FakeHardware>, Arc<MemoryStore>, Arc<WateringController>, ManualOverrideInput) {
        let hw = Arc::new(FakeHardware::default());
        hw.set_input(PIN, true);
        let store = Arc::new(MemoryStore::default());
        let ctl = WateringController::new(
            hw.clone(),
            store.clone(),
            Arc::new(RecordingNotifier::default()),
            state::shared(),
            WateringConfig {
                flow_rate_lpm: 2.0,
                settle: Duration::from_secs(5),
            },
        );
        let input = ManualOverrideInput::new(
            hw.clone(),
            ctl.clone(),
            PIN,
            "soil-1".into(),
            Duration::from_secs(30),
            Duration::from_millis(50),
            WINDOW,
        );
        (hw, store, ctl, input)
    }

    #[tokio::test(start_paused = true)]
    async fn press_toggles_start_then_stop() {
        let (hw, store, ctl, mut input) = setup();
        let t = Instant::now();

        assert_eq!(input.poll_once(t).await, None);
        hw.set_input(PIN, false);
        assert_eq!(input.poll_once(ms(t, 50)).await, Some(Toggle::Started));
        assert_eq!(ctl.status().await.kind, Some(IrrigationKind::Manual));

        // Bounce 100 ms later: ignored.
        hw.set_input(PIN, true);
        input.poll_once(ms(t, 100)).await;
        hw.set_input(PIN, false);
        assert_eq!(input.poll_once(ms(t, 150)).await, None);
        assert_eq!(ctl.state(), WateringState::Running);

        hw.set_input(PIN, true);
        input.poll_once(ms(t, 800)).await;
        hw.set_input(PIN, false);
        assert_eq!(input.poll_once(ms(t, 900)).await, Some(Toggle::Stopped));

        ctl.wait_idle().await;
        assert_eq!(store.records()[0].status, IrrigationStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn press_is_refused_while_power_is_unsafe() {
        let (_, store, ctl, input) = setup();
        ctl.set_power_enabled(false).await;
        assert_eq!(input.toggle().await, Toggle::Ignored);
        assert!(store.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_pin_is_ignored() {
        let (_, _, ctl, mut input) = setup();
        input.pin = 4;
        assert_eq!(input.poll_once(Instant::now()).await, None);
        assert_eq!(ctl.state(), WateringState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_reacts_to_press_and_stops() {
        let (hw, _, ctl, input) = setup();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(input.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        hw.set_input(PIN, false);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(ctl.state(), WateringState::Running);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
