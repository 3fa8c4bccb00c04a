//! Irrigation settings that can be changed while the controller runs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::error::IrrigationError;

/// Body of `GET /api/config`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsView {
    pub auto_mode: bool,
    pub duration_sec: u64,
    pub max_duration_sec: u64,
}

/// Body of `POST /api/config`; absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub auto_mode: Option<bool>,
    pub duration_sec: Option<u64>,
}

/// Shared between the automatic policy and the API.  The session length
/// cap is fixed by the config file.
#[derive(Debug)]
pub struct RuntimeSettings {
    auto_mode: AtomicBool,
    duration_secs: AtomicU64,
    max_duration: Duration,
}

impl RuntimeSettings {
    pub fn new(auto_mode: bool, duration: Duration, max_duration: Duration) -> Self {
        Self {
            auto_mode: AtomicBool::new(auto_mode),
            duration_secs: AtomicU64::new(duration.as_secs()),
            max_duration,
        }
    }

    pub fn auto_mode(&self) -> bool {
        self.auto_mode.load(Ordering::Relaxed)
    }

    /// Length of automatic sessions and the API default.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs.load(Ordering::Relaxed))
    }

    /// Rejects zero and anything above the configured cap.
    pub fn check_duration(&self, duration: Duration) -> Result<Duration, IrrigationError> {
        if duration.is_zero() || duration > self.max_duration {
            return Err(IrrigationError::InvalidDuration {
                secs: duration.as_secs(),
                max: self.max_duration.as_secs(),
            });
        }
        Ok(duration)
    }

    pub fn view(&self) -> SettingsView {
        SettingsView {
            auto_mode: self.auto_mode(),
            duration_sec: self.duration().as_secs(),
            max_duration_sec: self.max_duration.as_secs(),
        }
    }

    /// Validates the whole update before changing anything.
    pub fn apply(&self, update: &SettingsUpdate) -> Result<SettingsView, IrrigationError> {
        let duration = update
            .duration_sec
            .map(|secs| self.check_duration(Duration::from_secs(secs)))
            .transpose()?;
        if let Some(on) = update.auto_mode {
            self.auto_mode.store(on, Ordering::Relaxed);
        }
        if let Some(d) = duration {
            self.duration_secs.store(d.as_secs(), Ordering::Relaxed);
        }
        let view = self.view();
        info!(auto_mode = view.auto_mode, duration_sec = view.duration_sec, "irrigation settings updated");
        Ok(view)
    }
}
