//! Outbound notifications: threshold alerts and completed sessions.
//!
//! Delivery is best-effort; a sink that cannot deliver logs and moves on, so
//! the trait methods do not return errors.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Low,
    High,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::High => "high",
        })
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn alert_threshold(&self, sensor_id: &str, value: f64, threshold: f64, kind: AlertKind);

    async fn notify_irrigation_completed(
        &self,
        sensor_id: &str,
        duration_secs: i64,
        before: Option<f64>,
        after: Option<f64>,
    );
}

fn fmt_pct(v: Option<f64>) -> String {
    v.map_or_else(|| "?".to_string(), |v| format!("{v:.1}%"))
}

/// Logs notifications and keeps them in the status event log.
pub struct StateNotifier {
    shared: SharedState,
}

impl StateNotifier {
    pub fn new(shared: SharedState) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl NotificationSink for StateNotifier {
    async fn alert_threshold(&self, sensor_id: &str, value: f64, threshold: f64, kind: AlertKind) {
        warn!(sensor = %sensor_id, value, threshold, %kind, "threshold alert");
        self.shared
            .write()
            .await
            .record_alert(format!("{sensor_id} {kind}: {value:.1} (threshold {threshold:.1})"));
    }

    async fn notify_irrigation_completed(
        &self,
        sensor_id: &str,
        duration_secs: i64,
        before: Option<f64>,
        after: Option<f64>,
    ) {
        info!(sensor = %sensor_id, duration_secs, ?before, ?after, "irrigation completed");
        self.shared.write().await.record_watering(format!(
            "{sensor_id} watered {duration_secs}s: {} -> {}",
            fmt_pct(before),
            fmt_pct(after)
        ));
    }
}

/// Delivers every notification to each inner sink in order.
#[derive(Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl NotificationSink for FanoutNotifier {
    async fn alert_threshold(&self, sensor_id: &str, value: f64, threshold: f64, kind: AlertKind) {
        for sink in &self.sinks {
            sink.alert_threshold(sensor_id, value, threshold, kind).await;
        }
    }

    async fn notify_irrigation_completed(
        &self,
        sensor_id: &str,
        duration_secs: i64,
        before: Option<f64>,
        after: Option<f64>,
    ) {
        for sink in &self.sinks {
            sink.notify_irrigation_completed(sensor_id, duration_secs, before, after)
                .await;
        }
    }
}
