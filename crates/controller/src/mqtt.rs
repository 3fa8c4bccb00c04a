use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::notify::{AlertKind, NotificationSink};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct AlertMsg<'a> {
    pub(crate) sensor_id: &'a str,
    pub(crate) kind: AlertKind,
    pub(crate) value: f64,
    pub(crate) threshold: f64,
}

#[derive(Debug, Serialize)]
pub(crate) struct CompletedMsg<'a> {
    pub(crate) sensor_id: &'a str,
    pub(crate) duration_sec: i64,
    pub(crate) humidity_before: Option<f64>,
    pub(crate) humidity_after: Option<f64>,
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

pub(crate) fn alert_topic(sensor_id: &str) -> String {
    format!("irrigation/alert/{sensor_id}")
}

pub(crate) fn completed_topic(sensor_id: &str) -> String {
    format!("irrigation/completed/{sensor_id}")
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub fn connect(host: &str, port: u16) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new("irrigation-controller", host, port);
    options.set_keep_alive(Duration::from_secs(30));
    AsyncClient::new(options, 20)
}

/// Poll the connection forever, mirroring its state into `shared`.
pub async fn drive(mut eventloop: EventLoop, shared: SharedState) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Publishes notifications as JSON.  Never waits on the broker: when the
/// outgoing queue is full the message is dropped with a warning.
pub struct MqttNotifier {
    client: AsyncClient,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    fn publish<T: Serialize>(&self, topic: String, msg: &T) {
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(%topic, error = %e, "mqtt payload encoding failed");
                return;
            }
        };
        if let Err(e) = self.client.try_publish(&topic, QoS::AtLeastOnce, false, payload) {
            warn!(%topic, error = %e, "mqtt publish dropped");
        }
    }
}

#[async_trait]
impl NotificationSink for MqttNotifier {
    async fn alert_threshold(&self, sensor_id: &str, value: f64, threshold: f64, kind: AlertKind) {
        self.publish(
            alert_topic(sensor_id),
            &AlertMsg {
                sensor_id,
                kind,
                value,
                threshold,
            },
        );
    }

    async fn notify_irrigation_completed(
        &self,
        sensor_id: &str,
        duration_secs: i64,
        before: Option<f64>,
        after: Option<f64>,
    ) {
        self.publish(
            completed_topic(sensor_id),
            &CompletedMsg {
                sensor_id,
                duration_sec: duration_secs,
                humidity_before: before,
                humidity_after: after,
            },
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- topics -------------------------------------------------------------

    #[test]
    fn topics_embed_sensor_id() {
        assert_eq!(alert_topic("soil-1"), "irrigation/alert/soil-1");
        assert_eq!(completed_topic("soil-1"), "irrigation/completed/soil-1");
    }

    // -- payloads -----------------------------------------------------------

    #[test]
    fn alert_payload_shape() {
        let msg = AlertMsg {
            sensor_id: "soil-1",
            kind: AlertKind::Low,
            value: 20.5,
            threshold: 30.0,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"sensor_id": "soil-1", "kind": "low", "value": 20.5, "threshold": 30.0})
        );
    }

    #[test]
    fn completed_payload_keeps_missing_snapshot_as_null() {
        let msg = CompletedMsg {
            sensor_id: "soil-1",
            duration_sec: 30,
            humidity_before: Some(20.0),
            humidity_after: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"sensor_id": "soil-1", "duration_sec": 30, "humidity_before": 20.0, "humidity_after": null})
        );
    }

    #[tokio::test]
    async fn notifier_does_not_block_without_broker() {
        let (client, _eventloop) = connect("127.0.0.1", 1);
        let notifier = MqttNotifier::new(client);
        // Far more than the queue holds; overflow is dropped, not awaited.
        for _ in 0..50 {
            notifier.alert_threshold("soil-1", 10.0, 30.0, AlertKind::Low).await;
        }
    }
}
