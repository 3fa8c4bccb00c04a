//! Persistence capability used by the engine.
//!
//! [`Db`](crate::db::Db) is the SQLite implementation; tests use an in-memory
//! one.  Timestamps are unix seconds throughout.

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{IrrigationRecord, ReadingStats, RecordUpdate, SensorDescriptor, SensorReading, SensorStatus};

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn load_sensors(&self) -> Result<Vec<SensorDescriptor>>;

    async fn get_sensor(&self, sensor_id: &str) -> Result<Option<SensorDescriptor>>;

    async fn set_sensor_status(&self, sensor_id: &str, status: SensorStatus) -> Result<()>;

    async fn save_reading(&self, reading: &SensorReading) -> Result<()>;

    /// Inserts the record and returns its id.
    async fn save_record(&self, record: &IrrigationRecord) -> Result<i64>;

    async fn update_record(&self, id: i64, update: &RecordUpdate) -> Result<()>;

    /// Newest valid reading for the sensor.
    async fn query_latest_reading(&self, sensor_id: &str) -> Result<Option<SensorReading>>;

    /// Valid readings with `ts >= since`, oldest first.
    async fn query_readings(&self, sensor_id: &str, since: i64) -> Result<Vec<SensorReading>>;

    /// Most recent records first.
    async fn query_history(&self, sensor_id: &str, limit: i64) -> Result<Vec<IrrigationRecord>>;

    /// Aggregates over valid readings with `ts >= since`.
    async fn query_stats(&self, sensor_id: &str, since: i64) -> Result<ReadingStats>;
}
