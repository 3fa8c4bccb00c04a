use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

use crate::model::{
    Calibration, IrrigationRecord, ReadingStats, RecordUpdate, SensorDescriptor, SensorReading, SensorStatus,
};
use crate::store::PersistenceStore;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ----------------------------
// Row types
// ----------------------------

#[derive(FromRow)]
struct SensorRow {
    sensor_id: String,
    name: String,
    kind: String,
    location: Option<String>,
    channel: i64,
    active: bool,
    status: String,
    calibration_offset: f64,
    calibration_scale: f64,
    min_threshold: f64,
    max_threshold: f64,
}

impl TryFrom<SensorRow> for SensorDescriptor {
    type Error = anyhow::Error;

    fn try_from(r: SensorRow) -> Result<Self> {
        let channel = u8::try_from(r.channel)
            .with_context(|| format!("sensor '{}': channel {} out of range", r.sensor_id, r.channel))?;
        Ok(Self {
            kind: r.kind.parse()?,
            status: r.status.parse()?,
            sensor_id: r.sensor_id,
            name: r.name,
            location: r.location,
            channel,
            active: r.active,
            calibration: Calibration {
                offset: r.calibration_offset,
                scale: r.calibration_scale,
            },
            min_threshold: r.min_threshold,
            max_threshold: r.max_threshold,
        })
    }
}

#[derive(FromRow)]
struct ReadingRow {
    sensor_id: String,
    ts: i64,
    value: f64,
    unit: String,
    is_valid: bool,
}

impl From<ReadingRow> for SensorReading {
    fn from(r: ReadingRow) -> Self {
        Self {
            sensor_id: r.sensor_id,
            ts: r.ts,
            value: r.value,
            unit: r.unit,
            valid: r.is_valid,
        }
    }
}

#[derive(FromRow)]
struct RecordRow {
    id: i64,
    sensor_id: String,
    started_at: i64,
    duration_sec: i64,
    water_volume_l: f64,
    humidity_before: Option<f64>,
    humidity_after: Option<f64>,
    kind: String,
    status: String,
    note: Option<String>,
}

impl TryFrom<RecordRow> for IrrigationRecord {
    type Error = anyhow::Error;

    fn try_from(r: RecordRow) -> Result<Self> {
        Ok(Self {
            id: Some(r.id),
            kind: r.kind.parse()?,
            status: r.status.parse()?,
            sensor_id: r.sensor_id,
            started_at: r.started_at,
            duration_secs: r.duration_sec,
            water_volume_l: r.water_volume_l,
            humidity_before: r.humidity_before,
            humidity_after: r.humidity_after,
            note: r.note,
        })
    }
}

const SENSOR_COLUMNS: &str = "sensor_id, name, kind, location, channel, active, status, \
     calibration_offset, calibration_scale, min_threshold, max_threshold";

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Insert or update a sensor definition.  The runtime `status` of an
    /// existing sensor is left alone.
    pub async fn upsert_sensor(&self, s: &SensorDescriptor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (
              sensor_id, name, kind, location, channel, active, status,
              calibration_offset, calibration_scale, min_threshold, max_threshold
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET
              name=excluded.name,
              kind=excluded.kind,
              location=excluded.location,
              channel=excluded.channel,
              active=excluded.active,
              calibration_offset=excluded.calibration_offset,
              calibration_scale=excluded.calibration_scale,
              min_threshold=excluded.min_threshold,
              max_threshold=excluded.max_threshold
            "#,
        )
        .bind(&s.sensor_id)
        .bind(&s.name)
        .bind(s.kind.as_str())
        .bind(&s.location)
        .bind(i64::from(s.channel))
        .bind(s.active)
        .bind(s.status.as_str())
        .bind(s.calibration.offset)
        .bind(s.calibration.scale)
        .bind(s.min_threshold)
        .bind(s.max_threshold)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for Db {
    async fn load_sensors(&self) -> Result<Vec<SensorDescriptor>> {
        let rows: Vec<SensorRow> = sqlx::query_as(&format!("SELECT {SENSOR_COLUMNS} FROM sensors ORDER BY sensor_id"))
            .fetch_all(&self.pool)
            .await
            .context("load_sensors failed")?;
        rows.into_iter().map(SensorDescriptor::try_from).collect()
    }

    async fn get_sensor(&self, sensor_id: &str) -> Result<Option<SensorDescriptor>> {
        let row: Option<SensorRow> =
            sqlx::query_as(&format!("SELECT {SENSOR_COLUMNS} FROM sensors WHERE sensor_id = ?"))
                .bind(sensor_id)
                .fetch_optional(&self.pool)
                .await
                .context("get_sensor failed")?;
        row.map(SensorDescriptor::try_from).transpose()
    }

    async fn set_sensor_status(&self, sensor_id: &str, status: SensorStatus) -> Result<()> {
        let done = sqlx::query("UPDATE sensors SET status = ? WHERE sensor_id = ?")
            .bind(status.as_str())
            .bind(sensor_id)
            .execute(&self.pool)
            .await
            .context("set_sensor_status failed")?;
        if done.rows_affected() == 0 {
            bail!("set_sensor_status: unknown sensor '{sensor_id}'");
        }
        Ok(())
    }

    async fn save_reading(&self, r: &SensorReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (ts, sensor_id, value, unit, is_valid)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.ts)
        .bind(&r.sensor_id)
        .bind(r.value)
        .bind(&r.unit)
        .bind(r.valid)
        .execute(&self.pool)
        .await
        .context("save_reading failed")?;
        Ok(())
    }

    async fn save_record(&self, rec: &IrrigationRecord) -> Result<i64> {
        let done = sqlx::query(
            r#"
            INSERT INTO irrigation_records (
              sensor_id, started_at, duration_sec, water_volume_l,
              humidity_before, humidity_after, kind, status, note
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rec.sensor_id)
        .bind(rec.started_at)
        .bind(rec.duration_secs)
        .bind(rec.water_volume_l)
        .bind(rec.humidity_before)
        .bind(rec.humidity_after)
        .bind(rec.kind.as_str())
        .bind(rec.status.as_str())
        .bind(&rec.note)
        .execute(&self.pool)
        .await
        .context("save_record failed")?;
        Ok(done.last_insert_rowid())
    }

    async fn update_record(&self, id: i64, u: &RecordUpdate) -> Result<()> {
        let done = sqlx::query(
            r#"
            UPDATE irrigation_records
            SET duration_sec = ?, water_volume_l = ?, humidity_after = ?, status = ?, note = ?
            WHERE id = ?
            "#,
        )
        .bind(u.duration_secs)
        .bind(u.water_volume_l)
        .bind(u.humidity_after)
        .bind(u.status.as_str())
        .bind(&u.note)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("update_record failed")?;
        if done.rows_affected() == 0 {
            bail!("update_record: no irrigation record with id {id}");
        }
        Ok(())
    }

    async fn query_latest_reading(&self, sensor_id: &str) -> Result<Option<SensorReading>> {
        let row: Option<ReadingRow> = sqlx::query_as(
            r#"
            SELECT sensor_id, ts, value, unit, is_valid
            FROM readings
            WHERE sensor_id = ? AND is_valid = 1
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await
        .context("query_latest_reading failed")?;
        Ok(row.map(SensorReading::from))
    }

    async fn query_readings(&self, sensor_id: &str, since: i64) -> Result<Vec<SensorReading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT sensor_id, ts, value, unit, is_valid
            FROM readings
            WHERE sensor_id = ? AND is_valid = 1 AND ts >= ?
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(sensor_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("query_readings failed")?;
        Ok(rows.into_iter().map(SensorReading::from).collect())
    }

    async fn query_history(&self, sensor_id: &str, limit: i64) -> Result<Vec<IrrigationRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT id, sensor_id, started_at, duration_sec, water_volume_l,
                   humidity_before, humidity_after, kind, status, note
            FROM irrigation_records
            WHERE sensor_id = ?
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(sensor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("query_history failed")?;
        rows.into_iter().map(IrrigationRecord::try_from).collect()
    }

    async fn query_stats(&self, sensor_id: &str, since: i64) -> Result<ReadingStats> {
        let (average, minimum, maximum, count): (Option<f64>, Option<f64>, Option<f64>, i64) = sqlx::query_as(
            r#"
            SELECT AVG(value), MIN(value), MAX(value), COUNT(*)
            FROM readings
            WHERE sensor_id = ? AND is_valid = 1 AND ts >= ?
            "#,
        )
        .bind(sensor_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .context("query_stats failed")?;
        Ok(ReadingStats {
            average,
            minimum,
            maximum,
            count,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
