//! Core domain model for wearable telemetry sync runs and their audit records.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hsync-core";

/// Metric families pulled from the wearable provider, in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Sleep,
    Activity,
    Hrv,
    Stress,
    DailyStats,
    BodyBattery,
}

impl DataType {
    /// Fixed order in which a run walks the data types for each date.
    pub const ALL: [DataType; 6] = [
        DataType::Sleep,
        DataType::Activity,
        DataType::Hrv,
        DataType::Stress,
        DataType::DailyStats,
        DataType::BodyBattery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Sleep => "sleep",
            DataType::Activity => "activity",
            DataType::Hrv => "hrv",
            DataType::Stress => "stress",
            DataType::DailyStats => "daily_stats",
            DataType::BodyBattery => "body_battery",
        }
    }

    /// Path segment under `/api/v1/garmin/ingest/` on the ingestion service.
    pub fn ingest_path(&self) -> &'static str {
        match self {
            DataType::Sleep => "sleep",
            DataType::Activity => "activity",
            DataType::Hrv => "hrv",
            DataType::Stress => "stress",
            DataType::DailyStats => "daily-stats",
            DataType::BodyBattery => "body-battery",
        }
    }

    /// Key carrying the payload in an ingestion request body.
    pub fn payload_key(&self) -> &'static str {
        match self {
            DataType::Sleep => "sleep_data",
            DataType::Activity => "activity_data",
            DataType::Hrv => "hrv_data",
            DataType::Stress => "stress_data",
            DataType::DailyStats => "daily_stats_data",
            DataType::BodyBattery => "body_battery_data",
        }
    }

    /// Singleton metrics produce at most one record per (user, date).
    pub fn is_singleton(&self) -> bool {
        !matches!(self, DataType::Activity)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SleepScores {
    pub overall_score: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SleepData {
    pub sleep_time_seconds: i64,
    pub deep_sleep_seconds: i64,
    pub light_sleep_seconds: i64,
    pub rem_sleep_seconds: i64,
    pub awake_seconds: i64,
    pub sleep_scores: SleepScores,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_hrv: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_end_timestamp_gmt: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActivityData {
    pub activity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_gmt: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub distance_meters: f64,
    pub calories: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_heart_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_heart_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HrvData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_night_avg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_avg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl HrvData {
    pub fn is_empty(&self) -> bool {
        self.last_night_avg.is_none() && self.weekly_avg.is_none() && self.status.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StressData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_stress_level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stress_level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_stress_duration: Option<i64>,
}

impl StressData {
    pub fn is_empty(&self) -> bool {
        self.average_stress_level.is_none()
            && self.max_stress_level.is_none()
            && self.rest_stress_duration.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DailyStatsData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmr_calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_heart_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_heart_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resting_heart_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderate_intensity_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vigorous_intensity_minutes: Option<i64>,
}

impl DailyStatsData {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BodyBatteryData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charged: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drained: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lowest_value: Option<i64>,
}

impl BodyBatteryData {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One fetched metric for one date, as handed from the data source to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricPayload {
    Sleep(SleepData),
    Activities(Vec<ActivityData>),
    Hrv(HrvData),
    Stress(StressData),
    DailyStats(DailyStatsData),
    BodyBattery(BodyBatteryData),
}

impl MetricPayload {
    pub fn data_type(&self) -> DataType {
        match self {
            MetricPayload::Sleep(_) => DataType::Sleep,
            MetricPayload::Activities(_) => DataType::Activity,
            MetricPayload::Hrv(_) => DataType::Hrv,
            MetricPayload::Stress(_) => DataType::Stress,
            MetricPayload::DailyStats(_) => DataType::DailyStats,
            MetricPayload::BodyBattery(_) => DataType::BodyBattery,
        }
    }

    /// Split into upsert units: one per singleton, one per activity in fetch order.
    pub fn into_records(self) -> Vec<MetricRecord> {
        match self {
            MetricPayload::Sleep(v) => vec![MetricRecord::Sleep(v)],
            MetricPayload::Activities(items) => items.into_iter().map(MetricRecord::Activity).collect(),
            MetricPayload::Hrv(v) => vec![MetricRecord::Hrv(v)],
            MetricPayload::Stress(v) => vec![MetricRecord::Stress(v)],
            MetricPayload::DailyStats(v) => vec![MetricRecord::DailyStats(v)],
            MetricPayload::BodyBattery(v) => vec![MetricRecord::BodyBattery(v)],
        }
    }
}

/// A single record posted to the ingestion sink. Serializes as the bare payload object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricRecord {
    Sleep(SleepData),
    Activity(ActivityData),
    Hrv(HrvData),
    Stress(StressData),
    DailyStats(DailyStatsData),
    BodyBattery(BodyBatteryData),
}

impl MetricRecord {
    pub fn data_type(&self) -> DataType {
        match self {
            MetricRecord::Sleep(_) => DataType::Sleep,
            MetricRecord::Activity(_) => DataType::Activity,
            MetricRecord::Hrv(_) => DataType::Hrv,
            MetricRecord::Stress(_) => DataType::Stress,
            MetricRecord::DailyStats(_) => DataType::DailyStats,
            MetricRecord::BodyBattery(_) => DataType::BodyBattery,
        }
    }

    /// Native timestamp carried by the record, if the metric has one.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            MetricRecord::Sleep(v) => v.sleep_end_timestamp_gmt,
            MetricRecord::Activity(v) => v.start_time_gmt,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

impl UpsertOutcome {
    pub fn from_was_inserted(was_inserted: bool) -> Self {
        if was_inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Scheduled => f.write_str("scheduled"),
            TriggerKind::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    AbortedPreconditionFailed,
    CompletedWithErrors,
}

/// Audit record for one (data type, date) unit of work.
///
/// Field names follow the ingestion service's `/api/v1/audit/sync` contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub user_id: String,
    pub data_type: DataType,
    pub target_date: NaiveDate,
    pub sync_started_at: DateTime<Utc>,
    pub sync_completed_at: DateTime<Utc>,
    pub sync_duration_seconds: i64,
    pub records_fetched: u32,
    pub records_inserted: u32,
    pub records_updated: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SyncAttempt {
    pub fn is_failed(&self) -> bool {
        self.status == AttemptStatus::Failed
    }
}
