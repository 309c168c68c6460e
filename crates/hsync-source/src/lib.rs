//! Upstream data source contract + fixture-first provider implementation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use hsync_core::{
    ActivityData, BodyBatteryData, DailyStatsData, DataType, HrvData, MetricPayload, SleepData,
    SleepScores, StressData,
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "hsync-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("data source not connected; call connect() first")]
    NotConnected,
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Permanent(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Transient(_) => true,
            SourceError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Login material for the wearable provider account.
#[derive(Debug)]
pub struct ProviderCredentials {
    pub email: String,
    password: SecretString,
}

impl ProviderCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::new(password.into().into_boxed_str()),
        }
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    pub fn is_complete(&self) -> bool {
        !self.email.trim().is_empty() && !self.password.expose_secret().is_empty()
    }
}

/// Capability set of an upstream wearable provider.
///
/// Each fetch returns `Ok(None)` when the provider has nothing for that date.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn connect(&self) -> Result<(), SourceError>;

    async fn fetch_sleep(&self, date: NaiveDate) -> Result<Option<SleepData>, SourceError>;

    async fn fetch_activities(&self, date: NaiveDate) -> Result<Option<Vec<ActivityData>>, SourceError>;

    async fn fetch_hrv(&self, date: NaiveDate) -> Result<Option<HrvData>, SourceError>;

    async fn fetch_stress(&self, date: NaiveDate) -> Result<Option<StressData>, SourceError>;

    async fn fetch_daily_stats(&self, date: NaiveDate) -> Result<Option<DailyStatsData>, SourceError>;

    async fn fetch_body_battery(&self, date: NaiveDate) -> Result<Option<BodyBatteryData>, SourceError>;

    async fn fetch(
        &self,
        data_type: DataType,
        date: NaiveDate,
    ) -> Result<Option<MetricPayload>, SourceError> {
        Ok(match data_type {
            DataType::Sleep => self.fetch_sleep(date).await?.map(MetricPayload::Sleep),
            DataType::Activity => self.fetch_activities(date).await?.map(MetricPayload::Activities),
            DataType::Hrv => self.fetch_hrv(date).await?.map(MetricPayload::Hrv),
            DataType::Stress => self.fetch_stress(date).await?.map(MetricPayload::Stress),
            DataType::DailyStats => self.fetch_daily_stats(date).await?.map(MetricPayload::DailyStats),
            DataType::BodyBattery => self
                .fetch_body_battery(date)
                .await?
                .map(MetricPayload::BodyBattery),
        })
    }
}

fn json_value<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_value(value, path)?.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_value(value, path)?.as_f64()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = json_value(value, path)?;
    v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64))
}

/// Provider timestamps arrive either as epoch milliseconds or as GMT wall-clock strings.
pub fn parse_provider_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    if let Some(ms) = value.as_i64() {
        return DateTime::from_timestamp_millis(ms);
    }
    if let Some(ms) = value.as_f64() {
        return DateTime::from_timestamp_millis(ms as i64);
    }
    let text = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn is_blank(raw: &JsonValue) -> bool {
    match raw {
        JsonValue::Null => true,
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

pub fn sleep_from_provider(raw: &JsonValue) -> Option<SleepData> {
    if is_blank(raw) {
        return None;
    }
    let daily = json_value(raw, &["dailySleepDTO"])?;
    Some(SleepData {
        sleep_time_seconds: json_i64(daily, &["sleepTimeSeconds"]).unwrap_or(0),
        deep_sleep_seconds: json_i64(daily, &["deepSleepSeconds"]).unwrap_or(0),
        light_sleep_seconds: json_i64(daily, &["lightSleepSeconds"]).unwrap_or(0),
        rem_sleep_seconds: json_i64(daily, &["remSleepSeconds"]).unwrap_or(0),
        awake_seconds: json_i64(daily, &["awakeSleepSeconds"]).unwrap_or(0),
        sleep_scores: SleepScores {
            overall_score: json_i64(daily, &["sleepScores", "overall", "value"]).unwrap_or(0),
        },
        average_hrv: json_f64(daily, &["averageHRV"]),
        sleep_end_timestamp_gmt: json_value(daily, &["sleepEndTimestampGMT"])
            .and_then(parse_provider_timestamp),
    })
}

pub fn activities_from_provider(raw: &JsonValue) -> Option<Vec<ActivityData>> {
    let items = raw.as_array()?;
    if items.is_empty() {
        return None;
    }
    Some(
        items
            .iter()
            .map(|activity| ActivityData {
                activity_type: json_str(activity, &["activityType", "typeKey"])
                    .unwrap_or("unknown")
                    .to_string(),
                start_time_gmt: json_value(activity, &["startTimeGMT"])
                    .and_then(parse_provider_timestamp),
                duration_seconds: json_f64(activity, &["duration"]).unwrap_or(0.0),
                distance_meters: json_f64(activity, &["distance"]).unwrap_or(0.0),
                calories: json_f64(activity, &["calories"]).unwrap_or(0.0),
                average_heart_rate: json_f64(activity, &["averageHR"]),
                max_heart_rate: json_f64(activity, &["maxHR"]),
            })
            .collect(),
    )
}

pub fn hrv_from_provider(raw: &JsonValue) -> Option<HrvData> {
    if is_blank(raw) {
        return None;
    }
    let summary = json_value(raw, &["hrvSummary"]).unwrap_or(raw);
    let data = HrvData {
        last_night_avg: json_f64(summary, &["lastNightAvg"]),
        weekly_avg: json_f64(summary, &["weeklyAvg"]),
        status: json_str(summary, &["hrvStatus"])
            .or_else(|| json_str(summary, &["status"]))
            .map(ToString::to_string),
    };
    (!data.is_empty()).then_some(data)
}

pub fn stress_from_provider(raw: &JsonValue) -> Option<StressData> {
    if is_blank(raw) {
        return None;
    }
    let data = StressData {
        average_stress_level: json_i64(raw, &["avgStressLevel"]),
        max_stress_level: json_i64(raw, &["maxStressLevel"]),
        rest_stress_duration: json_i64(raw, &["restStressDuration"]),
    };
    (!data.is_empty()).then_some(data)
}

pub fn daily_stats_from_provider(raw: &JsonValue) -> Option<DailyStatsData> {
    if is_blank(raw) {
        return None;
    }
    let data = DailyStatsData {
        steps: json_i64(raw, &["totalSteps"]),
        calories: json_f64(raw, &["totalKilocalories"]),
        distance_meters: json_f64(raw, &["totalDistanceMeters"]),
        active_calories: json_f64(raw, &["activeKilocalories"]),
        bmr_calories: json_f64(raw, &["bmrKilocalories"]),
        min_heart_rate: json_i64(raw, &["minHeartRate"]),
        max_heart_rate: json_i64(raw, &["maxHeartRate"]),
        resting_heart_rate: json_i64(raw, &["restingHeartRate"]),
        moderate_intensity_minutes: json_i64(raw, &["moderateIntensityMinutes"]),
        vigorous_intensity_minutes: json_i64(raw, &["vigorousIntensityMinutes"]),
    };
    (!data.is_empty()).then_some(data)
}

/// Body battery comes back as a per-day array; only the first day is used.
pub fn body_battery_from_provider(raw: &JsonValue) -> Option<BodyBatteryData> {
    if is_blank(raw) {
        return None;
    }
    let day = match raw {
        JsonValue::Array(days) => days.first()?,
        other => other,
    };
    let data = BodyBatteryData {
        charged: json_i64(day, &["charged"]),
        drained: json_i64(day, &["drained"]),
        highest_value: json_i64(day, &["highest"]),
        lowest_value: json_i64(day, &["lowest"]),
    };
    (!data.is_empty()).then_some(data)
}

fn fixture_file_name(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Sleep => "sleep.json",
        DataType::Activity => "activities.json",
        DataType::Hrv => "hrv.json",
        DataType::Stress => "stress.json",
        DataType::DailyStats => "stats.json",
        DataType::BodyBattery => "body_battery.json",
    }
}

/// Serves raw provider responses captured under `<root>/<YYYY-MM-DD>/<metric>.json`.
#[derive(Debug)]
pub struct FixtureDataSource {
    root: PathBuf,
    credentials: ProviderCredentials,
    connected: AtomicBool,
}

impl FixtureDataSource {
    pub fn new(root: impl Into<PathBuf>, credentials: ProviderCredentials) -> Self {
        Self {
            root: root.into(),
            credentials,
            connected: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fixture_path(&self, data_type: DataType, date: NaiveDate) -> PathBuf {
        self.root
            .join(date.format("%Y-%m-%d").to_string())
            .join(fixture_file_name(data_type))
    }

    fn ensure_connected(&self) -> Result<(), SourceError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SourceError::NotConnected)
        }
    }

    async fn read_raw(
        &self,
        data_type: DataType,
        date: NaiveDate,
    ) -> Result<Option<JsonValue>, SourceError> {
        self.ensure_connected()?;
        let path = self.fixture_path(data_type, date);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(%date, %data_type, "no {data_type} data available");
                return Ok(None);
            }
            Err(source) => return Err(SourceError::Io { path, source }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| SourceError::Parse { path, source })
    }
}

#[async_trait]
impl DataSource for FixtureDataSource {
    fn provider_id(&self) -> &'static str {
        "fixtures"
    }

    async fn connect(&self) -> Result<(), SourceError> {
        if !self.credentials.is_complete() {
            return Err(SourceError::Authentication(
                "provider email and password must both be set".to_string(),
            ));
        }
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(SourceError::Authentication(format!(
                    "fixture root {} is not a readable directory",
                    self.root.display()
                )))
            }
        }
        self.connected.store(true, Ordering::Release);
        info!(account = %self.credentials.email, root = %self.root.display(), "connected to fixture provider");
        Ok(())
    }

    async fn fetch_sleep(&self, date: NaiveDate) -> Result<Option<SleepData>, SourceError> {
        let raw = self.read_raw(DataType::Sleep, date).await?;
        Ok(raw.as_ref().and_then(sleep_from_provider))
    }

    async fn fetch_activities(&self, date: NaiveDate) -> Result<Option<Vec<ActivityData>>, SourceError> {
        let raw = self.read_raw(DataType::Activity, date).await?;
        Ok(raw.as_ref().and_then(activities_from_provider))
    }

    async fn fetch_hrv(&self, date: NaiveDate) -> Result<Option<HrvData>, SourceError> {
        let raw = self.read_raw(DataType::Hrv, date).await?;
        Ok(raw.as_ref().and_then(hrv_from_provider))
    }

    async fn fetch_stress(&self, date: NaiveDate) -> Result<Option<StressData>, SourceError> {
        let raw = self.read_raw(DataType::Stress, date).await?;
        Ok(raw.as_ref().and_then(stress_from_provider))
    }

    async fn fetch_daily_stats(&self, date: NaiveDate) -> Result<Option<DailyStatsData>, SourceError> {
        let raw = self.read_raw(DataType::DailyStats, date).await?;
        Ok(raw.as_ref().and_then(daily_stats_from_provider))
    }

    async fn fetch_body_battery(&self, date: NaiveDate) -> Result<Option<BodyBatteryData>, SourceError> {
        let raw = self.read_raw(DataType::BodyBattery, date).await?;
        Ok(raw.as_ref().and_then(body_battery_from_provider))
    }
}
