//! Analytical reads over the reading collection.
//!
//! Every temperature aggregate here works on Celsius values computed per document before
//! any grouping, so interior (°C) and exterior (°F) readings can share a bucket.


use crate::error::{StoreError, StoreResult};
use crate::metrics::stats::{mean, sample_std_dev};
use crate::reading::{format_timestamp, parse_timestamp, SensorKind, SensorReading};
use crate::store::{
    bson_f64, bson_key, bson_u64, decode_reading, DocumentStore, Expr, Filter, FindQuery, Group,
    Pipeline, Projection, SortOrder,
};
use chrono::{DateTime, DurationRound, Utc};
use mongodb::bson::Document;
use serde::Serialize;
use std::collections::HashMap;

pub const DEFAULT_OUTLIER_THRESHOLD: f64 = 2.0;
pub const DEFAULT_HOURLY_WINDOW: u32 = 24;

const HOUR_KEY_FORMAT: &str = "%Y-%m-%dT%H";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureSummary {
    pub sensor_type: String,
    pub average_celsius: f64,
    pub min_celsius: f64,
    pub max_celsius: f64,
    pub readings: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCount {
    pub key: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceActivity {
    pub device_id: String,
    pub sensor_type: String,
    pub location: String,
    pub readings: u64,
    pub first_reading: DateTime<Utc>,
    pub last_reading: DateTime<Utc>,
}

/// One hour of the trailing window. `average_celsius` is `None` when the hour holds no
/// readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyBucket {
    pub hour_start: DateTime<Utc>,
    pub readings: u64,
    pub average_celsius: Option<f64>,
}

/// One (hour, sensor type) cell of the trailing window. The statistics are `None` when the
/// cell holds no readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyTypeBucket {
    pub hour_start: DateTime<Utc>,
    pub sensor_type: SensorKind,
    pub readings: u64,
    pub average_celsius: Option<f64>,
    pub min_celsius: Option<f64>,
    pub max_celsius: Option<f64>,
}

/// Numeric reading field scored by the outlier scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierField {
    /// Normalized to Celsius before scoring.
    Temperature,
    /// Interior readings only.
    Humidity,
    Light,
}

impl OutlierField {
    pub fn as_str(self) -> &'static str {
        match self {
            OutlierField::Temperature => "temperature",
            OutlierField::Humidity => "humidity",
            OutlierField::Light => "light",
        }
    }

    pub fn unit_label(self) -> &'static str {
        match self {
            OutlierField::Temperature => "°C",
            OutlierField::Humidity => "%",
            OutlierField::Light => "lux",
        }
    }

    /// The scored value, or `None` when the reading does not carry the field.
    pub fn value_of(self, reading: &SensorReading) -> Option<f64> {
        match (self, reading) {
            (OutlierField::Temperature, _) => Some(reading.celsius()),
            (OutlierField::Humidity, SensorReading::Interior(r)) => Some(f64::from(r.humidity)),
            (OutlierField::Humidity, SensorReading::Exterior(_)) => None,
            (OutlierField::Light, SensorReading::Interior(r)) => Some(f64::from(r.light)),
            (OutlierField::Light, SensorReading::Exterior(r)) => Some(f64::from(r.light)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outlier {
    pub reading: SensorReading,
    pub value: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutlierReport {
    pub field: OutlierField,
    /// Readings that carry the field; the others are skipped.
    pub population: usize,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    pub threshold: f64,
    /// Sorted by z-score, largest first.
    pub outliers: Vec<Outlier>,
}

/// Flags readings whose `field` lies more than `threshold` sample standard deviations from
/// the mean. Fewer than two scored readings, or zero spread, flag nothing.
pub fn detect_outliers(
    readings: &[SensorReading],
    field: OutlierField,
    threshold: f64,
) -> OutlierReport {
    let scored: Vec<(&SensorReading, f64)> = readings
        .iter()
        .filter_map(|reading| field.value_of(reading).map(|value| (reading, value)))
        .collect();
    let values: Vec<f64> = scored.iter().map(|(_, value)| *value).collect();
    let mean = mean(&values);
    let std_dev = sample_std_dev(&values);

    let mut outliers = Vec::new();
    if let (Some(mu), Some(sigma)) = (mean, std_dev) {
        if values.len() >= 2 && sigma > 0.0 {
            for (reading, value) in &scored {
                let z_score = (value - mu).abs() / sigma;
                if z_score > threshold {
                    outliers.push(Outlier {
                        reading: (*reading).clone(),
                        value: *value,
                        z_score,
                    });
                }
            }
        }
    }
    outliers.sort_by(|a, b| b.z_score.total_cmp(&a.z_score));

    OutlierReport {
        field,
        population: values.len(),
        mean,
        std_dev,
        threshold,
        outliers,
    }
}

/// Read-side API. Holds a store handle; every call is one or two store round trips.
#[derive(Clone)]
pub struct ReadingQueries<S> {
    store: S,
}

impl<S: DocumentStore> ReadingQueries<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Newest `limit` readings, mixed types.
    pub async fn recent(&self, limit: u32) -> StoreResult<Vec<SensorReading>> {
        decode_all(self.store.find_recent(limit).await?)
    }

    pub async fn by_type(
        &self,
        kind: SensorKind,
        limit: Option<u32>,
    ) -> StoreResult<Vec<SensorReading>> {
        self.find_matching(Filter::eq("type", kind.as_str()), limit)
            .await
    }

    pub async fn by_location(
        &self,
        location: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<SensorReading>> {
        if location.trim().is_empty() {
            return Err(StoreError::query("by_location", "location must not be empty"));
        }
        self.find_matching(Filter::eq("location", location), limit)
            .await
    }

    async fn find_matching(
        &self,
        filter: Filter,
        limit: Option<u32>,
    ) -> StoreResult<Vec<SensorReading>> {
        let mut query = FindQuery::matching(filter).newest_first();
        if let Some(limit) = limit {
            query = query.limit(i64::from(limit));
        }
        decode_all(self.store.find(&query).await?)
    }

    pub async fn total_count(&self) -> StoreResult<u64> {
        self.store.count(&Filter::All).await
    }

    /// Average, minimum and maximum Celsius temperature per sensor type, ordered by type.
    pub async fn temperature_by_type(&self) -> StoreResult<Vec<TemperatureSummary>> {
        let pipeline = Pipeline::new()
            .project(
                Projection::new()
                    .field("type", Expr::field("type"))
                    .field("temperature_c", Expr::CelsiusTemperature),
            )
            .group(
                Group::by(Expr::field("type"))
                    .avg("average_celsius", Expr::field("temperature_c"))
                    .min("min_celsius", Expr::field("temperature_c"))
                    .max("max_celsius", Expr::field("temperature_c"))
                    .count("readings"),
            )
            .sort_by("_id", SortOrder::Ascending);

        let rows = self.store.aggregate(&pipeline).await?;
        rows.iter()
            .map(|row| {
                Ok(TemperatureSummary {
                    sensor_type: row_key(row),
                    average_celsius: row_f64(row, "average_celsius", "temperature_by_type")?,
                    min_celsius: row_f64(row, "min_celsius", "temperature_by_type")?,
                    max_celsius: row_f64(row, "max_celsius", "temperature_by_type")?,
                    readings: row_u64(row, "readings", "temperature_by_type")?,
                })
            })
            .collect()
    }

    pub async fn count_by_device(&self) -> StoreResult<Vec<GroupCount>> {
        self.ranked_counts("device_id").await
    }

    pub async fn count_by_location(&self) -> StoreResult<Vec<GroupCount>> {
        self.ranked_counts("location").await
    }

    /// Counts per distinct `key`, largest first; equal counts order by key.
    async fn ranked_counts(&self, key: &str) -> StoreResult<Vec<GroupCount>> {
        let mut counts: Vec<GroupCount> = self
            .store
            .count_by(key)
            .await?
            .into_iter()
            .map(|(key, count)| GroupCount { key, count })
            .collect();
        counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        Ok(counts)
    }

    /// Per-device totals with the device's type, the location of its earliest reading and
    /// its first and last timestamps.
    pub async fn device_activity(&self) -> StoreResult<Vec<DeviceActivity>> {
        let pipeline = Pipeline::new()
            .sort_by("timestamp", SortOrder::Ascending)
            .group(
                Group::by(Expr::field("device_id"))
                    .count("readings")
                    .first("sensor_type", Expr::field("type"))
                    .first("location", Expr::field("location"))
                    .min("first_reading", Expr::field("timestamp"))
                    .max("last_reading", Expr::field("timestamp")),
            )
            .sort_by("readings", SortOrder::Descending)
            .sort_by("_id", SortOrder::Ascending);

        let rows = self.store.aggregate(&pipeline).await?;
        rows.iter()
            .map(|row| {
                Ok(DeviceActivity {
                    device_id: row_key(row),
                    sensor_type: row_str(row, "sensor_type"),
                    location: row_str(row, "location"),
                    readings: row_u64(row, "readings", "device_activity")?,
                    first_reading: row_timestamp(row, "first_reading")?,
                    last_reading: row_timestamp(row, "last_reading")?,
                })
            })
            .collect()
    }

    /// Average Celsius temperature for each of the `hours` hours ending with the hour that
    /// contains `now`. Hours without readings are still reported, with no average.
    pub async fn hourly_average(
        &self,
        now: DateTime<Utc>,
        hours: u32,
    ) -> StoreResult<Vec<HourlyBucket>> {
        let (window_start, window_end) = hour_window(now, hours, "hourly_average")?;
        let pipeline = Pipeline::new()
            .filter(window_filter(window_start, window_end))
            .project(
                Projection::new()
                    .field("hour", Expr::HourOf("timestamp".to_string()))
                    .field("temperature_c", Expr::CelsiusTemperature),
            )
            .group(
                Group::by(Expr::field("hour"))
                    .avg("average_celsius", Expr::field("temperature_c"))
                    .count("readings"),
            );

        let rows = self.store.aggregate(&pipeline).await?;
        let mut by_hour: HashMap<String, (u64, Option<f64>)> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let readings = row_u64(row, "readings", "hourly_average")?;
            let average = row.get("average_celsius").and_then(bson_f64);
            by_hour.insert(row_key(row), (readings, average));
        }

        Ok((0..hours)
            .map(|offset| {
                let hour_start = window_start + chrono::Duration::hours(i64::from(offset));
                let key = hour_start.format(HOUR_KEY_FORMAT).to_string();
                let (readings, average_celsius) = by_hour.remove(&key).unwrap_or((0, None));
                HourlyBucket {
                    hour_start,
                    readings,
                    average_celsius: average_celsius.filter(|_| readings > 0),
                }
            })
            .collect())
    }

    /// Same window as [`ReadingQueries::hourly_average`], split by sensor type: one cell per
    /// hour and type, interior first within each hour.
    pub async fn hourly_average_by_type(
        &self,
        now: DateTime<Utc>,
        hours: u32,
    ) -> StoreResult<Vec<HourlyTypeBucket>> {
        let (window_start, window_end) = hour_window(now, hours, "hourly_average_by_type")?;
        let pipeline = Pipeline::new()
            .filter(window_filter(window_start, window_end))
            .project(
                Projection::new()
                    .field("hour", Expr::HourOf("timestamp".to_string()))
                    .field("type", Expr::field("type"))
                    .field("temperature_c", Expr::CelsiusTemperature),
            )
            .group(
                Group::by(Expr::compound(&[
                    ("hour", Expr::field("hour")),
                    ("type", Expr::field("type")),
                ]))
                .avg("average_celsius", Expr::field("temperature_c"))
                .min("min_celsius", Expr::field("temperature_c"))
                .max("max_celsius", Expr::field("temperature_c"))
                .count("readings"),
            );

        let rows = self.store.aggregate(&pipeline).await?;
        type CellStats = (u64, Option<f64>, Option<f64>, Option<f64>);
        let mut cells: HashMap<(String, String), CellStats> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let key = row.get_document("_id").map_err(|err| {
                StoreError::query("hourly_average_by_type", format!("group key: {err}"))
            })?;
            let hour = key.get("hour").map(bson_key).unwrap_or_else(|| "null".to_string());
            let kind = key.get("type").map(bson_key).unwrap_or_else(|| "null".to_string());
            let readings = row_u64(row, "readings", "hourly_average_by_type")?;
            let stat = |field: &str| row.get(field).and_then(bson_f64).filter(|_| readings > 0);
            cells.insert(
                (hour, kind),
                (
                    readings,
                    stat("average_celsius"),
                    stat("min_celsius"),
                    stat("max_celsius"),
                ),
            );
        }

        let mut buckets = Vec::with_capacity(hours as usize * SensorKind::ALL.len());
        for offset in 0..hours {
            let hour_start = window_start + chrono::Duration::hours(i64::from(offset));
            let hour_key = hour_start.format(HOUR_KEY_FORMAT).to_string();
            for sensor_type in SensorKind::ALL {
                let (readings, average_celsius, min_celsius, max_celsius) = cells
                    .remove(&(hour_key.clone(), sensor_type.as_str().to_string()))
                    .unwrap_or((0, None, None, None));
                buckets.push(HourlyTypeBucket {
                    hour_start,
                    sensor_type,
                    readings,
                    average_celsius,
                    min_celsius,
                    max_celsius,
                });
            }
        }
        Ok(buckets)
    }

    /// Outlier scan of `field` over the newest `window` readings, or the whole collection
    /// when `None`.
    pub async fn outliers(
        &self,
        field: OutlierField,
        threshold: f64,
        window: Option<u32>,
    ) -> StoreResult<OutlierReport> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(StoreError::query(
                "outliers",
                format!("threshold must be a positive number, got {threshold}"),
            ));
        }
        let readings = match window {
            Some(limit) => self.recent(limit).await?,
            None => decode_all(self.store.find(&FindQuery::all().newest_first()).await?)?,
        };
        let report = detect_outliers(&readings, field, threshold);
        tracing::debug!(
            field = field.as_str(),
            population = report.population,
            flagged = report.outliers.len(),
            threshold,
            "outlier scan complete"
        );
        Ok(report)
    }
}

/// `(start, end)` of the `hours`-hour window ending with the hour that contains `now`.
fn hour_window(
    now: DateTime<Utc>,
    hours: u32,
    operation: &'static str,
) -> StoreResult<(DateTime<Utc>, DateTime<Utc>)> {
    if hours == 0 {
        return Err(StoreError::query(operation, "window must span >= 1 hour"));
    }
    let current_hour = now
        .duration_trunc(chrono::Duration::hours(1))
        .map_err(|err| StoreError::query(operation, err.to_string()))?;
    Ok((
        current_hour - chrono::Duration::hours(i64::from(hours) - 1),
        current_hour + chrono::Duration::hours(1),
    ))
}

fn window_filter(start: DateTime<Utc>, end: DateTime<Utc>) -> Filter {
    Filter::gte("timestamp", format_timestamp(start))
        .and(Filter::lt("timestamp", format_timestamp(end)))
}

fn decode_all(documents: Vec<Document>) -> StoreResult<Vec<SensorReading>> {
    documents.into_iter().map(decode_reading).collect()
}

fn row_key(row: &Document) -> String {
    row.get("_id").map(bson_key).unwrap_or_else(|| "null".to_string())
}

fn row_str(row: &Document, field: &str) -> String {
    row.get(field).map(bson_key).unwrap_or_else(|| "null".to_string())
}

fn row_f64(row: &Document, field: &str, operation: &'static str) -> StoreResult<f64> {
    row.get(field).and_then(bson_f64).ok_or_else(|| {
        StoreError::query(
            operation,
            format!("group {:?} has no numeric {field}", row_key(row)),
        )
    })
}

fn row_u64(row: &Document, field: &str, operation: &'static str) -> StoreResult<u64> {
    row.get(field).and_then(bson_u64).ok_or_else(|| {
        StoreError::query(
            operation,
            format!("group {:?} has no count in {field}", row_key(row)),
        )
    })
}

fn row_timestamp(row: &Document, field: &str) -> StoreResult<DateTime<Utc>> {
    let raw = row.get_str(field).map_err(|err| {
        StoreError::query("device_activity", format!("{field}: {err}"))
    })?;
    parse_timestamp(raw)
        .map_err(|err| StoreError::query("device_activity", format!("{field} {raw:?}: {err}")))
}
