use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire format for reading timestamps: RFC 3339, microseconds, explicit `+00:00` offset.
/// Fixed width so lexical order matches chronological order inside the store.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f+00:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Interior,
    Exterior,
}

impl SensorKind {
    pub const ALL: [SensorKind; 2] = [SensorKind::Interior, SensorKind::Exterior];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Interior => "interior",
            SensorKind::Exterior => "exterior",
        }
    }

    /// Unit a well-formed reading of this kind carries.
    pub fn native_unit(self) -> Unit {
        match self {
            SensorKind::Interior => Unit::Celsius,
            SensorKind::Exterior => Unit::Fahrenheit,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "C")]
    Celsius,
    #[serde(rename = "F")]
    Fahrenheit,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Celsius => "C",
            Unit::Fahrenheit => "F",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteriorReading {
    pub device_id: String,
    pub location: String,
    pub unit: Unit,
    #[serde(with = "timestamp_micros")]
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: i32,
    pub light: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExteriorReading {
    pub device_id: String,
    pub location: String,
    pub unit: Unit,
    #[serde(with = "timestamp_micros")]
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub light: i32,
    pub uv_index: f64,
}

/// One sensor observation. The `type` discriminant decides the field set; interior-only
/// and exterior-only fields never appear together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SensorReading {
    Interior(InteriorReading),
    Exterior(ExteriorReading),
}

impl SensorReading {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorReading::Interior(_) => SensorKind::Interior,
            SensorReading::Exterior(_) => SensorKind::Exterior,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            SensorReading::Interior(r) => &r.device_id,
            SensorReading::Exterior(r) => &r.device_id,
        }
    }

    pub fn location(&self) -> &str {
        match self {
            SensorReading::Interior(r) => &r.location,
            SensorReading::Exterior(r) => &r.location,
        }
    }

    pub fn unit(&self) -> Unit {
        match self {
            SensorReading::Interior(r) => r.unit,
            SensorReading::Exterior(r) => r.unit,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SensorReading::Interior(r) => r.timestamp,
            SensorReading::Exterior(r) => r.timestamp,
        }
    }

    /// Temperature as measured, in `unit()`.
    pub fn temperature(&self) -> f64 {
        match self {
            SensorReading::Interior(r) => r.temperature,
            SensorReading::Exterior(r) => r.temperature,
        }
    }

    pub fn celsius(&self) -> f64 {
        normalize_celsius(self.temperature(), self.unit())
    }

    /// Replaces the unit tag without converting the value. Only meant for exercising
    /// mismatched-unit documents.
    pub fn with_unit(mut self, unit: Unit) -> Self {
        match &mut self {
            SensorReading::Interior(r) => r.unit = unit,
            SensorReading::Exterior(r) => r.unit = unit,
        }
        self
    }
}

/// Converts a temperature to Celsius. Operation order matches the store-side expression so
/// both paths produce bit-identical values.
pub fn normalize_celsius(value: f64, unit: Unit) -> f64 {
    match unit {
        Unit::Celsius => value,
        Unit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.trunc_subsecs(6).format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw.trim()).map(|dt| dt.with_timezone(&Utc))
}

pub(crate) mod timestamp_micros {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_timestamp(*ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn interior(temperature: f64) -> SensorReading {
        SensorReading::Interior(InteriorReading {
            device_id: "sensor_01".to_string(),
            location: "Sala 1".to_string(),
            unit: Unit::Celsius,
            timestamp: Utc.with_ymd_and_hms(2026, 10, 17, 10, 5, 0).unwrap(),
            temperature,
            humidity: 45,
            light: 300,
        })
    }

    fn exterior(temperature: f64) -> SensorReading {
        SensorReading::Exterior(ExteriorReading {
            device_id: "sensor_02".to_string(),
            location: "Patio".to_string(),
            unit: Unit::Fahrenheit,
            timestamp: Utc.with_ymd_and_hms(2026, 10, 17, 10, 5, 0).unwrap(),
            temperature,
            light: 800,
            uv_index: 6.5,
        })
    }

    #[test]
    fn celsius_readings_normalize_to_themselves() {
        for value in [-12.5, 0.0, 18.3, 27.9] {
            assert_eq!(interior(value).celsius(), value);
        }
    }

    #[test]
    fn fahrenheit_anchor_points_convert_exactly() {
        assert_eq!(exterior(32.0).celsius(), 0.0);
        assert_eq!(exterior(212.0).celsius(), 100.0);
        assert!((exterior(95.0).celsius() - 35.0).abs() < 1e-9);
    }

    #[test]
    fn unit_override_drives_normalization() {
        let reading = interior(212.0).with_unit(Unit::Fahrenheit);
        assert_eq!(reading.kind(), SensorKind::Interior);
        assert_eq!(reading.celsius(), 100.0);
    }

    #[test]
    fn serialized_shape_is_tagged_and_disjoint() {
        let value = serde_json::to_value(interior(21.5)).unwrap();
        assert_eq!(value["type"], "interior");
        assert_eq!(value["unit"], "C");
        assert_eq!(value["humidity"], 45);
        assert!(value.get("uv_index").is_none());

        let value = serde_json::to_value(exterior(80.0)).unwrap();
        assert_eq!(value["type"], "exterior");
        assert_eq!(value["unit"], "F");
        assert_eq!(value["uv_index"], 6.5);
        assert!(value.get("humidity").is_none());
    }

    #[test]
    fn timestamps_carry_offset_and_microseconds() {
        let ts = Utc
            .with_ymd_and_hms(2026, 10, 17, 9, 0, 1)
            .unwrap()
            .checked_add_signed(chrono::Duration::nanoseconds(123_456_789))
            .unwrap();
        let formatted = format_timestamp(ts);
        assert_eq!(formatted, "2026-10-17T09:00:01.123456+00:00");
        let parsed = parse_timestamp(&formatted).unwrap();
        assert_eq!(parsed.timestamp_subsec_micros(), 123_456);
    }

    #[test]
    fn exterior_document_without_uv_index_is_rejected() {
        let raw = serde_json::json!({
            "type": "exterior",
            "device_id": "sensor_02",
            "location": "Patio",
            "unit": "F",
            "timestamp": "2026-10-17T10:05:00.000000+00:00",
            "temperature": 70.0,
            "light": 500,
        });
        assert!(serde_json::from_value::<SensorReading>(raw).is_err());
    }
}
