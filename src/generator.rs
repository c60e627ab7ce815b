use crate::reading::{ExteriorReading, InteriorReading, SensorKind, SensorReading, Unit};
use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;

const INTERIOR_DEVICES: [&str; 3] = ["sensor_01", "sensor_03", "sensor_05"];
const EXTERIOR_DEVICES: [&str; 3] = ["sensor_02", "sensor_04", "sensor_06"];
const INTERIOR_LOCATIONS: [&str; 4] = ["Sala 1", "Sala 2", "Oficina A", "Oficina B"];
const EXTERIOR_LOCATIONS: [&str; 4] = ["Patio", "Jardín", "Terraza", "Entrada"];

pub const INTERIOR_TEMPERATURE_C: (f64, f64) = (18.0, 28.0);
pub const INTERIOR_HUMIDITY_PCT: (i32, i32) = (30, 70);
pub const INTERIOR_LIGHT_LUX: (i32, i32) = (100, 600);
pub const EXTERIOR_TEMPERATURE_F: (f64, f64) = (60.0, 95.0);
pub const EXTERIOR_LIGHT_LUX: (i32, i32) = (200, 1000);
pub const UV_INDEX: (f64, f64) = (0.0, 11.0);

/// Produces synthetic readings for a small fixed fleet.
///
/// Holds no state between calls: every reading is an independent draw from the supplied
/// random source, so a generator can be shared freely and restarted at any time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadingGenerator;

impl ReadingGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Draws one reading timestamped now. A `None` kind picks interior or exterior with
    /// equal probability.
    pub fn generate<R: Rng>(&self, rng: &mut R, kind: Option<SensorKind>) -> SensorReading {
        self.generate_at(rng, kind, Utc::now())
    }

    pub fn generate_at<R: Rng>(
        &self,
        rng: &mut R,
        kind: Option<SensorKind>,
        timestamp: DateTime<Utc>,
    ) -> SensorReading {
        let kind = kind.unwrap_or_else(|| {
            if rng.gen_bool(0.5) {
                SensorKind::Interior
            } else {
                SensorKind::Exterior
            }
        });
        let timestamp = timestamp.trunc_subsecs(6);

        match kind {
            SensorKind::Interior => SensorReading::Interior(InteriorReading {
                device_id: pick(rng, &INTERIOR_DEVICES),
                location: pick(rng, &INTERIOR_LOCATIONS),
                unit: Unit::Celsius,
                timestamp,
                temperature: one_decimal(
                    rng.gen_range(INTERIOR_TEMPERATURE_C.0..=INTERIOR_TEMPERATURE_C.1),
                ),
                humidity: rng.gen_range(INTERIOR_HUMIDITY_PCT.0..=INTERIOR_HUMIDITY_PCT.1),
                light: rng.gen_range(INTERIOR_LIGHT_LUX.0..=INTERIOR_LIGHT_LUX.1),
            }),
            SensorKind::Exterior => SensorReading::Exterior(ExteriorReading {
                device_id: pick(rng, &EXTERIOR_DEVICES),
                location: pick(rng, &EXTERIOR_LOCATIONS),
                unit: Unit::Fahrenheit,
                timestamp,
                temperature: one_decimal(
                    rng.gen_range(EXTERIOR_TEMPERATURE_F.0..=EXTERIOR_TEMPERATURE_F.1),
                ),
                light: rng.gen_range(EXTERIOR_LIGHT_LUX.0..=EXTERIOR_LIGHT_LUX.1),
                uv_index: one_decimal(rng.gen_range(UV_INDEX.0..=UV_INDEX.1)),
            }),
        }
    }

    pub fn generate_batch<R: Rng>(&self, rng: &mut R, count: usize) -> Vec<SensorReading> {
        (0..count).map(|_| self.generate(rng, None)).collect()
    }
}

fn pick<R: Rng>(rng: &mut R, pool: &[&str]) -> String {
    pool[rng.gen_range(0..pool.len())].to_string()
}

fn one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn is_interior_location(location: &str) -> bool {
    INTERIOR_LOCATIONS.contains(&location)
}

pub fn is_exterior_location(location: &str) -> bool {
    EXTERIOR_LOCATIONS.contains(&location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn interior_readings_stay_in_range() {
        let generator = ReadingGenerator::new();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..2_000 {
            let SensorReading::Interior(r) = generator.generate(&mut rng, Some(SensorKind::Interior))
            else {
                panic!("expected interior reading");
            };
            assert_eq!(r.unit, Unit::Celsius);
            assert!((30..=70).contains(&r.humidity), "humidity {}", r.humidity);
            assert!((100..=600).contains(&r.light));
            assert!((18.0..=28.0).contains(&r.temperature));
            assert!(is_interior_location(&r.location));
            assert!(INTERIOR_DEVICES.contains(&r.device_id.as_str()));
        }
    }

    #[test]
    fn exterior_readings_stay_in_range() {
        let generator = ReadingGenerator::new();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..2_000 {
            let SensorReading::Exterior(r) = generator.generate(&mut rng, Some(SensorKind::Exterior))
            else {
                panic!("expected exterior reading");
            };
            assert_eq!(r.unit, Unit::Fahrenheit);
            assert!((0.0..=11.0).contains(&r.uv_index), "uv {}", r.uv_index);
            assert!((200..=1000).contains(&r.light));
            assert!((60.0..=95.0).contains(&r.temperature));
            assert!(is_exterior_location(&r.location));
        }
    }

    #[test]
    fn unspecified_kind_draws_both_variants() {
        let generator = ReadingGenerator::new();
        let mut rng = StdRng::seed_from_u64(3);
        let kinds: HashSet<SensorKind> = (0..200)
            .map(|_| generator.generate(&mut rng, None).kind())
            .collect();
        assert_eq!(kinds.len(), 2);
    }

    #[test]
    fn unit_always_matches_kind() {
        let generator = ReadingGenerator::new();
        let mut rng = StdRng::seed_from_u64(5);
        for reading in generator.generate_batch(&mut rng, 500) {
            assert_eq!(reading.unit(), reading.kind().native_unit());
        }
    }

    #[test]
    fn timestamps_are_truncated_to_microseconds() {
        let generator = ReadingGenerator::new();
        let mut rng = StdRng::seed_from_u64(1);
        let reading = generator.generate(&mut rng, None);
        assert_eq!(reading.timestamp().timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn same_seed_gives_same_draws() {
        let generator = ReadingGenerator::new();
        let ts = Utc::now();
        let a = generator.generate_at(&mut StdRng::seed_from_u64(42), None, ts);
        let b = generator.generate_at(&mut StdRng::seed_from_u64(42), None, ts);
        assert_eq!(a, b);
    }
}
