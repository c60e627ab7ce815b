use crate::error::{StoreError, StoreResult};
use crate::reading::{ExteriorReading, InteriorReading, SensorReading, Unit};
use crate::store::{DocumentStore, Filter, FindQuery, MemoryStore, Pipeline};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mongodb::bson::Document;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn seeded_rng() -> StdRng {
    StdRng::seed_from_u64(0x5e_45_0b_e4)
}

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, hour, minute, 0)
        .single()
        .expect("valid fixture timestamp")
}

pub fn interior(device: &str, temperature: f64, timestamp: DateTime<Utc>) -> SensorReading {
    SensorReading::Interior(InteriorReading {
        device_id: device.to_string(),
        location: "Sala 1".to_string(),
        unit: Unit::Celsius,
        timestamp,
        temperature,
        humidity: 50,
        light: 300,
    })
}

pub fn exterior(device: &str, temperature: f64, timestamp: DateTime<Utc>) -> SensorReading {
    SensorReading::Exterior(ExteriorReading {
        device_id: device.to_string(),
        location: "Patio".to_string(),
        unit: Unit::Fahrenheit,
        timestamp,
        temperature,
        light: 700,
        uv_index: 4.0,
    })
}

pub async fn seed(store: &MemoryStore, readings: &[SensorReading]) {
    for reading in readings {
        store.insert_reading(reading).await.expect("seed insert");
    }
}

type InsertFault = dyn Fn(u64) -> Option<StoreError> + Send + Sync;

/// [`MemoryStore`] wrapper whose inserts fail on demand. The fault function sees the
/// zero-based index of each insert call, retries included.
#[derive(Clone)]
pub struct FlakyStore {
    inner: MemoryStore,
    fault: Arc<InsertFault>,
    insert_calls: Arc<AtomicU64>,
    insert_delay: Duration,
}

impl FlakyStore {
    pub fn new(fault: impl Fn(u64) -> Option<StoreError> + Send + Sync + 'static) -> Self {
        Self {
            inner: MemoryStore::new(),
            fault: Arc::new(fault),
            insert_calls: Arc::new(AtomicU64::new(0)),
            insert_delay: Duration::ZERO,
        }
    }

    pub fn reliable() -> Self {
        Self::new(|_| None)
    }

    pub fn with_insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = delay;
        self
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

pub fn connection_refused() -> StoreError {
    StoreError::connection("insert_one", "connection refused")
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn insert_one(&self, document: Document) -> StoreResult<String> {
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if !self.insert_delay.is_zero() {
            tokio::time::sleep(self.insert_delay).await;
        }
        if let Some(err) = (self.fault)(call) {
            return Err(err);
        }
        self.inner.insert_one(document).await
    }

    async fn find(&self, query: &FindQuery) -> StoreResult<Vec<Document>> {
        self.inner.find(query).await
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> StoreResult<Vec<Document>> {
        self.inner.aggregate(pipeline).await
    }

    async fn count(&self, filter: &Filter) -> StoreResult<u64> {
        self.inner.count(filter).await
    }
}
