pub mod report;
pub mod stats;

use self::stats::{duration_ms, LatencyStats};
use crate::config::Config;
use crate::error::{BenchmarkAborted, StoreError, StoreResult};
use crate::generator::ReadingGenerator;
use crate::query::{ReadingQueries, DEFAULT_HOURLY_WINDOW};
use crate::reading::{format_timestamp, SensorKind};
use crate::store::{encode_reading, DocumentStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    RecentN,
    TemperatureByType,
    FilterByType,
    CountByDevice,
    HourlyAverage,
    TotalCount,
}

impl QueryKind {
    pub const ALL: [QueryKind; 6] = [
        QueryKind::RecentN,
        QueryKind::TemperatureByType,
        QueryKind::FilterByType,
        QueryKind::CountByDevice,
        QueryKind::HourlyAverage,
        QueryKind::TotalCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::RecentN => "recent_n",
            QueryKind::TemperatureByType => "temperature_by_type",
            QueryKind::FilterByType => "filter_by_type",
            QueryKind::CountByDevice => "count_by_device",
            QueryKind::HourlyAverage => "hourly_average",
            QueryKind::TotalCount => "total_count",
        }
    }
}

/// One timed store operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub operation: OperationKind,
    pub query: Option<QueryKind>,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub succeeded: bool,
}

impl MetricSample {
    fn new(
        operation: OperationKind,
        query: Option<QueryKind>,
        started: DateTime<Utc>,
        elapsed: Duration,
        succeeded: bool,
    ) -> Self {
        Self {
            operation,
            query,
            duration_ms: duration_ms(elapsed),
            timestamp: started,
            succeeded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkSettings {
    pub inserts: usize,
    /// Abort when `failed / attempted` is strictly greater than this.
    pub abort_failure_ratio: f64,
    pub query_repetitions: usize,
    pub recent_limit: u32,
    pub throughput_window_secs: u64,
    pub concurrency: usize,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            inserts: 100,
            abort_failure_ratio: 0.5,
            query_repetitions: 1,
            recent_limit: 10,
            throughput_window_secs: 10,
            concurrency: 1,
        }
    }
}

impl BenchmarkSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            inserts: config.bench_inserts,
            abort_failure_ratio: config.abort_failure_ratio,
            query_repetitions: config.query_repetitions,
            recent_limit: config.recent_limit,
            throughput_window_secs: config.throughput_window_secs,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertBenchmark {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Over successful inserts only.
    pub latency: Option<LatencyStats>,
    pub total_elapsed_ms: f64,
    /// Successful inserts per second over the whole insertion span.
    pub throughput_per_sec: f64,
    pub errors_by_kind: BTreeMap<String, usize>,
    #[serde(skip)]
    pub samples: Vec<MetricSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTiming {
    pub kind: QueryKind,
    pub attempted: usize,
    pub failed: usize,
    pub latency: Option<LatencyStats>,
    /// Rows (or the count, for `total_count`) returned by the last successful run.
    pub result_size: Option<usize>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryBenchmark {
    pub timings: Vec<QueryTiming>,
    #[serde(skip)]
    pub samples: Vec<MetricSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputReport {
    pub window_secs: u64,
    pub inserted: usize,
    pub failed: usize,
    pub elapsed_ms: f64,
    pub per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrentBenchmark {
    pub concurrency: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub latency: Option<LatencyStats>,
    pub total_elapsed_ms: f64,
    pub throughput_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub settings: BenchmarkSettings,
    pub insertion: InsertBenchmark,
    pub queries: QueryBenchmark,
    pub throughput: Option<ThroughputReport>,
    pub concurrent: Option<ConcurrentBenchmark>,
}

fn per_second(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Times store operations. Holds its own store handle; nothing is cached between runs.
pub struct MetricsEngine<S> {
    store: S,
    queries: ReadingQueries<S>,
    generator: ReadingGenerator,
    settings: BenchmarkSettings,
}

impl<S: DocumentStore + Clone> MetricsEngine<S> {
    pub fn new(store: S, settings: BenchmarkSettings) -> Self {
        Self {
            queries: ReadingQueries::new(store.clone()),
            store,
            generator: ReadingGenerator::new(),
            settings,
        }
    }

    /// Sequential inserts of freshly generated readings. Documents are generated and
    /// encoded before the clock starts; each sample covers one `insert_one` call.
    pub async fn insertion_benchmark<R: Rng>(
        &self,
        rng: &mut R,
    ) -> Result<InsertBenchmark, BenchmarkAborted> {
        let readings = self.generator.generate_batch(rng, self.settings.inserts);
        let documents: Vec<_> = readings.iter().map(encode_reading).collect();

        let mut samples = Vec::with_capacity(documents.len());
        let mut latencies = Vec::with_capacity(documents.len());
        let mut errors_by_kind: BTreeMap<String, usize> = BTreeMap::new();
        let mut failed = 0_usize;

        let span = Instant::now();
        for (index, (reading, document)) in readings.iter().zip(documents).enumerate() {
            let started_at = Utc::now();
            let started = Instant::now();
            let result = match document {
                Ok(document) => self.store.insert_one(document).await,
                Err(err) => Err(err),
            };
            let elapsed = started.elapsed();
            let succeeded = result.is_ok();
            samples.push(MetricSample::new(
                OperationKind::Insert,
                None,
                started_at,
                elapsed,
                succeeded,
            ));
            match result {
                Ok(_) => latencies.push(elapsed),
                Err(err) => {
                    failed += 1;
                    *errors_by_kind.entry(err.kind().to_string()).or_insert(0) += 1;
                    tracing::warn!(
                        index,
                        device = %reading.device_id(),
                        kind = %reading.kind(),
                        timestamp = %format_timestamp(reading.timestamp()),
                        operation = err.operation(),
                        error_kind = err.kind(),
                        error = %err,
                        "benchmark insert failed"
                    );
                }
            }
        }
        let total_elapsed = span.elapsed();

        let attempted = samples.len();
        let succeeded = attempted - failed;
        let result = InsertBenchmark {
            attempted,
            succeeded,
            failed,
            latency: LatencyStats::from_durations(&latencies),
            total_elapsed_ms: duration_ms(total_elapsed),
            throughput_per_sec: per_second(succeeded, total_elapsed),
            errors_by_kind,
            samples,
        };

        let ratio = if attempted == 0 {
            0.0
        } else {
            failed as f64 / attempted as f64
        };
        if ratio > self.settings.abort_failure_ratio {
            tracing::error!(
                failed,
                attempted,
                max_failure_ratio = self.settings.abort_failure_ratio,
                "insertion benchmark aborted"
            );
            return Err(BenchmarkAborted {
                failures: failed,
                attempted,
                max_failure_ratio: self.settings.abort_failure_ratio,
                partial: Box::new(result),
            });
        }

        tracing::info!(
            attempted,
            succeeded,
            failed,
            elapsed_ms = result.total_elapsed_ms,
            throughput = result.throughput_per_sec,
            "insertion benchmark complete"
        );
        Ok(result)
    }

    /// Times each query kind separately. A failing kind is recorded, never dropped.
    pub async fn query_benchmark(&self) -> QueryBenchmark {
        let repetitions = self.settings.query_repetitions.max(1);
        let mut timings = Vec::with_capacity(QueryKind::ALL.len());
        let mut samples = Vec::with_capacity(QueryKind::ALL.len() * repetitions);

        for kind in QueryKind::ALL {
            let mut latencies = Vec::with_capacity(repetitions);
            let mut failed = 0_usize;
            let mut result_size = None;
            let mut last_error = None;

            for _ in 0..repetitions {
                let started_at = Utc::now();
                let started = Instant::now();
                let result = self.run_query(kind).await;
                let elapsed = started.elapsed();
                samples.push(MetricSample::new(
                    OperationKind::Query,
                    Some(kind),
                    started_at,
                    elapsed,
                    result.is_ok(),
                ));
                match result {
                    Ok(size) => {
                        latencies.push(elapsed);
                        result_size = Some(size);
                    }
                    Err(err) => {
                        failed += 1;
                        tracing::warn!(query = kind.as_str(), error = %err, "benchmark query failed");
                        last_error = Some(err.to_string());
                    }
                }
            }

            timings.push(QueryTiming {
                kind,
                attempted: repetitions,
                failed,
                latency: LatencyStats::from_durations(&latencies),
                result_size,
                last_error,
            });
        }

        QueryBenchmark { timings, samples }
    }

    async fn run_query(&self, kind: QueryKind) -> StoreResult<usize> {
        match kind {
            QueryKind::RecentN => self
                .queries
                .recent(self.settings.recent_limit)
                .await
                .map(|rows| rows.len()),
            QueryKind::TemperatureByType => self
                .queries
                .temperature_by_type()
                .await
                .map(|rows| rows.len()),
            QueryKind::FilterByType => self
                .queries
                .by_type(SensorKind::Exterior, None)
                .await
                .map(|rows| rows.len()),
            QueryKind::CountByDevice => self
                .queries
                .count_by_device()
                .await
                .map(|rows| rows.len()),
            QueryKind::HourlyAverage => self
                .queries
                .hourly_average(Utc::now(), DEFAULT_HOURLY_WINDOW)
                .await
                .map(|rows| rows.len()),
            QueryKind::TotalCount => {
                let count = self.queries.total_count().await?;
                usize::try_from(count)
                    .map_err(|err| StoreError::query("count", err.to_string()))
            }
        }
    }

    /// Inserts freshly generated readings back to back until `window` has elapsed.
    pub async fn sustained_throughput<R: Rng>(
        &self,
        rng: &mut R,
        window: Duration,
    ) -> ThroughputReport {
        let mut inserted = 0_usize;
        let mut failed = 0_usize;
        let started = Instant::now();
        while started.elapsed() < window {
            let reading = self.generator.generate(rng, None);
            match self.store.insert_reading(&reading).await {
                Ok(_) => inserted += 1,
                Err(err) => {
                    failed += 1;
                    tracing::debug!(error = %err, "throughput insert failed");
                }
            }
        }
        let elapsed = started.elapsed();
        let report = ThroughputReport {
            window_secs: window.as_secs(),
            inserted,
            failed,
            elapsed_ms: duration_ms(elapsed),
            per_second: per_second(inserted, elapsed),
        };
        tracing::info!(
            inserted,
            failed,
            per_second = report.per_second,
            "sustained throughput window complete"
        );
        report
    }

    /// `count` inserts with at most `concurrency` in flight. Per-operation latency is
    /// measured around each call; throughput over the whole span.
    pub async fn concurrent_insertion_benchmark<R: Rng>(
        &self,
        rng: &mut R,
        count: usize,
        concurrency: usize,
    ) -> ConcurrentBenchmark {
        let concurrency = concurrency.max(1);
        let documents: Vec<_> = self
            .generator
            .generate_batch(rng, count)
            .iter()
            .map(encode_reading)
            .collect();

        let span = Instant::now();
        let results: Vec<(StoreResult<String>, Duration)> = stream::iter(documents)
            .map(|document| {
                let store = &self.store;
                async move {
                    let started = Instant::now();
                    let result = match document {
                        Ok(document) => store.insert_one(document).await,
                        Err(err) => Err(err),
                    };
                    (result, started.elapsed())
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        let total_elapsed = span.elapsed();

        let latencies: Vec<Duration> = results
            .iter()
            .filter(|(result, _)| result.is_ok())
            .map(|(_, elapsed)| *elapsed)
            .collect();
        let succeeded = latencies.len();
        ConcurrentBenchmark {
            concurrency,
            attempted: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            latency: LatencyStats::from_durations(&latencies),
            total_elapsed_ms: duration_ms(total_elapsed),
            throughput_per_sec: per_second(succeeded, total_elapsed),
        }
    }

    /// Insertion benchmark, then per-kind queries over the data it wrote, then the optional
    /// throughput window and concurrent run.
    pub async fn run<R: Rng>(&self, rng: &mut R) -> Result<BenchmarkRun, BenchmarkAborted> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(%run_id, inserts = self.settings.inserts, "benchmark run started");

        let insertion = self.insertion_benchmark(rng).await?;
        let queries = self.query_benchmark().await;
        let throughput = if self.settings.throughput_window_secs > 0 {
            Some(
                self.sustained_throughput(
                    rng,
                    Duration::from_secs(self.settings.throughput_window_secs),
                )
                .await,
            )
        } else {
            None
        };
        let concurrent = if self.settings.concurrency > 1 {
            Some(
                self.concurrent_insertion_benchmark(
                    rng,
                    self.settings.inserts,
                    self.settings.concurrency,
                )
                .await,
            )
        } else {
            None
        };

        Ok(BenchmarkRun {
            run_id,
            started_at,
            finished_at: Utc::now(),
            settings: self.settings.clone(),
            insertion,
            queries,
            throughput,
            concurrent,
        })
    }
}
