use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sensor_bench::cli::{AnalyzeArgs, BenchArgs, Cli, Command, QueryArgs, SendArgs};
use sensor_bench::config::Config;
use sensor_bench::ingest::{IngestionService, RetryPolicy};
use sensor_bench::metrics::report::{render_aborted, render_json, render_markdown, summary_line};
use sensor_bench::metrics::{BenchmarkSettings, MetricsEngine};
use sensor_bench::query::ReadingQueries;
use sensor_bench::reading::{format_timestamp, SensorReading};
use sensor_bench::store::{DocumentStore, MemoryStore, MongoStore};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_bench=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sensor-bench"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = if cli.memory {
        Config::from_env_offline()?
    } else {
        Config::from_env()?
    };
    init_tracing(&config)?;

    if cli.memory {
        tracing::info!("using in-process store; nothing will be persisted");
        let store = MemoryStore::new();
        if let Command::Ping = cli.command {
            println!("in-process store: {} documents", store.len());
            return Ok(());
        }
        return dispatch(cli.command, &config, store).await;
    }

    tracing::info!(
        uri = %config.redacted_connection_string(),
        database = %config.database,
        collection = %config.collection,
        "connecting to MongoDB"
    );
    let store = MongoStore::connect(&config.store_config())
        .await
        .context("failed to connect to MongoDB")?;
    if let Err(err) = store.ensure_indexes().await {
        tracing::warn!(error = %err, "failed to ensure timestamp index");
    }

    let result = match cli.command {
        Command::Ping => ping(&store, &config).await,
        command => dispatch(command, &config, store.clone()).await,
    };
    store.shutdown().await;
    result
}

async fn ping(store: &MongoStore, config: &Config) -> Result<()> {
    let overview = store.server_overview().await?;
    println!("connected: {}", config.redacted_connection_string());
    println!("databases: {}", overview.databases.join(", "));
    println!(
        "collection {}.{}: {} ({} documents)",
        config.database,
        config.collection,
        if overview.collection_exists {
            "present"
        } else {
            "missing"
        },
        overview.documents
    );
    Ok(())
}

async fn dispatch<S>(command: Command, config: &Config, store: S) -> Result<()>
where
    S: DocumentStore + Clone + 'static,
{
    match command {
        Command::Ping => Ok(()),
        Command::Send(args) => send(args, config, store).await,
        Command::Query(args) => query(args, config, store).await,
        Command::Analyze(args) => analyze(args, config, store).await,
        Command::Bench(args) => bench(args, config, store).await,
    }
}

async fn send<S: DocumentStore>(args: SendArgs, config: &Config, store: S) -> Result<()> {
    let interval = args
        .interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.send_interval());
    let retry = RetryPolicy {
        max_retries: config.max_retries,
        base_delay: config.retry_base(),
        max_delay: config.retry_max(),
    };
    let service = IngestionService::new(store, interval, retry);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received; finishing current send");
            signal_cancel.cancel();
        }
    });

    let summary = service.run(cancel, args.max_readings).await;
    println!(
        "sent {} of {} readings ({} failed)",
        summary.sent, summary.cycles, summary.failed
    );
    Ok(())
}

fn describe(reading: &SensorReading) -> String {
    let common = format!(
        "{} {:<9} {:<8} {:<10} {:>6.1} {}",
        format_timestamp(reading.timestamp()),
        reading.device_id(),
        reading.kind(),
        reading.location(),
        reading.temperature(),
        reading.unit().symbol(),
    );
    match reading {
        SensorReading::Interior(r) => {
            format!("{common}  humidity {}%  light {} lux", r.humidity, r.light)
        }
        SensorReading::Exterior(r) => {
            format!("{common}  light {} lux  uv {:.1}", r.light, r.uv_index)
        }
    }
}

async fn query<S: DocumentStore>(args: QueryArgs, config: &Config, store: S) -> Result<()> {
    let queries = ReadingQueries::new(store);
    let limit = args.limit.unwrap_or(config.recent_limit);
    let readings = match (args.kind, args.location.as_deref()) {
        (Some(kind), _) => queries.by_type(kind.into(), Some(limit)).await?,
        (None, Some(location)) => queries.by_location(location, Some(limit)).await?,
        (None, None) => queries.recent(limit).await?,
    };
    if readings.is_empty() {
        println!("no readings");
    }
    for reading in &readings {
        println!("{}", describe(reading));
    }
    Ok(())
}

async fn analyze<S: DocumentStore>(args: AnalyzeArgs, config: &Config, store: S) -> Result<()> {
    let queries = ReadingQueries::new(store);
    let threshold = args.threshold.unwrap_or(config.outlier_threshold);

    println!("total readings: {}", queries.total_count().await?);

    println!("\ntemperature by type (°C)");
    for summary in queries.temperature_by_type().await? {
        println!(
            "  {:<8} avg {:>6.2}  min {:>6.2}  max {:>6.2}  ({} readings)",
            summary.sensor_type,
            summary.average_celsius,
            summary.min_celsius,
            summary.max_celsius,
            summary.readings
        );
    }

    println!("\nreadings per device");
    for activity in queries.device_activity().await? {
        println!(
            "  {:<9} {:<8} {:<10} {:>5}  {} .. {}",
            activity.device_id,
            activity.sensor_type,
            activity.location,
            activity.readings,
            format_timestamp(activity.first_reading),
            format_timestamp(activity.last_reading),
        );
    }

    println!("\nreadings per location");
    for count in queries.count_by_location().await? {
        println!("  {:<10} {:>5}", count.key, count.count);
    }

    println!("\nhourly average (°C), last {} hours", args.hours);
    if args.by_type {
        for cell in queries.hourly_average_by_type(Utc::now(), args.hours).await? {
            let average = cell
                .average_celsius
                .map(|v| format!("{v:.2}"))
                .unwrap_or_else(|| "no data".to_string());
            println!(
                "  {}  {:<8} {:>7}  ({} readings)",
                cell.hour_start.format("%Y-%m-%d %H:00"),
                cell.sensor_type,
                average,
                cell.readings
            );
        }
    } else {
        for bucket in queries.hourly_average(Utc::now(), args.hours).await? {
            let average = bucket
                .average_celsius
                .map(|v| format!("{v:.2}"))
                .unwrap_or_else(|| "no data".to_string());
            println!(
                "  {}  {:>7}  ({} readings)",
                bucket.hour_start.format("%Y-%m-%d %H:00"),
                average,
                bucket.readings
            );
        }
    }

    let report = queries
        .outliers(args.field.into(), threshold, args.window)
        .await?;
    let unit = report.field.unit_label();
    println!(
        "\n{} outliers (|z| > {}): {} of {}",
        report.field.as_str(),
        report.threshold,
        report.outliers.len(),
        report.population
    );
    if let (Some(mean), Some(std_dev)) = (report.mean, report.std_dev) {
        println!("  mean {mean:.2} {unit}, stdev {std_dev:.2} {unit}");
    }
    for outlier in &report.outliers {
        println!(
            "  z {:>5.2}  {:>7.2} {unit}  {}",
            outlier.z_score,
            outlier.value,
            describe(&outlier.reading)
        );
    }
    Ok(())
}

async fn bench<S: DocumentStore + Clone>(args: BenchArgs, config: &Config, store: S) -> Result<()> {
    let mut settings = BenchmarkSettings::from_config(config);
    if let Some(inserts) = args.inserts {
        settings.inserts = inserts.max(1);
    }
    if let Some(secs) = args.throughput_secs {
        settings.throughput_window_secs = secs;
    }
    settings.concurrency = args.concurrency.max(1);

    let engine = MetricsEngine::new(store, settings);
    let mut rng = StdRng::from_entropy();
    match engine.run(&mut rng).await {
        Ok(run) => {
            println!("{}", summary_line(&run));
            let markdown = render_markdown(&run);
            match &args.report {
                Some(path) => write_report(path, &markdown)?,
                None => println!("\n{markdown}"),
            }
            if let Some(path) = &args.json {
                write_report(path, &render_json(&run)?)?;
            }
            Ok(())
        }
        Err(aborted) => {
            let markdown = render_aborted(&aborted);
            match &args.report {
                Some(path) => write_report(path, &markdown)?,
                None => println!("{markdown}"),
            }
            Err(aborted.into())
        }
    }
}

fn write_report(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    tracing::info!(path = %path.display(), "report written");
    Ok(())
}
