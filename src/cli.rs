use crate::query::OutlierField;
use crate::reading::SensorKind;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sensor-bench",
    version,
    about = "Synthetic IoT readings into MongoDB, with query analytics and store benchmarks"
)]
pub struct Cli {
    /// Run against an in-process store instead of MongoDB (nothing is persisted).
    #[arg(long, global = true, default_value_t = false)]
    pub memory: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check connectivity and report databases, collection and document count.
    Ping,
    /// Generate and store one reading per interval until interrupted.
    Send(SendArgs),
    /// Print stored readings, newest first.
    Query(QueryArgs),
    /// Grouped temperatures, counts, hourly averages and outliers.
    Analyze(AnalyzeArgs),
    /// Insertion and query latency benchmark.
    Bench(BenchArgs),
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Seconds between readings (defaults to SENSOR_BENCH_SEND_INTERVAL_SECS).
    #[arg(long)]
    pub interval_secs: Option<u64>,
    /// Stop after this many readings.
    #[arg(long)]
    pub max_readings: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Interior,
    Exterior,
}

impl From<KindArg> for SensorKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Interior => SensorKind::Interior,
            KindArg::Exterior => SensorKind::Exterior,
        }
    }
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[arg(long)]
    pub limit: Option<u32>,
    #[arg(long = "type", value_enum)]
    pub kind: Option<KindArg>,
    #[arg(long, conflicts_with = "kind")]
    pub location: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FieldArg {
    Temperature,
    Humidity,
    Light,
}

impl From<FieldArg> for OutlierField {
    fn from(value: FieldArg) -> Self {
        match value {
            FieldArg::Temperature => OutlierField::Temperature,
            FieldArg::Humidity => OutlierField::Humidity,
            FieldArg::Light => OutlierField::Light,
        }
    }
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// z-score above which a reading is an outlier.
    #[arg(long)]
    pub threshold: Option<f64>,
    /// Reading field scored by the outlier scan.
    #[arg(long, value_enum, default_value_t = FieldArg::Temperature)]
    pub field: FieldArg,
    #[arg(long, default_value_t = 24)]
    pub hours: u32,
    /// Split the hourly averages by sensor type.
    #[arg(long)]
    pub by_type: bool,
    /// Only scan the newest N readings for outliers.
    #[arg(long)]
    pub window: Option<u32>,
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    #[arg(long)]
    pub inserts: Option<usize>,
    /// Also run a concurrent insertion pass with this many inserts in flight.
    #[arg(long, default_value_t = 1)]
    pub concurrency: usize,
    /// Sustained-throughput window in seconds; 0 skips it.
    #[arg(long)]
    pub throughput_secs: Option<u64>,
    /// Markdown report path.
    #[arg(long)]
    pub report: Option<PathBuf>,
    /// JSON summary path.
    #[arg(long)]
    pub json: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_flag_is_global() {
        let cli = Cli::try_parse_from(["sensor-bench", "send", "--memory", "--max-readings", "3"])
            .unwrap();
        assert!(cli.memory);
        match cli.command {
            Command::Send(args) => assert_eq!(args.max_readings, Some(3)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn type_and_location_are_exclusive() {
        assert!(Cli::try_parse_from([
            "sensor-bench",
            "query",
            "--type",
            "interior",
            "--location",
            "Patio"
        ])
        .is_err());
        let cli = Cli::try_parse_from(["sensor-bench", "query", "--type", "exterior"]).unwrap();
        match cli.command {
            Command::Query(args) => {
                assert_eq!(args.kind.map(SensorKind::from), Some(SensorKind::Exterior))
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn analyze_defaults_to_temperature_outliers() {
        let cli = Cli::try_parse_from(["sensor-bench", "analyze"]).unwrap();
        match cli.command {
            Command::Analyze(args) => {
                assert_eq!(OutlierField::from(args.field), OutlierField::Temperature);
                assert!(!args.by_type);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["sensor-bench", "analyze", "--field", "humidity", "--by-type"])
            .unwrap();
        match cli.command {
            Command::Analyze(args) => {
                assert_eq!(OutlierField::from(args.field), OutlierField::Humidity);
                assert!(args.by_type);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["sensor-bench", "analyze", "--field", "uv"]).is_err());
    }
}
