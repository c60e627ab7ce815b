use super::stats::LatencyStats;
use super::{BenchmarkRun, InsertBenchmark};
use crate::error::BenchmarkAborted;

fn fmt_opt_f64(opt: Option<f64>, decimals: usize) -> String {
    opt.map(|v| format!("{v:.precision$}", precision = decimals))
        .unwrap_or_else(|| "n/a".to_string())
}

fn latency_row(label: &str, stats: Option<&LatencyStats>) -> String {
    match stats {
        Some(s) => format!(
            "| {label} | {} | {:.3} | {:.3} | {:.3} | {:.3} | {:.3} | {:.3} | {:.3} |\n",
            s.count, s.min_ms, s.max_ms, s.mean_ms, s.median_ms, s.std_dev_ms, s.p95_ms, s.p99_ms
        ),
        None => format!("| {label} | 0 | n/a | n/a | n/a | n/a | n/a | n/a | n/a |\n"),
    }
}

const LATENCY_HEADER: &str = "| Operation | n | min | max | mean | median | stdev | p95 | p99 |\n| --- | --- | --- | --- | --- | --- | --- | --- | --- |\n";

fn push_insertion(report: &mut String, insertion: &InsertBenchmark) {
    report.push_str("## Insertion latency\n\n");
    report.push_str(&format!(
        "- Attempted: `{}`\n- Succeeded: `{}`\n- Failed: `{}`\n- Total span: `{:.1}` ms\n- Throughput: `{:.2}` inserts/s\n",
        insertion.attempted,
        insertion.succeeded,
        insertion.failed,
        insertion.total_elapsed_ms,
        insertion.throughput_per_sec,
    ));
    for (kind, count) in &insertion.errors_by_kind {
        report.push_str(&format!("- `{kind}` errors: `{count}`\n"));
    }
    report.push('\n');
    report.push_str("Latencies in milliseconds; failed inserts are excluded.\n\n");
    report.push_str(LATENCY_HEADER);
    report.push_str(&latency_row("insert_one", insertion.latency.as_ref()));
}

/// Markdown summary of a completed run.
pub fn render_markdown(run: &BenchmarkRun) -> String {
    let mut report = String::new();
    report.push_str("# Sensor Store Benchmark Report\n\n");
    report.push_str("## Run metadata\n\n");
    report.push_str(&format!(
        "- Run id: `{}`\n- Started (UTC): {}\n- Finished (UTC): {}\n- Inserts: `{}`\n- Abort ratio: `{}`\n- Query repetitions: `{}`\n",
        run.run_id,
        run.started_at.to_rfc3339(),
        run.finished_at.to_rfc3339(),
        run.settings.inserts,
        run.settings.abort_failure_ratio,
        run.settings.query_repetitions,
    ));
    report.push('\n');

    push_insertion(&mut report, &run.insertion);

    report.push_str("\n## Query latency\n\n");
    report.push_str(LATENCY_HEADER);
    for timing in &run.queries.timings {
        report.push_str(&latency_row(timing.kind.as_str(), timing.latency.as_ref()));
    }
    let failures: Vec<_> = run
        .queries
        .timings
        .iter()
        .filter(|timing| timing.failed > 0)
        .collect();
    if !failures.is_empty() {
        report.push('\n');
        for timing in failures {
            report.push_str(&format!(
                "- `{}` failed {}/{}: {}\n",
                timing.kind.as_str(),
                timing.failed,
                timing.attempted,
                timing.last_error.as_deref().unwrap_or("unknown error"),
            ));
        }
    }

    if let Some(throughput) = &run.throughput {
        report.push_str("\n## Sustained throughput\n\n");
        report.push_str(&format!(
            "- Window: `{}` s\n- Inserted: `{}` (failed `{}`)\n- Rate: `{:.2}` inserts/s\n",
            throughput.window_secs, throughput.inserted, throughput.failed, throughput.per_second,
        ));
    }

    if let Some(concurrent) = &run.concurrent {
        report.push_str("\n## Concurrent insertion\n\n");
        report.push_str(&format!(
            "- Concurrency: `{}`\n- Succeeded: `{}` of `{}`\n- Aggregate throughput: `{:.2}` inserts/s\n\n",
            concurrent.concurrency,
            concurrent.succeeded,
            concurrent.attempted,
            concurrent.throughput_per_sec,
        ));
        report.push_str(LATENCY_HEADER);
        report.push_str(&latency_row("insert_one", concurrent.latency.as_ref()));
    }

    report
}

/// Markdown summary of an aborted run: the abort reason plus whatever was measured.
pub fn render_aborted(aborted: &BenchmarkAborted) -> String {
    let mut report = String::new();
    report.push_str("# Sensor Store Benchmark Report (aborted)\n\n");
    report.push_str(&format!(
        "Benchmark aborted after `{}` of `{}` inserts failed (allowed ratio `{}`).\n\n",
        aborted.failures, aborted.attempted, aborted.max_failure_ratio,
    ));
    push_insertion(&mut report, &aborted.partial);
    report
}

pub fn render_json(run: &BenchmarkRun) -> serde_json::Result<String> {
    serde_json::to_string_pretty(run)
}

pub fn summary_line(run: &BenchmarkRun) -> String {
    let latency = run.insertion.latency.as_ref();
    format!(
        "inserts {}/{} ok, p50 {} ms, p95 {} ms, {:.2} inserts/s",
        run.insertion.succeeded,
        run.insertion.attempted,
        fmt_opt_f64(latency.map(|s| s.median_ms), 2),
        fmt_opt_f64(latency.map(|s| s.p95_ms), 2),
        run.insertion.throughput_per_sec,
    )
}
