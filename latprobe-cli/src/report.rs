use latprobe_common::{HistogramBucket, PayloadBucket, RunAnalytics};
use std::fmt::Write;

const BAR_WIDTH: usize = 40;
const LABEL_WIDTH: usize = 40;

/// Render the human-readable report for a finished run.
pub fn render_report(analytics: &RunAnalytics) -> String {
    let mut out = String::new();
    writeln!(out, "Latprobe Results").ok();
    writeln!(out, "================").ok();
    writeln!(out, "Run:       {}", analytics.run_id).ok();
    writeln!(out, "Status:    {}", analytics.status).ok();
    writeln!(out, "Samples:   {}", format_thousands(analytics.sample_count)).ok();
    writeln!(out).ok();

    writeln!(
        out,
        "{:<LABEL_WIDTH$} {:<6} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>8} {:>7} {:>9}",
        "Endpoint", "Method", "p50", "p95", "p99", "min", "max", "avg", "stddev", "errors", "payload"
    )
    .ok();
    for row in &analytics.summary {
        writeln!(
            out,
            "{:<LABEL_WIDTH$} {:<6} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>8} {:>6.2}% {:>9}",
            truncate(&row.endpoint_url, LABEL_WIDTH),
            row.method.as_str(),
            format_ms(row.p50),
            format_ms(row.p95),
            format_ms(row.p99),
            format_ms(row.min),
            format_ms(row.max),
            format_ms(row.avg),
            format_ms(row.std_dev),
            row.error_rate,
            format_bytes(row.avg_payload_size),
        )
        .ok();
    }

    if !analytics.payload_buckets.is_empty() {
        writeln!(out).ok();
        writeln!(out, "POST latency by payload size").ok();
        out.push_str(&render_payload_buckets(&analytics.payload_buckets));
    }

    writeln!(out).ok();
    writeln!(out, "Latency distribution").ok();
    out.push_str(&render_histogram(&analytics.histogram));
    out
}

pub fn render_payload_buckets(buckets: &[PayloadBucket]) -> String {
    let mut out = String::new();
    for bucket in buckets {
        writeln!(
            out,
            "  {:<10} p95 {:>9}  ({} requests)",
            bucket.label,
            format_ms(bucket.p95),
            bucket.count
        )
        .ok();
    }
    out
}

/// One bar per bucket, scaled so the fullest bucket spans the whole width.
pub fn render_histogram(buckets: &[HistogramBucket]) -> String {
    let peak = buckets.iter().map(|b| b.count).max().unwrap_or(0);
    let mut out = String::new();
    for bucket in buckets {
        let width = if peak == 0 {
            0
        } else {
            ((bucket.count as f64 / peak as f64) * BAR_WIDTH as f64).round() as usize
        };
        writeln!(out, "  {:<10} {:<BAR_WIDTH$} {}", bucket.label, "#".repeat(width), bucket.count).ok();
    }
    out
}

/// Milliseconds with adaptive precision: `0.42ms`, `12.3ms`, `1.25s`.
pub fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else if ms >= 10.0 {
        format!("{:.1}ms", ms)
    } else {
        format!("{:.2}ms", ms)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes}B")
    }
}

pub fn format_thousands(n: u64) -> String {
    if n >= 1_000_000 {
        format!("~{}M", n / 1_000_000)
    } else if n >= 1_000 {
        format!("~{}K", n / 1_000)
    } else {
        n.to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}
