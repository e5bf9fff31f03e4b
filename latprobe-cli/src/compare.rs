//! Saved-result snapshots and the simple percentage delta between two of them.

use crate::report::format_ms;
use crate::CliError;
use latprobe_common::{AnalyticsResult, HttpMethod, RunAnalytics};
use std::fmt::Write;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub baseline: f64,
    pub current: f64,
    /// `None` when the baseline is zero.
    pub percent: Option<f64>,
}

impl Delta {
    fn new(baseline: f64, current: f64) -> Self {
        Self { baseline, current, percent: percent_delta(baseline, current) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub endpoint_url: String,
    pub method: HttpMethod,
    pub p50: Delta,
    pub p95: Delta,
    pub p99: Delta,
}

pub fn percent_delta(baseline: f64, current: f64) -> Option<f64> {
    if baseline == 0.0 {
        return None;
    }
    Some((current - baseline) / baseline * 100.0)
}

/// Pair up `(endpoint, method)` groups present in both runs, in the current
/// run's order. Groups present in only one run are skipped.
pub fn compare(baseline: &RunAnalytics, current: &RunAnalytics) -> Vec<Comparison> {
    current
        .summary
        .iter()
        .filter_map(|cur| {
            let base = find_group(&baseline.summary, cur)?;
            Some(Comparison {
                endpoint_url: cur.endpoint_url.clone(),
                method: cur.method,
                p50: Delta::new(base.p50, cur.p50),
                p95: Delta::new(base.p95, cur.p95),
                p99: Delta::new(base.p99, cur.p99),
            })
        })
        .collect()
}

fn find_group<'a>(rows: &'a [AnalyticsResult], key: &AnalyticsResult) -> Option<&'a AnalyticsResult> {
    rows.iter()
        .find(|r| r.endpoint_url == key.endpoint_url && r.method == key.method)
}

pub fn render_comparison(rows: &[Comparison]) -> String {
    let mut out = String::new();
    if rows.is_empty() {
        writeln!(out, "No endpoints in common.").ok();
        return out;
    }
    for row in rows {
        writeln!(out, "{} {}", row.method, row.endpoint_url).ok();
        for (name, delta) in [("p50", &row.p50), ("p95", &row.p95), ("p99", &row.p99)] {
            let change = match delta.percent {
                Some(p) => format!("{p:+.1}%"),
                None => "n/a".to_string(),
            };
            writeln!(
                out,
                "  {name}  {:>9} -> {:>9}  {change:>8}",
                format_ms(delta.baseline),
                format_ms(delta.current)
            )
            .ok();
        }
    }
    out
}

pub fn save_analytics(path: &Path, analytics: &RunAnalytics) -> Result<(), CliError> {
    let write_err = |reason: String| CliError::Write { path: path.display().to_string(), reason };
    let json = serde_json::to_string_pretty(analytics).map_err(|e| write_err(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| write_err(e.to_string()))
}

pub fn load_analytics(path: &Path) -> Result<RunAnalytics, CliError> {
    let read_err = |reason: String| CliError::Read { path: path.display().to_string(), reason };
    let text = std::fs::read_to_string(path).map_err(|e| read_err(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| read_err(e.to_string()))
}
