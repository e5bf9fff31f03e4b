//! Percentile engine: pure statistics over latency samples.
//!
//! Nothing here touches the store or the clock, so the same sample set always
//! yields the same analytics regardless of the order samples arrive in.

use latprobe_common::{
    AnalyticsResult, HistogramBucket, HttpMethod, PayloadBucket, Run, RunAnalytics, Sample,
};
use std::collections::HashMap;

/// Percentiles reported per endpoint group.
pub const SUMMARY_PERCENTILES: [f64; 3] = [50.0, 95.0, 99.0];

/// Request-size ranges in bytes: `[min, max)`, last one open-ended.
const PAYLOAD_RANGES: [(u64, Option<u64>, &str); 5] = [
    (0, Some(100), "0-100B"),
    (100, Some(500), "100-500B"),
    (500, Some(1000), "500B-1KB"),
    (1000, Some(5000), "1-5KB"),
    (5000, None, "5KB+"),
];

/// Latency ranges in milliseconds: `[min, max)`, last one open-ended.
const HISTOGRAM_RANGES: [(f64, Option<f64>, &str); 6] = [
    (0.0, Some(50.0), "0-50ms"),
    (50.0, Some(100.0), "50-100ms"),
    (100.0, Some(200.0), "100-200ms"),
    (200.0, Some(500.0), "200-500ms"),
    (500.0, Some(1000.0), "500ms-1s"),
    (1000.0, None, "1s+"),
];

/// Compute each target percentile (0..=100) by linear interpolation between
/// the two closest ranks. Returns `(target, value)` pairs in target order;
/// every value is 0 for an empty input.
pub fn compute_percentiles(samples: &[f64], targets: &[f64]) -> Vec<(f64, f64)> {
    if samples.is_empty() {
        return targets.iter().map(|&p| (p, 0.0)).collect();
    }
    let sorted = sorted_ascending(samples);
    targets.iter().map(|&p| (p, interpolate(&sorted, p))).collect()
}

/// Single-percentile convenience over [`compute_percentiles`].
pub fn percentile(samples: &[f64], target: f64) -> f64 {
    compute_percentiles(samples, &[target])
        .first()
        .map(|&(_, value)| value)
        .unwrap_or(0.0)
}

/// Population standard deviation (divides by `n`). 0 for fewer than two samples.
pub fn compute_std_dev(samples: &[f64], mean: f64) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let variance =
        samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt()
}

/// Per `(endpoint, method)` statistics, slowest p95 first.
///
/// Groups keep first-seen order before the sort, and the sort is stable, so
/// groups with equal p95 come out in the order they were first probed.
pub fn compute_summary(samples: &[Sample]) -> Vec<AnalyticsResult> {
    let mut results: Vec<AnalyticsResult> = group_by_endpoint(samples)
        .into_iter()
        .map(|((endpoint_url, method), group)| summarize_group(endpoint_url, method, &group))
        .collect();
    results.sort_by(|a, b| b.p95.total_cmp(&a.p95));
    results
}

/// p95 latency per request-size range for samples of `method`. Empty ranges
/// are omitted; the rest keep ascending range order.
pub fn compute_payload_buckets(samples: &[Sample], method: HttpMethod) -> Vec<PayloadBucket> {
    PAYLOAD_RANGES
        .iter()
        .filter_map(|&(min_bytes, max_bytes, label)| {
            let latencies: Vec<f64> = samples
                .iter()
                .filter(|s| s.method == method)
                .filter(|s| {
                    s.request_size_bytes >= min_bytes
                        && max_bytes.map_or(true, |max| s.request_size_bytes < max)
                })
                .map(|s| s.latency_ms)
                .collect();
            if latencies.is_empty() {
                return None;
            }
            Some(PayloadBucket {
                label: label.to_string(),
                min_bytes,
                max_bytes,
                p95: percentile(&latencies, 95.0),
                count: latencies.len() as u64,
            })
        })
        .collect()
}

/// Latency counts for all six fixed ranges, ascending, zero counts included.
pub fn compute_histogram(samples: &[Sample]) -> Vec<HistogramBucket> {
    let mut counts = [0u64; HISTOGRAM_RANGES.len()];
    for sample in samples {
        counts[histogram_bucket_index(sample.latency_ms)] += 1;
    }
    HISTOGRAM_RANGES
        .iter()
        .zip(counts)
        .map(|(&(min_ms, max_ms, label), count)| HistogramBucket {
            label: label.to_string(),
            min_ms,
            max_ms,
            count,
        })
        .collect()
}

/// Everything the analytics endpoint reports for `run`, from the samples
/// recorded so far. Payload buckets cover POST traffic.
pub fn compute_run_analytics(run: &Run, samples: &[Sample]) -> RunAnalytics {
    RunAnalytics {
        run_id: run.id,
        status: run.status,
        sample_count: samples.len() as u64,
        summary: compute_summary(samples),
        payload_buckets: compute_payload_buckets(samples, HttpMethod::Post),
        histogram: compute_histogram(samples),
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn sorted_ascending(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

fn interpolate(sorted: &[f64], target: f64) -> f64 {
    let idx = (target.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

fn histogram_bucket_index(latency_ms: f64) -> usize {
    HISTOGRAM_RANGES
        .iter()
        .position(|&(_, max, _)| max.map_or(true, |max| latency_ms < max))
        .unwrap_or(HISTOGRAM_RANGES.len() - 1)
}

fn group_by_endpoint(samples: &[Sample]) -> Vec<((String, HttpMethod), Vec<&Sample>)> {
    let mut index: HashMap<(&str, HttpMethod), usize> = HashMap::new();
    let mut groups: Vec<((String, HttpMethod), Vec<&Sample>)> = Vec::new();
    for sample in samples {
        let key = (sample.endpoint_url.as_str(), sample.method);
        match index.get(&key) {
            Some(&i) => groups[i].1.push(sample),
            None => {
                index.insert(key, groups.len());
                groups.push(((sample.endpoint_url.clone(), sample.method), vec![sample]));
            }
        }
    }
    groups
}

fn summarize_group(endpoint_url: String, method: HttpMethod, group: &[&Sample]) -> AnalyticsResult {
    let latencies: Vec<f64> = group.iter().map(|s| s.latency_ms).collect();
    let total = latencies.len();

    let percentiles = compute_percentiles(&latencies, &SUMMARY_PERCENTILES);
    let value_at = |i: usize| percentiles.get(i).map(|&(_, v)| v).unwrap_or(0.0);

    let min = latencies.iter().copied().fold(f64::INFINITY, f64::min);
    let max = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = latencies.iter().sum::<f64>() / total as f64;
    let std_dev = compute_std_dev(&latencies, avg);

    let payload_total: u64 = group.iter().map(|s| s.request_size_bytes).sum();
    let avg_payload_size = (payload_total as f64 / total as f64).round() as u64;

    let error_count = group.iter().filter(|s| s.is_error()).count() as u64;
    let error_rate = round2(error_count as f64 / total as f64 * 100.0);
    let success_rate = round2(100.0 - error_rate);

    AnalyticsResult {
        endpoint_url,
        method,
        p50: value_at(0),
        p95: value_at(1),
        p99: value_at(2),
        min,
        max,
        avg,
        std_dev,
        avg_payload_size,
        request_count: total as u64,
        error_count,
        error_rate,
        success_rate,
    }
}
