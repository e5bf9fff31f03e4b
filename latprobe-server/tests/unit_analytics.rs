use chrono::Utc;
use latprobe_common::{HttpMethod, Run, RunParameters, RunStatus, Sample};
use latprobe_server::analytics::{
    compute_histogram, compute_payload_buckets, compute_percentiles, compute_run_analytics,
    compute_std_dev, compute_summary, percentile, round2,
};
use uuid::Uuid;

const EPS: f64 = 1e-9;

fn sample(url: &str, method: HttpMethod, latency_ms: f64, status_code: u16, request_size_bytes: u64) -> Sample {
    Sample {
        run_id: Uuid::nil(),
        endpoint_url: url.to_string(),
        method,
        request_number: 1,
        latency_ms,
        request_size_bytes,
        response_size_bytes: 0,
        status_code,
        error_message: None,
        created_at: Utc::now(),
    }
}

fn get(url: &str, latency_ms: f64, status_code: u16) -> Sample {
    sample(url, HttpMethod::Get, latency_ms, status_code, 0)
}

fn post(latency_ms: f64, request_size_bytes: u64) -> Sample {
    sample("http://api/p", HttpMethod::Post, latency_ms, 200, request_size_bytes)
}

fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-6, "expected {expected}, got {actual}");
}

// --- compute_percentiles ---

#[test]
fn test_percentiles_empty_input_maps_every_target_to_zero() {
    let result = compute_percentiles(&[], &[50.0, 95.0, 99.0]);
    assert_eq!(result, vec![(50.0, 0.0), (95.0, 0.0), (99.0, 0.0)]);
}

#[test]
fn test_percentiles_single_value() {
    let result = compute_percentiles(&[42.5], &[0.0, 50.0, 99.0, 100.0]);
    for (_, value) in result {
        assert_eq!(value, 42.5);
    }
}

#[test]
fn test_percentile_zero_is_min_and_hundred_is_max() {
    let data = [37.0, 5.5, 120.0, 9.25, 64.0, 5.5, 88.0];
    assert_eq!(percentile(&data, 0.0), 5.5);
    assert_eq!(percentile(&data, 100.0), 120.0);
}

#[test]
fn test_percentiles_interpolate_between_ranks() {
    // idx = p/100 * (n-1) over [10, 20, 30]
    // p50: idx 1.0  -> 20
    // p95: idx 1.9  -> 20*0.1 + 30*0.9 = 29
    // p99: idx 1.98 -> 20*0.02 + 30*0.98 = 29.8
    let result = compute_percentiles(&[30.0, 10.0, 20.0], &[50.0, 95.0, 99.0]);
    assert_close(result[0].1, 20.0);
    assert_close(result[1].1, 29.0);
    assert_close(result[2].1, 29.8);
}

#[test]
fn test_percentiles_even_count_median_is_midpoint() {
    // [1, 2, 3, 4]: idx 1.5 -> 2.5, where nearest-rank would give 2 or 3
    assert_close(percentile(&[4.0, 1.0, 3.0, 2.0], 50.0), 2.5);
}

#[test]
fn test_percentiles_keep_target_order() {
    let result = compute_percentiles(&[1.0, 2.0, 3.0], &[99.0, 50.0]);
    assert_eq!(result[0].0, 99.0);
    assert_eq!(result[1].0, 50.0);
}

#[test]
fn test_percentiles_do_not_reorder_caller_data() {
    let data = vec![3.0, 1.0, 2.0];
    let _ = compute_percentiles(&data, &[50.0]);
    assert_eq!(data, vec![3.0, 1.0, 2.0]);
}

// --- compute_std_dev ---

#[test]
fn test_std_dev_constant_series_is_zero() {
    assert_eq!(compute_std_dev(&[10.0, 10.0, 10.0, 10.0], 10.0), 0.0);
}

#[test]
fn test_std_dev_fewer_than_two_samples_is_zero() {
    assert_eq!(compute_std_dev(&[], 0.0), 0.0);
    assert_eq!(compute_std_dev(&[7.0], 7.0), 0.0);
}

#[test]
fn test_std_dev_is_population() {
    // [2,4,4,4,5,5,7,9], mean 5: population variance 4 -> 2 (sample stddev would be ~2.138)
    let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
    assert_close(compute_std_dev(&data, 5.0), 2.0);
}

// --- compute_summary ---

#[test]
fn test_summary_three_healthy_gets() {
    let samples = vec![get("/a", 10.0, 200), get("/a", 20.0, 200), get("/a", 30.0, 200)];
    let summary = compute_summary(&samples);
    assert_eq!(summary.len(), 1);
    let a = &summary[0];
    assert_eq!(a.endpoint_url, "/a");
    assert_eq!(a.method, HttpMethod::Get);
    assert_close(a.p50, 20.0);
    assert_close(a.p95, 29.0);
    assert_close(a.p99, 29.8);
    assert_eq!(a.min, 10.0);
    assert_eq!(a.max, 30.0);
    assert_close(a.avg, 20.0);
    assert_eq!(a.request_count, 3);
    assert_eq!(a.error_count, 0);
    assert_eq!(a.error_rate, 0.0);
    assert_eq!(a.success_rate, 100.0);
}

#[test]
fn test_summary_counts_network_failures_and_http_errors() {
    let samples = vec![get("/b", 5.0, 200), get("/b", 6.0, 200), get("/b", 7.0, 500), get("/b", 8.0, 0)];
    let b = &compute_summary(&samples)[0];
    assert_eq!(b.error_count, 2);
    assert_eq!(b.error_rate, 50.0);
    assert_eq!(b.success_rate, 50.0);
}

#[test]
fn test_summary_sorted_slowest_p95_first() {
    let mut samples = Vec::new();
    for _ in 0..5 {
        samples.push(get("/fast", 80.0, 200));
        samples.push(get("/slow", 120.0, 200));
    }
    let summary = compute_summary(&samples);
    assert_eq!(summary[0].endpoint_url, "/slow");
    assert_close(summary[0].p95, 120.0);
    assert_eq!(summary[1].endpoint_url, "/fast");
    assert_close(summary[1].p95, 80.0);
}

#[test]
fn test_summary_ties_keep_first_seen_order() {
    let samples = vec![get("/x", 10.0, 200), get("/y", 10.0, 200), get("/z", 10.0, 200)];
    let urls: Vec<String> = compute_summary(&samples).into_iter().map(|r| r.endpoint_url).collect();
    assert_eq!(urls, vec!["/x", "/y", "/z"]);
}

#[test]
fn test_summary_groups_by_endpoint_and_method() {
    let samples = vec![
        sample("/r", HttpMethod::Get, 10.0, 200, 0),
        sample("/r", HttpMethod::Post, 10.0, 201, 40),
        sample("/r", HttpMethod::Get, 10.0, 200, 0),
    ];
    let summary = compute_summary(&samples);
    assert_eq!(summary.len(), 2);
    let get_group = summary.iter().find(|r| r.method == HttpMethod::Get).unwrap();
    assert_eq!(get_group.request_count, 2);
    let post_group = summary.iter().find(|r| r.method == HttpMethod::Post).unwrap();
    assert_eq!(post_group.request_count, 1);
    assert_eq!(post_group.avg_payload_size, 40);
}

#[test]
fn test_summary_avg_payload_size_is_rounded() {
    let samples = vec![post(1.0, 10), post(1.0, 11)];
    assert_eq!(compute_summary(&samples)[0].avg_payload_size, 11); // 10.5 rounds up
}

#[test]
fn test_summary_error_and_success_rates_sum_to_hundred() {
    for errors in 0..=7u16 {
        let samples: Vec<Sample> = (0..7u16)
            .map(|i| get("/r", 1.0, if i < errors { 503 } else { 200 }))
            .collect();
        let r = &compute_summary(&samples)[0];
        assert!((r.error_rate + r.success_rate - 100.0).abs() < EPS, "errors={errors}: {r:?}");
    }
}

#[test]
fn test_summary_rates_rounded_to_two_decimals() {
    let samples = vec![get("/r", 1.0, 404), get("/r", 1.0, 200), get("/r", 1.0, 200)];
    let r = &compute_summary(&samples)[0];
    assert_eq!(r.error_rate, 33.33);
    assert_eq!(r.success_rate, 66.67);
}

#[test]
fn test_summary_is_order_independent() {
    let forward = vec![get("/a", 3.0, 200), get("/a", 9.0, 500), get("/a", 1.0, 200), get("/a", 4.0, 0)];
    let mut reversed = forward.clone();
    reversed.reverse();
    assert_eq!(compute_summary(&forward), compute_summary(&reversed));
}

#[test]
fn test_summary_empty_input() {
    assert!(compute_summary(&[]).is_empty());
}

// --- compute_payload_buckets ---

#[test]
fn test_payload_buckets_ignore_other_methods() {
    let samples = vec![get("/a", 10.0, 200), get("/b", 20.0, 200)];
    assert!(compute_payload_buckets(&samples, HttpMethod::Post).is_empty());
}

#[test]
fn test_payload_buckets_omit_empty_ranges_and_keep_order() {
    let samples = vec![post(10.0, 6000), post(5.0, 50), post(7.0, 99), post(30.0, 700)];
    let buckets = compute_payload_buckets(&samples, HttpMethod::Post);
    let labels: Vec<&str> = buckets.iter().map(|b| b.label.as_str()).collect();
    assert_eq!(labels, vec!["0-100B", "500B-1KB", "5KB+"]);
    assert_eq!(buckets[0].count, 2);
    assert_eq!(buckets[0].min_bytes, 0);
    assert_eq!(buckets[0].max_bytes, Some(100));
    assert_eq!(buckets[2].max_bytes, None);
}

#[test]
fn test_payload_bucket_bounds_are_half_open() {
    let samples = vec![post(1.0, 100), post(1.0, 499), post(1.0, 500), post(1.0, 5000)];
    let buckets = compute_payload_buckets(&samples, HttpMethod::Post);
    let counts: Vec<(&str, u64)> = buckets.iter().map(|b| (b.label.as_str(), b.count)).collect();
    assert_eq!(counts, vec![("100-500B", 2), ("500B-1KB", 1), ("5KB+", 1)]);
}

#[test]
fn test_payload_bucket_p95_interpolates() {
    let samples = vec![post(10.0, 10), post(20.0, 20), post(30.0, 30)];
    let buckets = compute_payload_buckets(&samples, HttpMethod::Post);
    assert_close(buckets[0].p95, 29.0);
}

// --- compute_histogram ---

#[test]
fn test_histogram_always_six_buckets() {
    let buckets = compute_histogram(&[]);
    assert_eq!(buckets.len(), 6);
    assert!(buckets.iter().all(|b| b.count == 0));
    let mins: Vec<f64> = buckets.iter().map(|b| b.min_ms).collect();
    assert_eq!(mins, vec![0.0, 50.0, 100.0, 200.0, 500.0, 1000.0]);
}

#[test]
fn test_histogram_counts_by_half_open_range() {
    let samples = vec![
        get("/a", 0.4, 200),
        get("/a", 49.99, 200),
        get("/a", 50.0, 200),
        get("/a", 199.0, 200),
        get("/a", 999.9, 0),
        get("/a", 1000.0, 0),
        get("/a", 45_000.0, 0),
    ];
    let counts: Vec<u64> = compute_histogram(&samples).iter().map(|b| b.count).collect();
    assert_eq!(counts, vec![2, 1, 1, 0, 1, 2]);
}

// --- compute_run_analytics ---

#[test]
fn test_run_analytics_combines_views() {
    let run = Run {
        id: Uuid::new_v4(),
        slug: "abcd1234".to_string(),
        parameters: RunParameters { endpoints: vec![], request_count: 1 },
        status: RunStatus::Running,
        started_at: None,
        completed_at: None,
        created_at: Utc::now(),
    };
    let samples = vec![get("/a", 10.0, 200), post(20.0, 10)];
    let analytics = compute_run_analytics(&run, &samples);
    assert_eq!(analytics.run_id, run.id);
    assert_eq!(analytics.status, RunStatus::Running);
    assert_eq!(analytics.sample_count, 2);
    assert_eq!(analytics.summary.len(), 2);
    assert_eq!(analytics.payload_buckets.len(), 1);
    assert_eq!(analytics.histogram.len(), 6);
}

#[test]
fn test_round2() {
    assert_eq!(round2(33.333333), 33.33);
    assert_eq!(round2(66.666666), 66.67);
    assert_eq!(round2(100.0), 100.0);
}
