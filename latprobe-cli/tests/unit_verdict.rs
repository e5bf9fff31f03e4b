use latprobe_cli::verdict::{describe, evaluate, Thresholds, Verdict, EXIT_ERROR_RATE, EXIT_P95, EXIT_PASS};
use latprobe_common::{AnalyticsResult, HttpMethod};

fn row(url: &str, p95: f64, error_rate: f64) -> AnalyticsResult {
    AnalyticsResult {
        endpoint_url: url.to_string(),
        method: HttpMethod::Get,
        p50: p95 / 2.0,
        p95,
        p99: p95,
        min: 1.0,
        max: p95,
        avg: p95 / 2.0,
        std_dev: 1.0,
        avg_payload_size: 0,
        request_count: 10,
        error_count: (error_rate / 10.0) as u64,
        error_rate,
        success_rate: 100.0 - error_rate,
    }
}

#[test]
fn test_no_thresholds_passes() {
    let verdict = evaluate(&[row("/a", 5_000.0, 100.0)], &Thresholds::default());
    assert_eq!(verdict, Verdict::Pass);
    assert_eq!(verdict.exit_code(), EXIT_PASS);
    assert_eq!(describe(&verdict), "Result: PASS");
}

#[test]
fn test_p95_threshold() {
    let summary = [row("/slow", 250.0, 0.0), row("/fast", 40.0, 0.0)];
    let thresholds = Thresholds { max_p95_ms: Some(200.0), max_error_rate: None };
    let verdict = evaluate(&summary, &thresholds);
    assert_eq!(verdict.exit_code(), EXIT_P95);
    assert!(matches!(verdict, Verdict::P95Exceeded { ref endpoint_url, .. } if endpoint_url == "/slow"));

    let relaxed = Thresholds { max_p95_ms: Some(250.0), max_error_rate: None };
    assert!(evaluate(&summary, &relaxed).is_pass());
}

#[test]
fn test_error_rate_threshold() {
    let summary = [row("/a", 10.0, 0.0), row("/b", 10.0, 20.0)];
    let thresholds = Thresholds { max_p95_ms: None, max_error_rate: Some(5.0) };
    let verdict = evaluate(&summary, &thresholds);
    assert_eq!(verdict.exit_code(), EXIT_ERROR_RATE);
    assert!(describe(&verdict).contains("/b"));
}

#[test]
fn test_error_rate_wins_over_p95() {
    let summary = [row("/a", 900.0, 50.0)];
    let thresholds = Thresholds { max_p95_ms: Some(100.0), max_error_rate: Some(1.0) };
    assert_eq!(evaluate(&summary, &thresholds).exit_code(), EXIT_ERROR_RATE);
}
