use latprobe_common::AnalyticsResult;

pub const EXIT_PASS: i32 = 0;
pub const EXIT_ERROR_RATE: i32 = 1;
pub const EXIT_P95: i32 = 2;
pub const EXIT_SETUP: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Thresholds {
    /// Highest acceptable p95 latency for any endpoint, in ms.
    pub max_p95_ms: Option<f64>,
    /// Highest acceptable error rate for any endpoint, in percent.
    pub max_error_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    ErrorRateExceeded { endpoint_url: String, error_rate: f64, threshold: f64 },
    P95Exceeded { endpoint_url: String, p95: f64, threshold: f64 },
}

impl Verdict {
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Pass => EXIT_PASS,
            Verdict::ErrorRateExceeded { .. } => EXIT_ERROR_RATE,
            Verdict::P95Exceeded { .. } => EXIT_P95,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Check every endpoint against the thresholds. The error rate is checked
/// first, so an endpoint breaking both reports the error rate.
pub fn evaluate(summary: &[AnalyticsResult], thresholds: &Thresholds) -> Verdict {
    if let Some(threshold) = thresholds.max_error_rate {
        if let Some(row) = summary.iter().find(|r| r.error_rate > threshold) {
            return Verdict::ErrorRateExceeded {
                endpoint_url: row.endpoint_url.clone(),
                error_rate: row.error_rate,
                threshold,
            };
        }
    }
    if let Some(threshold) = thresholds.max_p95_ms {
        // Summary rows are already slowest-p95 first.
        if let Some(row) = summary.iter().find(|r| r.p95 > threshold) {
            return Verdict::P95Exceeded {
                endpoint_url: row.endpoint_url.clone(),
                p95: row.p95,
                threshold,
            };
        }
    }
    Verdict::Pass
}

pub fn describe(verdict: &Verdict) -> String {
    match verdict {
        Verdict::Pass => "Result: PASS".to_string(),
        Verdict::ErrorRateExceeded { endpoint_url, error_rate, threshold } => format!(
            "Result: FAIL  error rate {error_rate:.2}% on {endpoint_url} exceeds {threshold:.2}%"
        ),
        Verdict::P95Exceeded { endpoint_url, p95, threshold } => {
            format!("Result: FAIL  p95 {p95:.1} ms on {endpoint_url} exceeds {threshold:.1} ms")
        }
    }
}
