//! Rolling token/latency counters, folded in on every completed forward.
//!
//! Grounded on the response shapes the teacher's `routes/chat.rs` parses out of a
//! backend completion, generalized here into a kind-agnostic extractor that reads
//! either a llamacpp-style `timings` object or an OpenAI-style `usage` object (§4.H).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Totals {
    requests: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    /// Stored as microseconds to keep this lock-free; 10^6 precision is plenty for
    /// a rolling seconds-scale average.
    ttft_micros_sum: AtomicU64,
    tokens_per_second_milli_sum: AtomicU64,
}

/// Aggregates token/latency stats across every loaded model. Reads recompute
/// windowed averages from atomics; writes are plain fetch-adds (§5).
#[derive(Default)]
pub struct Telemetry {
    totals: Totals,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TelemetrySnapshot {
    pub requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub mean_ttft_seconds: f64,
    pub mean_tokens_per_second: f64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract token/latency fields from a completed response and fold them into the
    /// rolling totals. Missing fields are treated as zero contributions, never errors.
    pub fn record_from_response(&self, response: &serde_json::Value) {
        let (input_tokens, output_tokens, ttft_seconds, tokens_per_second) =
            extract_fields(response);

        self.totals.requests.fetch_add(1, Ordering::Relaxed);
        self.totals.input_tokens.fetch_add(input_tokens, Ordering::Relaxed);
        self.totals.output_tokens.fetch_add(output_tokens, Ordering::Relaxed);
        self.totals
            .ttft_micros_sum
            .fetch_add((ttft_seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        self.totals
            .tokens_per_second_milli_sum
            .fetch_add((tokens_per_second * 1_000.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let requests = self.totals.requests.load(Ordering::Relaxed);
        let divisor = requests.max(1) as f64;
        TelemetrySnapshot {
            requests,
            total_input_tokens: self.totals.input_tokens.load(Ordering::Relaxed),
            total_output_tokens: self.totals.output_tokens.load(Ordering::Relaxed),
            mean_ttft_seconds: self.totals.ttft_micros_sum.load(Ordering::Relaxed) as f64
                / divisor
                / 1_000_000.0,
            mean_tokens_per_second: self.totals.tokens_per_second_milli_sum.load(Ordering::Relaxed) as f64
                / divisor
                / 1_000.0,
        }
    }
}

/// Returns `(input_tokens, output_tokens, ttft_seconds, tokens_per_second)`, preferring
/// a llamacpp-style `timings` object and falling back to an OpenAI-style `usage`
/// object.
fn extract_fields(response: &serde_json::Value) -> (u64, u64, f64, f64) {
    if let Some(timings) = response.get("timings") {
        let input_tokens = timings.get("prompt_n").and_then(|v| v.as_u64()).unwrap_or(0);
        let output_tokens = timings.get("predicted_n").and_then(|v| v.as_u64()).unwrap_or(0);
        let ttft_seconds = timings
            .get("prompt_ms")
            .and_then(|v| v.as_f64())
            .map(|ms| ms / 1000.0)
            .unwrap_or(0.0);
        let tokens_per_second = timings
            .get("predicted_per_second")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        return (input_tokens, output_tokens, ttft_seconds, tokens_per_second);
    }

    if let Some(usage) = response.get("usage") {
        let input_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        return (input_tokens, output_tokens, 0.0, 0.0);
    }

    (0, 0, 0.0, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_llamacpp_timings() {
        let response = json!({
            "timings": {
                "prompt_n": 10,
                "predicted_n": 20,
                "prompt_ms": 150.0,
                "predicted_per_second": 42.0,
            }
        });
        let (input, output, ttft, tps) = extract_fields(&response);
        assert_eq!(input, 10);
        assert_eq!(output, 20);
        assert_eq!(ttft, 0.15);
        assert_eq!(tps, 42.0);
    }

    #[test]
    fn extracts_openai_usage_fallback() {
        let response = json!({"usage": {"prompt_tokens": 5, "completion_tokens": 7}});
        let (input, output, _, _) = extract_fields(&response);
        assert_eq!(input, 5);
        assert_eq!(output, 7);
    }

    #[test]
    fn snapshot_averages_across_requests() {
        let telemetry = Telemetry::new();
        telemetry.record_from_response(&json!({"usage": {"prompt_tokens": 10, "completion_tokens": 10}}));
        telemetry.record_from_response(&json!({"usage": {"prompt_tokens": 20, "completion_tokens": 20}}));
        let snap = telemetry.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.total_input_tokens, 30);
        assert_eq!(snap.total_output_tokens, 30);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let (input, output, ttft, tps) = extract_fields(&json!({}));
        assert_eq!((input, output, ttft, tps), (0, 0, 0.0, 0.0));
    }
}
