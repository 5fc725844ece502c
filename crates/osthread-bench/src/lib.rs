//! Shared helpers for the osthread benches under `benches/`.

use std::time::Duration;

/// Per-sample nanoseconds-per-op collected from `iter_custom` runs.
#[derive(Debug, Default)]
pub struct BenchStats {
    samples_ns_per_op: Vec<f64>,
}

impl BenchStats {
    pub fn record(&mut self, iters: u64, dur: Duration) {
        self.samples_ns_per_op
            .push(dur.as_nanos() as f64 / iters.max(1) as f64);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples_ns_per_op.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples_ns_per_op.is_empty()
    }

    /// Nearest-rank percentile, `q` in `0.0..=1.0`. `None` with no samples.
    #[must_use]
    pub fn percentile(&self, q: f64) -> Option<f64> {
        if self.samples_ns_per_op.is_empty() {
            return None;
        }
        let mut samples = self.samples_ns_per_op.clone();
        samples.sort_by(f64::total_cmp);
        let rank = ((samples.len() - 1) as f64 * q.clamp(0.0, 1.0)).round() as usize;
        Some(samples[rank])
    }

    /// Print one `OSTHREAD_BENCH` summary line for `bench_label`.
    pub fn report(&self, bench_label: &str) {
        let (Some(p50), Some(p99)) = (self.percentile(0.5), self.percentile(0.99)) else {
            return;
        };
        println!(
            "OSTHREAD_BENCH backend={} bench={bench_label} samples={} p50_ns_op={p50:.3} p99_ns_op={p99:.3}",
            osthread::backend_name(),
            self.len(),
        );
    }
}
