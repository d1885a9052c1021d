use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 耗时分桶上界（毫秒），最后一个桶收纳 `>= 1000ms`。
pub const PERF_BUCKET_LIMITS_MS: [u64; 6] = [5, 20, 50, 100, 200, 1_000];

/// 单个动作的耗时与失败计数。
#[derive(Debug, Default)]
pub(crate) struct PerfIndicator {
    buckets: [AtomicU64; 7],
    failures: AtomicU64,
    total: AtomicU64,
}

impl PerfIndicator {
    pub(crate) fn record(&self, elapsed: Duration, success: bool) {
        let ms = elapsed.as_millis() as u64;
        let bucket = PERF_BUCKET_LIMITS_MS
            .iter()
            .position(|limit| ms < *limit)
            .unwrap_or(PERF_BUCKET_LIMITS_MS.len());
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
            failures: self.failures.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }
}

/// [`PerfIndicator`] 的只读快照，`buckets[i]` 对应 [`PERF_BUCKET_LIMITS_MS`] 的第 `i` 档。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfSnapshot {
    pub buckets: [u64; 7],
    pub failures: u64,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_land_in_expected_buckets() {
        let perf = PerfIndicator::default();
        perf.record(Duration::from_millis(1), true);
        perf.record(Duration::from_millis(5), true);
        perf.record(Duration::from_millis(250), false);
        perf.record(Duration::from_secs(3), false);
        let snapshot = perf.snapshot();
        assert_eq!(snapshot.buckets, [1, 1, 0, 0, 0, 1, 1]);
        assert_eq!(snapshot.failures, 2);
        assert_eq!(snapshot.total, 4);
    }
}
