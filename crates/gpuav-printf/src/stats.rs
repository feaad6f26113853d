use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one device's debug printf activity.
///
/// Updated from whichever thread records or submits; reads are relaxed snapshots.
#[derive(Debug, Default)]
pub struct DebugPrintfStats {
    shaders_instrumented: AtomicU64,
    instrumentation_failures: AtomicU64,
    pipelines_tracked: AtomicU64,
    buffers_provisioned: AtomicU64,
    binds_skipped: AtomicU64,
    barriers_submitted: AtomicU64,
    records_decoded: AtomicU64,
    truncated_buffers: AtomicU64,
    unknown_shader_records: AtomicU64,
}

impl DebugPrintfStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_shaders_instrumented(&self) {
        self.shaders_instrumented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_instrumentation_failures(&self) {
        self.instrumentation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pipelines_tracked(&self) {
        self.pipelines_tracked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_buffers_provisioned(&self) {
        self.buffers_provisioned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_binds_skipped(&self) {
        self.binds_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_barriers_submitted(&self) {
        self.barriers_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_records_decoded(&self, count: u64) {
        self.records_decoded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_truncated_buffers(&self) {
        self.truncated_buffers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unknown_shader_records(&self, count: u64) {
        self.unknown_shader_records
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DebugPrintfStatsSnapshot {
        DebugPrintfStatsSnapshot {
            shaders_instrumented: self.shaders_instrumented.load(Ordering::Relaxed),
            instrumentation_failures: self.instrumentation_failures.load(Ordering::Relaxed),
            pipelines_tracked: self.pipelines_tracked.load(Ordering::Relaxed),
            buffers_provisioned: self.buffers_provisioned.load(Ordering::Relaxed),
            binds_skipped: self.binds_skipped.load(Ordering::Relaxed),
            barriers_submitted: self.barriers_submitted.load(Ordering::Relaxed),
            records_decoded: self.records_decoded.load(Ordering::Relaxed),
            truncated_buffers: self.truncated_buffers.load(Ordering::Relaxed),
            unknown_shader_records: self.unknown_shader_records.load(Ordering::Relaxed),
        }
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DebugPrintfStatsSnapshot {
    pub shaders_instrumented: u64,
    pub instrumentation_failures: u64,
    pub pipelines_tracked: u64,
    pub buffers_provisioned: u64,
    pub binds_skipped: u64,
    pub barriers_submitted: u64,
    pub records_decoded: u64,
    pub truncated_buffers: u64,
    pub unknown_shader_records: u64,
}

impl DebugPrintfStatsSnapshot {
    pub fn to_json(self) -> String {
        serde_json::to_string(&self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_json_contains_counters() {
        let stats = DebugPrintfStats::new();
        stats.inc_shaders_instrumented();
        stats.inc_barriers_submitted();
        stats.add_records_decoded(3);
        stats.add_records_decoded(2);
        let json = stats.to_json();
        assert!(json.contains("\"shaders_instrumented\":1"));
        assert!(json.contains("\"barriers_submitted\":1"));
        assert!(json.contains("\"records_decoded\":5"));
        assert!(json.contains("\"truncated_buffers\":0"));
    }
}
