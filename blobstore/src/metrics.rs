//! Per-operation counters of a blob store.
//!
//! Stores accumulate counters with an [OperationMetricsTracker] and hand out
//! the delta since the previous call. Groups merge the deltas of their
//! members with [aggregate].

use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Download,
    Upload,
}

impl OperationType {
    pub const ALL: [OperationType; 2] = [OperationType::Download, OperationType::Upload];
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OperationMetrics {
    pub successful_requests: u64,
    pub error_requests: u64,
    pub time_on_requests: Duration,
    /// Bytes transferred by the successful requests.
    pub blob_size: u64,
}

impl AddAssign<&OperationMetrics> for OperationMetrics {
    fn add_assign(&mut self, rhs: &OperationMetrics) {
        self.successful_requests += rhs.successful_requests;
        self.error_requests += rhs.error_requests;
        self.time_on_requests += rhs.time_on_requests;
        self.blob_size += rhs.blob_size;
    }
}

pub type OperationMetricsDelta = BTreeMap<OperationType, OperationMetrics>;

/// Accumulates operation counters until they're taken as a delta.
#[derive(Debug, Default)]
pub struct OperationMetricsTracker {
    pending: Mutex<OperationMetricsDelta>,
}

impl OperationMetricsTracker {
    pub fn record_success(&self, op: OperationType, blob_size: u64, elapsed: Duration) {
        let mut pending = self.pending.lock();
        let m = pending.entry(op).or_default();
        m.successful_requests += 1;
        m.blob_size += blob_size;
        m.time_on_requests += elapsed;
    }

    pub fn record_error(&self, op: OperationType, elapsed: Duration) {
        let mut pending = self.pending.lock();
        let m = pending.entry(op).or_default();
        m.error_requests += 1;
        m.time_on_requests += elapsed;
    }

    /// Returns everything recorded since the last call and resets the
    /// counters. Every [OperationType] is present, zeroed if idle.
    pub fn take_delta(&self) -> OperationMetricsDelta {
        let mut taken = std::mem::take(&mut *self.pending.lock());
        for op in OperationType::ALL {
            taken.entry(op).or_default();
        }
        taken
    }
}

/// Merges deltas by summing the counters of the same operation type.
pub fn aggregate(deltas: impl IntoIterator<Item = OperationMetricsDelta>) -> OperationMetricsDelta {
    let mut merged = OperationMetricsDelta::new();
    for delta in deltas {
        for (op, metrics) in delta.iter() {
            *merged.entry(*op).or_default() += metrics;
        }
    }
    merged
}
