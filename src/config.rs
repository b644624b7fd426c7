//! Engine-wide defaults and tuning constants.

use std::time::Duration;

/// Default number of operations the admission buffer can hold.
pub const DEFAULT_BUFFER_SIZE: u32 = 10_000;

/// Default cadence of the flush loop.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Smallest honored flush interval. Anything shorter reverts to the default.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Default cadence of capacity requests to the rate limiter.
pub const DEFAULT_CAPACITY_INTERVAL: Duration = Duration::from_millis(100);

/// Default cadence of the audit sweep.
pub const DEFAULT_AUDIT_INTERVAL: Duration = Duration::from_secs(10);

/// Default ceiling on how long a dispatched batch may hold capacity.
pub const DEFAULT_MAX_OPERATION_TIME: Duration = Duration::from_secs(60);

/// Default duration of a pause.
pub const DEFAULT_PAUSE_TIME: Duration = Duration::from_millis(500);

/// Default upper bound on the shared limiter's jittered control interval.
pub const DEFAULT_MAX_LEASE_INTERVAL: Duration = Duration::from_millis(500);

/// Default capacity each partition is worth.
pub const DEFAULT_FACTOR: u32 = 1;

/// Hard cap on the number of partitions a shared resource may manage.
pub const MAX_PARTITIONS: u32 = 500;

/// TTL requested for each partition lease.
///
/// 15 seconds is the shortest lease most blob stores will grant, which
/// keeps the reallocation churn between competing processes high.
pub const LEASE_TTL: Duration = Duration::from_secs(15);
