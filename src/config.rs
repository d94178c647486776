//! Process-wide configuration (spec §6), read once at startup. Modeled as an
//! injected value rather than ambient globals (Design Notes §9) so tests can
//! instantiate independent runtimes side by side.

use std::time::Duration;

/// Interval between downstream-readiness probe retries.
pub const CHECK_RSP_INTERVAL: Duration = Duration::from_millis(300);

/// How long the check engine waits for a first response before reclassifying
/// an outstanding probe as timed out.
pub const CHECK_NOT_RSP_DURATION: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamTaskConfig {
    /// Sink-task token bucket cap, bytes/sec.
    pub sink_data_rate_bytes_per_sec: u64,
    pub check_rsp_interval: Duration,
    pub check_not_rsp_duration: Duration,
    /// Base interval between fill-history task launch attempts.
    pub launch_htask_interval: Duration,
    /// Tick granularity the launcher polls at while waiting out an interval.
    pub wait_for_minimal_interval: Duration,
    /// Multiplier applied to `launch_htask_interval` on each retry.
    pub retry_launch_interval_inc_rate: f64,
}

impl Default for StreamTaskConfig {
    fn default() -> Self {
        Self {
            sink_data_rate_bytes_per_sec: 2 << 20, // 2MiB/s, per the original sink token bucket
            check_rsp_interval: CHECK_RSP_INTERVAL,
            check_not_rsp_duration: CHECK_NOT_RSP_DURATION,
            launch_htask_interval: Duration::from_secs(5),
            wait_for_minimal_interval: Duration::from_millis(500),
            retry_launch_interval_inc_rate: 1.5,
        }
    }
}

impl StreamTaskConfig {
    /// Load overrides from `STREAM_TASK_*` environment variables, falling
    /// back to [`StreamTaskConfig::default`] for anything unset or
    /// unparsable.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            sink_data_rate_bytes_per_sec: env_u64(
                "STREAM_TASK_SINK_DATA_RATE_BYTES_PER_SEC",
                default.sink_data_rate_bytes_per_sec,
            ),
            check_rsp_interval: env_duration_ms(
                "STREAM_TASK_CHECK_RSP_INTERVAL_MS",
                default.check_rsp_interval,
            ),
            check_not_rsp_duration: env_duration_ms(
                "STREAM_TASK_CHECK_NOT_RSP_DURATION_MS",
                default.check_not_rsp_duration,
            ),
            launch_htask_interval: env_duration_ms(
                "STREAM_TASK_LAUNCH_HTASK_INTERVAL_MS",
                default.launch_htask_interval,
            ),
            wait_for_minimal_interval: env_duration_ms(
                "STREAM_TASK_WAIT_FOR_MINIMAL_INTERVAL_MS",
                default.wait_for_minimal_interval,
            ),
            retry_launch_interval_inc_rate: env_f64(
                "STREAM_TASK_RETRY_LAUNCH_INTERVAL_INC_RATE",
                default.retry_launch_interval_inc_rate,
            ),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
