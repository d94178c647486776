//! Fill-history association (spec §4.6) and the history-task launch backoff
//! recovered from the original (`streamTaskInitForLaunchHTask` /
//! `streamTaskSetRetryInfoForLaunch`). The launcher loop itself stays out of
//! scope; this is just the self-contained arithmetic a launcher would need.

use std::time::Duration;
use tracing::debug;

use crate::config::StreamTaskConfig;
use crate::error::Result;
use crate::identity::TaskId;
use crate::ports::MetaStore;
use crate::state_machine::TaskStatus;

/// Clears the companion relationship on the *normal* task's side. A no-op
/// unless `self_is_fill_history` (mirrors the C guard
/// `if (pTask->info.fillHistory == 0) return SUCCESS`, inverted here since
/// the call is only meaningful from the fill-history task).
pub async fn clear_h_task_attr(
    meta: &dyn MetaStore,
    self_is_fill_history: bool,
    companion_task_id: TaskId,
    reset_rel_halt: bool,
) -> Result<()> {
    if !self_is_fill_history {
        return Ok(());
    }

    let Some(companion) = meta.get_task(companion_task_id).await else {
        return Ok(());
    };

    companion.clear_fill_history_pointer();
    if reset_rel_halt {
        debug!(%companion_task_id, "resetting companion persistent status to ready");
        companion.set_persistent_status(TaskStatus::Ready);
    }
    meta.save_task(companion_task_id).await
}

/// Backoff schedule for retrying a fill-history task launch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryLaunchBackoff {
    pub wait_interval: Duration,
    pub tick_count: u32,
    pub retry_times: u32,
}

impl HistoryLaunchBackoff {
    pub fn new(config: &StreamTaskConfig) -> Self {
        let wait_interval = config.launch_htask_interval;
        Self {
            wait_interval,
            tick_count: ticks_for(wait_interval, config.wait_for_minimal_interval),
            retry_times: 0,
        }
    }

    /// `streamTaskSetRetryInfoForLaunch` — called once `tick_count` has
    /// drained to zero; grows the interval and resets the tick counter.
    pub fn retry(&mut self, config: &StreamTaskConfig) {
        debug_assert_eq!(self.tick_count, 0);
        let millis = self.wait_interval.as_secs_f64() * config.retry_launch_interval_inc_rate;
        self.wait_interval = Duration::from_secs_f64(millis);
        self.tick_count = ticks_for(self.wait_interval, config.wait_for_minimal_interval);
        self.retry_times += 1;
    }
}

fn ticks_for(interval: Duration, granularity: Duration) -> u32 {
    (interval.as_secs_f64() / granularity.as_secs_f64()).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_grows_the_interval_by_the_configured_rate() {
        let config = StreamTaskConfig::default();
        let mut backoff = HistoryLaunchBackoff::new(&config);
        let first = backoff.wait_interval;

        backoff.tick_count = 0;
        backoff.retry(&config);

        assert!(backoff.wait_interval > first);
        assert_eq!(backoff.retry_times, 1);
        assert!(backoff.tick_count > 0);
    }
}
