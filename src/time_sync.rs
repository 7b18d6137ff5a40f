//! Clock-offset estimation.
//!
//! The offset is `client_wall_time - server_wall_time` in seconds and is
//! added to every node timestamp before delivery to subscribers.  One run
//! takes three sequential samples and adopts the diff of the sample with the
//! smallest ping; refreshes are throttled to one per ten seconds.

use cdp_proto::{Container, CurrentTimeRequest};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub(crate) const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

const SAMPLE_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Sample {
    /// Round-trip time of the current-time request, seconds.
    pub ping: f64,
    /// Estimated client-minus-server offset from this sample, seconds.
    pub diff: f64,
}

/// What to do after feeding one current-time response into a run.
pub(crate) enum SyncStep {
    /// Send the next sample request.
    Continue(Container),
    /// All samples collected; adopt this offset.
    Done(f64),
}

/// One in-flight offset estimation run.
pub(crate) struct TimeSyncRun {
    samples: Vec<Sample>,
    sent_at: Instant,
}

impl TimeSyncRun {
    /// Start a run and produce the first sample request.
    pub fn begin() -> (TimeSyncRun, Container) {
        let run = TimeSyncRun {
            samples: Vec::with_capacity(SAMPLE_COUNT),
            sent_at: Instant::now(),
        };
        (run, time_request())
    }

    /// Feed the response to the outstanding sample request.
    pub fn on_response(&mut self, server_time_ns: u64) -> SyncStep {
        let ping = self.sent_at.elapsed().as_secs_f64();
        let received_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        let server_at_receipt = server_time_ns as f64 / 1e9 + ping / 2.0;
        self.samples.push(Sample {
            ping,
            diff: received_at - server_at_receipt,
        });

        if self.samples.len() < SAMPLE_COUNT {
            self.sent_at = Instant::now();
            SyncStep::Continue(time_request())
        } else {
            SyncStep::Done(select_offset(&self.samples).unwrap_or(0.0))
        }
    }
}

fn time_request() -> Container {
    Container::CurrentTimeRequest(CurrentTimeRequest {})
}

/// The diff of the minimum-ping sample.
pub(crate) fn select_offset(samples: &[Sample]) -> Option<f64> {
    samples
        .iter()
        .min_by(|a, b| a.ping.total_cmp(&b.ping))
        .map(|sample| sample.diff)
}

/// Whether the offset is stale enough to warrant a refresh.
pub(crate) fn needs_refresh(last_sync: Option<Instant>) -> bool {
    last_sync.is_none_or(|at| at.elapsed() >= REFRESH_INTERVAL)
}
