//! Process-wide transfer state and the dispatch throttle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::NaiveTime;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::units::parse_byte_size;
use crate::{TransferError, lock};

/// Longest uninterrupted sleep slice; cancellation is checked between slices.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// State shared by every transfer running in the process.
///
/// Owned by the top-level caller and handed to each operation by reference
/// (usually behind an `Arc`), so aggregate progress, throttling and
/// cancellation span concurrent transfers.
#[derive(Debug, Default)]
pub struct SharedTransferState {
    progress: AtomicU64,
    transferred: AtomicU64,
    flow_sleeping: Mutex<bool>,
    flow_idle: Condvar,
    cancel: CancellationToken,
}

impl SharedTransferState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds bytes that just went over the wire.
    pub fn add_progress(&self, bytes: u64) {
        self.progress.fetch_add(bytes, Ordering::Relaxed);
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds bytes a resumed transfer completed in an earlier run.
    ///
    /// They count towards displayed progress but not towards the flow rate.
    pub fn add_resumed(&self, bytes: u64) {
        self.progress.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Aggregate bytes done so far, resumed ones included.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Bytes moved by this process; what the flow governor measures.
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn is_flow_sleeping(&self) -> bool {
        *lock(&self.flow_sleeping)
    }

    /// Blocks while any governor sharing this state is sleeping.
    pub fn wait_flow_idle(&self) {
        let mut sleeping = lock(&self.flow_sleeping);
        while *sleeping && !self.cancel.is_cancelled() {
            sleeping = match self.flow_idle.wait_timeout(sleeping, SLEEP_SLICE) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Sleeps for `pause` with the flow-sleeping flag raised.
    ///
    /// Returns early when the transfer is cancelled.
    pub fn sleep_flow(&self, pause: Duration) {
        *lock(&self.flow_sleeping) = true;
        let deadline = Instant::now() + pause;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
        *lock(&self.flow_sleeping) = false;
        self.flow_idle.notify_all();
    }

    /// Stops new parts from being dispatched by every operation.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.flow_idle.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The underlying token, for wiring into signal handlers.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Throttles how fast new parts are dispatched.
///
/// Compares the aggregate progress since the start of the current window
/// with the configured ceiling; when the observed rate reaches the
/// ceiling, sleeps until the window's average falls back to it and starts
/// a new window. In-flight parts are never paused.
#[derive(Debug)]
pub struct FlowGovernor {
    ceiling: Option<u64>,
    window_start: Instant,
    window_bytes: u64,
}

impl FlowGovernor {
    /// A governor with a byte/sec ceiling; `None` or `0` disables it.
    pub fn new(ceiling: Option<u64>, state: &SharedTransferState) -> Self {
        Self {
            ceiling: ceiling.filter(|&c| c > 0),
            window_start: Instant::now(),
            window_bytes: state.transferred(),
        }
    }

    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    /// Called before each dispatch; may block.
    pub fn throttle(&mut self, state: &SharedTransferState) {
        let Some(ceiling) = self.ceiling else {
            return;
        };

        // Another governor is already holding the process back.
        if state.is_flow_sleeping() {
            state.wait_flow_idle();
            return;
        }

        let observed = state.transferred().saturating_sub(self.window_bytes);
        let elapsed = self.window_start.elapsed().as_secs_f64();
        if observed == 0 || elapsed <= 0.0 {
            return;
        }

        let rate = observed as f64 / elapsed;
        if rate < ceiling as f64 {
            return;
        }

        let pause = observed as f64 / ceiling as f64 - elapsed;
        if pause > 0.0 {
            debug!(
                rate = rate as u64,
                ceiling,
                pause_ms = (pause * 1000.0) as u64,
                "flow width reached, pausing dispatch"
            );
            state.sleep_flow(Duration::from_secs_f64(pause));
        }
        self.window_start = Instant::now();
        self.window_bytes = state.transferred();
    }
}

/// Time-of-day flow widths, e.g. `{"07:30-12:00": "1.1M", "21:00-06:30": "110M"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowPolicy {
    windows: Vec<FlowWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FlowWindow {
    start: NaiveTime,
    end: NaiveTime,
    width: u64,
}

impl FlowWindow {
    fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

impl FlowPolicy {
    pub fn parse(json: &str) -> Result<Self, TransferError> {
        let table: BTreeMap<String, String> = serde_json::from_str(json)
            .map_err(|e| TransferError::InvalidFlowPolicy(e.to_string()))?;

        let mut windows = Vec::with_capacity(table.len());
        for (range, width) in table {
            let (start, end) = range
                .split_once('-')
                .ok_or_else(|| TransferError::InvalidFlowPolicy(range.clone()))?;
            let parse_time = |s: &str| {
                NaiveTime::parse_from_str(s.trim(), "%H:%M")
                    .map_err(|_| TransferError::InvalidFlowPolicy(range.clone()))
            };
            windows.push(FlowWindow {
                start: parse_time(start)?,
                end: parse_time(end)?,
                width: parse_byte_size(&width)?,
            });
        }
        Ok(Self { windows })
    }

    /// Flow width for `time`, or `None` outside every window.
    pub fn width_at(&self, time: NaiveTime) -> Option<u64> {
        self.windows.iter().find(|w| w.contains(time)).map(|w| w.width)
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
