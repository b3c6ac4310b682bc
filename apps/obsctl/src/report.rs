//! Periodic progress logging while transfers run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use obsctl_transfer::{SharedTransferState, SpeedCalculator, format_byte_size};
use tracing::info;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const TICK: Duration = Duration::from_millis(100);

/// Logs transferred bytes, speed and ETA once per interval until dropped.
pub struct ProgressReporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// `total` is the byte count expected across all transfers, if known.
    pub fn start(shared: Arc<SharedTransferState>, total: Option<u64>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("progress".into())
            .spawn(move || report_loop(&shared, total, &flag))
            .map_err(|e| tracing::warn!(error = %e, "progress reporting unavailable"))
            .ok();
        Self { stop, handle }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn report_loop(shared: &SharedTransferState, total: Option<u64>, stop: &AtomicBool) {
    let speed = SpeedCalculator::new(None, None);
    let mut since_report = Duration::ZERO;
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(TICK);
        since_report += TICK;
        if since_report < REPORT_INTERVAL {
            continue;
        }
        since_report = Duration::ZERO;

        let done = shared.progress();
        speed.record(done);
        info!(
            "{}",
            progress_line(done, total, speed.bytes_per_second(), |remaining| speed
                .eta(remaining))
        );
    }
}

fn progress_line(
    done: u64,
    total: Option<u64>,
    bytes_per_second: f64,
    eta: impl Fn(u64) -> Option<Duration>,
) -> String {
    let rate = format!("{}/s", format_byte_size(bytes_per_second as u64));
    match total {
        Some(total) => {
            let remaining = total.saturating_sub(done);
            let eta = eta(remaining)
                .map(|d| format!("{}s", d.as_secs()))
                .unwrap_or_else(|| "-".into());
            format!(
                "{} / {} at {rate}, eta {eta}",
                format_byte_size(done),
                format_byte_size(total)
            )
        }
        None => format!("{} at {rate}", format_byte_size(done)),
    }
}
