//! Scan progress bar and run timer

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use indicatif::{ProgressBar, ProgressStyle};

use crate::run_state::RunState;

/// Longest uninterrupted sleep between two stop request checks
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Formats a duration in seconds as `" %3d min %2d sec "`
pub fn format_time(seconds: f64) -> String {
    let seconds = seconds.max(0.).round() as u64;
    format!(" {:3} min {:2} sec ", seconds / 60, seconds % 60)
}

/// Progress of a cavity set-up
///
/// The progress is measured in seconds: each controller sets its maximum expected
/// duration and the scan advances the bar every time it waits for the machine.
#[derive(Clone, Debug)]
pub struct ScanProgress {
    bar: ProgressBar,
    // milliseconds
    count: Arc<AtomicU64>,
    max_count: Arc<AtomicU64>,
}

impl ScanProgress {
    /// Progress bar drawn to the terminal
    pub fn new<S: Into<String>>(name: S) -> Self {
        let bar = ProgressBar::new(1);
        if let Ok(style) =
            ProgressStyle::with_template("{msg} [{eta_precise}] {bar:50.cyan/blue} {percent:>3}%")
        {
            bar.set_style(style);
        }
        bar.set_message(name.into());
        Self::with_bar(bar)
    }
    /// Progress without any display
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }
    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            count: Arc::new(AtomicU64::new(0)),
            max_count: Arc::new(AtomicU64::new(1)),
        }
    }
    /// Resets the progress with a new maximum expected duration
    pub fn set_max_time_count(&self, seconds: f64) {
        let max = ((seconds * 1e3) as u64).max(1);
        self.max_count.store(max, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.bar.set_length(max);
        self.bar.set_position(0);
    }
    pub fn max_time_count(&self) -> f64 {
        self.max_count.load(Ordering::Relaxed) as f64 * 1e-3
    }
    /// Advances the progress by `seconds`
    pub fn add_time(&self, seconds: f64) {
        let dt = (seconds.max(0.) * 1e3) as u64;
        let count = self.count.fetch_add(dt, Ordering::Relaxed) + dt;
        self.bar
            .set_position(count.min(self.max_count.load(Ordering::Relaxed)));
    }
    /// Progress in percent, capped at 100%
    pub fn percent(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed) as f64;
        let max = self.max_count.load(Ordering::Relaxed) as f64;
        (100. * count / max).min(100.)
    }
    pub fn set_message<S: Into<String>>(&self, msg: S) {
        self.bar.set_message(msg.into());
    }
    pub fn finish(&self) {
        self.bar.finish();
    }
    /// Sleeps for `seconds` while advancing the progress
    ///
    /// Returns `false` as soon as a stop is requested.
    pub fn time_sleep(&self, seconds: f64, run_state: &RunState) -> bool {
        let mut left = Duration::from_secs_f64(seconds.max(0.));
        loop {
            if run_state.should_stop() {
                return false;
            }
            if left.is_zero() {
                return true;
            }
            let dt = left.min(SLEEP_SLICE);
            thread::sleep(dt);
            self.add_time(dt.as_secs_f64());
            left -= dt;
        }
    }
}

/// Timer status sampled while a run is going on
#[derive(Debug, Clone, PartialEq)]
pub struct TimerReport {
    pub elapsed: Duration,
    pub budget: Duration,
}
impl TimerReport {
    pub fn is_overtime(&self) -> bool {
        self.elapsed > self.budget
    }
    /// Time left, or time beyond the budget prefixed with "Overtime:"
    pub fn text(&self) -> String {
        if self.is_overtime() {
            format!(
                "Overtime:{}",
                format_time((self.elapsed - self.budget).as_secs_f64())
            )
        } else {
            format_time((self.budget - self.elapsed).as_secs_f64())
        }
    }
}

/// Global run timer
///
/// Samples the elapsed time against the expected duration every `period`
/// for as long as the run state is running; overtime is reported, never enforced.
pub struct RunTimer;
impl RunTimer {
    pub fn spawn<F>(
        run_state: Arc<RunState>,
        budget: Duration,
        period: Duration,
        mut report: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(TimerReport) + Send + 'static,
    {
        let start = Instant::now();
        thread::spawn(move || {
            while run_state.is_running() {
                thread::sleep(period);
                report(TimerReport {
                    elapsed: start.elapsed(),
                    budget,
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn formatting() {
        assert_eq!(format_time(125.), "   2 min  5 sec ");
        let report = TimerReport {
            elapsed: Duration::from_secs(70),
            budget: Duration::from_secs(60),
        };
        assert_eq!(report.text(), "Overtime:   0 min 10 sec ");
    }

    #[test]
    fn sleep_progress() {
        let progress = ScanProgress::hidden();
        progress.set_max_time_count(0.2);
        let state = RunState::new();
        assert!(progress.time_sleep(0.1, &state));
        assert!((progress.percent() - 50.).abs() < 1.);
        state.request_stop();
        assert!(!progress.time_sleep(10., &state));
    }

    #[test]
    fn timer_polls_while_running() {
        let state = RunState::new();
        let guard = state.start().unwrap();
        let reports = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&reports);
        let handle = RunTimer::spawn(
            Arc::clone(&state),
            Duration::from_millis(10),
            Duration::from_millis(5),
            move |r| sink.lock().unwrap().push(r),
        );
        thread::sleep(Duration::from_millis(50));
        drop(guard);
        handle.join().unwrap();
        let reports = reports.lock().unwrap();
        assert!(!reports.is_empty());
        assert!(reports.last().unwrap().is_overtime());
    }
}
