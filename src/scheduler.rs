//! Cancellable periodic background tasks.
//!
//! Each task owns one thread that sleeps until its next fire time and runs
//! the job inline, so a task never overlaps itself. `stop` wakes the thread,
//! raises the cancellation flag seen by a running job and joins.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Days, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Fire on a fixed cadence from the task start. Ticks that fall inside a
    /// long-running job are skipped, not queued.
    Every(Duration),
    /// Fire once a day at a local wall-clock time.
    DailyAt(NaiveTime),
}

impl Schedule {
    pub fn delay_from<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        match self {
            Schedule::Every(interval) => *interval,
            Schedule::DailyAt(at) => (next_daily(now, *at) - now.clone())
                .to_std()
                .unwrap_or(Duration::ZERO),
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Every(interval) => write!(f, "every {}s", interval.as_secs()),
            Schedule::DailyAt(at) => write!(f, "daily at {}", at.format("%H:%M")),
        }
    }
}

/// Next occurrence of `at` strictly after `now`.
///
/// A wall-clock time skipped by a DST jump fires one hour later that day. A
/// wall-clock time that occurs twice fires at the earlier instant.
pub fn next_daily<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    next_daily_with(now, at, |naive| tz.from_local_datetime(naive))
}

fn next_daily_with<Tz, F>(now: &DateTime<Tz>, at: NaiveTime, resolve: F) -> DateTime<Tz>
where
    Tz: TimeZone,
    F: Fn(&NaiveDateTime) -> LocalResult<DateTime<Tz>>,
{
    let mut day = now.date_naive();
    loop {
        let naive = day.and_time(at);
        let candidate = resolve(&naive)
            .earliest()
            .or_else(|| resolve(&(naive + chrono::Duration::hours(1))).earliest());
        if let Some(candidate) = candidate {
            if candidate > *now {
                return candidate;
            }
        }
        day = match day.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => return now.clone(),
        };
    }
}

/// First tick of a fixed `interval` cadence after `previous` that is still
/// in the future at `now`.
fn next_tick(previous: Instant, interval: Duration, now: Instant) -> Instant {
    if interval.is_zero() {
        return now;
    }
    let mut next = previous + interval;
    while next <= now {
        next += interval;
    }
    next
}

/// Cooperative cancellation flag handed to running jobs.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    cancel: Cancellation,
    wake: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &'static str, schedule: Schedule, mut job: F) -> Result<Self>
    where
        F: FnMut(&Cancellation) + Send + 'static,
    {
        let (wake, rx) = mpsc::channel::<()>();
        let cancel = Cancellation::new();
        let cancel_thread = cancel.clone();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut tick = Instant::now();
                loop {
                    let delay = match schedule {
                        Schedule::Every(interval) => {
                            let now = Instant::now();
                            tick = next_tick(tick, interval, now);
                            tick.saturating_duration_since(now)
                        }
                        Schedule::DailyAt(_) => schedule.delay_from(&Local::now()),
                    };
                    log::debug!("{} next fire in {}s", name, delay.as_secs());
                    match rx.recv_timeout(delay) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                    if cancel_thread.is_cancelled() {
                        break;
                    }
                    job(&cancel_thread);
                }
            })?;
        log::info!("{} scheduled {}", name, schedule);
        Ok(Self {
            name,
            cancel,
            wake,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cancel, wait for any in-progress run to reach a safe point, and join.
    pub fn stop(mut self) -> Result<()> {
        self.cancel.cancel();
        let _ = self.wake.send(());
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("{} task thread panicked", self.name))?;
        }
        log::info!("{} stopped", self.name);
        Ok(())
    }
}
