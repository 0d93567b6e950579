//! Deadlines that fold in [`ProcessSigContTracker`]: a timed wait whose
//! clock was stopped along with the rest of the process (job control
//! `SIGSTOP`/`SIGCONT`) restarts its countdown instead of reporting a
//! spurious expiry.

use crate::clock::{eventclock_time, Duration, EventClockTime};
use crate::error::RuntimeError;
use crate::sigcont::ProcessSigContTracker;

/// `since` is latched to `time` the first time this runs (so the very
/// first poll always reports "not yet expired"), then every subsequent
/// call measures elapsed time against it.
fn deadline_time_expired(
    since: &mut EventClockTime,
    period: Duration,
    remaining: &mut Duration,
    time: EventClockTime,
) -> bool {
    if since.is_latched() {
        let elapsed = time.ns.saturating_sub(since.ns);
        if elapsed >= period.as_nanos() {
            *remaining = Duration::ZERO;
            true
        } else {
            *remaining = Duration(period.as_nanos() - elapsed);
            false
        }
    } else {
        *since = time;
        *remaining = period;
        false
    }
}

/// A countdown against the event clock. `None` duration
/// means "no deadline": [`Deadline::check_expired`] then only ever
/// drives the poll/wait methods, never reporting expiry.
pub struct Deadline {
    since: EventClockTime,
    time: EventClockTime,
    remaining: Duration,
    sig_cont_tracker: ProcessSigContTracker,
    duration: Option<Duration>,
    expired: bool,
}

impl Deadline {
    pub fn create(duration: Option<Duration>) -> Self {
        Self {
            since: EventClockTime::ZERO,
            time: EventClockTime::ZERO,
            remaining: Duration::ZERO,
            sig_cont_tracker: ProcessSigContTracker::new(),
            duration,
            expired: false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Polls `poll` for immediate readiness; if not ready and the
    /// deadline has elapsed, the deadline is treated as expired unless a
    /// `SIGCONT` landed in the interim, in which case the countdown
    /// restarts instead of firing. Otherwise waits via `wait`, passing
    /// the remaining budget when a deadline is set.
    ///
    /// Returns `Ok(true)` if the underlying condition became ready,
    /// `Ok(false)` if the wait returned without it being ready (e.g. a
    /// spurious wakeup), or `Err(RuntimeError::TimedOut)` if the deadline
    /// genuinely expired.
    pub fn check_expired(
        &mut self,
        mut poll: impl FnMut() -> Result<bool, RuntimeError>,
        mut wait: impl FnMut(Option<Duration>) -> Result<bool, RuntimeError>,
    ) -> Result<bool, RuntimeError> {
        self.time = eventclock_time();

        let mut ready = poll()?;

        if let Some(duration) = self.duration {
            if deadline_time_expired(&mut self.since, duration, &mut self.remaining, self.time) {
                if self.sig_cont_tracker.check() {
                    self.since = EventClockTime::ZERO;
                    return Ok(false);
                }

                self.expired = true;
                return Err(RuntimeError::TimedOut);
            }
        }

        if !ready {
            ready = wait(self.duration.map(|_| self.remaining))?;
        }

        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn first_check_never_expires() {
        let mut deadline = Deadline::create(Some(Duration::ZERO));
        let ready = deadline
            .check_expired(|| Ok(false), |_| Ok(false))
            .unwrap();
        assert!(!ready);
        assert!(!deadline.is_expired());
    }

    #[test]
    fn second_check_with_zero_duration_expires() {
        let mut deadline = Deadline::create(Some(Duration::ZERO));
        deadline.check_expired(|| Ok(false), |_| Ok(false)).unwrap();

        let result = deadline.check_expired(|| Ok(false), |_| Ok(false));
        assert!(matches!(result, Err(RuntimeError::TimedOut)));
        assert!(deadline.is_expired());
    }

    #[test]
    fn ready_poll_short_circuits_the_wait_call() {
        let mut deadline = Deadline::create(None);
        let wait_called = Cell::new(false);

        let ready = deadline
            .check_expired(
                || Ok(true),
                |_| {
                    wait_called.set(true);
                    Ok(false)
                },
            )
            .unwrap();

        assert!(ready);
        assert!(!wait_called.get());
    }

    #[test]
    fn no_deadline_never_expires() {
        let mut deadline = Deadline::create(None);
        for _ in 0..5 {
            let ready = deadline
                .check_expired(|| Ok(false), |_| Ok(false))
                .unwrap();
            assert!(!ready);
        }
        assert!(!deadline.is_expired());
    }
}
