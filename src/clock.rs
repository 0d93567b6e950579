//! Monotonic, boot and wall clocks, plus the "event clock" — a
//! monotonic clock rebased so it can never read zero, so zero is free
//! to use as a sentinel for "not yet latched" in
//! [`crate::deadline::Deadline`].

use std::io;
use std::sync::OnceLock;
use std::time::Duration as StdDuration;

use crate::error::RuntimeError;

/// Nanosecond duration. A plain newtype rather than `std::time::Duration`
/// so the deadline arithmetic in [`crate::deadline`] can do wraparound
/// checked subtraction over a bare `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(pub u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub fn from_secs(secs: u64) -> Self {
        Duration(secs.saturating_mul(1_000_000_000))
    }

    pub fn from_millis(ms: u64) -> Self {
        Duration(ms.saturating_mul(1_000_000))
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }
}

impl From<StdDuration> for Duration {
    fn from(d: StdDuration) -> Self {
        Duration(d.as_nanos() as u64)
    }
}

impl From<Duration> for StdDuration {
    fn from(d: Duration) -> Self {
        StdDuration::from_nanos(d.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MonotonicTime {
    pub ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct EventClockTime {
    pub ns: u64,
}

impl EventClockTime {
    pub const ZERO: EventClockTime = EventClockTime { ns: 0 };

    pub fn is_latched(self) -> bool {
        self.ns != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BootClockTime {
    pub ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct WallClockTime {
    pub ns: u64,
}

fn timespec_to_ns(ts: libc::timespec) -> u64 {
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn clock_gettime(clock: libc::clockid_t) -> io::Result<libc::timespec> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(clock, &mut ts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ts)
}

/// `CLOCK_MONOTONIC`. Aborts the process on failure — a monotonic clock
/// is assumed always available on a supported platform, so a failure
/// here indicates the platform itself is broken, not a recoverable
/// condition.
pub fn monotonic_time() -> MonotonicTime {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC)
        .unwrap_or_else(|e| panic!("clock_gettime(CLOCK_MONOTONIC) failed: {e}"));
    MonotonicTime {
        ns: timespec_to_ns(ts),
    }
}

pub fn wallclock_time() -> WallClockTime {
    let ts = clock_gettime(libc::CLOCK_REALTIME)
        .unwrap_or_else(|e| panic!("clock_gettime(CLOCK_REALTIME) failed: {e}"));
    WallClockTime {
        ns: timespec_to_ns(ts),
    }
}

/// Parses the first field of `/proc/uptime` (seconds, with up to
/// hundredths precision) without going through floating point, via
/// digit-by-digit accumulation so a pathological uptime value overflows
/// predictably rather than losing precision silently.
fn parse_proc_uptime(contents: &str) -> Result<Duration, RuntimeError> {
    let field = contents
        .split_whitespace()
        .next()
        .ok_or(RuntimeError::InvalidUptime)?;

    let mut uptime_ns: u64 = 0;
    let mut frac_digits: u32 = 0;
    let mut seen_dot = false;

    for ch in field.chars() {
        if ch == '.' {
            if seen_dot {
                return Err(RuntimeError::InvalidUptime);
            }
            seen_dot = true;
            continue;
        }

        let digit = ch.to_digit(10).ok_or(RuntimeError::InvalidUptime)?;

        uptime_ns = uptime_ns
            .checked_mul(10)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or(RuntimeError::InvalidUptime)?;

        if seen_dot {
            frac_digits += 1;
        }
    }

    let scale = 10u64.checked_pow(9u32.saturating_sub(frac_digits)).unwrap_or(1);
    Ok(Duration(uptime_ns.saturating_mul(scale)))
}

pub fn proc_uptime(path: &str) -> Result<Duration, RuntimeError> {
    let contents = std::fs::read_to_string(path)?;
    parse_proc_uptime(&contents)
}

/// `CLOCK_BOOTTIME`, falling back to `/proc/uptime` on platforms or
/// kernels where that clock id is unknown.
pub fn bootclock_time() -> BootClockTime {
    match clock_gettime(7 /* CLOCK_BOOTTIME */) {
        Ok(ts) => BootClockTime {
            ns: timespec_to_ns(ts),
        },
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            let uptime = proc_uptime("/proc/uptime")
                .unwrap_or_else(|e| panic!("unable to read /proc/uptime: {e}"));
            BootClockTime { ns: uptime.0 }
        }
        Err(e) => panic!("clock_gettime(CLOCK_BOOTTIME) failed: {e}"),
    }
}

static EVENT_CLOCK_BASE: OnceLock<u64> = OnceLock::new();

/// A monotonic clock rebased at first use so that it never reads zero:
/// the base is the first observed monotonic reading minus one
/// nanosecond, so the very first call already returns at least `1`.
pub fn eventclock_time() -> EventClockTime {
    let base = *EVENT_CLOCK_BASE.get_or_init(|| monotonic_time().ns.wrapping_sub(1));
    let ns = monotonic_time().ns.wrapping_sub(base);
    debug_assert_ne!(ns, 0, "event clock must never read zero");
    EventClockTime { ns }
}

/// Sleeps for `period`, restarting across `EINTR`.
pub fn monotonic_sleep(period: Duration) {
    let target = monotonic_time().ns.saturating_add(period.0);
    let mut sleep_ts = libc::timespec {
        tv_sec: (target / 1_000_000_000) as libc::time_t,
        tv_nsec: (target % 1_000_000_000) as i64,
    };

    loop {
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &sleep_ts,
                std::ptr::null_mut(),
            )
        };
        match rc {
            0 => break,
            libc::EINTR => continue,
            other => panic!("clock_nanosleep failed: {}", io::Error::from_raw_os_error(other)),
        }
    }

    let _ = &mut sleep_ts;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_clock_never_reads_zero() {
        for _ in 0..1000 {
            assert_ne!(eventclock_time().ns, 0);
        }
    }

    #[test]
    fn event_clock_is_monotonic() {
        let a = eventclock_time();
        let b = eventclock_time();
        assert!(b.ns >= a.ns);
    }

    #[test]
    fn parses_proc_uptime_with_fraction() {
        let d = parse_proc_uptime("12345.67 98765.43\n").unwrap();
        assert_eq!(d.0, 12_345_670_000_000);
    }

    #[test]
    fn parses_proc_uptime_without_fraction() {
        let d = parse_proc_uptime("42\n").unwrap();
        assert_eq!(d.0, 42_000_000_000);
    }

    #[test]
    fn rejects_malformed_uptime_with_erange() {
        let err = parse_proc_uptime("not-a-number").unwrap_err();
        assert_eq!(err.errno(), libc::ERANGE);
    }

    #[test]
    fn rejects_overflowing_uptime_with_erange() {
        let err = parse_proc_uptime("99999999999999999999999999999.0").unwrap_err();
        assert_eq!(err.errno(), libc::ERANGE);
    }
}
