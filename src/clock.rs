use std::time::Duration;

/// Current monotonic timestamp in microseconds.
pub fn now() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    let r = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(r, 0);

    ts.tv_sec as i64 * 1_000_000 + ts.tv_nsec as i64 / 1_000
}

/// An absolute expiry point on the monotonic clock, in microseconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(i64);

impl Deadline {
    /// A deadline that never expires.
    pub const NEVER: Deadline = Deadline(i64::MAX);

    pub fn at(micros: i64) -> Deadline {
        Deadline(micros)
    }

    /// A deadline `dur` from now.
    pub fn after(dur: Duration) -> Deadline {
        let us = dur.as_micros().min(i64::MAX as u128) as i64;
        Deadline(now().saturating_add(us))
    }

    pub fn is_never(&self) -> bool {
        self.0 == i64::MAX
    }

    pub fn micros(&self) -> i64 {
        self.0
    }

    pub fn expired(&self, now: i64) -> bool {
        self.0 < now
    }

    /// Milliseconds until expiry from `now`, rounded up so an epoll wait does
    /// not wake just short of the deadline. Zero once expired.
    pub fn until_ms(&self, now: i64) -> u64 {
        if self.0 <= now {
            0
        } else {
            ((self.0 - now) as u64).div_ceil(1_000)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn monotonic() {
        let a = now();
        thread::sleep(Duration::from_millis(2));
        let b = now();
        assert!(b > a);
    }

    #[test]
    fn never_does_not_expire() {
        assert!(!Deadline::NEVER.expired(now()));
        assert!(Deadline::NEVER.is_never());
    }

    #[test]
    fn until_ms_rounds_up() {
        let d = Deadline::at(10_500);
        assert_eq!(d.until_ms(10_000), 1);
        assert_eq!(d.until_ms(10_500), 0);
        assert_eq!(d.until_ms(11_000), 0);
    }

    #[test]
    fn past_deadline_expired() {
        let t = now();
        assert!(Deadline::at(t - 1).expired(t));
        assert!(!Deadline::at(t).expired(t));
    }
}
