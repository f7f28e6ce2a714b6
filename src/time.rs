use core::ops::{Add, Sub};
use core::time::Duration;

/// Time elapsed since an arbitrary epoch, in nanoseconds. 64-bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SystemTime(pub u64);

impl SystemTime {
    pub const ZERO: SystemTime = SystemTime(0);

    pub fn elapsed_since(self, start: SystemTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(start.0))
    }
}

impl From<Duration> for SystemTime {
    fn from(duration: Duration) -> Self {
        SystemTime(duration.as_nanos() as u64)
    }
}

impl Add<Duration> for SystemTime {
    type Output = SystemTime;

    fn add(self, rhs: Duration) -> SystemTime {
        SystemTime(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

impl Sub<SystemTime> for SystemTime {
    type Output = Duration;

    fn sub(self, rhs: SystemTime) -> Duration {
        self.elapsed_since(rhs)
    }
}

/// Monotonic clock supplied by the platform.
///
/// The core never reaches for an OS timer on its own: state-machine waits,
/// mailbox polling and the redundancy probe all go through this trait, so a
/// bare-metal target or a unit test can drive time explicitly.
pub trait Clock {
    fn since_epoch(&mut self) -> SystemTime;

    fn since_start(&mut self) -> Duration;

    fn sleep(&mut self, duration: Duration);

    fn elapsed(&mut self, start: SystemTime) -> Duration {
        self.since_epoch().elapsed_since(start)
    }
}
