//! Interval timer backed by a timerfd.
//!
//! Each reactor owns one timer, registered in its epoll set, so timer
//! work (reconnect deadlines, heartbeats) arrives through the same
//! `poll()` path as socket readiness.

use {
    nix::sys::{
        time::TimeSpec,
        timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags},
    },
    std::{
        io,
        os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
        time::Duration,
    },
};

/// Monotonic interval timer with a pollable descriptor.
#[derive(Debug)]
pub(crate) struct IntervalTimer {
    timer: TimerFd,
}

impl IntervalTimer {
    pub fn new() -> io::Result<Self> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        Ok(Self { timer })
    }

    /// (Re)arm with a fixed interval; the first expiration lands one
    /// interval from now.
    pub fn arm(&mut self, interval: Duration) -> io::Result<()> {
        self.timer.set(
            Expiration::Interval(TimeSpec::from_duration(interval)),
            TimerSetTimeFlags::empty(),
        )?;
        Ok(())
    }

    pub fn disarm(&mut self) -> io::Result<()> {
        self.timer.unset()?;
        Ok(())
    }

    /// Consume all pending expirations. Returns whether at least one had
    /// fired. Must be called on every readiness event, or a
    /// level-triggered poller would spin.
    pub fn drain(&mut self) -> io::Result<bool> {
        match self.timer.wait() {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::EAGAIN) => Ok(false),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.timer.as_fd()
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.timer.as_fd().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::thread::sleep};

    #[test]
    fn test_drain_reports_expiration() {
        let mut timer = IntervalTimer::new().unwrap();
        assert!(!timer.drain().unwrap());

        timer.arm(Duration::from_millis(5)).unwrap();
        sleep(Duration::from_millis(20));
        assert!(timer.drain().unwrap());
        // All accumulated expirations are consumed by one drain.
        assert!(!timer.drain().unwrap());
    }

    #[test]
    fn test_disarmed_timer_stays_quiet() {
        let mut timer = IntervalTimer::new().unwrap();
        timer.arm(Duration::from_millis(5)).unwrap();
        timer.disarm().unwrap();
        sleep(Duration::from_millis(20));
        assert!(!timer.drain().unwrap());
    }
}
