use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Offset subtracted from the capture instant so the first packet never maps to zero.
const EPOCH_OFFSET: Duration = Duration::from_millis(1);

/// Fixed-point time base for feedback report timestamps.
///
/// Instants are expressed as seconds since a reference epoch taken once at
/// construction ("now" minus one millisecond), scaled by 65536 and truncated
/// to 32 bits: whole seconds in the high half, the fraction in the low half.
/// This is the middle 32 bits of an NTP timestamp, as used by RTCP feedback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimeBase {
    epoch: Instant,
    epoch_since_unix: Duration,
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeBase {
    pub fn new() -> Self {
        Self::at(Instant::now())
    }

    /// Builds a time base whose epoch is one millisecond before `now`.
    pub fn at(now: Instant) -> Self {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        let (epoch, epoch_since_unix) = match now.checked_sub(EPOCH_OFFSET) {
            Some(epoch) => (epoch, since_unix.saturating_sub(EPOCH_OFFSET)),
            None => (now, since_unix),
        };
        Self {
            epoch,
            epoch_since_unix,
        }
    }

    /// The reference epoch in seconds since the unix epoch.
    pub fn epoch(&self) -> f64 {
        self.epoch_since_unix.as_secs_f64()
    }

    pub fn epoch_instant(&self) -> Instant {
        self.epoch
    }

    /// Converts `t` to the 32-bit fixed-point base. Instants before the epoch map to 0.
    pub fn to_fixed_point(&self, t: Instant) -> u32 {
        TimeBase::duration_to_fixed_point(t.saturating_duration_since(self.epoch))
    }

    pub fn duration_to_fixed_point(elapsed: Duration) -> u32 {
        let scaled = (elapsed.as_nanos() << 16) / 1_000_000_000;
        (scaled & 0xFFFF_FFFF) as u32
    }
}
