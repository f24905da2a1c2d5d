use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

/// Wall-clock source, abstracted so counter windows and cooldown deadlines
/// can be tested against a controlled clock.
pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;

    /// Offset applied when computing day and month boundaries. Minute
    /// boundaries are offset-independent.
    fn local_offset(&self) -> UtcOffset;
}

/// System clock using the host-local zone for calendar boundaries.
///
/// The offset is captured once at construction; the process does not chase
/// DST transitions mid-run.
#[derive(Debug)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }

    fn local_offset(&self) -> UtcOffset {
        self.offset
    }
}

/// Counter accumulation window. Minute boundaries fall on :00 of the current
/// minute; day and month boundaries fall on local-time midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Minute,
    Day,
    Month,
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Minute, Window::Day, Window::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Day => "day",
            Window::Month => "month",
        }
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest legal boundary for `window` at or before `now_epoch_seconds`.
pub fn window_start(window: Window, now_epoch_seconds: u64, offset: UtcOffset) -> u64 {
    match window {
        Window::Minute => now_epoch_seconds - now_epoch_seconds % 60,
        Window::Day => calendar_start(now_epoch_seconds, offset, false),
        Window::Month => calendar_start(now_epoch_seconds, offset, true),
    }
}

fn calendar_start(now_epoch_seconds: u64, offset: UtcOffset, first_of_month: bool) -> u64 {
    let now = i64::try_from(now_epoch_seconds).unwrap_or(i64::MAX);
    let Ok(instant) = OffsetDateTime::from_unix_timestamp(now) else {
        return 0;
    };
    let local = instant.to_offset(offset);
    let mut date = local.date();
    if first_of_month {
        date = date.replace_day(1).unwrap_or(date);
    }
    let boundary = date.midnight().assume_offset(offset).unix_timestamp();
    u64::try_from(boundary).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-15 14:27:45 UTC
    const NOW: u64 = 1_710_512_865;

    #[test]
    fn minute_boundary_is_start_of_current_minute() {
        assert_eq!(window_start(Window::Minute, NOW, UtcOffset::UTC), NOW - 45);
        assert_eq!(
            window_start(Window::Minute, NOW - 45, UtcOffset::UTC),
            NOW - 45
        );
    }

    #[test]
    fn day_boundary_is_local_midnight() {
        // 2024-03-15 00:00:00 UTC
        assert_eq!(
            window_start(Window::Day, NOW, UtcOffset::UTC),
            1_710_460_800
        );

        // At UTC+05:30 the same instant is still 2024-03-15 local; midnight
        // local is 2024-03-14 18:30 UTC.
        let ist = UtcOffset::from_hms(5, 30, 0).unwrap();
        assert_eq!(window_start(Window::Day, NOW, ist), 1_710_441_000);
    }

    #[test]
    fn month_boundary_is_first_local_midnight() {
        // 2024-03-01 00:00:00 UTC
        assert_eq!(
            window_start(Window::Month, NOW, UtcOffset::UTC),
            1_709_251_200
        );
    }

    #[test]
    fn boundary_is_idempotent_at_the_boundary() {
        for window in Window::ALL {
            let start = window_start(window, NOW, UtcOffset::UTC);
            assert_eq!(window_start(window, start, UtcOffset::UTC), start);
        }
    }

    #[test]
    fn negative_offset_day_rolls_back_across_utc_midnight() {
        // 2024-03-15 01:30:00 UTC is still 2024-03-14 at UTC-08:00.
        let now = 1_710_466_200;
        let pst = UtcOffset::from_hms(-8, 0, 0).unwrap();
        // 2024-03-14 00:00:00 -08:00 == 2024-03-14 08:00:00 UTC
        assert_eq!(window_start(Window::Day, now, pst), 1_710_403_200);
    }
}
