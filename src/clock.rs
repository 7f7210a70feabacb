//! Local wall-clock snapshots for clock sync and output-file naming.
//!
//! Dataloggers are always synced to standard time, so when the local zone is
//! currently observing DST the snapshot rolls the hour (and on underflow the
//! day) back by one. This relies on the system clock being correct; run
//! ntpd or equivalent on the harvesting host.

use std::mem;
use std::ptr;

fn local_tm() -> libc::tm {
    let t = unsafe { libc::time(ptr::null_mut()) };
    let mut tm: libc::tm = unsafe { mem::zeroed() };
    unsafe {
        libc::localtime_r(&t, &mut tm);
    }
    tm
}

/// The current local time expressed in standard (non-DST) time.
///
/// `day` is the zero-based day of the year, matching what `localtime` hands
/// out; the logger counts days from one, so callers add one when talking to
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardTime {
    pub day: i64,
    pub hour: i64,
    pub minute: i64,
    pub second: i64,
}

impl StandardTime {
    pub fn now() -> Self {
        let tm = local_tm();
        Self::from_fields(
            tm.tm_yday as i64,
            tm.tm_hour as i64,
            tm.tm_min as i64,
            tm.tm_sec as i64,
            tm.tm_isdst > 0,
        )
    }

    fn from_fields(day: i64, hour: i64, minute: i64, second: i64, dst: bool) -> Self {
        let (day, hour) = if dst {
            if hour == 0 {
                (day - 1, 23)
            } else {
                (day, hour - 1)
            }
        } else {
            (day, hour)
        };
        Self {
            day,
            hour,
            minute,
            second,
        }
    }

    /// Seconds elapsed since the start of the year.
    pub fn seconds_of_year(&self) -> i64 {
        self.day * 86400 + self.hour * 3600 + self.minute * 60 + self.second
    }
}

/// `YYYYMMDD` stamp used in default output file names.
pub fn date_stamp() -> String {
    let tm = local_tm();
    format!(
        "{:04}{:02}{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday
    )
}

/// `HH:MM:SS` stamp for the banner and trailer lines.
pub fn time_stamp() -> String {
    let tm = local_tm();
    format!("{:02}:{:02}:{:02}", tm.tm_hour, tm.tm_min, tm.tm_sec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_of_year_arithmetic() {
        let t = StandardTime {
            day: 2,
            hour: 3,
            minute: 4,
            second: 5,
        };
        assert_eq!(t.seconds_of_year(), 2 * 86400 + 3 * 3600 + 4 * 60 + 5);
    }

    #[test]
    fn dst_rolls_the_hour_back() {
        let t = StandardTime::from_fields(100, 14, 30, 0, true);
        assert_eq!(t.day, 100);
        assert_eq!(t.hour, 13);
    }

    #[test]
    fn dst_hour_underflow_rolls_the_day_back() {
        let t = StandardTime::from_fields(100, 0, 10, 0, true);
        assert_eq!(t.day, 99);
        assert_eq!(t.hour, 23);
    }

    #[test]
    fn standard_time_is_untouched() {
        let t = StandardTime::from_fields(10, 0, 0, 0, false);
        assert_eq!((t.day, t.hour), (10, 0));
    }

    #[test]
    fn time_stamp_shape() {
        let s = time_stamp();
        let b = s.as_bytes();
        assert_eq!(b.len(), 8);
        assert_eq!(b[2], b':');
        assert_eq!(b[5], b':');
        for i in [0, 1, 3, 4, 6, 7] {
            assert!(b[i].is_ascii_digit());
        }
    }
}
