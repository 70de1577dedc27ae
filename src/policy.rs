//! # Access-Time Policy
//!
//! Assets may carry a declarative weekly schedule constraining when
//! sessions to them are permitted. The policy is a pure predicate over
//! the schedule and a point in time; the guacd connector evaluates it
//! before opening a tunnel.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Per-asset schedule constraining when connections are permitted.
///
/// `ranges` lists weekly windows; `allow` selects whether the windows
/// are an allow-list (`true`) or a deny-list (`false`). A schedule with
/// no windows at all permits everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessAuth {
    /// No access before this instant, when set.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// No access after this instant, when set.
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ranges: Vec<AccessRange>,
    #[serde(default = "default_allow")]
    pub allow: bool,
}

/// One weekday's list of `"HH:MM~HH:MM"` windows.
///
/// `week` is the schedule's 0-based day index: a range applies on the
/// day where `(week + 1) mod 7` equals the days-from-Sunday weekday
/// number, so 0 = Monday through 6 = Sunday.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessRange {
    pub week: u32,
    #[serde(default)]
    pub times: Vec<String>,
}

fn default_allow() -> bool {
    true
}

/// Returns whether a connection at `now` is permitted by `auth`.
///
/// Window bounds are inclusive on both ends and compared as zero-padded
/// `HH:MM` strings.
pub fn allowed(now: DateTime<Utc>, auth: &AccessAuth) -> bool {
    if let Some(start) = auth.start {
        if now < start {
            return false;
        }
    }
    if let Some(end) = auth.end {
        if now > end {
            return false;
        }
    }

    let weekday = now.weekday().num_days_from_sunday();
    let hhmm = format!("{:02}:{:02}", now.hour(), now.minute());

    let mut matched = false;
    let mut has_any_window = false;
    for range in &auth.ranges {
        if !range.times.is_empty() {
            has_any_window = true;
        }
        if (range.week + 1) % 7 != weekday {
            continue;
        }
        for window in &range.times {
            let Some((from, to)) = window.split_once('~') else {
                continue;
            };
            if hhmm.as_str() >= from && hhmm.as_str() <= to {
                matched = true;
            }
        }
    }

    // No windows anywhere means no schedule was specified.
    !has_any_window || matched == auth.allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    /// Mon–Fri 09:00–18:00.
    fn business_hours(allow: bool) -> AccessAuth {
        AccessAuth {
            ranges: (0..5)
                .map(|week| AccessRange {
                    week,
                    times: vec!["09:00~18:00".to_string()],
                })
                .collect(),
            allow,
            ..Default::default()
        }
    }

    #[test]
    fn empty_schedule_always_allows() {
        let now = at(2026, 3, 7, 10, 0);
        for allow in [true, false] {
            let auth = AccessAuth {
                allow,
                ..Default::default()
            };
            assert!(allowed(now, &auth));
        }
    }

    #[test]
    fn ranges_without_windows_always_allow() {
        let now = at(2026, 3, 7, 10, 0);
        for allow in [true, false] {
            let auth = AccessAuth {
                ranges: vec![AccessRange {
                    week: 5,
                    times: vec![],
                }],
                allow,
                ..Default::default()
            };
            assert!(allowed(now, &auth));
        }
    }

    #[test]
    fn weekday_window_allows_monday_morning() {
        // 2026-03-02 is a Monday.
        assert!(allowed(at(2026, 3, 2, 10, 0), &business_hours(true)));
    }

    #[test]
    fn saturday_is_outside_business_hours() {
        // 2026-03-07 is a Saturday.
        assert!(!allowed(at(2026, 3, 7, 10, 0), &business_hours(true)));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let auth = business_hours(true);
        assert!(allowed(at(2026, 3, 2, 9, 0), &auth));
        assert!(allowed(at(2026, 3, 2, 18, 0), &auth));
        assert!(!allowed(at(2026, 3, 2, 8, 59), &auth));
        assert!(!allowed(at(2026, 3, 2, 18, 1), &auth));
    }

    #[test]
    fn deny_list_inverts_the_windows() {
        let auth = business_hours(false);
        // Inside a window of a deny-list: rejected.
        assert!(!allowed(at(2026, 3, 2, 10, 0), &auth));
        // Outside every window: permitted.
        assert!(allowed(at(2026, 3, 2, 20, 0), &auth));
        assert!(allowed(at(2026, 3, 7, 10, 0), &auth));
    }

    #[test]
    fn start_and_end_bounds_cut_off_access() {
        let auth = AccessAuth {
            start: Some(at(2026, 3, 1, 0, 0)),
            end: Some(at(2026, 3, 31, 0, 0)),
            ..Default::default()
        };
        assert!(!allowed(at(2026, 2, 28, 12, 0), &auth));
        assert!(allowed(at(2026, 3, 15, 12, 0), &auth));
        assert!(!allowed(at(2026, 4, 1, 12, 0), &auth));
    }
}
