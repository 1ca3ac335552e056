// Weekly schedule evaluation.
//
// Schedules carry local wall-clock "HH:MM" boundaries and a set of day
// names; a schedule holds the gate open while the current weekday is in
// its day set and the current time lies in [start, end).

use chrono::{DateTime, Datelike, Local, NaiveTime, Weekday};

use crate::types::Schedule;

/// Check whether any enabled schedule covers the given instant.
///
/// Disabled schedules never match. Windows with unparseable boundaries are
/// skipped. Overnight windows (`end < start`) are accepted in the config
/// but never match; splitting them across midnight is the caller's job.
pub fn is_active(schedules: &[Schedule], now: DateTime<Local>) -> bool {
    let weekday = now.weekday();
    let now_time = now.time();

    schedules
        .iter()
        .filter(|s| s.enabled)
        .filter(|s| day_matches(&s.days, weekday))
        .any(|s| in_window(&s.start_time, &s.end_time, now_time))
}

fn day_matches(days: &[String], weekday: Weekday) -> bool {
    let name = day_name(weekday);
    days.iter().any(|d| d.eq_ignore_ascii_case(name))
}

fn in_window(start: &str, end: &str, now: NaiveTime) -> bool {
    let (Some(start), Some(end)) = (parse_time(start), parse_time(end)) else {
        return false;
    };
    start <= now && now < end
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").ok()
}

fn day_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn schedule(days: &[&str], start: &str, end: &str, enabled: bool) -> Schedule {
        Schedule {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            days: days.iter().map(|d| d.to_string()).collect(),
            start_time: start.to_string(),
            end_time: end.to_string(),
            enabled,
        }
    }

    // Monday, Jan 19, 2026.
    fn monday_at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 1, 19, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_parse_time() {
        assert!(parse_time("10:00").is_some());
        assert!(parse_time("23:59").is_some());
        assert!(parse_time("00:00").is_some());
        assert!(parse_time("25:00").is_none());
        assert!(parse_time("invalid").is_none());
    }

    #[test]
    fn test_active_inside_window() {
        let schedules = vec![schedule(&["Mon"], "09:00", "17:00", true)];
        assert!(is_active(&schedules, monday_at(9, 0)));
        assert!(is_active(&schedules, monday_at(12, 30)));
        assert!(is_active(&schedules, monday_at(16, 59)));
    }

    #[test]
    fn test_boundaries_are_half_open() {
        let schedules = vec![schedule(&["Mon"], "09:00", "17:00", true)];
        assert!(is_active(&schedules, monday_at(9, 0)));
        assert!(!is_active(&schedules, monday_at(17, 0)));
        assert!(!is_active(&schedules, monday_at(8, 59)));
    }

    #[test]
    fn test_day_must_match() {
        let schedules = vec![schedule(&["Tue", "Wed"], "00:00", "23:59", true)];
        assert!(!is_active(&schedules, monday_at(12, 0)));

        let schedules = vec![schedule(&["mon"], "09:00", "17:00", true)];
        assert!(is_active(&schedules, monday_at(12, 0)), "day names are case-insensitive");
    }

    #[test]
    fn test_disabled_schedules_ignored() {
        let schedules = vec![schedule(&["Mon"], "00:00", "23:59", false)];
        assert!(!is_active(&schedules, monday_at(12, 0)));
    }

    #[test]
    fn test_any_of_several_schedules() {
        let schedules = vec![
            schedule(&["Mon"], "06:00", "08:00", true),
            schedule(&["Mon"], "15:00", "19:00", true),
        ];
        assert!(is_active(&schedules, monday_at(7, 0)));
        assert!(!is_active(&schedules, monday_at(10, 0)));
        assert!(is_active(&schedules, monday_at(16, 0)));
    }

    #[test]
    fn test_unparseable_window_never_matches() {
        let schedules = vec![schedule(&["Mon"], "9am", "5pm", true)];
        assert!(!is_active(&schedules, monday_at(12, 0)));
    }

    #[test]
    fn test_overnight_window_does_not_match() {
        // end < start: tolerated in config, never active.
        let schedules = vec![schedule(&["Mon"], "22:00", "06:00", true)];
        assert!(!is_active(&schedules, monday_at(23, 0)));
        assert!(!is_active(&schedules, monday_at(5, 0)));
    }

    #[test]
    fn test_empty_schedule_set() {
        assert!(!is_active(&[], monday_at(12, 0)));
    }
}
