use chrono::{Duration, NaiveDate};

pub const MAX_WINDOW_DAYS: i64 = 90;

/// Splits [from, to] into contiguous inclusive windows of at most
/// `max_days` days, processed strictly in order by the callers.
pub fn date_windows(from: NaiveDate, to: NaiveDate, max_days: i64) -> Vec<(NaiveDate, NaiveDate)> {
    let mut windows = Vec::new();
    let mut cursor = from;
    while cursor <= to {
        let window_end = (cursor + Duration::days(max_days - 1)).min(to);
        windows.push((cursor, window_end));
        cursor = window_end + Duration::days(1);
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn windows_are_contiguous_and_bounded() {
        let windows = date_windows(day(2023, 1, 1), day(2023, 12, 31), MAX_WINDOW_DAYS);
        assert_eq!(windows[0].0, day(2023, 1, 1));
        assert_eq!(windows.last().expect("non-empty").1, day(2023, 12, 31));
        for window in &windows {
            let span = (window.1 - window.0).num_days() + 1;
            assert!(span <= MAX_WINDOW_DAYS);
        }
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1 + Duration::days(1), pair[1].0);
        }
    }

    #[test]
    fn single_day_range_yields_one_window() {
        let windows = date_windows(day(2024, 6, 1), day(2024, 6, 1), MAX_WINDOW_DAYS);
        assert_eq!(windows, vec![(day(2024, 6, 1), day(2024, 6, 1))]);
    }

    #[test]
    fn empty_range_yields_nothing() {
        assert!(date_windows(day(2024, 6, 2), day(2024, 6, 1), MAX_WINDOW_DAYS).is_empty());
    }
}
