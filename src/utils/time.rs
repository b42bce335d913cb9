/// Time utilities: UTC day keys and bar alignment
use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};

/// UTC day key used for daily tick files: YYYY-MM-DD
pub fn day_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

pub fn parse_day_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()
}

/// Aligned bar start for a timeframe: floor(ts / tf) * tf.
/// A tick exactly at bar_start + tf belongs to the next bar.
pub fn bar_start(ts_secs: i64, timeframe_secs: u32) -> i64 {
    let tf = timeframe_secs as i64;
    ts_secs.div_euclid(tf) * tf
}

/// Parse "HH:MM" or "HH:MM:SS" wall-clock times from config
pub fn parse_wall_clock(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// Parse a weekday name from config ("Wed", "Wednesday", case-insensitive)
pub fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.to_ascii_lowercase().as_str() {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}
