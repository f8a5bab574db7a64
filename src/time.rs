use std::ops::Neg;
use std::time::Duration;

/// Parses durations like `30s`, `10m` or `1h 30m`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    cyborgtime::parse_duration(s).map_err(|e| format!("Invalid duration: {e}"))
}

pub fn humanize_duration(mut duration: time::Duration) -> String {
    const SECONDS_IN_MINUTE: i64 = 60;
    const SECONDS_IN_HOUR: i64 = 3600;
    const SECONDS_IN_DAY: i64 = 86400;
    const SECONDS_IN_MONTH: i64 = 2_630_016; // Approximation (30.44 days)
    const SECONDS_IN_YEAR: i64 = 31_557_600; // Approximation (365.25 days)

    if duration.is_negative() {
        duration = duration.neg();
    }

    let mut remaining_seconds = duration.whole_seconds();

    let years = remaining_seconds / SECONDS_IN_YEAR;
    remaining_seconds %= SECONDS_IN_YEAR;
    let months = remaining_seconds / SECONDS_IN_MONTH;
    remaining_seconds %= SECONDS_IN_MONTH;
    let days = remaining_seconds / SECONDS_IN_DAY;
    remaining_seconds %= SECONDS_IN_DAY;
    let hours = remaining_seconds / SECONDS_IN_HOUR;
    remaining_seconds %= SECONDS_IN_HOUR;
    let minutes = remaining_seconds / SECONDS_IN_MINUTE;
    remaining_seconds %= SECONDS_IN_MINUTE;
    let seconds = remaining_seconds;

    let mut components = Vec::new();
    if years > 0 {
        components.push(format!(
            "{} year{}",
            years,
            if years > 1 { "s" } else { "" }
        ));
    }
    if months > 0 {
        components.push(format!(
            "{} month{}",
            months,
            if months > 1 { "s" } else { "" }
        ));
    }
    if days > 0 {
        components.push(format!("{} day{}", days, if days > 1 { "s" } else { "" }));
    }
    if hours > 0 {
        components.push(format!(
            "{} hour{}",
            hours,
            if hours > 1 { "s" } else { "" }
        ));
    }
    if minutes > 0 {
        components.push(format!(
            "{} minute{}",
            minutes,
            if minutes > 1 { "s" } else { "" }
        ));
    }
    if seconds > 0 || components.is_empty() {
        components.push(format!(
            "{} second{}",
            seconds,
            if seconds == 1 { "" } else { "s" }
        ));
    }

    components.join(", ")
}
